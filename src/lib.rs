//! # DCC Protocol Decoder
//!
//! A Rust library for decoding DCC (Digital Command Control), the digital
//! command-and-control bus used to operate model railways.
//!
//! DCC encodes bits purely by the edge timing of a self-clocked square
//! wave. This library takes a stream of edge timestamps from a logic
//! capture and turns it into annotated protocol packets:
//!
//! - Timing classification of half-period pairs under selectable profiles
//!   (NMRA S-9.1, RCN-210, compliance-testing and experimental bounds)
//! - Preamble detection, byte/packet framing and resynchronization,
//!   including the RailCom cutout interval
//! - Packet decoding for the multi-function, accessory, service mode and
//!   DCC-A families, with checksum and CRC validation
//! - Search filtering over decoded addresses, CVs, bytes and command text
//!
//! ## Features
//!
//! - `serde`: Enable serialization/deserialization support
//!
//! ## Example
//!
//! ```
//! use dcc_decoder::{Annotation, Decoder, DecoderConfig, TimingMode};
//!
//! let config = DecoderConfig::new(TimingMode::NmraDecoding);
//! let mut decoder = Decoder::new(config, 1_000_000.0)?;
//!
//! // edge timestamps in sample counts, e.g. from a logic analyzer capture
//! let edges: Vec<u64> = vec![100, 158, 216, 274];
//! let mut annotations: Vec<Annotation> = Vec::new();
//! decoder.run(edges.into_iter(), &mut annotations);
//! # Ok::<(), dcc_decoder::DecodeError>(())
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod multifunction;
pub mod packet;
pub mod search;
pub mod sync;
pub mod timing;

pub use config::{DecoderConfig, SearchCriteria, SearchValue, SpeedSteps};
pub use core::{Annotation, AnnotationCategory, AnnotationSink, ByteRecord, EdgeSource, Packet};
pub use error::{DecodeError, Result};
pub use packet::{DecodeOutcome, PacketDecoder, PacketFamily};
pub use sync::{Decoder, SyncState};
pub use timing::{BitClassifier, BitSpan, TimingMode, TimingProfile};

/// Protocol constants from the DCC standards
pub mod spec {
    /// Shortest RailCom cutout in microseconds (one edge is lost to
    /// rectification, so the window covers the remainder)
    pub const RAILCOM_CUTOUT_MIN: f64 = 454.0;

    /// Longest RailCom cutout in microseconds, before widening by a
    /// possibly merged 1 bit
    pub const RAILCOM_CUTOUT_MAX: f64 = 488.0;

    /// Largest accepted sum of both halves of a stretched 0 bit, in
    /// microseconds
    pub const STRETCHED_ZERO_TOTAL_MAX: f64 = 12000.0;

    /// Minimum preamble length in bits for the decoding modes
    pub const MIN_PREAMBLE_BITS: u32 = 10;

    /// Pulses at or below this width in microseconds count as electrical
    /// interference for the short-pulse filter
    pub const INTERFERING_PULSE_MAX_US: f64 = 4.0;

    /// Lowest usable sample rate in Hz
    pub const SAMPLE_RATE_MIN: f64 = 25_000.0;

    /// Lowest sample rate in Hz accepted for compliance testing
    pub const COMPLIANCE_SAMPLE_RATE_MIN: f64 = 2_000_000.0;

    /// Window in samples covered by one configuration-problem annotation
    pub const ERROR_LOOKAHEAD_SAMPLES: u64 = 99;
}
