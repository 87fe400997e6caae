//! Core types for the DCC decoding pipeline

/// Source of edge timestamps for the decoder.
///
/// Implementations hand out the sample index of the next rising or falling
/// edge on the single logical channel, in strictly increasing order. The
/// decoder pulls one edge at a time and stops when the source is exhausted.
pub trait EdgeSource {
    /// Sample index of the next edge, or `None` when the capture ends
    fn next_edge(&mut self) -> Option<u64>;
}

impl<I: Iterator<Item = u64>> EdgeSource for I {
    fn next_edge(&mut self) -> Option<u64> {
        self.next()
    }
}

/// Annotation categories, one per output row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AnnotationCategory {
    /// Decoded bit values and in-band events (cutout)
    Bits,
    /// Half bits, unknown timings, ignored bits
    BitsOther,
    /// Frame structure: preamble, start/stop bits, checksum OK
    Frame,
    /// Frame anomalies: resynchronization, checksum mismatch detail
    FrameOther,
    /// Decoded field values
    Data,
    /// Accessory decoder address
    DataAccessory,
    /// Multi-function decoder address
    DataDecoder,
    /// Configuration variable number
    DataCv,
    /// Command names and key captions
    Command,
    /// Non-error notices
    Info,
    /// Protocol violations and configuration problems
    Error,
    /// Timing accepted only by the experimental profile (per half bit)
    Variance1,
    /// Timing accepted only by the experimental profile (per bit)
    Variance2,
    /// Search hit: accessory address
    SearchAccessory,
    /// Search hit: decoder address
    SearchDecoder,
    /// Search hit: CV number
    SearchCv,
    /// Search hit: raw byte value
    SearchByte,
    /// Search hit: command text
    SearchCommand,
}

impl std::fmt::Display for AnnotationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AnnotationCategory::Bits => "Bits",
            AnnotationCategory::BitsOther => "BitsOther",
            AnnotationCategory::Frame => "Frame",
            AnnotationCategory::FrameOther => "FrameOther",
            AnnotationCategory::Data => "Data",
            AnnotationCategory::DataAccessory => "DataAccessory",
            AnnotationCategory::DataDecoder => "DataDecoder",
            AnnotationCategory::DataCv => "DataCv",
            AnnotationCategory::Command => "Command",
            AnnotationCategory::Info => "Info",
            AnnotationCategory::Error => "Error",
            AnnotationCategory::Variance1 => "Variance1",
            AnnotationCategory::Variance2 => "Variance2",
            AnnotationCategory::SearchAccessory => "SearchAccessory",
            AnnotationCategory::SearchDecoder => "SearchDecoder",
            AnnotationCategory::SearchCv => "SearchCv",
            AnnotationCategory::SearchByte => "SearchByte",
            AnnotationCategory::SearchCommand => "SearchCommand",
        };
        write!(f, "{}", name)
    }
}

/// One annotation on the output timeline.
///
/// `labels` is ordered from most to least verbose; renderers pick the
/// longest variant that fits. Annotations are write-once: the decoder emits
/// them to the sink and never reads them back.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Annotation {
    /// First sample covered
    pub start: u64,
    /// One past the last sample covered
    pub end: u64,
    /// Output row
    pub category: AnnotationCategory,
    /// Label variants, most verbose first
    pub labels: Vec<String>,
}

impl Annotation {
    /// Create a new annotation from string-like label variants
    pub fn new<S: Into<String>>(
        start: u64,
        end: u64,
        category: AnnotationCategory,
        labels: impl IntoIterator<Item = S>,
    ) -> Self {
        Annotation {
            start,
            end,
            category,
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }
}

/// Consumer of decoder output.
///
/// The decoder only ever appends; a `Vec<Annotation>` is the simplest sink.
pub trait AnnotationSink {
    /// Receive one annotation
    fn annotate(&mut self, annotation: Annotation);
}

impl AnnotationSink for Vec<Annotation> {
    fn annotate(&mut self, annotation: Annotation) {
        self.push(annotation);
    }
}

/// A decoded byte together with the sample positions of its bits.
///
/// `bit_spans` holds 9 sample indices: the start of each of the 8 data bits
/// plus the trailing edge of the last one. Field annotations that cover
/// parts of a byte (used by the extended addressing family) index into this
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ByteRecord {
    /// Byte value, assembled MSB first
    pub value: u8,
    /// Bit boundary sample indices, 9 entries
    pub bit_spans: [u64; 9],
}

impl ByteRecord {
    /// Number of boundary entries (8 data bits + trailing edge)
    pub const SPAN_LEN: usize = 9;

    /// Create a byte record
    pub fn new(value: u8, bit_spans: [u64; 9]) -> Self {
        ByteRecord { value, bit_spans }
    }

    /// Sample index where the byte starts
    pub fn start(&self) -> u64 {
        self.bit_spans[0]
    }

    /// Sample index where the byte ends
    pub fn end(&self) -> u64 {
        self.bit_spans[8]
    }

    /// Sample index of the given bit boundary (0..=8)
    pub fn span(&self, bit: usize) -> u64 {
        self.bit_spans[bit]
    }
}

impl std::fmt::Display for ByteRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X}@{}", self.value, self.start())
    }
}

/// A completed byte sequence between a start bit and a stop bit.
///
/// Handed to the packet decoder exactly once, then discarded. Structural
/// validity (minimum length 3: address, data, checksum) is checked by the
/// decoder, not here, so that malformed packets still get annotated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Packet {
    bytes: Vec<ByteRecord>,
}

impl Packet {
    /// Create a packet from assembled byte records
    pub fn new(bytes: Vec<ByteRecord>) -> Self {
        Packet { bytes }
    }

    /// Number of bytes in the packet
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True if the packet holds no bytes
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Byte record at `pos`
    pub fn byte(&self, pos: usize) -> &ByteRecord {
        &self.bytes[pos]
    }

    /// Byte value at `pos`
    pub fn value(&self, pos: usize) -> u8 {
        self.bytes[pos].value
    }

    /// All byte records in order
    pub fn bytes(&self) -> &[ByteRecord] {
        &self.bytes
    }

    /// Sample span covering bytes `from..=to`
    pub fn span(&self, from: usize, to: usize) -> (u64, u64) {
        (self.bytes[from].start(), self.bytes[to].end())
    }
}
