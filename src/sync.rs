//! Frame synchronization and the edge-driven decode loop
//!
//! The synchronizer consumes one classified half-bit or bit at a time and
//! recovers byte and packet boundaries. Its state persists across packets;
//! every anomaly resolves by falling back to `Synchronize`, so a single
//! malformed bit never corrupts interpretation of the packets after it.

use tracing::{debug, trace};

use crate::config::DecoderConfig;
use crate::core::{
    Annotation, AnnotationCategory, AnnotationSink, ByteRecord, EdgeSource, Packet,
};
use crate::error::{DecodeError, Result};
use crate::packet::PacketDecoder;
use crate::search;
use crate::spec;
use crate::timing::{BitClassifier, BitSpan};

/// Synchronizer states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SyncState {
    /// Counting half-1 intervals until a whole preamble passed by
    Synchronize,
    /// Between packets, waiting for the first 1 bit
    WaitingForPreamble,
    /// Counting consecutive 1 bits
    Preamble,
    /// Preamble complete, a start bit is required next
    PreambleFound,
    /// Accumulating 8 data bits plus the separator/stop bit
    AddressDataByte,
}

/// The DCC decoder: pulls edges, classifies timing, frames bytes and
/// packets, and emits annotations.
///
/// All mutable state lives here and is touched only from [`run`], matching
/// the single pull-based control path of the pipeline.
///
/// [`run`]: Decoder::run
pub struct Decoder {
    config: DecoderConfig,
    sample_rate: f64,
    classifier: BitClassifier,
    packet_decoder: PacketDecoder,
    issues: Vec<String>,
    min_preamble_bits: u32,
    compliance: bool,

    state: SyncState,
    bit_counter: u32,
    half1_counter: u32,
    byte_value: u8,
    bit_spans: [u64; 9],
    bytes: Vec<ByteRecord>,
    preamble_start: u64,
    preamble_last: u64,
    last_packet_was_stop: bool,
    cutout_armed: bool,
    broken_bit_armed: bool,
}

impl Decoder {
    /// Create a decoder for the given configuration and sample rate.
    ///
    /// Fails only for a missing or non-positive sample rate; every other
    /// configuration problem is reported on the timeline while decoding.
    pub fn new(config: DecoderConfig, sample_rate: f64) -> Result<Self> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(DecodeError::sample_rate(
                "Cannot decode with samplerate 0 or less".to_string(),
            ));
        }
        let mode = config.effective_mode(sample_rate);
        let classifier = BitClassifier::new(
            mode,
            config.experimental,
            config.compare_experimental,
            config.allow_stretched_zero,
            config.accuracy(sample_rate),
        );
        let packet_decoder = PacketDecoder::new(&config);
        let issues = config.issues(sample_rate);
        let min_preamble_bits = config.min_preamble_bits();
        let compliance = config.timing_mode.is_compliance();
        Ok(Decoder {
            config,
            sample_rate,
            classifier,
            packet_decoder,
            issues,
            min_preamble_bits,
            compliance,
            state: SyncState::Synchronize,
            bit_counter: 0,
            half1_counter: 0,
            byte_value: 0,
            bit_spans: [0; 9],
            bytes: Vec::new(),
            preamble_start: 0,
            preamble_last: 0,
            last_packet_was_stop: false,
            cutout_armed: false,
            broken_bit_armed: false,
        })
    }

    /// Current synchronizer state
    pub fn state(&self) -> SyncState {
        self.state
    }

    fn us(&self, delta: u64) -> f64 {
        delta as f64 / self.sample_rate * 1_000_000.0
    }

    /// Decode edges until the source is exhausted, emitting annotations to
    /// the sink
    pub fn run<E: EdgeSource>(&mut self, mut edges: E, sink: &mut dyn AnnotationSink) {
        let Some(mut e1) = edges.next_edge() else { return };
        let Some(mut e2) = edges.next_edge() else { return };

        self.annotate_start(e1, sink);

        loop {
            let part1 = self.us(e2 - e1);

            // configuration problems: report over a lookahead window and
            // keep consuming the stream without decoding it
            if !self.issues.is_empty() {
                let end = e2 + spec::ERROR_LOOKAHEAD_SAMPLES;
                for issue in &self.issues {
                    sink.annotate(Annotation::new(
                        e1,
                        end,
                        AnnotationCategory::Error,
                        [issue.as_str(), "Error", "E"],
                    ));
                }
                // drop edges inside the skipped window
                let next = loop {
                    match edges.next_edge() {
                        Some(edge) if edge < end => continue,
                        Some(edge) => break edge,
                        None => return,
                    }
                };
                e1 = end;
                e2 = next;
                continue;
            }

            let e3;
            if self.state == SyncState::Synchronize {
                if self.classifier.is_half_one(part1, (e1, e2), sink) {
                    self.half1_counter += 1;
                    sink.annotate(Annotation::new(
                        e1,
                        e2,
                        AnnotationCategory::BitsOther,
                        ["half 1 bit", "\u{00bd} 1"],
                    ));
                    let label = format!(
                        "Synchronize ({}/min{})",
                        self.half1_counter,
                        self.min_preamble_bits * 2
                    );
                    sink.annotate(Annotation::new(
                        e1,
                        e2,
                        AnnotationCategory::FrameOther,
                        [label.as_str(), "Sync", "S"],
                    ));
                    e1 = e2;
                    let Some(next) = edges.next_edge() else { return };
                    e2 = next;
                    continue;
                }

                let Some(next) = edges.next_edge() else { return };
                let part2 = self.us(next - e2);
                let span = BitSpan::new(e1, e2, next);
                if self.classifier.is_zero(part1, part2, &span, sink) {
                    if self.half1_counter >= self.min_preamble_bits * 2 {
                        // a whole preamble passed by: this 0 bit is the
                        // packet start bit
                        self.half1_counter = 0;
                        self.set_state(SyncState::PreambleFound);
                        e3 = next;
                    } else {
                        if self.half1_counter == 0 {
                            for (start, end) in [(e1, e2), (e2, next)] {
                                sink.annotate(Annotation::new(
                                    start,
                                    end,
                                    AnnotationCategory::FrameOther,
                                    ["Synchronize (wait for half 1 bits)", "Synchronize", "Sync", "S"],
                                ));
                            }
                        } else {
                            sink.annotate(Annotation::new(
                                e1,
                                next,
                                AnnotationCategory::BitsOther,
                                ["0"],
                            ));
                            let label = format!(
                                "Synchronize (wait for preamble) (too few half 1 bits ({}/min{}))",
                                self.half1_counter,
                                self.min_preamble_bits * 2
                            );
                            sink.annotate(Annotation::new(
                                e1,
                                next,
                                AnnotationCategory::FrameOther,
                                [label.as_str(), "Synchronize", "Sync.", "S"],
                            ));
                        }
                        self.half1_counter = 0;
                        e1 = next;
                        let Some(after) = edges.next_edge() else { return };
                        e2 = after;
                        continue;
                    }
                } else {
                    // neither a half 1 nor a 0: slide one edge and keep
                    // hunting for alignment
                    let label = format!("{:.2}µs", part1);
                    sink.annotate(Annotation::new(
                        e1,
                        e2,
                        AnnotationCategory::BitsOther,
                        [label.as_str()],
                    ));
                    sink.annotate(Annotation::new(
                        e1,
                        e2,
                        AnnotationCategory::FrameOther,
                        ["Synchronize (wait for half 1 bits)", "Sync", "S"],
                    ));
                    e1 = e2;
                    e2 = next;
                    self.set_state(SyncState::Synchronize);
                    continue;
                }
            } else {
                let Some(next) = edges.next_edge() else { return };
                e3 = next;
            }

            let part2 = self.us(e3 - e2);
            let total = part1 + part2;
            let span = BitSpan::new(e1, e2, e3);
            let mut e4 = None;

            let value = if self.classifier.is_one(part1, part2, &span, sink) {
                self.cutout_armed = false;
                self.broken_bit_armed = false;
                Some(true)
            } else if self.classifier.is_zero(part1, part2, &span, sink) {
                if self.classifier.is_railcom_cutout(total, self.cutout_armed) {
                    if self.consume_cutout(e1, e3, &mut edges, &mut e1, &mut e2, sink) {
                        continue;
                    }
                    return;
                }
                self.cutout_armed = false;
                self.broken_bit_armed = false;
                if self.classifier.stretched_zero_variance(part1, part2) {
                    let delta = (part1 - part2).abs();
                    let long = format!(
                        "Stretched 0-bit: \u{0394}:{:.2}µs ({:.2}µs/{:.2}µs)",
                        delta, part1, part2
                    );
                    let short = format!("\u{0394}{:.2}µs", delta);
                    sink.annotate(Annotation::new(
                        e1,
                        e3,
                        AnnotationCategory::Info,
                        [long.as_str(), short.as_str()],
                    ));
                }
                Some(false)
            } else if self.classifier.is_railcom_cutout(total, self.cutout_armed) {
                if self.consume_cutout(e1, e3, &mut edges, &mut e1, &mut e2, sink) {
                    continue;
                }
                return;
            } else if self
                .classifier
                .is_broken_one_after_cutout(total, self.broken_bit_armed)
            {
                self.broken_bit_armed = false;
                sink.annotate(Annotation::new(
                    e1,
                    e3,
                    AnnotationCategory::FrameOther,
                    ["broken 1-bit"],
                ));
                sink.annotate(Annotation::new(
                    e1,
                    e3,
                    AnnotationCategory::BitsOther,
                    ["ignored broken 1-bit after Railcom cutout", "ignored"],
                ));
                self.set_state(SyncState::WaitingForPreamble);
                e1 = e3;
                let Some(next) = edges.next_edge() else { return };
                e2 = next;
                continue;
            } else {
                // unknown timing; optionally merge out electrical glitches
                if self.config.ignore_short_pulse {
                    let Some(next) = edges.next_edge() else { return };
                    e4 = Some(next);
                    let tail = self.us(next - e3);
                    if tail <= spec::INTERFERING_PULSE_MAX_US
                        && part2 <= spec::INTERFERING_PULSE_MAX_US
                    {
                        e2 = (e2 + next) / 2;
                        sink.annotate(Annotation::new(
                            e2,
                            next,
                            AnnotationCategory::Info,
                            ["Short pulse ignored (1)"],
                        ));
                        continue;
                    } else if tail <= spec::INTERFERING_PULSE_MAX_US {
                        sink.annotate(Annotation::new(
                            e3,
                            next,
                            AnnotationCategory::Info,
                            ["Short pulse ignored (2)"],
                        ));
                        continue;
                    } else if part2 <= spec::INTERFERING_PULSE_MAX_US {
                        sink.annotate(Annotation::new(
                            e2,
                            e3,
                            AnnotationCategory::Info,
                            ["Short pulse ignored (3)"],
                        ));
                        e2 = next;
                        continue;
                    }
                }

                trace!(part1, part2, "unclassifiable interval pair");
                let long = format!("{:.2}µs={:.2}µs+{:.2}µs", total, part1, part2);
                let short = format!("{:.2}µs", total);
                sink.annotate(Annotation::new(
                    e1,
                    e3,
                    AnnotationCategory::FrameOther,
                    ["Resynchronize (wait for preamble)", "Resynchronize", "Resync.", "R"],
                ));
                sink.annotate(Annotation::new(
                    e1,
                    e3,
                    AnnotationCategory::Error,
                    ["unknown timing - should not occur - dirty signal?", "Error", "E"],
                ));
                sink.annotate(Annotation::new(
                    e1,
                    e3,
                    AnnotationCategory::BitsOther,
                    [long.as_str(), short.as_str()],
                ));
                self.set_state(SyncState::Synchronize);
                None
            };

            if let Some(bit) = value {
                if self.state != SyncState::Synchronize {
                    sink.annotate(Annotation::new(
                        e1,
                        e3,
                        AnnotationCategory::Bits,
                        [if bit { "1" } else { "0" }],
                    ));
                    self.process_bit(e1, e3, bit, sink);
                }
            }

            let next = match e4 {
                Some(edge) => edge,
                None => {
                    let Some(edge) = edges.next_edge() else { return };
                    edge
                }
            };
            e1 = e3;
            e2 = next;
        }
    }

    /// Swallow a matched cutout interval: annotate it, arm the broken-bit
    /// allowance, and restart at the preamble. Returns false when the edge
    /// source ran dry.
    fn consume_cutout<E: EdgeSource>(
        &mut self,
        start: u64,
        end: u64,
        edges: &mut E,
        e1: &mut u64,
        e2: &mut u64,
        sink: &mut dyn AnnotationSink,
    ) -> bool {
        debug!(start, end, "railcom cutout");
        self.cutout_armed = false;
        self.broken_bit_armed = true;
        self.last_packet_was_stop = false;
        sink.annotate(Annotation::new(
            start,
            end,
            AnnotationCategory::Bits,
            ["Railcom cutout", "Railcom", "R"],
        ));
        let Some(next) = edges.next_edge() else { return false };
        *e1 = end;
        *e2 = next;
        self.set_state(SyncState::WaitingForPreamble);
        true
    }

    /// Reset counters for a state change; leaving for `Synchronize` also
    /// drops the cutout and stop-bit context
    fn set_state(&mut self, state: SyncState) {
        trace!(?state, "state change");
        self.state = state;
        self.bit_counter = 0;
        self.half1_counter = 0;
        self.bytes.clear();
        if state == SyncState::Synchronize {
            self.cutout_armed = false;
            self.broken_bit_armed = false;
            self.last_packet_was_stop = false;
        }
    }

    /// Feed one confirmed bit into the framing state machine
    fn process_bit(&mut self, start: u64, stop: u64, bit: bool, sink: &mut dyn AnnotationSink) {
        match self.state {
            SyncState::PreambleFound => {
                if !bit {
                    sink.annotate(Annotation::new(
                        start,
                        stop,
                        AnnotationCategory::Frame,
                        ["Start Packet", "Start", "S"],
                    ));
                    self.set_state(SyncState::AddressDataByte);
                } else {
                    sink.annotate(Annotation::new(
                        start,
                        stop,
                        AnnotationCategory::FrameOther,
                        ["Resynchronize (Wait for preamble)", "Resynchronize", "Resync.", "R"],
                    ));
                    sink.annotate(Annotation::new(
                        start,
                        stop,
                        AnnotationCategory::Error,
                        ["unexpected 1-bit found", "Error", "E"],
                    ));
                    self.set_state(SyncState::Synchronize);
                }
            }

            SyncState::WaitingForPreamble => {
                if bit {
                    self.set_state(SyncState::Preamble);
                    self.preamble_start = start;
                }
            }

            SyncState::Preamble => {
                if bit {
                    self.bit_counter += 1;
                    self.preamble_last = stop;
                } else {
                    // in decode modes the stop bit of the previous packet
                    // counts as one extra preamble bit; compliance modes
                    // reject the relaxation
                    let folded = self.last_packet_was_stop && !self.compliance;
                    let counter = self.bit_counter + u32::from(folded);
                    if counter + 1 >= self.min_preamble_bits {
                        sink.annotate(Annotation::new(
                            start,
                            stop,
                            AnnotationCategory::Frame,
                            ["Start Packet", "Start", "S"],
                        ));
                        let label = if folded {
                            format!("Preamble: 1+{} bits", counter)
                        } else {
                            format!("Preamble: {} bits", counter + 1)
                        };
                        sink.annotate(Annotation::new(
                            self.preamble_start,
                            self.preamble_last,
                            AnnotationCategory::Frame,
                            [label.as_str(), "Preamble", "P"],
                        ));
                        self.set_state(SyncState::AddressDataByte);
                    } else {
                        sink.annotate(Annotation::new(
                            start,
                            stop,
                            AnnotationCategory::FrameOther,
                            ["Resynchronize (Wait for preamble)", "Resynchronize", "Resync.", "R"],
                        ));
                        let label = if folded {
                            format!(
                                "Invalid preamble (too few 1-bits (1+{}/min{}))",
                                counter, self.min_preamble_bits
                            )
                        } else {
                            format!(
                                "Invalid preamble (too few 1-bits ({}/min{}))",
                                counter + 1,
                                self.min_preamble_bits
                            )
                        };
                        sink.annotate(Annotation::new(
                            self.preamble_start,
                            self.preamble_last,
                            AnnotationCategory::Error,
                            [label.as_str(), "Error", "E"],
                        ));
                        self.set_state(SyncState::Synchronize);
                    }
                }
            }

            SyncState::AddressDataByte => {
                self.last_packet_was_stop = false;
                if self.bit_counter < 8 {
                    self.bit_spans[self.bit_counter as usize] = start;
                    self.bit_counter += 1;
                    self.byte_value = (self.byte_value << 1) | u8::from(bit);
                    if self.bit_counter == 8 {
                        self.bit_spans[8] = stop;
                        self.bytes
                            .push(ByteRecord::new(self.byte_value, self.bit_spans));
                    }
                } else if !bit {
                    // separator: a further byte follows
                    self.bit_counter = 0;
                    self.byte_value = 0;
                    sink.annotate(Annotation::new(
                        start,
                        stop,
                        AnnotationCategory::Frame,
                        ["Start Databyte", "Start", "S"],
                    ));
                } else {
                    sink.annotate(Annotation::new(
                        start,
                        stop,
                        AnnotationCategory::Frame,
                        ["Stop Packet", "Stop", "S"],
                    ));
                    let packet = Packet::new(std::mem::take(&mut self.bytes));
                    debug!(bytes = packet.len(), "packet complete");
                    let mut outcome = self.packet_decoder.decode(&packet);
                    search::apply(&self.config.search, &packet, &mut outcome);
                    for annotation in outcome.annotations {
                        sink.annotate(annotation);
                    }
                    self.cutout_armed = true;
                    self.set_state(SyncState::WaitingForPreamble);
                    self.last_packet_was_stop = true;
                }
            }

            SyncState::Synchronize => {}
        }
    }

    /// Leading info annotation with the sample rate and derived accuracy
    fn annotate_start(&self, first_edge: u64, sink: &mut dyn AnnotationSink) {
        let rate = if self.sample_rate / 1000.0 < 1000.0 {
            format!("{:.0} kHz", self.sample_rate / 1000.0)
        } else {
            format!("{:.0} MHz", self.sample_rate / 1_000_000.0)
        };
        let accuracy = self.classifier.accuracy();
        let accuracy = if accuracy >= 1.0 {
            format!("{:.0} µs", accuracy)
        } else {
            format!("{:.0} ns", accuracy * 1000.0)
        };
        let label = format!(
            "Samplerate: {}, this results in an accuracy deviation of: {}, decoder version:{}",
            rate,
            accuracy,
            env!("CARGO_PKG_VERSION")
        );
        sink.annotate(Annotation::new(
            0,
            first_edge,
            AnnotationCategory::BitsOther,
            [label.as_str()],
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::TimingMode;

    const RATE: f64 = 1_000_000.0; // 1 µs per sample

    /// Build an edge stream from half-period durations in µs
    fn edges_from(halves: &[u64]) -> Vec<u64> {
        let mut t = 100u64;
        let mut edges = vec![t];
        for &h in halves {
            t += h;
            edges.push(t);
        }
        edges
    }

    /// Half periods for a bit string ('1' = 58/58, '0' = 100/100)
    fn halves_for(bits: &str) -> Vec<u64> {
        let mut halves = Vec::new();
        for bit in bits.chars() {
            let h = if bit == '1' { 58 } else { 100 };
            halves.push(h);
            halves.push(h);
        }
        halves
    }

    /// Bit string of a full packet: bytes with separators plus the stop bit
    fn packet_bits(bytes: &[u8]) -> String {
        let mut bits = String::new();
        for (i, byte) in bytes.iter().enumerate() {
            if i > 0 {
                bits.push('0'); // separator
            }
            for bit in (0..8).rev() {
                bits.push(if byte >> bit & 1 == 1 { '1' } else { '0' });
            }
        }
        bits.push('1'); // stop
        bits
    }

    /// Synchronization run-in, start bit, packet, flush
    fn idle_stream() -> Vec<u64> {
        let mut bits = "1".repeat(12);
        bits.push('0'); // start bit
        bits.push_str(&packet_bits(&[0xFF, 0x00, 0xFF]));
        bits.push_str(&"1".repeat(6));
        edges_from(&halves_for(&bits))
    }

    fn decode_with(config: DecoderConfig, rate: f64, edges: Vec<u64>) -> Vec<Annotation> {
        let mut decoder = Decoder::new(config, rate).unwrap();
        let mut annotations = Vec::new();
        decoder.run(edges.into_iter(), &mut annotations);
        annotations
    }

    fn decode(edges: Vec<u64>) -> Vec<Annotation> {
        decode_with(DecoderConfig::new(TimingMode::NmraDecoding), RATE, edges)
    }

    fn labels(annotations: &[Annotation], category: AnnotationCategory) -> Vec<String> {
        annotations
            .iter()
            .filter(|a| a.category == category)
            .flat_map(|a| a.labels.clone())
            .collect()
    }

    #[test]
    fn test_sample_rate_is_fatal() {
        assert!(Decoder::new(DecoderConfig::default(), 0.0).is_err());
        assert!(Decoder::new(DecoderConfig::default(), -5.0).is_err());
        assert!(Decoder::new(DecoderConfig::default(), f64::NAN).is_err());
        assert!(Decoder::new(DecoderConfig::default(), RATE).is_ok());
    }

    #[test]
    fn test_idle_packet_end_to_end() {
        let annotations = decode(idle_stream());
        let frames = labels(&annotations, AnnotationCategory::Frame);
        assert!(frames.iter().any(|l| l == "Start Packet"));
        assert!(frames.iter().any(|l| l == "Stop Packet"));
        assert!(frames.iter().any(|l| l == "Checksum: OK"));
        let commands = labels(&annotations, AnnotationCategory::Command);
        assert!(commands.iter().any(|l| l == "Idle"));
        assert!(!annotations
            .iter()
            .any(|a| a.category == AnnotationCategory::Error));
    }

    #[test]
    fn test_too_few_sync_halves_stays_synchronizing() {
        // 9 one bits are 18 half-1 intervals, below the 20 needed
        let mut bits = "1".repeat(9);
        bits.push('0');
        bits.push_str(&packet_bits(&[0xFF, 0x00, 0xFF]));
        let annotations = decode(edges_from(&halves_for(&bits)));
        assert!(!labels(&annotations, AnnotationCategory::Frame)
            .iter()
            .any(|l| l == "Start Packet"));
        assert!(labels(&annotations, AnnotationCategory::FrameOther)
            .iter()
            .any(|l| l.contains("too few half 1 bits")));
    }

    #[test]
    fn test_exact_preamble_threshold_promotes() {
        // exactly 10 one bits = 20 half-1 intervals, then the start bit
        let mut bits = "1".repeat(10);
        bits.push('0');
        bits.push_str(&packet_bits(&[0xFF, 0x00, 0xFF]));
        bits.push_str(&"1".repeat(4));
        let annotations = decode(edges_from(&halves_for(&bits)));
        assert!(labels(&annotations, AnnotationCategory::Frame)
            .iter()
            .any(|l| l == "Start Packet"));
    }

    #[test]
    fn test_invalid_preamble_after_packet() {
        // first packet decodes, then a 5 bit preamble is rejected
        let mut bits = "1".repeat(12);
        bits.push('0');
        bits.push_str(&packet_bits(&[0xFF, 0x00, 0xFF]));
        bits.push_str(&"1".repeat(5));
        bits.push('0');
        bits.push_str(&"1".repeat(4));
        let annotations = decode(edges_from(&halves_for(&bits)));
        assert!(labels(&annotations, AnnotationCategory::Error)
            .iter()
            .any(|l| l.starts_with("Invalid preamble")));
    }

    #[test]
    fn test_stop_bit_folds_into_next_preamble_in_decode_mode() {
        // second packet has a 9 bit preamble: enough only because the stop
        // bit of the first packet counts as one more
        let mut bits = "1".repeat(12);
        bits.push('0');
        bits.push_str(&packet_bits(&[0xFF, 0x00, 0xFF]));
        bits.push_str(&"1".repeat(9));
        bits.push('0');
        bits.push_str(&packet_bits(&[0xFF, 0x00, 0xFF]));
        bits.push_str(&"1".repeat(4));
        let annotations = decode(edges_from(&halves_for(&bits)));
        let frames = labels(&annotations, AnnotationCategory::Frame);
        assert_eq!(frames.iter().filter(|l| *l == "Stop Packet").count(), 2);
        assert!(frames.iter().any(|l| l.starts_with("Preamble: 1+")));
    }

    #[test]
    fn test_compliance_mode_rejects_stop_bit_folding() {
        let mut config = DecoderConfig::new(TimingMode::NmraCompliance);
        config.compliance_preamble_bits = 10;
        // same stream as the folding test, at a compliance-capable rate
        let mut bits = "1".repeat(12);
        bits.push('0');
        bits.push_str(&packet_bits(&[0xFF, 0x00, 0xFF]));
        bits.push_str(&"1".repeat(9));
        bits.push('0');
        bits.push_str(&packet_bits(&[0xFF, 0x00, 0xFF]));
        bits.push_str(&"1".repeat(4));
        // at 2 MHz every duration doubles in samples
        let halves: Vec<u64> = halves_for(&bits).iter().map(|h| h * 2).collect();
        let annotations = decode_with(config, 2_000_000.0, edges_from(&halves));
        let frames = labels(&annotations, AnnotationCategory::Frame);
        assert_eq!(frames.iter().filter(|l| *l == "Stop Packet").count(), 1);
        assert!(labels(&annotations, AnnotationCategory::Error)
            .iter()
            .any(|l| l.starts_with("Invalid preamble")));
    }

    #[test]
    fn test_railcom_cutout_consumed() {
        let mut bits = "1".repeat(12);
        bits.push('0');
        bits.push_str(&packet_bits(&[0xFF, 0x00, 0xFF]));
        let mut halves = halves_for(&bits);
        // cutout directly after the stop bit, then another packet
        halves.push(230);
        halves.push(230);
        let mut tail = "1".repeat(12);
        tail.push('0');
        tail.push_str(&packet_bits(&[0xFF, 0x00, 0xFF]));
        tail.push_str(&"1".repeat(4));
        halves.extend(halves_for(&tail));
        let annotations = decode(edges_from(&halves));
        assert!(labels(&annotations, AnnotationCategory::Bits)
            .iter()
            .any(|l| l == "Railcom cutout"));
        let frames = labels(&annotations, AnnotationCategory::Frame);
        assert_eq!(frames.iter().filter(|l| *l == "Stop Packet").count(), 2);
    }

    #[test]
    fn test_broken_bit_swallowed_after_cutout() {
        let mut bits = "1".repeat(12);
        bits.push('0');
        bits.push_str(&packet_bits(&[0xFF, 0x00, 0xFF]));
        let mut halves = halves_for(&bits);
        halves.push(230);
        halves.push(230);
        // malformed short bit right after the cutout
        halves.push(30);
        halves.push(30);
        let mut tail = "1".repeat(12);
        tail.push('0');
        tail.push_str(&packet_bits(&[0xFF, 0x00, 0xFF]));
        tail.push_str(&"1".repeat(4));
        halves.extend(halves_for(&tail));
        let annotations = decode(edges_from(&halves));
        assert!(labels(&annotations, AnnotationCategory::BitsOther)
            .iter()
            .any(|l| l.contains("ignored broken 1-bit")));
        assert!(!annotations
            .iter()
            .any(|a| a.category == AnnotationCategory::Error));
    }

    #[test]
    fn test_short_pulse_merged() {
        let mut config = DecoderConfig::new(TimingMode::NmraDecoding);
        config.ignore_short_pulse = true;
        let mut bits = "1".repeat(12);
        bits.push('0');
        // idle packet, but the first half of the first 0 bit in 0x00
        // carries a 2 µs glitch: 50 + 2 + 48 instead of 100
        let clean = packet_bits(&[0xFF, 0x00, 0xFF]);
        let mut halves = halves_for(&bits);
        let packet_halves = halves_for(&clean);
        // bytes: 8x'1', separator '0', then the glitched '0'
        let glitch_at = 8 * 2 + 2; // first half of the first 0x00 bit
        for (i, &h) in packet_halves.iter().enumerate() {
            if i == glitch_at {
                halves.extend([50, 2, 48]);
            } else {
                halves.push(h);
            }
        }
        let mut tail_bits = String::new();
        tail_bits.push_str(&"1".repeat(6));
        halves.extend(halves_for(&tail_bits));
        let annotations = decode_with(config, RATE, edges_from(&halves));
        assert!(labels(&annotations, AnnotationCategory::Info)
            .iter()
            .any(|l| l.starts_with("Short pulse ignored")));
        assert!(labels(&annotations, AnnotationCategory::Command)
            .iter()
            .any(|l| l == "Idle"));
    }

    #[test]
    fn test_unknown_timing_resynchronizes() {
        let mut bits = "1".repeat(12);
        bits.push('0');
        bits.push_str(&packet_bits(&[0xFF, 0x00, 0xFF]));
        let mut halves = halves_for(&bits);
        // garbage interval pair mid-stream, then a clean packet
        halves.push(75);
        halves.push(75);
        let mut tail = "1".repeat(25);
        tail.push('0');
        tail.push_str(&packet_bits(&[0xFF, 0x00, 0xFF]));
        tail.push_str(&"1".repeat(4));
        halves.extend(halves_for(&tail));
        let annotations = decode(edges_from(&halves));
        assert!(labels(&annotations, AnnotationCategory::Error)
            .iter()
            .any(|l| l.contains("unknown timing")));
        // recovery: the second packet still decodes
        let frames = labels(&annotations, AnnotationCategory::Frame);
        assert_eq!(frames.iter().filter(|l| *l == "Stop Packet").count(), 2);
    }

    #[test]
    fn test_configuration_issue_reported_on_timeline() {
        let config = DecoderConfig::new(TimingMode::NmraDecoding);
        let annotations = decode_with(config, 10_000.0, edges_from(&halves_for("1111")));
        assert!(labels(&annotations, AnnotationCategory::Error)
            .iter()
            .any(|l| l.contains("Samplerate must be >= 25kHz")));
        // nothing decoded while the configuration is unusable
        assert!(labels(&annotations, AnnotationCategory::Frame).is_empty());
    }

    #[test]
    fn test_leading_info_annotation() {
        let annotations = decode(idle_stream());
        assert_eq!(annotations[0].category, AnnotationCategory::BitsOther);
        assert!(annotations[0].labels[0].starts_with("Samplerate: 1 MHz"));
    }

    #[test]
    fn test_search_byte_annotation_end_to_end() {
        let mut config = DecoderConfig::new(TimingMode::NmraDecoding);
        config.search.set_byte(0xFF);
        let annotations = decode_with(config, RATE, idle_stream());
        let hits: Vec<_> = annotations
            .iter()
            .filter(|a| a.category == AnnotationCategory::SearchByte)
            .collect();
        assert_eq!(hits.len(), 2); // 0xFF appears twice in the idle packet
    }
}
