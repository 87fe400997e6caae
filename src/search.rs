//! Cross-cutting search pass over a decoded packet
//!
//! A byte hit is only reported when every *set* address criterion also
//! matched this packet; address hits in turn require a byte hit somewhere
//! in the packet when a byte criterion is set. Command text matching is a
//! case-insensitive substring test over every label the decoder produced.

use crate::config::SearchCriteria;
use crate::core::{Annotation, AnnotationCategory, Packet};
use crate::packet::DecodeOutcome;

/// Append search annotations for one decoded packet
pub fn apply(criteria: &SearchCriteria, packet: &Packet, outcome: &mut DecodeOutcome) {
    if packet.len() < 3 {
        return;
    }

    let dec_hit = outcome
        .decoder_address
        .map_or(false, |a| criteria.decoder_address.matches(&a));
    let acc_hit = match (criteria.accessory_address.get(), outcome.accessory_address) {
        (Some(&wanted), Some(found)) => i32::from(wanted) == found,
        _ => false,
    };
    let cv_hit = outcome.cv.map_or(false, |a| criteria.cv.matches(&a));

    // byte criterion, gated by whichever address criteria are set
    let mut byte_found = false;
    if let Some(&wanted) = criteria.byte.get() {
        let no_address_criteria = !criteria.decoder_address.is_set()
            && !criteria.accessory_address.is_set()
            && !criteria.cv.is_set();
        for pos in 0..packet.len() {
            if packet.value(pos) == wanted {
                byte_found = true;
                if no_address_criteria || dec_hit || acc_hit || cv_hit {
                    let (start, end) = packet.span(pos, pos);
                    let label = format!("BYTE:0x{:02x}/{}", wanted, wanted);
                    outcome.annotations.push(Annotation::new(
                        start,
                        end,
                        AnnotationCategory::SearchByte,
                        [label.as_str()],
                    ));
                }
            }
        }
    }
    let byte_gate = !criteria.byte.is_set() || byte_found;

    let body = packet.span(0, packet.len() - 2);
    if dec_hit && byte_gate {
        let label = format!("DECODER:{}", criteria.decoder_address.get().unwrap_or(&0));
        outcome.annotations.push(Annotation::new(
            body.0,
            body.1,
            AnnotationCategory::SearchDecoder,
            [label.as_str()],
        ));
    }
    if acc_hit && byte_gate {
        let label = format!("ACCESSORY:{}", criteria.accessory_address.get().unwrap_or(&0));
        outcome.annotations.push(Annotation::new(
            body.0,
            body.1,
            AnnotationCategory::SearchAccessory,
            [label.as_str()],
        ));
    }
    if cv_hit && byte_gate {
        let label = format!("CV:{}", criteria.cv.get().unwrap_or(&0));
        outcome.annotations.push(Annotation::new(
            body.0,
            body.1,
            AnnotationCategory::SearchCv,
            [label.as_str()],
        ));
    }

    if let Some(wanted) = criteria.command.get() {
        let needle = wanted.to_lowercase();
        if outcome
            .command_labels
            .iter()
            .any(|label| label.to_lowercase().contains(&needle))
        {
            let label = format!("COMMAND:{}", wanted);
            outcome.annotations.push(Annotation::new(
                body.0,
                body.1,
                AnnotationCategory::SearchCommand,
                [label.as_str()],
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderConfig;
    use crate::core::ByteRecord;
    use crate::packet::PacketDecoder;
    use crate::timing::TimingMode;

    fn packet_of(values: &[u8]) -> Packet {
        let mut bytes = Vec::new();
        for (i, &value) in values.iter().enumerate() {
            let base = i as u64 * 900;
            let mut spans = [0u64; 9];
            for (bit, s) in spans.iter_mut().enumerate() {
                *s = base + bit as u64 * 100;
            }
            bytes.push(ByteRecord::new(value, spans));
        }
        Packet::new(bytes)
    }

    fn decode_and_search(values: &[u8], criteria: SearchCriteria) -> DecodeOutcome {
        let config = DecoderConfig::new(TimingMode::NmraDecoding);
        let packet = packet_of(values);
        let mut outcome = PacketDecoder::new(&config).decode(&packet);
        apply(&criteria, &packet, &mut outcome);
        outcome
    }

    fn count(outcome: &DecodeOutcome, category: AnnotationCategory) -> usize {
        outcome
            .annotations
            .iter()
            .filter(|a| a.category == category)
            .count()
    }

    #[test]
    fn test_byte_search_alone() {
        let mut criteria = SearchCriteria::new();
        criteria.set_byte(0xFF);
        let out = decode_and_search(&[0xFF, 0x00, 0xFF], criteria.clone());
        assert_eq!(count(&out, AnnotationCategory::SearchByte), 2);

        let out = decode_and_search(&[0x03, 0x60, 0x63], criteria);
        assert_eq!(count(&out, AnnotationCategory::SearchByte), 0);
    }

    #[test]
    fn test_byte_search_gated_by_address() {
        let mut criteria = SearchCriteria::new();
        criteria.set_byte(0x60);
        criteria.set_decoder_address(5).unwrap();
        // byte present, but the decoder address is 3: no hit
        let out = decode_and_search(&[0x03, 0x60, 0x63], criteria.clone());
        assert_eq!(count(&out, AnnotationCategory::SearchByte), 0);
        assert_eq!(count(&out, AnnotationCategory::SearchDecoder), 0);

        // matching address: both annotations appear
        let out = decode_and_search(&[0x05, 0x60, 0x65], criteria);
        assert_eq!(count(&out, AnnotationCategory::SearchByte), 1);
        assert_eq!(count(&out, AnnotationCategory::SearchDecoder), 1);
    }

    #[test]
    fn test_address_search_requires_byte_when_set() {
        let mut criteria = SearchCriteria::new();
        criteria.set_decoder_address(3).unwrap();
        criteria.set_byte(0xAA);
        // address matches but the byte is absent
        let out = decode_and_search(&[0x03, 0x60, 0x63], criteria);
        assert_eq!(count(&out, AnnotationCategory::SearchDecoder), 0);

        let mut criteria = SearchCriteria::new();
        criteria.set_decoder_address(3).unwrap();
        let out = decode_and_search(&[0x03, 0x60, 0x63], criteria);
        assert_eq!(count(&out, AnnotationCategory::SearchDecoder), 1);
    }

    #[test]
    fn test_command_search_case_insensitive() {
        let mut criteria = SearchCriteria::new();
        criteria.set_command("idle");
        let out = decode_and_search(&[0xFF, 0x00, 0xFF], criteria);
        assert_eq!(count(&out, AnnotationCategory::SearchCommand), 1);

        let mut criteria = SearchCriteria::new();
        criteria.set_command("accessory");
        let out = decode_and_search(&[0xFF, 0x00, 0xFF], criteria);
        assert_eq!(count(&out, AnnotationCategory::SearchCommand), 0);
    }

    #[test]
    fn test_cv_search() {
        let mut criteria = SearchCriteria::new();
        criteria.set_cv(261).unwrap();
        // POM write to CV 261
        let base = [3u8, 0b1110_1101, 4, 42];
        let mut values = base.to_vec();
        values.push(base.iter().fold(0, |acc, v| acc ^ v));
        let out = decode_and_search(&values, criteria.clone());
        assert_eq!(count(&out, AnnotationCategory::SearchCv), 1);

        let out = decode_and_search(&[0xFF, 0x00, 0xFF], criteria);
        assert_eq!(count(&out, AnnotationCategory::SearchCv), 0);
    }

    #[test]
    fn test_short_packet_skipped() {
        let mut criteria = SearchCriteria::new();
        criteria.set_byte(0xFF);
        let out = decode_and_search(&[0xFF, 0xFF], criteria);
        assert_eq!(count(&out, AnnotationCategory::SearchByte), 0);
    }
}
