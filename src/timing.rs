//! Timing profiles and the half-period classifier
//!
//! DCC encodes bits purely by edge timing of a self-clocked square wave.
//! Senders and receivers both carry oscillator error, so every bound is
//! widened by the receiver's own timestamp resolution (one sample period)
//! before comparison.

use crate::core::{Annotation, AnnotationCategory, AnnotationSink};
use crate::error::{DecodeError, Result};
use crate::spec;

/// Timing mode selecting one of the named profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TimingMode {
    /// Placeholder for an unusable configuration (e.g. compliance mode on a
    /// too-slow capture); classifies nothing
    Invalid,
    /// NMRA S-9.1 receiver tolerances
    NmraDecoding,
    /// RCN-210 receiver tolerances
    RcnDecoding,
    /// NMRA S-9.1 sender limits, for compliance testing
    NmraCompliance,
    /// RCN-210 limits at the track, for compliance testing
    RcnComplianceTrack,
    /// RCN-210 limits at the station output, for compliance testing
    RcnComplianceStation,
    /// User-supplied bounds
    Experimental,
}

impl TimingMode {
    /// Fixed profile for this mode.
    ///
    /// `Invalid` and `Experimental` have no fixed table entry; they return
    /// an all-zero profile (the experimental bounds live in the decoder
    /// configuration).
    pub fn profile(&self) -> TimingProfile {
        match self {
            TimingMode::NmraDecoding => TimingProfile::new(52.0, 64.0, 6.0, 90.0, 10000.0, 10000.0),
            TimingMode::RcnDecoding => TimingProfile::new(52.0, 64.0, 6.0, 90.0, 119.0, 10000.0),
            TimingMode::NmraCompliance => TimingProfile::new(55.0, 61.0, 3.0, 95.0, 9900.0, 9900.0),
            TimingMode::RcnComplianceTrack => {
                TimingProfile::new(55.0, 61.0, 3.0, 95.0, 116.0, 9900.0)
            }
            TimingMode::RcnComplianceStation => {
                TimingProfile::new(56.0, 60.0, 3.0, 97.0, 114.0, 9898.0)
            }
            TimingMode::Invalid | TimingMode::Experimental => {
                TimingProfile::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.0)
            }
        }
    }

    /// True for the three compliance-testing modes
    pub fn is_compliance(&self) -> bool {
        matches!(
            self,
            TimingMode::NmraCompliance
                | TimingMode::RcnComplianceTrack
                | TimingMode::RcnComplianceStation
        )
    }

    /// True for the modes whose stretched-zero policy follows the
    /// configuration flag (RCN and experimental); NMRA modes always accept
    /// stretched zeros
    pub fn stretched_zero_configurable(&self) -> bool {
        matches!(
            self,
            TimingMode::RcnDecoding
                | TimingMode::RcnComplianceTrack
                | TimingMode::RcnComplianceStation
                | TimingMode::Experimental
        )
    }
}

impl std::fmt::Display for TimingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimingMode::Invalid => "invalid",
            TimingMode::NmraDecoding => "NMRA decoding",
            TimingMode::RcnDecoding => "RCN decoding",
            TimingMode::NmraCompliance => "NMRA compliance testing",
            TimingMode::RcnComplianceTrack => "RCN compliance testing track",
            TimingMode::RcnComplianceStation => "RCN compliance testing station",
            TimingMode::Experimental => "Experimental",
        };
        write!(f, "{}", name)
    }
}

/// Six microsecond bounds describing one timing profile.
///
/// Invariants (`half1_min <= half1_max`, `half0_min <= half0_max <=
/// half0_max_stretched`) are configuration matters: [`validate`] is called
/// on user-supplied profiles before decoding starts, never at runtime.
///
/// [`validate`]: TimingProfile::validate
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimingProfile {
    /// Shortest accepted half period of a 1 bit
    pub half1_min: f64,
    /// Longest accepted half period of a 1 bit
    pub half1_max: f64,
    /// Largest accepted difference between the two halves of a 1 bit
    pub half1_tolerance: f64,
    /// Shortest accepted half period of a 0 bit
    pub half0_min: f64,
    /// Longest accepted half period of a normal 0 bit
    pub half0_max: f64,
    /// Longest accepted half period of a stretched 0 bit
    pub half0_max_stretched: f64,
}

impl TimingProfile {
    /// Create a profile from the six bounds, in microseconds
    pub fn new(
        half1_min: f64,
        half1_max: f64,
        half1_tolerance: f64,
        half0_min: f64,
        half0_max: f64,
        half0_max_stretched: f64,
    ) -> Self {
        TimingProfile {
            half1_min,
            half1_max,
            half1_tolerance,
            half0_min,
            half0_max,
            half0_max_stretched,
        }
    }

    /// Check the min/max invariants of a user-supplied profile
    pub fn validate(&self) -> Result<()> {
        if self.half1_min < 0.0
            || self.half1_max < 0.0
            || self.half1_tolerance < 0.0
            || self.half0_min < 0.0
            || self.half0_max < 0.0
            || self.half0_max_stretched < 0.0
        {
            return Err(DecodeError::invalid_profile(
                "bounds must not be negative".to_string(),
            ));
        }
        if self.half1_min > self.half1_max {
            return Err(DecodeError::invalid_profile(format!(
                "1-bit half min {} exceeds max {}",
                self.half1_min, self.half1_max
            )));
        }
        if self.half0_min > self.half0_max {
            return Err(DecodeError::invalid_profile(format!(
                "0-bit half min {} exceeds max {}",
                self.half0_min, self.half0_max
            )));
        }
        if self.half0_max > self.half0_max_stretched {
            return Err(DecodeError::invalid_profile(format!(
                "0-bit half max {} exceeds stretched max {}",
                self.half0_max, self.half0_max_stretched
            )));
        }
        Ok(())
    }
}

/// Edge positions delimiting one candidate bit (two half periods)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitSpan {
    /// Edge starting the first half period
    pub start: u64,
    /// Edge between the two half periods
    pub mid: u64,
    /// Edge ending the second half period
    pub end: u64,
}

impl BitSpan {
    /// Create a span from its three edges
    pub fn new(start: u64, mid: u64, end: u64) -> Self {
        BitSpan { start, mid, end }
    }
}

/// Classifies half-period duration pairs against the active profile.
///
/// When `compare` is set every bound is evaluated against both the active
/// and the experimental profile; a sample accepted only by the experimental
/// profile still classifies, but the disagreement is reported as a Variance
/// annotation.
#[derive(Debug, Clone)]
pub struct BitClassifier {
    mode: TimingMode,
    active: TimingProfile,
    experimental: TimingProfile,
    compare: bool,
    allow_stretched_zero: bool,
    accuracy: f64,
}

impl BitClassifier {
    /// Create a classifier.
    ///
    /// `accuracy` is the measurement tolerance in microseconds, normally one
    /// sample period. For `TimingMode::Experimental` the active profile is
    /// the experimental one.
    pub fn new(
        mode: TimingMode,
        experimental: TimingProfile,
        compare: bool,
        allow_stretched_zero: bool,
        accuracy: f64,
    ) -> Self {
        let active = match mode {
            TimingMode::Experimental => experimental,
            _ => mode.profile(),
        };
        BitClassifier {
            mode,
            active,
            experimental,
            compare,
            allow_stretched_zero,
            accuracy,
        }
    }

    /// Measurement tolerance in microseconds
    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    /// Active profile after mode resolution
    pub fn active_profile(&self) -> &TimingProfile {
        &self.active
    }

    /// True iff `part` alone could be one half of a 1 bit
    pub fn is_half_one(
        &self,
        part: f64,
        span: (u64, u64),
        sink: &mut dyn AnnotationSink,
    ) -> bool {
        let a = self.accuracy;
        let min_m = self.active.half1_min - a <= part;
        let max_m = part <= self.active.half1_max + a;
        let (min_e, max_e) = if self.compare {
            (
                self.experimental.half1_min - a <= part,
                part <= self.experimental.half1_max + a,
            )
        } else {
            (min_m, max_m)
        };
        if (min_m || min_e) && (max_m || max_e) {
            if !min_m && min_e {
                self.variance1(span, part, self.active.half1_min, "half 1 bit too short", "minimum", sink);
            } else if !max_m && max_e {
                self.variance1(span, part, self.active.half1_max, "half 1 bit too long", "maximum", sink);
            }
            return true;
        }
        false
    }

    /// True iff the pair forms a 1 bit: both halves in the 1-bit window and
    /// the halves differ by at most `max(half1_tolerance, 2*accuracy)`
    pub fn is_one(
        &self,
        part1: f64,
        part2: f64,
        span: &BitSpan,
        sink: &mut dyn AnnotationSink,
    ) -> bool {
        let a = self.accuracy;
        let m = &self.active;
        let diff = (part1 - part2).abs();
        let min_m1 = m.half1_min - a <= part1;
        let max_m1 = part1 <= m.half1_max + a;
        let min_m2 = m.half1_min - a <= part2;
        let max_m2 = part2 <= m.half1_max + a;
        let diff_m = diff <= m.half1_tolerance.max(2.0 * a);
        let (min_e1, max_e1, min_e2, max_e2, diff_e) = if self.compare {
            let e = &self.experimental;
            (
                e.half1_min - a <= part1,
                part1 <= e.half1_max + a,
                e.half1_min - a <= part2,
                part2 <= e.half1_max + a,
                diff <= e.half1_tolerance.max(2.0 * a),
            )
        } else {
            (min_m1, max_m1, min_m2, max_m2, diff_m)
        };

        if (min_m1 || min_e1)
            && (max_m1 || max_e1)
            && (min_m2 || min_e2)
            && (max_m2 || max_e2)
            && (diff_m || diff_e)
        {
            if !diff_m && diff_e {
                sink.annotate(Annotation::new(
                    span.start,
                    span.end,
                    AnnotationCategory::Variance2,
                    [
                        format!(
                            "half bits difference: actual: {:.2}µs, allowed: {:.2}µs",
                            diff, m.half1_tolerance
                        ),
                        format!("{:.2}µs/{:.2}µs", diff, m.half1_tolerance),
                    ],
                ));
            }
            if !min_m1 && min_e1 {
                self.variance1((span.start, span.mid), part1, m.half1_min, "1. half bit too short", "minimum", sink);
            } else if !max_m1 && max_e1 {
                self.variance1((span.start, span.mid), part1, m.half1_max, "1. half bit too long", "maximum", sink);
            }
            if !min_m2 && min_e2 {
                self.variance1((span.mid, span.end), part2, m.half1_min, "2. half bit too short", "minimum", sink);
            } else if !max_m2 && max_e2 {
                self.variance1((span.mid, span.end), part2, m.half1_max, "2. half bit too long", "maximum", sink);
            }
            return true;
        }
        false
    }

    /// True iff the pair forms a 0 bit, normal or stretched depending on the
    /// mode's stretched-zero policy
    pub fn is_zero(
        &self,
        part1: f64,
        part2: f64,
        span: &BitSpan,
        sink: &mut dyn AnnotationSink,
    ) -> bool {
        let a = self.accuracy;
        let m = &self.active;
        let total = part1 + part2;
        let min_m1 = m.half0_min - a <= part1;
        let max_m1 = part1 <= m.half0_max + a;
        let max_st_m1 = part1 <= m.half0_max_stretched + a;
        let min_m2 = m.half0_min - a <= part2;
        let max_m2 = part2 <= m.half0_max + a;
        let max_st_m2 = part2 <= m.half0_max_stretched + a;
        let total_ok = total <= spec::STRETCHED_ZERO_TOTAL_MAX + 2.0 * a;
        let (min_e1, max_e1, max_st_e1, min_e2, max_e2, max_st_e2) = if self.compare {
            let e = &self.experimental;
            (
                e.half0_min - a <= part1,
                part1 <= e.half0_max + a,
                part1 <= e.half0_max_stretched + a,
                e.half0_min - a <= part2,
                part2 <= e.half0_max + a,
                part2 <= e.half0_max_stretched + a,
            )
        } else {
            (min_m1, max_m1, max_st_m1, min_m2, max_m2, max_st_m2)
        };

        let configurable = self.mode.stretched_zero_configurable();
        let without_stretched = configurable && !self.allow_stretched_zero;
        let with_stretched = (configurable && self.allow_stretched_zero)
            || matches!(self.mode, TimingMode::NmraDecoding | TimingMode::NmraCompliance);

        let normal = without_stretched
            && (min_m1 || min_e1)
            && (max_m1 || max_e1)
            && (min_m2 || min_e2)
            && (max_m2 || max_e2);
        let stretched = with_stretched
            && (min_m1 || min_e1)
            && (max_st_m1 || max_st_e1)
            && (min_m2 || min_e2)
            && (max_st_m2 || max_st_e2)
            && total_ok;

        if normal || stretched {
            if !min_m1 && min_e1 {
                self.variance1((span.start, span.mid), part1, m.half0_min, "1. half bit too short", "minimum", sink);
            }
            if !min_m2 && min_e2 {
                self.variance1((span.mid, span.end), part2, m.half0_min, "2. half bit too short", "minimum", sink);
            }
            if without_stretched {
                if !max_m1 && max_e1 {
                    self.variance1((span.start, span.mid), part1, m.half0_max, "1. half bit too long", "maximum", sink);
                } else if !max_m2 && max_e2 {
                    self.variance1((span.mid, span.end), part2, m.half0_max, "2. half bit too long", "maximum", sink);
                }
            }
            if with_stretched {
                if !max_st_m1 && max_st_e1 {
                    self.variance1((span.start, span.mid), part1, m.half0_max_stretched, "1. half bit too long", "maximum", sink);
                }
                if !max_st_m2 && max_st_e2 {
                    self.variance1((span.mid, span.end), part2, m.half0_max_stretched, "2. half bit too long", "maximum", sink);
                }
            }
            return true;
        }
        false
    }

    /// Informational: the halves of an accepted 0 bit differ by more than
    /// the 1-bit tolerance. Never rejects the bit.
    pub fn stretched_zero_variance(&self, part1: f64, part2: f64) -> bool {
        (part1 - part2).abs() > self.active.half1_tolerance.max(2.0 * self.accuracy)
    }

    /// True iff `total` fits the RailCom cutout window.
    ///
    /// Only eligible directly after a stop bit (`armed`), never in
    /// compliance modes. The upper bound absorbs up to one merged 1 bit
    /// because the rectified capture loses one edge of the cutout.
    pub fn is_railcom_cutout(&self, total: f64, armed: bool) -> bool {
        let a = self.accuracy;
        !self.mode.is_compliance()
            && armed
            && spec::RAILCOM_CUTOUT_MIN - a <= total
            && total <= spec::RAILCOM_CUTOUT_MAX + 2.0 * (self.active.half1_max + a)
    }

    /// True iff `total` is the single malformed bit the standards permit
    /// directly after a consumed cutout (`armed`)
    pub fn is_broken_one_after_cutout(&self, total: f64, armed: bool) -> bool {
        armed && total <= self.active.half1_max + self.accuracy
    }

    fn variance1(
        &self,
        span: (u64, u64),
        actual: f64,
        bound: f64,
        what: &str,
        bound_name: &str,
        sink: &mut dyn AnnotationSink,
    ) {
        sink.annotate(Annotation::new(
            span.0,
            span.1,
            AnnotationCategory::Variance1,
            [
                format!("{}: actual: {:.2}µs, {}: {:.2}µs", what, actual, bound_name, bound),
                format!("{:.2}µs/{:.2}µs", actual, bound),
            ],
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(mode: TimingMode) -> BitClassifier {
        // 1 MHz capture: accuracy of one microsecond
        BitClassifier::new(mode, TimingMode::RcnDecoding.profile(), false, false, 1.0)
    }

    fn span() -> BitSpan {
        BitSpan::new(0, 58, 116)
    }

    #[test]
    fn test_one_bit_nominal() {
        let c = classifier(TimingMode::NmraDecoding);
        let mut sink = Vec::new();
        assert!(c.is_one(58.0, 58.0, &span(), &mut sink));
        assert!(c.is_one(52.0, 58.0, &span(), &mut sink));
        assert!(c.is_one(64.0, 64.0, &span(), &mut sink));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_one_bit_outside_accuracy() {
        let c = classifier(TimingMode::NmraDecoding);
        let mut sink = Vec::new();
        // within one sample period of the bound: accepted
        assert!(c.is_one(51.0, 56.0, &span(), &mut sink));
        assert!(c.is_one(65.0, 60.0, &span(), &mut sink));
        // more than the accuracy outside: rejected
        assert!(!c.is_one(50.5, 55.0, &span(), &mut sink));
        assert!(!c.is_one(65.5, 61.0, &span(), &mut sink));
    }

    #[test]
    fn test_one_bit_tolerance() {
        let c = classifier(TimingMode::NmraDecoding);
        let mut sink = Vec::new();
        // tolerance is max(6, 2*1) = 6
        assert!(c.is_one(55.0, 61.0, &span(), &mut sink));
        assert!(!c.is_one(52.0, 60.0, &span(), &mut sink));
    }

    #[test]
    fn test_zero_bit_nmra_stretched_always_allowed() {
        let c = classifier(TimingMode::NmraDecoding);
        let mut sink = Vec::new();
        assert!(c.is_zero(100.0, 100.0, &span(), &mut sink));
        assert!(c.is_zero(5000.0, 5000.0, &span(), &mut sink));
        // sum above the stretched total cap
        assert!(!c.is_zero(8000.0, 8000.0, &span(), &mut sink));
        // below the half minimum
        assert!(!c.is_zero(80.0, 100.0, &span(), &mut sink));
    }

    #[test]
    fn test_zero_bit_rcn_stretched_policy() {
        let strict = BitClassifier::new(
            TimingMode::RcnDecoding,
            TimingMode::RcnDecoding.profile(),
            false,
            false,
            1.0,
        );
        let relaxed = BitClassifier::new(
            TimingMode::RcnDecoding,
            TimingMode::RcnDecoding.profile(),
            false,
            true,
            1.0,
        );
        let mut sink = Vec::new();
        // normal zero accepted either way
        assert!(strict.is_zero(100.0, 110.0, &span(), &mut sink));
        assert!(relaxed.is_zero(100.0, 110.0, &span(), &mut sink));
        // half above half0_max (119): only with the stretched policy
        assert!(!strict.is_zero(100.0, 300.0, &span(), &mut sink));
        assert!(relaxed.is_zero(100.0, 300.0, &span(), &mut sink));
    }

    #[test]
    fn test_half_one() {
        let c = classifier(TimingMode::NmraDecoding);
        let mut sink = Vec::new();
        assert!(c.is_half_one(58.0, (0, 58), &mut sink));
        assert!(!c.is_half_one(80.0, (0, 80), &mut sink));
    }

    #[test]
    fn test_compare_mode_emits_variance() {
        // experimental profile wider than the NMRA compliance profile
        let c = BitClassifier::new(
            TimingMode::NmraCompliance,
            TimingMode::NmraDecoding.profile(),
            true,
            false,
            0.5,
        );
        let mut sink = Vec::new();
        // 53 µs: outside compliance (55..61) but inside NMRA decoding (52..64)
        assert!(c.is_one(53.0, 56.0, &span(), &mut sink));
        assert!(sink
            .iter()
            .any(|a| a.category == AnnotationCategory::Variance1));
    }

    #[test]
    fn test_railcom_cutout_window() {
        let c = classifier(TimingMode::NmraDecoding);
        assert!(c.is_railcom_cutout(460.0, true));
        assert!(!c.is_railcom_cutout(460.0, false));
        assert!(!c.is_railcom_cutout(400.0, true));
        // widened upper bound: 488 + 2*(64+1) = 618
        assert!(c.is_railcom_cutout(600.0, true));
        assert!(!c.is_railcom_cutout(640.0, true));
    }

    #[test]
    fn test_cutout_never_in_compliance_mode() {
        let c = classifier(TimingMode::NmraCompliance);
        assert!(!c.is_railcom_cutout(460.0, true));
    }

    #[test]
    fn test_broken_one_after_cutout() {
        let c = classifier(TimingMode::NmraDecoding);
        assert!(c.is_broken_one_after_cutout(60.0, true));
        assert!(!c.is_broken_one_after_cutout(60.0, false));
        assert!(!c.is_broken_one_after_cutout(120.0, true));
    }

    #[test]
    fn test_stretched_zero_variance_is_informational() {
        let c = classifier(TimingMode::NmraDecoding);
        let mut sink = Vec::new();
        assert!(c.is_zero(100.0, 180.0, &span(), &mut sink));
        assert!(c.stretched_zero_variance(100.0, 180.0));
        assert!(!c.stretched_zero_variance(100.0, 104.0));
    }

    #[test]
    fn test_profile_validation() {
        assert!(TimingMode::RcnDecoding.profile().validate().is_ok());
        let bad = TimingProfile::new(64.0, 52.0, 6.0, 90.0, 119.0, 10000.0);
        assert!(bad.validate().is_err());
        let bad = TimingProfile::new(52.0, 64.0, 6.0, 90.0, 119.0, 100.0);
        assert!(bad.validate().is_err());
    }
}
