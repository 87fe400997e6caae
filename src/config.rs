//! Decoder configuration and search criteria
//!
//! Option parsing lives in whatever front end drives the decoder; this
//! module is the typed configuration it is validated into. Values that can
//! be supplied out of range (search criteria, experimental bounds) are kept
//! rather than rejected, because the decoder reports them as Error
//! annotations on the timeline instead of refusing to run.

use crate::error::{DecodeError, Result};
use crate::spec;
use crate::timing::{TimingMode, TimingProfile};

/// Basic speed instruction interpretation, selected by CV#29 bit 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SpeedSteps {
    /// 14 speed steps (CV#29 bit 1 = 0)
    Mode14,
    /// 28 or 128 speed steps (CV#29 bit 1 = 1)
    #[default]
    Mode28To128,
}

/// One search criterion: absent, valid, or supplied but unusable.
///
/// `Invalid` is carried instead of rejected so the decoder can flag it on
/// the timeline where the user is already looking.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SearchValue<T> {
    /// Criterion not supplied
    #[default]
    Unset,
    /// Criterion supplied and in range
    Set(T),
    /// Criterion supplied but unparseable or out of range
    Invalid,
}

impl<T> SearchValue<T> {
    /// The value, if set
    pub fn get(&self) -> Option<&T> {
        match self {
            SearchValue::Set(v) => Some(v),
            _ => None,
        }
    }

    /// True if a valid value is present
    pub fn is_set(&self) -> bool {
        matches!(self, SearchValue::Set(_))
    }

    /// True if a value was supplied but rejected
    pub fn is_invalid(&self) -> bool {
        matches!(self, SearchValue::Invalid)
    }
}

impl<T: PartialEq> SearchValue<T> {
    /// True iff the criterion is set and equals `value`
    pub fn matches(&self, value: &T) -> bool {
        matches!(self, SearchValue::Set(v) if v == value)
    }
}

/// User-supplied search criteria, each independent
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SearchCriteria {
    /// Accessory address, 1-2048
    pub accessory_address: SearchValue<u16>,
    /// Multi-function decoder address, 0-10239
    pub decoder_address: SearchValue<u16>,
    /// Configuration variable number, 1-16777216
    pub cv: SearchValue<u32>,
    /// Raw byte value
    pub byte: SearchValue<u8>,
    /// Case-insensitive command text fragment
    pub command: SearchValue<String>,
}

impl SearchCriteria {
    /// No criteria set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the accessory address criterion, validating its range
    pub fn set_accessory_address(&mut self, addr: u16) -> Result<()> {
        if !(1..=2048).contains(&addr) {
            return Err(DecodeError::invalid_address(format!(
                "Accessory address {} out of range [1, 2048]",
                addr
            )));
        }
        self.accessory_address = SearchValue::Set(addr);
        Ok(())
    }

    /// Set the decoder address criterion, validating its range
    pub fn set_decoder_address(&mut self, addr: u16) -> Result<()> {
        if addr > 10239 {
            return Err(DecodeError::invalid_address(format!(
                "Decoder address {} out of range [0, 10239]",
                addr
            )));
        }
        self.decoder_address = SearchValue::Set(addr);
        Ok(())
    }

    /// Set the CV criterion, validating its range
    pub fn set_cv(&mut self, cv: u32) -> Result<()> {
        if !(1..=16_777_216).contains(&cv) {
            return Err(DecodeError::invalid_address(format!(
                "CV {} out of range [1, 16777216]",
                cv
            )));
        }
        self.cv = SearchValue::Set(cv);
        Ok(())
    }

    /// Set the byte criterion
    pub fn set_byte(&mut self, value: u8) {
        self.byte = SearchValue::Set(value);
    }

    /// Set the command text criterion; an empty string unsets it
    pub fn set_command(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.command = if text.is_empty() {
            SearchValue::Unset
        } else {
            SearchValue::Set(text)
        };
    }

    /// Parse a textual accessory address ("" means unset)
    pub fn parse_accessory_address(input: &str) -> SearchValue<u16> {
        parse_ranged(input, 1, 2048).map_or(SearchValue::Invalid, |v| match v {
            Some(v) => SearchValue::Set(v as u16),
            None => SearchValue::Unset,
        })
    }

    /// Parse a textual decoder address ("" means unset)
    pub fn parse_decoder_address(input: &str) -> SearchValue<u16> {
        parse_ranged(input, 0, 10239).map_or(SearchValue::Invalid, |v| match v {
            Some(v) => SearchValue::Set(v as u16),
            None => SearchValue::Unset,
        })
    }

    /// Parse a textual CV number ("" means unset)
    pub fn parse_cv(input: &str) -> SearchValue<u32> {
        parse_ranged(input, 1, 16_777_216).map_or(SearchValue::Invalid, |v| match v {
            Some(v) => SearchValue::Set(v as u32),
            None => SearchValue::Unset,
        })
    }

    /// Parse a textual byte value in decimal, binary ("0b...") or
    /// hexadecimal ("0x...") form ("" means unset)
    pub fn parse_byte(input: &str) -> SearchValue<u8> {
        let input = input.trim();
        if input.is_empty() {
            return SearchValue::Unset;
        }
        let parsed = if let Some(bin) = input.strip_prefix("0b") {
            u32::from_str_radix(bin, 2).ok()
        } else if let Some(hex) = input.strip_prefix("0x") {
            u32::from_str_radix(hex, 16).ok()
        } else {
            input.parse::<u32>().ok()
        };
        match parsed {
            Some(v) if v <= 255 => SearchValue::Set(v as u8),
            _ => SearchValue::Invalid,
        }
    }

    /// True if any criterion is set
    pub fn any_set(&self) -> bool {
        self.accessory_address.is_set()
            || self.decoder_address.is_set()
            || self.cv.is_set()
            || self.byte.is_set()
            || self.command.is_set()
    }
}

/// "" -> Ok(None), in-range -> Ok(Some(v)), anything else -> Err
fn parse_ranged(input: &str, min: u32, max: u32) -> std::result::Result<Option<u32>, ()> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }
    match input.parse::<u32>() {
        Ok(v) if (min..=max).contains(&v) => Ok(Some(v)),
        _ => Err(()),
    }
}

/// Complete decoder configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DecoderConfig {
    /// Active timing mode
    pub timing_mode: TimingMode,
    /// Accept stretched 0 bits in the RCN and experimental modes
    pub allow_stretched_zero: bool,
    /// Minimum preamble length in compliance modes (decode modes always
    /// use 10)
    pub compliance_preamble_bits: u32,
    /// Merge electrical pulses at or below the interfering-pulse threshold
    pub ignore_short_pulse: bool,
    /// CV#29 bit 1 speed interpretation
    pub speed_steps: SpeedSteps,
    /// Interpret addresses 112-127 as service mode packets
    pub service_mode: bool,
    /// Offset added to decoded accessory addresses
    pub accessory_offset: i32,
    /// User-editable experimental profile
    pub experimental: TimingProfile,
    /// Evaluate every bound against the experimental profile as well,
    /// reporting disagreements as Variance annotations
    pub compare_experimental: bool,
    /// Accuracy override in µs for experimental mode; derived from the
    /// sample rate when unset
    pub experimental_accuracy: Option<f64>,
    /// Search criteria
    pub search: SearchCriteria,
}

impl DecoderConfig {
    /// Configuration with defaults for the given timing mode
    pub fn new(timing_mode: TimingMode) -> Self {
        DecoderConfig {
            timing_mode,
            allow_stretched_zero: false,
            compliance_preamble_bits: 17,
            ignore_short_pulse: false,
            speed_steps: SpeedSteps::default(),
            service_mode: false,
            accessory_offset: 0,
            experimental: TimingProfile::new(52.0, 64.0, 6.0, 90.0, 119.0, 10000.0),
            compare_experimental: false,
            experimental_accuracy: None,
            search: SearchCriteria::new(),
        }
    }

    /// Minimum number of preamble bits for the active mode
    pub fn min_preamble_bits(&self) -> u32 {
        if self.timing_mode.is_compliance() {
            self.compliance_preamble_bits
        } else {
            spec::MIN_PREAMBLE_BITS
        }
    }

    /// Timing mode after checking the sample-rate requirement of the
    /// compliance modes
    pub fn effective_mode(&self, sample_rate: f64) -> TimingMode {
        if self.timing_mode.is_compliance() && sample_rate < spec::COMPLIANCE_SAMPLE_RATE_MIN {
            TimingMode::Invalid
        } else {
            self.timing_mode
        }
    }

    /// Measurement tolerance in µs for the given sample rate
    pub fn accuracy(&self, sample_rate: f64) -> f64 {
        match (self.timing_mode, self.experimental_accuracy) {
            (TimingMode::Experimental, Some(acc)) if acc >= 0.0 => acc,
            _ => 1.0 / sample_rate * 1_000_000.0,
        }
    }

    /// Non-fatal configuration problems, reported as Error annotations over
    /// lookahead windows while decoding is suspended
    pub fn issues(&self, sample_rate: f64) -> Vec<String> {
        let mut issues = Vec::new();
        if sample_rate < spec::SAMPLE_RATE_MIN {
            issues.push("Samplerate must be >= 25kHz".to_string());
        }
        if self.effective_mode(sample_rate) == TimingMode::Invalid {
            issues.push(
                "Samplerate too inaccurate for compliance testing: Please use at least 2MHz"
                    .to_string(),
            );
        }
        if self.search.accessory_address.is_invalid() {
            issues.push("Search: accessory address invalid (use 1-2048)".to_string());
        }
        if self.search.decoder_address.is_invalid() {
            issues.push("Search: decoder address invalid (use 0-10239)".to_string());
        }
        if self.search.cv.is_invalid() {
            issues.push("Search: CV address invalid (use 1-16777216)".to_string());
        }
        if self.search.byte.is_invalid() {
            issues.push(
                "Search: invalid byte value (use 0-255 or 0b00000000-0b11111111 or 0x00-0xff)"
                    .to_string(),
            );
        }
        if self.timing_mode.is_compliance()
            && self.compliance_preamble_bits < spec::MIN_PREAMBLE_BITS
        {
            issues
                .push("\"compliance mode: min. preamble bits\" must be greater than 9".to_string());
        }
        if self.timing_mode == TimingMode::Experimental || self.compare_experimental {
            if let Err(err) = self.experimental.validate() {
                issues.push(format!("Exp: {}", err));
            }
        }
        issues
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self::new(TimingMode::NmraDecoding)
    }
}
