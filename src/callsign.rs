//! Amateur-radio callsigns: base + SSID, with the two equality notions the rest
//! of the CORE needs (full equality, and "base-only" equality used by the BBS
//! personal-message lookup).

use std::fmt;
use std::str::FromStr;

/// Maximum length of the base callsign (1-6 uppercase alphanumerics).
const MAX_BASE_LEN: usize = 6;

/// A callsign is a 1-6 character alphanumeric base plus an SSID in 0..=15.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Callsign {
    base: String,
    ssid: u8,
}

/// Error returned when a textual callsign cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallsignError {
    Empty,
    BaseTooLong(String),
    NonAlphanumeric(String),
    BadSsid(String),
}

impl fmt::Display for CallsignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallsignError::Empty => write!(f, "empty callsign"),
            CallsignError::BaseTooLong(s) => write!(f, "callsign base too long: {s}"),
            CallsignError::NonAlphanumeric(s) => write!(f, "non-alphanumeric callsign base: {s}"),
            CallsignError::BadSsid(s) => write!(f, "SSID out of range (0-15): {s}"),
        }
    }
}

impl std::error::Error for CallsignError {}

impl Callsign {
    /// Construct a callsign, upper-casing the base and validating the SSID range.
    pub fn new(base: &str, ssid: u8) -> Result<Self, CallsignError> {
        if base.is_empty() {
            return Err(CallsignError::Empty);
        }
        if base.len() > MAX_BASE_LEN {
            return Err(CallsignError::BaseTooLong(base.to_string()));
        }
        if !base.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CallsignError::NonAlphanumeric(base.to_string()));
        }
        if ssid > 15 {
            return Err(CallsignError::BadSsid(ssid.to_string()));
        }
        Ok(Callsign {
            base: base.to_ascii_uppercase(),
            ssid,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// "Base equality" ignoring SSID, used by BBS personal-message lookup so
    /// a message addressed to any SSID of a station is still found.
    pub fn base_eq(&self, other: &Callsign) -> bool {
        self.base == other.base
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.base)
        } else {
            write!(f, "{}-{}", self.base, self.ssid)
        }
    }
}

impl FromStr for Callsign {
    type Err = CallsignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((base, ssid_str)) => {
                let ssid: u8 = ssid_str
                    .parse()
                    .map_err(|_| CallsignError::BadSsid(ssid_str.to_string()))?;
                Callsign::new(base, ssid)
            }
            None => Callsign::new(s, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_base_only() {
        let c: Callsign = "N0CALL".parse().unwrap();
        assert_eq!(c.base(), "N0CALL");
        assert_eq!(c.ssid(), 0);
        assert_eq!(c.to_string(), "N0CALL");
    }

    #[test]
    fn parses_with_ssid() {
        let c: Callsign = "na4wx-7".parse().unwrap();
        assert_eq!(c.base(), "NA4WX");
        assert_eq!(c.ssid(), 7);
        assert_eq!(c.to_string(), "NA4WX-7");
    }

    #[test]
    fn rejects_bad_ssid() {
        assert!("N0CALL-16".parse::<Callsign>().is_err());
    }

    #[test]
    fn rejects_long_base() {
        assert!(Callsign::new("TOOLONGCALL", 0).is_err());
    }

    #[test]
    fn base_equality_ignores_ssid() {
        let a: Callsign = "NA4WX-7".parse().unwrap();
        let b: Callsign = "NA4WX-1".parse().unwrap();
        assert!(a.base_eq(&b));
        assert_ne!(a, b);
    }
}
