//! Exchange segment enumeration
//!
//! The numeric codes appear in binary frame headers; the string forms go
//! into subscription messages. Both directions must match the feed
//! annexure exactly, so the mapping lives in one place.

use serde::{Deserialize, Serialize};

/// Exchange segment as defined by the feed annexure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeSegment {
    #[serde(rename = "IDX_I")]
    IdxI,
    #[serde(rename = "NSE_EQ")]
    NseEq,
    #[serde(rename = "NSE_FNO")]
    NseFno,
    #[serde(rename = "NSE_CURRENCY")]
    NseCurrency,
    #[serde(rename = "BSE_EQ")]
    BseEq,
    #[serde(rename = "MCX_COMM")]
    McxComm,
    #[serde(rename = "BSE_CURRENCY")]
    BseCurrency,
    #[serde(rename = "BSE_FNO")]
    BseFno,
}

impl ExchangeSegment {
    /// Decode the one-byte segment code from a frame header.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::IdxI),
            1 => Some(Self::NseEq),
            2 => Some(Self::NseFno),
            3 => Some(Self::NseCurrency),
            4 => Some(Self::BseEq),
            5 => Some(Self::McxComm),
            7 => Some(Self::BseCurrency),
            8 => Some(Self::BseFno),
            _ => None,
        }
    }

    /// Wire code for the segment.
    pub fn code(self) -> u8 {
        match self {
            Self::IdxI => 0,
            Self::NseEq => 1,
            Self::NseFno => 2,
            Self::NseCurrency => 3,
            Self::BseEq => 4,
            Self::McxComm => 5,
            Self::BseCurrency => 7,
            Self::BseFno => 8,
        }
    }

    /// String form used in subscription messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdxI => "IDX_I",
            Self::NseEq => "NSE_EQ",
            Self::NseFno => "NSE_FNO",
            Self::NseCurrency => "NSE_CURRENCY",
            Self::BseEq => "BSE_EQ",
            Self::McxComm => "MCX_COMM",
            Self::BseCurrency => "BSE_CURRENCY",
            Self::BseFno => "BSE_FNO",
        }
    }

    /// Parse the string form, e.g. from the instrument master.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDX_I" => Some(Self::IdxI),
            "NSE_EQ" => Some(Self::NseEq),
            "NSE_FNO" => Some(Self::NseFno),
            "NSE_CURRENCY" => Some(Self::NseCurrency),
            "BSE_EQ" => Some(Self::BseEq),
            "MCX_COMM" => Some(Self::McxComm),
            "BSE_CURRENCY" => Some(Self::BseCurrency),
            "BSE_FNO" => Some(Self::BseFno),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, ExchangeSegment::IdxI, "IDX_I")]
    #[case(1, ExchangeSegment::NseEq, "NSE_EQ")]
    #[case(2, ExchangeSegment::NseFno, "NSE_FNO")]
    #[case(3, ExchangeSegment::NseCurrency, "NSE_CURRENCY")]
    #[case(4, ExchangeSegment::BseEq, "BSE_EQ")]
    #[case(5, ExchangeSegment::McxComm, "MCX_COMM")]
    #[case(7, ExchangeSegment::BseCurrency, "BSE_CURRENCY")]
    #[case(8, ExchangeSegment::BseFno, "BSE_FNO")]
    fn segment_mapping_matches_annexure(
        #[case] code: u8,
        #[case] segment: ExchangeSegment,
        #[case] name: &str,
    ) {
        assert_eq!(ExchangeSegment::from_code(code), Some(segment));
        assert_eq!(segment.code(), code);
        assert_eq!(segment.as_str(), name);
        assert_eq!(ExchangeSegment::parse(name), Some(segment));
    }

    #[test]
    fn unknown_codes_are_rejected() {
        assert_eq!(ExchangeSegment::from_code(6), None);
        assert_eq!(ExchangeSegment::from_code(9), None);
        assert_eq!(ExchangeSegment::parse("NSE"), None);
    }

    #[test]
    fn serde_uses_wire_strings() {
        let json = serde_json::to_string(&ExchangeSegment::NseFno).unwrap();
        assert_eq!(json, "\"NSE_FNO\"");
        let back: ExchangeSegment = serde_json::from_str("\"BSE_FNO\"").unwrap();
        assert_eq!(back, ExchangeSegment::BseFno);
    }
}
