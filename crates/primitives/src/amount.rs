//! Exact conversions between integer base units and decimal strings.
//!
//! Nothing here goes through binary floating point. Inputs with more precision than the unit
//! supports are rejected instead of rounded.

use bitcoin::{Amount, Denomination};

use crate::errors::AmountError;

/// Number of fractional digits carried by a [`Percentage`].
pub const PERCENTAGE_DECIMALS: u32 = 6;

/// Parses a decimal BTC string into an exact satoshi [`Amount`].
///
/// `"0.000000001"` and negative values are errors.
pub fn btc_to_sat(btc: &str) -> Result<Amount, AmountError> {
    Ok(Amount::from_str_in(btc.trim(), Denomination::Bitcoin)?)
}

/// Formats a satoshi [`Amount`] as a decimal BTC string without a unit suffix.
pub fn sat_to_btc(amount: Amount) -> String {
    amount.to_string_in(Denomination::Bitcoin)
}

/// Parses a non-negative decimal string into base units with `decimals` fractional digits.
pub fn parse_decimal(value: &str, decimals: u32) -> Result<u128, AmountError> {
    let malformed = || AmountError::Malformed(value.to_owned());
    let (int_part, frac_part) = match value.split_once('.') {
        Some((i, f)) => (i, f),
        None => (value, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(malformed());
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }

    let frac_trimmed = frac_part.trim_end_matches('0');
    if frac_trimmed.len() > decimals as usize {
        return Err(AmountError::TooPrecise {
            value: value.to_owned(),
            max: decimals,
        });
    }

    let scale = pow10(decimals)?;
    let int_value = if int_part.is_empty() {
        0
    } else {
        int_part.parse::<u128>().map_err(|_| AmountError::Overflow)?
    };
    let frac_value = if frac_trimmed.is_empty() {
        0
    } else {
        let digits = frac_trimmed.parse::<u128>().map_err(|_| malformed())?;
        digits * pow10(decimals - frac_trimmed.len() as u32)?
    };

    int_value
        .checked_mul(scale)
        .and_then(|v| v.checked_add(frac_value))
        .ok_or(AmountError::Overflow)
}

/// Formats base units as a decimal string with `decimals` fractional digits, trailing zeros
/// trimmed.
pub fn format_decimal(raw: u128, decimals: u32) -> String {
    let Ok(scale) = pow10(decimals) else {
        return raw.to_string();
    };
    let int_part = raw / scale;
    let frac_part = raw % scale;
    if frac_part == 0 {
        return int_part.to_string();
    }
    let frac = format!("{frac_part:0width$}", width = decimals as usize);
    format!("{int_part}.{}", frac.trim_end_matches('0'))
}

fn pow10(exp: u32) -> Result<u128, AmountError> {
    10u128.checked_pow(exp).ok_or(AmountError::Overflow)
}

/// A fee percentage such as `0.4` (meaning 0.4%), stored exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Percentage(u128);

impl Percentage {
    /// Parses a decimal percentage string. At most [`PERCENTAGE_DECIMALS`] fractional digits.
    pub fn parse(value: &str) -> Result<Self, AmountError> {
        let scaled = parse_decimal(value, PERCENTAGE_DECIMALS)?;
        if scaled > 100 * pow10(PERCENTAGE_DECIMALS)? {
            return Err(AmountError::Malformed(value.to_owned()));
        }
        Ok(Self(scaled))
    }

    /// Splits `raw` into `(net, fee)` where `fee` is this percentage of `raw` rounded up, so that
    /// the net amount never exceeds the exact result.
    pub fn split(&self, raw: u128) -> Result<(u128, u128), AmountError> {
        let denom = 100 * pow10(PERCENTAGE_DECIMALS)?;
        let numer = raw.checked_mul(self.0).ok_or(AmountError::Overflow)?;
        let fee = numer.div_ceil(denom);
        Ok((raw - fee, fee))
    }
}

impl std::fmt::Display for Percentage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", format_decimal(self.0, PERCENTAGE_DECIMALS))
    }
}

impl std::str::FromStr for Percentage {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> serde::Deserialize<'de> for Percentage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl serde::Serialize for Percentage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format_decimal(self.0, PERCENTAGE_DECIMALS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sat_btc_round_trip_is_exact() {
        for sat in [0, 1, 99, 100_000_000, 2_100_000_000_000_000, 123_456_789] {
            let amount = Amount::from_sat(sat);
            assert_eq!(btc_to_sat(&sat_to_btc(amount)).unwrap(), amount);
        }
    }

    #[test]
    fn excess_btc_precision_is_rejected() {
        assert!(btc_to_sat("0.000000001").is_err());
        assert!(btc_to_sat("1.123456789").is_err());
        assert!(btc_to_sat("-1").is_err());
        assert_eq!(btc_to_sat("0.00000001").unwrap(), Amount::from_sat(1));
    }

    #[test]
    fn decimal_parsing() {
        assert_eq!(parse_decimal("1.5", 2).unwrap(), 150);
        assert_eq!(parse_decimal("1.50", 1).unwrap(), 15);
        assert_eq!(parse_decimal(".5", 1).unwrap(), 5);
        assert_eq!(parse_decimal("7", 0).unwrap(), 7);
        assert!(matches!(
            parse_decimal("1.05", 1),
            Err(AmountError::TooPrecise { .. })
        ));
        assert!(parse_decimal("1e5", 2).is_err());
        assert!(parse_decimal("", 2).is_err());
        assert!(parse_decimal("-3", 2).is_err());
    }

    #[test]
    fn decimal_formatting() {
        assert_eq!(format_decimal(150, 2), "1.5");
        assert_eq!(format_decimal(100, 2), "1");
        assert_eq!(format_decimal(5, 3), "0.005");
        assert_eq!(format_decimal(5, 0), "5");
    }

    #[test]
    fn percentage_split_rounds_fee_up() {
        let pct = Percentage::parse("0.4").unwrap();
        assert_eq!(pct.split(1000).unwrap(), (996, 4));
        // 0.4% of 1001 is 4.004
        assert_eq!(pct.split(1001).unwrap(), (996, 5));

        let zero = Percentage::parse("0").unwrap();
        assert_eq!(zero.split(1234).unwrap(), (1234, 0));

        assert!(Percentage::parse("100.5").is_err());
        assert_eq!(pct.to_string(), "0.4%");
    }
}
