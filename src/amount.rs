use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Number of decimals used by the governance token and the income programs.
pub const TOKEN_DECIMALS: u32 = 18;
/// One whole token expressed in its smallest unit.
pub const WEI_PER_TOKEN: u128 = 1_000_000_000_000_000_000;

/// Token quantity stored in the 18-decimal fixed-point unit used on chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(u128);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("empty amount")]
    Empty,
    #[error("invalid amount `{0}`")]
    Invalid(String),
    #[error("amount `{0}` overflows 128 bits")]
    Overflow(String),
}

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(0);

    pub const fn from_wei(wei: u128) -> Self {
        Self(wei)
    }

    pub fn from_tokens(tokens: u64) -> Self {
        Self(tokens as u128 * WEI_PER_TOKEN)
    }

    pub const fn wei(self) -> u128 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_add(self, other: TokenAmount) -> TokenAmount {
        TokenAmount(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: TokenAmount) -> TokenAmount {
        TokenAmount(self.0.saturating_sub(other.0))
    }

    pub fn abs_diff(self, other: TokenAmount) -> TokenAmount {
        TokenAmount(self.0.abs_diff(other.0))
    }

    /// Whole-token part of the amount.
    pub fn whole(self) -> u128 {
        self.0 / WEI_PER_TOKEN
    }

    /// Fractional part of the amount, in wei.
    pub fn fraction(self) -> u128 {
        self.0 % WEI_PER_TOKEN
    }

    /// Lossy conversion for display code that wants a float.
    pub fn as_f64(self) -> f64 {
        self.whole() as f64 + self.fraction() as f64 / WEI_PER_TOKEN as f64
    }

    /// Renders the amount with exactly `decimals` fractional digits, rounding
    /// half up on the first dropped digit.
    pub fn format_fixed(self, decimals: u32) -> String {
        let decimals = decimals.min(TOKEN_DECIMALS);
        let scale = 10u128.pow(TOKEN_DECIMALS - decimals);
        let mut scaled = self.0 / scale;
        if self.0 % scale >= scale / 2 && scale > 1 {
            scaled += 1;
        }
        let unit = 10u128.pow(decimals);
        let whole = scaled / unit;
        if decimals == 0 {
            return whole.to_string();
        }
        let fraction = scaled % unit;
        format!("{whole}.{fraction:0width$}", width = decimals as usize)
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.whole();
        let fraction = self.fraction();
        if fraction == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{fraction:018}");
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl FromStr for TokenAmount {
    type Err = AmountError;

    /// Parses a plain decimal string. Digits beyond the 18th decimal are
    /// truncated, which keeps older float-formatted values readable.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(AmountError::Empty);
        }
        let (whole, fraction) = match trimmed.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (trimmed, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(AmountError::Invalid(value.to_string()));
        }
        let is_digits = |part: &str| part.bytes().all(|byte| byte.is_ascii_digit());
        if !is_digits(whole) || !is_digits(fraction) {
            return Err(AmountError::Invalid(value.to_string()));
        }

        let whole_wei = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<u128>()
                .ok()
                .and_then(|whole| whole.checked_mul(WEI_PER_TOKEN))
                .ok_or_else(|| AmountError::Overflow(value.to_string()))?
        };

        let kept = &fraction[..fraction.len().min(TOKEN_DECIMALS as usize)];
        let fraction_wei = if kept.is_empty() {
            0
        } else {
            let padded = format!("{kept:0<18}");
            padded
                .parse::<u128>()
                .map_err(|_| AmountError::Invalid(value.to_string()))?
        };

        whole_wei
            .checked_add(fraction_wei)
            .map(TokenAmount)
            .ok_or_else(|| AmountError::Overflow(value.to_string()))
    }
}

impl Serialize for TokenAmount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn display_trims_trailing_zeros() {
        assert_eq!(TokenAmount::from_tokens(10).to_string(), "10");
        assert_eq!(TokenAmount::from_wei(WEI_PER_TOKEN / 2).to_string(), "0.5");
        assert_eq!(TokenAmount::from_wei(1).to_string(), "0.000000000000000001");
        assert_eq!(TokenAmount::ZERO.to_string(), "0");
    }

    #[test]
    fn parse_accepts_plain_decimals() {
        assert_eq!("10".parse::<TokenAmount>(), Ok(TokenAmount::from_tokens(10)));
        assert_eq!(
            "9.5".parse::<TokenAmount>(),
            Ok(TokenAmount::from_wei(9 * WEI_PER_TOKEN + WEI_PER_TOKEN / 2))
        );
        assert_eq!(
            ".25".parse::<TokenAmount>(),
            Ok(TokenAmount::from_wei(WEI_PER_TOKEN / 4))
        );
    }

    #[test]
    fn parse_truncates_excess_precision() {
        let parsed: TokenAmount = "1.0001157407407407407".parse().expect("parse");
        assert_eq!(parsed.wei(), 1_000_115_740_740_740_740);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!("".parse::<TokenAmount>(), Err(AmountError::Empty));
        assert!(matches!(
            "-1".parse::<TokenAmount>(),
            Err(AmountError::Invalid(_))
        ));
        assert!(matches!(
            "1e-7".parse::<TokenAmount>(),
            Err(AmountError::Invalid(_))
        ));
        assert!(matches!(".".parse::<TokenAmount>(), Err(AmountError::Invalid(_))));
    }

    #[test]
    fn format_fixed_rounds_half_up() {
        let amount: TokenAmount = "9.000115740740740740".parse().expect("parse");
        assert_eq!(amount.format_fixed(5), "9.00012");
        assert_eq!(amount.format_fixed(0), "9");
        assert_eq!(TokenAmount::ZERO.format_fixed(5), "0.00000");
        let amount: TokenAmount = "0.999999".parse().expect("parse");
        assert_eq!(amount.format_fixed(5), "1.00000");
    }

    #[test]
    fn display_and_parse_agree() {
        let amount = TokenAmount::from_wei(123_456_789_000_000_000_001);
        let parsed: TokenAmount = amount.to_string().parse().expect("parse");
        assert_eq!(parsed, amount);
    }

    proptest! {
        #[test]
        fn any_amount_survives_display_then_parse(wei in any::<u128>()) {
            let amount = TokenAmount::from_wei(wei);
            let parsed: TokenAmount = amount.to_string().parse().expect("parse");
            prop_assert_eq!(parsed, amount);
        }

        #[test]
        fn parse_keeps_the_first_eighteen_decimals(
            whole in 0u64..1_000_000,
            fraction in "[0-9]{1,30}",
        ) {
            let parsed: TokenAmount = format!("{whole}.{fraction}").parse().expect("parse");
            let kept = &fraction[..fraction.len().min(18)];
            let expected = whole as u128 * WEI_PER_TOKEN + format!("{kept:0<18}").parse::<u128>().expect("digits");
            prop_assert_eq!(parsed.wei(), expected);
        }
    }
}
