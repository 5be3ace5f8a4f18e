//! Just enough of the contract ABI to talk to the income, token and referral
//! contracts: address arguments in, `uint256`/`bool` words out.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use thiserror::Error;

pub const WORD_BYTES: usize = 32;

pub type Word = [u8; WORD_BYTES];

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("invalid address `{0}`")]
    InvalidAddress(String),
    #[error("invalid hex payload: {0}")]
    InvalidHex(String),
    #[error("return data of {0} bytes is not word aligned")]
    Misaligned(usize),
    #[error("expected at least {expected} words, got {actual}")]
    MissingWords { expected: usize, actual: usize },
    #[error("word does not fit into 128 bits")]
    Overflow,
    #[error("word is not a boolean")]
    NotBool,
}

/// 20-byte account or contract address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Left-padded topic/argument word.
    pub fn to_word(&self) -> Word {
        let mut word = [0u8; WORD_BYTES];
        word[12..].copy_from_slice(&self.0);
        word
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = AbiError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| AbiError::InvalidAddress(value.to_string()))?;
        if digits.len() != 40 {
            return Err(AbiError::InvalidAddress(value.to_string()));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|_| AbiError::InvalidAddress(value.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// First four bytes of the keccak hash of a canonical function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&digest[..4]);
    selector
}

/// Topic zero of an event with the given canonical signature.
pub fn event_topic(signature: &str) -> Word {
    let digest = Keccak256::digest(signature.as_bytes());
    let mut topic = [0u8; WORD_BYTES];
    topic.copy_from_slice(&digest);
    topic
}

pub fn encode_call(signature: &str, args: &[Address]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + args.len() * WORD_BYTES);
    data.extend_from_slice(&selector(signature));
    for arg in args {
        data.extend_from_slice(&arg.to_word());
    }
    data
}

pub fn decode_words(data: &[u8]) -> Result<Vec<Word>, AbiError> {
    if data.len() % WORD_BYTES != 0 {
        return Err(AbiError::Misaligned(data.len()));
    }
    Ok(data
        .chunks_exact(WORD_BYTES)
        .map(|chunk| {
            let mut word = [0u8; WORD_BYTES];
            word.copy_from_slice(chunk);
            word
        })
        .collect())
}

pub fn expect_words(data: &[u8], expected: usize) -> Result<Vec<Word>, AbiError> {
    let words = decode_words(data)?;
    if words.len() < expected {
        return Err(AbiError::MissingWords {
            expected,
            actual: words.len(),
        });
    }
    Ok(words)
}

pub fn word_to_u128(word: &Word) -> Result<u128, AbiError> {
    if word[..16].iter().any(|byte| *byte != 0) {
        return Err(AbiError::Overflow);
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(low))
}

pub fn word_to_bool(word: &Word) -> Result<bool, AbiError> {
    match word_to_u128(word)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(AbiError::NotBool),
    }
}

pub fn u128_word(value: u128) -> Word {
    let mut word = [0u8; WORD_BYTES];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

pub fn from_hex(value: &str) -> Result<Vec<u8>, AbiError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.len() % 2 == 1 {
        return hex::decode(format!("0{digits}"))
            .map_err(|err| AbiError::InvalidHex(err.to_string()));
    }
    hex::decode(digits).map_err(|err| AbiError::InvalidHex(err.to_string()))
}

pub fn parse_word(value: &str) -> Result<Word, AbiError> {
    let bytes = from_hex(value)?;
    if bytes.len() != WORD_BYTES {
        return Err(AbiError::InvalidHex(format!(
            "expected {WORD_BYTES} bytes, got {}",
            bytes.len()
        )));
    }
    let mut word = [0u8; WORD_BYTES];
    word.copy_from_slice(&bytes);
    Ok(word)
}

/// Parses a hex quantity such as a block number (`0x1b4`).
pub fn parse_quantity(value: &str) -> Result<u64, AbiError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.is_empty() {
        return Err(AbiError::InvalidHex(value.to_string()));
    }
    u64::from_str_radix(digits, 16).map_err(|err| AbiError::InvalidHex(err.to_string()))
}

pub fn quantity(value: u64) -> String {
    format!("0x{value:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_match_known_values() {
        assert_eq!(selector("balanceOf(address)"), [0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(
            hex::encode(event_topic("Transfer(address,address,uint256)")),
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn address_roundtrips_through_text_and_words() {
        let address: Address = "0xEdE54d9c024ee80C85ec0a75eD2d8774c7Fbac9B"
            .parse()
            .expect("address");
        assert_eq!(
            address.to_string(),
            "0xede54d9c024ee80c85ec0a75ed2d8774c7fbac9b"
        );
        let word = address.to_word();
        assert!(word[..12].iter().all(|byte| *byte == 0));
        assert_eq!(&word[12..], address.as_bytes());
        assert!("ede54d9c024ee80c85ec0a75ed2d8774c7fbac9b"
            .parse::<Address>()
            .is_err());
        assert!("0x1234".parse::<Address>().is_err());
    }

    #[test]
    fn encode_call_appends_padded_arguments() {
        let owner: Address = "0x00000000000000000000000000000000000000ff"
            .parse()
            .expect("address");
        let data = encode_call("balanceOf(address)", &[owner]);
        assert_eq!(data.len(), 36);
        assert_eq!(&data[..4], &[0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(data[35], 0xff);
    }

    #[test]
    fn word_decoding_rejects_overflow_and_bad_bools() {
        let mut word = u128_word(42);
        assert_eq!(word_to_u128(&word), Ok(42));
        word[0] = 1;
        assert_eq!(word_to_u128(&word), Err(AbiError::Overflow));
        assert_eq!(word_to_bool(&u128_word(1)), Ok(true));
        assert_eq!(word_to_bool(&u128_word(2)), Err(AbiError::NotBool));
        assert_eq!(decode_words(&[0u8; 33]), Err(AbiError::Misaligned(33)));
        assert_eq!(
            expect_words(&[0u8; 32], 2),
            Err(AbiError::MissingWords {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn quantities_parse_hex() {
        assert_eq!(parse_quantity("0x1b4"), Ok(436));
        assert_eq!(quantity(436), "0x1b4");
        assert!(parse_quantity("0x").is_err());
        assert_eq!(from_hex("0x0"), Ok(vec![0]));
    }
}
