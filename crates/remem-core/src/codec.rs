//! Reversible text ↔ token codec.
//!
//! Text is base-64 encoded (standard alphabet, padding stripped) and every
//! pair of base-64 characters is packed into one 12-bit token
//! `(i1 << 6) | i2`. When the stripped base-64 string has odd length the
//! last character is dropped and never reconstructed, so `"Hi"` comes back
//! as `"H"`. That boundary is part of the format.

use std::fmt;

use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};

use crate::constants::MAX_TOKEN;

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Decoding engine tolerant of non-zero trailing bits, which the dropped
/// character of an odd-length encoding leaves behind.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug)]
pub enum DecodeError {
    /// Tokens must be clamped by the caller; the codec rejects anything above 4095.
    TokenOutOfRange { index: usize, token: u16 },
    Base64(base64::DecodeError),
    Utf8(std::string::FromUtf8Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TokenOutOfRange { index, token } => {
                write!(f, "token {token} at index {index} exceeds {MAX_TOKEN}")
            }
            DecodeError::Base64(e) => write!(f, "invalid base-64: {e}"),
            DecodeError::Utf8(e) => write!(f, "invalid UTF-8: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::TokenOutOfRange { .. } => None,
            DecodeError::Base64(e) => Some(e),
            DecodeError::Utf8(e) => Some(e),
        }
    }
}

impl From<base64::DecodeError> for DecodeError {
    fn from(e: base64::DecodeError) -> Self {
        DecodeError::Base64(e)
    }
}

impl From<std::string::FromUtf8Error> for DecodeError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        DecodeError::Utf8(e)
    }
}

fn alphabet_index(c: u8) -> Option<u16> {
    let i = match c {
        b'A'..=b'Z' => c - b'A',
        b'a'..=b'z' => c - b'a' + 26,
        b'0'..=b'9' => c - b'0' + 52,
        b'+' => 62,
        b'/' => 63,
        _ => return None,
    };
    Some(i as u16)
}

/// Lazy token stream over a text. Cloning restarts from the clone point.
#[derive(Clone, Debug)]
pub struct TokenIter {
    encoded: Vec<u8>,
    pos: usize,
}

impl TokenIter {
    pub fn new(text: &str) -> Self {
        Self {
            encoded: STANDARD_NO_PAD.encode(text.as_bytes()).into_bytes(),
            pos: 0,
        }
    }
}

impl Iterator for TokenIter {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        // A lone trailing character has no partner and is dropped.
        let pair = self.encoded.get(self.pos..self.pos + 2)?;
        let hi = alphabet_index(pair[0])?;
        let lo = alphabet_index(pair[1])?;
        self.pos += 2;
        Some((hi << 6) | lo)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.encoded.len().saturating_sub(self.pos) / 2;
        (n, Some(n))
    }
}

impl ExactSizeIterator for TokenIter {}

/// Encode text into 12-bit tokens.
pub fn encode(text: &str) -> Vec<u16> {
    TokenIter::new(text).collect()
}

/// Decode tokens back into text.
pub fn decode(tokens: &[u16]) -> Result<String, DecodeError> {
    let mut b64 = String::with_capacity(tokens.len() * 2 + 2);
    for (index, &token) in tokens.iter().enumerate() {
        if token > MAX_TOKEN {
            return Err(DecodeError::TokenOutOfRange { index, token });
        }
        b64.push(ALPHABET[(token >> 6) as usize] as char);
        b64.push(ALPHABET[(token & 0x3f) as usize] as char);
    }

    let pad = (4 - b64.len() % 4) % 4;
    b64.extend(std::iter::repeat_n('=', pad));

    let bytes = LENIENT.decode(b64.as_bytes())?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stripped_len(text: &str) -> usize {
        STANDARD_NO_PAD.encode(text.as_bytes()).len()
    }

    #[test]
    fn test_hi_packs_single_token() {
        // "SGk=" → "SGk" → pair "SG", 'k' dropped
        assert_eq!(encode("Hi"), vec![1158]);
        assert_eq!(1158, (18 << 6) | 6);
    }

    #[test]
    fn test_hi_decodes_to_h() {
        assert_eq!(decode(&[1158]).unwrap(), "H");
    }

    #[test]
    fn test_empty_text() {
        assert!(encode("").is_empty());
        assert_eq!(decode(&[]).unwrap(), "");
    }

    #[test]
    fn test_even_length_roundtrip() {
        // "Hello!" is 6 bytes → 8 base-64 chars, no padding
        let text = "Hello!";
        assert_eq!(stripped_len(text), 8);
        let tokens = encode(text);
        assert_eq!(tokens.len(), 4);
        assert_eq!(decode(&tokens).unwrap(), text);
    }

    #[test]
    fn test_multibyte_roundtrip() {
        let text = "Привет, мир";
        if stripped_len(text) % 2 == 0 {
            assert_eq!(decode(&encode(text)).unwrap(), text);
        }
        let text = "été";
        assert_eq!(stripped_len(text), 7);
        assert_eq!(encode(text).len(), 3);
    }

    #[test]
    fn test_token_count_is_half_stripped_length() {
        for text in ["a", "ab", "abc", "abcd", "hello world", "ünïcødé"] {
            assert_eq!(encode(text).len(), stripped_len(text) / 2, "{text}");
        }
    }

    #[test]
    fn test_iter_is_restartable() {
        let iter = TokenIter::new("restartable sequence");
        let first: Vec<u16> = iter.clone().collect();
        let second: Vec<u16> = iter.collect();
        assert_eq!(first, second);
        assert_eq!(first, encode("restartable sequence"));
    }

    #[test]
    fn test_iter_exact_size() {
        let iter = TokenIter::new("hello world");
        assert_eq!(iter.len(), encode("hello world").len());
    }

    #[test]
    fn test_out_of_range_token_rejected() {
        let err = decode(&[1158, 4096]).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::TokenOutOfRange {
                index: 1,
                token: 4096
            }
        ));
    }

    #[test]
    fn test_invalid_utf8_reported() {
        // "/w" → 0xFF, a lone continuation-range byte
        let token = (63 << 6) | 48;
        let err = decode(&[token]).unwrap_err();
        assert!(matches!(err, DecodeError::Utf8(_)), "got {err}");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_max_token_decodes_without_panic() {
        // "//" → 0xFF: invalid UTF-8 but a well-formed base-64 pair
        assert!(decode(&[MAX_TOKEN]).is_err());
    }

    proptest! {
        #[test]
        fn prop_tokens_in_range(text in ".*") {
            for token in encode(&text) {
                prop_assert!(token <= MAX_TOKEN);
            }
        }

        #[test]
        fn prop_roundtrip_when_even(text in ".*") {
            prop_assume!(stripped_len(&text) % 2 == 0);
            prop_assert_eq!(decode(&encode(&text)).unwrap(), text);
        }

        #[test]
        fn prop_encode_deterministic(text in ".*") {
            prop_assert_eq!(encode(&text), encode(&text));
        }
    }
}
