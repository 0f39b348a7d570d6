//! Hex codec for topic and identity strings
//!
//! Accepts human-typed input: an optional `0x`/`0X` prefix and any
//! whitespace or newlines are tolerated. Output is always lowercase with
//! no prefix.
//!
//! ```
//! use rumor_core::hex;
//!
//! assert_eq!(hex::decode("0x01af").unwrap(), vec![0x01, 0xaf]);
//! assert_eq!(hex::encode([0x01, 0xaf]), "01af");
//! ```

use crate::error::DecodeError;

/// Decode a hex string into bytes.
///
/// # Errors
///
/// - [`DecodeError::OddLength`] if the cleaned string has an odd number of characters
/// - [`DecodeError::InvalidDigit`] if a non-hex character remains after cleaning
pub fn decode(input: &str) -> Result<Vec<u8>, DecodeError> {
    let cleaned = clean(input);

    let len = cleaned.chars().count();
    if len % 2 != 0 {
        return Err(DecodeError::OddLength { len });
    }

    if let Some((index, ch)) = cleaned.chars().enumerate().find(|(_, c)| !c.is_ascii_hexdigit()) {
        return Err(DecodeError::InvalidDigit { ch, index });
    }

    // Every character is an ASCII hex digit at this point, so the crate
    // decoder only sees input it accepts.
    ::hex::decode(&cleaned).map_err(|e| match e {
        ::hex::FromHexError::InvalidHexCharacter { c, index } => {
            DecodeError::InvalidDigit { ch: c, index }
        }
        _ => DecodeError::OddLength { len },
    })
}

/// Decode a hex string into a fixed-size array.
///
/// # Errors
///
/// Same as [`decode`], plus [`DecodeError::InvalidLength`] when the decoded
/// byte count is not `N`.
pub fn decode_fixed<const N: usize>(input: &str) -> Result<[u8; N], DecodeError> {
    let bytes = decode(input)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| DecodeError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        })
}

/// Encode bytes as lowercase hex without prefix.
pub fn encode(bytes: impl AsRef<[u8]>) -> String {
    ::hex::encode(bytes)
}

fn clean(input: &str) -> String {
    let trimmed = input.trim_start();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    body.chars().filter(|c| !c.is_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_with_prefix() {
        assert_eq!(decode("0x01af").unwrap(), vec![0x01, 0xaf]);
        assert_eq!(decode("0X01AF").unwrap(), vec![0x01, 0xaf]);
    }

    #[test]
    fn test_decode_strips_whitespace() {
        assert_eq!(decode("01 AF\n").unwrap(), vec![0x01, 0xaf]);
        assert_eq!(decode("  0x 01\taf ").unwrap(), vec![0x01, 0xaf]);
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(decode("").unwrap(), Vec::<u8>::new());
        assert_eq!(decode("0x").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_decode_odd_length() {
        assert_eq!(decode("01a"), Err(DecodeError::OddLength { len: 3 }));
    }

    #[test]
    fn test_decode_invalid_digit() {
        assert_eq!(
            decode("01ag"),
            Err(DecodeError::InvalidDigit { ch: 'g', index: 3 })
        );
    }

    #[test]
    fn test_decode_odd_length_checked_first() {
        // Both odd and invalid: length wins
        assert!(matches!(decode("zzz"), Err(DecodeError::OddLength { .. })));
    }

    #[test]
    fn test_decode_non_ascii() {
        assert!(matches!(
            decode("0é"),
            Err(DecodeError::InvalidDigit { ch: 'é', index: 1 })
        ));
    }

    #[test]
    fn test_only_leading_prefix_is_stripped() {
        assert!(matches!(
            decode("010x"),
            Err(DecodeError::InvalidDigit { ch: 'x', .. })
        ));
    }

    #[test]
    fn test_decode_fixed() {
        let bytes: [u8; 2] = decode_fixed("01af").unwrap();
        assert_eq!(bytes, [0x01, 0xaf]);

        let err = decode_fixed::<4>("01af").unwrap_err();
        assert_eq!(
            err,
            DecodeError::InvalidLength {
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn test_encode_lowercase() {
        assert_eq!(encode([0xde, 0xad, 0xBE, 0xef]), "deadbeef");
        assert_eq!(encode(decode("0xDEADbeef").unwrap()), "deadbeef");
    }
}
