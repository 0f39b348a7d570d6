//! Property-based tests for the hex codec and address model
//!
//! Uses proptest to check that human-typed identifiers parse the way they
//! are displayed, and that address merging behaves like an ordered union.

use proptest::prelude::*;
use rumor_core::{hex, AddressBook, DecodeError, Endpoint, NodeId, PeerAddress, TopicId};

// ============================================================================
// Strategy Generators
// ============================================================================

/// Insert arbitrary whitespace between the characters of `s`
fn sprinkle_whitespace(s: &str, gaps: &[u8]) -> String {
    let mut out = String::new();
    for (i, ch) in s.chars().enumerate() {
        match gaps.get(i).copied().unwrap_or(0) % 4 {
            1 => out.push(' '),
            2 => out.push('\n'),
            3 => out.push('\t'),
            _ => {}
        }
        out.push(ch);
    }
    out
}

/// Randomly flip the case of hex letters
fn mix_case(s: &str, flips: &[bool]) -> String {
    s.chars()
        .enumerate()
        .map(|(i, ch)| {
            if flips.get(i).copied().unwrap_or(false) {
                ch.to_ascii_uppercase()
            } else {
                ch
            }
        })
        .collect()
}

fn endpoint_strategy() -> impl Strategy<Value = Endpoint> {
    prop::string::string_regex("[a-z0-9.:]{1,12}")
        .expect("valid regex")
        .prop_map(Endpoint::new)
}

// ============================================================================
// Hex Codec
// ============================================================================

proptest! {
    /// Encoding then decoding returns the original bytes
    #[test]
    fn decode_inverts_encode(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
        let encoded = hex::encode(&bytes);
        prop_assert_eq!(encoded.len(), bytes.len() * 2);
        prop_assert_eq!(hex::decode(&encoded).unwrap(), bytes);
    }

    /// Output is always lowercase
    #[test]
    fn encode_is_lowercase(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let encoded = hex::encode(&bytes);
        prop_assert!(!encoded.chars().any(|c| c.is_ascii_uppercase()));
    }

    /// Prefix, case and whitespace do not change the decoded value
    #[test]
    fn decode_tolerates_human_formatting(
        bytes in prop::collection::vec(any::<u8>(), 1..64),
        gaps in prop::collection::vec(any::<u8>(), 0..128),
        flips in prop::collection::vec(any::<bool>(), 0..128),
        prefixed in any::<bool>(),
    ) {
        let body = sprinkle_whitespace(&mix_case(&hex::encode(&bytes), &flips), &gaps);
        let input = if prefixed { format!(" 0x{}\n", body) } else { body };
        prop_assert_eq!(hex::decode(&input).unwrap(), bytes);
    }

    /// An odd count of hex digits is always rejected as odd length
    #[test]
    fn odd_length_rejected(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let mut encoded = hex::encode(&bytes);
        encoded.push('a');
        let is_odd_length = matches!(hex::decode(&encoded), Err(DecodeError::OddLength { .. }));
        prop_assert!(is_odd_length);
    }

    /// Node ids survive display and parse
    #[test]
    fn node_id_display_parses_back(raw in any::<[u8; 32]>()) {
        let id = NodeId::from_bytes(raw);
        prop_assert_eq!(id.to_string().parse::<NodeId>().unwrap(), id);
        let topic = TopicId::from_hex(&id.to_hex()).unwrap();
        prop_assert_eq!(topic.as_bytes(), &raw);
    }

    /// Only 32-byte inputs make a node id
    #[test]
    fn node_id_requires_32_bytes(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let result = NodeId::from_hex(&hex::encode(&bytes));
        if bytes.len() == 32 {
            prop_assert!(result.is_ok());
        } else {
            prop_assert_eq!(
                result,
                Err(DecodeError::InvalidLength { expected: 32, actual: bytes.len() })
            );
        }
    }
}

// ============================================================================
// Address Merging
// ============================================================================

proptest! {
    /// Merging is an ordered union: no duplicates, nothing lost, first-seen order kept
    #[test]
    fn merge_is_ordered_union(
        first in prop::collection::vec(endpoint_strategy(), 0..8),
        second in prop::collection::vec(endpoint_strategy(), 0..8),
    ) {
        let id = NodeId::from_bytes([7; 32]);
        let book = AddressBook::new();
        book.add_or_merge(PeerAddress::with_endpoints(id, first.clone()));
        book.add_or_merge(PeerAddress::with_endpoints(id, second.clone()));

        let mut expected: Vec<Endpoint> = Vec::new();
        for endpoint in first.into_iter().chain(second) {
            if !expected.contains(&endpoint) {
                expected.push(endpoint);
            }
        }
        let addr = book.lookup(&id).unwrap();
        prop_assert_eq!(addr.endpoints(), expected.as_slice());
    }

    /// Merging the same address twice changes nothing the second time
    #[test]
    fn merge_is_idempotent(endpoints in prop::collection::vec(endpoint_strategy(), 0..8)) {
        let id = NodeId::from_bytes([3; 32]);
        let book = AddressBook::new();
        book.add_or_merge(PeerAddress::with_endpoints(id, endpoints.clone()));
        prop_assert!(!book.add_or_merge(PeerAddress::with_endpoints(id, endpoints)));
        prop_assert_eq!(book.len(), 1);
    }
}
