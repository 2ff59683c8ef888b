use sha2::{Digest, Sha256};

use crate::SimpleMessage;

/// Chains one (role, content) pair onto a previous cumulative hash.
///
/// The hash of a message is `SHA256(prev_hash ∥ role ∥ content)` over the
/// hex-encoded previous hash, so any (role, content) prefix of any
/// conversation has exactly one hash. The first message of a conversation
/// chains onto the empty string.
pub fn chain_hash(prev: &str, role: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(role.as_bytes());
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Cumulative hash of an ordered message history.
///
/// An empty history hashes to the empty string, which never matches a
/// stored message.
pub fn history_hash(history: &[SimpleMessage]) -> String {
    history.iter().fold(String::new(), |prev, message| {
        chain_hash(&prev, &message.role, &message.content)
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn msg(role: &str, content: &str) -> SimpleMessage {
        SimpleMessage {
            role: role.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_history_hashes_to_empty_string() {
        assert_eq!(history_hash(&[]), "");
    }

    #[test]
    fn test_identical_prefixes_hash_identically() {
        let fixture_a = vec![msg("user", "Hello"), msg("assistant", "Hi there!")];
        let fixture_b = vec![msg("user", "Hello"), msg("assistant", "Hi there!")];

        assert_eq!(history_hash(&fixture_a), history_hash(&fixture_b));
    }

    #[test]
    fn test_diverging_content_changes_hash() {
        let fixture_a = vec![msg("user", "Hello"), msg("user", "How are you?")];
        let fixture_b = vec![msg("user", "Hello"), msg("user", "What is the weather?")];

        assert_ne!(history_hash(&fixture_a), history_hash(&fixture_b));
    }

    #[test]
    fn test_role_participates_in_hash() {
        let fixture_a = vec![msg("user", "Hello")];
        let fixture_b = vec![msg("system", "Hello")];

        assert_ne!(history_hash(&fixture_a), history_hash(&fixture_b));
    }

    #[test]
    fn test_history_hash_equals_folded_chain() {
        let fixture = vec![msg("system", "Be nice."), msg("user", "Hello")];

        let expected = chain_hash(&chain_hash("", "system", "Be nice."), "user", "Hello");

        assert_eq!(history_hash(&fixture), expected);
    }

    #[test]
    fn test_prefix_hash_differs_from_full_hash() {
        let fixture = vec![msg("user", "Hello"), msg("assistant", "Hi there!")];

        assert_ne!(history_hash(&fixture[..1]), history_hash(&fixture));
    }
}
