//! Room addressing.
//!
//! A room is the live collaboration context for one document. Clients address
//! it with an opaque identifier (usually `page:<uuid>`); the server derives a
//! storage-safe [`RoomKey`] from it by replacing path, space and control
//! characters with `_` and truncating to [`MAX_ROOM_KEY_LEN`] characters.

use std::fmt;

/// Maximum room key length in characters (storage key limit).
pub const MAX_ROOM_KEY_LEN: usize = 95;

/// Prefix marking a room that belongs to a single document.
pub const DOCUMENT_SCOPE_PREFIX: &str = "page:";

/// [`DOCUMENT_SCOPE_PREFIX`] as it appears in a derived key.
const DERIVED_SCOPE_PREFIX: &str = "page_";

/// Sanitized, bounded-length room key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomKey(String);

impl RoomKey {
    /// Derive a room key from a raw room identifier.
    pub fn derive(raw: &str) -> Self {
        let key = raw
            .chars()
            .map(|c| if is_unsafe(c) { '_' } else { c })
            .take(MAX_ROOM_KEY_LEN)
            .collect();
        Self(key)
    }

    /// Wrap a key that is already sanitized (e.g. read back from storage).
    ///
    /// Returns `None` when the string would not survive [`RoomKey::derive`]
    /// unchanged.
    pub fn from_stored(key: &str) -> Option<Self> {
        let derived = Self::derive(key);
        (derived.0 == key && !key.is_empty()).then_some(derived)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Document this room is scoped to, if any.
    ///
    /// Decided on the derived key, not the raw identifier: `page:abc`,
    /// `page_abc` and `page/abc` all open the same room and so all need
    /// access to document `abc`.
    pub fn document_id(&self) -> Option<&str> {
        self.0.strip_prefix(DERIVED_SCOPE_PREFIX)
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_unsafe(c: char) -> bool {
    matches!(c, ':' | '/' | '\\') || c.is_whitespace() || c.is_control()
}

/// Document scope of a raw room identifier.
///
/// Rooms named `page:<id>` (or any alias deriving to the same key) are scoped
/// to document `<id>` and require an access check at connect time. Any other
/// room is unscoped.
pub fn document_scope(raw: &str) -> Option<String> {
    RoomKey::derive(raw).document_id().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_replaces_unsafe_characters() {
        let key = RoomKey::derive("page:abc/def ghi");
        assert_eq!(key.as_str(), "page_abc_def_ghi");
    }

    #[test]
    fn test_derive_truncates() {
        let raw = "x".repeat(300);
        let key = RoomKey::derive(&raw);
        assert_eq!(key.as_str().chars().count(), MAX_ROOM_KEY_LEN);
    }

    #[test]
    fn test_derive_truncates_on_char_boundary() {
        let raw = "é".repeat(200);
        let key = RoomKey::derive(&raw);
        assert_eq!(key.as_str().chars().count(), MAX_ROOM_KEY_LEN);
    }

    #[test]
    fn test_derive_strips_control_characters() {
        let key = RoomKey::derive("a\0b\tc");
        assert_eq!(key.as_str(), "a_b_c");
        assert!(!key.as_bytes().contains(&0));
    }

    #[test]
    fn test_derive_is_stable() {
        let a = RoomKey::derive("page:0f2e");
        let b = RoomKey::derive(a.as_str());
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_stored() {
        assert!(RoomKey::from_stored("page_abc").is_some());
        assert!(RoomKey::from_stored("page:abc").is_none());
        assert!(RoomKey::from_stored("").is_none());
    }

    #[test]
    fn test_document_scope() {
        assert_eq!(document_scope("page:1234").as_deref(), Some("1234"));
        assert_eq!(document_scope("lobby"), None);
        assert_eq!(document_scope("page:").as_deref(), Some(""));
    }

    #[test]
    fn test_document_scope_covers_aliases() {
        for alias in ["page_abc", "page/abc", "page abc", "page\\abc"] {
            assert_eq!(RoomKey::derive(alias), RoomKey::derive("page:abc"));
            assert_eq!(document_scope(alias).as_deref(), Some("abc"), "{alias}");
        }
        assert_eq!(document_scope("pages"), None);
        assert_eq!(document_scope("my page:abc"), None);
    }
}
