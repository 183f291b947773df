#![forbid(unsafe_code)]

//! Key id value type and set helpers.
//!
//! Key id lists are small (a handful per license), so containment checks
//! are linear scans over slices rather than hashed sets. Order of first
//! appearance is preserved everywhere, which keeps reported lists stable.

use std::fmt;

use bytes::Bytes;

/// Opaque identifier of one decryption key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(Bytes);

impl KeyId {
    pub fn new<B: Into<Bytes>>(bytes: B) -> Self {
        Self(bytes.into())
    }

    /// Parse a key id from its hex form (dashes are ignored, so UUID-style
    /// key ids are accepted).
    pub fn from_hex(value: &str) -> Result<Self, hex::FromHexError> {
        let cleaned: String = value.chars().filter(|c| *c != '-').collect();
        hex::decode(cleaned).map(|bytes| Self(Bytes::from(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.to_hex())
    }
}

impl From<&'static [u8]> for KeyId {
    fn from(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }
}

impl From<Vec<u8>> for KeyId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

pub fn is_key_id_contained_in(key_id: &KeyId, set: &[KeyId]) -> bool {
    set.iter().any(|k| k == key_id)
}

/// `true` if every key id of `wanted` is in `set`.
pub fn are_all_key_ids_contained_in(wanted: &[KeyId], set: &[KeyId]) -> bool {
    wanted.iter().all(|k| is_key_id_contained_in(k, set))
}

/// `true` if at least one key id of `wanted` is in `set`.
pub fn are_some_key_ids_contained_in(wanted: &[KeyId], set: &[KeyId]) -> bool {
    wanted.iter().any(|k| is_key_id_contained_in(k, set))
}

/// Append the key ids of `from` not yet present in `into`.
pub fn merge_key_ids<I>(into: &mut Vec<KeyId>, from: I)
where
    I: IntoIterator<Item = KeyId>,
{
    for key_id in from {
        if !is_key_id_contained_in(&key_id, into) {
            into.push(key_id);
        }
    }
}

pub(crate) fn format_key_ids(key_ids: &[KeyId]) -> String {
    key_ids
        .iter()
        .map(KeyId::to_hex)
        .collect::<Vec<_>>()
        .join(", ")
}
