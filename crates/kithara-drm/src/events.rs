#![forbid(unsafe_code)]

use crate::{DrmError, KeyId, ProtectionData};

/// Public state of a [`ContentDecryptor`](crate::ContentDecryptor).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DecryptorState {
    /// Negotiating a key system with the host.
    Initializing,
    /// Media keys are ready; [`attach`](crate::ContentDecryptor::attach) must
    /// be called.
    WaitingForAttachment,
    /// Initialization data is accepted. Media keys may still be attaching
    /// when the attachment lock is disabled.
    ReadyForContent,
    /// A fatal error happened. Terminal.
    Error,
    /// Disposed. Terminal.
    Disposed,
}

impl DecryptorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Disposed)
    }
}

/// Decipherability update for a set of key ids.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyIdsCompatibility {
    /// Key ids that can be decrypted.
    pub whitelisted_key_ids: Vec<KeyId>,
    /// Key ids that cannot be decrypted.
    pub blacklisted_key_ids: Vec<KeyId>,
    /// Key ids whose decipherability is unknown again (their session was
    /// closed).
    pub delisted_key_ids: Vec<KeyId>,
}

impl KeyIdsCompatibility {
    pub fn is_empty(&self) -> bool {
        self.whitelisted_key_ids.is_empty()
            && self.blacklisted_key_ids.is_empty()
            && self.delisted_key_ids.is_empty()
    }
}

/// Events published by the decryptor.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum DrmEvent {
    StateChanged { state: DecryptorState },
    /// Fatal error, followed by `StateChanged` to [`DecryptorState::Error`].
    Error { error: DrmError },
    /// Non-fatal issue. Never changes the state.
    Warning { error: DrmError },
    /// Content linked to this protection data cannot be decrypted.
    BlacklistProtectionData { data: ProtectionData },
    KeyIdsCompatibilityUpdate(KeyIdsCompatibility),
}
