#![forbid(unsafe_code)]

use crate::KeyId;

/// Kind of key session requested from the session store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionType {
    #[default]
    Temporary,
    PersistentLicense,
}

/// How the session store obtained a key session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionSource {
    /// A brand new session, for which a license request must be generated.
    Created,
    /// An already-open session found in the store's cache.
    LoadedOpen,
    /// A session restored from the persistent store.
    LoadedPersistent,
}

/// Per-key status reported by a key session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum KeyStatus {
    Usable,
    UsableInFuture,
    Expired,
    Released,
    OutputRestricted,
    OutputDownscaled,
    StatusPending,
    InternalError,
}

impl KeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Usable => "usable",
            Self::UsableInFuture => "usable-in-future",
            Self::Expired => "expired",
            Self::Released => "released",
            Self::OutputRestricted => "output-restricted",
            Self::OutputDownscaled => "output-downscaled",
            Self::StatusPending => "status-pending",
            Self::InternalError => "internal-error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyStatusEntry {
    pub key_id: KeyId,
    pub status: KeyStatus,
}

impl KeyStatusEntry {
    pub fn new(key_id: KeyId, status: KeyStatus) -> Self {
        Self { key_id, status }
    }
}

/// Kind of message emitted by a key session towards the license server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    LicenseRequest,
    LicenseRenewal,
    LicenseRelease,
    IndividualizationRequest,
}

/// Whether a codec can be played encrypted with the negotiated key system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecSupport {
    pub mime_type: String,
    pub codec: String,
    pub supported: bool,
}
