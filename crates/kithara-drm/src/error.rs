#![forbid(unsafe_code)]

use thiserror::Error;

use crate::types::KeyStatusEntry;

/// Failure reported by a host collaborator (negotiator, session store,
/// key session, media surface).
///
/// Collaborators only describe what went wrong; the decryptor decides whether
/// the failure is fatal, a warning or a content blacklisting.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HostError {
    pub message: String,
}

impl HostError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure returned by a [`LicenseTransport`](crate::LicenseTransport).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct LicenseError {
    pub message: String,
    /// Do not retry the request, even if retries remain.
    pub no_retry: bool,
    /// When the last attempt fails, blacklist the session instead of
    /// failing the whole decryptor.
    pub fallback_on_last_try: bool,
}

impl LicenseError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            no_retry: false,
            fallback_on_last_try: false,
        }
    }

    #[must_use]
    pub fn with_no_retry(mut self) -> Self {
        self.no_retry = true;
        self
    }

    #[must_use]
    pub fn with_fallback_on_last_try(mut self) -> Self {
        self.fallback_on_last_try = true;
        self
    }
}

/// Stable error codes, matching the codes surfaced to player users.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    IncompatibleKeySystems,
    MediaKeysAttachmentError,
    LicenseServerCertificateError,
    CreateKeySessionError,
    KeyGenerateRequestError,
    KeyLoadError,
    KeyLoadTimeout,
    KeyUpdateError,
    KeyError,
    KeyStatusChangeError,
    InvalidState,
    Disposed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IncompatibleKeySystems => "INCOMPATIBLE_KEYSYSTEMS",
            Self::MediaKeysAttachmentError => "MEDIA_KEYS_ATTACHMENT_ERROR",
            Self::LicenseServerCertificateError => "LICENSE_SERVER_CERTIFICATE_ERROR",
            Self::CreateKeySessionError => "CREATE_KEY_SESSION_ERROR",
            Self::KeyGenerateRequestError => "KEY_GENERATE_REQUEST_ERROR",
            Self::KeyLoadError => "KEY_LOAD_ERROR",
            Self::KeyLoadTimeout => "KEY_LOAD_TIMEOUT",
            Self::KeyUpdateError => "KEY_UPDATE_ERROR",
            Self::KeyError => "KEY_ERROR",
            Self::KeyStatusChangeError => "KEY_STATUS_CHANGE_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Disposed => "DISPOSED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decryption errors.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum DrmError {
    #[error("No compatible key system: {0}")]
    IncompatibleKeySystems(String),

    #[error("Media keys attachment failed: {0}")]
    MediaKeysAttachment(String),

    #[error("Server certificate installation failed: {0}")]
    ServerCertificate(String),

    #[error("Key session creation failed: {0}")]
    CreateSession(String),

    #[error("License request generation failed: {0}")]
    GenerateRequest(String),

    #[error("License fetch failed: {0}")]
    KeyLoad(String),

    #[error("The license server took too much time to respond")]
    KeyLoadTimeout,

    #[error("Key session update failed: {0}")]
    KeyUpdate(String),

    #[error("Key session error: {0}")]
    KeySession(String),

    #[error("Key session closed by the platform")]
    SessionClosed,

    #[error("{message}")]
    KeyStatusChange {
        message: String,
        key_statuses: Vec<KeyStatusEntry>,
    },

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Decryptor stopped after a fatal error")]
    Stopped,

    #[error("Decryptor disposed")]
    Disposed,
}

impl DrmError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::IncompatibleKeySystems(_) => ErrorCode::IncompatibleKeySystems,
            Self::MediaKeysAttachment(_) => ErrorCode::MediaKeysAttachmentError,
            Self::ServerCertificate(_) => ErrorCode::LicenseServerCertificateError,
            Self::CreateSession(_) => ErrorCode::CreateKeySessionError,
            Self::GenerateRequest(_) => ErrorCode::KeyGenerateRequestError,
            Self::KeyLoad(_) => ErrorCode::KeyLoadError,
            Self::KeyLoadTimeout => ErrorCode::KeyLoadTimeout,
            Self::KeyUpdate(_) => ErrorCode::KeyUpdateError,
            Self::KeySession(_) | Self::SessionClosed => ErrorCode::KeyError,
            Self::KeyStatusChange { .. } => ErrorCode::KeyStatusChangeError,
            Self::InvalidState(_) | Self::Stopped => ErrorCode::InvalidState,
            Self::Disposed => ErrorCode::Disposed,
        }
    }
}

pub type DrmResult<T> = Result<T, DrmError>;
