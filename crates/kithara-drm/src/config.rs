#![forbid(unsafe_code)]

use std::{fmt, sync::Arc};

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{DrmEvent, LicenseTransport, PersistentSessionStore, RetryPolicy};

/// Default cap on simultaneously open key sessions.
pub const DEFAULT_MAX_SESSION_CACHE_SIZE: usize = 15;

/// Default cap on persisted session entries.
pub const DEFAULT_MAX_STORED_PERSISTENT_SESSIONS: usize = 1000;

/// Scope one fetched license is assumed to cover.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SingleLicensePer {
    /// One license per initialization data. Key ids missing from a license
    /// are not considered undecipherable.
    #[default]
    InitData,
    /// One license for the whole content.
    Content,
    /// One license per period.
    Periods,
}

/// What to do when a key reaches a problematic status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum KeyStatusAction {
    /// Fail the whole decryptor.
    #[default]
    Error,
    /// Blacklist the key and fall back to other content.
    Fallback,
    /// Treat the key as usable.
    Continue,
    /// Close the session; content relying on it will get a new one.
    CloseSession,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyStatusOptions {
    pub on_key_expiration: KeyStatusAction,
    pub on_key_internal_error: KeyStatusAction,
    pub on_key_output_restricted: KeyStatusAction,
}

/// Persistent-license configuration.
#[derive(Clone)]
pub struct PersistentLicenseConfig {
    pub store: Arc<dyn PersistentSessionStore>,
    /// Send only the payload of the negotiated DRM system in license
    /// requests. Sessions persisted with the full payload can then no
    /// longer be matched.
    pub disable_retro_compatibility: bool,
}

impl PersistentLicenseConfig {
    pub fn new(store: Arc<dyn PersistentSessionStore>) -> Self {
        Self {
            store,
            disable_retro_compatibility: false,
        }
    }

    #[must_use]
    pub fn with_retro_compatibility_disabled(mut self) -> Self {
        self.disable_retro_compatibility = true;
        self
    }
}

impl fmt::Debug for PersistentLicenseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentLicenseConfig")
            .field("stored_sessions", &self.store.len())
            .field(
                "disable_retro_compatibility",
                &self.disable_retro_compatibility,
            )
            .finish()
    }
}

/// One candidate key system configuration.
#[derive(Clone)]
pub struct KeySystemOption {
    /// Key system name (`"com.widevine.alpha"`, `"widevine"`...).
    pub key_system: String,
    pub license_transport: Arc<dyn LicenseTransport>,
    /// Retry and timeout behavior of license requests.
    pub license_retry: RetryPolicy,
    pub persistent_license: Option<PersistentLicenseConfig>,
    pub server_certificate: Option<Bytes>,
    pub single_license_per: SingleLicensePer,
    /// Cap on open key sessions. Defaults to
    /// [`DEFAULT_MAX_SESSION_CACHE_SIZE`].
    pub max_session_cache_size: Option<usize>,
    /// Robustness hints forwarded to the negotiator.
    pub audio_robustnesses: Option<Vec<String>>,
    pub video_robustnesses: Option<Vec<String>>,
    pub key_statuses: KeyStatusOptions,
    /// Process initialization data as soon as attachment starts instead of
    /// waiting for it to finish.
    pub disable_media_keys_attachment_lock: bool,
}

impl fmt::Debug for KeySystemOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySystemOption")
            .field("key_system", &self.key_system)
            .field("license_transport", &"LicenseTransport")
            .field("license_retry", &self.license_retry)
            .field("persistent_license", &self.persistent_license)
            .field(
                "server_certificate",
                &self.server_certificate.as_ref().map(Bytes::len),
            )
            .field("single_license_per", &self.single_license_per)
            .field("max_session_cache_size", &self.max_session_cache_size)
            .field("audio_robustnesses", &self.audio_robustnesses)
            .field("video_robustnesses", &self.video_robustnesses)
            .field("key_statuses", &self.key_statuses)
            .field(
                "disable_media_keys_attachment_lock",
                &self.disable_media_keys_attachment_lock,
            )
            .finish()
    }
}

impl KeySystemOption {
    pub fn new<S: Into<String>>(key_system: S, license_transport: Arc<dyn LicenseTransport>) -> Self {
        Self {
            key_system: key_system.into(),
            license_transport,
            license_retry: RetryPolicy::default(),
            persistent_license: None,
            server_certificate: None,
            single_license_per: SingleLicensePer::default(),
            max_session_cache_size: None,
            audio_robustnesses: None,
            video_robustnesses: None,
            key_statuses: KeyStatusOptions::default(),
            disable_media_keys_attachment_lock: false,
        }
    }

    #[must_use]
    pub fn with_license_retry(mut self, policy: RetryPolicy) -> Self {
        self.license_retry = policy;
        self
    }

    #[must_use]
    pub fn with_persistent_license(mut self, config: PersistentLicenseConfig) -> Self {
        self.persistent_license = Some(config);
        self
    }

    #[must_use]
    pub fn with_server_certificate(mut self, certificate: Bytes) -> Self {
        self.server_certificate = Some(certificate);
        self
    }

    #[must_use]
    pub fn with_single_license_per(mut self, scope: SingleLicensePer) -> Self {
        self.single_license_per = scope;
        self
    }

    #[must_use]
    pub fn with_max_session_cache_size(mut self, size: usize) -> Self {
        self.max_session_cache_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_robustnesses(mut self, audio: Vec<String>, video: Vec<String>) -> Self {
        self.audio_robustnesses = Some(audio);
        self.video_robustnesses = Some(video);
        self
    }

    #[must_use]
    pub fn with_key_statuses(mut self, options: KeyStatusOptions) -> Self {
        self.key_statuses = options;
        self
    }

    #[must_use]
    pub fn with_media_keys_attachment_lock_disabled(mut self) -> Self {
        self.disable_media_keys_attachment_lock = true;
        self
    }

    pub(crate) fn max_session_cache_size(&self) -> usize {
        self.max_session_cache_size
            .unwrap_or(DEFAULT_MAX_SESSION_CACHE_SIZE)
    }
}

/// Configuration of a [`ContentDecryptor`](crate::ContentDecryptor).
#[derive(Clone, Debug)]
pub struct DecryptorConfig {
    /// Parent cancellation token; cancelling it disposes the decryptor's
    /// pending work.
    pub cancel: Option<CancellationToken>,
    /// Capacity of the events broadcast channel (used when `events_tx` is
    /// not provided).
    pub events_channel_capacity: usize,
    /// Events broadcast sender (optional - if not provided, one is created
    /// internally).
    pub events_tx: Option<broadcast::Sender<DrmEvent>>,
    pub max_stored_persistent_sessions: usize,
}

impl Default for DecryptorConfig {
    fn default() -> Self {
        Self {
            cancel: None,
            events_channel_capacity: 32,
            events_tx: None,
            max_stored_persistent_sessions: DEFAULT_MAX_STORED_PERSISTENT_SESSIONS,
        }
    }
}

impl DecryptorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    #[must_use]
    pub fn with_events_channel_capacity(mut self, capacity: usize) -> Self {
        self.events_channel_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_events_tx(mut self, events_tx: broadcast::Sender<DrmEvent>) -> Self {
        self.events_tx = Some(events_tx);
        self
    }

    #[must_use]
    pub fn with_max_stored_persistent_sessions(mut self, max: usize) -> Self {
        self.max_stored_persistent_sessions = max;
        self
    }
}
