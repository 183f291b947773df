#![forbid(unsafe_code)]

//! Host collaborators consumed by the decryptor.
//!
//! None of these are implemented here: the platform integration (browser
//! EME, Android MediaDrm, a CDM library...) provides them.

use std::{fmt, pin::Pin, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;
#[cfg(test)]
use unimock::unimock;

use crate::{
    HostError, KeyId, KeySystemOption, LicenseError, ProtectionData,
    types::{CodecSupport, KeyStatusEntry, MessageType, SessionSource, SessionType},
};

/// Event emitted by a [`KeySession`].
#[derive(Clone, Debug)]
pub enum KeySessionEvent {
    /// The session needs `message` to be sent to the license server.
    Message {
        message_type: MessageType,
        message: Bytes,
    },
    /// Key statuses changed; read them with [`KeySession::key_statuses`].
    KeyStatusesChange,
    Error(HostError),
    /// The platform closed the session on its own.
    Closed,
}

pub type KeySessionEvents = Pin<Box<dyn Stream<Item = KeySessionEvent> + Send>>;

/// Low-level key session bound to the host's decryption module.
#[async_trait]
pub trait KeySession: Send + Sync {
    fn session_id(&self) -> String;

    fn key_statuses(&self) -> Vec<KeyStatusEntry>;

    /// Stream of session events. Called once per session, before the
    /// license request is generated.
    fn events(&self) -> KeySessionEvents;

    async fn update(&self, license: Bytes) -> Result<(), HostError>;
}

/// A session handed out by the [`SessionStore`].
#[derive(Clone)]
pub struct LoadedSession {
    pub session: Arc<dyn KeySession>,
    pub source: SessionSource,
    pub session_type: SessionType,
}

impl fmt::Debug for LoadedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedSession")
            .field("session_id", &self.session.session_id())
            .field("source", &self.source)
            .field("session_type", &self.session_type)
            .finish()
    }
}

/// Cache of the key sessions opened on one set of media keys.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session for `init_data`, or load it from cache/persistence.
    ///
    /// Evicts least recently used sessions beyond `max_cache_size`.
    async fn create_or_load(
        &self,
        init_data: &ProtectionData,
        session_type: SessionType,
        max_cache_size: usize,
        cancel: &CancellationToken,
    ) -> Result<LoadedSession, HostError>;

    /// Open session serving `init_data`, moved to the top of the cache.
    fn reuse(&self, init_data: &ProtectionData) -> Option<Arc<dyn KeySession>>;

    /// `false` once the session is closing or closed.
    fn is_session_open(&self, session: &dyn KeySession) -> bool;

    async fn close_session(&self, session: Arc<dyn KeySession>) -> Result<(), HostError>;

    async fn generate_license_request(
        &self,
        session: Arc<dyn KeySession>,
        init_data_type: &str,
        request: Bytes,
    ) -> Result<(), HostError>;
}

/// Storage of persistent-license session metadata.
#[cfg_attr(test, unimock(api = PersistentSessionStoreMock))]
pub trait PersistentSessionStore: Send + Sync {
    fn add(&self, init_data: &ProtectionData, key_ids: &[KeyId], session_id: &str);

    fn delete(&self, session_id: &str);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete the `count` oldest entries.
    fn delete_oldest(&self, count: usize);
}

/// Fetches licenses from the license server.
#[async_trait]
pub trait LicenseTransport: Send + Sync {
    /// `Ok(None)` means the request should be ignored: the session is not
    /// updated.
    async fn get_license(
        &self,
        challenge: Bytes,
        message_type: MessageType,
    ) -> Result<Option<Bytes>, LicenseError>;
}

/// Media keys created for the negotiated key system.
#[async_trait]
pub trait MediaKeys: Send + Sync {
    /// `Ok(false)` when the key system does not use server certificates.
    async fn set_server_certificate(&self, certificate: Bytes) -> Result<bool, HostError>;
}

/// Playback surface the media keys are bound to.
#[async_trait]
pub trait MediaSurface: Send + Sync {
    async fn attach_media_keys(
        &self,
        key_system: &str,
        media_keys: Arc<dyn MediaKeys>,
    ) -> Result<(), HostError>;
}

/// Outcome of a successful capability negotiation.
#[derive(Clone)]
pub struct NegotiatedKeySystem {
    pub key_system: String,
    /// Index of the chosen configuration in the list given to `negotiate`.
    pub option_index: usize,
    pub supports_persistent_sessions: bool,
    pub media_keys: Arc<dyn MediaKeys>,
    pub session_store: Arc<dyn SessionStore>,
    pub codec_support: Vec<CodecSupport>,
}

impl fmt::Debug for NegotiatedKeySystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiatedKeySystem")
            .field("key_system", &self.key_system)
            .field("option_index", &self.option_index)
            .field(
                "supports_persistent_sessions",
                &self.supports_persistent_sessions,
            )
            .field("codec_support", &self.codec_support)
            .finish_non_exhaustive()
    }
}

/// Selects a usable key system configuration on the host.
#[async_trait]
pub trait KeySystemNegotiator: Send + Sync {
    async fn negotiate(
        &self,
        key_systems: &[KeySystemOption],
        cancel: &CancellationToken,
    ) -> Result<NegotiatedKeySystem, HostError>;
}

/// Read-only view of the content's periods and their key ids.
#[cfg_attr(test, unimock(api = ContentModelMock))]
pub trait ContentModel: Send + Sync {
    fn period_ids(&self) -> Vec<String>;

    fn key_ids_for_period(&self, period_id: &str) -> Vec<KeyId>;
}
