#![forbid(unsafe_code)]

use std::{collections::VecDeque, fmt, sync::Arc};

use tokio_util::sync::DropGuard;

use crate::{
    DecryptorState, DrmError, KeySession, KeySessionRecord, KeySystemOption, MediaKeys,
    NegotiatedKeySystem, ProtectionData, SessionStore, drm_system_id,
    policy::KeyStatuses,
    types::{CodecSupport, SessionSource, SessionType},
};

/// Everything obtained from a successful key system negotiation.
pub(crate) struct KeySystemContext {
    pub key_system: String,
    pub option: KeySystemOption,
    pub media_keys: Arc<dyn MediaKeys>,
    pub session_store: Arc<dyn SessionStore>,
    pub supports_persistent_sessions: bool,
    /// DRM system id used to trim license request payloads. Unset when
    /// persisted sessions must stay matchable with the full payload.
    pub system_id: Option<String>,
}

impl KeySystemContext {
    pub(crate) fn new(negotiated: NegotiatedKeySystem, option: KeySystemOption) -> Self {
        let retro_compatible = option
            .persistent_license
            .as_ref()
            .is_some_and(|p| !p.disable_retro_compatibility);
        let system_id = if retro_compatible {
            None
        } else {
            drm_system_id(&negotiated.key_system).map(str::to_owned)
        };
        Self {
            key_system: negotiated.key_system,
            option,
            media_keys: negotiated.media_keys,
            session_store: negotiated.session_store,
            supports_persistent_sessions: negotiated.supports_persistent_sessions,
            system_id,
        }
    }

    /// Session type to request, falling back to temporary sessions when
    /// the platform cannot persist them.
    pub(crate) fn session_type(&self) -> SessionType {
        match &self.option.persistent_license {
            Some(_) if self.supports_persistent_sessions => SessionType::PersistentLicense,
            Some(_) => {
                tracing::warn!(
                    key_system = %self.key_system,
                    "persistent sessions unsupported, using temporary sessions"
                );
                SessionType::Temporary
            }
            None => SessionType::Temporary,
        }
    }
}

impl fmt::Debug for KeySystemContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySystemContext")
            .field("key_system", &self.key_system)
            .field("option", &self.option)
            .field(
                "supports_persistent_sessions",
                &self.supports_persistent_sessions,
            )
            .field("system_id", &self.system_id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Attachment {
    Pending,
    Attached,
}

#[derive(Debug)]
pub(crate) enum Phase {
    Initializing,
    WaitingForAttachment {
        context: Arc<KeySystemContext>,
        /// `attach()` was called; attachment is in flight.
        attaching: bool,
    },
    ReadyForContent {
        context: Arc<KeySystemContext>,
        attachment: Attachment,
    },
    Error,
    Disposed,
}

impl Phase {
    pub(crate) fn public_state(&self) -> DecryptorState {
        match self {
            Self::Initializing => DecryptorState::Initializing,
            Self::WaitingForAttachment { .. } => DecryptorState::WaitingForAttachment,
            Self::ReadyForContent { .. } => DecryptorState::ReadyForContent,
            Self::Error => DecryptorState::Error,
            Self::Disposed => DecryptorState::Disposed,
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        matches!(self, Self::Error | Self::Disposed)
    }

    pub(crate) fn context(&self) -> Option<&Arc<KeySystemContext>> {
        match self {
            Self::WaitingForAttachment { context, .. } | Self::ReadyForContent { context, .. } => {
                Some(context)
            }
            _ => None,
        }
    }

    pub(crate) fn is_media_keys_attached(&self) -> bool {
        matches!(
            self,
            Self::ReadyForContent {
                attachment: Attachment::Attached,
                ..
            }
        )
    }
}

/// Bookkeeping for one live key session.
pub(crate) struct ActiveSessionInfo {
    pub id: u64,
    pub record: KeySessionRecord,
    pub source: SessionSource,
    pub session: Arc<dyn KeySession>,
    pub session_type: SessionType,
    /// Set by the first key status update.
    pub key_statuses: Option<KeyStatuses>,
    /// Set when the session cannot provide keys; content relying on it is
    /// blacklisted.
    pub blacklisted_session_error: Option<DrmError>,
    pub persisted: bool,
    /// Stops the session's event listener when the info is dropped.
    pub _listener: DropGuard,
}

impl fmt::Debug for ActiveSessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSessionInfo")
            .field("id", &self.id)
            .field("session_id", &self.session.session_id())
            .field("source", &self.source)
            .field("session_type", &self.session_type)
            .field("key_statuses", &self.key_statuses)
            .field("blacklisted", &self.blacklisted_session_error.is_some())
            .field("persisted", &self.persisted)
            .finish()
    }
}

/// Holder of the initialization data queue lock. Only the holder releases
/// it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueueLock {
    Unlocked,
    /// Media keys are not attached yet.
    Attachment,
    /// Creation of the session with this id. Wider license scopes keep it
    /// until the session's first keys.
    Creation(u64),
    /// Closing of the decommissioned session with this id.
    Closing(u64),
    Stopped,
}

#[derive(Debug)]
pub(crate) struct StateData {
    pub phase: Phase,
    pub queue: VecDeque<ProtectionData>,
    pub queue_lock: QueueLock,
    pub sessions: Vec<ActiveSessionInfo>,
    pub codec_support: Vec<CodecSupport>,
    next_session_id: u64,
}

impl StateData {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Initializing,
            queue: VecDeque::new(),
            queue_lock: QueueLock::Attachment,
            sessions: Vec::new(),
            codec_support: Vec::new(),
            next_session_id: 0,
        }
    }

    pub(crate) fn next_session_id(&mut self) -> u64 {
        self.next_session_id += 1;
        self.next_session_id
    }

    pub(crate) fn session_mut(&mut self, id: u64) -> Option<&mut ActiveSessionInfo> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    pub(crate) fn remove_session(&mut self, id: u64) -> Option<ActiveSessionInfo> {
        let index = self.sessions.iter().position(|s| s.id == id)?;
        Some(self.sessions.remove(index))
    }
}
