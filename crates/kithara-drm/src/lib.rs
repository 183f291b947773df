#![forbid(unsafe_code)]

//! Key session orchestration for protected media playback.
//!
//! [`ContentDecryptor`] negotiates a key system with the host, attaches the
//! resulting media keys to the playback surface, then turns protection
//! initialization events into key sessions and license requests. It reports
//! through a broadcast channel of [`DrmEvent`] which key ids can be
//! decrypted, which content must be blacklisted, and fatal failures.
//!
//! The platform side (key system negotiation, key sessions, license server,
//! persistent storage, content model) is supplied through the traits in
//! this crate.
//!
//! # Session reuse
//!
//! Initialization data are processed one at a time, in arrival order. Data
//! compatible with an already-open session reuse it; the
//! [`SingleLicensePer`] setting of the key system decides how widely a
//! fetched license is trusted to cover other key ids.

mod config;
mod decryptor;
mod error;
mod events;
mod key_id;
mod key_status;
mod listener;
mod persistence;
mod policy;
mod protection;
mod record;
mod retry;
mod system_id;
mod traits;
mod types;

pub use config::{
    DEFAULT_MAX_SESSION_CACHE_SIZE, DEFAULT_MAX_STORED_PERSISTENT_SESSIONS, DecryptorConfig,
    KeyStatusAction, KeyStatusOptions, KeySystemOption, PersistentLicenseConfig,
    SingleLicensePer,
};
pub use decryptor::ContentDecryptor;
pub use error::{DrmError, DrmResult, ErrorCode, HostError, LicenseError};
pub use events::{DecryptorState, DrmEvent, KeyIdsCompatibility};
pub use key_id::{
    KeyId, are_all_key_ids_contained_in, are_some_key_ids_contained_in, is_key_id_contained_in,
    merge_key_ids,
};
pub use protection::{ContentLocus, InitDataValue, ProtectionData};
pub use record::KeySessionRecord;
pub use retry::RetryPolicy;
pub use system_id::drm_system_id;
pub use traits::{
    ContentModel, KeySession, KeySessionEvent, KeySessionEvents, KeySystemNegotiator,
    LicenseTransport, LoadedSession, MediaKeys, MediaSurface, NegotiatedKeySystem,
    PersistentSessionStore, SessionStore,
};
pub use types::{
    CodecSupport, KeyStatus, KeyStatusEntry, MessageType, SessionSource, SessionType,
};
