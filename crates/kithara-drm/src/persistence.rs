#![forbid(unsafe_code)]

use tracing::{debug, info};

use crate::{KeyId, PersistentSessionStore, ProtectionData};

/// Delete the oldest stored sessions until at most `limit` remain.
pub(crate) fn clean_old_stored_persistent_info(store: &dyn PersistentSessionStore, limit: usize) {
    let len = store.len();
    if len <= limit {
        return;
    }
    let count = len - limit;
    info!(count, limit, "deleting oldest persistent sessions");
    store.delete_oldest(count);
}

/// Store a persistent session, keeping room under `max_stored`.
pub(crate) fn persist_session(
    store: &dyn PersistentSessionStore,
    max_stored: usize,
    init_data: &ProtectionData,
    key_ids: &[KeyId],
    session_id: &str,
) {
    clean_old_stored_persistent_info(store, max_stored.saturating_sub(1));
    debug!(session_id, key_ids = key_ids.len(), "persisting key session");
    store.add(init_data, key_ids, session_id);
}
