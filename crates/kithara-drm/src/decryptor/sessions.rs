#![forbid(unsafe_code)]

//! Per-init-data processing: session reuse, license scope policies, session
//! creation and key status bookkeeping.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{
    DecryptorInner,
    state::{ActiveSessionInfo, KeySystemContext, QueueLock, StateData},
};
use crate::{
    DrmError, DrmEvent, KeyId, KeyIdsCompatibility, KeySession, KeySessionRecord,
    ProtectionData,
    config::SingleLicensePer,
    key_id::{format_key_ids, is_key_id_contained_in, merge_key_ids},
    listener::{SessionEventsListener, SessionFailure, SessionUpdate},
    persistence::persist_session,
    policy::{KeyStatuses, is_undecipherable, key_ids_linked_to_session},
    types::{SessionSource, SessionType},
};

/// Result of looking for an open session able to serve some init data.
enum Reuse {
    /// Nothing more to do for the init data.
    Handled,
    NotFound,
    /// Create a new session after closing this one.
    Recreate(Arc<dyn KeySession>),
}

impl DecryptorInner {
    pub(super) fn process(self: &Arc<Self>, state: &mut StateData, data: ProtectionData) {
        let Some(context) = state.phase.context().cloned() else {
            error!("initialization data processed without media keys");
            return;
        };
        let policy = context.option.single_license_per;

        let stale = match self.try_reuse(state, policy, &context, &data) {
            Reuse::Handled => return,
            Reuse::Recreate(stale) => Some(stale),
            Reuse::NotFound => {
                if self.blacklist_beyond_content_license(state, policy, &data)
                    || self.extend_period_license(state, policy, &data)
                {
                    return;
                }
                None
            }
        };

        let id = state.next_session_id();
        Self::lock_queue(state, QueueLock::Creation(id));
        let session_type = context.session_type();
        debug!(
            init_data_type = %data.init_data_type,
            ?session_type,
            "creating key session"
        );
        tokio::spawn(Arc::clone(self).create_session(context, id, data, session_type, stale));
    }

    /// Resolve `data` against the known sessions.
    ///
    /// Data already served by an open session re-emit that session's key
    /// statuses when their content is known, so a reused license keeps its
    /// key ids whitelisted.
    fn try_reuse(
        &self,
        state: &mut StateData,
        policy: SingleLicensePer,
        context: &KeySystemContext,
        data: &ProtectionData,
    ) -> Reuse {
        let Some(index) = state
            .sessions
            .iter()
            .position(|s| s.record.is_compatible_with(data))
        else {
            return Reuse::NotFound;
        };

        if data.force_session_recreation {
            let info = state.sessions.remove(index);
            info!(session_id = %info.session.session_id(), "re-creating key session");
            return Reuse::Recreate(info.session);
        }

        let info = &state.sessions[index];
        if let Some(session_error) = &info.blacklisted_session_error {
            if data.content.is_some() {
                info!(error = %session_error, "init data linked to a blacklisted session");
                self.emit(DrmEvent::BlacklistProtectionData { data: data.clone() });
            } else {
                error!(
                    error = %session_error,
                    "init data linked to a blacklisted session, but its content is unknown"
                );
            }
            return Reuse::Handled;
        }

        if let (Some(statuses), Some(requested)) = (&info.key_statuses, data.declared_key_ids())
            && is_undecipherable(policy, requested, statuses)
        {
            if data.content.is_some() {
                info!(key_ids = %format_key_ids(requested), "requested key ids undecipherable");
                self.emit(DrmEvent::KeyIdsCompatibilityUpdate(KeyIdsCompatibility {
                    blacklisted_key_ids: requested.to_vec(),
                    ..KeyIdsCompatibility::default()
                }));
            } else {
                error!(
                    key_ids = %format_key_ids(requested),
                    "requested key ids undecipherable, but their content is unknown"
                );
            }
            return Reuse::Handled;
        }

        if context.session_store.reuse(data).is_none() {
            warn!(
                session_id = %info.session.session_id(),
                "key session no longer open, creating a new one"
            );
            state.sessions.remove(index);
            return Reuse::NotFound;
        }

        debug!(session_id = %info.session.session_id(), "init data already handled");
        if data.content.is_some()
            && let Some(statuses) = &info.key_statuses
        {
            self.emit(DrmEvent::KeyIdsCompatibilityUpdate(KeyIdsCompatibility {
                whitelisted_key_ids: statuses.whitelisted.clone(),
                blacklisted_key_ids: statuses.blacklisted.clone(),
                delisted_key_ids: Vec::new(),
            }));
        }
        Reuse::Handled
    }

    /// With one license for the whole content, init data not served by the
    /// first license cannot get another one.
    fn blacklist_beyond_content_license(
        &self,
        state: &mut StateData,
        policy: SingleLicensePer,
        data: &ProtectionData,
    ) -> bool {
        if policy != SingleLicensePer::Content {
            return false;
        }
        let Some(first) = state
            .sessions
            .iter_mut()
            .find(|s| s.source == SessionSource::Created)
        else {
            return false;
        };

        let Some(key_ids) = data.declared_key_ids() else {
            if data.content.is_some() {
                warn!("content license already fetched, blacklisting new init data");
                self.emit(DrmEvent::BlacklistProtectionData { data: data.clone() });
            } else {
                warn!("content license already fetched, ignoring new init data of unknown content");
            }
            return true;
        };

        first.record.associate_key_ids(key_ids.iter().cloned());
        if data.content.is_some() {
            debug!(
                key_ids = %format_key_ids(key_ids),
                "key ids absent from the content license"
            );
            self.emit(DrmEvent::KeyIdsCompatibilityUpdate(KeyIdsCompatibility {
                blacklisted_key_ids: key_ids.to_vec(),
                ..KeyIdsCompatibility::default()
            }));
        }
        true
    }

    /// With one license per period, a created session already covering a
    /// key id of the data's period covers the whole period.
    fn extend_period_license(
        &self,
        state: &mut StateData,
        policy: SingleLicensePer,
        data: &ProtectionData,
    ) -> bool {
        if policy != SingleLicensePer::Periods {
            return false;
        }
        let Some(content) = &data.content else {
            return false;
        };
        let period_key_ids = content.manifest.key_ids_for_period(&content.period_id);

        for info in state
            .sessions
            .iter_mut()
            .filter(|s| s.source == SessionSource::Created)
        {
            if !period_key_ids
                .iter()
                .any(|k| info.record.is_associated_with_key_id(k))
            {
                continue;
            }
            info.record.associate_key_ids(period_key_ids.iter().cloned());
            let statuses = info.key_statuses.get_or_insert_with(KeyStatuses::default);
            let unknown: Vec<KeyId> = period_key_ids
                .iter()
                .filter(|k| {
                    !is_key_id_contained_in(k, &statuses.whitelisted)
                        && !is_key_id_contained_in(k, &statuses.blacklisted)
                })
                .cloned()
                .collect();
            merge_key_ids(&mut statuses.blacklisted, unknown);
            debug!(period_id = %content.period_id, "period covered by an existing license");
            self.emit(DrmEvent::KeyIdsCompatibilityUpdate(KeyIdsCompatibility {
                whitelisted_key_ids: statuses.whitelisted.clone(),
                blacklisted_key_ids: statuses.blacklisted.clone(),
                delisted_key_ids: Vec::new(),
            }));
            return true;
        }
        false
    }

    async fn create_session(
        self: Arc<Self>,
        context: Arc<KeySystemContext>,
        id: u64,
        data: ProtectionData,
        session_type: SessionType,
        stale: Option<Arc<dyn KeySession>>,
    ) {
        let store = Arc::clone(&context.session_store);

        if let Some(stale) = stale {
            match self.cancellable(store.close_session(stale)).await {
                None => return,
                Some(Ok(())) => {}
                Some(Err(err)) => warn!(error = %err, "failed to close key session"),
            }
        }

        let loaded = self
            .cancellable(store.create_or_load(
                &data,
                session_type,
                context.option.max_session_cache_size(),
                &self.cancel,
            ))
            .await;
        let loaded = match loaded {
            None => return,
            Some(Ok(loaded)) => loaded,
            Some(Err(err)) => {
                self.fail(DrmError::CreateSession(err.message));
                return;
            }
        };
        let session = loaded.session;
        let session_id = session.session_id();

        {
            let mut state = self.state.lock();
            if state.phase.is_stopped() {
                return;
            }
            let listener_cancel = self.cancel.child_token();
            let events = session.events();

            state.sessions.push(ActiveSessionInfo {
                id,
                record: KeySessionRecord::new(data.clone()),
                source: loaded.source,
                session: Arc::clone(&session),
                session_type: loaded.session_type,
                key_statuses: None,
                blacklisted_session_error: None,
                persisted: loaded.source == SessionSource::LoadedPersistent,
                _listener: listener_cancel.clone().drop_guard(),
            });
            info!(%session_id, source = ?loaded.source, "key session ready");

            let listener = SessionEventsListener::new(
                Arc::clone(&session),
                Arc::clone(&context.option.license_transport),
                context.option.license_retry.clone(),
                context.option.key_statuses,
            );
            let inner = Arc::clone(&self);
            let listener_context = Arc::clone(&context);
            tokio::spawn(async move {
                listener
                    .run(events, listener_cancel, |update| {
                        inner.on_session_update(&listener_context, id, update);
                    })
                    .await;
            });

            if context.option.single_license_per == SingleLicensePer::InitData {
                self.unlock_queue(&mut state, QueueLock::Creation(id));
            }
        }

        if loaded.source != SessionSource::Created {
            return;
        }

        let request = data.construct_request_data(context.system_id.as_deref());
        let generated = self
            .cancellable(store.generate_license_request(
                Arc::clone(&session),
                &data.init_data_type,
                request,
            ))
            .await;
        match generated {
            None | Some(Ok(())) => {}
            Some(Err(err)) if !store.is_session_open(session.as_ref()) => {
                info!(%session_id, error = %err, "key session closed before its license request");
                let mut state = self.state.lock();
                if state.phase.is_stopped() {
                    return;
                }
                state.remove_session(id);
                self.unlock_queue(&mut state, QueueLock::Creation(id));
            }
            Some(Err(err)) => self.fail(DrmError::GenerateRequest(err.message)),
        }
    }

    fn on_session_update(
        self: &Arc<Self>,
        context: &Arc<KeySystemContext>,
        id: u64,
        update: SessionUpdate,
    ) {
        let mut state = self.state.lock();
        if state.phase.is_stopped() {
            return;
        }
        match update {
            SessionUpdate::Warning(error) => {
                warn!(code = %error.code(), error = %error, "key session warning");
                self.emit(DrmEvent::Warning { error });
            }
            SessionUpdate::KeysUpdated {
                whitelisted,
                blacklisted,
            } => self.on_keys_updated(&mut state, context, id, &whitelisted, &blacklisted),
            SessionUpdate::Failed(SessionFailure::Blacklisted(error)) => {
                self.blacklist_session(&mut state, id, error);
            }
            SessionUpdate::Failed(SessionFailure::Decommissioned(error)) => {
                self.decommission_session(&mut state, context, id, error);
            }
            SessionUpdate::Failed(SessionFailure::Fatal(error)) => {
                self.fail_locked(&mut state, error);
            }
        }
    }

    fn on_keys_updated(
        self: &Arc<Self>,
        state: &mut StateData,
        context: &KeySystemContext,
        id: u64,
        whitelisted: &[KeyId],
        blacklisted: &[KeyId],
    ) {
        let Some(info) = state.session_mut(id) else {
            return;
        };
        let linked = key_ids_linked_to_session(
            info.record.init_data(),
            &info.record,
            context.option.single_license_per,
            info.source == SessionSource::Created,
            whitelisted,
            blacklisted,
        );
        info.record.associate_key_ids(
            linked
                .whitelisted
                .iter()
                .chain(&linked.blacklisted)
                .cloned(),
        );
        info.key_statuses = Some(linked.clone());

        if info.session_type == SessionType::PersistentLicense
            && !info.persisted
            && !info.record.associated_key_ids().is_empty()
            && let Some(persistent) = &context.option.persistent_license
        {
            persist_session(
                persistent.store.as_ref(),
                self.max_stored_persistent_sessions,
                info.record.init_data(),
                info.record.associated_key_ids(),
                &info.session.session_id(),
            );
            info.persisted = true;
        }

        debug!(
            whitelisted = %format_key_ids(&linked.whitelisted),
            blacklisted = %format_key_ids(&linked.blacklisted),
            "key statuses updated"
        );
        if info.record.init_data().content.is_some() {
            self.emit(DrmEvent::KeyIdsCompatibilityUpdate(KeyIdsCompatibility {
                whitelisted_key_ids: linked.whitelisted,
                blacklisted_key_ids: linked.blacklisted,
                delisted_key_ids: Vec::new(),
            }));
        }
        self.unlock_queue(state, QueueLock::Creation(id));
    }

    fn blacklist_session(self: &Arc<Self>, state: &mut StateData, id: u64, error: DrmError) {
        let Some(info) = state.session_mut(id) else {
            return;
        };
        warn!(
            session_id = %info.session.session_id(),
            error = %error,
            "key session blacklisted"
        );
        info.blacklisted_session_error = Some(error.clone());
        let data = info.record.init_data().clone();

        self.emit(DrmEvent::Warning { error });
        if data.content.is_some() {
            self.emit(DrmEvent::BlacklistProtectionData { data });
        }
        self.unlock_queue(state, QueueLock::Creation(id));
    }

    fn decommission_session(
        self: &Arc<Self>,
        state: &mut StateData,
        context: &KeySystemContext,
        id: u64,
        error: DrmError,
    ) {
        let Some(info) = state.remove_session(id) else {
            return;
        };
        // Keep the queue until the session is closed, unless another
        // session's creation already holds it.
        if state.queue_lock == QueueLock::Unlocked || state.queue_lock == QueueLock::Creation(id) {
            Self::lock_queue(state, QueueLock::Closing(id));
        }
        let session_id = info.session.session_id();
        warn!(%session_id, error = %error, "decommissioning key session");
        self.emit(DrmEvent::Warning { error });

        if info.record.init_data().content.is_some() {
            self.emit(DrmEvent::KeyIdsCompatibilityUpdate(KeyIdsCompatibility {
                delisted_key_ids: info.record.associated_key_ids().to_vec(),
                ..KeyIdsCompatibility::default()
            }));
        }
        if info.session_type == SessionType::PersistentLicense
            && let Some(persistent) = &context.option.persistent_license
        {
            persistent.store.delete(&session_id);
        }

        let session = Arc::clone(&info.session);
        drop(info);
        let store = Arc::clone(&context.session_store);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(Err(err)) = inner.cancellable(store.close_session(session)).await {
                warn!(%session_id, error = %err, "failed to close decommissioned key session");
            }
            let mut state = inner.state.lock();
            if state.phase.is_stopped() {
                return;
            }
            inner.unlock_queue(&mut state, QueueLock::Closing(id));
        });
    }
}
