#![forbid(unsafe_code)]

mod sessions;
mod state;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use self::state::{Attachment, KeySystemContext, Phase, QueueLock, StateData};
use crate::{
    DecryptorConfig, DecryptorState, DrmError, DrmEvent, DrmResult, KeySystemNegotiator,
    KeySystemOption, MediaSurface, ProtectionData,
};

/// Orchestrates key sessions for one playback.
///
/// Must be created inside a tokio runtime: negotiation starts right away on
/// a spawned task. Dropping the decryptor disposes it.
pub struct ContentDecryptor {
    inner: Arc<DecryptorInner>,
}

pub(crate) struct DecryptorInner {
    state: Mutex<StateData>,
    events: broadcast::Sender<DrmEvent>,
    cancel: CancellationToken,
    surface: Arc<dyn MediaSurface>,
    max_stored_persistent_sessions: usize,
}

impl ContentDecryptor {
    pub fn new(
        surface: Arc<dyn MediaSurface>,
        negotiator: Arc<dyn KeySystemNegotiator>,
        key_systems: Vec<KeySystemOption>,
        config: DecryptorConfig,
    ) -> Self {
        let events = config.events_tx.unwrap_or_else(|| {
            let (tx, _) = broadcast::channel(config.events_channel_capacity.max(1));
            tx
        });
        let cancel = config
            .cancel
            .map_or_else(CancellationToken::new, |parent| parent.child_token());

        let inner = Arc::new(DecryptorInner {
            state: Mutex::new(StateData::new()),
            events,
            cancel,
            surface,
            max_stored_persistent_sessions: config.max_stored_persistent_sessions,
        });

        tokio::spawn(Arc::clone(&inner).negotiate(negotiator, key_systems));

        Self { inner }
    }

    /// Attach the negotiated media keys to the playback surface.
    ///
    /// Only valid in [`DecryptorState::WaitingForAttachment`]. Calling it
    /// again once attachment was requested does nothing.
    pub fn attach(&self) -> DrmResult<()> {
        self.inner.attach()
    }

    /// Stop all pending work. No event is published afterwards.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Handle a protection initialization event.
    ///
    /// Data received before the decryptor is ready are buffered and handled
    /// in arrival order.
    pub fn on_initialization_data(&self, data: ProtectionData) -> DrmResult<()> {
        self.inner.on_initialization_data(data)
    }

    pub fn state(&self) -> DecryptorState {
        self.inner.state.lock().phase.public_state()
    }

    pub fn is_media_keys_attached(&self) -> bool {
        self.inner.state.lock().phase.is_media_keys_attached()
    }

    /// DRM system id used for license requests, once negotiated.
    pub fn system_id(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .phase
            .context()
            .and_then(|c| c.system_id.clone())
    }

    /// `None` until negotiation reported on this codec.
    pub fn is_codec_supported(&self, mime_type: &str, codec: &str) -> Option<bool> {
        self.inner
            .state
            .lock()
            .codec_support
            .iter()
            .find(|c| c.mime_type == mime_type && c.codec == codec)
            .map(|c| c.supported)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DrmEvent> {
        self.inner.events.subscribe()
    }
}

impl Drop for ContentDecryptor {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl DecryptorInner {
    fn emit(&self, event: DrmEvent) {
        trace!(?event, "drm event");
        let _ = self.events.send(event);
    }

    /// Run `fut` unless the decryptor stops first.
    async fn cancellable<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }

    async fn negotiate(
        self: Arc<Self>,
        negotiator: Arc<dyn KeySystemNegotiator>,
        key_systems: Vec<KeySystemOption>,
    ) {
        if key_systems.is_empty() {
            self.fail(DrmError::IncompatibleKeySystems(
                "no key system configured".to_owned(),
            ));
            return;
        }

        let negotiated = self
            .cancellable(negotiator.negotiate(&key_systems, &self.cancel))
            .await;

        let mut state = self.state.lock();
        if state.phase.is_stopped() {
            return;
        }
        let negotiated = match negotiated {
            None => return,
            Some(Ok(negotiated)) => negotiated,
            Some(Err(err)) => {
                self.fail_locked(&mut state, DrmError::IncompatibleKeySystems(err.message));
                return;
            }
        };
        let Some(option) = key_systems.get(negotiated.option_index).cloned() else {
            self.fail_locked(
                &mut state,
                DrmError::IncompatibleKeySystems(format!(
                    "negotiated unknown key system option {}",
                    negotiated.option_index
                )),
            );
            return;
        };

        info!(key_system = %negotiated.key_system, "key system negotiated");
        state.codec_support = negotiated.codec_support.clone();
        let context = Arc::new(KeySystemContext::new(negotiated, option));
        state.phase = Phase::WaitingForAttachment {
            context,
            attaching: false,
        };
        self.emit(DrmEvent::StateChanged {
            state: DecryptorState::WaitingForAttachment,
        });
    }

    fn attach(self: &Arc<Self>) -> DrmResult<()> {
        let mut state = self.state.lock();
        let context = match &mut state.phase {
            Phase::WaitingForAttachment {
                attaching: true, ..
            }
            | Phase::ReadyForContent { .. } => {
                warn!("media keys attachment already requested");
                return Ok(());
            }
            Phase::WaitingForAttachment { context, attaching } => {
                *attaching = true;
                Arc::clone(context)
            }
            Phase::Initializing => {
                return Err(DrmError::InvalidState("key system not negotiated yet"));
            }
            Phase::Error => return Err(DrmError::Stopped),
            Phase::Disposed => return Err(DrmError::Disposed),
        };

        if context.option.disable_media_keys_attachment_lock {
            debug!("processing initialization data before media keys are attached");
            state.phase = Phase::ReadyForContent {
                context: Arc::clone(&context),
                attachment: Attachment::Pending,
            };
            self.emit(DrmEvent::StateChanged {
                state: DecryptorState::ReadyForContent,
            });
            state.queue_lock = QueueLock::Unlocked;
            self.drain_queue(&mut state);
        }
        drop(state);

        tokio::spawn(Arc::clone(self).attach_media_keys(context));
        Ok(())
    }

    async fn attach_media_keys(self: Arc<Self>, context: Arc<KeySystemContext>) {
        let attached = self
            .cancellable(
                self.surface
                    .attach_media_keys(&context.key_system, Arc::clone(&context.media_keys)),
            )
            .await;
        match attached {
            None => return,
            Some(Ok(())) => {}
            Some(Err(err)) => {
                self.fail(DrmError::MediaKeysAttachment(err.message));
                return;
            }
        }

        if let Some(certificate) = context.option.server_certificate.clone() {
            let installed = self
                .cancellable(context.media_keys.set_server_certificate(certificate))
                .await;
            match installed {
                None => return,
                Some(Ok(true)) => debug!("server certificate installed"),
                Some(Ok(false)) => debug!("key system does not use server certificates"),
                Some(Err(err)) => {
                    warn!(error = %err, "server certificate installation failed");
                    let state = self.state.lock();
                    if state.phase.is_stopped() {
                        return;
                    }
                    self.emit(DrmEvent::Warning {
                        error: DrmError::ServerCertificate(err.message),
                    });
                    drop(state);
                }
            }
        }

        let mut state = self.state.lock();
        let was_ready = match &state.phase {
            Phase::WaitingForAttachment { .. } => false,
            Phase::ReadyForContent { .. } => true,
            _ => return,
        };
        info!(key_system = %context.key_system, "media keys attached");
        state.phase = Phase::ReadyForContent {
            context,
            attachment: Attachment::Attached,
        };
        if !was_ready {
            self.emit(DrmEvent::StateChanged {
                state: DecryptorState::ReadyForContent,
            });
        }
        self.unlock_queue(&mut state, QueueLock::Attachment);
    }

    fn on_initialization_data(self: &Arc<Self>, data: ProtectionData) -> DrmResult<()> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Disposed => return Err(DrmError::Disposed),
            Phase::Error => return Err(DrmError::Stopped),
            _ => {}
        }
        state.queue.push_back(data);
        if state.queue_lock == QueueLock::Unlocked {
            self.drain_queue(&mut state);
        } else {
            debug!(
                queued = state.queue.len(),
                lock = ?state.queue_lock,
                "initialization data queued"
            );
        }
        Ok(())
    }

    fn lock_queue(state: &mut StateData, holder: QueueLock) {
        state.queue_lock = holder;
    }

    /// Release the queue lock if `holder` owns it.
    ///
    /// Before media keys are attached the lock passes to the attachment
    /// instead.
    fn unlock_queue(self: &Arc<Self>, state: &mut StateData, holder: QueueLock) {
        if state.queue_lock != holder {
            return;
        }
        if !state.phase.is_media_keys_attached() {
            error!(
                ?holder,
                "cannot unlock the initialization data queue before media keys are attached"
            );
            state.queue_lock = QueueLock::Attachment;
            return;
        }
        state.queue_lock = QueueLock::Unlocked;
        self.drain_queue(state);
    }

    /// Process queued data in order until the queue is empty or locked
    /// again.
    fn drain_queue(self: &Arc<Self>, state: &mut StateData) {
        while state.queue_lock == QueueLock::Unlocked && !state.phase.is_stopped() {
            let Some(data) = state.queue.pop_front() else {
                break;
            };
            self.process(state, data);
        }
    }

    fn fail(&self, error: DrmError) {
        let mut state = self.state.lock();
        self.fail_locked(&mut state, error);
    }

    fn fail_locked(&self, state: &mut StateData, error: DrmError) {
        if state.phase.is_stopped() {
            return;
        }
        error!(code = %error.code(), error = %error, "decryptor failed");
        state.phase = Phase::Error;
        state.queue.clear();
        Self::lock_queue(state, QueueLock::Stopped);
        self.cancel.cancel();
        self.emit(DrmEvent::Error { error });
        self.emit(DrmEvent::StateChanged {
            state: DecryptorState::Error,
        });
    }

    fn dispose(&self) {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Disposed) {
            return;
        }
        debug!(sessions = state.sessions.len(), "disposing decryptor");
        state.phase = Phase::Disposed;
        state.queue.clear();
        Self::lock_queue(&mut state, QueueLock::Stopped);
        state.sessions.clear();
        self.cancel.cancel();
    }
}
