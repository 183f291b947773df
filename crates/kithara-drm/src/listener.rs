#![forbid(unsafe_code)]

//! Turns the events of one key session into decryptor updates.

use std::{ops::ControlFlow, sync::Arc};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    DrmError, KeyId, KeySession, KeySessionEvent, KeySessionEvents, LicenseTransport,
    RetryPolicy,
    config::KeyStatusOptions,
    key_status::{KeyStatusFailure, check_key_statuses},
    retry::{LicenseFetchError, fetch_license},
    types::MessageType,
};

#[derive(Clone, Debug)]
pub(crate) enum SessionUpdate {
    Warning(DrmError),
    KeysUpdated {
        whitelisted: Vec<KeyId>,
        blacklisted: Vec<KeyId>,
    },
    /// Last update sent for the session.
    Failed(SessionFailure),
}

#[derive(Clone, Debug)]
pub(crate) enum SessionFailure {
    /// Content relying on the session cannot be decrypted.
    Blacklisted(DrmError),
    /// The session is unusable and must be closed and forgotten.
    Decommissioned(DrmError),
    Fatal(DrmError),
}

pub(crate) struct SessionEventsListener {
    session: Arc<dyn KeySession>,
    transport: Arc<dyn LicenseTransport>,
    retry: RetryPolicy,
    key_statuses: KeyStatusOptions,
}

impl SessionEventsListener {
    pub(crate) fn new(
        session: Arc<dyn KeySession>,
        transport: Arc<dyn LicenseTransport>,
        retry: RetryPolicy,
        key_statuses: KeyStatusOptions,
    ) -> Self {
        Self {
            session,
            transport,
            retry,
            key_statuses,
        }
    }

    /// Listen until the session fails, its event stream ends or `cancel`
    /// fires.
    pub(crate) async fn run<F>(
        self,
        mut events: KeySessionEvents,
        cancel: CancellationToken,
        mut on_update: F,
    ) where
        F: FnMut(SessionUpdate),
    {
        let session_id = self.session.session_id();

        if !self.session.key_statuses().is_empty()
            && self.check_statuses(&mut on_update).is_break()
        {
            return;
        }

        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.next() => event,
            };
            let Some(event) = event else {
                debug!(%session_id, "key session events ended");
                break;
            };
            trace!(%session_id, ?event, "key session event");

            let flow = match event {
                KeySessionEvent::Message {
                    message_type,
                    message,
                } => {
                    self.handle_message(message_type, message, &cancel, &mut on_update)
                        .await
                }
                KeySessionEvent::KeyStatusesChange => self.check_statuses(&mut on_update),
                KeySessionEvent::Error(error) => {
                    on_update(SessionUpdate::Failed(SessionFailure::Fatal(
                        DrmError::KeySession(error.message),
                    )));
                    ControlFlow::Break(())
                }
                KeySessionEvent::Closed => {
                    on_update(SessionUpdate::Failed(SessionFailure::Decommissioned(
                        DrmError::SessionClosed,
                    )));
                    ControlFlow::Break(())
                }
            };
            if flow.is_break() {
                break;
            }
        }
    }

    async fn handle_message<F>(
        &self,
        message_type: MessageType,
        message: bytes::Bytes,
        cancel: &CancellationToken,
        on_update: &mut F,
    ) -> ControlFlow<()>
    where
        F: FnMut(SessionUpdate),
    {
        let fetched = fetch_license(
            self.transport.as_ref(),
            &self.retry,
            message,
            message_type,
            cancel,
            |error| on_update(SessionUpdate::Warning(error.to_drm_error())),
        )
        .await;

        let license = match fetched {
            Ok(Some(license)) => license,
            Ok(None) => {
                debug!(?message_type, "license transport ignored the request");
                return ControlFlow::Continue(());
            }
            Err(LicenseFetchError::Cancelled) => return ControlFlow::Break(()),
            Err(error) => {
                let drm_error = error.to_drm_error();
                let failure = if error.fallback_on_last_try() {
                    warn!(error = %drm_error, "license unavailable, blacklisting session");
                    SessionFailure::Blacklisted(drm_error)
                } else {
                    SessionFailure::Fatal(drm_error)
                };
                on_update(SessionUpdate::Failed(failure));
                return ControlFlow::Break(());
            }
        };

        let updated = tokio::select! {
            biased;
            () = cancel.cancelled() => return ControlFlow::Break(()),
            res = self.session.update(license) => res,
        };
        match updated {
            Ok(()) => {
                debug!(?message_type, "key session updated");
                ControlFlow::Continue(())
            }
            Err(error) => {
                on_update(SessionUpdate::Failed(SessionFailure::Fatal(
                    DrmError::KeyUpdate(error.message),
                )));
                ControlFlow::Break(())
            }
        }
    }

    fn check_statuses<F>(&self, on_update: &mut F) -> ControlFlow<()>
    where
        F: FnMut(SessionUpdate),
    {
        match check_key_statuses(&self.session.key_statuses(), &self.key_statuses) {
            Ok(checked) => {
                if let Some(warning) = checked.warning {
                    on_update(SessionUpdate::Warning(warning));
                }
                on_update(SessionUpdate::KeysUpdated {
                    whitelisted: checked.whitelisted,
                    blacklisted: checked.blacklisted,
                });
                ControlFlow::Continue(())
            }
            Err(KeyStatusFailure::Fatal(error)) => {
                on_update(SessionUpdate::Failed(SessionFailure::Fatal(error)));
                ControlFlow::Break(())
            }
            Err(KeyStatusFailure::Decommission(error)) => {
                on_update(SessionUpdate::Failed(SessionFailure::Decommissioned(error)));
                ControlFlow::Break(())
            }
        }
    }
}
