//! In-memory platform used by the decryptor integration tests.

#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use kithara_drm::{
    CodecSupport, ContentDecryptor, ContentLocus, ContentModel, DecryptorConfig, DecryptorState,
    DrmEvent, HostError, InitDataValue, KeyId, KeySession, KeySessionEvent, KeySessionEvents,
    KeySessionRecord, KeyStatus, KeyStatusEntry, KeySystemNegotiator, KeySystemOption,
    LicenseError, LicenseTransport, LoadedSession, MediaKeys, MediaSurface, MessageType,
    NegotiatedKeySystem, PersistentSessionStore, ProtectionData, RetryPolicy, SessionSource,
    SessionStore, SessionType,
};
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

pub const WIDEVINE: &str = "com.widevine.alpha";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn kid(byte: u8) -> KeyId {
    KeyId::new(vec![byte; 16])
}

pub fn kids(bytes: &[u8]) -> Vec<KeyId> {
    bytes.iter().copied().map(kid).collect()
}

pub fn cenc(payload: &'static [u8]) -> ProtectionData {
    init_data("cenc", payload)
}

pub fn init_data(init_data_type: &str, payload: &'static [u8]) -> ProtectionData {
    ProtectionData::new(
        init_data_type,
        [InitDataValue::new(None, Bytes::from_static(payload))],
    )
}

pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(1))
        .with_jitter(0.0)
}

// ---------------------------------------------------------------------------
// Key session
// ---------------------------------------------------------------------------

pub struct FakeKeySession {
    id: String,
    statuses: Mutex<Vec<KeyStatusEntry>>,
    statuses_on_update: Vec<KeyStatusEntry>,
    tx: mpsc::UnboundedSender<KeySessionEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<KeySessionEvent>>>,
    pub updates: Mutex<Vec<Bytes>>,
}

impl FakeKeySession {
    fn new(id: String, statuses_on_update: Vec<KeyStatusEntry>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id,
            statuses: Mutex::new(Vec::new()),
            statuses_on_update,
            tx,
            rx: Mutex::new(Some(rx)),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn emit(&self, event: KeySessionEvent) {
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl KeySession for FakeKeySession {
    fn session_id(&self) -> String {
        self.id.clone()
    }

    fn key_statuses(&self) -> Vec<KeyStatusEntry> {
        self.statuses.lock().clone()
    }

    fn events(&self) -> KeySessionEvents {
        match self.rx.lock().take() {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => stream::empty().boxed(),
        }
    }

    async fn update(&self, license: Bytes) -> Result<(), HostError> {
        self.updates.lock().push(license);
        *self.statuses.lock() = self.statuses_on_update.clone();
        self.emit(KeySessionEvent::KeyStatusesChange);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session store
// ---------------------------------------------------------------------------

struct StoredSession {
    record: KeySessionRecord,
    session: Arc<FakeKeySession>,
    session_type: SessionType,
    open: bool,
}

#[derive(Default)]
pub struct FakeSessionStore {
    sessions: Mutex<Vec<StoredSession>>,
    /// Key statuses applied by every license; `None` makes every declared
    /// key id usable.
    license_statuses: Option<Vec<KeyStatusEntry>>,
    /// Holds `create_or_load` until notified, once set.
    creation_gate: Mutex<Option<Arc<Notify>>>,
    creation_calls: AtomicUsize,
    creations_in_flight: AtomicUsize,
    max_creations_in_flight: AtomicUsize,
    /// License requests finding their session closed by the platform.
    closing_requests: AtomicUsize,
    pub created: Mutex<Vec<ProtectionData>>,
    pub requests: Mutex<Vec<(String, Bytes)>>,
    pub closed: Mutex<Vec<String>>,
}

impl FakeSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_license_statuses(statuses: Vec<KeyStatusEntry>) -> Self {
        Self {
            license_statuses: Some(statuses),
            ..Self::default()
        }
    }

    /// The first `count` license requests fail because the platform closed
    /// their session.
    pub fn closing_before_requests(count: usize) -> Self {
        Self {
            closing_requests: AtomicUsize::new(count),
            ..Self::default()
        }
    }

    pub fn gate_creation(&self, gate: Arc<Notify>) {
        *self.creation_gate.lock() = Some(gate);
    }

    pub fn creation_calls(&self) -> usize {
        self.creation_calls.load(Ordering::SeqCst)
    }

    pub fn max_creations_in_flight(&self) -> usize {
        self.max_creations_in_flight.load(Ordering::SeqCst)
    }

    /// Close a session without telling anyone, as a platform evicting it
    /// from its cache would.
    pub fn close_silently(&self, index: usize) {
        self.sessions.lock()[index].open = false;
    }

    fn mark_closed(&self, id: &str) {
        for stored in self.sessions.lock().iter_mut() {
            if stored.session.id == id {
                stored.open = false;
            }
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn session(&self, index: usize) -> Arc<FakeKeySession> {
        Arc::clone(&self.sessions.lock()[index].session)
    }

    fn find(&self, id: &str) -> Option<Arc<FakeKeySession>> {
        self.sessions
            .lock()
            .iter()
            .find(|s| s.session.id == id)
            .map(|s| Arc::clone(&s.session))
    }
}

#[async_trait]
impl SessionStore for FakeSessionStore {
    async fn create_or_load(
        &self,
        init_data: &ProtectionData,
        session_type: SessionType,
        _max_cache_size: usize,
        _cancel: &CancellationToken,
    ) -> Result<LoadedSession, HostError> {
        self.creation_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.creation_gate.lock().clone();
        if let Some(gate) = gate {
            let in_flight = self.creations_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_creations_in_flight
                .fetch_max(in_flight, Ordering::SeqCst);
            gate.notified().await;
            self.creations_in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        let mut sessions = self.sessions.lock();
        if let Some(open) = sessions.iter().find(|s| {
            s.open && s.session_type == session_type && s.record.is_compatible_with(init_data)
        }) {
            return Ok(LoadedSession {
                session: Arc::clone(&open.session) as Arc<dyn KeySession>,
                source: SessionSource::LoadedOpen,
                session_type,
            });
        }

        let statuses = self.license_statuses.clone().unwrap_or_else(|| {
            init_data
                .key_ids
                .iter()
                .flatten()
                .map(|k| KeyStatusEntry::new(k.clone(), KeyStatus::Usable))
                .collect()
        });
        let id = format!("session-{}", sessions.len() + 1);
        let session = Arc::new(FakeKeySession::new(id, statuses));
        sessions.push(StoredSession {
            record: KeySessionRecord::new(init_data.clone()),
            session: Arc::clone(&session),
            session_type,
            open: true,
        });
        self.created.lock().push(init_data.clone());

        Ok(LoadedSession {
            session,
            source: SessionSource::Created,
            session_type,
        })
    }

    fn reuse(&self, init_data: &ProtectionData) -> Option<Arc<dyn KeySession>> {
        self.sessions
            .lock()
            .iter()
            .find(|s| s.open && s.record.is_compatible_with(init_data))
            .map(|s| Arc::clone(&s.session) as Arc<dyn KeySession>)
    }

    fn is_session_open(&self, session: &dyn KeySession) -> bool {
        let id = session.session_id();
        self.sessions
            .lock()
            .iter()
            .any(|s| s.open && s.session.id == id)
    }

    async fn close_session(&self, session: Arc<dyn KeySession>) -> Result<(), HostError> {
        let id = session.session_id();
        self.mark_closed(&id);
        self.closed.lock().push(id);
        Ok(())
    }

    async fn generate_license_request(
        &self,
        session: Arc<dyn KeySession>,
        _init_data_type: &str,
        request: Bytes,
    ) -> Result<(), HostError> {
        let id = session.session_id();
        let fake = self
            .find(&id)
            .ok_or_else(|| HostError::new(format!("unknown session {id}")))?;
        if self
            .closing_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.mark_closed(&id);
            return Err(HostError::new("session closed by the platform"));
        }
        self.requests.lock().push((id, request.clone()));
        fake.emit(KeySessionEvent::Message {
            message_type: MessageType::LicenseRequest,
            message: request,
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePersistentStore {
    pub entries: Mutex<Vec<(String, Vec<KeyId>)>>,
}

impl FakePersistentStore {
    pub fn with_entries(count: usize) -> Self {
        let entries = (0..count).map(|i| (format!("old-{i}"), Vec::new())).collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(id, _)| id.clone()).collect()
    }
}

impl PersistentSessionStore for FakePersistentStore {
    fn add(&self, _init_data: &ProtectionData, key_ids: &[KeyId], session_id: &str) {
        self.entries
            .lock()
            .push((session_id.to_owned(), key_ids.to_vec()));
    }

    fn delete(&self, session_id: &str) {
        self.entries.lock().retain(|(id, _)| id != session_id);
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn delete_oldest(&self, count: usize) {
        let mut entries = self.entries.lock();
        let count = count.min(entries.len());
        entries.drain(..count);
    }
}

// ---------------------------------------------------------------------------
// License transport
// ---------------------------------------------------------------------------

pub struct FakeTransport {
    /// Calls failing before the first success.
    fail_first: usize,
    error: LicenseError,
    pub challenges: Mutex<Vec<Bytes>>,
}

impl FakeTransport {
    pub fn ok() -> Self {
        Self::failing_first(0, LicenseError::new("unused"))
    }

    pub fn always_failing(error: LicenseError) -> Self {
        Self::failing_first(usize::MAX, error)
    }

    pub fn failing_first(fail_first: usize, error: LicenseError) -> Self {
        Self {
            fail_first,
            error,
            challenges: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.challenges.lock().len()
    }
}

#[async_trait]
impl LicenseTransport for FakeTransport {
    async fn get_license(
        &self,
        challenge: Bytes,
        _message_type: MessageType,
    ) -> Result<Option<Bytes>, LicenseError> {
        let call = {
            let mut challenges = self.challenges.lock();
            challenges.push(challenge);
            challenges.len()
        };
        if call <= self.fail_first {
            return Err(self.error.clone());
        }
        Ok(Some(Bytes::from(format!("license-{call}"))))
    }
}

// ---------------------------------------------------------------------------
// Negotiation and attachment
// ---------------------------------------------------------------------------

pub struct FakeMediaKeys {
    certificate_result: Result<bool, HostError>,
    /// Holds the certificate installation until notified.
    certificate_gate: Option<Arc<Notify>>,
    pub certificates: Mutex<Vec<Bytes>>,
}

impl FakeMediaKeys {
    pub fn new(certificate_result: Result<bool, HostError>) -> Self {
        Self {
            certificate_result,
            certificate_gate: None,
            certificates: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MediaKeys for FakeMediaKeys {
    async fn set_server_certificate(&self, certificate: Bytes) -> Result<bool, HostError> {
        self.certificates.lock().push(certificate);
        if let Some(gate) = &self.certificate_gate {
            gate.notified().await;
        }
        self.certificate_result.clone()
    }
}

#[derive(Default)]
pub struct FakeSurface {
    pub attachments: AtomicUsize,
    pub fail: bool,
    /// Holds the attachment until notified.
    pub gate: Option<Arc<Notify>>,
}

#[async_trait]
impl MediaSurface for FakeSurface {
    async fn attach_media_keys(
        &self,
        _key_system: &str,
        _media_keys: Arc<dyn MediaKeys>,
    ) -> Result<(), HostError> {
        self.attachments.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            return Err(HostError::new("surface rejected media keys"));
        }
        Ok(())
    }
}

pub struct FakeNegotiator {
    pub calls: AtomicUsize,
    pub gate: Option<Arc<Notify>>,
    pub fail: bool,
    pub supports_persistent_sessions: bool,
    pub store: Arc<FakeSessionStore>,
    pub media_keys: Arc<FakeMediaKeys>,
}

impl FakeNegotiator {
    pub fn new(store: Arc<FakeSessionStore>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            gate: None,
            fail: false,
            supports_persistent_sessions: true,
            store,
            media_keys: Arc::new(FakeMediaKeys::new(Ok(true))),
        }
    }
}

#[async_trait]
impl KeySystemNegotiator for FakeNegotiator {
    async fn negotiate(
        &self,
        key_systems: &[KeySystemOption],
        _cancel: &CancellationToken,
    ) -> Result<NegotiatedKeySystem, HostError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            return Err(HostError::new("no supported key system"));
        }
        Ok(NegotiatedKeySystem {
            key_system: key_systems[0].key_system.clone(),
            option_index: 0,
            supports_persistent_sessions: self.supports_persistent_sessions,
            media_keys: Arc::clone(&self.media_keys) as Arc<dyn MediaKeys>,
            session_store: Arc::clone(&self.store) as Arc<dyn SessionStore>,
            codec_support: vec![
                CodecSupport {
                    mime_type: "video/mp4".to_owned(),
                    codec: "avc1.42e01e".to_owned(),
                    supported: true,
                },
                CodecSupport {
                    mime_type: "video/mp4".to_owned(),
                    codec: "hvc1.1.6.L93.B0".to_owned(),
                    supported: false,
                },
            ],
        })
    }
}

/// Content made of periods, each with its key ids.
pub struct StaticContent {
    periods: Vec<(String, Vec<KeyId>)>,
}

impl StaticContent {
    pub fn new(periods: &[(&str, &[u8])]) -> Arc<Self> {
        Arc::new(Self {
            periods: periods
                .iter()
                .map(|(id, keys)| ((*id).to_owned(), kids(keys)))
                .collect(),
        })
    }

    pub fn locus(self: &Arc<Self>, period_id: &str) -> ContentLocus {
        ContentLocus::new(Arc::clone(self) as Arc<dyn ContentModel>, period_id)
    }
}

impl ContentModel for StaticContent {
    fn period_ids(&self) -> Vec<String> {
        self.periods.iter().map(|(id, _)| id.clone()).collect()
    }

    fn key_ids_for_period(&self, period_id: &str) -> Vec<KeyId> {
        self.periods
            .iter()
            .find(|(id, _)| id == period_id)
            .map(|(_, keys)| keys.clone())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub decryptor: ContentDecryptor,
    pub events: broadcast::Receiver<DrmEvent>,
    pub store: Arc<FakeSessionStore>,
    pub transport: Arc<FakeTransport>,
    pub negotiator: Arc<FakeNegotiator>,
    pub surface: Arc<FakeSurface>,
}

pub struct HarnessBuilder {
    store: FakeSessionStore,
    transport: FakeTransport,
    negotiator_gate: Option<Arc<Notify>>,
    negotiator_fails: bool,
    supports_persistent_sessions: bool,
    certificate_result: Result<bool, HostError>,
    surface_fails: bool,
    surface_gate: Option<Arc<Notify>>,
    certificate_gate: Option<Arc<Notify>>,
    configure: Box<dyn FnOnce(KeySystemOption) -> KeySystemOption>,
    config: DecryptorConfig,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            store: FakeSessionStore::new(),
            transport: FakeTransport::ok(),
            negotiator_gate: None,
            negotiator_fails: false,
            supports_persistent_sessions: true,
            certificate_result: Ok(true),
            surface_fails: false,
            surface_gate: None,
            certificate_gate: None,
            configure: Box::new(|option| option),
            config: DecryptorConfig::default(),
        }
    }

    pub fn store(mut self, store: FakeSessionStore) -> Self {
        self.store = store;
        self
    }

    pub fn transport(mut self, transport: FakeTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn negotiator_gate(mut self, gate: Arc<Notify>) -> Self {
        self.negotiator_gate = Some(gate);
        self
    }

    pub fn negotiator_fails(mut self) -> Self {
        self.negotiator_fails = true;
        self
    }

    pub fn without_persistent_sessions(mut self) -> Self {
        self.supports_persistent_sessions = false;
        self
    }

    pub fn certificate_result(mut self, result: Result<bool, HostError>) -> Self {
        self.certificate_result = result;
        self
    }

    pub fn surface_fails(mut self) -> Self {
        self.surface_fails = true;
        self
    }

    pub fn certificate_gate(mut self, gate: Arc<Notify>) -> Self {
        self.certificate_gate = Some(gate);
        self
    }

    pub fn surface_gate(mut self, gate: Arc<Notify>) -> Self {
        self.surface_gate = Some(gate);
        self
    }

    pub fn option<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(KeySystemOption) -> KeySystemOption + 'static,
    {
        self.configure = Box::new(configure);
        self
    }

    pub fn config(mut self, config: DecryptorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the decryptor; negotiation starts in the background.
    pub fn build(self) -> Harness {
        init_tracing();
        let store = Arc::new(self.store);
        let transport = Arc::new(self.transport);
        let negotiator = Arc::new(FakeNegotiator {
            gate: self.negotiator_gate,
            fail: self.negotiator_fails,
            supports_persistent_sessions: self.supports_persistent_sessions,
            media_keys: Arc::new(FakeMediaKeys {
                certificate_gate: self.certificate_gate,
                ..FakeMediaKeys::new(self.certificate_result)
            }),
            ..FakeNegotiator::new(Arc::clone(&store))
        });
        let surface = Arc::new(FakeSurface {
            fail: self.surface_fails,
            gate: self.surface_gate,
            ..FakeSurface::default()
        });

        let option = (self.configure)(
            KeySystemOption::new(WIDEVINE, Arc::clone(&transport) as Arc<dyn LicenseTransport>)
                .with_license_retry(fast_retry(2)),
        );
        let (events_tx, events) = broadcast::channel(256);
        let decryptor = ContentDecryptor::new(
            Arc::clone(&surface) as Arc<dyn MediaSurface>,
            Arc::clone(&negotiator) as Arc<dyn KeySystemNegotiator>,
            vec![option],
            self.config.with_events_tx(events_tx),
        );

        Harness {
            decryptor,
            events,
            store,
            transport,
            negotiator,
            surface,
        }
    }

    /// Build, attach and wait until the decryptor accepts content.
    pub async fn ready(self) -> Harness {
        let mut harness = self.build();
        harness
            .wait_for_state(DecryptorState::WaitingForAttachment)
            .await;
        harness.decryptor.attach().unwrap();
        harness.wait_for_state(DecryptorState::ReadyForContent).await;
        harness
    }
}

impl Harness {
    /// Next event matching `pred`, skipping the others.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> DrmEvent
    where
        F: FnMut(&DrmEvent) -> bool,
    {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(2), async move {
            loop {
                let event = events.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for a decryptor event")
    }

    pub async fn wait_for_state(&mut self, state: DecryptorState) {
        self.wait_for(|e| matches!(e, DrmEvent::StateChanged { state: s } if *s == state))
            .await;
    }

    /// Let spawned tasks run until they block.
    pub async fn settle(&self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    /// Every event received so far.
    pub fn drain_events(&mut self) -> Vec<DrmEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
