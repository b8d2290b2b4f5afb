//! Connection lifecycle management
//!
//! A [`Connection`] owns the transport link, the session and the frame
//! reassembler. It drives the handshake (key exchange, auth status, auto
//! authentication), serializes writes with retries, and reconnects with a
//! linear backoff after unexpected disconnects.

use crate::backoff::ReconnectPolicy;
use crate::config::ConnectionConfig;
use crate::error::{AuthFailure, ConnectionError};
use crate::persistence::HistoryLog;
use crate::state::ConnectionState;
use crate::tasks::TaskSet;
use ecoflow_protocol::commands::time_sync_payload;
use ecoflow_protocol::session::auth_payload;
use ecoflow_protocol::{
    Candidate, Command, EcdhHandshake, EncPacket, Framing, KeyStrategy, KeyTable, Packet,
    ProtocolError, Reassembler, Session, Transport, TransportError, TransportEvent,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Wire-level behaviour of a device family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolProfile {
    pub framing: Framing,
    pub key_strategy: KeyStrategy,
    /// Whether inner packet payloads are XOR-obfuscated
    pub xor_payload: bool,
}

/// Who we are talking to, and as whom
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub serial: String,
    pub user_id: String,
}

/// Response a pending request waits for
#[derive(Debug, Clone, Copy)]
enum Expect {
    /// Plaintext handshake command frame
    Command,
    /// Inner packet carrying this command
    Packet(Command),
}

#[derive(Debug)]
enum Reply {
    Command(Vec<u8>),
    Packet(Packet),
}

/// One-shot response handler
struct Pending {
    expect: Expect,
    tx: oneshot::Sender<Reply>,
}

impl Pending {
    fn expects(&self, reply: &Reply) -> bool {
        match (self.expect, reply) {
            (Expect::Command, Reply::Command(_)) => true,
            (Expect::Packet(command), Reply::Packet(packet)) => command.matches(packet),
            _ => false,
        }
    }
}

/// Per-link mutable state, reset on every connect
struct Link {
    session: Option<Session>,
    reassembler: Box<dyn Reassembler>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    profile: ProtocolProfile,
    identity: DeviceIdentity,
    config: ConnectionConfig,
    key_table: Option<Arc<KeyTable>>,
    state_tx: watch::Sender<ConnectionState>,
    packet_tx: broadcast::Sender<Packet>,
    link: Mutex<Link>,
    pending: Mutex<Option<Pending>>,
    write_lock: Mutex<()>,
    reader: Mutex<Option<CancellationToken>>,
    backoff: Mutex<ReconnectPolicy>,
    /// Cancelled by an explicit disconnect
    shutdown: Mutex<CancellationToken>,
    retry: AtomicBool,
    errors: AtomicU32,
    sequence: AtomicU32,
    tasks: TaskSet,
    history: Option<HistoryLog>,
}

/// Handle to a device connection
///
/// Cloning is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create an idle connection in state `INIT`
    ///
    /// Must be called from within a Tokio runtime when a history directory
    /// is configured.
    pub fn new(
        transport: Arc<dyn Transport>,
        profile: ProtocolProfile,
        identity: DeviceIdentity,
        config: ConnectionConfig,
        key_table: Option<Arc<KeyTable>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Init);
        let (packet_tx, _) = broadcast::channel(64);
        let history = config
            .history_dir
            .as_deref()
            .map(|dir| HistoryLog::spawn(dir, &identity.serial));

        let inner = Inner {
            transport,
            profile,
            link: Mutex::new(Link {
                session: None,
                reassembler: profile.framing.reassembler(),
            }),
            backoff: Mutex::new(ReconnectPolicy::from_config(&config)),
            shutdown: Mutex::new(CancellationToken::new()),
            retry: AtomicBool::new(config.retry),
            identity,
            config,
            key_table,
            state_tx,
            packet_tx,
            pending: Mutex::new(None),
            write_lock: Mutex::new(()),
            reader: Mutex::new(None),
            errors: AtomicU32::new(0),
            sequence: AtomicU32::new(1),
            tasks: TaskSet::new(),
            history,
        };
        if let Some(history) = &inner.history {
            history.record(ConnectionState::Init);
        }
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Connect and authenticate, retrying within the establish timeout
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.inner.tasks.cancel_all().await;
        *self.inner.shutdown.lock().await = CancellationToken::new();
        self.inner
            .retry
            .store(self.inner.config.retry, Ordering::SeqCst);
        self.inner.establish(false).await
    }

    /// Disconnect, cancel pending reconnects and all background work
    pub async fn disconnect(&self) {
        self.inner.shutdown.lock().await.cancel();
        self.inner.retry.store(false, Ordering::SeqCst);
        self.inner.tasks.cancel_all().await;
        self.inner.abandon_link().await;
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Send an application packet over the authenticated session
    pub async fn send_packet(&self, packet: Packet) -> Result<(), ConnectionError> {
        let state = self.state();
        if state != ConnectionState::Authenticated {
            return Err(ConnectionError::NotConnected(state));
        }
        self.inner.send_packet(packet).await
    }

    /// Wait until the connection reaches `target`
    pub async fn wait_for(
        &self,
        target: ConnectionState,
        limit: Duration,
    ) -> Result<(), ConnectionError> {
        let mut rx = self.inner.state_tx.subscribe();
        let result = match timeout(limit, rx.wait_for(|state| *state == target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ConnectionError::NotConnected(self.state())),
            Err(_) => Err(ConnectionError::Timeout("connection state")),
        };
        result
    }

    /// Count a parse/decode error against the reconnect threshold
    pub fn record_error(&self) {
        self.inner.record_error();
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Observe state transitions
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Packets received after authentication
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Packet> {
        self.inner.packet_tx.subscribe()
    }

    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.inner.errors.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn serial(&self) -> &str {
        &self.inner.identity.serial
    }

    #[must_use]
    pub fn profile(&self) -> ProtocolProfile {
        self.inner.profile
    }

    /// Number of live background tasks
    #[must_use]
    pub fn background_tasks(&self) -> usize {
        self.inner.tasks.len()
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous == state {
            return;
        }
        if state.is_error() {
            tracing::warn!("{}: {} -> {}", self.identity.serial, previous, state);
        } else {
            tracing::info!("{}: {} -> {}", self.identity.serial, previous, state);
        }
        if let Some(history) = &self.history {
            history.record(state);
        }
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Attempt until connected, a non-retryable error, the deadline, or a
    /// disconnect
    async fn establish(self: &Arc<Self>, delay_first: bool) -> Result<(), ConnectionError> {
        let shutdown = self.shutdown.lock().await.clone();
        let deadline = Instant::now() + self.config.establish_timeout();
        let mut attempts = 0u32;
        let mut last: Option<ConnectionError> = None;

        loop {
            if delay_first || last.is_some() {
                let delay = self.backoff.lock().await.next_delay();
                if Instant::now() + delay >= deadline {
                    let last = last.unwrap_or(ConnectionError::Timeout("establishment"));
                    tracing::error!(
                        "{}: giving up after {} attempts: {}",
                        self.identity.serial,
                        attempts,
                        last
                    );
                    return Err(ConnectionError::Exhausted {
                        attempts,
                        last: Box::new(last),
                    });
                }
                self.set_state(ConnectionState::Reconnecting);
                tracing::info!("{}: reconnecting in {:?}", self.identity.serial, delay);
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {}
                    () = tokio::time::sleep(delay) => {}
                }
            }
            if shutdown.is_cancelled() || (attempts > 0 && !self.retry.load(Ordering::SeqCst)) {
                tracing::debug!("{}: pending reconnect cancelled", self.identity.serial);
                return Err(ConnectionError::Cancelled);
            }

            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = tokio::select! {
                biased;
                () = shutdown.cancelled() => Err(ConnectionError::Cancelled),
                result = timeout(remaining, self.attempt()) => {
                    result.unwrap_or(Err(ConnectionError::Timeout("establishment")))
                }
            };

            match result {
                Ok(()) => return Ok(()),
                // The disconnect already tore the link down and set the state
                Err(ConnectionError::Cancelled) => {
                    tracing::debug!("{}: connection attempt cancelled", self.identity.serial);
                    return Err(ConnectionError::Cancelled);
                }
                Err(e) => {
                    self.abandon_link().await;
                    if shutdown.is_cancelled() {
                        return Err(ConnectionError::Cancelled);
                    }
                    self.set_state(e.state());
                    if !e.is_retryable() || !self.retry.load(Ordering::SeqCst) {
                        tracing::error!("{}: connection failed: {}", self.identity.serial, e);
                        return Err(e);
                    }
                    tracing::warn!(
                        "{}: attempt {} failed: {}",
                        self.identity.serial,
                        attempts,
                        e
                    );
                    last = Some(e);
                }
            }
        }
    }

    /// One connect + handshake + authentication pass
    async fn attempt(self: &Arc<Self>) -> Result<(), ConnectionError> {
        self.abandon_link().await;
        self.errors.store(0, Ordering::SeqCst);
        if self.profile.key_strategy == KeyStrategy::Ecdh && self.key_table.is_none() {
            return Err(ConnectionError::MissingKeyTable);
        }

        self.set_state(ConnectionState::Connecting);
        let events = match timeout(self.config.connect_timeout(), self.transport.connect()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout("transport connect")),
        };
        self.set_state(ConnectionState::Connected);
        self.start_reader(events).await;

        let session = match self.profile.key_strategy {
            KeyStrategy::Ecdh => self.ecdh_handshake().await?,
            KeyStrategy::SerialDerived => Session::from_serial(&self.identity.serial),
        };
        self.link.lock().await.session = Some(session);

        self.authenticate().await?;
        self.backoff.lock().await.reset();
        self.set_state(ConnectionState::Authenticated);
        Ok(())
    }

    async fn ecdh_handshake(self: &Arc<Self>) -> Result<Session, ConnectionError> {
        if self.profile.framing != Framing::Wrapped {
            return Err(ConnectionError::Transport(TransportError::Unsupported(
                "key exchange requires wrapped framing".to_string(),
            )));
        }
        let table = self.key_table.clone().ok_or(ConnectionError::MissingKeyTable)?;

        self.set_state(ConnectionState::KeyExchange);
        let mut handshake = EcdhHandshake::new();
        let response = self
            .command(handshake.public_key_request(), "public key")
            .await?;
        handshake.handle_public_key_response(&response)?;

        self.set_state(ConnectionState::RequestingSessionKey);
        let response = self.command(handshake.key_info_request(), "key info").await?;
        Ok(handshake.handle_key_info_response(&response, &table)?)
    }

    async fn authenticate(self: &Arc<Self>) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::RequestingAuthStatus);
        let status = self
            .packet_request(Command::AuthStatus, Vec::new(), "auth status")
            .await?;
        tracing::debug!("Auth status response: {:02X?}", status.payload());

        self.set_state(ConnectionState::Authenticating);
        let payload = auth_payload(&self.identity.user_id, &self.identity.serial);
        let response = self
            .packet_request(Command::AutoAuthentication, payload, "authentication")
            .await?;

        match AuthFailure::from_payload(response.payload()) {
            None => Ok(()),
            Some(reason) => Err(ConnectionError::AuthFailed(reason)),
        }
    }

    /// Send a plaintext command frame and wait for the command reply
    async fn command(
        self: &Arc<Self>,
        payload: Vec<u8>,
        what: &'static str,
    ) -> Result<Vec<u8>, ConnectionError> {
        let frame = EncPacket::command(payload).encode()?;
        match self.request(Expect::Command, frame, what).await? {
            Reply::Command(payload) => Ok(payload),
            Reply::Packet(_) => Err(ProtocolError::UnexpectedResponse(what.to_string()).into()),
        }
    }

    /// Send a command packet and wait for the packet answering it
    async fn packet_request(
        self: &Arc<Self>,
        command: Command,
        payload: Vec<u8>,
        what: &'static str,
    ) -> Result<Packet, ConnectionError> {
        let packet = command.packet(payload).with_sequence(self.next_sequence());
        let frame = self.frame_packet(&packet).await?;
        match self.request(Expect::Packet(command), frame, what).await? {
            Reply::Packet(packet) => Ok(packet),
            Reply::Command(_) => Err(ProtocolError::UnexpectedResponse(what.to_string()).into()),
        }
    }

    async fn request(
        &self,
        expect: Expect,
        frame: Vec<u8>,
        what: &'static str,
    ) -> Result<Reply, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        *self.pending.lock().await = Some(Pending { expect, tx });
        self.write(&frame).await?;

        match timeout(self.config.response_timeout(), rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Handler dropped by a link reset
            Ok(Err(_)) => Err(ConnectionError::Transport(TransportError::Disconnected)),
            Err(_) => {
                self.pending.lock().await.take();
                Err(ConnectionError::Timeout(what))
            }
        }
    }

    async fn frame_packet(&self, packet: &Packet) -> Result<Vec<u8>, ConnectionError> {
        let bytes = packet.encode(self.profile.xor_payload)?;
        let link = self.link.lock().await;
        let session = link.session.as_ref().ok_or(ProtocolError::NoSession)?;
        Ok(self.profile.framing.encode_packet(&bytes, session)?)
    }

    async fn send_packet(self: &Arc<Self>, packet: Packet) -> Result<(), ConnectionError> {
        let packet = packet.with_sequence(self.next_sequence());
        tracing::debug!(
            "Sending packet cmd_set={:#04X} cmd_id={:#04X} payload={:02X?}",
            packet.cmd_set(),
            packet.cmd_id(),
            packet.payload()
        );
        let frame = self.frame_packet(&packet).await?;
        if let Err(e) = self.write(&frame).await {
            self.set_state(ConnectionState::ErrorSendRequest);
            self.errors.fetch_add(1, Ordering::SeqCst);
            self.spawn_restart("send failure");
            return Err(e);
        }
        Ok(())
    }

    /// Serialized write with linear backoff between attempts
    async fn write(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let _guard = self.write_lock.lock().await;
        let attempts = self.config.write_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transport.write(data).await {
                Ok(()) => {
                    tracing::debug!("Wrote {} bytes: {:02X?}", data.len(), data);
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!("Write attempt {}/{} failed: {}", attempt, attempts, e);
                    tokio::time::sleep(self.config.write_backoff() * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("Write failed after {} attempts: {}", attempts, e);
                    return Err(e.into());
                }
            }
        }
    }

    async fn start_reader(self: &Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        let inner = Arc::clone(self);
        let token = self.tasks.spawn("reader", async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Notification(data) => inner.handle_notification(&data).await,
                    TransportEvent::Disconnected => break,
                }
            }
            inner.spawn_restart("transport disconnected");
        });
        if let Some(old) = self.reader.lock().await.replace(token) {
            old.cancel();
        }
    }

    async fn handle_notification(self: &Arc<Self>, data: &[u8]) {
        tracing::debug!("Notification ({} bytes): {:02X?}", data.len(), data);
        let candidates = {
            let mut link = self.link.lock().await;
            let Link {
                session,
                reassembler,
            } = &mut *link;
            reassembler.feed(data, session.as_ref())
        };

        for candidate in candidates {
            match candidate {
                Candidate::Command(payload) => {
                    if let Some(Reply::Command(payload)) = self.deliver(Reply::Command(payload)).await
                    {
                        tracing::debug!("Unsolicited command frame: {:02X?}", payload);
                    }
                }
                Candidate::Packet(bytes) => match Packet::decode(&bytes, self.profile.xor_payload) {
                    Ok(packet) => self.handle_packet(packet).await,
                    Err(e) => {
                        tracing::warn!("Failed to parse packet: {}", e);
                        self.record_error();
                    }
                },
            }
        }
    }

    async fn handle_packet(self: &Arc<Self>, packet: Packet) {
        let Some(Reply::Packet(packet)) = self.deliver(Reply::Packet(packet)).await else {
            return;
        };

        if Command::TimeSyncRequest.matches(&packet) {
            self.schedule_time_sync();
            return;
        }
        if self.state() != ConnectionState::Authenticated {
            tracing::debug!(
                "Dropping packet cmd_set={:#04X} cmd_id={:#04X} before authentication",
                packet.cmd_set(),
                packet.cmd_id()
            );
            return;
        }
        // No receivers just means nobody is listening yet
        let _ = self.packet_tx.send(packet);
    }

    /// Hand `reply` to the pending handler, or give it back
    async fn deliver(&self, reply: Reply) -> Option<Reply> {
        let mut pending = self.pending.lock().await;
        match pending.take() {
            Some(handler) if handler.expects(&reply) => {
                let _ = handler.tx.send(reply);
                None
            }
            other => {
                *pending = other;
                Some(reply)
            }
        }
    }

    fn schedule_time_sync(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.tasks.spawn("time-sync", async move {
            let now = chrono::Local::now();
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let unix_secs = now.timestamp() as u32;
            let offset_hours = i8::try_from(now.offset().local_minus_utc() / 3600).unwrap_or(0);
            let reply = Command::TimeSyncReply.packet(time_sync_payload(unix_secs, offset_hours));
            if let Err(e) = inner.send_packet(reply).await {
                tracing::warn!("Failed to answer time sync request: {}", e);
            }
        });
    }

    fn record_error(self: &Arc<Self>) {
        let count = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
        if count > self.config.error_threshold {
            tracing::warn!(
                "{}: {} errors exceed threshold {}, forcing reconnect",
                self.identity.serial,
                count,
                self.config.error_threshold
            );
            self.errors.store(0, Ordering::SeqCst);
            self.spawn_restart("error threshold");
        }
    }

    fn spawn_restart(self: &Arc<Self>, reason: &'static str) {
        let inner = Arc::clone(self);
        self.tasks.spawn("restart", async move { inner.restart(reason).await });
    }

    /// React to a lost or unhealthy link
    async fn restart(self: &Arc<Self>, reason: &'static str) {
        let state = self.state();
        if state.is_establishing() {
            // The running attempt fails on its own and owns the retry
            tracing::debug!("Link lost during {} ({})", state, reason);
            self.reset_link().await;
            return;
        }
        if !matches!(
            state,
            ConnectionState::Authenticated | ConnectionState::ErrorSendRequest
        ) {
            tracing::debug!("Ignoring link loss in state {} ({})", state, reason);
            return;
        }

        tracing::info!("{}: restarting link ({})", self.identity.serial, reason);
        self.tasks.cancel_all().await;
        self.abandon_link().await;
        self.set_state(ConnectionState::Disconnected);

        if self.retry.load(Ordering::SeqCst) {
            let inner = Arc::clone(self);
            self.tasks.spawn("reconnect", async move {
                match inner.establish(true).await {
                    Ok(()) | Err(ConnectionError::Cancelled) => {}
                    Err(e) => tracing::error!("{}: reconnect failed: {}", inner.identity.serial, e),
                }
            });
        }
    }

    /// Stop the reader, close the transport and forget the session
    async fn abandon_link(&self) {
        if let Some(token) = self.reader.lock().await.take() {
            token.cancel();
        }
        if let Err(e) = self.transport.disconnect().await {
            tracing::debug!("Transport disconnect failed: {}", e);
        }
        self.reset_link().await;
    }

    async fn reset_link(&self) {
        {
            let mut link = self.link.lock().await;
            link.session = None;
            link.reassembler.clear();
        }
        self.pending.lock().await.take();
    }
}
