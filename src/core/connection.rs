//! Connection handle and the driver task that owns the socket.
//!
//! Every [`Connection`] handle talks to one driver task over a command channel.
//! The driver is the only place where the registry, the socket and the state
//! machine are touched, so commands, connect outcomes and socket events are
//! handled strictly one at a time.

use crate::core::config::{ConnectionOptions, Credentials};
use crate::core::dispatch::{dispatch_frame, fail_all};
use crate::core::errors::GremlinError;
use crate::core::kernel::{
    frame_request, Clock, GraphSonCodec, HealthProbe, QueryCodec, RequestEnvelope, RequestSigner,
    ReqwestProbe, SessionEvent, SigV4Signer, SocketSession, SystemClock, Transport,
    TungsteniteTransport, PROBE_TIMEOUT, STATUS_PATH,
};
use crate::core::registry::{Completion, RequestRegistry};
use crate::core::traits::RemoteConnection;
use crate::core::types::{ConnectionEvent, ConnectionState, RequestId, Traversers};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Path of the Gremlin socket endpoint
pub const GREMLIN_PATH: &str = "/gremlin";

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const EVENT_CHANNEL_CAPACITY: usize = 64;

type Reply = oneshot::Sender<Result<(), GremlinError>>;
type ConnectFuture = BoxFuture<'static, Result<Box<dyn SocketSession>, GremlinError>>;

enum Command {
    Open(Reply),
    Submit {
        gremlin: Value,
        completion: Completion,
    },
    Close(Reply),
}

/// Builder for [`Connection`], used to swap in collaborators
pub struct ConnectionBuilder<C: QueryCodec = GraphSonCodec> {
    options: ConnectionOptions,
    codec: C,
    credentials: Option<Credentials>,
    signer: Option<Arc<dyn RequestSigner>>,
    clock: Option<Arc<dyn Clock>>,
    transport: Option<Arc<dyn Transport>>,
    probe: Option<Arc<dyn HealthProbe>>,
}

impl ConnectionBuilder<GraphSonCodec> {
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            codec: GraphSonCodec,
            credentials: None,
            signer: None,
            clock: None,
            transport: None,
            probe: None,
        }
    }
}

impl<C: QueryCodec> ConnectionBuilder<C> {
    /// Use another query codec
    pub fn with_codec<D: QueryCodec>(self, codec: D) -> ConnectionBuilder<D> {
        ConnectionBuilder {
            options: self.options,
            codec,
            credentials: self.credentials,
            signer: self.signer,
            clock: self.clock,
            transport: self.transport,
            probe: self.probe,
        }
    }

    /// Sign with these credentials instead of resolving them from options and environment
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Replace the SigV4 signer entirely
    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Time source for the default signer
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Probe implementation used when `probe_health` is enabled
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Validate the configuration and start the connection driver.
    ///
    /// Must be called from within a tokio runtime. Nothing touches the network
    /// until `open` or `submit` is called.
    pub fn build(self) -> Result<Connection<C>, GremlinError> {
        let options = self.options;
        options.validate()?;

        let signer: Arc<dyn RequestSigner> = match self.signer {
            Some(signer) => signer,
            None => {
                let credentials = match self.credentials {
                    Some(credentials) => credentials,
                    None => Credentials::resolve(&options)?,
                };
                let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
                Arc::new(SigV4Signer::with_clock(credentials, clock))
            }
        };

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TungsteniteTransport::new(options.connect_timeout)));

        let probe: Option<Arc<dyn HealthProbe>> = if options.probe_health {
            let probe: Arc<dyn HealthProbe> = match self.probe {
                Some(probe) => probe,
                None => Arc::new(ReqwestProbe::new()?),
            };
            Some(probe)
        } else {
            None
        };

        let url = format!(
            "{}://{}:{}{}",
            options.socket_protocol(),
            options.host,
            options.port,
            GREMLIN_PATH
        );
        let traversal_source: Arc<str> = Arc::from(options.traversal_source.as_str());
        let codec = Arc::new(self.codec);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let driver = Driver {
            commands: commands_rx,
            codec: Arc::clone(&codec),
            signer,
            transport,
            probe,
            auto_reconnect: options.auto_reconnect,
            retries: 0,
            backoff: reconnect_backoff(options.reconnect_delay),
            options,
            state: ConnectionState::Disconnected,
            state_tx,
            events: events.clone(),
            registry: RequestRegistry::new(),
            session: None,
            attempt: None,
            open_waiters: Vec::new(),
            queued: Vec::new(),
        };

        let span = info_span!("gremlin_connection", url = %url);
        tokio::spawn(driver.run().instrument(span));

        Ok(Connection {
            commands: commands_tx,
            state: state_rx,
            events,
            codec,
            url: Arc::from(url.as_str()),
            traversal_source,
        })
    }
}

/// Handle to one multiplexed, SigV4-authenticated Gremlin socket.
///
/// Handles are cheap to clone and may be used concurrently; all of them share
/// the same socket. Dropping the last handle closes the connection.
pub struct Connection<C: QueryCodec = GraphSonCodec> {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    codec: Arc<C>,
    url: Arc<str>,
    traversal_source: Arc<str>,
}

impl<C: QueryCodec> Clone for Connection<C> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
            codec: Arc::clone(&self.codec),
            url: Arc::clone(&self.url),
            traversal_source: Arc::clone(&self.traversal_source),
        }
    }
}

impl<C: QueryCodec> std::fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("traversal_source", &self.traversal_source)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Connection<GraphSonCodec> {
    /// Create a connection with the default transport, codec and signer
    pub fn new(options: ConnectionOptions) -> Result<Self, GremlinError> {
        ConnectionBuilder::new(options).build()
    }

    pub fn builder(options: ConnectionOptions) -> ConnectionBuilder<GraphSonCodec> {
        ConnectionBuilder::new(options)
    }
}

impl<C: QueryCodec> Connection<C> {
    /// Open the socket if it is not open yet.
    ///
    /// Concurrent callers share a single attempt and receive the same outcome.
    pub async fn open(&self) -> Result<(), GremlinError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Open(tx))?;
        rx.await.unwrap_or_else(|_| Err(self.terminal_error()))
    }

    /// Submit a query and wait for all of its results.
    ///
    /// Encoding failures are returned before anything is sent.
    pub async fn submit(&self, query: C::Query) -> Result<Traversers, GremlinError> {
        let gremlin = self.codec.encode_query(&query)?;
        let (completion, rx) = Completion::channel();
        self.send(Command::Submit {
            gremlin,
            completion,
        })?;
        rx.await.unwrap_or_else(|_| Err(self.terminal_error()))
    }

    /// Close the socket and fail every pending request. Closing is final.
    pub async fn close(&self) -> Result<(), GremlinError> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close(tx)).is_err() {
            // Driver already stopped
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().is_open()
    }

    /// Receiver tracking every state transition
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribe to connection-level events.
    ///
    /// A live subscriber counts as an observer of socket errors: without one,
    /// an unrecoverable socket error stops the connection.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn traversal_source(&self) -> &str {
        &self.traversal_source
    }

    fn send(&self, command: Command) -> Result<(), GremlinError> {
        self.commands
            .send(command)
            .map_err(|_| self.terminal_error())
    }

    fn terminal_error(&self) -> GremlinError {
        match &*self.state.borrow() {
            ConnectionState::Failed(error) => error.clone(),
            _ => closed_error(),
        }
    }
}

#[async_trait]
impl<C: QueryCodec> RemoteConnection for Connection<C> {
    type Query = C::Query;

    async fn open(&self) -> Result<(), GremlinError> {
        Connection::open(self).await
    }

    async fn submit(&self, query: Self::Query) -> Result<Traversers, GremlinError> {
        Connection::submit(self, query).await
    }

    async fn close(&self) -> Result<(), GremlinError> {
        Connection::close(self).await
    }
}

fn closed_error() -> GremlinError {
    GremlinError::ConnectionClosed("connection closed by client".to_string())
}

/// Delays of `base`, `2 * base`, `4 * base`, ... capped at one minute
fn reconnect_backoff(base: Duration) -> ExponentialBackoff {
    let factor = u64::try_from(base.as_millis() / 2).unwrap_or(u64::MAX);
    ExponentialBackoff::from_millis(2)
        .factor(factor)
        .max_delay(MAX_RECONNECT_DELAY)
}

enum Flow {
    Continue,
    Stop,
}

struct Driver<C: QueryCodec> {
    commands: mpsc::UnboundedReceiver<Command>,
    codec: Arc<C>,
    signer: Arc<dyn RequestSigner>,
    transport: Arc<dyn Transport>,
    probe: Option<Arc<dyn HealthProbe>>,
    options: ConnectionOptions,
    auto_reconnect: bool,
    /// Failed attempts since the last successful connect
    retries: u32,
    backoff: ExponentialBackoff,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    registry: RequestRegistry,
    session: Option<Box<dyn SocketSession>>,
    attempt: Option<ConnectFuture>,
    open_waiters: Vec<Reply>,
    /// Submissions waiting for the socket to open
    queued: Vec<(Value, Completion)>,
}

impl<C: QueryCodec> Driver<C> {
    async fn run(mut self) {
        debug!("Connection driver started");
        loop {
            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All connection handles dropped");
                        self.shutdown().await;
                        Flow::Stop
                    }
                },
                outcome = poll_attempt(&mut self.attempt) => {
                    self.attempt = None;
                    self.on_connect_outcome(outcome).await
                }
                event = poll_session(&mut self.session) => self.on_session_event(event).await,
            };

            if matches!(flow, Flow::Stop) {
                break;
            }
        }
        debug!(state = ?self.state, "Connection driver stopped");
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Open(reply) => {
                match &self.state {
                    ConnectionState::Open => {
                        let _ = reply.send(Ok(()));
                    }
                    ConnectionState::Connecting => self.open_waiters.push(reply),
                    ConnectionState::Disconnected | ConnectionState::Failed(_) => {
                        self.open_waiters.push(reply);
                        self.start_attempt(Duration::ZERO);
                    }
                    ConnectionState::Closing | ConnectionState::Closed => {
                        let _ = reply.send(Err(closed_error()));
                    }
                }
                Flow::Continue
            }
            Command::Submit {
                gremlin,
                completion,
            } => {
                match &self.state {
                    ConnectionState::Open => self.send_request(gremlin, completion).await,
                    ConnectionState::Connecting => self.queued.push((gremlin, completion)),
                    ConnectionState::Disconnected | ConnectionState::Failed(_)
                        if self.auto_reconnect =>
                    {
                        self.queued.push((gremlin, completion));
                        self.start_attempt(Duration::ZERO);
                    }
                    ConnectionState::Disconnected | ConnectionState::Failed(_) => {
                        completion.resolve(Err(GremlinError::NotConnected));
                    }
                    ConnectionState::Closing | ConnectionState::Closed => {
                        completion.resolve(Err(closed_error()));
                    }
                }
                Flow::Continue
            }
            Command::Close(reply) => {
                self.shutdown().await;
                let _ = reply.send(Ok(()));
                Flow::Stop
            }
        }
    }

    fn start_attempt(&mut self, delay: Duration) {
        self.set_state(ConnectionState::Connecting);
        self.attempt = Some(Box::pin(connect_once(
            Arc::clone(&self.signer),
            Arc::clone(&self.transport),
            self.probe.clone(),
            Target::from(&self.options),
            delay,
        )));
    }

    async fn on_connect_outcome(
        &mut self,
        outcome: Result<Box<dyn SocketSession>, GremlinError>,
    ) -> Flow {
        match outcome {
            Ok(session) => {
                info!(retries = self.retries, "Connected");
                self.session = Some(session);
                self.retries = 0;
                self.backoff = reconnect_backoff(self.options.reconnect_delay);
                self.set_state(ConnectionState::Open);
                for waiter in self.open_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.emit(ConnectionEvent::Connected);

                for (gremlin, completion) in std::mem::take(&mut self.queued) {
                    self.send_request(gremlin, completion).await;
                }
            }
            Err(error) => {
                warn!(%error, retries = self.retries, "Connection attempt failed");
                if error.is_connection_level() && self.should_retry() {
                    self.schedule_retry();
                } else {
                    for waiter in self.open_waiters.drain(..) {
                        let _ = waiter.send(Err(error.clone()));
                    }
                    for (_, completion) in self.queued.drain(..) {
                        completion.resolve(Err(error.clone()));
                    }
                    self.set_state(ConnectionState::Failed(error.clone()));
                    self.emit(ConnectionEvent::Failed(error));
                }
            }
        }
        Flow::Continue
    }

    async fn on_session_event(&mut self, event: SessionEvent) -> Flow {
        match event {
            SessionEvent::Message(payload) => {
                match self.codec.decode_frame(&payload) {
                    Ok(frame) => {
                        let outcome = dispatch_frame(&mut self.registry, frame);
                        trace!(?outcome, "Dispatched frame");
                    }
                    Err(error) => {
                        fail_all(&mut self.registry, &error);
                    }
                }
                Flow::Continue
            }
            SessionEvent::Closed { code, reason } => {
                self.session = None;
                let reason = match code {
                    Some(code) if reason.is_empty() => format!("socket closed with code {}", code),
                    Some(code) => format!("socket closed with code {}: {}", code, reason),
                    None if reason.is_empty() => "socket closed".to_string(),
                    None => format!("socket closed: {}", reason),
                };
                let drained = self
                    .registry
                    .drain_all(&GremlinError::ConnectionClosed(reason.clone()));
                info!(drained, %reason, "Disconnected");

                if self.should_retry() {
                    self.schedule_retry();
                } else {
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(ConnectionEvent::Disconnected { reason });
                }
                Flow::Continue
            }
            SessionEvent::Error(error) => {
                self.session = None;
                let drained = self.registry.drain_all(&error);
                warn!(%error, drained, "Socket error");

                if self.should_retry() {
                    self.schedule_retry();
                    return Flow::Continue;
                }

                self.set_state(ConnectionState::Failed(error.clone()));
                if drained == 0 && self.events.receiver_count() == 0 {
                    error!(%error, "Unobserved socket error with reconnection disabled, stopping connection");
                    return Flow::Stop;
                }
                self.emit(ConnectionEvent::Failed(error));
                Flow::Continue
            }
        }
    }

    async fn send_request(&mut self, gremlin: Value, completion: Completion) {
        let id = self.fresh_request_id();
        let envelope = RequestEnvelope::bytecode(id, &gremlin, &self.options.traversal_source);
        let frame = match frame_request(&self.options.mime_type, &envelope) {
            Ok(frame) => frame,
            Err(error) => {
                completion.resolve(Err(error));
                return;
            }
        };

        if let Err(error) = self.registry.register(id, completion) {
            warn!(request_id = %id, %error, "Could not register request");
            return;
        }

        let Some(session) = self.session.as_mut() else {
            self.registry.complete(&id, Err(GremlinError::NotConnected));
            return;
        };

        trace!(request_id = %id, bytes = frame.len(), "Sending request");
        if let Err(error) = session.send(frame).await {
            warn!(request_id = %id, %error, "Failed to send request");
            self.registry.complete(&id, Err(error));
        }
    }

    fn fresh_request_id(&self) -> RequestId {
        loop {
            let id = RequestId::new_v4();
            if !self.registry.contains(&id) {
                return id;
            }
        }
    }

    fn should_retry(&self) -> bool {
        self.auto_reconnect && self.retries < self.options.max_retry
    }

    fn schedule_retry(&mut self) {
        self.retries += 1;
        let delay = self.backoff.next().unwrap_or(MAX_RECONNECT_DELAY);
        debug!(attempt = self.retries, ?delay, "Scheduling reconnect");
        self.emit(ConnectionEvent::Reconnecting {
            attempt: self.retries,
        });
        self.start_attempt(delay);
    }

    async fn shutdown(&mut self) {
        self.auto_reconnect = false;
        let error = closed_error();

        if self.attempt.take().is_some() {
            debug!("Abandoning connection attempt");
        }
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        for (_, completion) in self.queued.drain(..) {
            completion.resolve(Err(error.clone()));
        }

        if let Some(mut session) = self.session.take() {
            self.set_state(ConnectionState::Closing);
            if let Err(e) = session.close().await {
                warn!(error = %e, "Error while closing socket");
            }
        }

        let drained = self.registry.drain_all(&error);
        info!(drained, "Connection closed");
        self.set_state(ConnectionState::Closed);
        self.emit(ConnectionEvent::Closed);
    }

    fn set_state(&mut self, state: ConnectionState) {
        trace!(from = ?self.state, to = ?state, "State transition");
        self.state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Endpoint details needed by one connect attempt
struct Target {
    host: String,
    port: u16,
    socket_protocol: &'static str,
    http_protocol: &'static str,
}

impl From<&ConnectionOptions> for Target {
    fn from(options: &ConnectionOptions) -> Self {
        Self {
            host: options.host.clone(),
            port: options.port,
            socket_protocol: options.socket_protocol(),
            http_protocol: options.http_protocol(),
        }
    }
}

/// One connect attempt: wait, optionally probe, sign afresh, open the socket
async fn connect_once(
    signer: Arc<dyn RequestSigner>,
    transport: Arc<dyn Transport>,
    probe: Option<Arc<dyn HealthProbe>>,
    target: Target,
    delay: Duration,
) -> Result<Box<dyn SocketSession>, GremlinError> {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    if let Some(probe) = probe {
        let request = signer.sign(&target.host, target.port, STATUS_PATH, target.http_protocol)?;
        tokio::time::timeout(PROBE_TIMEOUT, probe.check(&request))
            .await
            .map_err(|_| GremlinError::ConnectError("Health check timed out".to_string()))??;
        trace!("Health check passed");
    }

    let request = signer.sign(&target.host, target.port, GREMLIN_PATH, target.socket_protocol)?;
    debug!(url = %request.url, "Opening socket");
    transport.connect(&request).await
}

async fn poll_attempt(
    attempt: &mut Option<ConnectFuture>,
) -> Result<Box<dyn SocketSession>, GremlinError> {
    match attempt {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn poll_session(session: &mut Option<Box<dyn SocketSession>>) -> SessionEvent {
    match session {
        Some(session) => session.next_event().await,
        None => std::future::pending().await,
    }
}
