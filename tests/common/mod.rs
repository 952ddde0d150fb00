#![allow(dead_code)]

use async_trait::async_trait;
use gremlin_sigv4::core::kernel::{HealthProbe, SessionEvent, SocketSession, Transport};
use gremlin_sigv4::{
    Connection, ConnectionOptions, Credentials, GremlinError, SignedRequest,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// What the scripted transport does on one connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Refuse,
}

/// In-memory transport that follows a script of connect outcomes.
///
/// Attempts beyond the script are refused. Each accepted attempt yields a
/// [`MockServer`] on the channel returned by `new`.
pub struct MockTransport {
    script: Mutex<VecDeque<Outcome>>,
    attempts: AtomicUsize,
    requests: Mutex<Vec<SignedRequest>>,
    gate: watch::Receiver<bool>,
    servers: mpsc::UnboundedSender<MockServer>,
}

/// Releases connect attempts held by a gated transport
pub struct Gate(watch::Sender<bool>);

impl Gate {
    pub fn release(&self) {
        self.0.send_replace(true);
    }
}

impl MockTransport {
    pub fn new(script: Vec<Outcome>) -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        let (transport, servers, gate) = Self::gated(script);
        gate.release();
        (transport, servers)
    }

    /// Like `new`, but every attempt waits until the gate is released
    pub fn gated(
        script: Vec<Outcome>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>, Gate) {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = watch::channel(false);
        let transport = Arc::new(Self {
            script: Mutex::new(script.into()),
            attempts: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            gate: gate_rx,
            servers: servers_tx,
        });
        (transport, servers_rx, Gate(gate_tx))
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SignedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        request: &SignedRequest,
    ) -> Result<Box<dyn SocketSession>, GremlinError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let mut gate = self.gate.clone();
        while !*gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                break;
            }
        }

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Refuse);

        match outcome {
            Outcome::Refuse => Err(GremlinError::ConnectError(
                "connection refused".to_string(),
            )),
            Outcome::Accept => {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let (frames_tx, frames_rx) = mpsc::unbounded_channel();
                let _ = self.servers.send(MockServer {
                    events: events_tx,
                    frames: frames_rx,
                });
                Ok(Box::new(MockSession {
                    events: events_rx,
                    frames: frames_tx,
                }))
            }
        }
    }
}

struct MockSession {
    events: mpsc::UnboundedReceiver<SessionEvent>,
    frames: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl SocketSession for MockSession {
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), GremlinError> {
        self.frames
            .send(payload)
            .map_err(|_| GremlinError::NetworkError("peer gone".to_string()))
    }

    async fn next_event(&mut self) -> SessionEvent {
        self.events.recv().await.unwrap_or(SessionEvent::Closed {
            code: None,
            reason: "server dropped".to_string(),
        })
    }

    async fn close(&mut self) -> Result<(), GremlinError> {
        self.events.close();
        Ok(())
    }
}

/// Server side of one accepted mock socket
pub struct MockServer {
    events: mpsc::UnboundedSender<SessionEvent>,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MockServer {
    /// Next request frame written by the client
    pub async fn next_frame(&mut self) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("timed out waiting for a request frame")
            .expect("client session dropped")
    }

    /// Id of the next request written by the client
    pub async fn next_request_id(&mut self) -> String {
        request_id(&self.next_frame().await)
    }

    pub fn respond(&self, request_id: &str, code: u16, data: Value) {
        self.send_json(&json!({
            "requestId": request_id,
            "status": { "code": code, "message": "" },
            "result": { "data": data },
        }));
    }

    pub fn respond_error(&self, request_id: &str, code: u16, message: &str) {
        self.send_json(&json!({
            "requestId": request_id,
            "status": { "code": code, "message": message },
            "result": { "data": null },
        }));
    }

    pub fn send_json(&self, value: &Value) {
        self.send_raw(serde_json::to_vec(value).unwrap());
    }

    pub fn send_raw(&self, payload: Vec<u8>) {
        let _ = self.events.send(SessionEvent::Message(payload));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.events.send(SessionEvent::Closed {
            code: Some(code),
            reason: reason.to_string(),
        });
    }

    pub fn fail(&self, error: GremlinError) {
        let _ = self.events.send(SessionEvent::Error(error));
    }
}

/// Split a request frame into its mime type and JSON envelope
pub fn parse_frame(frame: &[u8]) -> (String, Value) {
    let len = usize::from(frame[0]);
    let mime = String::from_utf8(frame[1..=len].to_vec()).unwrap();
    let envelope = serde_json::from_slice(&frame[len + 1..]).unwrap();
    (mime, envelope)
}

pub fn request_id(frame: &[u8]) -> String {
    let (_, envelope) = parse_frame(frame);
    envelope["requestId"]["@value"]
        .as_str()
        .expect("request id")
        .to_string()
}

/// Liveness probe with a fixed answer
pub struct MockProbe {
    healthy: bool,
    checks: AtomicUsize,
    requests: Mutex<Vec<SignedRequest>>,
}

impl MockProbe {
    pub fn new(healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            healthy,
            checks: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SignedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HealthProbe for MockProbe {
    async fn check(&self, request: &SignedRequest) -> Result<(), GremlinError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if self.healthy {
            Ok(())
        } else {
            Err(GremlinError::ConnectError(
                "Instance status is unhealthy".to_string(),
            ))
        }
    }
}

pub fn options() -> ConnectionOptions {
    ConnectionOptions::new("local.host", 1337).reconnect_delay(Duration::ZERO)
}

pub fn credentials() -> Credentials {
    Credentials::new("MY_ACCESS_KEY", "MY_SECRET_KEY", "us-east-1")
}

/// Connection wired to the given mock transport
pub fn connect_with(options: ConnectionOptions, transport: Arc<MockTransport>) -> Connection {
    Connection::builder(options)
        .with_credentials(credentials())
        .with_transport(transport)
        .build()
        .unwrap()
}

/// Wait until `condition` holds for the connection state
pub async fn wait_for_state(
    connection: &Connection,
    condition: impl Fn(&gremlin_sigv4::ConnectionState) -> bool,
) {
    let mut state = connection.watch_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if condition(&state.borrow_and_update()) {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .expect("timed out waiting for connection state");
}
