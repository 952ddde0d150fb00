//! Transport kernel: the collaborators the connection is composed over.
//!
//! - `signer`: SigV4 request signing with an injectable clock
//! - `codec`: traversal encoding, response decoding and request framing
//! - `ws`: socket transport and session traits, tungstenite implementation
//! - `health`: optional HTTP liveness probe run before connecting
//!
//! Each piece sits behind a trait so the connection can be driven by
//! in-memory implementations in tests.

pub mod codec;
pub mod health;
pub mod signer;
pub mod ws;

pub use codec::{frame_request, GraphSonCodec, QueryCodec, RequestEnvelope};
pub use health::{HealthProbe, ReqwestProbe, PROBE_TIMEOUT, STATUS_PATH};
pub use signer::{sign_request, Clock, FixedClock, RequestSigner, SigV4Signer, SystemClock};
pub use ws::{SessionEvent, SessionStats, SocketSession, Transport, TungsteniteTransport};
