//! Status-code driven routing of decoded response frames.

use crate::core::errors::GremlinError;
use crate::core::registry::RequestRegistry;
use crate::core::types::{status, RequestId, ResponseFrame};
use tracing::{debug, warn};

/// What a single frame did to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Partial content recorded, request still pending
    Buffered(RequestId),
    /// Request completed with its traversers
    Completed(RequestId),
    /// Request completed with an error
    Failed(RequestId),
    /// Frame matched no pending request
    Dropped,
    /// Frame could not be attributed; this many requests were failed
    Broadcast(usize),
}

/// Apply one decoded frame to the registry.
///
/// | Code | Action |
/// |---|---|
/// | 204 | complete with an empty result |
/// | 206 | append, keep pending |
/// | other < 400 | append, complete with everything accumulated |
/// | ≥ 400 | complete with a server error |
pub fn dispatch_frame(registry: &mut RequestRegistry, frame: ResponseFrame) -> DispatchOutcome {
    let Some(raw_id) = frame.request_id else {
        let error = unattributed_error(frame.status.as_ref().and_then(|status| {
            status
                .message
                .as_ref()
                .map(|message| (status.code, message.clone()))
        }));
        return fail_all(registry, &error);
    };

    let id = match raw_id.parse::<RequestId>() {
        Ok(id) if registry.contains(&id) => id,
        _ => {
            debug!(request_id = %raw_id, "Dropping frame for unknown request");
            return DispatchOutcome::Dropped;
        }
    };

    let Some(response_status) = frame.status else {
        registry.complete(
            &id,
            Err(GremlinError::MalformedResponse(
                "response without status".to_string(),
            )),
        );
        return DispatchOutcome::Failed(id);
    };

    match response_status.code {
        code if code >= status::FAILURE_THRESHOLD => {
            let message = response_status.message.unwrap_or_default();
            debug!(request_id = %id, code, %message, "Request failed on server");
            registry.complete(&id, Err(GremlinError::ServerError { code, message }));
            DispatchOutcome::Failed(id)
        }
        status::NO_CONTENT => {
            registry.complete(&id, Ok(Vec::new()));
            DispatchOutcome::Completed(id)
        }
        status::PARTIAL_CONTENT => {
            registry.record_partial(&id, frame.data);
            DispatchOutcome::Buffered(id)
        }
        _ => {
            registry.finish(&id, frame.data);
            DispatchOutcome::Completed(id)
        }
    }
}

/// Fail every pending request after a frame that could not be read or attributed
pub fn fail_all(registry: &mut RequestRegistry, error: &GremlinError) -> DispatchOutcome {
    let failed = registry.drain_all(error);
    warn!(failed, %error, "Unattributed server error");
    DispatchOutcome::Broadcast(failed)
}

fn unattributed_error(status: Option<(u16, String)>) -> GremlinError {
    match status {
        Some((code, message)) => GremlinError::UnattributedServerError { code, message },
        None => GremlinError::MalformedResponse("response without request id".to_string()),
    }
}
