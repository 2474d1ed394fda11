//! Safe-await: the single place raw channel failures are observed.
//!
//! Every protocol call on an [`Instance`] is awaited here. Failures are
//! classified, counted and re-raised as a [`UniformError`]; a connection-closed
//! failure also demotes the instance, but only when the call was issued on the
//! connection that is still current.

use std::future::Future;
use std::time::Instant;

use mcpfleet_core::{
    ChannelError, ErrorKind, Result, TransportError, UniformError, CONNECTION_CLOSED_CODE,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::instance::Instance;

/// Message fragments that mean the peer or transport went away.
const CLOSED_SIGNATURES: [&str; 4] = [
    "connection closed",
    "connection lost",
    "transport closed",
    "channel closed",
];

pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if CLOSED_SIGNATURES.iter().any(|s| lower.contains(s)) {
        ErrorKind::ConnectionClosed
    } else {
        ErrorKind::OperationFailed
    }
}

pub fn classify(error: &ChannelError) -> ErrorKind {
    if error.code == Some(CONNECTION_CLOSED_CODE) {
        return ErrorKind::ConnectionClosed;
    }
    classify_message(&error.message)
}

/// Classification of a failed `open`/`close`, by the same rules.
pub fn classify_transport(error: &TransportError) -> ErrorKind {
    match error {
        TransportError::Close(inner) => classify(inner),
        other => classify_message(&other.to_string()),
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

impl Instance {
    /// Await `call`, issued on connection `generation`, and apply its outcome.
    pub(crate) async fn safe_await<F>(
        &self,
        operation: &str,
        generation: u64,
        call: F,
    ) -> Result<Value>
    where
        F: Future<Output = std::result::Result<Value, ChannelError>>,
    {
        let started = Instant::now();
        let outcome = call.await;
        let elapsed = elapsed_ms(started);

        let err = match outcome {
            Ok(value) => {
                let mut state = self.state.write();
                if state.generation == generation {
                    state.record_success(elapsed);
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let kind = classify(&err);
        let demoted = {
            let mut state = self.state.write();
            if state.generation != generation {
                false
            } else {
                state.record_error(err.to_string());
                if kind == ErrorKind::ConnectionClosed && state.connected {
                    // Channel is cleared under the state guard so a newer
                    // connection can never lose its channel here.
                    state.mark_disconnected();
                    self.channel.write().take();
                    true
                } else {
                    false
                }
            }
        };

        if demoted {
            warn!(
                instance = %self.name(),
                operation = %operation,
                error = %err,
                "Connection closed by peer, instance demoted"
            );
        } else {
            debug!(
                instance = %self.name(),
                operation = %operation,
                kind = %kind,
                error = %err,
                "Operation failed"
            );
        }

        Err(UniformError::new(kind, self.name(), operation, err).into())
    }
}
