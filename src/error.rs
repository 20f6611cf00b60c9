//! Daemon error taxonomy.
//!
//! Per-item and per-connection failures are isolated: an error here never
//! aborts the queue worker or the accept loop. Cache I/O problems are
//! absorbed inside the cache (read failure is a miss, write failure keeps
//! the entry in memory only) and deliberately have no variant.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    /// Unparsable payload or missing required field. The connection is
    /// answered with an error frame and closed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Both the primary and the fallback engine failed for a clause.
    #[error("synthesis failed: {0}")]
    SynthesisFailure(String),

    /// `replay` with no completed item this daemon lifetime.
    #[error("nothing to replay")]
    NoPriorItem,

    /// The downstream audio process died or could not be spawned.
    #[error("audio sink unavailable: {0}")]
    SinkUnavailable(String),
}
