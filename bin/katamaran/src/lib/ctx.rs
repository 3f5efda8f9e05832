// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution contexts threaded through every suspending operation.
//!
//! A [`Ctx`] bundles the cancellation token driven by the signal handler
//! with an optional deadline. Teardown actions never run under the
//! caller's context: a SIGINT mid-migration must still be able to remove
//! the tunnel and cancel the block job, so [`Ctx::cleanup`] hands out a
//! context that no caller cancellation can reach.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline applied to every teardown command (qdisc removal, NBD server
/// stop, block-job-cancel, tunnel deletion).
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Ctx {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Ctx {
    /// Context for the main orchestration sequence: cancelled by the
    /// caller's token, no overall deadline (the orchestrators bound their
    /// own phases).
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel, deadline: None }
    }

    /// Context for teardown actions: a fresh token detached from any
    /// caller, bounded by [`CLEANUP_TIMEOUT`].
    pub fn cleanup() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + CLEANUP_TIMEOUT),
        }
    }

    /// Context with an explicit deadline.
    pub fn with_deadline(cancel: CancellationToken, deadline: Instant) -> Self {
        Self { cancel, deadline: Some(deadline) }
    }

    /// Clamps a proposed per-call deadline to this context's own deadline.
    pub fn clamp(&self, at: Instant) -> Instant {
        match self.deadline {
            Some(d) if d < at => d,
            _ => at,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves once the context is cancelled; pends forever on a
    /// cleanup context.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
