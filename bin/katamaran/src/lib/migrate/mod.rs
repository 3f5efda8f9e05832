// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-side migration orchestrators.
//!
//! A migration runs in three coupled phases: a background block-device
//! mirror over NBD (skipped on shared storage), a RAM pre-copy with a
//! strict downtime ceiling, and a transient tunnel plus packet-buffer
//! qdisc bridging the STOP→RESUME window and the routing-plane
//! convergence that follows. Each side is one straight-line sequence with
//! guarded cleanup on every exit path; the two processes communicate only
//! through the hypervisor and the network.

pub mod destination;
pub mod source;

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

use crate::qmp::QmpError;

/// TCP port the destination's NBD server listens on for the block mirror.
pub const NBD_PORT: &str = "10809";

/// TCP port the destination hypervisor listens on for the RAM stream.
pub const RAM_MIGRATION_PORT: &str = "4444";

/// Maximum allowed VM pause in milliseconds. The hypervisor keeps
/// iterating pre-copy rounds until the remaining dirty set fits in this
/// budget.
pub const MAX_DOWNTIME_MS: u64 = 50;

/// Migration bandwidth cap in bytes/second (10 GB/s), set high so the
/// final dirty-page flush completes as fast as the link allows.
pub const MAX_BANDWIDTH: u64 = 10_000_000_000;

/// Maximum time to wait for a single QMP event (STOP, RESUME) before
/// assuming the migration has stalled.
pub const EVENT_WAIT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How often to check drive-mirror sync progress.
pub const STORAGE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How often to check RAM migration status.
pub const MIGRATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum time for a submitted block job to show up in
/// query-block-jobs; past this the drive-mirror likely failed silently.
pub const JOB_APPEAR_TIMEOUT: Duration = Duration::from_secs(30);

/// Wall-clock bound on the drive-mirror readiness loop; a VM writing
/// faster than the mirror bandwidth would otherwise poll forever.
pub const STORAGE_SYNC_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Wall-clock bound on the RAM migration polling loop; perpetual dirty
/// page churn would otherwise poll forever even with auto-converge.
pub const MIGRATION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// announce-self schedule: initial delay, delay cap, rounds, and per-round
/// delay increase, all in milliseconds.
pub const GARP_INITIAL_MS: u32 = 50;
pub const GARP_MAX_MS: u32 = 550;
pub const GARP_ROUNDS: u32 = 5;
pub const GARP_STEP_MS: u32 = 100;

/// Errors that end a migration. Terminal `failed`/`cancelled` statuses,
/// timeouts, and operator interruption are distinct variants so callers
/// can tell them apart.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// A QMP operation failed; the context names the step.
    #[error("{context}: {source}")]
    Qmp {
        context: String,
        #[source]
        source: QmpError,
    },

    /// A reply payload did not decode into the expected shape.
    #[error("unmarshaling {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// drive-mirror was accepted but no job ever became visible.
    #[error(
        "block mirror job {0:?} did not appear within {:?} (drive-mirror may have failed silently)",
        JOB_APPEAR_TIMEOUT
    )]
    MirrorNeverAppeared(String),

    /// The mirror job was seen once and then vanished from
    /// query-block-jobs.
    #[error("block mirror job {0:?} disappeared unexpectedly (may have failed or been cancelled)")]
    MirrorVanished(String),

    /// The mirror reached a terminal status without ever reporting ready.
    #[error("block mirror job {job_id:?} entered terminal state {status:?} without becoming ready")]
    MirrorConcluded { job_id: String, status: String },

    #[error("storage sync for job {0:?} did not complete within {:?}", STORAGE_SYNC_TIMEOUT)]
    StorageSyncTimeout(String),

    /// The hypervisor reported the migration as failed.
    #[error("migration failed: {}", .desc.as_deref().unwrap_or("(no error description)"))]
    Failed { desc: Option<String> },

    /// The hypervisor reported the migration as cancelled.
    #[error("migration cancelled")]
    Cancelled,

    #[error("migration did not complete within {:?} (last status {last_status:?})", MIGRATION_TIMEOUT)]
    Timeout { last_status: String },

    /// The operator's signal ended the run; guarded cleanup has already
    /// executed by the time this surfaces.
    #[error("migration aborted by signal")]
    Interrupted,
}

impl MigrateError {
    pub(crate) fn qmp(context: impl Into<String>) -> impl FnOnce(QmpError) -> MigrateError {
        let context = context.into();
        move |source| MigrateError::Qmp { context, source }
    }

    /// True when the run ended because of the operator's own signal
    /// rather than a migration fault; mapped to exit code 130.
    pub fn is_interrupted(&self) -> bool {
        match self {
            MigrateError::Interrupted => true,
            MigrateError::Qmp { source, .. } => matches!(source, QmpError::Cancelled(_)),
            _ => false,
        }
    }
}

/// Formats a node address for the hypervisor's colon-delimited URIs
/// (`tcp:host:port`, `nbd:host:port:...`); IPv6 hosts are bracketed to
/// keep the URI unambiguous.
pub fn format_qemu_host(addr: IpAddr) -> String {
    match addr.to_canonical() {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// The block job id used for the one mirror of a migration.
pub fn mirror_job_id(drive_id: &str) -> String {
    format!("mirror-{drive_id}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn qemu_host_brackets_ipv6_only() {
        assert_eq!(format_qemu_host("10.0.1.42".parse().unwrap()), "10.0.1.42");
        assert_eq!(format_qemu_host("fd00::42".parse().unwrap()), "[fd00::42]");
        // An IPv4-mapped address is an IPv4 host and must not be bracketed.
        assert_eq!(format_qemu_host("::ffff:10.0.1.42".parse().unwrap()), "10.0.1.42");
    }

    #[test]
    fn failed_and_cancelled_are_distinct() {
        let failed = MigrateError::Failed { desc: Some("out of memory".to_string()) };
        assert!(failed.to_string().contains("migration failed"));
        assert!(failed.to_string().contains("out of memory"));

        let cancelled = MigrateError::Cancelled;
        assert!(!cancelled.to_string().contains("failed"));
        assert!(!matches!(cancelled, MigrateError::Failed { .. }));
    }

    #[test]
    fn interruption_detection() {
        assert!(MigrateError::Interrupted.is_interrupted());
        assert!(MigrateError::Qmp {
            context: "waiting for STOP event".to_string(),
            source: QmpError::Cancelled("event wait".to_string()),
        }
        .is_interrupted());
        assert!(!MigrateError::Cancelled.is_interrupted());
        assert!(!MigrateError::Failed { desc: None }.is_interrupted());
    }

    #[test]
    fn mirror_job_id_is_prefixed() {
        assert_eq!(mirror_job_id("drive-virtio-disk0"), "mirror-drive-virtio-disk0");
    }
}
