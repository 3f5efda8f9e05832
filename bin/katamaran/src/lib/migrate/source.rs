// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Source-side orchestration.
//!
//! The sequence: start the block mirror and drive it to ready (unless
//! storage is shared), enable auto-converge, set the downtime budget and
//! bandwidth cap, start the RAM migration, wait for the VM to pause,
//! bring up the tunnel, poll the migration to a terminal state, then
//! unwind: cancel the migration on failure so the hypervisor resumes
//! the source VM, abort the mirror, and tear down the tunnel after the
//! convergence delay.

use std::net::IpAddr;
use std::path::PathBuf;

use slog::{debug, info, o, warn, Logger};
use tokio::time::Instant;

use crate::ctx::Ctx;
use crate::migrate::{
    format_qemu_host, mirror_job_id, MigrateError, EVENT_WAIT_TIMEOUT, JOB_APPEAR_TIMEOUT,
    MAX_BANDWIDTH, MAX_DOWNTIME_MS, MIGRATION_POLL_INTERVAL, MIGRATION_TIMEOUT, NBD_PORT,
    RAM_MIGRATION_PORT, STORAGE_POLL_INTERVAL, STORAGE_SYNC_TIMEOUT,
};
use crate::qmp::codec::Command;
use crate::qmp::{BlockJobInfo, Capability, Client, MigrateInfo};
use crate::tunnel::{self, TunnelMode, POST_MIGRATION_TUNNEL_DELAY};

pub struct SourceConfig {
    pub qmp_socket: PathBuf,
    pub dest_ip: IpAddr,
    pub vm_ip: IpAddr,
    pub drive_id: String,
    pub shared_storage: bool,
    pub tunnel_mode: TunnelMode,
}

/// Runs the source side of one migration to completion.
pub async fn run(ctx: &Ctx, cfg: &SourceConfig, log: &Logger) -> Result<(), MigrateError> {
    let log = log.new(o!("migrate_role" => "source"));
    info!(log, "starting live migration"; "dest" => %cfg.dest_ip);

    let mut client = Client::connect(ctx, &cfg.qmp_socket, &log)
        .await
        .map_err(MigrateError::qmp("connecting to source QMP"))?;

    let mut mirror_armed = false;
    let result = drive(ctx, &mut client, cfg, &mut mirror_armed, &log).await;

    // Guarded cancel: if the sequence bailed out between starting the
    // mirror and the explicit abort below, the job must not outlive the
    // orchestrator. force skips any attempt to pivot onto a destination
    // disk that may already be gone.
    if mirror_armed {
        let job_id = mirror_job_id(&cfg.drive_id);
        let cctx = Ctx::cleanup();
        if let Err(e) = client
            .execute(&cctx, Command::BlockJobCancel { device: job_id.clone(), force: true })
            .await
        {
            warn!(log, "guarded block job cancel failed"; "job_id" => job_id, "error" => %e);
        }
    }

    client.close();
    if result.is_ok() {
        info!(log, "source cleanup complete, migration succeeded");
    }
    result
}

async fn drive(
    ctx: &Ctx,
    client: &mut Client,
    cfg: &SourceConfig,
    mirror_armed: &mut bool,
    log: &Logger,
) -> Result<(), MigrateError> {
    let job_id = mirror_job_id(&cfg.drive_id);

    if !cfg.shared_storage {
        info!(log, "initiating storage mirror"; "drive" => &cfg.drive_id);
        let target = format!(
            "nbd:{}:{}:exportname={}",
            format_qemu_host(cfg.dest_ip),
            NBD_PORT,
            cfg.drive_id
        );
        client
            .execute(
                ctx,
                Command::DriveMirror {
                    device: cfg.drive_id.clone(),
                    target,
                    job_id: job_id.clone(),
                },
            )
            .await
            .map_err(MigrateError::qmp("starting drive-mirror"))?;
        *mirror_armed = true;

        info!(log, "waiting for storage mirror to synchronize");
        wait_for_storage_sync(ctx, client, &job_id, log).await?;
    } else {
        info!(log, "shared storage mode, skipping drive-mirror");
    }

    info!(log, "configuring RAM migration");
    client
        .execute(
            ctx,
            Command::MigrateSetCapabilities {
                capabilities: vec![Capability {
                    capability: "auto-converge".to_string(),
                    state: true,
                }],
            },
        )
        .await
        .map_err(MigrateError::qmp("setting migration capabilities"))?;

    // The downtime budget is the zero-drop contract: pre-copy iterates
    // until the dirty residue flushes within it.
    client
        .execute(
            ctx,
            Command::MigrateSetParameters {
                downtime_limit: MAX_DOWNTIME_MS,
                max_bandwidth: MAX_BANDWIDTH,
            },
        )
        .await
        .map_err(MigrateError::qmp("setting migration parameters"))?;

    let uri = format!("tcp:{}:{}", format_qemu_host(cfg.dest_ip), RAM_MIGRATION_PORT);
    client
        .execute(ctx, Command::Migrate { uri: uri.clone() })
        .await
        .map_err(|source| MigrateError::Qmp {
            context: format!("starting RAM migration to {uri}"),
            source,
        })?;
    info!(log, "RAM migration started, waiting for VM pause"; "uri" => uri);

    client
        .wait_for_event(ctx, "STOP", EVENT_WAIT_TIMEOUT)
        .await
        .map_err(MigrateError::qmp("waiting for STOP event"))?;
    info!(log, "VM paused, redirecting in-flight packets to destination");

    // The destination qdisc already buffers packets that arrive via the
    // existing routing fabric; the tunnel covers the tail still landing
    // here during control-plane convergence. Losing it downgrades the
    // zero-drop guarantee instead of failing the migration.
    let mut tunnel_up = false;
    match tunnel::setup(ctx, cfg.dest_ip, cfg.vm_ip, cfg.tunnel_mode, log).await {
        Ok(()) => {
            tunnel_up = true;
            info!(log, "tunnel established, traffic redirected");
        }
        Err(e) => warn!(log, "failed to create tunnel"; "error" => %e),
    }

    info!(log, "waiting for migration to complete");
    let migration_result = wait_for_migration_complete(ctx, client, log).await;

    // On any terminal non-success the hypervisor must abandon the stream;
    // migrate_cancel also resumes the paused source VM.
    if let Err(e) = &migration_result {
        let cctx = Ctx::cleanup();
        match client.execute(&cctx, Command::MigrateCancel).await {
            Ok(_) => info!(log, "migration cancelled after failure"; "cause" => %e),
            Err(cancel_err) => {
                warn!(log, "failed to cancel migration after error"; "error" => %cancel_err)
            }
        }
    }

    if !cfg.shared_storage {
        // Explicit mirror abort; disarms the guarded cancel in `run`.
        // Without force the hypervisor may wait on in-flight I/O towards
        // an NBD target that no longer exists.
        *mirror_armed = false;
        let cctx = Ctx::cleanup();
        match client
            .execute(&cctx, Command::BlockJobCancel { device: job_id.clone(), force: true })
            .await
        {
            Ok(_) => info!(log, "storage mirror cancelled"),
            Err(e) => warn!(log, "failed to cancel block job"; "job_id" => &job_id, "error" => %e),
        }
    }

    if tunnel_up {
        if migration_result.is_ok() {
            info!(
                log,
                "waiting for routing plane convergence before removing tunnel";
                "delay" => ?POST_MIGRATION_TUNNEL_DELAY
            );
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!(log, "cancelled during convergence wait, tearing down early")
                }
                _ = tokio::time::sleep(POST_MIGRATION_TUNNEL_DELAY) => {}
            }
        }
        let cctx = Ctx::cleanup();
        if let Err(e) = tunnel::teardown(&cctx).await {
            warn!(log, "failed to remove tunnel"; "error" => %e);
        }
    }

    migration_result
}

/// Polls query-block-jobs until the mirror reports ready, meaning source
/// and target are synchronized modulo a small dirty residue. Terminal
/// without ready, vanishing after being seen, and never appearing at all
/// are each distinct failures.
async fn wait_for_storage_sync(
    ctx: &Ctx,
    client: &mut Client,
    job_id: &str,
    log: &Logger,
) -> Result<(), MigrateError> {
    let mut job_seen = false;
    let appear_deadline = Instant::now() + JOB_APPEAR_TIMEOUT;
    let sync_deadline = Instant::now() + STORAGE_SYNC_TIMEOUT;

    loop {
        let raw = client
            .execute(ctx, Command::QueryBlockJobs)
            .await
            .map_err(MigrateError::qmp("querying block jobs"))?;
        let jobs: Vec<BlockJobInfo> = serde_json::from_value(raw)
            .map_err(|source| MigrateError::Decode { what: "block jobs response", source })?;

        match jobs.iter().find(|job| job.device == job_id) {
            None if job_seen => {
                return Err(MigrateError::MirrorVanished(job_id.to_string()));
            }
            None => {
                if Instant::now() > appear_deadline {
                    return Err(MigrateError::MirrorNeverAppeared(job_id.to_string()));
                }
            }
            Some(job) => {
                job_seen = true;

                // len == 0 means the progress percentage is undefined.
                if job.len > 0 {
                    let percent = job.offset as f64 / job.len as f64 * 100.0;
                    info!(log, "storage sync progress"; "percent" => format!("{percent:.2}"));
                }

                if job.ready {
                    info!(log, "storage mirror synchronized");
                    return Ok(());
                }

                if matches!(job.status.as_str(), "concluded" | "null") {
                    return Err(MigrateError::MirrorConcluded {
                        job_id: job_id.to_string(),
                        status: job.status.clone(),
                    });
                }
            }
        }

        if Instant::now() > sync_deadline {
            return Err(MigrateError::StorageSyncTimeout(job_id.to_string()));
        }

        tokio::select! {
            _ = ctx.cancelled() => return Err(MigrateError::Interrupted),
            _ = tokio::time::sleep(STORAGE_POLL_INTERVAL) => {}
        }
    }
}

/// Polls query-migrate until a terminal status or the migration timeout.
async fn wait_for_migration_complete(
    ctx: &Ctx,
    client: &mut Client,
    log: &Logger,
) -> Result<(), MigrateError> {
    let deadline = Instant::now() + MIGRATION_TIMEOUT;

    loop {
        let raw = client
            .execute(ctx, Command::QueryMigrate)
            .await
            .map_err(MigrateError::qmp("querying migration status"))?;
        let status: MigrateInfo = serde_json::from_value(raw)
            .map_err(|source| MigrateError::Decode { what: "migration status", source })?;

        debug!(log, "migration status"; "status" => &status.status);
        match status.status.as_str() {
            "completed" => return Ok(()),
            "failed" => {
                return Err(MigrateError::Failed {
                    desc: status.error_desc.filter(|desc| !desc.is_empty()),
                });
            }
            "cancelled" => return Err(MigrateError::Cancelled),
            _ => {}
        }

        if Instant::now() > deadline {
            return Err(MigrateError::Timeout { last_status: status.status });
        }

        tokio::select! {
            _ = ctx.cancelled() => return Err(MigrateError::Interrupted),
            _ = tokio::time::sleep(MIGRATION_POLL_INTERVAL) => {}
        }
    }
}
