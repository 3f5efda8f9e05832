// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Destination-side orchestration.
//!
//! The sequence: install the packet-buffer qdisc in pass-through state,
//! open the monitor, start the in-band NBD receiver (unless storage is
//! shared), plug the qdisc, wait for the guest to resume, flush the
//! buffer, stop the receiver, and trigger layer-2 announcements from the
//! guest's own MAC. Only the monitor and NBD steps are fatal; the
//! network-queue steps degrade to warnings so a host without `sch_plug`
//! still migrates, with the zero-drop guarantee explicitly downgraded.

use std::path::PathBuf;

use slog::{info, o, warn, Logger};

use crate::ctx::Ctx;
use crate::migrate::{
    MigrateError, EVENT_WAIT_TIMEOUT, GARP_INITIAL_MS, GARP_MAX_MS, GARP_ROUNDS, GARP_STEP_MS,
    NBD_PORT,
};
use crate::qdisc;
use crate::qmp::codec::Command;
use crate::qmp::Client;

pub struct DestinationConfig {
    pub qmp_socket: PathBuf,
    /// Tap interface for the packet-buffer qdisc; `None` skips the
    /// network queue entirely.
    pub tap: Option<String>,
    pub drive_id: String,
    pub shared_storage: bool,
}

/// Runs the destination side of one migration to completion.
pub async fn run(ctx: &Ctx, cfg: &DestinationConfig, log: &Logger) -> Result<(), MigrateError> {
    let log = log.new(o!("migrate_role" => "destination"));
    info!(log, "setting up destination node");

    // Install the qdisc pass-through before anything else so pre-migration
    // traffic is never blocked by our own setup. Best effort throughout.
    let mut qdisc_armed = false;
    match cfg.tap.as_deref() {
        Some(tap) if !qdisc::tap_present(tap) => {
            warn!(log, "tap interface not found, skipping network queue setup"; "tap" => tap);
        }
        Some(tap) => match qdisc::install(ctx, tap).await {
            Ok(()) => {
                qdisc_armed = true;
                info!(log, "network queue installed, pass-through"; "tap" => tap);
            }
            Err(e) => {
                warn!(
                    log,
                    "failed to install plug qdisc (is sch_plug available?)";
                    "tap" => tap, "error" => %e
                );
            }
        },
        None => info!(log, "no tap interface specified, skipping network queue setup"),
    }

    let result = drive(ctx, cfg, &mut qdisc_armed, &log).await;

    // Guarded removal: a qdisc left blocked would blackhole the tap, so
    // any path that did not flush it cleanly clears it here.
    if qdisc_armed {
        if let Some(tap) = cfg.tap.as_deref() {
            let cctx = Ctx::cleanup();
            let _ = qdisc::remove(&cctx, tap).await;
        }
    }

    if result.is_ok() {
        info!(log, "destination setup complete");
    }
    result
}

async fn drive(
    ctx: &Ctx,
    cfg: &DestinationConfig,
    qdisc_armed: &mut bool,
    log: &Logger,
) -> Result<(), MigrateError> {
    let mut client = Client::connect(ctx, &cfg.qmp_socket, log)
        .await
        .map_err(MigrateError::qmp("connecting to destination QMP"))?;

    let mut nbd_armed = false;
    let result = run_with_client(ctx, &mut client, cfg, qdisc_armed, &mut nbd_armed, log).await;

    // Guarded stop for an NBD server the sequence did not shut down
    // explicitly.
    if nbd_armed {
        let cctx = Ctx::cleanup();
        if let Err(e) = client.execute(&cctx, Command::NbdServerStop).await {
            warn!(log, "guarded NBD server stop failed"; "error" => %e);
        }
    }

    client.close();
    result
}

async fn run_with_client(
    ctx: &Ctx,
    client: &mut Client,
    cfg: &DestinationConfig,
    qdisc_armed: &mut bool,
    nbd_armed: &mut bool,
    log: &Logger,
) -> Result<(), MigrateError> {
    if !cfg.shared_storage {
        info!(log, "starting NBD server for storage migration");

        // A server may linger from an earlier attempt; stopping it is
        // idempotent and the error is uninteresting.
        let _ = client.execute(ctx, Command::NbdServerStop).await;

        client
            .execute(
                ctx,
                Command::NbdServerStart { host: "::".to_string(), port: NBD_PORT.to_string() },
            )
            .await
            .map_err(MigrateError::qmp("starting NBD server"))?;
        *nbd_armed = true;

        client
            .execute(
                ctx,
                Command::NbdServerAdd { device: cfg.drive_id.clone(), writable: true },
            )
            .await
            .map_err(|source| MigrateError::Qmp {
                context: format!("adding NBD export for drive {:?}", cfg.drive_id),
                source,
            })?;
        info!(log, "NBD server listening"; "addr" => format!("[::]:{NBD_PORT}"));
    } else {
        info!(log, "shared storage mode, skipping NBD server setup");
    }

    // Start buffering ahead of the expected RESUME so the buffered window
    // spans the whole pause.
    if *qdisc_armed {
        if let Some(tap) = cfg.tap.as_deref() {
            match qdisc::block(ctx, tap).await {
                Ok(()) => {
                    info!(log, "network queue plugged, buffering in-flight packets"; "tap" => tap)
                }
                Err(e) => warn!(log, "failed to plug network queue"; "tap" => tap, "error" => %e),
            }
        }
    }

    info!(log, "waiting for RESUME event");
    client
        .wait_for_event(ctx, "RESUME", EVENT_WAIT_TIMEOUT)
        .await
        .map_err(MigrateError::qmp("waiting for RESUME event"))?;
    info!(log, "VM resumed");

    // Flush the buffer into the now-running guest. The guard is disarmed
    // only on success: the qdisc then vanishes with the tap interface,
    // while a failed release leaves the guard to clear the blockage.
    if *qdisc_armed {
        if let Some(tap) = cfg.tap.as_deref() {
            match qdisc::release(ctx, tap).await {
                Ok(()) => {
                    info!(log, "network queue released, buffered packets delivered"; "tap" => tap);
                    *qdisc_armed = false;
                }
                Err(e) => {
                    warn!(log, "failed to release network queue"; "tap" => tap, "error" => %e)
                }
            }
        }
    }

    if !cfg.shared_storage {
        // Explicit stop; disarms the guard in `drive`. Runs under a
        // cleanup context so a SIGINT arriving after RESUME cannot strand
        // the server.
        *nbd_armed = false;
        let cctx = Ctx::cleanup();
        match client.execute(&cctx, Command::NbdServerStop).await {
            Ok(_) => info!(log, "NBD server stopped"),
            Err(e) => warn!(log, "failed to stop NBD server"; "error" => %e),
        }
    }

    // announce-self emits the announcements from the guest's own MAC on
    // every NIC; a host-side arping would teach the fabric the tap MAC
    // instead of the one the network must learn.
    let cctx = Ctx::cleanup();
    match client
        .execute(
            &cctx,
            Command::AnnounceSelf {
                initial: GARP_INITIAL_MS,
                max: GARP_MAX_MS,
                rounds: GARP_ROUNDS,
                step: GARP_STEP_MS,
            },
        )
        .await
    {
        Ok(_) => info!(log, "layer-2 announcements scheduled"; "rounds" => GARP_ROUNDS),
        Err(e) => warn!(log, "announce-self failed"; "error" => %e),
    }

    Ok(())
}
