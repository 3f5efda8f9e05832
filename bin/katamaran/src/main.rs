// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! katamaran orchestrates zero-packet-drop live migration of a QEMU VM
//! (as run by Kata Containers) between two hosts, one invocation per
//! side. It coordinates three sequential phases:
//!
//! 1. Storage: NBD drive-mirror (skipped in shared-storage mode)
//! 2. Compute: RAM pre-copy with auto-converge and a strict downtime
//!    budget
//! 3. Network: transient IP tunnel + `tc sch_plug` for the zero-drop
//!    cutover

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use slog::{error, info, o, Drain};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use katamaran::ctx::Ctx;
use katamaran::migrate::destination::{self, DestinationConfig};
use katamaran::migrate::source::{self, SourceConfig};
use katamaran::tunnel::{family, TunnelMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Mode {
    Source,
    Dest,
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Zero-packet-drop live migration orchestrator; run once on each side.
struct Args {
    /// Migration role of this host
    #[clap(long, value_enum)]
    mode: Mode,

    /// Path to the hypervisor's QMP unix socket
    #[clap(long, default_value = "/run/vc/vm/qmp.sock")]
    qmp: PathBuf,

    /// Tap interface for the packet-buffer qdisc (dest mode only; leave
    /// empty to skip tc sch_plug)
    #[clap(long)]
    tap: Option<String>,

    /// Destination node address (source mode only)
    #[clap(long)]
    dest_ip: Option<IpAddr>,

    /// VM address routed through the migration tunnel (source mode only;
    /// must match the dest-ip address family)
    #[clap(long)]
    vm_ip: Option<IpAddr>,

    /// Block device id to migrate; names the mirror job and NBD export
    #[clap(long, default_value = "drive-virtio-disk0")]
    drive_id: String,

    /// Skip the block mirror and NBD server (shared storage, e.g.
    /// Ceph/NFS)
    #[clap(long)]
    shared_storage: bool,

    /// Tunnel encapsulation (source mode only); gre survives networks
    /// that filter the ipip protocol
    #[clap(long, value_enum, default_value_t = TunnelMode::Ipip)]
    tunnel_mode: TunnelMode,
}

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Everything the orchestrators need is validated before any monitor
    // connect or host network mutation.
    enum Role {
        Source(SourceConfig),
        Dest(DestinationConfig),
    }
    let role = match args.mode {
        Mode::Source => {
            let (dest_ip, vm_ip) = match (args.dest_ip, args.vm_ip) {
                (Some(dest_ip), Some(vm_ip)) => (dest_ip, vm_ip),
                _ => bail!("--dest-ip and --vm-ip are required in source mode"),
            };
            if dest_ip.to_canonical().is_ipv4() != vm_ip.to_canonical().is_ipv4() {
                bail!(
                    "address family mismatch: --dest-ip {} is {} but --vm-ip {} is {}",
                    dest_ip,
                    family(&dest_ip.to_canonical()),
                    vm_ip,
                    family(&vm_ip.to_canonical()),
                );
            }
            Role::Source(SourceConfig {
                qmp_socket: args.qmp,
                dest_ip,
                vm_ip,
                drive_id: args.drive_id,
                shared_storage: args.shared_storage,
                tunnel_mode: args.tunnel_mode,
            })
        }
        Mode::Dest => Role::Dest(DestinationConfig {
            qmp_socket: args.qmp,
            tap: args.tap.filter(|tap| !tap.is_empty()),
            drive_id: args.drive_id,
            shared_storage: args.shared_storage,
        }),
    };

    let (log, log_guard) = build_log();

    // Cancel the run on SIGINT or SIGTERM so the guarded cleanups execute
    // even when the operator aborts the migration by hand.
    let cancel = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let signal_log = log.clone();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!(signal_log, "received SIGINT, aborting migration"),
            _ = sigterm.recv() => info!(signal_log, "received SIGTERM, aborting migration"),
        }
        signal_cancel.cancel();
    });

    let ctx = Ctx::new(cancel);
    let result = match &role {
        Role::Source(cfg) => source::run(&ctx, cfg, &log).await,
        Role::Dest(cfg) => destination::run(&ctx, cfg, &log).await,
    };

    match result {
        Ok(()) => {
            info!(log, "migration complete");
            Ok(())
        }
        Err(e) if e.is_interrupted() => {
            info!(log, "migration aborted by signal, cleanup finished");
            // Flush the async drain before the hard exit skips destructors.
            drop(log_guard);
            std::process::exit(130);
        }
        Err(e) => {
            error!(log, "migration failed"; "error" => %e);
            drop(log_guard);
            std::process::exit(1);
        }
    }
}
