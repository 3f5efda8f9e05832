// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transient point-to-point overlay between the two nodes.
//!
//! After the source VM pauses, packets keep arriving at the stale node
//! until the surrounding routing plane converges. The tunnel plus a host
//! route for the VM address forwards that tail to the destination, where
//! the plugged qdisc holds it for the resumed guest. The interface name
//! is fixed, so at most one migration tunnel exists per host.

use std::net::IpAddr;
use std::time::Duration;

use slog::{info, Logger};
use thiserror::Error;

use crate::cmd::{self, CmdError};
use crate::ctx::Ctx;

/// Name of the tunnel interface; process-wide, one tunnel at a time.
pub const TUNNEL_NAME: &str = "mig-tun";

/// How long the tunnel outlives a completed migration, giving the
/// routing plane time to converge before the overlay vanishes.
pub const POST_MIGRATION_TUNNEL_DELAY: Duration = Duration::from_secs(5);

/// Requested encapsulation family. `ipip` has minimal overhead but some
/// networks filter protocol 4/41; `gre` costs four bytes and survives
/// most middleboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TunnelMode {
    Ipip,
    Gre,
}

impl std::fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TunnelMode::Ipip => "ipip",
            TunnelMode::Gre => "gre",
        })
    }
}

#[derive(Debug, Error)]
pub enum TunnelError {
    /// Cross-family tunnels (e.g. IPv4-in-IPv6) are not supported.
    #[error(
        "address family mismatch: destination {dest} is {} but VM address {vm} is {}",
        family(.dest), family(.vm)
    )]
    FamilyMismatch { dest: IpAddr, vm: IpAddr },

    #[error("creating tunnel: {0}")]
    Create(#[source] CmdError),

    #[error("bringing up tunnel: {0}")]
    Up(#[source] CmdError),

    #[error("adding route for {vm} through tunnel: {source}")]
    Route { vm: IpAddr, source: CmdError },

    #[error("deleting tunnel: {0}")]
    Delete(#[source] CmdError),
}

/// Human-readable address family label.
pub fn family(addr: &IpAddr) -> &'static str {
    if addr.is_ipv4() {
        "IPv4"
    } else {
        "IPv6"
    }
}

/// Picks the kernel tunnel mode for the address family and requested
/// encapsulation.
fn encapsulation(dest: IpAddr, mode: TunnelMode) -> &'static str {
    match (dest.is_ipv6(), mode) {
        (false, TunnelMode::Ipip) => "ipip",
        (false, TunnelMode::Gre) => "gre",
        (true, TunnelMode::Ipip) => "ip6ip6",
        (true, TunnelMode::Gre) => "ip6gre",
    }
}

/// Creates the tunnel towards `dest` and routes `vm` through it.
///
/// Setup is idempotent across restarts: any stale interface with the
/// fixed name is deleted first. Partial failure never leaks state; every
/// step after interface creation unwinds it under a cleanup context.
pub async fn setup(
    ctx: &Ctx,
    dest: IpAddr,
    vm: IpAddr,
    mode: TunnelMode,
    log: &Logger,
) -> Result<(), TunnelError> {
    // IPv4-mapped IPv6 endpoints are semantically IPv4; unmap before the
    // family comparison and encapsulation selection, or `::ffff:10.0.0.1`
    // would get a broken ip6ip6 tunnel to an IPv4 host.
    let dest = dest.to_canonical();
    let vm = vm.to_canonical();
    if dest.is_ipv4() != vm.is_ipv4() {
        return Err(TunnelError::FamilyMismatch { dest, vm });
    }

    // The common case is that no stale tunnel exists, so the error is
    // uninteresting.
    let cctx = Ctx::cleanup();
    if cmd::run(&cctx, "ip", &["link", "del", TUNNEL_NAME]).await.is_ok() {
        info!(log, "removed stale tunnel from previous run"; "tunnel" => TUNNEL_NAME);
    }

    let encap = encapsulation(dest, mode);
    let dest_addr = dest.to_string();
    let create = if dest.is_ipv6() {
        cmd::run(
            ctx,
            "ip",
            &["-6", "tunnel", "add", TUNNEL_NAME, "mode", encap, "remote", &dest_addr, "local", "::"],
        )
        .await
    } else {
        cmd::run(
            ctx,
            "ip",
            &["tunnel", "add", TUNNEL_NAME, "mode", encap, "remote", &dest_addr, "local", "any"],
        )
        .await
    };
    create.map_err(TunnelError::Create)?;

    if let Err(e) = cmd::run(ctx, "ip", &["link", "set", TUNNEL_NAME, "up"]).await {
        let _ = cmd::run(&Ctx::cleanup(), "ip", &["link", "del", TUNNEL_NAME]).await;
        return Err(TunnelError::Up(e));
    }

    let vm_addr = vm.to_string();
    let route = if vm.is_ipv6() {
        cmd::run(ctx, "ip", &["-6", "route", "add", &vm_addr, "dev", TUNNEL_NAME]).await
    } else {
        cmd::run(ctx, "ip", &["route", "add", &vm_addr, "dev", TUNNEL_NAME]).await
    };
    if let Err(source) = route {
        let _ = cmd::run(&Ctx::cleanup(), "ip", &["link", "del", TUNNEL_NAME]).await;
        return Err(TunnelError::Route { vm, source });
    }

    Ok(())
}

/// Removes the tunnel interface; the host route departs with it. Works
/// for every encapsulation variant.
pub async fn teardown(ctx: &Ctx) -> Result<(), TunnelError> {
    cmd::run(ctx, "ip", &["link", "del", TUNNEL_NAME]).await.map_err(TunnelError::Delete)
}
