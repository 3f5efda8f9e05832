// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control of the `sch_plug` packet-buffer qdisc on the destination tap.
//!
//! The qdisc is installed pass-through before any packets must be
//! preserved, flipped to blocked just ahead of the expected RESUME so the
//! buffered window is exactly the downtime window, and released
//! afterwards, which flushes the buffer into the running guest.

use std::path::Path;

use thiserror::Error;

use crate::cmd::{self, CmdError};
use crate::ctx::Ctx;

/// Buffer limit for the plug qdisc, in bytes.
pub const PLUG_LIMIT: &str = "32768";

#[derive(Debug, Error)]
pub enum QdiscError {
    #[error("adding plug qdisc on {tap}: {source}")]
    Add { tap: String, source: CmdError },

    #[error("changing plug qdisc on {tap} to {state}: {source}")]
    Change { tap: String, state: &'static str, source: CmdError },

    #[error("removing plug qdisc on {tap}: {source}")]
    Remove { tap: String, source: CmdError },
}

/// True when the named interface exists on this host.
pub fn tap_present(tap: &str) -> bool {
    Path::new("/sys/class/net").join(tap).exists()
}

/// Installs the plug qdisc in pass-through state.
///
/// Any pre-existing root qdisc is deleted first (ignoring the error, the
/// common case being that none exists), making installation idempotent
/// across restarts. `sch_plug` starts out buffering, so a release is
/// issued immediately; if that release fails, the half-installed qdisc is
/// removed rather than left blocking the interface.
pub async fn install(ctx: &Ctx, tap: &str) -> Result<(), QdiscError> {
    let cctx = Ctx::cleanup();
    let _ = cmd::run(&cctx, "tc", &["qdisc", "del", "dev", tap, "root"]).await;

    cmd::run(ctx, "tc", &["qdisc", "add", "dev", tap, "root", "plug", "limit", PLUG_LIMIT])
        .await
        .map_err(|source| QdiscError::Add { tap: tap.to_string(), source })?;

    if let Err(e) = release(ctx, tap).await {
        let _ = remove(&Ctx::cleanup(), tap).await;
        return Err(e);
    }
    Ok(())
}

/// Starts buffering: packets queue in memory instead of reaching the tap.
pub async fn block(ctx: &Ctx, tap: &str) -> Result<(), QdiscError> {
    cmd::run(ctx, "tc", &["qdisc", "change", "dev", tap, "root", "plug", "block"])
        .await
        .map_err(|source| QdiscError::Change { tap: tap.to_string(), state: "block", source })
}

/// Stops buffering and flushes everything queued so far.
pub async fn release(ctx: &Ctx, tap: &str) -> Result<(), QdiscError> {
    cmd::run(ctx, "tc", &["qdisc", "change", "dev", tap, "root", "plug", "release_indefinite"])
        .await
        .map_err(|source| QdiscError::Change {
            tap: tap.to_string(),
            state: "release_indefinite",
            source,
        })
}

/// Deletes the root qdisc outright.
pub async fn remove(ctx: &Ctx, tap: &str) -> Result<(), QdiscError> {
    cmd::run(ctx, "tc", &["qdisc", "del", "dev", tap, "root"])
        .await
        .map_err(|source| QdiscError::Remove { tap: tap.to_string(), source })
}
