// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runner for the external host tooling (`ip`, `tc`) the orchestrators
//! shell out to.

use std::process::Stdio;

use thiserror::Error;
use tokio::time::timeout_at;

use crate::ctx::Ctx;

#[derive(Debug, Error)]
pub enum CmdError {
    /// The caller's context was cancelled while the command ran. Kept
    /// distinct from [`CmdError::Failed`] so orchestrators can tell a
    /// deliberate abort apart from a real command failure.
    #[error("command cancelled: {argv}")]
    Cancelled { argv: String },

    /// The program could not be started at all.
    #[error("spawning {argv}: {source}")]
    Spawn { argv: String, source: std::io::Error },

    /// The program ran and failed; `output` is the trimmed combined
    /// stdout/stderr, falling back to the exit status when silent.
    #[error("executing {argv}: {output}")]
    Failed { argv: String, output: String },
}

/// Runs an external command to completion, honouring the context's
/// cancellation and deadline. The subprocess is killed if the run is
/// abandoned mid-flight.
pub async fn run(ctx: &Ctx, program: &str, args: &[&str]) -> Result<(), CmdError> {
    let argv = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");

    if ctx.is_cancelled() {
        return Err(CmdError::Cancelled { argv });
    }

    let child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CmdError::Spawn { argv: argv.clone(), source })?;

    let wait = async {
        match ctx.deadline() {
            Some(deadline) => {
                timeout_at(deadline, child.wait_with_output()).await.unwrap_or_else(|_| {
                    Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "context deadline exceeded",
                    ))
                })
            }
            None => child.wait_with_output().await,
        }
    };

    let output = tokio::select! {
        _ = ctx.cancelled() => return Err(CmdError::Cancelled { argv }),
        res = wait => match res {
            Ok(output) => output,
            Err(e) => return Err(CmdError::Failed { argv, output: e.to_string() }),
        },
    };

    if !output.status.success() {
        if ctx.is_cancelled() {
            return Err(CmdError::Cancelled { argv });
        }
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        let text = String::from_utf8_lossy(&combined).trim().to_string();
        let output = if text.is_empty() { output.status.to_string() } else { text };
        return Err(CmdError::Failed { argv, output });
    }

    Ok(())
}
