// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Framing for the QEMU Machine Protocol: UTF-8 JSON, one object per
//! line, no pipelining. Outbound lines are command envelopes of the form
//! `{"execute": <verb>, "arguments": {..}}` with `arguments` omitted
//! entirely when a command takes none. Every inbound line is classified
//! as exactly one of a success return, a protocol error, an asynchronous
//! event, or the one-off greeting banner; events may arrive at any
//! point, so inspecting only reply lines is incorrect and the client
//! above this layer buffers them.
//!
//! The set of commands is closed: [`Command`] enumerates everything this
//! tool is allowed to put on the wire, and protocol constants that never
//! vary (`sync: "full"`, `mode: "existing"`) are baked into the
//! serialization rather than left to callers.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::codec;

/// Framing-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Encountered an I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line failed to serialize or deserialize.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The line parsed but is none of return, error, event, or greeting.
    #[error("unclassifiable QMP line: {0}")]
    Unclassifiable(String),
}

/// A QMP command this tool can issue, with its typed arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    QmpCapabilities,
    NbdServerStart { host: String, port: String },
    NbdServerAdd { device: String, writable: bool },
    NbdServerStop,
    DriveMirror { device: String, target: String, job_id: String },
    BlockJobCancel { device: String, force: bool },
    QueryBlockJobs,
    MigrateSetCapabilities { capabilities: Vec<Capability> },
    MigrateSetParameters { downtime_limit: u64, max_bandwidth: u64 },
    Migrate { uri: String },
    MigrateCancel,
    QueryMigrate,
    AnnounceSelf { initial: u32, max: u32, rounds: u32, step: u32 },
}

/// A single migration capability toggle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Capability {
    pub capability: String,
    pub state: bool,
}

impl Command {
    /// The wire verb for this command.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::QmpCapabilities => "qmp_capabilities",
            Command::NbdServerStart { .. } => "nbd-server-start",
            Command::NbdServerAdd { .. } => "nbd-server-add",
            Command::NbdServerStop => "nbd-server-stop",
            Command::DriveMirror { .. } => "drive-mirror",
            Command::BlockJobCancel { .. } => "block-job-cancel",
            Command::QueryBlockJobs => "query-block-jobs",
            Command::MigrateSetCapabilities { .. } => "migrate-set-capabilities",
            Command::MigrateSetParameters { .. } => "migrate-set-parameters",
            Command::Migrate { .. } => "migrate",
            Command::MigrateCancel => "migrate_cancel",
            Command::QueryMigrate => "query-migrate",
            Command::AnnounceSelf { .. } => "announce-self",
        }
    }

    fn arguments(&self) -> Option<Value> {
        match self {
            Command::QmpCapabilities
            | Command::NbdServerStop
            | Command::QueryBlockJobs
            | Command::MigrateCancel
            | Command::QueryMigrate => None,
            Command::NbdServerStart { host, port } => Some(json!({
                "addr": { "type": "inet", "data": { "host": host, "port": port } },
            })),
            Command::NbdServerAdd { device, writable } => Some(json!({
                "device": device,
                "writable": writable,
            })),
            Command::DriveMirror { device, target, job_id } => Some(json!({
                "device": device,
                "target": target,
                "sync": "full",
                "mode": "existing",
                "job-id": job_id,
            })),
            Command::BlockJobCancel { device, force } => Some(json!({
                "device": device,
                "force": force,
            })),
            Command::MigrateSetCapabilities { capabilities } => Some(json!({
                "capabilities": capabilities,
            })),
            Command::MigrateSetParameters { downtime_limit, max_bandwidth } => Some(json!({
                "downtime-limit": downtime_limit,
                "max-bandwidth": max_bandwidth,
            })),
            Command::Migrate { uri } => Some(json!({ "uri": uri })),
            Command::AnnounceSelf { initial, max, rounds, step } => Some(json!({
                "initial": initial,
                "max": max,
                "rounds": rounds,
                "step": step,
            })),
        }
    }
}

/// Classification of one inbound line.
#[derive(Debug)]
pub enum Reply {
    /// Success; the payload is opaque here and decoded by the caller.
    Return(Value),
    /// Protocol-level error reported by the monitor.
    Error { class: String, desc: String },
    /// Asynchronous event, identified by name.
    Event(String),
    /// The greeting banner sent once at connection time. Its content is
    /// not inspected.
    Greeting,
}

#[derive(Deserialize)]
struct WireReply {
    #[serde(rename = "return")]
    ret: Option<Value>,
    error: Option<WireError>,
    event: Option<String>,
    #[serde(rename = "QMP")]
    greeting: Option<Value>,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    class: String,
    #[serde(default)]
    desc: String,
}

/// A single entry in the `query-block-jobs` array.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockJobInfo {
    pub device: String,
    pub len: u64,
    pub offset: u64,
    pub ready: bool,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "type", default)]
    pub job_type: String,
}

/// The `query-migrate` view. `status` is absent before migration starts.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrateInfo {
    #[serde(default)]
    pub status: String,
    #[serde(rename = "error-desc", default)]
    pub error_desc: Option<String>,
}

#[derive(Debug, Default)]
pub struct QmpCodec;

impl codec::Encoder<Command> for QmpCodec {
    type Error = ProtocolError;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let envelope = match cmd.arguments() {
            Some(arguments) => json!({ "execute": cmd.verb(), "arguments": arguments }),
            None => json!({ "execute": cmd.verb() }),
        };
        let line = serde_json::to_vec(&envelope)?;
        dst.reserve(line.len() + 1);
        dst.put_slice(&line);
        dst.put_u8(b'\n');
        Ok(())
    }
}

impl codec::Decoder for QmpCodec {
    type Item = Reply;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>, ProtocolError> {
        let Some(pos) = src.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line = src.split_to(pos + 1);
        let line = &line[..line.len() - 1];

        let wire: WireReply = serde_json::from_slice(line)?;
        if let Some(event) = wire.event {
            return Ok(Some(Reply::Event(event)));
        }
        if let Some(error) = wire.error {
            return Ok(Some(Reply::Error { class: error.class, desc: error.desc }));
        }
        if wire.greeting.is_some() {
            return Ok(Some(Reply::Greeting));
        }
        if let Some(payload) = wire.ret {
            return Ok(Some(Reply::Return(payload)));
        }
        Err(ProtocolError::Unclassifiable(String::from_utf8_lossy(line).into_owned()))
    }
}
