// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronous client for the QEMU Machine Protocol.
//!
//! The client supports synchronous command execution and asynchronous
//! event waiting over one unix-socket session. It is single-use from one
//! caller sequence at a time, which the API enforces by construction:
//! every operation takes `&mut self`, so a second outstanding call cannot
//! be expressed.
//!
//! Cancellation never closes the socket. A cancelled or timed-out call
//! abandons its I/O future, but the [`Framed`] transport keeps its read
//! buffer inside the session rather than inside the future, so the
//! session stays usable for the teardown commands that must still run
//! after a signal (`migrate_cancel`, `block-job-cancel`,
//! `nbd-server-stop`).
//!
//! Events that arrive while a command reply is pending are appended to a
//! FIFO buffer, never dropped; a later [`Client::wait_for_event`] scans
//! that buffer before touching the wire.

pub mod codec;

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use slog::{debug, o, Logger};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::codec::Framed;

use crate::ctx::Ctx;
use crate::qmp::codec::{Command, ProtocolError, QmpCodec, Reply};

pub use crate::qmp::codec::{BlockJobInfo, Capability, MigrateInfo};

/// Maximum time to establish the socket connection and, separately, to
/// complete the capability negotiation.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum time to wait for the greeting banner. A monitor started
/// without one simply never sends it, so expiry here is not an error.
pub const GREETING_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum time to wait for a synchronous command reply before assuming
/// the hypervisor has become unresponsive.
pub const EXECUTE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum QmpError {
    /// The unix socket dial failed or timed out.
    #[error("dialing QMP socket {}: {source}", .path.display())]
    Dial { path: PathBuf, source: io::Error },

    /// The monitor rejected the capability negotiation.
    #[error("qmp_capabilities rejected: {class}: {desc}")]
    CapabilitiesRejected { class: String, desc: String },

    /// The monitor answered a command with a protocol-level error.
    #[error("QMP command {verb:?} failed: {class}: {desc}")]
    CommandFailed { verb: &'static str, class: String, desc: String },

    /// No reply arrived within the execute deadline.
    #[error("timed out waiting for QMP response to {0:?}")]
    ExecuteTimeout(&'static str),

    /// The named event did not arrive within the wait deadline.
    #[error("timed out waiting for QMP event {0:?}")]
    EventTimeout(String),

    /// Operation attempted after [`Client::close`].
    #[error("{0}: connection is closed")]
    Closed(String),

    /// The caller's context was cancelled mid-operation. The session
    /// itself is still open.
    #[error("QMP {0} cancelled")]
    Cancelled(String),

    /// Transport or framing failure.
    #[error("{context}: {source}")]
    Protocol { context: String, source: ProtocolError },
}

fn eof(context: String) -> QmpError {
    QmpError::Protocol {
        context,
        source: ProtocolError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by monitor",
        )),
    }
}

#[derive(Debug)]
pub struct Client {
    log: Logger,
    conn: Option<Framed<UnixStream, QmpCodec>>,
    /// Events observed while a command reply was pending, oldest first.
    events: VecDeque<String>,
}

impl Client {
    /// Connects to the monitor socket and performs the capability
    /// negotiation handshake, tolerating an absent greeting banner.
    pub async fn connect(ctx: &Ctx, path: &Path, log: &Logger) -> Result<Self, QmpError> {
        let log = log.new(o!("qmp" => path.display().to_string()));

        let deadline = ctx.clamp(Instant::now() + DIAL_TIMEOUT);
        let stream = tokio::select! {
            _ = ctx.cancelled() => {
                return Err(QmpError::Cancelled("connect".to_string()));
            }
            res = timeout_at(deadline, UnixStream::connect(path)) => match res {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    return Err(QmpError::Dial { path: path.to_path_buf(), source });
                }
                Err(_) => {
                    return Err(QmpError::Dial {
                        path: path.to_path_buf(),
                        source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                    });
                }
            },
        };

        let mut conn = Framed::new(stream, QmpCodec);

        // The greeting is optional: a monitor configured without one sends
        // nothing, and the only signal for that is this short timeout.
        match timeout(GREETING_TIMEOUT, conn.next()).await {
            Err(_) => {
                debug!(log, "no QMP greeting, proceeding");
            }
            Ok(None) => {
                return Err(eof("reading QMP greeting".to_string()));
            }
            Ok(Some(Err(source))) => {
                return Err(QmpError::Protocol {
                    context: "reading QMP greeting".to_string(),
                    source,
                });
            }
            Ok(Some(Ok(_))) => {
                debug!(log, "QMP greeting received");
            }
        }

        let mut client = Client { log, conn: Some(conn), events: VecDeque::new() };

        // Capability negotiation is required before any other command is
        // accepted.
        let deadline = ctx.clamp(Instant::now() + DIAL_TIMEOUT);
        match client.execute_at(ctx, deadline, Command::QmpCapabilities).await {
            Ok(_) => Ok(client),
            Err(QmpError::CommandFailed { class, desc, .. }) => {
                Err(QmpError::CapabilitiesRejected { class, desc })
            }
            Err(e) => Err(e),
        }
    }

    /// Sends one command and reads lines until its reply arrives,
    /// buffering any events observed along the way. Returns the raw
    /// `return` payload for the caller to decode.
    pub async fn execute(&mut self, ctx: &Ctx, cmd: Command) -> Result<serde_json::Value, QmpError> {
        let deadline = ctx.clamp(Instant::now() + EXECUTE_TIMEOUT);
        self.execute_at(ctx, deadline, cmd).await
    }

    async fn execute_at(
        &mut self,
        ctx: &Ctx,
        deadline: Instant,
        cmd: Command,
    ) -> Result<serde_json::Value, QmpError> {
        let verb = cmd.verb();
        let Self { conn, events, log } = self;
        let Some(conn) = conn.as_mut() else {
            return Err(QmpError::Closed(format!("executing QMP command {verb:?}")));
        };

        let io_seq = async {
            conn.send(cmd).await.map_err(|source| QmpError::Protocol {
                context: format!("writing QMP command {verb:?}"),
                source,
            })?;

            loop {
                match conn.next().await {
                    None => {
                        return Err(eof(format!("reading QMP response for {verb:?}")));
                    }
                    Some(Err(source)) => {
                        return Err(QmpError::Protocol {
                            context: format!("reading QMP response for {verb:?}"),
                            source,
                        });
                    }
                    Some(Ok(Reply::Event(event))) => {
                        // Dropping it here would strand a later
                        // wait_for_event for the same name.
                        debug!(log, "buffering event"; "event" => &event, "during" => verb);
                        events.push_back(event);
                    }
                    Some(Ok(Reply::Greeting)) => continue,
                    Some(Ok(Reply::Error { class, desc })) => {
                        return Err(QmpError::CommandFailed { verb, class, desc });
                    }
                    Some(Ok(Reply::Return(payload))) => return Ok(payload),
                }
            }
        };

        tokio::select! {
            _ = ctx.cancelled() => Err(QmpError::Cancelled(format!("command {verb:?}"))),
            res = timeout_at(deadline, io_seq) => match res {
                Ok(res) => res,
                Err(_) => Err(QmpError::ExecuteTimeout(verb)),
            },
        }
    }

    /// Blocks until the named event is observed or the timeout elapses.
    /// The buffered event queue is consulted first; once reading from the
    /// wire, non-matching events are discarded.
    pub async fn wait_for_event(
        &mut self,
        ctx: &Ctx,
        name: &str,
        wait: Duration,
    ) -> Result<(), QmpError> {
        // The event may have arrived while an earlier command's reply was
        // pending; consume the oldest match.
        if let Some(idx) = self.events.iter().position(|event| event == name) {
            self.events.remove(idx);
            return Ok(());
        }

        let Self { conn, log, .. } = self;
        let Some(conn) = conn.as_mut() else {
            return Err(QmpError::Closed(format!("waiting for QMP event {name:?}")));
        };

        let deadline = ctx.clamp(Instant::now() + wait);
        let io_seq = async {
            loop {
                match conn.next().await {
                    None => {
                        return Err(eof("reading QMP event stream".to_string()));
                    }
                    Some(Err(source)) => {
                        return Err(QmpError::Protocol {
                            context: "reading QMP event stream".to_string(),
                            source,
                        });
                    }
                    Some(Ok(Reply::Event(event))) if event == name => return Ok(()),
                    Some(Ok(Reply::Event(event))) => {
                        debug!(log, "discarding event"; "event" => event, "waiting_for" => name);
                    }
                    Some(Ok(_)) => continue,
                }
            }
        };

        tokio::select! {
            _ = ctx.cancelled() => Err(QmpError::Cancelled(format!("event wait for {name:?}"))),
            res = timeout_at(deadline, io_seq) => match res {
                Ok(res) => res,
                Err(_) => Err(QmpError::EventTimeout(name.to_string())),
            },
        }
    }

    /// Releases the underlying socket. Safe to call repeatedly; every
    /// operation after the first close fails with [`QmpError::Closed`].
    pub fn close(&mut self) {
        if self.conn.take().is_some() {
            debug!(self.log, "QMP connection closed");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::UnixListener;
    use tokio_util::sync::CancellationToken;

    type ServerLines = tokio::io::Lines<BufReader<OwnedReadHalf>>;

    fn test_log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn ctx() -> Ctx {
        Ctx::new(CancellationToken::new())
    }

    struct FakeMonitor {
        path: PathBuf,
        _dir: tempfile::TempDir,
    }

    /// Binds a unix listener and serves exactly one connection with the
    /// given handler.
    fn start_monitor<F, Fut>(serve: F) -> FakeMonitor
    where
        F: FnOnce(ServerLines, OwnedWriteHalf) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qmp.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let (read, write) = stream.into_split();
                serve(BufReader::new(read).lines(), write).await;
            }
        });
        FakeMonitor { path, _dir: dir }
    }

    async fn serve_handshake(lines: &mut ServerLines, write: &mut OwnedWriteHalf) {
        write.write_all(b"{\"QMP\":{\"version\":{}}}\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let req: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(req["execute"], "qmp_capabilities");
        write.write_all(b"{\"return\":{}}\n").await.unwrap();
    }

    async fn send_lines(write: &mut OwnedWriteHalf, lines: &[&str]) {
        for line in lines {
            write.write_all(line.as_bytes()).await.unwrap();
            write.write_all(b"\n").await.unwrap();
        }
    }

    #[tokio::test]
    async fn connect_full_handshake() {
        let monitor = start_monitor(|mut lines, mut write| async move {
            serve_handshake(&mut lines, &mut write).await;
        });
        let mut client = Client::connect(&ctx(), &monitor.path, &test_log())
            .await
            .expect("handshake should succeed");
        client.close();
    }

    #[tokio::test]
    async fn connect_without_greeting() {
        // A monitor that sends no banner: the client waits out the
        // greeting timeout and proceeds with the handshake.
        let monitor = start_monitor(|mut lines, mut write| async move {
            let line = lines.next_line().await.unwrap().unwrap();
            assert!(line.contains("qmp_capabilities"));
            send_lines(&mut write, &["{\"return\":{}}"]).await;
        });
        Client::connect(&ctx(), &monitor.path, &test_log())
            .await
            .expect("missing greeting must not fail the handshake");
    }

    #[tokio::test]
    async fn connect_capabilities_rejected() {
        let monitor = start_monitor(|mut lines, mut write| async move {
            send_lines(&mut write, &["{\"QMP\":{}}"]).await;
            let _ = lines.next_line().await;
            send_lines(
                &mut write,
                &["{\"error\":{\"class\":\"GenericError\",\"desc\":\"caps rejected\"}}"],
            )
            .await;
        });
        let err = Client::connect(&ctx(), &monitor.path, &test_log())
            .await
            .expect_err("rejected capabilities must fail");
        assert!(matches!(err, QmpError::CapabilitiesRejected { .. }), "got {err}");
    }

    #[tokio::test]
    async fn connect_dial_failure() {
        let err = Client::connect(&ctx(), Path::new("/nonexistent/qmp.sock"), &test_log())
            .await
            .expect_err("bad socket path must fail");
        assert!(matches!(err, QmpError::Dial { .. }), "got {err}");
    }

    #[tokio::test]
    async fn connect_greeting_eof() {
        // Peer hangs up before sending anything: that is a read error,
        // not a missing greeting.
        let monitor = start_monitor(|_lines, write| async move {
            drop(write);
        });
        let err = Client::connect(&ctx(), &monitor.path, &test_log())
            .await
            .expect_err("eof during greeting must fail");
        assert!(matches!(err, QmpError::Protocol { .. }), "got {err}");
    }

    #[tokio::test]
    async fn connect_cancelled() {
        let monitor = start_monitor(|mut lines, write| async move {
            // Accept the connection but never answer anything. The write
            // half is held open so the client sees silence, not EOF.
            let _write = write;
            while let Ok(Some(_)) = lines.next_line().await {}
        });
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let err = Client::connect(&Ctx::new(token), &monitor.path, &test_log())
            .await
            .expect_err("cancelled connect must fail");
        assert!(matches!(err, QmpError::Cancelled(_)), "got {err}");
    }

    #[tokio::test]
    async fn execute_returns_payload() {
        let monitor = start_monitor(|mut lines, mut write| async move {
            serve_handshake(&mut lines, &mut write).await;
            let line = lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["execute"], "query-migrate");
            assert!(req.get("arguments").is_none());
            send_lines(&mut write, &["{\"return\":{\"status\":\"active\"}}"]).await;
        });
        let mut client = Client::connect(&ctx(), &monitor.path, &test_log()).await.unwrap();
        let payload = client.execute(&ctx(), Command::QueryMigrate).await.unwrap();
        assert_eq!(payload["status"], "active");
    }

    #[tokio::test]
    async fn execute_sends_typed_arguments() {
        let monitor = start_monitor(|mut lines, mut write| async move {
            serve_handshake(&mut lines, &mut write).await;
            let line = lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["execute"], "block-job-cancel");
            assert_eq!(req["arguments"]["device"], "mirror-drive0");
            assert_eq!(req["arguments"]["force"], true);
            send_lines(&mut write, &["{\"return\":{}}"]).await;
        });
        let mut client = Client::connect(&ctx(), &monitor.path, &test_log()).await.unwrap();
        client
            .execute(
                &ctx(),
                Command::BlockJobCancel { device: "mirror-drive0".to_string(), force: true },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn execute_error_reply() {
        let monitor = start_monitor(|mut lines, mut write| async move {
            serve_handshake(&mut lines, &mut write).await;
            let _ = lines.next_line().await;
            send_lines(
                &mut write,
                &["{\"error\":{\"class\":\"DeviceNotActive\",\"desc\":\"no job\"}}"],
            )
            .await;
        });
        let mut client = Client::connect(&ctx(), &monitor.path, &test_log()).await.unwrap();
        let err = client.execute(&ctx(), Command::QueryBlockJobs).await.unwrap_err();
        match err {
            QmpError::CommandFailed { verb, class, desc } => {
                assert_eq!(verb, "query-block-jobs");
                assert_eq!(class, "DeviceNotActive");
                assert_eq!(desc, "no job");
            }
            other => panic!("expected CommandFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn execute_after_close_fails_and_close_is_idempotent() {
        let monitor = start_monitor(|mut lines, mut write| async move {
            serve_handshake(&mut lines, &mut write).await;
        });
        let mut client = Client::connect(&ctx(), &monitor.path, &test_log()).await.unwrap();
        client.close();
        client.close();
        let err = client.execute(&ctx(), Command::QueryMigrate).await.unwrap_err();
        assert!(matches!(err, QmpError::Closed(_)), "got {err}");
        let err = client
            .wait_for_event(&ctx(), "STOP", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, QmpError::Closed(_)), "got {err}");
    }

    #[tokio::test]
    async fn execute_buffers_events_for_later_waits() {
        let monitor = start_monitor(|mut lines, mut write| async move {
            serve_handshake(&mut lines, &mut write).await;
            let _ = lines.next_line().await;
            // Two events interleave ahead of the command reply.
            send_lines(
                &mut write,
                &[
                    "{\"event\":\"STOP\",\"timestamp\":{}}",
                    "{\"event\":\"MIGRATION\",\"timestamp\":{}}",
                    "{\"return\":{}}",
                ],
            )
            .await;
            // Keep the connection up so the event waits below exercise the
            // buffer, not the wire.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let mut client = Client::connect(&ctx(), &monitor.path, &test_log()).await.unwrap();
        client.execute(&ctx(), Command::QueryMigrate).await.unwrap();

        // Found in the buffer regardless of match order, and each entry is
        // consumed exactly once.
        client
            .wait_for_event(&ctx(), "MIGRATION", Duration::from_millis(100))
            .await
            .expect("buffered event should satisfy the wait");
        client
            .wait_for_event(&ctx(), "STOP", Duration::from_millis(100))
            .await
            .expect("older buffered event should still be present");
        let err = client
            .wait_for_event(&ctx(), "STOP", Duration::from_millis(100))
            .await
            .expect_err("consumed event must not match twice");
        assert!(matches!(err, QmpError::EventTimeout(_)), "got {err}");
    }

    #[tokio::test]
    async fn wait_for_event_reads_wire_and_discards_nonmatching() {
        let monitor = start_monitor(|mut lines, mut write| async move {
            serve_handshake(&mut lines, &mut write).await;
            send_lines(
                &mut write,
                &[
                    "{\"event\":\"BLOCK_JOB_READY\",\"timestamp\":{}}",
                    "{\"event\":\"RESUME\",\"timestamp\":{}}",
                ],
            )
            .await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let mut client = Client::connect(&ctx(), &monitor.path, &test_log()).await.unwrap();
        client
            .wait_for_event(&ctx(), "RESUME", Duration::from_secs(5))
            .await
            .expect("matching event should end the wait");

        // The non-matching event seen on the way is discarded, not
        // re-buffered.
        let err = client
            .wait_for_event(&ctx(), "BLOCK_JOB_READY", Duration::from_millis(100))
            .await
            .expect_err("discarded events must not reappear");
        assert!(matches!(err, QmpError::EventTimeout(_)), "got {err}");
    }

    #[tokio::test]
    async fn wait_for_event_times_out() {
        let monitor = start_monitor(|mut lines, mut write| async move {
            serve_handshake(&mut lines, &mut write).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let mut client = Client::connect(&ctx(), &monitor.path, &test_log()).await.unwrap();
        let err = client
            .wait_for_event(&ctx(), "RESUME", Duration::from_millis(200))
            .await
            .unwrap_err();
        match err {
            QmpError::EventTimeout(name) => assert_eq!(name, "RESUME"),
            other => panic!("expected EventTimeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn cancellation_leaves_session_usable() {
        let monitor = start_monitor(|mut lines, mut write| async move {
            serve_handshake(&mut lines, &mut write).await;
            // Answer the post-cancellation cleanup command only.
            let line = lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["execute"], "migrate_cancel");
            send_lines(&mut write, &["{\"return\":{}}"]).await;
        });
        let mut client = Client::connect(&ctx(), &monitor.path, &test_log()).await.unwrap();

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let err = client
            .wait_for_event(&Ctx::new(token), "STOP", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, QmpError::Cancelled(_)), "got {err}");

        // The session must still carry cleanup traffic.
        client
            .execute(&Ctx::cleanup(), Command::MigrateCancel)
            .await
            .expect("session should survive cancellation");
    }

    #[tokio::test]
    async fn execute_cancelled_mid_flight() {
        let monitor = start_monitor(|mut lines, mut write| async move {
            serve_handshake(&mut lines, &mut write).await;
            // Swallow the first command without answering; answer the
            // second.
            let _ = lines.next_line().await;
            let _ = lines.next_line().await;
            send_lines(&mut write, &["{\"return\":{}}"]).await;
        });
        let mut client = Client::connect(&ctx(), &monitor.path, &test_log()).await.unwrap();

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let err =
            client.execute(&Ctx::new(token), Command::QueryMigrate).await.unwrap_err();
        assert!(matches!(err, QmpError::Cancelled(_)), "got {err}");

        client
            .execute(&Ctx::cleanup(), Command::NbdServerStop)
            .await
            .expect("session should survive a cancelled execute");
    }

    #[tokio::test]
    async fn execute_deadline_expiry() {
        let monitor = start_monitor(|mut lines, mut write| async move {
            serve_handshake(&mut lines, &mut write).await;
            let _ = lines.next_line().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let mut client = Client::connect(&ctx(), &monitor.path, &test_log()).await.unwrap();
        let short = Ctx::with_deadline(
            CancellationToken::new(),
            Instant::now() + Duration::from_millis(200),
        );
        let err = client.execute(&short, Command::QueryMigrate).await.unwrap_err();
        match err {
            QmpError::ExecuteTimeout(verb) => assert_eq!(verb, "query-migrate"),
            other => panic!("expected ExecuteTimeout, got {other}"),
        }
    }
}
