// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line-oriented TCP control protocol.
//!
//! One command per line, command names are case-insensitive:
//!
//! ```text
//! add [<id> =] <class> <kind> [<params>] <offset>   start an adaptor
//! shutdown <id>                                    graceful stop
//! stop <id>                                        hard stop
//! list                                             running adaptors
//! stopall                                          hard stop every adaptor
//! close                                            close this connection
//! stopagent                                        stop the agent
//! help                                             this text
//! <blank>                                          status line
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adaptor::naming::normalize_id;
use crate::adaptor::ShutdownPolicy;
use crate::constants::{ADAPTOR_ID_PREFIX, MAX_COMMAND_LINE};
use crate::registry::{AddOutcome, Registry};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const HELP: &str = "\
you're talking to the harvest agent. Commands available:
add [<id> =] <class> <kind> [<params>] <offset> -- start an adaptor
shutdown <id> -- graceful stop
stop <id> -- abrupt stop
list -- list running adaptors
close -- close this connection
stopagent -- stop the whole agent process
stopall -- stop all adaptors
help -- print this message
\tCommand names are case-blind.";

/// Response to one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// The connection should be closed after writing `text`.
    pub close: bool,
}

impl Reply {
    fn line(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            close: false,
        }
    }

    fn closing(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            close: true,
        }
    }
}

#[derive(Debug)]
pub struct ControlServer {
    registry: Arc<Registry>,
    stop_agent: CancellationToken,
    hostname: String,
}

impl ControlServer {
    /// `stop_agent` is cancelled when a client sends `stopagent`.
    #[must_use]
    pub fn new(registry: Arc<Registry>, stop_agent: CancellationToken, hostname: &str) -> Self {
        Self {
            registry,
            stop_agent,
            hostname: hostname.to_string(),
        }
    }

    #[must_use]
    pub fn status_line(&self) -> String {
        format!(
            "{}: harvest agent running, version {VERSION}, with {} adaptors",
            self.hostname,
            self.registry.adaptor_count()
        )
    }

    /// Runs one command line and returns what to write back.
    pub async fn process_command(&self, line: &str) -> Reply {
        let line = line.trim();
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default().to_ascii_lowercase();
        let argument = words.next();

        match command.as_str() {
            "" => Reply::line(self.status_line()),
            "help" => Reply::line(HELP),
            "close" => Reply::closing(""),
            "add" => match self.registry.process_add_command(line).await {
                Ok(AddOutcome::Started(id) | AddOutcome::AlreadyRunning(id)) => {
                    Reply::line(format!("OK add completed; new ID is {id}"))
                }
                Ok(AddOutcome::Ignored) => Reply::line("FAIL: empty add command"),
                Err(e) => Reply::line(format!("FAIL: {e}")),
            },
            "shutdown" | "stop" => {
                let Some(raw) = argument else {
                    return Reply::line("need to specify an adaptor to shut down, by id");
                };
                let (id, note) = sanitize_id(raw);
                let mut text = note.unwrap_or_default();
                if command == "shutdown" {
                    match self.registry.stop_adaptor(&id, ShutdownPolicy::Gracefully).await {
                        Some(offset) => {
                            text.push_str(&format!("OK adaptor {id} stopping gracefully at {offset}"));
                        }
                        None => text.push_str(&format!("FAIL: perhaps adaptor {id} does not exist")),
                    }
                } else {
                    match self.registry.stop_adaptor(&id, ShutdownPolicy::HardStop).await {
                        Some(_) => text.push_str(&format!("OK adaptor {id} stopped")),
                        None => text.push_str(&format!("FAIL: perhaps adaptor {id} does not exist")),
                    }
                }
                Reply::line(text)
            }
            "list" => {
                let mut text = String::new();
                for (id, description) in self.registry.list() {
                    text.push_str(&format!("{id}) {description}\n"));
                }
                Reply::line(text)
            }
            "stopall" => {
                let stopped = self.registry.stop_all(ShutdownPolicy::HardStop).await;
                Reply::line(format!("stopped {stopped} adaptors"))
            }
            "stopagent" => {
                info!("stopagent received on control connection");
                self.stop_agent.cancel();
                Reply::closing("stopping agent process.")
            }
            other => {
                warn!("unknown control command {other}");
                Reply::line(format!(
                    "unknown command {other}\nsay 'help' for a list of legal commands"
                ))
            }
        }
    }

    /// Binds the listener. Port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn bind(addr: &str) -> io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }

    /// Accepts connections until `cancel` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        let mut connections = JoinSet::new();
        loop {
            let (stream, peer) = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("control listener failed: {e}");
                        break;
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        warn!("control connection task failed: {e}");
                    }
                    continue;
                }
            };

            let server = Arc::clone(&self);
            let cancel = cancel.clone();
            connections.spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer, cancel).await {
                    warn!("control connection from {peer} broke: {e}");
                }
            });
        }
        connections.shutdown().await;
        debug!("control listener stopped");
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> io::Result<()> {
        debug!("control connection from {peer}");
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read).take(0);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            reader.set_limit(MAX_COMMAND_LINE as u64 + 1);
            let read = tokio::select! {
                () = cancel.cancelled() => break,
                read = reader.read_until(b'\n', &mut buf) => read?,
            };
            if read == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') && buf.len() > MAX_COMMAND_LINE {
                warn!("control line from {peer} exceeds {MAX_COMMAND_LINE} bytes, closing");
                write
                    .write_all(format!("FAIL: line longer than {MAX_COMMAND_LINE} bytes\n").as_bytes())
                    .await?;
                write.flush().await?;
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            debug!("command from {peer}: {line}");
            let reply = self.process_command(line).await;
            if !reply.text.is_empty() {
                write.write_all(reply.text.as_bytes()).await?;
                if !reply.text.ends_with('\n') {
                    write.write_all(b"\n").await?;
                }
                write.flush().await?;
            }
            if reply.close {
                break;
            }
        }
        debug!("control connection from {peer} closed");
        Ok(())
    }
}

/// Normalizes a user-typed id, with a note when a prefix had to be added.
fn sanitize_id(raw: &str) -> (String, Option<String>) {
    let id = normalize_id(raw);
    if raw.starts_with(ADAPTOR_ID_PREFIX) {
        (id, None)
    } else {
        let note = format!(
            "adaptor names should start with {ADAPTOR_ID_PREFIX}; assuming you meant {id}\n"
        );
        (id, Some(note))
    }
}
