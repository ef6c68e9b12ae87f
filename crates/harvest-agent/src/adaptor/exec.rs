// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runs a shell command periodically and emits its standard output.
//!
//! Params: `[<periodSecs>] <command>`. Output of a past run cannot be
//! reproduced, so every chunk is reported as committed as soon as it is handed
//! on; a restart never replays.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::adaptor::task::AdaptorTask;
use crate::adaptor::{Adaptor, AdaptorFactory, ShutdownPolicy, StartContext};
use crate::config::AdaptorSettings;
use crate::errors::AdaptorError;

fn params_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)\s+(.+?)\s*$").expect("valid pattern"))
}

pub struct ExecAdaptor {
    kind: String,
    command: String,
    period: Duration,
    offset: Arc<AtomicU64>,
    grace: Duration,
    task: AdaptorTask,
}

impl ExecAdaptor {
    #[must_use]
    pub fn new(settings: &AdaptorSettings) -> Self {
        Self {
            kind: String::new(),
            command: String::new(),
            period: settings.exec_default_period,
            offset: Arc::new(AtomicU64::new(0)),
            grace: settings.graceful_timeout,
            task: AdaptorTask::new(),
        }
    }
}

async fn run_once(command: &str) -> std::io::Result<(Vec<u8>, Option<i32>)> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;
    if !output.stderr.is_empty() {
        debug!(
            "'{command}' wrote to stderr: {}",
            String::from_utf8_lossy(&output.stderr).trim_end()
        );
    }
    Ok((output.stdout, output.status.code()))
}

#[async_trait]
impl Adaptor for ExecAdaptor {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn current_status(&self) -> String {
        format!("{} {} {}", self.kind, self.period.as_secs(), self.command)
    }

    fn parse_args(
        &mut self,
        kind: &str,
        params: &str,
        _factory: &AdaptorFactory,
    ) -> Result<String, AdaptorError> {
        let params = params.trim();
        let command = match params_pattern().captures(params) {
            Some(caps) => {
                let secs = caps[1].parse::<u64>().map_err(|e| {
                    AdaptorError::InvalidParams(format!("bad period '{}': {e}", &caps[1]))
                })?;
                if secs == 0 {
                    return Err(AdaptorError::InvalidParams(
                        "period must be at least one second".to_string(),
                    ));
                }
                self.period = Duration::from_secs(secs);
                caps[2].to_string()
            }
            None => params.to_string(),
        };
        if command.is_empty() {
            return Err(AdaptorError::InvalidParams(
                "expected '[<periodSecs>] <command>'".to_string(),
            ));
        }
        self.command = command;
        self.kind = kind.to_string();
        Ok(format!("{} {}", self.period.as_secs(), self.command))
    }

    async fn start(&self, ctx: StartContext) -> Result<(), AdaptorError> {
        self.offset.store(ctx.offset, Ordering::SeqCst);

        let offset = Arc::clone(&self.offset);
        let command = self.command.clone();
        let kind = self.kind.clone();
        let period = self.period;

        self.task.spawn(move |signals| async move {
            loop {
                match run_once(&command).await {
                    Ok((stdout, status)) if !stdout.is_empty() => {
                        let seq = offset.fetch_add(stdout.len() as u64, Ordering::SeqCst)
                            + stdout.len() as u64;
                        let mut chunk = ctx.control.new_chunk(&kind, &command, seq, stdout);
                        if let Some(code) = status {
                            chunk.add_tag("exitStatus", &code.to_string());
                        }
                        ctx.dest.add(chunk).await;
                        ctx.control.report_commit(seq).await;
                    }
                    Ok(_) => debug!("'{command}' produced no output"),
                    Err(e) => warn!("failed to run '{command}': {e}"),
                }

                if signals.is_draining() {
                    break;
                }
                tokio::select! {
                    () = signals.draining() => break,
                    () = tokio::time::sleep(period) => {}
                }
            }
        });
        Ok(())
    }

    async fn shutdown(&self, policy: ShutdownPolicy) -> Result<u64, AdaptorError> {
        self.task.stop(policy, self.grace).await;
        Ok(self.offset.load(Ordering::SeqCst))
    }
}
