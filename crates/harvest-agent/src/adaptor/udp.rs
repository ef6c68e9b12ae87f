// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Listens on a UDP port and emits one chunk per datagram.
//!
//! The stream offset counts payload bytes received. Datagrams that arrived
//! while the adaptor was down are gone, so the offset only orders chunks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, error, warn};

use crate::adaptor::task::AdaptorTask;
use crate::adaptor::{Adaptor, AdaptorFactory, ShutdownPolicy, StartContext};
use crate::config::AdaptorSettings;
use crate::constants::UDP_BUFFER_SIZE;
use crate::errors::AdaptorError;

pub struct UdpAdaptor {
    kind: String,
    port: u16,
    bytes_received: Arc<AtomicU64>,
    local_addr: Mutex<Option<SocketAddr>>,
    bind_retries: u32,
    bind_backoff: Duration,
    grace: Duration,
    task: AdaptorTask,
}

impl UdpAdaptor {
    #[must_use]
    pub fn new(settings: &AdaptorSettings) -> Self {
        Self {
            kind: String::new(),
            port: 0,
            bytes_received: Arc::new(AtomicU64::new(0)),
            local_addr: Mutex::new(None),
            bind_retries: settings.udp_bind_retries,
            bind_backoff: settings.udp_bind_backoff,
            grace: settings.graceful_timeout,
            task: AdaptorTask::new(),
        }
    }

    /// Address actually bound, once started. Differs from the configured port
    /// when that port is 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        #[allow(clippy::expect_used)]
        *self.local_addr.lock().expect("lock poisoned")
    }

    async fn bind(&self) -> Result<UdpSocket, AdaptorError> {
        let addr = format!("0.0.0.0:{}", self.port);
        let mut attempt = 0;
        loop {
            match UdpSocket::bind(&addr).await {
                Ok(socket) => return Ok(socket),
                Err(e) if attempt < self.bind_retries => {
                    let backoff = self.bind_backoff * (1 << attempt.min(16));
                    warn!("failed to bind {addr} (attempt {}): {e}; retrying in {backoff:?}", attempt + 1);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("giving up binding {addr} after {} attempts: {e}", attempt + 1);
                    return Err(AdaptorError::Start(format!("cannot bind {addr}: {e}")));
                }
            }
        }
    }
}

#[async_trait]
impl Adaptor for UdpAdaptor {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn current_status(&self) -> String {
        format!("{} {}", self.kind, self.port)
    }

    fn parse_args(
        &mut self,
        kind: &str,
        params: &str,
        _factory: &AdaptorFactory,
    ) -> Result<String, AdaptorError> {
        let params = params.trim();
        self.port = params
            .parse::<u16>()
            .map_err(|e| AdaptorError::InvalidParams(format!("bad port '{params}': {e}")))?;
        self.kind = kind.to_string();
        Ok(self.port.to_string())
    }

    async fn start(&self, ctx: StartContext) -> Result<(), AdaptorError> {
        let socket = self.bind().await?;
        let local = socket.local_addr()?;
        debug!("adaptor {} listening on {local}", ctx.id);
        #[allow(clippy::expect_used)]
        {
            *self.local_addr.lock().expect("lock poisoned") = Some(local);
        }
        self.bytes_received.store(ctx.offset, Ordering::SeqCst);

        let received = Arc::clone(&self.bytes_received);
        let kind = self.kind.clone();
        self.task.spawn(move |signals| async move {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            loop {
                tokio::select! {
                    () = signals.draining() => break,
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((n, from)) => {
                            let seq = received.fetch_add(n as u64, Ordering::SeqCst) + n as u64;
                            let chunk = ctx.control.new_chunk(
                                &kind,
                                &from.to_string(),
                                seq,
                                buf[..n].to_vec(),
                            );
                            ctx.dest.add(chunk).await;
                        }
                        Err(e) => warn!("error receiving on {local}: {e}"),
                    }
                }
            }
        });
        Ok(())
    }

    async fn shutdown(&self, policy: ShutdownPolicy) -> Result<u64, AdaptorError> {
        self.task.stop(policy, self.grace).await;
        Ok(self.bytes_received.load(Ordering::SeqCst))
    }
}
