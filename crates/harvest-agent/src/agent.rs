// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires the registry, queue, checkpointing, watchdog, drain and control
//! listener into one running agent.
//!
//! Startup order:
//!
//! 1. build the queue, adaptor factory and registry
//! 2. replay the lowest checkpoint generation
//! 3. replay the boot-time adaptor list (ids already restored are left alone)
//! 4. bind the control listener
//! 5. spawn the checkpoint timer, watchdog, connector and listener tasks
//!
//! [`Agent::shutdown`] stops every adaptor with the chosen policy, lets the
//! connector flush, writes a final checkpoint that still lists the stopped
//! adaptors and then empties the registry.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adaptor::mem_buffered::MemBufferStore;
use crate::adaptor::{AdaptorFactory, ShutdownPolicy};
use crate::checkpoint::{CheckpointManager, RestoreSummary};
use crate::chunk::Tags;
use crate::config::Config;
use crate::connector::{ChunkSink, CommitReporter, Connector};
use crate::control::ControlServer;
use crate::errors::AgentError;
use crate::hostname::resolve_hostname;
use crate::queue::ChunkQueue;
use crate::registry::{AddOutcome, Registry};
use crate::watchdog::Watchdog;

/// How long in-flight tasks get once the agent has been told to stop.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Cloneable handle for requesting shutdown from elsewhere.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    shutdown_token: CancellationToken,
}

impl AgentHandle {
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Resolves once shutdown has been requested, by this handle or by a
    /// `stopagent` control command.
    pub async fn requested(&self) {
        self.shutdown_token.cancelled().await;
    }
}

pub struct Agent {
    config: Config,
    hostname: String,
    registry: Arc<Registry>,
    queue: Arc<ChunkQueue>,
    mem_buffers: Arc<MemBufferStore>,
    checkpoint: Option<Arc<CheckpointManager>>,
    watchdog: Option<Arc<Watchdog>>,
    restored: RestoreSummary,
    control_addr: Option<SocketAddr>,
    /// Requested shutdown; cancelled by handles and `stopagent`.
    shutdown_token: CancellationToken,
    /// Stops the timers and the control listener.
    services_token: CancellationToken,
    /// Stops the connector, after adaptors have flushed.
    drain_token: CancellationToken,
    service_tasks: Vec<JoinHandle<()>>,
    drain_task: Option<JoinHandle<()>>,
}

impl Agent {
    /// Builds and starts an agent delivering to `sink`.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or when the control port cannot be
    /// bound. Unreadable checkpoints and boot lists are logged and skipped.
    pub async fn start(config: Config, sink: Arc<dyn ChunkSink>) -> Result<Self, AgentError> {
        Self::start_with_factory(config, sink, |_| {}).await
    }

    /// Like [`Agent::start`], with a chance to register extra adaptor classes
    /// next to the built-in ones.
    ///
    /// # Errors
    ///
    /// Same as [`Agent::start`].
    pub async fn start_with_factory<F>(
        config: Config,
        sink: Arc<dyn ChunkSink>,
        customize: F,
    ) -> Result<Self, AgentError>
    where
        F: FnOnce(&mut AdaptorFactory),
    {
        config
            .validate()
            .map_err(|e| AgentError::Config(e.to_string()))?;

        let hostname = resolve_hostname(config.hostname.as_deref());
        let tags = Tags::parse(&config.tags);
        debug!("agent source '{hostname}', default tags {tags}");

        let queue = Arc::new(ChunkQueue::new(config.chunk_queue_limit));
        let mem_buffers = Arc::new(MemBufferStore::default());
        let mut factory =
            AdaptorFactory::with_builtins(&config.adaptors, Arc::clone(&mem_buffers));
        customize(&mut factory);
        let registry = Registry::new(factory, queue.clone(), &hostname, tags);

        let checkpoint = config
            .checkpoint_location()
            .map(|dir| Arc::new(CheckpointManager::new(dir, &config.checkpoint_name)));
        let restored = match &checkpoint {
            Some(manager) => match manager.restore(&registry).await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!("checkpoint restore failed, starting cold: {e}");
                    RestoreSummary::default()
                }
            },
            None => {
                info!("checkpointing disabled");
                RestoreSummary::default()
            }
        };

        if let Some(path) = &config.initial_adaptors {
            load_initial_adaptors(&registry, path).await;
        }

        let watchdog = config
            .watchdog_enabled
            .then(|| Arc::new(Watchdog::new(Arc::clone(&registry), config.watchdog_timeout)));

        let shutdown_token = CancellationToken::new();
        let services_token = CancellationToken::new();
        let drain_token = CancellationToken::new();
        let mut service_tasks = Vec::new();

        let mut control_addr = None;
        if config.control_enabled {
            let addr = format!("{}:{}", config.control_host, config.control_port);
            let listener = ControlServer::bind(&addr)
                .await
                .map_err(|source| AgentError::ControlBind {
                    addr: addr.clone(),
                    source,
                })?;
            let local = listener.local_addr()?;
            info!("control listener on {local}");
            control_addr = Some(local);
            let server = Arc::new(ControlServer::new(
                Arc::clone(&registry),
                shutdown_token.clone(),
                &hostname,
            ));
            service_tasks.push(tokio::spawn(server.serve(listener, services_token.clone())));
        }

        if let Some(manager) = &checkpoint {
            service_tasks.push(tokio::spawn(Arc::clone(manager).run(
                Arc::clone(&registry),
                config.checkpoint_interval,
                services_token.clone(),
            )));
        }

        if let Some(watchdog) = &watchdog {
            service_tasks.push(tokio::spawn(
                Arc::clone(watchdog).run(services_token.clone()),
            ));
        }

        let connector = Connector::new(
            queue.clone(),
            sink,
            CommitReporter::new(Arc::clone(&registry), watchdog.clone()),
            watchdog.clone(),
            config.collect_max_bytes,
        );
        let drain_task = Some(tokio::spawn(connector.run(drain_token.clone())));

        info!(
            "agent started with {} adaptors",
            registry.adaptor_count()
        );
        Ok(Self {
            config,
            hostname,
            registry,
            queue,
            mem_buffers,
            checkpoint,
            watchdog,
            restored,
            control_addr,
            shutdown_token,
            services_token,
            drain_token,
            service_tasks,
            drain_task,
        })
    }

    #[must_use]
    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            shutdown_token: self.shutdown_token.clone(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<ChunkQueue> {
        &self.queue
    }

    #[must_use]
    pub fn mem_buffers(&self) -> &Arc<MemBufferStore> {
        &self.mem_buffers
    }

    #[must_use]
    pub fn watchdog(&self) -> Option<&Arc<Watchdog>> {
        self.watchdog.as_ref()
    }

    #[must_use]
    pub fn checkpoint(&self) -> Option<&Arc<CheckpointManager>> {
        self.checkpoint.as_ref()
    }

    /// What the boot-time checkpoint replay did.
    #[must_use]
    pub fn restored(&self) -> &RestoreSummary {
        &self.restored
    }

    /// Bound control address, when the listener is enabled.
    #[must_use]
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_addr
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Waits until shutdown is requested.
    pub async fn wait(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// Stops everything. Adaptors are stopped with `policy` and the final
    /// checkpoint records them at their committed offsets.
    ///
    /// # Errors
    ///
    /// Returns the checkpoint error if the final checkpoint could not be written;
    /// everything else is still shut down.
    pub async fn shutdown(mut self, policy: ShutdownPolicy) -> Result<(), AgentError> {
        info!("agent shutting down with policy {policy}");
        self.shutdown_token.cancel();
        self.services_token.cancel();

        self.registry.shutdown_all(policy).await;

        if policy != ShutdownPolicy::HardStop {
            let grace = self.config.adaptors.graceful_timeout;
            let queue = Arc::clone(&self.queue);
            let flushed = tokio::time::timeout(grace, async move {
                while !queue.is_empty() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;
            if flushed.is_err() {
                warn!(
                    "{} bytes still queued after {grace:?}, abandoning them",
                    self.queue.size()
                );
            }
        }
        self.drain_token.cancel();
        if let Some(drain) = self.drain_task.take() {
            if let Err(e) = drain.await {
                error!("connector task failed: {e}");
            }
        }

        let checkpointed = match &self.checkpoint {
            Some(manager) => manager.write(&self.registry).await.map(|path| {
                info!("final checkpoint written to {}", path.display());
            }),
            None => Ok(()),
        };
        self.registry.clear();

        let deadline = tokio::time::Instant::now() + TASK_SHUTDOWN_TIMEOUT;
        for handle in self.service_tasks.drain(..) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("agent task failed: {e}"),
                Err(_) => warn!("agent task did not stop in time"),
            }
        }

        info!("agent shutdown complete");
        checkpointed.map_err(AgentError::from)
    }
}

/// Replays a boot-time file of add commands. Blank lines and `#` comments are
/// skipped; an unreadable file or a rejected line is logged and does not stop
/// the agent.
async fn load_initial_adaptors(registry: &Registry, path: &Path) {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("initial adaptors file {} not found", path.display());
            return;
        }
        Err(e) => {
            warn!("cannot read initial adaptors file {}: {e}", path.display());
            return;
        }
    };

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match registry.process_add_command(line).await {
            Ok(AddOutcome::AlreadyRunning(id)) => {
                info!("adaptor {id} already restored from checkpoint, skipping boot entry");
            }
            Ok(_) => {}
            Err(e) => warn!("ignoring initial adaptor '{line}': {e}"),
        }
    }
}
