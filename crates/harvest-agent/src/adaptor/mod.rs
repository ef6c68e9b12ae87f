// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Adaptors are the pluggable producers supervised by the registry.
//!
//! An adaptor is created from a class name through the [`AdaptorFactory`],
//! validates its parameters in [`Adaptor::parse_args`], then runs as its own task
//! after [`Adaptor::start`], pushing [`Chunk`]s into a [`ChunkReceiver`]. It is
//! stopped with one of the [`ShutdownPolicy`] variants and then discarded; a
//! restart always builds a fresh instance under the same id.
//!
//! ```text
//! Created --parse_args--> Created --start--> Running --shutdown(policy)--> Stopped
//! ```

pub mod const_rate;
pub mod exec;
pub mod factory;
pub mod file_tailer;
pub mod mem_buffered;
pub mod naming;
pub mod task;
pub mod udp;
pub mod wrapper;
pub mod writeahead;

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::chunk::{AdaptorRef, Chunk, Tags};
use crate::errors::AdaptorError;
use crate::registry::Registry;

pub use factory::AdaptorFactory;

/// How an adaptor should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownPolicy {
    /// Abandon in-flight work and return the best known offset immediately.
    HardStop,
    /// Flush within the grace window, then stop.
    Gracefully,
    /// Flush with no time limit.
    WaitTillFinished,
    /// Like `Gracefully`, but the same adaptor id is about to be re-added, so
    /// stateful decorators keep their replay state.
    Restarting,
}

impl ShutdownPolicy {
    /// Whether replay state outlives this stop.
    #[must_use]
    pub fn retains_state(self) -> bool {
        matches!(self, ShutdownPolicy::Restarting)
    }
}

impl fmt::Display for ShutdownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownPolicy::HardStop => "HARD_STOP",
            ShutdownPolicy::Gracefully => "GRACEFULLY",
            ShutdownPolicy::WaitTillFinished => "WAIT_TILL_FINISHED",
            ShutdownPolicy::Restarting => "RESTARTING",
        };
        f.write_str(name)
    }
}

/// Destination for chunks. Implementations may suspend the caller.
#[async_trait]
pub trait ChunkReceiver: Send + Sync {
    async fn add(&self, chunk: Chunk);
}

/// Optional capability: adaptors that want to hear about downstream commits.
#[async_trait]
pub trait CommitListener: Send + Sync {
    async fn committed(&self, offset: u64);
}

#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Data kind stamped on every chunk this adaptor emits.
    fn kind(&self) -> &str;

    /// `"<kind> <params>"` such that `add <id> = <class> <status> <offset>`
    /// rebuilds an equivalent adaptor.
    fn current_status(&self) -> String;

    /// Validates `params` and returns their canonical form. Runs before `start`
    /// and has no side effects beyond recording the parsed values.
    fn parse_args(
        &mut self,
        kind: &str,
        params: &str,
        factory: &AdaptorFactory,
    ) -> Result<String, AdaptorError>;

    async fn start(&self, ctx: StartContext) -> Result<(), AdaptorError>;

    /// Stops the adaptor and returns the offset just past the last byte it emitted.
    async fn shutdown(&self, policy: ShutdownPolicy) -> Result<u64, AdaptorError>;

    fn as_commit_listener(&self) -> Option<&dyn CommitListener> {
        None
    }
}

/// Everything an adaptor receives when it is started.
#[derive(Clone)]
pub struct StartContext {
    pub id: String,
    pub kind: String,
    /// Stream offset to resume from.
    pub offset: u64,
    pub dest: Arc<dyn ChunkReceiver>,
    pub control: AdaptorControl,
}

impl StartContext {
    /// Same context with a different destination, used by decorators to
    /// interpose on the inner adaptor's output.
    #[must_use]
    pub fn with_dest(&self, dest: Arc<dyn ChunkReceiver>, offset: u64) -> Self {
        Self {
            id: self.id.clone(),
            kind: self.kind.clone(),
            offset,
            dest,
            control: self.control.clone(),
        }
    }
}

/// An adaptor's handle back into the agent. Holds the registry weakly so an
/// adaptor never keeps the registry alive.
#[derive(Clone)]
pub struct AdaptorControl {
    registry: Weak<Registry>,
    adaptor: AdaptorRef,
    id: String,
    source: String,
    tags: Tags,
}

impl AdaptorControl {
    pub(crate) fn new(
        registry: Weak<Registry>,
        adaptor: AdaptorRef,
        id: &str,
        source: &str,
        tags: Tags,
    ) -> Self {
        Self {
            registry,
            adaptor,
            id: id.to_string(),
            source: source.to_string(),
            tags,
        }
    }

    /// A control not attached to any registry. Commits and deregistration are no-ops.
    #[must_use]
    pub fn detached(id: &str, adaptor: AdaptorRef) -> Self {
        Self::new(Weak::new(), adaptor, id, "localhost", Tags::default())
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn adaptor_ref(&self) -> AdaptorRef {
        self.adaptor
    }

    /// Builds a chunk stamped with this host, the default tags and this registration.
    #[must_use]
    pub fn new_chunk(&self, kind: &str, stream_name: &str, seq_id: u64, data: Vec<u8>) -> Chunk {
        let mut chunk = Chunk::new(kind, stream_name, seq_id, data);
        chunk.source.clone_from(&self.source);
        chunk.tags = self.tags.clone();
        chunk.initiator = Some(self.adaptor);
        chunk
    }

    /// Reports data as durable without going through the downstream sink. Used by
    /// sources whose output cannot be replayed.
    pub async fn report_commit(&self, offset: u64) -> Option<String> {
        match self.registry.upgrade() {
            Some(registry) => registry.report_commit(self.adaptor, offset).await,
            None => None,
        }
    }

    /// Removes this registration and hard-stops it. The stop runs on its own
    /// task so an adaptor may call this from inside its worker.
    pub fn deregister_and_stop(&self) {
        let Some(registry) = self.registry.upgrade() else {
            debug!("adaptor {} is not attached to a registry", self.id);
            return;
        };
        let adaptor = self.adaptor;
        let id = self.id.clone();
        tokio::spawn(async move {
            if registry
                .stop_registration(adaptor, ShutdownPolicy::HardStop)
                .await
                .is_none()
            {
                warn!("adaptor {id} asked to deregister but was no longer registered");
            }
        });
    }
}

impl fmt::Debug for AdaptorControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptorControl")
            .field("adaptor", &self.adaptor)
            .field("id", &self.id)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Splits `"<first> <rest>"`, trimming both parts.
pub(crate) fn split_first_word(s: &str) -> Option<(&str, &str)> {
    let s = s.trim();
    let (first, rest) = s.split_once(char::is_whitespace)?;
    Some((first, rest.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_retains_state_only_on_restart() {
        assert!(ShutdownPolicy::Restarting.retains_state());
        assert!(!ShutdownPolicy::Gracefully.retains_state());
        assert!(!ShutdownPolicy::HardStop.retains_state());
        assert!(!ShutdownPolicy::WaitTillFinished.retains_state());
        assert_eq!(ShutdownPolicy::WaitTillFinished.to_string(), "WAIT_TILL_FINISHED");
    }

    #[test]
    fn test_detached_control_stamps_chunks() {
        let control = AdaptorControl::detached("adaptor_x", AdaptorRef::new(4));
        let chunk = control.new_chunk("raw", "/var/log/x", 12, b"hello world!".to_vec());
        assert_eq!(chunk.initiator, Some(AdaptorRef::new(4)));
        assert_eq!(chunk.source, "localhost");
        assert_eq!(chunk.start_offset(), 0);
    }

    #[tokio::test]
    async fn test_detached_commit_is_noop() {
        let control = AdaptorControl::detached("adaptor_x", AdaptorRef::new(1));
        assert_eq!(control.report_commit(10).await, None);
        control.deregister_and_stop();
    }

    #[test]
    fn test_split_first_word() {
        assert_eq!(split_first_word(" a  b c "), Some(("a", "b c")));
        assert_eq!(split_first_word("single"), None);
    }
}
