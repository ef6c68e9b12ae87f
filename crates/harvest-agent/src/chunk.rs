// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The unit of data moved through the agent.
//!
//! A [`Chunk`] carries a contiguous slice of one adaptor's logical byte stream.
//! Its `seq_id` is the stream offset of the byte *after* the payload, so the
//! first payload byte sits at `seq_id - data.len()`.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Opaque handle naming one registration of an adaptor.
///
/// Handles are allocated by the registry and never reused, so a restarted
/// adaptor gets a fresh handle even though it keeps its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdaptorRef(u64);

impl AdaptorRef {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AdaptorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    PATTERN.get_or_init(|| Regex::new(r#"([^\s="]+)="([^"]*)""#).expect("valid tag pattern"))
}

/// Ordered `key="value"` tags attached to a chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tags(Vec<(String, String)>);

impl Tags {
    /// Parses every `key="value"` pair found in `s`; anything else is ignored.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        let mut tags = Tags::default();
        for cap in tag_pattern().captures_iter(s) {
            tags.insert(&cap[1], &cap[2]);
        }
        tags
    }

    /// Sets `key`, replacing an earlier value.
    pub fn insert(&mut self, key: &str, value: &str) {
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.0.push((key.to_string(), value.to_string())),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{k}=\"{v}\"")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Data kind of the producing adaptor, used to route the payload downstream.
    pub kind: String,
    /// Free-text description of where the bytes came from (a path, a command).
    pub stream_name: String,
    /// Host the chunk was produced on.
    pub source: String,
    pub seq_id: u64,
    pub data: Vec<u8>,
    /// Offsets of the last byte of each record inside `data`.
    pub record_offsets: Vec<u32>,
    pub tags: Tags,
    /// Registration that produced the chunk. Bookkeeping only; it is not
    /// persisted and plays no part in equality.
    #[serde(skip)]
    pub initiator: Option<AdaptorRef>,
}

impl Chunk {
    /// Builds a chunk holding a single record.
    #[must_use]
    pub fn new(kind: &str, stream_name: &str, seq_id: u64, data: Vec<u8>) -> Self {
        let record_offsets = match data.len() {
            0 => Vec::new(),
            n => vec![u32::try_from(n - 1).unwrap_or(u32::MAX)],
        };
        Self {
            kind: kind.to_string(),
            stream_name: stream_name.to_string(),
            source: String::new(),
            seq_id,
            data,
            record_offsets,
            tags: Tags::default(),
            initiator: None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Stream position of the first payload byte.
    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.seq_id.saturating_sub(self.data.len() as u64)
    }

    #[must_use]
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name)
    }

    pub fn add_tag(&mut self, name: &str, value: &str) {
        self.tags.insert(name, value);
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.stream_name == other.stream_name
            && self.source == other.source
            && self.seq_id == other.seq_id
            && self.data == other.data
            && self.record_offsets == other.record_offsets
            && self.tags == other.tags
    }
}

impl Eq for Chunk {}
