// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared plumbing for decorators that wrap another adaptor.
//!
//! A decorator is added as `add <id> = <Decorator> <innerClass> <innerKind>
//! <innerParams> <offset>`: the kind slot names the inner class and the params
//! carry the inner adaptor's own kind and params.

use std::sync::OnceLock;

use regex::Regex;

use crate::adaptor::{Adaptor, AdaptorFactory};
use crate::errors::AdaptorError;

fn inner_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    PATTERN.get_or_init(|| Regex::new(r"^(\S+)(?:\s+(.*?))?\s*$").expect("valid pattern"))
}

/// The wrapped adaptor and its class name.
#[derive(Default)]
pub struct Wrapped {
    inner_class: String,
    inner: Option<Box<dyn Adaptor>>,
}

impl Wrapped {
    /// Builds and configures the inner adaptor. Returns the canonical params of
    /// the decorator: `"<innerKind> <innerCanonical>"`.
    pub fn parse(
        &mut self,
        inner_class: &str,
        params: &str,
        factory: &AdaptorFactory,
    ) -> Result<String, AdaptorError> {
        let caps = inner_pattern().captures(params.trim()).ok_or_else(|| {
            AdaptorError::InvalidParams("expected '<innerKind> <innerParams>'".to_string())
        })?;
        let inner_kind = &caps[1];
        let inner_params = caps.get(2).map_or("", |m| m.as_str());

        let mut inner = factory.create(inner_class).ok_or_else(|| {
            AdaptorError::InvalidParams(format!("unknown inner adaptor class '{inner_class}'"))
        })?;
        let canonical = inner.parse_args(inner_kind, inner_params, factory)?;

        self.inner_class = inner_class.to_string();
        self.inner = Some(inner);
        Ok(format!("{inner_kind} {canonical}"))
    }

    pub fn inner(&self) -> Result<&dyn Adaptor, AdaptorError> {
        self.inner
            .as_deref()
            .ok_or_else(|| AdaptorError::Start("wrapped adaptor was never configured".to_string()))
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        self.inner.as_deref().map_or("", |inner| inner.kind())
    }

    /// `"<innerClass> <innerStatus>"`, which re-parses as decorator params.
    #[must_use]
    pub fn status(&self) -> String {
        match self.inner.as_deref() {
            Some(inner) => format!("{} {}", self.inner_class, inner.current_status()),
            None => self.inner_class.clone(),
        }
    }

    /// Passes a commit on to the inner adaptor, for stacked decorators.
    pub async fn forward_commit(&self, offset: u64) {
        if let Some(listener) = self
            .inner
            .as_deref()
            .and_then(|inner| inner.as_commit_listener())
        {
            listener.committed(offset).await;
        }
    }
}
