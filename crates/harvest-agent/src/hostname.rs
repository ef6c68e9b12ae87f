// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hostname stamped on chunks as their source.

use std::env;
use tracing::warn;

/// Resolves the host name in order: the configured override, `HARVEST_HOSTNAME`,
/// `HOSTNAME`, the system hostname, then `"unknown"`.
#[must_use]
pub fn resolve_hostname(configured: Option<&str>) -> String {
    if let Some(hostname) = configured.filter(|h| !h.trim().is_empty()) {
        return hostname.trim().to_string();
    }

    for var in ["HARVEST_HOSTNAME", "HOSTNAME"] {
        if let Ok(hostname) = env::var(var) {
            if !hostname.is_empty() {
                return hostname;
            }
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname_osstr) => {
            if let Some(hostname_str) = hostname_osstr.to_str() {
                if !hostname_str.is_empty() {
                    return hostname_str.to_string();
                }
            }
        }
        Err(e) => {
            warn!("Failed to get system hostname: {}", e);
        }
    }

    warn!("Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}
