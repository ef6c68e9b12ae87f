// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Adaptor id rules.

use sha2::{Digest, Sha256};

use crate::constants::ADAPTOR_ID_PREFIX;

/// Prefixes `id` with `adaptor_` unless it already carries the prefix.
#[must_use]
pub fn normalize_id(id: &str) -> String {
    let id = id.trim();
    if id.starts_with(ADAPTOR_ID_PREFIX) {
        id.to_string()
    } else {
        format!("{ADAPTOR_ID_PREFIX}{id}")
    }
}

/// Stable id derived from what the adaptor does, so the same add command
/// always maps to the same adaptor. `class` should be the resolved class name.
#[must_use]
pub fn synthesize_id(class: &str, kind: &str, canonical_params: &str) -> String {
    let mut hasher = Sha256::new();
    for field in [class, kind, canonical_params] {
        hasher.update(field.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("{ADAPTOR_ID_PREFIX}{}", &digest[..32])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_adds_prefix_once() {
        assert_eq!(normalize_id("tail"), "adaptor_tail");
        assert_eq!(normalize_id("adaptor_tail"), "adaptor_tail");
        assert_eq!(normalize_id(" tail "), "adaptor_tail");
    }

    #[test]
    fn test_synthesized_id_is_stable_and_distinct() {
        let a = synthesize_id("FileTailer", "syslog", "/var/log/messages");
        let b = synthesize_id("FileTailer", "syslog", "/var/log/messages");
        let c = synthesize_id("FileTailer", "syslog", "/var/log/secure");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("adaptor_"));
        assert_eq!(a.len(), "adaptor_".len() + 32);
    }

    #[test]
    fn test_field_boundaries_matter() {
        assert_ne!(
            synthesize_id("AB", "C", "x"),
            synthesize_id("A", "BC", "x")
        );
        assert_ne!(synthesize_id("A", "B", "Cx"), synthesize_id("A", "BC", "x"));
    }
}
