// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Grammar of the `add` control command:
//!
//! ```text
//! add [<id> =] <adaptorClass> <dataKind> [<params>] <offset>
//! ```
//!
//! The keyword is case-insensitive. Checkpoints and the boot-time adaptor list
//! use the same grammar.

use std::sync::OnceLock;

use regex::Regex;

use crate::errors::CommandError;

fn add_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?i:add)\s+(?:([^\s=]+)\s*=\s*)?([^\s=]+)\s+(\S+)\s+(?:(.*?)\s+)?(\S+)\s*$")
            .expect("valid add pattern")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddCommand {
    /// Explicit id as written, before normalization.
    pub id: Option<String>,
    pub class: String,
    pub kind: String,
    pub params: String,
    pub offset: u64,
}

/// Parses one control line. Blank lines yield `Ok(None)`.
///
/// # Errors
///
/// `CommandError::Malformed` when the line is not an add command,
/// `CommandError::BadOffset` when the trailing offset is not a non-negative integer.
pub fn parse_add_command(line: &str) -> Result<Option<AddCommand>, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let caps = add_pattern()
        .captures(line)
        .ok_or_else(|| CommandError::Malformed(line.to_string()))?;

    let offset_text = &caps[5];
    let offset = offset_text
        .parse::<u64>()
        .map_err(|_| CommandError::BadOffset(offset_text.to_string()))?;

    Ok(Some(AddCommand {
        id: caps.get(1).map(|m| m.as_str().to_string()),
        class: caps[2].to_string(),
        kind: caps[3].to_string(),
        params: caps.get(4).map_or_else(String::new, |m| m.as_str().to_string()),
        offset,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_form() {
        let cmd = parse_add_command("add tail = FileTailer syslog 0 /var/log/messages 1024")
            .unwrap()
            .unwrap();
        assert_eq!(cmd.id.as_deref(), Some("tail"));
        assert_eq!(cmd.class, "FileTailer");
        assert_eq!(cmd.kind, "syslog");
        assert_eq!(cmd.params, "0 /var/log/messages");
        assert_eq!(cmd.offset, 1024);
    }

    #[test]
    fn test_without_id_or_params() {
        let cmd = parse_add_command("ADD Udp datagrams 0").unwrap();
        assert_eq!(
            cmd,
            Some(AddCommand {
                id: None,
                class: "Udp".to_string(),
                kind: "datagrams".to_string(),
                params: String::new(),
                offset: 0,
            })
        );
    }

    #[test]
    fn test_id_without_spaces_around_equals() {
        let cmd = parse_add_command("Add adaptor_x=ConstRate raw 500 7 0")
            .unwrap()
            .unwrap();
        assert_eq!(cmd.id.as_deref(), Some("adaptor_x"));
        assert_eq!(cmd.class, "ConstRate");
        assert_eq!(cmd.params, "500 7");
    }

    #[test]
    fn test_blank_line_is_ignored() {
        assert_eq!(parse_add_command("   ").unwrap(), None);
    }

    #[test]
    fn test_bad_offsets_are_distinguished() {
        assert!(matches!(
            parse_add_command("add ConstRate raw 500 12x"),
            Err(CommandError::BadOffset(o)) if o == "12x"
        ));
        assert!(matches!(
            parse_add_command("add ConstRate raw 500 -5"),
            Err(CommandError::BadOffset(_))
        ));
        assert!(matches!(
            parse_add_command("add ConstRate raw 500 99999999999999999999999"),
            Err(CommandError::BadOffset(_))
        ));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            parse_add_command("remove ConstRate raw 0"),
            Err(CommandError::Malformed(_))
        ));
        assert!(matches!(
            parse_add_command("add ConstRate"),
            Err(CommandError::Malformed(_))
        ));
    }
}
