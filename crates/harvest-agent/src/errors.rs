// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the agent.

/// Failures raised by an adaptor while parsing, starting or stopping.
#[derive(Debug, thiserror::Error)]
pub enum AdaptorError {
    #[error("Invalid adaptor parameters: {0}")]
    InvalidParams(String),

    #[error("Adaptor failed to start: {0}")]
    Start(String),

    #[error("Adaptor shutdown failed: {0}")]
    Shutdown(String),

    #[error("Adaptor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Distinguishable rejections of an `add` control command. None of these
/// leave any state behind in the registry.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Malformed add command: {0}")]
    Malformed(String),

    #[error("Bad offset in add command: {0}")]
    BadOffset(String),

    #[error("Unknown adaptor class: {0}")]
    UnknownClass(String),

    #[error("Adaptor {class} rejected parameters: {reason}")]
    InvalidParams { class: String, reason: String },

    #[error("Adaptor {id} failed to start: {reason}")]
    StartFailed { id: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sink rejected batch: {0}")]
    Rejected(String),
}

/// Errors that stop the agent from starting or shutting down cleanly.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind control listener on {addr}: {source}")]
    ControlBind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Logger initialization failed: {0}")]
    Logger(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_display() {
        let error = CommandError::BadOffset("12x".to_string());
        assert_eq!(error.to_string(), "Bad offset in add command: 12x");

        let error = CommandError::InvalidParams {
            class: "ConstRate".to_string(),
            reason: "expected a rate".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Adaptor ConstRate rejected parameters: expected a rate"
        );
    }

    #[test]
    fn test_agent_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let error: AgentError = io.into();
        assert!(matches!(error, AgentError::Io(_)));
        assert_eq!(error.to_string(), "I/O error: gone");
    }

    #[test]
    fn test_adaptor_error_debug() {
        let error = AdaptorError::Start("no such file".into());
        let debug_str = format!("{error:?}");
        assert!(debug_str.contains("Start"));
    }
}
