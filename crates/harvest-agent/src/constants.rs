// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Prefix carried by every adaptor id.
pub const ADAPTOR_ID_PREFIX: &str = "adaptor_";

/// Default base name of checkpoint files; the generation number is appended.
pub const DEFAULT_CHECKPOINT_NAME: &str = "harvest_checkpoint_";
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

pub const DEFAULT_QUEUE_LIMIT: usize = 10 * 1024 * 1024;
pub const DEFAULT_COLLECT_MAX_BYTES: usize = 1024 * 1024;

/// Three stall periods of five minutes each.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(3 * 5 * 60);
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_CONTROL_HOST: &str = "127.0.0.1";
pub const DEFAULT_CONTROL_PORT: u16 = 9093;
/// Longest control command accepted, newline excluded.
pub const MAX_COMMAND_LINE: usize = 64 * 1024;

pub const DEFAULT_TAGS: &str = "cluster=\"unknown\"";

pub const DEFAULT_FILE_TAIL_PERIOD: Duration = Duration::from_secs(2);
pub const DEFAULT_FILE_MAX_READ_SIZE: usize = 128 * 1024;

pub const DEFAULT_CONST_RATE_MIN_SLEEP_MS: u64 = 300;
pub const DEFAULT_CONST_RATE_SLEEP_VARIANCE_MS: u64 = 200;

pub const DEFAULT_EXEC_PERIOD: Duration = Duration::from_secs(5);

pub const DEFAULT_MEM_BUFFER_SIZE: usize = 1024 * 1024;
pub const DEFAULT_WRITEAHEAD_COMPACT_AT: u64 = 1024 * 1024;

pub const DEFAULT_UDP_BIND_RETRIES: u32 = 5;
pub const DEFAULT_UDP_BIND_BACKOFF: Duration = Duration::from_millis(100);
/// Largest datagram the UDP adaptor accepts.
pub const UDP_BUFFER_SIZE: usize = 65536;
