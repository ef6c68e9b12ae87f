// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod adaptor;
pub mod agent;
pub mod checkpoint;
pub mod chunk;
pub mod config;
pub mod connector;
pub mod constants;
pub mod control;
pub mod errors;
pub mod hostname;
pub mod logger;
pub mod queue;
pub mod registry;
pub mod watchdog;
