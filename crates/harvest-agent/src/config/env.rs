// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `HARVEST_*` environment variable source. Keys match the YAML keys,
//! upper-cased: `HARVEST_CHECKPOINT_DIR`, `HARVEST_WATCHDOG_TIMEOUT_SECS`, ...

use figment::{providers::Env, Figment};

use crate::config::{Config, ConfigError, ConfigSource, PartialConfig};

pub const ENV_PREFIX: &str = "HARVEST_";

#[derive(Debug, Clone, Copy, Default)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<PartialConfig>() {
            Ok(env_config) => env_config.merge_into(config),
            Err(e) => {
                return Err(ConfigError::ParseError(format!(
                    "Failed to parse config from environment variables: {e}, using default config."
                )));
            }
        }

        Ok(())
    }
}
