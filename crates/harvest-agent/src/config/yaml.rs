// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `harvest.yaml` configuration source.
//!
//! ```yaml
//! log_level: debug
//! checkpoint_dir: /var/lib/harvest
//! initial_adaptors: /etc/harvest/initial_adaptors
//! watchdog_timeout_secs: 900
//! tags: cluster="prod"
//! ```

use std::path::PathBuf;

use figment::{
    providers::{Format, Yaml},
    Figment,
};

use crate::config::{Config, ConfigError, ConfigSource, PartialConfig};

#[derive(Debug, PartialEq, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct YamlConfigSource {
    pub path: PathBuf,
}

impl ConfigSource for YamlConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Yaml::file(self.path.clone()));

        match figment.extract::<PartialConfig>() {
            Ok(yaml_config) => yaml_config.merge_into(config),
            Err(e) => {
                return Err(ConfigError::ParseError(format!(
                    "Failed to parse config from yaml file: {e}, using default config."
                )));
            }
        }

        Ok(())
    }
}
