use scriptd_protocol::ScriptServiceVersion;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{ClientError, ClientResult};

/// Raw, unvalidated client settings as they appear in a TOML document.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default = "default_retries_enabled")]
    pub retries_enabled: bool,
    #[serde(default = "default_retry_duration_secs")]
    pub retry_duration_secs: u64,
    #[serde(default = "default_minimum_attempts")]
    pub minimum_attempts_for_interrupted_long_running_calls: u32,
    #[serde(default = "default_max_script_service_version")]
    pub max_script_service_version: ScriptServiceVersion,
    #[serde(default)]
    pub disabled_script_service_versions: Vec<ScriptServiceVersion>,
    #[serde(default = "default_abandon_complete_script_after_secs")]
    pub on_cancellation_abandon_complete_script_after_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retries_enabled: default_retries_enabled(),
            retry_duration_secs: default_retry_duration_secs(),
            minimum_attempts_for_interrupted_long_running_calls: default_minimum_attempts(),
            max_script_service_version: default_max_script_service_version(),
            disabled_script_service_versions: Vec::new(),
            on_cancellation_abandon_complete_script_after_secs:
                default_abandon_complete_script_after_secs(),
        }
    }
}

/// Validated, immutable client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    retries_enabled: bool,
    retry_duration: Duration,
    minimum_attempts: u32,
    max_script_service_version: ScriptServiceVersion,
    disabled_script_service_versions: BTreeSet<ScriptServiceVersion>,
    on_cancellation_abandon_complete_script_after: Duration,
}

impl ClientOptions {
    pub fn from_toml_str(contents: &str) -> ClientResult<Self> {
        let config: ClientConfig =
            toml::from_str(contents).map_err(|e| ClientError::InvalidConfiguration {
                message: e.to_string(),
            })?;
        Self::try_from(config)
    }

    pub fn retries_enabled(&self) -> bool {
        self.retries_enabled
    }

    /// Budget within which ordinary retries of one call must fit.
    pub fn retry_duration(&self) -> Duration {
        self.retry_duration
    }

    pub fn minimum_attempts_for_interrupted_long_running_calls(&self) -> u32 {
        self.minimum_attempts
    }

    pub fn max_script_service_version(&self) -> ScriptServiceVersion {
        self.max_script_service_version
    }

    pub fn disabled_script_service_versions(&self) -> &BTreeSet<ScriptServiceVersion> {
        &self.disabled_script_service_versions
    }

    pub fn on_cancellation_abandon_complete_script_after(&self) -> Duration {
        self.on_cancellation_abandon_complete_script_after
    }

    /// Whether the client may use `version` if the remote offers it.
    pub fn allows(&self, version: ScriptServiceVersion) -> bool {
        version <= self.max_script_service_version
            && !self.disabled_script_service_versions.contains(&version)
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        let config = ClientConfig::default();
        Self {
            retries_enabled: config.retries_enabled,
            retry_duration: Duration::from_secs(config.retry_duration_secs),
            minimum_attempts: config.minimum_attempts_for_interrupted_long_running_calls,
            max_script_service_version: config.max_script_service_version,
            disabled_script_service_versions: BTreeSet::new(),
            on_cancellation_abandon_complete_script_after: Duration::from_secs(
                config.on_cancellation_abandon_complete_script_after_secs,
            ),
        }
    }
}

impl TryFrom<ClientConfig> for ClientOptions {
    type Error = ClientError;

    fn try_from(config: ClientConfig) -> ClientResult<Self> {
        if config.minimum_attempts_for_interrupted_long_running_calls == 0 {
            return Err(ClientError::InvalidConfiguration {
                message: "minimum_attempts_for_interrupted_long_running_calls must be at least 1"
                    .to_string(),
            });
        }
        if config
            .disabled_script_service_versions
            .contains(&ScriptServiceVersion::V1)
        {
            return Err(ClientError::InvalidConfiguration {
                message: "script service V1 cannot be disabled".to_string(),
            });
        }

        Ok(Self {
            retries_enabled: config.retries_enabled,
            retry_duration: Duration::from_secs(config.retry_duration_secs),
            minimum_attempts: config.minimum_attempts_for_interrupted_long_running_calls,
            max_script_service_version: config.max_script_service_version,
            disabled_script_service_versions: config
                .disabled_script_service_versions
                .into_iter()
                .collect(),
            on_cancellation_abandon_complete_script_after: Duration::from_secs(
                config.on_cancellation_abandon_complete_script_after_secs,
            ),
        })
    }
}

fn default_retries_enabled() -> bool {
    true
}

fn default_retry_duration_secs() -> u64 {
    150
}

fn default_minimum_attempts() -> u32 {
    1
}

fn default_max_script_service_version() -> ScriptServiceVersion {
    ScriptServiceVersion::V3Alpha
}

fn default_abandon_complete_script_after_secs() -> u64 {
    60
}
