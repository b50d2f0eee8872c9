//! Configuration loading via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// CPI configuration derived from environment variables and configuration
/// files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "CPI",
    discovery(
        app_name = "fleet-cpi",
        env_var = "FLEET_CPI_CONFIG_PATH",
        config_file_name = "fleet-cpi.toml",
        dotfile_name = ".fleet-cpi.toml",
        project_file_name = "fleet-cpi.toml"
    )
)]
pub struct CpiConfig {
    /// Bearer token for the fleet API. This value is required.
    pub fleet_token: String,
    /// Account used to scope fleet API requests.
    pub fleet_account_id: Option<String>,
    /// Base URL of the fleet API.
    #[ortho_config(default = "https://api.spotinst.io/aws/ec2".to_owned())]
    pub fleet_api_url: String,
    /// Transport deadline for each fleet API request, in seconds.
    #[ortho_config(default = 30)]
    pub request_timeout_secs: u64,
    /// Availability zone used when neither disks, subnets nor the VM type
    /// pin one.
    pub default_availability_zone: Option<String>,
    /// Key pair used when the VM type does not name one.
    pub default_key_name: Option<String>,
    /// Comma-separated security groups used when neither the networks nor
    /// the VM type name any.
    pub default_security_groups: Option<String>,
    /// Instance profile used when the VM type does not name one.
    pub default_iam_instance_profile: Option<String>,
    /// Mark deleted volumes and return without waiting for removal.
    #[ortho_config(default = false)]
    pub fast_path_delete: bool,
    /// Directory for the file-backed settings registry.
    pub registry_path: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl CpiConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to fleet-cpi.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("fleet-cpi")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.fleet_token,
            &FieldMetadata::new("fleet API token", "CPI_FLEET_TOKEN", "fleet_token"),
        )?;
        Self::require_field(
            &self.fleet_api_url,
            &FieldMetadata::new("fleet API URL", "CPI_FLEET_API_URL", "fleet_api_url"),
        )?;
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "request_timeout_secs must be greater than zero",
            )));
        }
        Ok(())
    }

    /// Per-request transport deadline for the fleet API.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Default security groups split into a list.
    #[must_use]
    pub fn security_groups(&self) -> Vec<String> {
        self.default_security_groups
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|group| !group.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
