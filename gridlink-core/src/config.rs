//! Client configuration.
//!
//! Configuration is declarative and can be read from YAML or JSON.
//! All sections are optional; missing values take their defaults.
//!
//! # Example (YAML)
//! ```yaml
//! poll:
//!   interval_ms: 500
//!   max_attempts: 120
//! auth:
//!   hashed_credential_fields:
//!     local: [password]
//! data_source:
//!   fetch_size: 500
//!   access: Readonly
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::auth::{HashingCredentialsProcessor, AUTH_PROVIDER_LOCAL_ID};
use crate::data_source::{AccessMode, DataFormat};
use crate::error::{Error, ErrorType};
use crate::task::PollPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ClientConfig {
    pub poll: PollConfig,
    pub auth: AuthConfig,
    pub data_source: DataSourceConfig,
}

/// Polling of long-running server operations, e.g. federated authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    /// `None` polls without limit until cancelled.
    pub max_attempts: Option<u32>,
}

impl Default for PollConfig {
    fn default() -> Self {
        let policy = PollPolicy::default();
        PollConfig {
            interval_ms: policy.interval.as_millis() as u64,
            max_attempts: policy.max_attempts,
        }
    }
}

impl PollConfig {
    pub fn to_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.interval_ms),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    pub local_provider_id: String,
    /// Credential fields hashed before being sent, per provider.
    pub hashed_credential_fields: HashMap<String, Vec<String>>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let mut hashed_credential_fields = HashMap::new();
        hashed_credential_fields.insert(
            AUTH_PROVIDER_LOCAL_ID.to_owned(),
            vec!["password".to_owned()],
        );
        AuthConfig {
            local_provider_id: AUTH_PROVIDER_LOCAL_ID.to_owned(),
            hashed_credential_fields,
        }
    }
}

impl AuthConfig {
    pub fn credentials_processor(&self) -> HashingCredentialsProcessor {
        HashingCredentialsProcessor::new(self.hashed_credential_fields.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DataSourceConfig {
    /// Default page size of a data request.
    pub fetch_size: u64,
    pub access: AccessMode,
    pub data_format: DataFormat,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        DataSourceConfig {
            fetch_size: 200,
            access: AccessMode::Default,
            data_format: DataFormat::Resultset,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml).map_err(|e| Error::parse_error("YAML configuration", &e))
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::parse_error("JSON configuration", &e))
    }

    /// Load configuration from a file; `.json` files are read as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::new(
                ErrorType::IoError,
                format!("Failed to read configuration {}: {}", path.display(), e),
            )
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_yaml(&text),
        }
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self).map_err(|e| Error::serialization_error("configuration", &e))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::serialization_error("configuration", &e))
    }
}
