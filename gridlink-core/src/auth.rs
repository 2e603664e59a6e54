use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Error;

pub const AUTH_PROVIDER_LOCAL_ID: &str = "local";

/// Credentials entered by the user for one provider profile.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct AuthCredentials {
    pub profile: Option<String>,
    pub credentials: Map<String, Value>,
}

/// Prepares credentials before they leave the client.
#[async_trait]
pub trait CredentialsProcessor: Send + Sync {
    async fn process_credentials(
        &self,
        provider: &str,
        credentials: &AuthCredentials,
    ) -> Result<Map<String, Value>, Error>;

    fn hash_value(&self, value: &str) -> String;
}

/// Replaces configured secret fields by their blake3 digest.
#[derive(Debug, Clone, Default)]
pub struct HashingCredentialsProcessor {
    hashed_fields: HashMap<String, Vec<String>>,
}

impl HashingCredentialsProcessor {
    pub fn new(hashed_fields: HashMap<String, Vec<String>>) -> Self {
        HashingCredentialsProcessor { hashed_fields }
    }

    /// Processor hashing the `password` field of the local provider.
    pub fn local() -> Self {
        let mut hashed_fields = HashMap::new();
        hashed_fields.insert(
            AUTH_PROVIDER_LOCAL_ID.to_owned(),
            vec!["password".to_owned()],
        );
        HashingCredentialsProcessor { hashed_fields }
    }
}

#[async_trait]
impl CredentialsProcessor for HashingCredentialsProcessor {
    async fn process_credentials(
        &self,
        provider: &str,
        credentials: &AuthCredentials,
    ) -> Result<Map<String, Value>, Error> {
        let mut processed = credentials.credentials.clone();
        let Some(fields) = self.hashed_fields.get(provider) else {
            return Ok(processed);
        };
        for field in fields {
            match processed.get(field) {
                None => {}
                Some(Value::String(secret)) => {
                    let hashed = self.hash_value(secret);
                    processed.insert(field.clone(), Value::String(hashed));
                }
                Some(_) => {
                    return Err(Error::parameter_error(format!(
                        "Credential field '{}' of provider '{}' must be a string",
                        field, provider
                    )))
                }
            }
        }
        Ok(processed)
    }

    fn hash_value(&self, value: &str) -> String {
        blake3::hash(value.as_bytes()).to_hex().to_string()
    }
}
