use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::cache::Includes;

pub const INCLUDE_ORIGIN_DETAILS: &str = "customIncludeOriginDetails";
pub const INCLUDE_CONFIGURATION_PARAMETERS: &str = "includeConfigurationParameters";
pub const INCLUDE_META_PARAMETERS: &str = "includeMetaParameters";

/// Token of an authentication provider the user is signed in with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserAuthToken {
    pub auth_provider: String,
    pub auth_configuration: Option<String>,
    pub login_time: DateTime<Utc>,
    pub user_id: String,
    pub display_name: String,
    pub message: Option<String>,
}

/// Active user as reported by the server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct UserRecord {
    pub user_id: String,
    pub display_name: Option<String>,
    pub auth_role: Option<String>,
    pub linked_auth_providers: Vec<String>,
    pub auth_tokens: Vec<UserAuthToken>,
    pub configuration_parameters: HashMap<String, Value>,
    pub meta_parameters: HashMap<String, Value>,
}

impl UserRecord {
    pub fn new(user_id: &str) -> Self {
        UserRecord {
            user_id: user_id.to_owned(),
            ..Default::default()
        }
    }
}

/// Optional sections of the active user query.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserInfoIncludes {
    pub custom_include_origin_details: bool,
    pub include_configuration_parameters: bool,
    pub include_meta_parameters: bool,
}

impl UserInfoIncludes {
    pub fn from_includes(includes: &Includes) -> Self {
        UserInfoIncludes {
            custom_include_origin_details: includes.contains(INCLUDE_ORIGIN_DETAILS),
            include_configuration_parameters: includes.contains(INCLUDE_CONFIGURATION_PARAMETERS),
            include_meta_parameters: includes.contains(INCLUDE_META_PARAMETERS),
        }
    }
}
