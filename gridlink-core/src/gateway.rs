//! Remote call surface used by the client resources.
//!
//! Transport is not part of this crate; the embedding application implements
//! [RemoteCallGateway] over whatever protocol the server speaks.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Error;
use crate::user::{UserAuthToken, UserInfoIncludes, UserRecord};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthStatus {
    Success,
    InProgress,
    Error,
    Expired,
    #[serde(other)]
    Unknown,
}

/// Result of a login attempt or of an authentication status check.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthInfo {
    pub auth_id: Option<String>,
    pub auth_status: AuthStatus,
    pub redirect_link: Option<String>,
    /// Present only when the authentication completed.
    pub user_tokens: Option<Vec<UserAuthToken>>,
}

impl AuthInfo {
    /// True if the login finished and the active user should be reloaded.
    pub fn is_complete(&self) -> bool {
        self.user_tokens.is_some() && self.auth_status == AuthStatus::Success
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub provider: String,
    pub configuration: Option<String>,
    pub credentials: Option<Map<String, Value>>,
    pub link_user: bool,
    pub custom_include_origin_details: bool,
    pub force_sessions_logout: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LogoutInfo {
    pub redirect_links: Vec<String>,
}

#[async_trait]
pub trait RemoteCallGateway: Send + Sync {
    async fn auth_login(&self, request: LoginRequest) -> Result<AuthInfo, Error>;

    async fn get_auth_status(&self, auth_id: &str, link_user: bool) -> Result<AuthInfo, Error>;

    async fn auth_logout(
        &self,
        provider: Option<&str>,
        configuration: Option<&str>,
    ) -> Result<LogoutInfo, Error>;

    async fn get_active_user(
        &self,
        includes: &UserInfoIncludes,
    ) -> Result<Option<UserRecord>, Error>;

    async fn update_user_preferences(
        &self,
        preferences: &Map<String, Value>,
        includes: &UserInfoIncludes,
    ) -> Result<Option<UserRecord>, Error>;

    /// Store a configuration parameter; `None` deletes it.
    async fn set_user_configuration_parameter(
        &self,
        name: &str,
        value: Option<Value>,
    ) -> Result<(), Error>;

    async fn auth_change_local_password(
        &self,
        old_password_hash: &str,
        new_password_hash: &str,
    ) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_is_tolerated() {
        let info: AuthInfo =
            serde_json::from_str(r#"{"authId": "a1", "authStatus": "WHATEVER"}"#).unwrap();
        assert_eq!(info.auth_status, AuthStatus::Unknown);
        assert!(!info.is_complete());
        let info: AuthInfo = serde_json::from_str(
            r#"{"authStatus": "SUCCESS", "userTokens": []}"#,
        )
        .unwrap();
        assert!(info.is_complete());
    }
}
