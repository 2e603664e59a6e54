//! # User session resource
//!
//! [UserInfoResource] caches the active user of the session. It is a [CachedData] named
//! [USER_INFO_RESOURCE] whose identity key is the user id, or [ANONYMOUS_USER_ID] when
//! nobody is signed in. Subscribers of [UserInfoResource::subscribe_user_changes]
//! are notified exactly once per change of the signed-in user.
//!
//! Operations that change who is signed in (login, federated authentication, logout)
//! reload the user wholesale and mark the session data outdated. Operations that
//! change the user's settings run as exclusive updates of the cache.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::auth::{AuthCredentials, CredentialsProcessor};
use crate::cache::{CachedData, DataLoader, Includes, Outdatable};
use crate::config::ClientConfig;
use crate::error::Error;
use crate::gateway::{AuthInfo, AuthStatus, LoginRequest, LogoutInfo, RemoteCallGateway};
use crate::task::{while_task, PollOutcome, PollPolicy, Task};
use crate::user::{
    UserInfoIncludes, UserRecord, INCLUDE_CONFIGURATION_PARAMETERS, INCLUDE_ORIGIN_DETAILS,
};

pub const ANONYMOUS_USER_ID: &str = "anonymous";
pub const USER_INFO_RESOURCE: &str = "user-info";

#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    pub credentials: Option<AuthCredentials>,
    pub configuration_id: Option<String>,
    pub link_user: bool,
    pub force_sessions_logout: bool,
}

struct ActiveUserLoader {
    gateway: Arc<dyn RemoteCallGateway>,
}

#[async_trait]
impl DataLoader<Option<UserRecord>> for ActiveUserLoader {
    async fn load(&self, includes: &Includes) -> Result<Option<UserRecord>, Error> {
        self.gateway
            .get_active_user(&UserInfoIncludes::from_includes(includes))
            .await
    }
}

fn user_identity(user: &Option<UserRecord>) -> String {
    match user {
        Some(user) if !user.user_id.is_empty() => user.user_id.clone(),
        _ => ANONYMOUS_USER_ID.to_owned(),
    }
}

struct UserInfoInner {
    cache: CachedData<Option<UserRecord>>,
    gateway: Arc<dyn RemoteCallGateway>,
    credentials: Arc<dyn CredentialsProcessor>,
    session_data: Arc<dyn Outdatable>,
    local_provider_id: String,
    poll: PollPolicy,
}

#[derive(Clone)]
pub struct UserInfoResource {
    inner: Arc<UserInfoInner>,
}

impl UserInfoResource {
    pub fn new(
        gateway: Arc<dyn RemoteCallGateway>,
        credentials: Arc<dyn CredentialsProcessor>,
        session_data: Arc<dyn Outdatable>,
        config: &ClientConfig,
    ) -> Self {
        let loader = Arc::new(ActiveUserLoader {
            gateway: gateway.clone(),
        });
        let cache = CachedData::builder(USER_INFO_RESOURCE, loader)
            .default_includes(Includes::from_names([
                INCLUDE_ORIGIN_DETAILS,
                INCLUDE_CONFIGURATION_PARAMETERS,
            ]))
            .identity(user_identity)
            .build();
        UserInfoResource {
            inner: Arc::new(UserInfoInner {
                cache,
                gateway,
                credentials,
                session_data,
                local_provider_id: config.auth.local_provider_id.clone(),
                poll: config.poll.to_policy(),
            }),
        }
    }

    pub fn cache(&self) -> &CachedData<Option<UserRecord>> {
        &self.inner.cache
    }

    pub async fn load(&self) -> Result<Option<UserRecord>, Error> {
        self.inner.cache.load(None).await
    }

    /// Load with additional include flags, e.g. [crate::user::INCLUDE_META_PARAMETERS].
    pub async fn load_with(&self, includes: &Includes) -> Result<Option<UserRecord>, Error> {
        self.inner.cache.load(Some(includes)).await
    }

    pub fn data(&self) -> Option<UserRecord> {
        self.inner.cache.data()
    }

    pub fn get_id(&self) -> String {
        user_identity(&self.inner.cache.data())
    }

    pub fn auth_role(&self) -> Option<String> {
        self.data().and_then(|user| user.auth_role)
    }

    pub fn parameters_available(&self) -> bool {
        self.data().is_some()
    }

    pub fn is_linked(&self, provider_id: &str) -> bool {
        self.data()
            .is_some_and(|user| user.linked_auth_providers.iter().any(|p| p == provider_id))
    }

    /// The local provider always counts as having a token.
    pub fn has_token(&self, provider_id: &str) -> bool {
        if provider_id == self.inner.local_provider_id {
            return true;
        }
        self.data().is_some_and(|user| {
            user.auth_tokens
                .iter()
                .any(|token| token.auth_provider == provider_id)
        })
    }

    pub fn get_configuration_parameter(&self, key: &str) -> Option<Value> {
        self.data()
            .and_then(|user| user.configuration_parameters.get(key).cloned())
    }

    /// Fetch the active user from scratch and tell the session data it is outdated.
    async fn reload(&self) -> Result<(), Error> {
        let cache = &self.inner.cache;
        cache.reset_includes();
        cache
            .perform_update(|| async {
                let user = cache.fetch().await?;
                cache.set_data(user);
                Ok(())
            })
            .await?;
        self.inner.session_data.mark_outdated();
        Ok(())
    }

    pub async fn login(&self, provider: &str, options: LoginOptions) -> Result<AuthInfo, Error> {
        let credentials = match &options.credentials {
            Some(credentials) => Some(
                self.inner
                    .credentials
                    .process_credentials(provider, credentials)
                    .await?,
            ),
            None => None,
        };
        let auth_info = self
            .inner
            .gateway
            .auth_login(LoginRequest {
                provider: provider.to_owned(),
                configuration: options.configuration_id,
                credentials,
                link_user: options.link_user,
                custom_include_origin_details: true,
                force_sessions_logout: options.force_sessions_logout,
            })
            .await?;
        info!(provider, status = ?auth_info.auth_status, "Login request finished");
        if auth_info.is_complete() {
            self.reload().await?;
        }
        Ok(auth_info)
    }

    /// Poll the status of a federated authentication until it completes.
    /// Cancelling the returned task stops the polling.
    ///
    /// Polling starts immediately on the current tokio runtime; calling this outside
    /// a runtime panics.
    pub fn finish_federated_authentication(
        &self,
        auth_id: &str,
        link_user: bool,
    ) -> Task<Option<UserRecord>> {
        let this = self.clone();
        let auth_id = auth_id.to_owned();
        let policy = self.inner.poll.clone();
        Task::spawn(move |token| async move {
            let gateway = this.inner.gateway.clone();
            let auth_info = while_task(
                &token,
                &policy,
                |info: &AuthInfo| match info.auth_status {
                    AuthStatus::Success => PollOutcome::Success,
                    AuthStatus::Error => {
                        PollOutcome::Failed(Error::authentication_error("Authentication error"))
                    }
                    _ => PollOutcome::Pending,
                },
                || {
                    let gateway = gateway.clone();
                    let auth_id = auth_id.clone();
                    async move { gateway.get_auth_status(&auth_id, link_user).await }
                },
            )
            .await?;
            debug!(auth_id = %auth_id, "Federated authentication finished");
            if auth_info.is_complete() {
                this.reload().await?;
            }
            Ok(this.data())
        })
    }

    pub async fn logout(
        &self,
        provider: Option<&str>,
        configuration: Option<&str>,
    ) -> Result<LogoutInfo, Error> {
        let result = self
            .inner
            .gateway
            .auth_logout(provider, configuration)
            .await?;
        info!(?provider, "Logged out");
        self.reload().await?;
        Ok(result)
    }

    pub async fn update_preferences(
        &self,
        preferences: Map<String, Value>,
    ) -> Result<Option<UserRecord>, Error> {
        let cache = &self.inner.cache;
        cache
            .perform_update(|| async {
                let includes = UserInfoIncludes::from_includes(&cache.includes());
                let user = self
                    .inner
                    .gateway
                    .update_user_preferences(&preferences, &includes)
                    .await?;
                cache.set_data(user);
                Ok(())
            })
            .await?;
        Ok(self.data())
    }

    /// Store a configuration parameter and patch the cached user in place.
    /// Does nothing when no user is available.
    pub async fn set_configuration_parameter(
        &self,
        key: &str,
        value: Value,
    ) -> Result<Option<UserRecord>, Error> {
        self.load().await?;
        if !self.parameters_available() {
            return Ok(self.data());
        }
        let cache = &self.inner.cache;
        cache
            .perform_update(|| async move {
                self.inner
                    .gateway
                    .set_user_configuration_parameter(key, Some(value.clone()))
                    .await?;
                cache.update_in_place(|user| {
                    if let Some(user) = user {
                        user.configuration_parameters.insert(key.to_owned(), value);
                    }
                });
                cache.emit_data_outdated();
                Ok(())
            })
            .await?;
        Ok(self.data())
    }

    /// Delete one or more configuration parameters. Unknown keys are ignored.
    pub async fn delete_configuration_parameter<I, S>(
        &self,
        keys: I,
    ) -> Result<Option<UserRecord>, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        self.load().await?;
        if !self.parameters_available() {
            return Ok(self.data());
        }
        let cache = &self.inner.cache;
        cache
            .perform_update(|| async {
                for name in keys.iter() {
                    self.inner
                        .gateway
                        .set_user_configuration_parameter(name, None)
                        .await?;
                }
                cache.update_in_place(|user| {
                    if let Some(user) = user {
                        for name in keys.iter() {
                            user.configuration_parameters.remove(name);
                        }
                    }
                });
                cache.emit_data_outdated();
                Ok(())
            })
            .await?;
        Ok(self.data())
    }

    /// Change the local password; both passwords are sent hashed.
    pub async fn update_local_password(&self, old_password: &str, new_password: &str) -> Result<(), Error> {
        let old_hash = self.inner.credentials.hash_value(old_password);
        let new_hash = self.inner.credentials.hash_value(new_password);
        self.inner
            .cache
            .perform_update(|| async {
                self.inner
                    .gateway
                    .auth_change_local_password(&old_hash, &new_hash)
                    .await
            })
            .await
    }

    /// Identity changes: the new user id or [ANONYMOUS_USER_ID].
    pub fn subscribe_user_changes(&self) -> broadcast::Receiver<String> {
        self.inner.cache.subscribe_identity_changes()
    }

    pub fn subscribe_exceptions(&self) -> broadcast::Receiver<Error> {
        self.inner.cache.subscribe_exceptions()
    }

    pub fn subscribe_data_outdated(&self) -> broadcast::Receiver<()> {
        self.inner.cache.subscribe_data_outdated()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.cache.subscribe()
    }

    /// Mark the user outdated whenever the session resource reports outdated data.
    pub fn follow_session(&self, session: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        self.inner.cache.follow(session)
    }
}

impl Outdatable for UserInfoResource {
    fn mark_outdated(&self) {
        self.inner.cache.mark_outdated();
    }
}
