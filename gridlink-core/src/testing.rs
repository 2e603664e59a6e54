//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::cache::Outdatable;
use crate::error::Error;
use crate::gateway::{AuthInfo, AuthStatus, LoginRequest, LogoutInfo, RemoteCallGateway};
use crate::user::{UserAuthToken, UserInfoIncludes, UserRecord};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Counts how often the session data was marked outdated.
#[derive(Default)]
pub struct SessionProbe {
    outdated: AtomicUsize,
}

impl SessionProbe {
    pub fn count(&self) -> usize {
        self.outdated.load(Ordering::SeqCst)
    }
}

impl Outdatable for SessionProbe {
    fn mark_outdated(&self) {
        self.outdated.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeState {
    /// User that a successful login signs in.
    known_user: Option<UserRecord>,
    active_user: Option<UserRecord>,
    auth_statuses: VecDeque<AuthStatus>,
    failing: bool,
    last_login: Option<LoginRequest>,
    last_includes: Option<UserInfoIncludes>,
    parameter_calls: Vec<(String, Option<Value>)>,
    password_change: Option<(String, String)>,
}

/// Scripted in-memory server.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeState>,
    active_user_calls: AtomicUsize,
    auth_status_calls: AtomicUsize,
}

fn token_for(user: &UserRecord, provider: &str) -> UserAuthToken {
    UserAuthToken {
        auth_provider: provider.to_owned(),
        auth_configuration: None,
        login_time: Utc::now(),
        user_id: user.user_id.clone(),
        display_name: user.user_id.clone(),
        message: None,
    }
}

impl FakeGateway {
    /// Gateway where logins succeed for `user_id`.
    pub fn with_user(user_id: &str) -> Self {
        let mut user = UserRecord::new(user_id);
        user.auth_role = Some("user".to_owned());
        user.linked_auth_providers = vec!["github".to_owned()];
        user.auth_tokens = vec![token_for(&user, "github")];
        let gateway = FakeGateway::default();
        gateway.state.lock().known_user = Some(user);
        gateway
    }

    pub fn script_auth_statuses(&self, statuses: impl IntoIterator<Item = AuthStatus>) {
        self.state.lock().auth_statuses.extend(statuses);
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn active_user_calls(&self) -> usize {
        self.active_user_calls.load(Ordering::SeqCst)
    }

    pub fn auth_status_calls(&self) -> usize {
        self.auth_status_calls.load(Ordering::SeqCst)
    }

    pub fn last_login(&self) -> Option<LoginRequest> {
        self.state.lock().last_login.clone()
    }

    pub fn last_includes(&self) -> Option<UserInfoIncludes> {
        self.state.lock().last_includes
    }

    pub fn parameter_calls(&self) -> Vec<(String, Option<Value>)> {
        self.state.lock().parameter_calls.clone()
    }

    pub fn password_change(&self) -> Option<(String, String)> {
        self.state.lock().password_change.clone()
    }

    fn sign_in(state: &mut FakeState, provider: &str) -> AuthInfo {
        match state.known_user.clone() {
            Some(user) => {
                let tokens = vec![token_for(&user, provider)];
                state.active_user = Some(user);
                AuthInfo {
                    auth_id: None,
                    auth_status: AuthStatus::Success,
                    redirect_link: None,
                    user_tokens: Some(tokens),
                }
            }
            None => AuthInfo {
                auth_id: None,
                auth_status: AuthStatus::Error,
                redirect_link: None,
                user_tokens: None,
            },
        }
    }
}

#[async_trait]
impl RemoteCallGateway for FakeGateway {
    async fn auth_login(&self, request: LoginRequest) -> Result<AuthInfo, Error> {
        let mut state = self.state.lock();
        let info = Self::sign_in(&mut state, &request.provider);
        state.last_login = Some(request);
        Ok(info)
    }

    async fn get_auth_status(&self, auth_id: &str, _link_user: bool) -> Result<AuthInfo, Error> {
        self.auth_status_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let status = state
            .auth_statuses
            .pop_front()
            .unwrap_or(AuthStatus::InProgress);
        let mut info = match status {
            AuthStatus::Success => Self::sign_in(&mut state, "github"),
            other => AuthInfo {
                auth_id: None,
                auth_status: other,
                redirect_link: None,
                user_tokens: None,
            },
        };
        info.auth_id = Some(auth_id.to_owned());
        Ok(info)
    }

    async fn auth_logout(
        &self,
        _provider: Option<&str>,
        _configuration: Option<&str>,
    ) -> Result<LogoutInfo, Error> {
        self.state.lock().active_user = None;
        Ok(LogoutInfo::default())
    }

    async fn get_active_user(
        &self,
        includes: &UserInfoIncludes,
    ) -> Result<Option<UserRecord>, Error> {
        self.active_user_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.failing {
            return Err(Error::remote_call_error("getActiveUser", "server unavailable"));
        }
        state.last_includes = Some(*includes);
        Ok(state.active_user.clone())
    }

    async fn update_user_preferences(
        &self,
        preferences: &Map<String, Value>,
        includes: &UserInfoIncludes,
    ) -> Result<Option<UserRecord>, Error> {
        let mut state = self.state.lock();
        state.last_includes = Some(*includes);
        if let Some(user) = state.active_user.as_mut() {
            for (key, value) in preferences.iter() {
                user.configuration_parameters
                    .insert(key.clone(), value.clone());
            }
        }
        Ok(state.active_user.clone())
    }

    async fn set_user_configuration_parameter(
        &self,
        name: &str,
        value: Option<Value>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.parameter_calls.push((name.to_owned(), value.clone()));
        if let Some(user) = state.active_user.as_mut() {
            match value {
                Some(value) => {
                    user.configuration_parameters.insert(name.to_owned(), value);
                }
                None => {
                    user.configuration_parameters.remove(name);
                }
            }
        }
        Ok(())
    }

    async fn auth_change_local_password(
        &self,
        old_password_hash: &str,
        new_password_hash: &str,
    ) -> Result<(), Error> {
        self.state.lock().password_change =
            Some((old_password_hash.to_owned(), new_password_hash.to_owned()));
        Ok(())
    }
}
