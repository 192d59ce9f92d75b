//! HTTP client for the activity service.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use compactor_core::config::DirectoryConfig;
use compactor_core::directory::{
    Activity, ActivityDirectory, ActivityFilter, DirectoryError, parse_activities,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

/// Result of one listing attempt.
enum Listing {
    Found(Vec<Value>),
    TokenRejected,
}

/// Bearer-token client for `/users/login` and `/activities`.
///
/// The token is obtained lazily and cached; a 401 on the listing triggers
/// one re-login and replay.
pub struct HttpDirectory {
    agent: ureq::Agent,
    endpoint: String,
    username: String,
    password: String,
    token: Mutex<Option<String>>,
}

impl HttpDirectory {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(REQUEST_TIMEOUT)
                .user_agent("trace-compactor")
                .build(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            token: Mutex::new(None),
        }
    }

    pub fn from_config(config: &DirectoryConfig) -> Self {
        Self::new(config.endpoint(), &config.username, &config.password)
    }

    fn login(&self) -> Result<String, DirectoryError> {
        let url = format!("{}/users/login", self.endpoint);
        debug!(%url, user = %self.username, "authenticating with activity service");
        let response = self
            .agent
            .post(&url)
            .send_json(json!({
                "username": self.username,
                "password": self.password,
            }))
            .map_err(|err| match err {
                ureq::Error::Status(401 | 403, _) => {
                    DirectoryError::Unauthorized(format!("login as {} refused", self.username))
                }
                other => DirectoryError::Transport(format!("{url}: {other}")),
            })?;
        let login: LoginResponse = response
            .into_json()
            .map_err(|e| DirectoryError::Decode(format!("{url}: {e}")))?;

        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(login.token.clone());
        info!(user = %self.username, "authenticated with activity service");
        Ok(login.token)
    }

    fn cached_token(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn list(&self, token: &str, filter: &ActivityFilter) -> Result<Listing, DirectoryError> {
        let url = format!("{}/activities", self.endpoint);
        let result = self
            .agent
            .get(&url)
            .query("searchString", &filter.to_query())
            .set("Authorization", &format!("Bearer {token}"))
            .call();
        match result {
            Ok(response) => response
                .into_json::<Vec<Value>>()
                .map(Listing::Found)
                .map_err(|e| DirectoryError::Decode(format!("{url}: {e}"))),
            Err(ureq::Error::Status(401, _)) => Ok(Listing::TokenRejected),
            Err(err) => Err(DirectoryError::Transport(format!("{url}: {err}"))),
        }
    }
}

impl ActivityDirectory for HttpDirectory {
    fn activities(&self, filter: &ActivityFilter) -> Result<Vec<Activity>, DirectoryError> {
        let token = match self.cached_token() {
            Some(token) => token,
            None => self.login()?,
        };

        let raw = match self.list(&token, filter)? {
            Listing::Found(raw) => raw,
            Listing::TokenRejected => {
                warn!("activity service rejected the token, re-authenticating");
                let token = self.login()?;
                match self.list(&token, filter)? {
                    Listing::Found(raw) => raw,
                    Listing::TokenRejected => {
                        return Err(DirectoryError::Unauthorized(
                            "token rejected right after login".to_string(),
                        ));
                    }
                }
            }
        };
        Ok(parse_activities(raw))
    }
}
