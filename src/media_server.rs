//! Media server client for Emby and Jellyfin
//!
//! [`ServerApi`] makes the raw HTTP calls and holds no session state, so it
//! can be shared with worker threads. [`MediaServerClient`] wraps it and owns
//! the one live [`AuthSession`].
//!
//! Every call after login carries the access token in `X-Emby-Token`. Both
//! servers understand the Emby-style `Authorization` header used to identify
//! this application as a device.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigStore, Credentials, ServerType, Settings};
use crate::error::{AuthError, SessionFetchError};
use crate::models::{parse_sessions, PlaybackSession};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// How this application identifies itself to the media server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub client: String,
    pub device_name: String,
    pub device_id: String,
    pub version: String,
}

impl DeviceInfo {
    /// Device info for this build with the given installation id
    pub fn for_app(device_id: impl Into<String>) -> Self {
        Self {
            client: "Other".to_string(),
            device_name: crate::APP_NAME.to_string(),
            device_id: device_id.into(),
            version: crate::APP_VERSION.to_string(),
        }
    }

    /// Value of the `Authorization` header sent with the login request
    pub fn authorization_header(&self) -> String {
        format!(
            "Emby Client={}, Device={}, DeviceId={}, Version={}",
            self.client, self.device_name, self.device_id, self.version
        )
    }
}

/// A logged-in session with the media server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub access_token: String,
    pub user_id: Option<String>,
    pub device_id: String,
    pub device_name: String,
    pub device_version: String,
}

/// Raw media server operations
pub trait MediaServerApi: Send + Sync {
    /// Log in with the configured credentials.
    fn authenticate(&self) -> Result<AuthSession, AuthError>;

    /// Attach an icon to our device entry on the server.
    fn register_device_icon(&self, token: &str) -> Result<()>;

    /// List every session the server knows about.
    fn sessions(&self, token: &str) -> Result<Vec<PlaybackSession>, SessionFetchError>;

    /// End the server-side session for `token`.
    fn end_session(&self, token: &str) -> Result<()>;

    /// Device name we registered under, used to skip our own session.
    fn device_name(&self) -> &str;
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticationResult {
    access_token: String,
    #[serde(default)]
    user: Option<AuthenticatedUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticatedUser {
    id: String,
}

/// HTTP implementation of [`MediaServerApi`]
#[derive(Clone)]
pub struct ServerApi {
    agent: ureq::Agent,
    base_url: String,
    credentials: Credentials,
    device: DeviceInfo,
    icon_url: Option<String>,
}

impl ServerApi {
    pub fn new(
        server_type: ServerType,
        credentials: Credentials,
        device: DeviceInfo,
        icon_url: Option<String>,
    ) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .timeout_connect(Some(CONNECT_TIMEOUT))
            .http_status_as_error(false)
            .build()
            .new_agent();

        let base_url = format!("{}{}", credentials.server_url(), server_type.api_prefix());

        Self {
            agent,
            base_url,
            credentials,
            device,
            icon_url,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn session_from_body(&self, body: &str) -> Result<AuthSession, AuthError> {
        let result: AuthenticationResult =
            serde_json::from_str(body).map_err(|e| AuthError::Malformed(e.to_string()))?;
        if result.access_token.is_empty() {
            return Err(AuthError::Malformed("empty access token".to_string()));
        }
        Ok(AuthSession {
            access_token: result.access_token,
            user_id: result.user.map(|u| u.id),
            device_id: self.device.device_id.clone(),
            device_name: self.device.device_name.clone(),
            device_version: self.device.version.clone(),
        })
    }
}

impl MediaServerApi for ServerApi {
    fn authenticate(&self) -> Result<AuthSession, AuthError> {
        let url = self.url("Users/AuthenticateByName");
        let body = json!({
            "Username": self.credentials.username,
            "Pw": self.credentials.password.as_deref().unwrap_or(""),
        })
        .to_string();

        debug!("Authenticating as {} at {}", self.credentials.username, url);

        let mut response = self
            .agent
            .post(&url)
            .header("Authorization", &self.device.authorization_header())
            .header("Content-Type", "application/json")
            .send(body)
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .body_mut()
            .read_to_string()
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        if status != 200 {
            return Err(AuthError::Rejected {
                status,
                reason: text,
            });
        }

        self.session_from_body(&text)
    }

    fn register_device_icon(&self, token: &str) -> Result<()> {
        let Some(ref icon_url) = self.icon_url else {
            debug!("No icon url configured, skipping device icon");
            return Ok(());
        };

        let response = self
            .agent
            .post(&self.url("Sessions/Capabilities/Full"))
            .header("X-Emby-Token", token)
            .header("Content-Type", "application/json")
            .send(json!({ "IconUrl": icon_url }).to_string())
            .context("Failed to set device icon")?;

        let status = response.status().as_u16();
        if status != 200 && status != 204 {
            anyhow::bail!("Failed to set device icon. Status: {status}");
        }
        Ok(())
    }

    fn sessions(&self, token: &str) -> Result<Vec<PlaybackSession>, SessionFetchError> {
        let mut response = self
            .agent
            .get(&self.url("Sessions"))
            .header("X-Emby-Token", token)
            .header("Accept", "application/json")
            .call()
            .map_err(|e| SessionFetchError::Unreachable(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .body_mut()
            .read_to_string()
            .map_err(|e| SessionFetchError::Unreachable(e.to_string()))?;

        if status != 200 {
            return Err(SessionFetchError::Status {
                status,
                reason: text,
            });
        }

        parse_sessions(&text).map_err(|e| SessionFetchError::Malformed(e.to_string()))
    }

    fn end_session(&self, token: &str) -> Result<()> {
        let response = self
            .agent
            .post(&self.url("Sessions/Logout"))
            .header("X-Emby-Token", token)
            .send_empty()
            .context("Logout request failed")?;

        let status = response.status().as_u16();
        if status != 200 && status != 204 {
            anyhow::bail!("Logout rejected. Status: {status}");
        }
        Ok(())
    }

    fn device_name(&self) -> &str {
        &self.device.device_name
    }
}

/// Register the device icon on a background thread, logging any failure.
///
/// Login never waits for this and never fails because of it.
pub fn register_icon_in_background(api: Arc<dyn MediaServerApi>, token: String) {
    let spawned = std::thread::Builder::new()
        .name("device-icon".to_string())
        .spawn(move || {
            if let Err(e) = api.register_device_icon(&token) {
                warn!("{e:#}");
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to spawn device icon registration: {e}");
    }
}

/// Media server client owning the current [`AuthSession`]
pub struct MediaServerClient {
    api: Arc<dyn MediaServerApi>,
    auth: Option<AuthSession>,
}

impl MediaServerClient {
    pub fn new(api: Arc<dyn MediaServerApi>) -> Self {
        Self { api, auth: None }
    }

    /// Client for the stored settings, `None` until credentials exist.
    ///
    /// Generates and persists the device id on first use.
    pub fn from_settings(
        settings: &mut Settings,
        store: &mut dyn ConfigStore,
    ) -> Result<Option<Self>> {
        let Some(credentials) = settings.credentials.clone() else {
            return Ok(None);
        };
        let device_id = settings.ensure_device_id(store)?;
        let api = ServerApi::new(
            settings.server_type,
            credentials,
            DeviceInfo::for_app(device_id),
            settings.icon_url.clone(),
        );
        Ok(Some(Self::new(Arc::new(api))))
    }

    /// Log in, replacing any previous session.
    ///
    /// Blocks on the HTTP call. Failures are returned as-is and never retried
    /// here; the device icon is registered afterwards without waiting.
    pub fn login(&mut self) -> Result<&AuthSession, AuthError> {
        self.auth = None;
        let session = self.api.authenticate()?;
        info!("Logged in to media server as device {}", session.device_name);
        register_icon_in_background(Arc::clone(&self.api), session.access_token.clone());
        Ok(self.auth.insert(session))
    }

    /// Fetch the current sessions. Requires a prior successful login.
    pub fn get_sessions(&self) -> Result<Vec<PlaybackSession>, SessionFetchError> {
        let token = self.token().ok_or(SessionFetchError::NotAuthenticated)?;
        self.api.sessions(token)
    }

    /// Best-effort logout; the local session is dropped whatever the server says.
    pub fn logout(&mut self) {
        if let Some(session) = self.auth.take() {
            if let Err(e) = self.api.end_session(&session.access_token) {
                debug!("Logout failed: {e:#}");
            }
        }
    }

    /// Drop the local session without contacting the server and hand it back.
    pub fn take_session(&mut self) -> Option<AuthSession> {
        self.auth.take()
    }

    /// Install a session obtained elsewhere (e.g. by a worker thread).
    ///
    /// Refused when a session is already live so there is never more than one.
    pub fn install(&mut self, session: AuthSession) -> bool {
        if self.auth.is_some() {
            return false;
        }
        self.auth = Some(session);
        true
    }

    /// Drop the session if it still uses `token`.
    ///
    /// A newer session obtained in the meantime is left alone.
    pub fn invalidate(&mut self, token: &str) -> bool {
        if self.token() == Some(token) {
            self.auth = None;
            true
        } else {
            false
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.auth.as_ref().map(|a| a.access_token.as_str())
    }

    pub fn session(&self) -> Option<&AuthSession> {
        self.auth.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_some()
    }

    pub fn api(&self) -> Arc<dyn MediaServerApi> {
        Arc::clone(&self.api)
    }

    pub fn device_name(&self) -> &str {
        self.api.device_name()
    }
}
