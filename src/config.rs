//! Configuration management
//!
//! Settings live in a flat key-value store. [`JsonFileStore`] keeps them in a
//! JSON object on disk; [`MemoryStore`] is used for tests and one-off runs.
//! Missing keys fall back to defaults when read, nothing is migrated.

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::APP_NAME;

pub const KEY_IS_CONFIGURED: &str = "isConfigured";
pub const KEY_DISPLAY_STATUS: &str = "doDisplayStatus";
pub const KEY_SERVER_TYPE: &str = "serverType";
pub const KEY_CREDENTIALS: &str = "credentials";
pub const KEY_DEVICE_ID: &str = "deviceId";
pub const KEY_LOG_LEVEL: &str = "logLevel";
pub const KEY_POLL_INTERVAL: &str = "pollIntervalSecs";
pub const KEY_RECONNECT_BACKOFF: &str = "reconnectBackoffSecs";
pub const KEY_CLIENT_IDS: &str = "clientIds";
pub const KEY_ICON_URL: &str = "iconUrl";
pub const KEY_CHECK_UPDATES: &str = "checkUpdates";

/// How often the media server is polled
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

/// Delay before reconnecting to the presence display
pub const DEFAULT_RECONNECT_BACKOFF_SECS: u64 = 30;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default Discord application id for Emby, overridable through `clientIds`
pub const DEFAULT_EMBY_CLIENT_ID: &str = "602816734329061376";

/// Default Discord application id for Jellyfin, overridable through `clientIds`
pub const DEFAULT_JELLYFIN_CLIENT_ID: &str = "602817108389969920";

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Key-value persistence for settings
pub trait ConfigStore {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&mut self, key: &str, value: Value) -> Result<()>;

    fn remove(&mut self, key: &str) -> Result<()>;
}

/// In-memory store, nothing is persisted
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Map<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.data.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON file, rewritten on every `set`
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    data: Map<String, Value>,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    ///
    /// A file that exists but is not a JSON object is an error rather than
    /// being silently replaced.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {path:?}"))?;
            if content.trim().is_empty() {
                Map::new()
            } else {
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {path:?}"))?
            }
        } else {
            Map::new()
        };
        Ok(Self { path, data })
    }

    /// Open the store in the default location.
    pub fn open_default() -> Result<Self> {
        Self::open(default_config_path()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {parent:?}"))?;
        }
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write config file: {:?}", self.path))
    }
}

impl ConfigStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.data.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.data.insert(key.to_string(), value);
        self.flush()
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        if self.data.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}

/// `{config_dir}/mediaserver-presence/config.json`
pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("No config directory on this platform")?;
    Ok(dir.join(APP_NAME).join("config.json"))
}

/// Exclusive lock on `<config>.lock`, held while syncing with that config.
///
/// Released when dropped or when the process exits.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock for `config_path`; `None` if another process holds it.
    pub fn acquire(config_path: &Path) -> Result<Option<Self>> {
        let path = config_path.with_extension("lock");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Some(Self { file, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

// ---------------------------------------------------------------------------
// Settings types
// ---------------------------------------------------------------------------

/// Which media server we are talking to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    #[default]
    Emby,
    Jellyfin,
}

impl ServerType {
    /// Path prefix in front of every API route
    pub fn api_prefix(self) -> &'static str {
        match self {
            ServerType::Emby => "/emby",
            ServerType::Jellyfin => "",
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerType::Emby => f.write_str("emby"),
            ServerType::Jellyfin => f.write_str("jellyfin"),
        }
    }
}

impl FromStr for ServerType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "emby" => Ok(ServerType::Emby),
            "jellyfin" => Ok(ServerType::Jellyfin),
            other => anyhow::bail!("Unknown server type: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Https => f.write_str("https"),
        }
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => anyhow::bail!("Unknown protocol: {other}"),
        }
    }
}

/// Media server login details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub address: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    pub port: u16,
}

impl Credentials {
    /// Names of required fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.address.trim().is_empty() {
            missing.push("address");
        }
        if self.username.trim().is_empty() {
            missing.push("username");
        }
        if self.port == 0 {
            missing.push("port");
        }
        missing
    }

    /// `protocol://address:port`
    pub fn server_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.address.trim(), self.port)
    }
}

/// Presence application identifiers per server type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIds {
    pub emby: String,
    pub jellyfin: String,
}

impl Default for ClientIds {
    fn default() -> Self {
        Self {
            emby: DEFAULT_EMBY_CLIENT_ID.to_string(),
            jellyfin: DEFAULT_JELLYFIN_CLIENT_ID.to_string(),
        }
    }
}

impl ClientIds {
    pub fn for_server(&self, server_type: ServerType) -> &str {
        match server_type {
            ServerType::Emby => &self.emby,
            ServerType::Jellyfin => &self.jellyfin,
        }
    }
}

/// Everything the application reads from the store
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub is_configured: bool,
    pub display_enabled: bool,
    pub server_type: ServerType,
    pub credentials: Option<Credentials>,
    pub device_id: Option<String>,
    pub log_level: String,
    pub poll_interval: Duration,
    pub reconnect_backoff: Duration,
    pub client_ids: ClientIds,
    pub icon_url: Option<String>,
    pub check_updates: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            is_configured: false,
            display_enabled: true,
            server_type: ServerType::default(),
            credentials: None,
            device_id: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            reconnect_backoff: Duration::from_secs(DEFAULT_RECONNECT_BACKOFF_SECS),
            client_ids: ClientIds::default(),
            icon_url: None,
            check_updates: true,
        }
    }
}

impl Settings {
    /// Read settings from the store, defaulting anything missing or unreadable.
    pub fn load(store: &dyn ConfigStore) -> Self {
        let defaults = Self::default();
        Self {
            is_configured: read(store, KEY_IS_CONFIGURED).unwrap_or(defaults.is_configured),
            display_enabled: read(store, KEY_DISPLAY_STATUS).unwrap_or(defaults.display_enabled),
            server_type: read(store, KEY_SERVER_TYPE).unwrap_or(defaults.server_type),
            credentials: read(store, KEY_CREDENTIALS),
            device_id: read::<String>(store, KEY_DEVICE_ID).filter(|id| !id.is_empty()),
            log_level: read(store, KEY_LOG_LEVEL).unwrap_or(defaults.log_level),
            poll_interval: read::<u64>(store, KEY_POLL_INTERVAL)
                .filter(|secs| *secs > 0)
                .map_or(defaults.poll_interval, Duration::from_secs),
            reconnect_backoff: read::<u64>(store, KEY_RECONNECT_BACKOFF)
                .filter(|secs| *secs > 0)
                .map_or(defaults.reconnect_backoff, Duration::from_secs),
            client_ids: read(store, KEY_CLIENT_IDS).unwrap_or(defaults.client_ids),
            icon_url: read::<String>(store, KEY_ICON_URL).filter(|url| !url.is_empty()),
            check_updates: read(store, KEY_CHECK_UPDATES).unwrap_or(defaults.check_updates),
        }
    }

    /// Discord application id for the configured server type
    pub fn client_id(&self) -> &str {
        self.client_ids.for_server(self.server_type)
    }

    /// Device id for this installation, generating and persisting one on first use.
    pub fn ensure_device_id(&mut self, store: &mut dyn ConfigStore) -> Result<String> {
        if let Some(ref id) = self.device_id {
            return Ok(id.clone());
        }
        let id = uuid::Uuid::new_v4().to_string();
        store.set(KEY_DEVICE_ID, json!(id))?;
        self.device_id = Some(id.clone());
        Ok(id)
    }
}

fn read<T: serde::de::DeserializeOwned>(store: &dyn ConfigStore, key: &str) -> Option<T> {
    let value = store.get(key)?;
    match serde_json::from_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("Ignoring invalid config value for {key}: {e}");
            None
        }
    }
}

/// Persist a successful configuration: credentials, server type, display on.
pub fn save_configuration(
    store: &mut dyn ConfigStore,
    server_type: ServerType,
    credentials: &Credentials,
) -> Result<()> {
    store.set(KEY_SERVER_TYPE, json!(server_type))?;
    store.set(KEY_CREDENTIALS, serde_json::to_value(credentials)?)?;
    store.set(KEY_IS_CONFIGURED, json!(true))?;
    store.set(KEY_DISPLAY_STATUS, json!(true))
}

pub fn set_display_enabled(store: &mut dyn ConfigStore, enabled: bool) -> Result<()> {
    store.set(KEY_DISPLAY_STATUS, json!(enabled))
}

/// Forget the configuration; the next start needs `configure` again.
pub fn reset_configuration(store: &mut dyn ConfigStore) -> Result<()> {
    store.set(KEY_IS_CONFIGURED, json!(false))?;
    store.remove(KEY_CREDENTIALS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials {
            address: "media.local".to_string(),
            username: "alice".to_string(),
            password: Some("secret".to_string()),
            protocol: Protocol::Https,
            port: 8920,
        }
    }

    #[test]
    fn test_defaults_on_empty_store() {
        let settings = Settings::load(&MemoryStore::new());
        assert_eq!(settings, Settings::default());
        assert!(settings.display_enabled);
        assert_eq!(settings.poll_interval, Duration::from_secs(15));
        assert_eq!(settings.reconnect_backoff, Duration::from_secs(30));
        assert_eq!(settings.client_id(), DEFAULT_EMBY_CLIENT_ID);
    }

    #[test]
    fn test_save_and_load_configuration() {
        let mut store = MemoryStore::new();
        save_configuration(&mut store, ServerType::Jellyfin, &credentials()).unwrap();

        let settings = Settings::load(&store);
        assert!(settings.is_configured);
        assert!(settings.display_enabled);
        assert_eq!(settings.server_type, ServerType::Jellyfin);
        assert_eq!(settings.credentials, Some(credentials()));
        assert_eq!(settings.client_id(), DEFAULT_JELLYFIN_CLIENT_ID);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let mut store = MemoryStore::new();
        store.set(KEY_SERVER_TYPE, json!("plex")).unwrap();
        store.set(KEY_POLL_INTERVAL, json!(0)).unwrap();
        store.set(KEY_DISPLAY_STATUS, json!("yes")).unwrap();

        let settings = Settings::load(&store);
        assert_eq!(settings.server_type, ServerType::Emby);
        assert_eq!(settings.poll_interval, Duration::from_secs(15));
        assert!(settings.display_enabled);
    }

    #[test]
    fn test_reset_configuration() {
        let mut store = MemoryStore::new();
        save_configuration(&mut store, ServerType::Emby, &credentials()).unwrap();
        reset_configuration(&mut store).unwrap();

        let settings = Settings::load(&store);
        assert!(!settings.is_configured);
        assert_eq!(settings.credentials, None);
    }

    #[test]
    fn test_device_id_generated_once() {
        let mut store = MemoryStore::new();
        let mut settings = Settings::load(&store);
        let first = settings.ensure_device_id(&mut store).unwrap();
        let second = settings.ensure_device_id(&mut store).unwrap();
        assert_eq!(first, second);
        assert_eq!(Settings::load(&store).device_id, Some(first));
    }

    #[test]
    fn test_missing_fields() {
        let mut creds = credentials();
        assert!(creds.missing_fields().is_empty());
        creds.address = "  ".to_string();
        creds.port = 0;
        creds.password = None;
        assert_eq!(creds.missing_fields(), vec!["address", "port"]);
    }

    #[test]
    fn test_server_url() {
        assert_eq!(credentials().server_url(), "https://media.local:8920");
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("Jellyfin".parse::<ServerType>().unwrap(), ServerType::Jellyfin);
        assert_eq!("HTTPS".parse::<Protocol>().unwrap(), Protocol::Https);
        assert!("plex".parse::<ServerType>().is_err());
        assert_eq!(ServerType::Emby.api_prefix(), "/emby");
        assert_eq!(ServerType::Jellyfin.api_prefix(), "");
    }

    #[test]
    fn test_instance_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.json");

        let first = InstanceLock::acquire(&config).unwrap().unwrap();
        assert_eq!(first.path(), dir.path().join("config.lock"));
        assert!(InstanceLock::acquire(&config).unwrap().is_none());

        // A different config gets its own lock
        let other = dir.path().join("other").join("config.json");
        assert!(InstanceLock::acquire(&other).unwrap().is_some());

        drop(first);
        assert!(InstanceLock::acquire(&config).unwrap().is_some());
    }

    #[test]
    fn test_json_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut store = JsonFileStore::open(&path).unwrap();
        set_display_enabled(&mut store, false).unwrap();
        assert!(path.exists());

        let reopened = JsonFileStore::open(&path).unwrap();
        assert!(!Settings::load(&reopened).display_enabled);
    }

    #[test]
    fn test_json_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        assert!(JsonFileStore::open(&path).is_err());
    }
}
