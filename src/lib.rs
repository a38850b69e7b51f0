//! Media server presence sync
//!
//! Polls an Emby or Jellyfin server for the user's active playback session
//! and mirrors it to Discord Rich Presence.
//!
//! The pieces, leaf first:
//! - [`media_server`]: authenticated HTTP client for the server API
//! - [`selector`]: picks the session to display
//! - [`mapper`]: turns a session into a [`mapper::PresencePayload`]
//! - [`scheduler`]: when to poll, and which results are still wanted
//! - [`transport`]: connection state machine for the Discord IPC channel
//! - [`controller`]: owns all of the above and runs the event loop

pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod mapper;
pub mod media_server;
pub mod models;
pub mod scheduler;
pub mod selector;
pub mod transport;
pub mod updates;
pub mod util;

pub use config::{ConfigStore, Credentials, JsonFileStore, ServerType, Settings};
pub use controller::{ControlHandle, SyncController, SyncProfile, ThreadExecutor};
pub use error::{AuthError, SessionFetchError, TransportError};
pub use mapper::PresencePayload;
pub use media_server::{DeviceInfo, MediaServerClient, ServerApi};
pub use models::PlaybackSession;
pub use transport::DiscordConnector;

/// Name used for the config directory and as the device name on the server
pub const APP_NAME: &str = "mediaserver-presence";

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
