//! Presence transport
//!
//! Connection state machine for the local presence display (Discord IPC).
//!
//! ```text
//!                 begin_connect()
//!  Disconnected ──────────────────▶ Connecting
//!       ▲  ▲                            │
//!       │  └──── failure (retry_at) ────┤
//!       │                               │ success
//!       └──── closed (retry_at) ◀── Connected
//! ```
//!
//! The login itself is blocking, so the controller runs it on a worker thread
//! and reports the outcome through [`PresenceTransport::on_connect_result`].
//! Each attempt carries an id; results for anything but the current attempt
//! are discarded. At most one retry is ever scheduled.

use discord_rich_presence::{activity, DiscordIpc, DiscordIpcClient};
use log::{debug, info, warn};
use std::time::{Duration, Instant};

use crate::error::TransportError;
use crate::mapper::{PresencePayload, Verb};
use crate::util::{truncate, PRESENCE_TEXT_MAX_CHARS};

/// An open channel to the presence display
pub trait PresenceChannel: Send {
    fn set_activity(&mut self, payload: &PresencePayload) -> Result<(), TransportError>;

    fn clear_activity(&mut self) -> Result<(), TransportError>;

    fn close(&mut self);
}

/// Opens presence channels
pub trait PresenceConnector: Send + Sync {
    fn connect(&self, client_id: &str) -> Result<Box<dyn PresenceChannel>, TransportError>;
}

// ---------------------------------------------------------------------------
// Discord
// ---------------------------------------------------------------------------

/// Connects to the local Discord client over IPC
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscordConnector;

impl PresenceConnector for DiscordConnector {
    fn connect(&self, client_id: &str) -> Result<Box<dyn PresenceChannel>, TransportError> {
        let mut client = DiscordIpcClient::new(client_id);
        client
            .connect()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        Ok(Box::new(DiscordChannel { client }))
    }
}

struct DiscordChannel {
    client: DiscordIpcClient,
}

impl PresenceChannel for DiscordChannel {
    fn set_activity(&mut self, payload: &PresencePayload) -> Result<(), TransportError> {
        let details = truncate(&payload.details, PRESENCE_TEXT_MAX_CHARS);
        let state = payload
            .state
            .as_deref()
            .map(|s| truncate(s, PRESENCE_TEXT_MAX_CHARS));
        let large_text = truncate(&payload.large_image_text, PRESENCE_TEXT_MAX_CHARS);

        let assets = activity::Assets::new()
            .large_image(&payload.large_image_key)
            .large_text(&large_text)
            .small_image(&payload.small_image_key)
            .small_text(&payload.small_image_text);

        let activity_type = match payload.verb {
            Verb::Watching => activity::ActivityType::Watching,
            Verb::Listening => activity::ActivityType::Listening,
        };

        let mut activity_payload = activity::Activity::new()
            .activity_type(activity_type)
            .details(&details)
            .assets(assets);

        if let Some(ref state) = state {
            activity_payload = activity_payload.state(state);
        }

        if let Some(end) = payload.end_timestamp {
            activity_payload = activity_payload.timestamps(activity::Timestamps::new().end(end));
        }

        self.client
            .set_activity(activity_payload)
            .map_err(|e| TransportError::Closed(e.to_string()))
    }

    fn clear_activity(&mut self) -> Result<(), TransportError> {
        self.client
            .clear_activity()
            .map_err(|e| TransportError::Closed(e.to_string()))
    }

    fn close(&mut self) {
        let _ = self.client.close();
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

/// A connect attempt the caller has to carry out with a [`PresenceConnector`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub id: u64,
    pub client_id: String,
}

pub struct PresenceTransport {
    client_id: String,
    backoff: Duration,
    state: TransportState,
    channel: Option<Box<dyn PresenceChannel>>,
    attempt: u64,
    retry_at: Option<Instant>,
    /// Whether an activity is currently shown
    showing: bool,
}

impl PresenceTransport {
    pub fn new(client_id: impl Into<String>, backoff: Duration) -> Self {
        Self {
            client_id: client_id.into(),
            backoff,
            state: TransportState::Disconnected,
            channel: None,
            attempt: 0,
            retry_at: None,
            showing: false,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == TransportState::Connected
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Used for retries scheduled after this call.
    pub fn set_backoff(&mut self, backoff: Duration) {
        self.backoff = backoff;
    }

    /// When the next reconnect is due, if one is scheduled
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Start connecting unless already connected or connecting.
    pub fn begin_connect(&mut self) -> Option<ConnectAttempt> {
        if self.state != TransportState::Disconnected {
            debug!("Presence transport already {:?}", self.state);
            return None;
        }
        self.attempt += 1;
        self.state = TransportState::Connecting;
        self.retry_at = None;
        debug!("Connecting to presence display (attempt {})", self.attempt);
        Some(ConnectAttempt {
            id: self.attempt,
            client_id: self.client_id.clone(),
        })
    }

    /// Take a due retry, returning the attempt to run.
    pub fn poll_retry(&mut self, now: Instant) -> Option<ConnectAttempt> {
        match self.retry_at {
            Some(at) if at <= now => {
                self.retry_at = None;
                self.begin_connect()
            }
            _ => None,
        }
    }

    /// Outcome of a connect attempt.
    ///
    /// Returns true when the transport just became ready.
    pub fn on_connect_result(
        &mut self,
        attempt: u64,
        result: Result<Box<dyn PresenceChannel>, TransportError>,
        now: Instant,
    ) -> bool {
        if attempt != self.attempt || self.state != TransportState::Connecting {
            debug!("Discarding stale presence connect attempt {attempt}");
            if let Ok(mut channel) = result {
                channel.close();
            }
            return false;
        }

        match result {
            Ok(channel) => {
                self.channel = Some(channel);
                self.state = TransportState::Connected;
                self.showing = false;
                info!("✅ Connected to presence display");
                true
            }
            Err(e) => {
                warn!("Failed to connect to presence display: {e}. Attempting to reconnect");
                self.state = TransportState::Disconnected;
                self.schedule_retry(now);
                false
            }
        }
    }

    /// The channel went away without us asking.
    ///
    /// Only the first close of a live connection schedules a reconnect.
    pub fn on_closed(&mut self, now: Instant) {
        if self.state != TransportState::Connected {
            debug!("Presence channel close ignored while {:?}", self.state);
            return;
        }
        warn!("Presence connection terminated. Attempting to reconnect");
        self.channel = None;
        self.showing = false;
        self.state = TransportState::Disconnected;
        self.schedule_retry(now);
    }

    fn schedule_retry(&mut self, now: Instant) {
        let at = now + self.backoff;
        debug!("Presence reconnect scheduled in {:?}", self.backoff);
        self.retry_at = Some(at);
    }

    /// Show `payload`, replacing whatever is shown.
    pub fn set_activity(&mut self, payload: &PresencePayload, now: Instant) {
        let Some(channel) = self.live_channel() else {
            debug!("Presence display not connected, skipping update");
            return;
        };
        match channel.set_activity(payload) {
            Ok(()) => {
                self.showing = true;
                debug!("Updated presence: {} / {:?}", payload.details, payload.state);
            }
            Err(e) => {
                warn!("Presence update failed: {e}");
                self.on_closed(now);
            }
        }
    }

    /// Remove the shown activity. Clearing when nothing is shown does nothing.
    pub fn clear_activity(&mut self, now: Instant) {
        if !self.showing {
            debug!("No presence to clear");
            return;
        }
        let Some(channel) = self.live_channel() else {
            debug!("Presence display not connected, nothing to clear");
            return;
        };
        match channel.clear_activity() {
            Ok(()) => {
                self.showing = false;
                debug!("Cleared presence");
            }
            Err(e) => {
                warn!("Presence clear failed: {e}");
                self.on_closed(now);
            }
        }
    }

    fn live_channel(&mut self) -> Option<&mut Box<dyn PresenceChannel>> {
        if self.state == TransportState::Connected {
            self.channel.as_mut()
        } else {
            None
        }
    }

    /// Switch to another application id, dropping the current connection.
    ///
    /// Returns true if the id changed; the caller reconnects afterwards.
    pub fn set_client_id(&mut self, client_id: &str) -> bool {
        if self.client_id == client_id {
            return false;
        }
        self.shutdown();
        self.client_id = client_id.to_string();
        true
    }

    /// Clear, close, and forget any pending or in-flight connection.
    pub fn shutdown(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if self.showing {
                let _ = channel.clear_activity();
            }
            channel.close();
        }
        self.showing = false;
        self.attempt += 1;
        self.retry_at = None;
        self.state = TransportState::Disconnected;
    }
}
