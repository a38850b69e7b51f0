//! Sync controller
//!
//! The single long-lived context that owns the media server client, the poll
//! scheduler and the presence transport. All of them are touched only from
//! the thread running [`SyncController::run`].
//!
//! Anything that blocks (HTTP calls, the IPC login) is handed to an
//! [`Executor`] and reports back as an [`Event`] on the controller's channel.
//! Timers are plain deadlines: the loop sleeps on the channel until the
//! earliest one and then fires whatever is due.

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Settings;
use crate::error::{AuthError, SessionFetchError, TransportError};
use crate::mapper;
use crate::media_server::{register_icon_in_background, AuthSession, MediaServerClient};
use crate::models::PlaybackSession;
use crate::scheduler::{PollScheduler, PollTicket};
use crate::selector;
use crate::transport::{ConnectAttempt, PresenceChannel, PresenceConnector, PresenceTransport};
use crate::util::now_epoch_seconds;

/// How long the loop sleeps when no timer is pending
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// Extra time after the predicted end of an item before re-polling
const ITEM_END_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Executors
// ---------------------------------------------------------------------------

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs blocking work off the control thread
pub trait Executor {
    fn execute(&self, job: Job);
}

/// One short-lived thread per job
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn execute(&self, job: Job) {
        if let Err(e) = thread::Builder::new()
            .name("presence-worker".to_string())
            .spawn(job)
        {
            error!("Failed to spawn worker thread: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What the controller needs to know about the user and display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProfile {
    pub user_name: String,
    pub client_id: String,
    pub display_enabled: bool,
    pub poll_interval: Duration,
    pub reconnect_backoff: Duration,
}

impl SyncProfile {
    /// Profile for stored settings; `None` until credentials exist.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let credentials = settings.credentials.as_ref()?;
        Some(Self {
            user_name: credentials.username.clone(),
            client_id: settings.client_id().to_string(),
            display_enabled: settings.display_enabled,
            poll_interval: settings.poll_interval,
            reconnect_backoff: settings.reconnect_backoff,
        })
    }
}

/// Requests from outside the control thread
pub enum Command {
    /// Turn the presence display on or off
    SetDisplay(bool),
    /// Replace the media server client and profile, then start over
    Configure {
        client: MediaServerClient,
        profile: SyncProfile,
    },
    /// Log out and wait for a new configuration
    Reset,
    /// Clear presence, disconnect and leave the run loop
    Shutdown,
}

pub enum Event {
    Command(Command),
    LoginFinished {
        client_epoch: u64,
        ticket: PollTicket,
        result: Result<AuthSession, AuthError>,
    },
    SessionsFetched {
        ticket: PollTicket,
        token: String,
        result: Result<Vec<PlaybackSession>, SessionFetchError>,
    },
    TransportConnected {
        attempt: u64,
        result: Result<Box<dyn PresenceChannel>, TransportError>,
    },
}

/// Cloneable handle for sending commands to a running controller
#[derive(Clone)]
pub struct ControlHandle {
    tx: Sender<Event>,
}

impl ControlHandle {
    fn send(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow!("Sync controller is no longer running"))
    }

    pub fn set_display(&self, enabled: bool) -> Result<()> {
        self.send(Event::Command(Command::SetDisplay(enabled)))
    }

    pub fn configure(&self, client: MediaServerClient, profile: SyncProfile) -> Result<()> {
        self.send(Event::Command(Command::Configure { client, profile }))
    }

    pub fn reset(&self) -> Result<()> {
        self.send(Event::Command(Command::Reset))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Event::Command(Command::Shutdown))
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct SyncController {
    user_name: String,
    display_enabled: bool,
    media: Option<MediaServerClient>,
    /// Bumped whenever `media` is replaced or dropped
    client_epoch: u64,
    pending_login: Option<PollTicket>,
    scheduler: PollScheduler,
    transport: PresenceTransport,
    connector: Arc<dyn PresenceConnector>,
    executor: Box<dyn Executor>,
    wall_clock: fn() -> f64,
    tx: Sender<Event>,
    rx: Receiver<Event>,
    shutting_down: bool,
}

impl SyncController {
    pub fn new(
        profile: SyncProfile,
        media: Option<MediaServerClient>,
        connector: Arc<dyn PresenceConnector>,
        executor: Box<dyn Executor>,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            user_name: profile.user_name,
            display_enabled: profile.display_enabled,
            media,
            client_epoch: 0,
            pending_login: None,
            scheduler: PollScheduler::new(profile.poll_interval),
            transport: PresenceTransport::new(profile.client_id, profile.reconnect_backoff),
            connector,
            executor,
            wall_clock: now_epoch_seconds,
            tx,
            rx,
            shutting_down: false,
        }
    }

    /// Log in first and only build the controller if that worked.
    ///
    /// This is the initial-configuration path: a bad address or bad
    /// credentials come straight back to the caller and nothing is scheduled.
    pub fn configured(
        mut client: MediaServerClient,
        profile: SyncProfile,
        connector: Arc<dyn PresenceConnector>,
        executor: Box<dyn Executor>,
    ) -> Result<Self, AuthError> {
        client.login()?;
        Ok(Self::new(profile, Some(client), connector, executor))
    }

    /// Use a different wall clock for end timestamps.
    pub fn with_wall_clock(mut self, clock: fn() -> f64) -> Self {
        self.wall_clock = clock;
        self
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    pub fn transport(&self) -> &PresenceTransport {
        &self.transport
    }

    pub fn media(&self) -> Option<&MediaServerClient> {
        self.media.as_ref()
    }

    /// Run until a [`Command::Shutdown`] arrives.
    pub fn run(mut self) {
        info!("🔄 Presence sync running");
        self.start(Instant::now());

        while !self.shutting_down {
            let timeout = self
                .next_deadline()
                .map_or(IDLE_WAIT, |at| at.saturating_duration_since(Instant::now()));

            match self.rx.recv_timeout(timeout) {
                Ok(event) => self.handle_event(event, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if !self.shutting_down {
                self.fire_timers(Instant::now());
            }
        }

        info!("Presence sync stopped");
    }

    /// Connect the transport and start polling, if configured and enabled.
    pub fn start(&mut self, now: Instant) {
        if self.shutting_down {
            return;
        }
        if self.media.is_none() {
            info!("Not configured yet, presence sync idle");
            return;
        }
        if !self.display_enabled {
            info!("Display as status is off, presence sync idle");
            return;
        }
        if let Some(attempt) = self.transport.begin_connect() {
            self.dispatch_connect(attempt);
        }
        self.scheduler.start(now);
    }

    /// Stop polling and clear whatever is displayed.
    fn stop(&mut self, now: Instant) {
        self.scheduler.stop();
        self.transport.clear_activity(now);
    }

    /// Presence reconnects only matter while there is something to show.
    fn wants_presence(&self) -> bool {
        self.display_enabled && self.media.is_some() && !self.shutting_down
    }

    /// Handle every queued event and due timer without blocking.
    pub fn pump(&mut self, now: Instant) {
        loop {
            self.fire_timers(now);
            match self.rx.try_recv() {
                Ok(event) => self.handle_event(event, now),
                Err(_) => break,
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let retry_at = self
            .transport
            .retry_at()
            .filter(|_| self.wants_presence());
        match (self.scheduler.next_deadline(), retry_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        if self.wants_presence() {
            if let Some(attempt) = self.transport.poll_retry(now) {
                self.dispatch_connect(attempt);
            }
        }
        if let Some(ticket) = self.scheduler.take_due(now) {
            self.poll(ticket);
        }
    }

    pub fn handle_event(&mut self, event: Event, now: Instant) {
        match event {
            Event::Command(command) => self.handle_command(command, now),
            Event::LoginFinished {
                client_epoch,
                ticket,
                result,
            } => self.on_login_finished(client_epoch, ticket, result, now),
            Event::SessionsFetched {
                ticket,
                token,
                result,
            } => self.on_sessions_fetched(ticket, &token, result, now),
            Event::TransportConnected { attempt, result } => {
                if self.transport.on_connect_result(attempt, result, now) {
                    // Show something right away instead of waiting for the next tick
                    self.scheduler.poll_now(now);
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::SetDisplay(true) => {
                info!("Display as status enabled");
                self.display_enabled = true;
                self.start(now);
            }
            Command::SetDisplay(false) => {
                info!("Display as status disabled");
                self.display_enabled = false;
                self.stop(now);
            }
            Command::Configure { client, profile } => {
                info!("Applying new configuration for {}", profile.user_name);
                self.stop(now);
                self.replace_client(Some(client));
                self.user_name = profile.user_name;
                self.display_enabled = profile.display_enabled;
                self.scheduler.set_interval(profile.poll_interval);
                self.transport.set_backoff(profile.reconnect_backoff);
                self.transport.set_client_id(&profile.client_id);
                self.start(now);
            }
            Command::Reset => {
                info!("Resetting, waiting for a new configuration");
                self.stop(now);
                self.transport.shutdown();
                self.replace_client(None);
            }
            Command::Shutdown => {
                info!("Shutting down presence sync");
                self.stop(now);
                self.transport.shutdown();
                self.shutting_down = true;
            }
        }
    }

    /// Swap the media client, logging the old one out in the background.
    fn replace_client(&mut self, client: Option<MediaServerClient>) {
        if let Some(mut old) = std::mem::replace(&mut self.media, client) {
            if let Some(session) = old.take_session() {
                let api = old.api();
                self.executor.execute(Box::new(move || {
                    if let Err(e) = api.end_session(&session.access_token) {
                        debug!("Logout failed: {e:#}");
                    }
                }));
            }
        }
        self.client_epoch += 1;
        self.pending_login = None;
    }

    // -- poll cycle --

    fn poll(&mut self, ticket: PollTicket) {
        let Some(ref media) = self.media else {
            debug!("Poll skipped, no media server client");
            return;
        };

        if let Some(token) = media.token() {
            let token = token.to_string();
            self.dispatch_fetch(ticket, token);
            return;
        }

        let api = media.api();
        if self.pending_login.is_some() {
            debug!("Login still in progress, skipping poll");
            return;
        }

        self.pending_login = Some(ticket);
        let tx = self.tx.clone();
        let client_epoch = self.client_epoch;
        self.executor.execute(Box::new(move || {
            let result = api.authenticate();
            let _ = tx.send(Event::LoginFinished {
                client_epoch,
                ticket,
                result,
            });
        }));
    }

    fn dispatch_fetch(&self, ticket: PollTicket, token: String) {
        let Some(ref media) = self.media else {
            return;
        };
        let api = media.api();
        let tx = self.tx.clone();
        self.executor.execute(Box::new(move || {
            let result = api.sessions(&token);
            let _ = tx.send(Event::SessionsFetched {
                ticket,
                token,
                result,
            });
        }));
    }

    fn dispatch_connect(&self, attempt: ConnectAttempt) {
        let connector = Arc::clone(&self.connector);
        let tx = self.tx.clone();
        self.executor.execute(Box::new(move || {
            let result = connector.connect(&attempt.client_id);
            let _ = tx.send(Event::TransportConnected {
                attempt: attempt.id,
                result,
            });
        }));
    }

    fn on_login_finished(
        &mut self,
        client_epoch: u64,
        ticket: PollTicket,
        result: Result<AuthSession, AuthError>,
        now: Instant,
    ) {
        if client_epoch != self.client_epoch {
            debug!("Discarding login for a replaced media server client");
            return;
        }
        if self.pending_login == Some(ticket) {
            self.pending_login = None;
        }
        let Some(ref mut media) = self.media else {
            return;
        };

        match result {
            Ok(session) => {
                let token = session.access_token.clone();
                if media.install(session) {
                    info!("Logged in to media server");
                    register_icon_in_background(media.api(), token);
                }
            }
            Err(e) => {
                error!("{e}");
                return;
            }
        }

        if !self.scheduler.is_current(ticket) {
            // A restart while logging in had its first poll skipped
            if self.scheduler.is_running() {
                debug!("Poll restarted while logging in, polling again");
                self.scheduler.poll_now(now);
            } else {
                debug!("Poll cancelled while logging in");
            }
            return;
        }
        if let Some(token) = media.token() {
            let token = token.to_string();
            self.dispatch_fetch(ticket, token);
        }
    }

    fn on_sessions_fetched(
        &mut self,
        ticket: PollTicket,
        token: &str,
        result: Result<Vec<PlaybackSession>, SessionFetchError>,
        now: Instant,
    ) {
        if !self.scheduler.accept(ticket) {
            debug!("Discarding stale poll result");
            return;
        }

        match result {
            Ok(sessions) => self.apply_sessions(&sessions, now),
            Err(e) if e.is_unauthorized() => {
                warn!("{e}");
                if let Some(ref mut media) = self.media {
                    if media.invalidate(token) {
                        info!("Access token rejected, logging in again on the next poll");
                    }
                }
            }
            Err(e) => warn!("Failed to fetch sessions: {e}"),
        }
    }

    fn apply_sessions(&mut self, sessions: &[PlaybackSession], now: Instant) {
        let Some(ref media) = self.media else {
            return;
        };
        let own_device = media.device_name().to_string();

        let Some(session) = selector::select(sessions, &self.user_name, &own_device) else {
            debug!("No active session for {}", self.user_name);
            self.transport.clear_activity(now);
            return;
        };

        let Some(payload) = mapper::map(session, (self.wall_clock)()) else {
            return;
        };
        self.transport.set_activity(&payload, now);

        if let Some(remaining) = mapper::remaining(session) {
            if !remaining.is_zero() {
                self.scheduler
                    .wake_at_item_end(now, remaining + ITEM_END_GRACE);
            }
        }
    }
}
