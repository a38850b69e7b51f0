//! Media server Discord Rich Presence
//!
//! Runs in the foreground and keeps Discord in sync with whatever the
//! configured user is playing on their Emby or Jellyfin server.
//!
//! Architecture:
//! - Main thread: the sync controller event loop
//! - stdin thread: `display on|off`, `reset`, `reload` and `quit` commands
//! - Worker threads: HTTP calls and Discord IPC logins, one per job

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{debug, error, info, warn};
use mediaserver_presence::config::{
    reset_configuration, save_configuration, set_display_enabled, InstanceLock, Protocol,
};
use mediaserver_presence::{
    logging, updates, ControlHandle, Credentials, DiscordConnector, JsonFileStore,
    MediaServerClient, ServerType, Settings, SyncController, SyncProfile, ThreadExecutor,
    APP_NAME, APP_VERSION,
};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

#[derive(Parser)]
#[command(
    name = "mediaserver-presence",
    version,
    about = "Show what you play on Emby or Jellyfin as your Discord status"
)]
struct Cli {
    /// Config file to use instead of the one in the user config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Log level, overriding the `logLevel` setting
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Sync presence with the saved configuration (default)
    Run,
    /// Check server details, save them and start syncing
    Configure(ConfigureArgs),
    /// Turn the presence display on or off
    Display {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Forget the saved server configuration
    Reset,
}

#[derive(Args)]
struct ConfigureArgs {
    /// emby or jellyfin
    #[arg(long, default_value = "emby")]
    server: String,

    /// Server host name or IP address
    #[arg(long)]
    address: String,

    #[arg(long)]
    port: u16,

    /// http or https
    #[arg(long, default_value = "http")]
    protocol: String,

    #[arg(long)]
    username: String,

    #[arg(long)]
    password: Option<String>,

    /// Save the configuration and exit instead of starting to sync
    #[arg(long)]
    save_only: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn enabled(self) -> bool {
        matches!(self, Toggle::On)
    }
}

/// Commands accepted on stdin while running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StdinCommand {
    Display(bool),
    Reset,
    Reload,
    Quit,
}

fn parse_command(line: &str) -> Option<StdinCommand> {
    let line = line.to_ascii_lowercase();
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["display", "on"] => Some(StdinCommand::Display(true)),
        ["display", "off"] => Some(StdinCommand::Display(false)),
        ["reset"] => Some(StdinCommand::Reset),
        ["reload"] => Some(StdinCommand::Reload),
        ["quit"] | ["exit"] => Some(StdinCommand::Quit),
        _ => None,
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let store = match cli.config {
        Some(ref path) => JsonFileStore::open(path)?,
        None => JsonFileStore::open_default()?,
    };
    let settings = Settings::load(&store);

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| settings.log_level.clone());
    logging::init(&level, cli.log_file.as_deref())?;

    debug!("Using config file {}", store.path().display());

    match cli.command.unwrap_or(Cmd::Run) {
        Cmd::Run => run(store, settings),
        Cmd::Configure(args) => configure(store, settings, args),
        Cmd::Display { state } => {
            let mut store = store;
            set_display_enabled(&mut store, state.enabled())?;
            info!(
                "Display as status turned {}",
                if state.enabled() { "on" } else { "off" }
            );
            Ok(())
        }
        Cmd::Reset => {
            let mut store = store;
            reset_configuration(&mut store)?;
            info!("Configuration reset. Run `{APP_NAME} configure` to set up again");
            Ok(())
        }
    }
}

/// Refuse to sync twice against the same config file.
fn lock_instance(config_path: &Path) -> Result<InstanceLock> {
    match InstanceLock::acquire(config_path)? {
        Some(lock) => {
            debug!("Holding instance lock {}", lock.path().display());
            Ok(lock)
        }
        None => bail!(
            "{APP_NAME} is already running for {}. Use its stdin commands or stop it first",
            config_path.display()
        ),
    }
}

/// Start syncing with the saved configuration.
fn run(mut store: JsonFileStore, mut settings: Settings) -> Result<()> {
    if !settings.is_configured {
        bail!("Not configured yet. Run `{APP_NAME} configure` first");
    }
    let _lock = lock_instance(store.path())?;
    let client = MediaServerClient::from_settings(&mut settings, &mut store)?
        .ok_or_else(|| anyhow!("No server credentials saved. Run `{APP_NAME} configure`"))?;
    let profile = SyncProfile::from_settings(&settings)
        .ok_or_else(|| anyhow!("No server credentials saved. Run `{APP_NAME} configure`"))?;

    let controller = SyncController::new(
        profile,
        Some(client),
        Arc::new(DiscordConnector),
        Box::new(ThreadExecutor),
    );
    serve(controller, store.path(), &settings);
    Ok(())
}

/// Validate the details, log in once, and only then save them.
fn configure(mut store: JsonFileStore, mut settings: Settings, args: ConfigureArgs) -> Result<()> {
    let server_type: ServerType = args.server.parse()?;
    let protocol: Protocol = args.protocol.parse()?;
    let credentials = Credentials {
        address: args.address,
        username: args.username,
        password: args.password.filter(|p| !p.is_empty()),
        protocol,
        port: args.port,
    };

    let missing = credentials.missing_fields();
    if !missing.is_empty() {
        bail!("Missing required fields: {}", missing.join(", "));
    }

    // Saving alone is allowed next to a running instance, which picks it up on `reload`
    let _lock = if args.save_only {
        None
    } else {
        Some(lock_instance(store.path())?)
    };

    settings.server_type = server_type;
    settings.credentials = Some(credentials.clone());
    settings.display_enabled = true;

    let client = MediaServerClient::from_settings(&mut settings, &mut store)?
        .ok_or_else(|| anyhow!("No server credentials given"))?;
    let profile = SyncProfile::from_settings(&settings)
        .ok_or_else(|| anyhow!("No server credentials given"))?;

    info!("🔗 Logging in to {} at {}...", server_type, credentials.server_url());
    let controller = SyncController::configured(
        client,
        profile,
        Arc::new(DiscordConnector),
        Box::new(ThreadExecutor),
    )
    .map_err(|e| {
        error!("{e}");
        anyhow!("Invalid server address or login credentials")
    })?;

    save_configuration(&mut store, server_type, &credentials)?;
    settings.is_configured = true;
    info!("✅ Configuration saved to {}", store.path().display());

    if args.save_only {
        return Ok(());
    }
    serve(controller, store.path(), &settings);
    Ok(())
}

/// Spawn the helper threads and run the controller on this thread until quit.
fn serve(controller: SyncController, config_path: &Path, settings: &Settings) {
    info!("🎬 {APP_NAME} v{APP_VERSION} starting...");

    let handle = controller.handle();
    let config_path = config_path.to_path_buf();
    let spawned = thread::Builder::new()
        .name("stdin-commands".to_string())
        .spawn(move || read_commands(&handle, &config_path));
    if let Err(e) = spawned {
        warn!("Failed to read commands from stdin: {e}");
    }

    if settings.check_updates {
        updates::check_in_background();
    }

    controller.run();
}

/// Forward stdin commands to the controller, persisting setting changes.
fn read_commands(handle: &ControlHandle, config_path: &Path) {
    info!("Commands: display on, display off, reset, reload, quit");

    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Some(command) = parse_command(&line) else {
            warn!("Unknown command {:?}", line.trim());
            continue;
        };

        let sent = match apply_command(handle, config_path, command) {
            Ok(sent) => sent,
            Err(e) => {
                error!("{e:#}");
                continue;
            }
        };
        if !sent || command == StdinCommand::Quit {
            return;
        }
    }

    debug!("stdin closed, no more commands");
}

/// Returns false once the controller is gone.
fn apply_command(handle: &ControlHandle, config_path: &Path, command: StdinCommand) -> Result<bool> {
    // Reopen each time so changes made by another invocation are not overwritten
    let mut store = JsonFileStore::open(config_path)?;

    let sent = match command {
        StdinCommand::Display(enabled) => {
            set_display_enabled(&mut store, enabled)?;
            handle.set_display(enabled)
        }
        StdinCommand::Reset => {
            reset_configuration(&mut store)?;
            handle.reset()
        }
        StdinCommand::Reload => {
            let mut settings = Settings::load(&store);
            if !settings.is_configured {
                warn!("Not configured yet. Run `{APP_NAME} configure --save-only` first");
                return Ok(true);
            }
            let client = MediaServerClient::from_settings(&mut settings, &mut store)?;
            let profile = SyncProfile::from_settings(&settings);
            match (client, profile) {
                (Some(client), Some(profile)) => handle.configure(client, profile),
                _ => {
                    warn!("No server credentials saved");
                    return Ok(true);
                }
            }
        }
        StdinCommand::Quit => handle.shutdown(),
    };

    match sent {
        Ok(()) => Ok(true),
        Err(e) => {
            debug!("{e}");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("display on"), Some(StdinCommand::Display(true)));
        assert_eq!(parse_command("  Display   OFF "), Some(StdinCommand::Display(false)));
        assert_eq!(parse_command("reset"), Some(StdinCommand::Reset));
        assert_eq!(parse_command("reload"), Some(StdinCommand::Reload));
        assert_eq!(parse_command("quit"), Some(StdinCommand::Quit));
        assert_eq!(parse_command("exit"), Some(StdinCommand::Quit));
        assert_eq!(parse_command("display"), None);
        assert_eq!(parse_command("display maybe"), None);
    }

    #[test]
    fn test_cli_parses_configure() {
        let cli = Cli::try_parse_from([
            "mediaserver-presence",
            "configure",
            "--server",
            "jellyfin",
            "--address",
            "media.local",
            "--port",
            "8096",
            "--username",
            "alice",
        ])
        .unwrap();
        let Some(Cmd::Configure(args)) = cli.command else {
            panic!("expected configure");
        };
        assert_eq!(args.server, "jellyfin");
        assert_eq!(args.protocol, "http");
        assert_eq!(args.password, None);
        assert!(!args.save_only);
    }

    #[test]
    fn test_second_instance_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.json");

        let _held = lock_instance(&config).unwrap();
        let err = lock_instance(&config).unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["mediaserver-presence"]).unwrap();
        assert!(cli.command.is_none());
    }
}
