//! Media server session inspector
//!
//! Logs in with the saved configuration, prints every session the server
//! reports, and shows which one would be displayed and how.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use mediaserver_presence::{
    mapper, selector, util, JsonFileStore, MediaServerClient, PlaybackSession, Settings,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "mediaserver-debug",
    version,
    about = "Print media server sessions and the presence they map to"
)]
struct Cli {
    /// Config file to use instead of the one in the user config directory
    #[arg(long)]
    config: Option<PathBuf>,

    /// Select sessions for this user instead of the configured one
    #[arg(long)]
    user: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    println!("🎬 Media Server Presence - Session Inspector");
    println!("============================================\n");

    let mut store = match cli.config {
        Some(ref path) => JsonFileStore::open(path)?,
        None => JsonFileStore::open_default()?,
    };
    println!("📁 Config: {}\n", store.path().display());

    let mut settings = Settings::load(&store);
    let mut client = MediaServerClient::from_settings(&mut settings, &mut store)?
        .ok_or_else(|| anyhow!("No server credentials saved. Run `configure` first"))?;
    let user = match cli.user {
        Some(user) => user,
        None => settings
            .credentials
            .as_ref()
            .map(|c| c.username.clone())
            .unwrap_or_default(),
    };

    match client.login() {
        Ok(session) => println!(
            "✅ Logged in to {} as device {}\n",
            settings.server_type, session.device_name
        ),
        Err(e) => {
            eprintln!("❌ {e}");
            return Err(anyhow!("Invalid server address or login credentials"));
        }
    }

    let sessions = client.get_sessions().context("Failed to fetch sessions")?;
    println!("📊 {} session(s) reported:\n", sessions.len());
    for session in &sessions {
        print_session_compact(session, "   ");
    }

    println!("\n🔍 Selected for {user:?}:");
    match selector::select(&sessions, &user, client.device_name()) {
        Some(session) => {
            print_session_compact(session, "   ");
            if let Some(payload) = mapper::map(session, util::now_epoch_seconds()) {
                println!("\n📝 Presence payload:");
                println!("{}", serde_json::to_string_pretty(&payload)?);
            }
        }
        None => println!("   (nothing playing, presence would be cleared)"),
    }

    client.logout();
    Ok(())
}

fn print_session_compact(session: &PlaybackSession, prefix: &str) {
    let mut fields = vec![
        format!("User: {}", session.user_name.as_deref().unwrap_or("-")),
        format!("Device: {}", session.device_name),
        format!("Client: {}", session.client),
    ];

    match session.now_playing_item {
        Some(ref item) => {
            fields.push(format!("{}: {}", item.kind, util::truncate(&item.name, 40)));
            fields.push(if session.is_paused() { "⏸️" } else { "▶️" }.to_string());
        }
        None => fields.push("(idle)".to_string()),
    }

    println!("{}{}", prefix, fields.join(" | "));
}
