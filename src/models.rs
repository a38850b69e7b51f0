//! Media server session models
//!
//! Mirrors the subset of the `/Sessions` response we care about. Emby and
//! Jellyfin share the same PascalCase shape. Everything is optional or
//! defaulted because the server omits fields freely (idle sessions have no
//! `NowPlayingItem`, live TV has no `RunTimeTicks`, and so on).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-side duration unit: 100 nanoseconds
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// One connected client/device as reported by the media server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct PlaybackSession {
    /// Absent for sessions that are not tied to a user
    #[serde(default)]
    pub user_name: Option<String>,

    #[serde(default)]
    pub device_name: String,

    /// Client application name (e.g. "Emby Web", "Jellyfin Android")
    #[serde(default)]
    pub client: String,

    #[serde(default)]
    pub now_playing_item: Option<NowPlayingItem>,

    #[serde(default)]
    pub play_state: PlayState,
}

impl PlaybackSession {
    pub fn is_paused(&self) -> bool {
        self.play_state.is_paused
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct PlayState {
    #[serde(default)]
    pub is_paused: bool,

    #[serde(default)]
    pub position_ticks: i64,
}

/// The media entity currently associated with a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct NowPlayingItem {
    #[serde(rename = "Type", default)]
    pub kind: ItemKind,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub series_name: Option<String>,

    /// Season number for episodes
    #[serde(default)]
    pub parent_index_number: Option<u32>,

    /// Episode number for episodes, track number for audio
    #[serde(default)]
    pub index_number: Option<u32>,

    #[serde(default)]
    pub album_artist: Option<String>,

    #[serde(default)]
    pub run_time_ticks: Option<i64>,
}

/// Kind of media being played
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ItemKind {
    Episode,
    Movie,
    Audio,
    #[default]
    #[serde(other)]
    Other,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemKind::Episode => "Episode",
            ItemKind::Movie => "Movie",
            ItemKind::Audio => "Audio",
            ItemKind::Other => "Other",
        };
        f.write_str(name)
    }
}

/// Parse a `/Sessions` response body.
pub fn parse_sessions(body: &str) -> serde_json::Result<Vec<PlaybackSession>> {
    serde_json::from_str(body)
}
