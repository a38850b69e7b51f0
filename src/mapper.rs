//! Presence mapping
//!
//! Turns the selected playback session into the payload shown by the presence
//! display. The text layout follows the media kind; the countdown is derived
//! from how many ticks are left in the item.

use serde::Serialize;
use std::time::Duration;

use crate::models::{ItemKind, NowPlayingItem, PlayState, PlaybackSession};
use crate::util::round_half_up;

/// Image key registered with the presence application for the main artwork
pub const LARGE_IMAGE_KEY: &str = "large";

/// Verb used in the details and large image text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verb {
    Watching,
    Listening,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Watching => "Watching",
            Verb::Listening => "Listening",
        }
    }
}

/// What the presence display should show
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub details: String,
    pub state: Option<String>,
    pub large_image_key: String,
    pub large_image_text: String,
    pub small_image_key: String,
    pub small_image_text: String,
    pub instance: bool,
    /// Epoch seconds at which the item is predicted to end; `None` while paused
    pub end_timestamp: Option<i64>,
    pub verb: Verb,
}

/// Build the payload for `session` as seen at `now_epoch_seconds`.
///
/// Returns `None` if the session has nothing playing.
pub fn map(session: &PlaybackSession, now_epoch_seconds: f64) -> Option<PresencePayload> {
    let item = session.now_playing_item.as_ref()?;
    let paused = session.play_state.is_paused;

    let (verb, details, state) = match item.kind {
        ItemKind::Episode => (
            Verb::Watching,
            format!(
                "Watching {}",
                item.series_name
                    .as_deref()
                    .filter(|name| !name.is_empty())
                    .unwrap_or("a TV Show")
            ),
            Some(episode_state(item)),
        ),
        ItemKind::Movie => (
            Verb::Watching,
            "Watching a Movie".to_string(),
            Some(item.name.clone()),
        ),
        ItemKind::Audio => (
            Verb::Listening,
            format!("Listening to {}", item.name),
            item.album_artist
                .as_deref()
                .filter(|artist| !artist.is_empty())
                .map(|artist| format!("By {artist}")),
        ),
        ItemKind::Other => (
            Verb::Watching,
            "Watching Other Content".to_string(),
            Some(item.name.clone()),
        ),
    };

    let end_timestamp = if paused {
        None
    } else {
        end_timestamp(item, &session.play_state, now_epoch_seconds)
    };

    Some(PresencePayload {
        details,
        state,
        large_image_key: LARGE_IMAGE_KEY.to_string(),
        large_image_text: format!("{} on {}", verb.as_str(), session.client),
        small_image_key: if paused { "pause" } else { "play" }.to_string(),
        small_image_text: if paused { "Paused" } else { "Playing" }.to_string(),
        instance: false,
        end_timestamp,
        verb,
    })
}

/// `S01E03: Name` when both numbers are known, otherwise just the name.
fn episode_state(item: &NowPlayingItem) -> String {
    match (item.parent_index_number, item.index_number) {
        (Some(season), Some(episode)) => {
            format!("S{season:02}E{episode:02}: {}", item.name)
        }
        _ => item.name.clone(),
    }
}

/// Whole seconds left in the item, rounded the same way the countdown is.
///
/// Ticks are first rounded to milliseconds, then to seconds. Negative values
/// (position past the reported runtime) clamp to zero. Items without a
/// runtime have no countdown.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn remaining_seconds(item: &NowPlayingItem, play_state: &PlayState) -> Option<i64> {
    let runtime = item.run_time_ticks?;
    let millis = round_half_up((runtime - play_state.position_ticks) as f64 / 10_000.0);
    let seconds = round_half_up(millis / 1000.0);
    Some(seconds.max(0.0) as i64)
}

/// Predicted epoch second at which the item ends.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn end_timestamp(
    item: &NowPlayingItem,
    play_state: &PlayState,
    now_epoch_seconds: f64,
) -> Option<i64> {
    let remaining = remaining_seconds(item, play_state)?;
    Some(round_half_up(now_epoch_seconds + remaining as f64) as i64)
}

/// Time until the selected session's item ends, if it is playing and has a runtime.
pub fn remaining(session: &PlaybackSession) -> Option<Duration> {
    if session.play_state.is_paused {
        return None;
    }
    let item = session.now_playing_item.as_ref()?;
    let seconds = remaining_seconds(item, &session.play_state)?;
    Some(Duration::from_secs(seconds.unsigned_abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing(item: NowPlayingItem, paused: bool, position_ticks: i64) -> PlaybackSession {
        PlaybackSession {
            user_name: Some("alice".to_string()),
            device_name: "TV".to_string(),
            client: "Emby Theater".to_string(),
            now_playing_item: Some(item),
            play_state: PlayState {
                is_paused: paused,
                position_ticks,
            },
        }
    }

    fn arrival() -> NowPlayingItem {
        NowPlayingItem {
            kind: ItemKind::Movie,
            name: "Arrival".to_string(),
            run_time_ticks: Some(72_000_000_000),
            ..Default::default()
        }
    }

    #[test]
    fn test_movie_playing() {
        let payload = map(&playing(arrival(), false, 36_000_000_000), 1000.0).unwrap();
        assert_eq!(payload.details, "Watching a Movie");
        assert_eq!(payload.state.as_deref(), Some("Arrival"));
        // an hour of ticks left
        assert_eq!(payload.end_timestamp, Some(4600));
        assert_eq!(payload.small_image_key, "play");
        assert_eq!(payload.small_image_text, "Playing");
        assert_eq!(payload.large_image_key, "large");
        assert_eq!(payload.large_image_text, "Watching on Emby Theater");
        assert!(!payload.instance);
    }

    #[test]
    fn test_movie_paused() {
        let payload = map(&playing(arrival(), true, 36_000_000_000), 1000.0).unwrap();
        assert_eq!(payload.end_timestamp, None);
        assert_eq!(payload.small_image_key, "pause");
        assert_eq!(payload.small_image_text, "Paused");
    }

    #[test]
    fn test_episode_with_numbers() {
        let item = NowPlayingItem {
            kind: ItemKind::Episode,
            name: "Pilot".to_string(),
            series_name: Some("Some Show".to_string()),
            parent_index_number: Some(1),
            index_number: Some(3),
            run_time_ticks: Some(26_000_000_000),
            ..Default::default()
        };
        let payload = map(&playing(item, false, 0), 0.0).unwrap();
        assert_eq!(payload.details, "Watching Some Show");
        assert_eq!(payload.state.as_deref(), Some("S01E03: Pilot"));
        assert_eq!(payload.end_timestamp, Some(2600));
    }

    #[test]
    fn test_episode_without_numbers_or_series() {
        let item = NowPlayingItem {
            kind: ItemKind::Episode,
            name: "Special".to_string(),
            index_number: Some(12),
            ..Default::default()
        };
        let payload = map(&playing(item, false, 0), 0.0).unwrap();
        assert_eq!(payload.details, "Watching a TV Show");
        assert_eq!(payload.state.as_deref(), Some("Special"));
    }

    #[test]
    fn test_episode_large_numbers_not_truncated() {
        let item = NowPlayingItem {
            kind: ItemKind::Episode,
            name: "Long Run".to_string(),
            parent_index_number: Some(21),
            index_number: Some(104),
            ..Default::default()
        };
        let payload = map(&playing(item, false, 0), 0.0).unwrap();
        assert_eq!(payload.state.as_deref(), Some("S21E104: Long Run"));
    }

    #[test]
    fn test_audio_with_artist() {
        let item = NowPlayingItem {
            kind: ItemKind::Audio,
            name: "Song".to_string(),
            album_artist: Some("Band".to_string()),
            run_time_ticks: Some(2_000_000_000),
            ..Default::default()
        };
        let payload = map(&playing(item, false, 0), 100.0).unwrap();
        assert_eq!(payload.details, "Listening to Song");
        assert_eq!(payload.state.as_deref(), Some("By Band"));
        assert_eq!(payload.large_image_text, "Listening on Emby Theater");
        assert_eq!(payload.verb, Verb::Listening);
        assert_eq!(payload.end_timestamp, Some(300));
    }

    #[test]
    fn test_audio_without_artist_has_no_state() {
        let item = NowPlayingItem {
            kind: ItemKind::Audio,
            name: "Song".to_string(),
            ..Default::default()
        };
        let payload = map(&playing(item, false, 0), 0.0).unwrap();
        assert_eq!(payload.state, None);
    }

    #[test]
    fn test_empty_names_count_as_missing() {
        let episode = NowPlayingItem {
            kind: ItemKind::Episode,
            name: "Special".to_string(),
            series_name: Some(String::new()),
            ..Default::default()
        };
        let payload = map(&playing(episode, false, 0), 0.0).unwrap();
        assert_eq!(payload.details, "Watching a TV Show");

        let song = NowPlayingItem {
            kind: ItemKind::Audio,
            name: "Song".to_string(),
            album_artist: Some(String::new()),
            ..Default::default()
        };
        let payload = map(&playing(song, false, 0), 0.0).unwrap();
        assert_eq!(payload.state, None);
    }

    #[test]
    fn test_other_content() {
        let item = NowPlayingItem {
            kind: ItemKind::Other,
            name: "Channel 4".to_string(),
            ..Default::default()
        };
        let payload = map(&playing(item, false, 0), 0.0).unwrap();
        assert_eq!(payload.details, "Watching Other Content");
        assert_eq!(payload.state.as_deref(), Some("Channel 4"));
        assert_eq!(payload.end_timestamp, None);
    }

    #[test]
    fn test_nothing_playing() {
        let session = PlaybackSession::default();
        assert!(map(&session, 0.0).is_none());
    }

    #[test]
    fn test_remaining_rounding() {
        // 1.5 ms remaining rounds up to 2 ms, then to 0 s
        let item = NowPlayingItem {
            run_time_ticks: Some(15_000),
            ..Default::default()
        };
        assert_eq!(remaining_seconds(&item, &PlayState::default()), Some(0));

        // 499.5 ms rounds to 500 ms, then up to 1 s
        let item = NowPlayingItem {
            run_time_ticks: Some(4_995_000),
            ..Default::default()
        };
        assert_eq!(remaining_seconds(&item, &PlayState::default()), Some(1));
    }

    #[test]
    fn test_remaining_clamps_past_end() {
        let state = PlayState {
            is_paused: false,
            position_ticks: 80_000_000_000,
        };
        assert_eq!(remaining_seconds(&arrival(), &state), Some(0));
    }

    #[test]
    fn test_end_timestamp_rounds_fractional_now() {
        let state = PlayState {
            is_paused: false,
            position_ticks: 36_000_000_000,
        };
        assert_eq!(end_timestamp(&arrival(), &state, 1000.6), Some(4601));
        assert_eq!(end_timestamp(&arrival(), &state, 1000.4), Some(4600));
        let state = PlayState {
            is_paused: false,
            position_ticks: 68_400_000_000,
        };
        assert_eq!(end_timestamp(&arrival(), &state, 1000.0), Some(1360));
    }

    #[test]
    fn test_remaining_duration() {
        let session = playing(arrival(), false, 36_000_000_000);
        assert_eq!(remaining(&session), Some(Duration::from_secs(3600)));
        let paused = playing(arrival(), true, 36_000_000_000);
        assert_eq!(remaining(&paused), None);
    }
}
