//! Session selection
//!
//! Picks the playback session that should drive the presence out of
//! everything the media server reports.

use crate::models::PlaybackSession;

/// Select the session to display for `user_name`.
///
/// A session qualifies when its user name matches exactly, it has a now
/// playing item, and it is not this application's own session (we register as
/// a device ourselves when logging in). If several sessions qualify the first
/// one in server order wins; there is no further tie-break.
pub fn select<'a>(
    sessions: &'a [PlaybackSession],
    user_name: &str,
    own_device_name: &str,
) -> Option<&'a PlaybackSession> {
    sessions.iter().find(|session| {
        session.user_name.as_deref() == Some(user_name)
            && session.now_playing_item.is_some()
            && session.device_name != own_device_name
            && session.client != own_device_name
    })
}
