//! Bounds how far agents may generate ahead of narration playback.
//!
//! Without a bound, a fast provider would keep producing turns while TTS
//! playback lags arbitrarily far behind, wasting quota and leaving a long
//! unheard tail if the session is abandoned.

use crate::conversation::{MessageId, StoredMessage};

/// Default cap on agent messages beyond the last narrated one
pub const DEFAULT_LOOKAHEAD_LIMIT: usize = 3;

/// Whether another agent message may be generated.
///
/// Counts agent-authored messages strictly after the position of
/// `last_narrated` in `messages` and compares against `limit`. A `None`
/// marker, or one that does not appear in the fetched window, counts as
/// "nothing narrated yet": the permissive bias, which can only delay
/// generation, never run unbounded ahead.
pub fn allowed(last_narrated: Option<MessageId>, messages: &[StoredMessage], limit: usize) -> bool {
    let start = last_narrated
        .and_then(|id| messages.iter().position(|m| m.id == id))
        .map_or(0, |pos| pos + 1);

    let pending = messages[start..]
        .iter()
        .filter(|m| m.speaker.is_agent())
        .count();

    pending < limit
}
