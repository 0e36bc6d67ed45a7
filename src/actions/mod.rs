pub mod booking;

pub use booking::{BookingConfig, BookingOutcome, MeetingBooker, MeetingScheduler};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Marker the model embeds when the customer agreed to book a meeting.
pub const MEETING_ACTION: &str = "Time_to_121meet";

/// Shown when stripping the action JSON leaves nothing user-facing.
pub const SCHEDULING_PREAMBLE: &str = "Great, let me get that meeting scheduled for you.";

/// Structured booking details the model emits inside its reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeetingData {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub meeting_time: String,
    #[serde(default)]
    pub friendly_time: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ActionDetection {
    pub meeting: Option<MeetingData>,
    /// Reply text with the action fragment removed.
    pub cleaned_response: String,
}

/// Scan a model reply for an embedded action object (bare or wrapped in a
/// length-1 array). Malformed JSON is not an action; the reply passes
/// through untouched.
pub fn detect_meeting_action(reply: &str) -> ActionDetection {
    for (start, end) in json_fragments(reply) {
        let fragment = &reply[start..end];
        let Ok(value) = serde_json::from_str::<Value>(fragment) else {
            continue;
        };
        let Some(action_obj) = action_object(&value) else {
            continue;
        };
        let Ok(meeting) = serde_json::from_value::<MeetingData>(action_obj.clone()) else {
            continue;
        };

        let mut cleaned = String::with_capacity(reply.len() - fragment.len());
        cleaned.push_str(&reply[..start]);
        cleaned.push_str(&reply[end..]);
        let cleaned = cleaned.trim().to_string();
        let cleaned_response = if cleaned.is_empty() {
            SCHEDULING_PREAMBLE.to_string()
        } else {
            cleaned
        };

        debug!(title = %meeting.title, "meeting action detected in reply");
        return ActionDetection {
            meeting: Some(meeting),
            cleaned_response,
        };
    }

    ActionDetection {
        meeting: None,
        cleaned_response: reply.to_string(),
    }
}

/// The object carrying the booking marker, unwrapping a length-1 array.
fn action_object(value: &Value) -> Option<&Value> {
    let candidate = match value {
        Value::Array(items) if items.len() == 1 => &items[0],
        other => other,
    };
    match candidate {
        Value::Object(map) if map.get("action").and_then(Value::as_str) == Some(MEETING_ACTION) => {
            Some(candidate)
        }
        _ => None,
    }
}

/// Byte ranges of balanced top-level `{...}` / `[...]` fragments,
/// respecting JSON string and escape rules.
fn json_fragments(text: &str) -> Vec<(usize, usize)> {
    let mut fragments = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' | '[' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' | ']' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start.take() {
                            fragments.push((s, i + c.len_utf8()));
                        }
                    }
                }
            }
            _ => {}
        }
    }
    fragments
}
