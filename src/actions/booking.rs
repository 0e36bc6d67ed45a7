use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::MeetingData;
use crate::db::{CalendarTokens, Database, MeetingRecord};

const DEFAULT_MEETING_MINUTES: u32 = 30;

/// Calendar-side settings and the user-visible soft-failure copy.
#[derive(Debug, Clone)]
pub struct BookingConfig {
    pub token_url: String,
    pub events_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout: Duration,
    /// Shown when the owning user never connected a calendar.
    pub unavailable_message: String,
    /// Shown when the calendar API rejects the booking.
    pub failure_message: String,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            events_url: "https://www.googleapis.com/calendar/v3/calendars/primary/events"
                .to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            timeout: Duration::from_secs(15),
            unavailable_message:
                "I couldn't book that meeting automatically. Our team will reach out to confirm a time."
                    .to_string(),
            failure_message:
                "I couldn't finalize the meeting just now. Our team will follow up to confirm."
                    .to_string(),
        }
    }
}

/// Result of a booking attempt. Failure never aborts the reply; it only
/// swaps the user-facing text.
#[derive(Debug, Clone)]
pub enum BookingOutcome {
    Booked { meet_link: Option<String> },
    Unavailable { message: String },
}

/// Seam for the worker; the production implementation is [`MeetingBooker`].
#[async_trait]
pub trait MeetingScheduler: Send + Sync {
    async fn book_from_model(
        &self,
        conversation_id: &str,
        meeting: &MeetingData,
    ) -> Result<BookingOutcome>;
}

/// Books calendar events for detected meeting actions, refreshing OAuth
/// tokens as needed and persisting a `meetings` row per booking.
pub struct MeetingBooker {
    db: Arc<dyn Database>,
    http: reqwest::Client,
    config: BookingConfig,
}

/// Start/end of the event, defaulting the duration when the model gave none.
fn event_window(meeting: &MeetingData) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = DateTime::parse_from_rfc3339(&meeting.meeting_time)
        .ok()?
        .with_timezone(&Utc);
    let minutes = meeting.duration_minutes.unwrap_or(DEFAULT_MEETING_MINUTES);
    Some((start, start + ChronoDuration::minutes(minutes as i64)))
}

fn event_payload(meeting: &MeetingData, request_id: &str) -> Option<Value> {
    let (start, end) = event_window(meeting)?;
    let attendees: Vec<Value> = meeting
        .participants
        .iter()
        .map(|email| json!({ "email": email }))
        .collect();
    Some(json!({
        "summary": meeting.title,
        "description": meeting.description.clone().unwrap_or_default(),
        "start": { "dateTime": start.to_rfc3339() },
        "end": { "dateTime": end.to_rfc3339() },
        "attendees": attendees,
        "conferenceData": {
            "createRequest": {
                "requestId": request_id,
                "conferenceSolutionKey": { "type": "hangoutsMeet" }
            }
        }
    }))
}

impl MeetingBooker {
    pub fn new(db: Arc<dyn Database>, config: BookingConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { db, http, config })
    }

    fn unavailable(&self) -> BookingOutcome {
        BookingOutcome::Unavailable {
            message: self.config.unavailable_message.clone(),
        }
    }

    fn failed(&self) -> BookingOutcome {
        BookingOutcome::Unavailable {
            message: self.config.failure_message.clone(),
        }
    }

    /// Refresh when the stored access token is expired or about to be.
    async fn fresh_access_token(&self, user_id: &str, tokens: CalendarTokens) -> Result<String> {
        if tokens.token_expiry > Utc::now() + ChronoDuration::seconds(60) {
            return Ok(tokens.access_token);
        }

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", tokens.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("token refresh response missing access_token"))?
            .to_string();
        let expires_in = body["expires_in"].as_i64().unwrap_or(3600);

        // Refreshed tokens overwrite the stored ones.
        let updated = CalendarTokens {
            access_token: access_token.clone(),
            refresh_token: tokens.refresh_token,
            token_expiry: Utc::now() + ChronoDuration::seconds(expires_in),
            scope: tokens.scope,
        };
        self.db.store_calendar_tokens(user_id, &updated).await?;
        info!(user_id, "calendar tokens refreshed");
        Ok(access_token)
    }
}

#[async_trait]
impl MeetingScheduler for MeetingBooker {
    async fn book_from_model(
        &self,
        conversation_id: &str,
        meeting: &MeetingData,
    ) -> Result<BookingOutcome> {
        let Some(user_id) = self.db.user_for_conversation(conversation_id).await? else {
            warn!(conversation_id, "booking requested for unknown conversation");
            return Ok(self.unavailable());
        };

        let Some(tokens) = self.db.calendar_tokens(&user_id).await? else {
            info!(user_id = %user_id, "no calendar credentials, soft-failing booking");
            return Ok(self.unavailable());
        };

        let access_token = match self.fresh_access_token(&user_id, tokens).await {
            Ok(token) => token,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "calendar token refresh failed");
                return Ok(self.failed());
            }
        };

        let request_id = Uuid::new_v4().to_string();
        let Some(payload) = event_payload(meeting, &request_id) else {
            warn!(
                meeting_time = %meeting.meeting_time,
                "meeting action carried an unparseable time"
            );
            return Ok(self.failed());
        };

        let response = self
            .http
            .post(format!("{}?conferenceDataVersion=1", self.config.events_url))
            .bearer_auth(&access_token)
            .json(&payload)
            .send()
            .await;

        let body: Value = match response {
            Ok(r) if r.status().is_success() => r.json().await.unwrap_or(Value::Null),
            Ok(r) => {
                warn!(status = r.status().as_u16(), "calendar API rejected event");
                return Ok(self.failed());
            }
            Err(e) => {
                warn!(error = %e, "calendar API unreachable");
                return Ok(self.failed());
            }
        };

        let google_event_id = body["id"].as_str().unwrap_or(&request_id).to_string();
        let meet_link = body["hangoutLink"]
            .as_str()
            .or_else(|| {
                body["conferenceData"]["entryPoints"][0]["uri"].as_str()
            })
            .map(String::from);

        let record = MeetingRecord {
            meeting_id: Uuid::new_v4().to_string(),
            user_id: user_id.clone(),
            conversation_id: conversation_id.to_string(),
            google_event_id,
            title: meeting.title.clone(),
            meeting_time: meeting.meeting_time.clone(),
            meet_link: meet_link.clone(),
            status: "scheduled".to_string(),
        };
        if let Err(e) = self.db.insert_meeting(&record).await {
            // The event exists on the calendar; a lost row is log-only.
            warn!(error = %e, "failed to persist meeting record");
        }

        info!(
            conversation_id,
            meet_link = meet_link.as_deref().unwrap_or("-"),
            "meeting booked"
        );
        Ok(BookingOutcome::Booked { meet_link })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meeting() -> MeetingData {
        MeetingData {
            name: "Joe".to_string(),
            email: "j@x".to_string(),
            title: "Demo".to_string(),
            participants: vec!["j@x".to_string()],
            meeting_time: "2025-10-06T19:00:00+05:30".to_string(),
            friendly_time: "Mon 7 PM".to_string(),
            description: None,
            duration_minutes: None,
        }
    }

    #[test]
    fn event_window_defaults_duration() {
        let (start, end) = event_window(&meeting()).unwrap();
        assert_eq!((end - start).num_minutes(), 30);
    }

    #[test]
    fn event_window_rejects_garbage_time() {
        let mut bad = meeting();
        bad.meeting_time = "next monday".to_string();
        assert!(event_window(&bad).is_none());
    }

    #[test]
    fn event_payload_shape() {
        let payload = event_payload(&meeting(), "req-1").unwrap();
        assert_eq!(payload["summary"], "Demo");
        assert_eq!(payload["attendees"][0]["email"], "j@x");
        assert_eq!(
            payload["conferenceData"]["createRequest"]["requestId"],
            "req-1"
        );
        assert!(payload["start"]["dateTime"].as_str().is_some());
    }

    #[test]
    fn custom_duration_is_respected() {
        let mut m = meeting();
        m.duration_minutes = Some(90);
        let (start, end) = event_window(&m).unwrap();
        assert_eq!((end - start).num_minutes(), 90);
    }
}
