//! Client for the external coordination event server (spec §4.I, §6).
//! Grounded in `lansync/remote.py`'s `RemoteClient`/`RemoteUrl`: a small
//! reqwest wrapper around `GET/POST /namespace/{namespace}/events`.

use crate::config::Settings;
use crate::error::Result;
use crate::model::NodeEvent;

#[derive(serde::Deserialize)]
struct EventsResponse {
    events: Vec<NodeEvent>,
}

#[derive(serde::Deserialize)]
struct PushEventsResponse {
    last_sequence_number: i64,
}

pub struct EventClient {
    http: reqwest::Client,
    base_url: String,
}

impl EventClient {
    pub fn new(settings: &Settings) -> EventClient {
        EventClient {
            http: reqwest::Client::builder()
                .connect_timeout(settings.connect_timeout)
                .timeout(settings.read_timeout)
                .build()
                .expect("reqwest client builder never fails with these options"),
            base_url: settings.remote_server_url.clone(),
        }
    }

    pub async fn fetch_events(&self, namespace: &str, min_sequence_number: Option<i64>) -> Result<Vec<NodeEvent>> {
        let mut url = format!("{}/namespace/{namespace}/events", self.base_url);
        if let Some(min) = min_sequence_number {
            url.push_str(&format!("?min_sequence_number={min}"));
        }
        let response = self.http.get(&url).send().await?.error_for_status()?;
        let body: EventsResponse = response.json().await?;
        Ok(body.events)
    }

    /// Returns the sequence number the server assigned to the last event
    /// in the batch.
    pub async fn push_events(&self, namespace: &str, events: &[NodeEvent]) -> Result<i64> {
        let url = format!("{}/namespace/{namespace}/events", self.base_url);
        let response = self.http.post(&url).json(events).send().await?.error_for_status()?;
        let body: PushEventsResponse = response.json().await?;
        Ok(body.last_sequence_number)
    }
}
