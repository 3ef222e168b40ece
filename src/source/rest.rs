//! REST adapter for a Home-Assistant-style host API.
//!
//! Endpoints used:
//! - `GET /api/states` -- every entity with its current state
//! - `GET /api/states/{entity_id}` -- one entity
//! - `GET /api/history/period/{from}?filter_entity_id=..&end_time=..` --
//!   recorded states in a window, as a list of per-entity lists

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{EntityFilter, RawState, SourceError, StateSource};

#[derive(Debug, Deserialize)]
struct HostState {
    entity_id: Option<String>,
    state: String,
    last_changed: DateTime<Utc>,
}

impl From<HostState> for RawState {
    fn from(s: HostState) -> Self {
        RawState::new(s.state, s.last_changed)
    }
}

pub struct RestStateSource {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl RestStateSource {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        entity_id: Option<&str>,
    ) -> Result<T, SourceError> {
        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(SourceError::NotFound(
                entity_id.unwrap_or("<unknown>").to_string(),
            )),
            status if !status.is_success() => Err(SourceError::Unavailable(format!(
                "host returned HTTP {}",
                status.as_u16()
            ))),
            _ => response
                .json::<T>()
                .await
                .map_err(|e| SourceError::Unavailable(format!("malformed host response: {e}"))),
        }
    }
}

#[async_trait::async_trait]
impl StateSource for RestStateSource {
    async fn current_state(&self, entity_id: &str) -> Result<RawState, SourceError> {
        let state: HostState = self
            .send(self.get(&format!("/api/states/{entity_id}")), Some(entity_id))
            .await?;
        Ok(state.into())
    }

    async fn history(
        &self,
        entity_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawState>, SourceError> {
        let start = from.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = to.to_rfc3339_opts(SecondsFormat::Secs, true);
        let request = self.get(&format!("/api/history/period/{start}")).query(&[
            ("filter_entity_id", entity_id),
            ("end_time", end.as_str()),
            ("minimal_response", ""),
            ("no_attributes", ""),
        ]);

        let series: Vec<Vec<HostState>> = self.send(request, Some(entity_id)).await?;
        let states: Vec<RawState> = series.into_iter().flatten().map(RawState::from).collect();
        debug!(entity = %entity_id, count = states.len(), "fetched history");
        Ok(states)
    }

    async fn list_entities(&self, filter: &EntityFilter) -> Result<BTreeSet<String>, SourceError> {
        let states: Vec<HostState> = self.send(self.get("/api/states"), None).await?;
        Ok(states
            .into_iter()
            .filter_map(|s| s.entity_id)
            .filter(|id| filter.matches(id))
            .collect())
    }
}
