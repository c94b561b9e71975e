//! Payloads carried by the token pipeline.

use serde::{Deserialize, Serialize};

/// One token whose metadata changed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    pub token_id: String,
}

impl TokenPayload {
    pub fn new(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
        }
    }
}

/// Many tokens handed to a batch operation at once.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchTokenPayload {
    pub token_ids: Vec<String>,
}

/// Asks every independent source to re-fetch.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSignal {}

/// Aggregator for collectors that batch token updates.
pub fn collect_token_ids(events: Vec<TokenPayload>) -> eyre::Result<BatchTokenPayload> {
    Ok(BatchTokenPayload {
        token_ids: events.into_iter().map(|event| event.token_id).collect(),
    })
}
