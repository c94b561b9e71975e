//! Endpoints that seed a pipeline run.

use actix_web::{get, post, web, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    message::JobOptions,
    payloads::{RefreshSignal, TokenPayload},
    queue::Queue,
    utils::new_token_id,
};

const DEFAULT_CHAIN_ID: u64 = 1;

/// Entry queues the admin surface may publish to.
#[derive(Clone)]
pub struct Triggers {
    pub token_updates: Queue<TokenPayload>,
    pub refresh: Queue<RefreshSignal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTokenQuery {
    chain_id: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTokenResponse {
    pub msg: String,
    pub token_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub msg: String,
}

#[post("/add-token")]
async fn add_token(
    triggers: web::Data<Triggers>,
    query: web::Query<AddTokenQuery>,
) -> Result<HttpResponse, Error> {
    let token_id = new_token_id(query.chain_id.unwrap_or(DEFAULT_CHAIN_ID))?;

    triggers
        .token_updates
        .add(
            "TokenUpdated",
            &TokenPayload::new(&token_id),
            JobOptions::dedup(&token_id),
        )
        .await?;

    Ok(HttpResponse::Created().json(AddTokenResponse {
        msg: "Token added to the queue".to_owned(),
        token_id,
    }))
}

#[get("/refresh")]
async fn refresh(triggers: web::Data<Triggers>) -> Result<HttpResponse, Error> {
    triggers
        .refresh
        .add("RefreshSignal", &RefreshSignal::default(), JobOptions::default())
        .await?;

    Ok(HttpResponse::Created().json(RefreshResponse {
        msg: "Refresh requested".to_owned(),
    }))
}

/// Trigger routes live at the root, next to the `/queues` scope.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(add_token).service(refresh);
}
