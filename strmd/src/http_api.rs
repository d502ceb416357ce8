use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use strm_core::{RemoteId, ShareRef};
use tokio_util::sync::CancellationToken;

use crate::redirect::{RedirectError, RedirectResolver};

#[derive(Clone)]
pub struct ApiState {
    pub resolver: Arc<RedirectResolver>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RedirectQuery {
    #[serde(default)]
    pub pickcode: Option<String>,
    #[serde(default)]
    pub share_code: Option<String>,
    #[serde(default)]
    pub receive_code: Option<String>,
    #[serde(default)]
    pub id: Option<RemoteId>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/redirect", get(redirect_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serves until `stop` is cancelled.
pub async fn serve(
    listen: SocketAddr,
    state: ApiState,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding redirect endpoint on {listen}"))?;
    tracing::info!(%listen, "redirect endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .context("redirect endpoint failed")
}

async fn healthz() -> &'static str {
    "ok"
}

/// Players follow the 302. Errors come back as plain text with a 200 so
/// the player shows the message instead of a generic failure.
#[tracing::instrument(skip(state, headers))]
async fn redirect_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<RedirectQuery>,
) -> Response {
    let identity = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let resolved = match query {
        RedirectQuery {
            pickcode: Some(pickcode),
            ..
        } => state.resolver.get_url(&pickcode, identity).await,
        RedirectQuery {
            share_code: Some(share_code),
            receive_code: Some(receive_code),
            id: Some(file_id),
            ..
        } => {
            let share = ShareRef {
                share_code,
                receive_code,
                file_id,
            };
            state.resolver.get_share_url(&share, identity).await
        }
        _ => Err(RedirectError::InvalidShare),
    };

    match resolved {
        Ok(url) => (StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "redirect failed");
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                err.to_string(),
            )
                .into_response()
        }
    }
}
