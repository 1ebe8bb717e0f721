//! Admission middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{debug, info, instrument};

use crate::ratelimit::RateLimiter;

/// Header carrying the credential token.
pub const API_KEY_HEADER: &str = "API_KEY";

/// Body sent with every rejection.
pub const REJECTION_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Classify the request, ask the limiter, and either reject with 429 or pass
/// the request through untouched.
#[instrument(
    skip_all,
    fields(
        peer = %connect_info.0,
        path = %request.uri().path()
    )
)]
pub async fn admission_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    connect_info: ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let address = connect_info.0.ip().to_string();
    let token = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    let identity = limiter.classifier().classify(&address, token);

    debug!(
        kind = %identity.kind,
        limit = identity.limit,
        has_token = token.is_some(),
        "Received request"
    );

    if !limiter.check(&identity).await {
        info!(
            kind = %identity.kind,
            limit = identity.limit,
            "Request rejected"
        );
        return rejection();
    }

    next.run(request).await
}

/// The fixed response for a denied request.
pub fn rejection() -> Response {
    (StatusCode::TOO_MANY_REQUESTS, REJECTION_MESSAGE).into_response()
}

/// Put every route of `router` behind the admission check.
pub fn protect<S>(router: Router<S>, limiter: Arc<RateLimiter>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(limiter, admission_middleware))
}
