use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    middleware,
    routing::{get, post, put},
    Router,
};
use tracing::{info, instrument, warn};
use validator::Validate;

use super::{
    dto::{
        BulkUnsubscribeRequest, BulkUnsubscribeResponse, ConfirmResponse, DeliveryWebhook,
        EmailStatsResponse, StatusResponse, SubscribeRequest, SubscribeResponse,
        SubscriptionView, UnsubscribeRequest, UnsubscribeResponse, UpdatePreferencesRequest,
    },
    repo_types::EmailSubscription,
    services::{self, ClientInfo},
};
use crate::{
    auth::{
        dto::MessageResponse, extractors::CurrentUser, repo_types::Role,
        services::normalize_email,
    },
    error::{AppError, AppResult},
    extract::Json,
    notifications::repo_types::CourseNotification,
    rate_limit::{self, Limits},
    state::AppState,
};

pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

// --- public routers ---

pub fn public_routes(limits: &Limits) -> Router<AppState> {
    let subscribe = Router::new()
        .route("/emails/subscribe", post(subscribe))
        .route_layer(middleware::from_fn_with_state(
            limits.subscribe.clone(),
            rate_limit::limit,
        ));
    Router::new()
        .merge(subscribe)
        .route("/emails/confirm/:token", get(confirm))
        .route("/emails/unsubscribe", post(unsubscribe))
        .route("/emails/status/:email", get(status))
        .route("/emails/preferences", put(update_preferences))
        .route("/emails/webhooks/delivery", post(delivery_webhook))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/emails/bulk-unsubscribe", post(bulk_unsubscribe))
        .route("/admin/emails/stats", get(stats))
}

// --- helpers ---

fn client_info(headers: &HeaderMap, peer: Option<SocketAddr>, trusted: &[IpAddr]) -> ClientInfo {
    ClientInfo {
        ip_address: rate_limit::client_ip(headers, peer.map(|p| p.ip()), trusted)
            .map(|ip| ip.to_string()),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.chars().take(500).collect()),
    }
}

fn webhook_authorized(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let given = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    matches!((expected, given), (Some(e), Some(g)) if !e.is_empty() && e == g)
}

// --- handlers ---

#[instrument(skip(state, headers, peer, payload))]
pub async fn subscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(payload): Json<SubscribeRequest>,
) -> AppResult<(StatusCode, Json<SubscribeResponse>)> {
    payload.validate()?;
    let client = client_info(
        &headers,
        peer.map(|ConnectInfo(addr)| addr),
        &state.config.rate_limit.trusted_proxies,
    );
    let (res, created) = services::subscribe(&state, payload, client).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(res)))
}

#[instrument(skip(state, token))]
pub async fn confirm(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> AppResult<Json<ConfirmResponse>> {
    let sub = services::confirm(&state, &token).await?;
    Ok(Json(ConfirmResponse {
        success: true,
        message: "Email confirmed successfully! Welcome to our community.".into(),
        email: sub.email,
        confirmed_at: sub.confirmed_at,
    }))
}

#[instrument(skip(state, payload))]
pub async fn unsubscribe(
    State(state): State<AppState>,
    Json(payload): Json<UnsubscribeRequest>,
) -> AppResult<Json<UnsubscribeResponse>> {
    let sub = services::unsubscribe(&state, payload).await?;
    Ok(Json(UnsubscribeResponse {
        success: true,
        message: "Successfully unsubscribed from emails".into(),
        email: sub.email,
        unsubscribe_date: sub.unsubscribed_at,
    }))
}

#[instrument(skip(state, email))]
pub async fn status(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> AppResult<Json<StatusResponse>> {
    let email = normalize_email(&email);
    let subscription = EmailSubscription::find_by_email(&state.db, &email).await?;
    let notifications = CourseNotification::list_for_email(&state.db, &email).await?;
    Ok(Json(StatusResponse {
        subscription: subscription.map(SubscriptionView::from),
        course_notifications: notifications.into_iter().map(Into::into).collect(),
    }))
}

#[instrument(skip(state, payload))]
pub async fn update_preferences(
    State(state): State<AppState>,
    Json(payload): Json<UpdatePreferencesRequest>,
) -> AppResult<Json<SubscriptionView>> {
    payload.validate()?;
    let sub = services::update_preferences(&state, payload).await?;
    Ok(Json(sub.into()))
}

#[instrument(skip(state, headers, payload))]
pub async fn delivery_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DeliveryWebhook>,
) -> AppResult<Json<MessageResponse>> {
    if !webhook_authorized(state.config.webhook_secret.as_deref(), &headers) {
        warn!("delivery webhook with a bad or missing secret");
        return Err(AppError::Unauthorized("Invalid webhook secret".into()));
    }
    payload.validate()?;
    let email = normalize_email(&payload.email);
    let sub = EmailSubscription::set_delivery_status(&state.db, &email, payload.event.status())
        .await?
        .ok_or_else(|| AppError::NotFound("Subscription not found".into()))?;
    info!(subscription_id = %sub.id, status = ?sub.status, "delivery feedback applied");
    Ok(Json(MessageResponse::ok("Delivery event recorded")))
}

#[instrument(skip(state, admin, payload))]
pub async fn bulk_unsubscribe(
    State(state): State<AppState>,
    admin: CurrentUser,
    Json(payload): Json<BulkUnsubscribeRequest>,
) -> AppResult<Json<BulkUnsubscribeResponse>> {
    admin.require_role(&[Role::Admin])?;
    payload.validate()?;
    let res = services::bulk_unsubscribe(&state, &payload.emails, payload.reason.as_deref()).await?;
    Ok(Json(res))
}

#[instrument(skip(state, admin))]
pub async fn stats(
    State(state): State<AppState>,
    admin: CurrentUser,
) -> AppResult<Json<EmailStatsResponse>> {
    admin.require_role(&[Role::Admin])?;
    Ok(Json(services::stats(&state).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use tower::ServiceExt;

    fn app() -> Router {
        let state = AppState::fake();
        Router::new()
            .merge(public_routes(&state.limits))
            .merge(admin_routes())
            .with_state(state)
    }

    fn json_request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn webhook_secret_must_match() {
        let mut headers = HeaderMap::new();
        assert!(!webhook_authorized(Some("s3cret"), &headers));
        headers.insert(WEBHOOK_SECRET_HEADER, HeaderValue::from_static("nope"));
        assert!(!webhook_authorized(Some("s3cret"), &headers));
        headers.insert(WEBHOOK_SECRET_HEADER, HeaderValue::from_static("s3cret"));
        assert!(webhook_authorized(Some("s3cret"), &headers));
        assert!(!webhook_authorized(None, &headers));
    }

    #[test]
    fn client_info_trusts_forwarded_address_only_from_proxies() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.2"));
        headers.insert(USER_AGENT, HeaderValue::from_static("curl/8"));
        let peer: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let proxies: Vec<IpAddr> = vec!["127.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];

        let info = client_info(&headers, Some(peer), &proxies);
        assert_eq!(info.ip_address.as_deref(), Some("203.0.113.9"));
        assert_eq!(info.user_agent.as_deref(), Some("curl/8"));

        let direct = client_info(&headers, Some(peer), &[]);
        assert_eq!(direct.ip_address.as_deref(), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn subscribe_validates_before_touching_the_store() {
        let res = app()
            .oneshot(json_request(
                "POST",
                "/emails/subscribe",
                r#"{"email":"not-an-email","firstName":""}"#,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_without_secret_is_unauthorized() {
        let res = app()
            .oneshot(json_request(
                "POST",
                "/emails/webhooks/delivery",
                r#"{"email":"a@b.co","event":"bounce"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unsubscribe_needs_token_or_email() {
        let res = app()
            .oneshot(json_request("POST", "/emails/unsubscribe", r#"{"reason":"bye"}"#))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stats_require_admin_token() {
        let res = app()
            .oneshot(Request::get("/admin/emails/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}
