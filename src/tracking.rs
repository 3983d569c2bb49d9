use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use crate::{
    mailer::tracking::{self, TrackingId, PIXEL_GIF},
    notifications::services::{self as notifications, TrackedEvent},
    state::AppState,
    subscriptions::repo_types::EmailSubscription,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/emails/track/open/:tracking_id", get(track_open))
        .route("/emails/track/click/:tracking_id", get(track_click))
}

#[derive(Debug, Deserialize)]
pub struct ClickQuery {
    pub url: Option<String>,
}

fn pixel_response() -> Response {
    let mut res = PIXEL_GIF.to_vec().into_response();
    let headers = res.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/gif"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    res
}

/// `url` when it points into the client app, else the client root.
pub fn redirect_target(client_url: &str, url: Option<&str>) -> String {
    let base = client_url.trim_end_matches('/');
    match url {
        Some(u)
            if u == base
                || u
                    .strip_prefix(base)
                    .is_some_and(|rest| rest.starts_with(['/', '?', '#'])) =>
        {
            u.to_string()
        }
        _ => client_url.to_string(),
    }
}

async fn record(state: &AppState, id: &TrackingId, event: TrackedEvent) {
    let now = OffsetDateTime::now_utc();
    let counted = match &event {
        TrackedEvent::Open => EmailSubscription::record_open(&state.db, &id.email).await,
        TrackedEvent::Click(_) => EmailSubscription::record_click(&state.db, &id.email).await,
    };
    if let Err(e) = counted {
        warn!(error = %e, kind = %id.kind, "failed to record email engagement");
    }
    if let Some(notification_id) = id.notification_id {
        if let Err(e) = notifications::track(state, notification_id, event, now).await {
            warn!(error = %e, %notification_id, "failed to record notification engagement");
        }
    }
}

#[instrument(skip(state, tracking_id))]
pub async fn track_open(State(state): State<AppState>, Path(tracking_id): Path<String>) -> Response {
    match tracking::decode(&tracking_id) {
        Some(id) => record(&state, &id, TrackedEvent::Open).await,
        None => debug!("undecodable tracking id"),
    }
    pixel_response()
}

#[instrument(skip(state, tracking_id, q))]
pub async fn track_click(
    State(state): State<AppState>,
    Path(tracking_id): Path<String>,
    Query(q): Query<ClickQuery>,
) -> Redirect {
    let target = redirect_target(&state.config.client_url, q.url.as_deref());
    match tracking::decode(&tracking_id) {
        Some(id) => record(&state, &id, TrackedEvent::Click(Some(target.clone()))).await,
        None => debug!("undecodable tracking id"),
    }
    Redirect::to(&target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use uuid::Uuid;

    fn app() -> Router {
        router().with_state(AppState::fake())
    }

    #[test]
    fn only_client_urls_are_followed() {
        let client = "http://localhost:3000";
        assert_eq!(
            redirect_target(client, Some("http://localhost:3000/courses/1")),
            "http://localhost:3000/courses/1"
        );
        assert_eq!(redirect_target(client, Some("http://localhost:3000")), client);
        assert_eq!(redirect_target(client, Some("https://evil.example/phish")), client);
        assert_eq!(redirect_target(client, Some("http://localhost:3000.evil.example")), client);
        assert_eq!(redirect_target(client, None), client);
    }

    #[tokio::test]
    async fn open_pixel_survives_an_unreachable_store() {
        let id = tracking::encode("ada@example.com", "welcome", Some(Uuid::new_v4()));
        let res = app()
            .oneshot(
                Request::get(format!("/emails/track/open/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "image/gif");
        assert_eq!(
            res.headers()[header::CACHE_CONTROL],
            "no-cache, no-store, must-revalidate"
        );
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), &PIXEL_GIF[..]);
    }

    #[tokio::test]
    async fn garbage_ids_still_get_a_pixel() {
        let res = app()
            .oneshot(Request::get("/emails/track/open/%25%25").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn click_redirects_off_site_urls_home() {
        let res = app()
            .oneshot(
                Request::get("/emails/track/click/zzz?url=https%3A%2F%2Fevil.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(res.status().is_redirection());
        assert_eq!(res.headers()[header::LOCATION], "http://localhost:3000");
    }
}
