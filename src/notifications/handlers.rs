use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Router,
};
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

use super::{
    dto::{
        DispatchReport, NotificationResponse, NotifySubscribeRequest, NotifySubscribeResponse,
        NotifyUnsubscribeRequest, ScheduleRequest,
    },
    repo_types::CourseNotification,
    services,
};
use crate::{
    auth::{dto::MessageResponse, extractors::CurrentUser, repo_types::Role},
    error::AppResult,
    extract::Json,
    rate_limit::{self, Limits},
    state::AppState,
};

// --- public routers ---

pub fn public_routes(limits: &Limits) -> Router<AppState> {
    let subscribe = Router::new()
        .route("/emails/course-notifications", post(subscribe))
        .route_layer(middleware::from_fn_with_state(
            limits.subscribe.clone(),
            rate_limit::limit,
        ));
    Router::new()
        .merge(subscribe)
        .route("/emails/course-notifications/unsubscribe", post(unsubscribe))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/course-notifications/ready", get(list_ready))
        .route("/admin/course-notifications/dispatch", post(dispatch))
        .route("/admin/course-notifications/:id/schedule", post(schedule))
}

// --- handlers ---

#[instrument(skip(state, payload), fields(course_id = %payload.course_id))]
pub async fn subscribe(
    State(state): State<AppState>,
    Json(payload): Json<NotifySubscribeRequest>,
) -> AppResult<(StatusCode, Json<NotifySubscribeResponse>)> {
    payload.validate()?;
    let (res, created) = services::subscribe(&state, payload).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(res)))
}

#[instrument(skip(state, payload))]
pub async fn unsubscribe(
    State(state): State<AppState>,
    Json(payload): Json<NotifyUnsubscribeRequest>,
) -> AppResult<Json<MessageResponse>> {
    services::unsubscribe(&state, payload).await?;
    Ok(Json(MessageResponse::ok(
        "Successfully unsubscribed from course notifications",
    )))
}

#[instrument(skip(state, admin, payload))]
pub async fn schedule(
    State(state): State<AppState>,
    admin: CurrentUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ScheduleRequest>,
) -> AppResult<(StatusCode, Json<NotificationResponse>)> {
    admin.require_role(&[Role::Admin])?;
    payload.validate()?;
    let n = services::schedule(&state, id, payload).await?;
    Ok((StatusCode::CREATED, Json(n.into())))
}

#[instrument(skip(state, admin))]
pub async fn list_ready(
    State(state): State<AppState>,
    admin: CurrentUser,
) -> AppResult<Json<Vec<NotificationResponse>>> {
    admin.require_role(&[Role::Admin])?;
    let ready = CourseNotification::list_ready(&state.db, OffsetDateTime::now_utc()).await?;
    Ok(Json(ready.into_iter().map(Into::into).collect()))
}

#[instrument(skip(state, admin))]
pub async fn dispatch(
    State(state): State<AppState>,
    admin: CurrentUser,
) -> AppResult<Json<DispatchReport>> {
    admin.require_role(&[Role::Admin])?;
    let report = services::dispatch(&state, OffsetDateTime::now_utc()).await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let state = AppState::fake();
        Router::new()
            .merge(public_routes(&state.limits))
            .merge(admin_routes())
            .with_state(state)
    }

    async fn post_json(uri: &str, body: &str) -> axum::response::Response {
        app()
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn subscribe_rejects_bad_email() {
        let body = format!(r#"{{"email":"nope","courseId":"{}"}}"#, Uuid::new_v4());
        let res = post_json("/emails/course-notifications", &body).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unsubscribe_needs_token_or_pair() {
        let res = post_json(
            "/emails/course-notifications/unsubscribe",
            r#"{"email":"ada@example.com"}"#,
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_routes_require_authentication() {
        let res = post_json("/admin/course-notifications/dispatch", "").await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app()
            .oneshot(
                Request::get("/admin/course-notifications/ready")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}
