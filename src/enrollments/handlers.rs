use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use time::OffsetDateTime;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use super::{
    dto::{
        BookmarkRequest, BookmarksResponse, CertificateResponse, EnrollRequest, EnrollResponse,
        EnrollmentResponse, EnrollmentStats, MyCoursesQuery, NoteRequest, NotesResponse,
        ProgressRequest, ProgressResponse, ReviewRequest, ReviewResponse, StatsQuery,
        StatusChangeResponse, StatusCountView,
    },
    repo_types::{Enrollment, EnrollmentStatus, Note},
    services,
};
use crate::{
    auth::{
        dto::MessageResponse,
        extractors::{AuthUser, CurrentUser, OptionalAuthUser},
        repo_types::Role,
    },
    courses::repo_types::Course,
    db::Page,
    error::{AppError, AppResult},
    extract::Json,
    rate_limit::{self, Limits},
    state::AppState,
};

// --- public routers ---

pub fn student_routes(limits: &Limits) -> Router<AppState> {
    let enroll = Router::new()
        .route("/enrollments/enroll", post(enroll))
        .route_layer(middleware::from_fn_with_state(
            limits.enroll.clone(),
            rate_limit::limit,
        ));
    Router::new()
        .merge(enroll)
        .route("/enrollments/my-courses", get(my_courses))
        .route("/enrollments/:id", get(get_enrollment))
        .route("/enrollments/:id/progress", put(update_progress))
        .route("/enrollments/:id/notes", post(add_note))
        .route("/enrollments/:id/bookmarks", post(add_bookmark))
        .route("/enrollments/:id/review", post(submit_review))
        .route("/enrollments/:id/certificate", post(request_certificate))
        .route("/enrollments/:id/drop", post(drop_enrollment))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/enrollments/stats", get(stats))
        .route("/admin/enrollments/:id/suspend", post(suspend_enrollment))
        .route("/admin/enrollments/:id", delete(remove_enrollment))
}

// --- handlers ---

#[instrument(skip(state, caller, payload), fields(course_id = %payload.course_id))]
pub async fn enroll(
    State(state): State<AppState>,
    caller: OptionalAuthUser,
    Json(payload): Json<EnrollRequest>,
) -> AppResult<(StatusCode, Json<EnrollResponse>)> {
    payload.validate()?;
    let (response, created) = services::enroll(&state, caller.0, payload).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

#[instrument(skip(state))]
pub async fn my_courses(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(q): Query<MyCoursesQuery>,
) -> AppResult<Json<Vec<EnrollmentResponse>>> {
    let page = Page {
        limit: q.limit,
        offset: q.offset,
    };
    let enrollments =
        Enrollment::list_for_student(&state.db, user_id, q.status, page.limit(), page.offset())
            .await?;

    let mut courses: HashMap<Uuid, Course> = HashMap::new();
    for e in &enrollments {
        if !courses.contains_key(&e.course_id) {
            if let Some(c) = Course::find_by_id(&state.db, e.course_id).await? {
                courses.insert(c.id, c);
            }
        }
    }
    let now = OffsetDateTime::now_utc();
    let items = enrollments
        .into_iter()
        .map(|e| {
            let course = courses.get(&e.course_id);
            EnrollmentResponse::build(e, course, now)
        })
        .collect();
    Ok(Json(items))
}

#[instrument(skip(state))]
pub async fn get_enrollment(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<EnrollmentResponse>> {
    let enrollment = Enrollment::find_owned(&state.db, id, user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Enrollment not found".into()))?;
    let course = Course::find_by_id(&state.db, enrollment.course_id).await?;
    Ok(Json(EnrollmentResponse::build(
        enrollment,
        course.as_ref(),
        OffsetDateTime::now_utc(),
    )))
}

#[instrument(skip(state, payload))]
pub async fn update_progress(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ProgressRequest>,
) -> AppResult<Json<ProgressResponse>> {
    payload.validate()?;
    let res = services::update_progress(&state, user_id, id, &payload).await?;
    Ok(Json(res))
}

#[instrument(skip(state, payload))]
pub async fn add_note(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<NoteRequest>,
) -> AppResult<(StatusCode, Json<NotesResponse>)> {
    payload.validate()?;
    let note = Note {
        id: Uuid::new_v4(),
        lecture: payload.lecture,
        content: payload.content,
        timestamp: payload.timestamp,
        created_at: OffsetDateTime::now_utc(),
    };
    let notes = Enrollment::append_note(&state.db, id, user_id, note)
        .await?
        .ok_or_else(|| AppError::NotFound("Enrollment not found".into()))?;
    info!(enrollment_id = %id, "note added");
    Ok((StatusCode::CREATED, Json(NotesResponse { notes })))
}

#[instrument(skip(state, payload))]
pub async fn add_bookmark(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<BookmarkRequest>,
) -> AppResult<(StatusCode, Json<BookmarksResponse>)> {
    payload.validate()?;
    let res = services::add_bookmark(
        &state,
        user_id,
        id,
        payload.lecture,
        payload.timestamp,
        payload.title,
    )
    .await?;
    info!(enrollment_id = %id, "bookmark added");
    Ok((StatusCode::CREATED, Json(res)))
}

#[instrument(skip(state, payload))]
pub async fn submit_review(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReviewRequest>,
) -> AppResult<Json<ReviewResponse>> {
    payload.validate()?;
    let review = payload.review.as_deref().map(str::trim).filter(|r| !r.is_empty());
    let res = services::submit_review(&state, user_id, id, payload.rating, review).await?;
    Ok(Json(res))
}

#[instrument(skip(state))]
pub async fn request_certificate(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<CertificateResponse>> {
    let res = services::request_certificate(&state, user_id, id).await?;
    Ok(Json(res))
}

#[instrument(skip(state))]
pub async fn drop_enrollment(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<StatusChangeResponse>> {
    let e = services::change_status(&state, id, Some(user_id), EnrollmentStatus::Dropped).await?;
    Ok(Json(StatusChangeResponse {
        enrollment_id: e.id,
        status: e.status,
    }))
}

#[instrument(skip(state, admin))]
pub async fn suspend_enrollment(
    State(state): State<AppState>,
    admin: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<StatusChangeResponse>> {
    admin.require_role(&[Role::Admin])?;
    let e = services::change_status(&state, id, None, EnrollmentStatus::Suspended).await?;
    Ok(Json(StatusChangeResponse {
        enrollment_id: e.id,
        status: e.status,
    }))
}

#[instrument(skip(state, admin))]
pub async fn remove_enrollment(
    State(state): State<AppState>,
    admin: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    admin.require_role(&[Role::Admin])?;
    services::remove(&state, id).await?;
    Ok(Json(MessageResponse::ok("Enrollment removed")))
}

#[instrument(skip(state, admin))]
pub async fn stats(
    State(state): State<AppState>,
    admin: CurrentUser,
    Query(q): Query<StatsQuery>,
) -> AppResult<Json<EnrollmentStats>> {
    admin.require_role(&[Role::Admin])?;
    let by_status = Enrollment::count_by_status(&state.db, q.course_id).await?;
    let average_completion = Enrollment::average_completion(&state.db, q.course_id).await?;
    let total = by_status.iter().map(|s| s.count).sum();
    Ok(Json(EnrollmentStats {
        total,
        by_status: by_status.into_iter().map(StatusCountView::from).collect(),
        average_completion: (average_completion * 10.0).round() / 10.0,
    }))
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
            .merge(student_routes(&state.limits))
            .merge(admin_routes())
            .with_state(state)
    }

    async fn post_json(uri: &str, body: &str, token: Option<&str>) -> axum::response::Response {
        let mut req = Request::post(uri).header("content-type", "application/json");
        if let Some(t) = token {
            req = req.header("authorization", format!("Bearer {t}"));
        }
        app().oneshot(req.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap()
    }

    async fn json_body(res: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn token() -> String {
        use crate::auth::dto::JwtKeys;
        use axum::extract::FromRef;
        JwtKeys::from_ref(&AppState::fake()).sign_access(Uuid::new_v4()).unwrap()
    }

    #[tokio::test]
    async fn enroll_rejects_bad_email_and_long_coupon() {
        let body = format!(
            r#"{{"email":"nope","courseId":"{}","couponCode":"{}"}}"#,
            Uuid::new_v4(),
            "X".repeat(51)
        );
        let res = post_json("/enrollments/enroll", &body, None).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let json = json_body(res).await;
        let fields: Vec<&str> = json["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["field"].as_str().unwrap())
            .collect();
        assert_eq!(fields, ["couponCode", "email"]);
    }

    #[tokio::test]
    async fn review_out_of_range_is_a_validation_error() {
        let uri = format!("/enrollments/{}/review", Uuid::new_v4());
        let res = post_json(&uri, r#"{"rating":6}"#, Some(&token())).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let json = json_body(res).await;
        assert_eq!(json["errors"][0]["message"], "Rating must be between 1 and 5");
    }

    #[tokio::test]
    async fn fractional_rating_is_rejected_in_the_error_shape() {
        let uri = format!("/enrollments/{}/review", Uuid::new_v4());
        let res = post_json(&uri, r#"{"rating":4.5}"#, Some(&token())).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            res.headers().get("content-type").unwrap(),
            "application/json"
        );
        let json = json_body(res).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "VALIDATION_FAILED");
        assert_eq!(json["errors"][0]["field"], "rating");
    }

    #[tokio::test]
    async fn enroll_with_malformed_course_id_names_the_field() {
        let res = post_json("/enrollments/enroll", r#"{"courseId":"nope","email":"a@b.co"}"#, None).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let json = json_body(res).await;
        assert_eq!(json["errors"][0]["field"], "courseId");
    }

    #[tokio::test]
    async fn progress_requires_authentication() {
        let uri = format!("/enrollments/{}/progress", Uuid::new_v4());
        let res = app()
            .oneshot(
                Request::put(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"lectureId":"a"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn certificate_requires_authentication() {
        let uri = format!("/enrollments/{}/certificate", Uuid::new_v4());
        let res = post_json(&uri, "", None).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}
