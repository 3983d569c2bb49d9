use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    routing::{get, post, put},
    Router,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::{
    dto::{
        CourseResponse, CreateCourseRequest, DeleteCourseResponse, ListQuery,
        RecomputeRatingResponse, UpdateCourseRequest,
    },
    rating,
    repo::CourseChanges,
    repo_types::{Course, CourseStatus, NewCourse},
    services::{assign_lecture_ids, check_catalog_fields, slug_candidate, slugify},
};
use crate::{
    auth::{
        extractors::{CurrentUser, OptionalAuthUser},
        repo_types::{Role, User},
    },
    db::{is_unique_violation, Page},
    error::{AppError, AppResult, FieldError},
    extract::Json,
    state::AppState,
};

const SLUG_CONSTRAINT: &str = "courses_slug_key";
const SLUG_ATTEMPTS: u32 = 50;

// --- public routers ---

pub fn read_routes() -> Router<AppState> {
    Router::new()
        .route("/courses", get(list_courses))
        .route("/courses/:id", get(get_course))
}

pub fn write_routes() -> Router<AppState> {
    Router::new()
        .route("/courses", post(create_course))
        .route("/courses/:id", put(update_course).delete(delete_course))
        .route("/admin/courses/:id/recompute-rating", post(recompute_rating))
}

// --- helpers ---

async fn free_slug(state: &AppState, title: &str, exclude: Option<Uuid>) -> AppResult<String> {
    let base = slugify(title);
    for attempt in 1..=SLUG_ATTEMPTS {
        let candidate = slug_candidate(&base, attempt);
        if !Course::slug_taken(&state.db, &candidate, exclude).await? {
            return Ok(candidate);
        }
    }
    Ok(format!("{base}-{}", &Uuid::new_v4().simple().to_string()[..8]))
}

fn can_manage(user: &CurrentUser, course: &Course) -> bool {
    user.is_admin() || course.instructor_id == user.0.id
}

async fn owned_course(state: &AppState, user: &CurrentUser, id: Uuid) -> AppResult<Course> {
    let course = Course::find_by_id(&state.db, id)
        .await?
        .ok_or_else(|| AppError::NotFound("Course not found".into()))?;
    if !can_manage(user, &course) {
        warn!(user_id = %user.0.id, course_id = %id, "not the course owner");
        return Err(AppError::Forbidden("Not authorized to manage this course".into()));
    }
    Ok(course)
}

// --- handlers ---

#[instrument(skip(state))]
pub async fn list_courses(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> AppResult<Json<Vec<CourseResponse>>> {
    let page = Page {
        limit: q.limit,
        offset: q.offset,
    };
    let courses = Course::list_published(
        &state.db,
        q.category.as_deref(),
        q.level.as_deref(),
        page.limit(),
        page.offset(),
    )
    .await?;
    Ok(Json(courses.into_iter().map(CourseResponse::from).collect()))
}

#[instrument(skip(state, viewer))]
pub async fn get_course(
    State(state): State<AppState>,
    viewer: OptionalAuthUser,
    Path(id_or_slug): Path<String>,
) -> AppResult<Json<CourseResponse>> {
    let course = match Uuid::parse_str(&id_or_slug) {
        Ok(id) => Course::find_by_id(&state.db, id).await?,
        Err(_) => Course::find_by_slug(&state.db, &id_or_slug).await?,
    }
    .ok_or_else(|| AppError::NotFound("Course not found".into()))?;

    // drafts are only visible to their instructor and admins
    if course.status == CourseStatus::Draft {
        let visible = match viewer.0 {
            Some(uid) if uid == course.instructor_id => true,
            Some(uid) => User::find_by_id(&state.db, uid)
                .await?
                .map_or(false, |u| u.role == Role::Admin),
            None => false,
        };
        if !visible {
            return Err(AppError::NotFound("Course not found".into()));
        }
    }
    Ok(Json(CourseResponse::from(course)))
}

#[instrument(skip(state, user, payload))]
pub async fn create_course(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(payload): Json<CreateCourseRequest>,
) -> AppResult<(StatusCode, HeaderMap, Json<CourseResponse>)> {
    user.require_role(&[Role::Instructor, Role::Admin])?;
    payload.validate()?;
    let field_errors = check_catalog_fields(
        Some(&payload.category),
        Some(&payload.level),
        Some(payload.price.current),
        payload.price.original,
    );
    if !field_errors.is_empty() {
        return Err(AppError::Validation(field_errors));
    }

    let new = NewCourse {
        title: payload.title.trim().to_string(),
        description: payload.description,
        short_description: payload.short_description,
        instructor_id: user.0.id,
        category: payload.category,
        level: payload.level,
        price_current: payload.price.current,
        price_original: payload.price.original,
        currency: payload.price.currency,
        is_free: payload.is_free,
        curriculum: assign_lecture_ids(payload.curriculum),
        certificate_offered: payload.certificate_offered.unwrap_or(true),
        status: payload.status.unwrap_or(CourseStatus::Draft),
        launch_date: payload.launch_date,
        max_enrollment: payload.max_enrollment,
    };

    // a concurrent insert can still take the slug between lookup and insert
    let mut attempts = 0;
    let course = loop {
        attempts += 1;
        let slug = free_slug(&state, &new.title, None).await?;
        match Course::insert(&state.db, &slug, &new).await {
            Ok(c) => break c,
            Err(e) if attempts < 3 && is_unique_violation(&e, Some(SLUG_CONSTRAINT)) => {
                warn!(%slug, "slug taken concurrently, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    };

    info!(course_id = %course.id, slug = %course.slug, instructor_id = %user.0.id, "course created");
    let mut headers = HeaderMap::new();
    if let Ok(location) = HeaderValue::from_str(&format!("/api/v1/courses/{}", course.id)) {
        headers.insert(header::LOCATION, location);
    }
    Ok((StatusCode::CREATED, headers, Json(CourseResponse::from(course))))
}

#[instrument(skip(state, user, payload))]
pub async fn update_course(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateCourseRequest>,
) -> AppResult<Json<CourseResponse>> {
    payload.validate()?;
    let mut field_errors = check_catalog_fields(
        payload.category.as_deref(),
        payload.level.as_deref(),
        payload.price.as_ref().map(|p| p.current),
        payload.price.as_ref().and_then(|p| p.original),
    );
    if matches!(payload.max_enrollment, Some(Some(n)) if n < 1) {
        field_errors.push(FieldError::new("maxEnrollment", "Max enrollment must be positive"));
    }
    if !field_errors.is_empty() {
        return Err(AppError::Validation(field_errors));
    }
    let course = owned_course(&state, &user, id).await?;

    let title = payload.title.map(|t| t.trim().to_string());
    let slug = match &title {
        Some(t) if *t != course.title => Some(free_slug(&state, t, Some(id)).await?),
        _ => None,
    };
    let (price_current, price_original, currency) = match payload.price {
        // omitting `original` clears it
        Some(p) => (Some(p.current), Some(p.original), Some(p.currency)),
        None => (None, None, None),
    };
    let changes = CourseChanges {
        title,
        slug,
        description: payload.description,
        short_description: payload.short_description,
        category: payload.category,
        level: payload.level,
        price_current,
        price_original,
        currency,
        is_free: payload.is_free,
        curriculum: payload.curriculum.map(assign_lecture_ids),
        certificate_offered: payload.certificate_offered,
        status: payload.status,
        launch_date: payload.launch_date,
        max_enrollment: payload.max_enrollment,
    };

    let updated = Course::update(&state.db, id, &changes).await.map_err(|e| {
        if is_unique_violation(&e, Some(SLUG_CONSTRAINT)) {
            AppError::Conflict("A course with a similar title was just created, retry".into())
        } else {
            e.into()
        }
    })?;
    info!(course_id = %id, slug = %updated.slug, "course updated");
    Ok(Json(CourseResponse::from(updated)))
}

#[instrument(skip(state, user))]
pub async fn delete_course(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<DeleteCourseResponse>> {
    owned_course(&state, &user, id).await?;

    let mut tx = state.db.begin().await?;
    Course::find_for_update(&mut *tx, id)
        .await?
        .ok_or_else(|| AppError::NotFound("Course not found".into()))?;
    let enrolled = Course::count_enrollments(&mut *tx, id).await?;
    let archived = enrolled > 0;
    if archived {
        Course::archive(&mut *tx, id).await?;
    } else {
        Course::delete(&mut *tx, id).await?;
    }
    tx.commit().await?;

    info!(course_id = %id, archived, enrolled, "course removed");
    Ok(Json(DeleteCourseResponse {
        success: true,
        archived,
    }))
}

#[instrument(skip(state, admin))]
pub async fn recompute_rating(
    State(state): State<AppState>,
    admin: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<RecomputeRatingResponse>> {
    admin.require_role(&[Role::Admin])?;
    let mut tx = state.db.begin().await?;
    if !rating::lock_course(&mut *tx, id).await? {
        return Err(AppError::NotFound("Course not found".into()));
    }
    let aggregate = rating::recompute(&mut *tx, id).await?;
    tx.commit().await?;
    Ok(Json(RecomputeRatingResponse {
        course_id: id,
        rating: aggregate,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .merge(read_routes())
            .merge(write_routes())
            .with_state(AppState::fake())
    }

    #[tokio::test]
    async fn create_requires_authentication() {
        let res = app()
            .oneshot(
                Request::post("/courses")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn recompute_requires_authentication() {
        let res = app()
            .oneshot(
                Request::post(format!("/admin/courses/{}/recompute-rating", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}
