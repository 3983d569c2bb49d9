use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::dto::{
    BookmarksResponse, CertificateResponse, EnrollRequest, EnrollResponse, ProgressRequest,
    ProgressResponse, ProgressView, ReviewResponse,
};
use super::lifecycle::{
    apply_progress, check_enrollable, issue_certificate, manual_transition, payment_snapshot,
    ProgressUpdate,
};
use super::repo_types::{
    Bookmark, Enrollment, EnrollmentStatus, NewEnrollment, PaymentMethod, PaymentStatus,
};
use crate::{
    auth::{
        repo_types::{NewUser, Role, User},
        services::{normalize_email, placeholder_password_hash},
    },
    courses::{rating, repo_types::Course, services::total_lectures},
    error::{AppError, AppResult},
    mailer,
    notifications::repo_types::CourseNotification,
    state::AppState,
};

pub fn access_url(client_url: &str, course_id: Uuid) -> String {
    format!("{client_url}/courses/{course_id}/learn")
}

/// Existing account for `email`, or a new student with a credential nobody knows.
async fn find_or_create_student(
    conn: &mut sqlx::PgConnection,
    email: &str,
    first_name: Option<&str>,
    last_name: Option<&str>,
) -> AppResult<User> {
    if let Some(user) = User::find_by_email(&mut *conn, email).await? {
        return Ok(user);
    }
    let hash = placeholder_password_hash()?;
    let created = User::insert_if_absent(
        &mut *conn,
        &NewUser {
            email,
            password_hash: &hash,
            first_name,
            last_name,
            role: Role::Student,
            verification_token_hash: None,
            verification_expires_at: None,
        },
    )
    .await?;
    match created {
        Some(user) => {
            info!(user_id = %user.id, "student account created by enrollment");
            Ok(user)
        }
        // lost a race with a concurrent signup for the same email
        None => User::find_by_email(&mut *conn, email)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("user vanished after conflict"))),
    }
}

/// Creates the enrollment, bumps the course counter and converts a pending
/// course notification, all in one transaction.
pub async fn enroll(
    state: &AppState,
    caller: Option<Uuid>,
    req: EnrollRequest,
) -> AppResult<(EnrollResponse, bool)> {
    let email = match (&caller, req.email.as_deref()) {
        (Some(_), _) => None,
        (None, Some(e)) => Some(normalize_email(e)),
        (None, None) => return Err(AppError::invalid("email", "Email is required")),
    };

    let mut tx = state.db.begin().await?;

    // serializes enrollments per course so the capacity check holds
    let course = Course::find_for_update(&mut *tx, req.course_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Course not found".into()))?;
    check_enrollable(&course).map_err(|e| {
        warn!(course_id = %course.id, status = ?course.status, error = %e, "course not enrollable");
        e
    })?;

    let student = match (caller, email) {
        (Some(id), _) => User::find_by_id(&mut *tx, id)
            .await?
            .filter(|u| u.is_active)
            .ok_or_else(|| AppError::Unauthorized("User not found".into()))?,
        (None, Some(email)) => {
            find_or_create_student(
                &mut *tx,
                &email,
                req.first_name.as_deref(),
                req.last_name.as_deref(),
            )
            .await?
        }
        (None, None) => return Err(AppError::invalid("email", "Email is required")),
    };
    if !student.is_active {
        return Err(AppError::Forbidden("Account is deactivated".into()));
    }

    let (amount, payment_status) = payment_snapshot(&course);
    let payment_method = match (req.payment_method, amount == 0.0) {
        (Some(m), _) => m,
        (None, true) => PaymentMethod::Free,
        (None, false) => {
            return Err(AppError::invalid(
                "paymentMethod",
                "Payment method is required for paid courses",
            ))
        }
    };
    let now = OffsetDateTime::now_utc();
    let new = NewEnrollment {
        student_id: student.id,
        course_id: course.id,
        payment_amount: amount,
        payment_currency: course.currency.clone(),
        payment_method,
        payment_status,
        payment_date: (payment_status == PaymentStatus::Completed).then_some(now),
        transaction_id: req.transaction_id,
        coupon_code: req.coupon_code.map(|c| c.trim().to_uppercase()),
        source: req.source.unwrap_or_default(),
        referral_code: req.referral_code,
    };

    let Some(enrollment) = Enrollment::insert_if_absent(&mut *tx, &new).await? else {
        let existing = Enrollment::find_pair(&mut *tx, student.id, course.id)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("enrollment vanished after conflict")))?;
        tx.commit().await?;
        info!(enrollment_id = %existing.id, student_id = %student.id, "already enrolled");
        return Ok((
            EnrollResponse {
                success: true,
                message: "You are already enrolled in this course".into(),
                enrollment_id: existing.id,
                status: existing.status,
                already_enrolled: true,
                amount: None,
                payment_status: None,
                access_url: access_url(&state.config.client_url, course.id),
            },
            false,
        ));
    };

    Course::increment_enrollment_count(&mut *tx, course.id).await?;
    let converted =
        CourseNotification::mark_enrolled(&mut *tx, &student.email, course.id, amount).await?;
    tx.commit().await?;

    info!(
        enrollment_id = %enrollment.id,
        student_id = %student.id,
        course_id = %course.id,
        amount,
        converted_notification = converted,
        "enrollment created"
    );

    let url = access_url(&state.config.client_url, course.id);
    mailer::spawn_rendered(
        state.mailer.clone(),
        state.templates.enrollment_confirmation(
            &student.email,
            student.display_name(),
            &course.title,
            enrollment.id,
            amount,
            &url,
        ),
    );

    Ok((
        EnrollResponse {
            success: true,
            message: "Successfully enrolled in the course!".into(),
            enrollment_id: enrollment.id,
            status: enrollment.status,
            already_enrolled: false,
            amount: Some(amount),
            payment_status: Some(payment_status),
            access_url: url,
        },
        true,
    ))
}

pub async fn update_progress(
    state: &AppState,
    student_id: Uuid,
    enrollment_id: Uuid,
    req: &ProgressRequest,
) -> AppResult<ProgressResponse> {
    let mut tx = state.db.begin().await?;
    let mut enrollment = Enrollment::lock_owned(&mut *tx, enrollment_id, student_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Enrollment not found".into()))?;

    let course = Course::find_by_id(&mut *tx, enrollment.course_id).await?;
    let curriculum = match &course {
        Some(c) => {
            let total = total_lectures(&c.curriculum);
            let known = c
                .curriculum
                .iter()
                .flat_map(|s| s.lectures.iter())
                .any(|l| l.id == req.lecture_id);
            if total > 0 && !known {
                return Err(AppError::invalid("lectureId", "Unknown lecture for this course"));
            }
            Some((total, c.certificate_offered))
        }
        None => None,
    };

    let outcome = apply_progress(
        &mut enrollment,
        &ProgressUpdate {
            lecture_id: &req.lecture_id,
            time_spent: req.time_spent.unwrap_or(0),
            current_lecture: req.current_lecture.as_deref(),
        },
        curriculum,
        OffsetDateTime::now_utc(),
    );
    if !outcome.recomputed {
        warn!(
            %enrollment_id,
            course_id = %enrollment.course_id,
            course_found = course.is_some(),
            "completion percentage left unchanged: course missing or has no lectures"
        );
    }
    enrollment.save_progress(&mut *tx).await?;
    tx.commit().await?;

    if outcome.completed_now {
        info!(%enrollment_id, %student_id, "enrollment completed");
    }
    Ok(ProgressResponse {
        progress: ProgressView::from(&enrollment),
        status: enrollment.status,
        certificate_eligible: enrollment.certificate_eligible,
    })
}

pub async fn add_bookmark(
    state: &AppState,
    student_id: Uuid,
    enrollment_id: Uuid,
    lecture: String,
    timestamp: Option<f64>,
    title: Option<String>,
) -> AppResult<BookmarksResponse> {
    let mut tx = state.db.begin().await?;
    let mut enrollment = Enrollment::lock_owned(&mut *tx, enrollment_id, student_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Enrollment not found".into()))?;
    let title = title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| Bookmark::default_title(enrollment.bookmarks.0.len()));
    enrollment.bookmarks.0.push(Bookmark {
        id: Uuid::new_v4(),
        lecture,
        timestamp,
        title,
        created_at: OffsetDateTime::now_utc(),
    });
    enrollment.save_bookmarks(&mut *tx).await?;
    tx.commit().await?;
    Ok(BookmarksResponse {
        bookmarks: enrollment.bookmarks.0,
    })
}

/// Stores the rating and recomputes the course aggregate from every rating.
/// The course row is locked first so concurrent submissions serialize.
pub async fn submit_review(
    state: &AppState,
    student_id: Uuid,
    enrollment_id: Uuid,
    value: i16,
    review: Option<&str>,
) -> AppResult<ReviewResponse> {
    let course_id = Enrollment::find_owned(&state.db, enrollment_id, student_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Enrollment not found".into()))?
        .course_id;

    let mut tx = state.db.begin().await?;
    if !rating::lock_course(&mut *tx, course_id).await? {
        return Err(AppError::Internal(anyhow::anyhow!(
            "enrollment {enrollment_id} references missing course {course_id}"
        )));
    }
    let enrollment = Enrollment::set_rating(&mut *tx, enrollment_id, value, review).await?;
    let aggregate = rating::recompute(&mut *tx, course_id).await?;
    tx.commit().await?;

    info!(%enrollment_id, %course_id, value, "review submitted");
    Ok(ReviewResponse::new(&enrollment, aggregate))
}

pub async fn request_certificate(
    state: &AppState,
    student_id: Uuid,
    enrollment_id: Uuid,
) -> AppResult<CertificateResponse> {
    let mut tx = state.db.begin().await?;
    let mut enrollment = Enrollment::lock_owned(&mut *tx, enrollment_id, student_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Enrollment not found".into()))?;

    let now = OffsetDateTime::now_utc();
    let issued_now = issue_certificate(&mut enrollment, &state.config.client_url, now)?;
    if issued_now {
        enrollment.save_certificate(&mut *tx).await?;
    }
    let course = Course::find_by_id(&mut *tx, enrollment.course_id).await?;
    tx.commit().await?;

    let (Some(certificate_id), Some(download_url), Some(issued_at)) = (
        enrollment.certificate_id.clone(),
        enrollment.certificate_url.clone(),
        enrollment.certificate_issued_at,
    ) else {
        return Err(AppError::Internal(anyhow::anyhow!(
            "certificate fields missing on issued enrollment {enrollment_id}"
        )));
    };

    if issued_now {
        info!(%enrollment_id, %certificate_id, "certificate issued");
        if let Some(student) = User::find_by_id(&state.db, student_id).await? {
            let title = course.as_ref().map_or("your course", |c| c.title.as_str());
            mailer::spawn_rendered(
                state.mailer.clone(),
                state.templates.certificate_issued(
                    &student.email,
                    student.display_name(),
                    title,
                    &certificate_id,
                    &download_url,
                ),
            );
        }
    }

    Ok(CertificateResponse {
        issued: true,
        certificate_id,
        download_url,
        issued_at,
    })
}

/// Drop (by the owner) or suspend (by an admin). `student_id` is `None` for admins.
pub async fn change_status(
    state: &AppState,
    enrollment_id: Uuid,
    student_id: Option<Uuid>,
    target: EnrollmentStatus,
) -> AppResult<Enrollment> {
    let mut tx = state.db.begin().await?;
    let current = match student_id {
        Some(sid) => Enrollment::lock_owned(&mut *tx, enrollment_id, sid).await?,
        None => Enrollment::lock(&mut *tx, enrollment_id).await?,
    }
    .ok_or_else(|| AppError::NotFound("Enrollment not found".into()))?;

    let status = manual_transition(current.status, target)?;
    let updated = Enrollment::set_status(&mut *tx, enrollment_id, status).await?;
    tx.commit().await?;
    info!(%enrollment_id, from = ?current.status, to = ?status, "enrollment status changed");
    Ok(updated)
}

/// Removes an enrollment and keeps the course counter and rating consistent.
pub async fn remove(state: &AppState, enrollment_id: Uuid) -> AppResult<()> {
    let course_id = Enrollment::find_by_id(&state.db, enrollment_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Enrollment not found".into()))?
        .course_id;

    let mut tx = state.db.begin().await?;
    // same lock order as rating submission: course, then enrollment
    rating::lock_course(&mut *tx, course_id).await?;
    if !Enrollment::delete(&mut *tx, enrollment_id).await? {
        return Err(AppError::NotFound("Enrollment not found".into()));
    }
    Course::decrement_enrollment_count(&mut *tx, course_id).await?;
    rating::recompute(&mut *tx, course_id).await?;
    tx.commit().await?;

    info!(%enrollment_id, %course_id, "enrollment removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use sqlx::PgPool;

    use super::*;
    use crate::{
        db::fixtures,
        mailer::testing::RecordingMailer,
        notifications::repo_types::{NewNotification, NotificationPreferences, NotificationStatus},
    };

    fn state(pool: PgPool) -> AppState {
        AppState::with_pool(pool, Arc::new(RecordingMailer::default()))
    }

    fn request(email: &str, course_id: Uuid) -> EnrollRequest {
        serde_json::from_value(json!({ "email": email, "courseId": course_id })).unwrap()
    }

    async fn student_id(pool: &PgPool, email: &str) -> Uuid {
        User::find_by_email(pool, email).await.unwrap().unwrap().id
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL"]
    async fn enrolling_twice_returns_the_same_enrollment(pool: PgPool) {
        let st = state(pool.clone());
        let course = fixtures::course(&pool, None).await;

        let (first, created) = enroll(&st, None, request("ada@example.com", course.id))
            .await
            .unwrap();
        assert!(created);
        let (second, created) = enroll(&st, None, request("ADA@example.com", course.id))
            .await
            .unwrap();
        assert!(!created);
        assert!(second.already_enrolled);
        assert_eq!(second.enrollment_id, first.enrollment_id);

        let course = Course::find_by_id(&pool, course.id).await.unwrap().unwrap();
        assert_eq!(course.enrollment_count, 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL"]
    async fn full_course_turns_the_next_student_away(pool: PgPool) {
        let st = state(pool.clone());
        let course = fixtures::course(&pool, Some(1)).await;

        enroll(&st, None, request("ada@example.com", course.id))
            .await
            .unwrap();
        let err = enroll(&st, None, request("grace@example.com", course.id))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)), "{err:?}");

        let course = Course::find_by_id(&pool, course.id).await.unwrap().unwrap();
        assert_eq!(course.enrollment_count, 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL"]
    async fn enrolling_converts_a_waiting_notification(pool: PgPool) {
        let st = state(pool.clone());
        let course = fixtures::course(&pool, None).await;
        CourseNotification::insert_if_absent(
            &pool,
            &NewNotification {
                email: "ada@example.com".into(),
                course_id: course.id,
                notification_type: Default::default(),
                first_name: None,
                last_name: None,
                phone: None,
                preferences: NotificationPreferences::default(),
                source: "course_page".into(),
                unsubscribe_token: Uuid::new_v4().to_string(),
            },
        )
        .await
        .unwrap()
        .unwrap();

        enroll(&st, None, request("ada@example.com", course.id))
            .await
            .unwrap();

        let record = CourseNotification::find_pair(&pool, "ada@example.com", course.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, NotificationStatus::Enrolled);
        assert_eq!(record.conversion_value, Some(0.0));
        assert!(record.enrollment_date.is_some());
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL"]
    async fn concurrent_reviews_both_land_in_the_aggregate(pool: PgPool) {
        let st = state(pool.clone());
        let course = fixtures::course(&pool, None).await;
        let (a, _) = enroll(&st, None, request("ada@example.com", course.id))
            .await
            .unwrap();
        let (b, _) = enroll(&st, None, request("grace@example.com", course.id))
            .await
            .unwrap();
        let ada = student_id(&pool, "ada@example.com").await;
        let grace = student_id(&pool, "grace@example.com").await;

        let (ra, rb) = tokio::join!(
            submit_review(&st, ada, a.enrollment_id, 4, None),
            submit_review(&st, grace, b.enrollment_id, 5, Some("great")),
        );
        ra.unwrap();
        rb.unwrap();

        let course = Course::find_by_id(&pool, course.id).await.unwrap().unwrap();
        assert_eq!(course.rating_count, 2);
        assert!((course.rating_average - 4.5).abs() < 1e-9);
    }
}
