//! Enrollment state transitions that do not touch the database.
//!
//! Every function here takes `now` explicitly so the transaction code and the
//! tests agree on a single clock reading.

use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::repo_types::{CompletedLecture, Enrollment, EnrollmentStatus, PaymentStatus};
use crate::courses::{repo_types::{Course, CourseStatus}, services::has_capacity};
use crate::error::AppError;

/// Percentage at which an active enrollment becomes completed.
pub const COMPLETION_THRESHOLD: i32 = 95;

/// `round(100 * completed / total)`, half-up, capped at 100. `None` when the curriculum is empty.
pub fn completion_percentage(completed: usize, total: usize) -> Option<i32> {
    if total == 0 {
        return None;
    }
    let (c, t) = (completed as u64, total as u64);
    Some(((200 * c + t) / (2 * t)).min(100) as i32)
}

pub struct ProgressUpdate<'a> {
    pub lecture_id: &'a str,
    pub time_spent: i32,
    pub current_lecture: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressOutcome {
    /// The update moved the enrollment from active to completed.
    pub completed_now: bool,
    /// Percentage recomputed against the curriculum (false when it was left unchanged).
    pub recomputed: bool,
}

/// Records one lecture visit and re-evaluates completion.
///
/// `curriculum` is `(total lectures, certificate offered)` read from the course at
/// update time. `None` leaves the percentage untouched.
pub fn apply_progress(
    enrollment: &mut Enrollment,
    update: &ProgressUpdate<'_>,
    curriculum: Option<(usize, bool)>,
    now: OffsetDateTime,
) -> ProgressOutcome {
    let time_spent = update.time_spent.max(0);
    let lectures = &mut enrollment.completed_lectures.0;
    match lectures.iter_mut().find(|l| l.lecture_id == update.lecture_id) {
        Some(existing) => existing.time_spent += time_spent,
        None => lectures.push(CompletedLecture {
            lecture_id: update.lecture_id.to_string(),
            completed_at: now,
            time_spent,
        }),
    }
    if let Some(current) = update.current_lecture {
        enrollment.current_lecture = Some(current.to_string());
    }
    enrollment.last_accessed_at = now;
    enrollment.total_time_spent += time_spent;

    let mut outcome = ProgressOutcome {
        completed_now: false,
        recomputed: false,
    };
    let Some((total, certificate_offered)) = curriculum else {
        return outcome;
    };
    let Some(pct) = completion_percentage(enrollment.completed_lectures.0.len(), total) else {
        return outcome;
    };
    enrollment.percentage_completed = pct;
    outcome.recomputed = true;

    if pct >= COMPLETION_THRESHOLD && enrollment.status == EnrollmentStatus::Active {
        enrollment.status = EnrollmentStatus::Completed;
        enrollment.completion_date = Some(now);
        enrollment.certificate_eligible = certificate_offered;
        outcome.completed_now = true;
    }
    outcome
}

/// `CERT-<course>-<student>-<unix millis>`, unique per enrollment.
pub fn certificate_id(course_id: Uuid, student_id: Uuid, issued_at: OffsetDateTime) -> String {
    let millis = issued_at.unix_timestamp_nanos() / 1_000_000;
    format!(
        "CERT-{}-{}-{}",
        course_id.simple(),
        student_id.simple(),
        millis
    )
    .to_uppercase()
}

pub fn certificate_url(client_url: &str, certificate_id: &str) -> String {
    format!("{client_url}/certificates/{certificate_id}")
}

/// Marks the certificate issued. Returns `Ok(false)` when it already was.
pub fn issue_certificate(
    enrollment: &mut Enrollment,
    client_url: &str,
    now: OffsetDateTime,
) -> Result<bool, AppError> {
    if enrollment.certificate_issued {
        return Ok(false);
    }
    if !enrollment.certificate_eligible {
        return Err(AppError::BadRequest(
            "Not eligible for certificate yet. Complete the course first.".into(),
        ));
    }
    let id = certificate_id(enrollment.course_id, enrollment.student_id, now);
    enrollment.certificate_url = Some(certificate_url(client_url, &id));
    enrollment.certificate_id = Some(id);
    enrollment.certificate_issued = true;
    enrollment.certificate_issued_at = Some(now);
    Ok(true)
}

/// Drop and suspend are only allowed from `active`.
pub fn manual_transition(
    current: EnrollmentStatus,
    target: EnrollmentStatus,
) -> Result<EnrollmentStatus, AppError> {
    match (current, target) {
        (EnrollmentStatus::Active, EnrollmentStatus::Dropped | EnrollmentStatus::Suspended) => {
            Ok(target)
        }
        (_, EnrollmentStatus::Dropped | EnrollmentStatus::Suspended) => Err(AppError::BadRequest(
            format!("Only active enrollments can be {}", status_verb(target)),
        )),
        _ => Err(AppError::BadRequest("Unsupported status change".into())),
    }
}

fn status_verb(status: EnrollmentStatus) -> &'static str {
    match status {
        EnrollmentStatus::Dropped => "dropped",
        EnrollmentStatus::Suspended => "suspended",
        EnrollmentStatus::Completed => "completed",
        EnrollmentStatus::Active => "activated",
    }
}

/// Preconditions in order: published, then capacity. Existence is the caller's lookup.
pub fn check_enrollable(course: &Course) -> Result<(), AppError> {
    if course.status != CourseStatus::Published {
        return Err(AppError::BadRequest(
            "Course is not available for enrollment".into(),
        ));
    }
    if !has_capacity(course.enrollment_count, course.max_enrollment) {
        return Err(AppError::Conflict("Course enrollment is full".into()));
    }
    Ok(())
}

/// Price snapshot taken at enrollment: free courses cost nothing and are paid immediately.
pub fn payment_snapshot(course: &Course) -> (f64, PaymentStatus) {
    let amount = if course.is_free { 0.0 } else { course.price_current };
    let status = if amount == 0.0 {
        PaymentStatus::Completed
    } else {
        PaymentStatus::Pending
    };
    (amount, status)
}

pub fn days_between(from: OffsetDateTime, to: OffsetDateTime) -> i64 {
    (to - from).whole_days()
}

pub fn days_to_completion(enrollment: &Enrollment) -> Option<i64> {
    enrollment
        .completion_date
        .map(|done| days_between(enrollment.enrolled_at, done))
}

/// Consecutive calendar days (UTC) with at least one completed lecture,
/// counting back from today, or from yesterday if nothing was finished today.
pub fn learning_streak(lectures: &[CompletedLecture], today: Date) -> u32 {
    let mut days: Vec<Date> = lectures.iter().map(|l| l.completed_at.date()).collect();
    days.sort_unstable_by(|a, b| b.cmp(a));
    days.dedup();

    let mut iter = days.into_iter().skip_while(|d| *d > today).peekable();
    let mut expected = match iter.peek() {
        Some(d) if *d == today => today,
        Some(d) if Some(*d) == today.previous_day() => *d,
        _ => return 0,
    };
    let mut streak = 0;
    for day in iter {
        if day != expected {
            break;
        }
        streak += 1;
        match expected.previous_day() {
            Some(prev) => expected = prev,
            None => break,
        }
    }
    streak
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::enrollments::repo_types::{EnrollmentSource, PaymentMethod};
    use sqlx::types::Json;

    pub fn enrollment(now: OffsetDateTime) -> Enrollment {
        Enrollment {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            course_id: Uuid::new_v4(),
            enrolled_at: now,
            status: EnrollmentStatus::Active,
            completed_lectures: Json(vec![]),
            current_lecture: None,
            percentage_completed: 0,
            total_time_spent: 0,
            last_accessed_at: now,
            payment_amount: 0.0,
            payment_currency: "USD".into(),
            payment_method: PaymentMethod::Free,
            payment_status: PaymentStatus::Completed,
            payment_date: Some(now),
            transaction_id: None,
            coupon_code: None,
            certificate_issued: false,
            certificate_id: None,
            certificate_issued_at: None,
            certificate_url: None,
            certificate_eligible: false,
            completion_date: None,
            notes: Json(vec![]),
            bookmarks: Json(vec![]),
            rating_value: None,
            rating_review: None,
            rating_date: None,
            source: EnrollmentSource::Direct,
            referral_code: None,
            created_at: now,
            updated_at: now,
        }
    }
}
