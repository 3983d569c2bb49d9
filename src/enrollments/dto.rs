use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use validator::Validate;

use super::lifecycle::{days_between, days_to_completion, learning_streak};
use super::repo_types::{
    Bookmark, CompletedLecture, Enrollment, EnrollmentSource, EnrollmentStatus, Note,
    PaymentMethod, PaymentStatus, StatusCount,
};
use crate::courses::repo_types::Course;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EnrollRequest {
    #[validate(email(message = "Please provide a valid email address"))]
    pub email: Option<String>,
    #[validate(length(min = 1, max = 50, message = "First name must be 1-50 characters"))]
    pub first_name: Option<String>,
    #[validate(length(min = 1, max = 50, message = "Last name must be 1-50 characters"))]
    pub last_name: Option<String>,
    pub course_id: Uuid,
    pub payment_method: Option<PaymentMethod>,
    #[validate(length(min = 1, max = 50, message = "Coupon code must be 1-50 characters"))]
    pub coupon_code: Option<String>,
    #[validate(length(max = 100, message = "Transaction id is too long"))]
    pub transaction_id: Option<String>,
    pub source: Option<EnrollmentSource>,
    #[validate(length(max = 50, message = "Referral code is too long"))]
    pub referral_code: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollResponse {
    pub success: bool,
    pub message: String,
    pub enrollment_id: Uuid,
    pub status: EnrollmentStatus,
    pub already_enrolled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
    pub access_url: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRequest {
    #[validate(length(min = 1, max = 100, message = "Lecture id is required"))]
    pub lecture_id: String,
    #[validate(range(min = 0, max = 1440, message = "Time spent must be 0-1440 minutes"))]
    pub time_spent: Option<i32>,
    pub current_lecture: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    pub completed_lectures: Vec<CompletedLecture>,
    pub current_lecture: Option<String>,
    pub percentage_completed: i32,
    pub total_time_spent: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed: OffsetDateTime,
}

impl From<&Enrollment> for ProgressView {
    fn from(e: &Enrollment) -> Self {
        Self {
            completed_lectures: e.completed_lectures.0.clone(),
            current_lecture: e.current_lecture.clone(),
            percentage_completed: e.percentage_completed,
            total_time_spent: e.total_time_spent,
            last_accessed: e.last_accessed_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressResponse {
    pub progress: ProgressView,
    pub status: EnrollmentStatus,
    pub certificate_eligible: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct NoteRequest {
    #[validate(length(min = 1, message = "Lecture is required"))]
    pub lecture: String,
    #[validate(length(min = 1, max = 5000, message = "Note must be 1-5000 characters"))]
    pub content: String,
    pub timestamp: Option<f64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct BookmarkRequest {
    #[validate(length(min = 1, message = "Lecture is required"))]
    pub lecture: String,
    pub timestamp: Option<f64>,
    #[validate(length(max = 200, message = "Title cannot exceed 200 characters"))]
    pub title: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NotesResponse {
    pub notes: Vec<Note>,
}

#[derive(Debug, Serialize)]
pub struct BookmarksResponse {
    pub bookmarks: Vec<Bookmark>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReviewRequest {
    #[validate(range(min = 1, max = 5, message = "Rating must be between 1 and 5"))]
    pub rating: i16,
    #[validate(length(max = 2000, message = "Review cannot exceed 2000 characters"))]
    pub review: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingView {
    pub value: i16,
    pub review: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub review_date: Option<OffsetDateTime>,
}

fn rating_view(e: &Enrollment) -> Option<RatingView> {
    e.rating_value.map(|value| RatingView {
        value,
        review: e.rating_review.clone(),
        review_date: e.rating_date,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResponse {
    pub rating: Option<RatingView>,
    pub course_rating: crate::courses::rating::RatingAggregate,
}

impl ReviewResponse {
    pub fn new(e: &Enrollment, course_rating: crate::courses::rating::RatingAggregate) -> Self {
        Self {
            rating: rating_view(e),
            course_rating,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateResponse {
    pub issued: bool,
    pub certificate_id: String,
    pub download_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentView {
    pub amount: f64,
    pub currency: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub payment_date: Option<OffsetDateTime>,
    pub transaction_id: Option<String>,
    pub coupon_code: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateView {
    pub issued: bool,
    pub certificate_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub issued_date: Option<OffsetDateTime>,
    pub download_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseSummary {
    pub id: Uuid,
    pub title: String,
    pub slug: String,
    pub category: String,
    pub level: String,
}

impl From<&Course> for CourseSummary {
    fn from(c: &Course) -> Self {
        Self {
            id: c.id,
            title: c.title.clone(),
            slug: c.slug.clone(),
            category: c.category.clone(),
            level: c.level.clone(),
        }
    }
}

/// Full enrollment with the read-time derived fields.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentResponse {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course: Option<CourseSummary>,
    #[serde(with = "time::serde::rfc3339")]
    pub enrollment_date: OffsetDateTime,
    pub status: EnrollmentStatus,
    pub progress: ProgressView,
    pub payment: PaymentView,
    pub certificate: CertificateView,
    pub certificate_eligible: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completion_date: Option<OffsetDateTime>,
    pub notes: Vec<Note>,
    pub bookmarks: Vec<Bookmark>,
    pub rating: Option<RatingView>,
    pub source: EnrollmentSource,
    pub referral_code: Option<String>,
    pub days_since_enrollment: i64,
    pub days_to_completion: Option<i64>,
    pub learning_streak: u32,
}

impl EnrollmentResponse {
    pub fn build(e: Enrollment, course: Option<&Course>, now: OffsetDateTime) -> Self {
        Self {
            id: e.id,
            student_id: e.student_id,
            course_id: e.course_id,
            course: course.map(CourseSummary::from),
            enrollment_date: e.enrolled_at,
            status: e.status,
            progress: ProgressView::from(&e),
            payment: PaymentView {
                amount: e.payment_amount,
                currency: e.payment_currency.clone(),
                method: e.payment_method,
                status: e.payment_status,
                payment_date: e.payment_date,
                transaction_id: e.transaction_id.clone(),
                coupon_code: e.coupon_code.clone(),
            },
            certificate: CertificateView {
                issued: e.certificate_issued,
                certificate_id: e.certificate_id.clone(),
                issued_date: e.certificate_issued_at,
                download_url: e.certificate_url.clone(),
            },
            certificate_eligible: e.certificate_eligible,
            completion_date: e.completion_date,
            rating: rating_view(&e),
            source: e.source,
            referral_code: e.referral_code.clone(),
            days_since_enrollment: days_between(e.enrolled_at, now),
            days_to_completion: days_to_completion(&e),
            learning_streak: learning_streak(&e.completed_lectures.0, now.date()),
            notes: e.notes.0,
            bookmarks: e.bookmarks.0,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MyCoursesQuery {
    pub status: Option<EnrollmentStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsQuery {
    pub course_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentStats {
    pub total: i64,
    pub by_status: Vec<StatusCountView>,
    pub average_completion: f64,
}

#[derive(Debug, Serialize)]
pub struct StatusCountView {
    pub status: EnrollmentStatus,
    pub count: i64,
}

impl From<StatusCount> for StatusCountView {
    fn from(s: StatusCount) -> Self {
        Self {
            status: s.status,
            count: s.count,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeResponse {
    pub enrollment_id: Uuid,
    pub status: EnrollmentStatus,
}
