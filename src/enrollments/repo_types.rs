use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "enrollment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Dropped,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_method", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    CreditCard,
    DebitCard,
    Paypal,
    Stripe,
    Free,
    Coupon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "enrollment_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentSource {
    #[default]
    Direct,
    Referral,
    Social,
    Search,
    Email,
    Advertisement,
}

/// One finished lecture. `time_spent` is in minutes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedLecture {
    pub lecture_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
    #[serde(default)]
    pub time_spent: i32,
}

/// Note anchored to a lecture and a playback position in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: Uuid,
    pub lecture: String,
    pub content: String,
    pub timestamp: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    pub id: Uuid,
    pub lecture: String,
    pub timestamp: Option<f64>,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Enrollment row in the database.
#[derive(Debug, Clone, FromRow)]
pub struct Enrollment {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub enrolled_at: OffsetDateTime,
    pub status: EnrollmentStatus,
    pub completed_lectures: Json<Vec<CompletedLecture>>,
    pub current_lecture: Option<String>,
    pub percentage_completed: i32,
    pub total_time_spent: i32,
    pub last_accessed_at: OffsetDateTime,
    pub payment_amount: f64,
    pub payment_currency: String,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub payment_date: Option<OffsetDateTime>,
    pub transaction_id: Option<String>,
    pub coupon_code: Option<String>,
    pub certificate_issued: bool,
    pub certificate_id: Option<String>,
    pub certificate_issued_at: Option<OffsetDateTime>,
    pub certificate_url: Option<String>,
    pub certificate_eligible: bool,
    pub completion_date: Option<OffsetDateTime>,
    pub notes: Json<Vec<Note>>,
    pub bookmarks: Json<Vec<Bookmark>>,
    pub rating_value: Option<i16>,
    pub rating_review: Option<String>,
    pub rating_date: Option<OffsetDateTime>,
    pub source: EnrollmentSource,
    pub referral_code: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Insert payload for `enrollments`.
pub struct NewEnrollment {
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub payment_amount: f64,
    pub payment_currency: String,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub payment_date: Option<OffsetDateTime>,
    pub transaction_id: Option<String>,
    pub coupon_code: Option<String>,
    pub source: EnrollmentSource,
    pub referral_code: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct StatusCount {
    pub status: EnrollmentStatus,
    pub count: i64,
}
