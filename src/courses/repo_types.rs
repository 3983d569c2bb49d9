use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "course_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CourseStatus {
    Draft,
    Published,
    Archived,
    ComingSoon,
}

/// One curriculum lecture. `duration` is in minutes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lecture {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub is_free: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub title: String,
    #[serde(default)]
    pub lectures: Vec<Lecture>,
}

/// Course row in the database.
#[derive(Debug, Clone, FromRow)]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub slug: String,
    pub description: String,
    pub short_description: Option<String>,
    pub instructor_id: Uuid,
    pub category: String,
    pub level: String,
    pub price_current: f64,
    pub price_original: Option<f64>,
    pub currency: String,
    pub is_free: bool,
    pub curriculum: Json<Vec<Section>>,
    pub certificate_offered: bool,
    pub status: CourseStatus,
    pub launch_date: Option<OffsetDateTime>,
    pub enrollment_count: i32,
    pub max_enrollment: Option<i32>,
    pub rating_average: f64,
    pub rating_count: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Insert payload for `courses`; the slug is resolved by the service.
pub struct NewCourse {
    pub title: String,
    pub description: String,
    pub short_description: Option<String>,
    pub instructor_id: Uuid,
    pub category: String,
    pub level: String,
    pub price_current: f64,
    pub price_original: Option<f64>,
    pub currency: String,
    pub is_free: bool,
    pub curriculum: Vec<Section>,
    pub certificate_offered: bool,
    pub status: CourseStatus,
    pub launch_date: Option<OffsetDateTime>,
    pub max_enrollment: Option<i32>,
}
