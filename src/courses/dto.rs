use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use validator::Validate;

use super::rating::RatingAggregate;
use super::repo_types::{Course, CourseStatus, Section};
use super::services::{discount_percentage, is_enrollment_open, total_lectures};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub category: Option<String>,
    pub level: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub current: f64,
    pub original: Option<f64>,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateCourseRequest {
    #[validate(length(min = 1, max = 100, message = "Title cannot exceed 100 characters"))]
    pub title: String,
    #[validate(length(min = 1, max = 1000, message = "Description cannot exceed 1000 characters"))]
    pub description: String,
    #[validate(length(max = 200, message = "Short description cannot exceed 200 characters"))]
    pub short_description: Option<String>,
    pub category: String,
    pub level: String,
    pub price: Price,
    #[serde(default)]
    pub is_free: bool,
    #[serde(default)]
    pub curriculum: Vec<Section>,
    pub certificate_offered: Option<bool>,
    pub status: Option<CourseStatus>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub launch_date: Option<OffsetDateTime>,
    #[validate(range(min = 1, message = "Max enrollment must be positive"))]
    pub max_enrollment: Option<i32>,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCourseRequest {
    #[validate(length(min = 1, max = 100, message = "Title cannot exceed 100 characters"))]
    pub title: Option<String>,
    #[validate(length(min = 1, max = 1000, message = "Description cannot exceed 1000 characters"))]
    pub description: Option<String>,
    #[validate(length(max = 200, message = "Short description cannot exceed 200 characters"))]
    pub short_description: Option<String>,
    pub category: Option<String>,
    pub level: Option<String>,
    pub price: Option<Price>,
    pub is_free: Option<bool>,
    pub curriculum: Option<Vec<Section>>,
    pub certificate_offered: Option<bool>,
    pub status: Option<CourseStatus>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub launch_date: Option<OffsetDateTime>,
    /// Absent leaves the cap alone; `null` removes it.
    #[serde(default, deserialize_with = "present_or_null")]
    pub max_enrollment: Option<Option<i32>>,
}

/// Tells an explicit `null` (`Some(None)`) apart from a missing field (`None`).
fn present_or_null<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseResponse {
    pub id: Uuid,
    pub title: String,
    pub slug: String,
    pub description: String,
    pub short_description: Option<String>,
    pub instructor_id: Uuid,
    pub category: String,
    pub level: String,
    pub price: Price,
    pub is_free: bool,
    pub curriculum: Vec<Section>,
    pub certificate_offered: bool,
    pub status: CourseStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub launch_date: Option<OffsetDateTime>,
    pub enrollment_count: i32,
    pub max_enrollment: Option<i32>,
    pub rating: RatingAggregate,
    pub total_lectures: usize,
    pub discount_percentage: i32,
    pub is_enrollment_open: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<Course> for CourseResponse {
    fn from(c: Course) -> Self {
        let total_lectures = total_lectures(&c.curriculum);
        let discount_percentage = discount_percentage(c.price_current, c.price_original);
        let is_enrollment_open = is_enrollment_open(&c);
        Self {
            id: c.id,
            title: c.title,
            slug: c.slug,
            description: c.description,
            short_description: c.short_description,
            instructor_id: c.instructor_id,
            category: c.category,
            level: c.level,
            price: Price {
                current: c.price_current,
                original: c.price_original,
                currency: c.currency,
            },
            is_free: c.is_free,
            curriculum: c.curriculum.0,
            certificate_offered: c.certificate_offered,
            status: c.status,
            launch_date: c.launch_date,
            enrollment_count: c.enrollment_count,
            max_enrollment: c.max_enrollment,
            rating: RatingAggregate {
                average: c.rating_average,
                count: c.rating_count,
            },
            total_lectures,
            discount_percentage,
            is_enrollment_open,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCourseResponse {
    pub success: bool,
    pub archived: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeRatingResponse {
    pub course_id: Uuid,
    pub rating: RatingAggregate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_max_enrollment_is_a_clear_not_an_omission() {
        let omitted: UpdateCourseRequest = serde_json::from_str(r#"{"title":"Rust"}"#).unwrap();
        assert_eq!(omitted.max_enrollment, None);

        let cleared: UpdateCourseRequest =
            serde_json::from_str(r#"{"maxEnrollment":null}"#).unwrap();
        assert_eq!(cleared.max_enrollment, Some(None));

        let set: UpdateCourseRequest = serde_json::from_str(r#"{"maxEnrollment":30}"#).unwrap();
        assert_eq!(set.max_enrollment, Some(Some(30)));
    }

    #[test]
    fn price_without_original_has_none() {
        let req: UpdateCourseRequest =
            serde_json::from_str(r#"{"price":{"current":19.0}}"#).unwrap();
        let price = req.price.unwrap();
        assert_eq!(price.original, None);
        assert_eq!(price.currency, "USD");
    }
}
