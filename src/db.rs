use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .context("connect to database")
}

/// True when `err` is a unique-constraint violation, optionally on a specific constraint.
pub fn is_unique_violation(err: &sqlx::Error, constraint: Option<&str>) -> bool {
    match err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => match constraint {
            Some(name) => db_err.constraint() == Some(name),
            None => true,
        },
        _ => false,
    }
}

/// `?limit=&offset=` query parameters shared by list endpoints.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Page {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Page {
    pub const DEFAULT_LIMIT: i64 = 20;
    pub const MAX_LIMIT: i64 = 100;

    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// Rows for database-backed tests.
#[cfg(test)]
pub mod fixtures {
    use uuid::Uuid;

    use super::*;
    use crate::{
        auth::repo_types::{NewUser, Role, User},
        courses::repo_types::{Course, CourseStatus, NewCourse},
    };

    pub async fn instructor(db: &PgPool) -> User {
        let email = format!("teacher-{}@example.com", Uuid::new_v4());
        User::insert_if_absent(
            db,
            &NewUser {
                email: &email,
                password_hash: "not-a-real-hash",
                first_name: Some("Grace"),
                last_name: None,
                role: Role::Instructor,
                verification_token_hash: None,
                verification_expires_at: None,
            },
        )
        .await
        .unwrap()
        .unwrap()
    }

    /// A free, published course.
    pub async fn course(db: &PgPool, max_enrollment: Option<i32>) -> Course {
        let owner = instructor(db).await;
        let new = NewCourse {
            title: "Rust in Practice".into(),
            description: "Ownership, traits and async".into(),
            short_description: None,
            instructor_id: owner.id,
            category: crate::courses::services::CATEGORIES[0].into(),
            level: crate::courses::services::LEVELS[0].into(),
            price_current: 0.0,
            price_original: None,
            currency: "USD".into(),
            is_free: true,
            curriculum: Vec::new(),
            certificate_offered: true,
            status: CourseStatus::Published,
            launch_date: None,
            max_enrollment,
        };
        Course::insert(db, &format!("rust-{}", Uuid::new_v4()), &new)
            .await
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_clamps() {
        let p = Page {
            limit: Some(1000),
            offset: Some(-5),
        };
        assert_eq!(p.limit(), Page::MAX_LIMIT);
        assert_eq!(p.offset(), 0);
        let d = Page {
            limit: None,
            offset: None,
        };
        assert_eq!(d.limit(), 20);
    }

    #[test]
    fn non_database_errors_are_not_unique_violations() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound, None));
    }
}
