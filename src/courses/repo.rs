use sqlx::{types::Json, PgExecutor, PgPool};
use uuid::Uuid;

use super::repo_types::{Course, CourseStatus, NewCourse, Section};

/// Optional column changes for `Course::update`; `None` leaves the column as is.
#[derive(Default)]
pub struct CourseChanges {
    pub title: Option<String>,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub short_description: Option<String>,
    pub category: Option<String>,
    pub level: Option<String>,
    pub price_current: Option<f64>,
    /// `Some(None)` clears it.
    pub price_original: Option<Option<f64>>,
    pub currency: Option<String>,
    pub is_free: Option<bool>,
    pub curriculum: Option<Vec<Section>>,
    pub certificate_offered: Option<bool>,
    pub status: Option<CourseStatus>,
    pub launch_date: Option<time::OffsetDateTime>,
    /// `Some(None)` lifts the cap.
    pub max_enrollment: Option<Option<i32>>,
}

impl Course {
    pub async fn find_by_id<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
    ) -> Result<Option<Course>, sqlx::Error> {
        sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE id = $1")
            .bind(id)
            .fetch_optional(ex)
            .await
    }

    /// Row lock for the rest of the transaction.
    pub async fn find_for_update<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
    ) -> Result<Option<Course>, sqlx::Error> {
        sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(ex)
            .await
    }

    pub async fn find_by_slug(db: &PgPool, slug: &str) -> Result<Option<Course>, sqlx::Error> {
        sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE slug = $1")
            .bind(slug)
            .fetch_optional(db)
            .await
    }

    pub async fn slug_taken(
        db: &PgPool,
        slug: &str,
        exclude: Option<Uuid>,
    ) -> Result<bool, sqlx::Error> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM courses WHERE slug = $1 AND ($2::uuid IS NULL OR id <> $2))",
        )
        .bind(slug)
        .bind(exclude)
        .fetch_one(db)
        .await?;
        Ok(row.0)
    }

    pub async fn count_enrollments<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
    ) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM enrollments WHERE course_id = $1")
            .bind(id)
            .fetch_one(ex)
            .await?;
        Ok(row.0)
    }

    pub async fn delete<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM courses WHERE id = $1")
            .bind(id)
            .execute(ex)
            .await?;
        Ok(())
    }

    pub async fn archive<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE courses SET status = 'archived', updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(ex)
            .await?;
        Ok(())
    }

    pub async fn list_published(
        db: &PgPool,
        category: Option<&str>,
        level: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Course>, sqlx::Error> {
        sqlx::query_as::<_, Course>(
            r#"
            SELECT * FROM courses
            WHERE status = 'published'
              AND ($1::text IS NULL OR category = $1)
              AND ($2::text IS NULL OR level = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(category)
        .bind(level)
        .bind(limit)
        .bind(offset)
        .fetch_all(db)
        .await
    }

    pub async fn insert(db: &PgPool, slug: &str, new: &NewCourse) -> Result<Course, sqlx::Error> {
        sqlx::query_as::<_, Course>(
            r#"
            INSERT INTO courses (title, slug, description, short_description, instructor_id,
                                 category, level, price_current, price_original, currency,
                                 is_free, curriculum, certificate_offered, status, launch_date,
                                 max_enrollment)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING *
            "#,
        )
        .bind(&new.title)
        .bind(slug)
        .bind(&new.description)
        .bind(&new.short_description)
        .bind(new.instructor_id)
        .bind(&new.category)
        .bind(&new.level)
        .bind(new.price_current)
        .bind(new.price_original)
        .bind(&new.currency)
        .bind(new.is_free)
        .bind(Json(&new.curriculum))
        .bind(new.certificate_offered)
        .bind(new.status)
        .bind(new.launch_date)
        .bind(new.max_enrollment)
        .fetch_one(db)
        .await
    }

    pub async fn update(
        db: &PgPool,
        id: Uuid,
        changes: &CourseChanges,
    ) -> Result<Course, sqlx::Error> {
        sqlx::query_as::<_, Course>(
            r#"
            UPDATE courses SET
                title               = COALESCE($2, title),
                slug                = COALESCE($3, slug),
                description         = COALESCE($4, description),
                short_description   = COALESCE($5, short_description),
                category            = COALESCE($6, category),
                level               = COALESCE($7, level),
                price_current       = COALESCE($8, price_current),
                price_original      = CASE WHEN $17 THEN $9 ELSE price_original END,
                currency            = COALESCE($10, currency),
                is_free             = COALESCE($11, is_free),
                curriculum          = COALESCE($12, curriculum),
                certificate_offered = COALESCE($13, certificate_offered),
                status              = COALESCE($14, status),
                launch_date         = COALESCE($15, launch_date),
                max_enrollment      = CASE WHEN $18 THEN $16 ELSE max_enrollment END,
                updated_at          = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&changes.title)
        .bind(&changes.slug)
        .bind(&changes.description)
        .bind(&changes.short_description)
        .bind(&changes.category)
        .bind(&changes.level)
        .bind(changes.price_current)
        .bind(changes.price_original.flatten())
        .bind(&changes.currency)
        .bind(changes.is_free)
        .bind(changes.curriculum.as_ref().map(Json))
        .bind(changes.certificate_offered)
        .bind(changes.status)
        .bind(changes.launch_date)
        .bind(changes.max_enrollment.flatten())
        .bind(changes.price_original.is_some())
        .bind(changes.max_enrollment.is_some())
        .fetch_one(db)
        .await
    }

    /// Atomic relative increment; never read-modify-write.
    pub async fn increment_enrollment_count<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE courses SET enrollment_count = enrollment_count + 1, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(ex)
        .await?;
        Ok(())
    }

    pub async fn decrement_enrollment_count<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE courses SET enrollment_count = GREATEST(enrollment_count - 1, 0), updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(ex)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fixtures;

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL"]
    async fn update_can_clear_nullable_columns(pool: PgPool) {
        let course = fixtures::course(&pool, Some(10)).await;
        let discounted = Course::update(
            &pool,
            course.id,
            &CourseChanges {
                price_current: Some(19.0),
                price_original: Some(Some(49.0)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(discounted.price_original, Some(49.0));

        // untouched fields keep their values
        let renamed = Course::update(
            &pool,
            course.id,
            &CourseChanges {
                title: Some("Rust, Again".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(renamed.price_original, Some(49.0));
        assert_eq!(renamed.max_enrollment, Some(10));

        let cleared = Course::update(
            &pool,
            course.id,
            &CourseChanges {
                price_current: Some(19.0),
                price_original: Some(None),
                max_enrollment: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(cleared.price_original, None);
        assert_eq!(cleared.max_enrollment, None);
        assert_eq!(cleared.price_current, 19.0);
    }
}
