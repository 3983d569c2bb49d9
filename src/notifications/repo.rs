use sqlx::{types::Json, PgExecutor, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::repo_types::{
    CourseNotification, NewNotification, NotificationPreferences, NotificationStatus,
    NotificationType, NotificationWithCourse, ScheduledEntry,
};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StatusTally {
    pub status: NotificationStatus,
    pub count: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TypeTally {
    pub notification_type: NotificationType,
    pub count: i64,
}

impl CourseNotification {
    pub async fn find_by_id<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
    ) -> Result<Option<CourseNotification>, sqlx::Error> {
        sqlx::query_as::<_, CourseNotification>("SELECT * FROM course_notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(ex)
            .await
    }

    pub async fn lock<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
    ) -> Result<Option<CourseNotification>, sqlx::Error> {
        sqlx::query_as::<_, CourseNotification>(
            "SELECT * FROM course_notifications WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(ex)
        .await
    }

    pub async fn find_pair<'e, E: PgExecutor<'e>>(
        ex: E,
        email: &str,
        course_id: Uuid,
    ) -> Result<Option<CourseNotification>, sqlx::Error> {
        sqlx::query_as::<_, CourseNotification>(
            "SELECT * FROM course_notifications WHERE email = $1 AND course_id = $2",
        )
        .bind(email)
        .bind(course_id)
        .fetch_optional(ex)
        .await
    }

    /// `None` when the (email, course) pair is already registered.
    pub async fn insert_if_absent(
        db: &PgPool,
        new: &NewNotification,
    ) -> Result<Option<CourseNotification>, sqlx::Error> {
        sqlx::query_as::<_, CourseNotification>(
            r#"
            INSERT INTO course_notifications
                (email, course_id, notification_type, first_name, last_name, phone,
                 preferences, source, unsubscribe_token)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT ON CONSTRAINT course_notifications_email_course_key DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&new.email)
        .bind(new.course_id)
        .bind(new.notification_type)
        .bind(&new.first_name)
        .bind(&new.last_name)
        .bind(&new.phone)
        .bind(Json(&new.preferences))
        .bind(&new.source)
        .bind(&new.unsubscribe_token)
        .fetch_optional(db)
        .await
    }

    /// Back to active, only from `unsubscribed`. `None` when the record is in any other state.
    pub async fn reactivate(
        db: &PgPool,
        id: Uuid,
        preferences: &NotificationPreferences,
    ) -> Result<Option<CourseNotification>, sqlx::Error> {
        sqlx::query_as::<_, CourseNotification>(
            r#"
            UPDATE course_notifications
            SET status = 'active', preferences = $2,
                unsubscribe_reason = NULL, unsubscribed_at = NULL, updated_at = now()
            WHERE id = $1 AND status = 'unsubscribed'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(Json(preferences))
        .fetch_optional(db)
        .await
    }

    pub async fn unsubscribe_by_token(
        db: &PgPool,
        token: &str,
        reason: &str,
    ) -> Result<Option<CourseNotification>, sqlx::Error> {
        sqlx::query_as::<_, CourseNotification>(
            r#"
            UPDATE course_notifications
            SET status = 'unsubscribed', unsubscribe_reason = $2,
                unsubscribed_at = now(), updated_at = now()
            WHERE unsubscribe_token = $1
            RETURNING *
            "#,
        )
        .bind(token)
        .bind(reason)
        .fetch_optional(db)
        .await
    }

    pub async fn unsubscribe_pair(
        db: &PgPool,
        email: &str,
        course_id: Uuid,
        reason: &str,
    ) -> Result<Option<CourseNotification>, sqlx::Error> {
        sqlx::query_as::<_, CourseNotification>(
            r#"
            UPDATE course_notifications
            SET status = 'unsubscribed', unsubscribe_reason = $3,
                unsubscribed_at = now(), updated_at = now()
            WHERE email = $1 AND course_id = $2
            RETURNING *
            "#,
        )
        .bind(email)
        .bind(course_id)
        .bind(reason)
        .fetch_optional(db)
        .await
    }

    /// Conversion stamp written by enrollment creation. False when no record matches.
    pub async fn mark_enrolled<'e, E: PgExecutor<'e>>(
        ex: E,
        email: &str,
        course_id: Uuid,
        value: f64,
    ) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            r#"
            UPDATE course_notifications
            SET status = 'enrolled', enrollment_date = now(),
                conversion_value = $3, updated_at = now()
            WHERE email = $1 AND course_id = $2 AND status <> 'enrolled'
            "#,
        )
        .bind(email)
        .bind(course_id)
        .bind(value)
        .execute(ex)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn append_scheduled(
        db: &PgPool,
        id: Uuid,
        entry: &ScheduledEntry,
    ) -> Result<Option<CourseNotification>, sqlx::Error> {
        sqlx::query_as::<_, CourseNotification>(
            r#"
            UPDATE course_notifications
            SET scheduled = scheduled || $2, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(Json(vec![entry]))
        .fetch_optional(db)
        .await
    }

    /// Active records holding at least one unsent entry scheduled at or before `now`.
    pub async fn list_ready(
        db: &PgPool,
        now: OffsetDateTime,
    ) -> Result<Vec<CourseNotification>, sqlx::Error> {
        sqlx::query_as::<_, CourseNotification>(
            r#"
            SELECT * FROM course_notifications
            WHERE status = 'active'
              AND EXISTS (
                SELECT 1 FROM jsonb_array_elements(scheduled) AS s
                WHERE NOT COALESCE((s ->> 'sent')::boolean, false)
                  AND (s ->> 'scheduledFor')::timestamptz <= $1
              )
            ORDER BY created_at
            "#,
        )
        .bind(now)
        .fetch_all(db)
        .await
    }

    /// Writes back history, scheduled entries and status after a dispatch or a tracked event.
    pub async fn save_delivery<'e, E: PgExecutor<'e>>(&self, ex: E) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE course_notifications
            SET history = $2, scheduled = $3, status = $4, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(&self.history)
        .bind(&self.scheduled)
        .bind(self.status)
        .execute(ex)
        .await?;
        Ok(())
    }

    pub async fn list_for_email(
        db: &PgPool,
        email: &str,
    ) -> Result<Vec<NotificationWithCourse>, sqlx::Error> {
        sqlx::query_as::<_, NotificationWithCourse>(
            r#"
            SELECT n.course_id, c.title AS course_title, c.status AS course_status,
                   n.notification_type, n.status, n.created_at
            FROM course_notifications n
            JOIN courses c ON c.id = n.course_id
            WHERE n.email = $1
            ORDER BY n.created_at DESC
            "#,
        )
        .bind(email)
        .fetch_all(db)
        .await
    }

    pub async fn count_by_status(db: &PgPool) -> Result<Vec<StatusTally>, sqlx::Error> {
        sqlx::query_as::<_, StatusTally>(
            "SELECT status, COUNT(*) AS count FROM course_notifications GROUP BY status ORDER BY status",
        )
        .fetch_all(db)
        .await
    }

    pub async fn count_by_type(db: &PgPool) -> Result<Vec<TypeTally>, sqlx::Error> {
        sqlx::query_as::<_, TypeTally>(
            r#"
            SELECT notification_type, COUNT(*) AS count
            FROM course_notifications
            GROUP BY notification_type
            ORDER BY notification_type
            "#,
        )
        .fetch_all(db)
        .await
    }
}
