use sqlx::{types::Json, PgExecutor, PgPool};
use uuid::Uuid;

use super::repo_types::{
    Bookmark, Enrollment, EnrollmentStatus, NewEnrollment, Note, StatusCount,
};

impl Enrollment {
    pub async fn find_by_id<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
    ) -> Result<Option<Enrollment>, sqlx::Error> {
        sqlx::query_as::<_, Enrollment>("SELECT * FROM enrollments WHERE id = $1")
            .bind(id)
            .fetch_optional(ex)
            .await
    }

    pub async fn find_owned<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
        student_id: Uuid,
    ) -> Result<Option<Enrollment>, sqlx::Error> {
        sqlx::query_as::<_, Enrollment>(
            "SELECT * FROM enrollments WHERE id = $1 AND student_id = $2",
        )
        .bind(id)
        .bind(student_id)
        .fetch_optional(ex)
        .await
    }

    /// Owned row, locked until the transaction ends.
    pub async fn lock_owned<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
        student_id: Uuid,
    ) -> Result<Option<Enrollment>, sqlx::Error> {
        sqlx::query_as::<_, Enrollment>(
            "SELECT * FROM enrollments WHERE id = $1 AND student_id = $2 FOR UPDATE",
        )
        .bind(id)
        .bind(student_id)
        .fetch_optional(ex)
        .await
    }

    pub async fn lock<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
    ) -> Result<Option<Enrollment>, sqlx::Error> {
        sqlx::query_as::<_, Enrollment>("SELECT * FROM enrollments WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(ex)
            .await
    }

    pub async fn find_pair<'e, E: PgExecutor<'e>>(
        ex: E,
        student_id: Uuid,
        course_id: Uuid,
    ) -> Result<Option<Enrollment>, sqlx::Error> {
        sqlx::query_as::<_, Enrollment>(
            "SELECT * FROM enrollments WHERE student_id = $1 AND course_id = $2",
        )
        .bind(student_id)
        .bind(course_id)
        .fetch_optional(ex)
        .await
    }

    /// `None` when an enrollment for the pair already exists; the unique key decides.
    pub async fn insert_if_absent<'e, E: PgExecutor<'e>>(
        ex: E,
        new: &NewEnrollment,
    ) -> Result<Option<Enrollment>, sqlx::Error> {
        sqlx::query_as::<_, Enrollment>(
            r#"
            INSERT INTO enrollments (student_id, course_id, payment_amount, payment_currency,
                                     payment_method, payment_status, payment_date,
                                     transaction_id, coupon_code, source, referral_code)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT ON CONSTRAINT enrollments_student_course_key DO NOTHING
            RETURNING *
            "#,
        )
        .bind(new.student_id)
        .bind(new.course_id)
        .bind(new.payment_amount)
        .bind(&new.payment_currency)
        .bind(new.payment_method)
        .bind(new.payment_status)
        .bind(new.payment_date)
        .bind(&new.transaction_id)
        .bind(&new.coupon_code)
        .bind(new.source)
        .bind(&new.referral_code)
        .fetch_optional(ex)
        .await
    }

    /// Writes back everything a progress update can change.
    pub async fn save_progress<'e, E: PgExecutor<'e>>(&self, ex: E) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE enrollments SET
                completed_lectures   = $2,
                current_lecture      = $3,
                percentage_completed = $4,
                total_time_spent     = $5,
                last_accessed_at     = $6,
                status               = $7,
                completion_date      = $8,
                certificate_eligible = $9,
                updated_at           = now()
            WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(&self.completed_lectures)
        .bind(&self.current_lecture)
        .bind(self.percentage_completed)
        .bind(self.total_time_spent)
        .bind(self.last_accessed_at)
        .bind(self.status)
        .bind(self.completion_date)
        .bind(self.certificate_eligible)
        .execute(ex)
        .await?;
        Ok(())
    }

    pub async fn save_certificate<'e, E: PgExecutor<'e>>(&self, ex: E) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE enrollments SET
                certificate_issued    = $2,
                certificate_id        = $3,
                certificate_issued_at = $4,
                certificate_url       = $5,
                updated_at            = now()
            WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(self.certificate_issued)
        .bind(&self.certificate_id)
        .bind(self.certificate_issued_at)
        .bind(&self.certificate_url)
        .execute(ex)
        .await?;
        Ok(())
    }

    /// Appends in one statement; returns the full list, or `None` if the caller does not own it.
    pub async fn append_note(
        db: &PgPool,
        id: Uuid,
        student_id: Uuid,
        note: Note,
    ) -> Result<Option<Vec<Note>>, sqlx::Error> {
        let row: Option<(Json<Vec<Note>>,)> = sqlx::query_as(
            r#"
            UPDATE enrollments
            SET notes = notes || $3, last_accessed_at = now(), updated_at = now()
            WHERE id = $1 AND student_id = $2
            RETURNING notes
            "#,
        )
        .bind(id)
        .bind(student_id)
        .bind(Json(vec![note]))
        .fetch_optional(db)
        .await?;
        Ok(row.map(|(notes,)| notes.0))
    }

    pub async fn save_bookmarks<'e, E: PgExecutor<'e>>(&self, ex: E) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE enrollments SET bookmarks = $2, last_accessed_at = now(), updated_at = now() WHERE id = $1",
        )
        .bind(self.id)
        .bind(&self.bookmarks)
        .execute(ex)
        .await?;
        Ok(())
    }

    pub async fn set_rating<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
        value: i16,
        review: Option<&str>,
    ) -> Result<Enrollment, sqlx::Error> {
        sqlx::query_as::<_, Enrollment>(
            r#"
            UPDATE enrollments
            SET rating_value = $2, rating_review = $3, rating_date = now(), updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(value)
        .bind(review)
        .fetch_one(ex)
        .await
    }

    pub async fn set_status<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
        status: EnrollmentStatus,
    ) -> Result<Enrollment, sqlx::Error> {
        sqlx::query_as::<_, Enrollment>(
            "UPDATE enrollments SET status = $2, updated_at = now() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(status)
        .fetch_one(ex)
        .await
    }

    pub async fn delete<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<bool, sqlx::Error> {
        let res = sqlx::query("DELETE FROM enrollments WHERE id = $1")
            .bind(id)
            .execute(ex)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn list_for_student(
        db: &PgPool,
        student_id: Uuid,
        status: Option<EnrollmentStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Enrollment>, sqlx::Error> {
        sqlx::query_as::<_, Enrollment>(
            r#"
            SELECT * FROM enrollments
            WHERE student_id = $1
              AND ($2::enrollment_status IS NULL OR status = $2)
            ORDER BY last_accessed_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(student_id)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(db)
        .await
    }

    pub async fn count_by_status(
        db: &PgPool,
        course_id: Option<Uuid>,
    ) -> Result<Vec<StatusCount>, sqlx::Error> {
        sqlx::query_as::<_, StatusCount>(
            r#"
            SELECT status, COUNT(*) AS count
            FROM enrollments
            WHERE $1::uuid IS NULL OR course_id = $1
            GROUP BY status
            ORDER BY status
            "#,
        )
        .bind(course_id)
        .fetch_all(db)
        .await
    }

    pub async fn average_completion(db: &PgPool, course_id: Option<Uuid>) -> Result<f64, sqlx::Error> {
        let row: (Option<f64>,) = sqlx::query_as(
            r#"
            SELECT AVG(percentage_completed)::float8
            FROM enrollments
            WHERE $1::uuid IS NULL OR course_id = $1
            "#,
        )
        .bind(course_id)
        .fetch_one(db)
        .await?;
        Ok(row.0.unwrap_or(0.0))
    }
}

impl Bookmark {
    pub fn default_title(existing: usize) -> String {
        format!("Bookmark {}", existing + 1)
    }
}
