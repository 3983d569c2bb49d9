use sqlx::{types::Json, PgExecutor, PgPool};
use uuid::Uuid;

use super::repo_types::{
    EmailSubscription, NewSubscription, SubscriptionPreferences, SubscriptionStatus,
    SubscriptionType,
};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StatusTally {
    pub status: SubscriptionStatus,
    pub count: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SourceTally {
    pub source: String,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, Default, sqlx::FromRow)]
pub struct AverageEngagement {
    pub avg_open_rate: f64,
    pub avg_click_rate: f64,
}

impl EmailSubscription {
    pub async fn find_by_email<'e, E: PgExecutor<'e>>(
        ex: E,
        email: &str,
    ) -> Result<Option<EmailSubscription>, sqlx::Error> {
        sqlx::query_as::<_, EmailSubscription>("SELECT * FROM email_subscriptions WHERE email = $1")
            .bind(email)
            .fetch_optional(ex)
            .await
    }

    pub async fn find_by_unsubscribe_token<'e, E: PgExecutor<'e>>(
        ex: E,
        token: &str,
    ) -> Result<Option<EmailSubscription>, sqlx::Error> {
        sqlx::query_as::<_, EmailSubscription>(
            "SELECT * FROM email_subscriptions WHERE unsubscribe_token = $1",
        )
        .bind(token)
        .fetch_optional(ex)
        .await
    }

    pub async fn lock_by_email<'e, E: PgExecutor<'e>>(
        ex: E,
        email: &str,
    ) -> Result<Option<EmailSubscription>, sqlx::Error> {
        sqlx::query_as::<_, EmailSubscription>(
            "SELECT * FROM email_subscriptions WHERE email = $1 FOR UPDATE",
        )
        .bind(email)
        .fetch_optional(ex)
        .await
    }

    /// `None` when the email is already on the list.
    pub async fn insert_if_absent(
        db: &PgPool,
        new: &NewSubscription,
    ) -> Result<Option<EmailSubscription>, sqlx::Error> {
        sqlx::query_as::<_, EmailSubscription>(
            r#"
            INSERT INTO email_subscriptions
                (email, first_name, last_name, subscription_type, interests, source,
                 referral_source, ip_address, user_agent, preferences,
                 unsubscribe_token, confirmation_token_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (email) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&new.email)
        .bind(&new.first_name)
        .bind(&new.last_name)
        .bind(new.subscription_type)
        .bind(&new.interests)
        .bind(&new.source)
        .bind(&new.referral_source)
        .bind(&new.ip_address)
        .bind(&new.user_agent)
        .bind(Json(&new.preferences))
        .bind(&new.unsubscribe_token)
        .bind(&new.confirmation_token_hash)
        .fetch_optional(db)
        .await
    }

    /// Only from `unsubscribed`; `None` for any other state.
    pub async fn reactivate(
        db: &PgPool,
        id: Uuid,
        subscription_type: SubscriptionType,
        interests: &[String],
        preferences: &SubscriptionPreferences,
    ) -> Result<Option<EmailSubscription>, sqlx::Error> {
        sqlx::query_as::<_, EmailSubscription>(
            r#"
            UPDATE email_subscriptions
            SET status = 'active', subscription_type = $2, interests = $3, preferences = $4,
                unsubscribe_reason = NULL, unsubscribed_at = NULL, updated_at = now()
            WHERE id = $1 AND status = 'unsubscribed'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(subscription_type)
        .bind(interests)
        .bind(Json(preferences))
        .fetch_optional(db)
        .await
    }

    /// Single use: the hash is cleared in the same statement that confirms.
    pub async fn confirm_by_token_hash(
        db: &PgPool,
        token_hash: &str,
    ) -> Result<Option<EmailSubscription>, sqlx::Error> {
        sqlx::query_as::<_, EmailSubscription>(
            r#"
            UPDATE email_subscriptions
            SET is_confirmed = TRUE, confirmed_at = now(),
                confirmation_token_hash = NULL, updated_at = now()
            WHERE confirmation_token_hash = $1 AND NOT is_confirmed
            RETURNING *
            "#,
        )
        .bind(token_hash)
        .fetch_optional(db)
        .await
    }

    pub async fn unsubscribe_by_token(
        db: &PgPool,
        token: &str,
        reason: &str,
    ) -> Result<Option<EmailSubscription>, sqlx::Error> {
        sqlx::query_as::<_, EmailSubscription>(
            r#"
            UPDATE email_subscriptions
            SET status = 'unsubscribed', unsubscribe_reason = $2,
                unsubscribed_at = now(), updated_at = now()
            WHERE unsubscribe_token = $1 AND status IN ('active', 'unsubscribed')
            RETURNING *
            "#,
        )
        .bind(token)
        .bind(reason)
        .fetch_optional(db)
        .await
    }

    pub async fn unsubscribe_by_email(
        db: &PgPool,
        email: &str,
        reason: &str,
    ) -> Result<Option<EmailSubscription>, sqlx::Error> {
        sqlx::query_as::<_, EmailSubscription>(
            r#"
            UPDATE email_subscriptions
            SET status = 'unsubscribed', unsubscribe_reason = $2,
                unsubscribed_at = now(), updated_at = now()
            WHERE email = $1 AND status IN ('active', 'unsubscribed')
            RETURNING *
            "#,
        )
        .bind(email)
        .bind(reason)
        .fetch_optional(db)
        .await
    }

    /// Returns (matched, modified); only active rows move, bounced and complained rows stay put.
    pub async fn bulk_unsubscribe(
        db: &PgPool,
        emails: &[String],
        reason: &str,
    ) -> Result<(i64, u64), sqlx::Error> {
        let mut tx = db.begin().await?;
        let matched: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM email_subscriptions WHERE email = ANY($1)")
                .bind(emails)
                .fetch_one(&mut *tx)
                .await?;
        let modified = sqlx::query(
            r#"
            UPDATE email_subscriptions
            SET status = 'unsubscribed', unsubscribe_reason = $2,
                unsubscribed_at = now(), updated_at = now()
            WHERE email = ANY($1) AND status = 'active'
            "#,
        )
        .bind(emails)
        .bind(reason)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok((matched.0, modified))
    }

    pub async fn save_preferences<'e, E: PgExecutor<'e>>(&self, ex: E) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE email_subscriptions
            SET preferences = $2, interests = $3, subscription_type = $4, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(&self.preferences)
        .bind(&self.interests)
        .bind(self.subscription_type)
        .execute(ex)
        .await?;
        Ok(())
    }

    /// Provider feedback: `bounced` or `complained`.
    pub async fn set_delivery_status(
        db: &PgPool,
        email: &str,
        status: SubscriptionStatus,
    ) -> Result<Option<EmailSubscription>, sqlx::Error> {
        sqlx::query_as::<_, EmailSubscription>(
            "UPDATE email_subscriptions SET status = $2, updated_at = now() WHERE email = $1 RETURNING *",
        )
        .bind(email)
        .bind(status)
        .fetch_optional(db)
        .await
    }

    pub async fn record_sent(db: &PgPool, email: &str) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE email_subscriptions SET total_sent = total_sent + 1, last_sent_at = now() WHERE email = $1",
        )
        .bind(email)
        .execute(db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn record_open(db: &PgPool, email: &str) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE email_subscriptions SET total_opened = total_opened + 1, last_opened_at = now() WHERE email = $1",
        )
        .bind(email)
        .execute(db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn record_click(db: &PgPool, email: &str) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE email_subscriptions SET total_clicked = total_clicked + 1, last_clicked_at = now() WHERE email = $1",
        )
        .bind(email)
        .execute(db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn count_by_status(db: &PgPool) -> Result<Vec<StatusTally>, sqlx::Error> {
        sqlx::query_as::<_, StatusTally>(
            "SELECT status, COUNT(*) AS count FROM email_subscriptions GROUP BY status ORDER BY status",
        )
        .fetch_all(db)
        .await
    }

    pub async fn count_by_source(db: &PgPool) -> Result<Vec<SourceTally>, sqlx::Error> {
        sqlx::query_as::<_, SourceTally>(
            "SELECT source, COUNT(*) AS count FROM email_subscriptions GROUP BY source ORDER BY count DESC, source",
        )
        .fetch_all(db)
        .await
    }

    /// Mean per-subscriber open and click rates over active subscribers.
    pub async fn average_engagement(db: &PgPool) -> Result<AverageEngagement, sqlx::Error> {
        sqlx::query_as::<_, AverageEngagement>(
            r#"
            SELECT
                COALESCE(AVG(CASE WHEN total_sent > 0
                    THEN ROUND(total_opened * 100.0 / total_sent) ELSE 0 END), 0)::float8 AS avg_open_rate,
                COALESCE(AVG(CASE WHEN total_sent > 0
                    THEN ROUND(total_clicked * 100.0 / total_sent) ELSE 0 END), 0)::float8 AS avg_click_rate
            FROM email_subscriptions
            WHERE status = 'active'
            "#,
        )
        .fetch_one(db)
        .await
    }
}
