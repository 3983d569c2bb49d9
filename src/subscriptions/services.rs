use time::OffsetDateTime;
use tracing::{info, warn};

use super::{
    dto::{
        BulkUnsubscribeResponse, EmailStatsResponse, SubscribeRequest, SubscribeResponse,
        SubscriptionStats, UnsubscribeRequest, UpdatePreferencesRequest,
    },
    repo_types::{EmailSubscription, NewSubscription, SubscriptionPreferences, SubscriptionStatus},
};
use crate::{
    auth::services::{generate_token, hash_token, normalize_email},
    courses::services::CATEGORIES,
    error::{AppError, AppResult, FieldError},
    mailer::{self, OutgoingEmail},
    notifications::{self, services::DEFAULT_UNSUBSCRIBE_REASON},
    state::AppState,
};

pub const SOURCES: &[&str] = &[
    "website",
    "popup",
    "course_page",
    "checkout",
    "referral",
    "social",
    "other",
];

pub const INTERESTS: &[&str] = &[
    "Web Development",
    "Mobile Development",
    "Data Science",
    "Machine Learning",
    "Design",
    "Business",
    "Marketing",
    "Photography",
    "Music",
    "Language",
    "Other",
];

pub const BULK_UNSUBSCRIBE_REASON: &str = "Bulk unsubscribe";

/// Who is asking, for the subscription record.
#[derive(Debug, Default, Clone)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

pub fn check_interests(interests: &[String]) -> Option<FieldError> {
    interests
        .iter()
        .find(|i| !INTERESTS.contains(&i.as_str()))
        .map(|i| FieldError::new("interests", format!("Unknown interest: {i}")))
}

pub fn check_categories(categories: &[String]) -> Option<FieldError> {
    categories
        .iter()
        .find(|c| !CATEGORIES.contains(&c.as_str()))
        .map(|c| FieldError::new("preferences.categories", format!("Unknown category: {c}")))
}

fn reason_or<'a>(reason: Option<&'a str>, default: &'a str) -> &'a str {
    reason.map(str::trim).filter(|r| !r.is_empty()).unwrap_or(default)
}

/// Fire-and-forget send; the recipient's sent counter moves only when the mail went out.
pub fn send_counted(state: &AppState, rendered: anyhow::Result<OutgoingEmail>) {
    let email = match rendered {
        Ok(email) => email,
        Err(e) => {
            warn!(error = ?e, "failed to render email");
            return;
        }
    };
    let db = state.db.clone();
    let to = email.to.clone();
    let handle = mailer::spawn_send(state.mailer.clone(), email);
    tokio::spawn(async move {
        if matches!(handle.await, Ok(true)) {
            if let Err(e) = EmailSubscription::record_sent(&db, &to).await {
                warn!(error = %e, %to, "failed to count sent email");
            }
        }
    });
}

/// New → `(response, true)`; unsubscribed → reactivated, `(response, false)`; otherwise conflict.
pub async fn subscribe(
    state: &AppState,
    req: SubscribeRequest,
    client: ClientInfo,
) -> AppResult<(SubscribeResponse, bool)> {
    let mut errors = Vec::new();
    if let Some(e) = check_interests(&req.interests) {
        errors.push(e);
    }
    if let Some(c) = req.preferences.categories.as_deref().and_then(check_categories) {
        errors.push(c);
    }
    if let Some(source) = req.source.as_deref() {
        if !SOURCES.contains(&source) {
            errors.push(FieldError::new("source", "Invalid source"));
        }
    }
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    let email = normalize_email(&req.email);
    let subscription_type = req.subscription_type.unwrap_or_default();
    let token = generate_token();
    let new = NewSubscription {
        email: email.clone(),
        first_name: req.first_name.as_deref().map(|s| s.trim().to_string()),
        last_name: req.last_name.as_deref().map(|s| s.trim().to_string()),
        subscription_type,
        interests: req.interests.clone(),
        source: req.source.clone().unwrap_or_else(|| "website".into()),
        referral_source: req.referral_source.clone(),
        ip_address: client.ip_address,
        user_agent: client.user_agent,
        preferences: req.preferences.apply(&SubscriptionPreferences::default()),
        unsubscribe_token: generate_token(),
        confirmation_token_hash: hash_token(&token),
    };

    if let Some(created) = EmailSubscription::insert_if_absent(&state.db, &new).await? {
        info!(subscription_id = %created.id, "email subscription created");
        send_counted(
            state,
            state.templates.subscription_confirmation(
                &created.email,
                &created.greeting_name(),
                created.subscription_type.label(),
                &token,
            ),
        );
        return Ok((
            SubscribeResponse {
                success: true,
                message: "Subscription successful! Please check your email to confirm.".into(),
                email: created.email,
                subscription_type: created.subscription_type,
                needs_confirmation: !created.is_confirmed,
            },
            true,
        ));
    }

    let existing = EmailSubscription::find_by_email(&state.db, &email)
        .await?
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("subscription vanished after conflict")))?;
    if existing.status.is_terminal() {
        warn!(subscription_id = %existing.id, status = ?existing.status, "subscribe to undeliverable address");
        return Err(undeliverable());
    }
    if existing.status != SubscriptionStatus::Unsubscribed {
        warn!(subscription_id = %existing.id, status = ?existing.status, "duplicate subscription");
        return Err(AppError::Conflict("Email already subscribed".into()));
    }
    let merged = req.preferences.apply(&existing.preferences.0);
    // a concurrent request may have reactivated it first
    let reactivated = EmailSubscription::reactivate(
        &state.db,
        existing.id,
        subscription_type,
        &req.interests,
        &merged,
    )
    .await?
    .ok_or_else(|| AppError::Conflict("Email already subscribed".into()))?;
    info!(subscription_id = %reactivated.id, "email subscription reactivated");
    Ok((
        SubscribeResponse {
            success: true,
            message: "Subscription reactivated successfully".into(),
            email: reactivated.email,
            subscription_type: reactivated.subscription_type,
            needs_confirmation: !reactivated.is_confirmed,
        },
        false,
    ))
}

pub async fn confirm(state: &AppState, token: &str) -> AppResult<EmailSubscription> {
    let sub = EmailSubscription::confirm_by_token_hash(&state.db, &hash_token(token))
        .await?
        .ok_or_else(|| {
            warn!("invalid or used confirmation token");
            AppError::BadRequest("Invalid or expired confirmation token".into())
        })?;
    info!(subscription_id = %sub.id, "email subscription confirmed");
    send_counted(
        state,
        state.templates.welcome(
            &sub.email,
            &sub.greeting_name(),
            sub.subscription_type.label(),
        ),
    );
    Ok(sub)
}

pub async fn unsubscribe(state: &AppState, req: UnsubscribeRequest) -> AppResult<EmailSubscription> {
    let reason = reason_or(req.reason.as_deref(), DEFAULT_UNSUBSCRIBE_REASON);
    let found = match (req.token.as_deref(), req.email.as_deref()) {
        (Some(token), _) => {
            match EmailSubscription::unsubscribe_by_token(&state.db, token, reason).await? {
                Some(sub) => Some(sub),
                None => EmailSubscription::find_by_unsubscribe_token(&state.db, token).await?,
            }
        }
        (None, Some(email)) => {
            let email = normalize_email(email);
            match EmailSubscription::unsubscribe_by_email(&state.db, &email, reason).await? {
                Some(sub) => Some(sub),
                None => EmailSubscription::find_by_email(&state.db, &email).await?,
            }
        }
        (None, None) => return Err(AppError::BadRequest("Provide a token or an email".into())),
    };
    let sub = found.ok_or_else(|| AppError::NotFound("Subscription not found".into()))?;
    if sub.status.is_terminal() {
        warn!(subscription_id = %sub.id, status = ?sub.status, "unsubscribe of undeliverable address");
        return Err(undeliverable());
    }
    info!(subscription_id = %sub.id, reason, "email subscription unsubscribed");
    Ok(sub)
}

fn undeliverable() -> AppError {
    AppError::Conflict("This address can no longer receive email".into())
}

pub async fn update_preferences(
    state: &AppState,
    req: UpdatePreferencesRequest,
) -> AppResult<EmailSubscription> {
    let mut errors = Vec::new();
    if let Some(e) = req.interests.as_deref().and_then(check_interests) {
        errors.push(e);
    }
    if let Some(e) = req
        .preferences
        .as_ref()
        .and_then(|p| p.categories.as_deref())
        .and_then(check_categories)
    {
        errors.push(e);
    }
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    let email = normalize_email(&req.email);
    let mut tx = state.db.begin().await?;
    let mut sub = EmailSubscription::lock_by_email(&mut *tx, &email)
        .await?
        .ok_or_else(|| AppError::NotFound("Subscription not found".into()))?;
    if let Some(patch) = req.preferences {
        sub.preferences.0 = patch.apply(&sub.preferences.0);
    }
    if let Some(interests) = req.interests {
        sub.interests = interests;
    }
    if let Some(kind) = req.subscription_type {
        sub.subscription_type = kind;
    }
    sub.save_preferences(&mut *tx).await?;
    tx.commit().await?;
    info!(subscription_id = %sub.id, "subscription preferences updated");
    Ok(sub)
}

pub async fn bulk_unsubscribe(
    state: &AppState,
    emails: &[String],
    reason: Option<&str>,
) -> AppResult<BulkUnsubscribeResponse> {
    let emails: Vec<String> = emails.iter().map(|e| normalize_email(e)).collect();
    let reason = reason_or(reason, BULK_UNSUBSCRIBE_REASON);
    let (matched, modified) = EmailSubscription::bulk_unsubscribe(&state.db, &emails, reason).await?;
    info!(matched, modified, "bulk unsubscribe");
    Ok(BulkUnsubscribeResponse {
        matched_count: matched,
        modified_count: modified,
    })
}

pub async fn stats(state: &AppState) -> AppResult<EmailStatsResponse> {
    let by_status = EmailSubscription::count_by_status(&state.db).await?;
    let by_source = EmailSubscription::count_by_source(&state.db).await?;
    let engagement = EmailSubscription::average_engagement(&state.db).await?;
    let count_of = |s: SubscriptionStatus| {
        by_status
            .iter()
            .find(|t| t.status == s)
            .map(|t| t.count)
            .unwrap_or(0)
    };
    let subscriptions = SubscriptionStats {
        total: count_of(SubscriptionStatus::Active),
        unsubscribed: count_of(SubscriptionStatus::Unsubscribed),
        by_status: by_status.into_iter().map(Into::into).collect(),
        by_source: by_source.into_iter().map(Into::into).collect(),
        average_engagement: engagement.into(),
    };
    let (course_notifications, conversion) = notifications::services::stats(state).await?;
    Ok(EmailStatsResponse {
        subscriptions,
        course_notifications,
        conversion,
        timestamp: OffsetDateTime::now_utc(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use sqlx::PgPool;

    use super::*;
    use crate::mailer::testing::RecordingMailer;

    #[test]
    fn interests_must_come_from_the_list() {
        assert!(check_interests(&["Design".into(), "Music".into()]).is_none());
        let err = check_interests(&["Design".into(), "Knitting".into()]).unwrap();
        assert_eq!(err.field, "interests");
        assert!(err.message.contains("Knitting"));
    }

    #[test]
    fn blank_reason_falls_back() {
        assert_eq!(reason_or(None, DEFAULT_UNSUBSCRIBE_REASON), "User requested");
        assert_eq!(reason_or(Some("  "), BULK_UNSUBSCRIBE_REASON), "Bulk unsubscribe");
        assert_eq!(reason_or(Some(" too many "), "x"), "too many");
    }

    fn state(pool: PgPool) -> AppState {
        AppState::with_pool(pool, Arc::new(RecordingMailer::default()))
    }

    fn subscribe_request(email: &str) -> SubscribeRequest {
        serde_json::from_value(json!({ "email": email })).unwrap()
    }

    fn by_email(email: &str) -> UnsubscribeRequest {
        UnsubscribeRequest {
            token: None,
            email: Some(email.into()),
            reason: None,
        }
    }

    async fn status_of(pool: &PgPool, email: &str) -> SubscriptionStatus {
        EmailSubscription::find_by_email(pool, email)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL"]
    async fn bounced_address_stays_bounced(pool: PgPool) {
        let st = state(pool.clone());
        subscribe(&st, subscribe_request("ada@example.com"), ClientInfo::default())
            .await
            .unwrap();
        EmailSubscription::set_delivery_status(&pool, "ada@example.com", SubscriptionStatus::Bounced)
            .await
            .unwrap();

        let err = unsubscribe(&st, by_email("ada@example.com")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)), "{err:?}");
        let token = EmailSubscription::find_by_email(&pool, "ada@example.com")
            .await
            .unwrap()
            .unwrap()
            .unsubscribe_token;
        let by_token = UnsubscribeRequest {
            token: Some(token),
            email: None,
            reason: None,
        };
        assert!(matches!(unsubscribe(&st, by_token).await, Err(AppError::Conflict(_))));

        let again = subscribe(&st, subscribe_request("ada@example.com"), ClientInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(again, AppError::Conflict(_)), "{again:?}");
        assert_eq!(status_of(&pool, "ada@example.com").await, SubscriptionStatus::Bounced);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL"]
    async fn bulk_unsubscribe_skips_terminal_rows(pool: PgPool) {
        let st = state(pool.clone());
        for email in ["ada@example.com", "grace@example.com"] {
            subscribe(&st, subscribe_request(email), ClientInfo::default())
                .await
                .unwrap();
        }
        EmailSubscription::set_delivery_status(
            &pool,
            "grace@example.com",
            SubscriptionStatus::Complained,
        )
        .await
        .unwrap();

        let emails = vec!["ada@example.com".to_string(), "grace@example.com".to_string()];
        let res = bulk_unsubscribe(&st, &emails, None).await.unwrap();
        assert_eq!(res.matched_count, 2);
        assert_eq!(res.modified_count, 1);
        assert_eq!(status_of(&pool, "ada@example.com").await, SubscriptionStatus::Unsubscribed);
        assert_eq!(status_of(&pool, "grace@example.com").await, SubscriptionStatus::Complained);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL"]
    async fn confirmation_token_works_once(pool: PgPool) {
        let st = state(pool.clone());
        let new = NewSubscription {
            email: "ada@example.com".into(),
            first_name: None,
            last_name: None,
            subscription_type: Default::default(),
            interests: Vec::new(),
            source: "website".into(),
            referral_source: None,
            ip_address: None,
            user_agent: None,
            preferences: SubscriptionPreferences::default(),
            unsubscribe_token: generate_token(),
            confirmation_token_hash: hash_token("raw-token"),
        };
        EmailSubscription::insert_if_absent(&pool, &new)
            .await
            .unwrap()
            .unwrap();

        let confirmed = confirm(&st, "raw-token").await.unwrap();
        assert!(confirmed.is_confirmed);
        let replay = confirm(&st, "raw-token").await.unwrap_err();
        assert!(matches!(replay, AppError::BadRequest(_)), "{replay:?}");
    }
}
