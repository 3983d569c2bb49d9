use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use validator::Validate;

use super::repo::{AverageEngagement, SourceTally, StatusTally};
use super::repo_types::{
    EmailSubscription, Frequency, SubscriptionPreferences, SubscriptionStatus, SubscriptionType,
};
use crate::notifications::dto::{ConversionStats, NotificationStats, NotificationSummary};

/// Partial preferences; unset fields keep their current value.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesPatch {
    pub frequency: Option<Frequency>,
    pub categories: Option<Vec<String>>,
    pub time_zone: Option<String>,
    pub language: Option<String>,
}

impl PreferencesPatch {
    pub fn apply(&self, base: &SubscriptionPreferences) -> SubscriptionPreferences {
        SubscriptionPreferences {
            frequency: self.frequency.unwrap_or(base.frequency),
            categories: self.categories.clone().unwrap_or_else(|| base.categories.clone()),
            time_zone: self.time_zone.clone().or_else(|| base.time_zone.clone()),
            language: self.language.clone().unwrap_or_else(|| base.language.clone()),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    #[validate(email(message = "Please provide a valid email address"))]
    pub email: String,
    #[validate(length(min = 1, max = 50, message = "First name must be between 1 and 50 characters"))]
    pub first_name: Option<String>,
    #[validate(length(min = 1, max = 50, message = "Last name must be between 1 and 50 characters"))]
    pub last_name: Option<String>,
    pub subscription_type: Option<SubscriptionType>,
    #[serde(default)]
    pub interests: Vec<String>,
    pub source: Option<String>,
    #[validate(length(max = 200, message = "Referral source is too long"))]
    pub referral_source: Option<String>,
    #[serde(default)]
    pub preferences: PreferencesPatch,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    pub success: bool,
    pub message: String,
    pub email: String,
    pub subscription_type: SubscriptionType,
    pub needs_confirmation: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmResponse {
    pub success: bool,
    pub message: String,
    pub email: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub confirmed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    pub token: Option<String>,
    pub email: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeResponse {
    pub success: bool,
    pub message: String,
    pub email: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub unsubscribe_date: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePreferencesRequest {
    #[validate(email(message = "Please provide a valid email address"))]
    pub email: String,
    pub preferences: Option<PreferencesPatch>,
    pub interests: Option<Vec<String>>,
    pub subscription_type: Option<SubscriptionType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEvent {
    Bounce,
    Complaint,
}

impl DeliveryEvent {
    pub fn status(self) -> SubscriptionStatus {
        match self {
            DeliveryEvent::Bounce => SubscriptionStatus::Bounced,
            DeliveryEvent::Complaint => SubscriptionStatus::Complained,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct DeliveryWebhook {
    #[validate(email(message = "Please provide a valid email address"))]
    pub email: String,
    pub event: DeliveryEvent,
}

#[derive(Debug, Deserialize, Validate)]
pub struct BulkUnsubscribeRequest {
    #[validate(length(min = 1, max = 1000, message = "Provide between 1 and 1000 emails"))]
    pub emails: Vec<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUnsubscribeResponse {
    pub matched_count: i64,
    pub modified_count: u64,
}

/// Subscription with its read-time engagement figures.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub subscription_type: SubscriptionType,
    pub status: SubscriptionStatus,
    pub is_confirmed: bool,
    pub interests: Vec<String>,
    pub source: String,
    pub preferences: SubscriptionPreferences,
    pub total_sent: i32,
    pub total_opened: i32,
    pub total_clicked: i32,
    pub open_rate: i64,
    pub click_rate: i64,
    pub engagement_score: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<EmailSubscription> for SubscriptionView {
    fn from(s: EmailSubscription) -> Self {
        Self {
            id: s.id,
            full_name: s.full_name(),
            open_rate: s.open_rate(),
            click_rate: s.click_rate(),
            engagement_score: s.engagement_score(),
            email: s.email,
            subscription_type: s.subscription_type,
            status: s.status,
            is_confirmed: s.is_confirmed,
            interests: s.interests,
            source: s.source,
            preferences: s.preferences.0,
            total_sent: s.total_sent,
            total_opened: s.total_opened,
            total_clicked: s.total_clicked,
            created_at: s.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub subscription: Option<SubscriptionView>,
    pub course_notifications: Vec<NotificationSummary>,
}

#[derive(Debug, Serialize)]
pub struct StatusCountView {
    pub status: SubscriptionStatus,
    pub count: i64,
}

impl From<StatusTally> for StatusCountView {
    fn from(t: StatusTally) -> Self {
        Self {
            status: t.status,
            count: t.count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SourceCountView {
    pub source: String,
    pub count: i64,
}

impl From<SourceTally> for SourceCountView {
    fn from(t: SourceTally) -> Self {
        Self {
            source: t.source,
            count: t.count,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementView {
    pub avg_open_rate: f64,
    pub avg_click_rate: f64,
}

impl From<AverageEngagement> for EngagementView {
    fn from(a: AverageEngagement) -> Self {
        Self {
            avg_open_rate: (a.avg_open_rate * 100.0).round() / 100.0,
            avg_click_rate: (a.avg_click_rate * 100.0).round() / 100.0,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStats {
    pub total: i64,
    pub unsubscribed: i64,
    pub by_status: Vec<StatusCountView>,
    pub by_source: Vec<SourceCountView>,
    pub average_engagement: EngagementView,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailStatsResponse {
    pub subscriptions: SubscriptionStats,
    pub course_notifications: NotificationStats,
    pub conversion: ConversionStats,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::repo_types::fixtures::subscription;
    use time::macros::datetime;

    #[test]
    fn patch_overrides_only_given_fields() {
        let base = SubscriptionPreferences {
            frequency: Frequency::Monthly,
            categories: vec!["Design".into()],
            time_zone: Some("Europe/Berlin".into()),
            language: "de".into(),
        };
        let patch: PreferencesPatch = serde_json::from_str(r#"{"frequency":"never"}"#).unwrap();
        let merged = patch.apply(&base);
        assert_eq!(merged.frequency, Frequency::Never);
        assert_eq!(merged.categories, vec!["Design".to_string()]);
        assert_eq!(merged.language, "de");
    }

    #[test]
    fn webhook_events_map_to_terminal_states() {
        let w: DeliveryWebhook =
            serde_json::from_str(r#"{"email":"a@b.co","event":"complaint"}"#).unwrap();
        assert_eq!(w.event.status(), SubscriptionStatus::Complained);
        assert_eq!(DeliveryEvent::Bounce.status(), SubscriptionStatus::Bounced);
        assert!(serde_json::from_str::<DeliveryWebhook>(r#"{"email":"a@b.co","event":"open"}"#).is_err());
    }

    #[test]
    fn view_carries_derived_fields() {
        let mut s = subscription(datetime!(2024-01-01 0:00 UTC));
        s.total_sent = 4;
        s.total_opened = 2;
        let json = serde_json::to_value(SubscriptionView::from(s)).unwrap();
        assert_eq!(json["openRate"], 50);
        assert_eq!(json["engagementScore"], 30);
        assert_eq!(json["fullName"], "grace");
        assert_eq!(json["preferences"]["frequency"], "weekly");
    }
}
