use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    #[default]
    Newsletter,
    CourseNotifications,
    Marketing,
    All,
}

impl SubscriptionType {
    pub fn label(self) -> &'static str {
        match self {
            SubscriptionType::Newsletter => "newsletter",
            SubscriptionType::CourseNotifications => "course notification",
            SubscriptionType::Marketing => "marketing",
            SubscriptionType::All => "email",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Unsubscribed,
    Bounced,
    Complained,
}

impl SubscriptionStatus {
    /// Provider feedback states; only a webhook moves a row into them and nothing moves it out.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Bounced | Self::Complained)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    #[default]
    Weekly,
    Monthly,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPreferences {
    #[serde(default)]
    pub frequency: Frequency,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for SubscriptionPreferences {
    fn default() -> Self {
        Self {
            frequency: Frequency::default(),
            categories: Vec::new(),
            time_zone: None,
            language: default_language(),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct EmailSubscription {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub subscription_type: SubscriptionType,
    pub status: SubscriptionStatus,
    pub interests: Vec<String>,
    pub source: String,
    pub referral_source: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub preferences: Json<SubscriptionPreferences>,
    pub total_sent: i32,
    pub total_opened: i32,
    pub total_clicked: i32,
    pub last_sent_at: Option<OffsetDateTime>,
    pub last_opened_at: Option<OffsetDateTime>,
    pub last_clicked_at: Option<OffsetDateTime>,
    pub unsubscribe_token: String,
    pub unsubscribe_reason: Option<String>,
    pub unsubscribed_at: Option<OffsetDateTime>,
    pub confirmation_token_hash: Option<String>,
    pub is_confirmed: bool,
    pub confirmed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

fn rate(part: i32, sent: i32) -> f64 {
    if sent <= 0 {
        return 0.0;
    }
    part as f64 / sent as f64
}

impl EmailSubscription {
    pub fn open_rate(&self) -> i64 {
        (rate(self.total_opened, self.total_sent) * 100.0).round() as i64
    }

    pub fn click_rate(&self) -> i64 {
        (rate(self.total_clicked, self.total_sent) * 100.0).round() as i64
    }

    /// Opens weigh 0.6, clicks 0.4.
    pub fn engagement_score(&self) -> i64 {
        let opened = rate(self.total_opened, self.total_sent);
        let clicked = rate(self.total_clicked, self.total_sent);
        ((opened * 0.6 + clicked * 0.4) * 100.0).round() as i64
    }

    pub fn full_name(&self) -> String {
        crate::notifications::lifecycle::full_name(
            self.first_name.as_deref(),
            self.last_name.as_deref(),
            &self.email,
        )
    }

    pub fn greeting_name(&self) -> String {
        crate::notifications::lifecycle::full_name(self.first_name.as_deref(), None, &self.email)
    }
}

pub struct NewSubscription {
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub subscription_type: SubscriptionType,
    pub interests: Vec<String>,
    pub source: String,
    pub referral_source: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub preferences: SubscriptionPreferences,
    pub unsubscribe_token: String,
    pub confirmation_token_hash: String,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn subscription(now: OffsetDateTime) -> EmailSubscription {
        EmailSubscription {
            id: Uuid::new_v4(),
            email: "grace@example.com".into(),
            first_name: None,
            last_name: None,
            subscription_type: SubscriptionType::Newsletter,
            status: SubscriptionStatus::Active,
            interests: vec![],
            source: "website".into(),
            referral_source: None,
            ip_address: None,
            user_agent: None,
            preferences: Json(SubscriptionPreferences::default()),
            total_sent: 0,
            total_opened: 0,
            total_clicked: 0,
            last_sent_at: None,
            last_opened_at: None,
            last_clicked_at: None,
            unsubscribe_token: "unsub".into(),
            unsubscribe_reason: None,
            unsubscribed_at: None,
            confirmation_token_hash: None,
            is_confirmed: false,
            confirmed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::subscription;
    use super::*;
    use time::macros::datetime;

    #[test]
    fn rates_are_zero_when_nothing_was_sent() {
        let s = subscription(datetime!(2024-01-01 0:00 UTC));
        assert_eq!(s.open_rate(), 0);
        assert_eq!(s.click_rate(), 0);
        assert_eq!(s.engagement_score(), 0);
    }

    #[test]
    fn engagement_weighs_opens_and_clicks() {
        let mut s = subscription(datetime!(2024-01-01 0:00 UTC));
        s.total_sent = 3;
        s.total_opened = 2;
        s.total_clicked = 1;
        assert_eq!(s.open_rate(), 67);
        assert_eq!(s.click_rate(), 33);
        // (0.6667 * 0.6 + 0.3333 * 0.4) * 100 = 53.33
        assert_eq!(s.engagement_score(), 53);
    }

    #[test]
    fn full_name_falls_back_to_local_part() {
        let mut s = subscription(datetime!(2024-01-01 0:00 UTC));
        assert_eq!(s.full_name(), "grace");
        s.first_name = Some("Grace".into());
        assert_eq!(s.full_name(), "Grace");
        s.last_name = Some("Hopper".into());
        assert_eq!(s.full_name(), "Grace Hopper");
        assert_eq!(s.greeting_name(), "Grace");
    }

    #[test]
    fn preferences_fill_defaults() {
        let p: SubscriptionPreferences = serde_json::from_str(r#"{"frequency":"daily"}"#).unwrap();
        assert_eq!(p.frequency, Frequency::Daily);
        assert_eq!(p.language, "en");
        assert!(p.categories.is_empty());
    }
}
