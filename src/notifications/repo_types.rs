use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "notification_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    #[default]
    Launch,
    EarlyAccess,
    PriceDrop,
    EnrollmentReminder,
    GeneralUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "notification_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Active,
    Notified,
    Enrolled,
    Unsubscribed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Push,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Failed,
    Bounced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPreferences {
    pub email_notification: bool,
    pub sms_notification: bool,
    pub notify_on_launch: bool,
    pub notify_on_early_access: bool,
    pub notify_on_discount: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            email_notification: true,
            sms_notification: false,
            notify_on_launch: true,
            notify_on_early_access: true,
            notify_on_discount: true,
        }
    }
}

/// An open or a click on a delivered notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub channel: Channel,
    pub subject: String,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub opens: Vec<TrackEvent>,
    #[serde(default)]
    pub clicks: Vec<TrackEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEntry {
    pub id: Uuid,
    pub kind: NotificationType,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_for: OffsetDateTime,
    pub content: String,
    #[serde(default)]
    pub sent: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub sent_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CourseNotification {
    pub id: Uuid,
    pub email: String,
    pub course_id: Uuid,
    pub notification_type: NotificationType,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub status: NotificationStatus,
    pub preferences: Json<NotificationPreferences>,
    pub source: String,
    pub history: Json<Vec<HistoryEntry>>,
    pub scheduled: Json<Vec<ScheduledEntry>>,
    pub unsubscribe_token: String,
    pub unsubscribe_reason: Option<String>,
    pub unsubscribed_at: Option<OffsetDateTime>,
    pub enrollment_date: Option<OffsetDateTime>,
    pub conversion_value: Option<f64>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

pub struct NewNotification {
    pub email: String,
    pub course_id: Uuid,
    pub notification_type: NotificationType,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub preferences: NotificationPreferences,
    pub source: String,
    pub unsubscribe_token: String,
}

/// A record joined with its course, for the per-email status view.
#[derive(Debug, Clone, FromRow)]
pub struct NotificationWithCourse {
    pub course_id: Uuid,
    pub course_title: String,
    pub course_status: crate::courses::repo_types::CourseStatus,
    pub notification_type: NotificationType,
    pub status: NotificationStatus,
    pub created_at: OffsetDateTime,
}
