use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use validator::Validate;

use super::lifecycle::{engagement, full_name};
use super::repo::{StatusTally, TypeTally};
use super::repo_types::{
    CourseNotification, HistoryEntry, NotificationPreferences, NotificationStatus,
    NotificationType, NotificationWithCourse, ScheduledEntry,
};
use crate::courses::repo_types::CourseStatus;

/// Partial preferences; unset fields keep their current or default value.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesPatch {
    pub email_notification: Option<bool>,
    pub sms_notification: Option<bool>,
    pub notify_on_launch: Option<bool>,
    pub notify_on_early_access: Option<bool>,
    pub notify_on_discount: Option<bool>,
}

impl PreferencesPatch {
    pub fn apply(&self, base: &NotificationPreferences) -> NotificationPreferences {
        NotificationPreferences {
            email_notification: self.email_notification.unwrap_or(base.email_notification),
            sms_notification: self.sms_notification.unwrap_or(base.sms_notification),
            notify_on_launch: self.notify_on_launch.unwrap_or(base.notify_on_launch),
            notify_on_early_access: self.notify_on_early_access.unwrap_or(base.notify_on_early_access),
            notify_on_discount: self.notify_on_discount.unwrap_or(base.notify_on_discount),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NotifySubscribeRequest {
    #[validate(email(message = "Please provide a valid email address"))]
    pub email: String,
    pub course_id: Uuid,
    pub notification_type: Option<NotificationType>,
    #[validate(length(min = 1, max = 50, message = "First name cannot exceed 50 characters"))]
    pub first_name: Option<String>,
    #[validate(length(min = 1, max = 50, message = "Last name cannot exceed 50 characters"))]
    pub last_name: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub preferences: PreferencesPatch,
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyUnsubscribeRequest {
    pub token: Option<String>,
    pub email: Option<String>,
    pub course_id: Option<Uuid>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub kind: NotificationType,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_for: OffsetDateTime,
    #[validate(length(min = 1, max = 5000, message = "Content must be 1-5000 characters"))]
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifySubscribeResponse {
    pub success: bool,
    pub message: String,
    pub email: String,
    pub course_id: Uuid,
    pub notification_type: NotificationType,
    pub reactivated: bool,
}

/// A record with its read-time engagement figures.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationResponse {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub course_id: Uuid,
    pub notification_type: NotificationType,
    pub status: NotificationStatus,
    pub preferences: NotificationPreferences,
    pub source: String,
    pub history: Vec<HistoryEntry>,
    pub scheduled: Vec<ScheduledEntry>,
    pub notification_count: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_notification_at: Option<OffsetDateTime>,
    pub open_rate: i64,
    pub click_rate: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub unsubscribed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub enrollment_date: Option<OffsetDateTime>,
    pub conversion_value: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<CourseNotification> for NotificationResponse {
    fn from(n: CourseNotification) -> Self {
        let e = engagement(&n.history.0);
        Self {
            id: n.id,
            full_name: full_name(n.first_name.as_deref(), n.last_name.as_deref(), &n.email),
            email: n.email,
            course_id: n.course_id,
            notification_type: n.notification_type,
            status: n.status,
            preferences: n.preferences.0,
            source: n.source,
            history: n.history.0,
            scheduled: n.scheduled.0,
            notification_count: e.notification_count,
            last_notification_at: e.last_notification_at,
            open_rate: e.open_rate,
            click_rate: e.click_rate,
            unsubscribed_at: n.unsubscribed_at,
            enrollment_date: n.enrollment_date,
            conversion_value: n.conversion_value,
            created_at: n.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSummary {
    pub course_id: Uuid,
    pub course_title: String,
    pub course_status: CourseStatus,
    pub notification_type: NotificationType,
    pub status: NotificationStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<NotificationWithCourse> for NotificationSummary {
    fn from(n: NotificationWithCourse) -> Self {
        Self {
            course_id: n.course_id,
            course_title: n.course_title,
            course_status: n.course_status,
            notification_type: n.notification_type,
            status: n.status,
            created_at: n.created_at,
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub records: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusCountView {
    pub status: NotificationStatus,
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
pub struct TypeCountView {
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub count: i64,
}

impl From<TypeTally> for TypeCountView {
    fn from(t: TypeTally) -> Self {
        Self {
            notification_type: t.notification_type,
            count: t.count,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStats {
    pub total: i64,
    pub active: i64,
    pub by_status: Vec<StatusCountView>,
    pub by_type: Vec<TypeCountView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionStats {
    pub total_notified: i64,
    pub total_enrolled: i64,
    pub conversion_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::lifecycle::fixtures::record;
    use time::macros::datetime;

    #[test]
    fn patch_keeps_unset_fields() {
        let patch: PreferencesPatch =
            serde_json::from_str(r#"{"smsNotification":true,"notifyOnDiscount":false}"#).unwrap();
        let merged = patch.apply(&NotificationPreferences::default());
        assert!(merged.email_notification);
        assert!(merged.sms_notification);
        assert!(merged.notify_on_launch);
        assert!(!merged.notify_on_discount);
    }

    #[test]
    fn response_is_camel_case_with_derived_fields() {
        let r = record(datetime!(2024-05-01 12:00 UTC));
        let json = serde_json::to_value(NotificationResponse::from(r)).unwrap();
        assert_eq!(json["fullName"], "Ada");
        assert_eq!(json["notificationType"], "early_access");
        assert_eq!(json["notificationCount"], 0);
        assert_eq!(json["openRate"], 0);
        assert!(json["lastNotificationAt"].is_null());
        assert_eq!(json["preferences"]["emailNotification"], true);
    }
}
