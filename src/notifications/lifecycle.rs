use time::OffsetDateTime;
use uuid::Uuid;

use super::repo_types::{
    Channel, CourseNotification, DeliveryStatus, HistoryEntry, NotificationStatus,
    NotificationType, ScheduledEntry, TrackEvent,
};

pub const SOURCES: &[&str] = &["course_page", "popup", "banner", "email", "social", "referral"];

pub fn is_due(entry: &ScheduledEntry, now: OffsetDateTime) -> bool {
    !entry.sent && entry.scheduled_for <= now
}

/// Active with at least one unsent entry whose time has come.
pub fn is_ready(record: &CourseNotification, now: OffsetDateTime) -> bool {
    record.status == NotificationStatus::Active && record.scheduled.0.iter().any(|e| is_due(e, now))
}

/// Ids of the due entries, earliest first.
pub fn due_entries(scheduled: &[ScheduledEntry], now: OffsetDateTime) -> Vec<Uuid> {
    let mut due: Vec<&ScheduledEntry> = scheduled.iter().filter(|e| is_due(e, now)).collect();
    due.sort_by_key(|e| e.scheduled_for);
    due.into_iter().map(|e| e.id).collect()
}

/// Marks exactly one entry. Returns false when it is missing or already sent.
pub fn mark_sent(scheduled: &mut [ScheduledEntry], entry_id: Uuid, now: OffsetDateTime) -> bool {
    match scheduled.iter_mut().find(|e| e.id == entry_id) {
        Some(entry) if !entry.sent => {
            entry.sent = true;
            entry.sent_at = Some(now);
            true
        }
        _ => false,
    }
}

/// Undoes a claim after a failed send so the entry is due again. False when it was not marked.
pub fn release(scheduled: &mut [ScheduledEntry], entry_id: Uuid) -> bool {
    match scheduled.iter_mut().find(|e| e.id == entry_id) {
        Some(entry) if entry.sent => {
            entry.sent = false;
            entry.sent_at = None;
            true
        }
        _ => false,
    }
}

fn history_entry(subject: String, now: OffsetDateTime) -> HistoryEntry {
    HistoryEntry {
        id: Uuid::new_v4(),
        channel: Channel::Email,
        subject,
        sent_at: now,
        status: DeliveryStatus::Sent,
        opens: Vec::new(),
        clicks: Vec::new(),
        error_message: None,
    }
}

/// Appends a delivered entry; a launch delivery moves an active record to `notified`.
pub fn record_sent(
    record: &mut CourseNotification,
    kind: NotificationType,
    subject: String,
    now: OffsetDateTime,
) {
    record.history.0.push(history_entry(subject, now));
    let is_launch =
        kind == NotificationType::Launch || record.notification_type == NotificationType::Launch;
    if is_launch && record.status == NotificationStatus::Active {
        record.status = NotificationStatus::Notified;
    }
}

pub fn record_failure(history: &mut Vec<HistoryEntry>, subject: String, error: String, now: OffsetDateTime) {
    let mut entry = history_entry(subject, now);
    entry.status = DeliveryStatus::Failed;
    entry.error_message = Some(error);
    history.push(entry);
}

/// Open on the latest entry. False when there is no history.
pub fn record_open(history: &mut [HistoryEntry], now: OffsetDateTime) -> bool {
    let Some(last) = history.last_mut() else {
        return false;
    };
    last.opens.push(TrackEvent { at: now, url: None });
    if matches!(last.status, DeliveryStatus::Sent | DeliveryStatus::Delivered) {
        last.status = DeliveryStatus::Opened;
    }
    true
}

pub fn record_click(history: &mut [HistoryEntry], url: Option<String>, now: OffsetDateTime) -> bool {
    let Some(last) = history.last_mut() else {
        return false;
    };
    last.clicks.push(TrackEvent { at: now, url });
    last.status = DeliveryStatus::Clicked;
    true
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Engagement {
    pub notification_count: usize,
    pub last_notification_at: Option<OffsetDateTime>,
    pub open_rate: i64,
    pub click_rate: i64,
}

fn percent(part: usize, whole: usize) -> i64 {
    if whole == 0 {
        return 0;
    }
    ((part as f64 / whole as f64) * 100.0).round() as i64
}

/// Rates are over non-failed entries.
pub fn engagement(history: &[HistoryEntry]) -> Engagement {
    let delivered = history
        .iter()
        .filter(|h| h.status != DeliveryStatus::Failed)
        .count();
    let opened = history.iter().filter(|h| !h.opens.is_empty()).count();
    let clicked = history.iter().filter(|h| !h.clicks.is_empty()).count();
    Engagement {
        notification_count: history.len(),
        last_notification_at: history.last().map(|h| h.sent_at),
        open_rate: percent(opened, delivered),
        click_rate: percent(clicked, delivered),
    }
}

/// Enrolled over notified-or-enrolled, as a percentage with two decimals.
pub fn conversion_rate(notified_or_enrolled: i64, enrolled: i64) -> f64 {
    if notified_or_enrolled <= 0 {
        return 0.0;
    }
    let rate = enrolled as f64 / notified_or_enrolled as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}

pub fn full_name(first: Option<&str>, last: Option<&str>, email: &str) -> String {
    match (first, last) {
        (Some(f), Some(l)) if !f.is_empty() && !l.is_empty() => format!("{f} {l}"),
        (Some(f), _) if !f.is_empty() => f.to_string(),
        _ => email.split('@').next().unwrap_or(email).to_string(),
    }
}

pub fn is_valid_phone(phone: &str) -> bool {
    let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
    let allowed = phone
        .chars()
        .enumerate()
        .all(|(i, c)| c.is_ascii_digit() || " -().".contains(c) || (i == 0 && c == '+'));
    allowed && (7..=15).contains(&digits)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use sqlx::types::Json;

    use super::*;
    use crate::notifications::repo_types::NotificationPreferences;

    pub fn record(now: OffsetDateTime) -> CourseNotification {
        CourseNotification {
            id: Uuid::new_v4(),
            email: "ada@example.com".into(),
            course_id: Uuid::new_v4(),
            notification_type: NotificationType::EarlyAccess,
            first_name: Some("Ada".into()),
            last_name: None,
            phone: None,
            status: NotificationStatus::Active,
            preferences: Json(NotificationPreferences::default()),
            source: "course_page".into(),
            history: Json(Vec::new()),
            scheduled: Json(Vec::new()),
            unsubscribe_token: "tok".into(),
            unsubscribe_reason: None,
            unsubscribed_at: None,
            enrollment_date: None,
            conversion_value: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn entry(kind: NotificationType, scheduled_for: OffsetDateTime) -> ScheduledEntry {
        ScheduledEntry {
            id: Uuid::new_v4(),
            kind,
            scheduled_for,
            content: "Doors open soon".into(),
            sent: false,
            sent_at: None,
        }
    }
}
