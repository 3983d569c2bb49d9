use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use uuid::Uuid;

/// Transparent 1x1 GIF served by the open-tracking endpoint.
pub const PIXEL_GIF: [u8; 42] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x01, 0x44, 0x00, 0x3b,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingId {
    pub email: String,
    pub kind: String,
    pub notification_id: Option<Uuid>,
}

/// `email|kind[|notification_id]`, URL-safe base64 so it fits in a path segment.
pub fn encode(email: &str, kind: &str, notification_id: Option<Uuid>) -> String {
    let raw = match notification_id {
        Some(id) => format!("{email}|{kind}|{id}"),
        None => format!("{email}|{kind}"),
    };
    URL_SAFE_NO_PAD.encode(raw)
}

/// Accepts URL-safe and standard alphabets. `None` for anything malformed.
pub fn decode(tracking_id: &str) -> Option<TrackingId> {
    let bytes = URL_SAFE_NO_PAD
        .decode(tracking_id)
        .or_else(|_| STANDARD.decode(tracking_id))
        .ok()?;
    let raw = String::from_utf8(bytes).ok()?;
    let mut parts = raw.split('|');
    let email = parts.next()?.trim().to_lowercase();
    if email.is_empty() {
        return None;
    }
    let kind = parts.next().unwrap_or_default().to_string();
    let notification_id = parts.next().and_then(|p| Uuid::parse_str(p).ok());
    Some(TrackingId {
        email,
        kind,
        notification_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_is_a_gif() {
        assert_eq!(&PIXEL_GIF[..6], b"GIF89a");
        assert_eq!(PIXEL_GIF[6], 1);
        assert_eq!(PIXEL_GIF[8], 1);
        assert_eq!(*PIXEL_GIF.last().unwrap(), 0x3b);
    }

    #[test]
    fn decodes_with_notification_id() {
        let id = Uuid::new_v4();
        let t = decode(&encode("Ada@Example.com", "course_notification", Some(id))).unwrap();
        assert_eq!(t.email, "ada@example.com");
        assert_eq!(t.kind, "course_notification");
        assert_eq!(t.notification_id, Some(id));
    }

    #[test]
    fn accepts_standard_base64_ids() {
        let legacy = STANDARD.encode("ada@example.com|welcome");
        let t = decode(&legacy).unwrap();
        assert_eq!(t.email, "ada@example.com");
        assert_eq!(t.notification_id, None);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode("%%%").is_none());
        assert!(decode(&URL_SAFE_NO_PAD.encode("|welcome")).is_none());
    }
}
