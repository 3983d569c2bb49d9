use anyhow::Context as _;
use tera::{Context, Tera};
use uuid::Uuid;

use super::{tracking, EmailKind, OutgoingEmail};
use crate::config::AppConfig;

/// Embedded email sources. `.html` templates are autoescaped, `.txt` ones are not.
const SOURCES: &[(&str, &str)] = &[
    ("layout.html", include_str!("../../templates/email/layout.html")),
    ("button.html", include_str!("../../templates/email/button.html")),
    ("confirmation.html", include_str!("../../templates/email/confirmation.html")),
    ("confirmation.txt", include_str!("../../templates/email/confirmation.txt")),
    ("welcome.html", include_str!("../../templates/email/welcome.html")),
    ("welcome.txt", include_str!("../../templates/email/welcome.txt")),
    ("verification.html", include_str!("../../templates/email/verification.html")),
    ("verification.txt", include_str!("../../templates/email/verification.txt")),
    ("password_reset.html", include_str!("../../templates/email/password_reset.html")),
    ("password_reset.txt", include_str!("../../templates/email/password_reset.txt")),
    ("enrollment.html", include_str!("../../templates/email/enrollment.html")),
    ("enrollment.txt", include_str!("../../templates/email/enrollment.txt")),
    ("certificate.html", include_str!("../../templates/email/certificate.html")),
    ("certificate.txt", include_str!("../../templates/email/certificate.txt")),
    (
        "course_notification.html",
        include_str!("../../templates/email/course_notification.html"),
    ),
    (
        "course_notification.txt",
        include_str!("../../templates/email/course_notification.txt"),
    ),
];

/// Renders every transactional email. Built once at startup.
pub struct Templates {
    tera: Tera,
    api_url: String,
    client_url: String,
}

impl Templates {
    pub fn new(cfg: &AppConfig) -> anyhow::Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(SOURCES.iter().copied())
            .context("parse email templates")?;
        Ok(Self {
            tera,
            api_url: cfg.api_url.clone(),
            client_url: cfg.client_url.clone(),
        })
    }

    /// Renders `<name>.html` and `<name>.txt`; the HTML part gets the open-tracking pixel.
    fn render(
        &self,
        name: &str,
        kind: EmailKind,
        to: &str,
        subject: String,
        mut context: Context,
        notification_id: Option<Uuid>,
    ) -> anyhow::Result<OutgoingEmail> {
        context.insert("api_url", &self.api_url);
        context.insert(
            "tracking_id",
            &tracking::encode(to, kind.as_str(), notification_id),
        );
        let html = self
            .tera
            .render(&format!("{name}.html"), &context)
            .with_context(|| format!("render {name}.html"))?;
        let text = self
            .tera
            .render(&format!("{name}.txt"), &context)
            .with_context(|| format!("render {name}.txt"))?;
        Ok(OutgoingEmail {
            kind,
            to: to.to_string(),
            subject,
            html,
            text,
        })
    }

    pub fn subscription_confirmation(
        &self,
        to: &str,
        first_name: &str,
        subscription_type: &str,
        token: &str,
    ) -> anyhow::Result<OutgoingEmail> {
        let mut context = Context::new();
        context.insert("first_name", first_name);
        context.insert("subscription_type", subscription_type);
        context.insert(
            "link",
            &format!("{}/api/v1/emails/confirm/{}", self.api_url, token),
        );
        self.render(
            "confirmation",
            EmailKind::Confirmation,
            to,
            "Please confirm your email subscription".into(),
            context,
            None,
        )
    }

    pub fn welcome(
        &self,
        to: &str,
        first_name: &str,
        subscription_type: &str,
    ) -> anyhow::Result<OutgoingEmail> {
        let mut context = Context::new();
        context.insert("first_name", first_name);
        context.insert("subscription_type", subscription_type);
        context.insert("courses_url", &format!("{}/courses", self.client_url));
        self.render(
            "welcome",
            EmailKind::Welcome,
            to,
            "Welcome to EduTech Community!".into(),
            context,
            None,
        )
    }

    pub fn account_verification(
        &self,
        to: &str,
        first_name: &str,
        token: &str,
    ) -> anyhow::Result<OutgoingEmail> {
        let mut context = Context::new();
        context.insert("first_name", first_name);
        context.insert(
            "link",
            &format!("{}/api/v1/auth/verify-email/{}", self.api_url, token),
        );
        self.render(
            "verification",
            EmailKind::Verification,
            to,
            "Verify your EduTech account".into(),
            context,
            None,
        )
    }

    pub fn password_reset(
        &self,
        to: &str,
        first_name: &str,
        token: &str,
    ) -> anyhow::Result<OutgoingEmail> {
        let mut context = Context::new();
        context.insert("first_name", first_name);
        context.insert(
            "link",
            &format!("{}/reset-password/{}", self.client_url, token),
        );
        self.render(
            "password_reset",
            EmailKind::PasswordReset,
            to,
            "Reset your EduTech password".into(),
            context,
            None,
        )
    }

    pub fn enrollment_confirmation(
        &self,
        to: &str,
        first_name: &str,
        course_title: &str,
        enrollment_id: Uuid,
        amount: f64,
        access_url: &str,
    ) -> anyhow::Result<OutgoingEmail> {
        let mut context = Context::new();
        context.insert("first_name", first_name);
        context.insert("course_title", course_title);
        context.insert("enrollment_id", &enrollment_id.to_string());
        // empty renders as the free-course line
        let paid = if amount > 0.0 {
            format!("{amount:.2}")
        } else {
            String::new()
        };
        context.insert("amount", &paid);
        context.insert("access_url", access_url);
        self.render(
            "enrollment",
            EmailKind::Enrollment,
            to,
            format!("Welcome to {course_title}!"),
            context,
            None,
        )
    }

    pub fn certificate_issued(
        &self,
        to: &str,
        first_name: &str,
        course_title: &str,
        certificate_id: &str,
        download_url: &str,
    ) -> anyhow::Result<OutgoingEmail> {
        let mut context = Context::new();
        context.insert("first_name", first_name);
        context.insert("course_title", course_title);
        context.insert("certificate_id", certificate_id);
        context.insert("download_url", download_url);
        self.render(
            "certificate",
            EmailKind::Certificate,
            to,
            format!("Your {course_title} Certificate is Ready!"),
            context,
            None,
        )
    }

    pub fn course_notification(
        &self,
        to: &str,
        first_name: &str,
        course_title: &str,
        content: &str,
        unsubscribe_token: &str,
        notification_id: Uuid,
    ) -> anyhow::Result<OutgoingEmail> {
        let mut context = Context::new();
        context.insert("first_name", first_name);
        context.insert("course_title", course_title);
        context.insert("content", content);
        context.insert("course_url", &format!("{}/courses", self.client_url));
        context.insert(
            "unsubscribe_url",
            &format!(
                "{}/unsubscribe?token={}",
                self.client_url, unsubscribe_token
            ),
        );
        self.render(
            "course_notification",
            EmailKind::CourseNotification,
            to,
            format!("{course_title}: news for you"),
            context,
            Some(notification_id),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;

    fn templates() -> Templates {
        Templates::new(&AppState::fake().config).unwrap()
    }

    #[tokio::test]
    async fn every_html_body_carries_a_tracking_pixel() {
        let mail = templates()
            .subscription_confirmation("ada@example.com", "Ada", "newsletter", "tok")
            .unwrap();
        assert!(mail.html.contains("/api/v1/emails/track/open/"));
        assert!(mail.text.contains("/api/v1/emails/confirm/tok"));
        assert_eq!(mail.kind, EmailKind::Confirmation);
    }

    #[tokio::test]
    async fn notification_pixel_embeds_the_record_id() {
        let id = Uuid::new_v4();
        let mail = templates()
            .course_notification("ada@example.com", "Ada", "Rust 101", "Launching!", "unsub", id)
            .unwrap();
        let tracking_id = mail
            .html
            .split("/track/open/")
            .nth(1)
            .and_then(|s| s.split('"').next())
            .unwrap();
        let decoded = tracking::decode(tracking_id).unwrap();
        assert_eq!(decoded.notification_id, Some(id));
        assert_eq!(decoded.kind, "course_notification");
    }

    #[tokio::test]
    async fn free_enrollment_mentions_no_amount() {
        let t = templates();
        let mail = t
            .enrollment_confirmation("a@b.co", "Ada", "Rust", Uuid::new_v4(), 0.0, "http://x/courses/1")
            .unwrap();
        assert!(mail.text.contains("This course is free."));
        assert!(!mail.text.contains("Amount"));
        assert_eq!(mail.subject, "Welcome to Rust!");

        let paid = t
            .enrollment_confirmation("a@b.co", "Ada", "Rust", Uuid::new_v4(), 49.5, "http://x/courses/1")
            .unwrap();
        assert!(paid.text.contains("Amount: $49.50"));
    }

    #[tokio::test]
    async fn user_supplied_values_are_escaped_in_html() {
        let t = templates();
        let payload = "<img src=x onerror=alert(1)>";
        let mail = t
            .subscription_confirmation("ada@example.com", payload, "newsletter", "tok")
            .unwrap();
        assert!(!mail.html.contains(payload));
        assert!(mail.html.contains("&lt;img src=x onerror=alert(1)&gt;"));
        // the plain-text part is not HTML and keeps the value as typed
        assert!(mail.text.contains(payload));

        let note = t
            .course_notification(
                "ada@example.com",
                "Ada",
                "<b>Rust</b>",
                "<script>alert(1)</script>",
                "unsub",
                Uuid::new_v4(),
            )
            .unwrap();
        assert!(!note.html.contains("<script>"));
        assert!(!note.html.contains("<b>Rust</b>"));
        assert!(note.html.contains("&lt;script&gt;"));
    }
}
