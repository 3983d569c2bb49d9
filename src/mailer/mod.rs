pub mod templates;
pub mod tracking;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, info, warn};

use crate::config::MailConfig;

/// What an outgoing message is about. Also the `kind` segment of tracking ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailKind {
    Confirmation,
    Welcome,
    Verification,
    PasswordReset,
    Enrollment,
    Certificate,
    CourseNotification,
}

impl EmailKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EmailKind::Confirmation => "confirmation",
            EmailKind::Welcome => "welcome",
            EmailKind::Verification => "verification",
            EmailKind::PasswordReset => "password_reset",
            EmailKind::Enrollment => "enrollment",
            EmailKind::Certificate => "certificate",
            EmailKind::CourseNotification => "course_notification",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub kind: EmailKind,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> anyhow::Result<()>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(cfg: &MailConfig, host: &str) -> anyhow::Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .context("smtp relay")?
            .port(cfg.smtp_port)
            .credentials(Credentials::new(
                cfg.smtp_username.clone(),
                cfg.smtp_password.clone(),
            ))
            .build();
        let from = format!("{} <{}>", cfg.from_name, cfg.from_email)
            .parse::<Mailbox>()
            .context("parse from address")?;
        Ok(Self { transport, from })
    }

    fn build_message(&self, email: &OutgoingEmail) -> anyhow::Result<Message> {
        let to = email
            .to
            .parse::<Mailbox>()
            .with_context(|| format!("parse recipient {}", email.to))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(email.text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(email.html.clone()),
                    ),
            )
            .context("build message")?;
        Ok(message)
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: OutgoingEmail) -> anyhow::Result<()> {
        let message = self.build_message(&email)?;
        self.transport
            .send(message)
            .await
            .with_context(|| format!("smtp send {}", email.kind.as_str()))?;
        info!(to = %email.to, kind = email.kind.as_str(), "email sent");
        Ok(())
    }
}

/// Used when no SMTP host is configured: the message is only logged.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: OutgoingEmail) -> anyhow::Result<()> {
        info!(to = %email.to, kind = email.kind.as_str(), subject = %email.subject, "email (not sent, no smtp host)");
        debug!(body = %email.text, "email text body");
        Ok(())
    }
}

pub fn from_config(cfg: &MailConfig) -> anyhow::Result<Arc<dyn Mailer>> {
    match cfg.smtp_host.as_deref() {
        Some(host) => Ok(Arc::new(SmtpMailer::new(cfg, host)?) as Arc<dyn Mailer>),
        None => Ok(Arc::new(LogMailer) as Arc<dyn Mailer>),
    }
}

/// Sends in the background. A failure is logged and never reaches the caller.
pub fn spawn_send(mailer: Arc<dyn Mailer>, email: OutgoingEmail) -> tokio::task::JoinHandle<bool> {
    tokio::spawn(async move {
        let to = email.to.clone();
        let kind = email.kind;
        match mailer.send(email).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = ?e, %to, kind = kind.as_str(), "failed to send email");
                false
            }
        }
    })
}

/// Like [`spawn_send`] for a freshly rendered email; a render failure is logged and nothing is sent.
pub fn spawn_rendered(
    mailer: Arc<dyn Mailer>,
    rendered: anyhow::Result<OutgoingEmail>,
) -> Option<tokio::task::JoinHandle<bool>> {
    match rendered {
        Ok(email) => Some(spawn_send(mailer, email)),
        Err(e) => {
            warn!(error = ?e, "failed to render email");
            None
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;

    /// Records every message; can fail every send or only the nth attempt (0-based).
    #[derive(Default)]
    pub struct RecordingMailer {
        pub sent: Mutex<Vec<OutgoingEmail>>,
        pub fail: bool,
        pub fail_on: Option<usize>,
        attempts: AtomicUsize,
    }

    impl RecordingMailer {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn failing_on(attempt: usize) -> Self {
            Self {
                fail_on: Some(attempt),
                ..Self::default()
            }
        }

        pub fn count(&self) -> usize {
            self.sent.lock().map(|s| s.len()).unwrap_or(0)
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, email: OutgoingEmail) -> anyhow::Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail || self.fail_on == Some(attempt) {
                anyhow::bail!("smtp unavailable");
            }
            self.sent.lock().expect("mailer lock").push(email);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingMailer;
    use super::*;

    fn sample() -> OutgoingEmail {
        OutgoingEmail {
            kind: EmailKind::Welcome,
            to: "ada@example.com".into(),
            subject: "hi".into(),
            html: "<p>hi</p>".into(),
            text: "hi".into(),
        }
    }

    #[tokio::test]
    async fn spawn_send_swallows_failures() {
        let mailer = Arc::new(RecordingMailer::failing());
        let ok = spawn_send(mailer.clone(), sample()).await.unwrap();
        assert!(!ok);
        assert_eq!(mailer.count(), 0);
    }

    #[tokio::test]
    async fn spawn_send_delivers() {
        let mailer = Arc::new(RecordingMailer::default());
        assert!(spawn_send(mailer.clone(), sample()).await.unwrap());
        assert_eq!(mailer.count(), 1);
    }

    #[test]
    fn smtp_message_builds_multipart() {
        let cfg = MailConfig {
            smtp_host: Some("smtp.example.com".into()),
            smtp_port: 587,
            smtp_username: "user".into(),
            smtp_password: "pass".into(),
            from_name: "EduTech".into(),
            from_email: "no-reply@example.com".into(),
        };
        let mailer = SmtpMailer::new(&cfg, "smtp.example.com").unwrap();
        assert!(mailer.build_message(&sample()).is_ok());

        let mut bad = sample();
        bad.to = "not an address".into();
        assert!(mailer.build_message(&bad).is_err());
    }
}
