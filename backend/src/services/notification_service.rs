//! Best-effort job notifications over email, chat webhook and a signed
//! generic webhook.
//!
//! Delivery failures are logged and counted, never returned to the caller.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::config::NotificationConfig;
use crate::models::job::{DestinationOutcome, JobStatus, JobTrigger};
use crate::models::policy::NotificationChannels;
use crate::services::metrics_service;

type HmacSha256 = Hmac<Sha256>;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// What a notification reports about a finished job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub trigger: JobTrigger,
    pub note: String,
    pub size_bytes: Option<i64>,
    pub duration_sec: f64,
    pub destinations: Vec<DestinationOutcome>,
}

impl JobSummary {
    pub fn subject(&self) -> String {
        format!("Backup {} ({})", self.status, short_id(self.job_id))
    }

    pub fn body(&self) -> String {
        let mut body = format!(
            "Job: {}\nStatus: {}\nTrigger: {}\nDuration: {:.1}s\n",
            self.job_id,
            self.status,
            self.trigger.as_str(),
            self.duration_sec
        );
        if let Some(size) = self.size_bytes {
            body.push_str(&format!("Size: {} bytes\n", size));
        }
        if !self.note.is_empty() {
            body.push_str(&format!("Note: {}\n", self.note));
        }
        if !self.destinations.is_empty() {
            body.push_str("Destinations:\n");
            for d in &self.destinations {
                let role = if d.is_primary { "primary" } else { "replica" };
                match (d.success, &d.error) {
                    (true, _) => body.push_str(&format!("  - {} ({}, {}): ok\n", d.name, d.kind, role)),
                    (false, Some(err)) => body.push_str(&format!(
                        "  - {} ({}, {}): failed: {}\n",
                        d.name, d.kind, role, err
                    )),
                    (false, None) => body.push_str(&format!(
                        "  - {} ({}, {}): failed\n",
                        d.name, d.kind, role
                    )),
                }
            }
        }
        body
    }
}

fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, channels: &NotificationChannels, subject: &str, body: &str);
}

/// Delivers to the channel endpoints from the environment configuration.
pub struct Notifier {
    config: NotificationConfig,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(config: NotificationConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    async fn send_email(&self, subject: &str, body: &str) -> Result<(), String> {
        let host = self
            .config
            .smtp_host
            .as_deref()
            .ok_or("SMTP_HOST is not configured")?;
        let from = self
            .config
            .smtp_from
            .as_deref()
            .ok_or("SMTP_FROM is not configured")?;
        if self.config.email_to.is_empty() {
            return Err("no email recipients configured".into());
        }

        let mut builder = Message::builder()
            .from(from.parse::<Mailbox>().map_err(|e| e.to_string())?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for to in &self.config.email_to {
            builder = builder.to(to.parse::<Mailbox>().map_err(|e| e.to_string())?);
        }
        let email = builder.body(body.to_string()).map_err(|e| e.to_string())?;

        let mut transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| e.to_string())?
            .port(self.config.smtp_port)
            .timeout(Some(DELIVERY_TIMEOUT));
        if let (Some(user), Some(pass)) = (&self.config.smtp_username, &self.config.smtp_password) {
            transport = transport.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        transport
            .build()
            .send(email)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn send_chat(&self, subject: &str, body: &str) -> Result<(), String> {
        let url = self
            .config
            .chat_webhook_url
            .as_deref()
            .ok_or("chat webhook URL is not configured")?;
        let text = format!("*{}*\n{}", subject, body);
        let response = self
            .http
            .post(url)
            .timeout(DELIVERY_TIMEOUT)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        check_status(response)
    }

    async fn send_webhook(&self, subject: &str, body: &str) -> Result<(), String> {
        let url = self
            .config
            .webhook_url
            .as_deref()
            .ok_or("webhook URL is not configured")?;
        let payload = serde_json::to_string(&serde_json::json!({
            "event": "backup.finished",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "subject": subject,
            "body": body,
        }))
        .map_err(|e| e.to_string())?;

        let mut request = self
            .http
            .post(url)
            .timeout(DELIVERY_TIMEOUT)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Event", "backup.finished");
        if let Some(secret) = &self.config.webhook_secret {
            request = request.header(
                "X-Webhook-Signature",
                format!("sha256={}", sign_payload(secret, &payload)?),
            );
        }

        let response = request.body(payload).send().await.map_err(|e| e.to_string())?;
        check_status(response)
    }
}

fn check_status(response: reqwest::Response) -> Result<(), String> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("HTTP {}", response.status()))
    }
}

/// Hex HMAC-SHA256 of `payload`.
pub fn sign_payload(secret: &str, payload: &str) -> Result<String, String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| e.to_string())?;
    mac.update(payload.as_bytes());
    Ok(format!("{:x}", mac.finalize().into_bytes()))
}

fn report(channel: &str, subject: &str, result: Result<(), String>) {
    match result {
        Ok(()) => {
            tracing::info!(channel, subject, "Notification sent");
            metrics_service::record_notification(channel, true);
        }
        Err(e) => {
            tracing::warn!(channel, subject, error = %e, "Notification failed");
            metrics_service::record_notification(channel, false);
        }
    }
}

#[async_trait]
impl NotificationSink for Notifier {
    async fn send(&self, channels: &NotificationChannels, subject: &str, body: &str) {
        let email = async {
            if channels.email {
                report("email", subject, self.send_email(subject, body).await);
            }
        };
        let chat = async {
            if channels.chat {
                report("chat", subject, self.send_chat(subject, body).await);
            }
        };
        let webhook = async {
            if channels.webhook {
                report("webhook", subject, self.send_webhook(subject, body).await);
            }
        };
        futures::join!(email, chat, webhook);
    }
}
