//! Mail transport seam
//!
//! The service never talks to a mail provider directly. Deployments plug a provider
//! client in through [`EmailTransport`]; [`LogTransport`] is the development default.

use async_trait::async_trait;
use tracing::info;

use crate::error::TransportError;
use crate::model::SendingSettings;

/// A fully rendered message for one recipient
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEmail {
    pub to: String,
    /// `Name <address>`
    pub from: String,
    pub reply_to: String,
    pub subject: String,
    pub html: String,
}

impl OutboundEmail {
    pub fn new(settings: &SendingSettings, to: &str, subject: &str, html: &str) -> Self {
        Self {
            to: to.to_string(),
            from: format!("{} <{}>", settings.from_name, settings.from_email),
            reply_to: settings.reply_to_email.clone(),
            subject: subject.to_string(),
            html: html.to_string(),
        }
    }
}

/// Delivers one message through an external provider
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send_email(&self, email: &OutboundEmail) -> Result<(), TransportError>;
}

/// Transport that only logs, for local development
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl EmailTransport for LogTransport {
    async fn send_email(&self, email: &OutboundEmail) -> Result<(), TransportError> {
        info!(
            to = %email.to,
            from = %email.from,
            subject = %email.subject,
            bytes = email.html.len(),
            "email handed to log transport"
        );
        Ok(())
    }
}
