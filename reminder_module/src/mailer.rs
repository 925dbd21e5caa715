//! Hand-off of reminder messages to the mail-composition collaborator.

use tracing::info;

use crate::reminder::CalendarAttachment;

/// A composed reminder ready for transfer. MIME envelopes are the
/// transport's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReminder {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
    pub calendar: Option<CalendarAttachment>,
}

#[derive(Debug, thiserror::Error)]
pub enum MailerError {
    #[error("mail send failed: {0}")]
    Send(String),
    #[error("reminder has no recipient")]
    MissingRecipient,
}

pub trait ReminderMailer {
    fn send(&self, message: &OutboundReminder) -> Result<(), MailerError>;
}

/// Sends through Postmark via `send_emails_module`.
#[derive(Debug, Clone, Default)]
pub struct PostmarkMailer;

impl PostmarkMailer {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn to_send_params(message: &OutboundReminder) -> send_emails_module::SendEmailParams {
    let attachments = message
        .calendar
        .iter()
        .map(|calendar| send_emails_module::EmailAttachment {
            name: calendar.filename.clone(),
            content_type: Some(calendar.content_type.clone()),
            content: calendar.content.as_bytes().to_vec(),
        })
        .collect();
    send_emails_module::SendEmailParams {
        subject: message.subject.clone(),
        text_body: Some(message.text_body.clone()),
        html_body: message.html_body.clone(),
        attachments,
        from: Some(message.from.clone()),
        to: vec![message.to.clone()],
        ..Default::default()
    }
}

impl ReminderMailer for PostmarkMailer {
    fn send(&self, message: &OutboundReminder) -> Result<(), MailerError> {
        if message.to.trim().is_empty() {
            return Err(MailerError::MissingRecipient);
        }
        let params = to_send_params(message);
        let response = send_emails_module::send_email(&params)
            .map_err(|err| MailerError::Send(err.to_string()))?;
        info!(
            "sent reminder '{}' to {}, message_id={}",
            message.subject, message.to, response.message_id
        );
        Ok(())
    }
}
