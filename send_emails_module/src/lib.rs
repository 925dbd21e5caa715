//! Outbound email through the Postmark HTTP API.
//!
//! Reads `POSTMARK_SERVER_TOKEN` (required) and `POSTMARK_API_BASE_URL`
//! (defaults to the public endpoint) from the environment on every send.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

const DEFAULT_API_BASE_URL: &str = "https://api.postmarkapp.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One in-memory attachment. `content_type` is guessed from the file name
/// when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAttachment {
    pub name: String,
    pub content_type: Option<String>,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct SendEmailParams {
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<EmailAttachment>,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendEmailResponse {
    pub to: String,
    pub submitted_at: String,
    pub message_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SendEmailError {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid email: {0}")]
    Invalid(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("postmark returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("postmark error {code}: {message}")]
    Api { code: i64, message: String },
}

#[derive(Debug, Serialize)]
struct PostmarkEmail<'a> {
    #[serde(rename = "From")]
    from: &'a str,
    #[serde(rename = "To")]
    to: String,
    #[serde(rename = "Cc", skip_serializing_if = "Option::is_none")]
    cc: Option<String>,
    #[serde(rename = "Bcc", skip_serializing_if = "Option::is_none")]
    bcc: Option<String>,
    #[serde(rename = "Subject")]
    subject: &'a str,
    #[serde(rename = "TextBody", skip_serializing_if = "Option::is_none")]
    text_body: Option<&'a str>,
    #[serde(rename = "HtmlBody", skip_serializing_if = "Option::is_none")]
    html_body: Option<&'a str>,
    #[serde(rename = "ReplyTo", skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    #[serde(rename = "Headers", skip_serializing_if = "Vec::is_empty")]
    headers: Vec<PostmarkHeader<'a>>,
    #[serde(rename = "Attachments", skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<PostmarkAttachment>,
    #[serde(rename = "MessageStream")]
    message_stream: &'a str,
}

#[derive(Debug, Serialize)]
struct PostmarkHeader<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Value")]
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct PostmarkAttachment {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Content")]
    content: String,
    #[serde(rename = "ContentType")]
    content_type: String,
}

#[derive(Debug, Deserialize)]
struct PostmarkResponse {
    #[serde(rename = "To", default)]
    to: String,
    #[serde(rename = "SubmittedAt", default)]
    submitted_at: String,
    #[serde(rename = "MessageID", default)]
    message_id: String,
    #[serde(rename = "ErrorCode", default)]
    error_code: i64,
    #[serde(rename = "Message", default)]
    message: String,
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn join_addresses(addresses: &[String]) -> Option<String> {
    let joined = addresses
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

fn encode_attachment(attachment: &EmailAttachment) -> PostmarkAttachment {
    let content_type = attachment
        .content_type
        .clone()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| {
            mime_guess::from_path(&attachment.name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        });
    PostmarkAttachment {
        name: attachment.name.clone(),
        content: BASE64.encode(&attachment.content),
        content_type,
    }
}

/// Sends one message and returns Postmark's acknowledgement.
pub fn send_email(params: &SendEmailParams) -> Result<SendEmailResponse, SendEmailError> {
    dotenvy::dotenv().ok();
    let token =
        env_non_empty("POSTMARK_SERVER_TOKEN").ok_or(SendEmailError::MissingEnv("POSTMARK_SERVER_TOKEN"))?;
    let base_url =
        env_non_empty("POSTMARK_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

    let from = params
        .from
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SendEmailError::Invalid("from address missing".to_string()))?;
    let to = join_addresses(&params.to)
        .ok_or_else(|| SendEmailError::Invalid("no recipients".to_string()))?;
    if params.text_body.is_none() && params.html_body.is_none() {
        return Err(SendEmailError::Invalid("empty body".to_string()));
    }

    let mut headers = Vec::new();
    if let Some(value) = params.in_reply_to.as_deref() {
        headers.push(PostmarkHeader {
            name: "In-Reply-To",
            value,
        });
    }
    if let Some(value) = params.references.as_deref() {
        headers.push(PostmarkHeader {
            name: "References",
            value,
        });
    }

    let body = PostmarkEmail {
        from,
        to,
        cc: join_addresses(&params.cc),
        bcc: join_addresses(&params.bcc),
        subject: &params.subject,
        text_body: params.text_body.as_deref(),
        html_body: params.html_body.as_deref(),
        reply_to: params.reply_to.as_deref(),
        headers,
        attachments: params.attachments.iter().map(encode_attachment).collect(),
        message_stream: "outbound",
    };

    let client = reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()?;
    let url = format!("{}/email", base_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .header("Accept", "application/json")
        .header("X-Postmark-Server-Token", token)
        .json(&body)
        .send()?;

    let status = response.status();
    let text = response.text()?;
    if !status.is_success() {
        return Err(SendEmailError::Status {
            status: status.as_u16(),
            body: text,
        });
    }
    let parsed: PostmarkResponse = serde_json::from_str(&text).map_err(|err| {
        SendEmailError::Invalid(format!("unexpected postmark response: {}", err))
    })?;
    if parsed.error_code != 0 {
        return Err(SendEmailError::Api {
            code: parsed.error_code,
            message: parsed.message,
        });
    }

    info!(
        "postmark accepted message {} to {}",
        parsed.message_id, parsed.to
    );
    Ok(SendEmailResponse {
        to: parsed.to,
        submitted_at: parsed.submitted_at,
        message_id: parsed.message_id,
    })
}
