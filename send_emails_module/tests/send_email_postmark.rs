use mockito::{Matcher, Server};
use send_emails_module::{send_email, EmailAttachment, SendEmailError, SendEmailParams};
use serial_test::serial;
use std::env;

struct EnvGuard {
    key: &'static str,
    original: Option<String>,
}

impl EnvGuard {
    fn set(key: &'static str, value: impl AsRef<std::ffi::OsStr>) -> Self {
        let original = env::var(key).ok();
        env::set_var(key, value);
        Self { key, original }
    }

    fn unset(key: &'static str) -> Self {
        let original = env::var(key).ok();
        env::remove_var(key);
        Self { key, original }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.original {
            Some(value) => env::set_var(self.key, value),
            None => env::remove_var(self.key),
        }
    }
}

fn reminder_params() -> SendEmailParams {
    SendEmailParams {
        subject: "Reminder: water plants".to_string(),
        text_body: Some("Time to water the plants.".to_string()),
        attachments: vec![EmailAttachment {
            name: "rem-1.ics".to_string(),
            content_type: Some("text/calendar; charset=utf-8; method=REQUEST".to_string()),
            content: b"BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n".to_vec(),
        }],
        from: Some("Reminders <reminders@example.com>".to_string()),
        to: vec!["user@example.com".to_string()],
        ..SendEmailParams::default()
    }
}

#[test]
#[serial]
fn posts_message_with_calendar_attachment() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/email")
        .match_header("x-postmark-server-token", "test-token")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""To":"user@example.com""#.to_string()),
            Matcher::Regex(r#""Name":"rem-1.ics""#.to_string()),
            Matcher::Regex("method=REQUEST".to_string()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"To":"user@example.com","SubmittedAt":"2025-09-05T16:00:00Z","MessageID":"msg-123","ErrorCode":0,"Message":"OK"}"#,
        )
        .expect(1)
        .create();

    let _token = EnvGuard::set("POSTMARK_SERVER_TOKEN", "test-token");
    let _api = EnvGuard::set("POSTMARK_API_BASE_URL", server.url());

    let response = send_email(&reminder_params()).expect("send");
    assert_eq!(response.message_id, "msg-123");
    assert_eq!(response.to, "user@example.com");
    mock.assert();
}

#[test]
#[serial]
fn api_error_code_is_reported() {
    let mut server = Server::new();
    let _mock = server
        .mock("POST", "/email")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"ErrorCode":300,"Message":"Invalid email request"}"#)
        .create();

    let _token = EnvGuard::set("POSTMARK_SERVER_TOKEN", "test-token");
    let _api = EnvGuard::set("POSTMARK_API_BASE_URL", server.url());

    match send_email(&reminder_params()) {
        Err(SendEmailError::Api { code, message }) => {
            assert_eq!(code, 300);
            assert_eq!(message, "Invalid email request");
        }
        other => panic!("expected api error, got {:?}", other),
    }
}

#[test]
#[serial]
fn http_failure_status_is_reported() {
    let mut server = Server::new();
    let _mock = server
        .mock("POST", "/email")
        .with_status(500)
        .with_body("upstream down")
        .create();

    let _token = EnvGuard::set("POSTMARK_SERVER_TOKEN", "test-token");
    let _api = EnvGuard::set("POSTMARK_API_BASE_URL", server.url());

    match send_email(&reminder_params()) {
        Err(SendEmailError::Status { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "upstream down");
        }
        other => panic!("expected status error, got {:?}", other),
    }
}

#[test]
#[serial]
fn missing_token_fails_before_any_request() {
    let _token = EnvGuard::unset("POSTMARK_SERVER_TOKEN");
    assert!(matches!(
        send_email(&reminder_params()),
        Err(SendEmailError::MissingEnv("POSTMARK_SERVER_TOKEN"))
    ));
}
