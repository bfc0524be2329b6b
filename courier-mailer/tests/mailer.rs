mod support;

use std::sync::Arc;

use courier_common::Mail;
use courier_mailer::{Mailer, MailerConfig, ProcessError, RenderError, TemplateRenderer};
use courier_metrics::Metrics;
use pretty_assertions::assert_eq;
use support::{RecordingSender, write};

fn templates() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "hello.html", "<p>Hello {{name}}</p>");
    write(dir.path(), "auth/reset.html", "<a href=\"{{link}}\">Reset</a>");
    write(dir.path(), "notes.txt", "not a template");
    dir
}

fn mailer(sender: Arc<RecordingSender>) -> (Mailer, Arc<Metrics>, tempfile::TempDir) {
    let dir = templates();
    let metrics = Arc::new(Metrics::new());
    let renderer = TemplateRenderer::load(dir.path()).unwrap();

    (
        Mailer::new(Arc::new(renderer), sender, Arc::clone(&metrics)),
        metrics,
        dir,
    )
}

#[test]
fn test_load_registers_nested_templates() {
    let dir = templates();
    let renderer = TemplateRenderer::load(dir.path()).unwrap();

    assert!(renderer.has_template("hello"));
    assert!(renderer.has_template("auth/reset"));
    assert!(!renderer.has_template("notes"));
}

#[test]
fn test_load_missing_directory() {
    let dir = tempfile::tempdir().unwrap();

    assert!(matches!(
        TemplateRenderer::load(&dir.path().join("missing")),
        Err(RenderError::Io { .. })
    ));
}

#[tokio::test]
async fn test_process_renders_and_sends() {
    let sender = Arc::new(RecordingSender::default());
    let (mailer, metrics, _dir) = mailer(Arc::clone(&sender));

    mailer
        .process(
            br#"{
                "Tpl": "hello",
                "FromEmail": "noreply@example.com",
                "Sender": "Example",
                "Subject": "Hi {{name}}",
                "Recipients": ["someone@example.com"],
                "Payload": { "name": "World" }
            }"#,
        )
        .await
        .unwrap();

    let sent = sender.sent.lock();
    assert_eq!(
        *sent,
        vec![(
            Mail {
                from: "noreply@example.com".to_string(),
                sender: "Example".to_string(),
                subject: "Hi World".to_string(),
                to: vec!["someone@example.com".to_string()],
            },
            "<p>Hello World</p>".to_string()
        )]
    );
    assert_eq!(metrics.mailer.sent(), 1);
}

#[tokio::test]
async fn test_process_minimal_request() {
    let sender = Arc::new(RecordingSender::default());
    let (mailer, _metrics, _dir) = mailer(Arc::clone(&sender));

    mailer
        .process(br#"{"Tpl":"hello","FromEmail":"a@x","Recipients":["b@x"]}"#)
        .await
        .unwrap();

    let sent = sender.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.subject, "");
    assert_eq!(sent[0].1, "<p>Hello </p>");
}

#[tokio::test]
async fn test_process_rejects_garbage_permanently() {
    let sender = Arc::new(RecordingSender::default());
    let (mailer, _metrics, _dir) = mailer(Arc::clone(&sender));

    let err = mailer.process(b"not json").await.unwrap_err();

    assert!(matches!(err, ProcessError::Parse(_)));
    assert!(err.is_permanent());
    assert!(sender.sent.lock().is_empty());
}

#[tokio::test]
async fn test_process_rejects_invalid_envelope_permanently() {
    let sender = Arc::new(RecordingSender::default());
    let (mailer, _metrics, _dir) = mailer(Arc::clone(&sender));

    let err = mailer
        .process(br#"{"Tpl":"hello","FromEmail":"a@x","Recipients":[]}"#)
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::Invalid(_)));
    assert!(err.is_permanent());
}

#[tokio::test]
async fn test_process_missing_template_is_retryable() {
    let sender = Arc::new(RecordingSender::default());
    let (mailer, metrics, _dir) = mailer(Arc::clone(&sender));

    let err = mailer
        .process(br#"{"Tpl":"goodbye","FromEmail":"a@x","Recipients":["b@x"]}"#)
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::Render(RenderError::NotFound(_))));
    assert!(!err.is_permanent());
    assert_eq!(metrics.mailer.render_errors(), 1);
    assert!(sender.sent.lock().is_empty());
}

#[tokio::test]
async fn test_process_send_failure_is_retryable() {
    let sender = Arc::new(RecordingSender::failing());
    let (mailer, metrics, _dir) = mailer(sender);

    let err = mailer
        .process(br#"{"Tpl":"hello","FromEmail":"a@x","Recipients":["b@x"]}"#)
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::Send(_)));
    assert!(!err.is_permanent());
    assert_eq!(metrics.mailer.send_errors(), 1);
}

#[test]
fn test_config_defaults() {
    let config: MailerConfig = ron::from_str("()").unwrap();

    assert_eq!(config.templates_dir, std::path::PathBuf::from("./templates/"));
    assert_eq!(config.smtp.port, 25);
    assert!(config.mjml.is_none());
}

#[test]
fn test_config_builds_mailer() {
    let dir = templates();
    let config: MailerConfig = ron::from_str(&format!(
        "(templates_dir: {:?}, smtp: (host: \"localhost\", port: 2525))",
        dir.path()
    ))
    .unwrap();

    assert!(!config.build(Arc::new(Metrics::new())).unwrap().converts_mjml());
}
