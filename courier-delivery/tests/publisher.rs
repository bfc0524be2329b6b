mod support;

use std::{sync::Arc, time::Duration};

use courier_broker::{Broker, ShortString, memory::MemoryBroker};
use courier_common::{EnvelopeError, MailRequest};
use courier_delivery::{DeliveryError, MailPublisher};
use pretty_assertions::assert_eq;
use serde_json::json;
use support::URI;

async fn publisher(memory: &MemoryBroker) -> MailPublisher {
    let broker = Broker::connect(URI, Arc::new(memory.clone()), Duration::from_secs(10))
        .await
        .unwrap();

    MailPublisher::new(Arc::new(broker), "mailer", "").await.unwrap()
}

#[tokio::test]
async fn test_declares_exchange() {
    let memory = MemoryBroker::new();
    let _publisher = publisher(&memory).await;

    assert!(memory.exchange_arguments("mailer").is_some());
}

#[tokio::test]
async fn test_send() {
    let memory = MemoryBroker::new();
    let publisher = publisher(&memory).await;

    let request = MailRequest::new("hello")
        .from("a@x")
        .with_subject("Hi {{name}}")
        .to(["b@x"])
        .with_payload(json!({ "name": "World" }));
    publisher.send(&request).await.unwrap();

    let published = memory.published("mailer");
    assert_eq!(published.len(), 1);
    assert_eq!(
        published[0]
            .properties
            .content_type()
            .as_ref()
            .map(ShortString::as_str),
        Some("application/json")
    );
    assert_eq!(published[0].properties.delivery_mode(), &Some(2));

    let queued: MailRequest = serde_json::from_slice(&published[0].body).unwrap();
    assert_eq!(queued, request);
}

#[tokio::test]
async fn test_send_invalid() {
    let memory = MemoryBroker::new();
    let publisher = publisher(&memory).await;

    let request = MailRequest::new("hello").from("a@x");
    assert!(matches!(
        publisher.send(&request).await,
        Err(DeliveryError::Invalid(EnvelopeError::EmptyRecipients))
    ));
    assert!(memory.published("mailer").is_empty());
}
