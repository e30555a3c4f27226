//! IronMQ adapter against a mock HTTP server.

use quay_jobs::adapter::{Adapter, IronAdapter, Lease, PushOptions};
use quay_jobs::{
    Envelope, ExecutionState, Executor, HandlerRegistry, JobConfig, JobData, JobHandle,
    QueueError, Resolver,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const QUEUE_PATH: &str = "/3/projects/p1/queues/emails";

fn adapter(server: &MockServer) -> IronAdapter {
    IronAdapter::new(&server.uri(), "p1", "secret", Duration::from_secs(5)).unwrap()
}

fn lease() -> Lease {
    Lease {
        id: "m1".to_string(),
        token: Some("r1".to_string()),
        body: r#"{"handler":"Mailer","data":{}}"#.to_string(),
        attempts: 1,
    }
}

#[tokio::test]
async fn test_push_posts_message_with_delay() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/messages", QUEUE_PATH)))
        .and(header("Authorization", "OAuth secret"))
        .and(body_partial_json(json!({ "messages": [{ "delay": 15 }] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ids": ["m1"] })))
        .expect(1)
        .mount(&server)
        .await;

    let envelope = Envelope::new("Mailer@send", JobData::new());
    let options = PushOptions::default().delay(Duration::from_secs(15));

    let id = assert_ok!(adapter(&server).push("emails", &envelope, &options).await);
    assert_eq!(id, "m1");
}

#[tokio::test]
async fn test_pop_maps_reservation_to_lease() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/reservations", QUEUE_PATH)))
        .and(body_partial_json(json!({ "n": 1, "timeout": 60, "wait": 0 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [{
                "id": "m1",
                "body": r#"{"handler":"Mailer","data":{"to":"a@b.c"}}"#,
                "reserved_count": 3,
                "reservation_id": "r1"
            }]
        })))
        .mount(&server)
        .await;

    let lease = assert_ok!(adapter(&server).pop("emails", Duration::ZERO).await);

    assert_eq!(lease.id, "m1");
    assert_eq!(lease.token.as_deref(), Some("r1"));
    assert_eq!(lease.attempts, 3);
    let envelope = Envelope::decode(&lease.body).unwrap();
    assert_eq!(envelope.data["to"], "a@b.c");
}

#[tokio::test]
async fn test_pop_on_empty_queue() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/reservations", QUEUE_PATH)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "messages": [] })))
        .mount(&server)
        .await;

    let err = assert_err!(adapter(&server).pop("emails", Duration::ZERO).await);
    assert!(matches!(err, QueueError::QueueEmpty(_)));
}

#[tokio::test]
async fn test_delete_sends_reservation() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/messages/m1", QUEUE_PATH)))
        .and(body_partial_json(json!({ "reservation_id": "r1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "msg": "Deleted" })))
        .expect(1)
        .mount(&server)
        .await;

    assert_ok!(adapter(&server).delete("emails", &lease()).await);
}

#[tokio::test]
async fn test_delete_of_missing_message_is_ok() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/messages/m1", QUEUE_PATH)))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "msg": "Message not found" })))
        .mount(&server)
        .await;

    assert_ok!(adapter(&server).delete("emails", &lease()).await);
}

#[tokio::test]
async fn test_release_sends_delay() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/messages/m1/release", QUEUE_PATH)))
        .and(body_partial_json(json!({ "reservation_id": "r1", "delay": 30 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "msg": "Released" })))
        .expect(1)
        .mount(&server)
        .await;

    assert_ok!(
        adapter(&server)
            .release("emails", &lease(), Duration::from_secs(30))
            .await
    );
}

#[tokio::test]
async fn test_bury_republishes_to_dead_letter_queue() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/3/projects/p1/queues/emails-dead/messages"))
        .and(body_partial_json(json!({
            "messages": [{ "body": r#"{"handler":"Mailer","data":{}}"#, "delay": 0 }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ids": ["d1"] })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/messages/m1", QUEUE_PATH)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "msg": "Deleted" })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter(&server).with_dead_letter_queue("emails-dead");
    assert!(adapter.capabilities().bury);
    assert_ok!(adapter.bury("emails", &lease()).await);
}

#[tokio::test]
async fn test_bury_without_dead_letter_queue() {
    let server = MockServer::start().await;

    let err = assert_err!(adapter(&server).bury("emails", &lease()).await);

    assert!(matches!(
        err,
        QueueError::Capability {
            adapter: "iron",
            capability: "bury"
        }
    ));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_count_reads_queue_size() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(QUEUE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "queue": { "name": "emails", "size": 3, "total_messages": 10 }
        })))
        .mount(&server)
        .await;

    assert_eq!(adapter(&server).count("emails").await.unwrap(), 3);
}

#[tokio::test]
async fn test_count_of_unknown_queue_is_zero() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/3/projects/p1/queues/nowhere"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "msg": "Queue not found" })))
        .mount(&server)
        .await;

    assert_eq!(adapter(&server).count("nowhere").await.unwrap(), 0);
}

#[tokio::test]
async fn test_rejected_token_is_configuration_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/messages", QUEUE_PATH)))
        .respond_with(ResponseTemplate::new(401).set_body_string("Invalid token"))
        .mount(&server)
        .await;

    let envelope = Envelope::new("Mailer", JobData::new());
    let err = assert_err!(
        adapter(&server)
            .push("emails", &envelope, &PushOptions::default())
            .await
    );

    assert!(matches!(err, QueueError::Configuration(ref msg) if msg.contains("Invalid token")));
}

#[tokio::test]
async fn test_is_connected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/3/projects/p1/queues"))
        .and(header("Authorization", "OAuth secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "queues": [] })))
        .mount(&server)
        .await;

    assert!(adapter(&server).is_connected().await);

    let wrong_project =
        IronAdapter::new(&server.uri(), "p2", "secret", Duration::from_secs(5)).unwrap();
    assert!(!wrong_project.is_connected().await);
}

#[tokio::test]
async fn test_executor_deletes_unresolvable_reservation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/reservations", QUEUE_PATH)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [{
                "id": "m1",
                "body": r#"{"handler":"Missing","data":{}}"#,
                "reserved_count": 1,
                "reservation_id": "r1"
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/messages/m1", QUEUE_PATH)))
        .and(body_partial_json(json!({ "reservation_id": "r1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "msg": "Deleted" })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter: Arc<dyn Adapter> = Arc::new(adapter(&server));
    let executor = Executor::new(Resolver::new(
        Arc::new(HandlerRegistry::new()),
        JobConfig::default(),
    ));

    let mut job = JobHandle::pop(adapter, "emails", Duration::ZERO).await.unwrap();
    let report = executor.execute(&mut job).await;

    assert_eq!(report.state, ExecutionState::Deleted);
}
