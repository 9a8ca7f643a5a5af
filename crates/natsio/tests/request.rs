mod common;

use common::{connect, eventually, fast_options, WAIT};
use natsio::testing::MockServer;
use natsio::{
    Message, NatsClient, NatsError, Request, RequestId, RequestOptions, SubscribeOptions,
};
use natsio_protocol::ClientOp;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Answers every request on `subject` with `prefix` + payload.
fn respond(client: &NatsClient, subject: &str, prefix: &'static str) {
    let responder = client.clone();
    client
        .subscribe(subject, SubscribeOptions::new(), move |msg: Message| {
            if let Some(reply) = &msg.reply {
                let body = format!("{prefix}{}", msg.payload_str());
                let _ = responder.publish(reply, body);
            }
        })
        .unwrap();
}

type Replies = Arc<Mutex<Vec<Result<String, NatsError>>>>;

fn recorder() -> (Replies, impl Fn(Result<Message, NatsError>) + Send + Sync + 'static) {
    let replies: Replies = Arc::default();
    let r = Arc::clone(&replies);
    (replies, move |reply: Result<Message, NatsError>| {
        r.lock().push(reply.map(|m| m.payload_str().into_owned()));
    })
}

fn inbox_subscriptions(server: &MockServer) -> usize {
    server
        .received_ops()
        .iter()
        .filter(|op| matches!(op, ClientOp::Sub { subject, .. } if subject.starts_with("_INBOX.")))
        .count()
}

#[tokio::test]
async fn test_muxed_requests_share_one_inbox() {
    let server = MockServer::start().await.unwrap();
    let service = connect(&server).await;
    respond(&service, "echo", "re:");
    service.flush().await.unwrap();

    let client = connect(&server).await;
    for i in 0..5 {
        let reply = client
            .send_request("echo", i.to_string(), WAIT)
            .await
            .unwrap();
        assert_eq!(reply.payload_str(), format!("re:{i}"));
    }
    assert_eq!(inbox_subscriptions(&server), 1);
    assert_eq!(client.subscription_count(), 1);
}

#[tokio::test]
async fn test_legacy_requests_use_dedicated_inboxes() {
    let server = MockServer::start().await.unwrap();
    let service = connect(&server).await;
    respond(&service, "echo", "re:");
    service.flush().await.unwrap();

    let options = fast_options(&server).with_old_request_style(true);
    let client = NatsClient::connect_with(options).await.unwrap();
    for i in 0..3 {
        let reply = client
            .send_request("echo", i.to_string(), WAIT)
            .await
            .unwrap();
        assert_eq!(reply.payload_str(), format!("re:{i}"));
    }
    assert_eq!(inbox_subscriptions(&server), 3);
    assert!(eventually(|| client.subscription_count() == 0).await);
}

#[tokio::test]
async fn test_request_collects_up_to_max_replies() {
    for legacy in [false, true] {
        let server = MockServer::start().await.unwrap();
        let service = connect(&server).await;
        respond(&service, "poll", "a:");
        respond(&service, "poll", "b:");
        respond(&service, "poll", "c:");
        service.flush().await.unwrap();

        let options = fast_options(&server).with_old_request_style(legacy);
        let client = NatsClient::connect_with(options).await.unwrap();
        let (replies, callback) = recorder();
        let request = Request::new("poll")
            .with_payload("x")
            .with_options(RequestOptions::default().with_max(2))
            .with_timeout(Duration::from_millis(300));
        client.request(request, callback).unwrap();

        assert!(eventually(|| replies.lock().len() >= 2).await);
        tokio::time::sleep(Duration::from_millis(400)).await;
        let replies = replies.lock();
        assert_eq!(replies.len(), 2, "legacy={legacy}");
        assert!(replies.iter().all(Result::is_ok));
    }
}

#[tokio::test]
async fn test_request_timeout_reports_on_callback() {
    for legacy in [false, true] {
        let server = MockServer::start().await.unwrap();
        let options = fast_options(&server).with_old_request_style(legacy);
        let client = NatsClient::connect_with(options).await.unwrap();

        let (replies, callback) = recorder();
        let handle = client
            .request(("nobody.home", Duration::from_millis(50)), callback)
            .unwrap();
        assert!(eventually(|| !replies.lock().is_empty()).await);
        assert_eq!(*replies.lock(), vec![Err(NatsError::RequestTimeout)]);

        let cancelled = client.cancel_request(&handle);
        assert!(!cancelled.was_pending);
        if let RequestId::Subscription(sid) = handle.id {
            assert!(client.subscription(sid).is_none());
            let unsub = ClientOp::Unsub {
                sid: sid.as_u64(),
                max: None,
            };
            assert!(eventually(|| server.received_ops().contains(&unsub)).await);
        }
    }
}

#[tokio::test]
async fn test_send_request_timeout() {
    let server = MockServer::start().await.unwrap();
    let client = connect(&server).await;
    let result = client
        .send_request("void", "", Duration::from_millis(50))
        .await;
    assert_eq!(result.unwrap_err(), NatsError::RequestTimeout);
}

#[tokio::test]
async fn test_cancelled_request_never_calls_back() {
    for legacy in [false, true] {
        let server = MockServer::start().await.unwrap();
        let options = fast_options(&server).with_old_request_style(legacy);
        let client = NatsClient::connect_with(options).await.unwrap();

        let (replies, callback) = recorder();
        let request = Request::new("slow")
            .with_options(RequestOptions::default().with_max(5))
            .with_timeout(Duration::from_millis(100));
        let handle = client.request(request, callback).unwrap();

        let cancelled = client.cancel_request(&handle);
        assert!(cancelled.was_pending);
        assert_eq!(cancelled.max, Some(5));
        assert_eq!(cancelled.timeout, Some(Duration::from_millis(100)));
        assert!(!client.cancel_request(&handle).was_pending);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(replies.lock().is_empty());
    }
}

#[tokio::test]
async fn test_late_replies_to_finished_request_are_dropped() {
    let server = MockServer::start().await.unwrap();
    let service = connect(&server).await;
    respond(&service, "dup", "1:");
    respond(&service, "dup", "2:");
    service.flush().await.unwrap();

    let client = connect(&server).await;
    let (replies, callback) = recorder();
    client.request_one("dup", callback).unwrap();
    assert!(eventually(|| !replies.lock().is_empty()).await);
    client.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(replies.lock().len(), 1);
}

#[tokio::test]
async fn test_request_rejects_invalid_subject() {
    let server = MockServer::start().await.unwrap();
    let client = connect(&server).await;
    let (_, callback) = recorder();
    assert!(matches!(
        client.request("bad subject", callback),
        Err(NatsError::InvalidSubject(_))
    ));
}
