mod support;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use courier::{BodyConsumer, BodyPart, Demand};
use support::server::{self, Body};

const LARGE: usize = 8 * 1024 * 1024;

fn large_server() -> server::Server {
    server::http(|_req| async {
        http::Response::new(Body::new(Bytes::from(vec![b'x'; LARGE])))
    })
}

#[derive(Default)]
struct Counting {
    parts: Arc<AtomicUsize>,
    demand: Arc<Mutex<Option<Demand>>>,
    buf: BytesMut,
    completed: bool,
    failed: bool,
}

impl BodyConsumer for Counting {
    fn on_subscribe(&mut self, demand: &Demand) {
        *self.demand.lock().unwrap() = Some(demand.clone());
        demand.request(1);
    }

    fn on_part(&mut self, part: BodyPart, _demand: &Demand) {
        self.parts.fetch_add(1, Ordering::SeqCst);
        self.buf.extend_from_slice(part.bytes());
    }

    fn on_error(&mut self, _err: courier::Error) {
        self.failed = true;
    }

    fn on_complete(&mut self) {
        self.completed = true;
    }
}

#[tokio::test]
async fn parts_wait_for_demand() {
    support::init_logger();
    let server = large_server();

    let consumer = Counting::default();
    let parts = consumer.parts.clone();
    let demand = consumer.demand.clone();

    let (head, delivery) = courier::Client::new()
        .get(server.url("/large"))
        .send_with(consumer)
        .await
        .unwrap();
    assert_eq!(head.content_length(), Some(LARGE as u64));

    let delivery = tokio::spawn(delivery);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(parts.load(Ordering::SeqCst), 1, "only the subscribed part");

    let handle = demand.lock().unwrap().clone().expect("subscribed");
    handle.request(usize::MAX);

    let consumer = delivery.await.unwrap();
    assert!(consumer.completed);
    assert!(!consumer.failed);
    assert_eq!(consumer.buf.len(), LARGE);
    assert!(parts.load(Ordering::SeqCst) > 1);
}

#[tokio::test]
async fn exactly_one_last_part() {
    support::init_logger();
    let server = large_server();

    let mut res = courier::Client::new()
        .get(server.url("/large"))
        .send()
        .await
        .unwrap();

    let body = res.body_mut();
    body.request(4);
    let mut read = 0;
    let mut lasts = 0;
    while let Some(part) = body.next_part().await {
        let part = part.unwrap();
        read += part.bytes().len();
        if part.is_last() {
            lasts += 1;
        }
    }
    assert_eq!(read, LARGE);
    assert_eq!(lasts, 1);
}

async fn cancel_after(parts: usize) {
    support::init_logger();
    let server = large_server();
    let client = courier::Client::new();

    let mut res = client.get(server.url("/large")).send().await.unwrap();
    for _ in 0..parts {
        let part = res.body_mut().next_part().await.unwrap().unwrap();
        assert!(!part.is_last());
    }
    res.body_mut().cancel();
    assert!(res.body_mut().next_part().await.is_none());
    drop(res);

    // the canceled connection is closed, not pooled
    let next = client.get(server.url("/large")).send().await.unwrap();
    assert_eq!(next.bytes().await.unwrap().len(), LARGE);
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn cancel_before_first_part() {
    cancel_after(0).await;
}

#[tokio::test]
async fn cancel_after_one_part() {
    cancel_after(1).await;
}

#[tokio::test]
async fn cancel_after_ten_parts() {
    cancel_after(10).await;
}

#[tokio::test]
async fn dropping_the_response_closes_the_connection() {
    support::init_logger();
    let mut server = large_server();
    let client = courier::Client::new();

    let res = client.get(server.url("/large")).send().await.unwrap();
    drop(res);

    for _ in 0..50 {
        if !server.events().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(client.pool_stats().idle, 0);
}

#[tokio::test]
async fn completed_body_returns_connection() {
    support::init_logger();
    let server = server::http(|_req| async { http::Response::new(Body::new(Bytes::from_static(b"small"))) });
    let client = courier::Client::new();

    for _ in 0..3 {
        let text = client.get(server.url("/")).send().await.unwrap().text().await.unwrap();
        assert_eq!(text, "small");
    }
    assert_eq!(server.accepted(), 1);
    assert_eq!(client.pool_stats().idle, 1);
}

#[tokio::test]
async fn cancel_token_stops_delivery() {
    support::init_logger();
    let server = large_server();
    let token = courier::CancellationToken::new();

    let completed = Arc::new(AtomicBool::new(false));
    struct Slow(Arc<AtomicBool>);
    impl BodyConsumer for Slow {
        fn on_part(&mut self, _part: BodyPart, _demand: &Demand) {}
        fn on_complete(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let (_head, delivery) = courier::Client::new()
        .get(server.url("/large"))
        .cancel_token(token.clone())
        .send_with(Slow(completed.clone()))
        .await
        .unwrap();

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), delivery)
        .await
        .expect("delivery ends after cancel");
    assert!(!completed.load(Ordering::SeqCst));
}

#[derive(Default)]
struct Recorder {
    events: Vec<String>,
    body: BytesMut,
}

impl BodyConsumer for Recorder {
    fn on_subscribe(&mut self, demand: &Demand) {
        self.events.push("subscribe".into());
        demand.request(usize::MAX);
    }

    fn on_part(&mut self, part: BodyPart, _demand: &Demand) {
        self.body.extend_from_slice(part.bytes());
    }

    fn on_error(&mut self, err: courier::Error) {
        self.events.push(format!("error auth={}", err.is_auth()));
    }

    fn on_complete(&mut self) {
        self.events.push("complete".into());
    }
}

#[tokio::test]
async fn failed_request_hands_consumer_back() {
    support::init_logger();
    let server = server::http(|req| async move {
        if req.uri().path() == "/locked" {
            http::Response::builder()
                .status(http::StatusCode::UNAUTHORIZED)
                .header(http::header::WWW_AUTHENTICATE, "Basic realm=\"test\"")
                .body(Body::default())
                .unwrap()
        } else {
            http::Response::new(Body::new(Bytes::from_static(b"open")))
        }
    });
    let client = courier::Client::new();

    let err = client
        .get(server.url("/locked"))
        .realm(courier::Realm::basic("user", "wrong"))
        .send_with(Recorder::default())
        .await
        .unwrap_err();
    assert!(err.error().is_auth());
    let consumer = err.into_consumer();
    assert_eq!(consumer.events, vec!["error auth=true"]);

    let (head, delivery) = client
        .get(server.url("/open"))
        .send_with(consumer)
        .await
        .unwrap();
    assert_eq!(head.status(), http::StatusCode::OK);
    let consumer = delivery.await;
    assert_eq!(consumer.events, vec!["error auth=true", "subscribe", "complete"]);
    assert_eq!(&consumer.body[..], b"open");
}

#[tokio::test]
async fn builder_error_reaches_consumer() {
    support::init_logger();
    let err = courier::Client::new()
        .get("ftp://example.com/file")
        .send_with(Recorder::default())
        .await
        .unwrap_err();
    let (err, consumer) = err.into_parts();
    assert!(err.is_builder());
    assert_eq!(consumer.events, vec!["error auth=false"]);
}
