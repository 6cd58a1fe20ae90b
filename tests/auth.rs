mod support;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::header::{AUTHORIZATION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, WWW_AUTHENTICATE};
use http::StatusCode;
use md5::{Digest, Md5};
use support::server::{self, Body};
use tokio::io::AsyncWriteExt;

const BASIC: &str = "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==";

fn status(code: StatusCode) -> http::response::Builder {
    http::Response::builder().status(code)
}

fn ok() -> http::Response<Body> {
    http::Response::new(Body::new(Bytes::from_static(b"welcome")))
}

fn header_of(req: &http::Request<hyper::body::Incoming>, name: http::HeaderName) -> Option<String> {
    req.headers().get(name).map(|v| v.to_str().unwrap().to_owned())
}

fn basic_server(hits: Arc<Mutex<Vec<Option<String>>>>) -> server::Server {
    server::http(move |req| {
        let hits = hits.clone();
        async move {
            let auth = header_of(&req, AUTHORIZATION);
            hits.lock().unwrap().push(auth.clone());
            if auth.as_deref() == Some(BASIC) {
                ok()
            } else {
                status(StatusCode::UNAUTHORIZED)
                    .header(WWW_AUTHENTICATE, "Basic realm=\"test\"")
                    .body(Body::default())
                    .unwrap()
            }
        }
    })
}

#[tokio::test]
async fn basic_answers_challenge() {
    support::init_logger();
    let hits = Arc::new(Mutex::new(Vec::new()));
    let server = basic_server(hits.clone());

    let res = courier::Client::new()
        .get(server.url("/basic"))
        .realm(courier::Realm::basic("Aladdin", "open sesame"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "welcome");
    assert_eq!(*hits.lock().unwrap(), vec![None, Some(BASIC.to_owned())]);
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn basic_preemptive_sends_credentials_first() {
    support::init_logger();
    let hits = Arc::new(Mutex::new(Vec::new()));
    let server = basic_server(hits.clone());

    let client = courier::Client::builder()
        .realm(courier::Realm::basic("Aladdin", "open sesame").preemptive(true))
        .build()
        .unwrap();
    let res = client.get(server.url("/basic")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(*hits.lock().unwrap(), vec![Some(BASIC.to_owned())]);
}

#[tokio::test]
async fn basic_wrong_password_fails_once() {
    support::init_logger();
    let hits = Arc::new(Mutex::new(Vec::new()));
    let server = basic_server(hits.clone());

    let err = courier::Client::new()
        .get(server.url("/basic"))
        .realm(courier::Realm::basic("Aladdin", "wrong"))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_auth(), "{err:?}");
    assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
    assert_eq!(hits.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn challenge_without_realm_is_returned() {
    support::init_logger();
    let hits = Arc::new(Mutex::new(Vec::new()));
    let server = basic_server(hits);

    let res = courier::Client::new().get(server.url("/basic")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(res.headers()[WWW_AUTHENTICATE], "Basic realm=\"test\"");
}

fn md5_hex(data: String) -> String {
    format!("{:x}", Md5::digest(data.as_bytes()))
}

fn param<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header
        .trim_start_matches("Digest ")
        .split(", ")
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"'))
}

/// Checks the legacy (no `qop`) digest response against the expected hash.
fn digest_server(nonces: &'static [&'static str]) -> server::Server {
    let round = Arc::new(Mutex::new(0usize));
    server::http(move |req| {
        let round = round.clone();
        async move {
            let method = req.method().as_str().to_owned();
            let nonce = {
                let round = round.lock().unwrap();
                nonces[(*round).min(nonces.len() - 1)]
            };
            let challenge = |stale: bool| {
                let mut value = format!("Digest realm=\"testrealm\", nonce=\"{nonce}\", opaque=\"abc\"");
                if stale {
                    value.push_str(", stale=true");
                }
                status(StatusCode::UNAUTHORIZED)
                    .header(WWW_AUTHENTICATE, value)
                    .body(Body::default())
                    .unwrap()
            };

            let auth = match header_of(&req, AUTHORIZATION) {
                Some(auth) => auth,
                None => return challenge(false),
            };
            assert_eq!(param(&auth, "username"), Some("Mufasa"));
            assert_eq!(param(&auth, "opaque"), Some("abc"));
            let uri = param(&auth, "uri").unwrap();
            assert_eq!(uri, req.uri().path());

            if param(&auth, "nonce") != Some(nonce) {
                return challenge(true);
            }
            let ha1 = md5_hex("Mufasa:testrealm:Circle Of Life".to_owned());
            let ha2 = md5_hex(format!("{method}:{uri}"));
            let expected = md5_hex(format!("{ha1}:{nonce}:{ha2}"));
            if param(&auth, "response") == Some(expected.as_str()) {
                *round.lock().unwrap() += 1;
                ok()
            } else {
                challenge(false)
            }
        }
    })
}

#[tokio::test]
async fn digest_answers_challenge() {
    support::init_logger();
    let server = digest_server(&["n1"]);

    let res = courier::Client::new()
        .get(server.url("/dir/index.html"))
        .realm(courier::Realm::digest("Mufasa", "Circle Of Life"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn digest_stale_nonce_is_retried() {
    support::init_logger();
    let server = digest_server(&["n1", "n2"]);
    let client = courier::Client::builder()
        .realm(courier::Realm::digest("Mufasa", "Circle Of Life").preemptive(true))
        .build()
        .unwrap();

    let first = client.get(server.url("/one")).send().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    first.bytes().await.unwrap();

    // the cached nonce is stale now; the server hands out a fresh one
    let second = client.get(server.url("/two")).send().await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
}

#[tokio::test]
async fn digest_wrong_password_is_rejected() {
    support::init_logger();
    let server = digest_server(&["n1"]);

    let err = courier::Client::new()
        .get(server.url("/"))
        .realm(courier::Realm::digest("Mufasa", "wrong"))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_auth());
}

#[tokio::test]
async fn proxy_realm_uses_proxy_headers() {
    support::init_logger();
    let server = server::http(|req| async move {
        assert!(req.headers().get(AUTHORIZATION).is_none());
        if header_of(&req, PROXY_AUTHORIZATION).as_deref() == Some(BASIC) {
            ok()
        } else {
            status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
                .header(PROXY_AUTHENTICATE, "Basic realm=\"proxy\"")
                .body(Body::default())
                .unwrap()
        }
    });

    let res = courier::Client::new()
        .get(server.url("/"))
        .realm(courier::Realm::basic("Aladdin", "open sesame").for_proxy())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn auth_retries_are_bounded() {
    support::init_logger();
    let hits = Arc::new(Mutex::new(0usize));
    let counter = hits.clone();
    // every answer is met with a fresh stale nonce
    let server = server::http(move |_req| {
        let counter = counter.clone();
        async move {
            let n = {
                let mut hits = counter.lock().unwrap();
                *hits += 1;
                *hits
            };
            status(StatusCode::UNAUTHORIZED)
                .header(
                    WWW_AUTHENTICATE,
                    format!("Digest realm=\"r\", nonce=\"{n}\", stale=true"),
                )
                .body(Body::default())
                .unwrap()
        }
    });

    let client = courier::Client::builder()
        .max_auth_retries(1)
        .realm(courier::Realm::digest("Mufasa", "Circle Of Life"))
        .build()
        .unwrap();
    let err = client.get(server.url("/")).send().await.unwrap_err();
    assert!(err.is_auth());
    assert!(*hits.lock().unwrap() <= 3);
}

// Answers every request without the expected credentials with a 401 and then
// hangs up, leaving the client holding a dead connection.
fn hanging_up_after_401(accepts_credentials: bool) -> server::Server {
    server::low_level_with_response(move |raw, client_socket| {
        let authorized = accepts_credentials
            && String::from_utf8_lossy(raw)
                .to_ascii_lowercase()
                .contains(&format!("authorization: {}", BASIC.to_ascii_lowercase()));
        Box::new(async move {
            if authorized {
                let _ = client_socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\nwelcome")
                    .await;
            } else {
                let _ = client_socket
                    .write_all(
                        b"HTTP/1.1 401 Unauthorized\r\n\
                          WWW-Authenticate: Basic realm=\"test\"\r\n\
                          Content-Length: 0\r\n\r\n",
                    )
                    .await;
                let _ = client_socket.shutdown().await;
            }
        })
    })
}

#[tokio::test]
async fn credentials_survive_closed_connection() {
    support::init_logger();
    let server = hanging_up_after_401(true);

    let res = courier::Client::new()
        .get(server.url("/basic"))
        .realm(courier::Realm::basic("Aladdin", "open sesame"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "welcome");
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn rejection_after_closed_connection_is_an_error() {
    support::init_logger();
    let server = hanging_up_after_401(false);

    let err = courier::Client::new()
        .get(server.url("/basic"))
        .realm(courier::Realm::basic("Aladdin", "open sesame"))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_auth(), "{err:?}");
    assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
}
