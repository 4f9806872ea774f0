use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use requestrewind::{
    config::Config,
    record::Record,
    replay::{ReplaySummary, replay_with_client},
    server,
    storage::Storage,
};
use tokio::{net::TcpListener, sync::mpsc};

#[derive(Debug)]
struct CapturedRequest {
    method: Method,
    uri: Uri,
    headers: hyper::HeaderMap,
    body: Bytes,
}

fn test_client() -> Client<HttpConnector, Full<Bytes>> {
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    Client::builder(TokioExecutor::new()).build(connector)
}

fn ephemeral_config() -> Config {
    Config::from_toml_str(
        r#"
[server]
listen = "127.0.0.1:0"
"#,
    )
    .expect("config should parse")
}

#[tokio::test]
async fn captured_requests_replay_verbatim_against_a_new_host() {
    let temp_dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(temp_dir.path().join("requests.db"), 4).unwrap();
    let capture_server = server::serve(&ephemeral_config(), storage.clone())
        .await
        .unwrap();
    let client = test_client();

    let get_uri: Uri = format!("http://{}/items?x=1&x=2", capture_server.listen_addr)
        .parse()
        .unwrap();
    let get_req = Request::builder()
        .method(Method::GET)
        .uri(get_uri)
        .header(header::ACCEPT, "text/plain")
        .header(header::COOKIE, "session=abc123")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = client.request(get_req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    let record: Record = serde_json::from_slice(&body).unwrap();
    assert_eq!(record.method, "GET");
    assert_eq!(record.path, "/items");
    assert_eq!(&record.query_params[..], br#""x=1&x=2""#);
    assert!(record.cookies.is_some());
    assert_eq!(record.body, None);

    let post_uri: Uri = format!("http://{}/orders", capture_server.listen_addr)
        .parse()
        .unwrap();
    let post_req = Request::builder()
        .method(Method::POST)
        .uri(post_uri)
        .header("x-multi", "one")
        .header("x-multi", "two")
        .body(Full::new(Bytes::from_static(b"order-payload")))
        .unwrap();
    let res = client.request(post_req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    capture_server.shutdown().await;

    let (target_addr, mut target_rx) = spawn_target().await;
    let summary = replay_with_client(
        &storage,
        &client,
        &format!("http://{target_addr}"),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert_eq!(
        summary,
        ReplaySummary {
            success: 2,
            failed: 0
        }
    );

    let first = target_rx.recv().await.unwrap();
    assert_eq!(first.method, Method::GET);
    assert_eq!(first.uri.path(), "/items");
    assert_eq!(first.uri.query(), Some("x=1&x=2"));
    assert_eq!(
        first.headers.get(header::ACCEPT).unwrap(),
        &HeaderValue::from_static("text/plain")
    );
    assert!(first.headers.get(header::COOKIE).is_none());
    assert_eq!(&first.body[..], b"");

    let second = target_rx.recv().await.unwrap();
    assert_eq!(second.method, Method::POST);
    assert_eq!(second.uri.path(), "/orders");
    assert_eq!(second.uri.query(), None);
    let multi: Vec<_> = second.headers.get_all("x-multi").iter().collect();
    assert_eq!(
        multi,
        vec![
            &HeaderValue::from_static("one"),
            &HeaderValue::from_static("two")
        ]
    );
    assert_eq!(&second.body[..], b"order-payload");
}

#[tokio::test]
async fn concurrent_captures_all_persist() {
    let temp_dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(temp_dir.path().join("requests.db"), 2).unwrap();
    let capture_server = server::serve(&ephemeral_config(), storage.clone())
        .await
        .unwrap();
    let listen_addr = capture_server.listen_addr;

    let mut joins = Vec::new();
    for index in 0..16 {
        joins.push(tokio::spawn(async move {
            let uri: Uri = format!("http://{listen_addr}/burst/{index}").parse().unwrap();
            let req = Request::builder()
                .method(Method::GET)
                .uri(uri)
                .body(Full::new(Bytes::new()))
                .unwrap();
            let res = test_client().request(req).await.unwrap();
            assert_eq!(res.status(), StatusCode::OK);
        }));
    }
    for join in joins {
        join.await.unwrap();
    }

    assert_eq!(storage.count_requests().await.unwrap(), 16);

    capture_server.shutdown().await;
}

/// Accepts connections until dropped, answering 200 and reporting each
/// request in arrival order.
async fn spawn_target() -> (SocketAddr, mpsc::UnboundedReceiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel::<CapturedRequest>();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            let tx = tx.clone();
            tokio::spawn(async move {
                let tx = Arc::new(tx);
                let service = service_fn(move |req: Request<Incoming>| {
                    let tx = Arc::clone(&tx);
                    async move {
                        let (parts, body) = req.into_parts();
                        let body_bytes = body.collect().await.unwrap().to_bytes();
                        tx.send(CapturedRequest {
                            method: parts.method,
                            uri: parts.uri,
                            headers: parts.headers,
                            body: body_bytes,
                        })
                        .unwrap();

                        Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from_static(
                            b"replayed",
                        ))))
                    }
                });
                let builder = ConnectionBuilder::new(TokioExecutor::new());
                let _ = builder.serve_connection(io, service).await;
            });
        }
    });

    (addr, rx)
}
