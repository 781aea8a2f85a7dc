//! Range proxy tests
//!
//! Requests go through the in-process reply channel and the HTTP share
//! server, against cached content and live downloads served by wiremock or
//! the mock peer network.


use bytes::Bytes;
use gosh_share::{CacheMetadata, FileDescriptor, PeerId, ProxyStatus, ShareId};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{content, descriptor, sha1, unsized_descriptor, MockPeers, TestEnv};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(10);

/// Cache 1000 bytes of PDF content, returning its id and the bytes
async fn cached_pdf(env: &TestEnv) -> (ShareId, Vec<u8>) {
    let data = content(1000);
    let id = ShareId::from_digest(&sha1(&data));
    env.manager
        .save_to_cache(
            &id,
            Bytes::from(data.clone()),
            CacheMetadata::default().with_media_type("application/pdf"),
            3600,
        )
        .await
        .unwrap();
    (id, data)
}

async fn proxify(env: &TestEnv, id: &ShareId, range: Option<&str>) -> (gosh_share::ResponseHead, Vec<u8>) {
    timeout(WAIT, env.manager.proxify(id, range).collect())
        .await
        .expect("Proxy timed out")
        .expect("Proxy produced no response")
}

// =============================================================================
// Cached Content
// =============================================================================

#[tokio::test]
async fn test_cached_partial_content() {
    let env = TestEnv::new().await;
    let (id, data) = cached_pdf(&env).await;

    let (head, body) = proxify(&env, &id, Some("bytes=200-499")).await;
    assert_eq!(head.status, ProxyStatus::PartialContent);
    assert_eq!(head.header("Content-Range"), Some("bytes 200-499/1000"));
    assert_eq!(head.header("Content-Length"), Some("300"));
    assert_eq!(head.header("Content-Type"), Some("application/pdf"));
    assert_eq!(head.header("Accept-Ranges"), Some("bytes"));
    assert!(head.header("Last-Modified").is_some());
    assert_eq!(body, &data[200..500]);
}

#[tokio::test]
async fn test_cached_whole_content() {
    let env = TestEnv::new().await;
    let (id, data) = cached_pdf(&env).await;

    let (head, body) = proxify(&env, &id, None).await;
    assert_eq!(head.status, ProxyStatus::Ok);
    assert_eq!(head.content_length(), Some(1000));
    assert_eq!(head.header("Content-Range"), None);
    assert_eq!(body, data);
}

#[tokio::test]
async fn test_cached_range_end_is_clamped() {
    let env = TestEnv::new().await;
    let (id, data) = cached_pdf(&env).await;

    let (head, body) = proxify(&env, &id, Some("bytes=900-5000")).await;
    assert_eq!(head.status, ProxyStatus::PartialContent);
    assert_eq!(head.header("Content-Range"), Some("bytes 900-999/1000"));
    assert_eq!(body, &data[900..]);

    let (head, body) = proxify(&env, &id, Some("bytes=990-")).await;
    assert_eq!(head.status, ProxyStatus::PartialContent);
    assert_eq!(body, &data[990..]);
}

#[tokio::test]
async fn test_range_errors() {
    let env = TestEnv::new().await;
    let (id, _) = cached_pdf(&env).await;

    let (head, body) = proxify(&env, &id, Some("bytes=1000-")).await;
    assert_eq!(head.status, ProxyStatus::RangeNotSatisfiable);
    assert_eq!(head.header("Content-Range"), Some("bytes */1000"));
    assert!(body.is_empty());

    let (head, _) = proxify(&env, &id, Some("bytes=abc")).await;
    assert_eq!(head.status, ProxyStatus::BadRequest);

    let (head, _) = proxify(&env, &id, Some("bytes=500-100")).await;
    assert_eq!(head.status, ProxyStatus::BadRequest);

    for unsupported in ["bytes=-500", "bytes=0-1,5-6", "items=0-1"] {
        let (head, _) = proxify(&env, &id, Some(unsupported)).await;
        assert_eq!(head.status, ProxyStatus::NotImplemented, "{}", unsupported);
    }
}

#[tokio::test]
async fn test_unknown_share() {
    let env = TestEnv::new().await;
    let (head, body) = proxify(&env, &ShareId::from_digest(&[9; 20]), None).await;
    assert_eq!(head.status, ProxyStatus::NotFound);
    assert!(body.is_empty());
}

// =============================================================================
// Downloaded Content
// =============================================================================

#[tokio::test]
async fn test_source_without_uris() {
    let env = TestEnv::new().await;
    let data = content(10);
    let id = env
        .manager
        .register_source(&descriptor("a.bin", &data), None, &[])
        .unwrap();

    let (head, _) = proxify(&env, &id, None).await;
    assert_eq!(head.status, ProxyStatus::ServiceUnavailable);

    let (head, _) = proxify(&env, &id, Some("bytes=0-4")).await;
    assert_eq!(head.status, ProxyStatus::ServiceUnavailable);
}

#[tokio::test]
async fn test_proxy_follows_download() {
    let env = TestEnv::new().await;
    let server = MockServer::start().await;
    let data = content(1000);

    Mock::given(method("GET"))
        .and(path("/song.ogg"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "audio/ogg")
                .set_body_bytes(data.clone()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let id = env
        .manager
        .register_source(
            &descriptor("song.ogg", &data),
            None,
            &[format!("{}/song.ogg", server.uri())],
        )
        .unwrap();

    let (head, body) = proxify(&env, &id, None).await;
    assert_eq!(head.status, ProxyStatus::Ok);
    assert_eq!(head.content_length(), Some(1000));
    assert_eq!(head.header("Content-Type"), Some("audio/ogg"));
    assert_eq!(body, data);

    // Later requests are served from the cache
    timeout(WAIT, async {
        while env.manager.cache_item(&id, false).await.unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let (head, body) = proxify(&env, &id, Some("bytes=10-19")).await;
    assert_eq!(head.status, ProxyStatus::PartialContent);
    assert_eq!(body, &data[10..20]);
}

#[tokio::test]
async fn test_ranged_request_uses_dedicated_download() {
    let env = TestEnv::new().await;
    let server = MockServer::start().await;
    let data = content(1000);

    Mock::given(method("GET"))
        .and(path("/video.webm"))
        .and(header("Range", "bytes=200-499"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 200-499/1000")
                .insert_header("Content-Type", "video/webm")
                .set_body_bytes(data[200..500].to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let id = env
        .manager
        .register_source(
            &descriptor("video.webm", &data),
            None,
            &[format!("{}/video.webm", server.uri())],
        )
        .unwrap();

    let (head, body) = proxify(&env, &id, Some("bytes=200-499")).await;
    assert_eq!(head.status, ProxyStatus::PartialContent);
    assert_eq!(head.header("Content-Range"), Some("bytes 200-499/1000"));
    assert_eq!(head.content_length(), Some(300));
    assert_eq!(body, &data[200..500]);

    // A partial download never reaches the cache
    assert!(env.manager.cache_item(&id, false).await.unwrap().is_none());
}

#[tokio::test]
async fn test_oversized_source_range_is_trimmed_to_request() {
    let env = TestEnv::new().await;
    let server = MockServer::start().await;
    let data = content(1000);

    // The source starts where asked but sends everything up to the end
    Mock::given(method("GET"))
        .and(path("/talk.webm"))
        .and(header("Range", "bytes=200-499"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 200-999/1000")
                .set_body_bytes(data[200..].to_vec()),
        )
        .mount(&server)
        .await;

    let id = env
        .manager
        .register_source(
            &descriptor("talk.webm", &data),
            None,
            &[format!("{}/talk.webm", server.uri())],
        )
        .unwrap();

    let (head, body) = proxify(&env, &id, Some("bytes=200-499")).await;
    assert_eq!(head.status, ProxyStatus::PartialContent);
    assert_eq!(head.header("Content-Range"), Some("bytes 200-499/1000"));
    assert_eq!(head.content_length(), Some(300));
    assert_eq!(body, &data[200..500]);
}

#[tokio::test]
async fn test_source_ignoring_range_sends_whole_content() {
    let env = TestEnv::new().await;
    let server = MockServer::start().await;
    let data = content(400);

    Mock::given(method("GET"))
        .and(path("/plain.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
        .mount(&server)
        .await;

    let id = env
        .manager
        .register_source(
            &descriptor("plain.txt", &data),
            None,
            &[format!("{}/plain.txt", server.uri())],
        )
        .unwrap();

    let (head, body) = proxify(&env, &id, Some("bytes=100-199")).await;
    assert_eq!(head.status, ProxyStatus::Ok);
    assert_eq!(head.content_length(), Some(400));
    assert_eq!(body, data);
}

/// A share streamed by a peer that never tells the content size
async fn unsized_share(data: &[u8]) -> (TestEnv, ShareId) {
    let peers = MockPeers::new();
    let peer = PeerId::new("live@example.org/pc");
    peers.set_online(&peer);
    peers.add_unsized_file(&peer, data.to_vec());
    let env = TestEnv::with_peers(Arc::clone(&peers)).await;
    let id = env
        .manager
        .register_source(
            &unsized_descriptor("live.ogg", data),
            None,
            &["xmpp:live@example.org/pc?jingle-ft".to_string()],
        )
        .unwrap();
    (env, id)
}

#[tokio::test]
async fn test_unknown_length_streams_until_download_ends() {
    let data = content(1000);
    let (env, id) = unsized_share(&data).await;

    let (head, body) = proxify(&env, &id, None).await;
    assert_eq!(head.status, ProxyStatus::Ok);
    assert_eq!(head.content_length(), None);
    assert_eq!(head.header("Connection"), None);
    assert_eq!(head.header("Content-Range"), None);
    assert_eq!(body, data);
}

#[tokio::test]
async fn test_open_range_of_unknown_size_is_not_implemented() {
    let data = content(1000);
    let (env, id) = unsized_share(&data).await;

    let (head, body) = proxify(&env, &id, Some("bytes=100-")).await;
    assert_eq!(head.status, ProxyStatus::NotImplemented);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_failing_source_is_bad_gateway() {
    let env = TestEnv::new().await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let file = FileDescriptor::new("x.bin").with_hash(gosh_share::FileHash::sha1(vec![5; 20]));
    let id = env
        .manager
        .register_source(&file, None, &[format!("{}/x.bin", server.uri())])
        .unwrap();

    let (head, body) = proxify(&env, &id, None).await;
    assert_eq!(head.status, ProxyStatus::BadGateway);
    assert!(body.is_empty());
}

// =============================================================================
// Share Server
// =============================================================================

/// Header value from a raw response head, matching the name case-insensitively
fn raw_header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

/// Read one response off `stream`, taking a body of `Content-Length` bytes
/// unless `with_body` is false
async fn read_response(stream: &mut TcpStream, with_body: bool) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "Connection closed before the response head");
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
    let length: usize = match with_body {
        true => raw_header(&head, "Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        false => 0,
    };

    let mut body = buf[head_end..].to_vec();
    while body.len() < length {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "Connection closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }
    (head, body)
}

#[tokio::test]
async fn test_share_server_keep_alive() {
    let env = TestEnv::new().await;
    let (id, data) = cached_pdf(&env).await;
    let server = env.manager.serve("127.0.0.1:0").await.unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let request = format!(
        "GET /share/{} HTTP/1.1\r\nHost: localhost\r\nRange: bytes=200-499\r\n\r\n",
        id
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let (head, body) = timeout(WAIT, read_response(&mut stream, true)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 206 Partial Content\r\n"));
    assert_eq!(raw_header(&head, "Content-Range"), Some("bytes 200-499/1000"));
    assert_eq!(raw_header(&head, "Accept-Ranges"), Some("bytes"));
    assert_eq!(body, &data[200..500]);

    // Same connection, whole content
    let request = format!("GET /share/{} HTTP/1.1\r\nHost: localhost\r\n\r\n", id);
    stream.write_all(request.as_bytes()).await.unwrap();
    let (head, body) = timeout(WAIT, read_response(&mut stream, true)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, data);

    server.shutdown().await;
}

#[tokio::test]
async fn test_share_server_head_and_request_forms() {
    let env = TestEnv::new().await;
    let (id, data) = cached_pdf(&env).await;
    let server = env.manager.serve("127.0.0.1:0").await.unwrap();
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    // HEAD answers with the GET headers and no body
    let request = format!("HEAD /share/{} HTTP/1.1\r\nHost: localhost\r\n\r\n", id);
    stream.write_all(request.as_bytes()).await.unwrap();
    let (head, _) = timeout(WAIT, read_response(&mut stream, false)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(raw_header(&head, "Content-Length"), Some("1000"));

    // A request body is skipped, not mistaken for the next request
    let request = format!(
        "GET /share/{} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello",
        id
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let (head, body) = timeout(WAIT, read_response(&mut stream, true)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, data);

    // Absolute-form target
    let request = format!(
        "GET http://{}/share/{} HTTP/1.1\r\nHost: localhost\r\nRange: bytes=0-9\r\n\r\n",
        server.local_addr(),
        id
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let (head, body) = timeout(WAIT, read_response(&mut stream, true)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 206 Partial Content\r\n"));
    assert_eq!(body, &data[..10]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_share_server_unknown_length() {
    let data = content(1000);
    let (env, id) = unsized_share(&data).await;
    let server = env.manager.serve("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/share/{}", server.local_addr(), id);

    // HTTP/1.1 clients get a chunked body
    let response = timeout(WAIT, reqwest::get(&url)).await.unwrap().unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.headers().get("content-length").is_none());
    let body = timeout(WAIT, response.bytes()).await.unwrap().unwrap();
    assert_eq!(&body[..], &data[..]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_share_server_unknown_length_closes_connection() {
    let data = content(1000);
    let (env, id) = unsized_share(&data).await;
    let server = env.manager.serve("127.0.0.1:0").await.unwrap();

    // HTTP/1.0 has no chunking: the end of the body is the end of the connection
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let request = format!("GET /share/{} HTTP/1.0\r\nHost: localhost\r\n\r\n", id);
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut raw)).await.unwrap().unwrap();

    let head_end = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let head = String::from_utf8(raw[..head_end].to_vec()).unwrap();
    assert!(head.contains(" 200 OK\r\n"));
    assert_eq!(raw_header(&head, "Content-Length"), None);
    assert_eq!(raw_header(&head, "Transfer-Encoding"), None);
    assert_eq!(&raw[head_end..], &data[..]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_share_server_rejects_bad_requests() {
    let env = TestEnv::new().await;
    let server = env.manager.serve("127.0.0.1:0").await.unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream
        .write_all(b"GET /elsewhere/abc HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = timeout(WAIT, read_response(&mut stream, true)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));

    // Not a share id
    stream
        .write_all(b"GET /share/not-hex HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = timeout(WAIT, read_response(&mut stream, true)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream
        .write_all(b"POST /share/abcd HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = timeout(WAIT, read_response(&mut stream, true)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));

    server.shutdown().await;
}
