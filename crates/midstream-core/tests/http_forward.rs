use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use midstream_core::{
    FlowContext, Proxy, ProxyConfig, ProxyDelegate, ProxyServer, UpstreamEvent,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Clone, Default)]
struct RecordingDelegate {
    stages: Arc<Mutex<Vec<&'static str>>>,
}

impl RecordingDelegate {
    fn log(&self, stage: &'static str) {
        self.stages.lock().expect("stage log").push(stage);
    }

    fn stages(&self) -> Vec<&'static str> {
        self.stages.lock().expect("stage log").clone()
    }
}

impl ProxyDelegate for RecordingDelegate {
    fn on_connect(&self, _ctx: &mut FlowContext) -> impl Future<Output = ()> + Send {
        self.log("connect");
        async {}
    }

    fn on_auth(&self, _ctx: &mut FlowContext) -> impl Future<Output = ()> + Send {
        self.log("auth");
        async {}
    }

    fn before_request(&self, _ctx: &mut FlowContext) -> impl Future<Output = ()> + Send {
        self.log("before_request");
        async {}
    }

    fn parent_proxy(
        &self,
        _ctx: &mut FlowContext,
    ) -> impl Future<Output = Option<midstream_core::UpstreamProxy>> + Send {
        self.log("parent_proxy");
        async { None }
    }

    fn before_response(
        &self,
        _ctx: &mut FlowContext,
        _event: &UpstreamEvent<'_>,
    ) -> impl Future<Output = ()> + Send {
        self.log("before_response");
        async {}
    }

    fn during_response(
        &self,
        _ctx: &mut FlowContext,
        _event: &UpstreamEvent<'_>,
    ) -> impl Future<Output = ()> + Send {
        self.log("during_response");
        async {}
    }

    fn on_finish(&self, _ctx: &mut FlowContext) -> impl Future<Output = ()> + Send {
        self.log("finish");
        async {}
    }
}

async fn start_origin(
    connections: Arc<AtomicUsize>,
    seen_heads: Arc<Mutex<Vec<String>>>,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let addr = listener.local_addr().expect("origin addr");
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            connections.fetch_add(1, Ordering::SeqCst);
            let seen_heads = Arc::clone(&seen_heads);
            tokio::spawn(async move {
                loop {
                    let head = match read_head(&mut stream).await {
                        Some(head) => head,
                        None => return,
                    };
                    seen_heads.lock().expect("seen heads").push(head);
                    let response = "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nKeep-Alive: timeout=5\r\nX-Origin: yes\r\n\r\nhello";
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut data = Vec::new();
    let mut buffer = [0_u8; 1024];
    while !data.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut buffer).await.ok()?;
        if read == 0 {
            return None;
        }
        data.extend_from_slice(&buffer[..read]);
    }
    Some(String::from_utf8_lossy(&data).to_string())
}

async fn start_proxy(delegate: RecordingDelegate) -> (SocketAddr, Arc<Proxy<RecordingDelegate>>) {
    let proxy = Proxy::builder(ProxyConfig::default(), delegate)
        .build()
        .expect("build proxy");
    let server = ProxyServer::new(proxy, "127.0.0.1:0".parse().expect("addr"));
    let handle = server.proxy();
    let listener = server.bind_listener().await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    tokio::spawn(server.run_with_listener(listener));
    (addr, handle)
}

async fn read_response(stream: &mut TcpStream, body_len: usize) -> String {
    let mut head = Vec::new();
    let mut buffer = [0_u8; 1024];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut buffer).await.expect("read response");
        assert!(read > 0, "proxy closed before response completed");
        head.extend_from_slice(&buffer[..read]);
    }
    let header_end = head
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("header end")
        + 4;
    while head.len() < header_end + body_len {
        let read = stream.read(&mut buffer).await.expect("read body");
        assert!(read > 0, "proxy closed mid-body");
        head.extend_from_slice(&buffer[..read]);
    }
    String::from_utf8_lossy(&head).to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hop_by_hop_headers_are_stripped_both_ways() {
    let connections = Arc::new(AtomicUsize::new(0));
    let seen_heads = Arc::new(Mutex::new(Vec::new()));
    let origin = start_origin(Arc::clone(&connections), Arc::clone(&seen_heads)).await;

    let delegate = RecordingDelegate::default();
    let (proxy_addr, proxy) = start_proxy(delegate.clone()).await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let request = format!(
        "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\nProxy-Connection: keep-alive\r\nConnection: close\r\nAccept: */*\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.expect("send request");

    let response = read_response(&mut client, 5).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("x-origin: yes"), "{response}");
    assert!(response.ends_with("hello"), "{response}");
    assert!(
        !response.to_ascii_lowercase().contains("keep-alive"),
        "hop-by-hop header leaked to client: {response}"
    );

    let heads = seen_heads.lock().expect("seen heads").clone();
    assert_eq!(heads.len(), 1);
    let upstream_head = heads[0].to_ascii_lowercase();
    assert!(upstream_head.starts_with("get / http/1.1"), "{upstream_head}");
    assert!(!upstream_head.contains("proxy-connection"), "{upstream_head}");
    assert!(!upstream_head.contains("connection:"), "{upstream_head}");
    assert!(upstream_head.contains("accept: */*"), "{upstream_head}");

    assert_eq!(
        delegate.stages(),
        vec![
            "connect",
            "auth",
            "before_request",
            "parent_proxy",
            "before_response",
            "during_response",
            "finish",
        ]
    );

    drop(client);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(proxy.active_clients(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keep_alive_serves_sequential_requests_and_pools_upstream() {
    let connections = Arc::new(AtomicUsize::new(0));
    let seen_heads = Arc::new(Mutex::new(Vec::new()));
    let origin = start_origin(Arc::clone(&connections), Arc::clone(&seen_heads)).await;

    let delegate = RecordingDelegate::default();
    let (proxy_addr, proxy) = start_proxy(delegate.clone()).await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    for path in ["/first", "/second"] {
        let request = format!(
            "GET http://{origin}{path} HTTP/1.1\r\nHost: {origin}\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.expect("send request");
        let response = read_response(&mut client, 5).await;
        assert!(response.ends_with("hello"), "{response}");
    }

    let heads = seen_heads.lock().expect("seen heads").clone();
    assert_eq!(heads.len(), 2);
    assert!(heads[0].starts_with("GET /first "), "{}", heads[0]);
    assert!(heads[1].starts_with("GET /second "), "{}", heads[1]);
    assert_eq!(
        connections.load(Ordering::SeqCst),
        1,
        "second request must reuse the pooled upstream connection"
    );

    // Two full delegate cycles on one client connection.
    let finishes = delegate
        .stages()
        .iter()
        .filter(|stage| **stage == "finish")
        .count();
    assert_eq!(finishes, 2);
    assert_eq!(proxy.metrics().total_requests, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upstream_dial_failure_yields_502_with_proxy_error_body() {
    // A listener that is immediately dropped leaves a port nothing accepts.
    let closed = TcpListener::bind("127.0.0.1:0").await.expect("bind closed");
    let dead_addr = closed.local_addr().expect("closed addr");
    drop(closed);

    let delegate = RecordingDelegate::default();
    let (proxy_addr, _proxy) = start_proxy(delegate.clone()).await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let request = format!(
        "GET http://{dead_addr}/ HTTP/1.1\r\nHost: {dead_addr}\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.expect("send request");

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.expect("read response");
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{text}");
    assert!(text.contains("\"errType\":\"PROXY_CENTER_INTERNAL_ERR\""), "{text}");
    assert!(text.contains("\"errCode\":502"), "{text}");
}
