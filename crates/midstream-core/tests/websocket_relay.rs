use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use midstream_core::{NoopDelegate, Proxy, ProxyConfig, ProxyServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn start_proxy() -> SocketAddr {
    let proxy = Proxy::builder(ProxyConfig::default(), NoopDelegate)
        .build()
        .expect("build proxy");
    let server = ProxyServer::new(proxy, "127.0.0.1:0".parse().expect("addr"));
    let listener = server.bind_listener().await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    tokio::spawn(server.run_with_listener(listener));
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn websocket_upgrade_is_relayed_and_pipe_runs_full_duplex() {
    let target_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind target");
    let target_addr = target_listener.local_addr().expect("target addr");
    let seen_head = Arc::new(Mutex::new(String::new()));
    let seen_clone = Arc::clone(&seen_head);

    let target_task = tokio::spawn(async move {
        let (mut stream, _) = target_listener.accept().await.expect("accept at target");

        let mut head = Vec::new();
        let mut buffer = [0_u8; 1024];
        while !head.windows(4).any(|window| window == b"\r\n\r\n") {
            let read = stream.read(&mut buffer).await.expect("read upgrade request");
            assert!(read > 0, "proxy closed before upgrade request completed");
            head.extend_from_slice(&buffer[..read]);
        }
        *seen_clone.lock().expect("seen head") = String::from_utf8_lossy(&head).to_string();

        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n",
            )
            .await
            .expect("write 101");

        // After the upgrade, echo frames back uppercased.
        loop {
            match stream.read(&mut buffer).await {
                Ok(0) | Err(_) => return,
                Ok(read) => {
                    let upper = buffer[..read].to_ascii_uppercase();
                    if stream.write_all(&upper).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    let proxy_addr = start_proxy().await;
    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let upgrade = format!(
        "GET http://{target_addr}/chat HTTP/1.1\r\nHost: {target_addr}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    client.write_all(upgrade.as_bytes()).await.expect("send upgrade");

    let mut response_head = Vec::new();
    let mut buffer = [0_u8; 1024];
    while !response_head.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = client.read(&mut buffer).await.expect("read 101");
        assert!(read > 0, "proxy closed before handshake response");
        response_head.extend_from_slice(&buffer[..read]);
    }
    let response_text = String::from_utf8_lossy(&response_head);
    assert!(
        response_text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
        "{response_text}"
    );
    assert!(
        response_text.contains("Sec-WebSocket-Accept"),
        "{response_text}"
    );

    // The target must have seen the client's upgrade handshake, headers
    // included, with an origin-form request line.
    let head = seen_head.lock().expect("seen head").clone();
    assert!(head.starts_with("GET /chat HTTP/1.1\r\n"), "{head}");
    let lowered = head.to_ascii_lowercase();
    assert!(lowered.contains("upgrade: websocket"), "{head}");
    assert!(lowered.contains("connection: upgrade"), "{head}");
    assert!(
        lowered.contains("sec-websocket-key: dghlihnhbxbszsbub25jzq=="),
        "{head}"
    );

    client.write_all(b"frame-one").await.expect("write frame");
    let mut echoed = [0_u8; 9];
    client.read_exact(&mut echoed).await.expect("read echoed frame");
    assert_eq!(&echoed, b"FRAME-ONE");

    client.shutdown().await.expect("close websocket");
    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest).await;
    target_task.await.expect("target task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn websocket_dial_failure_returns_502() {
    let closed = TcpListener::bind("127.0.0.1:0").await.expect("bind closed");
    let dead_addr = closed.local_addr().expect("closed addr");
    drop(closed);

    let proxy_addr = start_proxy().await;
    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let upgrade = format!(
        "GET http://{dead_addr}/chat HTTP/1.1\r\nHost: {dead_addr}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n"
    );
    client.write_all(upgrade.as_bytes()).await.expect("send upgrade");

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.expect("read error");
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{text}");
}
