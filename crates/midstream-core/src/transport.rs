use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error};

use crate::client_stream::ClientIo;
use crate::config::ProxyConfig;
use crate::context::{FlowContext, Scheme};
use crate::delegate::{ProxyDelegate, UpstreamEvent, UpstreamProxy};
use crate::errors::FailureKind;
use crate::headers;
use crate::http1::{self, parse_response_head, BufferedStream, ResponseHead, IO_CHUNK_SIZE};

pub enum RoundTrip {
    Aborted,
    Upstream(io::Result<UpstreamResponse>),
}

pub struct UpstreamResponse {
    pub head: ResponseHead,
    conn: BufferedStream<Box<dyn ClientIo>>,
    pool: Option<Arc<ConnectionPool>>,
    pool_key: PoolKey,
    reusable: bool,
    drained: bool,
    max_head_bytes: usize,
}

impl UpstreamResponse {
    pub async fn relay_body_to<W>(&mut self, sink: &mut W) -> io::Result<u64>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let moved = self
            .conn
            .relay_body_into(sink, self.head.body_mode, self.max_head_bytes)
            .await?;
        self.drained = true;
        Ok(moved)
    }

    pub fn finish(self) {
        if !self.drained || !self.reusable || !self.conn.read_buf.is_empty() {
            return;
        }
        if let Some(pool) = self.pool {
            pool.store(self.pool_key, self.conn.into_inner());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    tls: bool,
    authority: String,
    via: Option<String>,
}

struct IdleConn {
    io: Box<dyn ClientIo>,
    parked_at: Instant,
}

struct ConnectionPool {
    idle: Mutex<HashMap<PoolKey, Vec<IdleConn>>>,
    max_idle: usize,
    idle_timeout: Duration,
}

impl ConnectionPool {
    fn new(max_idle: usize, idle_timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle,
            idle_timeout,
        }
    }

    fn checkout(&self, key: &PoolKey) -> Option<Box<dyn ClientIo>> {
        let mut idle = self.idle.lock().expect("connection pool lock poisoned");
        let bucket = idle.get_mut(key)?;
        while let Some(conn) = bucket.pop() {
            if conn.parked_at.elapsed() < self.idle_timeout {
                return Some(conn.io);
            }
        }
        None
    }

    fn store(&self, key: PoolKey, io: Box<dyn ClientIo>) {
        let mut idle = self.idle.lock().expect("connection pool lock poisoned");
        let total: usize = idle.values().map(Vec::len).sum();
        if total >= self.max_idle {
            return;
        }
        idle.entry(key).or_default().push(IdleConn {
            io,
            parked_at: Instant::now(),
        });
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle
            .lock()
            .expect("connection pool lock poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }
}

pub struct Transport {
    dial_timeout: Duration,
    tls_handshake_timeout: Duration,
    disable_keep_alives: bool,
    max_head_bytes: usize,
    pool: Arc<ConnectionPool>,
    upstream_tls: Arc<rustls::ClientConfig>,
}

impl Transport {
    pub fn new(config: &ProxyConfig, upstream_tls: Arc<rustls::ClientConfig>) -> Self {
        Self {
            dial_timeout: config.dial_timeout,
            tls_handshake_timeout: config.tls_handshake_timeout,
            disable_keep_alives: config.disable_keep_alives,
            max_head_bytes: config.max_head_bytes,
            pool: Arc::new(ConnectionPool::new(
                config.max_idle_connections,
                config.idle_connection_timeout,
            )),
            upstream_tls,
        }
    }

    pub(crate) async fn round_trip<D, BS>(
        &self,
        delegate: &D,
        ctx: &mut FlowContext,
        body_source: &mut BufferedStream<BS>,
    ) -> RoundTrip
    where
        D: ProxyDelegate,
        BS: AsyncRead + Unpin,
    {
        delegate.before_request(ctx).await;
        if ctx.aborted() {
            ctx.record_failure_kind(FailureKind::BeforeRequestFail);
            return RoundTrip::Aborted;
        }

        let mut outbound = ctx.request.head.clone();
        headers::remove_mitm_marker(&mut outbound.headers);
        headers::remove_connection_listed(&mut outbound.headers);
        headers::remove_hop_by_hop(&mut outbound.headers);
        if !outbound.headers.contains_key("host") {
            if let Ok(host) = http::HeaderValue::from_str(&ctx.request.host) {
                outbound.headers.insert("host", host);
            }
        }

        let parent = delegate.parent_proxy(ctx).await;
        if ctx.aborted() {
            ctx.record_failure_kind(FailureKind::ParentProxyFail);
            return RoundTrip::Aborted;
        }

        let result = self
            .exchange(ctx, &outbound, parent.as_ref(), body_source)
            .await;

        let event = match &result {
            Ok(response) => UpstreamEvent::Response(&response.head),
            Err(error) => UpstreamEvent::Failed(error),
        };
        delegate.before_response(ctx, &event).await;
        if ctx.aborted() {
            ctx.record_failure_kind(FailureKind::BeforeResponseFail);
            return RoundTrip::Aborted;
        }

        match result {
            Ok(mut response) => {
                headers::remove_connection_listed(&mut response.head.headers);
                headers::remove_hop_by_hop(&mut response.head.headers);
                RoundTrip::Upstream(Ok(response))
            }
            Err(error) => RoundTrip::Upstream(Err(error)),
        }
    }

    async fn exchange<BS>(
        &self,
        ctx: &mut FlowContext,
        outbound: &http1::RequestHead,
        parent: Option<&UpstreamProxy>,
        body_source: &mut BufferedStream<BS>,
    ) -> io::Result<UpstreamResponse>
    where
        BS: AsyncRead + Unpin,
    {
        let scheme = ctx.request.scheme;
        let authority = full_authority(&ctx.request.host, scheme.default_port())?;
        let key = PoolKey {
            tls: scheme.is_tls(),
            authority: authority.clone(),
            via: parent.map(|proxy| proxy.authority.clone()),
        };

        let (mut conn, pooled) = match self.checkout(&key) {
            Some(io) => (BufferedStream::new(io), true),
            None => (
                BufferedStream::new(self.establish(scheme, &authority, parent).await?),
                false,
            ),
        };
        if pooled {
            debug!(authority = %authority, "reusing pooled upstream connection");
        }

        let target = request_target(outbound, &ctx.request.host, scheme, parent);
        let head_bytes = http1::serialize_request_head(
            &outbound.method,
            &target,
            outbound.version,
            &outbound.headers,
            outbound.body_mode,
        );
        conn.write_all(&head_bytes).await?;
        ctx.request_bytes += head_bytes.len() as u64;

        let body_bytes = body_source
            .relay_body_into(&mut conn, outbound.body_mode, self.max_head_bytes)
            .await?;
        ctx.request_bytes += body_bytes;

        let raw_head = conn.read_head(self.max_head_bytes).await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed before response headers",
            )
        })?;
        let head = parse_response_head(&raw_head, &outbound.method)?;

        let reusable = !self.disable_keep_alives
            && !head.connection_close
            && !outbound.connection_close
            && head.body_mode != http1::BodyMode::CloseDelimited;

        Ok(UpstreamResponse {
            head,
            conn,
            pool: Some(Arc::clone(&self.pool)),
            pool_key: key,
            reusable,
            drained: false,
            max_head_bytes: self.max_head_bytes,
        })
    }

    fn checkout(&self, key: &PoolKey) -> Option<Box<dyn ClientIo>> {
        if self.disable_keep_alives {
            return None;
        }
        self.pool.checkout(key)
    }

    async fn establish(
        &self,
        scheme: Scheme,
        authority: &str,
        parent: Option<&UpstreamProxy>,
    ) -> io::Result<Box<dyn ClientIo>> {
        let dial_authority = parent.map(|proxy| proxy.authority.as_str()).unwrap_or(authority);
        let mut tcp = connect_tcp(dial_authority, scheme.default_port(), self.dial_timeout).await?;

        if scheme.is_tls() {
            if let Some(proxy) = parent {
                establish_connect_tunnel(&mut tcp, authority, proxy, self.max_head_bytes).await?;
            }
            let (host, _) = split_authority(authority, scheme.default_port())?;
            let server_name = ServerName::try_from(host).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "invalid upstream server name")
            })?;
            let connector = TlsConnector::from(Arc::clone(&self.upstream_tls));
            let tls = tokio::time::timeout(self.tls_handshake_timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, "upstream TLS handshake timed out")
                })??;
            Ok(Box::new(tls))
        } else {
            Ok(Box::new(tcp))
        }
    }
}

async fn establish_connect_tunnel(
    stream: &mut TcpStream,
    authority: &str,
    proxy: &UpstreamProxy,
    max_head_bytes: usize,
) -> io::Result<()> {
    let mut connect = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(credentials) = proxy.basic_authorization() {
        connect.push_str(&format!("Proxy-Authorization: {credentials}\r\n"));
    }
    connect.push_str("\r\n");
    stream.write_all(connect.as_bytes()).await?;

    let mut head = Vec::new();
    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    loop {
        if head.len() > max_head_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "parent proxy response headers exceeded limit",
            ));
        }
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "parent proxy closed before CONNECT response",
            ));
        }
        head.extend_from_slice(&chunk[..read]);
        if head.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }

    let response = parse_response_head(&head, "CONNECT")?;
    if response.status / 100 != 2 {
        error!(status = response.status, "parent proxy refused CONNECT");
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("parent proxy CONNECT failed with status {}", response.status),
        ));
    }
    Ok(())
}

fn request_target(
    head: &http1::RequestHead,
    host: &str,
    scheme: Scheme,
    parent: Option<&UpstreamProxy>,
) -> String {
    let origin = origin_form(&head.target);
    if parent.is_some() && !scheme.is_tls() {
        if head.target.starts_with("http://") || head.target.starts_with("https://") {
            head.target.clone()
        } else {
            format!("{}://{host}{origin}", scheme.as_str())
        }
    } else {
        origin
    }
}

pub(crate) fn origin_form(target: &str) -> String {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"));
    let path = match rest {
        Some(rest) => match rest.find('/') {
            Some(index) => &rest[index..],
            None => "/",
        },
        None => target,
    };
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

pub(crate) fn split_authority(authority: &str, default_port: u16) -> io::Result<(String, u16)> {
    if authority.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "request has no target host",
        ));
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "unterminated IPv6 literal")
        })?;
        let port = match tail.strip_prefix(':') {
            Some(port_text) => port_text.parse::<u16>().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "invalid port in authority")
            })?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port_text)) if !host.contains(':') => {
            let port = port_text.parse::<u16>().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "invalid port in authority")
            })?;
            Ok((host.to_string(), port))
        }
        // A bare IPv6 address without brackets or a plain host.
        _ => Ok((authority.to_string(), default_port)),
    }
}

fn full_authority(authority: &str, default_port: u16) -> io::Result<String> {
    let (host, port) = split_authority(authority, default_port)?;
    if host.contains(':') {
        Ok(format!("[{host}]:{port}"))
    } else {
        Ok(format!("{host}:{port}"))
    }
}

pub(crate) async fn connect_tcp(
    authority: &str,
    default_port: u16,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let (host, port) = split_authority(authority, default_port)?;
    let deadline = Instant::now() + timeout;

    let resolved = tokio::time::timeout(timeout, tokio::net::lookup_host((host.as_str(), port)))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream resolution timed out"))?
        .map_err(|error| {
            io::Error::new(error.kind(), format!("upstream resolution failed: {error}"))
        })?;

    let addrs = interleave_address_families(resolved.collect());
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "upstream resolution returned no addresses",
        ));
    }

    let mut last_error: Option<io::Error> = None;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(Err(error)) => last_error = Some(error),
            Err(_) => {
                last_error = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream connect timed out",
                ));
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "upstream connect timed out")))
}

fn interleave_address_families(addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let mut first = Vec::new();
    let mut second = Vec::new();
    let prefer_v6 = addrs.first().map(SocketAddr::is_ipv6).unwrap_or(false);
    for addr in addrs {
        if addr.is_ipv6() == prefer_v6 {
            first.push(addr);
        } else {
            second.push(addr);
        }
    }

    let mut ordered = Vec::with_capacity(first.len() + second.len());
    let mut first = first.into_iter();
    let mut second = second.into_iter();
    loop {
        match (first.next(), second.next()) {
            (None, None) => break,
            (a, b) => {
                ordered.extend(a);
                ordered.extend(b);
            }
        }
    }
    ordered
}
