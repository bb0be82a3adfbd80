use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, error};

use crate::client_stream::{ClientIo, ClientStream};
use crate::config::ProxyConfig;
use crate::context::{FlowContext, ProxyRequest, Scheme};
use crate::delegate::{ExtensionManager, ProxyDelegate};
use crate::errors::{FailureKind, ProxyCoreError};
use crate::flow_http::{forward_http, HttpFlowEnd};
use crate::flow_mitm::forward_mitm;
use crate::flow_tunnel::forward_tunnel;
use crate::flow_websocket::{forward_websocket, forward_websocket_tls};
use crate::headers::{is_mitm_enabled, is_websocket_upgrade};
use crate::http1::{parse_request_head, RequestHead};
use crate::metrics::{ActiveRequestGuard, ProxyMetrics, ProxyMetricsStore};
use crate::tls::{insecure_client_config, TlsConfigProvider, TlsProviderError};
use crate::transport::Transport;

pub struct Proxy<D: ProxyDelegate> {
    config: ProxyConfig,
    delegate: D,
    tls_provider: Option<Arc<dyn TlsConfigProvider>>,
    transport: Transport,
    upstream_tls: Arc<rustls::ClientConfig>,
    metrics: Arc<ProxyMetricsStore>,
    extensions: Arc<ExtensionManager>,
    flow_ids: AtomicU64,
}

pub struct ProxyBuilder<D: ProxyDelegate> {
    config: ProxyConfig,
    delegate: D,
    tls_provider: Option<Arc<dyn TlsConfigProvider>>,
    extensions: Option<Arc<ExtensionManager>>,
    transport: Option<Transport>,
}

impl<D: ProxyDelegate> ProxyBuilder<D> {
    pub fn new(config: ProxyConfig, delegate: D) -> Self {
        Self {
            config,
            delegate,
            tls_provider: None,
            extensions: None,
            transport: None,
        }
    }

    pub fn with_tls_provider(mut self, provider: Arc<dyn TlsConfigProvider>) -> Self {
        self.tls_provider = Some(provider);
        self
    }

    pub fn with_extension_manager(mut self, extensions: Arc<ExtensionManager>) -> Self {
        self.extensions = Some(extensions);
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<Proxy<D>, ProxyCoreError> {
        self.config.validate()?;
        let extensions = self
            .extensions
            .unwrap_or_else(|| Arc::new(ExtensionManager::new()));
        self.delegate.set_extension_manager(Arc::clone(&extensions));
        let upstream_tls = insecure_client_config();
        Ok(Proxy {
            transport: self
                .transport
                .unwrap_or_else(|| Transport::new(&self.config, Arc::clone(&upstream_tls))),
            config: self.config,
            delegate: self.delegate,
            tls_provider: self.tls_provider,
            upstream_tls,
            metrics: Arc::new(ProxyMetricsStore::default()),
            extensions,
            flow_ids: AtomicU64::new(1),
        })
    }
}

impl<D: ProxyDelegate> Proxy<D> {
    pub fn builder(config: ProxyConfig, delegate: D) -> ProxyBuilder<D> {
        ProxyBuilder::new(config, delegate)
    }

    pub fn active_clients(&self) -> i32 {
        self.metrics.active_clients()
    }

    pub fn metrics(&self) -> ProxyMetrics {
        self.metrics.snapshot()
    }

    pub fn extensions(&self) -> Arc<ExtensionManager> {
        Arc::clone(&self.extensions)
    }

    pub(crate) fn delegate(&self) -> &D {
        &self.delegate
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    pub(crate) fn max_head_bytes(&self) -> usize {
        self.config.max_head_bytes
    }

    pub(crate) fn tunnel_dial_timeout(&self) -> Duration {
        self.config.tunnel_dial_timeout
    }

    pub(crate) fn tls_handshake_timeout(&self) -> Duration {
        self.config.tls_handshake_timeout
    }

    pub(crate) fn upstream_tls_config(&self) -> Arc<rustls::ClientConfig> {
        Arc::clone(&self.upstream_tls)
    }

    pub(crate) fn server_tls_config(
        &self,
        host_port: &str,
    ) -> Result<Arc<rustls::ServerConfig>, TlsProviderError> {
        match &self.tls_provider {
            Some(provider) => provider.server_config_for(host_port),
            None => Err(TlsProviderError::new(
                "no certificate provider configured",
            )),
        }
    }

    pub async fn serve_connection<S>(&self, stream: S, client_addr: SocketAddr) -> io::Result<()>
    where
        S: ClientIo + 'static,
    {
        let client_addr = client_addr.to_string();
        let mut client = ClientStream::new(stream);

        loop {
            let raw_head = match client.next_request_head(self.config.max_head_bytes).await {
                Ok(Some(raw)) => raw,
                Ok(None) => return Ok(()),
                Err(read_error) => {
                    if read_error.kind() != io::ErrorKind::UnexpectedEof {
                        let _ = write_plain_response(
                            &mut client,
                            "400 Bad Request",
                            "invalid HTTP request",
                        )
                        .await;
                    }
                    return Ok(());
                }
            };

            let head = match parse_request_head(&raw_head) {
                Ok(head) => head,
                Err(parse_error) => {
                    debug!(error = %parse_error, "rejecting unparseable request head");
                    let _ = write_plain_response(
                        &mut client,
                        "400 Bad Request",
                        "invalid HTTP request",
                    )
                    .await;
                    return Ok(());
                }
            };

            let request = resolve_request(head, client_addr.clone());
            let mut ctx = FlowContext::new(
                self.flow_ids.fetch_add(1, Ordering::Relaxed),
                request,
            );
            let _active = ActiveRequestGuard::enter(Arc::clone(&self.metrics));

            debug!(
                flow_id = ctx.flow_id,
                method = %ctx.request.head.method,
                host = %ctx.request.host,
                "dispatching request"
            );

            self.delegate.on_connect(&mut ctx).await;
            if ctx.aborted() {
                ctx.record_failure_kind(FailureKind::ConnectFail);
                self.finish(&mut ctx).await;
                return Ok(());
            }
            self.delegate.on_auth(&mut ctx).await;
            if ctx.aborted() {
                ctx.record_failure_kind(FailureKind::AuthFail);
                self.finish(&mut ctx).await;
                return Ok(());
            }

            if ctx.request.head.method == "CONNECT" {
                ctx.mitm = is_mitm_enabled(&ctx.request.head.headers);
                if ctx.mitm {
                    if is_websocket_upgrade(&ctx.request.head.headers) {
                        forward_websocket_tls(self, &mut ctx, client).await;
                    } else {
                        forward_mitm(self, &mut ctx, client).await;
                    }
                } else {
                    forward_tunnel(self, &mut ctx, client).await;
                }
                self.finish(&mut ctx).await;
                return Ok(());
            }

            if is_websocket_upgrade(&ctx.request.head.headers) {
                forward_websocket(self, &mut ctx, client).await;
                self.finish(&mut ctx).await;
                return Ok(());
            }

            let end = forward_http(self, &mut ctx, &mut client).await;
            self.finish(&mut ctx).await;
            match end {
                HttpFlowEnd::KeepAlive => continue,
                HttpFlowEnd::Close => return Ok(()),
            }
        }
    }

    async fn finish(&self, ctx: &mut FlowContext) {
        if ctx.failure().is_some() {
            self.metrics.record_request_failure();
        }
        self.delegate.on_finish(ctx).await;
    }
}

fn resolve_request(head: RequestHead, client_addr: String) -> ProxyRequest {
    let host = if head.method == "CONNECT" {
        head.target.clone()
    } else if let Some(authority) = absolute_form_authority(&head.target) {
        authority.to_string()
    } else {
        head.headers
            .get("host")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    ProxyRequest {
        head,
        scheme: Scheme::Http,
        host,
        client_addr,
    }
}

fn absolute_form_authority(target: &str) -> Option<&str> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let end = rest.find('/').unwrap_or(rest.len());
    let authority = &rest[..end];
    if authority.is_empty() {
        None
    } else {
        Some(authority)
    }
}

async fn write_plain_response(
    client: &mut ClientStream,
    status: &str,
    body: &str,
) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    client.write_all(response.as_bytes()).await?;
    client.flush().await
}

pub struct ProxyServer<D: ProxyDelegate> {
    proxy: Arc<Proxy<D>>,
    listen_addr: SocketAddr,
}

impl<D: ProxyDelegate> ProxyServer<D> {
    pub fn new(proxy: Proxy<D>, listen_addr: SocketAddr) -> Self {
        Self {
            proxy: Arc::new(proxy),
            listen_addr,
        }
    }

    pub fn proxy(&self) -> Arc<Proxy<D>> {
        Arc::clone(&self.proxy)
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        TcpListener::bind(self.listen_addr).await
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, client_addr) = listener.accept().await?;
            let _ = stream.set_nodelay(true);
            let proxy = Arc::clone(&self.proxy);
            tokio::spawn(async move {
                if let Err(serve_error) = proxy.serve_connection(stream, client_addr).await {
                    error!(client = %client_addr, error = %serve_error, "connection handling failed");
                }
            });
        }
    }
}
