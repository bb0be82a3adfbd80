use std::io;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error};

use crate::client_stream::ClientStream;
use crate::context::{FlowContext, ProxyRequest, Scheme};
use crate::delegate::ProxyDelegate;
use crate::errors::FailureKind;
use crate::http1::{
    parse_request_head, serialize_request_head, BufferedStream, ESTABLISHED_RESPONSE,
};
use crate::proxy::Proxy;
use crate::pump::transfer;
use crate::transport::{connect_tcp, origin_form, split_authority};

pub(crate) async fn forward_websocket<D: ProxyDelegate>(
    proxy: &Proxy<D>,
    ctx: &mut FlowContext,
    mut client: ClientStream,
) {
    debug!(host = %ctx.request.host, "relaying websocket upgrade");

    let parent = proxy.delegate().parent_proxy(ctx).await;
    if ctx.aborted() {
        ctx.record_failure_kind(FailureKind::ParentProxyFail);
        return;
    }

    ctx.request.scheme = Scheme::Ws;
    let dial_authority = parent
        .as_ref()
        .map(|upstream| upstream.authority.clone())
        .unwrap_or_else(|| ctx.request.host.clone());

    let target = match connect_tcp(&dial_authority, 80, proxy.tunnel_dial_timeout()).await {
        Ok(conn) => conn,
        Err(dial_error) => {
            error!(host = %ctx.request.host, error = %dial_error, "websocket target dial failed");
            let _ = client.write_error_head(502, "Bad Gateway").await;
            ctx.record_failure(FailureKind::WebsocketDialFail, dial_error.to_string());
            return;
        }
    };

    ctx.hijacked = true;
    let mut target = BufferedStream::new(target);

    if let Err(handshake_error) =
        relay_upgrade_handshake(ctx, &mut client, &mut target, proxy.max_head_bytes()).await
    {
        error!(host = %ctx.request.host, error = %handshake_error, "websocket handshake relay failed");
        ctx.record_failure(FailureKind::WebsocketHandshakeFail, handshake_error.to_string());
        return;
    }

    let summary = transfer(client, target).await;
    ctx.request_bytes += summary.client_to_target;
    ctx.response_bytes += summary.target_to_client;
    if let Some(copy_error) = summary.first_error() {
        ctx.record_failure(FailureKind::TunnelWriteConnFail, copy_error.to_string());
    }
    ctx.mark_closed();
}

pub(crate) async fn forward_websocket_tls<D: ProxyDelegate>(
    proxy: &Proxy<D>,
    ctx: &mut FlowContext,
    mut client: ClientStream,
) {
    debug!(host = %ctx.request.host, "terminating TLS for websocket CONNECT target");

    let parent = proxy.delegate().parent_proxy(ctx).await;
    if ctx.aborted() {
        ctx.record_failure_kind(FailureKind::ParentProxyFail);
        return;
    }

    let tls_config = match proxy.server_tls_config(&ctx.request.host) {
        Ok(config) => config,
        Err(provider_error) => {
            error!(host = %ctx.request.host, error = %provider_error, "leaf certificate issuance failed");
            let _ = client.write_error_head(502, "Bad Gateway").await;
            ctx.record_failure(
                FailureKind::TlsWebsocketGenerateTlsConfigFail,
                provider_error.to_string(),
            );
            return;
        }
    };

    ctx.hijacked = true;
    if let Err(write_error) = client.write_all(ESTABLISHED_RESPONSE).await {
        ctx.record_failure(
            FailureKind::TlsWebsocketWriteEstablishedFail,
            write_error.to_string(),
        );
        return;
    }

    let tls_client = match TlsAcceptor::from(tls_config).accept(client).await {
        Ok(stream) => stream,
        Err(handshake_error) => {
            error!(host = %ctx.request.host, error = %handshake_error, "client TLS handshake failed");
            ctx.record_failure(
                FailureKind::TlsWebsocketTlsHandshakeFail,
                handshake_error.to_string(),
            );
            return;
        }
    };
    let mut inner = BufferedStream::new(tls_client);

    let raw_head = match inner.read_head(proxy.max_head_bytes()).await {
        Ok(None) => return,
        Ok(Some(raw)) => raw,
        Err(read_error) => {
            if read_error.kind() != io::ErrorKind::UnexpectedEof {
                ctx.record_failure(
                    FailureKind::TlsWebsocketReadRequestFail,
                    read_error.to_string(),
                );
            }
            return;
        }
    };
    let inner_head = match parse_request_head(&raw_head) {
        Ok(head) => head,
        Err(parse_error) => {
            ctx.record_failure(
                FailureKind::TlsWebsocketReadRequestFail,
                parse_error.to_string(),
            );
            return;
        }
    };
    let inner_host = match inner_head.headers.get("host").and_then(|value| value.to_str().ok()) {
        Some(host) => host.to_string(),
        None => {
            ctx.record_failure(
                FailureKind::TlsWebsocketReadRequestFail,
                "inner request is missing a Host header",
            );
            return;
        }
    };

    ctx.request = ProxyRequest {
        head: inner_head,
        scheme: Scheme::Wss,
        host: inner_host,
        client_addr: ctx.request.client_addr.clone(),
    };

    let dial_authority = parent
        .as_ref()
        .map(|upstream| upstream.authority.clone())
        .unwrap_or_else(|| ctx.request.host.clone());

    let target_tls = match dial_tls_target(proxy, &dial_authority, &ctx.request.host).await {
        Ok(stream) => stream,
        Err(dial_error) => {
            error!(host = %ctx.request.host, error = %dial_error, "websocket TLS target dial failed");
            ctx.record_failure(FailureKind::TlsWebsocketDialFail, dial_error.to_string());
            return;
        }
    };
    let mut target = BufferedStream::new(target_tls);

    if let Err(handshake_error) =
        relay_upgrade_handshake(ctx, &mut inner, &mut target, proxy.max_head_bytes()).await
    {
        error!(host = %ctx.request.host, error = %handshake_error, "websocket handshake relay failed");
        ctx.record_failure(
            FailureKind::TlsWebsocketHandshakeFail,
            handshake_error.to_string(),
        );
        return;
    }

    let summary = transfer(inner, target).await;
    ctx.request_bytes += summary.client_to_target;
    ctx.response_bytes += summary.target_to_client;
    if let Some(copy_error) = summary.first_error() {
        ctx.record_failure(FailureKind::TunnelWriteConnFail, copy_error.to_string());
    }
    ctx.mark_closed();
}

async fn dial_tls_target<D: ProxyDelegate>(
    proxy: &Proxy<D>,
    authority: &str,
    sni_host: &str,
) -> io::Result<tokio_rustls::client::TlsStream<tokio::net::TcpStream>> {
    let tcp = connect_tcp(authority, 443, proxy.tunnel_dial_timeout()).await?;
    let (host, _) = split_authority(sni_host, 443)?;
    let server_name = ServerName::try_from(host)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid upstream server name"))?;
    let connector = TlsConnector::from(proxy.upstream_tls_config());
    tokio::time::timeout(
        proxy.tls_handshake_timeout(),
        connector.connect(server_name, tcp),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream TLS handshake timed out"))?
}

async fn relay_upgrade_handshake<C, T>(
    ctx: &FlowContext,
    client: &mut C,
    target: &mut BufferedStream<T>,
    max_head_bytes: usize,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let head = &ctx.request.head;
    let request_bytes = serialize_request_head(
        &head.method,
        &origin_form(&head.target),
        head.version,
        &head.headers,
        head.body_mode,
    );
    target.write_all(&request_bytes).await?;
    target.flush().await?;

    let response = target.read_head(max_head_bytes).await?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "target closed before websocket handshake response",
        )
    })?;
    client.write_all(&response).await?;
    client.flush().await
}
