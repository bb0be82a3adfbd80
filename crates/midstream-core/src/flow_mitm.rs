use std::io;

use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error};

use crate::client_stream::{ClientStream, CountingWriter};
use crate::context::{FlowContext, ProxyRequest, Scheme};
use crate::delegate::{ProxyDelegate, UpstreamEvent};
use crate::errors::{write_proxy_error_body, FailureKind};
use crate::http1::{
    parse_request_head, serialize_response_head, BufferedStream, ESTABLISHED_RESPONSE,
};
use crate::proxy::Proxy;
use crate::transport::RoundTrip;

pub(crate) async fn forward_mitm<D: ProxyDelegate>(
    proxy: &Proxy<D>,
    ctx: &mut FlowContext,
    mut client: ClientStream,
) {
    debug!(host = %ctx.request.host, "terminating TLS for CONNECT target");

    let tls_config = match proxy.server_tls_config(&ctx.request.host) {
        Ok(config) => config,
        Err(provider_error) => {
            error!(host = %ctx.request.host, error = %provider_error, "leaf certificate issuance failed");
            let message = format!(
                "generating TLS config for {} failed: {provider_error}",
                ctx.request.host
            );
            if client.write_error_head(502, "Bad Gateway").await.is_ok() {
                let _ = write_proxy_error_body(ctx, &mut client, 502, &message, None).await;
            }
            ctx.record_failure(FailureKind::HttpsGenerateTlsConfigFail, provider_error.to_string());
            return;
        }
    };

    ctx.hijacked = true;
    if let Err(write_error) = client.write_all(ESTABLISHED_RESPONSE).await {
        ctx.record_failure(FailureKind::HttpsWriteEstablishedFail, write_error.to_string());
        return;
    }

    let tls_stream = match TlsAcceptor::from(tls_config).accept(client).await {
        Ok(stream) => stream,
        Err(handshake_error) => {
            error!(host = %ctx.request.host, error = %handshake_error, "client TLS handshake failed");
            ctx.record_failure(FailureKind::HttpsTlsHandshakeFail, handshake_error.to_string());
            return;
        }
    };
    let mut inner = BufferedStream::new(tls_stream);

    let raw_head = match inner.read_head(proxy.max_head_bytes()).await {
        // Clean disconnect after the handshake is a normal client close.
        Ok(None) => return,
        Ok(Some(raw)) => raw,
        Err(read_error) => {
            if read_error.kind() != io::ErrorKind::UnexpectedEof {
                ctx.record_failure(FailureKind::HttpsReadRequestFail, read_error.to_string());
            }
            return;
        }
    };

    let inner_head = match parse_request_head(&raw_head) {
        Ok(head) => head,
        Err(parse_error) => {
            ctx.record_failure(FailureKind::HttpsReadRequestFail, parse_error.to_string());
            return;
        }
    };
    let inner_host = match inner_head.headers.get("host").and_then(|value| value.to_str().ok()) {
        Some(host) => host.to_string(),
        None => {
            ctx.record_failure(
                FailureKind::HttpsReadRequestFail,
                "inner request is missing a Host header",
            );
            return;
        }
    };

    ctx.request = ProxyRequest {
        head: inner_head,
        scheme: Scheme::Https,
        host: inner_host,
        client_addr: ctx.request.client_addr.clone(),
    };

    let round_trip = proxy
        .transport()
        .round_trip(proxy.delegate(), ctx, &mut inner)
        .await;

    match round_trip {
        RoundTrip::Aborted => {}
        RoundTrip::Upstream(Err(upstream_error)) => {
            error!(host = %ctx.request.host, error = %upstream_error, "upstream request failed inside MITM session");
            let message = format!(
                "forwarding {} failed: {upstream_error}",
                ctx.request.host
            );
            let _ =
                write_proxy_error_body(ctx, &mut inner, 502, &message, Some("HTTP/1.1 502 ")).await;
            ctx.record_failure(FailureKind::HttpsDoRequestFail, upstream_error.to_string());
        }
        RoundTrip::Upstream(Ok(mut response)) => {
            proxy
                .delegate()
                .during_response(ctx, &UpstreamEvent::Response(&response.head))
                .await;

            let mut counting = CountingWriter::new(&mut inner);
            let written = async {
                counting
                    .write_all(&serialize_response_head(&response.head))
                    .await?;
                response.relay_body_to(&mut counting).await
            }
            .await;
            ctx.response_bytes += counting.written();

            if let Err(write_error) = written {
                error!(host = %ctx.request.host, error = %write_error, "writing response into TLS session failed");
                ctx.record_failure(FailureKind::HttpsWriteResponseFail, write_error.to_string());
            }
            if ctx.mark_closed() {
                response.finish();
            }
        }
    }

    if ctx.mark_closed() {
        let _ = inner.shutdown().await;
    }
}
