use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::client_stream::ClientStream;
use crate::context::FlowContext;
use crate::delegate::{ProxyDelegate, UpstreamEvent};
use crate::errors::{write_proxy_error_body, FailureKind};
use crate::http1::ESTABLISHED_RESPONSE;
use crate::proxy::Proxy;
use crate::pump::transfer;
use crate::transport::connect_tcp;

pub(crate) async fn forward_tunnel<D: ProxyDelegate>(
    proxy: &Proxy<D>,
    ctx: &mut FlowContext,
    mut client: ClientStream,
) {
    debug!(host = %ctx.request.host, "opening opaque tunnel");

    let parent = proxy.delegate().parent_proxy(ctx).await;
    if ctx.aborted() {
        ctx.record_failure_kind(FailureKind::ParentProxyFail);
        return;
    }

    ctx.hijacked = true;

    let dial_authority = parent
        .as_ref()
        .map(|upstream| upstream.authority.clone())
        .unwrap_or_else(|| ctx.request.host.clone());
    let dialed = connect_tcp(&dial_authority, 443, proxy.tunnel_dial_timeout()).await;

    let event = match &dialed {
        Ok(conn) => UpstreamEvent::TunnelEstablished(conn),
        Err(dial_error) => UpstreamEvent::Failed(dial_error),
    };
    proxy.delegate().before_response(ctx, &event).await;
    if ctx.aborted() {
        ctx.record_failure_kind(FailureKind::BeforeResponseFail);
        return;
    }

    let target = match dialed {
        Ok(conn) => conn,
        Err(dial_error) => {
            error!(host = %ctx.request.host, error = %dial_error, "tunnel target dial failed");
            let message = format!(
                "dialing {} for tunnel failed: {dial_error}",
                ctx.request.host
            );
            let _ =
                write_proxy_error_body(ctx, &mut client, 502, &message, Some("HTTP/1.1 502 "))
                    .await;
            ctx.record_failure(FailureKind::TunnelDialRemoteFail, dial_error.to_string());
            return;
        }
    };

    proxy
        .delegate()
        .during_response(ctx, &UpstreamEvent::TunnelEstablished(&target))
        .await;

    let mut target = target;
    match parent {
        None => {
            if let Err(write_error) = client.write_all(ESTABLISHED_RESPONSE).await {
                ctx.record_failure(FailureKind::TunnelWriteEstablishedFail, write_error.to_string());
                return;
            }
        }
        Some(parent) => {
            // The parent's CONNECT reply is intentionally not consumed here;
            // it reaches the client through the pump below.
            let mut connect = format!(
                "CONNECT {host} HTTP/1.1\r\nHost: {host}\r\n",
                host = ctx.request.host
            );
            if let Some(credentials) = parent.basic_authorization() {
                connect.push_str(&format!("Proxy-Authorization: {credentials}\r\n"));
            }
            connect.push_str("\r\n");
            if let Err(write_error) = target.write_all(connect.as_bytes()).await {
                error!(parent = %parent.authority, error = %write_error, "forwarding CONNECT to parent failed");
                let message = format!(
                    "forwarding CONNECT for {} to parent failed: {write_error}",
                    ctx.request.host
                );
                let _ = write_proxy_error_body(
                    ctx,
                    &mut client,
                    502,
                    &message,
                    Some("HTTP/1.1 502 "),
                )
                .await;
                ctx.record_failure(FailureKind::TunnelConnectRemoteFail, write_error.to_string());
                return;
            }
        }
    }

    let summary = transfer(client, target).await;
    ctx.request_bytes += summary.client_to_target;
    ctx.response_bytes += summary.target_to_client;
    if let Some(copy_error) = summary.first_error() {
        error!(host = %ctx.request.host, error = %copy_error, "tunnel copy failed");
        ctx.record_failure(FailureKind::TunnelWriteConnFail, copy_error.to_string());
    }
    ctx.mark_closed();
}
