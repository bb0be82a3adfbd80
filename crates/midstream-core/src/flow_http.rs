use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::client_stream::ClientStream;
use crate::context::{FlowContext, Scheme};
use crate::delegate::{ProxyDelegate, UpstreamEvent};
use crate::errors::{write_proxy_error_body, FailureKind};
use crate::http1::serialize_response_head;
use crate::proxy::Proxy;
use crate::transport::RoundTrip;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HttpFlowEnd {
    KeepAlive,
    Close,
}

pub(crate) async fn forward_http<D: ProxyDelegate>(
    proxy: &Proxy<D>,
    ctx: &mut FlowContext,
    client: &mut ClientStream,
) -> HttpFlowEnd {
    debug!(host = %ctx.request.host, "forwarding plain HTTP request");
    ctx.request.scheme = Scheme::Http;

    let request_close = ctx.request.head.connection_close;
    let round_trip = proxy
        .transport()
        .round_trip(proxy.delegate(), ctx, client.buffered())
        .await;

    match round_trip {
        RoundTrip::Aborted => HttpFlowEnd::Close,
        RoundTrip::Upstream(Err(upstream_error)) => {
            error!(host = %ctx.request.host, error = %upstream_error, "upstream request failed");
            let message = format!(
                "forwarding {} failed: {upstream_error}",
                ctx.request.host
            );
            if client.write_error_head(502, "Bad Gateway").await.is_ok() {
                let _ = write_proxy_error_body(ctx, client, 502, &message, None).await;
            }
            ctx.record_failure(FailureKind::HttpDoRequestFail, upstream_error.to_string());
            HttpFlowEnd::Close
        }
        RoundTrip::Upstream(Ok(mut response)) => {
            proxy
                .delegate()
                .during_response(ctx, &UpstreamEvent::Response(&response.head))
                .await;

            let head_bytes = serialize_response_head(&response.head);
            if let Err(write_error) = client.write_all(&head_bytes).await {
                error!(host = %ctx.request.host, error = %write_error, "writing response head to client failed");
                ctx.record_failure(FailureKind::HttpWriteClientFail, write_error.to_string());
                if ctx.mark_closed() {
                    response.finish();
                }
                return HttpFlowEnd::Close;
            }

            let response_close = response.head.connection_close;
            let relayed = response.relay_body_to(client).await;
            let end = match relayed {
                Ok(moved) => {
                    ctx.response_bytes += moved;
                    if request_close || response_close {
                        HttpFlowEnd::Close
                    } else {
                        HttpFlowEnd::KeepAlive
                    }
                }
                Err(relay_error) => {
                    error!(host = %ctx.request.host, error = %relay_error, "writing response body to client failed");
                    ctx.record_failure(FailureKind::HttpWriteClientFail, relay_error.to_string());
                    HttpFlowEnd::Close
                }
            };

            if ctx.mark_closed() {
                response.finish();
            }
            end
        }
    }
}
