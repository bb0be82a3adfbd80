use std::io;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::context::FlowContext;

#[derive(Debug, Error)]
pub enum ProxyCoreError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("runtime I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ConnectFail,
    AuthFail,
    BeforeRequestFail,
    ParentProxyFail,
    BeforeResponseFail,
    HttpDoRequestFail,
    HttpWriteClientFail,
    HttpsGenerateTlsConfigFail,
    HttpsHijackClientConnFail,
    HttpsWriteEstablishedFail,
    HttpsTlsHandshakeFail,
    HttpsReadRequestFail,
    HttpsDoRequestFail,
    HttpsWriteResponseFail,
    TunnelHijackClientConnFail,
    TunnelDialRemoteFail,
    TunnelWriteEstablishedFail,
    TunnelConnectRemoteFail,
    TunnelWriteConnFail,
    WebsocketDialFail,
    WebsocketHijackFail,
    WebsocketHandshakeFail,
    TlsWebsocketGenerateTlsConfigFail,
    TlsWebsocketHijackFail,
    TlsWebsocketWriteEstablishedFail,
    TlsWebsocketTlsHandshakeFail,
    TlsWebsocketReadRequestFail,
    TlsWebsocketDialFail,
    TlsWebsocketHandshakeFail,
}

impl FailureKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::ConnectFail => "connect_fail",
            Self::AuthFail => "auth_fail",
            Self::BeforeRequestFail => "before_request_fail",
            Self::ParentProxyFail => "parent_proxy_fail",
            Self::BeforeResponseFail => "before_response_fail",
            Self::HttpDoRequestFail => "http_do_request_fail",
            Self::HttpWriteClientFail => "http_write_client_fail",
            Self::HttpsGenerateTlsConfigFail => "https_generate_tls_config_fail",
            Self::HttpsHijackClientConnFail => "https_hijack_client_conn_fail",
            Self::HttpsWriteEstablishedFail => "https_write_established_fail",
            Self::HttpsTlsHandshakeFail => "https_tls_handshake_fail",
            Self::HttpsReadRequestFail => "https_read_request_fail",
            Self::HttpsDoRequestFail => "https_do_request_fail",
            Self::HttpsWriteResponseFail => "https_write_response_fail",
            Self::TunnelHijackClientConnFail => "tunnel_hijack_client_conn_fail",
            Self::TunnelDialRemoteFail => "tunnel_dial_remote_fail",
            Self::TunnelWriteEstablishedFail => "tunnel_write_established_fail",
            Self::TunnelConnectRemoteFail => "tunnel_connect_remote_fail",
            Self::TunnelWriteConnFail => "tunnel_write_conn_fail",
            Self::WebsocketDialFail => "websocket_dial_fail",
            Self::WebsocketHijackFail => "websocket_hijack_fail",
            Self::WebsocketHandshakeFail => "websocket_handshake_fail",
            Self::TlsWebsocketGenerateTlsConfigFail => "tls_websocket_generate_tls_config_fail",
            Self::TlsWebsocketHijackFail => "tls_websocket_hijack_fail",
            Self::TlsWebsocketWriteEstablishedFail => "tls_websocket_write_established_fail",
            Self::TlsWebsocketTlsHandshakeFail => "tls_websocket_tls_handshake_fail",
            Self::TlsWebsocketReadRequestFail => "tls_websocket_read_request_fail",
            Self::TlsWebsocketDialFail => "tls_websocket_dial_fail",
            Self::TlsWebsocketHandshakeFail => "tls_websocket_handshake_fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl ProxyFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

pub const PROXY_INTERNAL_ERROR_TYPE: &str = "PROXY_CENTER_INTERNAL_ERR";

#[derive(Debug, Serialize)]
pub struct ProxyErrorBody {
    #[serde(rename = "errType")]
    pub err_type: &'static str,
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg")]
    pub err_msg: String,
}

impl ProxyErrorBody {
    pub fn new(code: u16, msg: impl Into<String>) -> Self {
        Self {
            err_type: PROXY_INTERNAL_ERROR_TYPE,
            err_code: i32::from(code),
            err_msg: msg.into(),
        }
    }
}

pub async fn write_proxy_error_body<W>(
    ctx: &mut FlowContext,
    sink: &mut W,
    code: u16,
    msg: &str,
    prefix: Option<&str>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(prefix) = prefix {
        sink.write_all(prefix.as_bytes()).await?;
        ctx.response_bytes += prefix.len() as u64;
    }
    let body = serde_json::to_vec(&ProxyErrorBody::new(code, msg))
        .expect("proxy error body must serialize");
    sink.write_all(&body).await?;
    ctx.response_bytes += body.len() as u64;
    sink.flush().await
}

#[cfg(test)]
mod tests {
    use super::{write_proxy_error_body, FailureKind, ProxyErrorBody};
    use crate::context::test_context;

    #[test]
    fn failure_codes_are_stable() {
        assert_eq!(FailureKind::ConnectFail.code(), "connect_fail");
        assert_eq!(FailureKind::TunnelWriteConnFail.code(), "tunnel_write_conn_fail");
        assert_eq!(
            FailureKind::TlsWebsocketReadRequestFail.code(),
            "tls_websocket_read_request_fail"
        );
    }

    #[test]
    fn error_body_serializes_with_wire_field_names() {
        let body = ProxyErrorBody::new(502, "dial tcp: connection refused");
        let json = serde_json::to_string(&body).expect("serialize");
        assert_eq!(
            json,
            "{\"errType\":\"PROXY_CENTER_INTERNAL_ERR\",\"errCode\":502,\
             \"errMsg\":\"dial tcp: connection refused\"}"
        );
    }

    #[tokio::test]
    async fn error_body_writer_counts_prefix_and_body() {
        let mut ctx = test_context("example.com:443");
        let mut sink = Vec::new();
        write_proxy_error_body(&mut ctx, &mut sink, 502, "boom", Some("HTTP/1.1 502 "))
            .await
            .expect("write error body");

        let text = String::from_utf8(sink).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 502 {"), "{text}");
        assert!(text.contains("\"errMsg\":\"boom\""), "{text}");
        assert_eq!(ctx.response_bytes, text.len() as u64);
    }
}
