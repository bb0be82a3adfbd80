use http::Extensions;

use crate::errors::{FailureKind, ProxyFailure};
use crate::http1::RequestHead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    pub(crate) fn default_port(self) -> u16 {
        match self {
            Self::Http | Self::Ws => 80,
            Self::Https | Self::Wss => 443,
        }
    }

    pub(crate) fn is_tls(self) -> bool {
        matches!(self, Self::Https | Self::Wss)
    }
}

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub head: RequestHead,
    pub scheme: Scheme,
    pub host: String,
    pub client_addr: String,
}

pub struct FlowContext {
    pub flow_id: u64,
    pub request: ProxyRequest,
    pub data: Extensions,
    pub hijacked: bool,
    pub mitm: bool,
    pub request_bytes: u64,
    pub response_bytes: u64,
    closed: bool,
    abort: bool,
    failure: Option<ProxyFailure>,
}

impl FlowContext {
    pub(crate) fn new(flow_id: u64, request: ProxyRequest) -> Self {
        Self {
            flow_id,
            request,
            data: Extensions::new(),
            hijacked: false,
            mitm: false,
            request_bytes: 0,
            response_bytes: 0,
            closed: false,
            abort: false,
            failure: None,
        }
    }

    pub fn abort(&mut self) {
        self.abort = true;
    }

    pub fn aborted(&self) -> bool {
        self.abort
    }

    pub fn record_failure(&mut self, kind: FailureKind, detail: impl Into<String>) {
        self.failure = Some(ProxyFailure::new(kind, detail));
    }

    pub fn record_failure_kind(&mut self, kind: FailureKind) {
        self.failure = Some(ProxyFailure::new(kind, ""));
    }

    pub fn failure(&self) -> Option<&ProxyFailure> {
        self.failure.as_ref()
    }

    pub fn mark_closed(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
pub(crate) fn test_context(host: &str) -> FlowContext {
    let head = crate::http1::parse_request_head(
        format!("CONNECT {host} HTTP/1.1\r\nHost: {host}\r\n\r\n").as_bytes(),
    )
    .expect("test request head");
    FlowContext::new(
        1,
        ProxyRequest {
            head,
            scheme: Scheme::Http,
            host: host.to_string(),
            client_addr: "127.0.0.1:9999".to_string(),
        },
    )
}
