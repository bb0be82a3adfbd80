mod client_stream;
mod config;
mod context;
mod delegate;
mod errors;
mod flow_http;
mod flow_mitm;
mod flow_tunnel;
mod flow_websocket;
mod headers;
mod http1;
mod metrics;
mod proxy;
mod pump;
mod tls;
mod transport;

pub use client_stream::{ClientIo, ClientStream, CountingWriter};
pub use config::ProxyConfig;
pub use context::{FlowContext, ProxyRequest, Scheme};
pub use delegate::{
    Extension, ExtensionManager, NoopDelegate, ProxyDelegate, UpstreamEvent, UpstreamProxy,
};
pub use errors::{
    write_proxy_error_body, FailureKind, ProxyCoreError, ProxyErrorBody, ProxyFailure,
    PROXY_INTERNAL_ERROR_TYPE,
};
pub use headers::{
    copy_headers, is_mitm_enabled, is_websocket_upgrade, remove_connection_listed,
    remove_hop_by_hop, remove_mitm_marker, HOP_BY_HOP_HEADERS, MITM_HEADER, MITM_HEADER_ENABLED,
};
pub use http1::{
    parse_request_head, parse_response_head, BodyMode, BufferedStream, HttpVersion, RequestHead,
    ResponseHead,
};
pub use metrics::ProxyMetrics;
pub use proxy::{Proxy, ProxyBuilder, ProxyServer};
pub use pump::TransferSummary;
pub use tls::{insecure_client_config, TlsConfigProvider, TlsProviderError};
pub use transport::{RoundTrip, Transport, UpstreamResponse};
