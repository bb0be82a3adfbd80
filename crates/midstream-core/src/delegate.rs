use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use tokio::net::TcpStream;
use url::Url;

use crate::context::FlowContext;
use crate::errors::ProxyCoreError;
use crate::http1::ResponseHead;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    pub authority: String,
    pub credentials: Option<(String, String)>,
}

impl UpstreamProxy {
    pub fn parse(raw: &str) -> Result<Self, ProxyCoreError> {
        let url = Url::parse(raw)
            .map_err(|error| ProxyCoreError::InvalidConfig(format!("invalid proxy URL: {error}")))?;
        Self::from_url(&url)
    }

    pub fn from_url(url: &Url) -> Result<Self, ProxyCoreError> {
        let host = url.host_str().ok_or_else(|| {
            ProxyCoreError::InvalidConfig("proxy URL is missing a host".to_string())
        })?;
        let port = url.port().unwrap_or(match url.scheme() {
            "https" => 443,
            _ => 80,
        });
        let credentials = if url.username().is_empty() {
            None
        } else {
            Some((
                url.username().to_string(),
                url.password().unwrap_or("").to_string(),
            ))
        };
        Ok(Self {
            authority: format!("{host}:{port}"),
            credentials,
        })
    }

    pub(crate) fn basic_authorization(&self) -> Option<String> {
        self.credentials.as_ref().map(|(user, pass)| {
            format!(
                "Basic {}",
                BASE64_STANDARD.encode(format!("{user}:{pass}"))
            )
        })
    }
}

#[derive(Debug)]
pub enum UpstreamEvent<'a> {
    Response(&'a ResponseHead),
    TunnelEstablished(&'a TcpStream),
    Failed(&'a io::Error),
}

pub trait ProxyDelegate: Send + Sync + 'static {
    fn set_extension_manager(&self, _extensions: Arc<ExtensionManager>) {}

    fn on_connect(&self, _ctx: &mut FlowContext) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_auth(&self, _ctx: &mut FlowContext) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn before_request(&self, _ctx: &mut FlowContext) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn parent_proxy(
        &self,
        _ctx: &mut FlowContext,
    ) -> impl Future<Output = Option<UpstreamProxy>> + Send {
        async { None }
    }

    fn before_response(
        &self,
        _ctx: &mut FlowContext,
        _event: &UpstreamEvent<'_>,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn during_response(
        &self,
        _ctx: &mut FlowContext,
        _event: &UpstreamEvent<'_>,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_finish(&self, _ctx: &mut FlowContext) -> impl Future<Output = ()> + Send {
        async {}
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl ProxyDelegate for NoopDelegate {}

pub trait Extension: Send + Sync + 'static {
    fn setup(&self) -> io::Result<()> {
        Ok(())
    }

    fn cleanup(&self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ExtensionManager {
    extensions: RwLock<BTreeMap<String, Arc<dyn Extension>>>,
}

impl ExtensionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, extension: Arc<dyn Extension>) {
        self.extensions
            .write()
            .expect("extension registry lock poisoned")
            .insert(name.into(), extension);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.extensions
            .read()
            .expect("extension registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn setup_all(&self) -> io::Result<()> {
        let extensions = self
            .extensions
            .read()
            .expect("extension registry lock poisoned");
        for extension in extensions.values() {
            extension.setup()?;
        }
        Ok(())
    }

    pub fn cleanup_all(&self) -> io::Result<()> {
        let extensions = self
            .extensions
            .read()
            .expect("extension registry lock poisoned");
        for extension in extensions.values() {
            extension.cleanup()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::{Extension, ExtensionManager, UpstreamProxy};

    #[test]
    fn proxy_url_with_credentials_yields_basic_authorization() {
        let proxy = UpstreamProxy::parse("http://u:p@upstream:3128").expect("parse proxy URL");
        assert_eq!(proxy.authority, "upstream:3128");
        assert_eq!(
            proxy.basic_authorization().expect("credentials"),
            "Basic dTpw"
        );
    }

    #[test]
    fn proxy_url_without_port_gets_scheme_default() {
        let proxy = UpstreamProxy::parse("http://upstream").expect("parse proxy URL");
        assert_eq!(proxy.authority, "upstream:80");
        assert!(proxy.basic_authorization().is_none());
    }

    #[test]
    fn proxy_url_without_host_is_rejected() {
        UpstreamProxy::parse("http://").expect_err("host-less proxy URL must fail");
    }

    #[test]
    fn extension_manager_runs_setup_for_every_registration() {
        struct Counting(Arc<AtomicU32>);
        impl Extension for Counting {
            fn setup(&self) -> std::io::Result<()> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }

        let calls = Arc::new(AtomicU32::new(0));
        let manager = ExtensionManager::new();
        manager.register("audit", Arc::new(Counting(Arc::clone(&calls))));
        manager.register("quota", Arc::new(Counting(Arc::clone(&calls))));
        manager.setup_all().expect("setup extensions");
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert!(manager.get("audit").is_some());
        assert!(manager.get("missing").is_none());
    }
}
