use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyMetrics {
    pub active_clients: i32,
    pub total_requests: u64,
    pub failed_requests: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ProxyMetricsStore {
    active_clients: AtomicI32,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl ProxyMetricsStore {
    pub(crate) fn snapshot(&self) -> ProxyMetrics {
        ProxyMetrics {
            active_clients: self.active_clients.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn active_clients(&self) -> i32 {
        self.active_clients.load(Ordering::Relaxed)
    }

    pub(crate) fn record_request_start(&self) {
        self.active_clients.fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_end(&self) {
        self.active_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct ActiveRequestGuard {
    store: Arc<ProxyMetricsStore>,
}

impl ActiveRequestGuard {
    pub(crate) fn enter(store: Arc<ProxyMetricsStore>) -> Self {
        store.record_request_start();
        Self { store }
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.store.record_request_end();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ActiveRequestGuard, ProxyMetricsStore};

    #[test]
    fn guard_balances_active_count() {
        let store = Arc::new(ProxyMetricsStore::default());
        {
            let _first = ActiveRequestGuard::enter(Arc::clone(&store));
            let _second = ActiveRequestGuard::enter(Arc::clone(&store));
            assert_eq!(store.active_clients(), 2);
        }
        assert_eq!(store.active_clients(), 0);
        assert_eq!(store.snapshot().total_requests, 2);
    }

    #[test]
    fn failures_accumulate_independently() {
        let store = ProxyMetricsStore::default();
        store.record_request_failure();
        store.record_request_failure();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.failed_requests, 2);
        assert_eq!(snapshot.total_requests, 0);
    }
}
