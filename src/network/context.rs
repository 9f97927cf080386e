use crate::config::ConnectionSettings;
use crate::error::{Error, Result};
use crate::filter::{FilterChain, IoFilter};
use crate::network::handler::{IoHandler, SynchronousHandler};
use crate::network::session::IoSession;
use crate::network::tls::{Role, RustlsProvider, TlsProvider};
use crate::network::transport::Transport;
use crate::protocol::{MessageSplitter, TransferSplitter};
use crate::reactor::Runtime;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Everything sessions of one listener or client share.
///
/// Sealed after [`ConnectionConfigBuilder::build`]; sessions hold it by `Arc`
/// and it never refers back to them.
pub struct ConnectionConfig {
    settings: ConnectionSettings,
    filters: FilterChain,
    splitter: Arc<dyn MessageSplitter>,
    handler: Arc<dyn IoHandler>,
    tls: Option<Arc<dyn TlsProvider>>,
    runtime: Arc<Runtime>,
    next_id: AtomicU64,
    active: AtomicUsize,
}

impl ConnectionConfig {
    pub fn builder(runtime: Arc<Runtime>) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new(runtime)
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    pub fn splitter(&self) -> &Arc<dyn MessageSplitter> {
        &self.splitter
    }

    pub fn handler(&self) -> &Arc<dyn IoHandler> {
        &self.handler
    }

    pub fn tls_provider(&self) -> Option<&Arc<dyn TlsProvider>> {
        self.tls.as_ref()
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Sessions created and not yet disconnected.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn new_session(self: &Arc<Self>, transport: Box<dyn Transport>, role: Role) -> Arc<IoSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.active.fetch_add(1, Ordering::AcqRel);
        debug!("Session {} created ({:?})", id, role);
        Arc::new(IoSession::new(id, Arc::clone(self), transport, role))
    }

    pub(crate) fn session_finished(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("settings", &self.settings)
            .field("filters", &self.filters)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

pub struct ConnectionConfigBuilder {
    runtime: Arc<Runtime>,
    settings: ConnectionSettings,
    filters: Vec<Arc<dyn IoFilter>>,
    splitter: Option<Arc<dyn MessageSplitter>>,
    handler: Option<Arc<dyn IoHandler>>,
    tls: Option<Arc<dyn TlsProvider>>,
}

impl ConnectionConfigBuilder {
    fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            settings: ConnectionSettings::default(),
            filters: Vec::new(),
            splitter: None,
            handler: None,
            tls: None,
        }
    }

    pub fn settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.settings.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.settings.port = port;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.settings.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.settings.send_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Whole seconds; sub-second intervals round down.
    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.settings.idle_interval_s = interval.as_secs();
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.settings.read_buffer_size = size;
        self
    }

    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.settings.send_buffer_size = size;
        self
    }

    pub fn read_recursion_depth(mut self, depth: usize) -> Self {
        self.settings.read_recursion_depth = depth;
        self
    }

    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.settings.tcp_nodelay = nodelay;
        self
    }

    /// Append a filter; decoding runs filters in the order they were added.
    pub fn filter(mut self, filter: impl IoFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn splitter(mut self, splitter: impl MessageSplitter + 'static) -> Self {
        self.splitter = Some(Arc::new(splitter));
        self
    }

    pub fn handler<H: IoHandler + 'static>(mut self, handler: Arc<H>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn tls(mut self, provider: Arc<dyn TlsProvider>) -> Self {
        self.tls = Some(provider);
        self
    }

    /// Validate and seal. A TLS provider is built from the settings' PEM
    /// files when none was supplied.
    pub fn build(self) -> Result<Arc<ConnectionConfig>> {
        self.settings
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        let tls = match (self.tls, &self.settings.tls) {
            (Some(provider), _) => Some(provider),
            (None, Some(settings)) => {
                Some(Arc::new(RustlsProvider::from_settings(settings)?) as Arc<dyn TlsProvider>)
            }
            (None, None) => None,
        };

        Ok(Arc::new(ConnectionConfig {
            settings: self.settings,
            filters: FilterChain::new(self.filters),
            splitter: self
                .splitter
                .unwrap_or_else(|| Arc::new(TransferSplitter) as Arc<dyn MessageSplitter>),
            handler: self
                .handler
                .unwrap_or_else(|| Arc::new(SynchronousHandler::new()) as Arc<dyn IoHandler>),
            tls,
            runtime: self.runtime,
            next_id: AtomicU64::new(0),
            active: AtomicUsize::new(0),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn builder_applies_defaults_and_overrides() {
        let runtime = testing::runtime();
        let config = ConnectionConfig::builder(Arc::clone(&runtime.0))
            .port(0)
            .read_timeout(Duration::from_millis(250))
            .idle_interval(Duration::from_secs(2))
            .build()
            .unwrap();

        assert_eq!(config.settings().read_timeout(), Duration::from_millis(250));
        assert_eq!(config.settings().idle_interval(), Some(Duration::from_secs(2)));
        assert!(config.filters().is_empty());
        assert!(config.tls_provider().is_none());
        assert!(config.handler().as_synchronous().is_some());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let runtime = testing::runtime();
        let result = ConnectionConfig::builder(Arc::clone(&runtime.0))
            .read_recursion_depth(0)
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
