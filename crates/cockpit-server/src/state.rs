//! Application state shared by every handler.

use std::sync::Arc;

use cockpit_pty::{SessionRegistry, TerminalBridge};

use crate::auth::{Authenticator, TokenAuthenticator};
use crate::config::AppConfig;
use crate::process_feed::{FeedHub, SnapshotSource, TopSnapshot};
use crate::process_list::ProcessLister;

#[derive(Clone)]
pub struct AppState {
    /// Terminal bindings over the session registry.
    pub bridge: Arc<TerminalBridge>,
    /// Live process feeds, one per client.
    pub feeds: Arc<FeedHub>,
    pub processes: Arc<ProcessLister>,
    pub auth: Arc<dyn Authenticator>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let auth = Arc::new(TokenAuthenticator::new(&config.auth));
        let source = Arc::new(TopSnapshot::new(&config.processes));
        Self::with_parts(config, auth, source)
    }

    /// Build state around a custom authenticator and snapshot source.
    pub fn with_parts(
        config: AppConfig,
        auth: Arc<dyn Authenticator>,
        source: Arc<dyn SnapshotSource>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.terminal.registry_config()));
        let bridge = Arc::new(TerminalBridge::new(
            registry,
            config.terminal.stream_buffer,
        ));
        let feeds = Arc::new(FeedHub::new(source, config.processes.interval()));
        let processes = Arc::new(ProcessLister::new(&config.processes));

        Self {
            bridge,
            feeds,
            processes,
            auth,
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.bridge.registry()
    }

    /// End every stream and kill every session.
    pub fn shutdown(&self) {
        self.feeds.shutdown();
        self.registry().shutdown();
    }
}
