//! Wiring of the tool runtime.
//!
//! One registry is shared by the reload manager (writer) and the
//! dispatcher (reader). Every transport talks to the same dispatcher.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::definitions::NativeCatalog;
use super::descriptor::DescriptorStore;
use super::dispatcher::Dispatcher;
use super::error::LoadError;
use super::loader::ToolLoader;
use super::registry::ToolRegistry;
use super::reload::{HotReloadManager, TickReport};
use crate::core::config::Config;
use crate::core::error::Result;
use crate::core::security::{AllowAll, CallerIdentity, PolicyAuthorizer, SharedAuthorizer};

/// Registry, reload manager and dispatcher built from one configuration.
#[derive(Clone)]
pub struct ToolRuntime {
    registry: Arc<ToolRegistry>,
    reload: Arc<HotReloadManager>,
    dispatcher: Arc<Dispatcher>,
    default_identity: CallerIdentity,
}

impl ToolRuntime {
    /// Build the runtime, loading the authorization policy if one is configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let authorizer: SharedAuthorizer = match &config.auth.policy_file {
            Some(path) => Arc::new(PolicyAuthorizer::from_file(path)?),
            None => Arc::new(AllowAll),
        };
        Ok(Self::new(config, NativeCatalog::builtin(), authorizer))
    }

    pub fn new(config: &Config, natives: NativeCatalog, authorizer: SharedAuthorizer) -> Self {
        let registry = Arc::new(ToolRegistry::new());
        let loader = ToolLoader::new(natives, config.security.clone());
        let store = DescriptorStore::new(&config.runtime.descriptors_dir);
        let reload = Arc::new(HotReloadManager::new(
            registry.clone(),
            loader,
            store,
            config.runtime.reload_settings(),
        ));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            authorizer,
            config.runtime.dispatch_settings(),
        )
        .with_reload(reload.clone());

        Self {
            registry,
            reload,
            dispatcher: Arc::new(dispatcher),
            default_identity: CallerIdentity::new(&config.auth.default_identity),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn reload(&self) -> &Arc<HotReloadManager> {
        &self.reload
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Identity for sessions that do not carry one.
    pub fn default_identity(&self) -> &CallerIdentity {
        &self.default_identity
    }

    /// Load the descriptor store once, before serving.
    pub async fn load(&self) -> std::result::Result<TickReport, LoadError> {
        let report = self.reload.tick().await?;
        info!(
            "Loaded {} tool(s), {} rejected",
            self.registry.len(),
            report.rejected.len()
        );
        Ok(report)
    }

    /// Keep the registry in sync with the store until `cancel` fires.
    pub fn spawn_reload(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.reload.clone().spawn(cancel)
    }
}
