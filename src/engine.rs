//! The engine context: every shared service behind one explicit handle.
//!
//! There are no process-wide mutable globals; the server, pipeline, worker,
//! and poller all hold an `Arc<Engine>` and reach the registry, loader,
//! store, adapter, and traffic log through it. Reload swaps the registry and
//! loader atomically; executors hold `Arc` snapshots, so in-flight runs
//! finish against the index they started with.

use crate::config::EngineConfig;
use crate::executor::{ExecutorError, FlowExecutor};
use crate::funcs;
use crate::ir::IrLoader;
use crate::item::Item;
use crate::jobs::queue::{JobQueue, NullJobQueue};
use crate::llm::{HttpLlmAdapter, LlmAdapter, MockLlmAdapter, TrafficLog};
use crate::node::{NodeContext, NodeResult, Resources};
use crate::registry::NodeRegistry;
use crate::state::{SessionStateCache, StateManager, StateMap};
use crate::store::{SessionStore, StoreError, StorePolicy};
use miette::Diagnostic;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] crate::config::ConfigError),
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<SessionStore>,
    registry: RwLock<Arc<NodeRegistry>>,
    loader: RwLock<Arc<IrLoader>>,
    adapter: Arc<dyn LlmAdapter>,
    traffic: Arc<TrafficLog>,
    queue: Arc<dyn JobQueue>,
    states: SessionStateCache,
    resources: Arc<Resources>,
}

impl Engine {
    /// Builds an engine with the inline null queue.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_queue(config, Arc::new(NullJobQueue))
    }

    /// Builds an engine against an explicit queue implementation.
    ///
    /// Initialization discovers the node providers, loads the configured
    /// flow directories, and runs crash recovery over the session store.
    pub fn with_queue(
        config: EngineConfig,
        queue: Arc<dyn JobQueue>,
    ) -> Result<Self, EngineError> {
        let traffic = Arc::new(TrafficLog::new(config.traffic_capacity));
        let adapter: Arc<dyn LlmAdapter> = match &config.adapter {
            Some(adapter_config) => Arc::new(HttpLlmAdapter::new(
                adapter_config.clone(),
                traffic.clone(),
            )),
            None => Arc::new(MockLlmAdapter),
        };

        let store = Arc::new(SessionStore::new(
            &config.storage_dir,
            StorePolicy {
                fail_round_on_blocker_failure: config.fail_round_on_blocker_failure,
            },
        )?);
        store.recover()?;

        let registry = NodeRegistry::with_builtin();
        let mut loader = IrLoader::new();
        loader.load_dirs(&config.flow_dirs);

        let resources = Arc::new(Resources {
            llm: Some(adapter.clone()),
            code_funcs: funcs::default_code_funcs(),
        });

        tracing::info!(
            flows = ?loader.list_flows(),
            node_types = ?registry.known_types(),
            queue = queue.worker_hint(),
            "engine initialized"
        );

        Ok(Self {
            config,
            store,
            registry: RwLock::new(Arc::new(registry)),
            loader: RwLock::new(Arc::new(loader)),
            adapter,
            traffic,
            queue,
            states: SessionStateCache::new(),
            resources,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn LlmAdapter> {
        &self.adapter
    }

    #[must_use]
    pub fn traffic(&self) -> &Arc<TrafficLog> {
        &self.traffic
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    #[must_use]
    pub fn resources(&self) -> &Arc<Resources> {
        &self.resources
    }

    /// An executor over the current registry and flow index snapshot.
    #[must_use]
    pub fn executor(&self) -> FlowExecutor {
        FlowExecutor::new(self.registry.read().clone(), self.loader.read().clone())
    }

    #[must_use]
    pub fn list_flows(&self) -> Vec<String> {
        self.loader.read().list_flows()
    }

    /// Every node type a document may use: the executor-interpreted
    /// composites plus the registered atomic nodes, sorted.
    #[must_use]
    pub fn node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = crate::executor::COMPOSITE_TYPES
            .iter()
            .map(|t| t.to_string())
            .collect();
        types.extend(self.registry.read().known_types());
        types.sort();
        types
    }

    /// Rebuilds the registry and flow index end-to-end and swaps them in.
    ///
    /// Returns the loaded flow refs and registered node types.
    pub fn reload(&self, dirs: Option<Vec<PathBuf>>) -> (Vec<String>, Vec<String>) {
        let registry = NodeRegistry::with_builtin();
        let mut loader = IrLoader::new();
        let dirs = dirs.unwrap_or_else(|| self.config.flow_dirs.clone());
        loader.load_dirs(&dirs);

        let flows = loader.list_flows();
        *self.registry.write() = Arc::new(registry);
        *self.loader.write() = Arc::new(loader);
        tracing::info!(?flows, "reload complete");
        (flows, self.node_types())
    }

    /// The live state manager for a session, seeded from the stored LSS on
    /// first use.
    pub fn session_state(&self, session_id: &str) -> Result<Arc<StateManager>, StoreError> {
        if let Some(state) = self.states.get(session_id) {
            return Ok(state);
        }
        let doc = self.store.load_session(session_id)?;
        Ok(self.states.get_or_seed(session_id, || doc.lss.clone()))
    }

    /// Drops the cached manager; the next use reseeds from the store. Used
    /// after branch operations rewrite the session's state line.
    pub fn reset_session_state(&self, session_id: &str) {
        self.states.reset(session_id);
    }

    #[must_use]
    pub fn node_ctx(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
        state: Arc<StateManager>,
    ) -> NodeContext {
        NodeContext {
            session_id: session_id.to_string(),
            branch_id: branch_id.to_string(),
            round_no,
            state,
            resources: self.resources.clone(),
        }
    }

    /// Ad-hoc flow execution for the `/api/flow/run` surface.
    ///
    /// With a session id the session's live state is used and persisted
    /// afterwards; otherwise the run gets an ephemeral manager seeded from
    /// `initial_state` or the configured world state.
    pub async fn run_flow(
        &self,
        reference: &str,
        items: Vec<Item>,
        session_id: Option<&str>,
        use_world_state: bool,
        initial_state: Option<StateMap>,
    ) -> Result<(NodeResult, StateMap), EngineError> {
        let (state, ctx) = match session_id {
            Some(id) => {
                let state = self.session_state(id)?;
                (state.clone(), self.node_ctx(id, "", 0, state))
            }
            None => {
                let seed = initial_state.unwrap_or_else(|| {
                    if use_world_state {
                        self.config.initial_state.clone()
                    } else {
                        StateMap::default()
                    }
                });
                let state = Arc::new(StateManager::new(seed));
                (
                    state.clone(),
                    NodeContext::detached(state, self.resources.clone()),
                )
            }
        };

        let result = self.executor().run_ref(reference, items, &ctx).await?;
        if let Some(id) = session_id {
            self.store.update_lss(id, state.get_lss())?;
        }
        Ok((result, state.get_working_state()))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("flows", &self.list_flows())
            .field("queue", &self.queue.worker_hint())
            .finish()
    }
}
