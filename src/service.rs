//! Wires the controllers together and runs them: the edge-triggered lifecycle
//! watch loop plus the four timer-driven syncers, all sharing one repository
//! and shutting down together on cancellation.

use crate::conf;
use crate::deploy::{InfraDeployer, NoopDeployer};
use crate::engine::{self, BuildEngine};
use crate::events::{EventBus, Kind};
use crate::lifecycle::Lifecycle;
use crate::logstore::{init_log_store, LogStore};
use crate::provider;
use crate::repository::memory::MemoryRepository;
use crate::repository::{Repository, RepositoryError};
use crate::syncer::cron::CronSyncer;
use crate::syncer::logs::ExecutionLogSyncer;
use crate::syncer::registry_cert::RegistryCertSyncer;
use crate::syncer::state::ExecutionStateSyncer;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Controller {
    config: conf::Config,
    repository: Arc<dyn Repository>,
    engine: Arc<dyn BuildEngine>,
    log_store: Arc<dyn LogStore>,
    deployer: Arc<dyn InfraDeployer>,
    providers: provider::Registry,
    events: EventBus,
}

impl Controller {
    /// Production embedders construct the controller with their own adapter
    /// implementations (cluster repository, engine client, object store,
    /// provisioner, providers).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: conf::Config,
        repository: Arc<dyn Repository>,
        engine: Arc<dyn BuildEngine>,
        log_store: Arc<dyn LogStore>,
        deployer: Arc<dyn InfraDeployer>,
        providers: provider::Registry,
        events: EventBus,
    ) -> Self {
        Controller {
            config,
            repository,
            engine,
            log_store,
            deployer,
            providers,
            events,
        }
    }

    /// The in-memory reference wiring used by `conveyor service start`.
    pub fn dev(config: conf::Config) -> Result<Self> {
        if !config.general.dev_mode {
            warn!("dev_mode is off but only the in-memory reference backends are wired");
        }
        let events = EventBus::new();
        let repository = Arc::new(MemoryRepository::new(events.clone()));
        let log_store: Arc<dyn LogStore> =
            Arc::from(init_log_store(&config.log_store.backend, &config.log_store.path)?);
        Ok(Controller::new(
            config,
            repository,
            Arc::new(engine::memory::Engine::new()),
            log_store,
            Arc::new(NoopDeployer),
            provider::Registry::new(),
            events,
        ))
    }

    /// Run all controllers until the token is cancelled.
    pub async fn start(self, token: CancellationToken) -> Result<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            "Starting pipeline execution controller"
        );

        let mut tasks = tokio::task::JoinSet::new();

        // Edge-triggered half: reconcile executions as their watch events
        // arrive. Delivery is at-least-once; the handler re-reads the current
        // object so stale payloads never matter.
        let lifecycle = Lifecycle::new(
            self.repository.clone(),
            self.engine.clone(),
            self.deployer.clone(),
        );
        let watch_repository = self.repository.clone();
        let mut stream = self.events.subscribe();
        let watch_token = token.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = watch_token.cancelled() => return,
                    received = stream.recv() => match received {
                        Ok(event) => {
                            let Kind::AppliedExecution { namespace, name } = event.kind;
                            match watch_repository.get_execution(&namespace, &name).await {
                                Ok(execution) => {
                                    if let Err(e) = lifecycle.reconcile(&execution).await {
                                        error!(
                                            namespace = namespace,
                                            execution = name,
                                            error = %e,
                                            "Could not reconcile execution"
                                        );
                                    }
                                }
                                Err(RepositoryError::NotFound) => {}
                                Err(e) => error!(
                                    namespace = namespace,
                                    execution = name,
                                    error = %e,
                                    "Could not fetch execution for reconcile"
                                ),
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Watch stream lagged; dropped events are retried by the state syncer");
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        });

        // Level-triggered half: the four poll loops.
        let state_syncer = ExecutionStateSyncer::new(
            self.repository.clone(),
            self.engine.clone(),
            Duration::from_secs(self.config.controller.state_sync_interval),
        );
        let state_token = token.clone();
        tasks.spawn(async move { state_syncer.run(state_token).await });

        let cron_syncer = CronSyncer::new(
            self.repository.clone(),
            self.providers.clone(),
            Duration::from_secs(self.config.controller.cron_sync_interval),
            self.config.general.pipelines_enabled,
        );
        let cron_token = token.clone();
        tasks.spawn(async move { cron_syncer.run(cron_token).await });

        let log_syncer = ExecutionLogSyncer::new(
            self.repository.clone(),
            self.engine.clone(),
            self.log_store.clone(),
            Duration::from_secs(self.config.controller.log_sync_interval),
        );
        let log_token = token.clone();
        tasks.spawn(async move { log_syncer.run(log_token).await });

        let cert_syncer = RegistryCertSyncer::new(
            self.repository.clone(),
            self.config.controller.system_namespace.clone(),
            Duration::from_secs(self.config.controller.cert_sync_interval),
            Duration::from_secs(self.config.registry.quiescence_poll_interval),
            Duration::from_secs(self.config.registry.quiescence_budget),
        );
        let cert_token = token.clone();
        tasks.spawn(async move { cert_syncer.run(cert_token).await });

        while tasks.join_next().await.is_some() {}
        info!("Pipeline execution controller stopped");
        Ok(())
    }
}
