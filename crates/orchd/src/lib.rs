//! The platform orchestrator daemon: wires the persistence store, messaging
//! fabric, Op Event Hub, artifact store, orchestrator, delivery planner, the
//! step-worker fleet, and the HTTP surface into one running process
//! (Section 4, Section 5 "the orchestrator process runs the HTTP surface,
//! one consumer loop per worker role, the Event Hub, and the waiter/result
//! subscribers concurrently").

pub mod artifact_store;
pub mod bus;
pub mod delivery_planner;
pub mod event_hub;
pub mod git;
pub mod orchestrator;
pub mod server;
pub mod storage;
pub mod worker_runtime;
pub mod workers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use orch_core::Config;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use artifact_store::ArtifactStore;
use bus::MessageBus;
use delivery_planner::DeliveryPlanner;
use event_hub::OpEventHub;
use orchestrator::Orchestrator;
use storage::Storage;
use workers::{delivery, image_builder, registrar, repo_bootstrap};

/// A fully wired daemon instance. `new` performs all fallible bring-up
/// (directories, database, migrations); `run` drives the worker fleet and the
/// HTTP server until `shutdown` is called.
pub struct Daemon {
    config: Arc<Config>,
    storage: Arc<Storage>,
    bus: Arc<MessageBus>,
    event_hub: Arc<OpEventHub>,
    artifacts: Arc<ArtifactStore>,
    orchestrator: Arc<Orchestrator>,
    delivery_planner: Arc<DeliveryPlanner>,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl Daemon {
    pub async fn new(config: Config) -> eyre::Result<Self> {
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.data_dir)?;
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        let bus = MessageBus::new(storage.pool().clone());
        let event_hub = OpEventHub::new(config.event_buffer, Duration::from_secs(config.event_ttl_sec));
        let artifacts = Arc::new(ArtifactStore::new(&config.data_dir));
        let orchestrator = Orchestrator::new(storage.clone(), bus.clone(), event_hub.clone(), config.history_cap);
        let delivery_planner = Arc::new(DeliveryPlanner::new(storage.clone(), artifacts.clone()));

        Ok(Self {
            config,
            storage,
            bus,
            event_hub,
            artifacts,
            orchestrator,
            delivery_planner,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        })
    }

    /// Signals every worker loop to stop after its current fetch and wakes
    /// the HTTP server's graceful-shutdown future.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_waiters();
    }

    /// Spawns one consumer loop per step-worker role (Section 4.5 entry
    /// subjects, Section 4.7 `start_subject`/the CI shortcut into
    /// `bootstrap.done`) and serves the HTTP surface until shutdown.
    pub async fn run(&self) -> eyre::Result<()> {
        let step_timeout = Duration::from_secs(self.config.step_timeout_sec as u64);
        let max_deliver = self.config.max_deliver;

        let registrar_ctx = Arc::new(registrar::RegistrarContext {
            storage: self.storage.clone(),
            artifacts: self.artifacts.clone(),
        });
        let bootstrap_ctx = Arc::new(repo_bootstrap::RepoBootstrapContext {
            artifacts: self.artifacts.clone(),
            config: self.config.clone(),
        });
        let builder_ctx = Arc::new(image_builder::ImageBuilderContext {
            storage: self.storage.clone(),
            artifacts: self.artifacts.clone(),
            config: self.config.clone(),
        });
        let delivery_ctx = Arc::new(delivery::DeliveryContext {
            storage: self.storage.clone(),
            artifacts: self.artifacts.clone(),
            orchestrator: self.orchestrator.clone(),
        });

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        macro_rules! spawn_worker {
            ($worker:expr, $input:expr, $output:expr, $ctx:expr, $body:expr) => {{
                let bus = self.bus.clone();
                let orchestrator = self.orchestrator.clone();
                let shutdown = self.shutdown.clone();
                let ctx = $ctx.clone();
                handles.push(tokio::spawn(worker_runtime::run_worker(
                    $worker,
                    $input,
                    $output,
                    bus,
                    orchestrator,
                    max_deliver,
                    step_timeout,
                    shutdown,
                    move |envelope| {
                        let ctx = ctx.clone();
                        async move { ($body)(ctx, envelope).await }
                    },
                )));
            }};
        }

        spawn_worker!(
            workers::WORKER_REGISTRAR,
            workers::SUBJECT_OP_START,
            workers::SUBJECT_REGISTRATION_DONE,
            registrar_ctx,
            registrar::run
        );
        spawn_worker!(
            workers::WORKER_REPO_BOOTSTRAP,
            workers::SUBJECT_REGISTRATION_DONE,
            workers::SUBJECT_BOOTSTRAP_DONE,
            bootstrap_ctx,
            repo_bootstrap::run
        );
        spawn_worker!(
            workers::WORKER_IMAGE_BUILDER,
            workers::SUBJECT_BOOTSTRAP_DONE,
            workers::SUBJECT_BUILD_DONE,
            builder_ctx,
            image_builder::run
        );
        spawn_worker!(
            workers::WORKER_MANIFEST_RENDERER,
            workers::SUBJECT_BUILD_DONE,
            workers::SUBJECT_DEPLOY_DONE,
            delivery_ctx,
            delivery::run
        );
        spawn_worker!(
            workers::WORKER_DEPLOYER,
            workers::SUBJECT_DEPLOYMENT_START,
            workers::SUBJECT_DEPLOY_DONE,
            delivery_ctx,
            delivery::run
        );
        spawn_worker!(
            workers::WORKER_PROMOTER,
            workers::SUBJECT_PROMOTION_START,
            workers::SUBJECT_PROMOTION_DONE,
            delivery_ctx,
            delivery::run
        );

        let state = Arc::new(server::AppState {
            config: self.config.clone(),
            storage: self.storage.clone(),
            artifacts: self.artifacts.clone(),
            orchestrator: self.orchestrator.clone(),
            delivery_planner: self.delivery_planner.clone(),
        });
        let router = server::create_router(state);
        let listener = tokio::net::TcpListener::bind(&self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "HTTP server listening");

        let notify = self.shutdown_notify.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { notify.notified().await })
            .await?;

        for handle in handles {
            handle.abort();
        }
        Ok(())
    }
}
