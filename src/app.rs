use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    bus::{Broker, HANDLER_KEY, MessageBus, MessageHandler, NatsBroker},
    config::Settings,
    function::{FunctionRegistry, in_handler},
    functions::register_builtins,
    jobs::JobEngine,
    llm::LlmGateway,
    orchestrator::Orchestrator,
};

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Every long-lived component of a running process.
pub struct App {
    pub registry: Arc<FunctionRegistry>,
    pub llm: Arc<LlmGateway>,
    pub engine: JobEngine,
    pub bus: Arc<MessageBus>,
    pub orchestrator: Arc<Orchestrator>,
    sweep_task: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl App {
    /// Wires the production stack: NATS JetStream and the configured LLM
    /// provider.
    pub async fn bootstrap(settings: Settings) -> Result<Self> {
        let broker = Arc::new(NatsBroker::new(settings.bus.clone()));
        let llm = LlmGateway::new(settings.llm_idle_ttl);
        Self::assemble(settings, broker, llm).await
    }

    /// Builds the components in dependency order, connects, and starts
    /// consuming. Returns once the bus is listening.
    pub async fn assemble(settings: Settings, broker: Arc<dyn Broker>, llm: Arc<LlmGateway>) -> Result<Self> {
        let registry = FunctionRegistry::new();
        let count = register_builtins(&registry).context("failed to register built-in functions")?;
        info!(count, "function registry ready");

        let instance_id = llm
            .create_instance(settings.llm.clone())
            .context("failed to create the LLM instance")?;
        info!(%instance_id, provider = %settings.llm.provider, "LLM gateway ready");

        let engine = JobEngine::new(registry.clone(), settings.engine.clone());

        let bus = MessageBus::new(broker, settings.bus.clone());
        bus.connect().await.context("failed to connect to the message broker")?;
        bus.wait_for_connection(settings.bus.reconnect_delay * 12)
            .await
            .context("message broker never became available")?;

        let orchestrator = Orchestrator::new(
            registry.clone(),
            llm.clone(),
            engine.clone(),
            bus.clone(),
            instance_id,
            settings.orchestrator.clone(),
        )?;
        bus.register_handler(HANDLER_KEY, orchestrator.clone() as Arc<dyn MessageHandler>);
        bus.start_listening().await.context("failed to start consuming")?;

        let sweep_task = Some(spawn_idle_sweep(llm.clone(), settings.llm_cleanup_interval));

        info!("switchyard is ready");
        Ok(Self {
            registry,
            llm,
            engine,
            bus,
            orchestrator,
            sweep_task,
            shutdown_timeout: settings.shutdown_timeout,
        })
    }

    /// Stops intake, lets in-flight requests finish within the shutdown
    /// budget, then tears down the engine and the broker connection.
    pub async fn shutdown(&mut self) {
        info!("shutting down");
        self.bus.stop_listening().await;

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while self.orchestrator.in_flight_count() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                in_flight = self.orchestrator.in_flight_count(),
                "in-flight requests still running at shutdown"
            );
        }

        self.engine.shutdown(self.shutdown_timeout).await;
        if let Some(task) = self.sweep_task.take() {
            task.abort();
        }
        if let Err(err) = self.bus.close().await {
            warn!(error = %err, "broker did not close cleanly");
        }
        info!("shutdown complete");
    }
}

/// Logs every panic. Panics outside a function handler also cancel
/// `fatal` so the process shuts down instead of limping on; handler panics
/// are already reported to the caller as failed executions.
pub fn install_panic_hook(fatal: CancellationToken) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        if in_handler() {
            warn!(%panic, "function handler panicked");
        } else {
            error!(%panic, "panic");
            fatal.cancel();
        }
        previous(panic);
    }));
}

fn spawn_idle_sweep(llm: Arc<LlmGateway>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            llm.cleanup();
        }
    })
}
