//! Application builder.

use redka_config::AppConfig;
use redka_jobs::{register_metrics, JobError, Redka, RedisStore, Store, TracingSink};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

/// Application builder for constructing the scheduler daemon.
#[derive(Default)]
pub struct AppBuilder {
    config: Option<AppConfig>,
    store: Option<Arc<dyn Store>>,
}

impl AppBuilder {
    /// Creates a new application builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses `store` instead of connecting to `jobs.redis`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Runs until `shutdown` resolves or a scheduler halts on a store error.
    pub async fn run<S>(self, shutdown: S) -> anyhow::Result<()>
    where
        S: Future<Output = ()>,
    {
        let config = self.config.unwrap_or_default();
        register_metrics();

        let store: Arc<dyn Store> = match self.store {
            Some(store) => store,
            None => Arc::new(RedisStore::connect(&config.jobs.redis).await?),
        };

        let redka = Redka::new(store, config.jobs.clone()).await?;
        if config.observability.report_jobs {
            redka.report_to(Arc::new(TracingSink));
        }
        info!("Scheduler daemon running");

        let delay_failure = async {
            match redka.delayed_jobs_manager() {
                Some(manager) => manager.fatal().await,
                None => std::future::pending::<JobError>().await,
            }
        };

        let outcome = tokio::select! {
            () = shutdown => Ok(()),
            err = delay_failure => Err(err),
            err = redka.batch_processor().fatal() => Err(err),
        };

        redka.stop().await;

        match outcome {
            Ok(()) => {
                info!("Scheduler daemon stopped");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Scheduler daemon halted");
                Err(e.into())
            }
        }
    }
}
