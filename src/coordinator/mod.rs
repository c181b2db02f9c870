//! The coordinator process: node listener, dispatcher and optional status API
//! around one shared [`GridScheduler`].

mod server;
mod session;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::dashboard::{run_status_api, StatusState};
use crate::error::Result;
use crate::scheduler::{DependentValueResolver, GridScheduler};

pub use server::NodeListener;
use session::SessionSettings;

pub struct Coordinator {
    config: CoordinatorConfig,
    scheduler: GridScheduler,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, resolver: Arc<dyn DependentValueResolver>) -> Self {
        let scheduler = GridScheduler::new(&config, resolver);
        Self { config, scheduler }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Handle for submitting, cancelling and observing jobs while running.
    pub fn scheduler(&self) -> &GridScheduler {
        &self.scheduler
    }

    /// Bind the configured address and serve until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the node listener cannot bind. Failures of single
    /// node connections are logged and never end the coordinator.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = NodeListener::bind(self.config.listen_addr).await?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: NodeListener, shutdown: CancellationToken) {
        let dispatcher = self.scheduler.dispatcher().clone();
        let retry = Duration::from_millis(self.config.dispatch_retry_interval_ms);
        let dispatcher_shutdown = shutdown.clone();
        let dispatcher_task = tokio::spawn(async move {
            dispatcher.run(retry, dispatcher_shutdown).await;
        });

        if let Some(status_addr) = self.config.status_addr {
            let state = StatusState::new(self.scheduler.clone());
            let status_shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_status_api(status_addr, state, status_shutdown).await;
            });
        }

        let settings = SessionSettings {
            handshake_timeout: Duration::from_millis(self.config.handshake_timeout_ms),
            max_frame_length: self.config.max_frame_length,
        };
        listener
            .run(self.scheduler.clone(), settings, shutdown)
            .await;

        if let Err(e) = dispatcher_task.await {
            tracing::error!(error = %e, "Dispatcher task failed");
        }
        tracing::info!("Coordinator stopped");
    }
}
