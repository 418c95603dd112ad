use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::accounting::AccountingStore;
use crate::auth::{TokenAuthority, CONTROLLER_SUBJECT};
use crate::config::ControllerConfig;
use crate::controller::Controller;
use crate::dispatch::GrpcNodeClient;
use crate::error::Result;
use crate::gateway::{run_gateway, GatewayState};
use crate::grpc::interceptor::CredentialInjector;
use crate::grpc::GrpcServer;

/// The controller process: the controller task plus its API servers.
pub struct ControllerDaemon {
    config: ControllerConfig,
    authority: Arc<TokenAuthority>,
}

impl ControllerDaemon {
    pub fn new(config: ControllerConfig, authority: Arc<TokenAuthority>) -> Self {
        Self { config, authority }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// 1. Opens the accounting store
    /// 2. Spawns the controller task
    /// 3. Optionally spawns the REST gateway
    /// 4. Runs the gRPC server (blocking)
    ///
    /// # Errors
    ///
    /// Returns an error if the accounting file cannot be read or the gRPC
    /// server fails. The gateway logs its own errors.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let accounting = AccountingStore::from_path(self.config.accounting.path.as_deref()).await?;
        tracing::info!(
            records = accounting.len(),
            path = ?accounting.path(),
            "Opened accounting store"
        );

        let credentials = CredentialInjector::signing(
            CONTROLLER_SUBJECT,
            self.authority.clone(),
            Duration::from_secs(self.config.auth.internal_token_lifetime_secs),
        );
        let client = Arc::new(GrpcNodeClient::new(
            credentials,
            self.config.dispatch.launch_timeout(),
        ));

        let (controller, handle) = Controller::new(self.config.clone(), client, accounting);
        let controller_shutdown = shutdown.clone();
        let controller_task = tokio::spawn(async move {
            controller.run(controller_shutdown).await;
        });

        if let Some(gateway_addr) = self.config.gateway_addr {
            let state = GatewayState {
                controller: handle.clone(),
                authority: self.authority.clone(),
            };
            let gateway_shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_gateway(gateway_addr, state, gateway_shutdown).await;
            });
        }

        let server = GrpcServer::new(
            self.config.listen_addr,
            handle,
            self.authority,
            self.config.registry.heartbeat_interval_ms,
        );
        let result = server.run(shutdown.clone()).await;

        // A failed server still takes the controller down with it.
        shutdown.cancel();
        if let Err(e) = controller_task.await {
            tracing::error!(error = %e, "Controller task failed");
        }
        result
    }
}
