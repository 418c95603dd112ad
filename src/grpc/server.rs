use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::auth::TokenAuthority;
use crate::controller::ControllerHandle;
use crate::grpc::client_service::ClientService;
use crate::grpc::interceptor::AuthInterceptor;
use crate::grpc::node_service::NodeProtocolService;
use crate::proto::node_service_server::NodeServiceServer;
use crate::proto::workload_service_server::WorkloadServiceServer;

/// The controller's gRPC endpoint: the client API and the node protocol,
/// both behind token authentication.
pub struct GrpcServer {
    addr: SocketAddr,
    controller: ControllerHandle,
    authority: Arc<TokenAuthority>,
    heartbeat_interval_ms: u64,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        controller: ControllerHandle,
        authority: Arc<TokenAuthority>,
        heartbeat_interval_ms: u64,
    ) -> Self {
        Self {
            addr,
            controller,
            authority,
            heartbeat_interval_ms,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> crate::error::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener, e.g. one on port 0 in tests.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> crate::error::Result<()> {
        let interceptor = AuthInterceptor::new(self.authority.clone());
        let client_service = ClientService::new(self.controller.clone());
        let node_service = NodeProtocolService::new(self.controller, self.heartbeat_interval_ms);

        tracing::info!(addr = %listener.local_addr()?, "Starting gRPC server");

        Server::builder()
            .add_service(WorkloadServiceServer::with_interceptor(
                client_service,
                interceptor.clone(),
            ))
            .add_service(NodeServiceServer::with_interceptor(node_service, interceptor))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await?;
        tracing::info!("gRPC server stopped");
        Ok(())
    }
}
