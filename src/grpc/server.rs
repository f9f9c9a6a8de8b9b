//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::authguard::v1::auth_guard_server::AuthGuardServer;
use super::service::AuthGuardServiceImpl;
use crate::error::{AuthGuardError, Result};
use crate::ratelimit::{Clock, RateLimiterEngine};

/// gRPC server for the authentication gate.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Service handling `Check` calls
    service: AuthGuardServiceImpl,
}

impl GrpcServer {
    /// Create a new gRPC server around an engine.
    pub fn new(addr: SocketAddr, engine: Arc<RateLimiterEngine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            addr,
            service: AuthGuardServiceImpl::new(engine, clock),
        }
    }

    /// Let callers supply the evaluation instant in `CheckRequest.now`.
    pub fn accept_client_time(mut self, accept: bool) -> Self {
        self.service = self.service.accept_client_time(accept);
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the gRPC server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        info!(
            addr = %self.addr,
            "Starting gRPC server for AuthGuard"
        );

        Server::builder()
            .add_service(AuthGuardServer::new(self.service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                AuthGuardError::Grpc(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::{AuthGuardClient, CheckRequest, Outcome};
    use crate::ratelimit::SystemClock;
    use crate::store::MemoryAttemptStore;
    use std::time::Duration;

    fn engine() -> Arc<RateLimiterEngine> {
        Arc::new(RateLimiterEngine::new(
            Arc::new(MemoryAttemptStore::new()),
            Arc::new(SystemClock),
        ))
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:50051".parse().unwrap();
        let server = GrpcServer::new(addr, engine(), Arc::new(SystemClock));
        assert_eq!(server.addr(), addr);
    }

    #[tokio::test]
    async fn test_serve_and_check_over_the_wire() {
        // Reserve a free port, then hand it to the server.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server = GrpcServer::new(addr, engine(), Arc::new(SystemClock));
        let handle = tokio::spawn(server.serve_with_shutdown(async {
            let _ = shutdown_rx.await;
        }));

        let mut client = None;
        for _ in 0..50 {
            match AuthGuardClient::connect(format!("http://{addr}")).await {
                Ok(c) => {
                    client = Some(c);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        let mut client = client.expect("server did not come up");

        let response = client
            .check(CheckRequest {
                email: "test@ocupop.com".to_string(),
                ip: "127.0.0.1".to_string(),
                now: None,
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.outcome(), Outcome::Allowed);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
