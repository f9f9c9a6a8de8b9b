//! gRPC surface for the authentication gate.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::AuthGuardServiceImpl;

// Include the generated protobuf code
pub mod proto {
    pub mod authguard {
        pub mod v1 {
            tonic::include_proto!("authguard.v1");
        }
    }
}

// Re-export commonly used types
pub use proto::authguard::v1::{
    auth_guard_client::AuthGuardClient, auth_guard_server::AuthGuardServer, CheckRequest,
    CheckResponse, Outcome, Reason,
};
