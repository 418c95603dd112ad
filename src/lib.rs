pub mod accounting;
pub mod auth;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod grpc;
pub mod ledger;
pub mod registry;
pub mod resources;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("wlm");
}
