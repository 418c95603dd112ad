pub mod client_service;
pub mod convert;
pub mod interceptor;
pub mod node_service;
pub mod server;

pub use server::GrpcServer;
