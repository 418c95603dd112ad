//! Launching jobs on node agents and tearing them down again.
//!
//! The controller never waits on a node. Every launch and terminate call runs
//! on its own task under a timeout, and its outcome comes back to the
//! controller as a [`DispatchEvent`].

pub mod client;
pub mod dispatcher;

pub use client::{GrpcNodeClient, LaunchSpec, NodeClient, NodeEndpoint};
pub use dispatcher::{DispatchEvent, DispatchHandle, Dispatcher};
