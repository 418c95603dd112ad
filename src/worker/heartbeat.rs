use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::grpc::convert::{node_state_from_proto, node_state_to_proto};
use crate::proto::HeartbeatRequest;
use crate::registry::NodeState;
use crate::resources::ResourceVector;
use crate::worker::ControllerClient;

/// Heartbeat sender that periodically reports this node to the controller
pub struct HeartbeatSender {
    node_id: String,
    address: Option<String>,
    capacity: ResourceVector,
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(node_id: impl Into<String>, capacity: ResourceVector, interval_ms: u64) -> Self {
        Self {
            node_id: node_id.into(),
            address: None,
            capacity,
            interval: Duration::from_millis(interval_ms.max(1)),
        }
    }

    /// Advertise the agent address with every beat.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Every heartbeat carries the capacity and address so a controller that
    /// lost track of this node can re-create it.
    pub fn request(&self, now: DateTime<Utc>) -> HeartbeatRequest {
        HeartbeatRequest {
            node_id: self.node_id.clone(),
            observed_state: node_state_to_proto(NodeState::Up) as i32,
            sent_at_ms: now.timestamp_millis(),
            capacity: Some(self.capacity.into()),
            address: self.address.clone().unwrap_or_default(),
        }
    }

    /// Send heartbeats until `shutdown` is cancelled.
    pub async fn run(&self, mut client: ControllerClient, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match client.heartbeat(self.request(Utc::now())).await {
                Ok(response) => {
                    let response = response.into_inner();
                    if !response.accepted {
                        tracing::debug!(node_id = %self.node_id, "Controller ignored stale heartbeat");
                    }
                    let state = node_state_from_proto(response.state);
                    if state != NodeState::Up {
                        tracing::debug!(node_id = %self.node_id, state = %state, "Controller reports node state");
                    }
                }
                Err(status) => {
                    tracing::warn!(node_id = %self.node_id, error = %status, "Heartbeat failed");
                }
            }
        }
        tracing::info!(node_id = %self.node_id, "Heartbeat sender stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto;

    #[test]
    fn request_carries_capacity_and_send_time() {
        let sender = HeartbeatSender::new("n1", ResourceVector::new(4, 8192, 1), 500);
        let now = Utc::now();
        let req = sender.request(now);

        assert_eq!(req.node_id, "n1");
        assert_eq!(req.observed_state, proto::NodeState::Up as i32);
        assert_eq!(req.sent_at_ms, now.timestamp_millis());
        let capacity: ResourceVector = req.capacity.unwrap().into();
        assert_eq!(capacity, ResourceVector::new(4, 8192, 1));
        assert_eq!(sender.interval(), Duration::from_millis(500));
        assert!(req.address.is_empty());

        let req = sender.with_address("10.0.0.7:6818").request(now);
        assert_eq!(req.address, "10.0.0.7:6818");
    }

    #[test]
    fn zero_interval_is_clamped() {
        let sender = HeartbeatSender::new("n1", ResourceVector::ZERO, 0);
        assert_eq!(sender.interval(), Duration::from_millis(1));
    }
}
