//! Cluster topology tracking
//!
//! Brokers are only ever appended: index 0 is the bootstrap broker that
//! answers metadata requests for the whole session.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::SessionError;
use crate::protocol::{
    BrokerMetadata, MetadataRequest, MetadataResponse, NodeId, PartitionId, Request,
    TopicPartition,
};
use crate::session::{Outcome, SessionState};
use crate::Result;

/// Broker identity derived from its `host:port` address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrokerId(String);

impl BrokerId {
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("{}:{}", host, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A known broker and the connection the session owns to it
#[derive(Debug, Clone)]
pub(crate) struct Broker {
    pub(crate) id: BrokerId,
    pub(crate) node_id: Option<NodeId>,
    pub(crate) connection: Arc<dyn Connection>,
}

/// Snapshot of the cluster as reported by the last successful metadata refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterMetadata {
    brokers: Vec<BrokerMetadata>,
    leaders: HashMap<TopicPartition, BrokerId>,
}

impl ClusterMetadata {
    /// Build the leader map of a metadata response. Leaderless partitions and
    /// partitions whose leader is not among the returned brokers are left out.
    pub fn from_response(response: &MetadataResponse) -> Self {
        let nodes: HashMap<NodeId, BrokerId> = response
            .brokers
            .iter()
            .filter_map(|broker| {
                u16::try_from(broker.port)
                    .ok()
                    .map(|port| (broker.node_id, BrokerId::new(&broker.host, port)))
            })
            .collect();

        let mut leaders = HashMap::new();
        for topic in &response.topics {
            for partition in &topic.partitions {
                if let Some(leader) = nodes.get(&partition.leader) {
                    leaders.insert(
                        TopicPartition::new(topic.topic.clone(), partition.partition),
                        leader.clone(),
                    );
                }
            }
        }

        Self {
            brokers: response.brokers.clone(),
            leaders,
        }
    }

    pub fn leader(&self, topic: &str, partition: PartitionId) -> Option<&BrokerId> {
        self.leaders
            .get(&TopicPartition::new(topic, partition))
    }

    /// Brokers reported by the cluster
    pub fn brokers(&self) -> &[BrokerMetadata] {
        &self.brokers
    }

    /// Known partitions with their leader
    pub fn partitions(&self) -> impl Iterator<Item = (&TopicPartition, &BrokerId)> {
        self.leaders.iter()
    }

    /// Number of partitions with a known leader
    pub fn partition_count(&self) -> usize {
        self.leaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaders.is_empty()
    }

    /// Forget the leader of one partition; returns whether an entry was dropped
    pub(crate) fn invalidate(&mut self, topic: &str, partition: PartitionId) -> bool {
        self.leaders
            .remove(&TopicPartition::new(topic, partition))
            .is_some()
    }
}

impl SessionState {
    /// Fetch cluster metadata from the bootstrap broker and replace the cached
    /// topology. On failure the previous topology is kept.
    pub(crate) async fn refresh_metadata(&mut self) -> Result<()> {
        let bootstrap = self
            .bootstrap_broker()
            .ok_or(SessionError::NoBrokersAvailable)?;

        let response: MetadataResponse = self
            .send_to(&bootstrap, Request::Metadata(MetadataRequest::default()))
            .await?;

        for broker in &response.brokers {
            let port = match u16::try_from(broker.port) {
                Ok(port) => port,
                Err(_) => {
                    warn!(
                        "Ignoring broker {} with invalid port {}",
                        broker.node_id, broker.port
                    );
                    continue;
                }
            };
            self.register_broker(&broker.host, port, Some(broker.node_id))?;
        }

        self.cluster = ClusterMetadata::from_response(&response);
        debug!(
            "Cluster metadata refreshed: {} brokers, {} partitions",
            self.cluster.brokers().len(),
            self.cluster.partition_count()
        );
        Ok(())
    }

    /// Leader of a partition, refreshing metadata once on a cache miss
    pub(crate) async fn resolve_leader(
        &mut self,
        topic: &str,
        partition: PartitionId,
    ) -> Outcome<BrokerId> {
        if let Some(leader) = self.cluster.leader(topic, partition) {
            return Outcome::Completed(leader.clone());
        }

        if let Err(e) = self.refresh_metadata().await {
            warn!(
                "Metadata refresh failed while resolving leader of {}:{}: {}",
                topic, partition, e
            );
        }

        match self.cluster.leader(topic, partition) {
            Some(leader) => Outcome::Completed(leader.clone()),
            None => Outcome::TopicNotFound,
        }
    }

    /// Add a broker unless it is already known, opening a connection to it
    pub(crate) fn register_broker(
        &mut self,
        host: &str,
        port: u16,
        node_id: Option<NodeId>,
    ) -> Result<BrokerId> {
        let id = BrokerId::new(host, port);

        if let Some(existing) = self.brokers.iter_mut().find(|b| b.id == id) {
            if node_id.is_some() && existing.node_id != node_id {
                debug!("Broker {} is node {:?}", id, node_id);
                existing.node_id = node_id;
            }
            return Ok(id);
        }

        let connection = self.connector.open_connection(host, port)?;
        info!("Discovered broker {}", id);
        self.brokers.push(Broker {
            id: id.clone(),
            node_id,
            connection,
        });
        Ok(id)
    }

    pub(crate) fn bootstrap_broker(&self) -> Option<BrokerId> {
        self.brokers.first().map(|b| b.id.clone())
    }
}
