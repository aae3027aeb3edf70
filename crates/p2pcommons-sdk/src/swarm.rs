//! Peer discovery and replication.
//!
//! The engine only talks to [`SwarmNetworker`]. [`MemorySwarm`] is an
//! in-process networker: every swarm created from the same
//! [`MemoryNetwork`] is a peer, and replication copies signed log entries
//! from peers announcing a discovery key into the local replica.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use p2pcommons_meta::{DiscoveryKey, JoinOptions};
use tracing::{debug, info};

use crate::drive::Drive;
use crate::error::SwarmError;

/// Swarm membership and replication for module drives.
#[async_trait]
pub trait SwarmNetworker: Send + Sync {
    /// Joins the topic of `drive`. With `announce`, peers can replicate from it.
    async fn join(&self, drive: Arc<dyn Drive>, options: JoinOptions) -> Result<(), SwarmError>;

    /// Leaves the topic of `dkey`.
    async fn leave(&self, dkey: &DiscoveryKey) -> Result<(), SwarmError>;

    /// Pulls entries the peers of `drive`'s topic have and it lacks.
    /// Returns the number of entries appended.
    async fn replicate(&self, drive: &dyn Drive) -> Result<u64, SwarmError>;

    /// Leaves every topic.
    async fn close(&self) -> Result<(), SwarmError>;
}

type PeerId = u64;

/// Shared topic table connecting in-process peers.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    topics: Arc<DashMap<DiscoveryKey, Vec<(PeerId, Arc<dyn Drive>)>>>,
    next_peer: Arc<AtomicU64>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new peer on this network.
    pub fn swarm(&self) -> MemorySwarm {
        let peer = self.next_peer.fetch_add(1, Ordering::Relaxed);
        MemorySwarm {
            peer,
            network: self.clone(),
            joined: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of peers announcing `dkey`.
    pub fn announcers(&self, dkey: &DiscoveryKey) -> usize {
        self.topics.get(dkey).map(|peers| peers.len()).unwrap_or(0)
    }

    fn withdraw(&self, peer: PeerId, dkey: &DiscoveryKey) {
        if let Some(mut peers) = self.topics.get_mut(dkey) {
            peers.retain(|(id, _)| *id != peer);
        }
        self.topics.remove_if(dkey, |_, peers| peers.is_empty());
    }
}

/// One in-process peer.
pub struct MemorySwarm {
    peer: PeerId,
    network: MemoryNetwork,
    joined: DashMap<DiscoveryKey, JoinOptions>,
    closed: AtomicBool,
}

impl MemorySwarm {
    /// Topics this peer has joined.
    pub fn topics(&self) -> Vec<DiscoveryKey> {
        self.joined.iter().map(|e| *e.key()).collect()
    }

    fn ensure_open(&self) -> Result<(), SwarmError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SwarmError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl SwarmNetworker for MemorySwarm {
    async fn join(&self, drive: Arc<dyn Drive>, options: JoinOptions) -> Result<(), SwarmError> {
        self.ensure_open()?;
        let dkey = drive.discovery_key();
        self.joined.insert(dkey, options);
        if options.announce {
            let mut peers = self.network.topics.entry(dkey).or_default();
            peers.retain(|(id, _)| *id != self.peer);
            peers.push((self.peer, drive));
        }
        debug!(peer = self.peer, dkey = %dkey, announce = options.announce, "joined topic");
        Ok(())
    }

    async fn leave(&self, dkey: &DiscoveryKey) -> Result<(), SwarmError> {
        self.joined.remove(dkey);
        self.network.withdraw(self.peer, dkey);
        debug!(peer = self.peer, dkey = %dkey, "left topic");
        Ok(())
    }

    async fn replicate(&self, drive: &dyn Drive) -> Result<u64, SwarmError> {
        self.ensure_open()?;
        let dkey = drive.discovery_key();
        let peers: Vec<Arc<dyn Drive>> = self
            .network
            .topics
            .get(&dkey)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|(id, _)| *id != self.peer)
                    .map(|(_, d)| Arc::clone(d))
                    .collect()
            })
            .unwrap_or_default();

        let mut added = 0;
        for remote in peers {
            let local_version = drive.version().await;
            if remote.version().await <= local_version {
                continue;
            }
            let entries = match remote.export_log(local_version).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(dkey = %dkey, error = %e, "peer could not export log");
                    continue;
                }
            };
            added += drive.import_log(local_version, entries).await?;
        }
        Ok(added)
    }

    async fn close(&self) -> Result<(), SwarmError> {
        self.closed.store(true, Ordering::Release);
        let topics = self.topics();
        for dkey in &topics {
            self.leave(dkey).await?;
        }
        info!(peer = self.peer, topics = topics.len(), "swarm closed");
        Ok(())
    }
}
