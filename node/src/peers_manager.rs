//! Peers manager service: owns the address manager behind a single
//! async-aware lock, seeds it from configuration, rehydrates it from storage
//! on startup and snapshots it back periodically.
//!
//! During the execution of the node there are at least two ways in which
//! peers are discovered:
//!   + peer lists relayed by already connected nodes
//!   + incoming connections to the node
//!
//! Both paths go through [`PeersManager::add_to_new_table`]; the connection
//! layer reports outcomes through [`PeersManager::attempt`] and
//! [`PeersManager::mark_good`].

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::Mutex;

use harbor_config::Config;
use harbor_p2p::peers::{AddressManager, PeerInfo, PeerRecord};
use harbor_storage::error::StorageError;
use harbor_storage::store::AddressManagerStore;

/// Service wrapping the address manager behind a single coarse lock. Every
/// operation holds the lock from entry to return, so a sequence of calls on
/// one task observes its own effects in order.
pub struct PeersManager {
    address_manager: Mutex<AddressManager>,
    store: Mutex<AddressManagerStore>,
}

impl PeersManager {
    /// Build the service from configuration, rehydrating the address book
    /// from `store` when it holds a snapshot and seeding the configured
    /// known peers. A corrupt snapshot is logged and replaced by a fresh
    /// address book; any other storage failure propagates.
    pub async fn from_store(
        config: &Config,
        store: AddressManagerStore,
    ) -> Result<Self, StorageError> {
        let mut manager = if store.is_empty()? {
            AddressManager::from_config(config)
        } else {
            match store.deserialize() {
                Ok((manager, _lost)) => {
                    log::info!("Recovered {} peer records from storage", manager.size());
                    manager
                }
                Err(StorageError::Integrity(error)) => {
                    log::error!(
                        "Stored address book is corrupt, rebuilding from scratch: {}",
                        error
                    );
                    AddressManager::from_config(config)
                }
                Err(error) => return Err(error),
            }
        };
        if config.connections.allow_private_addresses {
            manager.allow_private_addresses();
        }

        let known_peers: Vec<PeerInfo> = config
            .connections
            .known_peers
            .iter()
            .map(|address| PeerInfo {
                address: *address,
                timestamp: 0,
            })
            .collect();
        if !known_peers.is_empty() {
            log::info!(
                "Adding the following peer addresses from config: {:?}",
                config.connections.known_peers
            );
            manager.add_to_new_table(&known_peers, None, 0);
        }

        Ok(PeersManager {
            address_manager: Mutex::new(manager),
            store: Mutex::new(store),
        })
    }

    /// Insert a batch of advertised peers into the new table. `time_penalty`
    /// follows the source of the batch: addresses relayed by an ordinary
    /// peer carry `config.connections.peer_source_time_penalty_seconds`,
    /// addresses from an introducer carry zero.
    pub async fn add_to_new_table(
        &self,
        peers: &[PeerInfo],
        source: Option<SocketAddr>,
        time_penalty: i64,
    ) -> bool {
        self.address_manager
            .lock()
            .await
            .add_to_new_table(peers, source, time_penalty)
    }

    /// Record a successful handshake with `address`. Unknown peers are
    /// logged and ignored: cleanup may have trimmed a record the connection
    /// layer still remembers.
    pub async fn mark_good(&self, address: &SocketAddr, test_before_evict: bool) {
        if let Err(error) = self
            .address_manager
            .lock()
            .await
            .mark_good(address, test_before_evict)
        {
            log::debug!("mark_good ignored: {}", error);
        }
    }

    /// Record a connection attempt towards `address`. Unknown peers are
    /// logged and ignored.
    pub async fn attempt(&self, address: &SocketAddr, count_failure: bool) {
        if let Err(error) = self
            .address_manager
            .lock()
            .await
            .attempt(address, count_failure)
        {
            log::debug!("attempt ignored: {}", error);
        }
    }

    /// Candidate peer to dial next.
    pub async fn select_peer(&self, new_only: bool) -> Option<PeerRecord> {
        self.address_manager.lock().await.select_peer(new_only)
    }

    /// Incumbent of a pending tried-table collision that should be probed.
    pub async fn select_tried_collision(&self) -> Option<PeerRecord> {
        self.address_manager.lock().await.select_tried_collision()
    }

    /// Resolve the pending tried-table collisions using the probe outcomes
    /// recorded so far.
    pub async fn resolve_tried_collisions(&self) {
        self.address_manager.lock().await.resolve_tried_collisions()
    }

    /// Addresses to gossip to other nodes.
    pub async fn get_peers(&self) -> Vec<PeerInfo> {
        self.address_manager.lock().await.get_peers()
    }

    /// Number of live records in the address book.
    pub async fn size(&self) -> usize {
        self.address_manager.lock().await.size()
    }

    /// Drop records that keep failing and have not been attempted recently.
    pub async fn cleanup(&self, max_age_seconds: i64, max_consecutive_failures: u32) {
        self.address_manager
            .lock()
            .await
            .cleanup(max_age_seconds, max_consecutive_failures)
    }

    /// Snapshot the address book into the store.
    pub async fn persist(&self) -> Result<(), StorageError> {
        let manager = self.address_manager.lock().await;
        let mut store = self.store.lock().await;

        store.serialize(&manager)
    }

    /// Periodically snapshot the address book. Meant to be spawned as a
    /// background task; runs until the task is dropped.
    pub async fn run_periodic_persistence(&self, period: Duration) {
        loop {
            tokio::time::sleep(period).await;
            match self.persist().await {
                Ok(()) => log::debug!("Peers manager successfully persisted peers to storage"),
                Err(error) => {
                    log::error!("Peers manager persist peers to storage failed: {}", error)
                }
            }
        }
    }
}
