use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use harbor_p2p::peers::{AddressManager, PeerInfo};
use harbor_storage::error::StorageError;
use harbor_storage::store::AddressManagerStore;

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn ip(addr: &str) -> SocketAddr {
    addr.parse().unwrap()
}

fn deterministic_manager() -> AddressManager {
    let mut manager = AddressManager::new();
    manager.make_deterministic();
    manager
}

#[test]
fn store_starts_empty() {
    let store = AddressManagerStore::open_in_memory().unwrap();

    assert!(store.is_empty().unwrap());
    assert!(matches!(
        store.deserialize(),
        Err(StorageError::MissingMetadata { key: "key" })
    ));
}

#[test]
fn store_round_trip() {
    let mut manager = deterministic_manager();
    let current = now();
    let source = ip("252.5.1.1:8333");

    let peers = [
        PeerInfo {
            address: ip("250.7.1.1:8333"),
            timestamp: current - 10_000,
        },
        PeerInfo {
            address: ip("250.8.2.2:9999"),
            timestamp: current - 20_000,
        },
        PeerInfo {
            address: ip("250.9.3.3:9999"),
            timestamp: current - 30_000,
        },
    ];
    assert!(manager.add_to_new_table_at(&peers, Some(source), 0, current));
    manager
        .mark_good_at(&ip("250.7.1.1:8333"), true, current)
        .unwrap();

    let mut store = AddressManagerStore::open_in_memory().unwrap();
    store.serialize(&manager).unwrap();
    assert!(!store.is_empty().unwrap());

    let (restored, lost) = store.deserialize().unwrap();
    assert_eq!(lost, 0);
    assert_eq!(restored.size(), manager.size());
    assert_eq!(restored.new_count(), manager.new_count());
    assert_eq!(restored.tried_count(), manager.tried_count());
    assert_eq!(restored.key(), manager.key());
    restored.consistency_check().unwrap();

    for peer in &peers {
        let original = manager.find(&peer.address).unwrap();
        let recovered = restored.find(&peer.address).unwrap();
        assert_eq!(recovered.address, original.address);
        assert_eq!(recovered.source, original.source);
        assert_eq!(recovered.timestamp, original.timestamp);
        assert_eq!(recovered.last_try, original.last_try);
        assert_eq!(recovered.last_success, original.last_success);
        assert_eq!(recovered.num_attempts, original.num_attempts);
        assert_eq!(recovered.ref_count, original.ref_count);
        assert_eq!(recovered.is_tried, original.is_tried);
    }

    // Selection over the restored book eventually serves every endpoint.
    let mut restored = restored;
    let mut seen: Vec<SocketAddr> = Vec::new();
    for _ in 0..500 {
        if let Some(record) = restored.select_peer(false) {
            if !seen.contains(&record.address) {
                seen.push(record.address);
            }
            if seen.len() == peers.len() {
                break;
            }
        }
    }
    assert_eq!(seen.len(), peers.len());
}

#[test]
fn store_snapshot_is_replaced_atomically() {
    let mut manager = deterministic_manager();
    let current = now();

    let first = [PeerInfo {
        address: ip("250.7.1.1:8444"),
        timestamp: current,
    }];
    manager.add_to_new_table_at(&first, None, 0, current);

    let mut store = AddressManagerStore::open_in_memory().unwrap();
    store.serialize(&manager).unwrap();

    let second = [PeerInfo {
        address: ip("250.8.1.1:8444"),
        timestamp: current,
    }];
    manager.add_to_new_table_at(&second, None, 0, current);
    store.serialize(&manager).unwrap();

    // Only the latest snapshot is visible.
    let (restored, _) = store.deserialize().unwrap();
    assert_eq!(restored.size(), manager.size());
    restored.consistency_check().unwrap();
}

#[test]
fn store_clear_forgets_the_snapshot() {
    let mut manager = deterministic_manager();
    let current = now();

    manager.add_to_new_table_at(
        &[PeerInfo {
            address: ip("250.7.1.1:8444"),
            timestamp: current,
        }],
        None,
        0,
        current,
    );

    let mut store = AddressManagerStore::open_in_memory().unwrap();
    store.serialize(&manager).unwrap();
    assert!(!store.is_empty().unwrap());

    store.clear().unwrap();
    assert!(store.is_empty().unwrap());
}

#[test]
fn store_round_trip_preserves_a_large_book() {
    let mut manager = deterministic_manager();
    let current = now();

    for i in 1..=100u32 {
        let address = format!("250.{}.1.1:8444", i);
        let peers = [PeerInfo {
            address: ip(&address),
            timestamp: current,
        }];
        manager.add_to_new_table_at(&peers, Some(ip("252.5.1.1:8333")), 0, current);
        if i % 5 == 0 && manager.find(&ip(&address)).is_some() {
            manager.mark_good_at(&ip(&address), true, current).unwrap();
        }
    }
    manager.resolve_tried_collisions_at(current);
    manager.consistency_check().unwrap();

    let mut store = AddressManagerStore::open_in_memory().unwrap();
    store.serialize(&manager).unwrap();
    let (restored, lost) = store.deserialize().unwrap();

    assert_eq!(lost, 0);
    assert_eq!(restored.size(), manager.size());
    assert_eq!(restored.tried_count(), manager.tried_count());
    restored.consistency_check().unwrap();
}
