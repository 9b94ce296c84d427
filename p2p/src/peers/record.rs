//! Per-peer reputation records.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::{calculate_bucket_position, calculate_new_bucket, calculate_tried_bucket};

/// How many days an address may go unseen before it is dropped from gossip
const HORIZON_DAYS: i64 = 30;
/// Failed attempts tolerated for a peer that has never completed a handshake
const MAX_RETRIES: u32 = 3;
/// Days without a success over which `MAX_FAILURES` is counted
const MIN_FAIL_DAYS: i64 = 7;
/// Failed attempts tolerated since the last successful handshake
const MAX_FAILURES: u32 = 10;

/// Peer information being exchanged with the rest of the node: an address
/// plus the last time the peer was known to be alive.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PeerInfo {
    /// The socket address for a potential peer
    pub address: SocketAddr,
    /// Seconds since epoch when the peer was last known to be alive
    pub timestamp: i64,
}

/// Reputation state attached to a single known peer address.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PeerRecord {
    /// The peer address this record tracks
    pub address: SocketAddr,
    /// The address that first advertised this peer (may be the peer itself)
    pub source: SocketAddr,
    /// Seconds since epoch when the peer was last known to be alive
    pub timestamp: i64,
    /// Last connection attempt, 0 when never attempted
    pub last_try: i64,
    /// Last successful handshake, 0 when never connected
    pub last_success: i64,
    /// Consecutive failed attempts since the last success
    pub num_attempts: u32,
    /// How many new-table cells currently reference this record
    #[serde(skip)]
    pub ref_count: u8,
    /// Whether the record lives in the tried table
    #[serde(skip)]
    pub is_tried: bool,
    /// Index of this record in the random-access list
    #[serde(skip)]
    pub random_pos: usize,
}

impl PeerRecord {
    /// Create a fresh record for a peer advertised by `source`.
    pub fn new(peer: PeerInfo, source: SocketAddr) -> Self {
        PeerRecord {
            address: peer.address,
            source,
            timestamp: peer.timestamp,
            last_try: 0,
            last_success: 0,
            num_attempts: 0,
            ref_count: 0,
            is_tried: false,
            random_pos: 0,
        }
    }

    /// Timestamped view of the record handed out to collaborators.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            address: self.address,
            timestamp: self.timestamp,
        }
    }

    /// Tried-table bucket of this record.
    pub fn tried_bucket(&self, sk: &[u8; 32]) -> usize {
        calculate_tried_bucket(sk, &self.address)
    }

    /// New-table bucket of this record, derived from the stored source.
    pub fn new_bucket(&self, sk: &[u8; 32]) -> usize {
        calculate_new_bucket(sk, &self.address, &self.source)
    }

    /// Position of this record inside `bucket`.
    pub fn bucket_position(&self, sk: &[u8; 32], is_tried: bool, bucket: usize) -> usize {
        calculate_bucket_position(sk, is_tried, bucket, &self.address)
    }

    /// Whether the record is too stale or too flaky to be gossiped or kept
    /// over a fresher candidate.
    pub fn is_terrible(&self, now: i64) -> bool {
        // never throw away something tried in the last minute
        if self.last_try > 0 && self.last_try >= now - 60 {
            return false;
        }
        // timestamps from the future
        if self.timestamp > now + 10 * 60 {
            return true;
        }
        // not seen in recent history
        if self.timestamp == 0 || now - self.timestamp > HORIZON_DAYS * 24 * 60 * 60 {
            return true;
        }
        // tried a few times and never a success
        if self.last_success == 0 && self.num_attempts >= MAX_RETRIES {
            return true;
        }
        // too many failures since the last success
        if now - self.last_success > MIN_FAIL_DAYS * 24 * 60 * 60 && self.num_attempts >= MAX_FAILURES
        {
            return true;
        }

        false
    }

    /// Relative chance that selection accepts this record, in `(0, 1]`.
    /// Recently attempted records are heavily deprioritized, and every failed
    /// attempt shaves off a third, down to a floor after 8 failures.
    pub fn selection_chance(&self, now: i64) -> f64 {
        let mut chance = 1.0;

        let since_last_try = (now - self.last_try).max(0);
        if since_last_try < 10 * 60 {
            chance *= 0.01;
        }

        chance * 0.66_f64.powi(self.num_attempts.min(8) as i32)
    }
}
