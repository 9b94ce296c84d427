//! Library for managing a list of known peer addresses, partitioned into the
//! "new" and "tried" tables so that no single referrer can flush the whole
//! list with fabricated endpoints.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use rand::{rngs::StdRng, seq::SliceRandom, Rng, RngCore, SeedableRng};

use harbor_config::Config;
use harbor_crypto::hash::calculate_sha256;
use harbor_util::timestamp::get_timestamp;

mod buckets;
pub mod error;
mod record;

use buckets::BucketTable;
pub use error::PeersError;
pub use record::{PeerInfo, PeerRecord};

/// Number of buckets in the new table
pub const NEW_BUCKET_COUNT: usize = 1024;
/// Number of buckets in the tried table
pub const TRIED_BUCKET_COUNT: usize = 256;
/// Positions per bucket
pub const BUCKET_SIZE: usize = 64;
/// Maximum number of new-table cells a single record may occupy
pub const NEW_BUCKETS_PER_ADDRESS: u8 = 8;

/// Tried buckets reachable from a single address group
const TRIED_BUCKETS_PER_GROUP: u64 = 8;
/// New buckets reachable from a single source group
const NEW_BUCKETS_PER_SOURCE_GROUP: u64 = 64;
/// Maximum number of unresolved tried-table collisions kept pending
const MAX_TRIED_COLLISIONS: usize = 10;
/// Seconds for which a last success vouches for an incumbent during
/// collision resolution
const REPLACEMENT_SECONDS: i64 = 4 * 60 * 60;
/// Window within which an incumbent's last attempt counts as recent
const TEST_WINDOW_SECONDS: i64 = 40 * 60;
/// Selection rounds before `select_peer` gives up
const SELECT_MAX_ROUNDS: usize = 64;
/// Upper bound on the number of addresses handed out by `get_peers`
const MAX_GET_PEERS: usize = 1000;

/// Parse a textual host and port into a peer address.
pub fn parse_peer_address(host: &str, port: u16) -> Result<SocketAddr, PeersError> {
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| PeersError::InvalidEndpoint {
            endpoint: format!("{}:{}", host, port),
        })
}

/// The IPv4 address embedded in an IPv4-mapped IPv6 address, if any.
fn mapped_ipv4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    let octets = ip.octets();
    if octets[..10].iter().all(|&octet| octet == 0) && octets[10] == 0xff && octets[11] == 0xff {
        Some(Ipv4Addr::new(
            octets[12], octets[13], octets[14], octets[15],
        ))
    } else {
        None
    }
}

fn is_valid_ipv4(ip: Ipv4Addr, allow_private: bool) -> bool {
    if ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
    {
        return false;
    }

    allow_private || !ip.is_private()
}

fn is_valid_ipv6(ip: Ipv6Addr, allow_private: bool) -> bool {
    if ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() {
        return false;
    }
    let segments = ip.segments();
    // link-local, fe80::/10
    if (segments[0] & 0xffc0) == 0xfe80 {
        return false;
    }
    // unique-local, fc00::/7
    if (segments[0] & 0xfe00) == 0xfc00 && !allow_private {
        return false;
    }

    true
}

/// Whether an address is worth dialing. Unspecified, loopback, link-local and
/// multicast addresses are always rejected; private ranges only when
/// `allow_private` is unset. IPv4-mapped IPv6 addresses are classified by the
/// embedded IPv4 address.
pub fn is_valid_address(addr: &SocketAddr, allow_private: bool) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => is_valid_ipv4(ip, allow_private),
        IpAddr::V6(ip) => match mapped_ipv4(ip) {
            Some(v4) => is_valid_ipv4(v4, allow_private),
            None => is_valid_ipv6(ip, allow_private),
        },
    }
}

/// 18-byte lookup key of an address: the packed 16-byte IPv6 representation
/// (IPv4 goes through `::ffff:a.b.c.d`) followed by the port in big endian.
pub fn addr_key(addr: &SocketAddr) -> [u8; 18] {
    let ip6 = match addr.ip() {
        IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        IpAddr::V6(ip) => ip,
    };
    let mut key = [0u8; 18];
    key[..16].copy_from_slice(&ip6.octets());
    key[16..].copy_from_slice(&addr.port().to_be_bytes());
    key
}

fn ipv4_group(ip: Ipv4Addr) -> Vec<u8> {
    let octets = ip.octets();
    vec![0x01, octets[0], octets[1]]
}

/// Network-locality group of an address: `0x01` followed by the top two
/// octets for IPv4 (including IPv4-mapped IPv6), `0x00` followed by the top
/// four octets for IPv6. Addresses in one group share a referrer-visible
/// network prefix and are bucketed together.
pub fn addr_group(addr: &SocketAddr) -> Vec<u8> {
    match addr.ip() {
        IpAddr::V4(ip) => ipv4_group(ip),
        IpAddr::V6(ip) => match mapped_ipv4(ip) {
            Some(v4) => ipv4_group(v4),
            None => {
                let octets = ip.octets();
                vec![0x00, octets[0], octets[1], octets[2], octets[3]]
            }
        },
    }
}

/// Little-endian integer decoding of the leading digest bytes. Every modulus
/// used below is a power of two not larger than 2^10, so the first 8 bytes
/// decode to the same residue as the whole digest.
fn hash_to_u64(data: &[u8]) -> u64 {
    let digest = calculate_sha256(data);
    let mut le = [0u8; 8];
    le.copy_from_slice(&digest.0[..8]);
    u64::from_le_bytes(le)
}

/// Algorithm to calculate the bucket of an address in the tried table.
///
/// SK = secret key chosen when the node is born.
/// Key = the packed address and port.
/// Group = the peer's group.
///
/// i = Hash( SK, Key ) % 8
/// Bucket = Hash( SK, Group, i ) % 256
pub fn calculate_tried_bucket(sk: &[u8; 32], addr: &SocketAddr) -> usize {
    let key = addr_key(addr);
    let index = hash_to_u64(&[sk.as_slice(), &key].concat()) % TRIED_BUCKETS_PER_GROUP;

    let group = addr_group(addr);
    let bucket = hash_to_u64(&[sk.as_slice(), &group, &[index as u8]].concat())
        % (TRIED_BUCKET_COUNT as u64);

    bucket as usize
}

/// Algorithm to calculate the bucket of an address in the new table.
///
/// SK = secret key chosen when the node is born.
/// Group = the peer's group.
/// Src_group = the group of the peer that advertised the address.
///
/// i = Hash( SK, Src_group, Group ) % 64
/// Bucket = Hash( SK, Src_group, i ) % 1024
pub fn calculate_new_bucket(sk: &[u8; 32], addr: &SocketAddr, source: &SocketAddr) -> usize {
    let group = addr_group(addr);
    let src_group = addr_group(source);

    let index =
        hash_to_u64(&[sk.as_slice(), &src_group, &group].concat()) % NEW_BUCKETS_PER_SOURCE_GROUP;
    let bucket = hash_to_u64(&[sk.as_slice(), &src_group, &[index as u8]].concat())
        % (NEW_BUCKET_COUNT as u64);

    bucket as usize
}

/// Algorithm to calculate the position of an address inside a bucket.
///
/// Slot = Hash( SK, T, Bucket, Key ) % 64
///
/// where T is a single byte, 1 for the tried table and 0 for the new one.
pub fn calculate_bucket_position(
    sk: &[u8; 32],
    is_tried: bool,
    bucket: usize,
    addr: &SocketAddr,
) -> usize {
    let key = addr_key(addr);
    let tag: u8 = if is_tried { 1 } else { 0 };
    let bucket_bytes = (bucket as u16).to_le_bytes();

    let position = hash_to_u64(&[sk.as_slice(), &[tag], &bucket_bytes, &key].concat())
        % (BUCKET_SIZE as u64);

    position as usize
}

/// Database of known peer addresses with per-peer reputation state.
///
/// Addresses that were merely heard about live in the new table; addresses
/// with at least one successful handshake live in the tried table. Bucket
/// placement in both tables is keyed by a secret only this node knows, so
/// another node cannot aim a batch of addresses at a specific cell.
pub struct AddressManager {
    /// Secret key making bucket placement unpredictable to other nodes
    key: [u8; 32],
    /// The new table
    new_table: BucketTable,
    /// The tried table
    tried_table: BucketTable,
    /// All live records by node id
    map_info: HashMap<u64, PeerRecord>,
    /// Node id of the record tracking each known IP
    map_addr: HashMap<IpAddr, u64>,
    /// Insertion-ordered node ids for O(1) sampling and removal
    random_pos: Vec<u64>,
    /// Challengers whose promotion awaits a probe of the incumbent
    tried_collisions: Vec<u64>,
    /// Records currently referenced by the new table
    new_count: usize,
    /// Records currently in the tried table
    tried_count: usize,
    /// Monotonic source of node ids
    id_count: u64,
    /// Accept private-range addresses (test environments)
    allow_private: bool,
    rng: StdRng,
}

impl Default for AddressManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressManager {
    /// Create an empty manager with a freshly drawn secret key.
    pub fn new() -> Self {
        let mut rng = StdRng::from_entropy();
        let mut key = [0u8; 32];
        rng.fill_bytes(&mut key);

        Self::with_parts(key, rng)
    }

    /// Create an empty manager reusing a persisted secret key.
    pub fn with_key(key: [u8; 32]) -> Self {
        Self::with_parts(key, StdRng::from_entropy())
    }

    /// Create a manager configured from the node settings.
    pub fn from_config(config: &Config) -> Self {
        let mut manager = Self::new();
        manager.allow_private = config.connections.allow_private_addresses;

        manager
    }

    fn with_parts(key: [u8; 32], rng: StdRng) -> Self {
        AddressManager {
            key,
            new_table: BucketTable::new(NEW_BUCKET_COUNT),
            tried_table: BucketTable::new(TRIED_BUCKET_COUNT),
            map_info: HashMap::new(),
            map_addr: HashMap::new(),
            random_pos: Vec::new(),
            tried_collisions: Vec::new(),
            new_count: 0,
            tried_count: 0,
            id_count: 0,
            allow_private: false,
            rng,
        }
    }

    /// Accept private-range peer addresses from now on (test environments).
    pub fn allow_private_addresses(&mut self) {
        self.allow_private = true;
    }

    /// Fix the secret key and the RNG seed so that bucket placement and
    /// selection are reproducible. Only meant for tests.
    pub fn make_deterministic(&mut self) {
        self.key = [0xff; 32];
        self.rng = StdRng::seed_from_u64(0x6861_7262);
    }

    /// Total number of live records.
    pub fn size(&self) -> usize {
        self.random_pos.len()
    }

    /// Number of records currently referenced by the new table.
    pub fn new_count(&self) -> usize {
        self.new_count
    }

    /// Number of records currently in the tried table.
    pub fn tried_count(&self) -> usize {
        self.tried_count
    }

    /// The secret key bucket placement is derived from.
    pub fn key(&self) -> [u8; 32] {
        self.key
    }

    /// Record tracking `addr`, if any. Lookup ignores the port: one record
    /// tracks each known IP.
    pub fn find(&self, addr: &SocketAddr) -> Option<&PeerRecord> {
        self.map_addr
            .get(&addr.ip())
            .and_then(|node_id| self.map_info.get(node_id))
    }

    /// Insert a batch of advertised peers into the new table.
    ///
    /// Invalid endpoints are skipped. Timestamps outside a sane window are
    /// treated as "five days old". Returns true when at least one previously
    /// unknown peer was created, false when every entry was a refresh or was
    /// dropped.
    pub fn add_to_new_table(
        &mut self,
        peers: &[PeerInfo],
        source: Option<SocketAddr>,
        time_penalty: i64,
    ) -> bool {
        self.add_to_new_table_at(peers, source, time_penalty, get_timestamp())
    }

    /// Same as [`AddressManager::add_to_new_table`] with an explicit current
    /// timestamp.
    pub fn add_to_new_table_at(
        &mut self,
        peers: &[PeerInfo],
        source: Option<SocketAddr>,
        time_penalty: i64,
        now: i64,
    ) -> bool {
        let mut added = false;
        for peer in peers {
            let mut peer = *peer;
            // Gossip relays absurd timestamps; pretend those peers were last
            // seen five days ago.
            if peer.timestamp < 100_000_000 || peer.timestamp > now + 600 {
                peer.timestamp = (now - 5 * 24 * 60 * 60).max(0);
            }
            added |= self.add_single(peer, source, time_penalty, now);
        }

        if added {
            log::trace!("Added new peers: \n{}", self);
        }

        added
    }

    fn add_single(
        &mut self,
        peer: PeerInfo,
        source: Option<SocketAddr>,
        mut time_penalty: i64,
        now: i64,
    ) -> bool {
        let address = peer.address;
        if !is_valid_address(&address, self.allow_private) {
            log::debug!("Ignoring undialable peer address {}", address);
            return false;
        }

        let source = source.unwrap_or(address);
        // A peer announcing itself takes no penalty.
        if source == address {
            time_penalty = 0;
        }

        let (node_id, is_unique) = match self.map_addr.get(&address.ip()).copied() {
            Some(node_id) => {
                {
                    let info = self
                        .map_info
                        .get_mut(&node_id)
                        .expect("map_addr entries point at live records");
                    // Refresh the stored timestamp when the announcement is at
                    // least an hour fresher than what the record holds.
                    if peer.timestamp - time_penalty > info.timestamp + 60 * 60 {
                        info.timestamp = (peer.timestamp - time_penalty).max(0);
                    }
                    // Nothing left to do unless the announcement carries newer
                    // information and the record can still earn another cell.
                    if peer.timestamp <= info.timestamp
                        || info.is_tried
                        || info.ref_count >= NEW_BUCKETS_PER_ADDRESS
                    {
                        return false;
                    }
                }
                // An extra cell is 2^n times harder to earn for each cell
                // already held.
                let factor = 1u32 << self.map_info[&node_id].ref_count;
                if factor > 1 && self.rng.gen_range(0..factor) != 0 {
                    return false;
                }

                (node_id, false)
            }
            None => {
                let node_id = self.create(peer, source);
                let info = self
                    .map_info
                    .get_mut(&node_id)
                    .expect("record was just created");
                info.timestamp = (info.timestamp - time_penalty).max(0);
                self.new_count += 1;

                (node_id, true)
            }
        };

        let bucket = calculate_new_bucket(&self.key, &address, &source);
        let pos = calculate_bucket_position(&self.key, false, bucket, &address);
        if self.new_table.get(bucket, pos) == Some(node_id) {
            return is_unique;
        }

        let mut insert = self.new_table.get(bucket, pos).is_none();
        if let Some(existing_id) = self.new_table.get(bucket, pos) {
            let existing = &self.map_info[&existing_id];
            let newcomer_refs = self.map_info[&node_id].ref_count;
            // Only a terrible incumbent, or one that can afford losing a
            // duplicate cell, makes room for the newcomer.
            if existing.is_terrible(now) || (existing.ref_count > 1 && newcomer_refs == 0) {
                insert = true;
            }
        }

        if insert {
            self.clear_new_cell(bucket, pos);
            self.new_table.set(bucket, pos, node_id);
            let info = self
                .map_info
                .get_mut(&node_id)
                .expect("record survives placement");
            info.ref_count += 1;
        } else if self.map_info[&node_id].ref_count == 0 {
            self.delete_new_entry(node_id);
        }

        is_unique
    }

    /// Record a successful handshake with `addr`, promoting the record into
    /// the tried table. When the target cell is occupied and
    /// `test_before_evict` is set, the eviction is deferred until the
    /// incumbent has been probed (see
    /// [`AddressManager::resolve_tried_collisions`]).
    pub fn mark_good(
        &mut self,
        addr: &SocketAddr,
        test_before_evict: bool,
    ) -> Result<(), PeersError> {
        self.mark_good_at(addr, test_before_evict, get_timestamp())
    }

    /// Same as [`AddressManager::mark_good`] with an explicit timestamp.
    pub fn mark_good_at(
        &mut self,
        addr: &SocketAddr,
        test_before_evict: bool,
        timestamp: i64,
    ) -> Result<(), PeersError> {
        let node_id = match self.map_addr.get(&addr.ip()).copied() {
            Some(node_id) => node_id,
            None => return Err(PeersError::UnknownPeer { address: *addr }),
        };
        {
            let info = self
                .map_info
                .get_mut(&node_id)
                .expect("map_addr entries point at live records");
            // The record tracks one specific port; an IP match alone does not
            // prove this endpoint reachable.
            if info.address != *addr {
                return Err(PeersError::UnknownPeer { address: *addr });
            }
            info.last_success = timestamp;
            info.last_try = timestamp;
            info.timestamp = timestamp;
            info.num_attempts = 0;
            if info.is_tried {
                return Ok(());
            }
        }

        let bucket = calculate_tried_bucket(&self.key, addr);
        let pos = calculate_bucket_position(&self.key, true, bucket, addr);
        if test_before_evict && self.tried_table.get(bucket, pos).is_some() {
            // Defer the eviction until the incumbent has been probed.
            if self.tried_collisions.len() < MAX_TRIED_COLLISIONS
                && !self.tried_collisions.contains(&node_id)
            {
                self.tried_collisions.push(node_id);
                log::trace!("Deferred a tried-table eviction for {}", addr);
            }
        } else {
            self.make_tried(node_id);
            log::trace!("Added a tried peer: \n{}", self);
        }

        Ok(())
    }

    /// Record a connection attempt towards `addr`. A failure is only counted
    /// when the previous attempt is at least a minute older.
    pub fn attempt(&mut self, addr: &SocketAddr, count_failure: bool) -> Result<(), PeersError> {
        self.attempt_at(addr, count_failure, get_timestamp())
    }

    /// Same as [`AddressManager::attempt`] with an explicit timestamp.
    pub fn attempt_at(
        &mut self,
        addr: &SocketAddr,
        count_failure: bool,
        timestamp: i64,
    ) -> Result<(), PeersError> {
        let node_id = match self.map_addr.get(&addr.ip()).copied() {
            Some(node_id) => node_id,
            None => return Err(PeersError::UnknownPeer { address: *addr }),
        };
        let info = self
            .map_info
            .get_mut(&node_id)
            .expect("map_addr entries point at live records");
        if info.address != *addr {
            return Err(PeersError::UnknownPeer { address: *addr });
        }
        if count_failure && timestamp - info.last_try >= 60 {
            info.num_attempts += 1;
        }
        info.last_try = timestamp;

        Ok(())
    }

    /// Choose a peer to dial, biased towards fresh and reliable records.
    /// With `new_only` the tried table is never consulted.
    pub fn select_peer(&mut self, new_only: bool) -> Option<PeerRecord> {
        self.select_peer_at(new_only, get_timestamp())
    }

    /// Same as [`AddressManager::select_peer`] with an explicit timestamp.
    pub fn select_peer_at(&mut self, new_only: bool, now: i64) -> Option<PeerRecord> {
        if self.size() == 0 {
            return None;
        }
        if new_only && self.new_count == 0 {
            return None;
        }

        // Both sides populated: a fair coin picks the table.
        let use_tried = !new_only
            && self.tried_count > 0
            && (self.new_count == 0 || self.rng.gen_range(0..2) == 0);
        let table = if use_tried {
            &self.tried_table
        } else {
            &self.new_table
        };

        let occupied = table.occupied_buckets();
        if occupied.is_empty() {
            return None;
        }

        let mut chance_factor = 1.0f64;
        for _ in 0..SELECT_MAX_ROUNDS {
            let bucket = occupied[self.rng.gen_range(0..occupied.len())];
            let start = self.rng.gen_range(0..BUCKET_SIZE);
            let (_, node_id) = table
                .scan_from(bucket, start)
                .expect("occupied buckets hold at least one record");
            let info = &self.map_info[&node_id];
            if self.rng.gen::<f64>() < chance_factor * info.selection_chance(now) {
                return Some(info.clone());
            }
            // Rejected; accept more readily on the next round.
            chance_factor *= 2.0;
        }

        None
    }

    /// The incumbent of a pending tried-table collision, so the caller can
    /// probe whether it is still reachable. None when nothing is pending.
    pub fn select_tried_collision(&mut self) -> Option<PeerRecord> {
        if self.tried_collisions.is_empty() {
            return None;
        }

        let index = self.rng.gen_range(0..self.tried_collisions.len());
        let challenger_id = self.tried_collisions[index];
        let (bucket, pos) = match self.map_info.get(&challenger_id) {
            Some(challenger) => {
                let bucket = challenger.tried_bucket(&self.key);
                (bucket, challenger.bucket_position(&self.key, true, bucket))
            }
            None => {
                // The challenger vanished in the meantime; forget the entry.
                self.tried_collisions.remove(index);
                return None;
            }
        };

        let incumbent_id = self.tried_table.get(bucket, pos)?;
        self.map_info.get(&incumbent_id).cloned()
    }

    /// Resolve every pending tried-table collision: an incumbent that proved
    /// itself recently keeps the cell and the challenger is dropped,
    /// otherwise the incumbent is demoted back to the new table and the
    /// challenger takes its place. The pending list is cleared.
    pub fn resolve_tried_collisions(&mut self) {
        self.resolve_tried_collisions_at(get_timestamp())
    }

    /// Same as [`AddressManager::resolve_tried_collisions`] with an explicit
    /// timestamp.
    pub fn resolve_tried_collisions_at(&mut self, now: i64) {
        let pending = std::mem::take(&mut self.tried_collisions);
        for challenger_id in pending {
            let challenger_addr = match self.map_info.get(&challenger_id) {
                Some(challenger) => challenger.address,
                None => continue,
            };
            let bucket = calculate_tried_bucket(&self.key, &challenger_addr);
            let pos = calculate_bucket_position(&self.key, true, bucket, &challenger_addr);

            let incumbent_healthy = match self
                .tried_table
                .get(bucket, pos)
                .and_then(|incumbent_id| self.map_info.get(&incumbent_id))
            {
                Some(incumbent) => {
                    now - incumbent.last_try < TEST_WINDOW_SECONDS
                        && now - incumbent.last_success < REPLACEMENT_SECONDS
                }
                None => false,
            };

            if incumbent_healthy {
                // The challenger stays wherever it is in the new table.
                log::trace!(
                    "Collision challenger {} dropped, incumbent still reachable",
                    challenger_addr
                );
            } else {
                let _ = self.mark_good_at(&challenger_addr, false, now);
                log::trace!("Collision challenger {} promoted to tried", challenger_addr);
            }
        }
    }

    /// Addresses suitable for gossiping to other nodes: roughly 23% of the
    /// book, capped at 1000, in random order, omitting terrible records.
    pub fn get_peers(&mut self) -> Vec<PeerInfo> {
        self.get_peers_at(get_timestamp())
    }

    /// Same as [`AddressManager::get_peers`] with an explicit timestamp.
    pub fn get_peers_at(&mut self, now: i64) -> Vec<PeerInfo> {
        let target = ((self.random_pos.len() * 23 + 99) / 100).min(MAX_GET_PEERS);

        let mut node_ids = self.random_pos.clone();
        node_ids.shuffle(&mut self.rng);

        let mut peers = Vec::with_capacity(target);
        for node_id in node_ids {
            if peers.len() >= target {
                break;
            }
            let info = &self.map_info[&node_id];
            if info.is_terrible(now) {
                continue;
            }
            peers.push(info.peer_info());
        }

        peers
    }

    /// Drop every record that has accumulated `max_consecutive_failures`
    /// failures and has not been attempted within `max_age_seconds`.
    pub fn cleanup(&mut self, max_age_seconds: i64, max_consecutive_failures: u32) {
        self.cleanup_at(max_age_seconds, max_consecutive_failures, get_timestamp())
    }

    /// Same as [`AddressManager::cleanup`] with an explicit timestamp.
    pub fn cleanup_at(&mut self, max_age_seconds: i64, max_consecutive_failures: u32, now: i64) {
        let stale: Vec<SocketAddr> = self
            .map_info
            .values()
            .filter(|info| {
                info.num_attempts >= max_consecutive_failures
                    && info.last_try < now - max_age_seconds
            })
            .map(|info| info.address)
            .collect();

        if !stale.is_empty() {
            log::debug!("Cleaning up {} unreachable peer records", stale.len());
        }
        for address in stale {
            self.delete_record(&address);
        }
    }

    /// Verify the structural invariants of the address book. Violations are
    /// reported as [`PeersError::Integrity`].
    pub fn consistency_check(&self) -> Result<(), PeersError> {
        let integrity = |reason: String| Err(PeersError::Integrity { reason });

        if self.random_pos.len() != self.map_info.len() {
            return integrity(format!(
                "random-access list holds {} ids for {} records",
                self.random_pos.len(),
                self.map_info.len()
            ));
        }
        if self.map_addr.len() != self.map_info.len() {
            return integrity(format!(
                "address index holds {} ips for {} records",
                self.map_addr.len(),
                self.map_info.len()
            ));
        }

        let mut new_refs = 0usize;
        let mut new_records = 0usize;
        for (node_id, info) in &self.map_info {
            if info.is_tried == (info.ref_count > 0) {
                return integrity(format!(
                    "record {} has is_tried={} and ref_count={}",
                    node_id, info.is_tried, info.ref_count
                ));
            }
            if info.ref_count > NEW_BUCKETS_PER_ADDRESS {
                return integrity(format!(
                    "record {} is referenced by {} cells",
                    node_id, info.ref_count
                ));
            }
            if self.random_pos.get(info.random_pos) != Some(node_id) {
                return integrity(format!("record {} has a stale random_pos", node_id));
            }
            if self.map_addr.get(&info.address.ip()) != Some(node_id) {
                return integrity(format!("record {} is missing from the address index", node_id));
            }
            new_refs += usize::from(info.ref_count);
            if info.ref_count > 0 {
                new_records += 1;
            }
        }

        if self.new_table.occupied_cells() != new_refs {
            return integrity(format!(
                "new table holds {} cells for {} references",
                self.new_table.occupied_cells(),
                new_refs
            ));
        }
        if new_records != self.new_count {
            return integrity(format!(
                "new_count is {} but {} records hold cells",
                self.new_count, new_records
            ));
        }
        for (bucket, pos, node_id) in self.new_table.iter_occupied() {
            let info = match self.map_info.get(&node_id) {
                Some(info) => info,
                None => return integrity(format!("new cell holds dead record {}", node_id)),
            };
            if info.is_tried {
                return integrity(format!("tried record {} occupies a new cell", node_id));
            }
            if calculate_bucket_position(&self.key, false, bucket, &info.address) != pos {
                return integrity(format!("record {} sits at a misderived position", node_id));
            }
        }

        let mut tried_cells = 0usize;
        for (bucket, pos, node_id) in self.tried_table.iter_occupied() {
            tried_cells += 1;
            let info = match self.map_info.get(&node_id) {
                Some(info) => info,
                None => return integrity(format!("tried cell holds dead record {}", node_id)),
            };
            if !info.is_tried {
                return integrity(format!("new record {} occupies a tried cell", node_id));
            }
            let derived_bucket = calculate_tried_bucket(&self.key, &info.address);
            let derived_pos =
                calculate_bucket_position(&self.key, true, derived_bucket, &info.address);
            if (derived_bucket, derived_pos) != (bucket, pos) {
                return integrity(format!("record {} sits in a misderived tried cell", node_id));
            }
        }
        if tried_cells != self.tried_count {
            return integrity(format!(
                "tried_count is {} but {} cells are occupied",
                self.tried_count, tried_cells
            ));
        }

        Ok(())
    }

    fn create(&mut self, peer: PeerInfo, source: SocketAddr) -> u64 {
        self.id_count += 1;
        let node_id = self.id_count;

        let mut record = PeerRecord::new(peer, source);
        record.random_pos = self.random_pos.len();
        self.map_addr.insert(peer.address.ip(), node_id);
        self.map_info.insert(node_id, record);
        self.random_pos.push(node_id);

        node_id
    }

    /// Move the record out of every new-table cell and into its tried cell,
    /// demoting whoever currently holds that cell.
    fn make_tried(&mut self, node_id: u64) {
        let address = self.map_info[&node_id].address;

        for bucket in 0..NEW_BUCKET_COUNT {
            let pos = calculate_bucket_position(&self.key, false, bucket, &address);
            if self.new_table.get(bucket, pos) == Some(node_id) {
                self.new_table.clear(bucket, pos);
                self.map_info
                    .get_mut(&node_id)
                    .expect("record is live during promotion")
                    .ref_count -= 1;
            }
        }
        self.new_count -= 1;
        debug_assert_eq!(self.map_info[&node_id].ref_count, 0);

        let tried_bucket = calculate_tried_bucket(&self.key, &address);
        let tried_pos = calculate_bucket_position(&self.key, true, tried_bucket, &address);

        if let Some(old_id) = self.tried_table.get(tried_bucket, tried_pos) {
            // Demote the incumbent back into its new bucket.
            self.tried_table.clear(tried_bucket, tried_pos);
            self.tried_count -= 1;

            let (old_addr, new_bucket) = {
                let old = self
                    .map_info
                    .get_mut(&old_id)
                    .expect("tried cells point at live records");
                old.is_tried = false;
                (old.address, old.new_bucket(&self.key))
            };
            let new_pos = calculate_bucket_position(&self.key, false, new_bucket, &old_addr);
            self.clear_new_cell(new_bucket, new_pos);
            self.new_table.set(new_bucket, new_pos, old_id);
            self.map_info
                .get_mut(&old_id)
                .expect("demoted record is live")
                .ref_count = 1;
            self.new_count += 1;
        }

        self.tried_table.set(tried_bucket, tried_pos, node_id);
        self.tried_count += 1;
        self.map_info
            .get_mut(&node_id)
            .expect("record is live during promotion")
            .is_tried = true;
    }

    /// Empty a new-table cell, deleting the occupant when it loses its last
    /// reference.
    fn clear_new_cell(&mut self, bucket: usize, pos: usize) {
        if let Some(node_id) = self.new_table.get(bucket, pos) {
            self.new_table.clear(bucket, pos);
            let gone = {
                let info = self
                    .map_info
                    .get_mut(&node_id)
                    .expect("new cells point at live records");
                info.ref_count -= 1;
                info.ref_count == 0
            };
            if gone {
                self.delete_new_entry(node_id);
            }
        }
    }

    /// Delete a record that is not referenced by any table cell.
    fn delete_new_entry(&mut self, node_id: u64) {
        let (rand_pos, ip) = match self.map_info.get(&node_id) {
            Some(info) => {
                debug_assert!(!info.is_tried && info.ref_count == 0);
                (info.random_pos, info.address.ip())
            }
            None => return,
        };

        self.swap_random(rand_pos, self.random_pos.len() - 1);
        self.random_pos.pop();
        self.map_addr.remove(&ip);
        self.map_info.remove(&node_id);
        self.tried_collisions.retain(|&id| id != node_id);
        self.new_count -= 1;
    }

    /// Delete a record regardless of which table holds it.
    fn delete_record(&mut self, address: &SocketAddr) {
        let node_id = match self.map_addr.get(&address.ip()).copied() {
            Some(node_id) => node_id,
            None => return,
        };
        let (is_tried, rand_pos) = {
            let info = &self.map_info[&node_id];
            (info.is_tried, info.random_pos)
        };

        if is_tried {
            let bucket = calculate_tried_bucket(&self.key, address);
            let pos = calculate_bucket_position(&self.key, true, bucket, address);
            if self.tried_table.get(bucket, pos) == Some(node_id) {
                self.tried_table.clear(bucket, pos);
                self.tried_count -= 1;
            }
            self.swap_random(rand_pos, self.random_pos.len() - 1);
            self.random_pos.pop();
            self.map_addr.remove(&address.ip());
            self.map_info.remove(&node_id);
            self.tried_collisions.retain(|&id| id != node_id);
        } else {
            for bucket in 0..NEW_BUCKET_COUNT {
                if self.map_info.get(&node_id).is_none() {
                    break;
                }
                let pos = calculate_bucket_position(&self.key, false, bucket, address);
                if self.new_table.get(bucket, pos) == Some(node_id) {
                    self.clear_new_cell(bucket, pos);
                }
            }
        }
    }

    /// Swap two entries of the random-access list, keeping the records'
    /// back-references in sync.
    fn swap_random(&mut self, pos_1: usize, pos_2: usize) {
        if pos_1 == pos_2 {
            return;
        }
        let id_1 = self.random_pos[pos_1];
        let id_2 = self.random_pos[pos_2];
        self.map_info
            .get_mut(&id_1)
            .expect("random list entries point at live records")
            .random_pos = pos_2;
        self.map_info
            .get_mut(&id_2)
            .expect("random list entries point at live records")
            .random_pos = pos_1;
        self.random_pos.swap(pos_1, pos_2);
    }
}

/// Snapshot of an address manager, ready for persistence.
///
/// Records are enumerated with dense ids: records referenced by the new
/// table come first (`0..new_count`), tried records after. The position of
/// each record inside its buckets is not part of the snapshot; it is
/// recomputed from the key on load.
#[derive(Clone, Debug)]
pub struct AddressBookSnapshot {
    /// Secret bucket-placement key
    pub key: [u8; 32],
    /// Number of records referenced by the new table
    pub new_count: usize,
    /// Number of records in the tried table
    pub tried_count: usize,
    /// Dense-id enumeration of every live record
    pub nodes: Vec<(u64, PeerRecord)>,
    /// `(dense id, bucket)` pairs reconstructing the new table
    pub new_table: Vec<(u64, usize)>,
}

impl AddressManager {
    /// Snapshot the manager for persistence.
    pub fn snapshot(&self) -> AddressBookSnapshot {
        let mut nodes = Vec::with_capacity(self.map_info.len());
        let mut dense_ids: HashMap<u64, u64> = HashMap::new();

        for &node_id in &self.random_pos {
            let info = &self.map_info[&node_id];
            if info.ref_count > 0 {
                dense_ids.insert(node_id, nodes.len() as u64);
                nodes.push((nodes.len() as u64, info.clone()));
            }
        }
        debug_assert_eq!(nodes.len(), self.new_count);

        for &node_id in &self.random_pos {
            let info = &self.map_info[&node_id];
            if info.is_tried {
                nodes.push((nodes.len() as u64, info.clone()));
            }
        }

        let mut new_table = Vec::new();
        for (bucket, _, node_id) in self.new_table.iter_occupied() {
            if let Some(&dense_id) = dense_ids.get(&node_id) {
                new_table.push((dense_id, bucket));
            }
        }

        AddressBookSnapshot {
            key: self.key,
            new_count: self.new_count,
            tried_count: self.tried_count,
            nodes,
            new_table,
        }
    }

    /// Rebuild a manager from a persisted snapshot.
    ///
    /// Tried records whose recomputed cell is already taken are dropped and
    /// counted; new-table rows are replayed against the recomputed positions
    /// and records that end up unreferenced are deleted. Returns the manager
    /// together with the number of lost tried placements.
    pub fn from_snapshot(snapshot: AddressBookSnapshot) -> Result<(Self, usize), PeersError> {
        let AddressBookSnapshot {
            key,
            new_count,
            tried_count,
            nodes,
            new_table,
        } = snapshot;

        if nodes.len() != new_count + tried_count {
            return Err(PeersError::Integrity {
                reason: format!(
                    "snapshot holds {} records for counts {} + {}",
                    nodes.len(),
                    new_count,
                    tried_count
                ),
            });
        }

        let mut manager = AddressManager::with_key(key);
        let mut lost = 0usize;

        for (expected, (dense_id, record)) in nodes.into_iter().enumerate() {
            if dense_id != expected as u64 {
                return Err(PeersError::Integrity {
                    reason: format!("snapshot record ids are not dense at {}", dense_id),
                });
            }

            let mut record = record;
            record.ref_count = 0;
            record.is_tried = false;

            if (dense_id as usize) < new_count {
                record.random_pos = manager.random_pos.len();
                manager.map_addr.insert(record.address.ip(), dense_id);
                manager.random_pos.push(dense_id);
                manager.map_info.insert(dense_id, record);
            } else {
                // A tried record goes back to its derived cell, unless a
                // previous record already claimed it.
                let bucket = calculate_tried_bucket(&manager.key, &record.address);
                let pos = calculate_bucket_position(&manager.key, true, bucket, &record.address);
                if manager.tried_table.get(bucket, pos).is_none() {
                    record.random_pos = manager.random_pos.len();
                    record.is_tried = true;
                    manager.map_addr.insert(record.address.ip(), dense_id);
                    manager.random_pos.push(dense_id);
                    manager.tried_table.set(bucket, pos, dense_id);
                    manager.map_info.insert(dense_id, record);
                } else {
                    lost += 1;
                }
            }
        }

        manager.new_count = new_count;
        manager.tried_count = tried_count - lost;

        for (dense_id, bucket) in new_table {
            if (dense_id as usize) >= new_count {
                return Err(PeersError::Integrity {
                    reason: format!("tried record {} is referenced by the new table", dense_id),
                });
            }
            if bucket >= NEW_BUCKET_COUNT {
                return Err(PeersError::Integrity {
                    reason: format!("new-table row points at bucket {}", bucket),
                });
            }
            let address = match manager.map_info.get(&dense_id) {
                Some(info) => info.address,
                None => {
                    return Err(PeersError::Integrity {
                        reason: format!("new-table row points at dead record {}", dense_id),
                    });
                }
            };
            let pos = calculate_bucket_position(&manager.key, false, bucket, &address);
            let info = manager
                .map_info
                .get_mut(&dense_id)
                .expect("record was checked above");
            if manager.new_table.get(bucket, pos).is_none()
                && info.ref_count < NEW_BUCKETS_PER_ADDRESS
            {
                info.ref_count += 1;
                manager.new_table.set(bucket, pos, dense_id);
            }
        }

        // Drop records that did not recover a single cell.
        let orphans: Vec<u64> = manager
            .map_info
            .iter()
            .filter(|(_, info)| !info.is_tried && info.ref_count == 0)
            .map(|(&node_id, _)| node_id)
            .collect();
        for node_id in orphans {
            manager.delete_new_entry(node_id);
        }

        manager.id_count = manager.map_info.keys().max().copied().unwrap_or(0);
        manager.consistency_check()?;

        Ok((manager, lost))
    }
}

impl fmt::Display for AddressManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "--------------")?;
        writeln!(f, "New Peers List")?;
        writeln!(f, "--------------")?;

        for info in self.map_info.values().filter(|info| !info.is_tried) {
            writeln!(f, "> {}", info.address)?;
        }

        writeln!(f, "----------------")?;
        writeln!(f, "Tried Peers List")?;
        writeln!(f, "----------------")?;

        for info in self.map_info.values().filter(|info| info.is_tried) {
            writeln!(f, "> {}", info.address)?;
        }
        writeln!(f)
    }
}
