//! Fused replay protection: sequence-window filter plus a bounded nonce
//! cache, serialized to and reconstructed from the bytes a `ClientRecord`
//! persists.

use crate::window::SlidingWindowFilter;
use latchkey_types::{ClientRecord, BLOCK_MASK, MAX_SEQ, NONCE_CACHE_SIZE, RING_BLOCKS};

/// Owns one client's replay state for the duration of a request. Built from
/// a `ClientRecord` snapshot, mutated across `validate`/`update`, and handed
/// back out via `snapshot` for the caller to persist.
#[derive(Debug, Clone)]
pub struct ReplayProtector {
    filter: SlidingWindowFilter,
    nonce_cache: Vec<String>,
}

impl ReplayProtector {
    /// Reconstructs replay state from a client record's persisted
    /// `seq_window` blob and `nonce_cache`.
    ///
    /// - A blob at least `SEQ_WINDOW_BLOB_SIZE` bytes with a nonzero `last`
    ///   is loaded directly.
    /// - Anything else (missing, short, or `last == 0`) is treated as an
    ///   empty filter; if `current_seq > 0` it is then seeded by replaying
    ///   that single counter, so a record whose window blob was lost still
    ///   rejects exact replays of its last known sequence.
    pub fn new(client: &ClientRecord) -> Self {
        let filter = match parse_window_blob(&client.seq_window) {
            Some(filter) if filter.last() > 0 => filter,
            _ => {
                let mut filter = SlidingWindowFilter::new();
                if client.current_seq > 0 {
                    filter.validate_counter(client.current_seq, MAX_SEQ);
                }
                filter
            }
        };

        Self {
            filter,
            nonce_cache: client.nonce_cache.clone(),
        }
    }

    /// Checks `seq`/`nonce` against the nonce cache first, then the
    /// sequence window. Nonce lookup is pure; the counter check mutates the
    /// filter's ring state on acceptance (and leaves it unchanged on
    /// rejection). Neither check consults the other's outcome.
    pub fn validate(&mut self, seq: u64, nonce: &str) -> bool {
        if self.nonce_cache.iter().any(|seen| seen == nonce) {
            return false;
        }
        self.filter.validate_counter(seq, MAX_SEQ)
    }

    /// Records `nonce` as seen, evicting the oldest entry once the cache
    /// exceeds `NONCE_CACHE_SIZE`. Call only after `validate` has accepted
    /// the same `seq`/`nonce` pair.
    pub fn update(&mut self, nonce: String) {
        self.nonce_cache.push(nonce);
        if self.nonce_cache.len() > NONCE_CACHE_SIZE {
            self.nonce_cache.remove(0);
        }
    }

    /// Serializes current state for persistence: highest accepted
    /// sequence, the sequence-window blob, and the nonce cache.
    pub fn snapshot(&self) -> (u64, Vec<u8>, Vec<String>) {
        (
            self.filter.last(),
            serialize_window_blob(&self.filter),
            self.nonce_cache.clone(),
        )
    }
}

fn serialize_window_blob(filter: &SlidingWindowFilter) -> Vec<u8> {
    let mut blob = Vec::with_capacity(8 + 8 * RING_BLOCKS);
    blob.extend_from_slice(&filter.last().to_le_bytes());
    for block in filter.ring() {
        blob.extend_from_slice(&block.to_le_bytes());
    }
    blob
}

fn parse_window_blob(blob: &[u8]) -> Option<SlidingWindowFilter> {
    let expected = 8 + 8 * RING_BLOCKS;
    if blob.len() < expected {
        return None;
    }

    let last = u64::from_le_bytes(blob[0..8].try_into().ok()?);
    let mut ring = [0u64; RING_BLOCKS];
    for (i, slot) in ring.iter_mut().enumerate() {
        let start = 8 + i * 8;
        *slot = u64::from_le_bytes(blob[start..start + 8].try_into().ok()?);
    }
    debug_assert_eq!(RING_BLOCKS - 1, BLOCK_MASK);

    Some(SlidingWindowFilter::from_parts(last, ring))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_client() -> ClientRecord {
        ClientRecord {
            client_id: "c1".into(),
            client_name: "test client".into(),
            auth_token_hash: "deadbeef".into(),
            shared_secret: [0u8; 32],
            current_seq: 0,
            seq_window: Vec::new(),
            nonce_cache: Vec::new(),
            created_at: 0,
            last_seen: 0,
        }
    }

    #[test]
    fn fresh_client_accepts_first_request() {
        let client = fresh_client();
        let mut protector = ReplayProtector::new(&client);
        assert!(protector.validate(0, "nonce-a"));
        protector.update("nonce-a".to_string());
    }

    #[test]
    fn duplicate_nonce_rejected_even_with_fresh_sequence() {
        let client = fresh_client();
        let mut protector = ReplayProtector::new(&client);
        assert!(protector.validate(1, "nonce-a"));
        protector.update("nonce-a".to_string());
        // Different seq, same nonce: still rejected.
        assert!(!protector.validate(2, "nonce-a"));
    }

    #[test]
    fn duplicate_seq_rejected_even_with_fresh_nonce() {
        let client = fresh_client();
        let mut protector = ReplayProtector::new(&client);
        assert!(protector.validate(5, "nonce-a"));
        protector.update("nonce-a".to_string());
        assert!(!protector.validate(5, "nonce-b"));
    }

    #[test]
    fn out_of_order_within_window_both_accepted() {
        let client = fresh_client();
        let mut protector = ReplayProtector::new(&client);
        assert!(protector.validate(1000, "n1"));
        protector.update("n1".to_string());
        assert!(protector.validate(950, "n2"));
        protector.update("n2".to_string());

        let (current_seq, _, _) = protector.snapshot();
        assert_eq!(current_seq, 1000);
    }

    #[test]
    fn nonce_cache_bounded_and_fifo() {
        let client = fresh_client();
        let mut protector = ReplayProtector::new(&client);
        for i in 0..(NONCE_CACHE_SIZE as u64 + 10) {
            let nonce = format!("n{i}");
            assert!(protector.validate(i, &nonce));
            protector.update(nonce);
        }
        let (_, _, nonce_cache) = protector.snapshot();
        assert_eq!(nonce_cache.len(), NONCE_CACHE_SIZE);
        assert_eq!(nonce_cache[0], "n10");
        assert_eq!(nonce_cache[nonce_cache.len() - 1], format!("n{}", NONCE_CACHE_SIZE + 9));
    }

    #[test]
    fn snapshot_round_trips_through_new() {
        let client = fresh_client();
        let mut protector = ReplayProtector::new(&client);
        for i in 0..300u64 {
            let nonce = format!("n{i}");
            protector.validate(i, &nonce);
            protector.update(nonce);
        }
        let (current_seq, seq_window, nonce_cache) = protector.snapshot();

        let mut persisted = client;
        persisted.current_seq = current_seq;
        persisted.seq_window = seq_window;
        persisted.nonce_cache = nonce_cache;

        let mut reloaded = ReplayProtector::new(&persisted);
        // Everything already accepted must still be rejected as a replay.
        assert!(!reloaded.validate(299, "n299"));
        // A new, higher sequence still accepts.
        assert!(reloaded.validate(300, "n300"));
    }

    #[test]
    fn missing_window_blob_seeds_from_current_seq() {
        let mut client = fresh_client();
        client.current_seq = 42;
        client.seq_window = Vec::new();

        let mut protector = ReplayProtector::new(&client);
        // The exact last-known sequence must still be rejected as a replay.
        assert!(!protector.validate(42, "any-nonce"));
        // But anything newer is accepted.
        assert!(protector.validate(43, "any-nonce"));
    }

    #[test]
    fn short_window_blob_falls_back_to_current_seq_seed() {
        let mut client = fresh_client();
        client.current_seq = 7;
        client.seq_window = vec![1, 2, 3];

        let protector = ReplayProtector::new(&client);
        let (current_seq, _, _) = protector.snapshot();
        assert_eq!(current_seq, 7);
    }
}
