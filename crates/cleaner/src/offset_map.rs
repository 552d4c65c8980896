use sha2::{Digest, Sha256};

/// Bytes of the key digest stored per slot.
const HASH_BYTES: usize = 16;
const OFFSET_BYTES: usize = 8;
/// One slot: truncated key digest followed by the big-endian offset.
pub const SLOT_BYTES: usize = HASH_BYTES + OFFSET_BYTES;

/// A bounded map from message key to the last offset that key was seen at,
/// backed by one flat byte array.
///
/// Slots store only a truncated Sha-256 digest of the key, never the key
/// itself, so memory per entry is fixed and the number of dirty records one
/// cleaning pass can deduplicate is known up front. Two keys colliding on
/// the full stored digest would let the newer shadow the older, which at
/// worst retains one extra stale record.
#[derive(Debug)]
pub struct OffsetMap {
    slots: Vec<u8>,
    slot_count: usize,
    max_entries: usize,
    entries: usize,
    last_offset: i64,
}

impl OffsetMap {
    /// Build a map over `memory_bytes` of slot storage, declaring itself
    /// full once `load_factor` of the slots are occupied.
    pub fn new(memory_bytes: usize, load_factor: f64) -> Self {
        let slot_count = (memory_bytes / SLOT_BYTES).max(1);
        let max_entries = ((slot_count as f64 * load_factor) as usize)
            .clamp(1, slot_count);
        Self {
            slots: vec![0; slot_count * SLOT_BYTES],
            slot_count,
            max_entries,
            entries: 0,
            last_offset: -1,
        }
    }

    pub fn slots(&self) -> usize {
        self.slot_count
    }

    pub fn size(&self) -> usize {
        self.entries
    }

    pub fn utilization(&self) -> f64 {
        self.entries as f64 / self.slot_count as f64
    }

    /// The largest offset passed to a successful `try_put`.
    pub fn latest_offset(&self) -> i64 {
        self.last_offset
    }

    pub fn clear(&mut self) {
        self.slots.fill(0);
        self.entries = 0;
        self.last_offset = -1;
    }

    /// Record that `key` was last written at `offset`. Returns `false` when
    /// the map has hit its load-factor cap and cannot take a *new* key;
    /// updating an existing key always succeeds.
    pub fn try_put(&mut self, key: &[u8], offset: i64) -> bool {
        let digest = digest_of(key);
        let (h1, h2) = probe_seeds(&digest);
        for attempt in 0..self.slot_count as u64 {
            let slot = probe_slot(h1, h2, attempt, self.slot_count);
            let at = slot * SLOT_BYTES;
            let stored = &self.slots[at..at + HASH_BYTES];
            if stored == digest {
                self.write_offset(at, offset);
                self.last_offset = self.last_offset.max(offset);
                return true;
            }
            if stored.iter().all(|&byte| byte == 0) {
                if self.entries >= self.max_entries {
                    return false;
                }
                self.slots[at..at + HASH_BYTES].copy_from_slice(&digest);
                self.write_offset(at, offset);
                self.entries += 1;
                self.last_offset = self.last_offset.max(offset);
                return true;
            }
        }
        false
    }

    /// The last known offset for `key`, or `None` when the key was never
    /// put (or its slots were exhausted by collisions).
    pub fn get(&self, key: &[u8]) -> Option<i64> {
        let digest = digest_of(key);
        let (h1, h2) = probe_seeds(&digest);
        for attempt in 0..self.slot_count as u64 {
            let slot = probe_slot(h1, h2, attempt, self.slot_count);
            let at = slot * SLOT_BYTES;
            let stored = &self.slots[at..at + HASH_BYTES];
            if stored == digest {
                return Some(self.read_offset(at));
            }
            if stored.iter().all(|&byte| byte == 0) {
                return None;
            }
        }
        None
    }

    fn write_offset(&mut self, slot_at: usize, offset: i64) {
        self.slots[slot_at + HASH_BYTES..slot_at + SLOT_BYTES]
            .copy_from_slice(&offset.to_be_bytes());
    }

    fn read_offset(&self, slot_at: usize) -> i64 {
        i64::from_be_bytes(
            self.slots[slot_at + HASH_BYTES..slot_at + SLOT_BYTES]
                .try_into()
                .expect("slot offset is exactly 8 bytes"),
        )
    }
}

fn digest_of(key: &[u8]) -> [u8; HASH_BYTES] {
    let full = Sha256::digest(key);
    let mut truncated = [0_u8; HASH_BYTES];
    truncated.copy_from_slice(&full[..HASH_BYTES]);
    truncated
}

/// Double hashing: two probe seeds derived from the digest, the second
/// forced odd so every slot is eventually visited.
fn probe_seeds(digest: &[u8; HASH_BYTES]) -> (u64, u64) {
    let h1 = u64::from_be_bytes(digest[..8].try_into().expect("digest is 16 bytes"));
    let h2 = u64::from_be_bytes(digest[8..].try_into().expect("digest is 16 bytes")) | 1;
    (h1, h2)
}

fn probe_slot(h1: u64, h2: u64, attempt: u64, slot_count: usize) -> usize {
    (h1.wrapping_add(attempt.wrapping_mul(h2)) % slot_count as u64) as usize
}
