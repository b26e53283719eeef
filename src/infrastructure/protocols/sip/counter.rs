//! Sequence counters and identifier generation
//!
//! Call-IDs, tags, branches and session ids are all derived from
//! process-wide counters or random values owned by the agent.

use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

/// Thread-safe, strictly increasing counter. Wraps past `u32::MAX` and never yields zero.
#[derive(Debug)]
pub struct SequenceCounter {
    value: AtomicU32,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Counter whose first `next()` returns `start + 1`
    pub fn starting_at(start: u32) -> Self {
        Self {
            value: AtomicU32::new(start),
        }
    }

    pub fn next(&self) -> u32 {
        loop {
            let next = self.value.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            if next != 0 {
                return next;
            }
        }
    }

    /// Last value handed out
    pub fn current(&self) -> u32 {
        self.value.load(Ordering::SeqCst)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Every tag this agent has issued; a tag is never handed out twice.
#[derive(Debug, Default)]
pub struct TagPool {
    issued: Mutex<HashSet<String>>,
}

impl TagPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw a fresh 8-hex-digit tag
    pub fn generate(&self) -> String {
        let mut issued = self.issued.lock();
        let mut rng = rand::thread_rng();
        loop {
            let seed: u64 = rng.gen();
            let digest = format!("{:x}", md5::compute(seed.to_string()));
            let tag = digest[..8].to_string();
            if issued.insert(tag.clone()) {
                return tag;
            }
        }
    }

    /// Mark a tag chosen by the far end as taken
    pub fn reserve(&self, tag: &str) -> bool {
        self.issued.lock().insert(tag.to_string())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.issued.lock().contains(tag)
    }

    pub fn len(&self) -> usize {
        self.issued.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Generates Call-IDs, tags, branches and session ids
#[derive(Debug, Default)]
pub struct IdGenerator {
    call_ids: SequenceCounter,
    sessions: SequenceCounter,
    tags: TagPool,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// First 32 hex digits of SHA-256 over the next Call-ID counter value
    pub fn call_id(&self) -> String {
        let digest = Sha256::digest(self.call_ids.next().to_string().as_bytes());
        hex::encode(digest)[..32].to_string()
    }

    pub fn tag(&self) -> String {
        self.tags.generate()
    }

    pub fn tags(&self) -> &TagPool {
        &self.tags
    }

    pub fn session_id(&self) -> u32 {
        self.sessions.next()
    }

    /// Branch for REGISTER transactions
    pub fn register_branch(&self) -> String {
        format!("z9hG4bK-d87543-{}-1--d87543-", random_hex(8))
    }

    /// Branch for an initial INVITE, derived from its Call-ID
    pub fn invite_branch(&self, call_id: &str) -> String {
        let prefix: String = call_id.chars().take(25).collect();
        format!("z9hG4bK{}", prefix)
    }

    pub fn branch(&self) -> String {
        format!("z9hG4bK{}", random_hex(8))
    }
}

/// `bytes` random bytes as lowercase hex
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill(buf.as_mut_slice());
    hex::encode(buf)
}
