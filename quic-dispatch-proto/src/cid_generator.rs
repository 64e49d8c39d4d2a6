use std::hash::Hasher;

use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};

use crate::shared::ConnectionId;
use crate::MAX_CID_SIZE;

/// Decides which connection IDs the dispatcher routes sessions under
///
/// The dispatcher consults the generator once per new connection, with the destination
/// connection ID the client picked for its first Initial packet. If the generator asks for a
/// replacement, the session is registered under the replacement and the client-chosen ID is
/// kept as an alias until the session goes away.
pub trait ConnectionIdGenerator: Send {
    /// Generates a new CID
    ///
    /// Connection IDs MUST NOT contain any information that can be used by
    /// an external observer (that is, one that does not cooperate with the
    /// issuer) to correlate them with other connection IDs for the same
    /// connection.
    fn generate_cid(&mut self) -> ConnectionId;

    /// Decides whether the client-chosen `original` ID must be replaced, and with what
    ///
    /// Returning `None`, an empty ID, or `original` itself all mean "keep the original".
    fn maybe_replace(&mut self, original: &ConnectionId, version: u32) -> Option<ConnectionId>;

    /// Returns the length of a CID for connections created by this generator
    fn cid_len(&self) -> usize;

    /// Length of the destination CID of a short header packet whose CID starts with `first_byte`
    ///
    /// Generators that encode their length in the first byte override this.
    fn expected_len(&self, first_byte: u8) -> usize {
        let _ = first_byte;
        self.cid_len()
    }
}

/// Generates purely random connection IDs of a certain length
///
/// Replacements for client-chosen IDs of another length are drawn from a generator seeded with
/// the original ID and a per-instance key, so a retransmitted first flight maps to the same
/// replacement.
#[derive(Debug, Clone, Copy)]
pub struct RandomConnectionIdGenerator {
    cid_len: usize,
    key: u64,
}

impl Default for RandomConnectionIdGenerator {
    fn default() -> Self {
        Self::new(8)
    }
}

impl RandomConnectionIdGenerator {
    /// Initialize Random CID generator with a fixed CID length
    ///
    /// The given length must be less than or equal to MAX_CID_SIZE.
    pub fn new(cid_len: usize) -> Self {
        debug_assert!(cid_len <= MAX_CID_SIZE);
        Self {
            cid_len,
            key: rand::thread_rng().gen(),
        }
    }
}

impl ConnectionIdGenerator for RandomConnectionIdGenerator {
    fn generate_cid(&mut self) -> ConnectionId {
        let mut bytes_arr = [0; MAX_CID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes_arr[..self.cid_len]);

        ConnectionId::new(&bytes_arr[..self.cid_len])
    }

    fn maybe_replace(&mut self, original: &ConnectionId, version: u32) -> Option<ConnectionId> {
        if original.len() == self.cid_len {
            return None;
        }
        let mut hasher = rustc_hash::FxHasher::default();
        hasher.write_u64(self.key);
        hasher.write_u32(version);
        hasher.write(original);
        let mut bytes_arr = [0; MAX_CID_SIZE];
        StdRng::seed_from_u64(hasher.finish()).fill_bytes(&mut bytes_arr[..self.cid_len]);
        Some(ConnectionId::new(&bytes_arr[..self.cid_len]))
    }

    /// Provide the length of dst_cid in short header packet
    fn cid_len(&self) -> usize {
        self.cid_len
    }
}

/// Generates 8-byte connection IDs that can be efficiently validated
///
/// Replacements are derived from the client's original ID and a key, so a client retransmitting
/// its first flight is given the same replacement every time, and two dispatchers sharing a key
/// agree on it. This generator uses a non-cryptographic hash and can therefore still be spoofed,
/// but nonetheless helps to avoid responding to non-QUIC packets at very low cost.
pub struct HashedConnectionIdGenerator {
    key: u64,
}

impl HashedConnectionIdGenerator {
    /// Create a generator with a random key
    pub fn new() -> Self {
        Self::from_key(rand::thread_rng().gen())
    }

    /// Create a generator with a specific key
    ///
    /// Allows [`validate`](Self::validate) to recognize a consistent set of
    /// connection IDs across restarts
    pub fn from_key(key: u64) -> Self {
        Self { key }
    }

    /// Whether `cid` could have been generated by this generator
    pub fn validate(&self, cid: &ConnectionId) -> bool {
        if cid.len() != NONCE_LEN + SIGNATURE_LEN {
            return false;
        }
        let (nonce, signature) = cid.split_at(NONCE_LEN);
        signature == &self.sign(nonce)[..]
    }

    fn sign(&self, nonce: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut hasher = rustc_hash::FxHasher::default();
        hasher.write_u64(self.key);
        hasher.write(nonce);
        let mut signature = [0; SIGNATURE_LEN];
        signature.copy_from_slice(&hasher.finish().to_le_bytes()[..SIGNATURE_LEN]);
        signature
    }

    fn from_nonce(&self, nonce: [u8; NONCE_LEN]) -> ConnectionId {
        let mut bytes_arr = [0; NONCE_LEN + SIGNATURE_LEN];
        bytes_arr[..NONCE_LEN].copy_from_slice(&nonce);
        bytes_arr[NONCE_LEN..].copy_from_slice(&self.sign(&nonce));
        ConnectionId::new(&bytes_arr)
    }
}

impl Default for HashedConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionIdGenerator for HashedConnectionIdGenerator {
    fn generate_cid(&mut self) -> ConnectionId {
        let mut nonce = [0; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.from_nonce(nonce)
    }

    fn maybe_replace(&mut self, original: &ConnectionId, version: u32) -> Option<ConnectionId> {
        if self.validate(original) {
            return None;
        }
        let mut hasher = rustc_hash::FxHasher::default();
        hasher.write_u64(!self.key);
        hasher.write_u32(version);
        hasher.write(original);
        let mut nonce = [0; NONCE_LEN];
        nonce.copy_from_slice(&hasher.finish().to_le_bytes()[..NONCE_LEN]);
        Some(self.from_nonce(nonce))
    }

    fn cid_len(&self) -> usize {
        NONCE_LEN + SIGNATURE_LEN
    }
}

const NONCE_LEN: usize = 3; // Good for more than 16 million connections
const SIGNATURE_LEN: usize = 8 - NONCE_LEN; // 8-byte total CID length
