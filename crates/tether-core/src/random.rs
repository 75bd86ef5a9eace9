//! Seeded random streams for deterministic side effects.
//!
//! A client that simulates a method locally sends the seed it used, so the
//! server can generate the same ids. Each named stream (for example one per
//! collection) is an independent generator derived from `SHA-256(seed ‖ name)`.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

/// Characters used for generated ids; visually ambiguous glyphs are excluded.
pub const UNMISTAKABLE_CHARS: &str = "23456789ABCDEFGHJKLMNPQRSTWXYZabcdefghijkmnopqrstuvwxyz";

/// Length of ids produced by [`RandomStream::id`] and [`random_id`].
pub const ID_LENGTH: usize = 17;

/// Generate a fresh, non-deterministic id.
pub fn random_id() -> String {
    let mut rng = rand::rng();
    id_from(&mut rng)
}

fn id_from(rng: &mut impl Rng) -> String {
    let alphabet = UNMISTAKABLE_CHARS.as_bytes();
    (0..ID_LENGTH)
        .map(|_| char::from(alphabet[rng.random_range(0..alphabet.len())]))
        .collect()
}

/// A family of named deterministic generators sharing one seed.
pub struct RandomStream {
    seed: String,
    streams: Mutex<HashMap<String, StdRng>>,
}

impl RandomStream {
    /// Create a stream family from a seed.
    pub fn new(seed: impl Into<String>) -> Self {
        Self {
            seed: seed.into(),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Create a stream family with a fresh random seed.
    pub fn fresh() -> Self {
        Self::new(random_id())
    }

    /// The seed this family was created from.
    pub fn seed(&self) -> &str {
        &self.seed
    }

    /// Next id from the stream called `name`.
    pub fn id(&self, name: &str) -> String {
        let mut streams = self.streams.lock();
        let rng = streams
            .entry(name.to_owned())
            .or_insert_with(|| derive_rng(&self.seed, name));
        id_from(rng)
    }

    /// Next `f64` in `[0, 1)` from the stream called `name`.
    pub fn fraction(&self, name: &str) -> f64 {
        let mut streams = self.streams.lock();
        let rng = streams
            .entry(name.to_owned())
            .or_insert_with(|| derive_rng(&self.seed, name));
        rng.random::<f64>()
    }
}

impl std::fmt::Debug for RandomStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomStream")
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

fn derive_rng(seed: &str, name: &str) -> StdRng {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    StdRng::from_seed(digest)
}
