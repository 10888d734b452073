//! Random identifier generation for message ids and instance ids.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of generated reply message ids.
pub const MESSAGE_ID_LEN: usize = 20;

/// Source of fixed-length random identifiers.
pub trait IdGenerator: Send + Sync + 'static {
    /// Generate an identifier of exactly `len` characters.
    fn generate(&self, len: usize) -> String;
}

/// Alphanumeric ids drawn from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn generate(&self, len: usize) -> String {
        random_string(len)
    }
}

/// Generate a random alphanumeric string of `len` characters.
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
