//! Production Environment implementation using the system clock and OS RNG.
//!
//! Behavior is non-deterministic: real wall-clock time and security-grade
//! randomness.

use aegnix_core::Environment;

/// Wall clock and OS randomness for a running bridge.
///
/// # Security
///
/// The RNG uses getrandom, which provides OS-level cryptographic randomness
/// (e.g., /dev/urandom on Linux, `BCryptGenRandom` on Windows). Envelope
/// nonces, AEAD nonces and key pairs all draw from it.
///
/// # Panics
///
/// Panics if the OS RNG fails. A bridge without functioning cryptographic
/// randomness cannot sign or seal anything safely.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Environment backed by the host clock and RNG.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    /// A clock set before the Unix epoch reads as 0, which makes every
    /// envelope stale rather than accepted.
    fn wall_clock_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as u64)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - bridge cannot operate securely");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_is_after_2020() {
        let env = SystemEnv::new();
        assert!(env.wall_clock_millis() > 1_577_836_800_000);
    }

    #[test]
    fn consecutive_nonces_differ() {
        let env = SystemEnv::new();

        let mut first = [0u8; 16];
        let mut second = [0u8; 16];
        env.random_bytes(&mut first);
        env.random_bytes(&mut second);

        // Two equal 128-bit envelope nonces would mean a broken RNG
        assert_ne!(first, second);
    }
}
