//! Fast, non-cryptographic fingerprints for decision attempts.
//!
//! Attempts are fingerprinted with XXH64 (seed 0) over their canonical JSON
//! form, and votes sign the fingerprint. Integrity comes from the signatures;
//! the hash only has to be deterministic and identical on every peer.
//!
//! The provider is a process-wide, lazily-initialized singleton so tests can
//! swap it through [`install`] and restore it with [`reset`].

use std::hash::Hasher;
use std::sync::{Arc, PoisonError, RwLock};

use twox_hash::XxHash64;

/// A deterministic 64-bit string hash.
pub trait FastHash: Send + Sync {
    fn h64(&self, input: &str) -> u64;

    /// Lowercase, zero-padded hex form of [`FastHash::h64`].
    fn h64_hex(&self, input: &str) -> String {
        format!("{:016x}", self.h64(input))
    }
}

/// XXH64 with seed 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct Xxh64;

impl FastHash for Xxh64 {
    fn h64(&self, input: &str) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(input.as_bytes());
        hasher.finish()
    }
}

static PROVIDER: RwLock<Option<Arc<dyn FastHash>>> = RwLock::new(None);

/// The active provider, created on first use.
pub fn provider() -> Arc<dyn FastHash> {
    if let Some(provider) = PROVIDER
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
    {
        return Arc::clone(provider);
    }

    let mut slot = PROVIDER.write().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(slot.get_or_insert_with(|| Arc::new(Xxh64)))
}

/// Replace the active provider.
pub fn install(provider: Arc<dyn FastHash>) {
    *PROVIDER.write().unwrap_or_else(PoisonError::into_inner) = Some(provider);
}

/// Drop the active provider; the next [`provider`] call creates a fresh one.
pub fn reset() {
    *PROVIDER.write().unwrap_or_else(PoisonError::into_inner) = None;
}

/// Fingerprint a string with the active provider.
pub fn fingerprint(input: &str) -> String {
    provider().h64_hex(input)
}
