//! Subdomain allocation: picks a unique label for each new tunnel session.

use rand::Rng;
use relaymux_shared::{Error, Result};

use crate::registry::SessionRegistry;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generates short, DNS-safe subdomain labels and checks them against the
/// registry for collisions before handing one out. Uses an OS-backed RNG
/// rather than a timestamp seed: a millisecond clock collides under any
/// real connection burst, which is exactly the case this allocator exists
/// to handle.
pub struct SubdomainAllocator {
    length: usize,
    max_attempts: u32,
}

impl SubdomainAllocator {
    /// Builds an allocator for `length`-character labels. Rejects
    /// `length == 0` outright rather than letting it silently produce the
    /// empty string as a "subdomain".
    pub fn new(length: usize, max_attempts: u32) -> Result<Self> {
        if length == 0 {
            return Err(Error::InvalidSubdomainLength(length));
        }
        Ok(Self { length, max_attempts })
    }

    fn random_label(&self) -> String {
        let mut rng = rand::rng();
        (0..self.length)
            .map(|_| {
                let idx = rng.random_range(0..ALPHABET.len());
                ALPHABET[idx] as char
            })
            .collect()
    }

    /// Allocates a subdomain not already present in `registry`. Returns
    /// `Error::AllocationExhausted` if every attempt collides, which under
    /// this alphabet and default length only happens if the registry is
    /// saturated or under adversarial pressure.
    pub fn allocate(&self, registry: &SessionRegistry) -> Result<String> {
        for _ in 0..self.max_attempts {
            let candidate = self.random_label();
            if !registry.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::AllocationExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Validates and reserves a client-requested subdomain. Returns `Ok(name)`
    /// unchanged if available, or falls back to a fresh random allocation if
    /// it's already taken — client-chosen subdomains are a convenience, not
    /// a guarantee, and duplicate requests are expected to happen.
    pub fn allocate_preferring(
        &self,
        registry: &SessionRegistry,
        requested: Option<&str>,
    ) -> Result<String> {
        if let Some(name) = requested {
            let name = name.to_lowercase();
            if is_valid_label(&name) && !registry.contains(&name) {
                return Ok(name);
            }
        }
        self.allocate(registry)
    }
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !label.starts_with('-')
        && !label.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sender() -> mpsc::Sender<relaymux_shared::protocol::Envelope> {
        mpsc::channel(1).0
    }

    #[test]
    fn allocate_produces_labels_of_requested_length() {
        let allocator = SubdomainAllocator::new(12, 100).unwrap();
        let registry = SessionRegistry::new();
        let label = allocator.allocate(&registry).unwrap();
        assert_eq!(label.len(), 12);
        assert!(label.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }

    #[test]
    fn allocate_skips_taken_subdomains() {
        let allocator = SubdomainAllocator::new(1, 1000).unwrap();
        let registry = SessionRegistry::new();
        // Exhaust every single-character label but one.
        for &byte in &ALPHABET[..ALPHABET.len() - 1] {
            registry.register((byte as char).to_string(), sender());
        }
        let label = allocator.allocate(&registry).unwrap();
        assert_eq!(label, (*ALPHABET.last().unwrap() as char).to_string());
    }

    #[test]
    fn allocate_exhausted_when_space_is_full() {
        let allocator = SubdomainAllocator::new(1, 50).unwrap();
        let registry = SessionRegistry::new();
        for &byte in ALPHABET {
            registry.register((byte as char).to_string(), sender());
        }
        let err = allocator.allocate(&registry).unwrap_err();
        assert!(matches!(err, Error::AllocationExhausted { attempts: 50 }));
    }

    #[test]
    fn allocate_preferring_honors_available_request() {
        let allocator = SubdomainAllocator::new(12, 100).unwrap();
        let registry = SessionRegistry::new();
        let label = allocator
            .allocate_preferring(&registry, Some("my-app"))
            .unwrap();
        assert_eq!(label, "my-app");
    }

    #[test]
    fn allocate_preferring_falls_back_on_collision() {
        let allocator = SubdomainAllocator::new(12, 100).unwrap();
        let registry = SessionRegistry::new();
        registry.register("taken".into(), sender());
        let label = allocator
            .allocate_preferring(&registry, Some("taken"))
            .unwrap();
        assert_ne!(label, "taken");
        assert_eq!(label.len(), 12);
    }

    #[test]
    fn invalid_requested_label_is_rejected() {
        assert!(!is_valid_label(""));
        assert!(!is_valid_label("-leading"));
        assert!(!is_valid_label("trailing-"));
        assert!(!is_valid_label("Has_Upper"));
        assert!(is_valid_label("my-app-1"));
    }

    #[test]
    fn zero_length_is_rejected_at_construction() {
        let err = SubdomainAllocator::new(0, 100).unwrap_err();
        assert!(matches!(err, Error::InvalidSubdomainLength(0)));
    }
}
