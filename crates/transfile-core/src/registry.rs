//! Memory registration for zero-copy delivery.
//!
//! Every catalog buffer is registered once at build time and stays
//! registered until its [`Registration`] guard is dropped. The registrar is
//! a trait so the catalog does not care whether keys come from an RDMA
//! adapter or from the in-process bookkeeping used by the TCP transport.

use crate::error::RegistrationError;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Opaque registration key (the local key of a registered region).
///
/// `RegistrationKey::NONE` marks a buffer that was not registered; the
/// transport copies such attachments instead of writing them in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationKey(u32);

impl RegistrationKey {
    /// Key carried by unregistered buffers
    pub const NONE: Self = Self(0);

    /// Wrap a raw key value
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw key value
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Whether this key refers to a registered region
    #[must_use]
    pub const fn is_registered(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for RegistrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Registers memory regions with a zero-copy capable transport.
pub trait MemoryRegistrar: Send + Sync {
    /// Register `region`, returning the key the transport uses to reach it.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError` if the region cannot be registered.
    fn register(&self, region: &[u8]) -> Result<RegistrationKey, RegistrationError>;

    /// Release a registration. Returns `false` if the key was unknown.
    fn deregister(&self, key: RegistrationKey) -> bool;

    /// Whether keys from this registrar allow in-place attachment writes
    fn zero_copy(&self) -> bool;
}

/// RAII guard for one registered region.
///
/// The region is deregistered when the guard is dropped.
pub struct Registration {
    key: RegistrationKey,
    registrar: Arc<dyn MemoryRegistrar>,
}

impl Registration {
    /// Register `region` with `registrar`.
    ///
    /// # Errors
    ///
    /// Propagates the registrar's error.
    pub fn new(
        registrar: &Arc<dyn MemoryRegistrar>,
        region: &[u8],
    ) -> Result<Self, RegistrationError> {
        let key = registrar.register(region)?;
        Ok(Self {
            key,
            registrar: Arc::clone(registrar),
        })
    }

    /// Key for this registration
    #[must_use]
    pub fn key(&self) -> RegistrationKey {
        self.key
    }

    /// Whether the transport may write this region in place
    #[must_use]
    pub fn zero_copy(&self) -> bool {
        self.key.is_registered() && self.registrar.zero_copy()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.key.is_registered() && !self.registrar.deregister(self.key) {
            tracing::warn!(key = %self.key, "deregistering unknown region");
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("key", &self.key).finish()
    }
}

/// In-process registrar with an optional byte budget.
///
/// Keys are issued sequentially starting at 1. The budget mirrors the
/// pinned-memory limit of an RDMA adapter: a registration that would push
/// the total past it fails.
#[derive(Debug)]
pub struct LocalRegistrar {
    regions: DashMap<RegistrationKey, usize>,
    next_key: AtomicU32,
    registered_bytes: AtomicUsize,
    budget: Option<usize>,
}

impl LocalRegistrar {
    /// Registrar with no byte budget
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: DashMap::new(),
            next_key: AtomicU32::new(1),
            registered_bytes: AtomicUsize::new(0),
            budget: None,
        }
    }

    /// Registrar refusing registrations past `budget` bytes in total
    #[must_use]
    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget: Some(budget),
            ..Self::new()
        }
    }

    /// Number of live registrations
    #[must_use]
    pub fn registered_regions(&self) -> usize {
        self.regions.len()
    }

    /// Total bytes currently registered
    #[must_use]
    pub fn registered_bytes(&self) -> usize {
        self.registered_bytes.load(Ordering::Acquire)
    }

    fn reserve(&self, len: usize) -> Result<(), RegistrationError> {
        let Some(budget) = self.budget else {
            self.registered_bytes.fetch_add(len, Ordering::AcqRel);
            return Ok(());
        };

        self.registered_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(len).filter(|total| *total <= budget)
            })
            .map(|_| ())
            .map_err(|current| RegistrationError::Exhausted {
                requested: len,
                available: budget.saturating_sub(current),
            })
    }
}

impl Default for LocalRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistrar for LocalRegistrar {
    fn register(&self, region: &[u8]) -> Result<RegistrationKey, RegistrationError> {
        self.reserve(region.len())?;

        let raw = self.next_key.fetch_add(1, Ordering::Relaxed);
        if raw == 0 {
            // Wrapped around: 0 is reserved for unregistered buffers
            self.registered_bytes
                .fetch_sub(region.len(), Ordering::AcqRel);
            return Err(RegistrationError::KeysExhausted);
        }

        let key = RegistrationKey::new(raw);
        self.regions.insert(key, region.len());
        Ok(key)
    }

    fn deregister(&self, key: RegistrationKey) -> bool {
        match self.regions.remove(&key) {
            Some((_, len)) => {
                self.registered_bytes.fetch_sub(len, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    fn zero_copy(&self) -> bool {
        true
    }
}

/// Registrar used when zero-copy delivery is disabled.
///
/// Every buffer gets [`RegistrationKey::NONE`], so attachments are copied
/// into the outgoing frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughRegistrar;

impl MemoryRegistrar for PassthroughRegistrar {
    fn register(&self, _region: &[u8]) -> Result<RegistrationKey, RegistrationError> {
        Ok(RegistrationKey::NONE)
    }

    fn deregister(&self, _key: RegistrationKey) -> bool {
        true
    }

    fn zero_copy(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_registrar_issues_distinct_keys() {
        let registrar = LocalRegistrar::new();
        let a = registrar.register(b"aaa").unwrap();
        let b = registrar.register(b"bbbb").unwrap();

        assert_ne!(a, b);
        assert!(a.is_registered());
        assert_eq!(registrar.registered_regions(), 2);
        assert_eq!(registrar.registered_bytes(), 7);

        assert!(registrar.deregister(a));
        assert!(!registrar.deregister(a));
        assert_eq!(registrar.registered_bytes(), 4);
    }

    #[test]
    fn test_local_registrar_budget() {
        let registrar = LocalRegistrar::with_budget(8);
        registrar.register(&[0u8; 5]).unwrap();

        let err = registrar.register(&[0u8; 4]).unwrap_err();
        assert_eq!(
            err,
            RegistrationError::Exhausted {
                requested: 4,
                available: 3
            }
        );

        // A failed registration must not consume budget
        registrar.register(&[0u8; 3]).unwrap();
        assert_eq!(registrar.registered_bytes(), 8);
    }

    #[test]
    fn test_empty_region_registers() {
        let registrar = LocalRegistrar::with_budget(0);
        let key = registrar.register(&[]).unwrap();
        assert!(key.is_registered());
    }

    #[test]
    fn test_registration_guard_deregisters_on_drop() {
        let local = Arc::new(LocalRegistrar::new());
        let registrar: Arc<dyn MemoryRegistrar> = local.clone();

        let guard = Registration::new(&registrar, b"payload").unwrap();
        assert!(guard.zero_copy());
        assert_eq!(local.registered_regions(), 1);

        drop(guard);
        assert_eq!(local.registered_regions(), 0);
        assert_eq!(local.registered_bytes(), 0);
    }

    #[test]
    fn test_passthrough_registrar() {
        let registrar: Arc<dyn MemoryRegistrar> = Arc::new(PassthroughRegistrar);
        let guard = Registration::new(&registrar, b"payload").unwrap();
        assert_eq!(guard.key(), RegistrationKey::NONE);
        assert!(!guard.zero_copy());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(RegistrationKey::new(0x2a).to_string(), "0x0000002a");
    }
}
