//! Server-side handler for `TransferFile` calls.

use crate::catalog::{Catalog, FileView};
use crate::message::{FileRequest, FileResponse, TransferRequest, TransferResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponderStats {
    /// Requests answered with a file
    pub hits: u64,
    /// Requests for keys not in the catalog
    pub misses: u64,
}

/// Answers lookups against a shared, read-only catalog.
///
/// Handlers run concurrently on the transport's worker pool; the catalog is
/// never mutated while serving, so no locking is needed.
#[derive(Debug)]
pub struct TransferResponder {
    catalog: Arc<Catalog>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TransferResponder {
    /// Responder serving `catalog`
    #[must_use]
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up `request.key`.
    ///
    /// On a hit the result holds a shared view of the catalog buffer; the
    /// response never frees or mutates it.
    pub fn handle(&self, request: &TransferRequest) -> TransferResult {
        match self.catalog.find(&request.key) {
            Some(view) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                info!(
                    key = %request.key,
                    size = view.len(),
                    registration = %view.registration_key(),
                    "transfer request found"
                );
                TransferResult::Succeeded(view)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                info!(key = %request.key, "transfer request not found");
                TransferResult::NotFound
            }
        }
    }

    /// Handle a wire request, returning the wire response and attachment
    pub fn handle_wire(&self, request: FileRequest) -> (FileResponse, Option<FileView>) {
        self.handle(&TransferRequest::from(request)).into_wire()
    }

    /// Catalog being served
    #[must_use]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Counters since startup
    #[must_use]
    pub fn stats(&self) -> ResponderStats {
        ResponderStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{LocalRegistrar, MemoryRegistrar};

    fn responder() -> TransferResponder {
        let registrar: Arc<dyn MemoryRegistrar> = Arc::new(LocalRegistrar::new());
        let catalog = Catalog::from_parts(
            [("20230101", b"AAA".to_vec()), ("20230301", b"BBB".to_vec())],
            registrar,
        )
        .unwrap();
        TransferResponder::new(Arc::new(catalog))
    }

    #[test]
    fn test_handle_hit() {
        let responder = responder();
        let result = responder.handle(&TransferRequest::new("20230301"));

        let view = result.payload().expect("hit carries a payload");
        assert_eq!(view.bytes(), b"BBB");
        assert!(view.zero_copy());
        assert_eq!(responder.stats(), ResponderStats { hits: 1, misses: 0 });
    }

    #[test]
    fn test_handle_miss() {
        let responder = responder();
        let result = responder.handle(&TransferRequest::new("20230201"));

        assert!(!result.is_success());
        assert!(result.payload().is_none());
        assert_eq!(responder.stats(), ResponderStats { hits: 0, misses: 1 });
    }

    #[test]
    fn test_handle_wire() {
        let responder = responder();

        let (response, attachment) = responder.handle_wire(FileRequest {
            datetime_key: "20230101".to_string(),
        });
        assert_eq!(response.message, "Succ");
        assert_eq!(attachment.unwrap().bytes(), b"AAA");

        let (response, attachment) = responder.handle_wire(FileRequest {
            datetime_key: "missing".to_string(),
        });
        assert_eq!(response.message, "Fail");
        assert!(attachment.is_none());
    }

    #[test]
    fn test_payload_shares_catalog_buffer() {
        let responder = responder();
        let result = responder.handle(&TransferRequest::new("20230101"));
        let from_catalog = responder.catalog().find("20230101").unwrap();

        let view = result.payload().unwrap();
        assert_eq!(view.bytes().as_ptr(), from_catalog.bytes().as_ptr());
    }

    #[test]
    fn test_concurrent_lookups() {
        let registrar: Arc<dyn MemoryRegistrar> = Arc::new(LocalRegistrar::new());
        let parts: Vec<(String, Vec<u8>)> = (0..64u8)
            .map(|i| (format!("key-{i:03}"), vec![i; usize::from(i) + 1]))
            .collect();
        let catalog = Catalog::from_parts(parts, registrar).unwrap();
        let responder = Arc::new(TransferResponder::new(Arc::new(catalog)));

        let handles: Vec<_> = (0..64u8)
            .map(|i| {
                let responder = Arc::clone(&responder);
                std::thread::spawn(move || {
                    let result = responder.handle(&TransferRequest::new(format!("key-{i:03}")));
                    let view = result.payload().unwrap().clone();
                    assert_eq!(view.len(), usize::from(i) + 1);
                    assert!(view.bytes().iter().all(|b| *b == i));
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(responder.stats().hits, 64);
    }
}
