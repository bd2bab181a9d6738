//! Port allocation for concurrently running cases

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{E2eError, E2eResult};

const MAX_ATTEMPTS: usize = 64;

static SHARED: Lazy<PortAllocator> = Lazy::new(PortAllocator::new);

/// Hands out free TCP ports, never the same one twice while a lease is live
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    issued: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    /// Create an allocator with its own issued-port registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide allocator
    pub fn shared() -> Self {
        SHARED.clone()
    }

    /// Reserve a port that is free right now and not leased to anyone else
    ///
    /// The OS picks the port; the listener is dropped before returning, so a
    /// wholly external process can still race us for it. That surfaces later
    /// as a bind failure in the server under test.
    pub fn acquire(&self) -> E2eResult<PortLease> {
        for _ in 0..MAX_ATTEMPTS {
            let port = TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();

            let mut issued = self.issued.lock();
            if issued.insert(port) {
                debug!("Leased port {}", port);
                return Ok(PortLease {
                    port,
                    issued: Arc::clone(&self.issued),
                });
            }
        }

        Err(E2eError::PortExhausted {
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Number of ports currently leased
    pub fn leased(&self) -> usize {
        self.issued.lock().len()
    }
}

/// A leased port, returned to the allocator on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    issued: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.issued.lock().remove(&self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_acquire_returns_usable_port() {
        let allocator = PortAllocator::new();
        let lease = allocator.acquire().unwrap();
        assert!(lease.port() > 1024);
        // The port must be bindable by whoever we hand it to
        let listener = TcpListener::bind(("127.0.0.1", lease.port())).unwrap();
        drop(listener);
    }

    #[test]
    fn test_concurrent_leases_are_distinct() {
        let allocator = PortAllocator::new();
        let callers = 32;
        let barrier = Arc::new(Barrier::new(callers));

        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let allocator = allocator.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    allocator.acquire().unwrap()
                })
            })
            .collect();

        let leases: Vec<PortLease> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ports: HashSet<u16> = leases.iter().map(PortLease::port).collect();

        assert_eq!(ports.len(), callers);
        assert_eq!(allocator.leased(), callers);
    }

    #[test]
    fn test_drop_releases_lease() {
        let allocator = PortAllocator::new();
        let lease = allocator.acquire().unwrap();
        assert_eq!(allocator.leased(), 1);
        drop(lease);
        assert_eq!(allocator.leased(), 0);
    }

    #[test]
    fn test_exhaustion_has_its_own_error() {
        let allocator = PortAllocator::new();
        allocator.issued.lock().extend(1..=u16::MAX);

        let err = allocator.acquire().unwrap_err();
        assert!(matches!(err, E2eError::PortExhausted { attempts: MAX_ATTEMPTS }));
    }
}
