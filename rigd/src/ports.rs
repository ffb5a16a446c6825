//! Loopback port assignment, grouped by a release key (the environment
//! instance id). A port is discovered by binding an ephemeral listener,
//! then immediately released so the service itself can bind it; the
//! allocator remembers every live assignment so the same port is never
//! handed out twice while any holder is alive.

use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::Mutex;

use anyhow::Context;

const MAX_BIND_ATTEMPTS: usize = 64;

#[derive(Default)]
struct Inner {
    in_use: HashSet<u16>,
    by_key: HashMap<String, Vec<u16>>,
}

#[derive(Default)]
pub struct PortAllocator {
    inner: Mutex<Inner>,
}

impl PortAllocator {
    pub fn new() -> Self {
        PortAllocator::default()
    }

    /// Assign `n` free loopback TCP ports to `release_key`. The returned
    /// ports are sorted, so equal specs get reproducible ingress-to-port
    /// pairings. On a bind failure the ports already taken by this call
    /// are returned to the pool.
    pub fn allocate(&self, release_key: &str, n: usize) -> anyhow::Result<Vec<u16>> {
        let mut taken = Vec::with_capacity(n);
        let result = (|| {
            for _ in 0..n {
                taken.push(self.bind_one(&taken)?);
            }
            Ok(())
        })();

        let mut inner = self.inner.lock().unwrap();
        match result {
            Ok(()) => {
                taken.sort_unstable();
                inner
                    .by_key
                    .entry(release_key.to_string())
                    .or_default()
                    .extend(&taken);
                Ok(taken)
            }
            Err(e) => {
                for port in taken {
                    inner.in_use.remove(&port);
                }
                Err(e)
            }
        }
    }

    fn bind_one(&self, this_call: &[u16]) -> anyhow::Result<u16> {
        for _ in 0..MAX_BIND_ATTEMPTS {
            let listener =
                TcpListener::bind("127.0.0.1:0").context("failed to bind an ephemeral port")?;
            let port = listener
                .local_addr()
                .context("failed to read bound address")?
                .port();
            drop(listener);

            let mut inner = self.inner.lock().unwrap();
            if !inner.in_use.contains(&port) && !this_call.contains(&port) {
                inner.in_use.insert(port);
                return Ok(port);
            }
            // The OS handed back a port we already assigned elsewhere; try
            // again.
        }
        anyhow::bail!("could not find a free port in {MAX_BIND_ATTEMPTS} attempts")
    }

    /// Free every port assigned to `release_key`.
    pub fn release(&self, release_key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ports) = inner.by_key.remove(release_key) {
            for port in ports {
                inner.in_use.remove(&port);
            }
        }
    }

    /// Ports currently assigned to `release_key`, for diagnostics.
    pub fn assigned(&self, release_key: &str) -> Vec<u16> {
        self.inner
            .lock()
            .unwrap()
            .by_key
            .get(release_key)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_distinct_and_sorted() {
        let allocator = PortAllocator::new();
        let ports = allocator.allocate("env-1", 5).unwrap();
        assert_eq!(ports.len(), 5);
        let mut sorted = ports.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ports, sorted);
    }

    #[test]
    fn no_reuse_across_keys_until_release() {
        let allocator = PortAllocator::new();
        let a = allocator.allocate("a", 3).unwrap();
        let b = allocator.allocate("b", 3).unwrap();
        for port in &b {
            assert!(!a.contains(port));
        }

        allocator.release("a");
        assert!(allocator.assigned("a").is_empty());
        assert_eq!(allocator.assigned("b").len(), 3);
    }

    #[test]
    fn release_of_unknown_key_is_a_noop() {
        let allocator = PortAllocator::new();
        allocator.release("never-seen");
    }
}
