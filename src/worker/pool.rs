//! Per-strand connection pool
//!
//! Connections are keyed by the logical id flowops carry. A newer connection registered
//! under an id shadows an older one with the same id, so the pool is kept newest first.
//! Lookups go through a small direct-mapped cache of pool positions; any insert or
//! removal shifts positions and flushes it.

use crate::transport::Transport;
use tracing::debug;

const CACHE_SLOTS: usize = 8;

pub struct ConnectionPool {
    /// Newest first
    conns: Vec<(u32, Box<dyn Transport>)>,
    cache: [Option<(u32, usize)>; CACHE_SLOTS],
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            conns: Vec::new(),
            cache: [None; CACHE_SLOTS],
        }
    }

    fn flush_cache(&mut self) {
        self.cache = [None; CACHE_SLOTS];
    }

    pub fn add(&mut self, id: u32, conn: Box<dyn Transport>) {
        self.conns.insert(0, (id, conn));
        self.flush_cache();
    }

    fn position(&mut self, id: u32) -> Option<usize> {
        let slot = id as usize % CACHE_SLOTS;
        if let Some((cached, pos)) = self.cache[slot] {
            if cached == id {
                return Some(pos);
            }
        }
        let pos = self.conns.iter().position(|(cid, _)| *cid == id)?;
        self.cache[slot] = Some((id, pos));
        Some(pos)
    }

    pub fn get(&mut self, id: u32) -> Option<&mut Box<dyn Transport>> {
        let pos = self.position(id)?;
        self.conns.get_mut(pos).map(|(_, c)| c)
    }

    /// Remove the newest connection registered under `id`
    pub fn remove(&mut self, id: u32) -> Option<Box<dyn Transport>> {
        let pos = self.position(id)?;
        self.flush_cache();
        Some(self.conns.remove(pos).1)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Disconnect and drop every connection
    pub fn close_all(&mut self) {
        for (id, mut conn) in self.conns.drain(..) {
            if let Err(e) = conn.disconnect() {
                debug!("Closing connection {} failed: {}", id, e);
            }
        }
        self.flush_cache();
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockOp, MockProvider};
    use crate::transport::TransportProvider;
    use crate::workload::FlowopOptions;
    use std::sync::atomic::AtomicBool;

    fn conn(p: &MockProvider) -> Box<dyn Transport> {
        p.connect("h", 1, &FlowopOptions::default(), &AtomicBool::new(false))
            .unwrap()
    }

    #[test]
    fn test_newest_connection_shadows_same_id() {
        let p = MockProvider::new();
        let mut pool = ConnectionPool::new();
        pool.add(1, conn(&p));
        pool.add(2, conn(&p));
        assert!(pool.get(1).is_some());
        pool.add(1, conn(&p));
        assert_eq!(pool.len(), 3);

        // removing id 1 takes the newest; the older one is still reachable
        assert!(pool.remove(1).is_some());
        assert!(pool.get(1).is_some());
        assert!(pool.remove(1).is_some());
        assert!(pool.get(1).is_none());
        assert!(pool.get(2).is_some());
    }

    #[test]
    fn test_cache_survives_shifted_positions() {
        let p = MockProvider::new();
        let mut pool = ConnectionPool::new();
        pool.add(9, conn(&p));
        assert!(pool.get(9).is_some());
        pool.add(1, conn(&p));
        // 9 and 1 share a cache slot, and 9 has moved
        assert!(pool.get(9).is_some());
        assert!(pool.remove(1).is_some());
        assert!(pool.get(9).is_some());
        assert!(pool.remove(5).is_none());
    }

    #[test]
    fn test_close_all_disconnects() {
        let p = MockProvider::new();
        let mut pool = ConnectionPool::new();
        pool.add(1, conn(&p));
        pool.add(2, conn(&p));
        pool.close_all();
        assert!(pool.is_empty());
        let disconnects = p
            .operations()
            .into_iter()
            .filter(|op| *op == MockOp::Disconnect)
            .count();
        assert_eq!(disconnects, 2);
    }
}
