use arc_swap::ArcSwap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Maps an original destination to the relay endpoint that should front it.
/// `None` means no relay is available; the engine then fails open.
pub trait ServerSelect: Send + Sync {
    fn select_server(&self, dst_addr: IpAddr, dst_port: u16) -> Option<SocketAddr>;
}

/// Set of relay servers, replaceable at runtime without locking readers.
pub struct ServerPool {
    servers: ArcSwap<Vec<SocketAddr>>,
}

impl Default for ServerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerPool {
    pub fn new() -> Self {
        Self {
            servers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn with_servers(servers: Vec<SocketAddr>) -> Self {
        Self {
            servers: ArcSwap::from_pointee(servers),
        }
    }

    /// Swap in a new server set; in-flight selections keep the old snapshot.
    pub fn replace(&self, servers: Vec<SocketAddr>) {
        self.servers.store(Arc::new(servers));
    }

    pub fn clear(&self) {
        self.replace(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.servers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.load().is_empty()
    }
}

impl ServerSelect for ServerPool {
    /// Sticky selection: the same original destination always lands on the
    /// same relay as long as the pool is unchanged, so retransmitted first
    /// packets bootstrap toward one endpoint.
    fn select_server(&self, dst_addr: IpAddr, dst_port: u16) -> Option<SocketAddr> {
        let servers = self.servers.load();
        if servers.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        dst_addr.hash(&mut hasher);
        dst_port.hash(&mut hasher);
        let idx = (hasher.finish() % servers.len() as u64) as usize;
        Some(servers[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn relays(n: u8) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10 + i)), 8443))
            .collect()
    }

    #[test]
    fn test_empty_pool_selects_none() {
        let pool = ServerPool::new();
        assert!(pool.is_empty());
        assert_eq!(
            pool.select_server(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 443),
            None
        );
    }

    #[test]
    fn test_selection_is_sticky_and_in_pool() {
        let servers = relays(4);
        let pool = ServerPool::with_servers(servers.clone());
        let dst = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
        let picked = pool.select_server(dst, 443).unwrap();
        assert!(servers.contains(&picked));
        for _ in 0..16 {
            assert_eq!(pool.select_server(dst, 443), Some(picked));
        }
    }

    #[test]
    fn test_replace_and_clear() {
        let pool = ServerPool::with_servers(relays(2));
        let dst = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        assert!(pool.select_server(dst, 53).is_some());
        let next = relays(1);
        pool.replace(next.clone());
        assert_eq!(pool.select_server(dst, 53), Some(next[0]));
        pool.clear();
        assert_eq!(pool.select_server(dst, 53), None);
    }
}
