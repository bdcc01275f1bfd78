//! IPv4 address allocation for a single subnet.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no more IP addresses available")]
    Exhausted,

    #[error("not in pool range: {0}")]
    OutOfRange(Ipv4Addr),

    #[error("already allocated IP {0}")]
    AlreadyAllocated(Ipv4Addr),

    #[error("invalid IP address: {0}")]
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;

struct PoolState {
    next: u32,
    used: HashSet<u32>,
}

/// Allocator for the host addresses of one subnet.
///
/// The usable range excludes the network and broadcast addresses. `next`
/// hands out addresses round-robin starting after the last one it returned.
pub struct AddressPool {
    mask: u32,
    start: u32,
    end: u32,
    state: Mutex<PoolState>,
}

impl AddressPool {
    pub fn new(network: u32, mask: u32) -> Self {
        let start = (network & mask).wrapping_add(1);
        let end = (network | !mask).wrapping_sub(1);
        Self {
            mask,
            start,
            end,
            state: Mutex::new(PoolState {
                next: start,
                used: HashSet::new(),
            }),
        }
    }

    /// First usable address.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Last usable address.
    pub fn end(&self) -> u32 {
        self.end
    }

    /// Number of addresses the pool can hand out.
    pub fn size(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn next(&self) -> Result<u32> {
        if self.size() == 0 {
            return Err(PoolError::Exhausted);
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let origin = state.next;
        let mut current = origin;
        loop {
            let following = if current >= self.end {
                self.start
            } else {
                current + 1
            };
            if state.used.insert(current) {
                state.next = following;
                return Ok(current);
            }
            if following == origin {
                return Err(PoolError::Exhausted);
            }
            current = following;
        }
    }

    pub fn acquire(&self, ip: Ipv4Addr) -> Result<u32> {
        let key = u32::from(ip);
        self.acquire_raw(key)?;
        Ok(key)
    }

    pub fn acquire_from_str(&self, ip: &str) -> Result<u32> {
        let parsed: Ipv4Addr = ip
            .parse()
            .map_err(|_| PoolError::InvalidAddress(ip.to_string()))?;
        self.acquire(parsed)
    }

    /// Reserve an address by its offset into the usable range.
    ///
    /// Negative offsets count back from the end, so `-1` is the last usable
    /// address.
    pub fn acquire_from_offset(&self, offset: i64) -> Result<u32> {
        let key = if offset < 0 {
            i64::from(self.end) + offset + 1
        } else {
            i64::from(self.start) + offset
        };
        let key = u32::try_from(key).map_err(|_| PoolError::InvalidAddress(key.to_string()))?;
        self.acquire_raw(key)?;
        Ok(key)
    }

    fn acquire_raw(&self, key: u32) -> Result<()> {
        if key < self.start || key > self.end {
            return Err(PoolError::OutOfRange(Ipv4Addr::from(key)));
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.used.insert(key) {
            return Err(PoolError::AlreadyAllocated(Ipv4Addr::from(key)));
        }
        Ok(())
    }

    /// Return an address to the pool. Releasing a free address is a no-op.
    pub fn release(&self, ip: u32) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.used.remove(&ip);
    }

    pub fn is_used(&self, ip: u32) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.used.contains(&ip)
    }

    /// Render an address with this pool's prefix length, e.g. `10.0.1.5/24`.
    pub fn format_ip(&self, ip: u32) -> String {
        format!("{}/{}", Ipv4Addr::from(ip), self.mask.leading_ones())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str) -> AddressPool {
        let net: ipnet::Ipv4Net = cidr.parse().unwrap();
        AddressPool::new(u32::from(net.network()), u32::from(net.netmask()))
    }

    #[test]
    fn test_range_excludes_network_and_broadcast() {
        let p = pool("10.0.1.0/24");
        assert_eq!(Ipv4Addr::from(p.start()), Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(Ipv4Addr::from(p.end()), Ipv4Addr::new(10, 0, 1, 254));
        assert_eq!(p.size(), 254);
    }

    #[test]
    fn test_next_sequential() {
        let p = pool("10.0.1.0/24");
        assert_eq!(Ipv4Addr::from(p.next().unwrap()), Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(Ipv4Addr::from(p.next().unwrap()), Ipv4Addr::new(10, 0, 1, 2));
    }

    #[test]
    fn test_exhaustion() {
        let p = pool("10.0.0.0/29");
        let mut seen = HashSet::new();
        for _ in 0..p.size() {
            assert!(seen.insert(p.next().unwrap()));
        }
        assert!(matches!(p.next(), Err(PoolError::Exhausted)));
        assert!(matches!(p.next(), Err(PoolError::Exhausted)));
    }

    #[test]
    fn test_next_rotates_past_released() {
        let p = pool("10.0.0.0/29");
        let first = p.next().unwrap();
        let second = p.next().unwrap();
        p.release(first);

        // continues forward rather than reusing the freed address
        let third = p.next().unwrap();
        assert_eq!(third, second + 1);
    }

    #[test]
    fn test_next_wraps_to_freed_address() {
        let p = pool("10.0.0.0/30");
        let a = p.next().unwrap();
        let _b = p.next().unwrap();
        assert!(p.next().is_err());
        p.release(a);
        assert_eq!(p.next().unwrap(), a);
    }

    #[test]
    fn test_next_skips_reserved() {
        let p = pool("10.0.1.0/24");
        p.acquire(Ipv4Addr::new(10, 0, 1, 1)).unwrap();
        assert_eq!(Ipv4Addr::from(p.next().unwrap()), Ipv4Addr::new(10, 0, 1, 2));
    }

    #[test]
    fn test_acquire_errors() {
        let p = pool("10.0.1.0/24");
        p.acquire_from_str("10.0.1.10").unwrap();
        assert!(matches!(
            p.acquire_from_str("10.0.1.10"),
            Err(PoolError::AlreadyAllocated(_))
        ));
        assert!(matches!(
            p.acquire_from_str("10.0.1.0"),
            Err(PoolError::OutOfRange(_))
        ));
        assert!(matches!(
            p.acquire_from_str("10.0.1.255"),
            Err(PoolError::OutOfRange(_))
        ));
        assert!(matches!(
            p.acquire_from_str("not-an-ip"),
            Err(PoolError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_acquire_from_offset() {
        let p = pool("10.0.1.0/24");
        let last = p.acquire_from_offset(-1).unwrap();
        assert_eq!(Ipv4Addr::from(last), Ipv4Addr::new(10, 0, 1, 254));
        let first = p.acquire_from_offset(0).unwrap();
        assert_eq!(Ipv4Addr::from(first), Ipv4Addr::new(10, 0, 1, 1));
        assert!(p.acquire_from_offset(254).is_err());
    }

    #[test]
    fn test_release_idempotent() {
        let p = pool("10.0.1.0/24");
        let ip = p.next().unwrap();
        assert!(p.is_used(ip));
        p.release(ip);
        p.release(ip);
        assert!(!p.is_used(ip));
        p.acquire(Ipv4Addr::from(ip)).unwrap();
    }

    #[test]
    fn test_format_ip() {
        let p = pool("10.0.1.0/24");
        let ip = p.next().unwrap();
        assert_eq!(p.format_ip(ip), "10.0.1.1/24");
    }

    #[test]
    fn test_concurrent_unique() {
        use std::sync::Arc;
        let p = Arc::new(pool("10.0.0.0/22"));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let p = Arc::clone(&p);
                std::thread::spawn(move || (0..200).map(|_| p.next().unwrap()).collect::<Vec<_>>())
            })
            .collect();
        let mut all = HashSet::new();
        for h in handles {
            for ip in h.join().unwrap() {
                assert!(all.insert(ip));
            }
        }
        assert_eq!(all.len(), 800);
    }
}
