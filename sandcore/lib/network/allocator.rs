use std::{
    collections::BTreeSet,
    net::Ipv4Addr,
    sync::Mutex,
};

use serde::{Deserialize, Serialize};

use crate::{config::NetworkConfig, SandcoreError, SandcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Prefix of per-sandbox tap devices.
pub const TAP_PREFIX: &str = "tap-";

/// Number of sandbox id characters in a tap device name. Interface names are capped at 15 bytes.
const TAP_ID_CHARS: usize = 8;

/// Highest host octet handed to guests.
const LAST_HOST_OCTET: u8 = 254;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The network identity of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAllocation {
    /// Guest IPv4 address.
    pub ip_address: String,

    /// Guest MAC address.
    pub mac_address: String,

    /// Host tap device.
    pub tap_device: String,

    /// Gateway the guest routes through.
    pub gateway: String,
}

/// Hands out guest addresses from a fixed /24 and manages tap devices.
///
/// The used-octet set is the only state. It is guarded by a synchronous mutex that is never
/// held across an await.
#[derive(Debug)]
pub struct NetworkAllocator {
    config: NetworkConfig,
    used: Mutex<BTreeSet<u8>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetworkAllocator {
    /// Creates an allocator with nothing allocated.
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    /// Allocates the first free address for `sandbox_id`.
    pub fn allocate(&self, sandbox_id: &str) -> SandcoreResult<NetworkAllocation> {
        let octet = {
            let mut used = self.lock();
            let octet = (*self.config.get_first_host_octet()..=LAST_HOST_OCTET)
                .find(|o| !used.contains(o))
                .ok_or_else(|| {
                    SandcoreError::ResourceExhausted("no free guest IP addresses".to_string())
                })?;
            used.insert(octet);
            octet
        };

        let allocation = NetworkAllocation {
            ip_address: self.address_of(octet).to_string(),
            mac_address: mac_for_octet(octet),
            tap_device: tap_device_name(sandbox_id),
            gateway: self.config.gateway().to_string(),
        };

        tracing::debug!(
            sandbox_id,
            ip = %allocation.ip_address,
            tap = %allocation.tap_device,
            "network allocated"
        );

        Ok(allocation)
    }

    /// Returns an address to the pool. Unknown or foreign addresses are ignored.
    pub fn release(&self, ip_address: &str) {
        match self.octet_of(ip_address) {
            Some(octet) => {
                if self.lock().remove(&octet) {
                    tracing::debug!(ip = ip_address, "network released");
                }
            }
            None => tracing::warn!(ip = ip_address, "ignoring release of foreign address"),
        }
    }

    /// Marks an address as held, e.g. when rehydrating from persisted sandboxes at startup.
    pub fn mark_allocated(&self, ip_address: &str) {
        match self.octet_of(ip_address) {
            Some(octet) => {
                self.lock().insert(octet);
            }
            None => tracing::warn!(ip = ip_address, "ignoring foreign address"),
        }
    }

    /// Whether `ip_address` is currently held.
    pub fn is_allocated(&self, ip_address: &str) -> bool {
        self.octet_of(ip_address)
            .is_some_and(|octet| self.lock().contains(&octet))
    }

    /// Number of addresses currently held.
    pub fn allocated_count(&self) -> usize {
        self.lock().len()
    }

    /// The network configuration.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn address_of(&self, octet: u8) -> Ipv4Addr {
        let [a, b, c, _] = self.config.get_guest_network().network().octets();
        Ipv4Addr::new(a, b, c, octet)
    }

    /// The host octet of an address inside the guest network.
    fn octet_of(&self, ip_address: &str) -> Option<u8> {
        let ip: Ipv4Addr = ip_address.parse().ok()?;
        if !self.config.get_guest_network().contains(ip) {
            return None;
        }
        Some(ip.octets()[3])
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u8>> {
        // Every critical section is a single set operation, so a poisoned set is still valid.
        self.used.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The MAC address derived from a host octet.
pub fn mac_for_octet(octet: u8) -> String {
    format!("06:00:AC:10:00:{octet:02X}")
}

/// The tap device name derived from a sandbox id.
pub fn tap_device_name(sandbox_id: &str) -> String {
    let prefix: String = sandbox_id.chars().take(TAP_ID_CHARS).collect();
    format!("{TAP_PREFIX}{prefix}")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn allocator() -> NetworkAllocator {
        NetworkAllocator::new(NetworkConfig::default())
    }

    #[test]
    fn test_allocate_derives_identity() -> anyhow::Result<()> {
        let allocator = allocator();
        let allocation = allocator.allocate("abcdefghijkl")?;

        assert_eq!(allocation.ip_address, "172.16.0.10");
        assert_eq!(allocation.mac_address, "06:00:AC:10:00:0A");
        assert_eq!(allocation.tap_device, "tap-abcdefgh");
        assert_eq!(allocation.gateway, "172.16.0.1");

        Ok(())
    }

    #[test]
    fn test_allocations_are_exclusive_until_released() -> anyhow::Result<()> {
        let allocator = allocator();
        let first = allocator.allocate("a")?;
        let second = allocator.allocate("b")?;
        assert_ne!(first.ip_address, second.ip_address);

        allocator.release(&first.ip_address);
        let third = allocator.allocate("c")?;
        assert_eq!(third.ip_address, first.ip_address);

        let fourth = allocator.allocate("d")?;
        assert_ne!(fourth.ip_address, second.ip_address);
        assert_ne!(fourth.ip_address, third.ip_address);

        Ok(())
    }

    #[test]
    fn test_exhaustion() -> anyhow::Result<()> {
        let allocator = allocator();
        let mut seen = HashSet::new();
        for i in 10..=254 {
            let allocation = allocator.allocate(&format!("s{i}"))?;
            assert!(seen.insert(allocation.ip_address));
        }

        let err = allocator.allocate("one-too-many").unwrap_err();
        assert!(matches!(err, SandcoreError::ResourceExhausted(_)));
        assert_eq!(allocator.allocated_count(), 245);

        Ok(())
    }

    #[test]
    fn test_mark_allocated_prevents_reuse() -> anyhow::Result<()> {
        let allocator = allocator();
        allocator.mark_allocated("172.16.0.10");
        allocator.mark_allocated("172.16.0.11");
        allocator.mark_allocated("10.0.0.12");
        allocator.mark_allocated("not-an-ip");

        assert!(allocator.is_allocated("172.16.0.10"));
        assert_eq!(allocator.allocated_count(), 2);
        assert_eq!(allocator.allocate("x")?.ip_address, "172.16.0.12");

        Ok(())
    }

    #[test]
    fn test_concurrent_allocations_never_collide() {
        let allocator = std::sync::Arc::new(allocator());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..20)
                        .map(|i| allocator.allocate(&format!("t{t}-{i}")).unwrap().ip_address)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for ip in handle.join().unwrap() {
                assert!(all.insert(ip), "duplicate allocation");
            }
        }
        assert_eq!(all.len(), 160);
    }
}
