//! Names and addresses derived from a slot index.
//!
//! Every sandbox lives in its own network namespace with an identical
//! inside view: tap `tap0` at 169.254.0.22/30 and the guest at
//! 169.254.0.21. That is what lets one snapshot restore into many
//! sandboxes. The namespace is reached from the host through a veth pair
//! on a per-slot /30, and NAT inside the namespace rewrites the guest
//! address to a per-slot "host cloned" address the host can route to.

use serde::Serialize;

pub const TAP_NAME: &str = "tap0";
pub const TAP_IP: &str = "169.254.0.22";
pub const TAP_MASK: u8 = 30;

pub const GUEST_IP: &str = "169.254.0.21";
pub const GUEST_NETMASK: &str = "255.255.255.252";
pub const GUEST_MAC: &str = "02:FC:00:00:00:05";
pub const GUEST_IFACE: &str = "eth0";

pub const VPEER_NAME: &str = "veth0";
pub const VETH_MASK: u8 = 30;

const NETNS_PREFIX: &str = "cove-ns-";
const VETH_PREFIX: &str = "cove-veth-";

/// /30 blocks per last octet.
const BLOCKS_PER_OCTET: u32 = 256 >> (32 - VETH_MASK as u32);

/// Second octet of veth addresses and third of host-cloned ones.
const BASE_OCTET: u32 = 168;

/// Largest index that still maps to valid addresses. Host-cloned
/// addresses run out first, at 254 per third octet.
pub const MAX_SLOT_INDEX: u32 = (256 - BASE_OCTET) * 254 - 1;

/// Kernel `ip=` argument matching the fixed inside-namespace addressing.
pub fn guest_ip_boot_arg() -> String {
    format!("ip={GUEST_IP}::{TAP_IP}:{GUEST_NETMASK}:fc-instance:{GUEST_IFACE}:off:8.8.8.8")
}

/// One allocated network identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NetworkSlot {
    idx: u32,
}

impl NetworkSlot {
    pub fn new(idx: u32) -> Self {
        Self { idx }
    }

    pub fn idx(&self) -> u32 {
        self.idx
    }

    /// Recover the slot from a namespace name produced by [`netns_name`](Self::netns_name).
    pub fn from_netns_name(name: &str) -> Option<Self> {
        name.strip_prefix(NETNS_PREFIX)?.parse().ok().map(Self::new)
    }

    pub fn netns_name(&self) -> String {
        format!("{NETNS_PREFIX}{}", self.idx)
    }

    /// Host end of the veth pair.
    pub fn veth_name(&self) -> String {
        format!("{VETH_PREFIX}{}", self.idx)
    }

    fn veth_octets(&self) -> (u32, u32, u32) {
        let lower = self.idx % BLOCKS_PER_OCTET;
        let rem = self.idx / BLOCKS_PER_OCTET;
        let middle = rem % 256;
        let high = rem / 256;
        (BASE_OCTET + high, middle, lower << (32 - VETH_MASK as u32))
    }

    /// Host side of the /30, also the namespace's default gateway.
    pub fn veth_ip(&self) -> String {
        let (high, middle, base) = self.veth_octets();
        format!("10.{high}.{middle}.{}", base + 1)
    }

    /// Namespace side of the /30.
    pub fn vpeer_ip(&self) -> String {
        let (high, middle, base) = self.veth_octets();
        format!("10.{high}.{middle}.{}", base + 2)
    }

    pub fn veth_cidr(&self) -> String {
        format!("{}/{VETH_MASK}", self.veth_ip())
    }

    pub fn vpeer_cidr(&self) -> String {
        format!("{}/{VETH_MASK}", self.vpeer_ip())
    }

    pub fn tap_cidr(&self) -> String {
        format!("{TAP_IP}/{TAP_MASK}")
    }

    /// Address the host uses to reach this sandbox's guest.
    pub fn host_cloned_ip(&self) -> String {
        let low = self.idx % 254 + 1;
        let high = self.idx / 254;
        format!("192.168.{}.{low}", BASE_OCTET + high)
    }

    pub fn host_cloned_cidr(&self) -> String {
        format!("{}/32", self.host_cloned_ip())
    }
}
