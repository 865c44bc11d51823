//! Sandbox network attachment.
//!
//! A [`SlotPool`] bounds how many sandboxes can be attached at once and
//! hands out indices; a [`NetworkSlot`] turns an index into device names
//! and addresses; a [`NetworkDriver`] creates and removes the devices.

mod driver;
mod pool;
mod slot;

pub use driver::{
    is_missing, parse_default_gateway, parse_netns_list, setup_steps, teardown_steps,
    IpCommandDriver, NetworkDriver, Step,
};
pub use pool::{SlotPool, DEFAULT_MAX_SLOTS};
pub use slot::{
    guest_ip_boot_arg, NetworkSlot, GUEST_IFACE, GUEST_IP, GUEST_MAC, GUEST_NETMASK,
    MAX_SLOT_INDEX, TAP_IP, TAP_NAME, VPEER_NAME,
};

use cove_vmm::NetworkConfig;

/// Guest interface description handed to the hypervisor. Identical for
/// every slot, since each sandbox has its own namespace.
pub fn guest_network_config() -> NetworkConfig {
    NetworkConfig {
        iface_id: GUEST_IFACE.to_string(),
        host_dev_name: TAP_NAME.to_string(),
        guest_mac: GUEST_MAC.to_string(),
    }
}
