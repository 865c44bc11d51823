//! Typed clients for the hypervisors' HTTP-over-unix-socket control APIs.

pub mod cloud_hypervisor;
pub mod firecracker;
mod transport;

pub use cloud_hypervisor::CloudHypervisorClient;
pub use firecracker::FirecrackerClient;
