//! Wiring slots into the host network stack.

use super::slot::{NetworkSlot, GUEST_IP, TAP_NAME, VPEER_NAME};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// Creates and removes the devices behind a [`NetworkSlot`].
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Namespace, veth pair, tap, NAT and host routes for `slot`.
    async fn setup(&self, slot: &NetworkSlot) -> Result<()>;

    /// Undo [`setup`](Self::setup). Already-removed pieces are not errors.
    async fn teardown(&self, slot: &NetworkSlot) -> Result<()>;

    /// Slots whose namespace currently exists on the host.
    async fn list_namespaces(&self) -> Result<Vec<NetworkSlot>>;
}

/// Production driver shelling out to `ip` and `iptables`.
#[derive(Debug, Clone, Default)]
pub struct IpCommandDriver {
    /// Uplink interface. Looked up from the default route when unset.
    gateway: Option<String>,
}

impl IpCommandDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gateway(gateway: impl Into<String>) -> Self {
        Self {
            gateway: Some(gateway.into()),
        }
    }

    async fn gateway(&self) -> Result<String> {
        if let Some(gw) = &self.gateway {
            return Ok(gw.clone());
        }
        let out = run("ip", &args(&["route", "show", "default"])).await?;
        parse_default_gateway(&out)
            .ok_or_else(|| CoreError::Network("cannot find default gateway".into()))
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// A single `(program, argv)` step.
pub type Step = (&'static str, Vec<String>);

/// Steps that bring `slot` up, in order.
pub fn setup_steps(slot: &NetworkSlot, gateway: &str) -> Vec<Step> {
    let ns = slot.netns_name();
    let veth = slot.veth_name();
    let cloned = slot.host_cloned_ip();
    let in_ns = |rest: &[&str]| {
        let mut v = args(&["netns", "exec", &ns, "iptables"]);
        v.extend(args(rest));
        ("ip", v)
    };
    vec![
        ("ip", args(&["netns", "add", &ns])),
        (
            "ip",
            args(&["link", "add", &veth, "type", "veth", "peer", "name", VPEER_NAME, "netns", &ns]),
        ),
        ("ip", args(&["-n", &ns, "link", "set", VPEER_NAME, "up"])),
        ("ip", args(&["-n", &ns, "addr", "add", &slot.vpeer_cidr(), "dev", VPEER_NAME])),
        ("ip", args(&["link", "set", &veth, "up"])),
        ("ip", args(&["addr", "add", &slot.veth_cidr(), "dev", &veth])),
        ("ip", args(&["-n", &ns, "tuntap", "add", "dev", TAP_NAME, "mode", "tap"])),
        ("ip", args(&["-n", &ns, "link", "set", TAP_NAME, "up"])),
        ("ip", args(&["-n", &ns, "addr", "add", &slot.tap_cidr(), "dev", TAP_NAME])),
        ("ip", args(&["-n", &ns, "link", "set", "lo", "up"])),
        ("ip", args(&["-n", &ns, "route", "add", "default", "via", &slot.veth_ip()])),
        // Guest traffic leaves the namespace as the cloned address...
        in_ns(&[
            "-t", "nat", "-A", "POSTROUTING", "-o", VPEER_NAME, "-s", GUEST_IP, "-j", "SNAT",
            "--to-source", &cloned,
        ]),
        // ...and traffic to the cloned address is handed back to the guest.
        in_ns(&[
            "-t", "nat", "-A", "PREROUTING", "-i", VPEER_NAME, "-d", &cloned, "-j", "DNAT",
            "--to-destination", GUEST_IP,
        ]),
        ("ip", args(&["route", "add", &slot.host_cloned_cidr(), "via", &slot.vpeer_ip()])),
        ("iptables", args(&["-A", "FORWARD", "-i", &veth, "-o", gateway, "-j", "ACCEPT"])),
        ("iptables", args(&["-A", "FORWARD", "-i", gateway, "-o", &veth, "-j", "ACCEPT"])),
        (
            "iptables",
            args(&["-t", "nat", "-A", "POSTROUTING", "-s", &cloned, "-o", gateway, "-j", "MASQUERADE"]),
        ),
    ]
}

/// Steps that remove host-side state for `slot`. Deleting the namespace
/// takes the tap, the vpeer and the namespace's own NAT rules with it.
pub fn teardown_steps(slot: &NetworkSlot, gateway: &str) -> Vec<Step> {
    let veth = slot.veth_name();
    let cloned = slot.host_cloned_ip();
    vec![
        ("iptables", args(&["-D", "FORWARD", "-i", &veth, "-o", gateway, "-j", "ACCEPT"])),
        ("iptables", args(&["-D", "FORWARD", "-i", gateway, "-o", &veth, "-j", "ACCEPT"])),
        (
            "iptables",
            args(&["-t", "nat", "-D", "POSTROUTING", "-s", &cloned, "-o", gateway, "-j", "MASQUERADE"]),
        ),
        ("ip", args(&["route", "del", &slot.host_cloned_cidr(), "via", &slot.vpeer_ip()])),
        ("ip", args(&["link", "del", &veth])),
        ("ip", args(&["netns", "del", &slot.netns_name()])),
    ]
}

/// Whether a failed command only reports that its target is already gone.
pub fn is_missing(stderr: &str) -> bool {
    const MARKERS: &[&str] = &[
        "Cannot find device",
        "No such file or directory",
        "No such process",
        "does not exist",
        "Bad rule",
        "does a matching rule exist",
        "Cannot remove namespace",
    ];
    MARKERS.iter().any(|m| stderr.contains(m))
}

/// `default via 10.0.0.1 dev eth0 proto dhcp` → `eth0`
pub fn parse_default_gateway(route_output: &str) -> Option<String> {
    route_output
        .lines()
        .filter(|line| line.starts_with("default"))
        .find_map(|line| {
            let mut words = line.split_whitespace();
            words.find(|w| *w == "dev")?;
            words.next().map(str::to_string)
        })
}

/// `ip netns list` prints `name` or `name (id: 3)` per line.
pub fn parse_netns_list(output: &str) -> Vec<NetworkSlot> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(NetworkSlot::from_netns_name)
        .collect()
}

async fn run(program: &str, argv: &[String]) -> Result<String> {
    let output = Command::new(program)
        .args(argv)
        .output()
        .await
        .map_err(|e| CoreError::Network(format!("failed to execute {program}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CoreError::Network(format!(
            "{program} {} failed: {}",
            argv.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl NetworkDriver for IpCommandDriver {
    async fn setup(&self, slot: &NetworkSlot) -> Result<()> {
        let gateway = self.gateway().await?;
        tracing::debug!(
            slot = slot.idx(),
            netns = %slot.netns_name(),
            veth = %slot.veth_cidr(),
            vpeer = %slot.vpeer_cidr(),
            host_cloned_ip = %slot.host_cloned_ip(),
            "Setting up sandbox network"
        );
        for (program, argv) in setup_steps(slot, &gateway) {
            if let Err(e) = run(program, &argv).await {
                tracing::warn!(slot = slot.idx(), error = %e, "Network setup failed, rolling back");
                if let Err(rollback) = self.teardown(slot).await {
                    tracing::warn!(slot = slot.idx(), error = %rollback, "Network rollback incomplete");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn teardown(&self, slot: &NetworkSlot) -> Result<()> {
        let gateway = self.gateway().await?;
        let mut errors = Vec::new();
        for (program, argv) in teardown_steps(slot, &gateway) {
            match run(program, &argv).await {
                Ok(_) => {}
                Err(CoreError::Network(msg)) if is_missing(&msg) => {
                    tracing::trace!(slot = slot.idx(), %msg, "Already removed");
                }
                Err(e) => errors.push(e),
            }
        }
        tracing::debug!(slot = slot.idx(), failures = errors.len(), "Tore down sandbox network");
        CoreError::aggregate(errors)
    }

    async fn list_namespaces(&self) -> Result<Vec<NetworkSlot>> {
        let out = run("ip", &args(&["netns", "list"])).await?;
        Ok(parse_netns_list(&out))
    }
}
