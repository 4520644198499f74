use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use ipnetwork::Ipv4Network;

use crate::ipam::IpamLease;
use crate::syscall::Pid;
use crate::{netlink, Error, Result};

pub(crate) const BRIDGE_NAME: &str = "mbx0";
pub(crate) const BRIDGE_ADDR: Ipv4Addr = Ipv4Addr::new(10, 101, 1, 1);
pub(crate) const SUBNET_ADDR: Ipv4Addr = Ipv4Addr::new(10, 101, 1, 0);
pub(crate) const SUBNET_PREFIX: u8 = 24;

/// Name the peer gets inside the sandbox.
const CONTAINER_IFACE: &str = "eth0";
const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";
/// Well-known external address used to discover the egress interface.
const PROBE_ADDR: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

const IFACE_WAIT: Duration = Duration::from_secs(5);
const IFACE_POLL: Duration = Duration::from_millis(50);

pub(crate) fn subnet() -> Ipv4Network {
    Ipv4Network::new(SUBNET_ADDR, SUBNET_PREFIX).expect("static subnet")
}

/// Host-side veth name; fits IFNAMSIZ for any pid.
pub(crate) fn host_veth_name(pid: Pid) -> String {
    format!("mbxh{pid}")
}

fn peer_veth_name(pid: Pid) -> String {
    format!("mbxp{pid}")
}

/// Host-side networking state owned by the parent. Dropped only after
/// the veth is deleted and the lease released.
#[derive(Debug)]
pub struct NetworkHandle {
    pub(crate) host_veth: String,
    pub(crate) lease: IpamLease,
}

impl NetworkHandle {
    pub(crate) fn new(pid: Pid, lease: IpamLease) -> Self {
        Self {
            host_veth: host_veth_name(pid),
            lease,
        }
    }

    pub fn container_addr(&self) -> Ipv4Addr {
        self.lease.addr
    }
}

/// Builds the host side: bridge, veth pair, forwarding and NAT. The
/// peer end is handed to the child's namespace; the child configures it
/// after it is woken.
pub(crate) fn host_setup(pid: Pid, handle: &NetworkHandle) -> Result<()> {
    ensure_bridge()?;
    let peer = peer_veth_name(pid);
    netlink::create_veth(&handle.host_veth, &peer)
        .map_err(|v| Error::NetlinkFailed(format!("cannot create veth pair: {v}")))?;
    let host_index = netlink::link_index(&handle.host_veth)?
        .ok_or_else(|| Error::NetlinkFailed(format!("{} vanished", handle.host_veth)))?;
    let bridge_index = netlink::link_index(BRIDGE_NAME)?
        .ok_or_else(|| Error::NetlinkFailed(format!("{BRIDGE_NAME} vanished")))?;
    netlink::link_set_controller(host_index, bridge_index)?;
    netlink::link_set_up(host_index)?;
    let peer_index = netlink::link_index(&peer)?
        .ok_or_else(|| Error::NetlinkFailed(format!("{peer} vanished")))?;
    netlink::link_set_netns(peer_index, pid.as_raw())?;
    fs::write(IP_FORWARD, "1")
        .map_err(|v| Error::NetlinkFailed(format!("cannot enable ip forwarding: {v}")))?;
    install_firewall_rules()?;
    Ok(())
}

/// The bridge is shared across sandboxes: create it only when absent,
/// then make sure it carries the gateway address and is up.
fn ensure_bridge() -> Result<()> {
    if netlink::link_index(BRIDGE_NAME)?.is_none() {
        match netlink::create_bridge(BRIDGE_NAME) {
            // Lost the creation race to a concurrent launcher.
            Err(Error::Os(nix::errno::Errno::EEXIST)) => {}
            Err(err) => {
                return Err(Error::NetlinkFailed(format!(
                    "cannot create {BRIDGE_NAME}: {err}"
                )));
            }
            Ok(()) => {}
        }
    }
    let index = netlink::link_index(BRIDGE_NAME)?
        .ok_or_else(|| Error::NetlinkFailed(format!("{BRIDGE_NAME} vanished")))?;
    netlink::address_add(index, BRIDGE_ADDR, SUBNET_PREFIX)?;
    netlink::link_set_up(index)?;
    Ok(())
}

/// Runs in the child, in its own network namespace, after pivot_root.
/// The peer arrives asynchronously from the parent's netns move.
pub(crate) fn child_setup(addr: Ipv4Addr) -> Result<()> {
    let (peer_index, _) = wait_for_interface()?;
    netlink::link_set_name(peer_index, CONTAINER_IFACE)?;
    if let Some(lo) = netlink::link_index("lo")? {
        netlink::link_set_up(lo)?;
    }
    netlink::address_add(peer_index, addr, SUBNET_PREFIX)?;
    netlink::link_set_up(peer_index)?;
    netlink::route_add_default(BRIDGE_ADDR)?;
    Ok(())
}

fn wait_for_interface() -> Result<(u32, String)> {
    let deadline = Instant::now() + IFACE_WAIT;
    loop {
        if let Some(found) = netlink::first_non_loopback()? {
            return Ok(found);
        }
        if Instant::now() >= deadline {
            return Err(Error::NetlinkFailed(
                "network interface did not appear in the sandbox".into(),
            ));
        }
        sleep(IFACE_POLL);
    }
}

/// Deletes the host veth; removing one end removes the pair. The bridge
/// stays, it is shared. The lease is released by the caller.
pub(crate) fn teardown(handle: &NetworkHandle) -> Result<()> {
    if let Some(index) = netlink::link_index(&handle.host_veth)? {
        netlink::delete_link(index)?;
    }
    Ok(())
}

/// Deletes host veths whose owning launcher is gone.
pub(crate) fn collect_stale() {
    let links = match netlink::links() {
        Ok(v) => v,
        Err(_) => return,
    };
    for (index, name) in links {
        let pid = match name.strip_prefix("mbxh").and_then(|v| v.parse::<u32>().ok()) {
            Some(v) => v,
            None => continue,
        };
        if !Path::new(&format!("/proc/{pid}")).exists() {
            let _ = netlink::delete_link(index);
        }
    }
}

enum FirewallBackend {
    Iptables,
    Nft,
}

fn detect_backend() -> Result<FirewallBackend> {
    if tool_exists("iptables") {
        Ok(FirewallBackend::Iptables)
    } else if tool_exists("nft") {
        Ok(FirewallBackend::Nft)
    } else {
        Err(Error::FirewallFailed(
            "neither iptables nor nft found; install the iptables package".into(),
        ))
    }
}

fn tool_exists(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|v| v.success())
        .unwrap_or(false)
}

fn install_firewall_rules() -> Result<()> {
    let egress = egress_interface()?;
    let subnet = subnet().to_string();
    match detect_backend()? {
        FirewallBackend::Iptables => install_iptables_rules(&egress, &subnet),
        FirewallBackend::Nft => install_nft_rules(&egress, &subnet),
    }
}

fn egress_interface() -> Result<String> {
    let index = match netlink::route_lookup_oif(PROBE_ADDR) {
        Ok(Some(v)) => Some(v),
        // No route to the probe address; scan for any default route.
        _ => netlink::default_route_oif()?,
    };
    let index = index.ok_or_else(|| {
        Error::FirewallFailed("no default route; cannot pick an egress interface".into())
    })?;
    netlink::link_name(index)?
        .ok_or_else(|| Error::FirewallFailed(format!("no name for interface {index}")))
}

/// Inserts at the top of the chain so our rules beat whatever Docker or
/// the distribution put there. Checked first, so reruns change nothing.
fn install_iptables_rules(egress: &str, subnet: &str) -> Result<()> {
    let forward_out = [
        "-i", BRIDGE_NAME, "-o", egress, "-j", "ACCEPT",
    ];
    let forward_back = [
        "-i", egress, "-o", BRIDGE_NAME, "-m", "conntrack", "--ctstate",
        "ESTABLISHED,RELATED", "-j", "ACCEPT",
    ];
    let forward_intra = [
        "-i", BRIDGE_NAME, "-o", BRIDGE_NAME, "-j", "ACCEPT",
    ];
    let masquerade = [
        "-s", subnet, "!", "-o", BRIDGE_NAME, "-j", "MASQUERADE",
    ];
    ensure_iptables_rule("filter", "FORWARD", &forward_out)?;
    ensure_iptables_rule("filter", "FORWARD", &forward_back)?;
    ensure_iptables_rule("filter", "FORWARD", &forward_intra)?;
    ensure_iptables_rule("nat", "POSTROUTING", &masquerade)?;
    Ok(())
}

fn ensure_iptables_rule(table: &str, chain: &str, rule: &[&str]) -> Result<()> {
    let mut check = vec!["-t", table, "-C", chain];
    check.extend_from_slice(rule);
    if run_tool("iptables", &check)? {
        return Ok(());
    }
    let mut insert = vec!["-t", table, "-I", chain, "1"];
    insert.extend_from_slice(rule);
    if !run_tool("iptables", &insert)? {
        return Err(Error::FirewallFailed(format!(
            "iptables refused rule in {table}/{chain}"
        )));
    }
    Ok(())
}

/// nft keeps our rules in a private table; flushing and re-adding the
/// chains makes reruns converge on the same ruleset.
fn install_nft_rules(egress: &str, subnet: &str) -> Result<()> {
    let commands = [
        "add table ip microbox".to_owned(),
        "add chain ip microbox forward { type filter hook forward priority -10 ; policy accept ; }"
            .to_owned(),
        "flush chain ip microbox forward".to_owned(),
        format!("add rule ip microbox forward iifname \"{BRIDGE_NAME}\" oifname \"{egress}\" accept"),
        format!(
            "add rule ip microbox forward iifname \"{egress}\" oifname \"{BRIDGE_NAME}\" \
             ct state established,related accept"
        ),
        format!(
            "add rule ip microbox forward iifname \"{BRIDGE_NAME}\" oifname \"{BRIDGE_NAME}\" accept"
        ),
        "add chain ip microbox postrouting { type nat hook postrouting priority 90 ; policy accept ; }"
            .to_owned(),
        "flush chain ip microbox postrouting".to_owned(),
        format!(
            "add rule ip microbox postrouting ip saddr {subnet} oifname != \"{BRIDGE_NAME}\" masquerade"
        ),
    ];
    for command in &commands {
        let args: Vec<&str> = command.split_whitespace().collect();
        if !run_tool("nft", &args)? {
            return Err(Error::FirewallFailed(format!("nft refused: {command}")));
        }
    }
    Ok(())
}

fn run_tool(program: &str, args: &[&str]) -> Result<bool> {
    Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|v| v.success())
        .map_err(|v| Error::FirewallFailed(format!("cannot run {program}: {v}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veth_names_fit_ifnamsiz() {
        // Interface names are capped at 15 chars plus the terminator.
        let pid = Pid::from_raw(4194304);
        assert!(host_veth_name(pid).len() <= 15);
        assert!(peer_veth_name(pid).len() <= 15);
    }

    #[test]
    fn veth_names_derive_from_pid() {
        let pid = Pid::from_raw(1234);
        assert_eq!(host_veth_name(pid), "mbxh1234");
        assert_eq!(peer_veth_name(pid), "mbxp1234");
    }

    #[test]
    fn subnet_contains_bridge_addr() {
        assert!(subnet().contains(BRIDGE_ADDR));
    }
}
