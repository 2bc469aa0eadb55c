//! Host bridge networking for containers
//!
//! Shells out to the standard host utilities (`ip`, `iptables`, `sysctl`,
//! `nsenter`), the same surface the kernel exposes through netlink. All host
//! mutations are idempotent: links are created only when absent and iptables
//! rules only when no equivalent rule exists, so concurrent supervisor
//! invocations converge on the same bridge state.

use crate::config::types::{ContainerConfig, NetworkConfig, PortForward};
use crate::types::{Result, RuntimeError};
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

/// Host-side artifacts created for one container's network attachment
#[derive(Clone, Debug)]
pub struct ContainerNetwork {
    pub ip: Ipv4Addr,
    pub veth_host: String,
    pub bridge: String,
}

/// Wire a cloned child into the bridge network.
///
/// Runs in the parent after clone and before the release byte: creates the
/// bridge when absent, builds a veth pair, moves the peer into the child's
/// net namespace and configures addressing inside it.
pub fn setup(pid: i32, config: &ContainerConfig) -> Result<Option<ContainerNetwork>> {
    let net = &config.network;
    if !net.enabled {
        return Ok(None);
    }

    ensure_bridge(net)?;

    let (veth_host, veth_peer) = veth_names(pid);
    let ip = net.container_ip.unwrap_or_else(|| ip_for_pid(net.gateway, pid));
    log::info!(
        "wiring container '{}' (PID {}): {} <-> {} with IP {}",
        config.name,
        pid,
        veth_host,
        veth_peer,
        ip
    );

    create_veth_pair(&veth_host, &veth_peer)?;
    attach_to_bridge(&veth_host, &net.bridge_name)?;
    move_peer_into_namespace(&veth_peer, pid)?;

    // Give the kernel a moment to finish moving the link.
    thread::sleep(Duration::from_millis(100));

    configure_inside_namespace(pid, &veth_peer, ip, net.gateway)?;
    setup_port_forwards(&net.port_forwards, ip)?;

    if net.dns {
        if let Err(e) = write_resolv_conf(&config.rootfs) {
            log::warn!("DNS setup skipped: {}", e);
        }
    }

    Ok(Some(ContainerNetwork {
        ip,
        veth_host,
        bridge: net.bridge_name.clone(),
    }))
}

/// Remove the host-side artifacts installed for one container
pub fn cleanup(net: &NetworkConfig, ip: Option<Ipv4Addr>, veth_host: Option<&str>) {
    if let Some(ip) = ip {
        for forward in &net.port_forwards {
            remove_port_forward(forward, ip);
        }
    }
    if let Some(veth) = veth_host {
        if link_exists(veth) {
            run_quiet("ip", &["link", "delete", veth]);
        }
    }
}

/// Derive the default container IP from its PID: the gateway's /24 with a
/// last octet of 2 + pid mod 253, keeping it inside the host range 2..=254.
pub fn ip_for_pid(gateway: Ipv4Addr, pid: i32) -> Ipv4Addr {
    let o = gateway.octets();
    let last = 2 + (pid.unsigned_abs() % 253) as u8;
    Ipv4Addr::new(o[0], o[1], o[2], last)
}

/// Veth endpoint names derived from the container PID, which is unique among
/// live containers: `veth<pid>` on the host, `veth<pid>c` for the peer.
pub fn veth_names(pid: i32) -> (String, String) {
    (format!("veth{}", pid), format!("veth{}c", pid))
}

/// Create the bridge with gateway address, forwarding and NAT, if absent
fn ensure_bridge(net: &NetworkConfig) -> Result<()> {
    if link_exists(&net.bridge_name) {
        log::debug!("using existing bridge {}", net.bridge_name);
        return Ok(());
    }

    log::info!("creating bridge {}", net.bridge_name);
    run_checked("ip", &["link", "add", &net.bridge_name, "type", "bridge"])?;
    let gateway_cidr = format!("{}/24", net.gateway);
    run_checked("ip", &["addr", "add", &gateway_cidr, "dev", &net.bridge_name])?;
    run_checked("ip", &["link", "set", &net.bridge_name, "up"])?;

    run_quiet("sysctl", &["-w", "net.ipv4.ip_forward=1"]);
    // Bridge-netfilter would push bridged frames through iptables FORWARD;
    // neutralize it so intra-bridge traffic flows regardless of host policy.
    run_quiet("modprobe", &["br_netfilter"]);
    run_quiet("sysctl", &["-w", "net.bridge.bridge-nf-call-iptables=0"]);
    run_quiet("sysctl", &["-w", "net.bridge.bridge-nf-call-ip6tables=0"]);
    run_quiet("sysctl", &["-w", "net.bridge.bridge-nf-call-arptables=0"]);

    insert_rule_if_missing(&["FORWARD", "-i", &net.bridge_name, "-j", "ACCEPT"]);
    insert_rule_if_missing(&["FORWARD", "-o", &net.bridge_name, "-j", "ACCEPT"]);
    insert_rule_if_missing(&[
        "FORWARD",
        "-m",
        "state",
        "--state",
        "RELATED,ESTABLISHED",
        "-j",
        "ACCEPT",
    ]);
    append_nat_rule_if_missing(&[
        "POSTROUTING",
        "-s",
        &net.subnet,
        "!",
        "-o",
        &net.bridge_name,
        "-j",
        "MASQUERADE",
    ]);

    Ok(())
}

fn create_veth_pair(veth_host: &str, veth_peer: &str) -> Result<()> {
    // A stale link with our name survives a crashed previous launch that
    // reused the PID; remove it and let the kernel settle.
    if link_exists(veth_host) {
        log::debug!("removing stale link {}", veth_host);
        run_quiet("ip", &["link", "delete", veth_host]);
        thread::sleep(Duration::from_millis(200));
    }

    run_checked(
        "ip",
        &["link", "add", veth_host, "type", "veth", "peer", "name", veth_peer],
    )?;
    run_checked("ip", &["link", "set", veth_host, "up"])
}

fn attach_to_bridge(veth_host: &str, bridge: &str) -> Result<()> {
    run_checked("ip", &["link", "set", veth_host, "master", bridge])
}

fn move_peer_into_namespace(veth_peer: &str, pid: i32) -> Result<()> {
    let pid_str = pid.to_string();
    run_checked("ip", &["link", "set", veth_peer, "netns", &pid_str])
}

/// Configure addressing inside the container's net namespace: loopback up,
/// peer renamed to eth0 with the container IP, default route via the gateway.
fn configure_inside_namespace(
    pid: i32,
    veth_peer: &str,
    ip: Ipv4Addr,
    gateway: Ipv4Addr,
) -> Result<()> {
    let ns = format!("--net=/proc/{}/ns/net", pid);
    let ip_cidr = format!("{}/24", ip);
    let gateway_str = gateway.to_string();

    run_quiet("nsenter", &[&ns, "ip", "link", "set", "lo", "up"]);
    run_checked("nsenter", &[&ns, "ip", "link", "set", veth_peer, "name", "eth0"])?;
    run_checked("nsenter", &[&ns, "ip", "addr", "add", &ip_cidr, "dev", "eth0"])?;
    run_checked("nsenter", &[&ns, "ip", "link", "set", "eth0", "up"])?;
    run_checked(
        "nsenter",
        &[&ns, "ip", "route", "add", "default", "via", &gateway_str],
    )
}

fn setup_port_forwards(forwards: &[PortForward], ip: Ipv4Addr) -> Result<()> {
    for forward in forwards {
        let args = dnat_rule_args(forward, ip);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        if !nat_rule_exists(&arg_refs) {
            let mut insert = vec!["-t", "nat", "-A"];
            insert.extend(arg_refs.iter());
            run_checked("iptables", &insert)?;
        }
        log::info!(
            "port forward host:{} -> container {}:{}",
            forward.host_port,
            ip,
            forward.container_port
        );
    }
    Ok(())
}

fn remove_port_forward(forward: &PortForward, ip: Ipv4Addr) {
    let args = dnat_rule_args(forward, ip);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut delete = vec!["-t", "nat", "-D"];
    delete.extend(arg_refs.iter());
    run_quiet("iptables", &delete);
}

/// Arguments of the PREROUTING DNAT rule for one port forward, shared by the
/// install, existence-check and delete paths so they always agree.
fn dnat_rule_args(forward: &PortForward, ip: Ipv4Addr) -> Vec<String> {
    vec![
        "PREROUTING".to_string(),
        "-p".to_string(),
        "tcp".to_string(),
        "--dport".to_string(),
        forward.host_port.to_string(),
        "-j".to_string(),
        "DNAT".to_string(),
        "--to-destination".to_string(),
        format!("{}:{}", ip, forward.container_port),
    ]
}

/// Write fallback nameservers into the container rootfs unless the image
/// already ships a resolv.conf.
pub fn write_resolv_conf(rootfs: &Path) -> Result<()> {
    let etc = rootfs.join("etc");
    if !etc.exists() {
        std::fs::create_dir_all(&etc).map_err(|e| {
            RuntimeError::Network(format!("could not create {}: {}", etc.display(), e))
        })?;
    }

    let resolv = etc.join("resolv.conf");
    if resolv.exists() {
        log::debug!("resolv.conf already present, keeping the image's DNS config");
        return Ok(());
    }

    std::fs::write(&resolv, "nameserver 8.8.8.8\nnameserver 8.8.4.4\n").map_err(|e| {
        RuntimeError::Network(format!("could not write {}: {}", resolv.display(), e))
    })
}

fn link_exists(name: &str) -> bool {
    Command::new("ip")
        .args(["link", "show", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn insert_rule_if_missing(rule: &[&str]) {
    let mut check = vec!["-C"];
    check.extend(rule.iter());
    if run_silent_status("iptables", &check) {
        return;
    }
    let mut insert = vec!["-I"];
    insert.push(rule[0]);
    insert.push("1");
    insert.extend(rule[1..].iter());
    run_quiet("iptables", &insert);
}

fn append_nat_rule_if_missing(rule: &[&str]) {
    let mut check = vec!["-t", "nat", "-C"];
    check.extend(rule.iter());
    if run_silent_status("iptables", &check) {
        return;
    }
    let mut append = vec!["-t", "nat", "-A"];
    append.extend(rule.iter());
    run_quiet("iptables", &append);
}

fn nat_rule_exists(rule: &[&str]) -> bool {
    let mut check = vec!["-t", "nat", "-C"];
    check.extend(rule.iter());
    run_silent_status("iptables", &check)
}

/// Run a host utility, failing the launch when it reports an error
fn run_checked(program: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .status()
        .map_err(|e| RuntimeError::Network(format!("could not run {}: {}", program, e)))?;
    if !status.success() {
        return Err(RuntimeError::Network(format!(
            "{} {} exited with {}",
            program,
            args.join(" "),
            status
        )));
    }
    Ok(())
}

/// Run a host utility where failure is tolerable; the outcome is logged only
fn run_quiet(program: &str, args: &[&str]) {
    if !run_silent_status(program, args) {
        log::debug!("{} {} failed (ignored)", program, args.join(" "));
    }
}

fn run_silent_status(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GATEWAY: Ipv4Addr = Ipv4Addr::new(172, 18, 0, 1);

    #[test]
    fn derived_ips_stay_in_the_host_range() {
        for pid in [1, 2, 252, 253, 254, 255, 1000, 65535, i32::MAX] {
            let ip = ip_for_pid(GATEWAY, pid);
            let last = ip.octets()[3];
            assert!((2..=254).contains(&last), "pid {} gave octet {}", pid, last);
        }
    }

    #[test]
    fn derived_ip_matches_the_pid_formula() {
        assert_eq!(ip_for_pid(GATEWAY, 100), Ipv4Addr::new(172, 18, 0, 102));
        assert_eq!(ip_for_pid(GATEWAY, 253), Ipv4Addr::new(172, 18, 0, 2));
    }

    #[test]
    fn veth_names_derive_from_pid() {
        let (host, peer) = veth_names(4321);
        assert_eq!(host, "veth4321");
        assert_eq!(peer, "veth4321c");
    }

    #[test]
    fn dnat_rule_names_destination_and_port() {
        let rule = dnat_rule_args(
            &PortForward { host_port: 8080, container_port: 80 },
            Ipv4Addr::new(172, 18, 0, 5),
        );
        assert_eq!(rule[0], "PREROUTING");
        assert!(rule.contains(&"8080".to_string()));
        assert!(rule.contains(&"172.18.0.5:80".to_string()));
    }

    #[test]
    fn resolv_conf_respects_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let etc = dir.path().join("etc");
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::write(etc.join("resolv.conf"), "nameserver 1.1.1.1\n").unwrap();

        write_resolv_conf(dir.path()).unwrap();
        let content = std::fs::read_to_string(etc.join("resolv.conf")).unwrap();
        assert_eq!(content, "nameserver 1.1.1.1\n");
    }

    #[test]
    fn resolv_conf_is_written_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        write_resolv_conf(dir.path()).unwrap();
        let content = std::fs::read_to_string(dir.path().join("etc/resolv.conf")).unwrap();
        assert!(content.contains("8.8.8.8"));
        assert!(content.contains("8.8.4.4"));
    }
}
