//! VBoxManage CLI wrapper
//!
//! Every VirtualBox operation goes through [`VBoxManage::run`], which applies
//! the [`RetryPolicy`] for the transient "object is not ready" lock error.

use crate::error::{Result, VirtualBoxError};
use dodo_stage::{HostEnv, PipedChild, StageStatus, ToolRunner};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Logical executable name resolved through [`HostEnv::executable`]
pub const EXECUTABLE: &str = "VBoxManage";

/// Name prefix VirtualBox gives the internal network of a host-only adapter
pub const DHCP_PREFIX: &str = "HostInterfaceNetworking-";

const NOT_READY: &str = "error: The object is not ready";

/// How a failed invocation should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Retryable,
    Fatal,
}

/// Retry schedule for VBoxManage invocations
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    classifier: fn(&str) -> Failure,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration, classifier: fn(&str) -> Failure) -> Self {
        Self {
            max_attempts,
            backoff,
            classifier,
        }
    }

    /// Classify captured stderr
    pub fn classify(&self, stderr: &str) -> Failure {
        (self.classifier)(stderr)
    }
}

impl Default for RetryPolicy {
    /// 5 attempts, 100ms apart, retrying only the session lock error
    fn default() -> Self {
        Self::new(5, Duration::from_millis(100), classify_vboxmanage)
    }
}

fn classify_vboxmanage(stderr: &str) -> Failure {
    if stderr.contains(NOT_READY) {
        Failure::Retryable
    } else {
        Failure::Fatal
    }
}

/// Handle on the VBoxManage executable
#[derive(Clone)]
pub struct VBoxManage {
    runner: Arc<dyn ToolRunner>,
    program: PathBuf,
    retry: RetryPolicy,
}

impl VBoxManage {
    pub fn new(env: &HostEnv) -> Self {
        Self {
            runner: env.runner.clone(),
            program: env.executable(EXECUTABLE),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Run VBoxManage and return its stdout
    pub async fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
        let mut attempt = 1;

        loop {
            let output = self.runner.run(&self.program, &args, None).await?;
            if output.success {
                return Ok(output.stdout);
            }

            let retryable = self.retry.classify(&output.stderr) == Failure::Retryable;
            if retryable && attempt < self.retry.max_attempts {
                tracing::debug!(
                    attempt,
                    args = %args.join(" "),
                    "VBoxManage object not ready, retrying"
                );
                attempt += 1;
                sleep(self.retry.backoff).await;
                continue;
            }

            return Err(VirtualBoxError::Command {
                program: self.program_name(),
                stderr: output.stderr.trim().to_string(),
            });
        }
    }

    /// Start VBoxManage with a writable stdin (raw disk conversion)
    pub async fn spawn_piped<S: AsRef<str>>(&self, args: &[S]) -> Result<PipedChild> {
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
        Ok(self.runner.spawn_piped(&self.program, &args).await?)
    }

    /// `showvminfo --machinereadable` as a key/value map
    pub async fn info(&self, vm: &str) -> Result<HashMap<String, String>> {
        let output = self.run(&["showvminfo", vm, "--machinereadable"]).await?;
        Ok(parse_machine_readable(&output))
    }

    /// Names of all registered VMs
    pub async fn list_vms(&self) -> Result<Vec<String>> {
        let output = self.run(&["list", "vms"]).await?;
        Ok(parse_vm_list(&output))
    }

    /// Lifecycle status of a VM, `Nonexistent` when it is not registered
    pub async fn vm_status(&self, vm: &str) -> Result<StageStatus> {
        if !self.list_vms().await?.iter().any(|name| name == vm) {
            return Ok(StageStatus::Nonexistent);
        }

        let info = self.info(vm).await?;
        let state = info.get("VMState").map(String::as_str).unwrap_or_default();
        Ok(status_from_vm_state(state))
    }

    pub async fn list_host_only_networks(&self) -> Result<Vec<HostOnlyNetwork>> {
        let output = self.run(&["list", "hostonlyifs"]).await?;
        parse_host_only_networks(&output)
    }

    pub async fn list_dhcp_servers(&self) -> Result<Vec<DhcpServer>> {
        let output = self.run(&["list", "dhcpservers"]).await?;
        parse_dhcp_servers(&output)
    }

    /// NAT port forwarding rules of a VM
    pub async fn port_forwardings(&self, vm: &str) -> Result<Vec<PortForwarding>> {
        let info = self.info(vm).await?;
        Ok(parse_port_forwardings(&info))
    }

    /// Read a guest property, `None` while the guest has not set it
    pub async fn guest_property(&self, vm: &str, key: &str) -> Result<Option<String>> {
        let output = self.run(&["guestproperty", "get", vm, key]).await?;
        Ok(output
            .trim()
            .strip_prefix("Value:")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()))
    }
}

impl std::fmt::Debug for VBoxManage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VBoxManage")
            .field("program", &self.program)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Map a VBoxManage `VMState` onto a stage status
pub fn status_from_vm_state(state: &str) -> StageStatus {
    match state {
        "running" | "paused" | "starting" | "stopping" | "restoring" | "saving" => {
            StageStatus::Running
        }
        _ => StageStatus::Stopped,
    }
}

/// A VirtualBox host-only adapter
///
/// The netmask is kept as an address because legacy adapters report the
/// non-contiguous wildcard mask `15.0.0.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOnlyNetwork {
    pub name: String,
    pub guid: String,
    pub dhcp_enabled: bool,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub hardware_address: String,
    pub status: String,
    pub network_name: String,
}

/// A VirtualBox DHCP server bound to one internal network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpServer {
    pub network_name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub lower_ip: Ipv4Addr,
    pub upper_ip: Ipv4Addr,
    pub enabled: bool,
}

/// A NAT port forwarding rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwarding {
    pub interface_index: u8,
    pub name: String,
    pub protocol: String,
    pub host_ip: String,
    pub host_port: u16,
    pub guest_ip: String,
    pub guest_port: u16,
}

impl PortForwarding {
    /// Rule in `--natpf<N>` syntax
    pub fn to_rule(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.name, self.protocol, self.host_ip, self.host_port, self.guest_ip, self.guest_port
        )
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    let s = s.strip_prefix('"').unwrap_or(s);
    s.strip_suffix('"').unwrap_or(s)
}

/// Parse `key="value"` lines; quotes are stripped from both sides
pub fn parse_machine_readable(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (unquote(key).to_string(), unquote(value).to_string()))
        .collect()
}

/// Parse `"name" {uuid}` lines of `list vms`
pub fn parse_vm_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix('"')?;
            let end = rest.rfind('"')?;
            Some(rest[..end].to_string())
        })
        .collect()
}

/// Split `Key: value` listings into blank-line separated records
fn parse_blocks(output: &str) -> Vec<HashMap<String, String>> {
    let mut blocks = Vec::new();
    let mut current = HashMap::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            current.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }

    blocks
}

fn field<'a>(block: &'a HashMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| block.get(*key))
        .map(String::as_str)
}

fn ip_field(block: &HashMap<String, String>, keys: &[&str]) -> Result<Ipv4Addr> {
    let raw = field(block, keys).unwrap_or_default();
    raw.parse()
        .map_err(|_| VirtualBoxError::Parse(format!("invalid {} '{}'", keys[0], raw)))
}

/// Parse `list hostonlyifs`
pub fn parse_host_only_networks(output: &str) -> Result<Vec<HostOnlyNetwork>> {
    parse_blocks(output)
        .into_iter()
        .filter(|block| block.contains_key("name"))
        .map(|block| {
            Ok(HostOnlyNetwork {
                name: field(&block, &["name"]).unwrap_or_default().to_string(),
                guid: field(&block, &["guid"]).unwrap_or_default().to_string(),
                dhcp_enabled: field(&block, &["dhcp"]) == Some("Enabled"),
                ip: ip_field(&block, &["ipaddress"])?,
                netmask: ip_field(&block, &["networkmask"])?,
                hardware_address: field(&block, &["hardwareaddress"])
                    .unwrap_or_default()
                    .to_string(),
                status: field(&block, &["status"]).unwrap_or_default().to_string(),
                network_name: field(&block, &["vboxnetworkname"])
                    .unwrap_or_default()
                    .to_string(),
            })
        })
        .collect()
}

/// Parse `list dhcpservers` (old and new VirtualBox key spellings)
pub fn parse_dhcp_servers(output: &str) -> Result<Vec<DhcpServer>> {
    parse_blocks(output)
        .into_iter()
        .filter(|block| block.contains_key("networkname"))
        .map(|block| {
            Ok(DhcpServer {
                network_name: field(&block, &["networkname"]).unwrap_or_default().to_string(),
                ip: ip_field(&block, &["ip", "dhcpd ip"])?,
                netmask: ip_field(&block, &["networkmask"])?,
                lower_ip: ip_field(&block, &["loweripaddress"])?,
                upper_ip: ip_field(&block, &["upperipaddress"])?,
                enabled: field(&block, &["enabled"]) == Some("Yes"),
            })
        })
        .collect()
}

/// Extract `Forwarding(N)="name,proto,hostip,hostport,guestip,guestport"` rules
///
/// Machine readable output does not say which NIC a rule belongs to; only NIC 1
/// uses NAT in this stage.
pub fn parse_port_forwardings(info: &HashMap<String, String>) -> Vec<PortForwarding> {
    let mut rules: Vec<(u32, PortForwarding)> = info
        .iter()
        .filter_map(|(key, value)| {
            let index = key
                .strip_prefix("Forwarding(")?
                .strip_suffix(')')?
                .parse::<u32>()
                .ok()?;
            let parts: Vec<&str> = value.split(',').collect();
            if parts.len() != 6 {
                return None;
            }
            Some((
                index,
                PortForwarding {
                    interface_index: 1,
                    name: parts[0].to_string(),
                    protocol: parts[1].to_string(),
                    host_ip: parts[2].to_string(),
                    host_port: parts[3].parse().ok()?,
                    guest_ip: parts[4].to_string(),
                    guest_port: parts[5].parse().ok()?,
                },
            ))
        })
        .collect();

    rules.sort_by_key(|(index, _)| *index);
    rules.into_iter().map(|(_, rule)| rule).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dodo_stage::ToolOutput;
    use std::io;
    use std::sync::Mutex;

    /// Fails with the given stderr a number of times, then succeeds
    struct Flaky {
        failures: Mutex<Vec<String>>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl ToolRunner for Flaky {
        async fn run(
            &self,
            _program: &Path,
            _args: &[String],
            _input: Option<&[u8]>,
        ) -> io::Result<ToolOutput> {
            *self.calls.lock().unwrap() += 1;
            match self.failures.lock().unwrap().pop() {
                Some(stderr) => Ok(ToolOutput::failed(1, stderr)),
                None => Ok(ToolOutput::ok("done")),
            }
        }

        async fn spawn_piped(&self, _program: &Path, _args: &[String]) -> io::Result<PipedChild> {
            Err(io::Error::other("not supported"))
        }
    }

    fn vbox_with(failures: Vec<&str>) -> (VBoxManage, Arc<Flaky>) {
        let runner = Arc::new(Flaky {
            failures: Mutex::new(failures.into_iter().map(String::from).collect()),
            calls: Mutex::new(0),
        });
        let env = HostEnv::new(runner.clone(), "/tmp/dodo");
        let vbox = VBoxManage::new(&env).with_retry(RetryPolicy::new(
            5,
            Duration::from_millis(1),
            classify_vboxmanage,
        ));
        (vbox, runner)
    }

    #[tokio::test]
    async fn test_retries_object_not_ready() {
        let busy = "VBoxManage: error: The object is not ready";
        let (vbox, runner) = vbox_with(vec![busy, busy]);

        assert_eq!(vbox.run(&["list", "vms"]).await.unwrap(), "done");
        assert_eq!(*runner.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let busy = "VBoxManage: error: The object is not ready";
        let (vbox, runner) = vbox_with(vec![busy; 6]);

        let err = vbox.run(&["list", "vms"]).await.unwrap_err();
        assert!(matches!(err, VirtualBoxError::Command { ref stderr, .. } if stderr.contains("not ready")));
        assert_eq!(*runner.calls.lock().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let (vbox, runner) = vbox_with(vec!["VBoxManage: error: Invalid machine"]);

        assert!(vbox.run(&["showvminfo", "dev"]).await.is_err());
        assert_eq!(*runner.calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_parse_machine_readable() {
        let output = "name=\"dev\"\nVMState=\"running\"\n\"storagecontrollername0\"=\"SATA\"\ncpus=2\n";
        let info = parse_machine_readable(output);

        assert_eq!(info["name"], "dev");
        assert_eq!(info["VMState"], "running");
        assert_eq!(info["storagecontrollername0"], "SATA");
        assert_eq!(info["cpus"], "2");
    }

    #[test]
    fn test_parse_vm_list() {
        let output = "\"dev\" {0b5cf5a0-1111-2222-3333-444455556666}\n\"my vm\" {aaaa}\n";
        assert_eq!(parse_vm_list(output), vec!["dev", "my vm"]);
    }

    #[test]
    fn test_parse_host_only_networks() {
        let output = "\
Name:            vboxnet0
GUID:            786f6276-656e-4074-8000-0a0027000000
DHCP:            Disabled
IPAddress:       192.168.99.1
NetworkMask:     255.255.255.0
IPV6Address:
HardwareAddress: 0a:00:27:00:00:00
Status:          Up
VBoxNetworkName: HostInterfaceNetworking-vboxnet0

Name:            vboxnet1
GUID:            786f6276-656e-4174-8000-0a0027000001
DHCP:            Enabled
IPAddress:       10.10.0.1
NetworkMask:     15.0.0.0
HardwareAddress: 0a:00:27:00:00:01
Status:          Down
VBoxNetworkName: HostInterfaceNetworking-vboxnet1
";
        let networks = parse_host_only_networks(output).unwrap();

        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].name, "vboxnet0");
        assert_eq!(networks[0].ip, Ipv4Addr::new(192, 168, 99, 1));
        assert!(!networks[0].dhcp_enabled);
        assert_eq!(networks[0].network_name, "HostInterfaceNetworking-vboxnet0");
        assert_eq!(networks[1].netmask, Ipv4Addr::new(15, 0, 0, 0));
        assert!(networks[1].dhcp_enabled);
    }

    #[test]
    fn test_parse_dhcp_servers_both_spellings() {
        let output = "\
NetworkName:    HostInterfaceNetworking-vboxnet0
IP:             192.168.99.6
NetworkMask:    255.255.255.0
lowerIPAddress: 192.168.99.100
upperIPAddress: 192.168.99.254
Enabled:        Yes

NetworkName:    HostInterfaceNetworking-vboxnet1
Dhcpd IP:       10.0.0.3
LowerIPAddress: 10.0.0.4
UpperIPAddress: 10.0.0.14
NetworkMask:    255.255.255.240
Enabled:        No
";
        let servers = parse_dhcp_servers(output).unwrap();

        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].ip, Ipv4Addr::new(192, 168, 99, 6));
        assert_eq!(servers[0].lower_ip, Ipv4Addr::new(192, 168, 99, 100));
        assert!(servers[0].enabled);
        assert_eq!(servers[1].ip, Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(servers[1].upper_ip, Ipv4Addr::new(10, 0, 0, 14));
        assert!(!servers[1].enabled);
    }

    #[test]
    fn test_parse_port_forwardings() {
        let info = parse_machine_readable(
            "Forwarding(1)=\"docker,tcp,127.0.0.1,2376,,2376\"\nForwarding(0)=\"ssh,tcp,127.0.0.1,52022,,22\"\n",
        );
        let rules = parse_port_forwardings(&info);

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "ssh");
        assert_eq!(rules[0].host_port, 52022);
        assert_eq!(rules[0].guest_port, 22);
        assert_eq!(rules[0].to_rule(), "ssh,tcp,127.0.0.1,52022,,22");
    }

    #[test]
    fn test_status_from_vm_state() {
        assert_eq!(status_from_vm_state("running"), StageStatus::Running);
        assert_eq!(status_from_vm_state("poweroff"), StageStatus::Stopped);
        assert_eq!(status_from_vm_state("aborted"), StageStatus::Stopped);
        assert_eq!(status_from_vm_state("saved"), StageStatus::Stopped);
    }
}
