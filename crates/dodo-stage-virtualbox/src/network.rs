//! Host-only network and DHCP server planning

use crate::error::{Result, VirtualBoxError};
use crate::vboxmanage::{DHCP_PREFIX, DhcpServer, HostOnlyNetwork, VBoxManage};
use dodo_stage::{Check, Poll};
use ipnetwork::Ipv4Network;
use rand::Rng;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Mask reported by old VirtualBox releases; matches any target mask
pub const LEGACY_WILDCARD_MASK: Ipv4Addr = Ipv4Addr::new(15, 0, 0, 0);

/// Default wait for a freshly created adapter: 10 attempts, 1s apart
pub const ADAPTER_POLL: Poll = Poll::new(Duration::from_secs(1), 10);

const DHCP_MAX_OFFSET: u32 = 24;

/// An IPv4 address configured on a host interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInterface {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub up: bool,
    pub loopback: bool,
}

impl HostInterface {
    pub fn network_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip) & u32::from(self.netmask))
    }
}

/// Enumerate the IPv4 addresses of the host's interfaces
#[cfg(unix)]
pub fn host_interfaces() -> Result<Vec<HostInterface>> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;
    use std::net::SocketAddrV4;

    let addrs = getifaddrs().map_err(|e| VirtualBoxError::Io(e.into()))?;
    let interfaces = addrs
        .filter_map(|ifaddr| {
            let ip = ifaddr.address.as_ref()?.as_sockaddr_in().copied()?;
            let netmask = ifaddr.netmask.as_ref()?.as_sockaddr_in().copied()?;
            Some(HostInterface {
                name: ifaddr.interface_name.clone(),
                ip: *SocketAddrV4::from(ip).ip(),
                netmask: *SocketAddrV4::from(netmask).ip(),
                up: ifaddr.flags.contains(InterfaceFlags::IFF_UP),
                loopback: ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK),
            })
        })
        .collect();
    Ok(interfaces)
}

#[cfg(not(unix))]
pub fn host_interfaces() -> Result<Vec<HostInterface>> {
    tracing::warn!("Host interface enumeration is not supported here; skipping collision check");
    Ok(Vec::new())
}

/// Fail when a live host interface already uses the target network
///
/// Interfaces carrying the address of a VirtualBox host-only adapter are ours
/// and never collide.
pub fn check_collision(
    target: &Ipv4Network,
    host_interfaces: &[HostInterface],
    adapters: &[HostOnlyNetwork],
) -> Result<()> {
    let owned: HashSet<Ipv4Addr> = adapters.iter().map(|a| a.ip).collect();

    for iface in host_interfaces {
        if !iface.up || iface.loopback || owned.contains(&iface.ip) {
            continue;
        }
        if iface.network_address() == target.network() {
            return Err(VirtualBoxError::NetworkCollision {
                network: target.to_string(),
                interface: format!("{} ({})", iface.name, iface.ip),
            });
        }
    }

    Ok(())
}

/// Find an adapter already configured for `target`
pub fn find_reusable<'a>(
    adapters: &'a [HostOnlyNetwork],
    target: &Ipv4Network,
) -> Option<&'a HostOnlyNetwork> {
    adapters.iter().find(|adapter| {
        adapter.ip == target.ip()
            && (adapter.netmask == target.mask() || adapter.netmask == LEGACY_WILDCARD_MASK)
    })
}

/// Pick the DHCP server address: network base plus a random offset in 1..=24,
/// never the adapter's own address
pub fn dhcp_address<R: Rng>(
    network: &Ipv4Network,
    adapter_ip: Ipv4Addr,
    rng: &mut R,
) -> Ipv4Addr {
    let base = u32::from(network.network());
    loop {
        let candidate = Ipv4Addr::from(base.wrapping_add(rng.gen_range(1..=DHCP_MAX_OFFSET)));
        if candidate != adapter_ip {
            return candidate;
        }
    }
}

/// Address range leased by the DHCP server
///
/// A /24 always leases `.100`-`.254`. Other prefixes lease from the address
/// after the server up to the last address below broadcast.
pub fn dhcp_range(network: &Ipv4Network, dhcp_ip: Ipv4Addr) -> (Ipv4Addr, Ipv4Addr) {
    let base = u32::from(network.network());

    if network.prefix() == 24 {
        return (Ipv4Addr::from(base + 100), Ipv4Addr::from(base + 254));
    }

    let host_bits = 32 - u32::from(network.prefix());
    let last_assignable = (1u64 << host_bits).saturating_sub(2) as u32;
    (
        Ipv4Addr::from(u32::from(dhcp_ip).wrapping_add(1)),
        Ipv4Addr::from(base.wrapping_add(last_assignable)),
    )
}

/// DHCP server wanted for `adapter`; an enabled server already inside the
/// network keeps its address
pub fn desired_dhcp_server<R: Rng>(
    adapter: &HostOnlyNetwork,
    target: &Ipv4Network,
    existing: Option<&DhcpServer>,
    rng: &mut R,
) -> DhcpServer {
    let ip = existing
        .filter(|server| {
            server.enabled
                && target.contains(server.ip)
                && server.ip != adapter.ip
                && server.ip != target.network()
        })
        .map(|server| server.ip)
        .unwrap_or_else(|| dhcp_address(target, adapter.ip, rng));
    let (lower_ip, upper_ip) = dhcp_range(target, ip);

    DhcpServer {
        network_name: network_name(adapter),
        ip,
        netmask: target.mask(),
        lower_ip,
        upper_ip,
        enabled: true,
    }
}

fn network_name(adapter: &HostOnlyNetwork) -> String {
    if adapter.network_name.is_empty() {
        format!("{}{}", DHCP_PREFIX, adapter.name)
    } else {
        adapter.network_name.clone()
    }
}

/// Wires a VM's second NIC to a host-only network with DHCP
#[derive(Debug)]
pub struct NetworkPlanner<'a> {
    vbox: &'a VBoxManage,
    adapter_poll: Poll,
}

impl<'a> NetworkPlanner<'a> {
    pub fn new(vbox: &'a VBoxManage) -> Self {
        Self {
            vbox,
            adapter_poll: ADAPTER_POLL,
        }
    }

    pub fn with_adapter_poll(mut self, poll: Poll) -> Self {
        self.adapter_poll = poll;
        self
    }

    /// Make sure `vm` has a host-only adapter for `cidr` with a DHCP server
    pub async fn setup_host_only_network(
        &self,
        vm: &str,
        cidr: &str,
        host_interfaces: &[HostInterface],
    ) -> Result<HostOnlyNetwork> {
        let target: Ipv4Network = cidr
            .parse()
            .map_err(|_| VirtualBoxError::InvalidNetwork(cidr.to_string()))?;

        let adapters = self.vbox.list_host_only_networks().await?;
        check_collision(&target, host_interfaces, &adapters)?;

        let adapter = match find_reusable(&adapters, &target) {
            Some(adapter) => {
                tracing::debug!(adapter = %adapter.name, "Reusing host-only adapter");
                adapter.clone()
            }
            None => self.create_adapter(&target, &adapters).await?,
        };

        let mut live: HashSet<String> = adapters.iter().map(network_name).collect();
        live.insert(network_name(&adapter));

        let servers = self.vbox.list_dhcp_servers().await?;
        self.remove_orphaned_dhcp_servers(&servers, &live).await?;

        let existing = servers
            .iter()
            .find(|server| server.network_name == network_name(&adapter));
        let desired = desired_dhcp_server(&adapter, &target, existing, &mut rand::thread_rng());
        self.ensure_dhcp_server(&desired, existing).await?;

        self.vbox
            .run(&[
                "modifyvm",
                vm,
                "--nic2",
                "hostonly",
                "--nictype2",
                "82540EM",
                "--nicpromisc2",
                "deny",
                "--hostonlyadapter2",
                adapter.name.as_str(),
                "--cableconnected2",
                "on",
            ])
            .await?;

        tracing::info!(vm, adapter = %adapter.name, network = %target, "Host-only network ready");
        Ok(adapter)
    }

    async fn create_adapter(
        &self,
        target: &Ipv4Network,
        before: &[HostOnlyNetwork],
    ) -> Result<HostOnlyNetwork> {
        let known: HashSet<String> = before.iter().map(|a| a.name.clone()).collect();
        self.vbox.run(&["hostonlyif", "create"]).await?;

        let vbox = self.vbox;
        let known = &known;
        let mut adapter = self
            .adapter_poll
            .until("host-only adapter to appear", move || async move {
                let current = vbox.list_host_only_networks().await?;
                let count = current.len();
                let check = match current.into_iter().find(|a| !known.contains(&a.name)) {
                    Some(adapter) => Check::Ready(adapter),
                    None => Check::pending(format!("{} adapters, none new", count)),
                };
                Ok::<_, VirtualBoxError>(check)
            })
            .await?;

        let ip = target.ip().to_string();
        let mask = target.mask().to_string();
        self.vbox
            .run(&[
                "hostonlyif",
                "ipconfig",
                adapter.name.as_str(),
                "--ip",
                ip.as_str(),
                "--netmask",
                mask.as_str(),
            ])
            .await?;

        adapter.ip = target.ip();
        adapter.netmask = target.mask();
        tracing::info!(adapter = %adapter.name, ip = %ip, "Created host-only adapter");
        Ok(adapter)
    }

    async fn remove_orphaned_dhcp_servers(
        &self,
        servers: &[DhcpServer],
        live: &HashSet<String>,
    ) -> Result<()> {
        for server in servers {
            if server.network_name.starts_with(DHCP_PREFIX) && !live.contains(&server.network_name) {
                tracing::info!(network = %server.network_name, "Removing orphaned DHCP server");
                self.vbox
                    .run(&["dhcpserver", "remove", "--netname", server.network_name.as_str()])
                    .await?;
            }
        }
        Ok(())
    }

    async fn ensure_dhcp_server(
        &self,
        desired: &DhcpServer,
        existing: Option<&DhcpServer>,
    ) -> Result<()> {
        let verb = match existing {
            Some(server) if server == desired => {
                tracing::debug!(network = %desired.network_name, "DHCP server already configured");
                return Ok(());
            }
            Some(_) => "modify",
            None => "add",
        };

        let (ip, mask) = (desired.ip.to_string(), desired.netmask.to_string());
        let (lower, upper) = (desired.lower_ip.to_string(), desired.upper_ip.to_string());
        self.vbox
            .run(&[
                "dhcpserver",
                verb,
                "--netname",
                desired.network_name.as_str(),
                "--ip",
                ip.as_str(),
                "--netmask",
                mask.as_str(),
                "--lowerip",
                lower.as_str(),
                "--upperip",
                upper.as_str(),
                "--enable",
            ])
            .await?;

        tracing::debug!(network = %desired.network_name, verb, ip = %ip, "Configured DHCP server");
        Ok(())
    }
}
