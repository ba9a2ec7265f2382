//! The `virtualbox` stage
//!
//! ```text
//! create:  keypair → ISO → disk image → register VM → boot → certificates → provision
//! boot:    host-only network → SSH port forward → startvm → wait for IP → wait for SSH
//! ```
//!
//! Only `state.json` survives between invocations; everything else is read
//! back from VirtualBox.

use crate::certs::{self, CertificateSet};
use crate::disk::{boot2docker_payload, create_disk_image};
use crate::error::{Result, VirtualBoxError};
use crate::iso::{ISO_FILE, ensure_iso};
use crate::network::{self, ADAPTER_POLL, HostInterface, NetworkPlanner};
use crate::options::VirtualBoxOptions;
use crate::provision::{DAEMON_POLL, DOCKER_PORT, ProvisionOptions, Provisioner};
use crate::ssh::{self, PRIVATE_KEY_FILE, SshClient};
use crate::vboxmanage::{PortForwarding, VBoxManage};
use async_trait::async_trait;
use dodo_stage::{
    Check, DockerOptions, HostEnv, Poll, RemoveOptions, SshOptions, Stage, StageConfig, StageError,
    StageState, StageStatus, StateManager,
};
use std::path::PathBuf;
use std::time::Duration;

pub const STAGE_TYPE: &str = "virtualbox";

/// Account of the boot2docker guest
pub const SSH_USERNAME: &str = "docker";

const SSH_RULE: &str = "ssh";
const DISK_FILE: &str = "disk.vmdk";
const STORAGE_CONTROLLER: &str = "SATA";
const IP_PROPERTY: &str = "/VirtualBox/GuestInfo/Net/1/V4/IP";

/// Polling budgets of the stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub adapter: Poll,
    pub ip: Poll,
    pub ssh: Poll,
    pub daemon: Poll,
    pub shutdown: Poll,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            adapter: ADAPTER_POLL,
            ip: Poll::new(Duration::from_secs(1), 120),
            ssh: Poll::new(Duration::from_secs(1), 60),
            daemon: DAEMON_POLL,
            shutdown: Poll::new(Duration::from_secs(1), 60),
        }
    }
}

impl Timeouts {
    /// Same budget for every wait
    pub fn uniform(poll: Poll) -> Self {
        Self {
            adapter: poll,
            ip: poll,
            ssh: poll,
            daemon: poll,
            shutdown: poll,
        }
    }
}

/// Source of the host interfaces checked for network collisions
pub type InterfaceSource = fn() -> Result<Vec<HostInterface>>;

#[derive(Debug)]
struct Bound {
    name: String,
    dir: PathBuf,
    options: VirtualBoxOptions,
    state: StateManager,
    saved: Option<StageState>,
}

impl Bound {
    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn path_str(&self, file: &str) -> String {
        self.path(file).display().to_string()
    }
}

/// VM-backed stage driven through VBoxManage
pub struct VirtualBoxStage {
    env: HostEnv,
    vbox: VBoxManage,
    timeouts: Timeouts,
    interfaces: InterfaceSource,
    bound: Option<Bound>,
}

impl VirtualBoxStage {
    pub fn new(env: HostEnv) -> Self {
        Self {
            vbox: VBoxManage::new(&env),
            env,
            timeouts: Timeouts::default(),
            interfaces: network::host_interfaces,
            bound: None,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_host_interfaces(mut self, source: InterfaceSource) -> Self {
        self.interfaces = source;
        self
    }

    pub fn with_vboxmanage(mut self, vbox: VBoxManage) -> Self {
        self.vbox = vbox;
        self
    }

    fn bound(&self) -> Result<&Bound> {
        self.bound
            .as_ref()
            .ok_or(VirtualBoxError::Stage(StageError::NotInitialized))
    }

    fn invalid_state(b: &Bound, operation: &'static str, status: StageStatus) -> VirtualBoxError {
        VirtualBoxError::Stage(StageError::InvalidState {
            stage: b.name.clone(),
            operation,
            status: status.to_string(),
        })
    }

    async fn status(&self) -> Result<StageStatus> {
        let b = self.bound()?;
        self.vbox.vm_status(&b.name).await
    }

    /// Run blocking key/certificate generation off the async workers
    async fn blocking<T, F>(f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| VirtualBoxError::Io(std::io::Error::other(e)))?
    }

    async fn register_vm(&self, b: &Bound, iso: &str, disk: &str) -> Result<()> {
        let vm = b.name.as_str();
        let dir = b.dir.display().to_string();
        let cpus = b.options.cpus.to_string();
        let memory = b.options.memory_mb.to_string();

        self.vbox
            .run(&["createvm", "--name", vm, "--basefolder", dir.as_str(), "--register"])
            .await?;
        self.vbox
            .run(&[
                "modifyvm",
                vm,
                "--ostype",
                "Linux26_64",
                "--cpus",
                cpus.as_str(),
                "--memory",
                memory.as_str(),
                "--acpi",
                "on",
                "--ioapic",
                "on",
                "--rtcuseutc",
                "on",
                "--natdnshostresolver1",
                "on",
                "--natdnsproxy1",
                "off",
                "--nic1",
                "nat",
                "--nictype1",
                "82540EM",
                "--cableconnected1",
                "on",
                "--boot1",
                "dvd",
            ])
            .await?;
        self.vbox
            .run(&[
                "storagectl",
                vm,
                "--name",
                STORAGE_CONTROLLER,
                "--add",
                "sata",
                "--hostiocache",
                "on",
            ])
            .await?;

        for (port, kind, medium) in [("0", "dvddrive", iso), ("1", "hdd", disk)] {
            self.vbox
                .run(&[
                    "storageattach",
                    vm,
                    "--storagectl",
                    STORAGE_CONTROLLER,
                    "--port",
                    port,
                    "--device",
                    "0",
                    "--type",
                    kind,
                    "--medium",
                    medium,
                ])
                .await?;
        }

        tracing::info!(vm, "Registered VM");
        Ok(())
    }

    /// Forward a loopback port to the guest's SSH daemon, returning the port
    async fn ensure_ssh_forwarding(&self, b: &Bound) -> Result<u16> {
        let vm = b.name.as_str();
        let wanted = b.options.ssh_port;
        let rules = self.vbox.port_forwardings(vm).await?;

        if let Some(rule) = rules.iter().find(|r| r.name == SSH_RULE) {
            if wanted == 0 || rule.host_port == wanted {
                return Ok(rule.host_port);
            }
            self.vbox
                .run(&["modifyvm", vm, "--natpf1", "delete", SSH_RULE])
                .await?;
        }

        let host_port = if wanted == 0 { free_port()? } else { wanted };
        let rule = PortForwarding {
            interface_index: 1,
            name: SSH_RULE.to_string(),
            protocol: "tcp".to_string(),
            host_ip: "127.0.0.1".to_string(),
            host_port,
            guest_ip: String::new(),
            guest_port: 22,
        };
        let rule_arg = rule.to_rule();
        self.vbox
            .run(&["modifyvm", vm, "--natpf1", rule_arg.as_str()])
            .await?;

        tracing::debug!(vm, host_port, "Forwarded SSH port");
        Ok(host_port)
    }

    async fn forwarded_ssh_port(&self, vm: &str) -> Result<u16> {
        self.vbox
            .port_forwardings(vm)
            .await?
            .into_iter()
            .find(|rule| rule.name == SSH_RULE)
            .map(|rule| rule.host_port)
            .ok_or_else(|| {
                VirtualBoxError::Provision(format!("VM '{}' has no SSH port forwarding", vm))
            })
    }

    fn ssh_client(&self, b: &Bound, port: u16) -> SshClient {
        SshClient::new(
            &self.env,
            SshOptions {
                hostname: "127.0.0.1".to_string(),
                port,
                username: SSH_USERNAME.to_string(),
                private_key_file: b.path_str(PRIVATE_KEY_FILE),
            },
        )
    }

    /// Network, port forward, power on, then wait for an address and SSH
    async fn boot(&self, b: &Bound) -> Result<(String, SshClient)> {
        let vm = b.name.as_str();

        let interfaces = (self.interfaces)()?;
        NetworkPlanner::new(&self.vbox)
            .with_adapter_poll(self.timeouts.adapter)
            .setup_host_only_network(vm, &b.options.host_only_cidr, &interfaces)
            .await?;

        let port = self.ensure_ssh_forwarding(b).await?;

        self.vbox.run(&["startvm", vm, "--type", "headless"]).await?;
        tracing::info!(vm, "Started VM");

        let vbox = &self.vbox;
        let ip = self
            .timeouts
            .ip
            .until("VM to report an IP address", move || async move {
                let check = match vbox.guest_property(vm, IP_PROPERTY).await? {
                    Some(ip) => Check::Ready(ip),
                    None => Check::pending("no address on the host-only interface"),
                };
                Ok::<_, VirtualBoxError>(check)
            })
            .await?;
        tracing::info!(vm, ip = %ip, "VM is up");

        let ssh = self.ssh_client(b, port);
        let client = &ssh;
        self.timeouts
            .ssh
            .until("SSH to accept connections", move || async move {
                let check = if client.is_reachable().await {
                    Check::Ready(())
                } else {
                    Check::pending("ssh refused")
                };
                Ok::<_, VirtualBoxError>(check)
            })
            .await?;

        Ok((ip, ssh))
    }

    fn state_for(b: &Bound, ip: String) -> StageState {
        StageState {
            ip_address: ip,
            username: SSH_USERNAME.to_string(),
            private_key_file: b.path_str(PRIVATE_KEY_FILE),
        }
    }

    async fn create_locked(&self) -> Result<StageState> {
        let b = self.bound()?;
        let status = self.vbox.vm_status(&b.name).await?;
        if status != StageStatus::Nonexistent {
            return Err(Self::invalid_state(b, "create", status));
        }

        tokio::fs::create_dir_all(&b.dir).await?;

        let key_dir = b.dir.clone();
        let comment = format!("dodo@{}", b.name);
        let keypair = Self::blocking(move || ssh::write_keypair(&key_dir, &comment)).await?;

        let cache = dodo_config::cache_dir(&self.env.app_dir);
        let iso = ensure_iso(&b.options.iso_url, &cache, &b.path(ISO_FILE)).await?;

        let payload = boot2docker_payload(keypair.public_line.as_bytes())?;
        let disk = b.path(DISK_FILE);
        create_disk_image(&self.vbox, &disk, b.options.disk_size_mb, &payload).await?;

        self.register_vm(b, &iso.display().to_string(), &disk.display().to_string())
            .await?;

        let (ip, ssh) = self.boot(b).await?;
        let state = Self::state_for(b, ip.clone());
        b.state.save(&state).await?;

        let cert_dir = b.dir.clone();
        let hosts = vec![ip.clone()];
        let server = Self::blocking(move || {
            certs::bootstrap_certificates(&cert_dir, &[])?;
            certs::generate_server_certificate(&cert_dir, &hosts)
        })
        .await?;

        let result = Provisioner::new(&ssh)
            .with_daemon_poll(self.timeouts.daemon)
            .provision(&ProvisionOptions {
                hostname: b.options.hostname.clone(),
                ip_address: ip,
                public_key: keypair.public_line.clone(),
                daemon_args: b.options.docker_args.clone(),
                daemon_env: b.options.docker_env.clone(),
                server,
                client: CertificateSet::client(&b.dir),
            })
            .await?;

        tracing::info!(stage = %b.name, ip = %result.ip_address, "Stage created");
        Ok(state)
    }

    async fn start_locked(&self) -> Result<Option<StageState>> {
        let b = self.bound()?;
        match self.vbox.vm_status(&b.name).await? {
            StageStatus::Running => {
                tracing::info!(stage = %b.name, "Stage is already running");
                Ok(None)
            }
            StageStatus::Nonexistent => Err(Self::invalid_state(b, "start", StageStatus::Nonexistent)),
            StageStatus::Stopped => {
                let (ip, _) = self.boot(b).await?;
                if let Some(saved) = &b.saved {
                    if saved.ip_address != ip {
                        tracing::warn!(
                            previous = %saved.ip_address,
                            current = %ip,
                            "Stage address changed; the daemon certificate names the previous address"
                        );
                    }
                }

                let state = Self::state_for(b, ip);
                b.state.save(&state).await?;
                tracing::info!(stage = %b.name, ip = %state.ip_address, "Stage started");
                Ok(Some(state))
            }
        }
    }

    async fn stop_locked(&self) -> Result<()> {
        let b = self.bound()?;
        let vm = b.name.as_str();
        match self.vbox.vm_status(vm).await? {
            StageStatus::Stopped => {
                tracing::info!(stage = %b.name, "Stage is already stopped");
                Ok(())
            }
            StageStatus::Nonexistent => Err(Self::invalid_state(b, "stop", StageStatus::Nonexistent)),
            StageStatus::Running => {
                self.vbox.run(&["controlvm", vm, "acpipowerbutton"]).await?;

                let vbox = &self.vbox;
                self.timeouts
                    .shutdown
                    .until("VM to power off", move || async move {
                        let check = match vbox.vm_status(vm).await? {
                            StageStatus::Running => Check::pending("running"),
                            status => Check::Ready(status),
                        };
                        Ok::<_, VirtualBoxError>(check)
                    })
                    .await?;

                tracing::info!(stage = %b.name, "Stage stopped");
                Ok(())
            }
        }
    }

    async fn remove_vm(&self, options: RemoveOptions) -> Result<()> {
        let b = self.bound()?;
        let vm = b.name.as_str();
        let force = options.force;

        let status = match self.vbox.vm_status(vm).await {
            Ok(status) => status,
            Err(e) if force => {
                tracing::warn!(stage = %b.name, error = %e, "Could not read VM status, removing anyway");
                StageStatus::Running
            }
            Err(e) => return Err(e),
        };

        if status == StageStatus::Running {
            step(force, "power off VM", self.vbox.run(&["controlvm", vm, "poweroff"]).await)?;
        }
        if status != StageStatus::Nonexistent {
            step(force, "unregister VM", self.vbox.run(&["unregistervm", vm, "--delete"]).await)?;
        }
        if options.volumes {
            tracing::debug!(stage = %b.name, "Data disk is removed together with the VM");
        }

        tracing::info!(stage = %b.name, "Stage removed");
        Ok(())
    }
}

/// Outcome of one teardown step; forced removal logs and continues
fn step<T>(force: bool, what: &str, result: Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if force => {
            tracing::warn!(error = %e, "Failed to {}, continuing", what);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Ask the OS for a free loopback port
fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[async_trait]
impl Stage for VirtualBoxStage {
    async fn initialize(&mut self, name: &str, config: &StageConfig) -> dodo_stage::Result<()> {
        let options = VirtualBoxOptions::from_config(name, config)?;
        let dir = self.env.stage_dir(name)?;
        let state = StateManager::new(&dir);
        let saved = state.load().await?;

        tracing::debug!(stage = name, dir = %dir.display(), provisioned = saved.is_some(), "Initialized VirtualBox stage");
        self.bound = Some(Bound {
            name: name.to_string(),
            dir,
            options,
            state,
            saved,
        });
        Ok(())
    }

    async fn create(&mut self) -> dodo_stage::Result<()> {
        let lock = self.bound()?.state.acquire_lock("create").await?;
        let result = self.create_locked().await;
        lock.release().await?;

        let state = result?;
        if let Some(b) = self.bound.as_mut() {
            b.saved = Some(state);
        }
        Ok(())
    }

    async fn start(&mut self) -> dodo_stage::Result<()> {
        let lock = self.bound()?.state.acquire_lock("start").await?;
        let result = self.start_locked().await;
        lock.release().await?;

        if let (Some(state), Some(b)) = (result?, self.bound.as_mut()) {
            b.saved = Some(state);
        }
        Ok(())
    }

    async fn stop(&mut self) -> dodo_stage::Result<()> {
        let lock = self.bound()?.state.acquire_lock("stop").await?;
        let result = self.stop_locked().await;
        lock.release().await?;
        Ok(result?)
    }

    async fn remove(&mut self, options: RemoveOptions) -> dodo_stage::Result<()> {
        let lock = self.bound()?.state.acquire_lock("remove").await?;
        let result = self.remove_vm(options).await;
        lock.release().await?;
        result?;

        let b = self.bound()?;
        if b.dir.exists() {
            step(
                options.force,
                "delete stage directory",
                tokio::fs::remove_dir_all(&b.dir).await.map_err(VirtualBoxError::from),
            )?;
        }
        if let Some(b) = self.bound.as_mut() {
            b.saved = None;
        }
        Ok(())
    }

    async fn exist(&self) -> dodo_stage::Result<bool> {
        Ok(self.status().await? != StageStatus::Nonexistent)
    }

    async fn available(&self) -> dodo_stage::Result<bool> {
        let b = self.bound()?;
        if self.status().await? != StageStatus::Running {
            return Ok(false);
        }
        let Some(saved) = &b.saved else {
            return Ok(false);
        };

        let addr = format!("{}:{}", saved.ip_address, DOCKER_PORT);
        match certs::validate_certificate(&addr, &b.dir).await {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::debug!(stage = %b.name, error = %e, "Daemon is not reachable");
                Ok(false)
            }
        }
    }

    async fn ssh_options(&self) -> dodo_stage::Result<SshOptions> {
        let b = self.bound()?;
        let saved = b.saved.as_ref().ok_or_else(|| StageError::InvalidState {
            stage: b.name.clone(),
            operation: "connect to",
            status: "not provisioned".to_string(),
        })?;

        Ok(SshOptions {
            hostname: "127.0.0.1".to_string(),
            port: self.forwarded_ssh_port(&b.name).await?,
            username: saved.username.clone(),
            private_key_file: saved.private_key_file.clone(),
        })
    }

    async fn docker_options(&self) -> dodo_stage::Result<DockerOptions> {
        let b = self.bound()?;
        let saved = b.saved.as_ref().ok_or_else(|| StageError::InvalidState {
            stage: b.name.clone(),
            operation: "connect to",
            status: "not provisioned".to_string(),
        })?;

        let client = CertificateSet::client(&b.dir);
        Ok(DockerOptions {
            api_version: String::new(),
            host: format!("tcp://{}:{}", saved.ip_address, DOCKER_PORT),
            ca_file: client.ca.display().to_string(),
            cert_file: client.cert.display().to_string(),
            key_file: client.key.display().to_string(),
        })
    }
}

impl std::fmt::Debug for VirtualBoxStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualBoxStage")
            .field("vbox", &self.vbox)
            .field("timeouts", &self.timeouts)
            .field("stage", &self.bound.as_ref().map(|b| &b.name))
            .finish()
    }
}
