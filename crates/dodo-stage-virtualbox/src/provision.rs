//! Remote provisioning of a freshly booted guest
//!
//! Every step is an idempotent shell snippet sent over SSH, so provisioning
//! can simply be re-run after a failure.

use crate::certs::CertificateSet;
use crate::error::{Result, VirtualBoxError};
use crate::options::is_valid_hostname;
use crate::ssh::SshClient;
use dodo_stage::{Check, Poll};
use std::path::PathBuf;
use std::time::Duration;

/// Port of the TLS-verified daemon listener
pub const DOCKER_PORT: u16 = 2376;

/// Readiness wait after restarting the daemon: 300 attempts, 1s apart
pub const DAEMON_POLL: Poll = Poll::new(Duration::from_secs(1), 300);

pub const MANAGED_BLOCK_BEGIN: &str = "# BEGIN dodo managed block";
pub const MANAGED_BLOCK_END: &str = "# END dodo managed block";

const INTERFACES_FILE: &str = "/etc/network/interfaces";
const SECOND_NIC: &str = "eth1";
const NO_NMCLI: i32 = 3;

/// Package managers tried in order, with their daemon install command
pub const PACKAGE_MANAGERS: &[(&str, &str)] = &[
    ("apt-get", "apt-get update -q && DEBIAN_FRONTEND=noninteractive apt-get install -y -q docker.io"),
    ("dnf", "dnf install -y docker"),
    ("yum", "yum install -y docker"),
    ("zypper", "zypper --non-interactive install docker"),
    ("apk", "apk add --no-cache docker"),
    ("pacman", "pacman -Sy --noconfirm docker"),
];

/// What the provisioner needs to know about the guest
#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    pub hostname: String,
    pub ip_address: String,
    pub public_key: String,
    /// Extra daemon command line arguments
    pub daemon_args: Vec<String>,
    /// Extra daemon environment variables
    pub daemon_env: Vec<(String, String)>,
    /// Server certificate to install on the guest
    pub server: CertificateSet,
    /// Client certificate handed back to the caller
    pub client: CertificateSet,
}

/// Outcome of a successful provisioning run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionResult {
    pub ip_address: String,
    pub ca_file: PathBuf,
    pub client_cert_file: PathBuf,
    pub client_key_file: PathBuf,
}

/// How the guest's daemon is configured and restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonConfig {
    /// systemd drop-in under `/etc/systemd/system/docker.service.d`
    Systemd,
    /// `/var/lib/boot2docker/profile`
    Boot2Docker,
    /// `/etc/default/docker`
    DefaultFile,
}

impl DaemonConfig {
    const DETECT: &'static str = "if [ -d /run/systemd/system ]; then echo systemd; \
         elif [ -f /var/lib/boot2docker/profile ] || [ -d /var/lib/boot2docker ]; then echo boot2docker; \
         else echo default; fi";

    fn from_detection(output: &str) -> Self {
        match output.trim() {
            "systemd" => DaemonConfig::Systemd,
            "boot2docker" => DaemonConfig::Boot2Docker,
            _ => DaemonConfig::DefaultFile,
        }
    }

    /// Directory the TLS material is written to
    pub fn cert_dir(&self) -> &'static str {
        match self {
            DaemonConfig::Boot2Docker => "/var/lib/boot2docker",
            DaemonConfig::Systemd | DaemonConfig::DefaultFile => "/etc/docker",
        }
    }

    pub fn config_path(&self) -> &'static str {
        match self {
            DaemonConfig::Systemd => "/etc/systemd/system/docker.service.d/10-dodo.conf",
            DaemonConfig::Boot2Docker => "/var/lib/boot2docker/profile",
            DaemonConfig::DefaultFile => "/etc/default/docker",
        }
    }

    pub fn restart_command(&self) -> &'static str {
        match self {
            DaemonConfig::Systemd => "sudo systemctl daemon-reload && sudo systemctl restart docker",
            DaemonConfig::Boot2Docker => "sudo /etc/init.d/docker restart",
            DaemonConfig::DefaultFile => "sudo service docker restart",
        }
    }

    fn tls_flags(&self) -> Vec<String> {
        let dir = self.cert_dir();
        vec![
            "--tlsverify".to_string(),
            format!("--tlscacert={}/ca.pem", dir),
            format!("--tlscert={}/server.pem", dir),
            format!("--tlskey={}/server-key.pem", dir),
        ]
    }

    /// Render the daemon configuration file
    pub fn render(&self, args: &[String], env: &[(String, String)]) -> String {
        let listen = format!("-H tcp://0.0.0.0:{}", DOCKER_PORT);
        let tls = self.tls_flags().join(" ");
        let extra = args.join(" ");

        match self {
            DaemonConfig::Systemd => {
                let mut out = String::from("[Service]\n");
                for (key, value) in env {
                    out.push_str(&format!("Environment=\"{}={}\"\n", key, value));
                }
                out.push_str("ExecStart=\n");
                out.push_str(&format!(
                    "ExecStart=/usr/bin/dockerd -H unix:///var/run/docker.sock {} {} {}\n",
                    listen, tls, extra
                ));
                out
            }
            DaemonConfig::Boot2Docker => {
                let dir = self.cert_dir();
                let mut out = format!(
                    "EXTRA_ARGS='{}'\nCACERT={dir}/ca.pem\nSERVERCERT={dir}/server.pem\nSERVERKEY={dir}/server-key.pem\nDOCKER_HOST='{}'\nDOCKER_TLS=auto\n",
                    extra,
                    listen,
                    dir = dir
                );
                for (key, value) in env {
                    out.push_str(&format!("export {}=\"{}\"\n", key, value));
                }
                out
            }
            DaemonConfig::DefaultFile => {
                let mut out = format!(
                    "DOCKER_OPTS='-H unix:///var/run/docker.sock {} {} {}'\n",
                    listen, tls, extra
                );
                for (key, value) in env {
                    out.push_str(&format!("export {}=\"{}\"\n", key, value));
                }
                out
            }
        }
    }
}

/// Replace the managed block in `existing` with `block`, keeping everything
/// around it; appends the block when there is none yet
pub fn rewrite_managed_block(existing: &str, block: &str) -> String {
    let managed = format!(
        "{}\n{}\n{}\n",
        MANAGED_BLOCK_BEGIN,
        block.trim_end_matches('\n'),
        MANAGED_BLOCK_END
    );

    if let Some(start) = existing.find(MANAGED_BLOCK_BEGIN) {
        if let Some(end_offset) = existing[start..].find(MANAGED_BLOCK_END) {
            let mut end = start + end_offset + MANAGED_BLOCK_END.len();
            if existing[end..].starts_with('\n') {
                end += 1;
            }
            return format!("{}{}{}", &existing[..start], managed, &existing[end..]);
        }
    }

    let mut out = existing.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(&managed);
    out
}

/// Shell script installing the daemon with the first package manager found
pub fn install_script() -> String {
    let mut script = String::from("set -e\nif command -v docker >/dev/null 2>&1; then exit 0; fi\n");
    for (manager, install) in PACKAGE_MANAGERS {
        script.push_str(&format!(
            "if command -v {} >/dev/null 2>&1; then sudo sh -c '{}'; exit 0; fi\n",
            manager, install
        ));
    }
    script.push_str("echo 'no supported package manager found' >&2\nexit 1\n");
    script
}

fn nmcli_script() -> String {
    format!(
        "command -v nmcli >/dev/null 2>&1 || exit {code}\n\
         sudo nmcli connection modify dodo-{nic} ipv4.method auto 2>/dev/null \
         || sudo nmcli connection add type ethernet ifname {nic} con-name dodo-{nic} ipv4.method auto\n\
         sudo nmcli connection up dodo-{nic}\n",
        code = NO_NMCLI,
        nic = SECOND_NIC
    )
}

fn interfaces_block() -> String {
    format!("auto {nic}\niface {nic} inet dhcp", nic = SECOND_NIC)
}

/// Drives the provisioning steps over SSH
#[derive(Debug)]
pub struct Provisioner<'a> {
    ssh: &'a SshClient,
    daemon_poll: Poll,
}

impl<'a> Provisioner<'a> {
    pub fn new(ssh: &'a SshClient) -> Self {
        Self {
            ssh,
            daemon_poll: DAEMON_POLL,
        }
    }

    pub fn with_daemon_poll(mut self, poll: Poll) -> Self {
        self.daemon_poll = poll;
        self
    }

    pub async fn provision(&self, options: &ProvisionOptions) -> Result<ProvisionResult> {
        tracing::info!(host = %options.hostname, ip = %options.ip_address, "Provisioning guest");

        self.replace_authorized_keys(&options.public_key).await?;
        self.set_hostname(&options.hostname).await?;
        self.configure_second_nic().await?;
        self.install_daemon().await?;
        let config = self.configure_daemon(options).await?;
        self.restart_daemon(config).await?;

        Ok(ProvisionResult {
            ip_address: options.ip_address.clone(),
            ca_file: options.client.ca.clone(),
            client_cert_file: options.client.cert.clone(),
            client_key_file: options.client.key.clone(),
        })
    }

    async fn replace_authorized_keys(&self, public_key: &str) -> Result<()> {
        let key = format!("{}\n", public_key.trim_end());
        let output = self
            .ssh
            .exec(
                "umask 077 && mkdir -p ~/.ssh && cat > ~/.ssh/authorized_keys",
                Some(key.as_bytes()),
            )
            .await?;
        if !output.success {
            return Err(VirtualBoxError::Provision(format!(
                "replacing authorized keys failed: {}",
                output.stderr.trim()
            )));
        }
        tracing::debug!("Replaced authorized keys");
        Ok(())
    }

    async fn set_hostname(&self, hostname: &str) -> Result<()> {
        if !is_valid_hostname(hostname) {
            return Err(VirtualBoxError::Provision(format!(
                "refusing to set invalid host name '{}'",
                hostname
            )));
        }
        self.ssh
            .run_script(&format!(
                "set -e\nprintf '%s\\n' '{name}' | sudo tee /etc/hostname >/dev/null\nsudo hostname '{name}'\n",
                name = hostname
            ))
            .await?;
        tracing::debug!(hostname, "Set hostname");
        Ok(())
    }

    async fn configure_second_nic(&self) -> Result<()> {
        let output = self.ssh.exec("sh -s", Some(nmcli_script().as_bytes())).await?;
        if output.success {
            tracing::debug!("Configured {} with nmcli", SECOND_NIC);
            return Ok(());
        }
        if output.code != Some(NO_NMCLI) {
            return Err(VirtualBoxError::Provision(format!(
                "nmcli failed to configure {}: {}",
                SECOND_NIC,
                output.stderr.trim()
            )));
        }

        let existing = self
            .ssh
            .exec(&format!("cat {}", INTERFACES_FILE), None)
            .await?;
        if !existing.success {
            tracing::debug!("No {} on guest, leaving {} to the guest", INTERFACES_FILE, SECOND_NIC);
            return Ok(());
        }

        let updated = rewrite_managed_block(&existing.stdout, &interfaces_block());
        self.ssh
            .upload(updated.as_bytes(), INTERFACES_FILE, "644")
            .await?;
        let restart = self
            .ssh
            .exec(&format!("sudo ifdown {nic}; sudo ifup {nic}", nic = SECOND_NIC), None)
            .await?;
        if !restart.success {
            tracing::warn!(
                nic = SECOND_NIC,
                stderr = %restart.stderr.trim(),
                "Restarting the interface failed; it picks up the new config on next boot"
            );
        }
        tracing::debug!("Configured {} in {}", SECOND_NIC, INTERFACES_FILE);
        Ok(())
    }

    async fn install_daemon(&self) -> Result<()> {
        self.ssh.run_script(&install_script()).await?;
        Ok(())
    }

    async fn configure_daemon(&self, options: &ProvisionOptions) -> Result<DaemonConfig> {
        let detected = self.ssh.run(DaemonConfig::DETECT).await?;
        let config = DaemonConfig::from_detection(&detected);
        let dir = config.cert_dir();

        let uploads = [
            (&options.server.ca, "ca.pem", "644"),
            (&options.server.cert, "server.pem", "644"),
            (&options.server.key, "server-key.pem", "600"),
        ];
        for (local, name, mode) in uploads {
            let content = tokio::fs::read(local).await?;
            self.ssh
                .upload(&content, &format!("{}/{}", dir, name), mode)
                .await?;
        }

        let rendered = config.render(&options.daemon_args, &options.daemon_env);
        self.ssh
            .upload(rendered.as_bytes(), config.config_path(), "644")
            .await?;

        tracing::debug!(config = ?config, path = config.config_path(), "Configured daemon");
        Ok(config)
    }

    async fn restart_daemon(&self, config: DaemonConfig) -> Result<()> {
        self.ssh.run(config.restart_command()).await?;

        let ssh = self.ssh;
        let listening = format!("nc -z 127.0.0.1 {} >/dev/null 2>&1", DOCKER_PORT);
        let listening = listening.as_str();
        self.daemon_poll
            .until("daemon to listen", move || async move {
                let output = ssh.exec(listening, None).await?;
                let check = if output.success {
                    Check::Ready(())
                } else {
                    Check::pending(format!("port {} closed", DOCKER_PORT))
                };
                Ok::<_, VirtualBoxError>(check)
            })
            .await?;

        tracing::info!("Daemon is listening on port {}", DOCKER_PORT);
        Ok(())
    }
}
