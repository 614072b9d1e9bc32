//! First-run LXD initialization and the shared network/profile resources
//!
//! `configure` is meant to run before every command. After the first
//! successful run it only checks that the network and profile exist.
//!
//! Check-then-create is not atomic: two processes bootstrapping at the same
//! time can both see a resource missing and both try to create it. The loser
//! gets an API error from the daemon.

use std::time::Duration;

use crate::config::{flag_value, ConfigStore, Key, YurtConfig};
use crate::lxd::DaemonApi;
use crate::network::{IpConfig, NetworkSpec, ProfileSpec};
use crate::retry::retry;
use crate::vm::{quote_sh, VmShell};
use crate::{Error, Result};

/// Port inside the VM where the socket proxy exposes the LXD API
pub const PROXY_PORT: u16 = 4242;

const PROXY_UNIT: &str = "yurt-lxd-proxy.service";
const LXD_SOCKET: &str = "/var/snap/lxd/common/lxd/unix.socket";

/// Preseed used when the provisioning directory does not ship one
fn default_preseed(pool: &str) -> String {
    format!(
        r#"config:
  core.https_address: '[::]:8443'
networks: []
storage_pools:
- config:
    source: /dev/sdc
  description: ""
  name: {pool}
  driver: zfs
profiles:
- config: {{}}
  description: ""
  devices:
    root:
      path: /
      pool: {pool}
      type: disk
  name: default
cluster: null
"#
    )
}

fn proxy_unit() -> String {
    format!(
        r#"[Unit]
Description=Expose the LXD API on TCP port {port}
After=snap.lxd.daemon.service

[Service]
ExecStart=/usr/bin/socat TCP-LISTEN:{port},fork,reuseaddr UNIX-CONNECT:{socket}
Restart=always

[Install]
WantedBy=multi-user.target
"#,
        port = PROXY_PORT,
        socket = LXD_SOCKET,
    )
}

/// Brings the daemon to the state instances need
pub struct ResourceBootstrap<'a> {
    shell: &'a dyn VmShell,
    store: &'a dyn ConfigStore,
    config: &'a YurtConfig,
    attempts: u32,
    delay: Duration,
}

impl<'a> ResourceBootstrap<'a> {
    pub fn new(shell: &'a dyn VmShell, store: &'a dyn ConfigStore, config: &'a YurtConfig) -> Self {
        Self {
            shell,
            store,
            config,
            attempts: 10,
            delay: Duration::from_secs(6),
        }
    }

    /// How often, and how far apart, network/profile setup is attempted
    pub fn retry_policy(mut self, attempts: u32, delay: Duration) -> Self {
        self.attempts = attempts;
        self.delay = delay;
        self
    }

    /// Initialize LXD if needed, then make sure the network and profile exist
    pub fn configure<D: DaemonApi + ?Sized>(&self, api: &D) -> Result<()> {
        self.ensure_initialized()?;

        let ip = self.ip_config()?;
        retry(self.attempts, self.delay, "LXD resource configuration", || {
            self.ensure_network(api, &ip)?;
            self.ensure_profile(api)
        })
    }

    /// Run first-time initialization unless it is recorded as done.
    /// Returns whether initialization ran.
    pub fn ensure_initialized(&self) -> Result<bool> {
        if flag_value(self.store, Key::IsLxdInitialized)? {
            return Ok(false);
        }

        tracing::info!("Initializing LXD. This might take a few minutes");
        self.initialize()?;
        self.store.set(Key::IsLxdInitialized, "true")?;
        tracing::info!("LXD initialized");
        Ok(true)
    }

    /// Bridge addressing from the configured host interface
    pub fn ip_config(&self) -> Result<IpConfig> {
        let ip = self.store.get(Key::InterfaceIpAddress)?;
        let mask = self.store.get(Key::InterfaceNetmask)?;
        match (ip.as_deref(), mask.as_deref()) {
            (Some(ip), Some(mask)) if !ip.is_empty() && !mask.is_empty() => {
                IpConfig::derive(ip, mask)
            }
            _ => Err(Error::Configuration(format!(
                "Bad IP configuration. ip: {}, mask: {}",
                ip.as_deref().unwrap_or(""),
                mask.as_deref().unwrap_or("")
            ))),
        }
    }

    fn initialize(&self) -> Result<()> {
        let preseed = self.preseed()?;
        let unit_path = format!("/etc/systemd/system/{}", PROXY_UNIT);
        let unit = proxy_unit();

        let steps: [(&str, String, Option<&str>); 6] = [
            ("update package metadata", "sudo apt-get update".into(), None),
            (
                "add user to lxd group",
                format!("sudo usermod -a -G lxd {}", quote_sh(&self.config.vm_user)),
                None,
            ),
            ("lxd init", "sudo lxd init --preseed".into(), Some(preseed.as_str())),
            ("install socat", "sudo apt-get install -y socat".into(), None),
            (
                "write socket proxy unit",
                format!("sudo tee {} > /dev/null", quote_sh(&unit_path)),
                Some(unit.as_str()),
            ),
            (
                "enable socket proxy",
                format!(
                    "sudo systemctl daemon-reload && sudo systemctl enable --now {}",
                    PROXY_UNIT
                ),
                None,
            ),
        ];

        for (label, cmd, stdin) in steps {
            tracing::debug!(step = label, "LXD initialization step");
            self.shell.run(&cmd, stdin, true).map_err(|e| {
                tracing::debug!(step = label, error = %e, "LXD initialization step failed");
                Error::Bootstrap(format!("{}: {}", label, e))
            })?;
        }

        Ok(())
    }

    fn preseed(&self) -> Result<String> {
        let path = self.config.preseed_path();
        if path.is_file() {
            std::fs::read_to_string(&path)
                .map_err(|e| Error::Bootstrap(format!("reading {}: {}", path.display(), e)))
        } else {
            tracing::debug!(path = %path.display(), "No preseed file, using the built-in one");
            Ok(default_preseed(&self.config.storage_pool))
        }
    }

    fn ensure_network<D: DaemonApi + ?Sized>(&self, api: &D, ip: &IpConfig) -> Result<()> {
        let name = &self.config.network_name;
        if api.network_exists(name)? {
            tracing::debug!(network = %name, "Network is defined");
            return Ok(());
        }

        tracing::info!(network = %name, bridge = %ip.bridge_address, "Configuring network");
        api.create_network(&NetworkSpec::bridge(name, ip, &self.config.app_name))
    }

    fn ensure_profile<D: DaemonApi + ?Sized>(&self, api: &D) -> Result<()> {
        let name = &self.config.profile_name;
        if api.profile_exists(name)? {
            tracing::debug!(profile = %name, "Profile is defined");
            return Ok(());
        }

        tracing::info!(profile = %name, "Configuring profile");
        api.create_profile(&ProfileSpec::bridged(
            name,
            &self.config.network_name,
            &self.config.storage_pool,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;
    use crate::lxd::client::MockDaemonApi;
    use crate::vm::CommandOutput;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Records commands and fails the first one containing `fail_on`
    #[derive(Default)]
    struct RecordingShell {
        commands: Mutex<Vec<(String, Option<String>)>>,
        fail_on: Option<&'static str>,
    }

    impl VmShell for RecordingShell {
        fn run(&self, cmd: &str, stdin: Option<&str>, _show_spinner: bool) -> Result<CommandOutput> {
            self.commands
                .lock()
                .push((cmd.to_string(), stdin.map(str::to_string)));
            match self.fail_on {
                Some(pattern) if cmd.contains(pattern) => {
                    Err(Error::Command(format!("`{}` exited with Some(1)", cmd)))
                }
                _ => Ok(CommandOutput::default()),
            }
        }
    }

    fn ip_store() -> MemoryConfigStore {
        MemoryConfigStore::new()
            .with(Key::InterfaceIpAddress, "10.0.0.1")
            .with(Key::InterfaceNetmask, "255.255.255.0")
    }

    fn initialized_store() -> MemoryConfigStore {
        ip_store().with(Key::IsLxdInitialized, "true")
    }

    #[test]
    fn test_first_run_initializes_and_records_flag() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("lxd-init.yaml"), "config: {}\n").unwrap();
        let config = YurtConfig::builder().provision_dir(temp.path()).build();
        let shell = RecordingShell::default();
        let store = ip_store();

        let bootstrap = ResourceBootstrap::new(&shell, &store, &config);
        assert!(bootstrap.ensure_initialized().unwrap());
        assert!(flag_value(&store, Key::IsLxdInitialized).unwrap());

        let commands = shell.commands.lock();
        assert_eq!(commands[0].0, "sudo apt-get update");
        assert_eq!(commands[1].0, "sudo usermod -a -G lxd 'yurt'");
        assert_eq!(commands[2].0, "sudo lxd init --preseed");
        assert_eq!(commands[2].1.as_deref(), Some("config: {}\n"));
        assert!(commands.iter().any(|(cmd, stdin)| cmd.contains("tee")
            && stdin.as_deref().is_some_and(|unit| unit.contains("socat"))));
        assert!(commands.last().unwrap().0.contains("systemctl enable --now"));

        drop(commands);
        // Already recorded, nothing runs again
        assert!(!bootstrap.ensure_initialized().unwrap());
        assert_eq!(shell.commands.lock().len(), 6);
    }

    #[test]
    fn test_builtin_preseed_uses_storage_pool() {
        let config = YurtConfig::builder()
            .provision_dir("/nonexistent/provision")
            .storage_pool("pool0")
            .build();
        let shell = RecordingShell::default();
        let store = ip_store();

        ResourceBootstrap::new(&shell, &store, &config)
            .ensure_initialized()
            .unwrap();

        let commands = shell.commands.lock();
        let preseed = commands[2].1.as_deref().unwrap();
        assert!(preseed.contains("name: pool0"));
        assert!(preseed.contains("pool: pool0"));
    }

    #[test]
    fn test_failed_initialization_does_not_record_flag() {
        let config = YurtConfig::default();
        let shell = RecordingShell {
            fail_on: Some("lxd init"),
            ..Default::default()
        };
        let store = ip_store();
        let api = MockDaemonApi::new();

        let err = ResourceBootstrap::new(&shell, &store, &config)
            .configure(&api)
            .unwrap_err();

        assert!(matches!(err, Error::Bootstrap(_)));
        assert!(err.to_string().contains("Restart the yurt VM"));
        assert!(!flag_value(&store, Key::IsLxdInitialized).unwrap());
        // Steps after the failing one never ran
        assert_eq!(shell.commands.lock().len(), 3);
    }

    #[test]
    fn test_configure_twice_creates_once() {
        let config = YurtConfig::default();
        let shell = RecordingShell::default();
        let store = initialized_store();

        let network_created = Arc::new(AtomicBool::new(false));
        let profile_created = Arc::new(AtomicBool::new(false));

        let mut api = MockDaemonApi::new();
        let created = network_created.clone();
        api.expect_network_exists()
            .times(2)
            .returning(move |_| Ok(created.load(Ordering::SeqCst)));
        let created = network_created.clone();
        api.expect_create_network()
            .times(1)
            .withf(|spec| {
                spec.name == "yurt-int"
                    && spec.config["ipv4.address"] == "10.0.0.2/24"
                    && spec.config["ipv4.dhcp.ranges"] == "10.0.0.11-10.0.0.250"
            })
            .returning(move |_| {
                created.store(true, Ordering::SeqCst);
                Ok(())
            });
        let created = profile_created.clone();
        api.expect_profile_exists()
            .times(2)
            .returning(move |_| Ok(created.load(Ordering::SeqCst)));
        let created = profile_created.clone();
        api.expect_create_profile()
            .times(1)
            .withf(|spec| spec.name == "yurt" && spec.devices["eth0"]["parent"] == "yurt-int")
            .returning(move |_| {
                created.store(true, Ordering::SeqCst);
                Ok(())
            });

        let bootstrap = ResourceBootstrap::new(&shell, &store, &config);
        bootstrap.configure(&api).unwrap();
        bootstrap.configure(&api).unwrap();

        assert!(shell.commands.lock().is_empty());
    }

    #[test]
    fn test_missing_ip_fails_before_contacting_daemon() {
        let config = YurtConfig::default();
        let shell = RecordingShell::default();
        let store = MemoryConfigStore::new()
            .with(Key::IsLxdInitialized, "true")
            .with(Key::InterfaceIpAddress, "10.0.0.1");
        // No expectations: any daemon call would panic
        let api = MockDaemonApi::new();

        let err = ResourceBootstrap::new(&shell, &store, &config)
            .configure(&api)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_malformed_ip_fails_before_contacting_daemon() {
        let config = YurtConfig::default();
        let shell = RecordingShell::default();
        let store = MemoryConfigStore::new()
            .with(Key::IsLxdInitialized, "true")
            .with(Key::InterfaceIpAddress, "10.0.0.1.5")
            .with(Key::InterfaceNetmask, "255.255.255.0");
        let api = MockDaemonApi::new();

        let err = ResourceBootstrap::new(&shell, &store, &config)
            .configure(&api)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_retries_until_daemon_ready() {
        let config = YurtConfig::default();
        let shell = RecordingShell::default();
        let store = initialized_store();

        let mut api = MockDaemonApi::new();
        let mut calls = 0;
        api.expect_network_exists().times(3).returning(move |_| {
            calls += 1;
            if calls < 3 {
                Err(Error::Api("network list: not ready".into()))
            } else {
                Ok(true)
            }
        });
        api.expect_profile_exists().times(1).returning(|_| Ok(true));

        ResourceBootstrap::new(&shell, &store, &config)
            .retry_policy(10, Duration::ZERO)
            .configure(&api)
            .unwrap();
    }

    #[test]
    fn test_gives_up_after_retry_budget() {
        let config = YurtConfig::default();
        let shell = RecordingShell::default();
        let store = initialized_store();

        let mut api = MockDaemonApi::new();
        api.expect_network_exists()
            .times(4)
            .returning(|_| Err(Error::Api("not ready".into())));

        let err = ResourceBootstrap::new(&shell, &store, &config)
            .retry_policy(4, Duration::ZERO)
            .configure(&api)
            .unwrap_err();
        assert!(matches!(err, Error::Api(_)));
    }
}
