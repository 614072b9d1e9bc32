//! Settings with builder pattern, and the persisted key-value store

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::network::{NETWORK_NAME, PROFILE_NAME, STORAGE_POOL};
use crate::{Error, Result};

pub const APP_NAME: &str = "yurt";

#[derive(Debug, Clone)]
pub struct YurtConfig {
    /// Application name, also used as the bridge's DNS domain
    pub app_name: String,
    pub network_name: String,
    pub profile_name: String,
    pub storage_pool: String,
    /// Directory holding provisioning assets such as the LXD preseed
    pub provision_dir: PathBuf,
    /// User that runs commands inside the VM
    pub vm_user: String,
}

impl Default for YurtConfig {
    fn default() -> Self {
        Self {
            app_name: APP_NAME.to_string(),
            network_name: NETWORK_NAME.to_string(),
            profile_name: PROFILE_NAME.to_string(),
            storage_pool: STORAGE_POOL.to_string(),
            provision_dir: PathBuf::from("provision"),
            vm_user: APP_NAME.to_string(),
        }
    }
}

impl YurtConfig {
    pub fn builder() -> YurtConfigBuilder {
        YurtConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() {
            return Err(Error::Configuration("app_name cannot be empty".into()));
        }
        if self.network_name.is_empty() || self.profile_name.is_empty() {
            return Err(Error::Configuration("network and profile names cannot be empty".into()));
        }
        if self.storage_pool.is_empty() {
            return Err(Error::Configuration("storage_pool cannot be empty".into()));
        }
        if self.vm_user.is_empty() {
            return Err(Error::Configuration("vm_user cannot be empty".into()));
        }
        Ok(())
    }

    /// Location of the LXD init preseed document
    pub fn preseed_path(&self) -> PathBuf {
        self.provision_dir.join("lxd-init.yaml")
    }

    /// Private key accepted by the VM's ssh server
    pub fn ssh_key_path(&self) -> PathBuf {
        self.provision_dir.join("id_rsa")
    }
}

/// Name of the per-user config directory for a `YURT_ENV` value
pub fn config_dir_name(env: Option<&str>) -> String {
    match env {
        Some("development") => format!(".{}-dev", APP_NAME),
        Some("test") => format!(".{}-test", APP_NAME),
        _ => format!(".{}", APP_NAME),
    }
}

/// `~/.yurt`, or its development/test variant selected by `YURT_ENV`
pub fn default_config_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .ok_or_else(|| Error::Configuration("HOME is not set".into()))?;
    let env = std::env::var("YURT_ENV").ok();
    Ok(PathBuf::from(home).join(config_dir_name(env.as_deref())))
}

#[derive(Default)]
pub struct YurtConfigBuilder {
    config: YurtConfig,
}

impl YurtConfigBuilder {
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.app_name = name.into();
        self
    }

    pub fn network_name(mut self, name: impl Into<String>) -> Self {
        self.config.network_name = name.into();
        self
    }

    pub fn profile_name(mut self, name: impl Into<String>) -> Self {
        self.config.profile_name = name.into();
        self
    }

    pub fn storage_pool(mut self, pool: impl Into<String>) -> Self {
        self.config.storage_pool = pool.into();
        self
    }

    pub fn provision_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.provision_dir = dir.into();
        self
    }

    pub fn vm_user(mut self, user: impl Into<String>) -> Self {
        self.config.vm_user = user.into();
        self
    }

    pub fn build(self) -> YurtConfig {
        self.config
    }

    pub fn build_validated(self) -> Result<YurtConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}

/// Keys of the persisted configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    VmName,
    Interface,
    InterfaceIpAddress,
    InterfaceNetmask,
    SshPort,
    IsLxdInitialized,
    LxdPort,
}

impl Key {
    pub fn as_str(&self) -> &'static str {
        match self {
            Key::VmName => "vm_name",
            Key::Interface => "interface",
            Key::InterfaceIpAddress => "interface_ip_address",
            Key::InterfaceNetmask => "interface_netmask",
            Key::SshPort => "ssh_port",
            Key::IsLxdInitialized => "is_lxd_initialized",
            Key::LxdPort => "lxd_port",
        }
    }
}

/// Persisted configuration values shared with the rest of yurt
#[cfg_attr(test, mockall::automock)]
pub trait ConfigStore {
    fn get(&self, key: Key) -> Result<Option<String>>;
    fn set(&self, key: Key, value: &str) -> Result<()>;
}

/// Parse a stored port number
pub fn port_value(store: &dyn ConfigStore, key: Key) -> Result<u16> {
    let raw = store
        .get(key)?
        .ok_or_else(|| Error::Configuration(format!("{} is not set", key.as_str())))?;
    raw.trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("{} is not a port: {}", key.as_str(), raw)))
}

/// Interpret a stored flag; anything but a true-ish value is false
pub fn flag_value(store: &dyn ConfigStore, key: Key) -> Result<bool> {
    Ok(matches!(
        store.get(key)?.as_deref().map(str::trim),
        Some("true") | Some("True") | Some("1")
    ))
}

/// In-process store, for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: Mutex<HashMap<Key, String>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: Key, value: impl Into<String>) -> Self {
        self.values.lock().insert(key, value.into());
        self
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: Key) -> Result<Option<String>> {
        Ok(self.values.lock().get(&key).cloned())
    }

    fn set(&self, key: Key, value: &str) -> Result<()> {
        self.values.lock().insert(key, value.to_string());
        Ok(())
    }
}

type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Flat JSON object on disk, created empty on first use
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `config.json` inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join("config.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reset to an empty configuration
    pub fn clear(&self) -> Result<()> {
        tracing::debug!(path = %self.path.display(), "Clearing config");
        self.write(&ConfigMap::new())
    }

    fn ensure_exists(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !self.path.is_file() {
            std::fs::write(&self.path, "{}")?;
        }
        Ok(())
    }

    fn read(&self) -> Result<ConfigMap> {
        self.ensure_exists()?;
        let text = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&text).map_err(|e| {
            tracing::error!(path = %self.path.display(), error = %e, "Malformed config file");
            Error::Configuration(format!("Malformed config file {}: {}", self.path.display(), e))
        })
    }

    fn write(&self, map: &ConfigMap) -> Result<()> {
        self.ensure_exists()?;
        std::fs::write(&self.path, serde_json::to_string(map)?)?;
        Ok(())
    }
}

impl ConfigStore for JsonConfigStore {
    fn get(&self, key: Key) -> Result<Option<String>> {
        let map = self.read()?;
        Ok(map.get(key.as_str()).and_then(|v| match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }))
    }

    fn set(&self, key: Key, value: &str) -> Result<()> {
        let old = self.read()?;
        let mut new = old.clone();
        new.insert(key.as_str().to_string(), serde_json::Value::String(value.to_string()));

        if let Err(e) = self.write(&new) {
            tracing::error!(key = key.as_str(), error = %e, "Error writing config");
            self.write(&old)?;
            return Err(e);
        }
        Ok(())
    }
}
