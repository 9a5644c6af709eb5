use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::{
    access::AccessConfig,
    error::{BridgeError, Result},
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fleetbridge/bridge.toml";
pub const DEFAULT_UPSTREAM_PORT: u16 = 20081;

fn default_source_name() -> String {
    "CONSOLE".to_string()
}

fn default_module() -> String {
    "jobs".to_string()
}

fn default_timeout_secs() -> u64 {
    20
}

/// The wire dialect fixes the CBC initialization vector per deployment.
/// The default derives a printable 16-byte vector the same way the
/// upstream family always has: the leading hex digits of an MD5 digest.
fn default_init_vector() -> String {
    let digest = Md5::digest(b"fleetbridge");
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    pub certificate: PathBuf,
    pub key: PathBuf,
    /// CA bundle(s) used both to verify client certificates on the
    /// listener and to identify this bridge to its clients.
    #[serde(default)]
    pub ca: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upstream address, `host[:port]`. The command line overrides this.
    pub target: Option<String>,
    /// Value of the `<source>` element in outbound messages.
    pub source_name: String,
    /// Exactly 16 bytes; shared with the upstream.
    pub init_vector: String,
    /// Per-operation network timeout in seconds.
    pub timeout_secs: u64,
    /// Module whose keyword encrypts job and query traffic.
    pub default_module: String,
    /// Module name -> encryption keyword.
    pub modules: BTreeMap<String, String>,
    /// Upstream address or host -> additional keywords for decryption.
    pub server_keys: BTreeMap<String, Vec<String>>,
    /// DN suffix of the incoming bucket; systems there get a fresh DN
    /// when copied onto a template.
    pub incoming_suffix: String,
    /// Path to the directory inventory consumed by the oracle.
    pub inventory: Option<PathBuf>,
    pub tls: Option<TlsSettings>,
    pub access: AccessConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: None,
            source_name: default_source_name(),
            init_vector: default_init_vector(),
            timeout_secs: default_timeout_secs(),
            default_module: default_module(),
            modules: BTreeMap::new(),
            server_keys: BTreeMap::new(),
            incoming_suffix: String::new(),
            inventory: None,
            tls: None,
            access: AccessConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            BridgeError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the given path, or the default location if it exists, or
    /// falls back to built-in defaults.
    pub fn load_or_default(path: Option<PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load(&path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.is_file() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.init_vector.len() != 16 {
            return Err(BridgeError::Config(format!(
                "init_vector must be exactly 16 bytes, got {}",
                self.init_vector.len()
            )));
        }
        if !self.default_module.is_empty()
            && !self.modules.is_empty()
            && !self.modules.contains_key(&self.default_module)
        {
            return Err(BridgeError::Config(format!(
                "default_module \"{}\" has no entry in [modules]",
                self.default_module
            )));
        }
        Ok(())
    }

    pub fn iv(&self) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&self.init_vector.as_bytes()[..16]);
        iv
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Keyword of the default module; job and query traffic uses it.
    pub fn default_key(&self) -> Option<&str> {
        self.modules.get(&self.default_module).map(String::as_str)
    }

    /// All module keywords, in stable order, for decryption probing.
    pub fn module_keys(&self) -> Vec<String> {
        self.modules.values().cloned().collect()
    }

    /// Keywords associated with one upstream address.
    pub fn keys_for_server(&self, addr: &str) -> Vec<String> {
        let mut keys = self.server_keys.get(addr).cloned().unwrap_or_default();
        if let Some(host) = addr.split(':').next() {
            if host != addr {
                keys.extend(self.server_keys.get(host).cloned().unwrap_or_default());
            }
        }
        keys
    }

    /// Module keys, then keys of the given sender, then every known
    /// server key. The probe order tolerant decryption uses.
    pub fn all_keys_for(&self, addr: &str) -> Vec<String> {
        let mut keys = self.module_keys();
        keys.extend(self.keys_for_server(addr));
        for list in self.server_keys.values() {
            keys.extend(list.iter().cloned());
        }
        keys.dedup();
        keys
    }

    /// Normalizes `host[:port]` to `host:port` with the default
    /// upstream port.
    pub fn normalize_target(addr: &str) -> String {
        if addr.contains(':') {
            addr.to_string()
        } else {
            format!("{addr}:{DEFAULT_UPSTREAM_PORT}")
        }
    }
}
