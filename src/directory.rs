//! The directory oracle. The bridge never talks LDAP itself; it consumes
//! this trait, and deployments point `inventory` at a TOML snapshot kept
//! in sync by the directory tooling.

use std::{collections::BTreeMap, fs, path::Path};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRecord {
    pub dn: String,
    pub name: String,
    pub mac: String,
    pub ip: String,
    /// Workstations and servers render different examine glyph sets.
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, Vec<String>>,
}

impl SystemRecord {
    /// First value of an attribute, or `""`.
    pub fn attr(&self, name: &str) -> &str {
        self.attrs
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn attr_all(&self, name: &str) -> &[String] {
        self.attrs.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn set_attr(&mut self, name: &str, values: Vec<String>) {
        self.attrs.insert(name.to_string(), values);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    pub dn: String,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoServer {
    pub server: String,
    pub release: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaiClass {
    pub name: String,
    pub release: String,
}

/// On-disk shape of the inventory file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub systems: Vec<SystemRecord>,
    pub groups: Vec<GroupRecord>,
    pub releases: Vec<String>,
    pub classes: Vec<FaiClass>,
    pub repos: Vec<RepoServer>,
}

pub trait Directory: Send + Sync {
    fn name_for_mac(&self, mac: &str) -> Option<String>;
    fn name_for_ip(&self, ip: &str) -> Option<String>;
    fn ip_for_name(&self, name: &str) -> Option<String>;
    fn mac_for_name(&self, name: &str) -> Option<String>;

    fn system_by_mac(&self, mac: &str) -> Result<SystemRecord>;
    /// Replaces `old` with `new`; `None` deletes the entry.
    fn replace_system(&self, old: &SystemRecord, new: Option<&SystemRecord>) -> Result<()>;
    fn set_system_attr(&self, mac: &str, attr: &str, values: Vec<String>) -> Result<()>;
    fn system_attr(&self, mac: &str, attr: &str) -> String;
    fn is_workstation(&self, mac: &str) -> bool;

    fn groups_with_member(&self, dn: &str) -> Vec<GroupRecord>;
    fn add_to_groups(&self, dn: &str, groups: &[GroupRecord]);

    fn releases(&self) -> Vec<String>;
    fn classes_for_release(&self, release: &str) -> Vec<String>;
    fn repo_servers(&self) -> Vec<RepoServer>;
}

/// Copies attributes present on `template` but absent on `sys`, mints a
/// DN when `sys` has none, and never copies `gotomode` (a locked system
/// stays locked until the operator activates it).
pub fn fill_missing(sys: &mut SystemRecord, template: &SystemRecord) {
    for (attr, values) in &template.attrs {
        if attr == "gotomode" {
            continue;
        }
        sys.attrs
            .entry(attr.clone())
            .or_insert_with(|| values.clone());
    }
    if sys.dn.is_empty() {
        let parent = template
            .dn
            .split_once(',')
            .map(|(_, rest)| rest)
            .unwrap_or("");
        sys.dn = if parent.is_empty() {
            format!("cn={}", sys.name)
        } else {
            format!("cn={},{}", sys.name, parent)
        };
    }
}

pub struct InMemoryDirectory {
    inner: RwLock<Inventory>,
}

impl InMemoryDirectory {
    pub fn new(inventory: Inventory) -> Self {
        Self {
            inner: RwLock::new(inventory),
        }
    }

    pub fn empty() -> Self {
        Self::new(Inventory::default())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            BridgeError::Directory(format!("cannot read {}: {err}", path.display()))
        })?;
        let inventory: Inventory = toml::from_str(&raw)
            .map_err(|err| BridgeError::Directory(format!("{}: {err}", path.display())))?;
        Ok(Self::new(inventory))
    }

    pub fn insert_system(&self, system: SystemRecord) {
        self.inner.write().systems.push(system);
    }

    pub fn insert_group(&self, group: GroupRecord) {
        self.inner.write().groups.push(group);
    }

    pub fn set_releases(&self, releases: Vec<String>) {
        self.inner.write().releases = releases;
    }

    pub fn set_classes(&self, classes: Vec<FaiClass>) {
        self.inner.write().classes = classes;
    }

    pub fn set_repos(&self, repos: Vec<RepoServer>) {
        self.inner.write().repos = repos;
    }
}

impl Directory for InMemoryDirectory {
    fn name_for_mac(&self, mac: &str) -> Option<String> {
        let inner = self.inner.read();
        inner
            .systems
            .iter()
            .find(|s| s.mac.eq_ignore_ascii_case(mac))
            .map(|s| s.name.clone())
    }

    fn name_for_ip(&self, ip: &str) -> Option<String> {
        let inner = self.inner.read();
        inner
            .systems
            .iter()
            .find(|s| s.ip == ip)
            .map(|s| s.name.clone())
    }

    fn ip_for_name(&self, name: &str) -> Option<String> {
        let inner = self.inner.read();
        inner
            .systems
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .map(|s| s.ip.clone())
    }

    fn mac_for_name(&self, name: &str) -> Option<String> {
        let inner = self.inner.read();
        inner
            .systems
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .map(|s| s.mac.clone())
    }

    fn system_by_mac(&self, mac: &str) -> Result<SystemRecord> {
        let inner = self.inner.read();
        inner
            .systems
            .iter()
            .find(|s| s.mac.eq_ignore_ascii_case(mac))
            .cloned()
            .ok_or_else(|| BridgeError::Directory(format!("no system with MAC {mac}")))
    }

    fn replace_system(&self, old: &SystemRecord, new: Option<&SystemRecord>) -> Result<()> {
        let mut inner = self.inner.write();
        let idx = inner
            .systems
            .iter()
            .position(|s| s.mac.eq_ignore_ascii_case(&old.mac))
            .ok_or_else(|| BridgeError::Directory(format!("no system with MAC {}", old.mac)))?;
        match new {
            Some(new) => inner.systems[idx] = new.clone(),
            None => {
                inner.systems.remove(idx);
            }
        }
        Ok(())
    }

    fn set_system_attr(&self, mac: &str, attr: &str, values: Vec<String>) -> Result<()> {
        let mut inner = self.inner.write();
        let system = inner
            .systems
            .iter_mut()
            .find(|s| s.mac.eq_ignore_ascii_case(mac))
            .ok_or_else(|| BridgeError::Directory(format!("no system with MAC {mac}")))?;
        system.set_attr(attr, values);
        Ok(())
    }

    fn system_attr(&self, mac: &str, attr: &str) -> String {
        let inner = self.inner.read();
        inner
            .systems
            .iter()
            .find(|s| s.mac.eq_ignore_ascii_case(mac))
            .map(|s| s.attr(attr).to_string())
            .unwrap_or_default()
    }

    fn is_workstation(&self, mac: &str) -> bool {
        let inner = self.inner.read();
        inner
            .systems
            .iter()
            .find(|s| s.mac.eq_ignore_ascii_case(mac))
            .map(|s| s.kind != "server")
            .unwrap_or(true)
    }

    fn groups_with_member(&self, dn: &str) -> Vec<GroupRecord> {
        let inner = self.inner.read();
        inner
            .groups
            .iter()
            .filter(|g| g.members.iter().any(|m| m == dn))
            .cloned()
            .collect()
    }

    fn add_to_groups(&self, dn: &str, groups: &[GroupRecord]) {
        let mut inner = self.inner.write();
        for group in groups {
            if let Some(existing) = inner.groups.iter_mut().find(|g| g.dn == group.dn) {
                if !existing.members.iter().any(|m| m == dn) {
                    existing.members.push(dn.to_string());
                }
            }
        }
    }

    fn releases(&self) -> Vec<String> {
        self.inner.read().releases.clone()
    }

    fn classes_for_release(&self, release: &str) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .classes
            .iter()
            .filter(|c| c.release == release)
            .map(|c| c.name.clone())
            .collect()
    }

    fn repo_servers(&self) -> Vec<RepoServer> {
        self.inner.read().repos.clone()
    }
}
