//! The per-session capability record. Sessions get one frozen record at
//! accept time: TLS sessions through the client-certificate map in the
//! configuration, local pipe/stdio sessions through the legacy defaults.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub query_all: bool,
    pub query_jobs: bool,
    pub jobs_all: bool,
    pub jobs_lock: bool,
    pub jobs_unlock: bool,
    pub jobs_shutdown: bool,
    pub jobs_wake: bool,
    pub jobs_abort: bool,
    pub jobs_install: bool,
    pub jobs_update: bool,
    pub jobs_usermsg: bool,
    pub jobs_modify: bool,
    pub ldap_update: bool,
    pub detected_hw: bool,
    pub debug: bool,
}

impl Capabilities {
    /// Full access. Non-TLS transports (pipes, files, stdio) are only
    /// reachable by the local operator.
    pub fn legacy_defaults() -> Self {
        Self {
            query_all: true,
            query_jobs: true,
            jobs_all: true,
            jobs_lock: true,
            jobs_unlock: true,
            jobs_shutdown: true,
            jobs_wake: true,
            jobs_abort: true,
            jobs_install: true,
            jobs_update: true,
            jobs_usermsg: true,
            jobs_modify: true,
            ldap_update: true,
            detected_hw: true,
            debug: true,
        }
    }

    pub fn may_trigger(&self, job: &str) -> bool {
        if self.jobs_all {
            return true;
        }
        match job {
            "lock" => self.jobs_lock,
            "activate" => self.jobs_unlock,
            "reboot" | "halt" => self.jobs_shutdown,
            "wake" => self.jobs_wake,
            "localboot" => self.jobs_abort,
            "reinstall" => self.jobs_install,
            "update" => self.jobs_update,
            "send_user_msg" => self.jobs_usermsg,
            _ => false,
        }
    }

    pub fn may_query(&self) -> bool {
        self.query_jobs || self.query_all
    }

    pub fn may_examine(&self) -> bool {
        self.query_all
    }

    pub fn may_modify_jobs(&self) -> bool {
        self.jobs_modify || self.jobs_all
    }

    pub fn may_edit_directory(&self) -> bool {
        self.ldap_update && self.detected_hw
    }

    pub fn may_set_fai_state(&self) -> bool {
        self.ldap_update
    }

    pub fn may_debug(&self) -> bool {
        self.debug
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Named capability profiles.
    pub profiles: BTreeMap<String, Capabilities>,
    /// Lowercase hex SHA-256 fingerprint of a client leaf certificate,
    /// mapped to a profile name.
    pub clients: BTreeMap<String, String>,
}

impl AccessConfig {
    pub fn for_fingerprint(&self, fingerprint: &str) -> Option<Capabilities> {
        let profile = self.clients.get(fingerprint)?;
        self.profiles.get(profile).copied()
    }
}
