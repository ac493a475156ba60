/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use netaddr2::NetAddr;
use secrecy::SecretString;
use serde::Deserialize;
use serde_with::{DurationSeconds, serde_as};
use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

pub const KRBMGR_ENV_CONFIG: &str = "KRBMGR_CONFIG";
const KRBMGR_ENV_PREFIX: &str = "KRBMGR";
const DEFAULT_CONFIG: &str = "etc/krbmgr";

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub allow_networks: Vec<NetAddr>,
    pub paths: Paths,
    pub tools: Tools,
    pub ticket: Ticket,
    pub keytab: Keytab,
    pub activedirectory: ActiveDirectory,
    pub ldap: Ldap,
}

#[derive(Deserialize)]
#[serde(default)]
pub struct Paths {
    pub run_dir: PathBuf,
    pub krb5_conf: PathBuf,
    pub system_keytab: PathBuf,
    pub samba_keytab: PathBuf,
    pub test_keytab: PathBuf,
    pub state: PathBuf,
    pub secrets_tdb: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            run_dir: "/var/run/middleware".into(),
            krb5_conf: "/etc/krb5.conf".into(),
            system_keytab: "/etc/krb5.keytab".into(),
            samba_keytab: "/var/db/system/samba4/private/samba.keytab".into(),
            test_keytab: "/var/db/system/test.keytab".into(),
            state: "/var/db/krbmgr/state.json".into(),
            secrets_tdb: "/var/db/system/samba4/private/secrets.tdb".into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
pub struct Tools {
    pub kinit: PathBuf,
    pub klist: PathBuf,
    pub kdestroy: PathBuf,
    pub ktutil: PathBuf,
    pub tdbdump: PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            kinit: "kinit".into(),
            klist: "klist".into(),
            kdestroy: "kdestroy".into(),
            ktutil: "ktutil".into(),
            tdbdump: "tdbdump".into(),
        }
    }
}

#[serde_as]
#[derive(Deserialize)]
#[serde(default)]
pub struct Ticket {
    #[serde_as(as = "DurationSeconds<u64>")]
    pub check_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub renew_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub klist_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub status_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub kinit_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub start_timeout: Duration,
    /// Renewable lifetime requested from the KDC, in days.
    pub renewal_period: u32,
    /// Ticket lifetime in minutes, 0 leaves it to the KDC.
    pub lifetime: u32,
    pub libdefaults_aux: String,
    pub appdefaults_aux: String,
}

impl Default for Ticket {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1800),
            renew_timeout: Duration::from_secs(15),
            klist_timeout: Duration::from_secs(10),
            status_timeout: Duration::from_secs(10),
            kinit_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(30),
            renewal_period: 7,
            lifetime: 0,
            libdefaults_aux: String::new(),
            appdefaults_aux: String::new(),
        }
    }
}

#[serde_as]
#[derive(Deserialize)]
#[serde(default)]
pub struct Keytab {
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconcile_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub list_timeout: Duration,
}

impl Default for Keytab {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(3600),
            list_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Deserialize, Default, Clone)]
#[serde(default)]
pub struct ActiveDirectory {
    pub enable: bool,
    pub domainname: String,
    pub bindname: String,
    pub bindpw: Option<SecretString>,
    pub netbiosname: String,
    /// SMB workgroup, keys the machine account secrets.
    pub workgroup: String,
    pub kerberos_principal: String,
}

#[derive(Deserialize, Default, Clone)]
#[serde(default)]
pub struct Ldap {
    pub enable: bool,
    pub binddn: String,
    pub bindpw: Option<SecretString>,
    pub kerberos_realm: Option<u32>,
    pub kerberos_principal: String,
}

/// Location of the configuration file, without its extension.
pub fn config_path() -> PathBuf {
    match env::var_os(KRBMGR_ENV_CONFIG) {
        Some(path) => path.into(),
        None => option_env!("PREFIX").map_or("/".as_ref(), Path::new).join(DEFAULT_CONFIG),
    }
}

pub fn try_load(path: &Path) -> Result<Config, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::with_name(&path.to_string_lossy()).required(false))
        .add_source(
            config::Environment::with_prefix(KRBMGR_ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("allow_networks"),
        )
        .build()
        .and_then(config::Config::try_deserialize)
        .and_then(check_durations)
}

/// Rejects zero intervals and timeouts, which would make the periodic tasks spin.
fn check_durations(config: Config) -> Result<Config, config::ConfigError> {
    let durations = [
        ("ticket.check_interval", config.ticket.check_interval),
        ("ticket.renew_timeout", config.ticket.renew_timeout),
        ("ticket.klist_timeout", config.ticket.klist_timeout),
        ("ticket.status_timeout", config.ticket.status_timeout),
        ("ticket.kinit_timeout", config.ticket.kinit_timeout),
        ("ticket.start_timeout", config.ticket.start_timeout),
        ("keytab.reconcile_interval", config.keytab.reconcile_interval),
        ("keytab.list_timeout", config.keytab.list_timeout),
    ];
    match durations.iter().find(|(_, d)| d.is_zero()) {
        Some((name, _)) => Err(config::ConfigError::Message(format!("{name} must be greater than zero"))),
        None => Ok(config),
    }
}

pub fn load(path: &Path) -> Config {
    let config = try_load(path).unwrap_or_else(|error| {
        tracing::warn!(%error, path = %path.display(), "could not load configuration");
        Config::default()
    });

    tracing::info!(
        config.allow_networks = ?config.allow_networks.iter().map(ToString::to_string).collect::<Vec<_>>(),
        config.run_dir = %config.paths.run_dir.display(),
        config.krb5_conf = %config.paths.krb5_conf.display(),
        config.system_keytab = %config.paths.system_keytab.display(),
        config.check_interval = config.ticket.check_interval.as_secs(),
        config.renewal_period = config.ticket.renewal_period,
        config.reconcile_interval = config.keytab.reconcile_interval.as_secs(),
        config.activedirectory = config.activedirectory.enable,
        config.ldap = config.ldap.enable,
        "loaded configuration"
    );
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = try_load(&dir.path().join("missing")).unwrap();

        assert_eq!(config.ticket.check_interval, Duration::from_secs(1800));
        assert_eq!(config.ticket.renew_timeout, Duration::from_secs(15));
        assert_eq!(config.keytab.reconcile_interval, Duration::from_secs(3600));
        assert_eq!(config.paths.system_keytab, Path::new("/etc/krb5.keytab"));
        assert!(!config.activedirectory.enable);
    }

    #[test]
    fn reads_toml_sections() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("krbmgr.toml")).unwrap();
        writeln!(
            file,
            r#"
allow_networks = ["10.0.0.0/8"]

[ticket]
check_interval = 60
renewal_period = 3

[activedirectory]
enable = true
domainname = "ad.example.com"
bindname = "svc"
bindpw = "s3cret"
netbiosname = "NAS01"
workgroup = "AD"
"#
        )
        .unwrap();

        let config = try_load(&dir.path().join("krbmgr")).unwrap();
        assert_eq!(config.allow_networks.len(), 1);
        assert_eq!(config.ticket.check_interval, Duration::from_secs(60));
        assert_eq!(config.ticket.renewal_period, 3);
        assert_eq!(config.ticket.klist_timeout, Duration::from_secs(10));
        assert!(config.activedirectory.enable);
        assert_eq!(config.activedirectory.bindname, "svc");
        assert_eq!(config.activedirectory.bindpw.as_ref().unwrap().expose_secret(), "s3cret");
        assert_eq!(config.activedirectory.workgroup, "AD");
    }

    #[test]
    fn zero_durations_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("krbmgr.toml");

        std::fs::write(&path, "[keytab]\nreconcile_interval = 0\n").unwrap();
        let err = try_load(&dir.path().join("krbmgr")).err().unwrap();
        assert!(err.to_string().contains("keytab.reconcile_interval"));

        std::fs::write(&path, "[ticket]\ncheck_interval = 0\n").unwrap();
        let err = try_load(&dir.path().join("krbmgr")).err().unwrap();
        assert!(err.to_string().contains("ticket.check_interval"));

        std::fs::write(&path, "[ticket]\ncheck_interval = 1\n").unwrap();
        assert_eq!(try_load(&dir.path().join("krbmgr")).unwrap().ticket.check_interval, Duration::from_secs(1));
    }
}
