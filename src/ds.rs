/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Directory service configuration and Kerberos credential resolution.

use crate::conf;
use crate::krb::{self, Credentials, Password, ValidationErrors};
use crate::trace::*;

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{Mutex, PoisonError},
    time::SystemTime,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DsType {
    ActiveDirectory,
    Ldap,
}

/// Credential related configuration of one directory service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DsCredConfig {
    ActiveDirectory {
        bindname: Option<String>,
        bindpw: Option<Password>,
        domainname: Option<String>,
        kerberos_principal: Option<String>,
    },
    Ldap {
        binddn: Option<String>,
        bindpw: Option<Password>,
        kerberos_realm: Option<u32>,
        kerberos_principal: Option<String>,
    },
}

impl DsCredConfig {
    pub fn ds_type(&self) -> DsType {
        match self {
            Self::ActiveDirectory { .. } => DsType::ActiveDirectory,
            Self::Ldap { .. } => DsType::Ldap,
        }
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn present_password(value: &Option<Password>) -> Option<&Password> {
    value.as_ref().filter(|p| !p.expose().is_empty())
}

/// Value of the first relative distinguished name of `dn`.
fn first_rdn_value(dn: &str) -> Option<&str> {
    let (_, value) = dn.split(',').next()?.split_once('=')?;
    Some(value.trim()).filter(|v| !v.is_empty())
}

/// Resolves the credentials to use for a directory service.
///
/// An explicit Kerberos principal selects keytab authentication, otherwise the
/// bind credentials are turned into a password based principal. `realm_name`
/// maps a Kerberos realm id to its name.
pub fn get_cred(conf: &DsCredConfig, realm_name: impl FnOnce(u32) -> Option<String>) -> Result<Credentials, krb::Error> {
    match conf {
        DsCredConfig::ActiveDirectory {
            kerberos_principal, ..
        }
        | DsCredConfig::Ldap {
            kerberos_principal, ..
        } if present(kerberos_principal).is_some() => Ok(Credentials::Keytab {
            principal: kerberos_principal.clone().unwrap_or_default(),
        }),

        DsCredConfig::ActiveDirectory {
            bindname,
            bindpw,
            domainname,
            ..
        } => match (present(bindname), present_password(bindpw), present(domainname)) {
            (Some(bindname), Some(bindpw), Some(domainname)) => Ok(Credentials::Password {
                username: format!("{bindname}@{}", domainname.to_uppercase()),
                password: bindpw.clone(),
            }),
            (bindname, bindpw, domainname) => required(&[
                ("bindname", bindname.is_some()),
                ("bindpw", bindpw.is_some()),
                ("domainname", domainname.is_some()),
            ]),
        },

        DsCredConfig::Ldap {
            binddn,
            bindpw,
            kerberos_realm,
            ..
        } => match (present(binddn), present_password(bindpw), *kerberos_realm) {
            (Some(binddn), Some(bindpw), Some(realm_id)) => {
                let Some(user) = first_rdn_value(binddn) else {
                    let mut errors = ValidationErrors::default();
                    errors.add("conf.binddn", "Invalid bind DN.");
                    return krb::Validation { errors }.fail();
                };
                let realm = realm_name(realm_id).ok_or_else(|| {
                    krb::NotFound {
                        what: format!("Kerberos realm {realm_id}"),
                    }
                    .build()
                })?;

                Ok(Credentials::Password {
                    username: format!("{user}@{realm}"),
                    password: bindpw.clone(),
                })
            }
            (binddn, bindpw, realm_id) => required(&[
                ("binddn", binddn.is_some()),
                ("bindpw", bindpw.is_some()),
                ("kerberos_realm", realm_id.is_some()),
            ]),
        },
    }
}

/// Validation failure listing every missing parameter.
fn required<T>(fields: &[(&str, bool)]) -> Result<T, krb::Error> {
    let mut errors = ValidationErrors::default();
    for (name, _) in fields.iter().filter(|(_, present)| !present) {
        errors.add(format!("conf.{name}"), "Parameter is required.");
    }
    krb::Validation { errors }.fail()
}

/// Point in time view of the directory services configuration.
#[derive(Clone, Default)]
pub struct DsSnapshot {
    /// Whether the host finished starting up and the configuration could be read.
    pub ready: bool,
    pub activedirectory: conf::ActiveDirectory,
    pub ldap: conf::Ldap,
}

impl DsSnapshot {
    /// Credential configuration of the enabled directory service, Active Directory first.
    pub fn enabled(&self) -> Option<DsCredConfig> {
        let nonempty = |s: &str| Some(s.to_owned()).filter(|s| !s.is_empty());

        if self.activedirectory.enable {
            let ad = &self.activedirectory;
            Some(DsCredConfig::ActiveDirectory {
                bindname: nonempty(&ad.bindname),
                bindpw: ad.bindpw.clone().map(Into::into),
                domainname: nonempty(&ad.domainname),
                kerberos_principal: nonempty(&ad.kerberos_principal),
            })
        } else if self.ldap.enable && self.ldap.kerberos_realm.is_some() {
            let ldap = &self.ldap;
            Some(DsCredConfig::Ldap {
                binddn: nonempty(&ldap.binddn),
                bindpw: ldap.bindpw.clone().map(Into::into),
                kerberos_realm: ldap.kerberos_realm,
                kerberos_principal: nonempty(&ldap.kerberos_principal),
            })
        } else {
            None
        }
    }

    pub fn ad_enabled(&self) -> bool {
        self.activedirectory.enable
    }
}

/// Source of directory services configuration, polled on every use.
pub trait DirectoryServices: Send + Sync {
    fn snapshot(&self) -> DsSnapshot;
}

/// Directory services configuration read from the configuration file.
///
/// The file is parsed again only when its modification time changes.
pub struct ConfDirectory {
    path: PathBuf,
    cache: Mutex<Option<(SystemTime, DsSnapshot)>>,
}

impl ConfDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    fn modified(&self) -> Option<SystemTime> {
        [self.path.clone(), self.path.with_extension("toml")]
            .iter()
            .find_map(|p| fs::metadata(p).and_then(|m| m.modified()).ok())
    }

    fn load(&self) -> DsSnapshot {
        match conf::try_load(&self.path) {
            Ok(config) => DsSnapshot {
                ready: true,
                activedirectory: config.activedirectory,
                ldap: config.ldap,
            },
            Err(err) => {
                tracing::warn!(error = err.chain(), path = %self.path.display(), "could not read directory services configuration");
                DsSnapshot::default()
            }
        }
    }
}

impl DirectoryServices for ConfDirectory {
    fn snapshot(&self) -> DsSnapshot {
        let mtime = self.modified();
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);

        if let (Some(mtime), Some((cached, snapshot))) = (mtime, cache.as_ref()) {
            if *cached == mtime {
                return snapshot.clone();
            }
        }
        let snapshot = self.load();
        *cache = mtime.filter(|_| snapshot.ready).map(|m| (m, snapshot.clone()));
        snapshot
    }
}
