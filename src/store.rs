/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Persisted Kerberos realms, keytab records and secrets bookkeeping.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{fs, sync::Mutex};

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to read state file `{}`", path.display()))]
    Read { path: PathBuf, source: io::Error },
    #[snafu(display("Failed to write state file `{}`", path.display()))]
    Write { path: PathBuf, source: io::Error },
    #[snafu(display("Failed to decode state file `{}`", path.display()))]
    Decode { path: PathBuf, source: serde_json::Error },
    #[snafu(display("Failed to encode state"))]
    Encode { source: serde_json::Error },
    #[snafu(display("{what} already exists"))]
    Exists { what: String },
    #[snafu(display("{what} not found"))]
    Missing { what: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KerberosRealm {
    pub id: u32,
    pub realm: String,
    /// Empty lists defer to DNS SRV discovery.
    pub kdc: Vec<String>,
    pub admin_server: Vec<String>,
    pub kpasswd_server: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmParams {
    pub realm: String,
    pub kdc: Vec<String>,
    pub admin_server: Vec<String>,
    pub kpasswd_server: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeytabRecord {
    pub id: u32,
    pub name: String,
    /// Base64 encoded keytab.
    pub file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KerberosSettings {
    pub appdefaults_aux: String,
    pub libdefaults_aux: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsBackup {
    /// Base64 encoded secrets database.
    pub tdb: String,
    pub last_password_change: Option<u32>,
    pub taken: i64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct State {
    next_id: u32,
    realms: Vec<KerberosRealm>,
    keytabs: Vec<KeytabRecord>,
    settings: Option<KerberosSettings>,
    last_password_change: Option<u32>,
    secrets_backup: Option<SecretsBackup>,
}

impl State {
    fn allocate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn realm_conflict(&self, name: &str, except: Option<u32>) -> bool {
        self.realms
            .iter()
            .any(|r| Some(r.id) != except && r.realm.eq_ignore_ascii_case(name))
    }

    fn keytab_conflict(&self, name: &str, except: Option<u32>) -> bool {
        self.keytabs.iter().any(|k| Some(k.id) != except && k.name == name)
    }
}

/// JSON backed store, every mutation is written through atomically.
pub struct Store {
    path: PathBuf,
    state: Mutex<State>,
}

impl Store {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let state = match fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data).context(Decode { path: &path })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => State::default(),
            Err(err) => return Err(err).context(Read { path: &path }),
        };

        tracing::debug!(path = %path.display(), "opened state store");
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn commit(&self, state: &State) -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(state).context(Encode)?;
        let tmp = self.path.with_extension("tmp");

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await.context(Write { path: dir })?;
        }
        fs::write(&tmp, data).await.context(Write { path: &tmp })?;
        fs::rename(&tmp, &self.path).await.context(Write { path: &self.path })
    }

    pub async fn realms(&self) -> Vec<KerberosRealm> {
        self.state.lock().await.realms.clone()
    }

    pub async fn realm(&self, id: u32) -> Option<KerberosRealm> {
        self.state.lock().await.realms.iter().find(|r| r.id == id).cloned()
    }

    /// Applies `change` to a copy of the state, which replaces it once written.
    async fn update<T>(&self, change: impl FnOnce(&mut State) -> Result<T, Error>) -> Result<T, Error> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();

        let res = change(&mut next)?;
        self.commit(&next).await?;
        *state = next;
        Ok(res)
    }

    pub async fn create_realm(&self, params: RealmParams) -> Result<KerberosRealm, Error> {
        self.update(|state| {
            ensure!(
                !state.realm_conflict(&params.realm, None),
                Exists {
                    what: format!("Kerberos realm `{}`", params.realm)
                }
            );

            let realm = KerberosRealm {
                id: state.allocate_id(),
                realm: params.realm,
                kdc: params.kdc,
                admin_server: params.admin_server,
                kpasswd_server: params.kpasswd_server,
            };
            state.realms.push(realm.clone());
            Ok(realm)
        })
        .await
    }

    pub async fn update_realm(&self, id: u32, params: RealmParams) -> Result<KerberosRealm, Error> {
        self.update(|state| {
            ensure!(
                !state.realm_conflict(&params.realm, Some(id)),
                Exists {
                    what: format!("Kerberos realm `{}`", params.realm)
                }
            );
            let realm = state.realms.iter_mut().find(|r| r.id == id).context(Missing {
                what: format!("Kerberos realm {id}"),
            })?;

            *realm = KerberosRealm {
                id,
                realm: params.realm,
                kdc: params.kdc,
                admin_server: params.admin_server,
                kpasswd_server: params.kpasswd_server,
            };
            Ok(realm.clone())
        })
        .await
    }

    pub async fn delete_realm(&self, id: u32) -> Result<(), Error> {
        self.update(|state| {
            let idx = state.realms.iter().position(|r| r.id == id).context(Missing {
                what: format!("Kerberos realm {id}"),
            })?;
            state.realms.remove(idx);
            Ok(())
        })
        .await
    }

    pub async fn keytabs(&self) -> Vec<KeytabRecord> {
        self.state.lock().await.keytabs.clone()
    }

    pub async fn keytab(&self, id: u32) -> Option<KeytabRecord> {
        self.state.lock().await.keytabs.iter().find(|k| k.id == id).cloned()
    }

    pub async fn create_keytab(&self, name: String, file: String) -> Result<KeytabRecord, Error> {
        self.update(|state| {
            ensure!(
                !state.keytab_conflict(&name, None),
                Exists {
                    what: format!("Kerberos keytab `{name}`")
                }
            );

            let keytab = KeytabRecord {
                id: state.allocate_id(),
                name,
                file,
            };
            state.keytabs.push(keytab.clone());
            Ok(keytab)
        })
        .await
    }

    pub async fn update_keytab(&self, id: u32, name: Option<String>, file: Option<String>) -> Result<KeytabRecord, Error> {
        self.update(|state| {
            if let Some(name) = &name {
                ensure!(
                    !state.keytab_conflict(name, Some(id)),
                    Exists {
                        what: format!("Kerberos keytab `{name}`")
                    }
                );
            }
            let keytab = state.keytabs.iter_mut().find(|k| k.id == id).context(Missing {
                what: format!("Kerberos keytab {id}"),
            })?;

            if let Some(name) = name {
                keytab.name = name;
            }
            if let Some(file) = file {
                keytab.file = file;
            }
            Ok(keytab.clone())
        })
        .await
    }

    pub async fn delete_keytab(&self, id: u32) -> Result<KeytabRecord, Error> {
        self.update(|state| {
            let idx = state.keytabs.iter().position(|k| k.id == id).context(Missing {
                what: format!("Kerberos keytab {id}"),
            })?;
            Ok(state.keytabs.remove(idx))
        })
        .await
    }

    /// Replaces the contents of the keytab record `name`, creating it if needed.
    pub async fn upsert_keytab(&self, name: &str, file: String) -> Result<KeytabRecord, Error> {
        self.update(|state| {
            if let Some(keytab) = state.keytabs.iter_mut().find(|k| k.name == name) {
                keytab.file = file;
                return Ok(keytab.clone());
            }
            let keytab = KeytabRecord {
                id: state.allocate_id(),
                name: name.to_owned(),
                file,
            };
            state.keytabs.push(keytab.clone());
            Ok(keytab)
        })
        .await
    }

    pub async fn settings(&self) -> Option<KerberosSettings> {
        self.state.lock().await.settings.clone()
    }

    pub async fn set_settings(&self, settings: KerberosSettings) -> Result<(), Error> {
        self.update(|state| {
            state.settings = Some(settings);
            Ok(())
        })
        .await
    }

    pub async fn last_password_change(&self) -> Option<u32> {
        self.state.lock().await.last_password_change
    }

    /// Records a secrets backup along with the password change it reflects.
    pub async fn store_secrets_backup(&self, backup: SecretsBackup) -> Result<(), Error> {
        self.update(|state| {
            state.last_password_change = backup.last_password_change;
            state.secrets_backup = Some(backup);
            Ok(())
        })
        .await
    }

    pub async fn secrets_backup(&self) -> Option<SecretsBackup> {
        self.state.lock().await.secrets_backup.clone()
    }
}
