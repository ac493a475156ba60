/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Periodic synchronization of the stored machine account keytab with the
//! system keytab maintained by the directory service.

use crate::krb::{self, FileIO, MACHINE_ACCOUNT_KEYTAB, keytab};
use crate::service::{Kerberos, now};
use crate::store::SecretsBackup;
use crate::trace::*;

use snafu::prelude::*;
use std::{sync::Arc, time::SystemTime};
use tokio::{fs, time};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Host not ready, Active Directory disabled or unnamed, or no system keytab.
    Skipped,
    KeytabUnchanged,
    PasswordUnchanged,
    Updated,
}

pub struct Reconciler {
    krb: Arc<Kerberos>,
    mtime: Option<SystemTime>,
}

impl Reconciler {
    pub fn new(krb: Arc<Kerberos>) -> Self {
        Self { krb, mtime: None }
    }

    /// Stores the machine account entries of the system keytab as the machine account record.
    async fn store_samba_keytab(&self, netbios: &str) -> Result<(), krb::Error> {
        let contents = keytab::extract_machine_account(&self.krb.config, netbios).await?;
        let record = self
            .krb
            .store
            .upsert_keytab(MACHINE_ACCOUNT_KEYTAB, keytab::encode(&contents))
            .await?;

        tracing::debug!(id = record.id, keytab = %record.name, "updated stored machine account keytab");
        Ok(())
    }

    /// Runs one reconciliation pass.
    pub async fn check(&mut self) -> Result<Outcome, krb::Error> {
        let snapshot = self.krb.dirsvc.snapshot();
        let system = &self.krb.config.paths.system_keytab;

        if !snapshot.ready || !snapshot.ad_enabled() {
            return Ok(Outcome::Skipped);
        }
        let mtime = match fs::metadata(system).await {
            Ok(meta) => meta.modified().context(FileIO { path: system })?,
            Err(_) => return Ok(Outcome::Skipped),
        };
        if self.mtime == Some(mtime) {
            return Ok(Outcome::KeytabUnchanged);
        }

        let ad = &snapshot.activedirectory;
        if ad.netbiosname.is_empty() || ad.workgroup.is_empty() {
            tracing::warn!(
                netbiosname = %ad.netbiosname,
                workgroup = %ad.workgroup,
                "machine account names are not configured, skipping keytab reconciliation"
            );
            return Ok(Outcome::Skipped);
        }

        let stored = self.krb.store.last_password_change().await;
        let current = self.krb.secrets.last_password_change(&ad.workgroup).await?;
        if stored == current {
            tracing::debug!(timestamp = current.display(), "machine account password unchanged");
            return Ok(Outcome::PasswordUnchanged);
        }

        tracing::info!(
            stored = stored.display(),
            current = current.display(),
            "machine account password has changed, updating stored keytab and secrets"
        );
        let tdb = self.krb.secrets.dump().await?;
        self.krb
            .store
            .store_secrets_backup(SecretsBackup {
                tdb: keytab::encode(&tdb),
                last_password_change: current,
                taken: now(),
            })
            .await?;
        self.store_samba_keytab(&ad.netbiosname).await?;

        // The keytab may have been rewritten while it was being copied.
        self.mtime = Some(fs::metadata(system).await.and_then(|m| m.modified()).unwrap_or(mtime));
        Ok(Outcome::Updated)
    }

    /// Reconciles on every interval until cancelled, failures are logged and retried next cycle.
    pub async fn run(mut self, token: CancellationToken) {
        let mut interval = time::interval(self.krb.config.keytab.reconcile_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => (),
            }
            let res = tokio::select! {
                _ = token.cancelled() => break,
                res = self.check() => res,
            };
            match res {
                Ok(outcome) => tracing::trace!(?outcome, "keytab reconciliation done"),
                Err(err) => tracing::warn!(error = err.chain(), "keytab reconciliation failed"),
            }
        }
        tracing::debug!("keytab reconciler stopped");
    }
}
