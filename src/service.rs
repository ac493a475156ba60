/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Kerberos ticket lifecycle service.

use crate::conf::Config;
use crate::ds::{self, DirectoryServices, DsCredConfig, DsSnapshot};
use crate::krb::{
    self, CredCache, Credentials, KdcOverride, KinitOptions, KlistOptions, MACHINE_ACCOUNT_KEYTAB, TicketCacheSnapshot,
    ValidationErrors, genconf, keytab, kinit, klist,
};
use crate::renewal::{self, Action, Supervisor};
use crate::secrets::Secrets;
use crate::store::{KerberosRealm, KerberosSettings, KeytabRecord, RealmParams, Store};
use crate::trace::*;

use snafu::prelude::*;
use std::{sync::Arc, time::Duration};
use tokio::{fs, sync::Mutex, time};
use tokio_util::sync::CancellationToken;

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct Kerberos {
    pub(crate) config: Arc<Config>,
    pub(crate) store: Store,
    pub(crate) dirsvc: Box<dyn DirectoryServices>,
    pub(crate) secrets: Box<dyn Secrets>,
    renewal: Supervisor,
    lifecycle: Mutex<()>,
    generation: Mutex<()>,
}

impl Kerberos {
    pub fn new(
        config: Arc<Config>,
        store: Store,
        dirsvc: Box<dyn DirectoryServices>,
        secrets: Box<dyn Secrets>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            dirsvc,
            secrets,
            renewal: Supervisor::default(),
            lifecycle: Mutex::new(()),
            generation: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn system_klist(&self) -> KlistOptions {
        KlistOptions {
            ccache: CredCache::System,
            timeout: self.config.ticket.klist_timeout,
        }
    }

    async fn default_realm(&self, snapshot: &DsSnapshot) -> Option<String> {
        if snapshot.activedirectory.enable && !snapshot.activedirectory.domainname.is_empty() {
            Some(snapshot.activedirectory.domainname.to_uppercase())
        } else if snapshot.ldap.enable {
            self.store.realm(snapshot.ldap.kerberos_realm?).await.map(|r| r.realm)
        } else {
            None
        }
    }

    /// Regenerates `krb5.conf` and the system keytab.
    pub async fn regenerate(&self) -> Result<(), krb::Error> {
        self.regenerate_with(None).await
    }

    async fn regenerate_with(&self, kdc_override: Option<&KdcOverride>) -> Result<(), krb::Error> {
        let _generation = self.generation.lock().await;
        let snapshot = self.dirsvc.snapshot();
        let realm = self.default_realm(&snapshot).await;

        genconf::generate(&self.config, &self.store, realm.as_deref(), kdc_override).await
    }

    pub async fn klist(&self, opts: KlistOptions) -> Result<TicketCacheSnapshot, krb::Error> {
        klist::list(&self.config.tools.klist, opts.ccache, &self.config.paths.run_dir, opts.timeout).await
    }

    /// Whether the system cache holds a valid ticket-granting ticket.
    pub async fn status(&self) -> bool {
        klist::has_valid_ticket(
            &self.config.tools.klist,
            CredCache::System,
            &self.config.paths.run_dir,
            self.config.ticket.status_timeout,
        )
        .await
    }

    pub async fn check_ticket(&self) -> Result<(), krb::Error> {
        ensure!(self.status().await, krb::TicketRequired);
        Ok(())
    }

    pub async fn kdestroy(&self, ccache: CredCache) -> Result<(), krb::Error> {
        kinit::destroy(&self.config, ccache).await
    }

    pub async fn get_cred(&self, conf: &DsCredConfig) -> Result<Credentials, krb::Error> {
        let realms = self.store.realms().await;
        ds::get_cred(conf, |id| realms.into_iter().find(|r| r.id == id).map(|r| r.realm))
    }

    pub async fn do_kinit(&self, creds: &Credentials, opts: &KinitOptions) -> Result<(), krb::Error> {
        kinit::check_ccache(creds, opts.ccache)?;

        if let Some(KdcOverride { domain, kdc }) = &opts.kdc_override {
            match (domain, kdc) {
                (None, Some(_)) => {
                    let mut errors = ValidationErrors::default();
                    errors.add("kdc_override.domain", "Domain missing from KDC override");
                    return krb::Validation { errors }.fail();
                }
                (Some(domain), kdc) => {
                    genconf::write_stub(&self.config, &domain.to_uppercase(), kdc.as_deref()).await?;
                }
                (None, None) => (),
            }
        }

        match creds {
            Credentials::Keytab { principal } => {
                let choices = keytab::principal_choices(&self.config).await;
                if !choices.contains(principal) {
                    tracing::debug!(
                        %principal,
                        available = choices.join(","),
                        "principal not available in system keytab, regenerating kerberos configuration"
                    );
                    self.regenerate_with(opts.kdc_override.as_ref()).await?;
                }
                kinit::with_keytab(&self.config, principal, opts).await
            }
            Credentials::Password { username, password } => {
                kinit::with_password(&self.config, username, password, opts).await
            }
        }
    }

    /// Acquires a ticket for the enabled directory service into the system cache.
    async fn acquire(&self, kdc_override: Option<KdcOverride>) -> Result<(), krb::Error> {
        let conf = self.dirsvc.snapshot().enabled().context(krb::NotConfigured)?;
        let creds = self.get_cred(&conf).await?;
        let opts = KinitOptions {
            ccache: CredCache::System,
            renewal_period: self.config.ticket.renewal_period,
            lifetime: self.config.ticket.lifetime,
            kdc_override,
        };

        tracing::info!(principal = creds.principal(), ds = ?conf.ds_type(), "acquiring kerberos ticket");
        self.do_kinit(&creds, &opts).await
    }

    async fn reacquire(&self, kdc_override: Option<KdcOverride>, timeout: Duration) -> Result<(), krb::Error> {
        self.regenerate_with(kdc_override.as_ref()).await?;
        match time::timeout(timeout, self.acquire(kdc_override)).await {
            Ok(res) => res,
            Err(_) => krb::AcquireTimeout { timeout }.fail(),
        }
    }

    /// Acquires a ticket and makes sure the renewal task is running.
    pub async fn start(
        self: &Arc<Self>,
        kdc_override: Option<KdcOverride>,
        timeout: Option<Duration>,
    ) -> Result<TicketCacheSnapshot, krb::Error> {
        let _lifecycle = self.lifecycle.lock().await;
        let timeout = timeout.unwrap_or(self.config.ticket.start_timeout);

        self.reacquire(kdc_override, timeout).await?;

        let krb = Arc::clone(self);
        self.renewal.ensure_running(move |token| krb.watch(token)).await;

        self.klist(self.system_klist()).await
    }

    /// Stops the renewal task and destroys the system cache.
    pub async fn stop(&self) -> Result<(), krb::Error> {
        let _lifecycle = self.lifecycle.lock().await;
        self.renewal.stop().await;

        let path = CredCache::System.path(&self.config.paths.run_dir);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(path = %path.display(), "no system credential cache to destroy");
            return Ok(());
        }
        kinit::destroy(&self.config, CredCache::System).await
    }

    /// Evaluates the system ticket once, renewing or re-acquiring it when needed.
    pub async fn renew(self: &Arc<Self>) -> Result<TicketCacheSnapshot, krb::Error> {
        if !self.status().await {
            tracing::warn!("kerberos ticket is unavailable, performing kinit");
            return self.start(None, None).await;
        }

        let snapshot = self.klist(self.system_klist()).await?;
        match renewal::evaluate(snapshot.tgt(), now(), self.config.ticket.check_interval) {
            Action::Wait => Ok(snapshot),
            Action::Reacquire(reason) => {
                tracing::info!(%reason, "performing kinit");
                self.start(None, None).await
            }
            Action::Renew => {
                kinit::renew(&self.config).await?;
                tracing::debug!("successfully renewed kerberos ticket");
                self.klist(self.system_klist()).await
            }
        }
    }

    /// Id of the running renewal task.
    pub async fn renewal_task(&self) -> Option<u64> {
        self.renewal.current().await
    }

    async fn step(&self, action: Action) -> Result<(), krb::Error> {
        match action {
            Action::Wait => Ok(()),
            Action::Renew => {
                kinit::renew(&self.config).await?;
                tracing::debug!("successfully renewed kerberos ticket");
                Ok(())
            }
            Action::Reacquire(reason) => {
                tracing::info!(%reason, "re-acquiring kerberos ticket");
                self.reacquire(None, self.config.ticket.start_timeout).await
            }
        }
    }

    async fn watch(self: Arc<Self>, token: CancellationToken) {
        let interval = self.config.ticket.check_interval;
        let mut settling = false;

        loop {
            let snapshot = tokio::select! {
                _ = token.cancelled() => break,
                res = self.klist(self.system_klist()) => res,
            };
            let snapshot = snapshot
                .inspect_err(|err| tracing::debug!(error = err.chain(), "could not inspect system credential cache"))
                .ok();
            let tgt = snapshot.as_ref().and_then(TicketCacheSnapshot::tgt);
            let now = now();

            let action = renewal::evaluate(tgt, now, interval);
            let delay = match action {
                Action::Wait => Some(interval),
                _ if settling => Some(renewal::settle_delay(tgt, now, interval)),
                _ => None,
            };
            if let Some(delay) = delay {
                tracing::debug!(
                    expires = tgt.map(|t| t.expires).display(),
                    delay = %delay.secs(),
                    "waiting to renew kerberos ticket"
                );
                settling = false;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = time::sleep(delay) => continue,
                }
            }

            let res = tokio::select! {
                _ = token.cancelled() => break,
                res = self.step(action) => res,
            };
            if let Err(err) = res {
                tracing::error!(error = err.chain(), "kerberos ticket renewal failed, renewal task exiting");
                return;
            }
            settling = true;
        }
        tracing::debug!("kerberos ticket renewal task cancelled");
    }

    pub async fn realms(&self) -> Vec<KerberosRealm> {
        self.store.realms().await
    }

    fn check_realm(params: &RealmParams, field: &str) -> Result<(), krb::Error> {
        let mut errors = ValidationErrors::default();
        if params.realm.trim().is_empty() {
            errors.add(format!("{field}.realm"), "Parameter is required.");
        }
        errors.check()
    }

    pub async fn create_realm(&self, params: RealmParams) -> Result<KerberosRealm, krb::Error> {
        Self::check_realm(&params, "kerberos_realm_create")?;
        let realm = self.store.create_realm(params).await?;

        tracing::info!(realm = %realm.realm, id = realm.id, "created kerberos realm");
        self.regenerate().await?;
        Ok(realm)
    }

    pub async fn update_realm(&self, id: u32, params: RealmParams) -> Result<KerberosRealm, krb::Error> {
        Self::check_realm(&params, "kerberos_realm_update")?;
        let realm = self.store.update_realm(id, params).await?;

        tracing::info!(realm = %realm.realm, id, "updated kerberos realm");
        self.regenerate().await?;
        Ok(realm)
    }

    pub async fn delete_realm(&self, id: u32) -> Result<(), krb::Error> {
        self.store.delete_realm(id).await?;

        tracing::info!(id, "deleted kerberos realm");
        self.regenerate().await
    }

    pub async fn keytabs(&self) -> Vec<KeytabRecord> {
        self.store.keytabs().await
    }

    pub async fn create_keytab(&self, name: String, file: String) -> Result<KeytabRecord, krb::Error> {
        let mut errors = ValidationErrors::default();
        if name.trim().is_empty() {
            errors.add("kerberos_keytab_create.name", "Parameter is required.");
        }
        errors.extend(keytab::validate_blob(&self.config, "kerberos_keytab_create.file", &file).await?);
        errors.check()?;

        let record = self.store.create_keytab(name, file).await?;
        tracing::info!(keytab = %record.name, id = record.id, "created kerberos keytab");
        self.regenerate().await?;
        Ok(record)
    }

    pub async fn update_keytab(
        &self,
        id: u32,
        name: Option<String>,
        file: Option<String>,
    ) -> Result<KeytabRecord, krb::Error> {
        let mut errors = ValidationErrors::default();
        if name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            errors.add("kerberos_keytab_update.name", "Parameter is required.");
        }
        if let Some(file) = &file {
            errors.extend(keytab::validate_blob(&self.config, "kerberos_keytab_update.file", file).await?);
        }
        errors.check()?;

        let record = self.store.update_keytab(id, name, file).await?;
        tracing::info!(keytab = %record.name, id, "updated kerberos keytab");
        self.regenerate().await?;
        Ok(record)
    }

    /// Deletes a keytab record and restarts the ticket lifecycle without it.
    pub async fn delete_keytab(self: &Arc<Self>, id: u32) -> Result<(), krb::Error> {
        let record = self.store.keytab(id).await.context(krb::NotFound {
            what: format!("Kerberos keytab {id}"),
        })?;
        ensure!(
            record.name != MACHINE_ACCOUNT_KEYTAB || !self.dirsvc.snapshot().ad_enabled(),
            krb::Conflict {
                reason: "Deletion of kerberos keytab for AD machine account is not permitted while AD is enabled"
            }
        );

        self.store.delete_keytab(id).await?;
        tracing::info!(keytab = %record.name, id, "deleted kerberos keytab");
        self.regenerate().await?;

        self.stop().await?;
        if let Err(err) = self.start(None, None).await {
            tracing::warn!(error = err.chain(), "could not restart kerberos ticket lifecycle after keytab deletion");
        }
        Ok(())
    }

    /// Entries of the system keytab, empty if there is none.
    pub async fn system_keytab_list(&self) -> Result<Vec<keytab::KeytabEntry>, krb::Error> {
        let path = &self.config.paths.system_keytab;
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        keytab::list(&self.config, path).await
    }

    pub async fn principal_choices(&self) -> Vec<String> {
        keytab::principal_choices(&self.config).await
    }

    pub async fn settings(&self) -> KerberosSettings {
        genconf::settings(&self.config, &self.store).await
    }

    pub async fn update_settings(
        &self,
        appdefaults_aux: Option<String>,
        libdefaults_aux: Option<String>,
    ) -> Result<KerberosSettings, krb::Error> {
        let mut settings = self.settings().await;
        if let Some(aux) = appdefaults_aux {
            settings.appdefaults_aux = aux;
        }
        if let Some(aux) = libdefaults_aux {
            settings.libdefaults_aux = aux;
        }

        let mut errors = genconf::validate_appdefaults(&self.config, &settings.appdefaults_aux);
        errors.extend(genconf::validate_libdefaults(&self.config, &settings.libdefaults_aux));
        errors.check()?;

        self.store.set_settings(settings.clone()).await?;
        self.regenerate().await?;
        Ok(settings)
    }
}
