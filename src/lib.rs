/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

mod auth;
pub mod conf;
pub mod ds;
mod exec;
pub mod krb;
pub mod reconcile;
pub mod renewal;
pub mod secrets;
pub mod service;
pub mod store;
mod trace;

pub use crate::service::Kerberos;

use crate::ds::{ConfDirectory, DsCredConfig};
use crate::krb::{
    CredCache, Credentials, KdcOverride, KinitOptions, KlistOptions, TicketCacheSnapshot, ValidationErrors,
    keytab::KeytabEntry,
};
use crate::reconcile::Reconciler;
use crate::secrets::TdbSecrets;
use crate::store::{KerberosRealm, KerberosSettings, KeytabRecord, RealmParams, Store};
use crate::trace::*;

use futures::prelude::*;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::{
    ffi::CStr,
    io,
    net::IpAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use stubborn_io::{ReconnectOptions, StubbornTcpStream};
use syslog_tracing::Syslog;
use tarpc::{
    client::RpcError,
    context::{self, Context},
    serde_transport::{Transport, tcp},
    server::{BaseChannel, Channel},
    tokio_serde::formats::Bincode,
};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const KRBMGR_PORT: u16 = 57812;
const KRBMGR_SYSLOG_IDENT: &CStr = c"krbmgr";
const KRBMGR_RPC_DEADLINE: Duration = Duration::from_secs(300);

pub const KRBMGR_ENV_HOST: &str = "KRBMGR_HOST";
pub const KRBMGR_ENV_SYSLOG: &str = "KRBMGR_SYSLOG";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("RPC transport error"), context(false))]
    RpcTransport { source: io::Error },
    #[snafu(display("RPC request error"), context(false))]
    RpcRequest { source: RpcError },
    #[snafu(display("Kerberos manager error"), context(false))]
    KrbMgrServer { source: KrbMgrError },
    #[snafu(display("Kerberos error"), context(false))]
    Kerberos { source: krb::Error },
    #[snafu(display("State store error"), context(false))]
    Store { source: store::Error },
    #[snafu(display("Syslog initialization error"))]
    SyslogInit,
}

/// Errors reported to RPC clients.
#[derive(Debug, Snafu, Serialize, Deserialize)]
pub enum KrbMgrError {
    #[snafu(display("Validation failed: {errors}"))]
    Validation { errors: ValidationErrors },
    #[snafu(display("{message}"))]
    ToolTimeout { message: String },
    #[snafu(display("{message}"))]
    ToolFailure { message: String },
    #[snafu(display("{reason}"))]
    Conflict { reason: String },
    #[snafu(display("{message}"))]
    Parse { message: String },
    #[snafu(display("{what} not found"))]
    NotFound { what: String },
    #[snafu(display("{reason}"))]
    NotConfigured { reason: String },
    #[snafu(display("Unauthorized request"))]
    Unauthorized,
    #[snafu(display("Internal error, see server logs"))]
    Internal,
}

impl From<&krb::Error> for KrbMgrError {
    fn from(err: &krb::Error) -> Self {
        use exec::Error as Exec;
        use krb::Error as Krb;

        match err {
            Krb::Validation { errors } => Self::Validation { errors: errors.clone() },
            Krb::Conflict { reason } => Self::Conflict { reason: reason.clone() },
            Krb::Parse { .. } => Self::Parse { message: err.to_string() },
            Krb::Tool {
                source: Exec::Timeout { .. },
            }
            | Krb::Secrets {
                source: secrets::Error::Lookup {
                    source: Exec::Timeout { .. },
                },
            }
            | Krb::AcquireTimeout { .. } => Self::ToolTimeout { message: err.chain() },
            Krb::Tool { .. } | Krb::KeytabKinit { .. } | Krb::PasswordKinit { .. } => {
                Self::ToolFailure { message: err.chain() }
            }
            Krb::TicketRequired | Krb::NotConfigured => Self::NotConfigured {
                reason: err.to_string(),
            },
            Krb::NotFound { what }
            | Krb::Store {
                source: store::Error::Missing { what },
            } => Self::NotFound { what: what.clone() },
            Krb::Store {
                source: store::Error::Exists { .. },
            } => Self::Conflict {
                reason: err.chain(),
            },
            Krb::FileIO { .. } | Krb::Chown { .. } | Krb::Store { .. } | Krb::Secrets { .. } => Self::Internal,
        }
    }
}

/// Logs a failed request and converts its error for the client.
fn report(what: &'static str) -> impl FnOnce(krb::Error) -> KrbMgrError {
    move |err| {
        tracing::error!(error = err.chain(), "{what}");
        KrbMgrError::from(&err)
    }
}

#[tarpc::service]
pub trait KrbMgr {
    async fn start(kdc_override: Option<KdcOverride>, timeout: Option<u64>) -> Result<TicketCacheSnapshot, KrbMgrError>;
    async fn stop() -> Result<(), KrbMgrError>;
    async fn status() -> Result<bool, KrbMgrError>;
    async fn renew() -> Result<TicketCacheSnapshot, KrbMgrError>;
    async fn klist(opts: KlistOptions) -> Result<TicketCacheSnapshot, KrbMgrError>;
    async fn kdestroy(ccache: CredCache) -> Result<(), KrbMgrError>;
    async fn do_kinit(creds: Credentials, opts: KinitOptions) -> Result<(), KrbMgrError>;
    async fn get_cred(conf: DsCredConfig) -> Result<Credentials, KrbMgrError>;
    async fn check_ticket() -> Result<(), KrbMgrError>;
    async fn realms() -> Result<Vec<KerberosRealm>, KrbMgrError>;
    async fn create_realm(params: RealmParams) -> Result<KerberosRealm, KrbMgrError>;
    async fn update_realm(id: u32, params: RealmParams) -> Result<KerberosRealm, KrbMgrError>;
    async fn delete_realm(id: u32) -> Result<(), KrbMgrError>;
    async fn keytabs() -> Result<Vec<KeytabRecord>, KrbMgrError>;
    async fn create_keytab(name: String, file: String) -> Result<KeytabRecord, KrbMgrError>;
    async fn update_keytab(id: u32, name: Option<String>, file: Option<String>) -> Result<KeytabRecord, KrbMgrError>;
    async fn delete_keytab(id: u32) -> Result<(), KrbMgrError>;
    async fn system_keytab_list() -> Result<Vec<KeytabEntry>, KrbMgrError>;
    async fn principal_choices() -> Result<Vec<String>, KrbMgrError>;
    async fn settings() -> Result<KerberosSettings, KrbMgrError>;
    async fn update_settings(
        appdefaults_aux: Option<String>,
        libdefaults_aux: Option<String>,
    ) -> Result<KerberosSettings, KrbMgrError>;
}

#[derive(Clone)]
struct KrbMgrServer {
    peer: IpAddr,
    krb: Arc<Kerberos>,
}

pub struct Server<S: Future> {
    rpc: S,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

pub struct Client {
    rpc: KrbMgrClient,
}

impl KrbMgrServer {
    fn authorize(&self) -> Result<(), KrbMgrError> {
        if auth::authorize(&self.krb.config().allow_networks, &self.peer) {
            Ok(())
        } else {
            Err(KrbMgrError::Unauthorized)
        }
    }
}

impl KrbMgr for KrbMgrServer {
    async fn start(
        self,
        _: Context,
        kdc_override: Option<KdcOverride>,
        timeout: Option<u64>,
    ) -> Result<TicketCacheSnapshot, KrbMgrError> {
        self.authorize()?;
        tracing::info!(timeout, kdc_override = ?kdc_override, "start request");

        self.krb
            .start(kdc_override, timeout.map(Duration::from_secs))
            .await
            .map_err(report("could not start kerberos ticket lifecycle"))
    }

    async fn stop(self, _: Context) -> Result<(), KrbMgrError> {
        self.authorize()?;
        tracing::info!("stop request");

        self.krb
            .stop()
            .await
            .map_err(report("could not stop kerberos ticket lifecycle"))
    }

    async fn status(self, _: Context) -> Result<bool, KrbMgrError> {
        self.authorize()?;
        tracing::debug!("status request");

        Ok(self.krb.status().await)
    }

    async fn renew(self, _: Context) -> Result<TicketCacheSnapshot, KrbMgrError> {
        self.authorize()?;
        tracing::info!("renew request");

        self.krb.renew().await.map_err(report("could not renew kerberos ticket"))
    }

    async fn klist(self, _: Context, opts: KlistOptions) -> Result<TicketCacheSnapshot, KrbMgrError> {
        self.authorize()?;
        tracing::debug!(ccache = %opts.ccache, "klist request");

        self.krb.klist(opts).await.map_err(report("could not list kerberos tickets"))
    }

    async fn kdestroy(self, _: Context, ccache: CredCache) -> Result<(), KrbMgrError> {
        self.authorize()?;
        tracing::info!(%ccache, "kdestroy request");

        self.krb
            .kdestroy(ccache)
            .await
            .map_err(report("could not destroy credential cache"))
    }

    async fn do_kinit(self, _: Context, creds: Credentials, opts: KinitOptions) -> Result<(), KrbMgrError> {
        self.authorize()?;
        tracing::info!(principal = creds.principal(), ccache = %opts.ccache, "kinit request");

        self.krb
            .do_kinit(&creds, &opts)
            .await
            .map_err(report("could not acquire kerberos ticket"))
    }

    async fn get_cred(self, _: Context, conf: DsCredConfig) -> Result<Credentials, KrbMgrError> {
        self.authorize()?;
        tracing::info!(ds = ?conf.ds_type(), "credentials request");

        self.krb
            .get_cred(&conf)
            .await
            .map_err(report("could not resolve kerberos credentials"))
    }

    async fn check_ticket(self, _: Context) -> Result<(), KrbMgrError> {
        self.authorize()?;
        self.krb.check_ticket().await.map_err(|err| KrbMgrError::from(&err))
    }

    async fn realms(self, _: Context) -> Result<Vec<KerberosRealm>, KrbMgrError> {
        self.authorize()?;
        Ok(self.krb.realms().await)
    }

    async fn create_realm(self, _: Context, params: RealmParams) -> Result<KerberosRealm, KrbMgrError> {
        self.authorize()?;
        tracing::info!(realm = %params.realm, "create realm request");

        self.krb
            .create_realm(params)
            .await
            .map_err(report("could not create kerberos realm"))
    }

    async fn update_realm(self, _: Context, id: u32, params: RealmParams) -> Result<KerberosRealm, KrbMgrError> {
        self.authorize()?;
        tracing::info!(id, realm = %params.realm, "update realm request");

        self.krb
            .update_realm(id, params)
            .await
            .map_err(report("could not update kerberos realm"))
    }

    async fn delete_realm(self, _: Context, id: u32) -> Result<(), KrbMgrError> {
        self.authorize()?;
        tracing::info!(id, "delete realm request");

        self.krb
            .delete_realm(id)
            .await
            .map_err(report("could not delete kerberos realm"))
    }

    async fn keytabs(self, _: Context) -> Result<Vec<KeytabRecord>, KrbMgrError> {
        self.authorize()?;
        Ok(self.krb.keytabs().await)
    }

    async fn create_keytab(self, _: Context, name: String, file: String) -> Result<KeytabRecord, KrbMgrError> {
        self.authorize()?;
        tracing::info!(keytab = %name, "create keytab request");

        self.krb
            .create_keytab(name, file)
            .await
            .map_err(report("could not create kerberos keytab"))
    }

    async fn update_keytab(
        self,
        _: Context,
        id: u32,
        name: Option<String>,
        file: Option<String>,
    ) -> Result<KeytabRecord, KrbMgrError> {
        self.authorize()?;
        tracing::info!(id, "update keytab request");

        self.krb
            .update_keytab(id, name, file)
            .await
            .map_err(report("could not update kerberos keytab"))
    }

    async fn delete_keytab(self, _: Context, id: u32) -> Result<(), KrbMgrError> {
        self.authorize()?;
        tracing::info!(id, "delete keytab request");

        self.krb
            .delete_keytab(id)
            .await
            .map_err(report("could not delete kerberos keytab"))
    }

    async fn system_keytab_list(self, _: Context) -> Result<Vec<KeytabEntry>, KrbMgrError> {
        self.authorize()?;
        self.krb
            .system_keytab_list()
            .await
            .map_err(report("could not list system keytab"))
    }

    async fn principal_choices(self, _: Context) -> Result<Vec<String>, KrbMgrError> {
        self.authorize()?;
        Ok(self.krb.principal_choices().await)
    }

    async fn settings(self, _: Context) -> Result<KerberosSettings, KrbMgrError> {
        self.authorize()?;
        Ok(self.krb.settings().await)
    }

    async fn update_settings(
        self,
        _: Context,
        appdefaults_aux: Option<String>,
        libdefaults_aux: Option<String>,
    ) -> Result<KerberosSettings, KrbMgrError> {
        self.authorize()?;
        tracing::info!("update settings request");

        self.krb
            .update_settings(appdefaults_aux, libdefaults_aux)
            .await
            .map_err(report("could not update kerberos settings"))
    }
}

pub async fn new_server(addrs: Option<String>, max_conn: usize, config_path: PathBuf) -> Result<Server<impl Future>, Error> {
    let config = Arc::new(conf::load(&config_path));
    let store = Store::open(&config.paths.state).await?;
    let secrets = TdbSecrets {
        tdbdump: config.tools.tdbdump.clone(),
        tdb: config.paths.secrets_tdb.clone(),
        timeout: config.keytab.list_timeout,
    };
    let krb = Kerberos::new(
        config.clone(),
        store,
        Box::new(ConfDirectory::new(config_path)),
        Box::new(secrets),
    );

    let addrs = addrs.unwrap_or_else(|| format!("127.0.0.1:{KRBMGR_PORT}"));
    tracing::info!(%addrs, "starting krbmgr server");
    let transport = tcp::listen(addrs, Bincode::default).await?;

    let tasks = TaskTracker::new();
    let shutdown = CancellationToken::new();
    tasks.spawn(Reconciler::new(krb.clone()).run(shutdown.child_token()));

    if krb.dirsvc.snapshot().enabled().is_some() {
        let krb = krb.clone();
        tasks.spawn(async move {
            if let Err(err) = krb.start(None, None).await {
                tracing::warn!(error = err.chain(), "could not start kerberos ticket lifecycle");
            }
        });
    }

    let rt = tasks.clone();
    let rpc = transport
        .filter_map(|t| async {
            t.map_or_else(
                |err| {
                    tracing::error!(error = err.chain(), "could not accept connection");
                    None
                },
                Some,
            )
        })
        .map(BaseChannel::with_defaults)
        .map(move |c| {
            let rt = rt.clone();
            let krb = krb.clone();

            async move {
                let peer = match c.transport().peer_addr() {
                    Ok(addr) => addr.ip(),
                    Err(err) => {
                        tracing::error!(error = err.chain(), "could not retrieve peer address");
                        return;
                    }
                };
                let span = tracing::info_span!("krbmgr_service", %peer);
                let srv = KrbMgrServer { peer, krb };

                let stream = c.execute(srv.serve());
                tokio::pin!(stream);
                while let Some(req) = stream.next().await {
                    rt.spawn(req.instrument(span.clone()));
                }
            }
        })
        .buffer_unordered(max_conn)
        .collect::<()>();

    Ok(Server { rpc, tasks, shutdown })
}

pub async fn new_client(addrs: Option<String>) -> Result<Client, Error> {
    let retries = ReconnectOptions::new()
        .with_exit_if_first_connect_fails(false)
        .with_retries_generator(|| vec![Duration::from_secs(1), Duration::from_secs(5), Duration::from_secs(10)]);

    let addrs = addrs
        .or_else(|| std::env::var(KRBMGR_ENV_HOST).ok())
        .unwrap_or_else(|| format!("127.0.0.1:{KRBMGR_PORT}"));

    tracing::info!(%addrs, "connecting to krbmgr server");
    let stream = StubbornTcpStream::connect_with_options(addrs, retries).await?;
    let transport = Transport::from((stream, Bincode::default()));
    let rpc = KrbMgrClient::new(Default::default(), transport).spawn();

    Ok(Client { rpc })
}

impl<S: Future> Server<S> {
    pub async fn run(self) {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Err(err) => {
                tracing::error!(error = err.chain(), "could not setup SIGINT handler");
                return;
            }
            Ok(sig) => sig,
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Err(err) => {
                tracing::error!(error = err.chain(), "could not setup SIGTERM handler");
                return;
            }
            Ok(sig) => sig,
        };

        tokio::select! {
            _ = self.rpc => (),
            _ = sigint.recv() => (),
            _ = sigterm.recv() => (),
        };
        tracing::info!("shutting down krbmgr server");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Context with a deadline long enough for ticket acquisition and keytab operations.
fn rpc_context() -> Context {
    let mut ctx = context::current();
    ctx.deadline = Instant::now() + KRBMGR_RPC_DEADLINE;
    ctx
}

impl Client {
    #[tracing::instrument(skip_all)]
    pub async fn start(&self, kdc_override: Option<KdcOverride>, timeout: Option<u64>) -> Result<TicketCacheSnapshot, Error> {
        tracing::info!("starting kerberos ticket lifecycle");
        Ok(self.rpc.start(rpc_context(), kdc_override, timeout).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn stop(&self) -> Result<(), Error> {
        tracing::info!("stopping kerberos ticket lifecycle");
        Ok(self.rpc.stop(rpc_context()).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn status(&self) -> Result<bool, Error> {
        Ok(self.rpc.status(rpc_context()).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn renew(&self) -> Result<TicketCacheSnapshot, Error> {
        tracing::info!("renewing kerberos ticket");
        Ok(self.rpc.renew(rpc_context()).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn klist(&self, opts: KlistOptions) -> Result<TicketCacheSnapshot, Error> {
        Ok(self.rpc.klist(rpc_context(), opts).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn kdestroy(&self, ccache: CredCache) -> Result<(), Error> {
        tracing::info!(%ccache, "destroying credential cache");
        Ok(self.rpc.kdestroy(rpc_context(), ccache).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn kinit(&self, creds: Credentials, opts: KinitOptions) -> Result<(), Error> {
        tracing::info!(principal = creds.principal(), "acquiring kerberos ticket");
        Ok(self.rpc.do_kinit(rpc_context(), creds, opts).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn get_cred(&self, conf: DsCredConfig) -> Result<Credentials, Error> {
        Ok(self.rpc.get_cred(rpc_context(), conf).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn check_ticket(&self) -> Result<(), Error> {
        Ok(self.rpc.check_ticket(rpc_context()).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn realms(&self) -> Result<Vec<KerberosRealm>, Error> {
        Ok(self.rpc.realms(rpc_context()).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn create_realm(&self, params: RealmParams) -> Result<KerberosRealm, Error> {
        Ok(self.rpc.create_realm(rpc_context(), params).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn update_realm(&self, id: u32, params: RealmParams) -> Result<KerberosRealm, Error> {
        Ok(self.rpc.update_realm(rpc_context(), id, params).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn delete_realm(&self, id: u32) -> Result<(), Error> {
        Ok(self.rpc.delete_realm(rpc_context(), id).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn keytabs(&self) -> Result<Vec<KeytabRecord>, Error> {
        Ok(self.rpc.keytabs(rpc_context()).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn create_keytab(&self, name: String, file: String) -> Result<KeytabRecord, Error> {
        Ok(self.rpc.create_keytab(rpc_context(), name, file).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn update_keytab(&self, id: u32, name: Option<String>, file: Option<String>) -> Result<KeytabRecord, Error> {
        Ok(self.rpc.update_keytab(rpc_context(), id, name, file).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn delete_keytab(&self, id: u32) -> Result<(), Error> {
        Ok(self.rpc.delete_keytab(rpc_context(), id).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn system_keytab_list(&self) -> Result<Vec<KeytabEntry>, Error> {
        Ok(self.rpc.system_keytab_list(rpc_context()).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn principal_choices(&self) -> Result<Vec<String>, Error> {
        Ok(self.rpc.principal_choices(rpc_context()).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn settings(&self) -> Result<KerberosSettings, Error> {
        Ok(self.rpc.settings(rpc_context()).await??)
    }

    #[tracing::instrument(skip_all)]
    pub async fn update_settings(
        &self,
        appdefaults_aux: Option<String>,
        libdefaults_aux: Option<String>,
    ) -> Result<KerberosSettings, Error> {
        Ok(self.rpc.update_settings(rpc_context(), appdefaults_aux, libdefaults_aux).await??)
    }
}

pub fn setup_logging() -> Result<(), Error> {
    let layer = if std::env::var(KRBMGR_ENV_SYSLOG).is_ok() {
        fmt::layer()
            .without_time()
            .with_level(false)
            .compact()
            .with_writer(
                Syslog::new(KRBMGR_SYSLOG_IDENT, Default::default(), Default::default()).ok_or(Error::SyslogInit)?,
            )
            .boxed()
    } else if std::env::var("RUST_LOG_STYLE").is_ok_and(|v| v == "systemd") {
        fmt::layer().without_time().compact().boxed()
    } else {
        fmt::layer().with_writer(io::stderr).boxed()
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(layer)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_cross_the_rpc_boundary() {
        let timeout = krb::Error::Tool {
            source: exec::Error::Timeout {
                tool: "klist".into(),
                timeout: Duration::from_secs(1),
            },
        };
        assert!(matches!(KrbMgrError::from(&timeout), KrbMgrError::ToolTimeout { .. }));

        let failure = krb::Error::PasswordKinit {
            stderr: "Password incorrect".into(),
        };
        match KrbMgrError::from(&failure) {
            KrbMgrError::ToolFailure { message } => assert!(message.contains("Password incorrect")),
            err => panic!("unexpected error {err:?}"),
        }

        let missing = krb::Error::Store {
            source: store::Error::Missing {
                what: "Kerberos realm 4".into(),
            },
        };
        assert!(matches!(KrbMgrError::from(&missing), KrbMgrError::NotFound { what } if what == "Kerberos realm 4"));

        let duplicate = krb::Error::Store {
            source: store::Error::Exists {
                what: "Kerberos realm `EXAMPLE.COM`".into(),
            },
        };
        assert!(matches!(KrbMgrError::from(&duplicate), KrbMgrError::Conflict { .. }));
        assert!(matches!(
            KrbMgrError::from(&krb::Error::TicketRequired),
            KrbMgrError::NotConfigured { .. }
        ));
    }
}
