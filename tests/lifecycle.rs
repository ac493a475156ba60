/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use chrono::{Local, TimeDelta};
use futures::future::BoxFuture;
use krbmgr::conf::{self, Config};
use krbmgr::ds::{DirectoryServices, DsSnapshot};
use krbmgr::krb::{self, CredCache, Credentials, KdcOverride, KinitOptions, KlistOptions};
use krbmgr::reconcile::{Outcome, Reconciler};
use krbmgr::secrets::{self, Secrets};
use krbmgr::store::{RealmParams, Store};
use krbmgr::{Kerberos, KrbMgrError};
use nix::{errno::Errno, sys::signal, unistd::Pid};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tempfile::TempDir;

const PRINCIPAL: &str = "admin@AD.EXAMPLE.COM";

struct StaticDirectory(DsSnapshot);

impl DirectoryServices for StaticDirectory {
    fn snapshot(&self) -> DsSnapshot {
        self.0.clone()
    }
}

/// Password change timestamp recorded for the `AD` workgroup.
struct FixedSecrets(Option<u32>);

impl Secrets for FixedSecrets {
    fn last_password_change<'a>(&'a self, workgroup: &'a str) -> BoxFuture<'a, Result<Option<u32>, secrets::Error>> {
        Box::pin(async move { Ok(self.0.filter(|_| workgroup == "AD")) })
    }

    fn dump(&self) -> BoxFuture<'_, Result<Vec<u8>, secrets::Error>> {
        Box::pin(async { Ok(b"secrets".to_vec()) })
    }
}

fn active_directory() -> DsSnapshot {
    DsSnapshot {
        ready: true,
        activedirectory: conf::ActiveDirectory {
            enable: true,
            domainname: "ad.example.com".into(),
            bindname: "admin".into(),
            bindpw: Some("secret".into()),
            netbiosname: "NAS01".into(),
            workgroup: "AD".into(),
            kerberos_principal: String::new(),
        },
        ldap: Default::default(),
    }
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// `klist` listing of a ticket issued and expiring at the given offsets from now.
fn klist_output(run_dir: &Path, issued: i64, expires: i64) -> String {
    let at = |secs| (Local::now() + TimeDelta::seconds(secs)).format("%m/%d/%y %H:%M:%S");
    format!(
        "Ticket cache: FILE:{}/krb5cc_0\n\
         Default principal: {PRINCIPAL}\n\
         \n\
         Valid starting       Expires              Service principal\n\
         {}  {}  krbtgt/AD.EXAMPLE.COM@AD.EXAMPLE.COM\n\
         \trenew until {}, Flags: FRIA\n",
        run_dir.display(),
        at(issued),
        at(expires),
        at(7 * 86400),
    )
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("run")).unwrap();
        fs::write(root.join("klist.out"), klist_output(&root.join("run"), -60, 10 * 3600)).unwrap();

        let d = root.display();
        script(
            root,
            "kinit",
            &format!(
                "echo \"$*\" >> {d}/kinit.log\ncat > /dev/null\n\
                 while [ $# -gt 0 ]; do\n  [ \"$1\" = -c ] && touch \"$2\"\n  shift\ndone\nexit 0"
            ),
        );
        script(
            root,
            "klist",
            &format!(
                "case \"$1\" in\n\
                 -s) test -f \"$2\"; exit ;;\n\
                 -tek) printf 'Keytab name: FILE:%s\\nKVNO Timestamp         Principal\\n---- ----------------- ----\\n' \"$2\"; exit 0 ;;\n\
                 esac\n\
                 test -f \"$2\" || {{ echo \"klist: No credentials cache found (filename: $2)\" >&2; exit 1; }}\n\
                 cat {d}/klist.out"
            ),
        );
        script(
            root,
            "kdestroy",
            &format!(
                "echo \"$*\" >> {d}/kdestroy.log\n\
                 while [ $# -gt 0 ]; do\n  [ \"$1\" = -c ] && rm -f \"$2\"\n  shift\ndone\nexit 0"
            ),
        );
        script(
            root,
            "ktutil",
            "src=\nwhile read -r cmd arg; do\n  case \"$cmd\" in\n    rkt) src=\"$arg\" ;;\n    wkt) cp \"$src\" \"$arg\" ;;\n  esac\ndone",
        );
        Self { dir }
    }

    /// Replaces the fake `kinit` with one running `on_renew` for `kinit -R`.
    fn kinit_renewing(&self, name: &str, on_renew: &str) -> PathBuf {
        let d = self.dir.path().display();
        script(
            self.dir.path(),
            name,
            &format!(
                "echo \"$*\" >> {d}/kinit.log\n\
                 if [ \"$1\" = -R ]; then\n  {on_renew}\nfi\n\
                 cat > /dev/null\n\
                 while [ $# -gt 0 ]; do\n  [ \"$1\" = -c ] && touch \"$2\"\n  shift\ndone\nexit 0"
            ),
        )
    }

    fn set_ticket(&self, issued: i64, expires: i64) {
        fs::write(self.path("klist.out"), klist_output(&self.path("run"), issued, expires)).unwrap();
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn config(&self) -> Config {
        let mut config = Config::default();
        config.paths.run_dir = self.path("run");
        config.paths.krb5_conf = self.path("krb5.conf");
        config.paths.system_keytab = self.path("krb5.keytab");
        config.paths.samba_keytab = self.path("samba.keytab");
        config.paths.test_keytab = self.path("test.keytab");
        config.paths.state = self.path("state.json");
        config.tools.kinit = self.path("kinit");
        config.tools.klist = self.path("klist");
        config.tools.kdestroy = self.path("kdestroy");
        config.tools.ktutil = self.path("ktutil");
        config
    }

    async fn service(&self, config: Config, snapshot: DsSnapshot, secrets: FixedSecrets) -> Arc<Kerberos> {
        let store = Store::open(&config.paths.state).await.unwrap();
        Kerberos::new(Arc::new(config), store, Box::new(StaticDirectory(snapshot)), Box::new(secrets))
    }

    fn log(&self, name: &str) -> Vec<String> {
        fs::read_to_string(self.path(name))
            .map(|log| log.lines().map(str::to_owned).collect())
            .unwrap_or_default()
    }
}

async fn eventually(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn task_exits(krb: &Kerberos) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while krb.renewal_task().await.is_some() {
        assert!(Instant::now() < deadline, "timed out waiting for the renewal task to exit");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn renewals(fixture: &Fixture) -> usize {
    fixture.log("kinit.log").iter().filter(|line| line.starts_with("-R ")).count()
}

fn password_kinits(fixture: &Fixture) -> usize {
    fixture.log("kinit.log").iter().filter(|line| line.ends_with(PRINCIPAL)).count()
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let fixture = Fixture::new();
    let krb = fixture
        .service(fixture.config(), active_directory(), FixedSecrets(None))
        .await;

    let snapshot = krb.start(None, None).await.unwrap();
    assert_eq!(snapshot.default_principal, PRINCIPAL);
    assert!(snapshot.tgt().is_some());
    let first = krb.renewal_task().await.unwrap();

    krb.start(None, None).await.unwrap();
    assert_eq!(krb.renewal_task().await, Some(first));
    assert!(krb.status().await);
    krb.check_ticket().await.unwrap();

    let kinits = fixture.log("kinit.log");
    assert_eq!(kinits.len(), 2);
    assert!(kinits.iter().all(|line| line.ends_with(PRINCIPAL)));
    let krb5_conf = fs::read_to_string(fixture.path("krb5.conf")).unwrap();
    assert!(krb5_conf.contains("AD.EXAMPLE.COM"));

    krb.stop().await.unwrap();
    assert_eq!(krb.renewal_task().await, None);
    assert!(!krb.status().await);
    krb.stop().await.unwrap();
    assert_eq!(fixture.log("kdestroy.log").len(), 1);

    let err = krb.check_ticket().await.unwrap_err();
    assert!(matches!(KrbMgrError::from(&err), KrbMgrError::NotConfigured { .. }));
}

#[tokio::test]
async fn start_requires_a_directory_service() {
    let fixture = Fixture::new();
    let snapshot = DsSnapshot {
        ready: true,
        ..Default::default()
    };
    let krb = fixture.service(fixture.config(), snapshot, FixedSecrets(None)).await;

    let err = krb.start(None, None).await.unwrap_err();
    assert!(matches!(err, krb::Error::NotConfigured));
    assert_eq!(krb.renewal_task().await, None);
    assert!(fixture.log("kinit.log").is_empty());
}

#[tokio::test]
async fn root_user_cache_is_refused_before_kinit() {
    let fixture = Fixture::new();
    let krb = fixture
        .service(fixture.config(), active_directory(), FixedSecrets(None))
        .await;

    let creds = Credentials::Password {
        username: PRINCIPAL.into(),
        password: String::from("secret").into(),
    };
    let opts = KinitOptions {
        ccache: CredCache::User(0),
        ..Default::default()
    };
    let err = krb.do_kinit(&creds, &opts).await.unwrap_err();
    assert!(matches!(KrbMgrError::from(&err), KrbMgrError::Conflict { .. }));
    assert!(!fixture.path("kinit.log").exists());
}

#[tokio::test]
async fn kdc_override_requires_a_domain() {
    let fixture = Fixture::new();
    let krb = fixture
        .service(fixture.config(), active_directory(), FixedSecrets(None))
        .await;

    let creds = Credentials::Password {
        username: PRINCIPAL.into(),
        password: String::from("secret").into(),
    };
    let mut opts = KinitOptions {
        kdc_override: Some(KdcOverride {
            domain: None,
            kdc: Some("dc01.ad.example.com".into()),
        }),
        ..Default::default()
    };
    match krb.do_kinit(&creds, &opts).await.unwrap_err() {
        krb::Error::Validation { errors } => {
            assert_eq!(errors.fields().collect::<Vec<_>>(), ["kdc_override.domain"]);
        }
        err => panic!("unexpected error {err:?}"),
    }

    opts.kdc_override = Some(KdcOverride {
        domain: Some("ad.example.com".into()),
        kdc: Some("dc01.ad.example.com".into()),
    });
    krb.do_kinit(&creds, &opts).await.unwrap();
    let stub = fs::read_to_string(fixture.path("krb5.conf")).unwrap();
    assert!(stub.contains("AD.EXAMPLE.COM"));
    assert!(stub.contains("dc01.ad.example.com"));
}

#[tokio::test]
async fn hanging_klist_is_killed_on_timeout() {
    let fixture = Fixture::new();
    let pidfile = fixture.path("klist.pid");
    let mut config = fixture.config();
    config.tools.klist = script(
        fixture.dir.path(),
        "klist-hang",
        &format!("echo $$ > {}\nexec sleep 30", pidfile.display()),
    );
    let krb = fixture.service(config, active_directory(), FixedSecrets(None)).await;

    let started = Instant::now();
    let err = krb
        .klist(KlistOptions {
            ccache: CredCache::System,
            timeout: Duration::from_secs(1),
        })
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(KrbMgrError::from(&err), KrbMgrError::ToolTimeout { .. }));

    let pid: i32 = fs::read_to_string(&pidfile).unwrap().trim().parse().unwrap();
    assert_eq!(signal::kill(Pid::from_raw(pid), None), Err(Errno::ESRCH));
}

#[tokio::test]
async fn realm_names_are_unique() {
    let fixture = Fixture::new();
    let krb = fixture
        .service(fixture.config(), active_directory(), FixedSecrets(None))
        .await;

    let realm = krb
        .create_realm(RealmParams {
            realm: "LAB.EXAMPLE.COM".into(),
            kdc: vec!["kdc.lab.example.com".into()],
            ..Default::default()
        })
        .await
        .unwrap();
    let krb5_conf = fs::read_to_string(fixture.path("krb5.conf")).unwrap();
    assert!(krb5_conf.contains("kdc.lab.example.com"));

    let err = krb
        .create_realm(RealmParams {
            realm: "lab.example.com".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(KrbMgrError::from(&err), KrbMgrError::Conflict { .. }));

    let err = krb
        .create_realm(RealmParams {
            realm: " ".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, krb::Error::Validation { .. }));

    krb.delete_realm(realm.id).await.unwrap();
    assert!(krb.realms().await.is_empty());
    let err = krb.delete_realm(realm.id).await.unwrap_err();
    assert!(matches!(KrbMgrError::from(&err), KrbMgrError::NotFound { .. }));
}

#[tokio::test]
async fn reconciler_tracks_password_changes() {
    let fixture = Fixture::new();

    let mut disabled = active_directory();
    disabled.activedirectory.enable = false;
    let krb = fixture.service(fixture.config(), disabled, FixedSecrets(Some(1_700_000_000))).await;
    assert_eq!(Reconciler::new(krb).check().await.unwrap(), Outcome::Skipped);

    let krb = fixture
        .service(fixture.config(), active_directory(), FixedSecrets(None))
        .await;
    let mut reconciler = Reconciler::new(krb);
    assert_eq!(reconciler.check().await.unwrap(), Outcome::Skipped);

    fs::write(fixture.path("krb5.keytab"), b"keytab").unwrap();
    assert_eq!(reconciler.check().await.unwrap(), Outcome::PasswordUnchanged);

    let krb = fixture
        .service(fixture.config(), active_directory(), FixedSecrets(Some(1_700_000_000)))
        .await;
    let mut reconciler = Reconciler::new(Arc::clone(&krb));
    assert_eq!(reconciler.check().await.unwrap(), Outcome::Updated);
    assert_eq!(reconciler.check().await.unwrap(), Outcome::KeytabUnchanged);

    let keytabs = krb.keytabs().await;
    assert_eq!(keytabs.len(), 1);
    assert_eq!(keytabs[0].name, krb::MACHINE_ACCOUNT_KEYTAB);
    assert_eq!(keytabs[0].file, "a2V5dGFi");
    assert_eq!(fs::read(fixture.path("samba.keytab")).unwrap(), b"keytab");
}

#[tokio::test]
async fn unnamed_machine_account_is_not_reconciled() {
    let fixture = Fixture::new();
    fs::write(fixture.path("krb5.keytab"), b"keytab").unwrap();

    let mut unnamed = active_directory();
    unnamed.activedirectory.netbiosname = String::new();
    let krb = fixture.service(fixture.config(), unnamed, FixedSecrets(Some(1_700_000_000))).await;
    assert_eq!(Reconciler::new(Arc::clone(&krb)).check().await.unwrap(), Outcome::Skipped);
    assert!(krb.keytabs().await.is_empty());

    let mut no_workgroup = active_directory();
    no_workgroup.activedirectory.workgroup = String::new();
    let krb = fixture
        .service(fixture.config(), no_workgroup, FixedSecrets(Some(1_700_000_000)))
        .await;
    assert_eq!(Reconciler::new(Arc::clone(&krb)).check().await.unwrap(), Outcome::Skipped);
    assert!(krb.keytabs().await.is_empty());

    assert!(!fixture.path("samba.keytab").exists());
    assert_eq!(fs::read(fixture.path("krb5.keytab")).unwrap(), b"keytab");
}

#[tokio::test]
async fn start_pins_overridden_kdc() {
    let fixture = Fixture::new();
    let krb = fixture
        .service(fixture.config(), active_directory(), FixedSecrets(None))
        .await;

    let kdc_override = KdcOverride {
        domain: Some("ad.example.com".into()),
        kdc: Some("dc09.ad.example.com".into()),
    };
    krb.start(Some(kdc_override), None).await.unwrap();

    let krb5_conf = fs::read_to_string(fixture.path("krb5.conf")).unwrap();
    assert!(krb5_conf.contains("dns_lookup_kdc = false"));
    assert!(krb5_conf.contains("dc09.ad.example.com"));
    krb.stop().await.unwrap();

    krb.regenerate().await.unwrap();
    let krb5_conf = fs::read_to_string(fixture.path("krb5.conf")).unwrap();
    assert!(krb5_conf.contains("dns_lookup_kdc = true"));
    assert!(!krb5_conf.contains("dc09.ad.example.com"));
}

#[tokio::test]
async fn ticket_inside_check_interval_is_renewed() {
    let fixture = Fixture::new();
    fixture.set_ticket(-60, 600);
    let mut config = fixture.config();
    config.tools.kinit = fixture.kinit_renewing("kinit-renew", ":");
    let krb = fixture.service(config, active_directory(), FixedSecrets(None)).await;

    krb.start(None, None).await.unwrap();
    let task = krb.renewal_task().await.unwrap();
    eventually("kinit -R", || renewals(&fixture) > 0).await;

    assert_eq!(krb.renewal_task().await, Some(task));
    assert_eq!(password_kinits(&fixture), 1);
    krb.stop().await.unwrap();
}

#[tokio::test]
async fn failed_renewal_ends_the_task() {
    let fixture = Fixture::new();
    fixture.set_ticket(-60, 600);
    let mut config = fixture.config();
    config.tools.kinit = fixture.kinit_renewing("kinit-renew-fails", "echo 'kinit: Ticket expired while renewing credentials' >&2; exit 1");
    let krb = fixture.service(config, active_directory(), FixedSecrets(None)).await;

    krb.start(None, None).await.unwrap();
    task_exits(&krb).await;
    assert_eq!(renewals(&fixture), 1);
    assert_eq!(password_kinits(&fixture), 1);
    assert!(krb.status().await);
    krb.stop().await.unwrap();
}

#[tokio::test]
async fn expired_ticket_is_reacquired() {
    let fixture = Fixture::new();
    fixture.set_ticket(-120, -60);
    let krb = fixture
        .service(fixture.config(), active_directory(), FixedSecrets(None))
        .await;

    krb.start(None, None).await.unwrap();
    let task = krb.renewal_task().await.unwrap();
    eventually("a second kinit", || password_kinits(&fixture) >= 2).await;

    assert_eq!(renewals(&fixture), 0);
    assert_eq!(krb.renewal_task().await, Some(task));
    krb.stop().await.unwrap();
}

#[tokio::test]
async fn stop_kills_renewal_in_flight() {
    let fixture = Fixture::new();
    fixture.set_ticket(-60, 600);
    let pidfile = fixture.path("renew.pid");
    let mut config = fixture.config();
    config.tools.kinit = fixture.kinit_renewing("kinit-renew-hangs", &format!("echo $$ > {}; exec sleep 30", pidfile.display()));
    let krb = fixture.service(config, active_directory(), FixedSecrets(None)).await;

    krb.start(None, None).await.unwrap();
    eventually("kinit -R to start", || {
        fs::read_to_string(&pidfile).is_ok_and(|pid| pid.ends_with('\n'))
    })
    .await;
    let pid: i32 = fs::read_to_string(&pidfile).unwrap().trim().parse().unwrap();

    let started = Instant::now();
    krb.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(krb.renewal_task().await, None);

    // Killed but possibly not yet reaped.
    eventually("kinit -R to be killed", || {
        signal::kill(Pid::from_raw(pid), None) == Err(Errno::ESRCH)
            || fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| stat.contains(") Z "))
    })
    .await;
}
