/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use super::{Chown, Conflict, CredCache, Credentials, Error, KeytabKinit, KinitOptions, Password, PasswordKinit};
use crate::conf::Config;
use crate::exec::{self, Tool};

use nix::unistd::{self, Uid};
use snafu::prelude::*;
use std::ffi::OsString;

/// Rejects cache and credential combinations that must never reach `kinit`.
pub fn check_ccache(creds: &Credentials, ccache: CredCache) -> Result<(), Error> {
    match (ccache, creds) {
        (CredCache::User(_), Credentials::Keytab { .. }) => Conflict {
            reason: "User-specific ccache not permitted with keytab-based kinit",
        }
        .fail(),
        (CredCache::User(0), _) => Conflict {
            reason: "User-specific ccache not permitted for uid 0",
        }
        .fail(),
        _ => Ok(()),
    }
}

fn base_args(config: &Config, opts: &KinitOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-V".into(),
        "-r".into(),
        format!("{}d", opts.renewal_period).into(),
        "-c".into(),
        opts.ccache.path(&config.paths.run_dir).into(),
    ];
    if opts.lifetime != 0 {
        args.extend(["-l".into(), format!("{}m", opts.lifetime).into()]);
    }
    args
}

pub async fn with_keytab(config: &Config, principal: &str, opts: &KinitOptions) -> Result<(), Error> {
    check_ccache(
        &Credentials::Keytab {
            principal: principal.to_owned(),
        },
        opts.ccache,
    )?;

    tracing::debug!(%principal, ccache = %opts.ccache, "acquiring kerberos ticket with keytab");
    let res = Tool::new(&config.tools.kinit)
        .args(base_args(config, opts))
        .args(["-k", "-t"])
        .arg(&config.paths.system_keytab)
        .arg(principal)
        .run(config.ticket.kinit_timeout)
        .await;

    match res {
        Ok(_) => Ok(()),
        Err(exec::Error::Failure { stderr, .. }) => KeytabKinit { principal, stderr }.fail(),
        Err(err) => Err(err.into()),
    }
}

pub async fn with_password(
    config: &Config,
    username: &str,
    password: &Password,
    opts: &KinitOptions,
) -> Result<(), Error> {
    let creds = Credentials::Password {
        username: username.to_owned(),
        password: password.clone(),
    };
    check_ccache(&creds, opts.ccache)?;

    tracing::debug!(principal = %username, ccache = %opts.ccache, "acquiring kerberos ticket with password");
    let res = Tool::new(&config.tools.kinit)
        .args(base_args(config, opts))
        .arg(username)
        .input(password.expose().as_bytes())
        .run(config.ticket.kinit_timeout)
        .await;

    match res {
        Ok(_) => (),
        Err(exec::Error::Failure { stderr, .. }) => {
            return PasswordKinit {
                stderr: redact(&stderr, password),
            }
            .fail();
        }
        Err(err) => return Err(err.into()),
    }

    if let CredCache::User(uid) = opts.ccache {
        let path = opts.ccache.path(&config.paths.run_dir);
        unistd::chown(&path, Some(Uid::from_raw(uid)), None).context(Chown { path })?;
    }
    Ok(())
}

fn redact(text: &str, password: &Password) -> String {
    match password.expose() {
        "" => text.to_owned(),
        secret => text.replace(secret, "********"),
    }
}

/// Renews the ticket-granting ticket held in the system cache.
pub async fn renew(config: &Config) -> Result<(), Error> {
    tracing::debug!("renewing kerberos ticket");
    Tool::new(&config.tools.kinit)
        .arg("-R")
        .arg("-c")
        .arg(CredCache::System.path(&config.paths.run_dir))
        .run(config.ticket.renew_timeout)
        .await?;
    Ok(())
}

pub async fn destroy(config: &Config, ccache: CredCache) -> Result<(), Error> {
    tracing::debug!(%ccache, "destroying kerberos credential cache");
    Tool::new(&config.tools.kdestroy)
        .arg("-c")
        .arg(ccache.path(&config.paths.run_dir))
        .run(config.ticket.klist_timeout)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password_creds() -> Credentials {
        Credentials::Password {
            username: "admin@EXAMPLE.COM".into(),
            password: String::from("pw").into(),
        }
    }

    #[test]
    fn user_cache_conflicts() {
        let keytab = Credentials::Keytab {
            principal: "host/nas@EXAMPLE.COM".into(),
        };

        assert!(matches!(check_ccache(&keytab, CredCache::User(1000)), Err(Error::Conflict { .. })));
        assert!(matches!(check_ccache(&password_creds(), CredCache::User(0)), Err(Error::Conflict { .. })));
        assert!(check_ccache(&password_creds(), CredCache::User(1000)).is_ok());
        assert!(check_ccache(&keytab, CredCache::System).is_ok());
        assert!(check_ccache(&password_creds(), CredCache::Temporary).is_ok());
    }

    #[test]
    fn kinit_arguments() {
        let config = Config::default();
        let mut opts = KinitOptions::default();

        let args = base_args(&config, &opts);
        assert_eq!(args, ["-V", "-r", "7d", "-c", "/var/run/middleware/krb5cc_0"]);

        opts.lifetime = 90;
        opts.renewal_period = 1;
        opts.ccache = CredCache::User(1000);
        let args = base_args(&config, &opts);
        assert_eq!(args, ["-V", "-r", "1d", "-c", "/var/run/middleware/krb5cc_1000", "-l", "90m"]);
    }

    #[test]
    fn stderr_is_redacted() {
        let pw: Password = String::from("hunter2").into();
        assert_eq!(redact("bad password hunter2", &pw), "bad password ********");
        assert_eq!(redact("Password incorrect", &String::new().into()), "Password incorrect");
    }

    #[tokio::test]
    async fn uid_zero_is_rejected_before_spawning() {
        let mut config = Config::default();
        config.tools.kinit = "/nonexistent/kinit".into();
        let opts = KinitOptions {
            ccache: CredCache::User(0),
            ..Default::default()
        };

        let err = with_password(&config, "admin@EXAMPLE.COM", &String::from("pw").into(), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn keytab_kinit_reads_configured_keytab() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("kinit.log");
        let kinit = dir.path().join("kinit");
        std::fs::write(&kinit, format!("#!/bin/sh\necho \"$*\" > {}\n", log.display())).unwrap();
        std::fs::set_permissions(&kinit, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = Config::default();
        config.tools.kinit = kinit;
        config.paths.run_dir = dir.path().into();
        config.paths.system_keytab = dir.path().join("alt.keytab");

        with_keytab(&config, "NAS01$@AD.EXAMPLE.COM", &KinitOptions::default())
            .await
            .unwrap();
        let args = std::fs::read_to_string(&log).unwrap();
        assert!(args.trim_end().ends_with(&format!("-k -t {} NAS01$@AD.EXAMPLE.COM", config.paths.system_keytab.display())));
    }
}
