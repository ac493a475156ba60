/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Generation of `krb5.conf` and the system keytab, and validation of the
//! auxiliary parameters appended to them.

use super::{CredCache, Error, FileIO, KdcOverride, ValidationErrors, keytab};
use crate::conf::Config;
use crate::store::{KerberosRealm, KerberosSettings, Store};

use snafu::prelude::*;
use std::{fmt::Write as _, path::Path};
use tokio::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Boolean,
    Time,
    Realm,
    CcType,
    CcName,
    Etypes,
    Keytab,
    Number,
    ProxySpec,
    Address,
    Str,
    Int,
}

const APPDEFAULTS: &[(&str, ParamType)] = &[
    ("forwardable", ParamType::Boolean),
    ("proxiable", ParamType::Boolean),
    ("no-addresses", ParamType::Boolean),
    ("ticket_lifetime", ParamType::Time),
    ("renew_lifetime", ParamType::Time),
    ("encrypt", ParamType::Boolean),
    ("forward", ParamType::Boolean),
];

const LIBDEFAULTS: &[(&str, ParamType)] = &[
    ("default_realm", ParamType::Realm),
    ("allow_weak_crypto", ParamType::Boolean),
    ("clockskew", ParamType::Time),
    ("kdc_timeout", ParamType::Time),
    ("ccache_type", ParamType::CcType),
    ("default_ccache_name", ParamType::CcName),
    ("default_etypes", ParamType::Etypes),
    ("default_as_etypes", ParamType::Etypes),
    ("default_tgs_etypes", ParamType::Etypes),
    ("default_etypes_des", ParamType::Etypes),
    ("default_keytab_name", ParamType::Keytab),
    ("dns_lookup_kdc", ParamType::Boolean),
    ("dns_lookup_realm", ParamType::Boolean),
    ("kdc_timesync", ParamType::Boolean),
    ("max_retries", ParamType::Number),
    ("large_msg_size", ParamType::Number),
    ("ticket_lifetime", ParamType::Time),
    ("renew_lifetime", ParamType::Time),
    ("forwardable", ParamType::Boolean),
    ("proxiable", ParamType::Boolean),
    ("verify_ap_req_nofail", ParamType::Boolean),
    ("warn_pwexpire", ParamType::Time),
    ("http_proxy", ParamType::ProxySpec),
    ("dns_proxy", ParamType::ProxySpec),
    ("extra_addresses", ParamType::Address),
    ("time_format", ParamType::Str),
    ("date_format", ParamType::Str),
    ("log_utc", ParamType::Boolean),
    ("scan_interfaces", ParamType::Boolean),
    ("fcache_version", ParamType::Int),
    ("krb4_get_tickets", ParamType::Boolean),
    ("fcc-mit-ticketflags", ParamType::Boolean),
    ("rdns", ParamType::Boolean),
];

pub const ETYPES: &[&str] = &[
    "des-cbc-crc",
    "des-cbc-md4",
    "des-cbc-md5",
    "des3-cbc-sha1",
    "arcfour-hmac-md5",
    "aes128-cts-hmac-sha1-96",
    "aes256-cts-hmac-sha1-96",
];

const CCTYPES: &[&str] = &["FILE", "MEMORY", "DIR"];

pub fn lookup(table: &[(&'static str, ParamType)], name: &str) -> Option<ParamType> {
    table.iter().find(|(n, _)| *n == name).map(|(_, t)| *t)
}

/// Checks a parameter value, types without a closed value set are accepted as is.
fn check_value(config: &Config, ptype: ParamType, value: &str) -> Result<(), String> {
    match ptype {
        ParamType::Boolean => match value.to_uppercase().as_str() {
            "YES" | "TRUE" | "NO" | "FALSE" => Ok(()),
            _ => Err(format!("[{value}] is not boolean")),
        },
        ParamType::Etypes => value
            .split_whitespace()
            .find(|e| !ETYPES.contains(e))
            .map_or(Ok(()), |e| Err(format!("[{e}] is not a supported encryption type"))),
        ParamType::CcType if !CCTYPES.contains(&value) => Err(format!(
            "[{value}] is an unsupported cctype. Available types are {}. This parameter is case-sensitive",
            CCTYPES.join(", ")
        )),
        ParamType::Keytab => {
            let path = value.strip_prefix("FILE:").unwrap_or(value);
            let paths = [
                &config.paths.system_keytab,
                &config.paths.samba_keytab,
                &config.paths.test_keytab,
            ];
            if paths.iter().any(|p| p.as_path() == Path::new(path)) {
                Ok(())
            } else {
                Err(format!("{value} is an unsupported keytab path"))
            }
        }
        _ => Ok(()),
    }
}

fn validate(
    config: &Config,
    text: &str,
    table: &[(&'static str, ParamType)],
    field: &str,
    section: &str,
    skip_subsections: bool,
) -> ValidationErrors {
    let mut errors = ValidationErrors::default();

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let Some((name, value)) = line.split_once('=').filter(|(_, v)| !v.contains('=')) else {
            if !skip_subsections {
                errors.add(field, format!("{line} is an invalid {section} parameter."));
            }
            continue;
        };
        let (name, value) = (name.trim(), value.trim());
        if skip_subsections && (value.is_empty() || value.starts_with('{')) {
            continue;
        }

        match lookup(table, name) {
            None => errors.add(field, format!("{name} is an invalid {section} parameter.")),
            Some(ptype) => {
                if let Err(reason) = check_value(config, ptype, value) {
                    errors.add(field, format!("{name} has invalid value: {reason}."));
                }
            }
        }
    }
    errors
}

/// Validates auxiliary `[libdefaults]` lines, one `name = value` per line.
pub fn validate_libdefaults(config: &Config, text: &str) -> ValidationErrors {
    validate(config, text, LIBDEFAULTS, "kerberos_libdefaults", "libdefaults", false)
}

/// Validates auxiliary `[appdefaults]` lines, subsections are not checked.
pub fn validate_appdefaults(config: &Config, text: &str) -> ValidationErrors {
    validate(config, text, APPDEFAULTS, "kerberos_appdefaults", "appdefaults", true)
}

fn write_list(out: &mut String, key: &str, values: &[String]) {
    for value in values {
        let _ = writeln!(out, "\t\t{key} = {value}");
    }
}

fn write_aux(out: &mut String, aux: &str) {
    for line in aux.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let _ = writeln!(out, "\t{line}");
    }
}

/// Pins the realm of an override domain to its KDC, adding the realm if it is not stored.
fn pin_kdc(realms: &[KerberosRealm], kdc_override: Option<&KdcOverride>) -> (Vec<KerberosRealm>, bool) {
    let mut realms = realms.to_vec();
    let Some((domain, kdc)) = kdc_override.and_then(|o| Some((o.domain.as_deref()?, o.kdc.as_deref()?))) else {
        return (realms, false);
    };
    let name = domain.to_uppercase();

    match realms.iter_mut().find(|r| r.realm.eq_ignore_ascii_case(&name)) {
        Some(realm) => realm.kdc = vec![kdc.to_owned()],
        None => realms.push(KerberosRealm {
            id: 0,
            realm: name,
            kdc: vec![kdc.to_owned()],
            admin_server: Vec::new(),
            kpasswd_server: Vec::new(),
        }),
    }
    (realms, true)
}

/// Renders `krb5.conf` for the given default realm and stored realms.
///
/// A KDC override with both a domain and a KDC pins that realm to the KDC and
/// disables KDC discovery through DNS.
pub fn render(
    config: &Config,
    default_realm: Option<&str>,
    realms: &[KerberosRealm],
    settings: &KerberosSettings,
    kdc_override: Option<&KdcOverride>,
) -> String {
    let (realms, pinned) = pin_kdc(realms, kdc_override);

    let mut out = String::from("[libdefaults]\n");
    if let Some(realm) = default_realm {
        let _ = writeln!(out, "\tdefault_realm = {realm}");
    }
    out.push_str("\tdns_lookup_realm = false\n");
    let _ = writeln!(out, "\tdns_lookup_kdc = {}", !pinned);
    let _ = writeln!(
        out,
        "\tdefault_ccache_name = FILE:{}",
        CredCache::System.path(&config.paths.run_dir).display()
    );
    out.push_str("\tforwardable = true\n");
    write_aux(&mut out, &settings.libdefaults_aux);

    out.push_str("\n[appdefaults]\n");
    out.push_str("\tpam = {\n\t\tforwardable = true\n\t\tticket_lifetime = 86400\n\t\trenew_lifetime = 86400\n\t}\n");
    write_aux(&mut out, &settings.appdefaults_aux);

    out.push_str("\n[realms]\n");
    for realm in &realms {
        let _ = writeln!(out, "\t{} = {{", realm.realm);
        let _ = writeln!(out, "\t\tdefault_domain = {}", realm.realm.to_lowercase());
        write_list(&mut out, "kdc", &realm.kdc);
        write_list(&mut out, "admin_server", &realm.admin_server);
        write_list(&mut out, "kpasswd_server", &realm.kpasswd_server);
        out.push_str("\t}\n");
    }

    out.push_str("\n[domain_realm]\n");
    for realm in &realms {
        let domain = realm.realm.to_lowercase();
        let _ = writeln!(out, "\t{domain} = {}", realm.realm);
        let _ = writeln!(out, "\t.{domain} = {}", realm.realm);
    }
    out
}

/// Renders the minimal configuration used to reach a specific KDC.
pub fn render_stub(config: &Config, realm: &str, kdc: Option<&str>) -> String {
    let mut out = String::from("[libdefaults]\n");
    let _ = writeln!(out, "\tdefault_realm = {realm}");
    out.push_str("\tdns_lookup_realm = false\n");
    let _ = writeln!(out, "\tdns_lookup_kdc = {}", kdc.is_none());
    let _ = writeln!(
        out,
        "\tdefault_ccache_name = FILE:{}",
        CredCache::System.path(&config.paths.run_dir).display()
    );

    out.push_str("[realms]\n");
    let _ = writeln!(out, "\t{realm} = {{");
    if let Some(kdc) = kdc {
        let _ = writeln!(out, "\t\tkdc = {kdc}");
    }
    out.push_str("\t}\n");
    out
}

async fn write_atomic(path: &Path, contents: &str) -> Result<(), Error> {
    let tmp = path.with_extension("krbmgr.tmp");
    fs::write(&tmp, contents).await.context(FileIO { path: &tmp })?;
    fs::rename(&tmp, path).await.context(FileIO { path })
}

/// Writes a stub `krb5.conf` unless one already exists, returns whether it did.
pub async fn write_stub(config: &Config, realm: &str, kdc: Option<&str>) -> Result<bool, Error> {
    let path = &config.paths.krb5_conf;
    if fs::try_exists(path).await.context(FileIO { path })? {
        return Ok(false);
    }

    tracing::info!(%realm, kdc, "writing stub kerberos configuration");
    write_atomic(path, &render_stub(config, realm, kdc)).await?;
    Ok(true)
}

/// Effective auxiliary settings, stored ones taking precedence over the configuration file.
pub async fn settings(config: &Config, store: &Store) -> KerberosSettings {
    store.settings().await.unwrap_or_else(|| KerberosSettings {
        appdefaults_aux: config.ticket.appdefaults_aux.clone(),
        libdefaults_aux: config.ticket.libdefaults_aux.clone(),
    })
}

/// Regenerates `krb5.conf` and the system keytab from the stored state.
pub async fn generate(
    config: &Config,
    store: &Store,
    default_realm: Option<&str>,
    kdc_override: Option<&KdcOverride>,
) -> Result<(), Error> {
    let realms = store.realms().await;
    let settings = settings(config, store).await;

    tracing::info!(
        path = %config.paths.krb5_conf.display(),
        default_realm,
        realms = realms.len(),
        "generating kerberos configuration"
    );
    let text = render(config, default_realm, &realms, &settings, kdc_override);
    write_atomic(&config.paths.krb5_conf, &text).await?;

    let blobs = store
        .keytabs()
        .await
        .into_iter()
        .map(|k| (k.name, k.file))
        .collect::<Vec<_>>();
    keytab::assemble(config, &blobs).await
}
