/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! System keytab inspection and machine account extraction.

use super::{Error, FileIO, Parse, ValidationErrors};
use crate::conf::Config;
use crate::exec::{Failure, Tool};
use crate::trace::*;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
};
use tokio::fs;

const TOOL: &str = "klist -k";
const TIME_FORMAT: &str = "%m/%d/%y %H:%M:%S";
const DEPRECATED: &str = "DEPRECATED:";
const SCRATCH_KEYTAB: &str = "samba_mit.keytab";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeytabEntry {
    /// 1-based position in the keytab, shifts when earlier entries are deleted.
    pub slot: u32,
    pub kvno: u32,
    pub principal: String,
    pub etype: String,
    pub etype_deprecated: bool,
    pub date: i64,
}

fn parse_entry(fields: &[&str], slot: u32, line: usize) -> Result<KeytabEntry, Error> {
    let malformed = || {
        Parse {
            tool: TOOL,
            line,
            reason: format!("malformed keytab entry `{}`", fields.join(" ")),
        }
        .build()
    };

    let [kvno, date, time, principal, etype] = fields else {
        return Err(malformed());
    };
    let etype = etype
        .strip_prefix('(')
        .and_then(|e| e.strip_suffix(')'))
        .ok_or_else(malformed)?;
    let date = NaiveDateTime::parse_from_str(&format!("{date} {time}"), TIME_FORMAT)
        .ok()
        .and_then(|dt| Local.from_local_datetime(&dt).earliest())
        .ok_or_else(malformed)?;

    Ok(KeytabEntry {
        slot,
        kvno: kvno.parse().map_err(|_| malformed())?,
        principal: principal.to_string(),
        etype: etype.strip_prefix(DEPRECATED).unwrap_or(etype).to_owned(),
        etype_deprecated: etype.starts_with(DEPRECATED),
        date: date.timestamp(),
    })
}

/// Parses `klist -tek` output, entries are numbered in listing order.
pub fn parse(text: &str) -> Result<Vec<KeytabEntry>, Error> {
    let mut entries = Vec::new();
    let mut in_body = false;

    for (idx, line) in text.lines().enumerate() {
        if !in_body {
            in_body = line.starts_with("----");
            continue;
        }
        let fields = line.split_whitespace().collect::<Vec<_>>();
        if fields.is_empty() {
            continue;
        }
        entries.push(parse_entry(&fields, entries.len() as u32 + 1, idx + 1)?);
    }
    Ok(entries)
}

pub async fn list(config: &Config, keytab: &Path) -> Result<Vec<KeytabEntry>, Error> {
    tracing::debug!(keytab = %keytab.display(), "listing keytab entries");
    let output = Tool::new(&config.tools.klist)
        .arg("-tek")
        .arg(keytab)
        .run(config.keytab.list_timeout)
        .await?;
    parse(&output.stdout)
}

/// Lists a keytab, logging failures and treating them as an empty keytab.
pub async fn list_or_empty(config: &Config, keytab: &Path) -> Vec<KeytabEntry> {
    list(config, keytab).await.unwrap_or_else(|err| {
        tracing::warn!(error = err.chain(), keytab = %keytab.display(), "could not list kerberos keytab");
        Vec::new()
    })
}

/// Unique principals of the system keytab, empty if it is missing or unreadable.
pub async fn principal_choices(config: &Config) -> Vec<String> {
    if !fs::try_exists(&config.paths.system_keytab).await.unwrap_or(false) {
        return Vec::new();
    }
    list_or_empty(config, &config.paths.system_keytab)
        .await
        .into_iter()
        .map(|e| e.principal)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Whether a principal belongs to the machine account of `netbios`.
///
/// Matches the account itself (`NETBIOS$`) and service principals whose host
/// instance is the machine (`host/netbios`, `nfs/netbios.domain`), ignoring case.
pub fn is_machine_account(principal: &str, netbios: &str) -> bool {
    let netbios = netbios.to_lowercase();
    if netbios.is_empty() {
        return false;
    }
    let name = principal.rsplit_once('@').map_or(principal, |(n, _)| n).to_lowercase();
    let mut components = name.split('/');

    components.next() == Some(format!("{netbios}$").as_str())
        || components.any(|instance| instance.split('.').next() == Some(netbios.as_str()))
}

/// Slots to delete for every entry failing `keep`, highest first.
///
/// `ktutil` renumbers the remaining entries after each `delent`, so deleting
/// from the end keeps the pending slot numbers valid.
pub fn delete_slots(entries: &[KeytabEntry], keep: impl Fn(&KeytabEntry) -> bool) -> Vec<u32> {
    let mut slots = entries.iter().filter(|e| !keep(e)).map(|e| e.slot).collect::<Vec<_>>();
    slots.sort_unstable_by(|a, b| b.cmp(a));
    slots.dedup();
    slots
}

pub fn prune_script(src: &Path, slots: &[u32], dst: &Path) -> String {
    let mut script = format!("rkt {}\n", src.display());
    for slot in slots {
        script.push_str(&format!("delent {slot}\n"));
    }
    script.push_str(&format!("wkt {}\nq\n", dst.display()));
    script
}

/// Runs a `ktutil` script, which reports errors on stderr but not in its exit status.
pub async fn ktutil(config: &Config, script: &str) -> Result<(), Error> {
    let output = Tool::new(&config.tools.ktutil)
        .input(script.as_bytes())
        .output(config.keytab.list_timeout)
        .await?;

    let stderr = output.stderr.trim();
    ensure!(
        stderr.is_empty(),
        Failure {
            tool: "ktutil",
            stderr
        }
    );
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err).context(FileIO { path }),
        _ => Ok(()),
    }
}

/// Extracts the machine account entries of the system keytab into the samba keytab.
///
/// The system keytab is copied to a working keytab which is listed and pruned
/// into a scratch file, then renamed over the working copy. Returns the
/// resulting keytab contents.
pub async fn extract_machine_account(config: &Config, netbios: &str) -> Result<Vec<u8>, Error> {
    let system = &config.paths.system_keytab;
    let working = &config.paths.samba_keytab;
    let scratch = working.with_file_name(SCRATCH_KEYTAB);

    remove_if_exists(working).await?;
    ktutil(config, &format!("rkt {}\nwkt {}\nq\n", system.display(), working.display())).await?;

    let entries = list_or_empty(config, working).await;
    let slots = delete_slots(&entries, |e| is_machine_account(&e.principal, netbios));
    tracing::debug!(
        entries = entries.len(),
        deleted = slots.len(),
        "pruning non machine account keytab entries"
    );

    remove_if_exists(&scratch).await?;
    ktutil(config, &prune_script(working, &slots, &scratch)).await?;
    fs::rename(&scratch, working).await.context(FileIO { path: &scratch })?;

    fs::read(working).await.context(FileIO { path: working })
}

/// Checks that a keytab blob is base64 and readable by `klist -k`.
pub async fn validate_blob(config: &Config, field: &str, blob: &str) -> Result<ValidationErrors, Error> {
    let mut errors = ValidationErrors::default();

    let decoded = match BASE64.decode(blob) {
        Ok(decoded) => decoded,
        Err(err) => {
            errors.add(field, format!("Keytab is a not a properly base64-encoded string: [{err}]"));
            return Ok(errors);
        }
    };

    let test = &config.paths.test_keytab;
    fs::write(test, decoded).await.context(FileIO { path: test })?;
    if let Err(err) = list(config, test).await {
        errors.add(field, format!("Failed to validate keytab: [{}]", err.chain()));
    }
    remove_if_exists(test).await?;

    Ok(errors)
}

/// Writes decoded keytab records to the system keytab, merging all of them.
pub async fn assemble(config: &Config, blobs: &[(String, String)]) -> Result<(), Error> {
    let system = &config.paths.system_keytab;
    let dir = system.parent().unwrap_or(Path::new("/"));
    let mut parts: Vec<PathBuf> = Vec::new();
    let mut script = String::new();

    for (name, blob) in blobs {
        let decoded = match BASE64.decode(blob) {
            Ok(decoded) => decoded,
            Err(error) => {
                tracing::warn!(%error, keytab = %name, "skipping keytab record with invalid encoding");
                continue;
            }
        };
        let part = dir.join(format!(".krbmgr.{}.keytab", parts.len()));
        fs::write(&part, decoded).await.context(FileIO { path: &part })?;
        script.push_str(&format!("rkt {}\n", part.display()));
        parts.push(part);
    }
    if parts.is_empty() {
        return Ok(());
    }

    let merged = dir.join(".krbmgr.merged.keytab");
    remove_if_exists(&merged).await?;
    script.push_str(&format!("wkt {}\nq\n", merged.display()));

    let res = ktutil(config, &script).await;
    for part in &parts {
        remove_if_exists(part).await?;
    }
    res?;

    tracing::debug!(keytab = %system.display(), records = parts.len(), "writing system keytab");
    fs::rename(&merged, system).await.context(FileIO { path: &merged })
}

pub fn encode(keytab: &[u8]) -> String {
    BASE64.encode(keytab)
}
