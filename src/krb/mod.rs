/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

pub mod genconf;
pub mod keytab;
pub mod kinit;
pub mod klist;

use crate::trace::*;
use crate::{exec, secrets, store};

use bitflags::bitflags;
use nix::errno::Errno;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use snafu::prelude::*;
use std::{
    fmt, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

pub const TGS_NAME: &str = "krbtgt";
pub const MACHINE_ACCOUNT_KEYTAB: &str = "AD_MACHINE_ACCOUNT";

const SYSTEM_CCACHE: &str = "krb5cc_0";
const TEMP_CCACHE: &str = "krb5cc_middleware_temp";
const USER_CCACHE_PREFIX: &str = "krb5cc_";

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Validation failed: {errors}"))]
    Validation { errors: ValidationErrors },
    #[snafu(display("{reason}"))]
    Conflict { reason: String },
    #[snafu(display("Failed to parse `{tool}` output on line {line}: {reason}"))]
    Parse {
        tool: &'static str,
        line: usize,
        reason: String,
    },
    #[snafu(display("External tool error"), context(false))]
    Tool { source: exec::Error },
    #[snafu(display("kinit with principal [{principal}] failed: {stderr}"))]
    KeytabKinit { principal: String, stderr: String },
    #[snafu(display("kinit with password failed: {stderr}"))]
    PasswordKinit { stderr: String },
    #[snafu(display("Timed out hung kinit after {}", timeout.secs()))]
    AcquireTimeout { timeout: Duration },
    #[snafu(display("Kerberos ticket is required"))]
    TicketRequired,
    #[snafu(display("No directory service with Kerberos authentication is enabled"))]
    NotConfigured,
    #[snafu(display("{what} not found"))]
    NotFound { what: String },
    #[snafu(display("Failed to access `{}`", path.display()))]
    FileIO { path: PathBuf, source: io::Error },
    #[snafu(display("Failed to change ownership of `{}`", path.display()))]
    Chown { path: PathBuf, source: Errno },
    #[snafu(display("Persistence store error"), context(false))]
    Store { source: store::Error },
    #[snafu(display("Secrets store error"), context(false))]
    Secrets { source: secrets::Error },
}

/// Field-level validation failures, collected before failing.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationErrors(Vec<(String, String)>);

impl ValidationErrors {
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push((field.into(), message.into()));
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(f, _)| f.as_str())
    }

    pub fn check(self) -> Result<(), Error> {
        if self.is_empty() {
            Ok(())
        } else {
            Validation { errors: self }.fail()
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, (field, message)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "[{field}] {message}")?;
        }
        Ok(())
    }
}

/// Well-known credential cache locations under the runtime directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CredCache {
    #[default]
    System,
    Temporary,
    User(u32),
}

impl CredCache {
    pub fn path(&self, run_dir: &Path) -> PathBuf {
        match self {
            Self::System => run_dir.join(SYSTEM_CCACHE),
            Self::Temporary => run_dir.join(TEMP_CCACHE),
            Self::User(uid) => run_dir.join(format!("{USER_CCACHE_PREFIX}{uid}")),
        }
    }

    /// Resolves a cache file path back to its location, `None` if unknown.
    pub fn from_path(path: &Path, run_dir: &Path) -> Option<Self> {
        if path.parent()? != run_dir {
            return None;
        }
        match path.file_name()?.to_str()? {
            SYSTEM_CCACHE => Some(Self::System),
            TEMP_CCACHE => Some(Self::Temporary),
            name => name
                .strip_prefix(USER_CCACHE_PREFIX)
                .and_then(|uid| uid.parse().ok())
                .map(Self::User),
        }
    }
}

impl fmt::Display for CredCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::System => f.write_str("SYSTEM"),
            Self::Temporary => f.write_str("TEMP"),
            Self::User(uid) => write!(f, "USER:{uid}"),
        }
    }
}

impl FromStr for CredCache {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s.eq_ignore_ascii_case("SYSTEM") => Ok(Self::System),
            None if s.eq_ignore_ascii_case("TEMP") => Ok(Self::Temporary),
            Some((kind, uid)) if kind.eq_ignore_ascii_case("USER") => uid
                .parse()
                .map(Self::User)
                .map_err(|_| format!("invalid uid `{uid}` in credential cache `{s}`")),
            _ => Err(format!("unknown credential cache `{s}`, expected SYSTEM, TEMP or USER:<uid>")),
        }
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TicketFlags: u16 {
        const FORWARDABLE            = 1;
        const FORWARDED              = 1 << 1;
        const PROXIABLE              = 1 << 2;
        const PROXY                  = 1 << 3;
        const POSTDATEABLE           = 1 << 4;
        const POSTDATED              = 1 << 5;
        const RENEWABLE              = 1 << 6;
        const INITIAL                = 1 << 7;
        const INVALID                = 1 << 8;
        const HARDWARE_AUTHENTICATED = 1 << 9;
        const PREAUTHENTICATED       = 1 << 10;
        const TRANSIT_POLICY_CHECKED = 1 << 11;
        const OKAY_AS_DELEGATE       = 1 << 12;
        const ANONYMOUS              = 1 << 13;
    }
}

const FLAG_LETTERS: [(char, TicketFlags); 14] = [
    ('F', TicketFlags::FORWARDABLE),
    ('f', TicketFlags::FORWARDED),
    ('P', TicketFlags::PROXIABLE),
    ('p', TicketFlags::PROXY),
    ('D', TicketFlags::POSTDATEABLE),
    ('d', TicketFlags::POSTDATED),
    ('R', TicketFlags::RENEWABLE),
    ('I', TicketFlags::INITIAL),
    ('i', TicketFlags::INVALID),
    ('H', TicketFlags::HARDWARE_AUTHENTICATED),
    ('A', TicketFlags::PREAUTHENTICATED),
    ('T', TicketFlags::TRANSIT_POLICY_CHECKED),
    ('O', TicketFlags::OKAY_AS_DELEGATE),
    ('a', TicketFlags::ANONYMOUS),
];

impl TicketFlags {
    pub fn from_letter(letter: char) -> Option<Self> {
        FLAG_LETTERS.iter().find(|(l, _)| *l == letter).map(|(_, f)| *f)
    }

    /// Parses the `klist` flag letters, failing on the first unknown letter.
    pub fn from_letters(letters: &str) -> Result<Self, char> {
        letters
            .chars()
            .try_fold(Self::empty(), |acc, l| Self::from_letter(l).map(|f| acc | f).ok_or(l))
    }

    pub fn letters(&self) -> String {
        FLAG_LETTERS
            .iter()
            .filter(|(_, f)| self.contains(*f))
            .map(|(l, _)| *l)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub issued: i64,
    pub expires: i64,
    /// Zero when the ticket cannot be renewed.
    pub renew_until: i64,
    pub client: String,
    pub server: String,
    pub etype: Option<String>,
    pub flags: TicketFlags,
}

impl Ticket {
    pub fn is_tgt_for(&self, principal: &str) -> bool {
        self.client == principal && self.server.starts_with(TGS_NAME)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDescriptor {
    pub cache_type: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketCacheSnapshot {
    pub default_principal: String,
    pub cache: CacheDescriptor,
    pub tickets: Vec<Ticket>,
}

impl TicketCacheSnapshot {
    /// The ticket-granting ticket of the default principal.
    pub fn tgt(&self) -> Option<&Ticket> {
        self.tickets.iter().find(|t| t.is_tgt_for(&self.default_principal))
    }
}

/// A password that is redacted from `Debug` output but crosses the RPC boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct Password(SecretString);

impl Password {
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Serialize for Password {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.0.expose_secret())
    }
}

impl From<SecretString> for Password {
    fn from(secret: SecretString) -> Self {
        Self(secret)
    }
}

impl From<String> for Password {
    fn from(secret: String) -> Self {
        Self(secret.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Credentials {
    Keytab { principal: String },
    Password { username: String, password: Password },
}

impl Credentials {
    pub fn principal(&self) -> &str {
        match self {
            Self::Keytab { principal } => principal,
            Self::Password { username, .. } => username,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KdcOverride {
    pub domain: Option<String>,
    pub kdc: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KinitOptions {
    pub ccache: CredCache,
    /// Renewable lifetime in days.
    pub renewal_period: u32,
    /// Ticket lifetime in minutes, 0 for the KDC default.
    pub lifetime: u32,
    pub kdc_override: Option<KdcOverride>,
}

impl Default for KinitOptions {
    fn default() -> Self {
        Self {
            ccache: CredCache::System,
            renewal_period: 7,
            lifetime: 0,
            kdc_override: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlistOptions {
    pub ccache: CredCache,
    pub timeout: Duration,
}

impl Default for KlistOptions {
    fn default() -> Self {
        Self {
            ccache: CredCache::System,
            timeout: Duration::from_secs(10),
        }
    }
}
