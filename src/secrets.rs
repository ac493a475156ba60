/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::exec::{self, Tool};

use futures::future::BoxFuture;
use snafu::prelude::*;
use std::{io, path::PathBuf, time::Duration};

const LAST_CHANGE_KEY: &str = "SECRETS/MACHINE_LAST_CHANGE_TIME";

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Secrets lookup error"), context(false))]
    Lookup { source: exec::Error },
    #[snafu(display("Invalid password change timestamp `{value}`"))]
    Timestamp { value: String },
    #[snafu(display("Failed to read secrets database `{}`", path.display()))]
    Dump { path: PathBuf, source: io::Error },
}

/// Machine account secrets kept by the directory service.
pub trait Secrets: Send + Sync {
    /// Time of the last machine account password change in `workgroup`, if any.
    fn last_password_change<'a>(&'a self, workgroup: &'a str) -> BoxFuture<'a, Result<Option<u32>, Error>>;
    /// Raw copy of the secrets database.
    fn dump(&self) -> BoxFuture<'_, Result<Vec<u8>, Error>>;
}

/// Secrets read from a Samba TDB with `tdbdump`.
pub struct TdbSecrets {
    pub tdbdump: PathBuf,
    pub tdb: PathBuf,
    pub timeout: Duration,
}

/// Decodes `tdbdump` value escapes (`\XX` for non printable bytes).
pub fn unescape(value: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(value.len());
    let mut bytes = value.bytes();

    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let hex = [bytes.next()?, bytes.next()?];
        out.push(u8::from_str_radix(std::str::from_utf8(&hex).ok()?, 16).ok()?);
    }
    Some(out)
}

fn parse_timestamp(value: &str) -> Result<u32, Error> {
    let invalid = || Timestamp { value }.build();
    let bytes: [u8; 4] = unescape(value)
        .ok_or_else(invalid)?
        .try_into()
        .map_err(|_| invalid())?;

    Ok(u32::from_le_bytes(bytes))
}

impl TdbSecrets {
    async fn fetch(&self, workgroup: &str) -> Result<Option<u32>, Error> {
        let key = format!("{LAST_CHANGE_KEY}/{}", workgroup.to_uppercase());
        let output = Tool::new(&self.tdbdump)
            .arg("-k")
            .arg(&key)
            .arg(&self.tdb)
            .output(self.timeout)
            .await?;

        if !output.success() {
            tracing::debug!(%key, stderr = output.stderr.trim(), "secrets key not found");
            return Ok(None);
        }
        parse_timestamp(output.stdout.trim_end_matches('\n')).map(Some)
    }
}

impl Secrets for TdbSecrets {
    fn last_password_change<'a>(&'a self, workgroup: &'a str) -> BoxFuture<'a, Result<Option<u32>, Error>> {
        Box::pin(self.fetch(workgroup))
    }

    fn dump(&self) -> BoxFuture<'_, Result<Vec<u8>, Error>> {
        Box::pin(async move { tokio::fs::read(&self.tdb).await.context(Dump { path: &self.tdb }) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_escaped_timestamps() {
        assert_eq!(unescape(r"ab\00\FF"), Some(vec![b'a', b'b', 0, 255]));
        assert_eq!(unescape(r"\0"), None);
        assert_eq!(unescape(r"\zz"), None);

        assert_eq!(parse_timestamp(r"\00\F1Se").unwrap(), u32::from_le_bytes([0x00, 0xf1, b'S', b'e']));
        assert!(matches!(parse_timestamp(r"\00\F1S"), Err(Error::Timestamp { .. })));
    }

    #[tokio::test]
    async fn reads_timestamp_through_tdbdump() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("tdbdump");
        std::fs::write(
            &script,
            "#!/bin/sh\n[ \"$2\" = SECRETS/MACHINE_LAST_CHANGE_TIME/ADEXAMPLE ] || exit 1\nprintf '\\\\00\\\\F1Se\\n'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let secrets = TdbSecrets {
            tdbdump: script,
            tdb: dir.path().join("secrets.tdb"),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(
            secrets.last_password_change("adexample").await.unwrap(),
            Some(u32::from_le_bytes([0x00, 0xf1, b'S', b'e']))
        );
        assert_eq!(secrets.last_password_change("ad.example.com").await.unwrap(), None);
        assert!(matches!(secrets.dump().await, Err(Error::Dump { .. })));
    }
}
