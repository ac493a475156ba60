/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Inspection of credential caches through `klist`.
//!
//! `klist -ef` prints a header followed by one block per ticket:
//!
//! ```text
//! Ticket cache: FILE:/var/run/middleware/krb5cc_0
//! Default principal: NAS01$@AD.EXAMPLE.COM
//!
//! Valid starting       Expires              Service principal
//! 10/16/26 08:00:01  10/16/26 18:00:01  krbtgt/AD.EXAMPLE.COM@AD.EXAMPLE.COM
//! 	renew until 10/23/26 08:00:01, Flags: FRIA
//! 	Etype (skey, tkt): aes256-cts-hmac-sha1-96, aes256-cts-hmac-sha1-96
//! ```
//!
//! Every line must match a known shape, anything else is a parse error so that
//! output format drift is caught rather than silently dropped.

use super::{CacheDescriptor, CredCache, Error, Parse, Ticket, TicketCacheSnapshot, TicketFlags};
use crate::exec::Tool;
use crate::trace::*;

use chrono::{Local, NaiveDateTime, TimeZone};
use regex_lite::Regex;
use snafu::prelude::*;
use std::{path::Path, sync::LazyLock, time::Duration};

const TOOL: &str = "klist";
const TIME_FORMAT: &str = "%m/%d/%y %H:%M:%S";

const TICKET_CACHE: &str = "Ticket cache: ";
const DEFAULT_PRINCIPAL: &str = "Default principal: ";
const COLUMNS: &str = "Valid starting";

static TICKET_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{2}/\d{2}/\d{2} \d{2}:\d{2}:\d{2})\s+(\d{2}/\d{2}/\d{2} \d{2}:\d{2}:\d{2})\s+(\S+)\s*$").unwrap()
});

#[derive(Clone, Copy)]
enum Field {
    RenewUntil,
    Flags,
    Etype,
    Addresses,
}

const CONTINUATIONS: [(&str, Field); 4] = [
    ("renew until ", Field::RenewUntil),
    ("Flags: ", Field::Flags),
    ("Etype (skey, tkt): ", Field::Etype),
    ("Addresses: ", Field::Addresses),
];

fn parse_time(ts: &str, line: usize) -> Result<i64, Error> {
    let naive = NaiveDateTime::parse_from_str(ts.trim(), TIME_FORMAT).map_err(|err| {
        Parse {
            tool: TOOL,
            line,
            reason: format!("invalid timestamp `{}`: {err}", ts.trim()),
        }
        .build()
    })?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
        .context(Parse {
            tool: TOOL,
            line,
            reason: format!("nonexistent local time `{}`", ts.trim()),
        })
}

fn cache_descriptor(value: &str, run_dir: &Path, line: usize) -> Result<CacheDescriptor, Error> {
    let (cache_type, name) = value.split_once(':').context(Parse {
        tool: TOOL,
        line,
        reason: format!("malformed ticket cache `{value}`"),
    })?;

    let name = match cache_type {
        "FILE" => CredCache::from_path(Path::new(name.trim()), run_dir)
            .map(|c| c.to_string())
            .context(Parse {
                tool: TOOL,
                line,
                reason: format!("unknown credential cache location `{}`", name.trim()),
            })?,
        _ => name.trim().to_owned(),
    };
    Ok(CacheDescriptor {
        cache_type: cache_type.to_owned(),
        name,
    })
}

fn parse_continuation(text: &str, ticket: &mut Ticket, line: usize) -> Result<(), Error> {
    let mut rest = text.trim();

    while !rest.is_empty() {
        let Some((value, field)) = CONTINUATIONS
            .iter()
            .find_map(|(prefix, field)| rest.strip_prefix(prefix).map(|v| (v, *field)))
        else {
            return Parse {
                tool: TOOL,
                line,
                reason: format!("unrecognized ticket attribute `{rest}`"),
            }
            .fail();
        };

        rest = match field {
            Field::RenewUntil => {
                let (ts, tail) = value.split_once(", ").unwrap_or((value, ""));
                ticket.renew_until = parse_time(ts, line)?;
                tail
            }
            Field::Flags => {
                let (letters, tail) = value.split_once(", ").unwrap_or((value, ""));
                ticket.flags = TicketFlags::from_letters(letters.trim()).map_err(|letter| {
                    Parse {
                        tool: TOOL,
                        line,
                        reason: format!("unknown ticket flag `{letter}`"),
                    }
                    .build()
                })?;
                tail
            }
            Field::Etype => {
                ticket.etype = Some(value.trim().to_owned());
                ""
            }
            Field::Addresses => "",
        };
    }
    Ok(())
}

fn finish(mut ticket: Ticket, line: usize) -> Result<Ticket, Error> {
    ensure!(
        ticket.expires >= ticket.issued,
        Parse {
            tool: TOOL,
            line,
            reason: format!("ticket for `{}` expires before it was issued", ticket.server),
        }
    );
    // A renew-until that does not extend past expiry cannot be used to renew.
    if ticket.renew_until <= ticket.expires {
        ticket.renew_until = 0;
    }
    Ok(ticket)
}

/// Parses `klist -ef` output.
///
/// File-based caches are resolved against the well-known locations under
/// `run_dir`; an unknown location is an error.
pub fn parse(text: &str, run_dir: &Path) -> Result<TicketCacheSnapshot, Error> {
    let mut cache = None;
    let mut default_principal: Option<String> = None;
    let mut tickets = Vec::new();
    let mut current: Option<(Ticket, usize)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;

        if raw.trim().is_empty() {
            continue;
        }
        if raw.starts_with(['\t', ' ']) {
            let Some((ticket, _)) = current.as_mut() else {
                return Parse {
                    tool: TOOL,
                    line,
                    reason: "ticket attribute outside of a ticket block",
                }
                .fail();
            };
            parse_continuation(raw, ticket, line)?;
            continue;
        }

        if let Some((ticket, start)) = current.take() {
            tickets.push(finish(ticket, start)?);
        }

        if let Some(value) = raw.strip_prefix(TICKET_CACHE) {
            cache = Some(cache_descriptor(value.trim(), run_dir, line)?);
        } else if let Some(value) = raw.strip_prefix(DEFAULT_PRINCIPAL) {
            default_principal = Some(value.trim().to_owned());
        } else if raw.starts_with(COLUMNS) {
            continue;
        } else if raw.starts_with(|c: char| c.is_ascii_digit()) {
            let caps = TICKET_LINE.captures(raw).context(Parse {
                tool: TOOL,
                line,
                reason: format!("malformed ticket line `{raw}`"),
            })?;
            let client = default_principal.clone().context(Parse {
                tool: TOOL,
                line,
                reason: "ticket listed before the default principal",
            })?;
            let ticket = Ticket {
                issued: parse_time(&caps[1], line)?,
                expires: parse_time(&caps[2], line)?,
                renew_until: 0,
                client,
                server: caps[3].to_owned(),
                etype: None,
                flags: TicketFlags::empty(),
            };
            current = Some((ticket, line));
        } else {
            return Parse {
                tool: TOOL,
                line,
                reason: format!("unrecognized line `{raw}`"),
            }
            .fail();
        }
    }
    if let Some((ticket, start)) = current.take() {
        tickets.push(finish(ticket, start)?);
    }

    Ok(TicketCacheSnapshot {
        default_principal: default_principal.context(Parse {
            tool: TOOL,
            line: 0usize,
            reason: "missing default principal",
        })?,
        cache: cache.context(Parse {
            tool: TOOL,
            line: 0usize,
            reason: "missing ticket cache header",
        })?,
        tickets,
    })
}

pub async fn list(
    klist: &Path,
    ccache: CredCache,
    run_dir: &Path,
    timeout: Duration,
) -> Result<TicketCacheSnapshot, Error> {
    let path = ccache.path(run_dir);

    tracing::debug!(%ccache, path = %path.display(), "listing kerberos tickets");
    let output = Tool::new(klist).arg("-ef").arg(&path).run(timeout).await?;
    parse(&output.stdout, run_dir)
}

/// Whether the cache holds an unexpired ticket-granting ticket.
///
/// Failures and timeouts count as no ticket.
pub async fn has_valid_ticket(klist: &Path, ccache: CredCache, run_dir: &Path, timeout: Duration) -> bool {
    match Tool::new(klist).arg("-s").arg(ccache.path(run_dir)).output(timeout).await {
        Ok(output) => output.success(),
        Err(err) => {
            tracing::debug!(error = err.chain(), %ccache, "kerberos ticket status check failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RUN_DIR: &str = "/var/run/middleware";

    const RENEWABLE: &str = "\
Ticket cache: FILE:/var/run/middleware/krb5cc_0
Default principal: NAS01$@AD.EXAMPLE.COM

Valid starting       Expires              Service principal
10/16/26 08:00:01  10/16/26 18:00:01  krbtgt/AD.EXAMPLE.COM@AD.EXAMPLE.COM
\trenew until 10/23/26 08:00:01, Flags: FRIA
\tEtype (skey, tkt): aes256-cts-hmac-sha1-96, aes256-cts-hmac-sha1-96
10/16/26 08:05:00  10/16/26 18:00:01  cifs/dc01.ad.example.com@AD.EXAMPLE.COM
\tFlags: FA, Etype (skey, tkt): aes256-cts-hmac-sha1-96, aes256-cts-hmac-sha1-96
";

    fn ts(s: &str) -> i64 {
        parse_time(s, 0).unwrap()
    }

    #[test]
    fn parses_renewable_tgt() {
        let snap = parse(RENEWABLE, Path::new(RUN_DIR)).unwrap();

        assert_eq!(snap.default_principal, "NAS01$@AD.EXAMPLE.COM");
        assert_eq!(snap.cache.cache_type, "FILE");
        assert_eq!(snap.cache.name, "SYSTEM");
        assert_eq!(snap.tickets.len(), 2);

        let tgt = snap.tgt().unwrap();
        assert_eq!(tgt.server, "krbtgt/AD.EXAMPLE.COM@AD.EXAMPLE.COM");
        assert_eq!(tgt.client, "NAS01$@AD.EXAMPLE.COM");
        assert_eq!(tgt.issued, ts("10/16/26 08:00:01"));
        assert_eq!(tgt.expires, ts("10/16/26 18:00:01"));
        assert_eq!(tgt.renew_until, ts("10/23/26 08:00:01"));
        assert_eq!(
            tgt.flags,
            TicketFlags::FORWARDABLE | TicketFlags::RENEWABLE | TicketFlags::INITIAL | TicketFlags::PREAUTHENTICATED
        );
        assert_eq!(
            tgt.etype.as_deref(),
            Some("aes256-cts-hmac-sha1-96, aes256-cts-hmac-sha1-96")
        );

        let svc = &snap.tickets[1];
        assert_eq!(svc.server, "cifs/dc01.ad.example.com@AD.EXAMPLE.COM");
        assert_eq!(svc.renew_until, 0);
        assert_eq!(svc.flags, TicketFlags::FORWARDABLE | TicketFlags::PREAUTHENTICATED);
        assert!(svc.etype.is_some());
    }

    #[test]
    fn parses_user_and_non_file_caches() {
        let text = RENEWABLE.replace("krb5cc_0", "krb5cc_1000");
        assert_eq!(parse(&text, Path::new(RUN_DIR)).unwrap().cache.name, "USER:1000");

        let text = RENEWABLE.replace("FILE:/var/run/middleware/krb5cc_0", "KCM:0");
        let snap = parse(&text, Path::new(RUN_DIR)).unwrap();
        assert_eq!(snap.cache.cache_type, "KCM");
        assert_eq!(snap.cache.name, "0");
    }

    #[test]
    fn rejects_unknown_cache_location() {
        let text = RENEWABLE.replace("/var/run/middleware/krb5cc_0", "/tmp/krb5cc_0");
        assert!(matches!(
            parse(&text, Path::new(RUN_DIR)),
            Err(Error::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn rejects_unknown_flag() {
        let text = RENEWABLE.replace("Flags: FRIA", "Flags: FRIZ");
        match parse(&text, Path::new(RUN_DIR)) {
            Err(Error::Parse { line, reason, .. }) => {
                assert_eq!(line, 6);
                assert!(reason.contains("`Z`"));
            }
            res => panic!("unexpected result: {res:?}"),
        }
    }

    #[test]
    fn rejects_unknown_attribute() {
        let text = RENEWABLE.replace("\tEtype (skey, tkt)", "\tKvno (skey, tkt)");
        assert!(matches!(parse(&text, Path::new(RUN_DIR)), Err(Error::Parse { line: 7, .. })));

        let text = format!("{RENEWABLE}Kerberos 4 ticket cache: /tmp/tkt0\n");
        assert!(matches!(parse(&text, Path::new(RUN_DIR)), Err(Error::Parse { line: 10, .. })));
    }

    #[test]
    fn rejects_missing_header() {
        let text = RENEWABLE.lines().skip(1).collect::<Vec<_>>().join("\n");
        assert!(parse(&text, Path::new(RUN_DIR)).is_err());
    }

    #[test]
    fn rejects_expiry_before_issue() {
        let text = RENEWABLE.replace("10/16/26 18:00:01  krbtgt", "10/15/26 18:00:01  krbtgt");
        assert!(matches!(parse(&text, Path::new(RUN_DIR)), Err(Error::Parse { line: 5, .. })));
    }

    #[test]
    fn renew_until_before_expiry_is_not_renewable() {
        let text = RENEWABLE.replace("renew until 10/23/26", "renew until 10/16/26");
        let snap = parse(&text, Path::new(RUN_DIR)).unwrap();
        assert_eq!(snap.tgt().unwrap().renew_until, 0);
    }

    #[test]
    fn empty_cache_has_no_tgt() {
        let text = "Ticket cache: FILE:/var/run/middleware/krb5cc_middleware_temp\nDefault principal: admin@EXAMPLE.COM\n";
        let snap = parse(text, Path::new(RUN_DIR)).unwrap();
        assert_eq!(snap.cache.name, "TEMP");
        assert!(snap.tgt().is_none());
    }

    fn render(issued: i64, expires: i64, renew: Option<i64>, flags: &str, server: &str) -> String {
        let fmt = |t: i64| Local.timestamp_opt(t, 0).unwrap().format(TIME_FORMAT).to_string();
        let mut text = format!(
            "Ticket cache: FILE:{RUN_DIR}/krb5cc_0\nDefault principal: svc@EXAMPLE.COM\n\n\
             Valid starting       Expires              Service principal\n{}  {}  {server}\n",
            fmt(issued),
            fmt(expires)
        );
        match renew {
            Some(renew) => text.push_str(&format!("\trenew until {}, Flags: {flags}\n", fmt(renew))),
            None => text.push_str(&format!("\tFlags: {flags}, Etype (skey, tkt): aes256-cts-hmac-sha1-96\n")),
        }
        text
    }

    proptest! {
        #[test]
        fn parsed_tickets_hold_invariants(
            issued in 1_600_000_000i64..1_900_000_000,
            lifetime in -864_000i64..864_000,
            renew in proptest::option::of(-864_000i64..2_592_000),
            flags in "[FfPpDdRIiHATOa]{0,6}",
            server in "krbtgt/[A-Z]{1,8}\\.COM@[A-Z]{1,8}\\.COM",
        ) {
            let expires = issued + lifetime;
            let text = render(issued, expires, renew.map(|r| expires + r), &flags, &server);

            let first = parse(&text, Path::new(RUN_DIR));
            let second = parse(&text, Path::new(RUN_DIR));
            prop_assert_eq!(first.as_ref().ok(), second.as_ref().ok());

            if let Ok(snap) = first {
                for t in &snap.tickets {
                    prop_assert!(t.expires >= t.issued);
                    prop_assert!(t.renew_until == 0 || t.renew_until > t.expires);
                }
            }
        }
    }
}
