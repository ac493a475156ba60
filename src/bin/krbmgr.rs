/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use argh::FromArgs;
use base64::prelude::*;
use krbmgr::krb::{CredCache, Credentials, KdcOverride, KinitOptions, KlistOptions};
use krbmgr::store::RealmParams;
use serde::Serialize;
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(FromArgs)]
/// Kerberos ticket lifecycle manager client.
struct Arguments {
    /// address of the krbmgr server
    #[argh(option, short = 'h')]
    host: Option<String>,
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Start(StartArguments),
    Stop(StopArguments),
    Status(StatusArguments),
    Renew(RenewArguments),
    Klist(KlistArguments),
    Kdestroy(KdestroyArguments),
    Kinit(KinitArguments),
    Check(CheckArguments),
    Realm(RealmArguments),
    Keytab(KeytabArguments),
    Settings(SettingsArguments),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "start")]
/// Acquire a ticket for the enabled directory service and start its renewal.
struct StartArguments {
    /// domain to pin a KDC for
    #[argh(option, short = 'd')]
    domain: Option<String>,
    /// KDC to use for the domain
    #[argh(option, short = 'k')]
    kdc: Option<String>,
    /// seconds to wait for the ticket
    #[argh(option, short = 't')]
    timeout: Option<u64>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "stop")]
/// Stop ticket renewal and destroy the system credential cache.
struct StopArguments {}

#[derive(FromArgs)]
#[argh(subcommand, name = "status")]
/// Report whether the system credential cache holds a valid ticket.
struct StatusArguments {}

#[derive(FromArgs)]
#[argh(subcommand, name = "renew")]
/// Renew the system ticket, acquiring a new one if needed.
struct RenewArguments {}

#[derive(FromArgs)]
#[argh(subcommand, name = "check")]
/// Fail unless a valid system ticket is present.
struct CheckArguments {}

#[derive(FromArgs)]
#[argh(subcommand, name = "klist")]
/// List the tickets of a credential cache.
struct KlistArguments {
    /// user credential cache
    #[argh(option, short = 'u')]
    uid: Option<u32>,
    /// temporary credential cache
    #[argh(switch)]
    temp: bool,
    /// seconds to wait for klist
    #[argh(option, short = 't', default = "10")]
    timeout: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "kdestroy")]
/// Destroy a credential cache.
struct KdestroyArguments {
    /// user credential cache
    #[argh(option, short = 'u')]
    uid: Option<u32>,
    /// temporary credential cache
    #[argh(switch)]
    temp: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "kinit")]
/// Acquire a ticket with the system keytab, or with a password read from stdin.
struct KinitArguments {
    /// authenticate with the password read from stdin
    #[argh(switch, short = 'p')]
    password: bool,
    /// temporary credential cache
    #[argh(switch)]
    temp: bool,
    /// renewable lifetime in days
    #[argh(option, short = 'r', default = "7")]
    renewal_period: u32,
    /// ticket lifetime in minutes
    #[argh(option, short = 'l', default = "0")]
    lifetime: u32,
    /// principal to authenticate as
    #[argh(positional)]
    principal: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "realm")]
/// Manage Kerberos realms.
struct RealmArguments {
    #[argh(subcommand)]
    command: RealmCommand,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum RealmCommand {
    List(ListArguments),
    Create(RealmCreateArguments),
    Update(RealmUpdateArguments),
    Delete(DeleteArguments),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "list")]
/// List the records.
struct ListArguments {}

#[derive(FromArgs)]
#[argh(subcommand, name = "delete")]
/// Delete a record.
struct DeleteArguments {
    /// record id
    #[argh(positional)]
    id: u32,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "create")]
/// Create a realm.
struct RealmCreateArguments {
    /// KDC of the realm
    #[argh(option)]
    kdc: Vec<String>,
    /// admin server of the realm
    #[argh(option)]
    admin_server: Vec<String>,
    /// password server of the realm
    #[argh(option)]
    kpasswd_server: Vec<String>,
    /// realm name
    #[argh(positional)]
    realm: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "update")]
/// Replace a realm.
struct RealmUpdateArguments {
    /// KDC of the realm
    #[argh(option)]
    kdc: Vec<String>,
    /// admin server of the realm
    #[argh(option)]
    admin_server: Vec<String>,
    /// password server of the realm
    #[argh(option)]
    kpasswd_server: Vec<String>,
    /// record id
    #[argh(positional)]
    id: u32,
    /// realm name
    #[argh(positional)]
    realm: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "keytab")]
/// Manage stored keytabs.
struct KeytabArguments {
    #[argh(subcommand)]
    command: KeytabCommand,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum KeytabCommand {
    List(ListArguments),
    Create(KeytabCreateArguments),
    Update(KeytabUpdateArguments),
    Delete(DeleteArguments),
    System(SystemKeytabArguments),
    Principals(PrincipalsArguments),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "create")]
/// Store a keytab file.
struct KeytabCreateArguments {
    /// keytab name
    #[argh(positional)]
    name: String,
    /// keytab file
    #[argh(positional)]
    file: PathBuf,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "update")]
/// Rename a stored keytab or replace its contents.
struct KeytabUpdateArguments {
    /// new keytab name
    #[argh(option, short = 'n')]
    name: Option<String>,
    /// new keytab file
    #[argh(option, short = 'f')]
    file: Option<PathBuf>,
    /// record id
    #[argh(positional)]
    id: u32,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "system")]
/// List the entries of the system keytab.
struct SystemKeytabArguments {}

#[derive(FromArgs)]
#[argh(subcommand, name = "principals")]
/// List the principals available in the system keytab.
struct PrincipalsArguments {}

#[derive(FromArgs)]
#[argh(subcommand, name = "settings")]
/// Show the auxiliary krb5.conf parameters, updating them when given.
struct SettingsArguments {
    /// auxiliary [appdefaults] parameters
    #[argh(option)]
    appdefaults: Option<String>,
    /// auxiliary [libdefaults] parameters
    #[argh(option)]
    libdefaults: Option<String>,
}

fn ccache(uid: Option<u32>, temp: bool) -> CredCache {
    match (uid, temp) {
        (Some(uid), _) => CredCache::User(uid),
        (None, true) => CredCache::Temporary,
        (None, false) => CredCache::System,
    }
}

fn print<T: Serialize>(value: &T) -> Result<(), krbmgr::Error> {
    serde_json::to_writer_pretty(io::stdout(), value).map_err(io::Error::from)?;
    println!();
    Ok(())
}

async fn read_password() -> Result<String, krbmgr::Error> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

async fn read_keytab(path: &Path) -> Result<String, krbmgr::Error> {
    Ok(BASE64_STANDARD.encode(tokio::fs::read(path).await?))
}

#[tokio::main(flavor = "current_thread")]
#[snafu::report]
async fn main() -> Result<(), krbmgr::Error> {
    krbmgr::setup_logging()?;

    let main_args: Arguments = argh::from_env();
    let client = krbmgr::new_client(main_args.host).await?;

    match main_args.command {
        Command::Start(args) => {
            let kdc_override = (args.domain.is_some() || args.kdc.is_some()).then(|| KdcOverride {
                domain: args.domain,
                kdc: args.kdc,
            });
            print(&client.start(kdc_override, args.timeout).await?)?;
        }
        Command::Stop(_) => client.stop().await?,
        Command::Status(_) => print(&client.status().await?)?,
        Command::Renew(_) => print(&client.renew().await?)?,
        Command::Check(_) => client.check_ticket().await?,
        Command::Klist(args) => {
            let opts = KlistOptions {
                ccache: ccache(args.uid, args.temp),
                timeout: Duration::from_secs(args.timeout),
            };
            print(&client.klist(opts).await?)?;
        }
        Command::Kdestroy(args) => client.kdestroy(ccache(args.uid, args.temp)).await?,
        Command::Kinit(args) => {
            let creds = if args.password {
                Credentials::Password {
                    username: args.principal,
                    password: read_password().await?.into(),
                }
            } else {
                Credentials::Keytab {
                    principal: args.principal,
                }
            };
            let opts = KinitOptions {
                ccache: ccache(None, args.temp),
                renewal_period: args.renewal_period,
                lifetime: args.lifetime,
                kdc_override: None,
            };
            client.kinit(creds, opts).await?;
        }
        Command::Realm(RealmArguments { command }) => match command {
            RealmCommand::List(_) => print(&client.realms().await?)?,
            RealmCommand::Create(args) => {
                let params = RealmParams {
                    realm: args.realm,
                    kdc: args.kdc,
                    admin_server: args.admin_server,
                    kpasswd_server: args.kpasswd_server,
                };
                print(&client.create_realm(params).await?)?;
            }
            RealmCommand::Update(args) => {
                let params = RealmParams {
                    realm: args.realm,
                    kdc: args.kdc,
                    admin_server: args.admin_server,
                    kpasswd_server: args.kpasswd_server,
                };
                print(&client.update_realm(args.id, params).await?)?;
            }
            RealmCommand::Delete(args) => client.delete_realm(args.id).await?,
        },
        Command::Keytab(KeytabArguments { command }) => match command {
            KeytabCommand::List(_) => print(&client.keytabs().await?)?,
            KeytabCommand::Create(args) => {
                let file = read_keytab(&args.file).await?;
                print(&client.create_keytab(args.name, file).await?)?;
            }
            KeytabCommand::Update(args) => {
                let file = match &args.file {
                    Some(path) => Some(read_keytab(path).await?),
                    None => None,
                };
                print(&client.update_keytab(args.id, args.name, file).await?)?;
            }
            KeytabCommand::Delete(args) => client.delete_keytab(args.id).await?,
            KeytabCommand::System(_) => print(&client.system_keytab_list().await?)?,
            KeytabCommand::Principals(_) => print(&client.principal_choices().await?)?,
        },
        Command::Settings(args) => {
            let settings = if args.appdefaults.is_some() || args.libdefaults.is_some() {
                client.update_settings(args.appdefaults, args.libdefaults).await?
            } else {
                client.settings().await?
            };
            print(&settings)?;
        }
    };
    Ok(())
}
