/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use argh::FromArgs;
use std::path::PathBuf;
use tokio::runtime;

const MAX_CONN: usize = 64;
const NUM_WORKERS: usize = 4;

#[derive(FromArgs)]
/// Kerberos ticket lifecycle manager server.
struct Arguments {
    /// number of worker threads
    #[argh(option, short = 'w', default = "NUM_WORKERS")]
    workers: usize,
    /// address to listen on
    #[argh(option, short = 'l')]
    listen: Option<String>,
    /// configuration file, without its extension
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
}

async fn run(args: Arguments) -> Result<(), krbmgr::Error> {
    let config = args.config.unwrap_or_else(krbmgr::conf::config_path);
    let server = krbmgr::new_server(args.listen, MAX_CONN, config).await?;
    server.run().await;
    Ok(())
}

#[snafu::report]
fn main() -> Result<(), krbmgr::Error> {
    krbmgr::setup_logging()?;

    let main_args: Arguments = argh::from_env();

    runtime::Builder::new_multi_thread()
        .worker_threads(main_args.workers)
        .enable_all()
        .build()?
        .block_on(run(main_args))
}
