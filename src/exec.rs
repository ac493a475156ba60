/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::trace::*;

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use snafu::prelude::*;
use std::{
    ffi::OsStr,
    io,
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{ChildStdin, Command},
    time,
};

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to spawn `{tool}`"))]
    Spawn { tool: String, source: io::Error },
    #[snafu(display("Failed to communicate with `{tool}`"))]
    Communicate { tool: String, source: io::Error },
    #[snafu(display("`{tool}` timed out after {}", timeout.secs()))]
    Timeout { tool: String, timeout: Duration },
    #[snafu(display("`{tool}` failed: {stderr}"))]
    Failure { tool: String, stderr: String },
}

#[derive(Debug)]
pub struct Output {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Kills the whole process group of a spawned tool unless disarmed.
///
/// Tools run in their own group so that helpers they fork (e.g. DNS lookups
/// spawned by `kinit`) die with them when a timeout fires or the awaiting
/// future is dropped.
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            if let Err(error) = signal::killpg(pgid, Signal::SIGKILL) {
                tracing::debug!(%error, %pgid, "could not kill process group");
            }
        }
    }

    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// An external tool invocation, always bounded by a timeout.
pub struct Tool<'a> {
    name: String,
    cmd: Command,
    input: Option<&'a [u8]>,
}

impl<'a> Tool<'a> {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        let program = program.as_ref();
        let name = Path::new(program)
            .file_name()
            .unwrap_or(program)
            .to_string_lossy()
            .into_owned();

        Self {
            name,
            cmd: Command::new(program),
            input: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.cmd.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.cmd.args(args);
        self
    }

    /// Data written to the tool's stdin, which is then closed. Never logged.
    pub fn input(mut self, input: &'a [u8]) -> Self {
        self.input = Some(input);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the tool and fails if it exits with a non-zero status.
    pub async fn run(self, timeout: Duration) -> Result<Output, Error> {
        let tool = self.name.clone();
        let output = self.output(timeout).await?;

        if output.success() {
            Ok(output)
        } else {
            Failure {
                tool,
                stderr: output.stderr.trim(),
            }
            .fail()
        }
    }

    /// Runs the tool and returns its output regardless of the exit status.
    pub async fn output(mut self, timeout: Duration) -> Result<Output, Error> {
        let tool = self.name;

        self.cmd
            .stdin(if self.input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        unsafe {
            self.cmd.pre_exec(|| {
                close_fds::set_fds_cloexec(3, &[]);
                Ok(())
            })
        };

        tracing::debug!(%tool, timeout = %timeout.secs(), "running external tool");
        let mut child = self.cmd.spawn().context(Spawn { tool: &tool })?;
        let mut group = ProcessGroup(child.id().map(|pid| Pid::from_raw(pid as i32)));

        let (stdin, stdout, stderr) = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let input = self.input;

        let communicate = async {
            let (fed, out, err, status) = tokio::join!(feed(stdin, input), drain(stdout), drain(stderr), child.wait());
            fed?;
            Ok::<_, io::Error>(Output {
                status: status?,
                stdout: String::from_utf8_lossy(&out?).into_owned(),
                stderr: String::from_utf8_lossy(&err?).into_owned(),
            })
        };

        let res = time::timeout(timeout, communicate).await;
        match res {
            Ok(res) => {
                group.disarm();
                let output = res.context(Communicate { tool: &tool })?;
                tracing::debug!(%tool, status = ?output.status.code(), "external tool exited");
                Ok(output)
            }
            Err(_) => {
                tracing::warn!(%tool, timeout = %timeout.secs(), "external tool timed out, killing process group");
                group.kill();
                if let Err(error) = child.wait().await {
                    tracing::debug!(%tool, error = error.chain(), "could not reap timed out process");
                }
                Timeout { tool, timeout }.fail()
            }
        }
    }
}

async fn feed(pipe: Option<ChildStdin>, input: Option<&[u8]>) -> io::Result<()> {
    let (Some(mut pipe), Some(input)) = (pipe, input) else {
        return Ok(());
    };
    match pipe.write_all(input).await {
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        res => res,
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}
