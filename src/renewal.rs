/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Ticket renewal decisions and ownership of the background renewal task.

use crate::krb::{Ticket, TicketFlags};

use std::{
    fmt,
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

const MIN_SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    NoTicket,
    Expired,
    NotRenewable,
    RenewDeadline,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::NoTicket => "no ticket-granting ticket",
            Self::Expired => "ticket expired",
            Self::NotRenewable => "ticket not renewable",
            Self::RenewDeadline => "renewable lifetime almost exhausted",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do for at least one check interval.
    Wait,
    Renew,
    Reacquire(Reason),
}

/// Decides what to do with the ticket-granting ticket at time `now`.
pub fn evaluate(tgt: Option<&Ticket>, now: i64, interval: Duration) -> Action {
    let Some(tgt) = tgt else {
        return Action::Reacquire(Reason::NoTicket);
    };
    let interval = interval.as_secs() as i64;
    let remaining = tgt.expires - now;

    if remaining < 0 {
        Action::Reacquire(Reason::Expired)
    } else if remaining > interval {
        Action::Wait
    } else if !tgt.flags.contains(TicketFlags::RENEWABLE) || tgt.renew_until == 0 {
        Action::Reacquire(Reason::NotRenewable)
    } else if now + 2 * interval > tgt.renew_until {
        Action::Reacquire(Reason::RenewDeadline)
    } else {
        Action::Renew
    }
}

/// Delay before acting again on a ticket that was just renewed or acquired
/// but still falls inside the renewal window.
pub fn settle_delay(tgt: Option<&Ticket>, now: i64, interval: Duration) -> Duration {
    match tgt.map(|t| t.expires - now) {
        Some(remaining) if remaining > 0 => Duration::from_secs(remaining as u64 / 2).max(MIN_SETTLE_DELAY).min(interval),
        _ => interval,
    }
}

struct RenewalTask {
    id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owner of the single background renewal task.
#[derive(Default)]
pub struct Supervisor {
    task: Mutex<Option<RenewalTask>>,
    spawned: AtomicU64,
}

impl Supervisor {
    /// Spawns the renewal task unless one is alive, returns the id of the running task.
    pub async fn ensure_running<F, Fut>(&self, spawn: F) -> u64
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut task = self.task.lock().await;

        if let Some(running) = task.as_ref().filter(|t| !t.handle.is_finished()) {
            tracing::debug!(task = running.id, "renewal task already running");
            return running.id;
        }

        let id = self.spawned.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let handle = tokio::spawn(spawn(token.clone()));

        tracing::info!(task = id, "started kerberos ticket renewal task");
        *task = Some(RenewalTask { id, token, handle });
        id
    }

    /// Id of the renewal task if it is still alive.
    pub async fn current(&self) -> Option<u64> {
        self.task
            .lock()
            .await
            .as_ref()
            .filter(|t| !t.handle.is_finished())
            .map(|t| t.id)
    }

    /// Cancels and joins the renewal task, returns whether one was running.
    pub async fn stop(&self) -> bool {
        let Some(task) = self.task.lock().await.take() else {
            return false;
        };
        let alive = !task.handle.is_finished();

        task.token.cancel();
        if let Err(error) = task.handle.await {
            tracing::warn!(%error, task = task.id, "renewal task did not exit cleanly");
        }
        if alive {
            tracing::info!(task = task.id, "stopped kerberos ticket renewal task");
        }
        alive
    }
}
