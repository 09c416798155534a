//! Bounded fan-out of probes over a working set of records.
//!
//! At most `concurrency` probes are in flight. Each probe has its own
//! timeout, results are applied through the directory task as they arrive,
//! and cancelling the token drops whatever is still pending.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use shared::record::UpdateTicket;
use shared::types::{ProbeReport, ServerId, UpdateMode};
use crate::directory::DirectoryHandle;
use crate::error::{DirectoryError, ProbeError};
use crate::manager::DirectoryStatus;
use crate::probe::StateProbe;

type ProbeFuture<'a> = BoxFuture<'a, (UpdateTicket, Result<ProbeReport, ProbeError>)>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub completed: usize,
    pub failed: usize,
    /// Targets that vanished from the directory before their probe started.
    pub skipped: usize,
}

pub struct RefreshEngine {
    probe: Arc<dyn StateProbe>,
    concurrency: usize,
    timeout: Duration,
}

impl RefreshEngine {
    pub fn new(probe: Arc<dyn StateProbe>, concurrency: usize, timeout: Duration) -> Self {
        Self {
            probe,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    /// Probe `targets` in order with bounded concurrency.
    ///
    /// Progress goes to `status` when given: `pinging` is raised for the
    /// whole sweep and `pinged`/`sweep_done` grow by one per applied result.
    pub async fn sweep(
        &self,
        directory: &DirectoryHandle,
        targets: Vec<ServerId>,
        mode: UpdateMode,
        cancel: &CancellationToken,
        status: Option<&watch::Sender<DirectoryStatus>>,
    ) -> Result<SweepSummary, DirectoryError> {
        if let Some(status) = status {
            status.send_modify(|s| {
                s.pinging = true;
                s.sweep_total = targets.len();
                s.sweep_done = 0;
            });
        }

        let result = self.run(directory, targets, mode, cancel, status).await;

        if let Some(status) = status {
            status.send_modify(|s| s.pinging = false);
        }
        result
    }

    async fn run(
        &self,
        directory: &DirectoryHandle,
        targets: Vec<ServerId>,
        mode: UpdateMode,
        cancel: &CancellationToken,
        status: Option<&watch::Sender<DirectoryStatus>>,
    ) -> Result<SweepSummary, DirectoryError> {
        let mut queue = targets.into_iter();
        let mut in_flight: FuturesUnordered<ProbeFuture<'_>> = FuturesUnordered::new();
        let mut pending: HashMap<(ServerId, u64), UpdateTicket> = HashMap::new();
        let mut summary = SweepSummary::default();

        loop {
            while in_flight.len() < self.concurrency && !cancel.is_cancelled() {
                let Some(id) = queue.next() else { break };
                match directory.begin_update(id, mode).await? {
                    Some(ticket) => {
                        pending.insert((ticket.id.clone(), ticket.seq), ticket.clone());
                        in_flight.push(self.probe_one(ticket));
                    }
                    None => summary.skipped += 1,
                }
            }

            if in_flight.is_empty() {
                if cancel.is_cancelled() {
                    return Err(DirectoryError::Cancelled);
                }
                break;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    drop(in_flight);
                    directory.abandon(pending.into_values().collect()).await?;
                    return Err(DirectoryError::Cancelled);
                }

                Some((ticket, outcome)) = in_flight.next() => {
                    pending.remove(&(ticket.id.clone(), ticket.seq));
                    if let Err(e) = &outcome {
                        tracing::debug!("Probe of {} failed: {}", ticket.id, e);
                        summary.failed += 1;
                    }
                    directory.apply(ticket, outcome.map_err(|e| e.reason())).await?;
                    summary.completed += 1;
                    if let Some(status) = status {
                        status.send_modify(|s| {
                            s.pinged += 1;
                            s.sweep_done += 1;
                        });
                    }
                }
            }
        }

        Ok(summary)
    }

    fn probe_one(&self, ticket: UpdateTicket) -> ProbeFuture<'_> {
        Box::pin(async move {
            let outcome = match tokio::time::timeout(self.timeout, self.probe.probe(ticket.address, ticket.mode)).await {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout),
            };
            (ticket, outcome)
        })
    }
}
