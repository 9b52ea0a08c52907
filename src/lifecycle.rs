use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

use crate::{consent::ConsentService, domain::DomainError, state::StoreError, tally::VoteSource};

#[derive(Debug, Clone)]
pub struct SweeperHandle {
    shutdown: Arc<tokio::sync::Mutex<Option<tokio::sync::oneshot::Sender<()>>>>,
}

impl SweeperHandle {
    pub async fn shutdown(&self) {
        let tx = self.shutdown.lock().await.take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}

/// Periodically moves lapsed grants to `expired` so the stored status catches up
/// with what reads already report.
pub fn spawn_expiry_sweeper(service: Arc<ConsentService>, every: Duration) -> SweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = SweeperHandle {
        shutdown: Arc::new(tokio::sync::Mutex::new(Some(shutdown_tx))),
    };

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = service.run_expiry_sweep_at(Utc::now()).await;
                    if report.expired > 0 || report.failed > 0 {
                        debug!(expired = report.expired, failed = report.failed, "expiry sweep");
                    }
                }
                _ = &mut shutdown_rx => break,
            }
        }
    });

    handle
}

/// Drives a request's transaction from `source` until it is finalized or the source
/// runs dry. Returns the number of votes recorded.
pub async fn feed_votes(
    service: &ConsentService,
    request_id: &str,
    source: &mut dyn VoteSource,
    delay: Duration,
) -> anyhow::Result<usize> {
    let mut recorded = 0;
    loop {
        let undecided = service.undecided_validators(request_id).await?;
        if undecided.is_empty() {
            break;
        }
        let Some(ballot) = source.next_ballot(&undecided) else {
            break;
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match service
            .cast_vote(Utc::now(), request_id, &ballot.node_id, ballot.vote)
            .await
        {
            Ok(receipt) => {
                recorded += 1;
                debug!(
                    request_id,
                    node_id = ballot.node_id,
                    status = ?receipt.status,
                    "validator vote"
                );
            }
            Err(StoreError::Domain(err @ DomainError::InvalidState { .. })) => {
                debug!(request_id, node_id = ballot.node_id, %err, "validator vote skipped");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(recorded)
}

pub fn spawn_validator_feed(
    service: Arc<ConsentService>,
    request_id: String,
    mut source: Box<dyn VoteSource>,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match feed_votes(&service, &request_id, source.as_mut(), delay).await {
            Ok(votes) => debug!(request_id, votes, "validator feed finished"),
            Err(err) => warn!(request_id, %err, "validator feed failed"),
        }
    })
}
