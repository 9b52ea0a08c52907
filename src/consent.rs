use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    directory::Directory,
    domain::{
        AccessRequest, AccessScope, ApprovalFlavor, Decision, DocumentKind, DomainError, Identity,
        RequestStatus, Role, validate_documents, validate_reason,
    },
    events::{StatusEventsHandle, diff_events},
    id::{new_request_id, transaction_id_for},
    state::{JsonSnapshotStore, RequestRecord, StoreError},
    tally::{ConsensusStatus, ConsensusTransaction, QuorumSpec, Vote},
};

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub access_window: ChronoDuration,
    pub quorum_defaults: QuorumSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRequest {
    pub target_id: String,
    pub reason: String,
    pub documents: Vec<DocumentKind>,
    #[serde(default)]
    pub scope: AccessScope,
    #[serde(default)]
    pub flavor: ApprovalFlavor,
    /// Overrides the configured validator set for quorum requests. Administrators only.
    #[serde(default)]
    pub quorum: Option<QuorumSpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteReceipt {
    pub request: AccessRequest,
    pub transaction: ConsensusTransaction,
    pub status: ConsensusStatus,
    pub finalized_now: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub failed: usize,
}

type RecordSlot = Arc<Mutex<RequestRecord>>;

/// Owns every access request and its consensus transaction.
///
/// Records are independent: the index lock is only held long enough to clone a
/// record's handle, and each mutation runs under that record's own mutex as a
/// read-validate-persist-commit step. Lock order is record, then snapshot store.
pub struct ConsentService {
    store: Mutex<JsonSnapshotStore>,
    records: RwLock<HashMap<String, RecordSlot>>,
    directory: Arc<dyn Directory>,
    events: StatusEventsHandle,
    access_window: ChronoDuration,
    quorum_defaults: QuorumSpec,
}

impl ConsentService {
    pub fn new(
        store: JsonSnapshotStore,
        directory: Arc<dyn Directory>,
        events: StatusEventsHandle,
        options: ServiceOptions,
    ) -> Result<Self, StoreError> {
        options.quorum_defaults.validate()?;
        if options.access_window <= ChronoDuration::zero() {
            return Err(DomainError::ConfigurationError {
                reason: "access window must be positive".to_string(),
            }
            .into());
        }

        let records = store
            .list_records()
            .into_iter()
            .map(|record| {
                (
                    record.request.request_id.clone(),
                    Arc::new(Mutex::new(record)),
                )
            })
            .collect();

        Ok(Self {
            store: Mutex::new(store),
            records: RwLock::new(records),
            directory,
            events,
            access_window: options.access_window,
            quorum_defaults: options.quorum_defaults,
        })
    }

    pub fn directory(&self) -> &dyn Directory {
        self.directory.as_ref()
    }

    pub fn events(&self) -> &StatusEventsHandle {
        &self.events
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn slot(&self, request_id: &str) -> Result<RecordSlot, StoreError> {
        self.records
            .read()
            .await
            .get(request_id)
            .cloned()
            .ok_or_else(|| {
                DomainError::NotFound {
                    kind: "request",
                    id: request_id.to_string(),
                }
                .into()
            })
    }

    async fn slots(&self) -> Vec<RecordSlot> {
        self.records.read().await.values().cloned().collect()
    }

    async fn commit(
        &self,
        current: &mut RequestRecord,
        next: RequestRecord,
    ) -> Result<(), StoreError> {
        self.store.lock().await.put_record(next.clone())?;
        let events = diff_events(Some(&current.request), &next.request);
        *current = next;
        self.events.publish(events).await;
        Ok(())
    }

    fn may_view(&self, request: &AccessRequest, actor_id: &str) -> bool {
        request.requester.id == actor_id
            || self.directory.may_decide_for(&request.target.id, actor_id)
    }

    fn forbidden(request: &AccessRequest, actor_id: &str) -> StoreError {
        DomainError::Forbidden {
            actor_id: actor_id.to_string(),
            request_id: request.request_id.clone(),
        }
        .into()
    }

    pub async fn create_request(
        &self,
        now: DateTime<Utc>,
        requester: &Identity,
        input: NewRequest,
    ) -> Result<RequestRecord, StoreError> {
        validate_reason(&input.reason)?;
        let documents: BTreeSet<DocumentKind> = input.documents.into_iter().collect();
        validate_documents(&documents)?;
        let target = self.directory.resolve_target(&input.target_id)?;

        let request_id = new_request_id();
        let mut request = AccessRequest::new(
            request_id.clone(),
            requester.party(),
            target,
            input.reason,
            documents,
            input.scope,
            input.flavor,
            now,
        );

        let transaction = match input.flavor {
            ApprovalFlavor::OwnerApproval => {
                if input.quorum.is_some() {
                    return Err(DomainError::InvalidArgument {
                        field: "quorum",
                        reason: "only applies to quorum requests".to_string(),
                    }
                    .into());
                }
                None
            }
            ApprovalFlavor::Quorum => {
                let quorum = match input.quorum {
                    Some(_) if requester.role != Role::Admin => {
                        return Err(DomainError::InvalidArgument {
                            field: "quorum",
                            reason: "only administrators may choose the validator set".to_string(),
                        }
                        .into());
                    }
                    Some(quorum) => quorum,
                    None => self.quorum_defaults.clone(),
                };
                let transaction =
                    ConsensusTransaction::open(transaction_id_for(&request_id), &quorum, now)?;
                // Opening the transaction hands the request to its validators.
                request.advance(RequestStatus::RequestSent, now)?;
                Some(transaction)
            }
        };

        let record = RequestRecord {
            request,
            transaction,
        };
        self.store.lock().await.put_record(record.clone())?;
        self.records
            .write()
            .await
            .insert(request_id.clone(), Arc::new(Mutex::new(record.clone())));
        self.events.publish(diff_events(None, &record.request)).await;

        info!(
            request_id,
            requester_id = record.request.requester.id,
            target_id = record.request.target.id,
            flavor = ?record.request.flavor,
            "access request created"
        );
        Ok(record)
    }

    pub async fn get_request(
        &self,
        now: DateTime<Utc>,
        request_id: &str,
        actor_id: &str,
    ) -> Result<RequestRecord, StoreError> {
        let slot = self.slot(request_id).await?;
        let record = slot.lock().await;
        if !self.may_view(&record.request, actor_id) {
            return Err(Self::forbidden(&record.request, actor_id));
        }
        Ok(RequestRecord {
            request: record.request.view_at(now),
            transaction: record.transaction.clone(),
        })
    }

    /// Requests sent by `requester_id`, newest first.
    pub async fn list_for_requester(
        &self,
        now: DateTime<Utc>,
        requester_id: &str,
    ) -> Vec<AccessRequest> {
        let mut out = Vec::new();
        for slot in self.slots().await {
            let record = slot.lock().await;
            if record.request.requester.id == requester_id {
                out.push(record.request.view_at(now));
            }
        }
        sort_newest_first(&mut out);
        out
    }

    /// Undecided requests `actor_id` may decide: those addressed to it and those
    /// addressed to owners that list it as a delegate. Newest first.
    pub async fn list_pending_for_owner(
        &self,
        now: DateTime<Utc>,
        actor_id: &str,
    ) -> Vec<AccessRequest> {
        let mut out = Vec::new();
        for slot in self.slots().await {
            let record = slot.lock().await;
            if self.directory.may_decide_for(&record.request.target.id, actor_id)
                && !record.request.effective_status(now).is_terminal()
            {
                out.push(record.request.view_at(now));
            }
        }
        sort_newest_first(&mut out);
        out
    }

    /// Records that the request reached its owner. Repeated deliveries are no-ops.
    pub async fn mark_delivered(
        &self,
        now: DateTime<Utc>,
        request_id: &str,
        actor_id: &str,
    ) -> Result<AccessRequest, StoreError> {
        let slot = self.slot(request_id).await?;
        let mut record = slot.lock().await;
        if !self.directory.may_decide_for(&record.request.target.id, actor_id) {
            return Err(Self::forbidden(&record.request, actor_id));
        }
        if record.request.status != RequestStatus::Pending {
            debug!(
                request_id,
                status = record.request.status.as_str(),
                "delivery already recorded"
            );
            return Ok(record.request.view_at(now));
        }

        let mut next = record.clone();
        next.request.advance(RequestStatus::RequestSent, now)?;
        self.commit(&mut record, next).await?;
        info!(request_id, "access request delivered to owner");
        Ok(record.request.view_at(now))
    }

    /// Owner (or delegate) decision. Deciding a request that was never marked
    /// delivered records the implied delivery first.
    pub async fn transition(
        &self,
        now: DateTime<Utc>,
        request_id: &str,
        actor_id: &str,
        decision: Decision,
    ) -> Result<AccessRequest, StoreError> {
        let slot = self.slot(request_id).await?;
        let mut record = slot.lock().await;
        if !self.directory.may_decide_for(&record.request.target.id, actor_id) {
            return Err(Self::forbidden(&record.request, actor_id));
        }
        let status = record.request.effective_status(now);
        if status.is_terminal() {
            return Err(DomainError::already_resolved(request_id, status).into());
        }

        let mut next = record.clone();
        if next.request.status == RequestStatus::Pending {
            next.request.advance(RequestStatus::RequestSent, now)?;
        }
        next.request.advance(decision.target_status(), now)?;
        if decision == Decision::Grant {
            next.request.expiry_date = Some(now + self.access_window);
        }
        self.commit(&mut record, next).await?;

        info!(
            request_id,
            actor_id,
            decision = ?decision,
            "access request decided"
        );
        Ok(record.request.view_at(now))
    }

    pub async fn get_transaction(
        &self,
        now: DateTime<Utc>,
        request_id: &str,
        actor_id: &str,
    ) -> Result<ConsensusTransaction, StoreError> {
        self.get_request(now, request_id, actor_id)
            .await?
            .transaction
            .ok_or_else(|| missing_transaction(request_id))
    }

    /// Validators whose vote can still change the outcome; empty once finalized.
    pub async fn undecided_validators(&self, request_id: &str) -> Result<Vec<String>, StoreError> {
        let slot = self.slot(request_id).await?;
        let record = slot.lock().await;
        let transaction = record
            .transaction
            .as_ref()
            .ok_or_else(|| missing_transaction(request_id))?;
        if transaction.finalized.is_some() {
            return Ok(Vec::new());
        }
        Ok(transaction.undecided_nodes())
    }

    /// Records a vote cast by an authenticated validator identity under its own id.
    pub async fn cast_vote_as(
        &self,
        now: DateTime<Utc>,
        request_id: &str,
        voter: &Identity,
        vote: Vote,
    ) -> Result<VoteReceipt, StoreError> {
        if voter.role != Role::Validator {
            return Err(DomainError::Forbidden {
                actor_id: voter.id.clone(),
                request_id: request_id.to_string(),
            }
            .into());
        }
        self.cast_vote(now, request_id, &voter.id, vote).await
    }

    pub async fn cast_vote(
        &self,
        now: DateTime<Utc>,
        request_id: &str,
        node_id: &str,
        vote: Vote,
    ) -> Result<VoteReceipt, StoreError> {
        let slot = self.slot(request_id).await?;
        let mut record = slot.lock().await;
        if record.transaction.is_none() {
            return Err(missing_transaction(request_id));
        }

        let mut next = record.clone();
        if let Some(transaction) = next.transaction.as_mut() {
            transaction.record_vote(node_id, vote, now)?;
        }
        let finalized = self.apply_finalize(&mut next, now)?;
        self.commit(&mut record, next).await?;

        debug!(request_id, node_id, vote = ?vote, "vote recorded");
        let transaction = record
            .transaction
            .clone()
            .ok_or_else(|| missing_transaction(request_id))?;
        Ok(VoteReceipt {
            request: record.request.view_at(now),
            status: transaction.status(),
            transaction,
            finalized_now: finalized.is_some(),
        })
    }

    /// Re-evaluates the tally and applies the finalize side effect if it has not run
    /// yet. Returns whether this call finalized the transaction.
    pub async fn finalize(&self, now: DateTime<Utc>, request_id: &str) -> Result<bool, StoreError> {
        let slot = self.slot(request_id).await?;
        let mut record = slot.lock().await;
        if record.transaction.is_none() {
            return Err(missing_transaction(request_id));
        }

        let mut next = record.clone();
        match self.apply_finalize(&mut next, now)? {
            Some(_) => {
                self.commit(&mut record, next).await?;
                Ok(true)
            }
            None => {
                debug!(request_id, "finalize skipped: not terminal or already finalized");
                Ok(false)
            }
        }
    }

    fn apply_finalize(
        &self,
        record: &mut RequestRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<ConsensusStatus>, DomainError> {
        let Some(transaction) = record.transaction.as_mut() else {
            return Ok(None);
        };
        let Some(outcome) = transaction.mark_finalized(now) else {
            return Ok(None);
        };

        let request = &mut record.request;
        let target = match outcome {
            ConsensusStatus::Confirmed => RequestStatus::Granted,
            ConsensusStatus::Failed => RequestStatus::Denied,
            ConsensusStatus::Pending => return Ok(None),
        };
        if request.status.is_terminal() {
            debug!(
                request_id = request.request_id,
                status = request.status.as_str(),
                outcome = ?outcome,
                "quorum outcome arrived after the request was resolved"
            );
            return Ok(Some(outcome));
        }
        if request.status == RequestStatus::Pending {
            request.advance(RequestStatus::RequestSent, now)?;
        }
        request.advance(target, now)?;
        if target == RequestStatus::Granted {
            request.expiry_date = Some(now + self.access_window);
        }
        info!(
            request_id = request.request_id,
            outcome = ?outcome,
            "quorum finalized"
        );
        Ok(Some(outcome))
    }

    /// Expires every grant whose window has passed. Storage failures are logged and
    /// the affected records are retried on the next pass.
    pub async fn run_expiry_sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        for slot in self.slots().await {
            let mut record = slot.lock().await;
            let due = record.request.status == RequestStatus::Granted
                && record.request.expiry_date.is_some_and(|expiry| now > expiry);
            if !due {
                continue;
            }

            let request_id = record.request.request_id.clone();
            let mut next = record.clone();
            if let Err(err) = next.request.advance(RequestStatus::Expired, now) {
                warn!(request_id, %err, "expiry sweep: illegal transition");
                report.failed += 1;
                continue;
            }
            match self.commit(&mut record, next).await {
                Ok(()) => {
                    info!(request_id, "access grant expired");
                    report.expired += 1;
                }
                Err(err) => {
                    warn!(request_id, %err, "expiry sweep: persist failed, retrying next pass");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Whether `requester_id` currently holds an unexpired grant on `owner_id`'s
    /// documents of the given kind and scope.
    pub async fn has_access(
        &self,
        now: DateTime<Utc>,
        requester_id: &str,
        owner_id: &str,
        document: DocumentKind,
        scope: AccessScope,
    ) -> bool {
        for slot in self.slots().await {
            let record = slot.lock().await;
            let request = &record.request;
            if request.requester.id == requester_id
                && request.target.id == owner_id
                && request.scope == scope
                && request.documents.contains(&document)
                && request.effective_status(now) == RequestStatus::Granted
            {
                return true;
            }
        }
        false
    }
}

fn missing_transaction(request_id: &str) -> StoreError {
    DomainError::NotFound {
        kind: "transaction",
        id: transaction_id_for(request_id),
    }
    .into()
}

fn sort_newest_first(requests: &mut [AccessRequest]) {
    requests.sort_by(|a, b| {
        b.request_date
            .cmp(&a.request_date)
            .then_with(|| b.request_id.cmp(&a.request_id))
    });
}
