use std::{collections::VecDeque, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

use crate::{
    domain::{AccessRequest, RequestStatus},
    id::new_event_id,
};

const EVENT_CHANNEL_CAPACITY: usize = 512;
const MAX_RECENT_EVENTS: usize = 2_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEvent {
    pub event_id: String,
    pub request_id: String,
    pub requester_id: String,
    pub target_id: String,
    /// `None` for the event announcing a newly created request.
    pub from: Option<RequestStatus>,
    pub to: RequestStatus,
    pub occurred_at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn involves(&self, party_id: &str) -> bool {
        self.requester_id == party_id || self.target_id == party_id
    }
}

/// Events for every history entry `after` gained over `before`.
pub fn diff_events(before: Option<&AccessRequest>, after: &AccessRequest) -> Vec<StatusEvent> {
    let (mut from, seen) = match before {
        Some(before) => (Some(before.status), before.history.len()),
        None => (None, 0),
    };
    after
        .history
        .iter()
        .skip(seen)
        .map(|change| {
            let event = StatusEvent {
                event_id: new_event_id(),
                request_id: after.request_id.clone(),
                requester_id: after.requester.id.clone(),
                target_id: after.target.id.clone(),
                from,
                to: change.status,
                occurred_at: change.at,
            };
            from = Some(change.status);
            event
        })
        .collect()
}

/// Fan-out of status changes: a broadcast channel for push subscribers and a bounded
/// backlog for short-poll clients.
#[derive(Clone)]
pub struct StatusEventsHandle {
    recent: Arc<RwLock<VecDeque<StatusEvent>>>,
    events_tx: broadcast::Sender<StatusEvent>,
}

impl Default for StatusEventsHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusEventsHandle {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel::<StatusEvent>(EVENT_CHANNEL_CAPACITY);
        Self {
            recent: Arc::new(RwLock::new(VecDeque::new())),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events_tx.subscribe()
    }

    pub async fn publish(&self, events: Vec<StatusEvent>) {
        if events.is_empty() {
            return;
        }
        {
            let mut recent = self.recent.write().await;
            for event in &events {
                recent.push_back(event.clone());
            }
            while recent.len() > MAX_RECENT_EVENTS {
                recent.pop_front();
            }
        }
        for event in events {
            // No subscribers is fine; pollers read the backlog.
            let _ = self.events_tx.send(event);
        }
    }

    /// Events published after `after` (oldest first). An unknown or evicted cursor
    /// returns the whole backlog so the client can resync.
    pub async fn since(&self, after: Option<&str>, limit: usize) -> Vec<StatusEvent> {
        let recent = self.recent.read().await;
        let start = after
            .and_then(|cursor| recent.iter().position(|e| e.event_id == cursor))
            .map(|idx| idx + 1)
            .unwrap_or(0);
        recent.iter().skip(start).take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::domain::{AccessScope, ApprovalFlavor, DocumentKind, Party};

    fn event(request_id: &str, to: RequestStatus) -> StatusEvent {
        StatusEvent {
            event_id: new_event_id(),
            request_id: request_id.to_string(),
            requester_id: "doc-1".to_string(),
            target_id: "pat-1".to_string(),
            from: Some(RequestStatus::Pending),
            to,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn diff_emits_one_event_per_new_history_entry() {
        let now = Utc::now();
        let before = AccessRequest::new(
            "req-1".to_string(),
            Party {
                id: "doc-1".to_string(),
                name: "Dr. Rao".to_string(),
            },
            Party {
                id: "pat-1".to_string(),
                name: "Mira".to_string(),
            },
            "referral".to_string(),
            BTreeSet::from([DocumentKind::LabReports]),
            AccessScope::View,
            ApprovalFlavor::OwnerApproval,
            now,
        );
        let mut after = before.clone();
        after.advance(RequestStatus::RequestSent, now).unwrap();
        after.advance(RequestStatus::Granted, now).unwrap();

        let events = diff_events(Some(&before), &after);
        let edges: Vec<_> = events.iter().map(|e| (e.from, e.to)).collect();
        assert_eq!(
            edges,
            vec![
                (Some(RequestStatus::Pending), RequestStatus::RequestSent),
                (Some(RequestStatus::RequestSent), RequestStatus::Granted),
            ]
        );

        let created = diff_events(None, &before);
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].from, None);
        assert_eq!(created[0].to, RequestStatus::Pending);
        assert!(events[0].involves("pat-1"));
        assert!(!events[0].involves("doc-9"));
    }

    #[tokio::test]
    async fn since_returns_events_after_cursor() {
        let handle = StatusEventsHandle::new();
        let mut rx = handle.subscribe();

        let first = event("req-1", RequestStatus::RequestSent);
        let second = event("req-1", RequestStatus::Granted);
        handle.publish(vec![first.clone(), second.clone()]).await;

        assert_eq!(rx.recv().await.unwrap(), first);
        assert_eq!(handle.since(None, 10).await.len(), 2);
        assert_eq!(handle.since(Some(&first.event_id), 10).await, vec![second.clone()]);
        assert!(handle.since(Some(&second.event_id), 10).await.is_empty());
        assert_eq!(handle.since(Some("evicted"), 1).await, vec![first]);
    }

    #[tokio::test]
    async fn backlog_is_bounded() {
        let handle = StatusEventsHandle::new();
        let events: Vec<_> = (0..MAX_RECENT_EVENTS + 5)
            .map(|i| event(&format!("req-{i}"), RequestStatus::RequestSent))
            .collect();
        handle.publish(events).await;

        let backlog = handle.since(None, usize::MAX).await;
        assert_eq!(backlog.len(), MAX_RECENT_EVENTS);
        assert_eq!(backlog[0].request_id, "req-5");
    }
}
