use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::domain::DomainError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Pending,
    Approve,
    Reject,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeVote {
    pub node_id: String,
    pub vote: Vote,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voted_at: Option<DateTime<Utc>>,
}

/// Validator set and threshold used to open a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuorumSpec {
    pub nodes: Vec<String>,
    pub required_confirmations: usize,
}

impl QuorumSpec {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.nodes.is_empty() {
            return Err(DomainError::ConfigurationError {
                reason: "quorum needs at least one node".to_string(),
            });
        }
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if node.trim().is_empty() {
                return Err(DomainError::ConfigurationError {
                    reason: "quorum node id is empty".to_string(),
                });
            }
            if !seen.insert(node.as_str()) {
                return Err(DomainError::ConfigurationError {
                    reason: format!("duplicate quorum node: {node}"),
                });
            }
        }
        if self.required_confirmations == 0 || self.required_confirmations > self.nodes.len() {
            return Err(DomainError::ConfigurationError {
                reason: format!(
                    "required_confirmations must be within 1..={}, got {}",
                    self.nodes.len(),
                    self.required_confirmations
                ),
            });
        }
        Ok(())
    }
}

/// Derives the consensus status from the current votes.
pub fn tally(nodes: &[NodeVote], required: usize) -> ConsensusStatus {
    let approvals = nodes.iter().filter(|n| n.vote == Vote::Approve).count();
    let rejections = nodes.iter().filter(|n| n.vote == Vote::Reject).count();
    if approvals >= required {
        return ConsensusStatus::Confirmed;
    }
    if rejections >= required || nodes.len() - rejections < required {
        return ConsensusStatus::Failed;
    }
    ConsensusStatus::Pending
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finalization {
    pub status: ConsensusStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusTransaction {
    pub transaction_id: String,
    pub required_confirmations: usize,
    pub nodes: Vec<NodeVote>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized: Option<Finalization>,
}

impl ConsensusTransaction {
    pub fn open(
        transaction_id: String,
        quorum: &QuorumSpec,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        quorum.validate()?;
        Ok(Self {
            transaction_id,
            required_confirmations: quorum.required_confirmations,
            nodes: quorum
                .nodes
                .iter()
                .map(|node_id| NodeVote {
                    node_id: node_id.clone(),
                    vote: Vote::Pending,
                    voted_at: None,
                })
                .collect(),
            created_at: now,
            finalized: None,
        })
    }

    /// Once finalized the first terminal tally sticks; later votes are only recorded.
    pub fn status(&self) -> ConsensusStatus {
        match &self.finalized {
            Some(f) => f.status,
            None => tally(&self.nodes, self.required_confirmations),
        }
    }

    pub fn approvals(&self) -> usize {
        self.nodes.iter().filter(|n| n.vote == Vote::Approve).count()
    }

    pub fn rejections(&self) -> usize {
        self.nodes.iter().filter(|n| n.vote == Vote::Reject).count()
    }

    pub fn undecided_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.vote == Vote::Pending)
            .map(|n| n.node_id.clone())
            .collect()
    }

    pub fn record_vote(
        &mut self,
        node_id: &str,
        vote: Vote,
        now: DateTime<Utc>,
    ) -> Result<ConsensusStatus, DomainError> {
        if vote == Vote::Pending {
            return Err(DomainError::InvalidArgument {
                field: "vote",
                reason: "must be approve or reject".to_string(),
            });
        }
        let transaction_id = self.transaction_id.clone();
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.node_id == node_id)
            .ok_or_else(|| DomainError::NotFound {
                kind: "node",
                id: node_id.to_string(),
            })?;
        if node.vote != Vote::Pending {
            return Err(DomainError::InvalidState {
                id: transaction_id,
                reason: format!("node {node_id} has already voted"),
            });
        }
        node.vote = vote;
        node.voted_at = Some(now);
        Ok(self.status())
    }

    /// At-most-once finalize hook: yields the outcome only on the call that first
    /// observes a terminal tally.
    pub fn mark_finalized(&mut self, now: DateTime<Utc>) -> Option<ConsensusStatus> {
        if self.finalized.is_some() {
            return None;
        }
        let status = tally(&self.nodes, self.required_confirmations);
        if status == ConsensusStatus::Pending {
            return None;
        }
        self.finalized = Some(Finalization { status, at: now });
        Some(status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ballot {
    pub node_id: String,
    pub vote: Vote,
}

/// Where validator votes come from. Implementations decide the order and value of
/// ballots; the engine only sees the resulting `record_vote` calls.
pub trait VoteSource: Send {
    fn next_ballot(&mut self, undecided: &[String]) -> Option<Ballot>;
}

#[derive(Debug, Default)]
pub struct ScriptedVotes {
    ballots: VecDeque<Ballot>,
}

impl ScriptedVotes {
    pub fn new<I, S>(ballots: I) -> Self
    where
        I: IntoIterator<Item = (S, Vote)>,
        S: Into<String>,
    {
        Self {
            ballots: ballots
                .into_iter()
                .map(|(node_id, vote)| Ballot {
                    node_id: node_id.into(),
                    vote,
                })
                .collect(),
        }
    }
}

impl VoteSource for ScriptedVotes {
    fn next_ballot(&mut self, _undecided: &[String]) -> Option<Ballot> {
        self.ballots.pop_front()
    }
}

#[derive(Debug)]
pub struct RandomVotes<R> {
    rng: R,
    approve_ratio: f64,
}

impl RandomVotes<StdRng> {
    pub fn from_entropy(approve_ratio: f64) -> Self {
        Self::with_rng(StdRng::from_entropy(), approve_ratio)
    }

    pub fn seeded(seed: u64, approve_ratio: f64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), approve_ratio)
    }
}

impl<R: Rng> RandomVotes<R> {
    pub fn with_rng(rng: R, approve_ratio: f64) -> Self {
        Self {
            rng,
            approve_ratio: approve_ratio.clamp(0.0, 1.0),
        }
    }
}

impl<R: Rng + Send> VoteSource for RandomVotes<R> {
    fn next_ballot(&mut self, undecided: &[String]) -> Option<Ballot> {
        if undecided.is_empty() {
            return None;
        }
        let node_id = undecided[self.rng.gen_range(0..undecided.len())].clone();
        let vote = if self.rng.gen_bool(self.approve_ratio) {
            Vote::Approve
        } else {
            Vote::Reject
        };
        Some(Ballot { node_id, vote })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn quorum(n: usize, r: usize) -> QuorumSpec {
        QuorumSpec {
            nodes: (1..=n).map(|i| format!("node{i}")).collect(),
            required_confirmations: r,
        }
    }

    fn votes(vs: &[Vote]) -> Vec<NodeVote> {
        vs.iter()
            .enumerate()
            .map(|(i, v)| NodeVote {
                node_id: format!("node{}", i + 1),
                vote: *v,
                voted_at: None,
            })
            .collect()
    }

    #[test]
    fn tally_follows_threshold_arithmetic() {
        use Vote::*;
        assert_eq!(tally(&votes(&[Pending, Pending, Pending]), 2), ConsensusStatus::Pending);
        assert_eq!(tally(&votes(&[Approve, Approve, Pending]), 2), ConsensusStatus::Confirmed);
        assert_eq!(tally(&votes(&[Reject, Reject, Pending]), 2), ConsensusStatus::Failed);
        // 3 nodes, R=3: one rejection makes three approvals impossible.
        assert_eq!(tally(&votes(&[Reject, Pending, Pending]), 3), ConsensusStatus::Failed);
        assert_eq!(tally(&votes(&[Approve, Reject, Pending]), 2), ConsensusStatus::Pending);
    }

    #[test]
    fn open_rejects_threshold_above_node_count() {
        let err = ConsensusTransaction::open("tx".to_string(), &quorum(3, 4), Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "configuration_error");

        let err = ConsensusTransaction::open("tx".to_string(), &quorum(3, 0), Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "configuration_error");

        let dup = QuorumSpec {
            nodes: vec!["a".to_string(), "a".to_string()],
            required_confirmations: 1,
        };
        assert!(dup.validate().is_err());
    }

    #[test]
    fn votes_are_monotonic() {
        let now = Utc::now();
        let mut tx = ConsensusTransaction::open("tx".to_string(), &quorum(3, 2), now).unwrap();
        tx.record_vote("node1", Vote::Approve, now).unwrap();

        let err = tx.record_vote("node1", Vote::Reject, now).unwrap_err();
        assert_eq!(err.code(), "invalid_state");
        let err = tx.record_vote("node1", Vote::Approve, now).unwrap_err();
        assert_eq!(err.code(), "invalid_state");
        let err = tx.record_vote("node1", Vote::Pending, now).unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        let err = tx.record_vote("node9", Vote::Approve, now).unwrap_err();
        assert_eq!(err.code(), "not_found");

        assert_eq!(tx.nodes[0].vote, Vote::Approve);
    }

    #[test]
    fn finalize_fires_once_and_status_sticks() {
        let now = Utc::now();
        let mut tx = ConsensusTransaction::open("tx".to_string(), &quorum(4, 2), now).unwrap();
        tx.record_vote("node1", Vote::Reject, now).unwrap();
        assert_eq!(tx.mark_finalized(now), None);
        tx.record_vote("node2", Vote::Reject, now).unwrap();
        assert_eq!(tx.mark_finalized(now), Some(ConsensusStatus::Failed));
        assert_eq!(tx.mark_finalized(now), None);

        // Two late approvals would satisfy R on their own, but the outcome is fixed.
        tx.record_vote("node3", Vote::Approve, now).unwrap();
        tx.record_vote("node4", Vote::Approve, now).unwrap();
        assert_eq!(tx.status(), ConsensusStatus::Failed);
        assert_eq!(tx.mark_finalized(now), None);
        assert_eq!(tx.approvals(), 2);
    }

    #[test]
    fn scripted_source_replays_in_order() {
        let mut source = ScriptedVotes::new([("node2", Vote::Approve), ("node1", Vote::Reject)]);
        let undecided = vec!["node1".to_string(), "node2".to_string()];
        assert_eq!(source.next_ballot(&undecided).unwrap().node_id, "node2");
        assert_eq!(source.next_ballot(&undecided).unwrap().vote, Vote::Reject);
        assert_eq!(source.next_ballot(&undecided), None);
    }

    #[test]
    fn random_source_only_picks_undecided_nodes() {
        let mut source = RandomVotes::seeded(7, 1.0);
        let undecided = vec!["node3".to_string()];
        for _ in 0..10 {
            let ballot = source.next_ballot(&undecided).unwrap();
            assert_eq!(ballot.node_id, "node3");
            assert_eq!(ballot.vote, Vote::Approve);
        }
        assert_eq!(source.next_ballot(&[]), None);
    }

    fn arb_case() -> impl Strategy<Value = (usize, Vec<bool>, Vec<usize>)> {
        (1usize..=7).prop_flat_map(|n| {
            (
                1usize..=n,
                proptest::collection::vec(any::<bool>(), n),
                Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
            )
        })
    }

    proptest! {
        /// Property: at every step the tally matches the threshold arithmetic,
        /// whatever order the votes arrive in.
        #[test]
        fn prop_tally_matches_counts_in_any_order((r, approve, order) in arb_case()) {
            let n = approve.len();
            let validators = quorum(n, r);
            let now = Utc::now();
            let mut tx = ConsensusTransaction::open("tx".to_string(), &validators, now).unwrap();

            for idx in order {
                let vote = if approve[idx] { Vote::Approve } else { Vote::Reject };
                tx.record_vote(&format!("node{}", idx + 1), vote, now).unwrap();

                let approvals = tx.approvals();
                let rejections = tx.rejections();
                let expected = if approvals >= r {
                    ConsensusStatus::Confirmed
                } else if rejections >= r || n - rejections < r {
                    ConsensusStatus::Failed
                } else {
                    ConsensusStatus::Pending
                };
                prop_assert_eq!(tally(&tx.nodes, r), expected);
            }
        }

        /// Property: the finalized outcome depends only on the multiset of votes when
        /// approvals and rejections cannot both reach the threshold.
        #[test]
        fn prop_final_outcome_is_order_independent((r, approve, order) in arb_case()) {
            let n = approve.len();
            prop_assume!(2 * r > n);
            let validators = quorum(n, r);
            let now = Utc::now();

            let run = |indices: Vec<usize>| {
                let mut tx = ConsensusTransaction::open("tx".to_string(), &validators, now).unwrap();
                let mut first = None;
                for idx in indices {
                    let vote = if approve[idx] { Vote::Approve } else { Vote::Reject };
                    tx.record_vote(&format!("node{}", idx + 1), vote, now).unwrap();
                    if let Some(status) = tx.mark_finalized(now) {
                        prop_assert!(first.is_none());
                        first = Some(status);
                    }
                }
                Ok(first)
            };

            let shuffled = run(order)?;
            let sequential = run((0..n).collect())?;
            prop_assert_eq!(shuffled, sequential);
            prop_assert!(shuffled.is_some());
        }
    }
}
