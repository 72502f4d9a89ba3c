//! Core governance domain types shared across the pipeline.
//!
//! A [`Proposal`] is the observed state of one governance proposal on one
//! chain, keyed by `(chain_id, proposal_id)`. Its [`Fingerprint`] content
//! hash identifies a unique analyzable snapshot: any change to the status
//! or title produces a new fingerprint and therefore a fresh analysis.

pub mod client;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle status of a governance proposal.
///
/// Transitions only move forward along `DEPOSIT < VOTING < terminal`;
/// a provider re-reporting a terminal proposal as non-terminal is treated
/// as a transient read error by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Deposit,
    Voting,
    Passed,
    Rejected,
    Failed,
}

impl ProposalStatus {
    /// Terminal statuses are no longer re-polled for changes.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Rejected | Self::Failed)
    }

    /// Position in the forward partial order. Terminal statuses share the
    /// top rank: none of them can progress further.
    pub fn rank(self) -> u8 {
        match self {
            Self::Deposit => 0,
            Self::Voting => 1,
            Self::Passed | Self::Rejected | Self::Failed => 2,
        }
    }

    /// Parse the Cosmos SDK REST status string.
    pub fn from_sdk(s: &str) -> Option<Self> {
        match s {
            "PROPOSAL_STATUS_DEPOSIT_PERIOD" => Some(Self::Deposit),
            "PROPOSAL_STATUS_VOTING_PERIOD" => Some(Self::Voting),
            "PROPOSAL_STATUS_PASSED" => Some(Self::Passed),
            "PROPOSAL_STATUS_REJECTED" => Some(Self::Rejected),
            "PROPOSAL_STATUS_FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deposit => write!(f, "DEPOSIT"),
            Self::Voting => write!(f, "VOTING"),
            Self::Passed => write!(f, "PASSED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Identity of a monitored chain. Immutable within a process run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDescriptor {
    /// Stable chain ID, e.g. `osmosis-1`.
    pub chain_id: String,
    /// Human name used in notification subjects, e.g. `Osmosis`.
    pub name: String,
    /// REST endpoints, tried round-robin.
    pub endpoints: Vec<String>,
}

/// Full observed state of a governance proposal on one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub chain_id: String,
    pub proposal_id: u64,
    pub title: String,
    pub description: String,
    pub status: ProposalStatus,
    pub voting_start: Option<DateTime<Utc>>,
    pub voting_end: Option<DateTime<Utc>>,
    pub submit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub proposer: String,
    /// Content type tag from the chain, e.g. `/cosmos.gov.v1beta1.TextProposal`.
    #[serde(default)]
    pub type_tag: String,
}

impl Proposal {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.chain_id, self.proposal_id, &self.title, self.status)
    }
}

/// Lightweight listing entry: enough to decide whether a full fetch is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalSummary {
    pub proposal_id: u64,
    pub status: ProposalStatus,
}

/// Content hash identifying a unique analyzable proposal snapshot.
///
/// SHA-256 over `(chain_id, proposal_id, title, status)`, truncated to
/// 16 bytes (128 bits). Title or status changes yield a new fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub fn of(chain_id: &str, proposal_id: u64, title: &str, status: ProposalStatus) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(chain_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(proposal_id.to_be_bytes());
        hasher.update(title.as_bytes());
        hasher.update([0u8]);
        hasher.update(status.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        Self(out)
    }

    /// Hex form, used as the storage key.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom("invalid fingerprint hex"))
    }
}

/// Change events emitted by the watcher.
#[derive(Debug, Clone)]
pub enum ProposalEvent {
    /// First observation of this `(chain, proposal)` pair.
    New(Proposal),
    /// One of status / title / description / voting_end differs from the
    /// last stored state.
    Changed {
        proposal: Proposal,
        old_status: ProposalStatus,
    },
}

impl ProposalEvent {
    pub fn proposal(&self) -> &Proposal {
        match self {
            Self::New(p) => p,
            Self::Changed { proposal, .. } => proposal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(title: &str, status: ProposalStatus) -> Proposal {
        Proposal {
            chain_id: "osmosis-1".into(),
            proposal_id: 848,
            title: title.into(),
            description: "raise taker fees".into(),
            status,
            voting_start: None,
            voting_end: None,
            submit_time: None,
            proposer: String::new(),
            type_tag: String::new(),
        }
    }

    #[test]
    fn fingerprint_is_stable_for_identical_inputs() {
        let a = proposal("Increase taker fees", ProposalStatus::Voting);
        let mut b = a.clone();
        // description is not part of the fingerprint
        b.description = "different body".into();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_each_keyed_field() {
        let base = proposal("Increase taker fees", ProposalStatus::Voting);
        let f = base.fingerprint();

        let mut other = base.clone();
        other.title = "Decrease taker fees".into();
        assert_ne!(f, other.fingerprint());

        let mut other = base.clone();
        other.status = ProposalStatus::Passed;
        assert_ne!(f, other.fingerprint());

        let mut other = base.clone();
        other.proposal_id = 849;
        assert_ne!(f, other.fingerprint());

        let mut other = base.clone();
        other.chain_id = "cosmoshub-4".into();
        assert_ne!(f, other.fingerprint());
    }

    #[test]
    fn fingerprint_hex_round_trip() {
        let f = proposal("x", ProposalStatus::Deposit).fingerprint();
        assert_eq!(Fingerprint::from_hex(&f.to_hex()), Some(f));
        assert_eq!(f.to_hex().len(), 32);
    }

    #[test]
    fn status_order_is_forward_only() {
        assert!(ProposalStatus::Deposit.rank() < ProposalStatus::Voting.rank());
        assert!(ProposalStatus::Voting.rank() < ProposalStatus::Passed.rank());
        assert_eq!(
            ProposalStatus::Passed.rank(),
            ProposalStatus::Failed.rank()
        );
        assert!(!ProposalStatus::Voting.is_terminal());
        assert!(ProposalStatus::Rejected.is_terminal());
    }

    #[test]
    fn sdk_status_strings_parse() {
        assert_eq!(
            ProposalStatus::from_sdk("PROPOSAL_STATUS_VOTING_PERIOD"),
            Some(ProposalStatus::Voting)
        );
        assert_eq!(ProposalStatus::from_sdk("PROPOSAL_STATUS_UNSPECIFIED"), None);
    }
}
