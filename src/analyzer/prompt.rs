//! Deterministic prompt construction.
//!
//! Three layers: a fixed system preamble (task, output schema, vocabulary),
//! a category/chain layer (keyword classifier + static chain background),
//! and the proposal plus subscriber policy verbatim. The same
//! (proposal, policy) pair always renders to the same string.

use crate::chain::Proposal;
use crate::subscribers::Policy;

/// Proposal category, chosen by keyword matching against title and
/// description. Exactly one category per proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    ParameterChange,
    CommunityPoolSpend,
    Upgrade,
    Ibc,
    Text,
    Other,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParameterChange => "PARAMETER_CHANGE",
            Self::CommunityPoolSpend => "COMMUNITY_POOL_SPEND",
            Self::Upgrade => "UPGRADE",
            Self::Ibc => "IBC",
            Self::Text => "TEXT",
            Self::Other => "OTHER",
        }
    }

    /// Analysis guidance injected for the category.
    fn guidance(self) -> &'static str {
        match self {
            Self::ParameterChange => {
                "Focus on economic and protocol parameter impact: inflation, fees, \
                 deposits, quorum and threshold changes, validator and delegator economics."
            }
            Self::CommunityPoolSpend => {
                "Focus on fund allocation: purpose, recipient credibility, deliverables, \
                 accountability, and community pool sustainability."
            }
            Self::Upgrade => {
                "Focus on upgrade risk: code maturity, testing coverage, validator \
                 coordination, downtime exposure, and rollback paths."
            }
            Self::Ibc => {
                "Focus on cross-chain effects: IBC client and channel safety, bridge \
                 exposure, and interchain security implications."
            }
            Self::Text => {
                "This is a signaling proposal with no direct on-chain effect. Focus on \
                 precedent, governance direction, and community alignment."
            }
            Self::Other => {
                "Provide general governance analysis covering security, economic, and \
                 governance aspects of the proposal."
            }
        }
    }
}

/// Classify a proposal into exactly one category. The type tag is the
/// strongest signal; keyword buckets are checked in a fixed order so the
/// result is stable for a given proposal.
pub fn classify(proposal: &Proposal) -> Category {
    let tag = proposal.type_tag.to_lowercase();
    if tag.contains("softwareupgrade") {
        return Category::Upgrade;
    }
    if tag.contains("parameterchange") {
        return Category::ParameterChange;
    }
    if tag.contains("communitypoolspend") {
        return Category::CommunityPoolSpend;
    }
    if tag.contains("ibc") || tag.contains("clientupdate") {
        return Category::Ibc;
    }
    if tag.contains("textproposal") {
        return Category::Text;
    }

    let haystack = format!(
        "{} {}",
        proposal.title.to_lowercase(),
        proposal.description.to_lowercase()
    );
    let matches_any = |keywords: &[&str]| keywords.iter().any(|k| haystack.contains(k));

    if matches_any(&["upgrade", "software version", "halt height", "migration"]) {
        Category::Upgrade
    } else if matches_any(&["parameter", "inflation", "fee", "quorum", "threshold", "deposit"]) {
        Category::ParameterChange
    } else if matches_any(&["community pool", "community spend", "grant", "funding", "spend"]) {
        Category::CommunityPoolSpend
    } else if matches_any(&["ibc", "interchain", "relayer", "channel"]) {
        Category::Ibc
    } else if matches_any(&["signaling", "signalling", "text proposal"]) {
        Category::Text
    } else {
        Category::Other
    }
}

/// Static background for chains where the generic context is too thin.
fn chain_context(chain_id: &str, chain_name: &str) -> String {
    match chain_id {
        "cosmoshub-4" => "Cosmos Hub is the first chain of the Cosmos Network and the \
             central IBC hub. ATOM proof-of-stake; minimal smart contract surface. \
             Governance centers on network security, IBC protocol upgrades, validator \
             set management, and ATOM economics. Its hub role makes security \
             regressions unusually costly."
            .to_string(),
        "osmosis-1" => "Osmosis is the main DEX and AMM protocol of the Cosmos ecosystem. \
             OSMO token, superfluid staking, governance-driven tokenomics. Governance \
             centers on DEX parameters, liquidity incentives, and fee structures. \
             DeFi protocol risk and liquidity management dominate."
            .to_string(),
        "juno-1" => "Juno is a CosmWasm smart contract platform with a developer-focused \
             ecosystem. Governance centers on contract parameters, developer \
             incentives, and network upgrades; smart contract security is the primary \
             risk surface."
            .to_string(),
        _ => format!(
            "{chain_name} is a Cosmos SDK chain with Tendermint consensus and IBC \
             compatibility. Governance covers network parameters, validator \
             management, and protocol upgrades; standard Cosmos SDK risk \
             considerations apply."
        ),
    }
}

const SYSTEM_PREAMBLE: &str = "You are a blockchain governance analyst producing voting \
recommendations for enterprise subscribers. Analyze the proposal below against the \
subscriber's policy and respond ONLY with a single JSON object with exactly these fields:\n\
{\n\
  \"recommendation\": \"APPROVE\" | \"REJECT\" | \"ABSTAIN\",\n\
  \"confidence\": <number between 0.0 and 1.0>,\n\
  \"reasoning\": \"<2-4 sentence justification grounded in the proposal content>\",\n\
  \"risk_assessment\": \"LOW\" | \"MEDIUM\" | \"HIGH\"\n\
}\n\
You may add further JSON fields (key_considerations, stakeholder_impact, \
implementation_assessment) but the four above are mandatory.";

/// Render the full prompt for one (proposal, policy) pair.
pub fn build_prompt(proposal: &Proposal, chain_name: &str, policy: &Policy) -> String {
    let category = classify(proposal);
    let mut out = String::with_capacity(2048);

    out.push_str(SYSTEM_PREAMBLE);

    out.push_str("\n\nCATEGORY: ");
    out.push_str(category.as_str());
    out.push('\n');
    out.push_str(category.guidance());

    out.push_str("\n\nCHAIN CONTEXT:\n");
    out.push_str(&chain_context(&proposal.chain_id, chain_name));

    out.push_str("\n\nPROPOSAL:\n");
    out.push_str(&format!(
        "Chain: {} ({})\nProposal ID: {}\nType: {}\nStatus: {}\nTitle: {}\nDescription: {}\n",
        chain_name,
        proposal.chain_id,
        proposal.proposal_id,
        if proposal.type_tag.is_empty() {
            "unknown"
        } else {
            &proposal.type_tag
        },
        proposal.status,
        proposal.title,
        proposal.description,
    ));
    if let Some(end) = proposal.voting_end {
        out.push_str(&format!("Voting ends: {}\n", end.to_rfc3339()));
    }

    out.push_str("\nSUBSCRIBER POLICY:\n");
    out.push_str(&format!("Risk tolerance: {}\n", policy.risk_tolerance));
    if !policy.criteria.is_empty() {
        out.push_str("Weighted criteria:\n");
        for (criterion, weight) in &policy.criteria {
            out.push_str(&format!("- {criterion}: {weight:.2}\n"));
        }
    }
    if !policy.blurbs.is_empty() {
        out.push_str("Policy statements:\n");
        for blurb in &policy.blurbs {
            out.push_str(&format!("- {blurb}\n"));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::RiskLevel;
    use crate::chain::ProposalStatus;
    use std::collections::BTreeMap;

    fn proposal(title: &str, description: &str, type_tag: &str) -> Proposal {
        Proposal {
            chain_id: "osmosis-1".into(),
            proposal_id: 848,
            title: title.into(),
            description: description.into(),
            status: ProposalStatus::Voting,
            voting_start: None,
            voting_end: None,
            submit_time: None,
            proposer: String::new(),
            type_tag: type_tag.into(),
        }
    }

    fn policy() -> Policy {
        let mut criteria = BTreeMap::new();
        criteria.insert("security".to_string(), 0.4);
        criteria.insert("economic".to_string(), 0.3);
        criteria.insert("governance".to_string(), 0.2);
        criteria.insert("community".to_string(), 0.1);
        Policy {
            risk_tolerance: RiskLevel::Low,
            criteria,
            blurbs: vec!["oppose inflation increases".into()],
        }
    }

    #[test]
    fn type_tag_beats_keywords() {
        let p = proposal(
            "Fund the community growth program",
            "spend from the pool",
            "/cosmos.upgrade.v1beta1.SoftwareUpgradeProposal",
        );
        assert_eq!(classify(&p), Category::Upgrade);
    }

    #[test]
    fn keyword_buckets_classify_in_fixed_order() {
        assert_eq!(
            classify(&proposal("v24 upgrade", "chain upgrade at halt height", "")),
            Category::Upgrade
        );
        assert_eq!(
            classify(&proposal("Increase taker fees", "adjust the fee parameter", "")),
            Category::ParameterChange
        );
        assert_eq!(
            classify(&proposal("Grant for tooling", "community pool grant", "")),
            Category::CommunityPoolSpend
        );
        assert_eq!(
            classify(&proposal("Open IBC channel", "new relayer path", "")),
            Category::Ibc
        );
        assert_eq!(
            classify(&proposal("Signaling: direction", "signaling proposal", "")),
            Category::Text
        );
        assert_eq!(
            classify(&proposal("Misc", "something else entirely", "")),
            Category::Other
        );
    }

    #[test]
    fn prompt_is_deterministic() {
        let p = proposal("Increase taker fees", "raise taker fee to 0.15%", "");
        let a = build_prompt(&p, "Osmosis", &policy());
        let b = build_prompt(&p, "Osmosis", &policy());
        assert_eq!(a, b);
    }

    #[test]
    fn prompt_contains_all_three_layers() {
        let p = proposal("Increase taker fees", "raise taker fee to 0.15%", "");
        let rendered = build_prompt(&p, "Osmosis", &policy());
        // layer 1: schema
        assert!(rendered.contains("\"recommendation\""));
        // layer 2: category + chain context
        assert!(rendered.contains("CATEGORY: PARAMETER_CHANGE"));
        assert!(rendered.contains("Osmosis is the main DEX"));
        // layer 3: proposal + policy verbatim
        assert!(rendered.contains("Increase taker fees"));
        assert!(rendered.contains("Risk tolerance: LOW"));
        assert!(rendered.contains("oppose inflation increases"));
        assert!(rendered.contains("security: 0.40"));
    }

    #[test]
    fn unknown_chain_gets_generic_context() {
        let rendered = chain_context("akashnet-2", "Akash");
        assert!(rendered.contains("Akash is a Cosmos SDK chain"));
    }
}
