//! Merge arbitration.
//!
//! Two groups may be joined only if no service is claimed with different ids
//! on both sides. A rejected merge leaves both groups untouched and yields one
//! [`ConflictRecord`] per contested service for manual review. Trust does not
//! break ties: a pinned edge that contradicts another pinned edge is reported
//! like any other.

use crate::graph::{compare_native_ids, CrossReferenceEdge, IdentityGraph, NodeId, NodeKey, Trust};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use shared::Service;
use tracing::warn;

/// Verdict on a proposed merge
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Approve,
    Reject(Vec<ConflictRecord>),
}

/// One id competing for a service slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictCandidate {
    pub native_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episodes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aired: Option<NaiveDate>,
}

/// The edge whose merge was withheld
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSummary {
    pub from: NodeKey,
    pub to: NodeKey,
    pub trust: Trust,
    /// `committed-mapping`, or `scraped:<service>` for the record that made the claim
    pub source: String,
}

/// A withheld merge, surfaced in the conflict report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub service: Service,
    /// Sorted by id
    pub candidates: Vec<ConflictCandidate>,
    pub edge: EdgeSummary,
}

/// Stateless merge policy consulted by [`IdentityGraph::propose_merge`]
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Decide whether the groups rooted at `root_a` and `root_b` may merge
    pub fn resolve(
        &self,
        graph: &IdentityGraph,
        root_a: NodeId,
        root_b: NodeId,
        edge: &CrossReferenceEdge,
    ) -> Resolution {
        let (Some(side_a), Some(side_b)) = (graph.members(root_a), graph.members(root_b)) else {
            return Resolution::Approve;
        };

        let mut conflicts = Vec::new();
        for (service, node_a) in side_a {
            let Some(node_b) = side_b.get(service) else {
                continue;
            };
            if node_a == node_b {
                continue;
            }

            let mut candidates: Vec<ConflictCandidate> = [node_a, node_b]
                .into_iter()
                .map(|node| ConflictCandidate {
                    native_id: graph.key(*node).native_id.clone(),
                    title: graph.title(*node).map(str::to_string),
                    episodes: graph.episodes(*node),
                    aired: graph.aired(*node),
                })
                .collect();
            candidates.sort_by(|a, b| compare_native_ids(*service, &a.native_id, &b.native_id));

            conflicts.push(ConflictRecord {
                service: *service,
                candidates,
                edge: summarize(graph, edge),
            });
        }

        if conflicts.is_empty() {
            return Resolution::Approve;
        }

        for conflict in &conflicts {
            warn!(
                service = %conflict.service,
                first = %conflict.candidates[0].native_id,
                second = %conflict.candidates[1].native_id,
                from = %conflict.edge.from,
                to = %conflict.edge.to,
                trust = %conflict.edge.trust,
                "Conflicting ids, merge withheld"
            );
        }
        Resolution::Reject(conflicts)
    }
}

fn summarize(graph: &IdentityGraph, edge: &CrossReferenceEdge) -> EdgeSummary {
    let from = graph.key(edge.from).clone();
    let source = match edge.trust {
        Trust::Pinned => "committed-mapping".to_string(),
        Trust::Hinted => format!("scraped:{}", from.service),
    };
    EdgeSummary {
        from,
        to: graph.key(edge.to).clone(),
        trust: edge.trust,
        source,
    }
}
