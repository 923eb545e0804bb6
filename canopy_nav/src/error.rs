// Error type for the coordinator.
//
// Recoverable failures (structure locked, too many graphs, unknown ids, a
// misbehaving forced work item, a failing scan hook, a bad config file) are
// reported as `NavError`. Misuse that would otherwise deadlock the worker
// pool (pausing search from a search worker or from inside a work item,
// draining work items reentrantly) is a panic at the call site instead.
//
// Link anchors that cannot be snapped are not errors at all: they are
// recorded on the link as `LinkStatus::FailedToConnectStart`/`End`. The
// same goes for a link refresh that finds no free slot for the link graph
// (`LinkStatus::FailedToCreateLinkGraph`), so a full graph set never fails
// a batch or a scan.

use crate::types::{GraphIndex, LinkId};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NavError>;

/// Boxed error returned by user hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Which scan hook failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookStage {
    PreScan,
    GraphPreScan,
    GraphPostScan,
    PostScan,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookStage::PreScan => "pre-scan",
            HookStage::GraphPreScan => "graph pre-scan",
            HookStage::GraphPostScan => "graph post-scan",
            HookStage::PostScan => "post-scan",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum NavError {
    #[error("graph structure is locked: cannot {operation} while graphs are being scanned or updated")]
    StructureLocked { operation: &'static str },
    #[error("too many graphs: the limit is {limit}")]
    TooManyGraphs { limit: usize },
    #[error("{0} does not exist")]
    NoSuchGraph(GraphIndex),
    #[error("{0} does not exist")]
    NoSuchLink(LinkId),
    #[error("the link graph already exists as {0}")]
    LinkGraphExists(GraphIndex),
    #[error("{graph} ({kind}) does not support {capability}")]
    Unsupported {
        graph: GraphIndex,
        kind: &'static str,
        capability: &'static str,
    },
    #[error("a work item did not complete although it was forced to")]
    WorkItemStalled,
    #[error("{stage} hook failed: {source}")]
    Hook {
        stage: HookStage,
        #[source]
        source: HookError,
    },
    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_operation() {
        let e = NavError::StructureLocked {
            operation: "remove a graph",
        };
        assert!(e.to_string().contains("remove a graph"));
        let e = NavError::TooManyGraphs { limit: 4 };
        assert_eq!(e.to_string(), "too many graphs: the limit is 4");
    }

    #[test]
    fn hook_error_keeps_source() {
        use std::error::Error as _;
        let e = NavError::Hook {
            stage: HookStage::PostScan,
            source: "boom".into(),
        };
        assert_eq!(e.to_string(), "post-scan hook failed: boom");
        assert!(e.source().is_some());
    }
}
