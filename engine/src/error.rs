use std::fmt;
use thiserror::Error;

use crate::model::Chain;

/// A collaborator query failed; the current pass is abandoned
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("cluster membership unavailable: {0}")]
    Membership(String),

    #[error("policy store unavailable: {0}")]
    Store(String),

    #[error("orchestrator unavailable: {0}")]
    Orchestrator(String),

    #[error("policy feed origin unavailable: {0}")]
    FeedOrigin(String),
}

/// Packet-filter primitive operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    CreateChain,
    FlushChain,
    SetPolicy,
    SetRules,
    AppendRule,
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterOp::CreateChain => "create chain",
            FilterOp::FlushChain => "flush chain",
            FilterOp::SetPolicy => "set policy",
            FilterOp::SetRules => "set rules",
            FilterOp::AppendRule => "append rule",
        };
        f.write_str(name)
    }
}

/// A packet-filter primitive call failed
#[derive(Debug, Clone, Error)]
#[error("{op} on {chain} failed: {message}")]
pub struct FilterError {
    pub op: FilterOp,
    pub chain: String,
    pub message: String,
}

impl FilterError {
    pub fn new(op: FilterOp, chain: &str, message: impl Into<String>) -> Self {
        Self {
            op,
            chain: chain.to_string(),
            message: message.into(),
        }
    }
}

/// A policy feed entry (or the whole document) could not be used
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeedEntryError {
    #[error("feed document is not a list of entries: {0}")]
    Document(String),

    #[error("malformed entry: {0}")]
    Malformed(String),

    #[error("unsupported entry type '{0}'")]
    UnsupportedType(String),

    #[error("unsupported host selector '{0}'")]
    UnsupportedHostSelector(String),

    #[error("{0}")]
    InvalidPort(String),

    #[error("{0}")]
    InvalidProtocol(String),

    #[error("invalid source '{0}'")]
    InvalidSource(String),

    #[error("no endpoints for application '{0}'")]
    UnresolvedApplication(String),
}

/// Failure to bootstrap or apply a chain
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("bootstrap of {chain} failed after {attempts} attempt(s): {source}")]
    Bootstrap {
        chain: Chain,
        attempts: u32,
        #[source]
        source: FilterError,
    },

    #[error("apply to {chain} failed: {source}")]
    Apply {
        chain: Chain,
        #[source]
        source: FilterError,
    },

    #[error("supplementary rules for {chain} unavailable: {source}")]
    Supplement {
        chain: Chain,
        #[source]
        source: SourceError,
    },
}

impl ReconcileError {
    pub fn chain(&self) -> Chain {
        match self {
            ReconcileError::Bootstrap { chain, .. }
            | ReconcileError::Apply { chain, .. }
            | ReconcileError::Supplement { chain, .. } => *chain,
        }
    }
}
