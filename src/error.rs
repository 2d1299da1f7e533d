//! Error domains for the rule tree, the predicate evaluator, persistence,
//! and the client-facing command dispatch.
//!
//! Each layer gets its own enum so a caller several layers up can match
//! on the failure kind without string parsing. `CommandError`'s
//! `Display` impl is the one place that renders a failure into the text
//! a client sees in its `respond\n` frame.

use thiserror::Error;

use crate::rule_tree::Address;

/// Failures from addressing or mutating a [`crate::rule_tree::RuleTree`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("address {0:?} does not resolve to an existing node")]
    InvalidAddress(Address),
}

/// Failures from parsing or evaluating a [`crate::predicate::Predicate`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("unknown operator {0}")]
    InvalidOperator(String),
    #[error("unknown matchfield {0}")]
    InvalidMatchField(String),
    #[error("matchfield value {0} could not be interpreted")]
    InvalidValue(String),
    #[error("invalid regex `{0}`: {1}")]
    InvalidRegex(String, String),
    #[error("FIELD range {range} has no token {index} (msg split into {available} tokens)")]
    FieldIndexOutOfRange {
        range: String,
        index: usize,
        available: usize,
    },
}

/// Failures saving or loading a rule tree to/from `LogWatch<id>.json`.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("persisted tree violates the leaf/internal invariant")]
    InvalidTree,
    #[error("persisted predicate is invalid: {0}")]
    InvalidPredicate(#[from] EvalError),
}

/// Failures surfaced to the client that issued a command.
///
/// `Display` renders the body of the `respond\n<text>` frame; the
/// `respond\n` prefix itself is added by the session writer, not here;
/// the session, not the error, owns protocol framing.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Invalid Command")]
    Protocol,
    #[error("LogWatch {0} does not exist.")]
    NotFound(u64),
    #[error("{0}")]
    Tree(#[from] TreeError),
    #[error("{0}")]
    Eval(#[from] EvalError),
    #[error("{0}")]
    Persist(#[from] PersistError),
}
