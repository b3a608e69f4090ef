//! Domain rule matching
//!
//! Compiles the domain selectors of a store snapshot into an immutable
//! ruleset and answers `matches(name)` under an atomic publication
//! discipline. See [`matcher`] for the algorithm and ordering.

pub mod matcher;

pub use matcher::{DomainMatcher, RuleStats};
