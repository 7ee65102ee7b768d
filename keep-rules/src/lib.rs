//! Shared vocabulary of the masking pipeline.
//!
//! The analyzer side emits a [`KeepRuleSet`]; the rewriter side consumes it.
//! Nothing else is shared between the two, so everything in this crate is
//! plain immutable data plus the flow-identity functions both sides must
//! agree on byte for byte.

pub mod flow;
pub mod intervals;
pub mod rules;

pub use crate::{
    flow::{Direction, Endpoint, FlowKey, StreamIdAllocator},
    rules::{AnalysisMetadata, KeepRule, KeepRuleSet, PreserveStrategy, RuleType},
};
