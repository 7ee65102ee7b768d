//! Pre-processed interval lookup over a [`KeepRuleSet`].

use keep_rules::{intervals, Direction, KeepRuleSet, PreserveStrategy};
use log::debug;
use std::collections::HashMap;

/// Sorted, merged keep intervals of one flow direction, split by strategy.
///
/// The two strategy lists stay separate through preprocessing: a
/// header-only range must never be swallowed by a full-preserve range, so
/// merging happens only within each list.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct DirectionalRules {
    pub header_only: Vec<(u32, u32)>,
    pub full_preserve: Vec<(u32, u32)>,
}

impl DirectionalRules {
    pub fn is_empty(&self) -> bool {
        self.header_only.is_empty() && self.full_preserve.is_empty()
    }
}

struct FlowRules {
    by_direction: HashMap<Direction, DirectionalRules>,
    /// Union of both directions, the last-resort fallback when a packet's
    /// direction has no rules of its own.
    any_direction: DirectionalRules,
}

/// Lookup structure the per-packet loop queries.
///
/// Primary key is the canonical tuple key; the stream id mapping tolerates
/// numbering drift between analyzer and rewriter and is only consulted when
/// the tuple key misses.
pub struct RuleIndex {
    flows: HashMap<String, FlowRules>,
    tuple_by_stream: HashMap<u64, String>,
}

impl RuleIndex {
    pub fn build(rules: &KeepRuleSet) -> Self {
        let mut raw: HashMap<String, HashMap<Direction, DirectionalRules>> = HashMap::new();
        let mut tuple_by_stream: HashMap<u64, String> = HashMap::new();

        for rule in &rules.rules {
            let group = raw
                .entry(rule.tuple_key.clone())
                .or_insert_with(HashMap::new)
                .entry(rule.direction)
                .or_insert_with(DirectionalRules::default);
            let range = (rule.seq_start, rule.seq_end);
            match rule.preserve_strategy {
                PreserveStrategy::HeaderOnly => group.header_only.push(range),
                PreserveStrategy::FullPreserve => group.full_preserve.push(range),
            }
            // Several analyzers may number streams independently; first
            // claim wins, the tuple key stays authoritative.
            tuple_by_stream
                .entry(rule.stream_id)
                .or_insert_with(|| rule.tuple_key.clone());
        }

        let mut flows = HashMap::with_capacity(raw.len());
        for (tuple_key, directions) in raw {
            let mut by_direction = HashMap::new();
            let mut all_header = Vec::new();
            let mut all_full = Vec::new();
            for (direction, group) in directions {
                all_header.extend_from_slice(&group.header_only);
                all_full.extend_from_slice(&group.full_preserve);
                by_direction.insert(
                    direction,
                    DirectionalRules {
                        header_only: intervals::merge_intervals(group.header_only),
                        full_preserve: intervals::merge_intervals(group.full_preserve),
                    },
                );
            }
            flows.insert(
                tuple_key,
                FlowRules {
                    by_direction,
                    any_direction: DirectionalRules {
                        header_only: intervals::merge_intervals(all_header),
                        full_preserve: intervals::merge_intervals(all_full),
                    },
                },
            );
        }
        debug!(
            "Rule index: {} flow(s) from {} rule(s)",
            flows.len(),
            rules.len()
        );
        RuleIndex {
            flows,
            tuple_by_stream,
        }
    }

    /// Resolve the rules applying to one packet: tuple key first, stream id
    /// as drift fallback, and the direction-agnostic union when the flow is
    /// known but the packet's direction has no rules. `None` means "no keep
    /// rules, mask the whole payload".
    pub fn lookup(
        &self,
        tuple_key: &str,
        stream_id: u64,
        direction: Direction,
    ) -> Option<&DirectionalRules> {
        let flow = self.flows.get(tuple_key).or_else(|| {
            self.tuple_by_stream
                .get(&stream_id)
                .and_then(|tuple| self.flows.get(tuple))
        })?;
        Some(
            flow.by_direction
                .get(&direction)
                .unwrap_or(&flow.any_direction),
        )
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }
}
