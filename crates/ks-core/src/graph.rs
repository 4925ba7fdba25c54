//! Graph aggregation: many pairwise tensions folded into concept-pair edges
//! and per-concept nodes.
//!
//! Pair identity is the trimmed, lowercased, sorted label pair. Display labels
//! keep case: each node shows the lexicographically smallest trimmed spelling
//! observed, so the result never depends on input order. Collapse directions
//! are counted relative to the sorted pair: a tension written `(desire, duty)`
//! with `toward_a` counts toward `desire`, the edge's `source`.
//!
//! The result is a pure function of the input multiset. Floating sums are
//! taken over sorted values so permuting the input gives identical output.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::tension::{CollapseDirection, LifePhase, PairKey, Tension, valid_pair};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Normalized id of the lexicographically smaller pole.
    pub source: String,
    pub target: String,
    pub frequency: u32,
    /// `(toward_target - toward_source) / (toward_source + toward_target)`, 0 when undecided.
    pub direction_bias: f64,
    pub scar_sum: f64,
    pub scar_max: f64,
    pub refusal_present: bool,
    pub refusal_count: u32,
    pub toward_source: u32,
    pub toward_target: u32,
    pub balanced: u32,
    pub unknown: u32,
    pub life_phases: Vec<LifePhase>,
    pub mask_inner: Vec<String>,
    pub mask_outer: Vec<String>,
    pub summaries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    /// Sum of incident edge frequencies.
    pub frequency: u32,
    /// Sum of incident edge scar sums.
    pub scar: f64,
    pub refusal: bool,
    pub connections: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TensionGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl TensionGraph {
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edge(&self, a: &str, b: &str) -> Option<&GraphEdge> {
        let key = PairKey::new(a, b);
        self.edges
            .iter()
            .find(|e| e.source == key.low && e.target == key.high)
    }

    pub fn node(&self, label: &str) -> Option<&GraphNode> {
        let id = label.trim().to_lowercase();
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// `(toward_b - toward_a) / (toward_a + toward_b)`, or 0 with no decided tensions.
pub fn direction_bias(toward_a: u32, toward_b: u32) -> f64 {
    let total = toward_a + toward_b;
    if total == 0 {
        0.0
    } else {
        (f64::from(toward_b) - f64::from(toward_a)) / f64::from(total)
    }
}

#[derive(Default)]
struct Group {
    count: u32,
    scars: Vec<f64>,
    refusals: u32,
    toward_source: u32,
    toward_target: u32,
    balanced: u32,
    unknown: u32,
    phases: BTreeSet<LifePhase>,
    mask_inner: BTreeSet<String>,
    mask_outer: BTreeSet<String>,
    summaries: BTreeSet<String>,
}

impl Group {
    fn add(&mut self, t: &Tension, flipped: bool) {
        self.count += 1;
        self.scars.push(t.scar_valence);
        if t.refusal {
            self.refusals += 1;
        }
        let direction = if flipped {
            t.collapse_direction.flipped()
        } else {
            t.collapse_direction
        };
        match direction {
            CollapseDirection::TowardA => self.toward_source += 1,
            CollapseDirection::TowardB => self.toward_target += 1,
            CollapseDirection::Balanced => self.balanced += 1,
            CollapseDirection::Unknown => self.unknown += 1,
        }
        self.phases.insert(t.life_phase);
        insert_trimmed(&mut self.mask_inner, t.mask_inner.as_deref());
        insert_trimmed(&mut self.mask_outer, t.mask_outer.as_deref());
        insert_trimmed(&mut self.summaries, t.summary.as_deref());
    }

    fn into_edge(mut self, key: PairKey) -> GraphEdge {
        self.scars.sort_by(|a, b| a.total_cmp(b));
        let scar_sum = self.scars.iter().sum();
        let scar_max = self.scars.last().copied().unwrap_or(0.0);
        GraphEdge {
            source: key.low,
            target: key.high,
            frequency: self.count,
            direction_bias: direction_bias(self.toward_source, self.toward_target),
            scar_sum,
            scar_max,
            refusal_present: self.refusals > 0,
            refusal_count: self.refusals,
            toward_source: self.toward_source,
            toward_target: self.toward_target,
            balanced: self.balanced,
            unknown: self.unknown,
            life_phases: self.phases.into_iter().collect(),
            mask_inner: self.mask_inner.into_iter().collect(),
            mask_outer: self.mask_outer.into_iter().collect(),
            summaries: self.summaries.into_iter().collect(),
        }
    }
}

fn insert_trimmed(set: &mut BTreeSet<String>, value: Option<&str>) {
    if let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) {
        set.insert(v.to_string());
    }
}

fn keep_smallest(labels: &mut BTreeMap<String, String>, id: &str, spelling: &str) {
    let spelling = spelling.trim();
    labels
        .entry(id.to_string())
        .and_modify(|cur| {
            if spelling < cur.as_str() {
                *cur = spelling.to_string();
            }
        })
        .or_insert_with(|| spelling.to_string());
}

pub fn aggregate(tensions: &[Tension]) -> TensionGraph {
    let mut groups: BTreeMap<PairKey, Group> = BTreeMap::new();
    let mut labels: BTreeMap<String, String> = BTreeMap::new();

    for t in tensions {
        if !valid_pair(&t.pole_a, &t.pole_b) {
            debug!(id = %t.id, "skipping tension with invalid pole pair");
            continue;
        }
        let key = t.key();
        let flipped = PairKey::is_flipped(&t.pole_a, &t.pole_b);
        let (low_spelling, high_spelling) = if flipped {
            (&t.pole_b, &t.pole_a)
        } else {
            (&t.pole_a, &t.pole_b)
        };
        keep_smallest(&mut labels, &key.low, low_spelling);
        keep_smallest(&mut labels, &key.high, high_spelling);
        groups.entry(key).or_default().add(t, flipped);
    }

    let edges: Vec<GraphEdge> = groups
        .into_iter()
        .map(|(key, group)| group.into_edge(key))
        .collect();

    let mut nodes: BTreeMap<String, GraphNode> = BTreeMap::new();
    for edge in &edges {
        for id in [&edge.source, &edge.target] {
            let node = nodes.entry(id.clone()).or_insert_with(|| GraphNode {
                id: id.clone(),
                label: labels.get(id).cloned().unwrap_or_else(|| id.clone()),
                frequency: 0,
                scar: 0.0,
                refusal: false,
                connections: 0,
            });
            node.frequency += edge.frequency;
            node.scar += edge.scar_sum;
            node.refusal |= edge.refusal_present;
            node.connections += 1;
        }
    }

    TensionGraph {
        nodes: nodes.into_values().collect(),
        edges,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn t(id: &str, a: &str, b: &str) -> Tension {
        Tension::new(id, a, b).unwrap()
    }

    #[test]
    fn test_single_tension_edge() {
        let g = aggregate(&[t("1", "duty", "desire")]);
        assert_eq!(g.edges.len(), 1);
        let e = g.edge("duty", "desire").unwrap();
        assert_eq!(e.frequency, 1);
        assert_eq!(e.direction_bias, 0.0);
        assert_relative_eq!(e.scar_sum, 0.5);
        assert_eq!(g.nodes.len(), 2);
    }

    #[test]
    fn test_pair_identity_ignores_order_and_case() {
        let g = aggregate(&[
            t("1", "Duty", "desire"),
            t("2", "desire", "duty"),
            t("3", " DUTY ", "Desire"),
        ]);
        assert_eq!(g.edges.len(), 1);
        assert_eq!(g.edges[0].frequency, 3);
        assert_eq!(g.node("duty").unwrap().label, "DUTY");
        assert_eq!(g.node("desire").unwrap().label, "Desire");
    }

    #[test]
    fn test_direction_remapped_to_sorted_pair() {
        // sorted pair is (desire, duty): source = desire
        let g = aggregate(&[
            t("1", "duty", "desire").with_direction(CollapseDirection::TowardA),
            t("2", "desire", "duty").with_direction(CollapseDirection::TowardB),
            t("3", "desire", "duty").with_direction(CollapseDirection::TowardA),
        ]);
        let e = &g.edges[0];
        assert_eq!(e.source, "desire");
        assert_eq!(e.toward_target, 2);
        assert_eq!(e.toward_source, 1);
        assert_relative_eq!(e.direction_bias, 1.0 / 3.0);
    }

    #[test]
    fn test_accumulators() {
        let g = aggregate(&[
            t("1", "law", "mercy")
                .with_scar(0.9)
                .with_refusal(true, 2)
                .with_phase(LifePhase::Late, 0.8)
                .with_masks(Some("control".into()), Some("desire".into()))
                .with_summary("b summary"),
            t("2", "law", "mercy")
                .with_scar(0.3)
                .with_direction(CollapseDirection::Balanced)
                .with_phase(LifePhase::Early, 0.2)
                .with_summary("a summary"),
            t("3", "law", "mercy").with_summary("a summary"),
        ]);
        let e = &g.edges[0];
        assert_eq!(e.frequency, 3);
        assert_relative_eq!(e.scar_sum, 1.7, epsilon = 1e-12);
        assert_relative_eq!(e.scar_max, 0.9);
        assert!(e.refusal_present);
        assert_eq!(e.refusal_count, 1);
        assert_eq!(e.balanced, 1);
        assert_eq!(e.unknown, 2);
        assert_eq!(e.life_phases, vec![LifePhase::Early, LifePhase::Late, LifePhase::Unknown]);
        assert_eq!(e.mask_inner, vec!["control"]);
        assert_eq!(e.mask_outer, vec!["desire"]);
        assert_eq!(e.summaries, vec!["a summary", "b summary"]);
    }

    #[test]
    fn test_node_accumulates_across_edges() {
        let g = aggregate(&[
            t("1", "duty", "desire").with_scar(0.4),
            t("2", "duty", "freedom").with_scar(0.2).with_refusal(true, 0),
            t("3", "duty", "freedom").with_scar(0.1),
        ]);
        let duty = g.node("duty").unwrap();
        assert_eq!(duty.frequency, 3);
        assert_eq!(duty.connections, 2);
        assert!(duty.refusal);
        assert_relative_eq!(duty.scar, 0.7, epsilon = 1e-12);
        let desire = g.node("desire").unwrap();
        assert!(!desire.refusal);
        assert_eq!(desire.connections, 1);
    }

    #[test]
    fn test_invalid_pairs_skipped() {
        let mut bad = t("1", "duty", "desire");
        bad.pole_b = "DUTY".into();
        assert!(aggregate(&[bad]).is_empty());
    }

    #[test]
    fn test_direction_bias_zero_cases() {
        assert_eq!(direction_bias(0, 0), 0.0);
        assert_eq!(direction_bias(3, 3), 0.0);
        assert_eq!(direction_bias(0, 4), 1.0);
        assert_eq!(direction_bias(4, 0), -1.0);
    }

    const POLES: &[&str] = &["duty", "Desire", "law", "MERCY", "freedom", "order"];

    fn arb_tension() -> impl Strategy<Value = Tension> {
        (
            0..POLES.len(),
            0..POLES.len(),
            0.0f64..=1.0,
            0usize..4,
            any::<bool>(),
            proptest::option::of("[a-c]{1,2}"),
        )
            .prop_filter("distinct poles", |(a, b, ..)| a != b)
            .prop_map(|(a, b, scar, dir, refusal, summary)| {
                let direction = [
                    CollapseDirection::TowardA,
                    CollapseDirection::TowardB,
                    CollapseDirection::Balanced,
                    CollapseDirection::Unknown,
                ][dir];
                let mut t = Tension::new("x", POLES[a], POLES[b])
                    .unwrap()
                    .with_scar(scar)
                    .with_direction(direction)
                    .with_refusal(refusal, 0);
                t.summary = summary;
                t
            })
    }

    proptest! {
        #[test]
        fn prop_aggregate_is_idempotent(tensions in proptest::collection::vec(arb_tension(), 0..30)) {
            prop_assert_eq!(aggregate(&tensions), aggregate(&tensions));
        }

        #[test]
        fn prop_aggregate_ignores_input_order(
            (tensions, shuffled) in proptest::collection::vec(arb_tension(), 0..30)
                .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
        ) {
            prop_assert_eq!(aggregate(&tensions), aggregate(&shuffled));
        }

        #[test]
        fn prop_direction_bias_in_range(tensions in proptest::collection::vec(arb_tension(), 0..30)) {
            for e in aggregate(&tensions).edges {
                prop_assert!((-1.0..=1.0).contains(&e.direction_bias));
                if e.toward_source == e.toward_target {
                    prop_assert_eq!(e.direction_bias, 0.0);
                }
            }
        }

        #[test]
        fn prop_bias_formula(a in 0u32..1000, b in 0u32..1000) {
            let bias = direction_bias(a, b);
            prop_assert!((-1.0..=1.0).contains(&bias));
        }
    }
}
