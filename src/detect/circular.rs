//! Circular-trade detection over the funds-flow graph.
//!
//! Nodes live in an arena indexed by first appearance; edges are integer
//! pairs weighted by volume (parallel fills between the same pair are
//! aggregated). Simple cycles of length 2–4 are enumerated with the cycle's
//! smallest node index as canonical start, capped at 10,000 cycles.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use alloy::primitives::{Address, B256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::{evidence_id, Detector, ScanCtx};
use crate::model::{Evidence, EvidenceKind};
use crate::store::Snapshot;

/// Enumeration cap keeping pathological graphs bounded.
const MAX_CYCLES: usize = 10_000;
const MIN_CYCLE_LEN: usize = 2;
const MAX_CYCLE_LEN: usize = 4;

struct Graph {
    nodes: Vec<Address>,
    /// (from, to) -> aggregated edge.
    edges: BTreeMap<(usize, usize), Edge>,
    /// Sorted out-neighbours per node.
    adjacency: Vec<Vec<usize>>,
}

#[derive(Clone)]
struct Edge {
    volume: Decimal,
    min_fill: Decimal,
    tx_hashes: BTreeSet<B256>,
    earliest_ts: i64,
}

fn build_graph(snapshot: &Snapshot, ctx: &ScanCtx) -> Option<Graph> {
    let mut index: HashMap<Address, usize> = HashMap::new();
    let mut nodes = Vec::new();
    let mut edges: BTreeMap<(usize, usize), Edge> = BTreeMap::new();

    for (processed, t) in snapshot.trades.iter().enumerate() {
        if ctx.checkpoint(processed) {
            return None;
        }
        if t.maker == t.taker {
            continue; // self-loops belong to the self-trade detector
        }
        let mut node_of = |a: Address| -> usize {
            *index.entry(a).or_insert_with(|| {
                nodes.push(a);
                nodes.len() - 1
            })
        };
        // Outcome tokens flow taker → maker.
        let from = node_of(t.taker);
        let to = node_of(t.maker);
        edges
            .entry((from, to))
            .and_modify(|e| {
                e.volume += t.volume;
                e.min_fill = e.min_fill.min(t.volume);
                e.tx_hashes.insert(t.tx_hash);
                e.earliest_ts = e.earliest_ts.min(t.timestamp);
            })
            .or_insert_with(|| Edge {
                volume: t.volume,
                min_fill: t.volume,
                tx_hashes: BTreeSet::from([t.tx_hash]),
                earliest_ts: t.timestamp,
            });
    }

    let mut adjacency = vec![Vec::new(); nodes.len()];
    for &(from, to) in edges.keys() {
        adjacency[from].push(to);
    }
    for neighbours in &mut adjacency {
        neighbours.sort_unstable();
    }

    Some(Graph {
        nodes,
        edges,
        adjacency,
    })
}

/// DFS from each start node, visiting only larger-indexed nodes so every
/// cycle is found exactly once (at its smallest member).
fn find_cycles(graph: &Graph) -> Vec<Vec<usize>> {
    let mut cycles = Vec::new();
    let n = graph.nodes.len();

    let mut stack = Vec::with_capacity(MAX_CYCLE_LEN);
    for start in 0..n {
        if cycles.len() >= MAX_CYCLES {
            break;
        }
        stack.clear();
        stack.push(start);
        dfs(graph, start, &mut stack, &mut cycles);
    }
    cycles
}

fn dfs(graph: &Graph, start: usize, stack: &mut Vec<usize>, cycles: &mut Vec<Vec<usize>>) {
    if cycles.len() >= MAX_CYCLES {
        return;
    }
    let current = *stack.last().expect("non-empty path");
    for &next in &graph.adjacency[current] {
        if cycles.len() >= MAX_CYCLES {
            return;
        }
        if next == start {
            if stack.len() >= MIN_CYCLE_LEN {
                cycles.push(stack.clone());
            }
            continue;
        }
        if next <= start || stack.contains(&next) || stack.len() >= MAX_CYCLE_LEN {
            continue;
        }
        stack.push(next);
        dfs(graph, start, stack, cycles);
        stack.pop();
    }
}

pub struct CircularTradeDetector;

impl Detector for CircularTradeDetector {
    fn name(&self) -> &'static str {
        "circular-trades"
    }

    fn scan(&self, snapshot: &Snapshot, ctx: &ScanCtx) -> Vec<Evidence> {
        let Some(graph) = build_graph(snapshot, ctx) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for cycle in find_cycles(&graph) {
            let mut min_edge = Decimal::MAX;
            let mut max_edge = Decimal::MIN;
            let mut volume = Decimal::ZERO;
            let mut tx_hashes = BTreeSet::new();
            let mut earliest_ts = i64::MAX;

            for i in 0..cycle.len() {
                let from = cycle[i];
                let to = cycle[(i + 1) % cycle.len()];
                let edge = &graph.edges[&(from, to)];
                min_edge = min_edge.min(edge.volume);
                max_edge = max_edge.max(edge.volume);
                volume += edge.volume;
                tx_hashes.extend(edge.tx_hashes.iter().copied());
                earliest_ts = earliest_ts.min(edge.earliest_ts);
            }

            let balance = if max_edge > Decimal::ZERO {
                (min_edge / max_edge).to_f64().unwrap_or(0.0)
            } else {
                0.0
            };
            let confidence = (0.6 + 0.1 * balance).clamp(0.6, 0.9);

            let addresses: Vec<Address> = {
                let mut addrs: Vec<Address> =
                    cycle.iter().map(|&i| graph.nodes[i]).collect();
                addrs.sort_unstable();
                addrs
            };
            let path: Vec<String> = cycle
                .iter()
                .chain(std::iter::once(&cycle[0]))
                .map(|&i| graph.nodes[i].to_string())
                .collect();

            let id_parts: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
            let id_refs: Vec<&str> = id_parts.iter().map(|s| s.as_str()).collect();
            out.push(Evidence {
                id: evidence_id("CIRC", &id_refs),
                kind: EvidenceKind::CircularTrade,
                confidence,
                timestamp: earliest_ts,
                addresses,
                tx_hashes: tx_hashes.into_iter().collect(),
                token_id: None,
                volume,
                details: serde_json::json!({
                    "cycle_length": cycle.len(),
                    "cycle_path": path.join(" -> "),
                    "min_edge_volume": min_edge.to_string(),
                    "max_edge_volume": max_edge.to_string(),
                }),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::testutil::{addr, snapshot, trade};
    use crate::model::Side;

    #[test]
    fn two_node_cycle_is_found_once() {
        let a = addr(1);
        let b = addr(2);
        // a -> b (taker a, maker b) then b -> a.
        let snap = snapshot(
            vec![
                trade(10, 0, 1_000, b, a, 7, Side::Buy, "0.5000", "100.000000"),
                trade(11, 0, 1_010, a, b, 7, Side::Buy, "0.5000", "100.000000"),
            ],
            vec![],
        );
        let found = CircularTradeDetector.scan(&snap, &ScanCtx::new());
        assert_eq!(found.len(), 1);
        let e = &found[0];
        assert_eq!(e.kind, EvidenceKind::CircularTrade);
        // Perfectly balanced edges: 0.6 + 0.1 * 1.0.
        assert!((e.confidence - 0.7).abs() < 1e-9);
        assert_eq!(e.addresses, {
            let mut v = vec![a, b];
            v.sort_unstable();
            v
        });
    }

    #[test]
    fn three_node_cycle_confidence_tracks_imbalance() {
        let a = addr(1);
        let b = addr(2);
        let c = addr(3);
        // a -> b -> c -> a with volumes 50, 100, 100.
        let snap = snapshot(
            vec![
                trade(10, 0, 1_000, b, a, 7, Side::Buy, "0.5000", "100.000000"),
                trade(11, 0, 1_010, c, b, 7, Side::Buy, "0.5000", "200.000000"),
                trade(12, 0, 1_020, a, c, 7, Side::Buy, "0.5000", "200.000000"),
            ],
            vec![],
        );
        let found = CircularTradeDetector.scan(&snap, &ScanCtx::new());
        assert_eq!(found.len(), 1);
        let e = &found[0];
        assert_eq!(e.addresses.len(), 3);
        // min/max = 50/100 = 0.5 → 0.6 + 0.05.
        assert!((e.confidence - 0.65).abs() < 1e-9);
    }

    #[test]
    fn open_chain_produces_no_cycle() {
        let snap = snapshot(
            vec![
                trade(10, 0, 1_000, addr(2), addr(1), 7, Side::Buy, "0.5000", "10.000000"),
                trade(11, 0, 1_010, addr(3), addr(2), 7, Side::Buy, "0.5000", "10.000000"),
            ],
            vec![],
        );
        assert!(CircularTradeDetector.scan(&snap, &ScanCtx::new()).is_empty());
    }

    #[test]
    fn parallel_fills_aggregate_into_one_edge() {
        let a = addr(1);
        let b = addr(2);
        let snap = snapshot(
            vec![
                trade(10, 0, 1_000, b, a, 7, Side::Buy, "0.5000", "60.000000"),
                trade(10, 1, 1_000, b, a, 7, Side::Buy, "0.5000", "40.000000"),
                trade(11, 0, 1_010, a, b, 7, Side::Buy, "0.5000", "100.000000"),
            ],
            vec![],
        );
        let found = CircularTradeDetector.scan(&snap, &ScanCtx::new());
        assert_eq!(found.len(), 1);
        // Aggregated 50 vs 50: balanced.
        assert!((found[0].confidence - 0.7).abs() < 1e-9);
        assert_eq!(found[0].tx_hashes.len(), 3);
    }

    #[test]
    fn cancelled_run_returns_empty() {
        let a = addr(1);
        let b = addr(2);
        let snap = snapshot(
            vec![
                trade(10, 0, 1_000, b, a, 7, Side::Buy, "0.5000", "10.000000"),
                trade(11, 0, 1_010, a, b, 7, Side::Buy, "0.5000", "10.000000"),
            ],
            vec![],
        );
        let ctx = ScanCtx::new();
        ctx.cancel();
        assert!(CircularTradeDetector.scan(&snap, &ctx).is_empty());
    }
}
