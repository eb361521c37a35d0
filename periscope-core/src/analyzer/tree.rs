use std::str::FromStr;

use serde::Serialize;

use crate::apm::model::{OtelServiceNode, SpanKind};
use crate::error::ReceiverError;
use crate::model::{Trace, Traces};

/// Per top-level service: the matched sampled span plus the upstream's span
/// tree for that service.
#[derive(Debug, Clone)]
pub struct NodeSpanTrace {
    pub sampled: Trace,
    pub service: OtelServiceNode,
}

impl NodeSpanTrace {
    pub fn service_node(&self, span_id: &str) -> Option<&OtelServiceNode> {
        find_service_node(&self.service, span_id)
    }

    pub fn service_node_mut(&mut self, span_id: &str) -> Option<&mut OtelServiceNode> {
        find_service_node_mut(&mut self.service, span_id)
    }

    /// Direct client calls issued by the service owning `span_id`.
    pub fn client_calls(&self, span_id: &str) -> Vec<ClientCall> {
        let Some(service) = self.service_node(span_id) else {
            return Vec::new();
        };
        service
            .exit_spans
            .iter()
            .filter(|span| span.kind == SpanKind::Client)
            .map(|span| ClientCall {
                name: span.name.clone(),
                span_id: span.span_id.clone(),
                start_time: span.start_time,
                duration: span.duration,
                error: span.is_error(),
            })
            .collect()
    }
}

fn find_service_node<'a>(node: &'a OtelServiceNode, span_id: &str) -> Option<&'a OtelServiceNode> {
    if node.entry_spans.iter().any(|span| span.span_id == span_id) {
        return Some(node);
    }
    node.children
        .iter()
        .find_map(|child| find_service_node(child, span_id))
}

fn find_service_node_mut<'a>(
    node: &'a mut OtelServiceNode,
    span_id: &str,
) -> Option<&'a mut OtelServiceNode> {
    if node.entry_spans.iter().any(|span| span.span_id == span_id) {
        return Some(node);
    }
    node.children
        .iter_mut()
        .find_map(|child| find_service_node_mut(child, span_id))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientCall {
    pub name: String,
    pub span_id: String,
    pub start_time: u64,
    pub duration: u64,
    pub error: bool,
}

/// Match each top-level service of the upstream forest against the buffered
/// sampled spans. Services without a match are dropped here; callers treat
/// an empty result as "trace not found in the APM system".
pub fn build_span_traces(services: &[OtelServiceNode], traces: &Traces) -> Vec<NodeSpanTrace> {
    let span_map = traces.span_id_map();
    services
        .iter()
        .filter_map(|service| {
            service
                .entry_spans
                .iter()
                .find_map(|span| span_map.get(span.span_id.as_str()))
                .map(|matched| NodeSpanTrace {
                    sampled: (*matched).clone(),
                    service: service.clone(),
                })
        })
        .collect()
}

/// One node of the converted latency tree; serialized verbatim as the
/// relation_tree payload of slow reports.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceTreeNode {
    pub id: String,
    pub service_name: String,
    pub url: String,
    pub span_id: String,
    pub start_time: u64,
    pub total_time: u64,
    pub self_time: u64,
    /// Duration of direct external client calls, counted into self-time by
    /// the weighted mode.
    pub client_time: u64,
    pub is_traced: bool,
    pub is_sampled: bool,
    pub is_silent: bool,
    pub is_profiled: bool,
    pub is_path: bool,
    pub is_mutated: bool,
    pub mutated_value: u64,
    pub pod: String,
    pub pod_ns: String,
    pub workload: String,
    pub workload_type: String,
    pub threshold_type: String,
    pub threshold_range: String,
    pub threshold_value: f64,
    pub threshold_multiple: f64,
    pub children: Vec<TraceTreeNode>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceTree {
    pub root: TraceTreeNode,
}

/// Builds the latency tree for one sampled entry, computing self-time as
/// total minus the children's totals.
pub fn convert_slow_tree(span_trace: &NodeSpanTrace, traces: &Traces) -> TraceTree {
    TraceTree {
        root: convert_tree_node(&span_trace.service, traces),
    }
}

fn convert_tree_node(service: &OtelServiceNode, traces: &Traces) -> TraceTreeNode {
    let children: Vec<TraceTreeNode> = service
        .children
        .iter()
        .map(|child| convert_tree_node(child, traces))
        .collect();
    let children_total: u64 = children.iter().map(|child| child.total_time).sum();
    let client_time: u64 = service
        .exit_spans
        .iter()
        .filter(|span| span.kind == SpanKind::Client && span.next_span_id.is_empty())
        .map(|span| span.duration)
        .sum();

    let matched = service
        .entry_spans
        .iter()
        .find_map(|span| traces.find_trace(&span.span_id));
    let mut node = match matched {
        Some(trace) => TraceTreeNode {
            id: trace.instance_id(),
            service_name: trace.labels.service_name.clone(),
            url: trace.labels.url.clone(),
            span_id: trace.labels.apm_span_id.clone(),
            start_time: trace.labels.start_time,
            total_time: trace.labels.duration,
            is_traced: true,
            is_sampled: trace.labels.is_sampled,
            is_silent: trace.labels.is_silent,
            is_profiled: trace.labels.is_profiled,
            pod: trace.pod_name.clone(),
            pod_ns: trace.namespace.clone(),
            workload: trace.workload_name.clone(),
            workload_type: trace.workload_kind.clone(),
            threshold_type: trace.labels.threshold_type.clone(),
            threshold_range: trace.labels.threshold_range.clone(),
            threshold_value: trace.labels.threshold_value,
            threshold_multiple: trace.labels.threshold_multiple,
            ..Default::default()
        },
        None => {
            let entry = service.entry_spans.first();
            TraceTreeNode {
                id: entry.map(|s| s.service_name.clone()).unwrap_or_default(),
                service_name: entry.map(|s| s.service_name.clone()).unwrap_or_default(),
                url: entry.map(|s| s.name.clone()).unwrap_or_default(),
                span_id: entry.map(|s| s.span_id.clone()).unwrap_or_default(),
                start_time: entry.map(|s| s.start_time).unwrap_or_default(),
                total_time: entry.map(|s| s.duration).unwrap_or_default(),
                ..Default::default()
            }
        }
    };
    node.client_time = client_time;
    node.self_time = node.total_time.saturating_sub(children_total);
    node.children = children;
    node
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateMode {
    Leaf,
    Chain,
    Weighted,
}

impl FromStr for MutateMode {
    type Err = ReceiverError;

    fn from_str(s: &str) -> Result<MutateMode, ReceiverError> {
        match s {
            "" | "leaf" => Ok(MutateMode::Leaf),
            "chain" => Ok(MutateMode::Chain),
            "weighted" => Ok(MutateMode::Weighted),
            other => Err(ReceiverError::Config(format!(
                "unknown mutate_node_mode: {other}"
            ))),
        }
    }
}

fn node_ratio(node: &TraceTreeNode, mode: MutateMode) -> u64 {
    if node.total_time == 0 {
        return 0;
    }
    let self_time = match mode {
        MutateMode::Weighted => node.self_time.saturating_add(node.client_time),
        _ => node.self_time,
    };
    self_time.min(node.total_time) * 100 / node.total_time
}

/// Selects the mutated node: the node with the highest self/total ratio at
/// or above the threshold, subject to the mode's tie-breaks. Marks the
/// chosen node and its ancestor path inside the tree.
pub fn find_mutated_node(
    tree: &mut TraceTree,
    ratio_threshold: u64,
    mode: MutateMode,
) -> Result<TraceTreeNode, ReceiverError> {
    let path = match mode {
        MutateMode::Leaf | MutateMode::Weighted => best_by_ratio(&tree.root, ratio_threshold, mode),
        MutateMode::Chain => best_on_chain(&tree.root, ratio_threshold),
    };
    let Some(path) = path else {
        return Err(ReceiverError::SemanticDrop(format!(
            "no mutated node found over ratio threshold({ratio_threshold})"
        )));
    };

    let mut node = &mut tree.root;
    node.is_path = true;
    for index in &path {
        node = &mut node.children[*index];
        node.is_path = true;
    }
    node.is_mutated = true;
    node.mutated_value = node_ratio(node, mode);
    Ok(node.clone())
}

/// Pre-order scan keeping the best (ratio, depth) candidate; equal ratios
/// prefer the deeper node.
fn best_by_ratio(
    root: &TraceTreeNode,
    ratio_threshold: u64,
    mode: MutateMode,
) -> Option<Vec<usize>> {
    let mut best: Option<(u64, usize, Vec<usize>)> = None;
    let mut stack: Vec<(&TraceTreeNode, Vec<usize>)> = vec![(root, Vec::new())];
    while let Some((node, path)) = stack.pop() {
        let ratio = node_ratio(node, mode);
        if ratio >= ratio_threshold {
            let better = match &best {
                Some((best_ratio, best_depth, _)) => {
                    ratio > *best_ratio || (ratio == *best_ratio && path.len() > *best_depth)
                }
                None => true,
            };
            if better {
                best = Some((ratio, path.len(), path.clone()));
            }
        }
        for (index, child) in node.children.iter().enumerate() {
            let mut child_path = path.clone();
            child_path.push(index);
            stack.push((child, child_path));
        }
    }
    best.map(|(_, _, path)| path)
}

/// Walks down from the root following qualifying children, returning the
/// last qualifying node on that chain.
fn best_on_chain(root: &TraceTreeNode, ratio_threshold: u64) -> Option<Vec<usize>> {
    let mut best: Option<Vec<usize>> = None;
    let mut node = root;
    let mut path = Vec::new();
    loop {
        if node_ratio(node, MutateMode::Chain) >= ratio_threshold {
            best = Some(path.clone());
        }
        let next = node
            .children
            .iter()
            .enumerate()
            .filter(|(_, child)| node_ratio(child, MutateMode::Chain) >= ratio_threshold)
            .max_by_key(|(_, child)| node_ratio(child, MutateMode::Chain));
        match next {
            Some((index, child)) => {
                path.push(index);
                node = child;
            }
            None => break,
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(span_id: &str, total: u64, self_time: u64, children: Vec<TraceTreeNode>) -> TraceTreeNode {
        TraceTreeNode {
            span_id: span_id.to_string(),
            service_name: span_id.to_string(),
            total_time: total,
            self_time,
            children,
            ..Default::default()
        }
    }

    #[test]
    fn test_leaf_mode_prefers_highest_ratio() {
        let mut tree = TraceTree {
            root: node(
                "root",
                1000,
                100,
                vec![
                    node("slow-child", 500, 480, vec![]),
                    node("fast-child", 400, 100, vec![]),
                ],
            ),
        };
        let mutated = find_mutated_node(&mut tree, 90, MutateMode::Leaf).unwrap();
        assert_eq!(mutated.span_id, "slow-child");
        assert!(tree.root.is_path);
        assert!(tree.root.children[0].is_mutated);
        assert_eq!(tree.root.children[0].mutated_value, 96);
    }

    #[test]
    fn test_leaf_mode_breaks_ties_toward_leaves() {
        let mut tree = TraceTree {
            root: node(
                "root",
                100,
                100,
                vec![node("child", 100, 100, vec![node("leaf", 100, 100, vec![])])],
            ),
        };
        let mutated = find_mutated_node(&mut tree, 100, MutateMode::Leaf).unwrap();
        assert_eq!(mutated.span_id, "leaf");
    }

    #[test]
    fn test_no_candidate_is_semantic_drop() {
        let mut tree = TraceTree {
            root: node("root", 1000, 10, vec![node("child", 900, 10, vec![])]),
        };
        let err = find_mutated_node(&mut tree, 90, MutateMode::Leaf).unwrap_err();
        assert!(err.to_string().contains("ratio threshold(90)"));
    }

    #[test]
    fn test_chain_mode_stays_on_chain() {
        // The off-chain grandchild has the highest ratio but hangs off a
        // non-qualifying child.
        let mut tree = TraceTree {
            root: node(
                "root",
                1000,
                950,
                vec![
                    node("a", 100, 10, vec![node("a-leaf", 90, 90, vec![])]),
                    node("b", 900, 900, vec![]),
                ],
            ),
        };
        let mutated = find_mutated_node(&mut tree, 90, MutateMode::Chain).unwrap();
        assert_eq!(mutated.span_id, "b");
    }

    #[test]
    fn test_weighted_mode_counts_client_time() {
        let mut slow_client = node("client-heavy", 1000, 400, vec![]);
        slow_client.client_time = 550;
        let mut tree = TraceTree {
            root: node("root", 2000, 100, vec![slow_client, node("other", 900, 700, vec![])]),
        };
        // 400/1000 fails the plain test but (400+550)/1000 passes.
        let mutated = find_mutated_node(&mut tree, 90, MutateMode::Weighted).unwrap();
        assert_eq!(mutated.span_id, "client-heavy");
    }

    #[test]
    fn test_convert_tree_self_time() {
        use crate::apm::model::{OtelServiceNode, OtelSpan};
        use crate::model::{TraceLabels, Traces};

        let service = OtelServiceNode {
            entry_spans: vec![OtelSpan {
                service_name: "api".to_string(),
                name: "GET /a".to_string(),
                span_id: "s1".to_string(),
                duration: 1000,
                kind: SpanKind::Server,
                ..Default::default()
            }],
            exit_spans: vec![],
            children: vec![OtelServiceNode {
                entry_spans: vec![OtelSpan {
                    service_name: "db-layer".to_string(),
                    name: "GET /b".to_string(),
                    span_id: "s2".to_string(),
                    duration: 600,
                    kind: SpanKind::Server,
                    ..Default::default()
                }],
                exit_spans: vec![],
                children: vec![],
            }],
        };

        let mut traces = Traces::new("t1");
        traces.add_trace(crate::model::Trace {
            labels: TraceLabels {
                trace_id: "t1".to_string(),
                apm_span_id: "s1".to_string(),
                service_name: "api".to_string(),
                url: "GET /a".to_string(),
                duration: 1000,
                is_sampled: true,
                top_span: true,
                ..Default::default()
            },
            ..Default::default()
        });

        let span_traces = build_span_traces(std::slice::from_ref(&service), &traces);
        assert_eq!(span_traces.len(), 1);
        let tree = convert_slow_tree(&span_traces[0], &traces);
        assert_eq!(tree.root.total_time, 1000);
        assert_eq!(tree.root.self_time, 400);
        assert!(tree.root.is_traced);
        assert!(!tree.root.children[0].is_traced);
        assert_eq!(tree.root.children[0].self_time, 600);
    }
}
