use serde::Serialize;

use crate::analyzer::tree::NodeSpanTrace;
use crate::apm::model::{OtelServiceNode, OtelSpan};
use crate::error::ReceiverError;
use crate::model::Traces;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorException {
    #[serde(rename = "type")]
    pub exception_type: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorSpan {
    pub span_id: String,
    pub exceptions: Vec<ErrorException>,
}

/// Node of the converted error tree; serialized as the relation_tree payload
/// of error reports and flattened into error_propagation rows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorTreeNode {
    pub id: String,
    pub service_name: String,
    pub url: String,
    pub span_id: String,
    pub start_time: u64,
    pub total_time: u64,
    pub is_error: bool,
    pub is_traced: bool,
    pub is_sampled: bool,
    pub is_profiled: bool,
    pub error_spans: Vec<ErrorSpan>,
    pub depth: u32,
    pub path: String,
    pub pod: String,
    pub pod_ns: String,
    pub workload: String,
    pub workload_type: String,
    pub threshold_type: String,
    pub threshold_range: String,
    pub threshold_value: f64,
    pub threshold_multiple: f64,
    pub children: Vec<ErrorTreeNode>,
}

impl ErrorTreeNode {
    /// First recorded exception on this node, treated as the root cause.
    pub fn root_cause_error(&self) -> Option<&ErrorException> {
        self.error_spans
            .iter()
            .find_map(|span| span.exceptions.first())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorTree {
    pub root: ErrorTreeNode,
}

pub fn convert_error_tree(span_trace: &NodeSpanTrace, traces: &Traces) -> ErrorTree {
    ErrorTree {
        root: convert_error_node(&span_trace.service, traces, "", 0, 1),
    }
}

fn convert_error_node(
    service: &OtelServiceNode,
    traces: &Traces,
    path: &str,
    index: usize,
    depth: u32,
) -> ErrorTreeNode {
    let current_path = format!("{path}{index}.");
    let matched = service
        .entry_spans
        .iter()
        .find_map(|span| traces.find_trace(&span.span_id));

    let span_error = service
        .entry_spans
        .iter()
        .chain(service.exit_spans.iter())
        .any(|span| span.is_error());
    let error_spans = collect_error_spans(service);

    let mut node = match matched {
        Some(trace) => ErrorTreeNode {
            id: trace.instance_id(),
            service_name: trace.labels.service_name.clone(),
            url: trace.labels.url.clone(),
            span_id: trace.labels.apm_span_id.clone(),
            start_time: trace.labels.start_time,
            total_time: trace.labels.duration,
            is_error: trace.labels.is_error || span_error,
            is_traced: true,
            is_sampled: trace.labels.is_sampled,
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
            ErrorTreeNode {
                id: entry.map(|s| s.service_name.clone()).unwrap_or_default(),
                service_name: entry.map(|s| s.service_name.clone()).unwrap_or_default(),
                url: entry.map(|s| s.name.clone()).unwrap_or_default(),
                span_id: entry.map(|s| s.span_id.clone()).unwrap_or_default(),
                start_time: entry.map(|s| s.start_time).unwrap_or_default(),
                total_time: entry.map(|s| s.duration).unwrap_or_default(),
                is_error: span_error,
                ..Default::default()
            }
        }
    };
    node.error_spans = error_spans;
    node.depth = depth;
    node.path = current_path.clone();
    node.children = service
        .children
        .iter()
        .enumerate()
        .map(|(i, child)| convert_error_node(child, traces, &current_path, i, depth + 1))
        .collect();
    node
}

fn collect_error_spans(service: &OtelServiceNode) -> Vec<ErrorSpan> {
    collect_span_exceptions(service.entry_spans.iter().chain(service.exit_spans.iter()))
}

pub fn collect_span_exceptions<'a>(spans: impl Iterator<Item = &'a OtelSpan>) -> Vec<ErrorSpan> {
    spans
        .filter(|span| !span.exceptions.is_empty())
        .map(|span| ErrorSpan {
            span_id: span.span_id.clone(),
            exceptions: span
                .exceptions
                .iter()
                .map(|exception| ErrorException {
                    exception_type: exception.exception_type.clone(),
                    message: exception.message.clone(),
                })
                .collect(),
        })
        .collect()
}

/// Root cause: the deepest error-bearing node, earliest occurrence on ties.
pub fn find_root_cause_node(tree: &ErrorTree) -> Result<ErrorTreeNode, ReceiverError> {
    let mut best: Option<&ErrorTreeNode> = None;
    let mut stack = vec![&tree.root];
    while let Some(node) = stack.pop() {
        if node.is_error {
            let better = match best {
                Some(current) => {
                    node.depth > current.depth
                        || (node.depth == current.depth && node.start_time < current.start_time)
                }
                None => true,
            };
            if better {
                best = Some(node);
            }
        }
        stack.extend(node.children.iter());
    }
    best.cloned().ok_or_else(|| {
        ReceiverError::SemanticDrop("no error node is found in trace".to_string())
    })
}

/// Flattened error tree for the error_propagation table.
#[derive(Debug, Clone, Default)]
pub struct ErrorPropagation {
    pub services: Vec<String>,
    pub instances: Vec<String>,
    pub urls: Vec<String>,
    pub is_errors: Vec<bool>,
    pub is_traceds: Vec<bool>,
    pub error_types: Vec<Vec<String>>,
    pub error_messages: Vec<Vec<String>>,
    pub depths: Vec<u32>,
    pub paths: Vec<String>,
}

impl ErrorPropagation {
    pub fn from_tree(root: &ErrorTreeNode) -> ErrorPropagation {
        let mut propagation = ErrorPropagation::default();
        propagation.collect(root);
        propagation
    }

    fn collect(&mut self, node: &ErrorTreeNode) {
        let mut types = Vec::new();
        let mut messages = Vec::new();
        for error_span in &node.error_spans {
            for exception in &error_span.exceptions {
                types.push(exception.exception_type.clone());
                messages.push(exception.message.clone());
            }
        }
        self.services.push(node.service_name.clone());
        self.instances.push(node.id.clone());
        self.urls.push(node.url.clone());
        self.is_errors.push(node.is_error);
        self.is_traceds.push(node.is_traced);
        self.error_types.push(types);
        self.error_messages.push(messages);
        self.depths.push(node.depth);
        self.paths.push(node.path.clone());
        for child in &node.children {
            self.collect(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_node(span_id: &str, depth: u32, start: u64, error: bool) -> ErrorTreeNode {
        ErrorTreeNode {
            span_id: span_id.to_string(),
            service_name: span_id.to_string(),
            depth,
            start_time: start,
            is_error: error,
            ..Default::default()
        }
    }

    #[test]
    fn test_root_cause_prefers_deepest() {
        let mut root = error_node("root", 1, 100, true);
        let mut mid = error_node("mid", 2, 110, true);
        mid.children.push(error_node("leaf", 3, 120, true));
        root.children.push(mid);
        let tree = ErrorTree { root };
        assert_eq!(find_root_cause_node(&tree).unwrap().span_id, "leaf");
    }

    #[test]
    fn test_root_cause_tie_breaks_earliest() {
        let mut root = error_node("root", 1, 100, false);
        root.children.push(error_node("late", 2, 150, true));
        root.children.push(error_node("early", 2, 120, true));
        let tree = ErrorTree { root };
        assert_eq!(find_root_cause_node(&tree).unwrap().span_id, "early");
    }

    #[test]
    fn test_no_error_node_is_semantic_drop() {
        let tree = ErrorTree {
            root: error_node("root", 1, 100, false),
        };
        let err = find_root_cause_node(&tree).unwrap_err();
        assert!(err.to_string().contains("no error node"));
    }

    #[test]
    fn test_propagation_flattening() {
        let mut root = error_node("root", 1, 100, false);
        root.path = "0.".to_string();
        let mut child = error_node("child", 2, 110, true);
        child.path = "0.0.".to_string();
        child.error_spans.push(ErrorSpan {
            span_id: "child".to_string(),
            exceptions: vec![ErrorException {
                exception_type: "java.lang.NullPointerException".to_string(),
                message: "boom".to_string(),
            }],
        });
        root.children.push(child);

        let propagation = ErrorPropagation::from_tree(&root);
        assert_eq!(propagation.services, vec!["root", "child"]);
        assert_eq!(propagation.paths, vec!["0.", "0.0."]);
        assert_eq!(propagation.is_errors, vec![false, true]);
        assert_eq!(
            propagation.error_types[1],
            vec!["java.lang.NullPointerException"]
        );
        assert!(propagation.error_types[0].is_empty());
    }
}
