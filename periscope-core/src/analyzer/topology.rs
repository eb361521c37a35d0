use std::collections::HashMap;

use crate::analyzer::external::{External, ExternalFactory};
use crate::apm::model::{OtelServiceNode, OtelSpan};
use crate::model::Trace;

/// One service instance inside the reconstructed call forest. Nodes live in
/// the [`Topology`] arena; `parent` and `children` are indices, ownership
/// only flows parent to children.
#[derive(Debug, Clone)]
pub struct TopologyNode {
    pub start_time: u64,
    pub service_name: String,
    pub url: String,
    pub span_id: String,
    /// Exit span of the parent service whose next_span_id points at this
    /// node's entry span; attributes the client side of the edge.
    pub side_span_id: String,
    pub top_node: bool,
    pub node_name: String,
    pub node_ip: String,
    pub pid: u32,
    pub container_id: String,
    pub is_traced: bool,
    pub externals: Vec<External>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct Topology {
    pub nodes: Vec<TopologyNode>,
    pub roots: Vec<usize>,
}

impl Topology {
    /// Builds the forest top-down, matching each service against the sampled
    /// traces where possible and falling back to the upstream's declared
    /// entry span for untraced services.
    pub fn build(
        services: &[OtelServiceNode],
        sampled_traces: &HashMap<&str, &Trace>,
        factory: &ExternalFactory,
    ) -> Topology {
        let mut topology = Topology::default();
        for service in services {
            let root = topology.collect_node(None, None, service, sampled_traces, factory);
            topology.roots.push(root);
        }
        topology
    }

    fn collect_node(
        &mut self,
        parent: Option<usize>,
        parent_service: Option<&OtelServiceNode>,
        service: &OtelServiceNode,
        sampled_traces: &HashMap<&str, &Trace>,
        factory: &ExternalFactory,
    ) -> usize {
        let node = new_server_node(parent, parent_service, service, sampled_traces, factory);
        let index = self.nodes.len();
        self.nodes.push(node);
        if let Some(parent) = parent {
            self.nodes[parent].children.push(index);
        }
        for child in &service.children {
            self.collect_node(Some(index), Some(service), child, sampled_traces, factory);
        }
        index
    }

    pub fn node(&self, index: usize) -> &TopologyNode {
        &self.nodes[index]
    }

    /// The external on the parent side that carried the call into this node.
    pub fn parent_side_external(&self, index: usize) -> Option<&External> {
        let node = &self.nodes[index];
        let parent = node.parent?;
        if node.side_span_id.is_empty() {
            return None;
        }
        self.nodes[parent]
            .externals
            .iter()
            .find(|external| external.span_id == node.side_span_id)
    }
}

fn new_server_node(
    parent: Option<usize>,
    parent_service: Option<&OtelServiceNode>,
    service: &OtelServiceNode,
    sampled_traces: &HashMap<&str, &Trace>,
    factory: &ExternalFactory,
) -> TopologyNode {
    let matched = match_sampled_trace(service, sampled_traces);
    let (start_time, service_name, url, span_id, node_name, node_ip, pid, container_id, is_traced) =
        match matched {
            Some(trace) => (
                trace.labels.start_time,
                trace.labels.service_name.clone(),
                trace.labels.url.clone(),
                trace.labels.apm_span_id.clone(),
                trace.labels.node_name.clone(),
                trace.labels.node_ip.clone(),
                trace.labels.pid,
                trace.labels.container_id.clone(),
                true,
            ),
            None => {
                let entry = service.entry_span().cloned().unwrap_or_default();
                (
                    entry.start_time,
                    entry.service_name,
                    entry.name,
                    entry.span_id,
                    "unknown".to_string(),
                    "unknown".to_string(),
                    0,
                    String::new(),
                    false,
                )
            }
        };

    TopologyNode {
        start_time,
        service_name,
        url,
        span_id,
        side_span_id: side_span_id(parent_service, service),
        top_node: service.is_top_node(),
        node_name,
        node_ip,
        pid,
        container_id,
        is_traced,
        externals: factory.build_externals(service),
        parent,
        children: Vec::new(),
    }
}

pub fn match_sampled_trace<'a>(
    service: &OtelServiceNode,
    sampled_traces: &HashMap<&str, &'a Trace>,
) -> Option<&'a Trace> {
    service
        .entry_spans
        .iter()
        .find_map(|span| sampled_traces.get(span.span_id.as_str()).copied())
}

fn side_span_id(parent_service: Option<&OtelServiceNode>, service: &OtelServiceNode) -> String {
    let Some(parent_service) = parent_service else {
        return String::new();
    };
    parent_service
        .exit_spans
        .iter()
        .find(|exit: &&OtelSpan| service.match_entry_span(&exit.next_span_id))
        .map(|exit| exit.span_id.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apm::model::SpanKind;
    use crate::model::TraceLabels;

    fn entry(service: &str, span_id: &str, p_span_id: &str, name: &str) -> OtelSpan {
        OtelSpan {
            service_name: service.to_string(),
            name: name.to_string(),
            span_id: span_id.to_string(),
            p_span_id: p_span_id.to_string(),
            kind: SpanKind::Server,
            ..Default::default()
        }
    }

    fn exit(span_id: &str, next_span_id: &str) -> OtelSpan {
        OtelSpan {
            span_id: span_id.to_string(),
            next_span_id: next_span_id.to_string(),
            kind: SpanKind::Client,
            ..Default::default()
        }
    }

    fn sampled(span_id: &str, service: &str, url: &str) -> Trace {
        Trace {
            labels: TraceLabels {
                apm_span_id: span_id.to_string(),
                service_name: service.to_string(),
                url: url.to_string(),
                node_name: "node-1".to_string(),
                node_ip: "10.0.0.1".to_string(),
                pid: 42,
                is_sampled: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn two_level_services() -> Vec<OtelServiceNode> {
        vec![OtelServiceNode {
            entry_spans: vec![entry("gateway", "a", "", "GET /entry")],
            exit_spans: vec![exit("a-exit", "b")],
            children: vec![OtelServiceNode {
                entry_spans: vec![entry("backend", "b", "a-exit", "GET /child")],
                exit_spans: vec![],
                children: vec![],
            }],
        }]
    }

    #[test]
    fn test_traced_and_untraced_nodes() {
        let services = two_level_services();
        let root_trace = sampled("a", "gateway", "GET /entry");
        let sampled_map: HashMap<&str, &Trace> =
            [("a", &root_trace)].into_iter().collect();
        let factory = ExternalFactory::new("");

        let topology = Topology::build(&services, &sampled_map, &factory);
        assert_eq!(topology.roots.len(), 1);
        let root = topology.node(topology.roots[0]);
        assert!(root.is_traced);
        assert!(root.top_node);
        assert_eq!(root.node_ip, "10.0.0.1");
        assert_eq!(root.children.len(), 1);

        let child = topology.node(root.children[0]);
        assert!(!child.is_traced);
        assert_eq!(child.node_name, "unknown");
        assert_eq!(child.node_ip, "unknown");
        assert_eq!(child.url, "GET /child");
        assert_eq!(child.side_span_id, "a-exit");
        assert_eq!(child.parent, Some(topology.roots[0]));
    }

    #[test]
    fn test_parent_side_external() {
        let services = two_level_services();
        let sampled_map = HashMap::new();
        let factory = ExternalFactory::new("");
        let topology = Topology::build(&services, &sampled_map, &factory);

        let child_index = topology.node(topology.roots[0]).children[0];
        let side = topology.parent_side_external(child_index).unwrap();
        assert_eq!(side.span_id, "a-exit");
        assert!(topology.parent_side_external(topology.roots[0]).is_none());
    }
}
