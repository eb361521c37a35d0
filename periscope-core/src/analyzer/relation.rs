use serde::Serialize;
use tracing::warn;

use crate::analyzer::external::{External, GROUP_MQ};
use crate::analyzer::topology::Topology;
use crate::apm::model::SpanKind;

/// Directed edge of the service topology, keyed by a dot-separated
/// positional path rooted at the root span id.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Relationship {
    pub path: String,
    pub parent_service: String,
    pub parent_url: String,
    pub parent_traced: bool,
    pub client_group: String,
    pub client_type: String,
    pub client_peer: String,
    pub client_key: String,
    pub service: String,
    pub url: String,
    pub is_traced: bool,
    pub is_async: bool,
}

/// One client-side external flattened for the service_client table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientCallRow {
    pub start_time: u64,
    pub service: String,
    pub url: String,
    pub client_group: String,
    pub client_type: String,
    pub client_peer: String,
    pub client_key: String,
    pub error: bool,
    pub duration: u64,
}

/// All rows derived from one topology root for one trace.
#[derive(Debug, Clone, Default)]
pub struct Relation {
    pub trace_id: String,
    pub start_time: u64,
    pub entry_service: String,
    pub entry_url: String,
    pub miss_top: bool,
    pub relationships: Vec<Relationship>,
    pub client_rows: Vec<ClientCallRow>,
}

impl Relation {
    pub fn build(trace_id: &str, topology: &Topology, root: usize) -> Relation {
        let root_node = topology.node(root);
        let mut relation = Relation {
            trace_id: trace_id.to_string(),
            start_time: root_node.start_time,
            entry_service: root_node.service_name.clone(),
            entry_url: root_node.url.clone(),
            miss_top: !root_node.top_node,
            relationships: Vec::new(),
            client_rows: Vec::new(),
        };
        relation.collect(topology, root, &format!("{}_", root_node.span_id), 0);
        relation.collect_client_rows(topology, root);
        relation
    }

    fn collect(&mut self, topology: &Topology, index: usize, path: &str, position: usize) {
        let node = topology.node(index);
        let current_path = format!("{path}{position}.");

        let mut server_side: Option<&External> = None;
        let mut client_sides: Vec<&External> = Vec::new();
        for external in &node.externals {
            if external.kind == SpanKind::Consumer {
                server_side = Some(external);
            } else if external.next_span_id.is_empty() {
                client_sides.push(external);
            }
        }
        if server_side.is_none() {
            server_side = topology.parent_side_external(index);
        }

        if node.parent.is_some() && server_side.is_none() {
            let parent = topology.node(node.parent.unwrap());
            warn!(
                trace_id = self.trace_id,
                span_id = node.span_id,
                "missing relation side {} -> {}",
                parent.service_name,
                node.service_name
            );
            return;
        }

        self.relationships.push(server_relationship(
            &current_path,
            server_side,
            topology,
            index,
        ));
        let child_count = node.children.len();
        for (i, client) in client_sides.iter().enumerate() {
            self.relationships.push(client_relationship(
                &format!("{current_path}{}.", child_count + i),
                client,
                topology,
                index,
            ));
        }

        for (i, child) in node.children.clone().into_iter().enumerate() {
            self.collect(topology, child, &current_path, i);
        }
    }

    fn collect_client_rows(&mut self, topology: &Topology, index: usize) {
        let node = topology.node(index);
        for external in &node.externals {
            if external.kind != SpanKind::Client {
                continue;
            }
            self.client_rows.push(ClientCallRow {
                start_time: external.start_time,
                service: node.service_name.clone(),
                url: node.url.clone(),
                client_group: external.group.clone(),
                client_type: external.external_type.clone(),
                client_peer: external.peer.clone(),
                client_key: external.name.clone(),
                error: external.error,
                duration: external.duration,
            });
        }
        for child in &node.children {
            self.collect_client_rows(topology, *child);
        }
    }
}

fn server_relationship(
    path: &str,
    client: Option<&External>,
    topology: &Topology,
    index: usize,
) -> Relationship {
    let node = topology.node(index);
    let mut relationship = Relationship {
        path: path.to_string(),
        service: node.service_name.clone(),
        url: node.url.clone(),
        is_traced: node.is_traced,
        ..Default::default()
    };
    if let Some(parent) = node.parent {
        let parent = topology.node(parent);
        relationship.parent_service = parent.service_name.clone();
        relationship.parent_url = parent.url.clone();
        relationship.parent_traced = parent.is_traced;
    }
    if let Some(client) = client {
        relationship.client_group = client.group.clone();
        relationship.client_type = client.external_type.clone();
        relationship.client_peer = client.peer.clone();
        relationship.client_key = client.name.clone();
        relationship.is_async = client.group == GROUP_MQ;
    }
    relationship
}

fn client_relationship(
    path: &str,
    client: &External,
    topology: &Topology,
    index: usize,
) -> Relationship {
    let node = topology.node(index);
    Relationship {
        path: path.to_string(),
        parent_service: node.service_name.clone(),
        parent_url: node.url.clone(),
        client_group: client.group.clone(),
        client_type: client.external_type.clone(),
        client_peer: client.peer.clone(),
        client_key: client.name.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::external::ExternalFactory;
    use crate::apm::model::{OtelServiceNode, OtelSpan};
    use std::collections::HashMap;

    fn span(
        service: &str,
        name: &str,
        span_id: &str,
        p_span_id: &str,
        next_span_id: &str,
        kind: SpanKind,
        attributes: &[(&str, &str)],
    ) -> OtelSpan {
        OtelSpan {
            service_name: service.to_string(),
            name: name.to_string(),
            span_id: span_id.to_string(),
            p_span_id: p_span_id.to_string(),
            next_span_id: next_span_id.to_string(),
            kind,
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    /// gateway -http-> backend, gateway also calls mysql directly.
    fn http_and_db_services() -> Vec<OtelServiceNode> {
        vec![OtelServiceNode {
            entry_spans: vec![span(
                "gateway",
                "GET /wait/callOthers",
                "root1",
                "",
                "",
                SpanKind::Server,
                &[],
            )],
            exit_spans: vec![
                span(
                    "gateway",
                    "GET",
                    "exit1",
                    "root1",
                    "child1",
                    SpanKind::Client,
                    &[
                        ("http.method", "GET"),
                        ("http.url", "http://localhost:9999/cpu"),
                        ("net.peer.name", "localhost"),
                        ("net.peer.port", "9999"),
                    ],
                ),
                span(
                    "gateway",
                    "SELECT",
                    "exit2",
                    "root1",
                    "",
                    SpanKind::Client,
                    &[
                        ("db.system", "mysql"),
                        ("db.name", "test"),
                        ("db.statement", "select a from weather"),
                        ("net.peer.name", "localhost"),
                        ("net.peer.port", "3306"),
                    ],
                ),
            ],
            children: vec![OtelServiceNode {
                entry_spans: vec![span(
                    "backend",
                    "GET /cpu/loop",
                    "child1",
                    "exit1",
                    "",
                    SpanKind::Server,
                    &[],
                )],
                exit_spans: vec![],
                children: vec![],
            }],
        }]
    }

    #[test]
    fn test_http_chain_paths_and_sides() {
        let services = http_and_db_services();
        let sampled = HashMap::new();
        let factory = ExternalFactory::new("");
        let topology = Topology::build(&services, &sampled, &factory);
        let relation = Relation::build("trace-1", &topology, topology.roots[0]);

        assert_eq!(relation.entry_service, "gateway");
        assert_eq!(relation.relationships.len(), 3);

        let root = &relation.relationships[0];
        assert_eq!(root.path, "root1_0.");
        assert_eq!(root.service, "gateway");
        assert_eq!(root.url, "GET /wait/callOthers");
        assert!(root.parent_service.is_empty());

        // Client sides come right after the server side, indexed past the
        // child count.
        let db = &relation.relationships[1];
        assert_eq!(db.path, "root1_0.1.");
        assert_eq!(db.parent_service, "gateway");
        assert_eq!(db.client_group, "db");
        assert_eq!(db.client_type, "mysql");
        assert_eq!(db.client_peer, "localhost:3306");
        assert_eq!(db.client_key, "SELECT test.weather");
        assert!(db.service.is_empty());

        let child = &relation.relationships[2];
        assert_eq!(child.path, "root1_0.0.");
        assert_eq!(child.parent_service, "gateway");
        assert_eq!(child.service, "backend");
        assert_eq!(child.url, "GET /cpu/loop");
        assert_eq!(child.client_group, "external");
        assert_eq!(child.client_type, "http");
        assert!(!child.is_async);
    }

    #[test]
    fn test_consumer_side_marks_async() {
        let services = vec![OtelServiceNode {
            entry_spans: vec![span(
                "provider",
                "GET /send",
                "p1",
                "",
                "",
                SpanKind::Server,
                &[],
            )],
            exit_spans: vec![span(
                "provider",
                "topic publish",
                "p-exit",
                "p1",
                "c1",
                SpanKind::Producer,
                &[
                    ("messaging.system", "kafka"),
                    ("messaging.destination.name", "topic"),
                ],
            )],
            children: vec![OtelServiceNode {
                entry_spans: vec![span(
                    "consumer",
                    "topic process",
                    "c1",
                    "p-exit",
                    "",
                    SpanKind::Server,
                    &[],
                )],
                exit_spans: vec![span(
                    "consumer",
                    "topic process",
                    "c1-consume",
                    "p-exit",
                    "",
                    SpanKind::Consumer,
                    &[
                        ("messaging.system", "kafka"),
                        ("messaging.destination.name", "topic"),
                    ],
                )],
                children: vec![],
            }],
        }];
        let sampled = HashMap::new();
        let factory = ExternalFactory::new("");
        let topology = Topology::build(&services, &sampled, &factory);
        let relation = Relation::build("trace-2", &topology, topology.roots[0]);

        let consumer = relation
            .relationships
            .iter()
            .find(|r| r.service == "consumer")
            .unwrap();
        assert!(consumer.is_async);
        assert_eq!(consumer.client_group, "mq");
        assert_eq!(consumer.client_type, "kafka");
        assert_eq!(consumer.client_key, "topic");
    }

    #[test]
    fn test_client_rows_collected() {
        let services = http_and_db_services();
        let sampled = HashMap::new();
        let factory = ExternalFactory::new("");
        let topology = Topology::build(&services, &sampled, &factory);
        let relation = Relation::build("trace-1", &topology, topology.roots[0]);

        assert_eq!(relation.client_rows.len(), 2);
        assert!(relation
            .client_rows
            .iter()
            .any(|row| row.client_group == "db" && row.client_key == "SELECT test.weather"));
    }
}
