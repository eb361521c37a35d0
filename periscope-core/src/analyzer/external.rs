use serde::Serialize;
use tracing::debug;

use crate::apm::model::{
    OtelServiceNode, OtelSpan, SpanKind, ATTR_DB_NAME, ATTR_DB_OPERATION, ATTR_DB_SQL_TABLE,
    ATTR_DB_STATEMENT, ATTR_DB_SYSTEM, ATTR_MESSAGING_DESTINATION, ATTR_MESSAGING_SYSTEM,
    ATTR_RPC_SYSTEM,
};

pub const GROUP_EXTERNAL: &str = "external";
pub const GROUP_DB: &str = "db";
pub const GROUP_MQ: &str = "mq";

pub const UNKNOWN: &str = "unknown";

/// A non-server span classified by protocol family. Used both for topology
/// relationships and for client-side metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct External {
    pub start_time: u64,
    pub duration: u64,
    pub next_span_id: String,
    pub p_span_id: String,
    pub span_id: String,
    pub group: String,
    pub external_type: String,
    pub kind: SpanKind,
    pub name: String,
    pub peer: String,
    pub error: bool,
    pub detail: String,
}

impl External {
    fn from_span(span: &OtelSpan) -> External {
        External {
            start_time: span.start_time,
            duration: span.duration,
            span_id: span.span_id.clone(),
            next_span_id: span.next_span_id.clone(),
            p_span_id: span.p_span_id.clone(),
            kind: span.kind,
            error: span.is_error(),
            ..Default::default()
        }
    }

    fn with_group(mut self, group: &str) -> External {
        self.group = group.to_string();
        self
    }

    fn with_type(mut self, external_type: &str) -> External {
        self.external_type = external_type.to_string();
        self
    }

    fn with_name(mut self, name: impl Into<String>) -> External {
        self.name = name.into();
        self
    }

    fn with_peer(mut self, peer: impl Into<String>) -> External {
        self.peer = peer.into();
        self
    }

    fn with_detail(mut self, detail: impl Into<String>) -> External {
        self.detail = detail.into();
        self
    }
}

trait ExternalParser {
    fn parse(&self, span: &OtelSpan) -> Option<External>;
}

struct DbParser;

impl ExternalParser for DbParser {
    fn parse(&self, span: &OtelSpan) -> Option<External> {
        if span.kind != SpanKind::Client {
            return None;
        }
        let db_system = span.attribute(ATTR_DB_SYSTEM)?;
        let mut name = String::new();
        // Key-value stores already carry the command in the span name.
        if matches!(db_system, "redis" | "memcached" | "aerospike") {
            name = span.name.clone();
        }
        let db_statement = span.attribute(ATTR_DB_STATEMENT).unwrap_or("");
        let operation = span.attribute(ATTR_DB_OPERATION).unwrap_or("");
        if name.is_empty() {
            let db_name = span.attribute(ATTR_DB_NAME).unwrap_or("");
            let table = span.attribute(ATTR_DB_SQL_TABLE).unwrap_or("");
            if !table.is_empty() && !operation.is_empty() {
                name = join_db_name(operation, db_name, table);
            } else if !db_statement.is_empty() {
                if let Some((operation, table)) = parse_sql_operation_and_table(db_statement) {
                    name = join_db_name(&operation, db_name, &table);
                } else {
                    debug!(statement = db_statement, "unparsable sql statement");
                }
            }
        }
        if name.is_empty() {
            name = span.name.clone();
        }
        let detail = if db_statement.is_empty() {
            operation
        } else {
            db_statement
        };
        Some(
            External::from_span(span)
                .with_group(GROUP_DB)
                .with_type(db_system)
                .with_name(name)
                .with_peer(span.peer(""))
                .with_detail(detail),
        )
    }
}

fn join_db_name(operation: &str, db_name: &str, table: &str) -> String {
    if db_name.is_empty() {
        format!("{operation} {table}")
    } else {
        format!("{operation} {db_name}.{table}")
    }
}

/// Best-effort extraction of `(OPERATION, table)` from a SQL statement.
pub fn parse_sql_operation_and_table(statement: &str) -> Option<(String, String)> {
    let mut words = statement.split_whitespace();
    let operation = words.next()?.to_uppercase();
    let table = match operation.as_str() {
        "SELECT" | "DELETE" => {
            let mut after_from = words.skip_while(|w| !w.eq_ignore_ascii_case("from"));
            after_from.next()?;
            after_from.next()?
        }
        "INSERT" | "REPLACE" => {
            let mut after_into = words.skip_while(|w| !w.eq_ignore_ascii_case("into"));
            after_into.next()?;
            after_into.next()?
        }
        "UPDATE" => words.next()?,
        _ => return None,
    };
    let table = table
        .trim_matches(|c| c == '`' || c == '"' || c == '\'')
        .split('(')
        .next()
        .unwrap_or("")
        .trim_end_matches(';');
    if table.is_empty() {
        return None;
    }
    Some((operation, table.to_string()))
}

struct HttpParser {
    url_parser: String,
}

impl ExternalParser for HttpParser {
    fn parse(&self, span: &OtelSpan) -> Option<External> {
        if span.kind != SpanKind::Client {
            return None;
        }
        let method = span.http_method()?;
        let url = span.http_detail();
        let name = if self.url_parser == "topUrl" {
            format!("{method} {}", get_top_url(&url))
        } else {
            method.to_string()
        };
        Some(
            External::from_span(span)
                .with_group(GROUP_EXTERNAL)
                .with_type("http")
                .with_name(name)
                .with_peer(span.peer(""))
                .with_detail(url),
        )
    }
}

/// First path segment of a URL, with or without a scheme.
pub fn get_top_url(url: &str) -> String {
    let parts: Vec<&str> = url.split('/').collect();
    if parts.len() == 1 {
        return url.to_string();
    }
    if parts.len() >= 3 && parts[0].ends_with(':') && parts[1].is_empty() {
        // schema://host:port/path
        if parts.len() == 3 {
            return "/".to_string();
        }
        return format!("/{}", parts[3]);
    }
    format!("/{}", parts[1])
}

struct RpcParser;

impl ExternalParser for RpcParser {
    fn parse(&self, span: &OtelSpan) -> Option<External> {
        if span.kind != SpanKind::Client {
            return None;
        }
        let rpc_system = span.attribute(ATTR_RPC_SYSTEM)?;
        Some(
            External::from_span(span)
                .with_group(GROUP_EXTERNAL)
                .with_type(rpc_system)
                .with_name(span.name.clone())
                .with_peer(span.peer(""))
                .with_detail(span.rpc_detail(&span.name)),
        )
    }
}

struct MqParser;

impl ExternalParser for MqParser {
    fn parse(&self, span: &OtelSpan) -> Option<External> {
        if !matches!(
            span.kind,
            SpanKind::Client | SpanKind::Producer | SpanKind::Consumer
        ) {
            return None;
        }
        let mq_system = match span.attribute(ATTR_MESSAGING_SYSTEM) {
            Some(system) => system,
            None if span.kind == SpanKind::Client => return None,
            None => UNKNOWN,
        };
        let (name, detail) = if span.kind == SpanKind::Client {
            (
                span.name.clone(),
                span.attribute(ATTR_MESSAGING_DESTINATION)
                    .unwrap_or("")
                    .to_string(),
            )
        } else {
            (span.message_destination(UNKNOWN), span.name.clone())
        };
        Some(
            External::from_span(span)
                .with_group(GROUP_MQ)
                .with_type(mq_system)
                .with_name(name)
                .with_peer(span.peer(""))
                .with_detail(detail),
        )
    }
}

struct UnknownParser;

impl ExternalParser for UnknownParser {
    fn parse(&self, span: &OtelSpan) -> Option<External> {
        Some(
            External::from_span(span)
                .with_group(GROUP_EXTERNAL)
                .with_type(UNKNOWN)
                .with_name(span.name.clone())
                .with_peer(span.peer("")),
        )
    }
}

/// Runs the parser pipeline over the entry and exit spans of a service.
pub struct ExternalFactory {
    db: DbParser,
    http: HttpParser,
    rpc: RpcParser,
    mq: MqParser,
    unknown: UnknownParser,
}

impl ExternalFactory {
    pub fn new(url_parser: &str) -> ExternalFactory {
        ExternalFactory {
            db: DbParser,
            http: HttpParser {
                url_parser: url_parser.to_string(),
            },
            rpc: RpcParser,
            mq: MqParser,
            unknown: UnknownParser,
        }
    }

    pub fn build_externals(&self, service: &OtelServiceNode) -> Vec<External> {
        service
            .entry_spans
            .iter()
            .chain(service.exit_spans.iter())
            .filter_map(|span| self.build_external(span))
            .collect()
    }

    fn build_external(&self, span: &OtelSpan) -> Option<External> {
        match span.kind {
            SpanKind::Client => {
                if let Some(external) = self.db.parse(span) {
                    return Some(external);
                }
                if let Some(external) = self.http.parse(span) {
                    return Some(external);
                }
                if let Some(external) = self.rpc.parse(span) {
                    return Some(external);
                }
                if span.attribute(ATTR_MESSAGING_SYSTEM).is_some() {
                    self.mq.parse(span)
                } else if span.attribute(ATTR_DB_SYSTEM).is_some() {
                    None
                } else {
                    self.unknown.parse(span)
                }
            }
            SpanKind::Producer | SpanKind::Consumer => self.mq.parse(span),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn client_span(attributes: &[(&str, &str)]) -> OtelSpan {
        OtelSpan {
            name: "call".to_string(),
            span_id: "s1".to_string(),
            kind: SpanKind::Client,
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        }
    }

    #[test]
    fn test_db_name_from_explicit_attributes() {
        let factory = ExternalFactory::new("");
        let span = client_span(&[
            (ATTR_DB_SYSTEM, "mysql"),
            (ATTR_DB_NAME, "test"),
            (ATTR_DB_SQL_TABLE, "weather"),
            (ATTR_DB_OPERATION, "SELECT"),
            ("net.peer.name", "localhost"),
            ("net.peer.port", "3306"),
        ]);
        let external = factory.build_external(&span).unwrap();
        assert_eq!(external.group, GROUP_DB);
        assert_eq!(external.external_type, "mysql");
        assert_eq!(external.name, "SELECT test.weather");
        assert_eq!(external.peer, "localhost:3306");
    }

    #[test]
    fn test_db_name_from_statement() {
        let factory = ExternalFactory::new("");
        let span = client_span(&[
            (ATTR_DB_SYSTEM, "mysql"),
            (ATTR_DB_NAME, "test"),
            (ATTR_DB_STATEMENT, "select count(?) from weather where temp_hi>?"),
        ]);
        let external = factory.build_external(&span).unwrap();
        assert_eq!(external.name, "SELECT test.weather");
        assert_eq!(
            external.detail,
            "select count(?) from weather where temp_hi>?"
        );
    }

    #[test]
    fn test_redis_uses_span_name() {
        let factory = ExternalFactory::new("");
        let mut span = client_span(&[(ATTR_DB_SYSTEM, "redis"), (ATTR_DB_STATEMENT, "SET aa ?")]);
        span.name = "SET".to_string();
        let external = factory.build_external(&span).unwrap();
        assert_eq!(external.name, "SET");
        assert_eq!(external.detail, "SET aa ?");
    }

    #[test]
    fn test_http_plain_and_top_url() {
        let span = client_span(&[
            ("http.method", "GET"),
            ("http.url", "http://localhost:9999/cpu/loop/1"),
        ]);
        let plain = ExternalFactory::new("").build_external(&span).unwrap();
        assert_eq!(plain.name, "GET");
        assert_eq!(plain.external_type, "http");

        let top = ExternalFactory::new("topUrl").build_external(&span).unwrap();
        assert_eq!(top.name, "GET /cpu");
        assert_eq!(top.detail, "http://localhost:9999/cpu/loop/1");
    }

    #[test]
    fn test_top_url_shapes() {
        assert_eq!(get_top_url("http://h:9999/a/b"), "/a");
        assert_eq!(get_top_url("/a/b"), "/a");
        assert_eq!(get_top_url("noslash"), "noslash");
        assert_eq!(get_top_url("http://h:9999"), "/");
    }

    #[test]
    fn test_rpc_parser() {
        let mut span = client_span(&[("rpc.system", "grpc")]);
        span.name = "Greeter/SayHello".to_string();
        let external = ExternalFactory::new("").build_external(&span).unwrap();
        assert_eq!(external.group, GROUP_EXTERNAL);
        assert_eq!(external.external_type, "grpc");
        assert_eq!(external.name, "Greeter/SayHello");
    }

    #[test]
    fn test_mq_producer_and_consumer() {
        let mut producer = client_span(&[
            ("messaging.system", "kafka"),
            ("messaging.destination.name", "topic_login"),
        ]);
        producer.kind = SpanKind::Producer;
        producer.name = "topic_login publish".to_string();
        let external = ExternalFactory::new("").build_external(&producer).unwrap();
        assert_eq!(external.group, GROUP_MQ);
        assert_eq!(external.name, "topic_login");
        assert_eq!(external.detail, "topic_login publish");

        let mut consumer = producer.clone();
        consumer.kind = SpanKind::Consumer;
        consumer.name = "topic_login process".to_string();
        let external = ExternalFactory::new("").build_external(&consumer).unwrap();
        assert_eq!(external.name, "topic_login");
        assert_eq!(external.detail, "topic_login process");
    }

    #[test]
    fn test_consumer_without_system_is_unknown_mq() {
        let mut span = client_span(&[]);
        span.kind = SpanKind::Consumer;
        let external = ExternalFactory::new("").build_external(&span).unwrap();
        assert_eq!(external.group, GROUP_MQ);
        assert_eq!(external.external_type, UNKNOWN);
    }

    #[test]
    fn test_bare_client_falls_through_to_unknown() {
        let span = client_span(&[]);
        let external = ExternalFactory::new("").build_external(&span).unwrap();
        assert_eq!(external.group, GROUP_EXTERNAL);
        assert_eq!(external.external_type, UNKNOWN);
        assert_eq!(external.name, "call");
    }

    #[test]
    fn test_server_span_is_skipped() {
        let mut span = client_span(&[]);
        span.kind = SpanKind::Server;
        assert!(ExternalFactory::new("").build_external(&span).is_none());
    }

    #[test]
    fn test_sql_parse_variants() {
        assert_eq!(
            parse_sql_operation_and_table("select id from weather where x=1"),
            Some(("SELECT".to_string(), "weather".to_string()))
        );
        assert_eq!(
            parse_sql_operation_and_table("INSERT INTO orders (a, b) VALUES (1, 2)"),
            Some(("INSERT".to_string(), "orders".to_string()))
        );
        assert_eq!(
            parse_sql_operation_and_table("update users set a = 1"),
            Some(("UPDATE".to_string(), "users".to_string()))
        );
        assert_eq!(
            parse_sql_operation_and_table("DELETE FROM logs;"),
            Some(("DELETE".to_string(), "logs".to_string()))
        );
        assert_eq!(parse_sql_operation_and_table("SHOW TABLES"), None);
    }
}
