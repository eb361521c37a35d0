use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// OTel semantic-convention attribute keys recognized by the external
/// parsers. Both the stable and the pre-1.x names are probed where the
/// convention was renamed.
pub const ATTR_DB_SYSTEM: &str = "db.system";
pub const ATTR_DB_STATEMENT: &str = "db.statement";
pub const ATTR_DB_OPERATION: &str = "db.operation";
pub const ATTR_DB_NAME: &str = "db.name";
pub const ATTR_DB_SQL_TABLE: &str = "db.sql.table";
pub const ATTR_HTTP_METHOD: &str = "http.method";
pub const ATTR_HTTP_REQUEST_METHOD: &str = "http.request.method";
pub const ATTR_HTTP_URL: &str = "http.url";
pub const ATTR_URL_FULL: &str = "url.full";
pub const ATTR_RPC_SYSTEM: &str = "rpc.system";
pub const ATTR_MESSAGING_SYSTEM: &str = "messaging.system";
pub const ATTR_MESSAGING_DESTINATION: &str = "messaging.destination.name";
pub const ATTR_NET_PEER_NAME: &str = "net.peer.name";
pub const ATTR_NET_PEER_PORT: &str = "net.peer.port";
pub const ATTR_SERVER_ADDRESS: &str = "server.address";
pub const ATTR_SERVER_PORT: &str = "server.port";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    #[default]
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtelException {
    #[serde(rename = "type", default)]
    pub exception_type: String,
    #[serde(default)]
    pub message: String,
}

/// One span as returned by the APM upstream topology query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtelSpan {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub span_id: String,
    /// Parent span id, empty for the true root of the distributed trace.
    #[serde(default)]
    pub p_span_id: String,
    /// For exit spans: the entry span id of the callee service.
    #[serde(default)]
    pub next_span_id: String,
    #[serde(default)]
    pub start_time: u64,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub kind: SpanKind,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub exceptions: Vec<OtelException>,
}

impl OtelSpan {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|v| v.as_str())
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn http_method(&self) -> Option<&str> {
        self.attribute(ATTR_HTTP_METHOD)
            .or_else(|| self.attribute(ATTR_HTTP_REQUEST_METHOD))
    }

    pub fn http_detail(&self) -> String {
        self.attribute(ATTR_HTTP_URL)
            .or_else(|| self.attribute(ATTR_URL_FULL))
            .unwrap_or("")
            .to_string()
    }

    pub fn rpc_detail(&self, default: &str) -> String {
        self.attribute("rpc.method")
            .map(|method| match self.attribute("rpc.service") {
                Some(service) => format!("{service}/{method}"),
                None => method.to_string(),
            })
            .unwrap_or_else(|| default.to_string())
    }

    pub fn message_destination(&self, default: &str) -> String {
        self.attribute(ATTR_MESSAGING_DESTINATION)
            .unwrap_or(default)
            .to_string()
    }

    /// "host:port" of the remote side, probing both naming generations.
    pub fn peer(&self, default: &str) -> String {
        let host = self
            .attribute(ATTR_NET_PEER_NAME)
            .or_else(|| self.attribute(ATTR_SERVER_ADDRESS));
        let port = self
            .attribute(ATTR_NET_PEER_PORT)
            .or_else(|| self.attribute(ATTR_SERVER_PORT));
        match (host, port) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => default.to_string(),
        }
    }
}

/// Tree of spans grouped per service instance, as assembled by the APM
/// upstream. Entry spans are the server side, exit spans the client side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtelServiceNode {
    #[serde(default)]
    pub entry_spans: Vec<OtelSpan>,
    #[serde(default)]
    pub exit_spans: Vec<OtelSpan>,
    #[serde(default)]
    pub children: Vec<OtelServiceNode>,
}

impl OtelServiceNode {
    pub fn entry_span(&self) -> Option<&OtelSpan> {
        self.entry_spans.first()
    }

    pub fn match_entry_span(&self, next_span_id: &str) -> bool {
        !next_span_id.is_empty()
            && self
                .entry_spans
                .iter()
                .any(|span| span.span_id == next_span_id)
    }

    /// True root of the distributed trace: an entry span without a parent.
    pub fn is_top_node(&self) -> bool {
        self.entry_spans.iter().any(|span| span.p_span_id.is_empty())
    }
}
