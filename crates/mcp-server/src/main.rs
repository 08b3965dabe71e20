mod config;

use crate::config::ServerConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sentinel::{
    CandidateBatch, CandidateEdge, CandidateEntity, EdgeKey, Properties, PropertyValue,
    TemporalGraph,
};
use sentinel_healer::{HealingCoordinator, HttpFactSource};
use serde_json::{json, Value as JsonValue};
use std::io::{self, BufRead, BufReader, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const MAX_MESSAGE_BYTES: usize = 1_048_576; // 1 MiB
const MAX_EDGES_PER_CALL: usize = 500;
const MAX_ID_BYTES: usize = 512;
const MAX_URL_BYTES: usize = 2048;

struct AppState {
    graph: Arc<TemporalGraph>,
    healer: Option<Arc<HealingCoordinator>>,
    runtime: tokio::runtime::Runtime,
    threshold: chrono::Duration,
    shutdown: CancellationToken,
}

impl AppState {
    fn open(config: &ServerConfig) -> Result<Self> {
        let graph = TemporalGraph::open(&config.db_path)
            .with_context(|| format!("failed to open {}", config.db_path))?
            .with_config(config.store_config());
        Self::with_graph(Arc::new(graph), config)
    }

    fn with_graph(graph: Arc<TemporalGraph>, config: &ServerConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;

        let healer = match &config.extractor_url {
            Some(url) => {
                let source = HttpFactSource::with_timeout(
                    url.clone(),
                    Duration::from_secs(config.extractor_timeout_secs),
                )
                .context("failed to build extractor client")?;
                Some(Arc::new(HealingCoordinator::new(
                    Arc::clone(&graph),
                    Arc::new(source),
                    config.healer.clone(),
                )))
            }
            None => None,
        };

        Ok(Self {
            graph,
            healer,
            runtime,
            threshold: config.healer.threshold(),
            shutdown: CancellationToken::new(),
        })
    }

    fn spawn_healing_loop(&self, interval: Duration) {
        let Some(healer) = self.healer.clone() else {
            tracing::warn!("heal_interval_secs is set but no extractor_url; healing loop disabled");
            return;
        };
        let threshold = self.threshold;
        let shutdown = self.shutdown.clone();
        self.runtime.spawn(async move {
            healer.run(threshold, interval, shutdown).await;
        });
    }
}

fn main() -> Result<()> {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let config = ServerConfig::load().context("failed to load configuration")?;
    let state = AppState::open(&config).context("failed to open sentinel database")?;
    if let Some(interval) = config.heal_interval() {
        state.spawn_healing_loop(interval);
    }
    info!(db_path = %config.db_path, healing = state.healer.is_some(), "sentinel-mcp ready");

    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let maybe = match read_message(&mut reader) {
            Ok(m) => m,
            Err(e) => {
                // Malformed framing should not kill the server; return JSON-RPC
                // parse error (-32700) and continue reading the next message.
                let err_resp = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": format!("Parse error: {e}") }
                });
                write_message(&mut writer, &err_resp)?;
                continue;
            }
        };
        let Some(request) = maybe else {
            break;
        };
        if let Some(response) = handle_request(&state, &request) {
            write_message(&mut writer, &response)?;
        }
    }

    state.shutdown.cancel();
    Ok(())
}

fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<JsonValue>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .context("invalid Content-Length")?,
                );
            }
        }
    }

    let len = content_length.context("missing Content-Length header")?;
    if len > MAX_MESSAGE_BYTES {
        anyhow::bail!(
            "Content-Length {} exceeds max allowed {} bytes",
            len,
            MAX_MESSAGE_BYTES
        );
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    let value: JsonValue = serde_json::from_slice(&payload).context("invalid JSON payload")?;
    Ok(Some(value))
}

fn write_message<W: Write>(writer: &mut W, value: &JsonValue) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

fn handle_request(state: &AppState, req: &JsonValue) -> Option<JsonValue> {
    let id = req.get("id").cloned();
    let method = req.get("method").and_then(JsonValue::as_str)?;

    match method {
        "initialize" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "sentinel-mcp", "version": env!("CARGO_PKG_VERSION") }
                }
            })
        }),
        "notifications/initialized" => None,
        "tools/list" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "tools": tools_schema()
                }
            })
        }),
        "tools/call" => id.map(|id_val| {
            let result = call_tool(state, req.get("params"));
            match result {
                Ok(tool_result) => json!({
                    "jsonrpc": "2.0",
                    "id": id_val,
                    "result": tool_result
                }),
                Err(err) => json!({
                    "jsonrpc": "2.0",
                    "id": id_val,
                    "result": {
                        "content": [{ "type": "text", "text": format!("tool error: {err:#}") }],
                        "isError": true
                    }
                }),
            }
        }),
        "ping" => id.map(|id_val| json!({ "jsonrpc": "2.0", "id": id_val, "result": {} })),
        _ => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "error": {
                    "code": -32601,
                    "message": format!("method not found: {method}")
                }
            })
        }),
    }
}

fn key_schema() -> JsonValue {
    json!({
        "type": "object",
        "properties": {
            "source_id": {"type": "string"},
            "relation": {"type": "string"},
            "target_id": {"type": "string"}
        },
        "required": ["source_id", "relation", "target_id"]
    })
}

fn tools_schema() -> Vec<JsonValue> {
    vec![
        json!({
            "name": "upsert_facts",
            "description": "Ingest the relationships extracted from one source document. Unchanged facts are re-verified, changed facts supersede the previous version.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "source_url": {"type": "string"},
                    "edges": {
                        "type": "array",
                        "maxItems": MAX_EDGES_PER_CALL,
                        "items": {
                            "type": "object",
                            "properties": {
                                "source_id": {"type": "string"},
                                "relation": {"type": "string"},
                                "target_id": {"type": "string"},
                                "properties": {"type": "object"},
                                "confidence": {"type": "number"}
                            },
                            "required": ["source_id", "relation", "target_id"]
                        }
                    },
                    "entities": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "label": {"type": "string"},
                                "properties": {"type": "object"}
                            },
                            "required": ["id"]
                        }
                    },
                    "now": {"type": "string", "description": "RFC 3339; defaults to the current time"}
                },
                "required": ["source_url", "edges"]
            }
        }),
        json!({
            "name": "snapshot",
            "description": "Reconstruct the graph as it was believed at a timestamp.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "timestamp": {"type": "string", "description": "RFC 3339; defaults to now"}
                }
            }
        }),
        json!({
            "name": "find_stale",
            "description": "List current relationships not verified within a threshold.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "threshold_days": {"type": "number", "minimum": 0},
                    "threshold_seconds": {"type": "integer", "minimum": 0},
                    "at": {"type": "string"}
                }
            }
        }),
        json!({
            "name": "heal",
            "description": "Run one healing cycle: re-fetch the sources of stale relationships and re-ingest them.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "threshold_days": {"type": "number", "minimum": 0},
                    "dry_run": {"type": "boolean"}
                }
            }
        }),
        json!({
            "name": "edge_history",
            "description": "Every version of one relationship, oldest first.",
            "inputSchema": key_schema()
        }),
        json!({
            "name": "stats",
            "description": "Entity and relationship counts plus the number of stale sources.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
    ]
}

fn call_tool(state: &AppState, params: Option<&JsonValue>) -> Result<JsonValue> {
    let name = params
        .and_then(|v| v.get("name"))
        .and_then(JsonValue::as_str)
        .context("missing tool name")?;
    let args = params
        .and_then(|v| v.get("arguments"))
        .cloned()
        .unwrap_or_else(|| json!({}));

    match name {
        "upsert_facts" => {
            let source_url = args
                .get("source_url")
                .and_then(JsonValue::as_str)
                .context("source_url is required")?;
            if source_url.len() > MAX_URL_BYTES {
                anyhow::bail!("source_url exceeds max allowed size ({MAX_URL_BYTES} bytes)");
            }
            let edges = args
                .get("edges")
                .and_then(JsonValue::as_array)
                .context("edges is required")?;
            if edges.len() > MAX_EDGES_PER_CALL {
                anyhow::bail!("edges exceeds max allowed count ({MAX_EDGES_PER_CALL})");
            }
            let mut batch = CandidateBatch::default();
            for (i, edge) in edges.iter().enumerate() {
                batch
                    .edges
                    .push(parse_edge(edge).with_context(|| format!("edges[{i}]"))?);
            }
            if let Some(entities) = args.get("entities").and_then(JsonValue::as_array) {
                for (i, entity) in entities.iter().enumerate() {
                    batch
                        .entities
                        .push(parse_entity(entity).with_context(|| format!("entities[{i}]"))?);
                }
            }
            let now = parse_timestamp(args.get("now"), "now")?.unwrap_or_else(Utc::now);

            let report = state.graph.upsert(&batch, source_url, now)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!(
                    "{} created, {} verified unchanged, {} superseded, {} failed",
                    report.counts.created,
                    report.counts.verified_unchanged,
                    report.counts.superseded,
                    report.failures.len()
                ) }],
                "structuredContent": report
            }))
        }
        "snapshot" => {
            let at = parse_timestamp(args.get("timestamp"), "timestamp")?;
            let view = state.graph.snapshot(at)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!(
                    "{} node(s), {} link(s) as of {}",
                    view.node_count(),
                    view.link_count(),
                    view.at.to_rfc3339()
                ) }],
                "structuredContent": view
            }))
        }
        "find_stale" => {
            let threshold = parse_threshold(&args)?.unwrap_or(state.threshold);
            let at = parse_timestamp(args.get("at"), "at")?.unwrap_or_else(Utc::now);
            let stale = state.graph.find_stale_relations(threshold, at)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{} stale relationship(s)", stale.len()) }],
                "structuredContent": { "at": at, "relations": stale }
            }))
        }
        "heal" => {
            let healer = state
                .healer
                .as_ref()
                .context("healing is not configured (set SENTINEL_EXTRACTOR_URL)")?;
            let threshold = parse_threshold(&args)?.unwrap_or(state.threshold);
            let dry_run = args
                .get("dry_run")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);
            let report = state.runtime.block_on(healer.heal(threshold, dry_run))?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!(
                    "{} stale key(s) across {} source(s); {} reprocessed, {} failed",
                    report.candidates.len(),
                    report.sources.len(),
                    report.reprocessed,
                    report.failed.len()
                ) }],
                "structuredContent": report
            }))
        }
        "edge_history" => {
            let key = EdgeKey::new(
                required_str(&args, "source_id")?,
                required_str(&args, "relation")?,
                required_str(&args, "target_id")?,
            );
            let versions = state.graph.history(&key)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{} version(s) of {key}", versions.len()) }],
                "structuredContent": { "versions": versions }
            }))
        }
        "stats" => {
            let stats = state.graph.stats()?;
            let stale_sources = state.graph.stale_sources(state.threshold, Utc::now())?;
            let healing = state.healer.as_ref().map(|h| h.state());
            Ok(json!({
                "content": [{ "type": "text", "text": format!(
                    "{} entities, {} open / {} closed relationship versions, {} stale source(s)",
                    stats.entities,
                    stats.open_relations,
                    stats.closed_relations,
                    stale_sources.len()
                ) }],
                "structuredContent": {
                    "stats": stats,
                    "stale_sources": stale_sources.len(),
                    "healing_state": healing
                }
            }))
        }
        _ => anyhow::bail!("unknown tool: {name}"),
    }
}

fn required_str<'a>(args: &'a JsonValue, field: &str) -> Result<&'a str> {
    let value = args
        .get(field)
        .and_then(JsonValue::as_str)
        .with_context(|| format!("{field} is required"))?;
    if value.len() > MAX_ID_BYTES {
        anyhow::bail!("{field} exceeds max allowed size ({MAX_ID_BYTES} bytes)");
    }
    Ok(value)
}

fn parse_edge(v: &JsonValue) -> Result<CandidateEdge> {
    let mut edge = CandidateEdge::new(
        required_str(v, "source_id")?,
        required_str(v, "relation")?,
        required_str(v, "target_id")?,
    );
    edge.properties = parse_properties(v.get("properties"))?;
    edge.confidence = match v.get("confidence") {
        None | Some(JsonValue::Null) => None,
        Some(c) => Some(c.as_f64().context("confidence must be a number")?),
    };
    Ok(edge)
}

fn parse_entity(v: &JsonValue) -> Result<CandidateEntity> {
    Ok(CandidateEntity {
        id: required_str(v, "id")?.to_string(),
        label: v.get("label").and_then(JsonValue::as_str).map(str::to_string),
        properties: parse_properties(v.get("properties"))?,
    })
}

fn parse_properties(v: Option<&JsonValue>) -> Result<Properties> {
    match v {
        None | Some(JsonValue::Null) => Ok(Properties::new()),
        Some(JsonValue::Object(map)) => Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), json_to_value(v)))
            .collect()),
        Some(_) => anyhow::bail!("properties must be an object"),
    }
}

fn parse_timestamp(v: Option<&JsonValue>, field: &str) -> Result<Option<DateTime<Utc>>> {
    match v {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(
            s.parse::<DateTime<Utc>>()
                .with_context(|| format!("{field} must be RFC3339"))?,
        )),
        Some(_) => anyhow::bail!("{field} must be an RFC3339 string"),
    }
}

fn parse_threshold(args: &JsonValue) -> Result<Option<chrono::Duration>> {
    if let Some(secs) = args.get("threshold_seconds") {
        let secs = secs
            .as_i64()
            .context("threshold_seconds must be an integer")?;
        return chrono::Duration::try_seconds(secs)
            .map(Some)
            .context("threshold_seconds is out of range");
    }
    if let Some(days) = args.get("threshold_days") {
        let days = days.as_f64().context("threshold_days must be a number")?;
        if !days.is_finite() {
            anyhow::bail!("threshold_days must be finite");
        }
        return chrono::Duration::try_milliseconds((days * 86_400_000.0) as i64)
            .map(Some)
            .context("threshold_days is out of range");
    }
    Ok(None)
}

fn json_to_value(v: &JsonValue) -> PropertyValue {
    match v {
        JsonValue::Bool(b) => PropertyValue::Boolean(*b),
        JsonValue::Number(n) => n
            .as_f64()
            .map(PropertyValue::Number)
            .unwrap_or_else(|| PropertyValue::Text(n.to_string())),
        JsonValue::String(s) => PropertyValue::Text(s.clone()),
        _ => PropertyValue::Text(v.to_string()),
    }
}
