use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use autorouter_protocol::RouteCapability;
use autorouter_storage::{CompensationRuleInput, CompensationRuleRow, Store};
use http::HeaderMap;

/// Where a compensated header value comes from; sources are tried in order
/// and the first that resolves wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    Header(String),
    BodyPath(Vec<String>),
}

impl RuleSource {
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(name) = raw.strip_prefix("headers.") {
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            return Some(RuleSource::Header(name.to_ascii_lowercase()));
        }
        if let Some(path) = raw.strip_prefix("body.") {
            let segments: Vec<String> = path
                .split('.')
                .map(|segment| segment.trim().to_string())
                .filter(|segment| !segment.is_empty())
                .collect();
            if segments.is_empty() {
                return None;
            }
            return Some(RuleSource::BodyPath(segments));
        }
        None
    }

    pub fn describe(&self) -> String {
        match self {
            RuleSource::Header(name) => format!("headers.{name}"),
            RuleSource::BodyPath(path) => format!("body.{}", path.join(".")),
        }
    }

    fn resolve(&self, headers: &HeaderMap, body: Option<&serde_json::Value>) -> Option<String> {
        match self {
            RuleSource::Header(name) => headers
                .get(name.as_str())
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| value.to_string()),
            RuleSource::BodyPath(path) => {
                let mut cursor = body?;
                for segment in path {
                    cursor = cursor.get(segment)?;
                }
                match cursor {
                    serde_json::Value::String(value) => {
                        let value = value.trim();
                        (!value.is_empty()).then(|| value.to_string())
                    }
                    serde_json::Value::Number(value) => Some(value.to_string()),
                    serde_json::Value::Bool(value) => Some(value.to_string()),
                    _ => None,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMode {
    MissingOnly,
}

impl RuleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleMode::MissingOnly => "missing_only",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompensationRule {
    pub id: i64,
    pub name: String,
    pub capabilities: Vec<RouteCapability>,
    pub target_header: String,
    pub sources: Vec<RuleSource>,
    pub mode: RuleMode,
    pub is_builtin: bool,
    pub enabled: bool,
}

impl CompensationRule {
    pub fn from_row(row: &CompensationRuleRow) -> Option<Self> {
        if row.mode != "missing_only" {
            return None;
        }
        let capabilities = row
            .capabilities_json
            .as_array()?
            .iter()
            .filter_map(|tag| tag.as_str())
            .filter_map(RouteCapability::parse)
            .collect();
        let sources = row
            .sources_json
            .as_array()?
            .iter()
            .filter_map(|source| source.as_str())
            .filter_map(RuleSource::parse)
            .collect();
        Some(Self {
            id: row.id,
            name: row.name.clone(),
            capabilities,
            target_header: row.target_header.to_ascii_lowercase(),
            sources,
            mode: RuleMode::MissingOnly,
            is_builtin: row.is_builtin,
            enabled: row.enabled,
        })
    }
}

/// One header emitted by the engine; `source` is the descriptor of the rule
/// source that resolved, recorded in the header diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensatedHeader {
    pub name: String,
    pub value: String,
    pub source: String,
}

/// Pure application of a rule snapshot: same inputs, same outputs.
pub fn apply_rules(
    rules: &[CompensationRule],
    capability: RouteCapability,
    headers: &HeaderMap,
    body: Option<&serde_json::Value>,
) -> Vec<CompensatedHeader> {
    let mut out: Vec<CompensatedHeader> = Vec::new();
    for rule in rules {
        if !rule.enabled || !rule.capabilities.contains(&capability) {
            continue;
        }
        // missing_only: the inbound request already carries the target.
        if headers.contains_key(rule.target_header.as_str()) {
            continue;
        }
        if out.iter().any(|existing| existing.name == rule.target_header) {
            continue;
        }
        for source in &rule.sources {
            if let Some(value) = source.resolve(headers, body) {
                out.push(CompensatedHeader {
                    name: rule.target_header.clone(),
                    value,
                    source: source.describe(),
                });
                break;
            }
        }
    }
    out
}

/// Snapshot holder with lazy reload: admin mutations call `invalidate()`,
/// the next `current()` call re-reads the table and swaps the pointer.
pub struct CompensationEngine {
    store: Store,
    rules: ArcSwap<Vec<CompensationRule>>,
    dirty: AtomicBool,
}

impl CompensationEngine {
    pub fn new(store: Store, rows: &[CompensationRuleRow]) -> Self {
        Self {
            store,
            rules: ArcSwap::from_pointee(parse_rows(rows)),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn invalidate(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub async fn current(&self) -> Arc<Vec<CompensationRule>> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            match self.store.list_compensation_rules().await {
                Ok(rows) => self.rules.store(Arc::new(parse_rows(&rows))),
                Err(err) => {
                    tracing::warn!(error = %err, "compensation rule reload failed; keeping previous snapshot");
                    // Reload again on the next call.
                    self.dirty.store(true, Ordering::Release);
                }
            }
        }
        self.rules.load_full()
    }
}

fn parse_rows(rows: &[CompensationRuleRow]) -> Vec<CompensationRule> {
    rows.iter().filter_map(CompensationRule::from_row).collect()
}

/// Built-in rules seeded at boot; admins can only toggle `enabled` on these.
pub fn builtin_rules() -> Vec<CompensationRuleInput> {
    vec![
        CompensationRuleInput {
            name: "session-affinity-openai".to_string(),
            capabilities: serde_json::json!([
                "openai_chat_compatible",
                "openai_extended",
                "codex_responses",
            ]),
            target_header: "x-session-id".to_string(),
            sources: serde_json::json!([
                "headers.x-session-id",
                "body.metadata.session_id",
                "body.user",
            ]),
            mode: "missing_only".to_string(),
            is_builtin: true,
            enabled: true,
        },
        CompensationRuleInput {
            name: "session-affinity-anthropic".to_string(),
            capabilities: serde_json::json!(["anthropic_messages"]),
            target_header: "x-session-id".to_string(),
            sources: serde_json::json!([
                "headers.x-session-id",
                "body.metadata.user_id",
            ]),
            mode: "missing_only".to_string(),
            is_builtin: true,
            enabled: true,
        },
        CompensationRuleInput {
            name: "session-affinity-gemini".to_string(),
            capabilities: serde_json::json!([
                "gemini_native_generate",
                "gemini_code_assist_internal",
            ]),
            target_header: "x-session-id".to_string(),
            sources: serde_json::json!([
                "headers.x-session-id",
                "body.labels.session_id",
            ]),
            mode: "missing_only".to_string(),
            is_builtin: true,
            enabled: true,
        },
    ]
}
