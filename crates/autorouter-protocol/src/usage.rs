use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capability::{ProviderFamily, RouteCapability};

/// Token counters normalized across provider families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
}

impl UsageCounters {
    pub fn total(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

/// Extracts usage from a buffered (non-stream) response body.
pub fn extract_usage(capability: RouteCapability, body: &Bytes) -> Option<UsageCounters> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    extract_usage_value(capability, &value)
}

fn extract_usage_value(
    capability: RouteCapability,
    value: &serde_json::Value,
) -> Option<UsageCounters> {
    match capability.family() {
        ProviderFamily::Anthropic => anthropic_usage(value),
        ProviderFamily::Openai => match capability {
            RouteCapability::CodexResponses => {
                codex_usage(value).or_else(|| openai_chat_usage(value))
            }
            _ => openai_chat_usage(value).or_else(|| codex_usage(value)),
        },
        ProviderFamily::Gemini => gemini_usage(value),
    }
}

fn int(value: &serde_json::Value, key: &str) -> Option<i64> {
    value.get(key).and_then(|v| v.as_i64())
}

fn anthropic_usage(value: &serde_json::Value) -> Option<UsageCounters> {
    // Stream deltas nest usage under `message`; terminal message bodies carry
    // it at top level.
    let usage = value
        .get("usage")
        .or_else(|| value.get("message").and_then(|m| m.get("usage")))?;
    let prompt = int(usage, "input_tokens");
    let completion = int(usage, "output_tokens");
    if prompt.is_none() && completion.is_none() {
        return None;
    }
    Some(UsageCounters {
        prompt_tokens: prompt.unwrap_or(0),
        completion_tokens: completion.unwrap_or(0),
        cache_read_tokens: int(usage, "cache_read_input_tokens").unwrap_or(0),
        cache_write_tokens: int(usage, "cache_creation_input_tokens").unwrap_or(0),
    })
}

fn openai_chat_usage(value: &serde_json::Value) -> Option<UsageCounters> {
    let usage = value.get("usage")?;
    let prompt = int(usage, "prompt_tokens");
    let completion = int(usage, "completion_tokens");
    if prompt.is_none() && completion.is_none() {
        return None;
    }
    let cached = usage
        .get("prompt_tokens_details")
        .and_then(|details| int(details, "cached_tokens"))
        .unwrap_or(0);
    Some(UsageCounters {
        prompt_tokens: prompt.unwrap_or(0),
        completion_tokens: completion.unwrap_or(0),
        cache_read_tokens: cached,
        cache_write_tokens: 0,
    })
}

fn codex_usage(value: &serde_json::Value) -> Option<UsageCounters> {
    // Responses-API events wrap the terminal object in `response`.
    let root = value.get("response").unwrap_or(value);
    let usage = root.get("usage")?;
    let prompt = int(usage, "input_tokens");
    let completion = int(usage, "output_tokens");
    if prompt.is_none() && completion.is_none() {
        return None;
    }
    let cached = usage
        .get("input_tokens_details")
        .and_then(|details| int(details, "cached_tokens"))
        .unwrap_or(0);
    Some(UsageCounters {
        prompt_tokens: prompt.unwrap_or(0),
        completion_tokens: completion.unwrap_or(0),
        cache_read_tokens: cached,
        cache_write_tokens: 0,
    })
}

fn gemini_usage(value: &serde_json::Value) -> Option<UsageCounters> {
    let usage = value.get("usageMetadata")?;
    let prompt = int(usage, "promptTokenCount");
    let completion = int(usage, "candidatesTokenCount");
    if prompt.is_none() && completion.is_none() {
        return None;
    }
    Some(UsageCounters {
        prompt_tokens: prompt.unwrap_or(0),
        completion_tokens: completion.unwrap_or(0),
        cache_read_tokens: int(usage, "cachedContentTokenCount").unwrap_or(0),
        cache_write_tokens: 0,
    })
}

/// Accumulates usage from SSE data payloads. Counters merge across events
/// because some families split them (Anthropic reports input tokens in
/// `message_start` and output tokens in the final `message_delta`); within
/// one counter the latest non-zero value wins.
#[derive(Debug)]
pub struct UsageTail {
    capability: RouteCapability,
    usage: Option<UsageCounters>,
}

impl UsageTail {
    pub fn new(capability: RouteCapability) -> Self {
        Self {
            capability,
            usage: None,
        }
    }

    pub fn observe(&mut self, data: &str) {
        if data == "[DONE]" {
            return;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
            return;
        };
        let Some(incoming) = extract_usage_value(self.capability, &value) else {
            return;
        };
        self.usage = Some(match self.usage {
            None => incoming,
            Some(previous) => merge_counter_wise(previous, incoming),
        });
    }

    pub fn finish(self) -> Option<UsageCounters> {
        self.usage
    }
}

fn merge_counter_wise(previous: UsageCounters, incoming: UsageCounters) -> UsageCounters {
    let pick = |new: i64, old: i64| if new != 0 { new } else { old };
    UsageCounters {
        prompt_tokens: pick(incoming.prompt_tokens, previous.prompt_tokens),
        completion_tokens: pick(incoming.completion_tokens, previous.completion_tokens),
        cache_read_tokens: pick(incoming.cache_read_tokens, previous.cache_read_tokens),
        cache_write_tokens: pick(incoming.cache_write_tokens, previous.cache_write_tokens),
    }
}
