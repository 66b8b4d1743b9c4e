use autorouter_protocol::ProviderFamily;
use http::{HeaderMap, header};

use crate::compensation::CompensatedHeader;
use crate::upstream_client::Headers;

/// Headers that never cross the proxy boundary.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Framing/addressing headers the outbound client recomputes itself.
const RECOMPUTED: &[&str] = &["host", "content-length", "expect"];

/// Downstream auth material; dropped on every attempt, the upstream
/// credential is substituted.
const AUTH_HEADERS: &[&str] = &["authorization", "x-api-key", "x-goog-api-key"];

/// Result of one attempt's header assembly, including the accounting that
/// lands in `request_logs.header_diff`.
#[derive(Debug)]
pub struct HeaderPlan {
    pub outbound: Headers,
    pub diff: serde_json::Value,
    pub inbound_count: usize,
    pub outbound_count: usize,
}

/// Assembles outbound headers: drop auth + hop-by-hop, substitute the
/// upstream credential, then apply compensation. Compensated values replace
/// any preserved value of the same name.
pub fn assemble(
    inbound: &HeaderMap,
    family: ProviderFamily,
    credential: &str,
    compensated: &[CompensatedHeader],
) -> HeaderPlan {
    let mut dropped: Vec<String> = Vec::new();
    let mut auth_replaced: Vec<String> = Vec::new();
    let mut unchanged: Vec<String> = Vec::new();
    let mut outbound: Headers = Vec::new();

    let mut inbound_count = 0usize;
    for (name, value) in inbound {
        inbound_count += 1;
        let name_str = name.as_str();
        if AUTH_HEADERS.contains(&name_str) {
            auth_replaced.push(name_str.to_string());
            continue;
        }
        if HOP_BY_HOP.contains(&name_str) || RECOMPUTED.contains(&name_str) {
            dropped.push(name_str.to_string());
            continue;
        }
        if compensated.iter().any(|c| c.name == name_str) {
            // The compensated value wins over the preserved one.
            continue;
        }
        let Ok(value) = value.to_str() else {
            dropped.push(name_str.to_string());
            continue;
        };
        unchanged.push(name_str.to_string());
        outbound.push((name_str.to_string(), value.to_string()));
    }

    let (credential_name, credential_value) = credential_header(family, credential);
    outbound.push((credential_name.to_string(), credential_value));

    for entry in compensated {
        outbound.push((entry.name.clone(), entry.value.clone()));
    }

    let outbound_count = outbound.len();
    let diff = serde_json::json!({
        "dropped": dropped,
        "auth_replaced": auth_replaced,
        "compensated": compensated
            .iter()
            .map(|c| serde_json::json!({ "header": c.name, "source": c.source }))
            .collect::<Vec<_>>(),
        "unchanged": unchanged,
        "inbound_count": inbound_count,
        "outbound_count": outbound_count,
    });

    HeaderPlan {
        outbound,
        diff,
        inbound_count,
        outbound_count,
    }
}

/// Credential header per provider family.
fn credential_header(family: ProviderFamily, credential: &str) -> (&'static str, String) {
    match family {
        ProviderFamily::Anthropic => ("x-api-key", credential.to_string()),
        ProviderFamily::Openai => (header::AUTHORIZATION.as_str(), format!("Bearer {credential}")),
        ProviderFamily::Gemini => ("x-goog-api-key", credential.to_string()),
    }
}
