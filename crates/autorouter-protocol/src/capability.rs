use serde::{Deserialize, Serialize};

/// Closed set of route families AutoRouter understands.
///
/// New providers require a new variant plus classifier/usage entries, not a
/// new dispatch hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteCapability {
    AnthropicMessages,
    CodexResponses,
    OpenaiChatCompatible,
    OpenaiExtended,
    GeminiNativeGenerate,
    GeminiCodeAssistInternal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    Anthropic,
    Openai,
    Gemini,
}

impl RouteCapability {
    pub const ALL: [RouteCapability; 6] = [
        RouteCapability::AnthropicMessages,
        RouteCapability::CodexResponses,
        RouteCapability::OpenaiChatCompatible,
        RouteCapability::OpenaiExtended,
        RouteCapability::GeminiNativeGenerate,
        RouteCapability::GeminiCodeAssistInternal,
    ];

    /// Every capability belongs to exactly one provider family.
    pub fn family(self) -> ProviderFamily {
        match self {
            RouteCapability::AnthropicMessages => ProviderFamily::Anthropic,
            RouteCapability::CodexResponses
            | RouteCapability::OpenaiChatCompatible
            | RouteCapability::OpenaiExtended => ProviderFamily::Openai,
            RouteCapability::GeminiNativeGenerate
            | RouteCapability::GeminiCodeAssistInternal => ProviderFamily::Gemini,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RouteCapability::AnthropicMessages => "anthropic_messages",
            RouteCapability::CodexResponses => "codex_responses",
            RouteCapability::OpenaiChatCompatible => "openai_chat_compatible",
            RouteCapability::OpenaiExtended => "openai_extended",
            RouteCapability::GeminiNativeGenerate => "gemini_native_generate",
            RouteCapability::GeminiCodeAssistInternal => "gemini_code_assist_internal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|capability| capability.as_str() == value)
    }
}

impl ProviderFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderFamily::Anthropic => "anthropic",
            ProviderFamily::Openai => "openai",
            ProviderFamily::Gemini => "gemini",
        }
    }

    /// Capability used when only the model's family is known.
    pub fn default_capability(self) -> RouteCapability {
        match self {
            ProviderFamily::Anthropic => RouteCapability::AnthropicMessages,
            ProviderFamily::Openai => RouteCapability::OpenaiChatCompatible,
            ProviderFamily::Gemini => RouteCapability::GeminiNativeGenerate,
        }
    }

    /// Full capability set an upstream with an empty declared set expands to.
    pub fn capabilities(self) -> &'static [RouteCapability] {
        match self {
            ProviderFamily::Anthropic => &[RouteCapability::AnthropicMessages],
            ProviderFamily::Openai => &[
                RouteCapability::CodexResponses,
                RouteCapability::OpenaiChatCompatible,
                RouteCapability::OpenaiExtended,
            ],
            ProviderFamily::Gemini => &[
                RouteCapability::GeminiNativeGenerate,
                RouteCapability::GeminiCodeAssistInternal,
            ],
        }
    }

    fn from_model_prefix(model: &str) -> Option<Self> {
        let model = model.trim().to_ascii_lowercase();
        if model.starts_with("claude") {
            return Some(ProviderFamily::Anthropic);
        }
        if model.starts_with("gemini") || model.starts_with("models/gemini") {
            return Some(ProviderFamily::Gemini);
        }
        if model.starts_with("gpt")
            || model.starts_with("o1")
            || model.starts_with("o3")
            || model.starts_with("o4")
            || model.starts_with("codex")
            || model.starts_with("text-embedding")
            || model.starts_with("davinci")
        {
            return Some(ProviderFamily::Openai);
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub capability: RouteCapability,
    pub model: Option<String>,
    pub is_stream: bool,
}

/// Classifies by path prefix alone. `None` means the path carries no signal
/// and the body model decides.
pub fn classify_path(path: &str) -> Option<RouteCapability> {
    let path = path.trim_start_matches('/');
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        ["v1", "messages", ..] => Some(RouteCapability::AnthropicMessages),
        ["v1", "responses", ..] => Some(RouteCapability::CodexResponses),
        ["v1", "chat", "completions"] => Some(RouteCapability::OpenaiChatCompatible),
        ["v1beta", "models", rest @ ..] | ["v1", "models", rest @ ..]
            if rest
                .last()
                .map(|segment| segment.contains(':'))
                .unwrap_or(false) =>
        {
            Some(RouteCapability::GeminiNativeGenerate)
        }
        ["v1", "completions"] | ["v1", "embeddings"] | ["v1", "models", ..] => {
            Some(RouteCapability::OpenaiExtended)
        }
        ["v1internal", ..] => Some(RouteCapability::GeminiCodeAssistInternal),
        _ => None,
    }
}

/// Pure classification of an inbound request: path prefixes take precedence;
/// the body model's provider family is the fallback.
pub fn classify_request(path: &str, body: Option<&serde_json::Value>) -> Option<Classified> {
    let model = body
        .and_then(|value| value.get("model"))
        .and_then(|value| value.as_str())
        .map(|value| value.to_string());

    let capability = match classify_path(path) {
        Some(capability) => capability,
        None => {
            let family = ProviderFamily::from_model_prefix(model.as_deref()?)?;
            family.default_capability()
        }
    };

    let is_stream = path.contains(":streamGenerateContent")
        || body
            .and_then(|value| value.get("stream"))
            .and_then(|value| value.as_bool())
            .unwrap_or(false);

    Some(Classified {
        capability,
        model,
        is_stream,
    })
}
