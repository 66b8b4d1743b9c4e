use serde::{Deserialize, Serialize};

pub type UpstreamId = i64;
pub type ApiKeyId = i64;

/// Mints the v7 request id attached to every proxied request and echoed in
/// the `x-autorouter-request-id` response header.
pub fn new_request_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("missing required setting: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

/// How the failover loop bounds its candidate walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "max_attempts")]
pub enum FailoverStrategy {
    ExhaustAll,
    MaxAttempts(u32),
}

impl Default for FailoverStrategy {
    fn default() -> Self {
        FailoverStrategy::ExhaustAll
    }
}

impl FailoverStrategy {
    pub fn attempt_cap(&self) -> Option<u32> {
        match self {
            FailoverStrategy::ExhaustAll => None,
            FailoverStrategy::MaxAttempts(cap) => Some((*cap).max(1)),
        }
    }
}

/// Final, merged process settings.
///
/// Merge order: CLI > ENV > defaults. Secrets stay out of `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub dsn: String,
    pub admin_token: String,
    /// 32-byte AES-256-GCM key material, base64 or hex encoded.
    pub encryption_key: String,
    /// When false, any api-key reveal attempt errors (no plaintext stored).
    pub allow_key_reveal: bool,
    #[serde(default)]
    pub failover: FailoverStrategy,
    /// Seconds a session-affinity binding survives without traffic.
    #[serde(default = "default_affinity_retention_secs")]
    pub affinity_retention_secs: u64,
}

fn default_affinity_retention_secs() -> u64 {
    1800
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dsn", &self.dsn)
            .field("admin_token", &"***")
            .field("encryption_key", &"***")
            .field("allow_key_reveal", &self.allow_key_reveal)
            .field("failover", &self.failover)
            .field("affinity_retention_secs", &self.affinity_retention_secs)
            .finish()
    }
}

/// Optional layer used while merging settings sources.
#[derive(Debug, Clone, Default)]
pub struct SettingsPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub admin_token: Option<String>,
    pub encryption_key: Option<String>,
    pub allow_key_reveal: Option<bool>,
    pub failover: Option<FailoverStrategy>,
    pub affinity_retention_secs: Option<u64>,
}

impl SettingsPatch {
    pub fn overlay(&mut self, other: SettingsPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.admin_token.is_some() {
            self.admin_token = other.admin_token;
        }
        if other.encryption_key.is_some() {
            self.encryption_key = other.encryption_key;
        }
        if other.allow_key_reveal.is_some() {
            self.allow_key_reveal = other.allow_key_reveal;
        }
        if other.failover.is_some() {
            self.failover = other.failover;
        }
        if other.affinity_retention_secs.is_some() {
            self.affinity_retention_secs = other.affinity_retention_secs;
        }
    }

    pub fn into_settings(self) -> Result<Settings, SettingsError> {
        Ok(Settings {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8707),
            dsn: self.dsn.ok_or(SettingsError::MissingField("dsn"))?,
            admin_token: self
                .admin_token
                .ok_or(SettingsError::MissingField("ADMIN_TOKEN"))?,
            encryption_key: self
                .encryption_key
                .ok_or(SettingsError::MissingField("ENCRYPTION_KEY"))?,
            allow_key_reveal: self.allow_key_reveal.unwrap_or(false),
            failover: self.failover.unwrap_or_default(),
            affinity_retention_secs: self
                .affinity_retention_secs
                .unwrap_or_else(default_affinity_retention_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_patch() -> SettingsPatch {
        SettingsPatch {
            host: Some("127.0.0.1".to_string()),
            port: Some(9000),
            dsn: Some("sqlite::memory:".to_string()),
            admin_token: Some("t".to_string()),
            encryption_key: Some("k".to_string()),
            allow_key_reveal: None,
            failover: None,
            affinity_retention_secs: None,
        }
    }

    #[test]
    fn overlay_prefers_later_layer() {
        let mut base = full_patch();
        base.overlay(SettingsPatch {
            port: Some(9100),
            ..Default::default()
        });
        let settings = base.into_settings().unwrap();
        assert_eq!(settings.port, 9100);
        assert_eq!(settings.host, "127.0.0.1");
        assert!(!settings.allow_key_reveal);
    }

    #[test]
    fn missing_admin_token_is_an_error() {
        let mut patch = full_patch();
        patch.admin_token = None;
        assert!(matches!(
            patch.into_settings(),
            Err(SettingsError::MissingField("ADMIN_TOKEN"))
        ));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let settings = full_patch().into_settings().unwrap();
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("admin_token: \"t\""));
        assert!(!rendered.contains("encryption_key: \"k\""));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn exhaust_all_has_no_cap() {
        assert_eq!(FailoverStrategy::ExhaustAll.attempt_cap(), None);
        assert_eq!(FailoverStrategy::MaxAttempts(0).attempt_cap(), Some(1));
        assert_eq!(FailoverStrategy::MaxAttempts(10).attempt_cap(), Some(10));
    }
}
