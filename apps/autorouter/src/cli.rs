use std::path::Path;

use anyhow::Context;
use clap::Parser;

#[derive(Parser)]
#[command(name = "autorouter")]
pub(crate) struct Cli {
    /// Database DSN; sqlite, mysql and postgres URLs are accepted.
    #[arg(long, env = "DATABASE_URL", default_value = "")]
    pub(crate) dsn: String,
    /// Directory for the default sqlite database when --dsn is omitted.
    #[arg(long, env = "AUTOROUTER_DATA_DIR", default_value = "")]
    pub(crate) data_dir: String,
    #[arg(long, env = "AUTOROUTER_HOST", default_value = "0.0.0.0")]
    pub(crate) host: String,
    #[arg(long, env = "AUTOROUTER_PORT", default_value_t = 8707)]
    pub(crate) port: u16,
    /// Bearer token protecting /api/admin/*.
    #[arg(long, env = "ADMIN_TOKEN")]
    pub(crate) admin_token: String,
    /// 32-byte AES-256-GCM key (base64 or hex) sealing upstream credentials.
    #[arg(long, env = "ENCRYPTION_KEY")]
    pub(crate) encryption_key: String,
    /// Allow storing and revealing api-key plaintext.
    #[arg(long, env = "ALLOW_KEY_REVEAL", default_value_t = false)]
    pub(crate) allow_key_reveal: bool,
    /// Cap failover attempts instead of exhausting every candidate.
    #[arg(long, env = "AUTOROUTER_MAX_ATTEMPTS")]
    pub(crate) max_attempts: Option<u32>,
}

impl Cli {
    /// DSN fed into the settings merge. An omitted `--dsn` falls back to a
    /// sqlite file under the data directory; sqlite targets are created on
    /// first boot since sqlx refuses to open a missing database file.
    pub(crate) fn database_dsn(&self) -> anyhow::Result<String> {
        let dsn = self.dsn.trim();
        if dsn.is_empty() {
            let path = Path::new(&self.data_dir).join("db").join("autorouter.db");
            prepare_sqlite_file(&path)?;
            let rendered = path.to_string_lossy();
            return Ok(match rendered.strip_prefix('/') {
                Some(absolute) => format!("sqlite:///{absolute}"),
                None => format!("sqlite://{rendered}"),
            });
        }
        if let Some(target) = sqlite_file_target(dsn) {
            prepare_sqlite_file(Path::new(target))?;
        }
        Ok(dsn.to_string())
    }
}

fn prepare_sqlite_file(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create database directory {}", parent.display()))?;
    }
    if !path.exists() {
        std::fs::File::create(path)
            .with_context(|| format!("create database file {}", path.display()))?;
    }
    Ok(())
}

/// File path named by a sqlite DSN; in-memory DSNs and other backends have
/// no file to prepare.
fn sqlite_file_target(dsn: &str) -> Option<&str> {
    let rest = dsn
        .strip_prefix("sqlite://")
        .or_else(|| dsn.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path.starts_with(":memory:") || path.starts_with("memory:") {
        return None;
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_targets_are_extracted_from_dsns() {
        assert_eq!(
            sqlite_file_target("sqlite:///var/lib/autorouter.db"),
            Some("/var/lib/autorouter.db")
        );
        assert_eq!(
            sqlite_file_target("sqlite://data/autorouter.db?mode=rwc"),
            Some("data/autorouter.db")
        );
        assert_eq!(sqlite_file_target("sqlite::memory:"), None);
        assert_eq!(sqlite_file_target("sqlite://"), None);
        assert_eq!(sqlite_file_target("postgres://db/autorouter"), None);
        assert_eq!(sqlite_file_target("mysql://db/autorouter"), None);
    }
}
