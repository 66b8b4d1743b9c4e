use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use autorouter_storage::StorageSnapshot;
use http::{HeaderMap, StatusCode, header};
use time::OffsetDateTime;

use crate::crypto::CredentialCipher;

/// Resolved downstream principal for one request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key_id: i64,
    pub key_name: String,
    pub upstream_ids: Arc<Vec<i64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingKey,
    UnknownKey,
    KeyDisabled,
    KeyExpired,
}

impl AuthFailure {
    pub fn status(self) -> StatusCode {
        match self {
            AuthFailure::MissingKey | AuthFailure::UnknownKey => StatusCode::UNAUTHORIZED,
            AuthFailure::KeyDisabled | AuthFailure::KeyExpired => StatusCode::FORBIDDEN,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            AuthFailure::MissingKey => "missing api key",
            AuthFailure::UnknownKey => "invalid api key",
            AuthFailure::KeyDisabled => "api key disabled",
            AuthFailure::KeyExpired => "api key expired",
        }
    }
}

#[derive(Debug, Clone)]
struct ApiKeyEntry {
    id: i64,
    name: String,
    is_active: bool,
    expires_at: Option<OffsetDateTime>,
    upstream_ids: Arc<Vec<i64>>,
}

#[derive(Debug, Default)]
struct KeySnapshot {
    by_digest: HashMap<String, ApiKeyEntry>,
}

/// Digest-indexed key lookup. The bearer secret is hashed with the keyed
/// digest scheme and never stored; admin revokes swap in a fresh snapshot.
pub struct KeyStore {
    snapshot: ArcSwap<KeySnapshot>,
}

impl KeyStore {
    pub fn from_snapshot(snapshot: &StorageSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(build_snapshot(snapshot)),
        }
    }

    /// Admin mutations (revoke, rebind) publish a fresh snapshot here.
    pub fn replace(&self, snapshot: &StorageSnapshot) {
        self.snapshot.store(Arc::new(build_snapshot(snapshot)));
    }

    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        cipher: &CredentialCipher,
        now: OffsetDateTime,
    ) -> Result<AuthContext, AuthFailure> {
        let secret = extract_bearer(headers).ok_or(AuthFailure::MissingKey)?;
        let digest = cipher.key_digest(&secret);

        let snapshot = self.snapshot.load();
        let entry = snapshot
            .by_digest
            .get(digest.as_str())
            .ok_or(AuthFailure::UnknownKey)?;

        if !entry.is_active {
            return Err(AuthFailure::KeyDisabled);
        }
        if let Some(expires_at) = entry.expires_at
            && expires_at < now
        {
            return Err(AuthFailure::KeyExpired);
        }

        Ok(AuthContext {
            api_key_id: entry.id,
            key_name: entry.name.clone(),
            upstream_ids: entry.upstream_ids.clone(),
        })
    }
}

fn build_snapshot(snapshot: &StorageSnapshot) -> KeySnapshot {
    let mut bindings: HashMap<i64, Vec<i64>> = HashMap::new();
    for binding in &snapshot.bindings {
        bindings
            .entry(binding.api_key_id)
            .or_default()
            .push(binding.upstream_id);
    }

    let mut by_digest = HashMap::with_capacity(snapshot.api_keys.len());
    for key in &snapshot.api_keys {
        let upstream_ids = bindings.remove(&key.id).unwrap_or_default();
        by_digest.insert(
            key.key_hash.clone(),
            ApiKeyEntry {
                id: key.id,
                name: key.name.clone(),
                is_active: key.is_active,
                expires_at: key.expires_at,
                upstream_ids: Arc::new(upstream_ids),
            },
        );
    }
    KeySnapshot { by_digest }
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let prefix = "Bearer ";
    if value.len() > prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        let token = value[prefix.len()..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}
