use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Keyed blake3 digest of the bearer secret, hex encoded.
    #[sea_orm(unique_key = "api_key_hash")]
    pub key_hash: String,
    /// First 12 characters of the secret, display only.
    pub key_prefix: String,
    /// AES-GCM sealed plaintext; present only when reveal is enabled.
    pub sealed_secret: Option<String>,
    pub name: String,
    pub is_active: bool,
    pub expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub bindings: HasMany<super::api_key_upstreams::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
