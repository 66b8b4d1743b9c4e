use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Join row binding an api key to an upstream it may route to. Deleting
/// either parent cascades here.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_key_upstreams")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "api_key_upstream")]
    pub api_key_id: i64,
    #[sea_orm(unique_key = "api_key_upstream")]
    pub upstream_id: i64,
    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "api_key_id", to = "id", on_delete = "Cascade")]
    pub api_key: HasOne<super::api_keys::Entity>,
    #[sea_orm(belongs_to, from = "upstream_id", to = "id", on_delete = "Cascade")]
    pub upstream: HasOne<super::upstreams::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
