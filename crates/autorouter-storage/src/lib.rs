pub mod bus;
pub mod db;
pub mod entities;
pub mod snapshot;
pub mod store;

pub use bus::{StorageBus, StorageBusConfig};
pub use sea_orm::DbErr;
pub use snapshot::{
    ApiKeyRow, BindingRow, BreakerStateRow, CompensationRuleRow, ManualOverrideRow, ModelPriceRow,
    StorageSnapshot, UpstreamRow,
};
pub use store::{
    BilledSpendRow, BillingSnapshotUpsert, BreakerPersist, CompensationRuleInput, RequestLogInsert,
    RequestStatRow, SnapshotStatRow, Store,
};
