use std::sync::{OnceLock, RwLock};

use sea_orm::{Database, DatabaseConnection, DbErr};

struct SharedConnection {
    dsn: String,
    connection: DatabaseConnection,
}

static SHARED: OnceLock<RwLock<Option<SharedConnection>>> = OnceLock::new();

/// Opens (or reuses) the process-wide connection for `dsn`. The admin and
/// proxy surfaces share one pool.
pub async fn connect_shared(dsn: &str) -> Result<DatabaseConnection, DbErr> {
    let slot = SHARED.get_or_init(|| RwLock::new(None));
    if let Ok(guard) = slot.read()
        && let Some(shared) = guard.as_ref()
        && shared.dsn == dsn
    {
        return Ok(shared.connection.clone());
    }

    let connection = Database::connect(dsn).await?;
    if let Ok(mut guard) = slot.write() {
        *guard = Some(SharedConnection {
            dsn: dsn.to_string(),
            connection: connection.clone(),
        });
    }
    Ok(connection)
}
