//! SurrealDB schema migrations and initialization
//!
//! Sets up the `kv_entries` table backing [`crate::SurrealKvStore`].

use crate::error::StateError;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all gradeflow tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing gradeflow SurrealDB schema");
    init_kv_entries_table(db).await?;
    info!("gradeflow schema initialization complete");
    Ok(())
}

/// Initialize `kv_entries` table
///
/// Schema:
/// ```text
/// TABLE kv_entries {
///   entry_key:   STRING (record id and unique index)
///   payload:     STRING (JSON-encoded versioned record)
///   revision:    INT    (starts at 1, +1 per write)
///   expires_at:  INT?   (unix millis; absent = never)
///   updated_at:  DATETIME
/// }
/// ```
///
/// Constraints:
/// - the record id is `kv_entries:⟨entry_key⟩`
/// - `revision` only grows; conditional writes compare against it
/// - expired rows are hidden by the application and overwritten on the next put
async fn init_kv_entries_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing kv_entries table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS kv_entries SCHEMAFULL;
        DEFINE FIELD IF NOT EXISTS entry_key ON kv_entries TYPE string;
        DEFINE FIELD IF NOT EXISTS payload ON kv_entries TYPE string;
        DEFINE FIELD IF NOT EXISTS revision ON kv_entries TYPE int DEFAULT 0;
        DEFINE FIELD IF NOT EXISTS expires_at ON kv_entries TYPE option<int>;
        DEFINE FIELD IF NOT EXISTS updated_at ON kv_entries TYPE datetime DEFAULT time::now();
        DEFINE INDEX IF NOT EXISTS idx_entry_key ON TABLE kv_entries COLUMNS entry_key UNIQUE;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?
        .check()
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    info!("✓ kv_entries table initialized");
    Ok(())
}
