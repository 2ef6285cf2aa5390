//! Database migration system for the ACL store
//!
//! Migrations are embedded SQL strings tracked by version in a `_migrations`
//! table and applied in order on startup.

use super::Database;
use super::DatabaseError;
use tracing::{debug, info, instrument};

/// Represents a single database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number (must be unique and incrementing)
    pub version: i64,
    /// Description of what this migration does
    pub description: String,
    /// SQL to execute for the migration
    pub sql: &'static str,
}

/// Access-control schema migrations
pub mod acl {
    use super::Migration;

    /// ACL definitions, membership edges and resource-action bindings
    pub const V0001_INITIAL_SCHEMA: &str = r#"
-- Named permission groups
CREATE TABLE IF NOT EXISTS access_control_lists (
    id TEXT PRIMARY KEY,                    -- Human-meaningful id (e.g. sys-admin)
    description TEXT NOT NULL DEFAULT '',
    is_open INTEGER NOT NULL DEFAULT 0,     -- Anyone may read membership / self-join
    updater_acl_id TEXT NOT NULL,           -- ACL whose members may edit this ACL
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Membership edges: exactly one of member_acl_id / member_user_id is set.
-- Legacy rows violating that are tolerated on read and skipped.
CREATE TABLE IF NOT EXISTS acl_memberships (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_acl_id TEXT NOT NULL,
    member_acl_id TEXT,
    member_user_id TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_acl_memberships_parent ON acl_memberships(parent_acl_id);
CREATE INDEX IF NOT EXISTS idx_acl_memberships_member_acl ON acl_memberships(member_acl_id);

CREATE UNIQUE INDEX IF NOT EXISTS idx_acl_memberships_unique_acl
    ON acl_memberships(parent_acl_id, member_acl_id) WHERE member_acl_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_acl_memberships_unique_user
    ON acl_memberships(parent_acl_id, member_user_id) WHERE member_user_id IS NOT NULL;

-- Which ACL governs a protected (resource, action) pair
CREATE TABLE IF NOT EXISTS resource_actions (
    resource_id TEXT NOT NULL,              -- e.g. /course/ai-1/instance/WS24/comments
    action_id TEXT NOT NULL,                -- e.g. MODERATE
    acl_id TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (resource_id, action_id)
);

CREATE INDEX IF NOT EXISTS idx_resource_actions_action ON resource_actions(action_id);
"#;

    /// Get all ACL migrations in order
    pub fn all() -> Vec<Migration> {
        vec![Migration {
            version: 1,
            description: "ACLs, memberships and resource actions".to_string(),
            sql: V0001_INITIAL_SCHEMA,
        }]
    }
}

/// Migration runner for applying migrations to a database
pub struct MigrationRunner {
    migrations: Vec<Migration>,
}

impl MigrationRunner {
    /// Create a new migration runner with the given migrations
    pub fn new(migrations: Vec<Migration>) -> Self {
        let mut sorted = migrations;
        sorted.sort_by_key(|m| m.version);
        Self { migrations: sorted }
    }

    /// Create a runner for the access-control schema
    pub fn acl() -> Self {
        Self::new(acl::all())
    }

    /// Run all pending migrations on the database
    #[instrument(skip_all, fields(db_name = %db.name()))]
    pub async fn run(&self, db: &Database) -> Result<Vec<i64>, DatabaseError> {
        let conn = db.connection().await;
        self.run_with_connection(&conn).await
    }

    async fn run_with_connection(
        &self,
        conn: &libsql::Connection,
    ) -> Result<Vec<i64>, DatabaseError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::MigrationFailed(format!("Failed to create migrations table: {}", e))
        })?;

        let mut applied: Vec<i64> = Vec::new();
        let mut rows = conn
            .query("SELECT version FROM _migrations ORDER BY version", ())
            .await
            .map_err(|e| DatabaseError::MigrationFailed(format!("Failed to query migrations: {}", e)))?;

        while let Some(row) = rows.next().await.map_err(|e| {
            DatabaseError::MigrationFailed(format!("Failed to read migration row: {}", e))
        })? {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to get version from row: {}", e))
            })?;
            applied.push(version);
        }

        debug!("Already applied migrations: {:?}", applied);

        let mut newly_applied = Vec::new();
        for migration in &self.migrations {
            if applied.contains(&migration.version) {
                debug!("Skipping already applied migration v{}", migration.version);
                continue;
            }

            info!(
                "Applying migration v{}: {}",
                migration.version, migration.description
            );

            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::MigrationFailed(format!(
                    "Migration v{} failed: {}",
                    migration.version, e
                ))
            })?;

            conn.execute(
                "INSERT INTO _migrations (version, description) VALUES (?, ?)",
                (migration.version, migration.description.as_str()),
            )
            .await
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!(
                    "Failed to record migration v{}: {}",
                    migration.version, e
                ))
            })?;

            newly_applied.push(migration.version);
        }

        if newly_applied.is_empty() {
            debug!("No new migrations to apply");
        } else {
            info!("Applied {} new migrations", newly_applied.len());
        }

        Ok(newly_applied)
    }

    /// Get the current schema version
    #[instrument(skip_all, fields(db_name = %db.name()))]
    pub async fn current_version(&self, db: &Database) -> Result<Option<i64>, DatabaseError> {
        let conn = db.connection().await;

        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='_migrations'",
                (),
            )
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Failed to check migrations table: {}", e)))?;

        if rows
            .next()
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Failed to read result: {}", e)))?
            .is_none()
        {
            return Ok(None);
        }

        let mut rows = conn
            .query("SELECT MAX(version) FROM _migrations", ())
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Failed to query max version: {}", e)))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Failed to read max version: {}", e)))?
        {
            Some(row) => Ok(row.get::<Option<i64>>(0).ok().flatten()),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migration_runner_acl() {
        let db = Database::in_memory("test-acl").await.unwrap();
        let runner = MigrationRunner::acl();

        let applied = runner.run(&db).await.unwrap();
        assert_eq!(applied, vec![1]);

        // Running again should apply nothing
        let applied_again = runner.run(&db).await.unwrap();
        assert!(applied_again.is_empty());

        assert_eq!(runner.current_version(&db).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_current_version_before_migrating() {
        let db = Database::in_memory("test-fresh").await.unwrap();
        let runner = MigrationRunner::acl();
        assert_eq!(runner.current_version(&db).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tables_exist() {
        let db = Database::in_memory("test-tables").await.unwrap();
        MigrationRunner::acl().run(&db).await.unwrap();

        let conn = db.connection().await;
        let mut rows = conn
            .query("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name", ())
            .await
            .unwrap();

        let mut tables = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let name: String = row.get(0).unwrap();
            tables.push(name);
        }

        assert!(tables.contains(&"access_control_lists".to_string()));
        assert!(tables.contains(&"acl_memberships".to_string()));
        assert!(tables.contains(&"resource_actions".to_string()));
    }
}
