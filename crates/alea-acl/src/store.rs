//! Durable storage for ACLs, membership edges and resource-action bindings
//!
//! All writes go through here. Nothing in this module touches the cache; the
//! engine recomputes after every successful write.

use std::sync::Arc;

use libsql::Connection;
use tracing::{debug, instrument, warn};

use crate::db::Database;
use crate::graph::MembershipGraph;
use crate::model::{AccessControlList, AclMembership, AclUpdate, Member, NewAcl, ResourceAction};
use crate::AclError;

fn is_unique_violation(err: &libsql::Error) -> bool {
    err.to_string().contains("UNIQUE constraint failed")
}

/// libSQL-backed store for the membership graph and the assignment table
#[derive(Clone)]
pub struct AclStore {
    db: Arc<Database>,
}

impl AclStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    // ---- ACLs ----

    /// Insert a new ACL together with its initial members
    ///
    /// Nested members must already exist, except the new ACL itself.
    #[instrument(skip(self, acl), fields(acl_id = %acl.id))]
    pub async fn create_acl(&self, acl: &NewAcl) -> Result<AccessControlList, AclError> {
        validate_id(&acl.id)?;
        validate_id(&acl.updater_acl_id)?;

        let conn = self.db.connection().await;

        if acl.updater_acl_id != acl.id && !acl_exists(&conn, &acl.updater_acl_id).await? {
            return Err(AclError::AclNotFound(acl.updater_acl_id.clone()));
        }
        for member in acl.members() {
            if let Member::Acl(nested) = &member {
                if nested != &acl.id && !acl_exists(&conn, nested).await? {
                    return Err(AclError::AclNotFound(nested.clone()));
                }
            }
        }

        let tx = conn.transaction().await?;
        tx.execute(
            r#"
            INSERT INTO access_control_lists (id, description, is_open, updater_acl_id)
            VALUES (?, ?, ?, ?)
            "#,
            (
                acl.id.as_str(),
                acl.description.as_str(),
                acl.is_open as i64,
                acl.updater_acl_id.as_str(),
            ),
        )
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AclError::AlreadyExists(acl.id.clone())
            } else {
                AclError::Database(e.to_string())
            }
        })?;

        for member in acl.members() {
            let (member_acl, member_user) = member.as_columns();
            tx.execute(
                r#"
                INSERT OR IGNORE INTO acl_memberships (parent_acl_id, member_acl_id, member_user_id)
                VALUES (?, ?, ?)
                "#,
                (acl.id.as_str(), member_acl, member_user),
            )
            .await?;
        }
        tx.commit().await?;

        debug!("Created ACL with {} initial members", acl.members().count());
        fetch_acl(&conn, &acl.id)
            .await?
            .ok_or_else(|| AclError::AclNotFound(acl.id.clone()))
    }

    /// Apply a partial update to an ACL's definition
    #[instrument(skip(self, update))]
    pub async fn update_acl(
        &self,
        id: &str,
        update: &AclUpdate,
    ) -> Result<AccessControlList, AclError> {
        let conn = self.db.connection().await;

        let mut acl = fetch_acl(&conn, id)
            .await?
            .ok_or_else(|| AclError::AclNotFound(id.to_string()))?;

        if let Some(updater) = &update.updater_acl_id {
            validate_id(updater)?;
            if updater != id && !acl_exists(&conn, updater).await? {
                return Err(AclError::AclNotFound(updater.clone()));
            }
            acl.updater_acl_id = updater.clone();
        }
        if let Some(description) = &update.description {
            acl.description = description.clone();
        }
        if let Some(is_open) = update.is_open {
            acl.is_open = is_open;
        }

        conn.execute(
            r#"
            UPDATE access_control_lists
            SET description = ?, is_open = ?, updater_acl_id = ?, updated_at = datetime('now')
            WHERE id = ?
            "#,
            (
                acl.description.as_str(),
                acl.is_open as i64,
                acl.updater_acl_id.as_str(),
                id,
            ),
        )
        .await?;

        fetch_acl(&conn, id)
            .await?
            .ok_or_else(|| AclError::AclNotFound(id.to_string()))
    }

    /// Delete an ACL and every edge touching it, in one transaction
    #[instrument(skip(self))]
    pub async fn delete_acl(&self, id: &str) -> Result<(), AclError> {
        let conn = self.db.connection().await;
        let tx = conn.transaction().await?;

        let edges = tx
            .execute(
                "DELETE FROM acl_memberships WHERE parent_acl_id = ? OR member_acl_id = ?",
                (id, id),
            )
            .await?;
        let rows = tx
            .execute("DELETE FROM access_control_lists WHERE id = ?", [id])
            .await?;

        if rows == 0 {
            tx.rollback().await?;
            return Err(AclError::AclNotFound(id.to_string()));
        }
        tx.commit().await?;

        debug!(edges, "Deleted ACL");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_acl(&self, id: &str) -> Result<Option<AccessControlList>, AclError> {
        let conn = self.db.connection().await;
        fetch_acl(&conn, id).await
    }

    pub async fn acl_exists(&self, id: &str) -> Result<bool, AclError> {
        let conn = self.db.connection().await;
        acl_exists(&conn, id).await
    }

    pub async fn list_acl_ids(&self) -> Result<Vec<String>, AclError> {
        let conn = self.db.connection().await;
        let mut rows = conn
            .query("SELECT id FROM access_control_lists ORDER BY id", ())
            .await?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    // ---- Membership edges ----

    /// Add a membership edge; both ends must exist
    #[instrument(skip(self), fields(member = %member))]
    pub async fn add_membership(
        &self,
        parent_acl_id: &str,
        member: &Member,
    ) -> Result<AclMembership, AclError> {
        validate_id(member.id())?;
        let conn = self.db.connection().await;

        if !acl_exists(&conn, parent_acl_id).await? {
            return Err(AclError::AclNotFound(parent_acl_id.to_string()));
        }
        if let Member::Acl(nested) = member {
            if !acl_exists(&conn, nested).await? {
                return Err(AclError::AclNotFound(nested.clone()));
            }
        }

        let (member_acl, member_user) = member.as_columns();
        conn.execute(
            r#"
            INSERT INTO acl_memberships (parent_acl_id, member_acl_id, member_user_id)
            VALUES (?, ?, ?)
            "#,
            (parent_acl_id, member_acl, member_user),
        )
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AclError::AlreadyExists(format!("{} -> {}", parent_acl_id, member))
            } else {
                AclError::Database(e.to_string())
            }
        })?;

        Ok(AclMembership {
            id: conn.last_insert_rowid(),
            parent_acl_id: parent_acl_id.to_string(),
            member: member.clone(),
        })
    }

    #[instrument(skip(self), fields(member = %member))]
    pub async fn remove_membership(
        &self,
        parent_acl_id: &str,
        member: &Member,
    ) -> Result<(), AclError> {
        let conn = self.db.connection().await;

        let (member_acl, member_user) = member.as_columns();
        let rows = match (member_acl, member_user) {
            (Some(acl), _) => {
                conn.execute(
                    "DELETE FROM acl_memberships WHERE parent_acl_id = ? AND member_acl_id = ?",
                    (parent_acl_id, acl),
                )
                .await?
            }
            (None, Some(user)) => {
                conn.execute(
                    "DELETE FROM acl_memberships WHERE parent_acl_id = ? AND member_user_id = ?",
                    (parent_acl_id, user),
                )
                .await?
            }
            (None, None) => 0,
        };

        if rows == 0 {
            return Err(AclError::MembershipNotFound(format!(
                "{} -> {}",
                parent_acl_id, member
            )));
        }
        Ok(())
    }

    /// Edges leaving `parent_acl_id`; malformed rows are skipped
    #[instrument(skip(self))]
    pub async fn direct_members(&self, parent_acl_id: &str) -> Result<Vec<Member>, AclError> {
        let conn = self.db.connection().await;
        let mut rows = conn
            .query(
                r#"
                SELECT id, member_acl_id, member_user_id FROM acl_memberships
                WHERE parent_acl_id = ?
                ORDER BY id
                "#,
                [parent_acl_id],
            )
            .await?;

        let mut members = Vec::new();
        while let Some(row) = rows.next().await? {
            let row_id: i64 = row.get(0)?;
            match Member::from_columns(row.get(1)?, row.get(2)?) {
                Ok(member) => members.push(member),
                Err(e) => warn!(row_id, error = %e, "Skipping malformed membership row"),
            }
        }
        Ok(members)
    }

    /// Read the whole membership graph into memory
    #[instrument(skip(self))]
    pub async fn load_graph(&self) -> Result<MembershipGraph, AclError> {
        let conn = self.db.connection().await;
        let mut graph = MembershipGraph::new();

        let mut rows = conn.query("SELECT id FROM access_control_lists", ()).await?;
        while let Some(row) = rows.next().await? {
            graph.insert_acl(row.get::<String>(0)?);
        }

        let mut rows = conn
            .query(
                "SELECT id, parent_acl_id, member_acl_id, member_user_id FROM acl_memberships",
                (),
            )
            .await?;

        let mut edges = 0usize;
        while let Some(row) = rows.next().await? {
            let row_id: i64 = row.get(0)?;
            let parent: String = row.get(1)?;
            match Member::from_columns(row.get(2)?, row.get(3)?) {
                Ok(member) => {
                    if graph.insert_edge(parent, member) {
                        edges += 1;
                    }
                }
                Err(e) => warn!(row_id, error = %e, "Skipping malformed membership row"),
            }
        }

        debug!(acls = graph.acl_count(), edges, "Loaded membership graph");
        Ok(graph)
    }

    // ---- Resource-action bindings ----

    /// Bind (resource, action) to an ACL, replacing any previous binding
    #[instrument(skip(self), fields(binding = %binding))]
    pub async fn upsert_resource_action(&self, binding: &ResourceAction) -> Result<(), AclError> {
        if binding.resource_id.is_empty() {
            return Err(AclError::InvalidResource("empty resource id".to_string()));
        }
        if binding.action_id.is_empty() {
            return Err(AclError::InvalidResource("empty action id".to_string()));
        }

        let conn = self.db.connection().await;
        if !acl_exists(&conn, &binding.acl_id).await? {
            return Err(AclError::AclNotFound(binding.acl_id.clone()));
        }

        conn.execute(
            r#"
            INSERT INTO resource_actions (resource_id, action_id, acl_id)
            VALUES (?, ?, ?)
            ON CONFLICT(resource_id, action_id)
            DO UPDATE SET acl_id = excluded.acl_id, updated_at = datetime('now')
            "#,
            (
                binding.resource_id.as_str(),
                binding.action_id.as_str(),
                binding.acl_id.as_str(),
            ),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_resource_action(
        &self,
        resource_id: &str,
        action_id: &str,
    ) -> Result<(), AclError> {
        let conn = self.db.connection().await;
        let rows = conn
            .execute(
                "DELETE FROM resource_actions WHERE resource_id = ? AND action_id = ?",
                (resource_id, action_id),
            )
            .await?;

        if rows == 0 {
            return Err(AclError::ResourceActionNotFound {
                resource_id: resource_id.to_string(),
                action_id: action_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn list_resource_actions(&self) -> Result<Vec<ResourceAction>, AclError> {
        let conn = self.db.connection().await;
        let rows = conn
            .query(
                "SELECT resource_id, action_id, acl_id FROM resource_actions ORDER BY resource_id, action_id",
                (),
            )
            .await?;
        collect_resource_actions(rows).await
    }

    /// Bindings for one action across all resources
    pub async fn resource_actions_for_action(
        &self,
        action_id: &str,
    ) -> Result<Vec<ResourceAction>, AclError> {
        let conn = self.db.connection().await;
        let rows = conn
            .query(
                "SELECT resource_id, action_id, acl_id FROM resource_actions WHERE action_id = ?",
                [action_id],
            )
            .await?;
        collect_resource_actions(rows).await
    }
}

fn validate_id(id: &str) -> Result<(), AclError> {
    if id.trim().is_empty() {
        return Err(AclError::InvalidAcl("id must not be empty".to_string()));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(AclError::InvalidAcl(format!(
            "id '{}' must not contain whitespace",
            id
        )));
    }
    Ok(())
}

async fn acl_exists(conn: &Connection, id: &str) -> Result<bool, AclError> {
    let mut rows = conn
        .query("SELECT 1 FROM access_control_lists WHERE id = ? LIMIT 1", [id])
        .await?;
    Ok(rows.next().await?.is_some())
}

async fn fetch_acl(conn: &Connection, id: &str) -> Result<Option<AccessControlList>, AclError> {
    let mut rows = conn
        .query(
            r#"
            SELECT id, description, is_open, updater_acl_id, created_at, updated_at
            FROM access_control_lists WHERE id = ?
            "#,
            [id],
        )
        .await?;

    match rows.next().await? {
        Some(row) => Ok(Some(AccessControlList {
            id: row.get(0)?,
            description: row.get(1)?,
            is_open: row.get::<i64>(2)? != 0,
            updater_acl_id: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })),
        None => Ok(None),
    }
}

async fn collect_resource_actions(mut rows: libsql::Rows) -> Result<Vec<ResourceAction>, AclError> {
    let mut bindings = Vec::new();
    while let Some(row) = rows.next().await? {
        bindings.push(ResourceAction {
            resource_id: row.get(0)?,
            action_id: row.get(1)?,
            acl_id: row.get(2)?,
        });
    }
    Ok(bindings)
}
