//! Nested access-control lists for ALeA
//!
//! An ACL is a named group whose members are users or other ACLs. Membership
//! is resolved transitively: a user in `B` is a member of every ACL that
//! nests `B`. Protected operations are identified by a (resource, action)
//! pair bound to exactly one governing ACL.
//!
//! - **Store**: ACLs, membership edges and bindings persisted in libSQL
//! - **Flattening**: per-ACL closure and member sets computed from a snapshot
//!   of the membership graph
//! - **Cache**: flattened sets and bindings held in a [`CacheStore`], either
//!   in-process or in Redis, so a check is a single set lookup
//! - **Engine**: the query API plus the recompute that follows every mutation
//!
//! # Example
//!
//! ```ignore
//! let engine = AclEngine::new(store, cache);
//! engine.create_acl(&NewAcl::new("moderators", "sys-admin").with_user("alice")).await?;
//! engine.upsert_resource_action(&ResourceAction::new("/course/x/comments", "DELETE", "moderators")).await?;
//!
//! assert!(engine.can_access_resource("/course/x/comments", "DELETE", "alice").await);
//! ```

pub mod assignments;
pub mod cache;
pub mod db;
pub mod engine;
pub mod flatten;
pub mod graph;
pub mod model;
pub mod resource;
pub mod store;

pub use assignments::ResourceAssignmentCache;
pub use cache::{connect_cache, CacheBackend, CacheConfig, CacheError, CacheStore, MemoryCache, RedisCache};
pub use db::{Database, DatabaseError, MigrationRunner};
pub use engine::{AclDetails, AclEngine, RecomputeReport, SYS_ADMIN_ACL};
pub use flatten::{Flattened, Flattener};
pub use graph::MembershipGraph;
pub use model::{AccessControlList, AclMembership, AclUpdate, Member, NewAcl, ResourceAction};
pub use resource::{Action, ResourceActionParams, ResourceName, ResourcePattern};
pub use store::AclStore;

use thiserror::Error;

/// Errors raised by the ACL engine
///
/// Authorization outcomes are not errors: a missing ACL or binding is a
/// `false` answer. These variants cover invalid input, refused administrative
/// actions and infrastructure faults.
#[derive(Error, Debug)]
pub enum AclError {
    #[error("Permission denied: {0}")]
    Denied(String),

    #[error("ACL not found: {0}")]
    AclNotFound(String),

    #[error("Membership not found: {0}")]
    MembershipNotFound(String),

    #[error("Resource action not found: {resource_id} {action_id}")]
    ResourceActionNotFound {
        resource_id: String,
        action_id: String,
    },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid ACL: {0}")]
    InvalidAcl(String),

    #[error("Invalid membership: {0}")]
    InvalidMembership(String),

    #[error("Action {action} is not valid for resource {resource}")]
    InvalidAction { action: String, resource: String },

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl From<DatabaseError> for AclError {
    fn from(err: DatabaseError) -> Self {
        AclError::Database(err.to_string())
    }
}

impl From<libsql::Error> for AclError {
    fn from(err: libsql::Error) -> Self {
        AclError::Database(err.to_string())
    }
}
