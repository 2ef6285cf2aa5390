//! Authorization engine
//!
//! [`AclEngine`] answers membership and resource-access questions from the
//! cache, and keeps the cache in step with the store: every mutation writes
//! the store and then recomputes the affected flattened sets before it
//! returns.
//!
//! One recompute lock serializes mutations, recomputes and cold-cache fills.
//! It pairs an in-process mutex with a lock key in the cache backend, so
//! instances sharing a Redis cache also take turns. Warm queries never take
//! it.
//!
//! Mutations that can shrink a flattened set first delete the computed
//! markers of the affected ACLs. A fault after the store write then leaves
//! those ACLs cold rather than serving the old sets.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::assignments::ResourceAssignmentCache;
use crate::cache::{keys, CacheError, CacheStore};
use crate::flatten::Flattener;
use crate::graph::MembershipGraph;
use crate::model::{AccessControlList, AclMembership, AclUpdate, Member, NewAcl, ResourceAction};
use crate::resource::{Action, ResourceActionParams, ResourcePattern};
use crate::store::AclStore;
use crate::AclError;

/// ACL whose members may run a full recompute
pub const SYS_ADMIN_ACL: &str = "sys-admin";

/// Lapse time of the shared recompute lock
const RECOMPUTE_LOCK_TTL: Duration = Duration::from_secs(30);
/// How long to wait for another instance to release it
const RECOMPUTE_LOCK_WAIT: Duration = Duration::from_secs(10);
const RECOMPUTE_LOCK_RETRY: Duration = Duration::from_millis(20);

/// Outcome of [`AclEngine::recompute_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecomputeReport {
    /// ACLs flattened
    pub acls: usize,
    /// Bindings written to the assignment cache
    pub assignments: usize,
    /// Cached ACLs removed because they no longer exist
    pub dropped: usize,
}

/// An ACL definition with its direct edges
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AclDetails {
    #[serde(flatten)]
    pub acl: AccessControlList,
    pub members: Vec<Member>,
}

pub struct AclEngine {
    store: AclStore,
    cache: Arc<dyn CacheStore>,
    assignments: ResourceAssignmentCache,
    recompute_lock: Mutex<()>,
}

impl AclEngine {
    pub fn new(store: AclStore, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            assignments: ResourceAssignmentCache::new(Arc::clone(&cache)),
            cache,
            recompute_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &AclStore {
        &self.store
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    // ---- Queries ----

    /// Whether `user_id` is a transitive member of `acl_id`
    ///
    /// An unknown ACL is simply `false`.
    #[instrument(skip(self))]
    pub async fn check_membership(&self, acl_id: &str, user_id: &str) -> Result<bool, AclError> {
        if !self.ensure_flattened(acl_id).await? {
            return Ok(false);
        }
        Ok(self
            .cache
            .is_member_of_set(&keys::members(acl_id), user_id)
            .await?)
    }

    /// [`check_membership`](Self::check_membership), denying on any fault
    pub async fn is_member_of_acl(&self, acl_id: &str, user_id: &str) -> bool {
        match self.check_membership(acl_id, user_id).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(acl_id, user_id, error = %e, "Membership check failed, denying");
                false
            }
        }
    }

    /// Whether `user_id` may perform `action_id` on `resource_id`
    ///
    /// A pair with no governing ACL is denied.
    #[instrument(skip(self))]
    pub async fn check_resource_access(
        &self,
        resource_id: &str,
        action_id: &str,
        user_id: &str,
    ) -> Result<bool, AclError> {
        self.ensure_assignments_built().await?;
        match self.assignments.lookup(resource_id, action_id).await? {
            Some(acl_id) => self.check_membership(&acl_id, user_id).await,
            None => {
                debug!("No ACL bound to resource action");
                Ok(false)
            }
        }
    }

    /// [`check_resource_access`](Self::check_resource_access), denying on any fault
    pub async fn can_access_resource(&self, resource_id: &str, action_id: &str, user_id: &str) -> bool {
        match self.check_resource_access(resource_id, action_id, user_id).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(resource_id, action_id, user_id, error = %e, "Access check failed, denying");
                false
            }
        }
    }

    /// Whether any of the templated resource actions grants access
    ///
    /// A malformed request (unknown variable, action not valid for the
    /// resource) is an error. A fault while checking one entry denies that
    /// entry only.
    #[instrument(skip(self, requests), fields(count = requests.len()))]
    pub async fn is_authorized_for_any(
        &self,
        user_id: &str,
        requests: &[ResourceActionParams],
    ) -> Result<bool, AclError> {
        let resolved = requests
            .iter()
            .map(|params| params.resolve().map(|id| (id, params.action)))
            .collect::<Result<Vec<(String, Action)>, AclError>>()?;

        if user_id.is_empty() {
            return Ok(false);
        }

        for (resource_id, action) in resolved {
            if self
                .can_access_resource(&resource_id, action.as_str(), user_id)
                .await
            {
                debug!(%resource_id, %action, "Authorized");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every user that is a transitive member of `acl_id`, sorted
    #[instrument(skip(self))]
    pub async fn flattened_members(&self, acl_id: &str) -> Result<Vec<String>, AclError> {
        if !self.ensure_flattened(acl_id).await? {
            return Err(AclError::AclNotFound(acl_id.to_string()));
        }
        let mut members = self.cache.get_from_set(&keys::members(acl_id)).await?;
        members.sort();
        Ok(members)
    }

    /// Whether `user_id` may edit the access-control entries of `resource_id`
    ///
    /// Granted by membership in any ACL bound with `ACCESS_CONTROL` to a
    /// pattern matching the resource.
    #[instrument(skip(self))]
    pub async fn can_update_access_control_entries(
        &self,
        resource_id: &str,
        user_id: &str,
    ) -> Result<bool, AclError> {
        let bindings = self
            .store
            .resource_actions_for_action(Action::AccessControl.as_str())
            .await?;

        let mut candidates = BTreeSet::new();
        for binding in bindings {
            match ResourcePattern::new(&binding.resource_id) {
                Ok(pattern) if pattern.matches(resource_id) => {
                    candidates.insert(binding.acl_id);
                }
                Ok(_) => {}
                Err(e) => warn!(pattern = %binding.resource_id, error = %e, "Skipping bad pattern"),
            }
        }

        for acl_id in candidates {
            if self.check_membership(&acl_id, user_id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// ACL definition and direct edges, visible to members and updaters or
    /// to anyone if the ACL is open
    #[instrument(skip(self))]
    pub async fn acl_details(&self, actor: &str, acl_id: &str) -> Result<AclDetails, AclError> {
        let acl = self.require_acl(acl_id).await?;
        self.authorize_view(actor, &acl).await?;

        let members = self.store.direct_members(acl_id).await?;
        Ok(AclDetails { acl, members })
    }

    /// Membership of `user_id` in `acl_id`, asked by `actor`
    ///
    /// Users may always ask about themselves. Asking about anyone else
    /// needs the same visibility as [`acl_details`](Self::acl_details).
    #[instrument(skip(self))]
    pub async fn check_membership_as(
        &self,
        actor: &str,
        acl_id: &str,
        user_id: &str,
    ) -> Result<bool, AclError> {
        let acl = self.require_acl(acl_id).await?;
        if actor != user_id {
            self.authorize_view(actor, &acl).await?;
        }
        self.check_membership(acl_id, user_id).await
    }

    // ---- Authorization of mutations ----

    /// Actor must be a member of the ACL's updater ACL
    pub async fn authorize_acl_update(&self, actor: &str, acl_id: &str) -> Result<(), AclError> {
        let acl = self.require_acl(acl_id).await?;
        if self.check_membership(&acl.updater_acl_id, actor).await? {
            Ok(())
        } else {
            Err(AclError::Denied(format!(
                "{} is not in updater ACL {} of {}",
                actor, acl.updater_acl_id, acl_id
            )))
        }
    }

    /// Updaters may change any edge. Anyone may join an open ACL themselves
    /// and anyone may leave.
    pub async fn authorize_membership_change(
        &self,
        actor: &str,
        acl_id: &str,
        member: &Member,
        adding: bool,
    ) -> Result<(), AclError> {
        let acl = self.require_acl(acl_id).await?;
        if self.check_membership(&acl.updater_acl_id, actor).await? {
            return Ok(());
        }

        let is_self = matches!(member, Member::User(user) if user == actor);
        if is_self && (!adding || acl.is_open) {
            return Ok(());
        }

        Err(AclError::Denied(format!(
            "{} may not {} {} in {}",
            actor,
            if adding { "add" } else { "remove" },
            member,
            acl_id
        )))
    }

    /// A self-governed ACL may be created by anyone; otherwise the actor
    /// must belong to the named updater ACL
    pub async fn authorize_acl_create(&self, actor: &str, acl: &NewAcl) -> Result<(), AclError> {
        if acl.updater_acl_id == acl.id {
            return Ok(());
        }
        if !self.store.acl_exists(&acl.updater_acl_id).await? {
            return Err(AclError::AclNotFound(acl.updater_acl_id.clone()));
        }
        if self.check_membership(&acl.updater_acl_id, actor).await? {
            Ok(())
        } else {
            Err(AclError::Denied(format!(
                "{} is not in updater ACL {}",
                actor, acl.updater_acl_id
            )))
        }
    }

    /// Access-control entry editors for the resource, or system admins
    pub async fn authorize_resource_action_change(
        &self,
        actor: &str,
        resource_id: &str,
    ) -> Result<(), AclError> {
        if self.can_update_access_control_entries(resource_id, actor).await?
            || self.check_membership(SYS_ADMIN_ACL, actor).await?
        {
            Ok(())
        } else {
            Err(AclError::Denied(format!(
                "{} may not edit access control of {}",
                actor, resource_id
            )))
        }
    }

    pub async fn authorize_recompute(&self, actor: &str) -> Result<(), AclError> {
        if self.check_membership(SYS_ADMIN_ACL, actor).await? {
            Ok(())
        } else {
            Err(AclError::Denied(format!("{} is not in {}", actor, SYS_ADMIN_ACL)))
        }
    }

    // ---- Mutations ----

    #[instrument(skip(self, acl), fields(acl_id = %acl.id))]
    pub async fn create_acl(&self, acl: &NewAcl) -> Result<AccessControlList, AclError> {
        self.serialized(move || async move {
            self.cache.delete(&[keys::absent(&acl.id)]).await?;

            let created = self.store.create_acl(acl).await?;
            let graph = self.store.load_graph().await?;
            self.recompute_affected(&graph, graph.ancestors(&acl.id)).await?;

            info!("Created ACL");
            Ok(created)
        })
        .await
    }

    #[instrument(skip(self, update))]
    pub async fn update_acl(
        &self,
        acl_id: &str,
        update: &AclUpdate,
    ) -> Result<AccessControlList, AclError> {
        self.serialized(move || async move {
            let updated = self.store.update_acl(acl_id, update).await?;
            let graph = self.store.load_graph().await?;
            self.recompute_affected(&graph, HashSet::from([acl_id.to_string()]))
                .await?;

            info!("Updated ACL");
            Ok(updated)
        })
        .await
    }

    /// Delete an ACL, its edges and its cache entries
    #[instrument(skip(self))]
    pub async fn delete_acl(&self, acl_id: &str) -> Result<(), AclError> {
        self.serialized(move || async move {
            let affected = self.store.load_graph().await?.ancestors(acl_id);
            self.invalidate(&affected).await?;
            self.store.delete_acl(acl_id).await?;

            let graph = self.store.load_graph().await?;
            self.recompute_affected(&graph, affected).await?;
            self.drop_cached_acls(&[acl_id.to_string()]).await?;

            info!("Deleted ACL");
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(member = %member))]
    pub async fn add_member(
        &self,
        acl_id: &str,
        member: &Member,
    ) -> Result<AclMembership, AclError> {
        self.serialized(move || async move {
            let edge = self.store.add_membership(acl_id, member).await?;
            let graph = self.store.load_graph().await?;
            self.recompute_affected(&graph, graph.ancestors(acl_id)).await?;

            info!("Added member");
            Ok(edge)
        })
        .await
    }

    #[instrument(skip(self), fields(member = %member))]
    pub async fn remove_member(&self, acl_id: &str, member: &Member) -> Result<(), AclError> {
        self.serialized(move || async move {
            let mut affected = self.store.load_graph().await?.ancestors(acl_id);
            self.invalidate(&affected).await?;
            self.store.remove_membership(acl_id, member).await?;

            let graph = self.store.load_graph().await?;
            affected.extend(graph.ancestors(acl_id));
            self.recompute_affected(&graph, affected).await?;

            info!("Removed member");
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(binding = %binding))]
    pub async fn upsert_resource_action(&self, binding: &ResourceAction) -> Result<(), AclError> {
        self.serialized(move || async move {
            self.invalidate_assignment(&binding.resource_id, &binding.action_id)
                .await?;
            self.store.upsert_resource_action(binding).await?;
            self.rebuild_assignments().await?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete_resource_action(
        &self,
        resource_id: &str,
        action_id: &str,
    ) -> Result<(), AclError> {
        self.serialized(move || async move {
            self.invalidate_assignment(resource_id, action_id).await?;
            self.store
                .delete_resource_action(resource_id, action_id)
                .await?;
            self.rebuild_assignments().await?;
            Ok(())
        })
        .await
    }

    /// Rebuild every cache entry from the store
    ///
    /// Safe to run at any time; running it twice leaves the cache unchanged.
    #[instrument(skip(self))]
    pub async fn recompute_all(&self) -> Result<RecomputeReport, AclError> {
        self.serialized(move || async move {
            let graph = self.store.load_graph().await?;
            let mut ids: Vec<String> = graph.acl_ids().map(String::from).collect();
            ids.sort();

            for id in &ids {
                Flattener::flatten_into_cache(self.cache.as_ref(), &graph, id).await?;
            }
            let absent: Vec<String> = ids.iter().map(|id| keys::absent(id)).collect();
            self.cache.delete(&absent).await?;

            let stale: Vec<String> = self
                .cache
                .get_from_set(keys::ACL_INDEX)
                .await?
                .into_iter()
                .filter(|id| !graph.contains_acl(id))
                .collect();
            self.drop_cached_acls(&stale).await?;

            let assignments = self.rebuild_assignments().await?;

            let report = RecomputeReport {
                acls: ids.len(),
                assignments,
                dropped: stale.len(),
            };
            info!(?report, "Recomputed all ACLs");
            Ok(report)
        })
        .await
    }

    // ---- Internals ----

    async fn require_acl(&self, acl_id: &str) -> Result<AccessControlList, AclError> {
        self.store
            .get_acl(acl_id)
            .await?
            .ok_or_else(|| AclError::AclNotFound(acl_id.to_string()))
    }

    /// Open ACLs are visible to everyone, others to members and updaters
    async fn authorize_view(&self, actor: &str, acl: &AccessControlList) -> Result<(), AclError> {
        let visible = acl.is_open
            || self.check_membership(&acl.id, actor).await?
            || self.check_membership(&acl.updater_acl_id, actor).await?;
        if visible {
            Ok(())
        } else {
            Err(AclError::Denied(format!(
                "{} may not view ACL {}",
                actor, acl.id
            )))
        }
    }

    /// Run `work` holding the recompute lock of this process and of the
    /// shared cache
    async fn serialized<T, F, Fut>(&self, work: F) -> Result<T, AclError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AclError>>,
    {
        let _local = self.recompute_lock.lock().await;
        let token = Uuid::new_v4().to_string();

        let started = Instant::now();
        while !self
            .cache
            .try_lock(keys::RECOMPUTE_LOCK, &token, RECOMPUTE_LOCK_TTL)
            .await?
        {
            if started.elapsed() >= RECOMPUTE_LOCK_WAIT {
                warn!("Recompute lock still held by another instance");
                return Err(CacheError::Timeout {
                    op: "recompute_lock",
                    timeout_ms: RECOMPUTE_LOCK_WAIT.as_millis() as u64,
                }
                .into());
            }
            tokio::time::sleep(RECOMPUTE_LOCK_RETRY).await;
        }

        let result = work().await;

        if let Err(e) = self.cache.unlock(keys::RECOMPUTE_LOCK, &token).await {
            warn!(error = %e, "Failed to release recompute lock, it lapses after its ttl");
        }
        result
    }

    /// `Some(true)` if flattened, `Some(false)` if known not to exist,
    /// `None` if cold
    async fn cached_presence(&self, acl_id: &str) -> Result<Option<bool>, AclError> {
        if self.cache.get_entry(&keys::computed(acl_id)).await?.is_some() {
            return Ok(Some(true));
        }
        if self.cache.get_entry(&keys::absent(acl_id)).await?.is_some() {
            return Ok(Some(false));
        }
        Ok(None)
    }

    /// Make sure `acl_id` has flattened entries; false if it does not exist
    async fn ensure_flattened(&self, acl_id: &str) -> Result<bool, AclError> {
        if let Some(present) = self.cached_presence(acl_id).await? {
            return Ok(present);
        }

        self.serialized(move || async move {
            if let Some(present) = self.cached_presence(acl_id).await? {
                return Ok(present);
            }

            if !self.store.acl_exists(acl_id).await? {
                debug!(acl_id, "Unknown ACL");
                self.cache
                    .set_entry(&keys::absent(acl_id), &Utc::now().to_rfc3339())
                    .await?;
                return Ok(false);
            }

            debug!(acl_id, "Cold cache, flattening");
            let graph = self.store.load_graph().await?;
            Flattener::flatten_into_cache(self.cache.as_ref(), &graph, acl_id).await?;
            Ok(true)
        })
        .await
    }

    async fn ensure_assignments_built(&self) -> Result<(), AclError> {
        if self.assignments.is_built().await? {
            return Ok(());
        }

        self.serialized(move || async move {
            if !self.assignments.is_built().await? {
                debug!("Cold assignment cache, rebuilding");
                self.rebuild_assignments().await?;
            }
            Ok(())
        })
        .await
    }

    /// Caller must hold the recompute lock
    async fn rebuild_assignments(&self) -> Result<usize, AclError> {
        let bindings = self.store.list_resource_actions().await?;
        Ok(self.assignments.rebuild(&bindings).await?)
    }

    /// Mark `acl_ids` cold ahead of a store write that may shrink them
    ///
    /// Caller must hold the recompute lock. A recompute that fails after the
    /// write then leaves these ACLs to be refilled from the store.
    async fn invalidate(&self, acl_ids: &HashSet<String>) -> Result<(), AclError> {
        let markers: Vec<String> = acl_ids.iter().map(|id| keys::computed(id)).collect();
        self.cache.delete(&markers).await?;
        debug!(count = markers.len(), "Invalidated ACLs");
        Ok(())
    }

    /// Drop one binding entry and the built marker ahead of a store write
    ///
    /// Caller must hold the recompute lock.
    async fn invalidate_assignment(&self, resource_id: &str, action_id: &str) -> Result<(), AclError> {
        self.cache
            .delete(&[
                keys::ASSIGNMENT_BUILT.to_string(),
                keys::assignment(resource_id, action_id),
            ])
            .await?;
        Ok(())
    }

    /// Caller must hold the recompute lock
    async fn recompute_affected(
        &self,
        graph: &MembershipGraph,
        affected: HashSet<String>,
    ) -> Result<usize, AclError> {
        let mut ids: Vec<String> = affected
            .into_iter()
            .filter(|id| graph.contains_acl(id))
            .collect();
        ids.sort();

        for id in &ids {
            Flattener::flatten_into_cache(self.cache.as_ref(), graph, id).await?;
        }
        debug!(count = ids.len(), "Recomputed affected ACLs");
        Ok(ids.len())
    }

    /// Caller must hold the recompute lock
    async fn drop_cached_acls(&self, acl_ids: &[String]) -> Result<(), AclError> {
        if acl_ids.is_empty() {
            return Ok(());
        }

        let doomed: Vec<String> = acl_ids.iter().flat_map(|id| keys::all_for_acl(id)).collect();
        self.cache.delete(&doomed).await?;

        let remaining: Vec<String> = self
            .cache
            .get_from_set(keys::ACL_INDEX)
            .await?
            .into_iter()
            .filter(|id| !acl_ids.contains(id))
            .collect();
        self.cache.replace_set(keys::ACL_INDEX, &remaining).await?;

        debug!(count = acl_ids.len(), "Dropped cached ACLs");
        Ok(())
    }
}
