//! Cached reads racing membership changes

use aaa_authz::inheritance::MembershipOrganizationProvider;
use aaa_authz::invalidation::{effective_roles_key, principal_organizations_key};
use aaa_authz::store::{GroupMembershipRepository, StoreResult};
use aaa_authz::types::{Group, GroupMembership, GroupRole, Organization, Role};
use aaa_authz::{
    CacheService, GroupService, InMemoryCache, MemoryStore, OrganizationalContextProvider,
    RequestContext, RoleInheritanceEngine,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Membership reads return the rows they saw, but only after a pause
struct DelayedMemberships {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

#[async_trait]
impl GroupMembershipRepository for DelayedMemberships {
    async fn get_by_principal_id(&self, principal_id: &str) -> StoreResult<Vec<GroupMembership>> {
        let rows = GroupMembershipRepository::get_by_principal_id(&*self.inner, principal_id).await?;
        sleep(self.delay).await;
        Ok(rows)
    }

    async fn get_membership(
        &self,
        group_id: &str,
        principal_id: &str,
    ) -> StoreResult<Option<GroupMembership>> {
        GroupMembershipRepository::get_membership(&*self.inner, group_id, principal_id).await
    }

    async fn create(&self, membership: GroupMembership) -> StoreResult<()> {
        GroupMembershipRepository::create(&*self.inner, membership).await
    }

    async fn update(&self, membership: GroupMembership) -> StoreResult<()> {
        GroupMembershipRepository::update(&*self.inner, membership).await
    }
}

struct World {
    store: Arc<MemoryStore>,
    cache: Arc<InMemoryCache>,
    memberships: Arc<DelayedMemberships>,
    groups: Arc<GroupService>,
}

async fn world() -> World {
    let store = Arc::new(MemoryStore::new());
    store.put_organization(Organization::new("acme", "Acme")).await;
    store.put_role(Role::new("developer", "Developer")).await;
    store.put_group(Group::new("eng", "Engineering", "acme")).await;
    store.put_group_role(GroupRole::new("eng", "developer", "acme")).await;
    store.put_membership(GroupMembership::new("eng", "alice")).await;

    let cache = Arc::new(InMemoryCache::default());
    let memberships = Arc::new(DelayedMemberships {
        inner: store.clone(),
        delay: Duration::from_millis(100),
    });
    let groups = Arc::new(GroupService::new(
        store.clone(),
        memberships.clone(),
        store.clone(),
        store.clone(),
        cache.clone(),
    ));

    World {
        store,
        cache,
        memberships,
        groups,
    }
}

#[tokio::test]
async fn test_removal_during_resolution_is_not_cached() {
    let w = world().await;
    let inheritance = Arc::new(RoleInheritanceEngine::new(
        w.store.clone(),
        w.store.clone(),
        w.store.clone(),
        w.store.clone(),
        w.groups.clone(),
        w.cache.clone(),
        300,
    ));

    let reader = {
        let inheritance = inheritance.clone();
        tokio::spawn(async move {
            inheritance
                .calculate_effective_roles(&RequestContext::background(), "acme", "alice")
                .await
        })
    };

    sleep(Duration::from_millis(20)).await;
    w.groups
        .remove_member(&RequestContext::background(), "eng", "alice")
        .await
        .unwrap();

    // the in-flight read may answer from the rows it saw
    reader.await.unwrap().unwrap();
    assert!(w
        .cache
        .get(&effective_roles_key("acme", "alice"))
        .await
        .unwrap()
        .is_none());

    let after = inheritance
        .calculate_effective_roles(&RequestContext::background(), "acme", "alice")
        .await
        .unwrap();
    assert!(after.iter().all(|r| r.role_id != "developer"), "{:?}", after);
}

#[tokio::test]
async fn test_unraced_resolution_is_cached() {
    let w = world().await;
    let inheritance = RoleInheritanceEngine::new(
        w.store.clone(),
        w.store.clone(),
        w.store.clone(),
        w.store.clone(),
        w.groups.clone(),
        w.cache.clone(),
        300,
    );

    let roles = inheritance
        .calculate_effective_roles(&RequestContext::background(), "acme", "alice")
        .await
        .unwrap();

    assert_eq!(roles.len(), 1);
    assert!(w
        .cache
        .get(&effective_roles_key("acme", "alice"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_removal_during_organization_lookup_is_not_cached() {
    let w = world().await;
    let provider = Arc::new(MembershipOrganizationProvider::new(
        w.memberships.clone(),
        w.store.clone(),
        w.store.clone(),
        w.store.clone(),
        w.cache.clone(),
        300,
    ));

    let reader = {
        let provider = provider.clone();
        tokio::spawn(async move {
            provider
                .organizations_for(&RequestContext::background(), "alice")
                .await
        })
    };

    sleep(Duration::from_millis(20)).await;
    w.groups
        .remove_member(&RequestContext::background(), "eng", "alice")
        .await
        .unwrap();

    reader.await.unwrap().unwrap();
    assert!(w
        .cache
        .get(&principal_organizations_key("alice"))
        .await
        .unwrap()
        .is_none());

    let after = provider
        .organizations_for(&RequestContext::background(), "alice")
        .await
        .unwrap();
    assert!(after.is_empty(), "{:?}", after);
}
