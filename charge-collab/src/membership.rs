//! World membership registry.
//!
//! Each world has exactly one owner: the first user ever to access it.
//! Users may be promoted to player; everyone else is an implicit spectator
//! with no record. Lookups and first-owner assignment go through one async
//! mutex, so concurrent first accesses still produce a single owner.

use std::collections::HashMap;
use std::sync::Arc;

use charge_core::membership::{Membership, Role};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::storage::{RoomStore, StoreError};

#[derive(Error, Debug, Clone)]
pub enum MembershipError {
    #[error("user id must not be empty")]
    EmptyUserId,
    #[error("the owner of world {world_id} cannot be removed")]
    OwnerRemoval { world_id: Uuid },
    #[error("membership storage failed: {0}")]
    Store(#[from] StoreError),
}

type Members = HashMap<String, Role>;

pub struct MembershipRegistry {
    worlds: Mutex<HashMap<Uuid, Members>>,
    store: Option<Arc<RoomStore>>,
}

impl MembershipRegistry {
    /// In-memory registry.
    pub fn new() -> Self {
        Self {
            worlds: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// Registry backed by the room store. Worlds are loaded on first access.
    pub fn with_store(store: Arc<RoomStore>) -> Self {
        Self {
            worlds: Mutex::new(HashMap::new()),
            store: Some(store),
        }
    }

    fn members_of<'a>(
        &self,
        worlds: &'a mut HashMap<Uuid, Members>,
        world_id: Uuid,
    ) -> Result<&'a mut Members, MembershipError> {
        if !worlds.contains_key(&world_id) {
            let loaded = match &self.store {
                Some(store) => store.load_memberships(world_id)?.into_iter().collect(),
                None => Members::new(),
            };
            worlds.insert(world_id, loaded);
        }
        Ok(worlds.entry(world_id).or_default())
    }

    fn persist(&self, world_id: Uuid, user_id: &str, role: Role) -> Result<(), MembershipError> {
        if let Some(store) = &self.store {
            store.put_membership(world_id, user_id, role)?;
        }
        Ok(())
    }

    /// Role of `user_id`, making them owner if the world has none yet.
    pub async fn ensure_membership(&self, world_id: Uuid, user_id: &str) -> Result<Role, MembershipError> {
        if user_id.is_empty() {
            return Err(MembershipError::EmptyUserId);
        }
        let mut worlds = self.worlds.lock().await;
        let members = self.members_of(&mut worlds, world_id)?;
        if let Some(role) = members.get(user_id) {
            return Ok(*role);
        }
        if members.values().any(|role| role.is_owner()) {
            return Ok(Role::Spectator);
        }
        self.persist(world_id, user_id, Role::Owner)?;
        members.insert(user_id.to_string(), Role::Owner);
        log::info!("User {user_id} became owner of world {world_id}");
        Ok(Role::Owner)
    }

    /// Grant `user_id` the player role. The owner keeps ownership.
    pub async fn add_player(&self, world_id: Uuid, user_id: &str) -> Result<Role, MembershipError> {
        if user_id.is_empty() {
            return Err(MembershipError::EmptyUserId);
        }
        let mut worlds = self.worlds.lock().await;
        let members = self.members_of(&mut worlds, world_id)?;
        match members.get(user_id) {
            Some(role @ (Role::Owner | Role::Player)) => Ok(*role),
            _ => {
                self.persist(world_id, user_id, Role::Player)?;
                members.insert(user_id.to_string(), Role::Player);
                log::info!("User {user_id} joined world {world_id} as player");
                Ok(Role::Player)
            }
        }
    }

    /// Drop a player back to spectator. Returns whether a record existed.
    pub async fn remove_member(&self, world_id: Uuid, user_id: &str) -> Result<bool, MembershipError> {
        let mut worlds = self.worlds.lock().await;
        let members = self.members_of(&mut worlds, world_id)?;
        match members.get(user_id) {
            None => Ok(false),
            Some(Role::Owner) => Err(MembershipError::OwnerRemoval { world_id }),
            Some(_) => {
                if let Some(store) = &self.store {
                    store.delete_membership(world_id, user_id)?;
                }
                members.remove(user_id);
                Ok(true)
            }
        }
    }

    pub async fn role_of(&self, world_id: Uuid, user_id: &str) -> Result<Role, MembershipError> {
        let mut worlds = self.worlds.lock().await;
        let members = self.members_of(&mut worlds, world_id)?;
        Ok(members.get(user_id).copied().unwrap_or(Role::Spectator))
    }

    /// Membership records of a world, ordered by user id.
    pub async fn members(&self, world_id: Uuid) -> Result<Vec<Membership>, MembershipError> {
        let mut worlds = self.worlds.lock().await;
        let members = self.members_of(&mut worlds, world_id)?;
        let mut list: Vec<Membership> = members
            .iter()
            .map(|(user_id, role)| Membership {
                world_id,
                user_id: user_id.clone(),
                role: *role,
            })
            .collect();
        list.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(list)
    }
}

impl Default for MembershipRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;

    #[tokio::test]
    async fn test_first_user_becomes_owner() {
        let registry = MembershipRegistry::new();
        let world = Uuid::new_v4();
        assert_eq!(registry.ensure_membership(world, "alice").await.unwrap(), Role::Owner);
        assert_eq!(registry.ensure_membership(world, "bob").await.unwrap(), Role::Spectator);
        assert_eq!(registry.ensure_membership(world, "alice").await.unwrap(), Role::Owner);
        assert_eq!(registry.members(world).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_access_single_owner() {
        let registry = Arc::new(MembershipRegistry::new());
        let world = Uuid::new_v4();
        let handles: Vec<_> = (0..16)
            .map(|n| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .ensure_membership(world, &format!("user-{n}"))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut owners = 0;
        for handle in handles {
            if handle.await.unwrap() == Role::Owner {
                owners += 1;
            }
        }
        assert_eq!(owners, 1);
    }

    #[tokio::test]
    async fn test_players_and_removal() {
        let registry = MembershipRegistry::new();
        let world = Uuid::new_v4();
        registry.ensure_membership(world, "alice").await.unwrap();

        assert_eq!(registry.add_player(world, "bob").await.unwrap(), Role::Player);
        assert_eq!(registry.add_player(world, "alice").await.unwrap(), Role::Owner);
        assert_eq!(registry.role_of(world, "bob").await.unwrap(), Role::Player);

        assert!(registry.remove_member(world, "bob").await.unwrap());
        assert!(!registry.remove_member(world, "bob").await.unwrap());
        assert_eq!(registry.role_of(world, "bob").await.unwrap(), Role::Spectator);
        assert!(matches!(
            registry.remove_member(world, "alice").await,
            Err(MembershipError::OwnerRemoval { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_user_rejected() {
        let registry = MembershipRegistry::new();
        assert!(matches!(
            registry.ensure_membership(Uuid::new_v4(), "").await,
            Err(MembershipError::EmptyUserId)
        ));
    }

    #[tokio::test]
    async fn test_persisted_roles_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let world = Uuid::new_v4();
        let path = dir.path().join("db");
        {
            let store = Arc::new(RoomStore::open(StoreConfig::for_testing(&path)).unwrap());
            let registry = MembershipRegistry::with_store(store);
            registry.ensure_membership(world, "alice").await.unwrap();
            registry.add_player(world, "bob").await.unwrap();
        }
        let store = Arc::new(RoomStore::open(StoreConfig::for_testing(&path)).unwrap());
        let registry = MembershipRegistry::with_store(store);
        assert_eq!(registry.ensure_membership(world, "carol").await.unwrap(), Role::Spectator);
        assert_eq!(registry.role_of(world, "alice").await.unwrap(), Role::Owner);
        assert_eq!(registry.role_of(world, "bob").await.unwrap(), Role::Player);
    }
}
