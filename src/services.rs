//! Consuming-side collaborators and their event handlers
//!
//! The requests service keeps local copies of users and items created
//! elsewhere. Both handlers are idempotent: a redelivered event whose
//! record already exists is acknowledged without touching the store.

use crate::events::{ItemCreatedIntegrationEvent, UserCreatedIntegrationEvent};
use crate::handler::{HandlerContext, IntegrationEventHandler};
use crate::types::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub name: String,
    pub is_deleted: bool,
}

/// User records owned by the consuming service
#[async_trait]
pub trait UserService: Send + Sync {
    async fn get_user_by_id(&self, id: &str) -> anyhow::Result<Option<User>>;

    /// Fails if a user with the same id exists
    async fn create_user(&self, id: &str, first_name: &str, last_name: &str) -> anyhow::Result<()>;
}

/// Item records owned by the consuming service
#[async_trait]
pub trait ItemService: Send + Sync {
    /// Deleted items are returned too
    async fn get_item_by_id(&self, id: &str) -> anyhow::Result<Option<Item>>;

    /// Fails if an item with the same id exists
    async fn create_item(&self, id: &str, name: &str, is_deleted: bool) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryUserService {
    users: RwLock<HashMap<String, User>>,
}

impl MemoryUserService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.users.read().await.len()
    }
}

#[async_trait]
impl UserService for MemoryUserService {
    async fn get_user_by_id(&self, id: &str) -> anyhow::Result<Option<User>> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn create_user(&self, id: &str, first_name: &str, last_name: &str) -> anyhow::Result<()> {
        let mut users = self.users.write().await;
        if users.contains_key(id) {
            anyhow::bail!("user {} already exists", id);
        }
        users.insert(
            id.to_string(),
            User {
                id: id.to_string(),
                first_name: first_name.to_string(),
                last_name: last_name.to_string(),
            },
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryItemService {
    items: RwLock<HashMap<String, Item>>,
}

impl MemoryItemService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.items.read().await.len()
    }
}

#[async_trait]
impl ItemService for MemoryItemService {
    async fn get_item_by_id(&self, id: &str) -> anyhow::Result<Option<Item>> {
        Ok(self.items.read().await.get(id).cloned())
    }

    async fn create_item(&self, id: &str, name: &str, is_deleted: bool) -> anyhow::Result<()> {
        let mut items = self.items.write().await;
        if items.contains_key(id) {
            anyhow::bail!("item {} already exists", id);
        }
        items.insert(
            id.to_string(),
            Item {
                id: id.to_string(),
                name: name.to_string(),
                is_deleted,
            },
        );
        Ok(())
    }
}

/// Creates the local user record for `UserCreatedIntegrationEvent`
pub struct UserCreatedHandler {
    users: Arc<dyn UserService>,
}

impl UserCreatedHandler {
    pub fn new(users: Arc<dyn UserService>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl IntegrationEventHandler<UserCreatedIntegrationEvent> for UserCreatedHandler {
    async fn handle(
        &self,
        event: &Envelope<UserCreatedIntegrationEvent>,
        _ctx: &HandlerContext,
    ) -> anyhow::Result<()> {
        let payload = event.payload();
        tracing::info!(user_id = %payload.user_id, "Handling UserCreatedIntegrationEvent");

        if self.users.get_user_by_id(&payload.user_id).await?.is_some() {
            tracing::warn!(user_id = %payload.user_id, "User already exists, skipping");
            return Ok(());
        }

        if let Err(e) = self
            .users
            .create_user(&payload.user_id, &payload.first_name, &payload.last_name)
            .await
        {
            tracing::error!(user_id = %payload.user_id, error = %e, "Failed to create user");
            return Err(e);
        }

        tracing::info!(
            user_id = %payload.user_id,
            name = %format!("{} {}", payload.first_name, payload.last_name),
            "Created user"
        );
        Ok(())
    }
}

/// Creates the local item record for `ItemCreatedIntegrationEvent`
pub struct ItemCreatedHandler {
    items: Arc<dyn ItemService>,
}

impl ItemCreatedHandler {
    pub fn new(items: Arc<dyn ItemService>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl IntegrationEventHandler<ItemCreatedIntegrationEvent> for ItemCreatedHandler {
    async fn handle(
        &self,
        event: &Envelope<ItemCreatedIntegrationEvent>,
        _ctx: &HandlerContext,
    ) -> anyhow::Result<()> {
        let payload = event.payload();
        tracing::info!(item_id = %payload.item_id, "Handling ItemCreatedIntegrationEvent");

        if self.items.get_item_by_id(&payload.item_id).await?.is_some() {
            tracing::warn!(item_id = %payload.item_id, "Item already exists, skipping");
            return Ok(());
        }

        if let Err(e) = self
            .items
            .create_item(&payload.item_id, &payload.name, payload.is_deleted)
            .await
        {
            tracing::error!(item_id = %payload.item_id, error = %e, "Failed to create item");
            return Err(e);
        }

        tracing::info!(
            item_id = %payload.item_id,
            name = %payload.name,
            is_deleted = payload.is_deleted,
            "Created item"
        );
        Ok(())
    }
}
