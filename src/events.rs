//! Integration events shared between producing and consuming services

use crate::types::IntegrationEvent;
use serde::{Deserialize, Serialize};

/// A user account was created by the identity service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreatedIntegrationEvent {
    pub user_id: String,
    pub first_name: String,
    pub last_name: String,
}

impl UserCreatedIntegrationEvent {
    pub fn new(
        user_id: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }
}

impl IntegrationEvent for UserCreatedIntegrationEvent {
    const EVENT_TYPE: &'static str = "UserCreatedIntegrationEvent";
}

/// An item was created (and analyzed) by the items service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemCreatedIntegrationEvent {
    pub item_id: String,
    pub name: String,
    pub is_deleted: bool,
}

impl ItemCreatedIntegrationEvent {
    pub fn new(item_id: impl Into<String>, name: impl Into<String>, is_deleted: bool) -> Self {
        Self {
            item_id: item_id.into(),
            name: name.into(),
            is_deleted,
        }
    }
}

impl IntegrationEvent for ItemCreatedIntegrationEvent {
    const EVENT_TYPE: &'static str = "ItemCreatedIntegrationEvent";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Envelope;

    #[test]
    fn test_user_created_payload_fields() {
        let env = Envelope::new(UserCreatedIntegrationEvent::new("u1", "A", "B"));
        let json = serde_json::to_value(&env).unwrap();

        assert_eq!(env.routing_key(), "UserCreatedIntegrationEvent");
        assert_eq!(json["payload"]["userId"], "u1");
        assert_eq!(json["payload"]["firstName"], "A");
        assert_eq!(json["payload"]["lastName"], "B");
    }

    #[test]
    fn test_item_created_payload_fields() {
        let env = Envelope::new(ItemCreatedIntegrationEvent::new("i1", "Drill", false));
        let json = serde_json::to_value(&env).unwrap();

        assert_eq!(env.routing_key(), "ItemCreatedIntegrationEvent");
        assert_eq!(json["payload"]["itemId"], "i1");
        assert_eq!(json["payload"]["isDeleted"], false);
    }

    #[test]
    fn test_user_payload_does_not_decode_as_item() {
        let env = Envelope::new(UserCreatedIntegrationEvent::new("u1", "A", "B"));
        let bytes = serde_json::to_vec(&env).unwrap();

        assert!(serde_json::from_slice::<Envelope<ItemCreatedIntegrationEvent>>(&bytes).is_err());
    }
}
