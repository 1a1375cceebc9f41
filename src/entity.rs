use serde::{Deserialize, Serialize};

use crate::{
    properties::{merge, Properties},
    PropertyValue,
};

/// Kind of entity tracked by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// A user of the application.
    User,
    /// The device the application runs on.
    Device,
}

/// Describes the active user or the device, used during [`init`](crate::SessionController::init)
/// and [`register_user`](crate::SessionController::register_user).
///
/// Use the factory functions to create an instance.
///
/// ```
/// # use splyt::EntityInfo;
/// let user = EntityInfo::user_with("user-1", |info| {
///     info.set_property("plan", "premium");
/// });
/// let device = EntityInfo::device().override_id("device-from-app");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EntityInfo {
    pub(crate) entity_type: EntityType,
    pub(crate) id: Option<String>,
    pub(crate) is_new: Option<bool>,
    pub(crate) properties: Properties,
}

impl EntityInfo {
    fn new(entity_type: EntityType, id: Option<String>) -> EntityInfo {
        EntityInfo {
            entity_type,
            id,
            is_new: None,
            properties: Properties::new(),
        }
    }

    /// Describe a user with the given id.
    pub fn user(user_id: impl Into<String>) -> EntityInfo {
        EntityInfo::new(EntityType::User, Some(user_id.into()))
    }

    /// Describe a user, letting `init` set initial properties.
    pub fn user_with(user_id: impl Into<String>, init: impl FnOnce(&mut EntityInfo)) -> EntityInfo {
        let mut info = EntityInfo::user(user_id);
        init(&mut info);
        info
    }

    /// Describe the device. The id is generated and persisted by the SDK unless overridden.
    pub fn device() -> EntityInfo {
        EntityInfo::new(EntityType::Device, None)
    }

    /// Describe the device, letting `init` set initial properties.
    pub fn device_with(init: impl FnOnce(&mut EntityInfo)) -> EntityInfo {
        let mut info = EntityInfo::device();
        init(&mut info);
        info
    }

    /// Override the entity id. Normally only used for devices, whose ids are auto-generated.
    pub fn override_id(mut self, entity_id: impl Into<String>) -> EntityInfo {
        self.id = Some(entity_id.into());
        self
    }

    /// Explicitly control whether the entity counts as new, instead of auto-detecting it from
    /// locally persisted history.
    pub fn set_is_new(&mut self, is_new: bool) -> &mut Self {
        self.is_new = Some(is_new);
        self
    }

    /// Set a single property.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> &mut Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set multiple properties.
    pub fn set_properties(&mut self, properties: Properties) -> &mut Self {
        merge(&mut self.properties, properties);
        self
    }

    /// Entity type.
    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// Entity id, if known. Empty ids are treated as missing.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }

    /// Properties describing the entity.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }
}

/// Entity as sent to the collector after its id and new-ness were resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResolvedEntity {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub id: String,
    pub is_new: bool,
    pub properties: Properties,
}

impl ResolvedEntity {
    pub(crate) fn resolve(info: &EntityInfo, id: String, seen_before: bool) -> ResolvedEntity {
        ResolvedEntity {
            entity_type: info.entity_type,
            id,
            is_new: info.is_new.unwrap_or(!seen_before),
            properties: info.properties.clone(),
        }
    }
}
