//! Entity ID type representing a `domain.object_id` pair

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for invalid entity IDs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityIdError {
    #[error("invalid entity id '{0}': expected exactly one '.' separator")]
    InvalidFormat(String),

    #[error("invalid entity id '{0}': domain must be lowercase alphanumeric with underscores")]
    InvalidDomain(String),

    #[error("invalid entity id '{0}': object_id must be lowercase alphanumeric with underscores")]
    InvalidObjectId(String),
}

/// An entity ID such as `pyscript.var1` or `sensor.temperature`
///
/// Trigger expressions refer to entities by this dotted form, so anything
/// that can appear as the first two segments of a dotted name in an
/// expression must round-trip through this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    domain: String,
    object_id: String,
}

impl EntityId {
    /// Create an entity id from its two parts
    pub fn new(
        domain: impl Into<String>,
        object_id: impl Into<String>,
    ) -> Result<Self, EntityIdError> {
        let domain = domain.into();
        let object_id = object_id.into();
        let full = format!("{}.{}", domain, object_id);

        if !valid_part(&domain) || domain.contains("__") {
            return Err(EntityIdError::InvalidDomain(full));
        }
        if !valid_part(&object_id) {
            return Err(EntityIdError::InvalidObjectId(full));
        }
        Ok(Self { domain, object_id })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }
}

/// Lowercase alphanumeric plus underscore, not starting or ending with `_`
fn valid_part(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('_')
        && !s.ends_with('_')
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((domain, object_id)) if !object_id.contains('.') => Self::new(domain, object_id),
            _ => Err(EntityIdError::InvalidFormat(s.to_string())),
        }
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> String {
        id.to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.object_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entity_id() {
        let id: EntityId = "pyscript.var_done".parse().unwrap();
        assert_eq!(id.domain(), "pyscript");
        assert_eq!(id.object_id(), "var_done");
        assert_eq!(id.to_string(), "pyscript.var_done");
    }

    #[test]
    fn test_invalid_format() {
        assert!(matches!(
            "no_separator".parse::<EntityId>(),
            Err(EntityIdError::InvalidFormat(_))
        ));
        assert!(matches!(
            "pyscript.var1.old".parse::<EntityId>(),
            Err(EntityIdError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_invalid_parts() {
        assert!(matches!(
            "Sensor.temp".parse::<EntityId>(),
            Err(EntityIdError::InvalidDomain(_))
        ));
        assert!(matches!(
            "my__domain.temp".parse::<EntityId>(),
            Err(EntityIdError::InvalidDomain(_))
        ));
        assert!(matches!(
            "sensor._temp".parse::<EntityId>(),
            Err(EntityIdError::InvalidObjectId(_))
        ));
        assert!("sensor.my__temp".parse::<EntityId>().is_ok());
    }

    #[test]
    fn test_serde_as_string() {
        let id = EntityId::new("pyscript", "var1").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"pyscript.var1\"");
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
