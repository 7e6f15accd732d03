//! Listening addresses published after startup.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;

/// Value reported for a property that was not configured.
pub const PROPERTY_UNDEFINED: &str = "UNDEFINED";

/// Published property keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyId {
    UnixSocket,
    TcpPort,
    TcpBindAddress,
    SecondaryPort,
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnixSocket => write!(f, "unix_socket"),
            Self::TcpPort => write!(f, "tcp_port"),
            Self::TcpBindAddress => write!(f, "tcp_bind_address"),
            Self::SecondaryPort => write!(f, "secondary_port"),
        }
    }
}

/// Property map filled once the listeners are bound.
#[derive(Debug, Default)]
pub struct ServerProperties {
    values: RwLock<HashMap<PropertyId, String>>,
}

impl ServerProperties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: PropertyId, value: impl Into<String>) {
        self.values.write().insert(id, value.into());
    }

    /// Record every property at once; missing ones become [`PROPERTY_UNDEFINED`].
    pub fn publish(&self, entries: impl IntoIterator<Item = (PropertyId, Option<String>)>) {
        let mut values = self.values.write();
        for (id, value) in entries {
            values.insert(id, value.unwrap_or_else(|| PROPERTY_UNDEFINED.to_string()));
        }
    }

    /// Empty until anything is published, then the value or [`PROPERTY_UNDEFINED`].
    #[must_use]
    pub fn get(&self, id: PropertyId) -> String {
        let values = self.values.read();
        if values.is_empty() {
            return String::new();
        }
        values.get(&id).cloned().unwrap_or_else(|| PROPERTY_UNDEFINED.to_string())
    }

    pub fn clear(&self) {
        self.values.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_map_reports_empty_string() {
        let properties = ServerProperties::new();
        assert_eq!(properties.get(PropertyId::TcpPort), "");
    }

    #[test]
    fn test_absent_key_is_undefined() {
        let properties = ServerProperties::new();
        properties.set(PropertyId::TcpPort, "33060");
        assert_eq!(properties.get(PropertyId::TcpPort), "33060");
        assert_eq!(properties.get(PropertyId::UnixSocket), PROPERTY_UNDEFINED);
    }

    #[test]
    fn test_publish_marks_unset_values() {
        let properties = ServerProperties::new();
        properties.publish([
            (PropertyId::TcpPort, Some("1".to_string())),
            (PropertyId::SecondaryPort, None),
        ]);
        assert_eq!(properties.get(PropertyId::SecondaryPort), PROPERTY_UNDEFINED);

        properties.clear();
        assert_eq!(properties.get(PropertyId::TcpPort), "");
    }
}
