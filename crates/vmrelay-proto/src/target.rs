//! Target identifiers for relayed endpoints

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies the remote VM/service a tunnel reaches.
///
/// Two targets are equal iff all four fields match; the broker uses
/// `Target` as its registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Cloud project the instance lives in
    pub project: String,

    /// Zone or region of the instance
    pub zone: String,

    /// Instance (resource) name
    pub instance: String,

    /// Destination port on the instance (e.g., 3389 for RDP, 22 for SSH)
    pub port: u16,
}

impl Target {
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        instance: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            instance: instance.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.project, self.zone, self.instance, self.port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_target_equality() {
        let a = Target::new("proj", "us-central1-a", "vm-1", 3389);
        let b = Target::new("proj", "us-central1-a", "vm-1", 3389);
        let c = Target::new("proj", "us-central1-a", "vm-1", 22);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_target_as_map_key() {
        let mut map = HashMap::new();
        map.insert(Target::new("p", "z", "vm", 22), "tunnel");

        assert!(map.contains_key(&Target::new("p", "z", "vm", 22)));
        assert!(!map.contains_key(&Target::new("p", "z", "vm", 23)));
    }

    #[test]
    fn test_target_display() {
        let target = Target::new("proj", "europe-west1-b", "db-0", 5432);
        assert_eq!(target.to_string(), "proj/europe-west1-b/db-0:5432");
    }
}
