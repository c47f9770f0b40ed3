use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Verified identity attached to a connection by the upstream auth layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.display_name = (!name.trim().is_empty()).then_some(name);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_display_name_is_dropped() {
        let id = Identity::new(UserId::from_raw("u1")).with_display_name("  ");
        assert!(id.display_name.is_none());
    }

    #[test]
    fn display_name_is_kept() {
        let id = Identity::new(UserId::from_raw("u1")).with_display_name("Alice");
        assert_eq!(id.display_name.as_deref(), Some("Alice"));
    }
}
