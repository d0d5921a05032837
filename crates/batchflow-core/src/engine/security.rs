//! Tag-based authorization for operator calls.

use std::collections::HashSet;

use batchflow_types::config::SecurityConfig;

/// Decides which job instances the caller may see and operate on.
pub trait SecurityService: Send + Sync {
    /// Tag stamped on instances the caller creates.
    fn current_tag(&self) -> String;

    fn is_admin(&self) -> bool;

    fn is_authorized(&self, instance_tag: &str) -> bool {
        self.is_admin() || self.current_tag() == instance_tag
    }

    /// Tag filter for listing queries; `None` sees every tag.
    fn visible_tag(&self) -> Option<String> {
        if self.is_admin() {
            None
        } else {
            Some(self.current_tag())
        }
    }
}

/// Fixed caller identity taken from configuration.
#[derive(Debug, Clone)]
pub struct ConfiguredSecurity {
    current_tag: String,
    admin_tags: HashSet<String>,
}

impl ConfiguredSecurity {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            current_tag: config.current_tag.clone(),
            admin_tags: config.admin_tags.iter().cloned().collect(),
        }
    }
}

impl SecurityService for ConfiguredSecurity {
    fn current_tag(&self) -> String {
        self.current_tag.clone()
    }

    fn is_admin(&self) -> bool {
        self.admin_tags.contains(&self.current_tag)
    }
}
