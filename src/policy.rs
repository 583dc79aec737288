use crate::config::PolicyConfig;
use std::collections::HashSet;
use tracing::info;

/// Per-contact reply eligibility. Deny wins; a non-empty allow list admits
/// only its members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactPolicy {
    blacklist: HashSet<String>,
    whitelist: HashSet<String>,
}

impl ContactPolicy {
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            blacklist: normalized_names(&config.blacklist),
            whitelist: normalized_names(&config.whitelist),
        }
    }

    pub fn permits(&self, contact: &str) -> bool {
        if self.blacklist.contains(contact) {
            return false;
        }
        self.whitelist.is_empty() || self.whitelist.contains(contact)
    }

    pub fn add_to_blacklist(&mut self, contact: &str) {
        self.blacklist.insert(contact.trim().to_owned());
        info!(contact, "added contact to blacklist");
    }

    pub fn add_to_whitelist(&mut self, contact: &str) {
        self.whitelist.insert(contact.trim().to_owned());
        info!(contact, "added contact to whitelist");
    }
}

fn normalized_names(names: &[String]) -> HashSet<String> {
    names.iter().map(|name| name.trim().to_owned()).collect()
}
