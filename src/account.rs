use serde::{Deserialize, Serialize};

/// A trading account the system is authorized to place orders for. Loaded once from
/// configuration (§6) and treated as read-only for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub enabled: bool,
    pub broker_credentials_ref: String,
    pub notifier_channel: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AccountRegistry {
    accounts: Vec<Account>,
}

impl AccountRegistry {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self { accounts }
    }

    pub fn get(&self, name: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.name == name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).map(|a| a.enabled).unwrap_or(false)
    }

    pub fn enabled_names(&self) -> Vec<String> {
        self.accounts
            .iter()
            .filter(|a| a.enabled)
            .map(|a| a.name.clone())
            .collect()
    }

    pub fn all(&self) -> &[Account] {
        &self.accounts
    }
}
