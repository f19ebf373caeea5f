use serde::{Deserialize, Serialize};

// Credentials of the registered GitHub App, persisted in the settings
// repository under github_app_* keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubAppCredentials {
    pub app_id: String,
    pub slug: String,
    pub name: String,
    pub private_key: String,
    pub webhook_secret: String,
    pub client_id: String,
    pub client_secret: String,
}

/// A provider-side grant linking the app to an account's repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitInstallation {
    pub installation_id: i64,
    pub account_login: String,
    pub account_type: String,
}

impl GitInstallation {
    pub fn new(installation_id: i64, account_login: impl Into<String>, account_type: impl Into<String>) -> Self {
        Self {
            installation_id,
            account_login: account_login.into(),
            account_type: account_type.into(),
        }
    }
}
