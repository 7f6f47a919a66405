use std::env;
use std::time::Duration;

use anyhow::Result;
use dotenvy::dotenv;

use crate::error::TreeError;

pub const DEFAULT_SERVER_ID: &str = "localhost";
pub const DEFAULT_OWNER: &str = "unnamed";

const SERVER_ID_KEY: &str = "COMPLETION_TREE_SERVER_ID";
const OWNER_KEY: &str = "COMPLETION_TREE_OWNER";
const ROOT_TIMEOUT_KEY: &str = "COMPLETION_TREE_ROOT_TIMEOUT_MS";

/// Tree configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConfig {
    /// Stamped on metadata built by `CompletionTree::metadata`
    pub server_id: String,
    pub owner: String,
    /// Deadline applied by `CompletionTree::create_expiring_root`
    pub root_timeout: Option<Duration>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            server_id: DEFAULT_SERVER_ID.to_string(),
            owner: DEFAULT_OWNER.to_string(),
            root_timeout: None,
        }
    }
}

impl TreeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let root_timeout = match lookup(ROOT_TIMEOUT_KEY) {
            None => None,
            Some(raw) => {
                let millis: u64 = raw.trim().parse().map_err(|e| TreeError::InvalidConfig {
                    key: ROOT_TIMEOUT_KEY,
                    message: format!("{raw:?} is not a number of milliseconds ({e})"),
                })?;
                // 0 disables the deadline
                (millis > 0).then(|| Duration::from_millis(millis))
            }
        };

        Ok(Self {
            server_id: lookup(SERVER_ID_KEY).unwrap_or_else(|| DEFAULT_SERVER_ID.to_string()),
            owner: lookup(OWNER_KEY).unwrap_or_else(|| DEFAULT_OWNER.to_string()),
            root_timeout,
        })
    }

    pub fn with_root_timeout(mut self, timeout: Duration) -> Self {
        self.root_timeout = Some(timeout);
        self
    }
}
