use async_trait::async_trait;
use log::warn;
use std::collections::HashMap;
use thiserror::Error;

pub const UNKNOWN_NICKNAME: &str = "Unknown";

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("{0} not found in directory")]
    NotFound(String),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Business lookup used to label candidates.
#[async_trait]
pub trait BusinessDirectory: Send + Sync {
    async fn display_name(&self, business_id: &str) -> Result<String, DirectoryError>;
}

/// Nicknames of already-authenticated users.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn nickname(&self, user_id: &str) -> Result<Option<String>, DirectoryError>;
}

/// Display name for `business_id`, falling back to the id itself when the lookup fails.
pub async fn display_name_or_id(directory: &dyn BusinessDirectory, business_id: &str) -> String {
    match directory.display_name(business_id).await {
        Ok(name) => name,
        Err(e) => {
            warn!("Could not resolve display name for {}: {}", business_id, e);
            business_id.to_string()
        }
    }
}

pub async fn nickname_or_unknown(directory: &dyn UserDirectory, user_id: Option<&str>) -> String {
    let Some(user_id) = user_id else {
        return UNKNOWN_NICKNAME.to_string();
    };
    match directory.nickname(user_id).await {
        Ok(Some(nickname)) => nickname,
        Ok(None) => UNKNOWN_NICKNAME.to_string(),
        Err(e) => {
            warn!("Could not resolve nickname for {}: {}", user_id, e);
            UNKNOWN_NICKNAME.to_string()
        }
    }
}

/// Fixed in-memory directory.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    businesses: HashMap<String, String>,
    nicknames: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn with_business(mut self, business_id: &str, name: &str) -> Self {
        self.businesses.insert(business_id.to_string(), name.to_string());
        self
    }

    pub fn with_user(mut self, user_id: &str, nickname: &str) -> Self {
        self.nicknames.insert(user_id.to_string(), nickname.to_string());
        self
    }
}

#[async_trait]
impl BusinessDirectory for StaticDirectory {
    async fn display_name(&self, business_id: &str) -> Result<String, DirectoryError> {
        self.businesses
            .get(business_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(business_id.to_string()))
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn nickname(&self, user_id: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self.nicknames.get(user_id).cloned())
    }
}
