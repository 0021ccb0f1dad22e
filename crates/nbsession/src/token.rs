//! Server token: lets a client tell whether it is reconnecting to the same
//! server instance that issued its session, or to a restarted one.

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TokenManager {
    server_token: String,
}

impl TokenManager {
    pub fn new() -> Self {
        Self {
            server_token: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_token(server_token: impl Into<String>) -> Self {
        Self {
            server_token: server_token.into(),
        }
    }

    pub fn server_token(&self) -> &str {
        &self.server_token
    }

    /// A missing token is accepted; an older client may not send one.
    pub fn validate(&self, token: Option<&str>) -> bool {
        token.map_or(true, |token| token == self.server_token)
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_per_manager() {
        assert_ne!(TokenManager::new().server_token(), TokenManager::new().server_token());
    }

    #[test]
    fn test_validate() {
        let tokens = TokenManager::with_token("abc");
        assert!(tokens.validate(Some("abc")));
        assert!(tokens.validate(None));
        assert!(!tokens.validate(Some("stale")));
    }
}
