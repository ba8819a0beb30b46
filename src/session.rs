use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// Seconds a login stays valid.
pub const SESSION_TTL: u64 = 86400;
pub const COOKIE_NAME: &str = "token";

/// Who is making a request, as recorded when they logged in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub name: Option<String>,
}

impl Identity {
    /// Reads an identity out of an OAuth2 provider's userinfo document.
    pub fn from_userinfo(userinfo: &Value) -> Option<Self> {
        let user_id = ["sub", "id"]
            .iter()
            .find_map(|key| match userinfo.get(key)? {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })?;
        let name = ["name", "preferred_username", "username", "login"]
            .iter()
            .find_map(|key| userinfo.get(key)?.as_str().map(str::to_owned));
        Some(Self { user_id, name })
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.user_id)
    }
}

/// Resolves the caller's identity from their session token.
///
/// `Ok(None)` means anonymous. `Err` means the lookup itself broke and must
/// not be mistaken for an anonymous request.
#[async_trait]
pub trait SessionGate: Send + Sync {
    async fn current_identity(&self, token: Option<&str>) -> Result<Option<Identity>, Error>;
}

#[derive(Clone)]
pub struct RedisSessions {
    redis: MultiplexedConnection,
}

impl RedisSessions {
    pub const fn new(redis: MultiplexedConnection) -> Self {
        Self { redis }
    }

    pub async fn create(&self, token: &str, identity: &Identity) -> Result<(), Error> {
        let record = serde_json::to_string(identity)?;
        let _: () = self
            .redis
            .clone()
            .set_ex(session_key(token), record, SESSION_TTL)
            .await?;
        Ok(())
    }

    pub async fn destroy(&self, token: &str) -> Result<(), Error> {
        let _: () = self.redis.clone().del(session_key(token)).await?;
        Ok(())
    }

    pub async fn store_pkce(&self, csrf: &str, verifier: &str) -> Result<(), Error> {
        let _: () = self
            .redis
            .clone()
            .set_ex(csrf_key(csrf), verifier, 600)
            .await?;
        Ok(())
    }

    pub async fn take_pkce(&self, csrf: &str) -> Result<Option<String>, Error> {
        Ok(self.redis.clone().get_del(csrf_key(csrf)).await?)
    }
}

#[async_trait]
impl SessionGate for RedisSessions {
    async fn current_identity(&self, token: Option<&str>) -> Result<Option<Identity>, Error> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        let record: Option<String> = self.redis.clone().get(session_key(token)).await?;
        record
            .map(|record| serde_json::from_str(&record))
            .transpose()
            .map_err(Error::from)
    }
}

fn session_key(token: &str) -> String {
    format!("token:auth:{token}")
}

fn csrf_key(state: &str) -> String {
    format!("token:csrf:{state}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn identity_from_oidc_userinfo() {
        let identity = Identity::from_userinfo(&json!({
            "sub": "248289761001",
            "name": "Jane Doe",
            "preferred_username": "j.doe",
        }))
        .unwrap();
        assert_eq!(identity.user_id, "248289761001");
        assert_eq!(identity.display_name(), "Jane Doe");
    }

    #[test]
    fn identity_from_numeric_id() {
        let identity = Identity::from_userinfo(&json!({ "id": 583231, "login": "octocat" })).unwrap();
        assert_eq!(identity.user_id, "583231");
        assert_eq!(identity.name.as_deref(), Some("octocat"));
    }

    #[test]
    fn userinfo_without_subject_is_rejected() {
        assert!(Identity::from_userinfo(&json!({ "name": "nobody" })).is_none());
        assert!(Identity::from_userinfo(&json!({ "sub": "" })).is_none());
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let identity = Identity {
            user_id: "42".to_owned(),
            name: None,
        };
        assert_eq!(identity.display_name(), "42");
    }

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(session_key("abc"), "token:auth:abc");
        assert_eq!(csrf_key("xyz"), "token:csrf:xyz");
    }
}
