//! Agent credential handling.
//!
//! An agent presents `Authorization: Bearer <token>` on the tunnel upgrade
//! (or `?token=` when its WebSocket client cannot set headers). The token is
//! resolved to the environment it grants tunnel rights for.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::environment::{Environment, EnvironmentStore};
use crate::error::TunnelError;

/// Resolves a presented credential to an environment id.
#[async_trait]
pub trait TokenResolver: Send + Sync + 'static {
    async fn resolve(&self, token: &str) -> Result<String, TunnelError>;
}

/// Resolver over SHA-256 digests of each edge environment's access token.
/// Plaintext tokens are not retained.
#[derive(Default)]
pub struct ApiKeyResolver {
    digests: HashMap<String, [u8; 32]>,
}

impl ApiKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from environment records; only edge environments with a token
    /// can open a tunnel.
    pub fn from_environments<'a>(environments: impl IntoIterator<Item = &'a Environment>) -> Self {
        let mut resolver = Self::new();
        for env in environments {
            if let (true, Some(token)) = (env.is_edge(), env.access_token.as_deref()) {
                resolver.insert(&env.id, token);
            }
        }
        resolver
    }

    pub fn insert(&mut self, environment_id: &str, token: &str) {
        self.digests
            .insert(environment_id.to_string(), digest(token));
    }
}

#[async_trait]
impl TokenResolver for ApiKeyResolver {
    async fn resolve(&self, token: &str) -> Result<String, TunnelError> {
        if token.is_empty() {
            return Err(TunnelError::Unauthorized);
        }
        match_digest(
            self.digests.iter().map(|(id, d)| (id.as_str(), *d)),
            &digest(token),
        )
    }
}

/// Resolver that reads tokens from the environment store on every attempt,
/// so a token rotated through the settings endpoint applies immediately.
pub struct StoreTokenResolver(pub Arc<dyn EnvironmentStore>);

#[async_trait]
impl TokenResolver for StoreTokenResolver {
    async fn resolve(&self, token: &str) -> Result<String, TunnelError> {
        if token.is_empty() {
            return Err(TunnelError::Unauthorized);
        }
        let environments = self.0.list().await;
        let candidates = environments
            .iter()
            .filter(|env| env.is_edge() && env.enabled)
            .filter_map(|env| Some((env.id.as_str(), digest(env.access_token.as_deref()?))));
        match_digest(candidates, &digest(token))
    }
}

/// Scan every candidate so timing does not depend on which one matches.
fn match_digest<'a>(
    candidates: impl Iterator<Item = (&'a str, [u8; 32])>,
    presented: &[u8; 32],
) -> Result<String, TunnelError> {
    let mut found = None;
    for (id, expected) in candidates {
        if constant_time_eq(&expected, presented) && found.is_none() {
            found = Some(id.to_string());
        }
    }
    found.ok_or(TunnelError::Unauthorized)
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Extract the agent credential from the `Authorization` header, falling back
/// to a `token` query value.
pub fn bearer_token<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    let from_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    from_header.or(query_token.filter(|t| !t.is_empty()))
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EDGE_SCHEME;
    use axum::http::HeaderValue;

    fn env(id: &str, address: &str, token: Option<&str>) -> Environment {
        Environment {
            id: id.into(),
            name: id.into(),
            address: address.into(),
            access_token: token.map(Into::into),
            enabled: true,
            connected: false,
            last_heartbeat: None,
        }
    }

    #[tokio::test]
    async fn test_resolves_edge_tokens_only() {
        let envs = vec![
            env("1", &format!("{EDGE_SCHEME}site-a"), Some("tok-a")),
            env("2", "http://10.0.0.2:3553", Some("tok-b")),
            env("3", &format!("{EDGE_SCHEME}site-c"), None),
        ];
        let resolver = ApiKeyResolver::from_environments(&envs);
        assert_eq!(resolver.resolve("tok-a").await.unwrap(), "1");
        assert_eq!(resolver.resolve("tok-b").await, Err(TunnelError::Unauthorized));
        assert_eq!(resolver.resolve("").await, Err(TunnelError::Unauthorized));
        assert_eq!(resolver.resolve("nope").await, Err(TunnelError::Unauthorized));
    }

    #[tokio::test]
    async fn test_store_resolver_follows_updates() {
        use crate::environment::{EnvironmentSettings, InMemoryEnvironmentStore};

        let store = Arc::new(InMemoryEnvironmentStore::new([env(
            "1",
            &format!("{EDGE_SCHEME}site-a"),
            Some("tok-a"),
        )]));
        let resolver = StoreTokenResolver(store.clone());
        assert_eq!(resolver.resolve("tok-a").await.unwrap(), "1");

        store
            .update_settings(
                "1",
                EnvironmentSettings {
                    access_token: Some("tok-rotated".into()),
                    ..EnvironmentSettings::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(resolver.resolve("tok-a").await, Err(TunnelError::Unauthorized));
        assert_eq!(resolver.resolve("tok-rotated").await.unwrap(), "1");

        store
            .update_settings(
                "1",
                EnvironmentSettings {
                    enabled: Some(false),
                    ..EnvironmentSettings::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(resolver.resolve("tok-rotated").await, Err(TunnelError::Unauthorized));
    }

    #[test]
    fn test_bearer_token_header_then_query() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers, Some("q")), Some("q"));
        assert_eq!(bearer_token(&headers, Some("")), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers, Some("q")), Some("abc"));

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers, None), None);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
        assert!(!constant_time_eq(b"secret", b""));
    }
}
