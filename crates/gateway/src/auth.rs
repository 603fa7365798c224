use async_trait::async_trait;

use cosync_common::types::PrincipalId;
use cosync_protocol::Permissions;

// ── Types ────────────────────────────────────────────────────────────────────

/// Authenticated identity attached to a connection after a valid `auth`
/// frame: the user id plus the capability record echoed in `auth_success`.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: PrincipalId,
    pub permissions: Permissions,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            user_id: "anonymous".into(),
            permissions: Permissions::read_write_all(),
        }
    }
}

/// Pluggable "verify token → principal" hook. This is the entire auth
/// surface of the gateway; richer schemes slot in behind this trait.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// `None` rejects the connection (`auth_error` + close 1008).
    async fn verify_token(&self, token: Option<&str>) -> Option<Principal>;
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

// ── Static token verifier ────────────────────────────────────────────────────

/// Default verifier backed by a single shared token (`COSYNC_TOKEN`).
///
/// With no token configured the gateway runs open: every connection gets an
/// anonymous read/write principal. With a token configured, auth fails
/// closed and a match grants an admin operator principal.
pub struct StaticTokenVerifier {
    token: Option<String>,
}

impl StaticTokenVerifier {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify_token(&self, token: Option<&str>) -> Option<Principal> {
        let Some(expected) = self.token.as_deref() else {
            return Some(Principal::anonymous());
        };
        let given = token?;
        if !safe_equal(given, expected) {
            return None;
        }
        Some(Principal {
            user_id: "operator".into(),
            permissions: Permissions::admin(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_gateway_grants_anonymous() {
        let verifier = StaticTokenVerifier::new(None);
        let principal = verifier.verify_token(None).await;
        assert!(principal.is_some_and(|p| p.user_id == "anonymous"));
    }

    #[tokio::test]
    async fn configured_token_fails_closed() {
        let verifier = StaticTokenVerifier::new(Some("s3cret".into()));
        assert!(verifier.verify_token(None).await.is_none());
        assert!(verifier.verify_token(Some("wrong")).await.is_none());
        let principal = verifier.verify_token(Some("s3cret")).await;
        assert!(principal.is_some_and(|p| p.permissions.is_admin));
    }

    #[tokio::test]
    async fn empty_configured_token_means_open() {
        let verifier = StaticTokenVerifier::new(Some(String::new()));
        assert!(verifier.verify_token(None).await.is_some());
    }
}
