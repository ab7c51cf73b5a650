//! Scope parsing for token requests.
//!
//! Callers select the client and tenant by adding marker scopes such as
//! `VSCODE_CLIENT_ID:<id>` and `VSCODE_TENANT:<tenant>` to an ordinary scope
//! list. Markers are never sent to the identity provider.

use crate::{CacheError, CacheResult};
use url::Url;

pub const CLIENT_ID_SCOPE_PREFIX: &str = "VSCODE_CLIENT_ID:";
pub const TENANT_SCOPE_PREFIX: &str = "VSCODE_TENANT:";

/// Scopes every sign-in asks for.
pub const COMMON_SCOPES: [&str; 4] = ["openid", "email", "profile", "offline_access"];

/// A scope list split into client selection and provider scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeRequest {
    pub client_id: String,
    pub tenant: String,
    /// Requested scopes without markers, first occurrence order, no duplicates.
    pub scopes: Vec<String>,
}

impl ScopeRequest {
    /// Split `scopes`. The last marker of each kind wins; missing markers
    /// fall back to the defaults.
    pub fn parse<S: AsRef<str>>(scopes: &[S], default_client_id: &str, default_tenant: &str) -> Self {
        let mut client_id = None;
        let mut tenant = None;
        let mut plain: Vec<String> = Vec::new();

        for scope in scopes {
            let scope = scope.as_ref();
            if let Some(id) = scope.strip_prefix(CLIENT_ID_SCOPE_PREFIX) {
                client_id = Some(id.to_string());
            } else if let Some(t) = scope.strip_prefix(TENANT_SCOPE_PREFIX) {
                tenant = Some(t.to_string());
            } else if !plain.iter().any(|s| s == scope) {
                plain.push(scope.to_string());
            }
        }

        Self {
            client_id: client_id.unwrap_or_else(|| default_client_id.to_string()),
            tenant: tenant.unwrap_or_else(|| default_tenant.to_string()),
            scopes: plain,
        }
    }

    /// Scopes to send: the requested ones plus [`COMMON_SCOPES`].
    pub fn scopes_to_send(&self) -> Vec<String> {
        let mut scopes = self.scopes.clone();
        for common in COMMON_SCOPES {
            if !scopes.iter().any(|s| s == common) {
                scopes.push(common.to_string());
            }
        }
        scopes
    }

    /// Authority URL for this request's tenant.
    pub fn authority(&self, host: &Url) -> CacheResult<Url> {
        authority_for(host, &self.tenant)
    }
}

/// Resolve `tenant` against the authority host, e.g.
/// `https://login.microsoftonline.com/` + `organizations`.
pub fn authority_for(host: &Url, tenant: &str) -> CacheResult<Url> {
    if tenant.is_empty() {
        return Err(CacheError::CorruptState("empty tenant".to_string()));
    }
    host.join(tenant)
        .map_err(|e| CacheError::CorruptState(format!("invalid tenant {tenant:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_extracts_markers() {
        let request = ScopeRequest::parse(
            &["VSCODE_CLIENT_ID:abc", "VSCODE_TENANT:contoso", "user.read", "user.read"],
            "default-client",
            "organizations",
        );
        assert_eq!(request.client_id, "abc");
        assert_eq!(request.tenant, "contoso");
        assert_eq!(request.scopes, vec!["user.read"]);
    }

    #[test]
    fn test_unprefixed_markers_are_plain_scopes() {
        let request = ScopeRequest::parse(
            &["CLIENT_ID:abc", "TENANT:contoso"],
            "default-client",
            "organizations",
        );
        assert_eq!(request.client_id, "default-client");
        assert_eq!(request.tenant, "organizations");
        assert_eq!(request.scopes, vec!["CLIENT_ID:abc", "TENANT:contoso"]);
    }

    #[test]
    fn test_parse_falls_back_to_defaults() {
        let request = ScopeRequest::parse(&["user.read"], "default-client", "organizations");
        assert_eq!(request.client_id, "default-client");
        assert_eq!(request.tenant, "organizations");
    }

    #[test]
    fn test_scopes_to_send_adds_common_scopes_once() {
        let request = ScopeRequest::parse(
            &["VSCODE_CLIENT_ID:abc", "openid", "user.read"],
            "default-client",
            "organizations",
        );
        assert_eq!(
            request.scopes_to_send(),
            vec!["openid", "user.read", "email", "profile", "offline_access"]
        );
    }

    #[test]
    fn test_authority_for_joins_tenant() {
        let host = Url::parse("https://login.microsoftonline.com/").unwrap();
        assert_eq!(
            authority_for(&host, "organizations").unwrap().as_str(),
            "https://login.microsoftonline.com/organizations"
        );

        let request = ScopeRequest::parse(&["VSCODE_TENANT:contoso"], "c", "organizations");
        assert_eq!(
            request.authority(&host).unwrap().as_str(),
            "https://login.microsoftonline.com/contoso"
        );
    }

    #[test]
    fn test_authority_for_rejects_empty_tenant() {
        let host = Url::parse("https://login.microsoftonline.com/").unwrap();
        assert!(authority_for(&host, "").is_err());
    }
}
