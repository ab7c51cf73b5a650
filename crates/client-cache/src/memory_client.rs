//! In-memory reference token client.
//!
//! Keeps its token cache as a JSON document behind the [`CachePersistence`]
//! hooks, reloading before every access and saving after every mutation.
//! Interactive sign-ins hand out scripted accounts instead of talking to an
//! identity provider.

use crate::{
    Account, AuthenticationResult, CacheKey, CachePersistence, ClientError, InteractiveRequest,
    RedirectMode, SilentRequest, TokenClient, TokenClientFactory,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One account's entry in the token cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedAccount {
    pub account: Account,
    pub refresh_token: String,
    pub scopes: Vec<String>,
}

/// The serialized token cache of an [`InMemoryTokenClient`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCacheDocument {
    pub accounts: Vec<CachedAccount>,
}

impl TokenCacheDocument {
    /// A document holding `accounts` with placeholder refresh tokens.
    pub fn from_accounts(accounts: &[Account]) -> Self {
        Self {
            accounts: accounts
                .iter()
                .map(|account| CachedAccount {
                    account: account.clone(),
                    refresh_token: format!("rt-{}", account.home_account_id),
                    scopes: Vec::new(),
                })
                .collect(),
        }
    }

    pub fn parse(blob: &str) -> Result<Self, ClientError> {
        serde_json::from_str(blob)
            .map_err(|e| ClientError::Protocol(format!("unreadable token cache: {e}")))
    }

    pub fn to_blob(&self) -> Result<String, ClientError> {
        serde_json::to_string(self)
            .map_err(|e| ClientError::Protocol(format!("unwritable token cache: {e}")))
    }

    fn find(&self, home_account_id: &str) -> Option<&CachedAccount> {
        self.accounts
            .iter()
            .find(|entry| entry.account.home_account_id == home_account_id)
    }
}

/// Scripted behavior shared by every client a factory builds.
#[derive(Debug, Default)]
pub struct SignInScript {
    next_accounts: Mutex<VecDeque<Account>>,
    failures: Mutex<HashMap<RedirectMode, VecDeque<String>>>,
    delay: Mutex<Option<Duration>>,
    attempts: Mutex<Vec<RedirectMode>>,
}

impl SignInScript {
    /// Account returned by the next successful interactive sign-in.
    pub fn push_account(&self, account: Account) {
        self.next_accounts.lock().push_back(account);
    }

    /// Make the next interactive sign-in using `redirect` fail.
    pub fn fail_next(&self, redirect: RedirectMode, message: impl Into<String>) {
        self.failures
            .lock()
            .entry(redirect)
            .or_default()
            .push_back(message.into());
    }

    /// Delay every interactive sign-in, standing in for a slow user.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Redirect modes of every interactive attempt so far.
    pub fn attempts(&self) -> Vec<RedirectMode> {
        self.attempts.lock().clone()
    }
}

/// [`TokenClient`] whose cache lives entirely behind its persistence hooks.
pub struct InMemoryTokenClient {
    key: CacheKey,
    persistence: Arc<dyn CachePersistence>,
    script: Arc<SignInScript>,
    issued: AtomicU64,
}

impl InMemoryTokenClient {
    pub fn new(
        key: CacheKey,
        persistence: Arc<dyn CachePersistence>,
        script: Arc<SignInScript>,
    ) -> Self {
        Self {
            key,
            persistence,
            script,
            issued: AtomicU64::new(0),
        }
    }

    async fn read_cache(&self) -> Result<TokenCacheDocument, ClientError> {
        match self.persistence.load().await? {
            Some(blob) => TokenCacheDocument::parse(&blob),
            None => Ok(TokenCacheDocument::default()),
        }
    }

    async fn write_cache(&self, document: &TokenCacheDocument) -> Result<(), ClientError> {
        let blob = if document.accounts.is_empty() {
            None
        } else {
            Some(document.to_blob()?)
        };
        self.persistence.save_if_changed(blob).await?;
        Ok(())
    }

    fn issue(&self, account: Account, scopes: Vec<String>) -> AuthenticationResult {
        let serial = self.issued.fetch_add(1, Ordering::Relaxed);
        AuthenticationResult {
            access_token: format!("at-{}-{serial}", account.home_account_id),
            id_token: Some(format!("id-{}", account.home_account_id)),
            account,
            scopes,
            expires_on: Utc::now() + chrono::Duration::hours(1),
        }
    }
}

#[async_trait]
impl TokenClient for InMemoryTokenClient {
    async fn get_all_accounts(&self) -> Result<Vec<Account>, ClientError> {
        let document = self.read_cache().await?;
        Ok(document
            .accounts
            .into_iter()
            .map(|entry| entry.account)
            .collect())
    }

    async fn acquire_token_silent(
        &self,
        request: SilentRequest,
    ) -> Result<AuthenticationResult, ClientError> {
        let document = self.read_cache().await?;
        let entry = document
            .find(&request.account.home_account_id)
            .ok_or(ClientError::InteractionRequired)?;
        Ok(self.issue(entry.account.clone(), request.scopes))
    }

    async fn acquire_token_interactive(
        &self,
        request: InteractiveRequest,
    ) -> Result<AuthenticationResult, ClientError> {
        self.script.attempts.lock().push(request.redirect);
        let delay = *self.script.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .script
            .failures
            .lock()
            .get_mut(&request.redirect)
            .and_then(VecDeque::pop_front);
        if let Some(message) = failure {
            return Err(ClientError::Interactive(message));
        }

        let account = self
            .script
            .next_accounts
            .lock()
            .pop_front()
            .ok_or_else(|| ClientError::Interactive("no account signed in".to_string()))?;

        let mut document = self.read_cache().await?;
        document
            .accounts
            .retain(|entry| entry.account.home_account_id != account.home_account_id);
        document.accounts.push(CachedAccount {
            account: account.clone(),
            refresh_token: format!("rt-{}", account.home_account_id),
            scopes: request.scopes.clone(),
        });
        self.write_cache(&document).await?;

        debug!(key = %self.key, account = %account.username, "Interactive sign-in completed");
        Ok(self.issue(account, request.scopes))
    }

    async fn remove_account(&self, account: &Account) -> Result<(), ClientError> {
        let mut document = self.read_cache().await?;
        let before = document.accounts.len();
        document
            .accounts
            .retain(|entry| entry.account.home_account_id != account.home_account_id);
        if document.accounts.len() == before {
            return Err(ClientError::AccountNotFound(account.home_account_id.clone()));
        }
        self.write_cache(&document).await
    }
}

/// Builds [`InMemoryTokenClient`]s sharing one [`SignInScript`].
#[derive(Default)]
pub struct InMemoryTokenClientFactory {
    script: Arc<SignInScript>,
    created: AtomicUsize,
}

impl InMemoryTokenClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self) -> Arc<SignInScript> {
        self.script.clone()
    }

    /// Number of clients built so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl TokenClientFactory for InMemoryTokenClientFactory {
    fn create(&self, key: &CacheKey, persistence: Arc<dyn CachePersistence>) -> Arc<dyn TokenClient> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Arc::new(InMemoryTokenClient::new(
            key.clone(),
            persistence,
            self.script.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheResult;

    /// Persistence hooks over a plain cell.
    #[derive(Default)]
    struct CellPersistence {
        blob: Mutex<Option<String>>,
    }

    #[async_trait]
    impl CachePersistence for CellPersistence {
        async fn load(&self) -> CacheResult<Option<String>> {
            Ok(self.blob.lock().clone())
        }

        async fn save_if_changed(&self, blob: Option<String>) -> CacheResult<()> {
            *self.blob.lock() = blob;
            Ok(())
        }
    }

    fn client() -> (InMemoryTokenClient, Arc<CellPersistence>, Arc<SignInScript>) {
        let persistence = Arc::new(CellPersistence::default());
        let script = Arc::new(SignInScript::default());
        let client = InMemoryTokenClient::new(
            CacheKey::new("c1", "a"),
            persistence.clone(),
            script.clone(),
        );
        (client, persistence, script)
    }

    fn interactive(redirect: RedirectMode) -> InteractiveRequest {
        InteractiveRequest {
            scopes: vec!["openid".to_string()],
            redirect,
            login_hint: None,
        }
    }

    #[tokio::test]
    async fn test_sign_in_persists_account() {
        let (client, persistence, script) = client();
        script.push_account(Account::new("A", "a@example.com"));

        let result = client
            .acquire_token_interactive(interactive(RedirectMode::Loopback))
            .await
            .unwrap();
        assert_eq!(result.account.home_account_id, "A");

        let stored = persistence.blob.lock().clone().unwrap();
        let document = TokenCacheDocument::parse(&stored).unwrap();
        assert_eq!(document.accounts.len(), 1);
        assert_eq!(client.get_all_accounts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_silent_requires_cached_account() {
        let (client, _persistence, script) = client();
        let account = Account::new("A", "a@example.com");

        let request = SilentRequest {
            account: account.clone(),
            scopes: vec!["openid".into()],
            force_refresh: false,
        };
        assert!(matches!(
            client.acquire_token_silent(request.clone()).await,
            Err(ClientError::InteractionRequired)
        ));

        script.push_account(account);
        client
            .acquire_token_interactive(interactive(RedirectMode::UriHandler))
            .await
            .unwrap();
        let result = client.acquire_token_silent(request).await.unwrap();
        assert!(result.access_token.starts_with("at-A-"));
    }

    #[tokio::test]
    async fn test_removing_last_account_clears_blob() {
        let (client, persistence, script) = client();
        let account = Account::new("A", "a@example.com");
        script.push_account(account.clone());
        client
            .acquire_token_interactive(interactive(RedirectMode::Loopback))
            .await
            .unwrap();

        client.remove_account(&account).await.unwrap();
        assert!(persistence.blob.lock().is_none());
        assert!(matches!(
            client.remove_account(&account).await,
            Err(ClientError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_scripted_failure_is_per_redirect_mode() {
        let (client, _persistence, script) = client();
        script.fail_next(RedirectMode::Loopback, "listener blocked");
        script.push_account(Account::new("A", "a@example.com"));

        assert!(matches!(
            client
                .acquire_token_interactive(interactive(RedirectMode::Loopback))
                .await,
            Err(ClientError::Interactive(msg)) if msg == "listener blocked"
        ));
        client
            .acquire_token_interactive(interactive(RedirectMode::UriHandler))
            .await
            .unwrap();
        assert_eq!(
            script.attempts(),
            vec![RedirectMode::Loopback, RedirectMode::UriHandler]
        );
    }

    #[tokio::test]
    async fn test_corrupt_cache_is_a_protocol_error() {
        let (client, persistence, _script) = client();
        *persistence.blob.lock() = Some("{not json".to_string());

        assert!(matches!(
            client.get_all_accounts().await,
            Err(ClientError::Protocol(_))
        ));
    }
}
