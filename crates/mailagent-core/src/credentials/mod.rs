//! Credential lifecycle for one mail account session
//!
//! [`CredentialManager`] owns the access/refresh token pair of a session and
//! hands out bearer tokens that are guaranteed not to be expired. Tokens
//! close to expiry are refreshed before they are handed out, and concurrent
//! callers share a single refresh exchange.

mod bootstrap;
mod store;

pub use bootstrap::*;
pub use store::*;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::CredentialsConfig;
use crate::error::{Error, Result};

/// Source of the current Unix time in seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// OAuth token pair owned by the credential manager
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// Access token for capability calls
    pub access_token: String,

    /// Refresh token for obtaining new access tokens
    pub refresh_token: String,

    /// Access token expiry timestamp (Unix seconds)
    pub expires_at: i64,

    /// Granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl TokenPair {
    /// A pair holding only a refresh token; forces a refresh on first use
    pub fn from_refresh_token(refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: String::new(),
            refresh_token: refresh_token.into(),
            expires_at: 0,
            scopes: vec![],
        }
    }

    /// Check if the access token is past its expiry at `now`
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.access_token.is_empty() || self.expires_at <= now
    }

    /// Check if the access token expires within `window_secs` of `now`
    pub fn expires_within(&self, now: i64, window_secs: i64) -> bool {
        self.is_expired_at(now.saturating_add(window_secs))
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Opaque bearer value attached to outgoing capability requests
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    value: String,
    expires_at: i64,
}

impl BearerToken {
    #[cfg(test)]
    pub(crate) fn new(value: impl Into<String>, expires_at: i64) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// Raw token for the `Authorization` header
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Expiry timestamp (Unix seconds)
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Keeps one session's token pair valid
///
/// The in-memory pair is only ever replaced while `refresh_gate` is held, so
/// there is a single writer per session and at most one refresh exchange in
/// flight.
pub struct CredentialManager {
    session_id: String,
    tokens: RwLock<TokenPair>,
    refresh_gate: Mutex<()>,
    bootstrap: Arc<dyn CredentialBootstrap>,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    safety_window_secs: i64,
    refresh_timeout: Duration,
}

impl CredentialManager {
    /// Load the session's token pair from the store, falling back to the
    /// bootstrap collaborator's initial refresh token
    pub async fn initialize(
        session_id: &str,
        config: &CredentialsConfig,
        bootstrap: Arc<dyn CredentialBootstrap>,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self> {
        Self::initialize_with_clock(session_id, config, bootstrap, store, Arc::new(SystemClock))
            .await
    }

    /// Same as [`initialize`](Self::initialize) with an explicit clock
    pub async fn initialize_with_clock(
        session_id: &str,
        config: &CredentialsConfig,
        bootstrap: Arc<dyn CredentialBootstrap>,
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let tokens = match store.get_tokens(session_id).await? {
            Some(tokens) => {
                debug!("Loaded stored token pair for session {}", session_id);
                tokens
            }
            None => {
                let refresh_token = bootstrap
                    .load_initial_refresh_token(session_id)
                    .await
                    .map_err(|e| Error::NotAuthorized {
                        session: session_id.to_string(),
                        reason: e.to_string(),
                    })?;
                info!("Bootstrapped refresh token for session {}", session_id);
                TokenPair::from_refresh_token(refresh_token)
            }
        };

        Ok(Self {
            session_id: session_id.to_string(),
            tokens: RwLock::new(tokens),
            refresh_gate: Mutex::new(()),
            bootstrap,
            store,
            clock,
            safety_window_secs: config.safety_window_secs,
            refresh_timeout: Duration::from_secs(config.refresh_timeout_secs),
        })
    }

    /// Session this manager belongs to
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get a bearer token that is not expired, refreshing first if it would
    /// expire within the safety window
    pub async fn get_valid_token(&self) -> Result<BearerToken> {
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }

        let _gate = self.refresh_gate.lock().await;

        // Another caller may have refreshed while we waited for the gate
        if let Some(token) = self.fresh_token() {
            debug!("Reusing token refreshed by a concurrent caller");
            return Ok(token);
        }

        self.refresh_locked().await
    }

    /// Called after the provider rejected `rejected`. Refreshes unless a
    /// concurrent caller already replaced that token.
    pub async fn refresh_after_rejection(&self, rejected: &BearerToken) -> Result<BearerToken> {
        let _gate = self.refresh_gate.lock().await;

        {
            let tokens = self.tokens.read();
            let now = self.clock.now();
            if tokens.access_token != rejected.value && !tokens.is_expired_at(now) {
                debug!("Rejected token already replaced for session {}", self.session_id);
                return Ok(BearerToken {
                    value: tokens.access_token.clone(),
                    expires_at: tokens.expires_at,
                });
            }
        }

        warn!("Provider rejected bearer token for session {}, refreshing", self.session_id);
        self.refresh_locked().await
    }

    /// Current token if it is outside the safety window
    fn fresh_token(&self) -> Option<BearerToken> {
        let tokens = self.tokens.read();
        let now = self.clock.now();
        if tokens.expires_within(now, self.safety_window_secs) {
            None
        } else {
            Some(BearerToken {
                value: tokens.access_token.clone(),
                expires_at: tokens.expires_at,
            })
        }
    }

    /// Perform one refresh exchange. Caller must hold `refresh_gate`.
    async fn refresh_locked(&self) -> Result<BearerToken> {
        let current = self.tokens.read().clone();
        debug!("Refreshing access token for session {}", self.session_id);

        let grant = match tokio::time::timeout(
            self.refresh_timeout,
            self.bootstrap.exchange_refresh_token(&current.refresh_token),
        )
        .await
        {
            Ok(Ok(grant)) => grant,
            Ok(Err(e)) => {
                error!("Token refresh failed for session {}: {}", self.session_id, e);
                return Err(self.reauth(e.to_string()));
            }
            Err(_) => {
                error!(
                    "Token refresh timed out after {:?} for session {}",
                    self.refresh_timeout, self.session_id
                );
                return Err(self.reauth("refresh exchange timed out".to_string()));
            }
        };

        let refreshed = TokenPair {
            access_token: grant.access_token,
            // Keep the old refresh token if not provided
            refresh_token: grant.refresh_token.unwrap_or(current.refresh_token),
            expires_at: self.clock.now().saturating_add(grant.expires_in),
            scopes: if grant.scopes.is_empty() {
                current.scopes
            } else {
                grant.scopes
            },
        };

        if refreshed.is_expired_at(self.clock.now()) {
            return Err(self.reauth("refresh exchange returned an expired token".to_string()));
        }

        if let Err(e) = self.store.store_tokens(&self.session_id, &refreshed).await {
            // The in-memory pair stays authoritative for this process
            warn!("Failed to persist refreshed tokens for {}: {}", self.session_id, e);
        }

        let token = BearerToken {
            value: refreshed.access_token.clone(),
            expires_at: refreshed.expires_at,
        };
        *self.tokens.write() = refreshed;

        // No await between this check and the return
        if token.expires_at <= self.clock.now() {
            return Err(self.reauth("refreshed token expired during persistence".to_string()));
        }

        info!(
            "Refreshed access token for session {} (expires at {})",
            self.session_id, token.expires_at
        );
        Ok(token)
    }

    fn reauth(&self, reason: String) -> Error {
        Error::ReauthRequired {
            session: self.session_id.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    struct ManualClock(AtomicI64);

    impl ManualClock {
        fn at(now: i64) -> Arc<Self> {
            Arc::new(Self(AtomicI64::new(now)))
        }

        fn advance(&self, secs: i64) {
            self.0.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct FakeBootstrap {
        exchanges: AtomicUsize,
        delay: Duration,
        lifetime_secs: i64,
        revoked: bool,
    }

    impl FakeBootstrap {
        fn new(delay_ms: u64, lifetime_secs: i64) -> Arc<Self> {
            Arc::new(Self {
                exchanges: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
                lifetime_secs,
                revoked: false,
            })
        }

        fn revoked() -> Arc<Self> {
            Arc::new(Self {
                exchanges: AtomicUsize::new(0),
                delay: Duration::ZERO,
                lifetime_secs: 0,
                revoked: true,
            })
        }
    }

    #[async_trait]
    impl CredentialBootstrap for FakeBootstrap {
        async fn load_initial_refresh_token(
            &self,
            _session_id: &str,
        ) -> std::result::Result<String, BootstrapError> {
            Ok("refresh-0".to_string())
        }

        async fn exchange_refresh_token(
            &self,
            _refresh_token: &str,
        ) -> std::result::Result<TokenGrant, BootstrapError> {
            let n = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.revoked {
                return Err(BootstrapError::Revoked("invalid_grant".to_string()));
            }
            Ok(TokenGrant {
                access_token: format!("access-{}", n),
                refresh_token: None,
                expires_in: self.lifetime_secs,
                scopes: vec![],
            })
        }
    }

    fn config(window: i64) -> CredentialsConfig {
        CredentialsConfig {
            safety_window_secs: window,
            ..CredentialsConfig::default()
        }
    }

    async fn manager(
        bootstrap: Arc<FakeBootstrap>,
        clock: Arc<ManualClock>,
        window: i64,
    ) -> CredentialManager {
        CredentialManager::initialize_with_clock(
            "session-1",
            &config(window),
            bootstrap,
            Arc::new(MemoryTokenStore::new()),
            clock,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_token_is_refreshed_on_first_use() {
        let bootstrap = FakeBootstrap::new(0, 3600);
        let clock = ManualClock::at(1_000_000);
        let clm = manager(bootstrap.clone(), clock.clone(), 300).await;

        let token = clm.get_valid_token().await.unwrap();
        assert_eq!(token.as_str(), "access-1");
        assert_eq!(token.expires_at(), 1_000_000 + 3600);

        // Still fresh: no second exchange
        clm.get_valid_token().await.unwrap();
        assert_eq!(bootstrap.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refreshes_inside_safety_window() {
        let bootstrap = FakeBootstrap::new(0, 3600);
        let clock = ManualClock::at(1_000_000);
        let clm = manager(bootstrap.clone(), clock.clone(), 300).await;

        clm.get_valid_token().await.unwrap();
        clock.advance(3600 - 200);

        let token = clm.get_valid_token().await.unwrap();
        assert_eq!(token.as_str(), "access-2");
        assert_eq!(bootstrap.exchanges.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_refresh() {
        let bootstrap = FakeBootstrap::new(250, 3600);
        let clock = ManualClock::at(1_000_000);
        let clm = Arc::new(manager(bootstrap.clone(), clock, 300).await);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let clm = clm.clone();
                tokio::spawn(async move { clm.get_valid_token().await })
            })
            .collect();

        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            assert_eq!(token.as_str(), "access-1");
        }
        assert_eq!(bootstrap.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_revoked_refresh_token_requires_reauth() {
        let clock = ManualClock::at(1_000_000);
        let clm = manager(FakeBootstrap::revoked(), clock, 300).await;

        let err = clm.get_valid_token().await.unwrap_err();
        assert!(err.requires_reauth());
    }

    #[tokio::test]
    async fn test_expired_grant_requires_reauth() {
        let clock = ManualClock::at(1_000_000);
        let clm = manager(FakeBootstrap::new(0, 0), clock, 300).await;

        let err = clm.get_valid_token().await.unwrap_err();
        assert!(err.requires_reauth());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_timeout_requires_reauth() {
        let clock = ManualClock::at(1_000_000);
        // Exchange slower than the default 15s refresh timeout
        let clm = manager(FakeBootstrap::new(60_000, 3600), clock, 300).await;

        let err = clm.get_valid_token().await.unwrap_err();
        assert!(err.requires_reauth());
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_rejection_after_concurrent_refresh_reuses_token() {
        let bootstrap = FakeBootstrap::new(0, 3600);
        let clock = ManualClock::at(1_000_000);
        let clm = manager(bootstrap.clone(), clock, 300).await;

        let first = clm.get_valid_token().await.unwrap();
        let second = clm.refresh_after_rejection(&first).await.unwrap();
        assert_eq!(second.as_str(), "access-2");

        // A stale rejection of the first token must not trigger another exchange
        let third = clm.refresh_after_rejection(&first).await.unwrap();
        assert_eq!(third.as_str(), "access-2");
        assert_eq!(bootstrap.exchanges.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_bootstrap_token_is_not_authorized() {
        struct NoToken;

        #[async_trait]
        impl CredentialBootstrap for NoToken {
            async fn load_initial_refresh_token(
                &self,
                session_id: &str,
            ) -> std::result::Result<String, BootstrapError> {
                Err(BootstrapError::NotAuthorized(session_id.to_string()))
            }

            async fn exchange_refresh_token(
                &self,
                _refresh_token: &str,
            ) -> std::result::Result<TokenGrant, BootstrapError> {
                unreachable!("no exchange without a refresh token")
            }
        }

        let result = CredentialManager::initialize(
            "session-x",
            &CredentialsConfig::default(),
            Arc::new(NoToken),
            Arc::new(MemoryTokenStore::new()),
        )
        .await;
        assert!(matches!(result, Err(Error::NotAuthorized { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_returns_expired_token_under_random_concurrency() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

        for _ in 0..1000 {
            let clock = ManualClock::at(1_000_000);
            let lifetime = rng.gen_range(1..=120);
            let window = rng.gen_range(0..=60);
            let bootstrap = FakeBootstrap::new(rng.gen_range(0..=50), lifetime);
            let clm = Arc::new(manager(bootstrap, clock.clone(), window).await);

            let tasks: Vec<_> = (0..rng.gen_range(2..=8))
                .map(|_| {
                    let clm = clm.clone();
                    let clock = clock.clone();
                    let pause = Duration::from_millis(rng.gen_range(0..=40));
                    let jump = rng.gen_range(0..=90);
                    tokio::spawn(async move {
                        tokio::time::sleep(pause).await;
                        clock.advance(jump);
                        let token = clm.get_valid_token().await?;
                        assert!(
                            token.expires_at() > clock.now(),
                            "returned token expired at {} but now is {}",
                            token.expires_at(),
                            clock.now()
                        );
                        Ok::<_, Error>(())
                    })
                })
                .collect();

            for task in tasks {
                task.await.unwrap().unwrap();
            }
        }
    }
}
