//! Session token lifecycle.
//!
//! `SessionManager` owns the access/refresh pair and the access token's
//! expiry. State lives in memory with a durable `TokenStore` behind it; the
//! store is read once, on first use, and memory is authoritative after that. Renewal is proactive (a timer
//! armed ahead of expiry) and on demand (`ensure_fresh`, or a caller that saw
//! a 401).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::clock::{Clock, SystemClock};
use super::store::{TokenStore, ACCESS_TOKEN_KEY, EXPIRY_KEY, REFRESH_TOKEN_KEY};
use super::timer::RenewalTimer;
use super::AuthError;
use crate::api::ApiClient;
use crate::models::{AuthTokens, User};

/// A token this close to expiry is treated as already expired.
const STALENESS_MARGIN_MINUTES: i64 = 5;

/// Proactive renewal fires this long before expiry.
const PROACTIVE_LEAD_MINUTES: i64 = 15;

/// Shortest wait before the timer fires again after a renewal.
const MIN_REARM_SECONDS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub staleness_margin: Duration,
    pub proactive_lead: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            staleness_margin: Duration::minutes(STALENESS_MARGIN_MINUTES),
            proactive_lead: Duration::minutes(PROACTIVE_LEAD_MINUTES),
        }
    }
}

/// Outcome of `SessionManager::initialize`.
#[derive(Debug)]
pub enum SessionStatus {
    Restored,
    /// No usable session. Carries the renewal error when a stale session
    /// could not be renewed.
    NoSession(Option<AuthError>),
}

impl SessionStatus {
    pub fn is_restored(&self) -> bool {
        matches!(self, SessionStatus::Restored)
    }
}

#[derive(Debug, Default)]
struct SessionState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    /// Set once the store has been read, or memory was written or cleared.
    loaded: bool,
}

impl SessionState {
    /// Memory that must never fall back to the store again.
    fn cleared() -> Self {
        Self {
            loaded: true,
            ..Self::default()
        }
    }
}

fn decode_expiry(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(at) => Some(at.with_timezone(&Utc)),
        Err(e) => {
            warn!(error = %e, "Ignoring unparseable persisted expiry");
            None
        }
    }
}

pub struct SessionManager {
    api: ApiClient,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    state: Mutex<SessionState>,
    /// Serializes renewals so concurrent callers share one network call.
    renewal: tokio::sync::Mutex<()>,
    timer: RenewalTimer,
}

impl SessionManager {
    pub fn new(api: ApiClient, store: Arc<dyn TokenStore>) -> Arc<Self> {
        Self::with_options(api, store, Arc::new(SystemClock), SessionSettings::default())
    }

    pub fn with_options(
        api: ApiClient,
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            store,
            clock,
            settings,
            state: Mutex::new(SessionState::default()),
            renewal: tokio::sync::Mutex::new(()),
            timer: RenewalTimer::new(),
        })
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    // ===== Credential storage =====

    /// Store both tokens, in memory and durably.
    pub fn set_credentials(&self, access_token: &str, refresh_token: &str) {
        let mut state = self.state.lock();
        self.hydrate(&mut state);
        state.access_token = Some(access_token.to_string());
        state.refresh_token = Some(refresh_token.to_string());
        self.persist(ACCESS_TOKEN_KEY, access_token);
        self.persist(REFRESH_TOKEN_KEY, refresh_token);
    }

    /// Store the expiry of the current access token.
    pub fn set_expiry(&self, expires_at: DateTime<Utc>) {
        let mut state = self.state.lock();
        self.hydrate(&mut state);
        state.expires_at = Some(expires_at);
        self.persist(EXPIRY_KEY, &expires_at.to_rfc3339());
    }

    /// Install a freshly minted pair and its expiry.
    fn install(&self, tokens: &AuthTokens) {
        let mut state = self.state.lock();
        self.install_locked(&mut state, tokens);
    }

    fn install_locked(&self, state: &mut SessionState, tokens: &AuthTokens) {
        state.loaded = true;
        state.access_token = Some(tokens.access.token.clone());
        state.refresh_token = Some(tokens.refresh.token.clone());
        state.expires_at = Some(tokens.access.expires);
        self.persist(ACCESS_TOKEN_KEY, &tokens.access.token);
        self.persist(REFRESH_TOKEN_KEY, &tokens.refresh.token);
        self.persist(EXPIRY_KEY, &tokens.access.expires.to_rfc3339());
    }

    fn persist(&self, key: &str, value: &str) {
        if let Err(e) = self.store.set(key, value) {
            warn!(key, error = %e, "Failed to persist session value");
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(|state| state.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read(|state| state.refresh_token.clone())
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.read(|state| state.expires_at)
    }

    fn read<T>(&self, field: impl FnOnce(&SessionState) -> T) -> T {
        let mut state = self.state.lock();
        self.hydrate(&mut state);
        field(&state)
    }

    /// Fill memory from the durable store, once per manager.
    fn hydrate(&self, state: &mut SessionState) {
        if state.loaded {
            return;
        }
        state.loaded = true;
        state.access_token = self.load(ACCESS_TOKEN_KEY);
        state.refresh_token = self.load(REFRESH_TOKEN_KEY);
        state.expires_at = self.load(EXPIRY_KEY).as_deref().and_then(decode_expiry);
        if state.access_token.is_some() || state.refresh_token.is_some() {
            debug!("Loaded session from store");
        }
    }

    fn load(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Failed to read session store");
                None
            }
        }
    }

    // ===== Expiry =====

    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.expires_at().map(|at| at - self.clock.now())
    }

    /// True with no known expiry, or within the staleness margin of it.
    pub fn is_stale(&self) -> bool {
        match self.time_until_expiry() {
            Some(remaining) => remaining <= self.settings.staleness_margin,
            None => true,
        }
    }

    /// Precondition for every outbound data request.
    pub async fn ensure_fresh(self: &Arc<Self>) -> Result<(), AuthError> {
        if self.access_token().is_none() || self.refresh_token().is_none() {
            return Err(AuthError::NoSession);
        }
        if self.is_stale() {
            debug!("Access token stale, renewing before request");
            return self.renew().await;
        }
        Ok(())
    }

    // ===== Renewal =====

    /// Mint a new pair with the refresh token.
    ///
    /// Any failure clears the session; callers must send the user back to
    /// login rather than retry.
    pub async fn renew(self: &Arc<Self>) -> Result<(), AuthError> {
        let observed = self.refresh_token();
        let _guard = self.renewal.lock().await;

        let Some(refresh_token) = self.refresh_token() else {
            return Err(AuthError::NoSession);
        };
        if observed.as_deref() != Some(refresh_token.as_str()) && !self.is_stale() {
            debug!("Session already renewed by a concurrent caller");
            return Ok(());
        }

        let result = self.api.refresh_tokens(&refresh_token).await;

        // Logout or a new login may have happened while the call was out.
        // Compare and apply under one lock so neither is overwritten.
        {
            let mut state = self.state.lock();
            self.hydrate(&mut state);
            match state.refresh_token.as_deref() {
                Some(current) if current == refresh_token => {}
                Some(_) => {
                    debug!("Session replaced during renewal, keeping the newer session");
                    return Ok(());
                }
                None => {
                    debug!("Session cleared during renewal, discarding result");
                    return Err(AuthError::NoSession);
                }
            }
            match &result {
                Ok(tokens) => self.install_locked(&mut state, tokens),
                Err(_) => self.clear_locked(&mut state),
            }
        }

        match result {
            Ok(tokens) => {
                info!(expires_at = %tokens.access.expires, "Session renewed");
                self.schedule_renewal(true);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Session renewal failed, session cleared");
                Err(AuthError::RenewalFailed(e.message()))
            }
        }
    }

    /// Schedule a background renewal ahead of expiry, replacing any pending one.
    pub fn arm_proactive_renewal(self: &Arc<Self>) {
        self.schedule_renewal(false);
    }

    /// Wait until `proactive_lead` before expiry. Right after a renewal a
    /// token that lives shorter than the lead waits for the staleness
    /// margin instead, and never less than `MIN_REARM_SECONDS`.
    fn renewal_delay(&self, remaining: Duration, after_renewal: bool) -> StdDuration {
        let ahead_of_lead = (remaining - self.settings.proactive_lead)
            .to_std()
            .unwrap_or(StdDuration::ZERO);
        if !after_renewal || !ahead_of_lead.is_zero() {
            return ahead_of_lead;
        }
        let ahead_of_margin = (remaining - self.settings.staleness_margin)
            .to_std()
            .unwrap_or(StdDuration::ZERO);
        ahead_of_margin.max(StdDuration::from_secs(MIN_REARM_SECONDS))
    }

    fn schedule_renewal(self: &Arc<Self>, after_renewal: bool) {
        self.timer.disarm();

        let Some(remaining) = self.time_until_expiry() else {
            debug!("No expiry known, proactive renewal not armed");
            return;
        };
        let delay = self.renewal_delay(remaining, after_renewal);

        let manager = Arc::downgrade(self);
        self.timer.arm(delay, async move {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            debug!("Proactive renewal firing");
            if let Err(e) = manager.renew().await {
                error!(error = %e, "Background session renewal failed");
            }
        });
        debug!(delay_secs = delay.as_secs(), "Proactive renewal scheduled");
    }

    pub fn disarm_proactive_renewal(&self) {
        self.timer.disarm();
    }

    pub fn is_renewal_armed(&self) -> bool {
        self.timer.is_armed()
    }

    // ===== Lifecycle =====

    /// Forget the session everywhere. Safe to call repeatedly.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        self.clear_locked(&mut state);
        debug!("Session cleared");
    }

    /// Memory is emptied first and stays empty even if the store
    /// cannot be cleaned up.
    fn clear_locked(&self, state: &mut SessionState) {
        self.timer.disarm();
        *state = SessionState::cleared();
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, EXPIRY_KEY] {
            if let Err(e) = self.store.remove(key) {
                warn!(key, error = %e, "Failed to remove session value");
            }
        }
    }

    /// Recover a persisted session at startup.
    pub async fn initialize(self: &Arc<Self>) -> SessionStatus {
        let access = self.access_token();
        let refresh = self.refresh_token();
        if access.is_none() || refresh.is_none() {
            if access.is_some() || refresh.is_some() {
                warn!("Persisted session is missing a token, clearing");
                self.clear();
            }
            return SessionStatus::NoSession(None);
        }

        if self.expires_at().is_none() {
            warn!("Persisted session has no expiry, clearing");
            self.clear();
            return SessionStatus::NoSession(None);
        }

        if self.is_stale() {
            info!("Persisted session is stale, renewing");
            return match self.renew().await {
                Ok(()) => SessionStatus::Restored,
                Err(e) => {
                    self.clear();
                    SessionStatus::NoSession(Some(e))
                }
            };
        }

        self.arm_proactive_renewal();
        info!("Session restored");
        SessionStatus::Restored
    }

    /// Authenticate and start a new session.
    pub async fn login(self: &Arc<Self>, email: &str, password: &str) -> Result<User, AuthError> {
        let response = self.api.login(email, password).await?;
        self.install(&response.tokens);
        self.arm_proactive_renewal();
        info!(user = %response.user.email, "Logged in");
        Ok(response.user)
    }

    /// Revoke the refresh token server-side (best effort) and clear.
    pub async fn logout(&self) {
        self.timer.disarm();
        if let Some(refresh_token) = self.refresh_token() {
            if let Err(e) = self.api.logout(&refresh_token).await {
                warn!(error = %e, "Server-side logout failed");
            }
        }
        self.clear();
        info!("Logged out");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::manual::ManualClock;
    use crate::auth::store::MemoryStore;
    use mockito::{Matcher, Mock, ServerGuard};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        server: ServerGuard,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        manager: Arc<SessionManager>,
    }

    async fn harness() -> Harness {
        let server = mockito::Server::new_async().await;
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = manager_on(&server.url(), &store, &clock);
        Harness {
            server,
            store,
            clock,
            manager,
        }
    }

    fn manager_on(
        url: &str,
        store: &Arc<MemoryStore>,
        clock: &Arc<ManualClock>,
    ) -> Arc<SessionManager> {
        SessionManager::with_options(
            ApiClient::new(url).unwrap(),
            Arc::clone(store) as Arc<dyn TokenStore>,
            Arc::clone(clock) as Arc<dyn Clock>,
            SessionSettings::default(),
        )
    }

    fn envelope(access: &str, refresh: &str, expires: DateTime<Utc>) -> String {
        json!({
            "access": {"token": access, "expires": expires.to_rfc3339()},
            "refresh": {"token": refresh, "expires": (expires + Duration::days(30)).to_rfc3339()}
        })
        .to_string()
    }

    async fn refresh_mock(h: &mut Harness, refresh: &str, hits: usize) -> Mock {
        refresh_mock_lasting(h, refresh, hits, Duration::hours(1)).await
    }

    async fn refresh_mock_lasting(
        h: &mut Harness,
        refresh: &str,
        hits: usize,
        lifetime: Duration,
    ) -> Mock {
        let expires = h.clock.now() + lifetime;
        h.server
            .mock("POST", "/auth/refresh-tokens")
            .match_body(Matcher::Json(json!({"refreshToken": refresh})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(envelope("A2", "R2", expires))
            .expect(hits)
            .create_async()
            .await
    }

    async fn rejecting_refresh_mock(h: &mut Harness) -> Mock {
        h.server
            .mock("POST", "/auth/refresh-tokens")
            .with_status(401)
            .with_body(r#"{"code":401,"message":"Please authenticate"}"#)
            .create_async()
            .await
    }

    /// Refresh endpoint that answers only once `release` is signalled.
    /// `arrived` flips when the request reaches the server.
    async fn held_refresh_mock(
        h: &mut Harness,
    ) -> (Mock, Arc<AtomicBool>, std::sync::mpsc::Sender<()>) {
        let arrived = Arc::new(AtomicBool::new(false));
        let (release, held) = std::sync::mpsc::channel::<()>();
        let held = std::sync::Mutex::new(held);
        let body = envelope("A2", "R2", h.clock.now() + Duration::hours(1));
        let seen = Arc::clone(&arrived);
        let mock = h
            .server
            .mock("POST", "/auth/refresh-tokens")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body_from_request(move |_| {
                seen.store(true, Ordering::SeqCst);
                let _ = held.lock().unwrap().recv_timeout(StdDuration::from_secs(5));
                body.clone().into_bytes()
            })
            .create_async()
            .await;
        (mock, arrived, release)
    }

    /// Store whose removals always fail.
    #[derive(Default)]
    struct StickyStore {
        inner: MemoryStore,
    }

    impl TokenStore for StickyStore {
        fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.inner.set(key, value)
        }

        fn remove(&self, _key: &str) -> anyhow::Result<()> {
            anyhow::bail!("keychain locked")
        }
    }

    fn seed(h: &Harness, expires_in: Duration) {
        h.manager.set_credentials("A1", "R1");
        h.manager.set_expiry(h.clock.now() + expires_in);
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        condition()
    }

    // -------------------------------------------------------------------------
    // Storage
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_credentials_survive_restart() {
        let h = harness().await;
        h.manager.set_credentials("A1", "R1");
        let expiry = h.clock.now() + Duration::hours(1);
        h.manager.set_expiry(expiry);
        assert_eq!(h.manager.access_token().as_deref(), Some("A1"));
        assert_eq!(h.manager.refresh_token().as_deref(), Some("R1"));

        // A new manager over the same store only has the durable copy
        let restarted = manager_on(&h.server.url(), &h.store, &h.clock);
        assert_eq!(restarted.access_token().as_deref(), Some("A1"));
        assert_eq!(restarted.refresh_token().as_deref(), Some("R1"));
        assert_eq!(
            restarted.expires_at().map(|at| at.timestamp()),
            Some(expiry.timestamp())
        );
    }

    #[tokio::test]
    async fn test_persisted_layout_uses_known_keys() {
        let h = harness().await;
        seed(&h, Duration::hours(1));
        assert_eq!(h.store.get("access_token").unwrap().as_deref(), Some("A1"));
        assert_eq!(h.store.get("refresh_token").unwrap().as_deref(), Some("R1"));
        let raw = h.store.get("access_token_expiry").unwrap().unwrap();
        assert!(DateTime::parse_from_rfc3339(&raw).is_ok());
    }

    #[tokio::test]
    async fn test_unparseable_persisted_expiry_reads_as_absent() {
        let h = harness().await;
        h.store.set(EXPIRY_KEY, "yesterday-ish").unwrap();
        assert_eq!(h.manager.expires_at(), None);
        assert!(h.manager.is_stale());
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let h = harness().await;
        seed(&h, Duration::hours(1));

        h.manager.clear();
        h.manager.clear();

        assert_eq!(h.manager.access_token(), None);
        assert_eq!(h.manager.refresh_token(), None);
        assert_eq!(h.manager.expires_at(), None);
        assert_eq!(h.store.get(ACCESS_TOKEN_KEY).unwrap(), None);
        assert!(!h.manager.is_renewal_armed());
    }

    #[tokio::test]
    async fn test_clear_is_final_when_store_removal_fails() {
        let server = mockito::Server::new_async().await;
        let store = Arc::new(StickyStore::default());
        let manager = SessionManager::with_options(
            ApiClient::new(&server.url()).unwrap(),
            Arc::clone(&store) as Arc<dyn TokenStore>,
            Arc::new(ManualClock::new(Utc::now())),
            SessionSettings::default(),
        );
        manager.set_credentials("A1", "R1");
        manager.set_expiry(Utc::now() + Duration::hours(1));

        manager.clear();

        // The durable copy is still there, but memory does not go back to it
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("A1"));
        assert_eq!(manager.access_token(), None);
        assert_eq!(manager.refresh_token(), None);
        assert_eq!(manager.expires_at(), None);
        assert!(matches!(manager.ensure_fresh().await, Err(AuthError::NoSession)));
    }

    #[tokio::test]
    async fn test_store_is_read_once() {
        let h = harness().await;
        assert_eq!(h.manager.access_token(), None);

        // Written behind the manager's back after the first load
        h.store.set(ACCESS_TOKEN_KEY, "A1").unwrap();
        h.store.set(REFRESH_TOKEN_KEY, "R1").unwrap();

        assert_eq!(h.manager.access_token(), None);
        assert_eq!(h.manager.refresh_token(), None);
    }

    // -------------------------------------------------------------------------
    // Staleness
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_is_stale_without_expiry() {
        let h = harness().await;
        h.manager.set_credentials("A1", "R1");
        assert!(h.manager.is_stale());
    }

    #[tokio::test]
    async fn test_is_stale_margin_boundary_is_inclusive() {
        let h = harness().await;
        h.manager.set_credentials("A1", "R1");

        h.manager.set_expiry(h.clock.now() + Duration::minutes(5));
        assert!(h.manager.is_stale());

        h.manager.set_expiry(h.clock.now() + Duration::minutes(5) + Duration::seconds(1));
        assert!(!h.manager.is_stale());

        h.manager.set_expiry(h.clock.now() + Duration::minutes(4));
        assert!(h.manager.is_stale());

        h.manager.set_expiry(h.clock.now() - Duration::minutes(1));
        assert!(h.manager.is_stale());
    }

    // -------------------------------------------------------------------------
    // ensure_fresh / renew
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_ensure_fresh_without_session() {
        let h = harness().await;
        assert!(matches!(h.manager.ensure_fresh().await, Err(AuthError::NoSession)));

        h.manager.set_expiry(h.clock.now() + Duration::hours(1));
        assert!(matches!(h.manager.ensure_fresh().await, Err(AuthError::NoSession)));
    }

    #[tokio::test]
    async fn test_ensure_fresh_skips_renewal_when_fresh() {
        let mut h = harness().await;
        let mock = refresh_mock(&mut h, "R1", 0).await;
        seed(&h, Duration::minutes(6));

        h.manager.ensure_fresh().await.unwrap();

        mock.assert_async().await;
        assert_eq!(h.manager.access_token().as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn test_ensure_fresh_renews_stale_token_once() {
        let mut h = harness().await;
        let mock = refresh_mock(&mut h, "R1", 1).await;
        seed(&h, Duration::minutes(4));

        h.manager.ensure_fresh().await.unwrap();
        // Now fresh, so a second call must not renew again
        h.manager.ensure_fresh().await.unwrap();

        mock.assert_async().await;
        assert_eq!(h.manager.access_token().as_deref(), Some("A2"));
        assert_eq!(h.manager.refresh_token().as_deref(), Some("R2"));
        assert!(!h.manager.is_stale());
        assert!(h.manager.is_renewal_armed());
    }

    #[tokio::test]
    async fn test_clock_advance_crosses_margin() {
        let mut h = harness().await;
        let mock = refresh_mock(&mut h, "R1", 1).await;
        seed(&h, Duration::seconds(3600));

        h.manager.ensure_fresh().await.unwrap();
        assert_eq!(h.manager.access_token().as_deref(), Some("A1"));

        // 305s remaining: still outside the 5 minute margin
        h.clock.advance(Duration::seconds(3295));
        assert!(!h.manager.is_stale());
        h.manager.ensure_fresh().await.unwrap();
        assert_eq!(h.manager.access_token().as_deref(), Some("A1"));

        // 5s remaining
        h.clock.advance(Duration::seconds(300));
        assert!(h.manager.is_stale());
        h.manager.ensure_fresh().await.unwrap();

        mock.assert_async().await;
        assert_eq!(h.manager.access_token().as_deref(), Some("A2"));
    }

    #[tokio::test]
    async fn test_failed_renewal_clears_session() {
        let mut h = harness().await;
        let _mock = rejecting_refresh_mock(&mut h).await;
        seed(&h, Duration::hours(1));
        h.manager.arm_proactive_renewal();
        assert!(h.manager.is_renewal_armed());
        h.manager.set_expiry(h.clock.now() + Duration::minutes(2));

        let err = h.manager.ensure_fresh().await.unwrap_err();

        assert!(matches!(err, AuthError::RenewalFailed(ref m) if m == "Please authenticate"));
        assert!(err.requires_login());
        assert_eq!(h.manager.access_token(), None);
        assert_eq!(h.manager.refresh_token(), None);
        assert_eq!(h.store.get(REFRESH_TOKEN_KEY).unwrap(), None);
        assert!(!h.manager.is_renewal_armed());

        // Terminated session fails fast afterwards
        assert!(matches!(h.manager.ensure_fresh().await, Err(AuthError::NoSession)));
    }

    #[tokio::test]
    async fn test_malformed_renewal_envelope_clears_session() {
        let mut h = harness().await;
        let _mock = h
            .server
            .mock("POST", "/auth/refresh-tokens")
            .with_status(200)
            .with_body(r#"{"tokens": {"access": {"token": "A2"}}}"#)
            .create_async()
            .await;
        seed(&h, Duration::minutes(1));

        let err = h.manager.renew().await.unwrap_err();

        assert!(matches!(err, AuthError::RenewalFailed(_)));
        assert_eq!(h.manager.access_token(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_clear_during_renewal_discards_late_result() {
        let mut h = harness().await;
        let (mock, arrived, release) = held_refresh_mock(&mut h).await;
        seed(&h, Duration::minutes(1));

        let manager = Arc::clone(&h.manager);
        let renewal = tokio::spawn(async move { manager.renew().await });
        assert!(wait_for(|| arrived.load(Ordering::SeqCst)).await);

        h.manager.clear();
        release.send(()).unwrap();

        assert!(matches!(renewal.await.unwrap(), Err(AuthError::NoSession)));
        mock.assert_async().await;
        assert_eq!(h.manager.access_token(), None);
        assert_eq!(h.store.get(ACCESS_TOKEN_KEY).unwrap(), None);
        assert_eq!(h.store.get(REFRESH_TOKEN_KEY).unwrap(), None);
        assert!(!h.manager.is_renewal_armed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_login_during_renewal_keeps_new_session() {
        let mut h = harness().await;
        let (_mock, arrived, release) = held_refresh_mock(&mut h).await;
        seed(&h, Duration::minutes(1));

        let manager = Arc::clone(&h.manager);
        let renewal = tokio::spawn(async move { manager.renew().await });
        assert!(wait_for(|| arrived.load(Ordering::SeqCst)).await);

        h.manager.clear();
        h.manager.set_credentials("A9", "R9");
        release.send(()).unwrap();

        renewal.await.unwrap().unwrap();
        assert_eq!(h.manager.access_token().as_deref(), Some("A9"));
        assert_eq!(h.manager.refresh_token().as_deref(), Some("R9"));
        assert_eq!(h.store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R9"));
    }

    #[tokio::test]
    async fn test_concurrent_renewals_share_one_call() {
        let mut h = harness().await;
        let mock = refresh_mock(&mut h, "R1", 1).await;
        seed(&h, Duration::minutes(1));

        let (first, second) = tokio::join!(h.manager.renew(), h.manager.renew());

        first.unwrap();
        second.unwrap();
        mock.assert_async().await;
        assert_eq!(h.manager.access_token().as_deref(), Some("A2"));
    }

    // -------------------------------------------------------------------------
    // Proactive renewal
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_proactive_renewal_fires_and_rearms() {
        let mut h = harness().await;
        let mock = refresh_mock(&mut h, "R1", 1).await;
        // Inside the 15 minute lead: fires right away
        seed(&h, Duration::minutes(10));

        h.manager.arm_proactive_renewal();

        let manager = Arc::clone(&h.manager);
        assert!(wait_for(|| manager.access_token().as_deref() == Some("A2")).await);
        mock.assert_async().await;
        assert!(h.manager.is_renewal_armed());
    }

    #[tokio::test]
    async fn test_short_lived_tokens_do_not_renew_back_to_back() {
        let mut h = harness().await;
        // Every renewal hands out a token shorter than the 15 minute lead
        let mock = refresh_mock_lasting(&mut h, "R1", 1, Duration::minutes(10)).await;
        seed(&h, Duration::minutes(10));

        h.manager.arm_proactive_renewal();

        let manager = Arc::clone(&h.manager);
        assert!(wait_for(|| manager.access_token().as_deref() == Some("A2")).await);
        tokio::time::sleep(StdDuration::from_millis(300)).await;
        mock.assert_async().await;
        assert!(h.manager.is_renewal_armed());
    }

    #[tokio::test]
    async fn test_renewal_delay() {
        let h = harness().await;
        let m = &h.manager;

        // Before a renewal: lead point, or at once when already inside it
        assert_eq!(m.renewal_delay(Duration::minutes(60), false), StdDuration::from_secs(45 * 60));
        assert_eq!(m.renewal_delay(Duration::minutes(10), false), StdDuration::ZERO);

        // After a renewal the same token waits for the staleness margin
        assert_eq!(m.renewal_delay(Duration::minutes(60), true), StdDuration::from_secs(45 * 60));
        assert_eq!(m.renewal_delay(Duration::minutes(10), true), StdDuration::from_secs(5 * 60));
        assert_eq!(
            m.renewal_delay(Duration::minutes(2), true),
            StdDuration::from_secs(MIN_REARM_SECONDS)
        );
    }

    #[tokio::test]
    async fn test_background_renewal_failure_clears_without_rearming() {
        let mut h = harness().await;
        let _mock = rejecting_refresh_mock(&mut h).await;
        seed(&h, Duration::minutes(10));

        h.manager.arm_proactive_renewal();

        let manager = Arc::clone(&h.manager);
        assert!(wait_for(|| manager.refresh_token().is_none()).await);
        assert!(!h.manager.is_renewal_armed());
        assert!(matches!(h.manager.ensure_fresh().await, Err(AuthError::NoSession)));
    }

    #[tokio::test]
    async fn test_disarmed_timer_never_fires() {
        let mut h = harness().await;
        let mock = refresh_mock(&mut h, "R1", 0).await;
        seed(&h, Duration::minutes(15) + Duration::milliseconds(200));

        h.manager.arm_proactive_renewal();
        assert!(h.manager.is_renewal_armed());
        h.manager.disarm_proactive_renewal();
        h.manager.disarm_proactive_renewal();

        tokio::time::sleep(StdDuration::from_millis(500)).await;
        mock.assert_async().await;
        assert_eq!(h.manager.access_token().as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn test_arming_without_expiry_leaves_timer_disarmed() {
        let h = harness().await;
        h.manager.set_credentials("A1", "R1");
        h.manager.arm_proactive_renewal();
        assert!(!h.manager.is_renewal_armed());
    }

    // -------------------------------------------------------------------------
    // initialize / login / logout
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_initialize_without_tokens() {
        let h = harness().await;
        assert!(matches!(h.manager.initialize().await, SessionStatus::NoSession(None)));
    }

    #[tokio::test]
    async fn test_initialize_clears_half_pair() {
        let h = harness().await;
        h.store.set(ACCESS_TOKEN_KEY, "A1").unwrap();

        assert!(matches!(h.manager.initialize().await, SessionStatus::NoSession(None)));
        assert_eq!(h.store.get(ACCESS_TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_initialize_treats_missing_expiry_as_corrupt() {
        let h = harness().await;
        h.manager.set_credentials("A1", "R1");
        let restarted = manager_on(&h.server.url(), &h.store, &h.clock);

        assert!(matches!(restarted.initialize().await, SessionStatus::NoSession(None)));
        assert_eq!(restarted.access_token(), None);
        assert_eq!(h.store.get(REFRESH_TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_initialize_restores_fresh_session() {
        let mut h = harness().await;
        let mock = refresh_mock(&mut h, "R1", 0).await;
        seed(&h, Duration::hours(1));
        let restarted = manager_on(&h.server.url(), &h.store, &h.clock);

        let status = restarted.initialize().await;

        assert!(status.is_restored());
        assert!(restarted.is_renewal_armed());
        assert_eq!(restarted.access_token().as_deref(), Some("A1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_initialize_renews_stale_session() {
        let mut h = harness().await;
        let mock = refresh_mock(&mut h, "R1", 1).await;
        seed(&h, Duration::minutes(3));
        let restarted = manager_on(&h.server.url(), &h.store, &h.clock);

        assert!(restarted.initialize().await.is_restored());
        mock.assert_async().await;
        assert_eq!(restarted.access_token().as_deref(), Some("A2"));
        assert!(restarted.is_renewal_armed());
    }

    #[tokio::test]
    async fn test_initialize_reports_failed_renewal() {
        let mut h = harness().await;
        let _mock = rejecting_refresh_mock(&mut h).await;
        seed(&h, Duration::minutes(3));
        let restarted = manager_on(&h.server.url(), &h.store, &h.clock);

        let status = restarted.initialize().await;

        assert!(matches!(status, SessionStatus::NoSession(Some(AuthError::RenewalFailed(_)))));
        assert_eq!(restarted.refresh_token(), None);
        assert_eq!(h.store.get(ACCESS_TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_login_installs_session_and_arms_timer() {
        let mut h = harness().await;
        let expires = h.clock.now() + Duration::hours(1);
        let body = json!({
            "user": {"id": "u1", "email": "a@b.c", "name": "Ada"},
            "tokens": serde_json::from_str::<serde_json::Value>(&envelope("A1", "R1", expires)).unwrap()
        });
        let _mock = h
            .server
            .mock("POST", "/auth/login")
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let user = h.manager.login("a@b.c", "pw").await.unwrap();

        assert_eq!(user.display_name(), "Ada");
        assert_eq!(h.manager.access_token().as_deref(), Some("A1"));
        assert_eq!(h.manager.refresh_token().as_deref(), Some("R1"));
        assert!(!h.manager.is_stale());
        assert!(h.manager.is_renewal_armed());
    }

    #[tokio::test]
    async fn test_login_failure_keeps_state_untouched() {
        let mut h = harness().await;
        let _mock = h
            .server
            .mock("POST", "/auth/login")
            .with_status(401)
            .with_body(r#"{"message":"Incorrect email or password"}"#)
            .create_async()
            .await;

        let err = h.manager.login("a@b.c", "bad").await.unwrap_err();

        assert!(matches!(err, AuthError::Api(ref e) if e.message() == "Incorrect email or password"));
        assert_eq!(h.manager.access_token(), None);
    }

    #[tokio::test]
    async fn test_logout_revokes_and_clears() {
        let mut h = harness().await;
        let mock = h
            .server
            .mock("POST", "/auth/logout")
            .match_body(Matcher::Json(json!({"refreshToken": "R1"})))
            .with_status(204)
            .create_async()
            .await;
        seed(&h, Duration::hours(1));
        h.manager.arm_proactive_renewal();

        h.manager.logout().await;

        mock.assert_async().await;
        assert_eq!(h.manager.access_token(), None);
        assert!(!h.manager.is_renewal_armed());
    }

    #[tokio::test]
    async fn test_logout_clears_even_when_server_fails() {
        let mut h = harness().await;
        let _mock = h
            .server
            .mock("POST", "/auth/logout")
            .with_status(500)
            .create_async()
            .await;
        seed(&h, Duration::hours(1));

        h.manager.logout().await;

        assert_eq!(h.manager.refresh_token(), None);
    }
}
