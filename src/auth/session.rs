//! OAuth2 PKCE + email MFA session
//!
//! [`AuthSession`] owns the token set for one account. The login handshake is
//! split into two calls because the second factor arrives out of band:
//! [`AuthSession::begin_login`] runs everything up to the email dispatch and
//! [`AuthSession::submit_mfa_code`] finishes it. Afterwards
//! [`AuthSession::get_valid_token`] hands out access tokens, refreshing them
//! at most once no matter how many callers ask concurrently.

use crate::auth::endpoints::AccountsClient;
use crate::auth::pkce::Pkce;
use crate::auth::token::{TokenSet, TokenStore};
use crate::config::AuthSection;
use crate::error::{BridgeError, BridgeResult};
use crate::transport::{AccessGrant, TokenProvider};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, instrument, warn, Instrument};

/// Digits in an emailed verification code
pub const MFA_CODE_LENGTH: usize = 6;

const REFRESH_ATTEMPTS: u32 = 3;
const REFRESH_BASE_DELAY: Duration = Duration::from_millis(250);

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    AwaitingMfa,
    Authenticated,
    Refreshing,
    /// The refresh token was rejected; only a new login recovers
    Expired,
}

/// Login input supplied by the host. Never persisted.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub installation_id: Option<String>,
}

impl Credentials {
    pub fn new<E: Into<String>, P: Into<String>>(email: E, password: P) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            installation_id: None,
        }
    }

    pub fn with_installation<S: Into<String>>(mut self, installation_id: S) -> Self {
        self.installation_id = Some(installation_id.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"***")
            .field("installation_id", &self.installation_id)
            .finish()
    }
}

/// Outstanding second-factor challenge
#[derive(Debug, Clone, PartialEq)]
pub struct MfaChallenge {
    pub challenge_id: String,
    /// Codes submitted at or after this instant are rejected as expired
    pub deadline: DateTime<Utc>,
    pub code_length: usize,
    /// Masked address the code was sent to
    pub destination: String,
}

impl MfaChallenge {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}

/// Handshake data kept between the two login calls
#[derive(Debug)]
struct PendingLogin {
    challenge: MfaChallenge,
    pkce: Pkce,
    sub: String,
    track_id: String,
    status_id: String,
}

#[derive(Debug)]
struct SessionInner {
    state: AuthState,
    tokens: TokenStore,
    pending: Option<PendingLogin>,
}

impl SessionInner {
    /// State to fall back to after an aborted operation
    fn settle(&mut self) {
        self.state = if self.pending.is_some() {
            AuthState::AwaitingMfa
        } else if self.tokens.current().is_some() {
            AuthState::Authenticated
        } else if self.state == AuthState::Expired {
            AuthState::Expired
        } else {
            AuthState::Unauthenticated
        };
    }
}

/// Authentication session for a single account
///
/// Share it behind an `Arc`; every method takes `&self`.
pub struct AuthSession {
    accounts: AccountsClient,
    refresh_margin: Duration,
    mfa_timeout: Duration,
    default_medium_id: String,
    inner: RwLock<SessionInner>,
    refresh_lock: Mutex<()>,
    tokens_tx: watch::Sender<Option<TokenSet>>,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("refresh_margin", &self.refresh_margin)
            .field("mfa_timeout", &self.mfa_timeout)
            .finish_non_exhaustive()
    }
}

impl AuthSession {
    pub fn new(settings: &AuthSection) -> BridgeResult<Self> {
        Ok(Self {
            accounts: AccountsClient::new(settings)?,
            refresh_margin: settings.refresh_margin(),
            mfa_timeout: settings.mfa_timeout(),
            default_medium_id: settings.default_medium_id.clone(),
            inner: RwLock::new(SessionInner {
                state: AuthState::Unauthenticated,
                tokens: TokenStore::new(),
                pending: None,
            }),
            refresh_lock: Mutex::new(()),
            tokens_tx: watch::channel(None).0,
        })
    }

    /// Resume a session from a persisted token set
    pub async fn restore(&self, tokens: TokenSet) {
        let mut inner = self.inner.write().await;
        inner.tokens = TokenStore::with_tokens(tokens.clone());
        inner.pending = None;
        inner.state = AuthState::Authenticated;
        self.tokens_tx.send_replace(Some(tokens));
    }

    /// Follow the token set as logins, refreshes and expiry replace it
    pub fn watch_tokens(&self) -> watch::Receiver<Option<TokenSet>> {
        self.tokens_tx.subscribe()
    }

    pub async fn state(&self) -> AuthState {
        let state = self.inner.read().await.state;
        if state != AuthState::Refreshing {
            return state;
        }

        // Refreshing is only true while someone holds the refresh lock
        match self.refresh_lock.try_lock() {
            Ok(_idle) => {
                let mut inner = self.inner.write().await;
                if inner.state == AuthState::Refreshing {
                    inner.settle();
                }
                inner.state
            }
            Err(_) => state,
        }
    }

    /// Copy of the current token set, for host persistence
    pub async fn token_set(&self) -> Option<TokenSet> {
        self.inner.read().await.tokens.current().cloned()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner
            .read()
            .await
            .tokens
            .current()
            .map(|t| t.access_token.clone())
    }

    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().await.tokens.current().map(|t| t.expires_at)
    }

    /// The challenge awaiting a code, if any
    pub async fn pending_challenge(&self) -> Option<MfaChallenge> {
        self.inner
            .read()
            .await
            .pending
            .as_ref()
            .map(|p| p.challenge.clone())
    }

    /// Run the password step and trigger the email code
    ///
    /// Any challenge from an earlier call is discarded first.
    #[instrument(skip(self, credentials), fields(email = %credentials.email))]
    pub async fn begin_login(&self, credentials: &Credentials) -> BridgeResult<MfaChallenge> {
        {
            let mut inner = self.inner.write().await;
            if inner.pending.take().is_some() {
                debug!("Replacing outstanding MFA challenge");
            }
            inner.settle();
        }

        let step = self
            .run_password_step(credentials)
            .instrument(crate::auth_span!(step = "password"));

        match step.await {
            Ok(pending) => {
                let challenge = pending.challenge.clone();
                let mut inner = self.inner.write().await;
                inner.pending = Some(pending);
                inner.state = AuthState::AwaitingMfa;
                info!(
                    challenge_id = %challenge.challenge_id,
                    destination = %challenge.destination,
                    "MFA code dispatched"
                );
                Ok(challenge)
            }
            Err(e) => {
                warn!(error = %e, "Login attempt failed");
                self.inner.write().await.settle();
                Err(e)
            }
        }
    }

    async fn run_password_step(&self, credentials: &Credentials) -> BridgeResult<PendingLogin> {
        let pkce = Pkce::generate();
        let request_id = self.accounts.authorize(&pkce).await?;
        debug!("Authorization request accepted");

        let redirect = self
            .accounts
            .login(&request_id, &credentials.email, &credentials.password)
            .await?;

        let medium_id = match self.accounts.configured_email_medium(&redirect.sub).await {
            Some(id) => id,
            None => self.default_medium_id.clone(),
        };

        let delivery = self
            .accounts
            .initiate_email(&redirect.sub, &medium_id, &redirect.request_id)
            .await?;

        Ok(PendingLogin {
            challenge: MfaChallenge {
                challenge_id: delivery.exchange_id,
                deadline: Utc::now() + to_chrono(self.mfa_timeout),
                code_length: MFA_CODE_LENGTH,
                destination: delivery.medium_text,
            },
            pkce,
            sub: redirect.sub,
            track_id: redirect.track_id,
            status_id: delivery.status_id,
        })
    }

    /// Finish the login with the emailed code
    #[instrument(skip(self, code))]
    pub async fn submit_mfa_code(&self, challenge_id: &str, code: &str) -> BridgeResult<TokenSet> {
        let (sub, track_id, status_id, verifier) = {
            let mut inner = self.inner.write().await;
            let pending = match inner.pending.as_ref() {
                Some(p) if p.challenge.challenge_id == challenge_id => p,
                _ => {
                    return Err(BridgeError::authorization_failed(format!(
                        "no outstanding challenge {challenge_id}"
                    )))
                }
            };

            if pending.challenge.is_expired(Utc::now()) {
                inner.pending = None;
                inner.settle();
                return Err(BridgeError::MfaExpired {
                    challenge_id: challenge_id.to_string(),
                });
            }

            if !is_well_formed_code(code, pending.challenge.code_length) {
                return Err(BridgeError::mfa_invalid(format!(
                    "expected {} digits",
                    pending.challenge.code_length
                )));
            }

            (
                pending.sub.clone(),
                pending.track_id.clone(),
                pending.status_id.clone(),
                pending.pkce.verifier.clone(),
            )
        };

        // A rejected code leaves the challenge in place for another try
        self.accounts
            .verify_email_code(&sub, challenge_id, code)
            .await?;

        let result = async {
            let auth_code = self
                .accounts
                .continue_login(&track_id, &status_id, &sub)
                .await?;
            let response = self.accounts.exchange_code(&auth_code, &verifier).await?;
            TokenSet::from_response(response, None, Utc::now())
        }
        .await;

        let mut inner = self.inner.write().await;
        if inner
            .pending
            .as_ref()
            .is_some_and(|p| p.challenge.challenge_id == challenge_id)
        {
            inner.pending = None;
        }

        match result {
            Ok(tokens) => {
                inner.tokens.replace(tokens.clone());
                inner.state = AuthState::Authenticated;
                self.tokens_tx.send_replace(Some(tokens.clone()));
                info!(expires_at = %tokens.expires_at, "Login completed");
                Ok(tokens)
            }
            Err(e) => {
                inner.settle();
                Err(e)
            }
        }
    }

    /// Current access token, refreshed first when it is near expiry
    pub async fn get_valid_token(&self) -> BridgeResult<String> {
        self.valid_grant().await.map(|grant| grant.access_token)
    }

    async fn fresh_grant(&self) -> Option<AccessGrant> {
        let inner = self.inner.read().await;
        inner
            .tokens
            .fresh_tokens(Utc::now(), self.refresh_margin)
            .map(AccessGrant::from)
    }

    async fn valid_grant(&self) -> BridgeResult<AccessGrant> {
        if let Some(grant) = self.fresh_grant().await {
            return Ok(grant);
        }

        let _guard = self.refresh_lock.lock().await;

        // Whoever held the lock before us may already have refreshed
        if let Some(grant) = self.fresh_grant().await {
            debug!("Reusing token refreshed by concurrent caller");
            return Ok(grant);
        }

        let (refresh_token, remaining) = {
            let mut inner = self.inner.write().await;
            let Some(current) = inner.tokens.current() else {
                return Err(BridgeError::session_expired("no session established"));
            };
            let pair = (
                current.refresh_token.clone(),
                current.remaining(Utc::now()).num_seconds(),
            );
            inner.state = AuthState::Refreshing;
            pair
        };
        let guard = RefreshGuard {
            inner: &self.inner,
            armed: true,
        };

        info!(remaining_secs = remaining, "Refreshing access token");
        let result = self
            .refresh_with_retry(&refresh_token)
            .instrument(crate::auth_span!(step = "refresh"))
            .await;
        guard.disarm();

        let mut inner = self.inner.write().await;
        match result {
            Ok(tokens) => {
                let grant = AccessGrant::from(&tokens);
                debug!(expires_at = %tokens.expires_at, "Access token refreshed");
                self.tokens_tx.send_replace(Some(tokens.clone()));
                inner.tokens.replace(tokens);
                inner.state = AuthState::Authenticated;
                Ok(grant)
            }
            Err(e @ BridgeError::SessionExpired { .. }) => {
                inner.tokens.clear();
                inner.state = AuthState::Expired;
                self.tokens_tx.send_replace(None);
                Err(e)
            }
            Err(e) => {
                inner.settle();
                Err(e)
            }
        }
    }

    async fn refresh_with_retry(&self, refresh_token: &str) -> BridgeResult<TokenSet> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match self.accounts.refresh(refresh_token).await {
                Ok(response) => TokenSet::from_response(response, Some(refresh_token), Utc::now()),
                Err(e) => Err(e),
            };

            match outcome {
                Err(e) if e.is_transient() && attempt < REFRESH_ATTEMPTS => {
                    let delay = REFRESH_BASE_DELAY * 2u32.pow(attempt - 1);
                    warn!(attempt, ?delay, error = %e, "Token refresh failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Check a token against the introspection endpoint
    pub async fn introspect(&self, token: &str) -> BridgeResult<()> {
        if self.accounts.introspect(token).await? {
            Ok(())
        } else {
            Err(BridgeError::session_expired("token reported inactive"))
        }
    }
}

/// Settles the state when a refresh is cancelled before it completes
struct RefreshGuard<'a> {
    inner: &'a RwLock<SessionInner>,
    armed: bool,
}

impl RefreshGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // A contended lock is left to `AuthSession::state`
        if let Ok(mut inner) = self.inner.try_write() {
            if inner.state == AuthState::Refreshing {
                warn!("Token refresh abandoned");
                inner.settle();
            }
        }
    }
}

fn is_well_formed_code(code: &str, length: usize) -> bool {
    code.len() == length && code.bytes().all(|b| b.is_ascii_digit())
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}

#[async_trait::async_trait]
impl TokenProvider for AuthSession {
    async fn access_grant(&self) -> BridgeResult<AccessGrant> {
        self.valid_grant().await
    }

    async fn verify_grant(&self, grant: &AccessGrant) -> BridgeResult<()> {
        self.introspect(&grant.access_token).await
    }
}
