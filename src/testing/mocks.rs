//! Mock implementations for testing
//!
//! [`MockTokenProvider`] stands in for [`crate::auth::AuthSession`] behind the
//! [`TokenProvider`] seam and records how often it was asked.

use crate::error::{BridgeError, BridgeResult};
use crate::transport::{AccessGrant, TokenProvider};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// How the next scripted call should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantFailure {
    SessionExpired,
    Network,
}

impl GrantFailure {
    fn into_error(self) -> BridgeError {
        match self {
            Self::SessionExpired => BridgeError::session_expired("mock session expired"),
            Self::Network => BridgeError::network("mock accounts service unreachable"),
        }
    }
}

/// Token provider with scripted grants and failures
#[derive(Debug)]
pub struct MockTokenProvider {
    grant: Mutex<AccessGrant>,
    queued_failures: Mutex<VecDeque<GrantFailure>>,
    queued_verify_failures: Mutex<VecDeque<GrantFailure>>,
    always_fail: Mutex<Option<GrantFailure>>,
    expire_after: Mutex<Option<usize>>,
    active: AtomicBool,
    grant_calls: AtomicUsize,
    verify_calls: AtomicUsize,
}

impl Default for MockTokenProvider {
    fn default() -> Self {
        Self::with_grant("mock-access-token", "mock-sid")
    }
}

impl MockTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grant(access_token: &str, sid: &str) -> Self {
        Self {
            grant: Mutex::new(AccessGrant {
                access_token: access_token.to_string(),
                sid: sid.to_string(),
            }),
            queued_failures: Mutex::new(VecDeque::new()),
            queued_verify_failures: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(None),
            expire_after: Mutex::new(None),
            active: AtomicBool::new(true),
            grant_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
        }
    }

    /// Replace the grant handed out from now on
    pub fn rotate(&self, access_token: &str, sid: &str) {
        *lock(&self.grant) = AccessGrant {
            access_token: access_token.to_string(),
            sid: sid.to_string(),
        };
    }

    /// Fail the next call only
    pub fn fail_next_grant(&self, failure: GrantFailure) {
        lock(&self.queued_failures).push_back(failure);
    }

    /// Fail every call until cleared
    pub fn fail_grants_with_session_expired(&self) {
        *lock(&self.always_fail) = Some(GrantFailure::SessionExpired);
    }

    /// Hand out `successes` grants, then report the session expired
    pub fn expire_after(&self, successes: usize) {
        *lock(&self.expire_after) = Some(successes);
    }

    /// Fail the next introspection only
    pub fn fail_next_verify(&self, failure: GrantFailure) {
        lock(&self.queued_verify_failures).push_back(failure);
    }

    pub fn clear_failures(&self) {
        *lock(&self.always_fail) = None;
        *lock(&self.expire_after) = None;
        lock(&self.queued_failures).clear();
        lock(&self.queued_verify_failures).clear();
    }

    /// Result of introspection for every grant
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn grant_calls(&self) -> usize {
        self.grant_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for MockTokenProvider {
    async fn access_grant(&self) -> BridgeResult<AccessGrant> {
        let call = self.grant_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(failure) = lock(&self.queued_failures).pop_front() {
            return Err(failure.into_error());
        }
        if let Some(failure) = *lock(&self.always_fail) {
            return Err(failure.into_error());
        }
        if (*lock(&self.expire_after)).is_some_and(|successes| call > successes) {
            return Err(GrantFailure::SessionExpired.into_error());
        }
        Ok(lock(&self.grant).clone())
    }

    async fn verify_grant(&self, _grant: &AccessGrant) -> BridgeResult<()> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = lock(&self.queued_verify_failures).pop_front() {
            return Err(failure.into_error());
        }
        if self.active.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BridgeError::session_expired("token inactive"))
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
