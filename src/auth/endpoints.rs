//! HTTP client for the accounts service
//!
//! One method per endpoint of the login handshake. Redirects are never
//! followed: the interesting data (`requestId`, `track_id`, `sub`, `code`)
//! arrives in the query string of a `302` `Location` header.

use crate::auth::pkce::{Pkce, PKCE_METHOD};
use crate::auth::token::TokenResponse;
use crate::config::AuthSection;
use crate::error::{BridgeError, BridgeResult};
use crate::fingerprint;
use reqwest::{redirect, Client, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};
use url::Url;

const MFA_USAGE_TYPE: &str = "MULTIFACTOR_AUTHENTICATION";

/// Query parameters carried by the password step's redirect
#[derive(Debug, Clone, PartialEq)]
pub struct LoginRedirect {
    pub track_id: String,
    pub sub: String,
    pub request_id: String,
}

/// Outcome of triggering the email code delivery
#[derive(Debug, Clone, PartialEq)]
pub struct EmailDelivery {
    pub exchange_id: String,
    pub status_id: String,
    /// Masked address the code was sent to
    pub medium_text: String,
}

#[derive(Debug, Deserialize)]
struct InitiateEnvelope {
    data: InitiateData,
}

#[derive(Debug, Deserialize)]
struct InitiateData {
    exchange_id: ExchangeId,
    status_id: String,
    #[serde(default)]
    medium_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExchangeId {
    exchange_id: String,
}

#[derive(Debug, Deserialize)]
struct ConfiguredMedia {
    #[serde(default)]
    data: Vec<ConfiguredMedium>,
}

#[derive(Debug, Deserialize)]
struct ConfiguredMedium {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    verification_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SuccessFlag {
    #[serde(default)]
    success: bool,
}

#[derive(Debug, Deserialize)]
struct Introspection {
    #[serde(default)]
    active: bool,
}

/// Thin wrapper over the accounts service endpoints
#[derive(Debug, Clone)]
pub struct AccountsClient {
    http: Client,
    base_url: Url,
    client_id: String,
    redirect_uri: String,
    scope: String,
}

impl AccountsClient {
    pub fn new(settings: &AuthSection) -> BridgeResult<Self> {
        let base_url = Url::parse(&settings.base_url).map_err(|e| {
            BridgeError::Config(crate::config::ConfigError::InvalidConfig(format!(
                "auth.base_url: {e}"
            )))
        })?;

        let http = Client::builder()
            .redirect(redirect::Policy::none())
            .default_headers(fingerprint::http_headers())
            .timeout(settings.request_timeout())
            .build()?;

        Ok(Self {
            http,
            base_url,
            client_id: settings.client_id.clone(),
            redirect_uri: settings.redirect_uri.clone(),
            scope: settings.scope.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> BridgeResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| BridgeError::unexpected_response(format!("bad endpoint {path}: {e}")))
    }

    /// Resolve a redirect target and collect its query parameters
    fn redirect_params(&self, response: &Response) -> BridgeResult<HashMap<String, String>> {
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| BridgeError::unexpected_response("redirect without Location header"))?;

        let target = self
            .base_url
            .join(location)
            .map_err(|e| BridgeError::unexpected_response(format!("unparseable Location: {e}")))?;

        Ok(target.query_pairs().into_owned().collect())
    }

    /// Start the authorization request, returning the `requestId`
    pub async fn authorize(&self, pkce: &Pkce) -> BridgeResult<String> {
        let response = self
            .http
            .get(self.endpoint("/authz-srv/authz")?)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", self.scope.as_str()),
                ("code_challenge", pkce.challenge.as_str()),
                ("code_challenge_method", PKCE_METHOD),
                ("nonce", pkce.nonce.as_str()),
            ])
            .send()
            .await?;

        if response.status() != StatusCode::FOUND {
            return Err(status_error(response.status(), "authorization request"));
        }

        self.redirect_params(&response)?
            .remove("requestId")
            .ok_or_else(|| BridgeError::unexpected_response("authorization redirect has no requestId"))
    }

    /// Submit email and password
    pub async fn login(
        &self,
        request_id: &str,
        email: &str,
        password: &str,
    ) -> BridgeResult<LoginRedirect> {
        let response = self
            .http
            .post(self.endpoint("/login-srv/login")?)
            .form(&[
                ("username", email),
                ("username_type", "email"),
                ("password", password),
                ("requestId", request_id),
                ("rememberMe", "true"),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(status_error(status, "login"));
        }
        if status != StatusCode::FOUND {
            return Err(BridgeError::invalid_credentials(format!(
                "login answered with HTTP {status}"
            )));
        }

        let mut params = self.redirect_params(&response)?;
        match (params.remove("track_id"), params.remove("sub")) {
            (Some(track_id), Some(sub)) => Ok(LoginRedirect {
                track_id,
                sub,
                request_id: params
                    .remove("requestId")
                    .unwrap_or_else(|| request_id.to_string()),
            }),
            // The service redirects back to the login form on bad passwords
            _ => Err(BridgeError::invalid_credentials(
                "login redirect carries no MFA tracking parameters",
            )),
        }
    }

    /// Look up the account's configured email verification medium
    ///
    /// Best effort: any failure yields `None` so the caller falls back to the
    /// default medium.
    pub async fn configured_email_medium(&self, sub: &str) -> Option<String> {
        let url = self
            .endpoint("/verification-srv/v2/setup/public/configured/list")
            .ok()?;
        let response = match self.http.get(url).query(&[("sub", sub)]).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(status = %response.status(), "Medium lookup declined");
                return None;
            }
            Err(e) => {
                debug!(error = %e, "Medium lookup failed");
                return None;
            }
        };

        let media: ConfiguredMedia = response.json().await.ok()?;
        media
            .data
            .into_iter()
            .find(|m| m.verification_type.as_deref() == Some("EMAIL"))
            .and_then(|m| m.id)
    }

    /// Trigger delivery of the email code
    pub async fn initiate_email(
        &self,
        sub: &str,
        medium_id: &str,
        request_id: &str,
    ) -> BridgeResult<EmailDelivery> {
        let response = self
            .http
            .post(self.endpoint("/verification-srv/v2/authenticate/initiate/email")?)
            .json(&serde_json::json!({
                "sub": sub,
                "medium_id": medium_id,
                "request_id": request_id,
                "usage_type": MFA_USAGE_TYPE,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response.status(), "MFA initiation"));
        }

        let envelope: InitiateEnvelope = response.json().await.map_err(|e| {
            BridgeError::unexpected_response(format!("MFA initiation body: {e}"))
        })?;

        Ok(EmailDelivery {
            exchange_id: envelope.data.exchange_id.exchange_id,
            status_id: envelope.data.status_id,
            medium_text: envelope
                .data
                .medium_text
                .unwrap_or_else(|| "your email".to_string()),
        })
    }

    /// Check an emailed code
    pub async fn verify_email_code(
        &self,
        sub: &str,
        exchange_id: &str,
        code: &str,
    ) -> BridgeResult<()> {
        let response = self
            .http
            .post(self.endpoint("/verification-srv/v2/authenticate/authenticate/email")?)
            .json(&serde_json::json!({
                "pass_code": code,
                "exchange_id": exchange_id,
                "sub": sub,
            }))
            .send()
            .await?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST
                | StatusCode::UNAUTHORIZED
                | StatusCode::FORBIDDEN
                | StatusCode::UNPROCESSABLE_ENTITY
        ) {
            return Err(BridgeError::mfa_invalid(format!(
                "verification answered with HTTP {status}"
            )));
        }
        if !status.is_success() {
            return Err(status_error(status, "MFA verification"));
        }

        let flag: SuccessFlag = response.json().await.map_err(|e| {
            BridgeError::unexpected_response(format!("MFA verification body: {e}"))
        })?;
        if !flag.success {
            return Err(BridgeError::mfa_invalid("verification service rejected the code"));
        }
        Ok(())
    }

    /// Resume the login after verification, returning the authorization code
    pub async fn continue_login(
        &self,
        track_id: &str,
        status_id: &str,
        sub: &str,
    ) -> BridgeResult<String> {
        let response = self
            .http
            .post(self.endpoint(&format!("/login-srv/precheck/continue/{track_id}"))?)
            .form(&[
                ("status_id", status_id),
                ("track_id", track_id),
                ("requestId", track_id),
                ("sub", sub),
                ("verificationType", "EMAIL"),
            ])
            .send()
            .await?;

        if response.status() != StatusCode::FOUND {
            return Err(status_error(response.status(), "login continuation"));
        }

        self.redirect_params(&response)?
            .remove("code")
            .ok_or_else(|| {
                BridgeError::authorization_failed("login continuation issued no authorization code")
            })
    }

    /// Exchange the authorization code using the PKCE verifier
    pub async fn exchange_code(&self, code: &str, verifier: &str) -> BridgeResult<TokenResponse> {
        let response = self
            .http
            .post(self.endpoint("/token-srv/token")?)
            .json(&serde_json::json!({
                "grant_type": "authorization_code",
                "client_id": self.client_id,
                "redirect_uri": self.redirect_uri,
                "code_verifier": verifier,
                "code": code,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response.status(), "token exchange"));
        }
        parse_token_response(response).await
    }

    /// Run the refresh-token grant
    pub async fn refresh(&self, refresh_token: &str) -> BridgeResult<TokenResponse> {
        let response = self
            .http
            .post(self.endpoint("/token-srv/token")?)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "client_id": self.client_id,
                "refresh_token": refresh_token,
            }))
            .send()
            .await?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            warn!(%status, "Refresh token rejected");
            return Err(BridgeError::session_expired(format!(
                "refresh grant answered with HTTP {status}"
            )));
        }
        if !status.is_success() {
            return Err(status_error(status, "token refresh"));
        }
        parse_token_response(response).await
    }

    /// Ask the introspection endpoint whether a token is active
    pub async fn introspect(&self, token: &str) -> BridgeResult<bool> {
        let response = self
            .http
            .post(self.endpoint("/token-srv/introspect")?)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response.status(), "token introspection"));
        }

        let introspection: Introspection = response.json().await.map_err(|e| {
            BridgeError::unexpected_response(format!("introspection body: {e}"))
        })?;
        Ok(introspection.active)
    }
}

async fn parse_token_response(response: Response) -> BridgeResult<TokenResponse> {
    response
        .json()
        .await
        .map_err(|e| BridgeError::unexpected_response(format!("token response body: {e}")))
}

/// Server-side trouble is transient, everything else is an authorization failure
fn status_error(status: StatusCode, step: &str) -> BridgeError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BridgeError::network(format!("{step} answered with HTTP {status}"))
    } else {
        BridgeError::authorization_failed(format!("{step} answered with HTTP {status}"))
    }
}
