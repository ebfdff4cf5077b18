//! Account authentication
//!
//! OAuth2 authorization code with PKCE, a mandatory email second factor, and
//! refresh-token renewal against the vendor's accounts service.

pub mod endpoints;
pub mod pkce;
pub mod session;
pub mod token;

pub use session::{AuthSession, AuthState, Credentials, MfaChallenge, MFA_CODE_LENGTH};
pub use token::{TokenSet, TokenStore};
