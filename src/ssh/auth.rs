//! Ordered credential strategies
//!
//! A session tries each configured key kind in turn and, when permitted,
//! a password last. Only explicitly provided material is used; there is no
//! agent or `~/.ssh` discovery.

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::config::{KeyKind, SshConfig};
use crate::error::{IsyncError, Result};

/// One authentication attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Key(KeyKind),
    Password,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Key(kind) => write!(f, "{} key", kind),
            AuthMethod::Password => f.write_str("password"),
        }
    }
}

/// Ordered list of attempts derived from an [`SshConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPlan {
    methods: Vec<AuthMethod>,
}

impl AuthPlan {
    /// Key kinds first (only when key material is present), password last
    /// (only when password fallback is enabled).
    pub fn from_config(config: &SshConfig) -> Self {
        let mut methods = Vec::new();

        if config.private_key.is_some() {
            methods.extend(config.key_kinds.iter().copied().map(AuthMethod::Key));
        }

        if config.allow_password {
            methods.push(AuthMethod::Password);
        }

        Self { methods }
    }

    pub fn methods(&self) -> &[AuthMethod] {
        &self.methods
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Performs a single authentication attempt against a live transport
#[async_trait]
pub trait Authenticator: Send {
    /// Returns `Ok(())` on success; any error is the reason the attempt failed
    async fn attempt(&mut self, method: AuthMethod) -> Result<()>;
}

/// Run `plan` against `auth`, stopping at the first success.
///
/// When every attempt fails, the error lists the attempted methods in order
/// together with the last underlying failure.
pub async fn authenticate(plan: &AuthPlan, auth: &mut dyn Authenticator) -> Result<AuthMethod> {
    if plan.is_empty() {
        return Err(IsyncError::invalid_params(
            "No authentication method available (require a private key or password fallback)",
        ));
    }

    let mut attempted = Vec::with_capacity(plan.methods.len());
    let mut last_error = String::new();

    for &method in &plan.methods {
        debug!("Attempting {} authentication", method);
        attempted.push(method.to_string());

        match auth.attempt(method).await {
            Ok(()) => {
                info!("Connected with {}", method);
                return Ok(method);
            }
            Err(e) => {
                warn!("{} auth failed: {}", method, e);
                last_error = e.to_string();
            }
        }
    }

    Err(IsyncError::Auth {
        attempted,
        last_error,
    })
}
