//! Scoped authorization tokens: `{issuer_id}|{expiry}|{scope}`, expiry in epoch seconds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Intended use of a token.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Follow,
    Chat,
    Broadcast,
    Group,
    Game,
    File,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Follow => "follow",
            Scope::Chat => "chat",
            Scope::Broadcast => "broadcast",
            Scope::Group => "group",
            Scope::Game => "game",
            Scope::File => "file",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "follow" => Scope::Follow,
            "chat" => Scope::Chat,
            "broadcast" => Scope::Broadcast,
            "group" => Scope::Group,
            "game" => Scope::Game,
            "file" => Scope::File,
            other => return Err(TokenError::UnknownScope(other.to_string())),
        })
    }
}

/// Parsed token. Immutable once issued.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedToken {
    pub issuer: PeerId,
    pub expiry: f64,
    pub scope: Scope,
}

impl ScopedToken {
    /// Issue a token valid for `ttl` seconds from `now`.
    pub fn issue(issuer: &PeerId, scope: Scope, ttl: f64, now: f64) -> Self {
        Self {
            issuer: issuer.clone(),
            expiry: now + ttl,
            scope,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let parts: Vec<&str> = raw.split('|').collect();
        let [issuer, expiry, scope] = parts.as_slice() else {
            return Err(TokenError::Malformed);
        };
        let expiry: f64 = expiry
            .trim()
            .parse()
            .map_err(|_| TokenError::BadExpiry(expiry.to_string()))?;
        if !expiry.is_finite() {
            return Err(TokenError::BadExpiry(expiry.to_string()));
        }
        Ok(Self {
            issuer: PeerId::from(issuer.trim()),
            expiry,
            scope: scope.trim().parse()?,
        })
    }

    pub fn is_expired(&self, now: f64) -> bool {
        now >= self.expiry
    }
}

impl fmt::Display for ScopedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.issuer, self.expiry, self.scope)
    }
}

/// Issue a token in wire form.
pub fn issue(issuer: &PeerId, scope: Scope, ttl: f64, now: f64) -> String {
    ScopedToken::issue(issuer, scope, ttl, now).to_string()
}

/// Fails closed: malformed, wrong scope, expired, or wrong issuer all yield `false`.
pub fn validate(raw: &str, expected_scope: Scope, expected_issuer: Option<&PeerId>, now: f64) -> bool {
    let Ok(token) = ScopedToken::parse(raw) else {
        return false;
    };
    if token.scope != expected_scope || token.is_expired(now) {
        return false;
    }
    match expected_issuer {
        Some(issuer) => token.issuer == *issuer,
        None => true,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token must have exactly three '|'-separated parts")]
    Malformed,
    #[error("token expiry {0:?} is not a number")]
    BadExpiry(String),
    #[error("unknown token scope {0:?}")]
    UnknownScope(String),
}
