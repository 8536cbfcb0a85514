//! Coarse token-gated access
//!
//! Callers log in to get a token and present it when subscribing to
//! notifications. Authorization is deliberately coarse: a token is valid iff
//! this server issued it. Finer-grained policy hooks in by implementing
//! `Authorizor`.

use std::collections::HashSet;
use std::sync::RwLock;

use uuid::Uuid;

/// Uniquely identifies a logged-in user. Obtained from `Authorizor::login`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(pub String);

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lets users log in and authorizes them for specific resources.
pub trait Authorizor: Send + Sync {
    /// Register a new user; the returned token authorizes further actions.
    fn login(&self) -> Token;

    /// Whether the holder of `token` may access `resource`.
    fn authorize(&self, token: &Token, resource: &str) -> bool;
}

/// The default authorizor: any issued token may access any resource.
pub struct SiftAuthorizor {
    issued: RwLock<HashSet<Token>>,
}

impl SiftAuthorizor {
    pub fn new() -> Self {
        Self {
            issued: RwLock::new(HashSet::new()),
        }
    }
}

impl Default for SiftAuthorizor {
    fn default() -> Self {
        Self::new()
    }
}

impl Authorizor for SiftAuthorizor {
    fn login(&self) -> Token {
        let token = Token(Uuid::new_v4().to_string());
        self.issued
            .write()
            .expect("issued lock poisoned")
            .insert(token.clone());
        token
    }

    fn authorize(&self, token: &Token, _resource: &str) -> bool {
        self.issued
            .read()
            .expect("issued lock poisoned")
            .contains(token)
    }
}
