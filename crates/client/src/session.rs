// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Login state and access level.

use std::fmt;

use ml_core::{protocol::LoginRequest, protocol::LoginResponse, Frame};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// User id with full write access.
pub const ADMIN_USER: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessLevel {
    #[default]
    Read,
    Write,
}

impl AccessLevel {
    pub fn for_user(user: u32) -> Self {
        if user == ADMIN_USER {
            AccessLevel::Write
        } else {
            AccessLevel::Read
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLevel::Read => f.write_str("read"),
            AccessLevel::Write => f.write_str("write"),
        }
    }
}

/// Effect of a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub user: u32,
    /// Previous user, if the login changed it.
    pub changed: Option<u32>,
    /// Token newly stored by a password login.
    pub saved_token: Option<String>,
}

#[derive(Debug, Default)]
pub struct AccessSession {
    user: u32,
    token: Option<String>,
}

impl AccessSession {
    pub fn new(token: Option<String>) -> Self {
        Self {
            user: 0,
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub fn user(&self) -> u32 {
        self.user
    }

    pub fn level(&self) -> AccessLevel {
        AccessLevel::for_user(self.user)
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// `aA` payload for a password login. The password travels as a SHA-1
    /// hex digest.
    pub fn password_request(password: &str, username: &str) -> LoginRequest {
        LoginRequest::Password {
            password: hex::encode(Sha1::digest(password.as_bytes())),
            username: username.to_string(),
        }
    }

    /// `aA` payload for relogin with the cached token.
    pub fn token_request(&self) -> Option<LoginRequest> {
        self.token.as_ref().map(|token| LoginRequest::Token {
            access_token: token.clone(),
        })
    }

    /// Applies an `aA` answer. Only the bare `aA` code means success.
    /// `persist` stores a returned token, which only password logins do.
    pub fn apply_login(&mut self, frame: &Frame, persist: bool) -> Result<LoginOutcome> {
        if frame.type_codes.len() != 2 {
            return Err(Error::LoginRejected);
        }
        let response: LoginResponse = frame.payload_as()?;
        let changed = (response.user != self.user).then_some(self.user);
        self.user = response.user;

        let saved_token = match response.access_token {
            Some(token) if persist && !token.is_empty() => {
                self.token = Some(token.clone());
                Some(token)
            }
            _ => None,
        };
        Ok(LoginOutcome {
            user: response.user,
            changed,
            saved_token,
        })
    }

    /// Drops user and token. Returns the previous user.
    pub fn logout(&mut self) -> u32 {
        self.token = None;
        std::mem::take(&mut self.user)
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
