//! Poller admin sessions.
//!
//! Username + bcrypt-hashed password from the environment; successful logins
//! mint an opaque token kept in an in-memory map with a one-hour expiry.
//! Sessions do not survive a restart, which is fine for a single-operator
//! dashboard.

use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

pub struct AdminAuth {
    username: Option<String>,
    password_hash: Option<String>,
    sessions: Mutex<HashMap<String, Instant>>,
}

impl AdminAuth {
    pub fn new(username: Option<String>, password_hash: Option<String>) -> Self {
        Self {
            username,
            password_hash,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.username.is_some() && self.password_hash.is_some()
    }

    /// Verifies credentials and mints a session token.
    pub fn login(&self, username: &str, password: &str) -> Option<String> {
        let (expected_user, hash) = match (&self.username, &self.password_hash) {
            (Some(u), Some(h)) => (u, h),
            _ => return None,
        };
        if username != expected_user {
            return None;
        }
        if !bcrypt::verify(password, hash).unwrap_or(false) {
            return None;
        }
        let mut bytes = [0u8; 24];
        rand::rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        self.sessions
            .lock()
            .expect("session lock")
            .insert(token.clone(), Instant::now());
        Some(token)
    }

    /// Whether the token names a live session; expired entries are pruned.
    pub fn validate(&self, token: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("session lock");
        sessions.retain(|_, created| created.elapsed() < SESSION_TTL);
        sessions.contains_key(token)
    }

    pub fn logout(&self, token: &str) {
        self.sessions.lock().expect("session lock").remove(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> AdminAuth {
        let hash = bcrypt::hash("hunter2", 4).unwrap();
        AdminAuth::new(Some("admin".to_string()), Some(hash))
    }

    #[test]
    fn login_round_trip() {
        let auth = auth();
        assert!(auth.login("admin", "wrong").is_none());
        assert!(auth.login("nobody", "hunter2").is_none());
        let token = auth.login("admin", "hunter2").unwrap();
        assert!(auth.validate(&token));
        auth.logout(&token);
        assert!(!auth.validate(&token));
    }

    #[test]
    fn disabled_auth_rejects_everything() {
        let auth = AdminAuth::new(None, None);
        assert!(!auth.enabled());
        assert!(auth.login("admin", "anything").is_none());
        assert!(!auth.validate("made-up"));
    }
}
