//! Session auth for the operator app (spec §6 "Authentication").
//!
//! Deliberately weak, matching the legacy terminal protocol: the
//! password is `MD5(username + ":" + shared_secret)`. A successful
//! login mints a random session token that `/api/operation` then
//! checks on every call.

use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

pub struct AuthState {
    shared_secret: String,
    tokens: Mutex<HashSet<String>>,
}

impl AuthState {
    pub fn new(shared_secret: String) -> Self {
        AuthState {
            shared_secret,
            tokens: Mutex::new(HashSet::new()),
        }
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        let expected = format!("{:x}", md5::compute(format!("{}:{}", username, self.shared_secret)));
        expected == password
    }

    pub fn issue_token(&self) -> String {
        let token = Uuid::new_v4().to_string();
        self.tokens.lock().unwrap().insert(token.clone());
        token
    }

    pub fn is_valid(&self, token: &str) -> bool {
        self.tokens.lock().unwrap().contains(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_matches_md5_of_username_colon_secret() {
        let auth = AuthState::new(String::from("topsecret"));
        let expected = format!("{:x}", md5::compute("station1:topsecret"));

        assert!(auth.verify("station1", &expected));
        assert!(!auth.verify("station1", "wrong"));
    }

    #[test]
    fn issued_tokens_validate_until_reissue() {
        let auth = AuthState::new(String::from("topsecret"));
        let token = auth.issue_token();

        assert!(auth.is_valid(&token));
        assert!(!auth.is_valid("not-a-real-token"));
    }
}
