//! Replay protection for transfer actions
//!
//! A nonce is `salt.digest`: a random per-issue salt and a truncated
//! SHA-256 over the secret, a time tick, the action, the actor and the
//! salt. Ticks are half a lifetime long and a nonce is accepted during its
//! own tick and the next one. Each nonce is accepted once.

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::errors::{AppError, Result};
use crate::transfer::{ReplayGuard, TransferAction};

const DIGEST_LEN: usize = 20;
const SALT_BYTES: usize = 8;

pub struct NonceManager {
    secret: String,
    lifetime_secs: u64,
    /// Consumed nonces and the tick they were issued in
    used: Mutex<HashMap<String, i64>>,
}

impl NonceManager {
    pub fn new(secret: impl Into<String>, lifetime_secs: u64) -> Self {
        Self {
            secret: secret.into(),
            lifetime_secs: lifetime_secs.max(2),
            used: Mutex::new(HashMap::new()),
        }
    }

    fn tick_at(&self, unix_secs: i64) -> i64 {
        let half = (self.lifetime_secs / 2) as i64;
        (unix_secs + half - 1).div_euclid(half)
    }

    fn digest(&self, tick: i64, actor: &str, action: TransferAction, salt: &str) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.secret.as_bytes(),
            tick.to_string().as_bytes(),
            action.as_str().as_bytes(),
            actor.as_bytes(),
        ] {
            hasher.update(part);
            hasher.update(b"|");
        }
        hasher.update(salt.as_bytes());
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(DIGEST_LEN);
        digest
    }

    fn token_with_salt(&self, tick: i64, actor: &str, action: TransferAction, salt: &str) -> String {
        format!("{}.{}", salt, self.digest(tick, actor, action, salt))
    }

    pub fn issue_at(&self, actor: &str, action: TransferAction, unix_secs: i64) -> String {
        let salt = hex::encode(rand::random::<[u8; SALT_BYTES]>());
        self.token_with_salt(self.tick_at(unix_secs), actor, action, &salt)
    }

    /// Check `token` without consuming it; returns the tick it was issued in
    fn check_at(&self, actor: &str, action: TransferAction, token: &str, unix_secs: i64) -> Option<i64> {
        let (salt, digest) = token.split_once('.')?;
        if salt.len() != SALT_BYTES * 2 {
            return None;
        }
        let tick = self.tick_at(unix_secs);
        [tick, tick - 1].into_iter().find(|t| {
            constant_time_eq(self.digest(*t, actor, action, salt).as_bytes(), digest.as_bytes())
        })
    }

    pub async fn verify_at(
        &self,
        actor: &str,
        action: TransferAction,
        token: &str,
        unix_secs: i64,
    ) -> Result<()> {
        let invalid = || AppError::InvalidNonce {
            action: action.as_str().to_string(),
        };

        let issued = self.check_at(actor, action, token, unix_secs).ok_or_else(invalid)?;

        let mut used = self.used.lock().await;
        let current = self.tick_at(unix_secs);
        used.retain(|_, tick| *tick >= current - 1);
        if used.insert(token.to_string(), issued).is_some() {
            return Err(invalid());
        }
        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[async_trait]
impl ReplayGuard for NonceManager {
    async fn issue(&self, actor: &str, action: TransferAction) -> Result<String> {
        Ok(self.issue_at(actor, action, Utc::now().timestamp()))
    }

    async fn verify(&self, actor: &str, action: TransferAction, token: &str) -> Result<()> {
        self.verify_at(actor, action, token, Utc::now().timestamp()).await
    }
}
