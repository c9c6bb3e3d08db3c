//! Deterministic [`TokenProvider`] for local runs and tests.

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::bail;
use async_trait::async_trait;

use crate::application::ports::TokenProvider;

/// Mints `<secret>:<channel>:<uid>:<serial>` tokens without a network call.
pub struct StaticTokenProvider {
    secret: String,
    issued: AtomicU32,
    faults: AtomicU32,
}

impl StaticTokenProvider {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            issued: AtomicU32::new(0),
            faults: AtomicU32::new(0),
        }
    }

    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::Acquire)
    }

    pub fn fail_next(&self, n: u32) {
        self.faults.store(n, Ordering::Release);
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self, channel: &str, uid: u32) -> anyhow::Result<String> {
        let faulted = self
            .faults
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if faulted {
            bail!("token endpoint returned 503");
        }
        let serial = self.issued.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(format!("{}:{channel}:{uid}:{serial}", self.secret))
    }
}
