//! Fallback Host Selection
//!
//! Rotates through a shuffled list of standby hosts after retryable
//! failures, and remembers a working fallback for a bounded window.

use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct FallbackHosts {
    primary: String,
    /// Shuffled once per rotation
    fallbacks: Vec<String>,
    tried: HashSet<String>,
    current: String,
    preferred: Option<(String, Instant)>,
    preferred_window: Duration,
}

impl FallbackHosts {
    pub fn new(primary: impl Into<String>, fallbacks: Vec<String>, preferred_window: Duration) -> Self {
        let primary = primary.into();
        let mut fallbacks: Vec<String> = fallbacks.into_iter().filter(|h| *h != primary).collect();
        fallbacks.shuffle(&mut rand::thread_rng());
        FallbackHosts {
            current: primary.clone(),
            primary,
            fallbacks,
            tried: HashSet::new(),
            preferred: None,
            preferred_window,
        }
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Host used by the most recent attempt
    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn has_fallbacks(&self) -> bool {
        !self.fallbacks.is_empty()
    }

    pub fn is_using_fallback(&self) -> bool {
        self.current != self.primary
    }

    /// Pick the host for the next connection attempt
    pub fn select(&mut self, use_fallback: bool) -> String {
        let host = if use_fallback {
            self.next_fallback()
        } else {
            self.preferred_host()
        };
        self.current = host.clone();
        host
    }

    fn preferred_host(&mut self) -> String {
        match &self.preferred {
            Some((host, until)) if Instant::now() < *until => host.clone(),
            Some((host, _)) => {
                tracing::debug!("Preferred fallback {} expired, reverting to {}", host, self.primary);
                self.preferred = None;
                self.primary.clone()
            }
            None => self.primary.clone(),
        }
    }

    fn next_fallback(&mut self) -> String {
        self.tried.insert(self.current.clone());
        let next = self
            .fallbacks
            .iter()
            .find(|h| !self.tried.contains(*h))
            .cloned();

        match next {
            Some(host) => {
                tracing::info!("Switching to fallback host {}", host);
                host
            }
            None => {
                // Every fallback tried: start a new rotation from the primary
                tracing::warn!("All fallback hosts tried, returning to {}", self.primary);
                self.tried.clear();
                self.fallbacks.shuffle(&mut rand::thread_rng());
                self.primary.clone()
            }
        }
    }

    /// Record a successful connection on `host`
    pub fn on_connected(&mut self, host: &str) {
        self.tried.clear();
        if host == self.primary {
            self.preferred = None;
        } else {
            self.preferred = Some((host.to_string(), Instant::now() + self.preferred_window));
        }
    }
}
