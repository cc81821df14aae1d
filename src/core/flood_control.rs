//! Flood control keyed by client identity (IP address or session token)
//!
//! A client that sends more than `max_messages` within `window` trips a
//! flood: it is put on cooldown, and every attempt during the cooldown
//! pushes the end of the cooldown back. Tripping `max_floods` floods while
//! earlier floods are still remembered escalates to a ban.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use lru::LruCache;
use tokio::sync::Mutex;

use crate::constants::{
    FLOOD_BAN_MINUTES, FLOOD_COOLDOWN_SECS, FLOOD_MAX_FLOODS, FLOOD_MAX_MESSAGES,
    FLOOD_MAX_TRACKED_CLIENTS, FLOOD_WINDOW_SECS,
};

/// Tunable flood thresholds
#[derive(Debug, Clone)]
pub struct FloodPolicy {
    pub window: Duration,
    pub max_messages: usize,
    pub cooldown: Duration,
    pub max_floods: u32,
    pub ban: Duration,
}

impl Default for FloodPolicy {
    fn default() -> Self {
        Self {
            window: Duration::seconds(FLOOD_WINDOW_SECS),
            max_messages: FLOOD_MAX_MESSAGES,
            cooldown: Duration::seconds(FLOOD_COOLDOWN_SECS),
            max_floods: FLOOD_MAX_FLOODS,
            ban: Duration::minutes(FLOOD_BAN_MINUTES),
        }
    }
}

/// Per-client flood bookkeeping
#[derive(Debug, Clone, Default)]
pub struct FloodRecord {
    recent: VecDeque<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    ban_until: Option<DateTime<Utc>>,
    flood_count: u32,
    last_flood: Option<DateTime<Utc>>,
}

impl FloodRecord {
    fn is_banned(&self, now: DateTime<Utc>) -> bool {
        self.ban_until.is_some_and(|until| now < until)
    }

    fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Nothing left in this record that could affect a future decision
    fn is_idle(&self, now: DateTime<Utc>, policy: &FloodPolicy) -> bool {
        !self.is_banned(now)
            && !self.is_cooling_down(now)
            && self.recent.back().map_or(true, |t| now - *t >= policy.window)
            && self.last_flood.map_or(true, |t| now - t >= policy.ban)
    }
}

/// Outcome of recording a message attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodVerdict {
    Allowed,
    /// This attempt tripped a flood; cooldown runs until `until`
    Flooded { until: DateTime<Utc> },
    /// Already cooling down; the cooldown was pushed back to `until`
    Cooldown { until: DateTime<Utc> },
    /// Banned until `until`; `escalated` is set when this attempt caused the ban
    Banned { until: DateTime<Utc>, escalated: bool },
}

impl FloodVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, FloodVerdict::Allowed)
    }
}

pub struct FloodControl {
    records: Mutex<LruCache<String, FloodRecord>>,
    policy: FloodPolicy,
}

impl FloodControl {
    pub fn new(policy: FloodPolicy) -> Self {
        Self::with_max_tracked(policy, FLOOD_MAX_TRACKED_CLIENTS)
    }

    /// Track at most `max_tracked` clients; the least recently active are forgotten first
    pub fn with_max_tracked(policy: FloodPolicy, max_tracked: usize) -> Self {
        let capacity = NonZeroUsize::new(max_tracked).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: Mutex::new(LruCache::new(capacity)),
            policy,
        }
    }

    pub fn policy(&self) -> &FloodPolicy {
        &self.policy
    }

    pub async fn record_message(&self, client: &str) -> FloodVerdict {
        self.record_message_at(client, Utc::now()).await
    }

    /// Record a message attempt from `client` at `now`
    pub async fn record_message_at(&self, client: &str, now: DateTime<Utc>) -> FloodVerdict {
        let policy = &self.policy;
        let mut records = self.records.lock().await;

        if !records.contains(client) {
            records.put(client.to_string(), FloodRecord::default());
        }
        let Some(record) = records.get_mut(client) else {
            return FloodVerdict::Allowed;
        };

        if let Some(until) = record.ban_until.filter(|until| now < *until) {
            return FloodVerdict::Banned {
                until,
                escalated: false,
            };
        }

        if record.is_cooling_down(now) {
            let until = now + policy.cooldown;
            record.cooldown_until = Some(until);
            debug!("Client {} still flooding, cooldown extended", client);
            return FloodVerdict::Cooldown { until };
        }

        record.recent.push_back(now);
        while record
            .recent
            .front()
            .is_some_and(|t| now - *t >= policy.window)
        {
            record.recent.pop_front();
        }

        if record.recent.len() <= policy.max_messages {
            return FloodVerdict::Allowed;
        }

        // Tripped a flood
        record.recent.clear();
        if record.last_flood.is_some_and(|t| now - t >= policy.ban) {
            record.flood_count = 0;
        }
        record.flood_count += 1;
        record.last_flood = Some(now);

        if record.flood_count >= policy.max_floods {
            let until = now + policy.ban;
            record.flood_count = 0;
            record.ban_until = Some(until);
            record.cooldown_until = None;
            warn!("Client {} banned for flooding until {}", client, until);
            return FloodVerdict::Banned {
                until,
                escalated: true,
            };
        }

        let until = now + policy.cooldown;
        record.cooldown_until = Some(until);
        info!(
            "Client {} flooded ({} of {}), cooling down until {}",
            client, record.flood_count, policy.max_floods, until
        );
        FloodVerdict::Flooded { until }
    }

    pub async fn is_cooldown_period(&self, client: &str) -> bool {
        self.is_cooldown_period_at(client, Utc::now()).await
    }

    pub async fn is_cooldown_period_at(&self, client: &str, now: DateTime<Utc>) -> bool {
        self.records
            .lock()
            .await
            .peek(client)
            .is_some_and(|record| record.is_cooling_down(now))
    }

    pub async fn is_ip_banned(&self, client: &str) -> bool {
        self.is_ip_banned_at(client, Utc::now()).await
    }

    pub async fn is_ip_banned_at(&self, client: &str, now: DateTime<Utc>) -> bool {
        self.records
            .lock()
            .await
            .peek(client)
            .is_some_and(|record| record.is_banned(now))
    }

    /// Number of floods remembered for a client
    pub async fn flood_count(&self, client: &str) -> u32 {
        self.records
            .lock()
            .await
            .peek(client)
            .map_or(0, |record| record.flood_count)
    }

    /// Forget records that can no longer affect a decision
    pub async fn cleanup_idle_at(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().await;
        let idle: Vec<String> = records
            .iter()
            .filter(|(_, record)| record.is_idle(now, &self.policy))
            .map(|(client, _)| client.clone())
            .collect();
        for client in &idle {
            records.pop(client);
        }
        idle.len()
    }

    pub async fn tracked_clients(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Periodically drop idle records
    pub fn start_cleanup_task(self: Arc<Self>, every: std::time::Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let removed = self.cleanup_idle_at(Utc::now()).await;
                if removed > 0 {
                    debug!("Flood control forgot {} idle clients", removed);
                }
            }
        });
    }
}

impl Default for FloodControl {
    fn default() -> Self {
        Self::new(FloodPolicy::default())
    }
}
