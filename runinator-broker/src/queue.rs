//! In-memory claim-once queue.
//!
//! State lives behind a single mutex held only to mutate; lease waiters
//! park on a [`Notify`] so no I/O ever happens under the lock. A firing
//! moves `PENDING → LEASED → acked (removed)`, falls back to `PENDING`
//! on nack-requeue or lease expiry, and lands in the dead bucket once its
//! attempts run out or it is dropped explicitly.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use runinator_core::{DeadFiring, Firing};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{AckStatus, Broker, BrokerError, LeasedFiring, PublishReceipt};

/// Redeliveries allowed before a firing is dead-lettered.
pub const MAX_ATTEMPTS: u32 = 5;
/// Floor for the lease duration, so tiny handler timeouts still leave the
/// worker room to ack.
pub const MIN_LEASE_MS: i64 = 1_000;
/// Slack added on top of the handler timeout before a lease expires.
pub const LEASE_GRACE_MS: i64 = 2_000;
/// Cadence of the background sweep returning expired leases.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Claim {
    Pending,
    Leased {
        token: String,
        consumer_id: String,
        deadline: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct Record {
    firing: Firing,
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    next_seq: u64,
    /// Pending firings ordered by `(scheduled_for, publish seq, id)`.
    pending: BTreeSet<(i64, u64, u64)>,
    records: HashMap<u64, (Record, Claim)>,
    /// Idempotency index, live until the firing is terminal.
    by_key: HashMap<(i64, i64), u64>,
    dead: Vec<DeadFiring>,
}

/// The in-memory broker backend.
#[derive(Clone)]
pub struct FiringQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    min_lease_ms: i64,
    grace_ms: i64,
    max_attempts: u32,
}

impl Default for FiringQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FiringQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            min_lease_ms: MIN_LEASE_MS,
            grace_ms: LEASE_GRACE_MS,
            max_attempts: MAX_ATTEMPTS,
        }
    }

    /// Override the lease and retry limits. Tests shrink these to observe
    /// expiry and dead-lettering without waiting.
    #[must_use]
    pub fn with_limits(mut self, min_lease_ms: i64, grace_ms: i64, max_attempts: u32) -> Self {
        self.min_lease_ms = min_lease_ms;
        self.grace_ms = grace_ms;
        self.max_attempts = max_attempts;
        self
    }

    fn publish_sync(&self, mut firing: Firing) -> PublishReceipt {
        let key = firing.idempotency_key();
        let receipt = {
            let mut state = self.state.lock();
            if let Some(&id) = state.by_key.get(&key) {
                return PublishReceipt {
                    id,
                    duplicate: true,
                };
            }
            state.next_id += 1;
            state.next_seq += 1;
            let (id, seq) = (state.next_id, state.next_seq);
            firing.id = id;
            state.pending.insert((key.1, seq, id));
            state.by_key.insert(key, id);
            state
                .records
                .insert(id, (Record { firing, seq }, Claim::Pending));
            PublishReceipt {
                id,
                duplicate: false,
            }
        };
        self.notify.notify_one();
        receipt
    }

    fn try_lease(&self, consumer_id: &str) -> Option<LeasedFiring> {
        let (leased, more_pending) = {
            let mut state = self.state.lock();
            let entry = *state.pending.iter().next()?;
            state.pending.remove(&entry);
            let more_pending = !state.pending.is_empty();
            let (_, _, id) = entry;
            let (record, claim) = state.records.get_mut(&id)?;
            let token = mint_token();
            let lease_ms = record.firing.timeout_ms.max(self.min_lease_ms) + self.grace_ms;
            *claim = Claim::Leased {
                token: token.clone(),
                consumer_id: consumer_id.to_string(),
                deadline: Utc::now() + chrono::Duration::milliseconds(lease_ms),
            };
            (
                LeasedFiring {
                    firing: record.firing.clone(),
                    lease_token: token,
                },
                more_pending,
            )
        };
        // Hand the wakeup on so concurrent waiters drain the queue.
        if more_pending {
            self.notify.notify_one();
        }
        Some(leased)
    }

    fn token_matches(state: &QueueState, firing_id: u64, lease_token: &str) -> bool {
        matches!(
            state.records.get(&firing_id),
            Some((_, Claim::Leased { token, .. })) if constant_time_eq(token, lease_token)
        )
    }

    fn ack_sync(&self, firing_id: u64, lease_token: &str) -> AckStatus {
        let mut state = self.state.lock();
        if !Self::token_matches(&state, firing_id, lease_token) {
            return AckStatus::Stale;
        }
        if let Some((record, _)) = state.records.remove(&firing_id) {
            state.by_key.remove(&record.firing.idempotency_key());
        }
        AckStatus::Acked
    }

    fn nack_sync(
        &self,
        firing_id: u64,
        lease_token: &str,
        requeue: bool,
        reason: Option<String>,
    ) -> AckStatus {
        let requeued = {
            let mut state = self.state.lock();
            if !Self::token_matches(&state, firing_id, lease_token) {
                return AckStatus::Stale;
            }
            if requeue {
                self.requeue_or_bury(
                    &mut state,
                    firing_id,
                    &reason.unwrap_or_else(|| "nacked for retry".to_string()),
                )
            } else {
                bury(
                    &mut state,
                    firing_id,
                    reason.unwrap_or_else(|| "dropped".to_string()),
                );
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
        AckStatus::Acked
    }

    /// Return every expired lease to the queue; firings out of attempts go
    /// to the dead bucket. Returns the number of expired leases handled.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let (expired, requeued_any) = {
            let mut state = self.state.lock();
            let expired: Vec<u64> = state
                .records
                .iter()
                .filter_map(|(id, (_, claim))| match claim {
                    Claim::Leased { deadline, .. } if *deadline < now => Some(*id),
                    _ => None,
                })
                .collect();
            let mut requeued_any = false;
            for id in &expired {
                requeued_any |= self.requeue_or_bury(&mut state, *id, "lease expired");
            }
            (expired.len(), requeued_any)
        };
        if expired > 0 {
            tracing::debug!(count = expired, "swept expired leases");
        }
        if requeued_any {
            self.notify.notify_one();
        }
        expired
    }

    /// Run [`Self::sweep`] every [`SWEEP_INTERVAL`] until shutdown.
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        queue.sweep();
                    }
                }
            }
        })
    }

    /// Requeue with `attempt += 1`, or bury when attempts are exhausted.
    /// Returns whether the firing went back to pending.
    fn requeue_or_bury(&self, state: &mut QueueState, firing_id: u64, cause: &str) -> bool {
        let Some((record, claim)) = state.records.get_mut(&firing_id) else {
            return false;
        };
        record.firing.attempt += 1;
        if record.firing.attempt > self.max_attempts {
            let reason = format!("{cause}; attempts exhausted ({})", record.firing.attempt);
            bury(state, firing_id, reason);
            return false;
        }
        *claim = Claim::Pending;
        let entry = (
            record.firing.scheduled_for.timestamp(),
            record.seq,
            firing_id,
        );
        state.pending.insert(entry);
        true
    }

    fn dead_sync(&self) -> Vec<DeadFiring> {
        self.state.lock().dead.clone()
    }

    /// Pending + leased firings currently tracked. Test hook.
    pub fn in_flight(&self) -> usize {
        self.state.lock().records.len()
    }
}

fn bury(state: &mut QueueState, firing_id: u64, reason: String) {
    if let Some((record, _)) = state.records.remove(&firing_id) {
        state.by_key.remove(&record.firing.idempotency_key());
        tracing::warn!(
            firing_id,
            task_id = record.firing.task_id,
            reason = %reason,
            "firing dead-lettered"
        );
        state.dead.push(DeadFiring {
            firing: record.firing,
            reason,
            died_at: Utc::now(),
        });
    }
}

/// 128 bits of entropy, hex-encoded. Minted per lease.
fn mint_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut token = String::with_capacity(32);
    for byte in bytes {
        token.push_str(&format!("{byte:02x}"));
    }
    token
}

/// Token comparison that does not leak the mismatch position.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[async_trait]
impl Broker for FiringQueue {
    async fn publish(&self, firing: Firing) -> Result<PublishReceipt, BrokerError> {
        Ok(self.publish_sync(firing))
    }

    async fn lease(
        &self,
        consumer_id: &str,
        max_wait: Duration,
    ) -> Result<Option<LeasedFiring>, BrokerError> {
        let deadline = Instant::now() + max_wait;
        loop {
            if let Some(leased) = self.try_lease(consumer_id) {
                return Ok(Some(leased));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, firing_id: u64, lease_token: &str) -> Result<AckStatus, BrokerError> {
        Ok(self.ack_sync(firing_id, lease_token))
    }

    async fn nack(
        &self,
        firing_id: u64,
        lease_token: &str,
        requeue: bool,
        reason: Option<String>,
    ) -> Result<AckStatus, BrokerError> {
        Ok(self.nack_sync(firing_id, lease_token, requeue, reason))
    }

    async fn list_dead(&self) -> Result<Vec<DeadFiring>, BrokerError> {
        Ok(self.dead_sync())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn firing(task_id: i64, slot_offset_secs: i64) -> Firing {
        Firing {
            id: 0,
            task_id,
            scheduled_for: Utc.with_ymd_and_hms(2025, 1, 16, 12, 0, 0).unwrap()
                + chrono::Duration::seconds(slot_offset_secs),
            attempt: 0,
            action_name: "Console".into(),
            action_function: "run_console".into(),
            configuration: b"echo hi".to_vec(),
            timeout_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn publish_is_idempotent_per_slot() {
        let queue = FiringQueue::new();
        let first = queue.publish(firing(1, 0)).await.unwrap();
        let second = queue.publish(firing(1, 0)).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.id, second.id);
        assert_eq!(queue.in_flight(), 1);
    }

    #[tokio::test]
    async fn idempotency_key_frees_after_terminal() {
        let queue = FiringQueue::new();
        queue.publish(firing(1, 0)).await.unwrap();
        let leased = queue.lease("w1", Duration::ZERO).await.unwrap().unwrap();
        queue
            .ack(leased.firing.id, &leased.lease_token)
            .await
            .unwrap();

        let again = queue.publish(firing(1, 0)).await.unwrap();
        assert!(!again.duplicate);
    }

    #[tokio::test]
    async fn lease_orders_by_slot_then_publish_sequence() {
        let queue = FiringQueue::new();
        queue.publish(firing(1, 60)).await.unwrap();
        queue.publish(firing(2, 0)).await.unwrap();
        queue.publish(firing(3, 0)).await.unwrap();

        let order: Vec<i64> = {
            let mut seen = Vec::new();
            for _ in 0..3 {
                let leased = queue.lease("w1", Duration::ZERO).await.unwrap().unwrap();
                seen.push(leased.firing.task_id);
            }
            seen
        };
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn each_firing_is_leased_at_most_once() {
        let queue = FiringQueue::new();
        queue.publish(firing(1, 0)).await.unwrap();
        assert!(queue.lease("w1", Duration::ZERO).await.unwrap().is_some());
        assert!(queue.lease("w2", Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lease_blocks_until_publish() {
        let queue = FiringQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.lease("w1", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.publish(firing(9, 0)).await.unwrap();
        let leased = waiter.await.unwrap().unwrap();
        assert_eq!(leased.unwrap().firing.task_id, 9);
    }

    #[tokio::test]
    async fn ack_with_wrong_token_is_stale_and_harmless() {
        let queue = FiringQueue::new();
        queue.publish(firing(1, 0)).await.unwrap();
        let leased = queue.lease("w1", Duration::ZERO).await.unwrap().unwrap();

        let status = queue
            .ack(leased.firing.id, "deadbeefdeadbeefdeadbeefdeadbeef")
            .await
            .unwrap();
        assert_eq!(status, AckStatus::Stale);
        assert_eq!(queue.in_flight(), 1);

        let status = queue
            .ack(leased.firing.id, &leased.lease_token)
            .await
            .unwrap();
        assert_eq!(status, AckStatus::Acked);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn nack_requeue_increments_attempt() {
        let queue = FiringQueue::new();
        queue.publish(firing(1, 0)).await.unwrap();
        let leased = queue.lease("w1", Duration::ZERO).await.unwrap().unwrap();
        queue
            .nack(leased.firing.id, &leased.lease_token, true, None)
            .await
            .unwrap();

        let redelivered = queue.lease("w2", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(redelivered.firing.id, leased.firing.id);
        assert_eq!(redelivered.firing.attempt, 1);
        assert_ne!(redelivered.lease_token, leased.lease_token);
    }

    #[tokio::test]
    async fn expired_lease_is_swept_back_to_pending() {
        let queue = FiringQueue::new().with_limits(0, 0, MAX_ATTEMPTS);
        let mut short = firing(1, 0);
        short.timeout_ms = 1;
        queue.publish(short).await.unwrap();

        let leased = queue.lease("w1", Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.sweep(), 1);

        let redelivered = queue.lease("w2", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(redelivered.firing.attempt, 1);

        // The first worker's token is now stale.
        let status = queue
            .ack(leased.firing.id, &leased.lease_token)
            .await
            .unwrap();
        assert_eq!(status, AckStatus::Stale);
    }

    #[tokio::test]
    async fn exhausted_attempts_land_in_the_dead_bucket() {
        let queue = FiringQueue::new().with_limits(0, 0, 2);
        queue.publish(firing(1, 0)).await.unwrap();

        for _ in 0..3 {
            let Some(leased) = queue.lease("w1", Duration::ZERO).await.unwrap() else {
                break;
            };
            queue
                .nack(
                    leased.firing.id,
                    &leased.lease_token,
                    true,
                    Some("handler failed".into()),
                )
                .await
                .unwrap();
        }

        let dead = queue.list_dead().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("attempts exhausted"));
        assert_eq!(queue.in_flight(), 0);

        // The slot is free for a fresh publish once the firing is terminal.
        assert!(!queue.publish(firing(1, 0)).await.unwrap().duplicate);
    }

    #[tokio::test]
    async fn explicit_drop_records_the_reason() {
        let queue = FiringQueue::new();
        queue.publish(firing(4, 0)).await.unwrap();
        let leased = queue.lease("w1", Duration::ZERO).await.unwrap().unwrap();
        queue
            .nack(
                leased.firing.id,
                &leased.lease_token,
                false,
                Some("handler_not_found".into()),
            )
            .await
            .unwrap();

        let dead = queue.list_dead().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "handler_not_found");
    }

    #[test]
    fn tokens_are_long_and_unique() {
        let a = mint_token();
        let b = mint_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(constant_time_eq(&a, &a));
        assert!(!constant_time_eq(&a, &b));
    }
}
