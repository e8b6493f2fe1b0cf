//! Signal cache and debouncer
//!
//! One slot per timeframe for a single symbol. A slot moves through
//! Empty → Cached → (stale) regenerate → Cached. Regeneration is serialized
//! per slot: a second caller waits on the slot lock and then reuses whatever
//! the first caller stored.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::SignalPolicy;
use crate::types::{Signal, Timeframe};

/// Ages beyond this are treated as this
const MAX_SANE_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Allowed clock skew before a generation time counts as future-dated
const FUTURE_TOLERANCE_MS: i64 = 1_000;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub signal: Signal,
    pub generated_at: DateTime<Utc>,
    pub price_at_generation: f64,
    /// Last time a regeneration decided to keep this entry
    pub checked_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(signal: Signal) -> Self {
        Self {
            generated_at: signal.generated_at,
            checked_at: signal.generated_at,
            price_at_generation: signal.entry_point,
            signal,
        }
    }

    /// Age at `now`. Future-dated entries count as stale for `timeframe`
    /// and absurd ages are capped, both with a warning.
    pub fn age(&self, now: DateTime<Utc>, timeframe: Timeframe) -> Duration {
        let elapsed_ms = (now - self.generated_at).num_milliseconds();
        if elapsed_ms < -FUTURE_TOLERANCE_MS {
            warn!(
                "Cached {} {} signal is dated {}ms in the future, treating as stale",
                self.signal.symbol, timeframe, -elapsed_ms
            );
            return timeframe.max_age();
        }

        let age = Duration::from_millis(elapsed_ms.max(0) as u64);
        if age > MAX_SANE_AGE {
            warn!(
                "Cached {} {} signal is {}s old, capping age",
                self.signal.symbol,
                timeframe,
                age.as_secs()
            );
            return MAX_SANE_AGE;
        }
        age
    }

    /// Servable without running the pipeline: young enough, or confirmed by
    /// a regeneration within the last `max_age`
    pub fn is_fresh(&self, now: DateTime<Utc>, timeframe: Timeframe) -> bool {
        let max_age = timeframe.max_age();
        if self.age(now, timeframe) < max_age {
            return true;
        }
        let since_check_ms = (now - self.checked_at).num_milliseconds();
        since_check_ms >= 0 && (since_check_ms as u128) < max_age.as_millis()
    }

    /// Cached signal with its display time moved to `now`
    fn present(&self, now: DateTime<Utc>) -> Signal {
        let mut signal = self.signal.clone();
        signal.timestamp.at = now;
        signal
    }
}

#[derive(Debug, Default)]
struct Slot {
    entry: Mutex<Option<CacheEntry>>,
    /// Bumped every time a new entry is stored
    generation: AtomicU64,
}

/// Per-timeframe signal cache for one symbol
#[derive(Debug)]
pub struct SignalCache {
    policy: SignalPolicy,
    slots: RwLock<HashMap<Timeframe, Arc<Slot>>>,
}

impl SignalCache {
    pub fn new(policy: SignalPolicy) -> Self {
        Self {
            policy,
            slots: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, timeframe: Timeframe) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().await.get(&timeframe) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(timeframe)
            .or_default()
            .clone()
    }

    /// Return the cached signal while fresh, otherwise run `generate` and
    /// keep whichever of old and new the debounce rules allow.
    pub async fn get_or_generate<F, Fut, E>(
        &self,
        timeframe: Timeframe,
        now: DateTime<Utc>,
        current_price: Option<f64>,
        generate: F,
    ) -> Result<Signal, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Signal, E>>,
    {
        let slot = self.slot(timeframe).await;
        let mut entry = slot.entry.lock().await;

        if let Some(cached) = entry.as_ref() {
            if cached.is_fresh(now, timeframe) {
                debug!("Serving cached {} {} signal", cached.signal.symbol, timeframe);
                return Ok(cached.present(now));
            }
        }

        let candidate = generate().await?;

        if self.should_update(entry.as_ref(), &candidate, timeframe, current_price, now) {
            *entry = Some(CacheEntry::new(candidate.clone()));
            slot.generation.fetch_add(1, Ordering::SeqCst);
            Ok(candidate)
        } else {
            // should_update is always true without an entry
            match entry.as_mut() {
                Some(cached) => {
                    cached.checked_at = now;
                    debug!(
                        "Keeping cached {} {} signal, debounce not satisfied",
                        cached.signal.symbol, timeframe
                    );
                    Ok(cached.present(now))
                }
                None => Ok(candidate),
            }
        }
    }

    /// Drop every cached timeframe and regenerate `timeframe` unconditionally.
    ///
    /// If another refresh of the same timeframe finishes while this one is
    /// waiting for the slot, its result is returned instead of running again.
    pub async fn refresh<F, Fut, E>(
        &self,
        timeframe: Timeframe,
        now: DateTime<Utc>,
        generate: F,
    ) -> Result<Signal, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Signal, E>>,
    {
        let slot = self.slot(timeframe).await;
        let seen = slot.generation.load(Ordering::SeqCst);

        self.clear_except(timeframe).await;

        let mut entry = slot.entry.lock().await;
        if slot.generation.load(Ordering::SeqCst) != seen {
            if let Some(cached) = entry.as_ref() {
                debug!("Refresh of {} {} already completed, reusing", cached.signal.symbol, timeframe);
                return Ok(cached.present(now));
            }
        }

        *entry = None;
        let signal = generate().await?;
        *entry = Some(CacheEntry::new(signal.clone()));
        slot.generation.fetch_add(1, Ordering::SeqCst);
        Ok(signal)
    }

    /// Whether `candidate` should replace the cached entry
    pub fn should_update(
        &self,
        cached: Option<&CacheEntry>,
        candidate: &Signal,
        timeframe: Timeframe,
        current_price: Option<f64>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(cached) = cached else {
            return true;
        };

        let age = cached.age(now, timeframe);
        let cooldown = self.policy.cooldown(timeframe);

        if candidate.signal != cached.signal.signal && age > cooldown / 2 {
            return true;
        }
        if age > cooldown {
            return true;
        }

        match current_price {
            Some(price) if cached.price_at_generation > 0.0 => {
                let change_pct =
                    (price - cached.price_at_generation).abs() / cached.price_at_generation * 100.0;
                change_pct > self.policy.price_change_threshold(timeframe)
            }
            _ => false,
        }
    }

    pub async fn entry(&self, timeframe: Timeframe) -> Option<CacheEntry> {
        let slot = self.slots.read().await.get(&timeframe)?.clone();
        let entry = slot.entry.lock().await;
        entry.clone()
    }

    /// Number of entries stored so far for `timeframe`
    pub async fn generation(&self, timeframe: Timeframe) -> u64 {
        match self.slots.read().await.get(&timeframe) {
            Some(slot) => slot.generation.load(Ordering::SeqCst),
            None => 0,
        }
    }

    pub async fn clear(&self) {
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        for slot in slots {
            *slot.entry.lock().await = None;
        }
    }

    async fn clear_except(&self, keep: Timeframe) {
        let slots: Vec<Arc<Slot>> = self
            .slots
            .read()
            .await
            .iter()
            .filter(|(tf, _)| **tf != keep)
            .map(|(_, slot)| slot.clone())
            .collect();
        for slot in slots {
            *slot.entry.lock().await = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SignalTimestamp, SignalType};
    use chrono::Duration as ChronoDuration;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    fn signal(kind: SignalType, price: f64, at: DateTime<Utc>, timeframe: Timeframe) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: "ETHUSDT".to_string(),
            signal: kind,
            entry_point: price,
            stop_loss: price * 0.95,
            target_price: price * 1.05,
            confidence: 60,
            reasoning: "test".to_string(),
            timestamp: SignalTimestamp { at, timeframe },
            generated_at: at,
            prediction: None,
            fallback: false,
        }
    }

    async fn seed(cache: &SignalCache, tf: Timeframe, kind: SignalType, price: f64, at: DateTime<Utc>) -> Signal {
        cache
            .get_or_generate(tf, at, Some(price), || async move {
                Ok::<_, Infallible>(signal(kind, price, at, tf))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_entry_is_reused_with_new_display_time() {
        let cache = SignalCache::new(SignalPolicy::conservative());
        let t0 = Utc::now();
        let first = seed(&cache, Timeframe::M5, SignalType::Buy, 100.0, t0).await;

        let later = t0 + ChronoDuration::seconds(20);
        let second = cache
            .get_or_generate(Timeframe::M5, later, Some(100.0), || async {
                Ok::<_, Infallible>(signal(SignalType::Sell, 90.0, later, Timeframe::M5))
            })
            .await
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.signal, SignalType::Buy);
        assert_eq!(second.stop_loss, first.stop_loss);
        assert_eq!(second.timestamp.at, later);
        assert_eq!(second.generated_at, t0);
    }

    #[tokio::test]
    async fn test_stale_entry_within_cooldown_is_kept() {
        let cache = SignalCache::new(SignalPolicy::conservative());
        let t0 = Utc::now();
        let first = seed(&cache, Timeframe::M5, SignalType::Buy, 100.0, t0).await;

        // Past max age (30s), inside the 60s cooldown, same type, tiny move
        let later = t0 + ChronoDuration::seconds(40);
        let calls = AtomicUsize::new(0);
        let result = cache
            .get_or_generate(Timeframe::M5, later, Some(100.1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(signal(SignalType::Buy, 100.1, later, Timeframe::M5))
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.id, first.id);
        assert_eq!(cache.generation(Timeframe::M5).await, 1);

        // The kept entry counts as checked, so the next requests reuse it
        for secs in [45, 55, 65] {
            let at = t0 + ChronoDuration::seconds(secs);
            let reused = cache
                .get_or_generate(Timeframe::M5, at, Some(100.1), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(signal(SignalType::Buy, 100.1, at, Timeframe::M5))
                })
                .await
                .unwrap();
            assert_eq!(reused.id, first.id);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.entry(Timeframe::M5).await.unwrap().checked_at, later);

        // 30s after the check it runs again and the cooldown has passed
        let much_later = t0 + ChronoDuration::seconds(75);
        let replaced = cache
            .get_or_generate(Timeframe::M5, much_later, Some(100.1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(signal(SignalType::Buy, 100.1, much_later, Timeframe::M5))
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_ne!(replaced.id, first.id);
        assert_eq!(cache.generation(Timeframe::M5).await, 2);
    }

    #[tokio::test]
    async fn test_cooldown_expiry_replaces_entry() {
        let cache = SignalCache::new(SignalPolicy::conservative());
        let t0 = Utc::now();
        let first = seed(&cache, Timeframe::M5, SignalType::Buy, 100.0, t0).await;

        let later = t0 + ChronoDuration::seconds(61);
        let second = seed(&cache, Timeframe::M5, SignalType::Buy, 100.0, later).await;
        assert_ne!(second.id, first.id);
        assert_eq!(cache.generation(Timeframe::M5).await, 2);
    }

    #[test]
    fn test_should_update_rules() {
        let cache = SignalCache::new(SignalPolicy::conservative());
        let tf = Timeframe::M5;
        let t0 = Utc::now();
        let cached = CacheEntry::new(signal(SignalType::Buy, 100.0, t0, tf));
        let same = signal(SignalType::Buy, 100.0, t0, tf);
        let flipped = signal(SignalType::Sell, 100.0, t0, tf);

        assert!(cache.should_update(None, &same, tf, Some(100.0), t0));

        // Type change only counts after half the cooldown
        let at_20s = t0 + ChronoDuration::seconds(20);
        let at_35s = t0 + ChronoDuration::seconds(35);
        assert!(!cache.should_update(Some(&cached), &flipped, tf, Some(100.0), at_20s));
        assert!(cache.should_update(Some(&cached), &flipped, tf, Some(100.0), at_35s));
        assert!(!cache.should_update(Some(&cached), &same, tf, Some(100.0), at_35s));

        // 0.5% threshold on 5m
        assert!(!cache.should_update(Some(&cached), &same, tf, Some(100.4), at_20s));
        assert!(cache.should_update(Some(&cached), &same, tf, Some(100.6), at_20s));
        assert!(cache.should_update(Some(&cached), &same, tf, Some(99.3), at_20s));
    }

    #[test]
    fn test_responsive_policy_always_updates_once_aged() {
        let cache = SignalCache::new(SignalPolicy::responsive());
        let t0 = Utc::now();
        let cached = CacheEntry::new(signal(SignalType::Buy, 100.0, t0, Timeframe::M1));
        let same = signal(SignalType::Buy, 100.0, t0, Timeframe::M1);
        let later = t0 + ChronoDuration::milliseconds(5);
        assert!(cache.should_update(Some(&cached), &same, Timeframe::M1, Some(100.0), later));
    }

    #[test]
    fn test_future_dated_entry_is_stale() {
        let t0 = Utc::now();
        let entry = CacheEntry::new(signal(SignalType::Hold, 100.0, t0 + ChronoDuration::hours(1), Timeframe::M15));
        assert_eq!(entry.age(t0, Timeframe::M15), Timeframe::M15.max_age());

        let ancient = CacheEntry::new(signal(SignalType::Hold, 100.0, t0 - ChronoDuration::days(30), Timeframe::M15));
        assert_eq!(ancient.age(t0, Timeframe::M15), MAX_SANE_AGE);
    }

    #[tokio::test]
    async fn test_refresh_bypasses_cooldown_and_clears_other_timeframes() {
        let cache = SignalCache::new(SignalPolicy::conservative());
        let t0 = Utc::now();
        let first = seed(&cache, Timeframe::M5, SignalType::Buy, 100.0, t0).await;
        seed(&cache, Timeframe::H1, SignalType::Buy, 100.0, t0).await;

        let refreshed = cache
            .refresh(Timeframe::M5, t0, || async {
                Ok::<_, Infallible>(signal(SignalType::Buy, 100.0, t0, Timeframe::M5))
            })
            .await
            .unwrap();

        assert_ne!(refreshed.id, first.id);
        assert_eq!(cache.generation(Timeframe::M5).await, 2);
        assert!(cache.entry(Timeframe::H1).await.is_none());
        assert_eq!(cache.entry(Timeframe::M5).await.unwrap().signal.id, refreshed.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refresh_runs_pipeline_once() {
        let cache = Arc::new(SignalCache::new(SignalPolicy::conservative()));
        let calls = Arc::new(AtomicUsize::new(0));
        let t0 = Utc::now();

        let run = |cache: Arc<SignalCache>, calls: Arc<AtomicUsize>| async move {
            cache
                .refresh(Timeframe::M15, t0, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, Infallible>(signal(SignalType::Sell, 100.0, t0, Timeframe::M15))
                })
                .await
                .unwrap()
        };

        let (a, b) = tokio::join!(
            run(cache.clone(), calls.clone()),
            run(cache.clone(), calls.clone())
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.id, b.id);
        assert_eq!(cache.generation(Timeframe::M15).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_get_on_empty_slot_runs_pipeline_once() {
        let cache = Arc::new(SignalCache::new(SignalPolicy::conservative()));
        let calls = Arc::new(AtomicUsize::new(0));
        let t0 = Utc::now();

        let run = |cache: Arc<SignalCache>, calls: Arc<AtomicUsize>| async move {
            cache
                .get_or_generate(Timeframe::M1, t0, Some(100.0), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, Infallible>(signal(SignalType::Hold, 100.0, t0, Timeframe::M1))
                })
                .await
                .unwrap()
        };

        let (a, b) = tokio::join!(
            run(cache.clone(), calls.clone()),
            run(cache.clone(), calls.clone())
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_failed_generation_leaves_cache_untouched() {
        let cache = SignalCache::new(SignalPolicy::conservative());
        let t0 = Utc::now();
        let result = cache
            .get_or_generate(Timeframe::M5, t0, None, || async { Err::<Signal, _>("no data") })
            .await;
        assert!(result.is_err());
        assert!(cache.entry(Timeframe::M5).await.is_none());
        assert_eq!(cache.generation(Timeframe::M5).await, 0);
    }
}
