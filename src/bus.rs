//! Main EventBus struct tying all components together.

use crate::buffer::CategoryBuffer;
use crate::cache::LastEventCache;
use crate::error::{BusError, Result};
use crate::persistence::EventLog;
use crate::subscriptions::{Subscription, SubscriptionRegistry};
use crate::types::{validate_category, BusStats, Event, EventId, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Smallest per-category buffer the bus accepts.
pub const MIN_BUFFER_CAPACITY: usize = 10;

/// Bus configuration.
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Durable log file.
    pub log_path: PathBuf,

    /// Events kept in memory per category. At least `MIN_BUFFER_CAPACITY`.
    pub buffer_capacity: usize,

    /// Subscribe timeout when the caller gives none.
    pub default_timeout: Duration,

    /// Longer requested timeouts are clamped to this.
    pub max_timeout: Duration,

    /// Categories with this prefix stay out of the last-event cache.
    pub excluded_prefix: String,

    /// Fsync the log every N appends.
    ///
    /// Above 1 this relaxes durability: an event is written to the log
    /// before anyone sees it, but may be delivered before it is fsynced,
    /// so a crash can lose up to N-1 events that subscribers already got.
    pub sync_interval: u64,

    /// Drop buffered events older than this. The log and the last-event
    /// cache keep them.
    pub event_ttl: Option<Duration>,

    /// Longest accepted category name, in bytes.
    pub max_category_len: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("./chats.log"),
            buffer_capacity: 250,
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(110),
            excluded_prefix: "_____@".to_string(),
            sync_interval: 1,
            event_ttl: None,
            max_category_len: 1024,
        }
    }
}

impl BusConfig {
    /// Check the values make sense together.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity < MIN_BUFFER_CAPACITY {
            return Err(BusError::InvalidConfig(format!(
                "buffer_capacity must be >= {}, got {}",
                MIN_BUFFER_CAPACITY, self.buffer_capacity
            )));
        }
        if self.max_timeout.is_zero() {
            return Err(BusError::InvalidConfig("max_timeout must be non-zero".into()));
        }
        if self.default_timeout.is_zero() || self.default_timeout > self.max_timeout {
            return Err(BusError::InvalidConfig(format!(
                "default_timeout must be in (0, {:?}], got {:?}",
                self.max_timeout, self.default_timeout
            )));
        }
        if self.max_category_len == 0 {
            return Err(BusError::InvalidConfig(
                "max_category_len must be non-zero".into(),
            ));
        }
        if matches!(self.event_ttl, Some(ttl) if ttl.is_zero()) {
            return Err(BusError::InvalidConfig("event_ttl must be non-zero".into()));
        }
        Ok(())
    }
}

/// The event bus.
///
/// Publishes are serialised through the log: id assignment, the durable
/// write, the buffer insert, the cache update and the wakeups for one
/// event all finish before the next publish gets an id. Delivery order is
/// therefore id order, within and across categories.
///
/// Subscribes check the buffers and register their waiter under the
/// buffer read lock, which a publish needs for writing, so a racing
/// publish is seen either by the check or by the wakeup, never both and
/// never neither.
pub struct EventBus {
    /// Bus configuration.
    config: BusConfig,

    /// Durable log. Its lock is the publish serialisation point.
    log: Mutex<EventLog>,

    /// In-memory history per category.
    buffers: RwLock<HashMap<String, CategoryBuffer>>,

    /// Latest event per category.
    cache: LastEventCache,

    /// Pending long-poll waiters.
    registry: Arc<SubscriptionRegistry>,

    /// Set under both the log lock and the buffer write lock.
    shut_down: AtomicBool,
}

impl EventBus {
    /// Open the bus, replaying the log to rebuild buffers and cache.
    pub fn open(config: BusConfig) -> Result<Self> {
        config.validate()?;

        let started = Instant::now();
        let cache = LastEventCache::new(config.excluded_prefix.clone());
        let mut buffers: HashMap<String, CategoryBuffer> = HashMap::new();
        let mut replayed = 0u64;

        let log = EventLog::open_with_sync_interval(&config.log_path, config.sync_interval, |event| {
            let event = Arc::new(event);
            cache.record(&event);
            buffers
                .entry(event.category.clone())
                .or_insert_with(|| CategoryBuffer::new(config.buffer_capacity))
                .push(event);
            replayed += 1;
        })?;

        if let Some(ttl) = config.event_ttl {
            let now = Timestamp::now();
            for buffer in buffers.values_mut() {
                buffer.evict_expired(ttl, now);
            }
        }

        info!(
            path = %config.log_path.display(),
            events = replayed,
            categories = buffers.len(),
            cached = cache.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Event bus ready"
        );

        Ok(Self {
            config,
            log: Mutex::new(log),
            buffers: RwLock::new(buffers),
            cache,
            registry: Arc::new(SubscriptionRegistry::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    // --- Publishing ---

    /// Publish an event to a category.
    ///
    /// The event is durable before anyone can see it. If the log write
    /// fails nothing changes and the error is returned.
    pub fn publish(&self, category: &str, payload: serde_json::Value) -> Result<Event> {
        validate_category(category, self.config.max_category_len)?;

        let mut log = self.log.lock();
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BusError::ShutDown);
        }

        let event = Arc::new(log.append(category, payload)?);

        {
            let mut buffers = self.buffers.write();
            let buffer = buffers
                .entry(event.category.clone())
                .or_insert_with(|| CategoryBuffer::new(self.config.buffer_capacity));
            if let Some(ttl) = self.config.event_ttl {
                buffer.evict_expired(ttl, event.timestamp);
            }
            if let Some(evicted) = buffer.push(Arc::clone(&event)) {
                debug!(category, evicted = %evicted.id, "Evicted oldest buffered event");
            }
            // Readers that can see the event in a buffer also see it cached.
            self.cache.record(&event);
        }

        self.registry.wake(&event);
        self.registry.reap_expired(Instant::now());
        drop(log);

        Ok(Event::clone(&event))
    }

    // --- Reading ---

    /// All buffered events in `categories` with `id > since`, in id order.
    /// Never blocks on new events; an empty result is normal.
    pub fn fetch<S: AsRef<str>>(&self, categories: &[S], since: EventId) -> Result<Vec<Event>> {
        let categories = self.normalize_categories(categories)?;
        let buffers = self.buffers.read();
        Ok(self.collect_after(&buffers, &categories, since))
    }

    /// Start a long-poll read.
    ///
    /// Returns the available events right away if there are any, otherwise
    /// registers a waiter. `timeout` defaults to the configured default
    /// and is clamped to the configured maximum; a zero timeout never
    /// registers.
    pub fn begin_subscribe<S: AsRef<str>>(
        &self,
        categories: &[S],
        since: EventId,
        timeout: Option<Duration>,
    ) -> Result<Subscription> {
        let categories = self.normalize_categories(categories)?;
        let timeout = self.effective_timeout(timeout);

        let buffers = self.buffers.read();
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BusError::ShutDown);
        }

        let events = self.collect_after(&buffers, &categories, since);
        if !events.is_empty() || timeout.is_zero() {
            return Ok(Subscription::Ready(events));
        }

        let pending = self.registry.register(categories, since, timeout);
        drop(buffers);

        Ok(Subscription::Pending(pending))
    }

    /// Long-poll read: block until events newer than `since` arrive in any
    /// of `categories`, or the timeout passes (empty result).
    pub fn subscribe<S: AsRef<str>>(
        &self,
        categories: &[S],
        since: EventId,
        timeout: Option<Duration>,
    ) -> Result<Vec<Event>> {
        Ok(self.begin_subscribe(categories, since, timeout)?.wait())
    }

    /// Most recent event of a category, unless the category is excluded.
    pub fn last_event(&self, category: &str) -> Option<Event> {
        self.cache.get(category).map(|event| Event::clone(&event))
    }

    /// Most recent event of every non-excluded category.
    pub fn all_last_events(&self) -> HashMap<String, Event> {
        self.cache
            .snapshot()
            .into_iter()
            .map(|(category, event)| (category, Event::clone(&event)))
            .collect()
    }

    /// Categories with an in-memory buffer, sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self.buffers.read().keys().cloned().collect();
        categories.sort();
        categories
    }

    /// Whether a category is kept out of the last-event cache.
    pub fn is_excluded(&self, category: &str) -> bool {
        self.cache.is_excluded(category)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Bus statistics.
    pub fn stats(&self) -> BusStats {
        let (last_event_id, log_size_bytes) = {
            let log = self.log.lock();
            (log.last_id(), log.size())
        };
        let buffers = self.buffers.read();

        BusStats {
            category_count: buffers.len() as u64,
            buffered_events: buffers.values().map(|b| b.len() as u64).sum(),
            pending_waiters: self.registry.pending_count() as u64,
            last_event_id,
            log_size_bytes,
        }
    }

    // --- Lifecycle ---

    /// Force sync the log to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.lock().sync()
    }

    /// Stop accepting publishes and subscribes, sync the log and release
    /// every pending waiter with an empty result.
    pub fn shutdown(&self) -> Result<()> {
        let mut log = self.log.lock();
        {
            let _buffers = self.buffers.write();
            if self.shut_down.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        }

        let released = self.registry.expire_all();
        log.sync()?;
        info!(released_waiters = released, last_id = %log.last_id(), "Event bus shut down");
        Ok(())
    }

    // --- Internals ---

    fn normalize_categories<S: AsRef<str>>(&self, categories: &[S]) -> Result<Vec<String>> {
        if categories.is_empty() {
            return Err(BusError::InvalidCategory("no categories given".into()));
        }

        let mut unique = BTreeSet::new();
        for category in categories {
            let category = category.as_ref();
            validate_category(category, self.config.max_category_len)?;
            unique.insert(category.to_owned());
        }
        Ok(unique.into_iter().collect())
    }

    fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            None => self.config.default_timeout,
            Some(timeout) if timeout > self.config.max_timeout => {
                warn!(
                    requested = ?timeout,
                    max = ?self.config.max_timeout,
                    "Clamping subscribe timeout"
                );
                self.config.max_timeout
            }
            Some(timeout) => timeout,
        }
    }

    fn collect_after(
        &self,
        buffers: &HashMap<String, CategoryBuffer>,
        categories: &[String],
        since: EventId,
    ) -> Vec<Event> {
        let now = Timestamp::now();
        let fresh = |timestamp: Timestamp| match self.config.event_ttl {
            Some(ttl) => timestamp.age_at(now) <= ttl,
            None => true,
        };

        let mut events: Vec<Event> = categories
            .iter()
            .filter_map(|category| buffers.get(category))
            .flat_map(|buffer| buffer.events_after(since))
            .filter(|event| fresh(event.timestamp))
            .map(|event| Event::clone(event))
            .collect();

        events.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.category.cmp(&b.category)));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> BusConfig {
        BusConfig {
            log_path: dir.path().join("chats.log"),
            buffer_capacity: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(BusConfig::default().validate().is_ok());
    }

    #[test]
    fn test_capacity_minimum_enforced() {
        let dir = TempDir::new().unwrap();
        let config = BusConfig {
            buffer_capacity: 9,
            ..test_config(&dir)
        };
        assert!(matches!(
            EventBus::open(config),
            Err(BusError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_timeout_config_rejected() {
        let config = BusConfig {
            default_timeout: Duration::from_secs(200),
            max_timeout: Duration::from_secs(110),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BusError::InvalidConfig(_))));

        let config = BusConfig {
            event_ttl: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BusError::InvalidConfig(_))));
    }

    #[test]
    fn test_effective_timeout() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::open(BusConfig {
            default_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(10),
            ..test_config(&dir)
        })
        .unwrap();

        assert_eq!(bus.effective_timeout(None), Duration::from_secs(5));
        assert_eq!(
            bus.effective_timeout(Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(
            bus.effective_timeout(Some(Duration::from_secs(60))),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_normalize_categories_dedupes_and_validates() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::open(test_config(&dir)).unwrap();

        let categories = bus.normalize_categories(&["b", "a", "b"]).unwrap();
        assert_eq!(categories, vec!["a".to_string(), "b".to_string()]);

        let empty: [&str; 0] = [];
        assert!(matches!(
            bus.normalize_categories(&empty),
            Err(BusError::InvalidCategory(_))
        ));
        assert!(matches!(
            bus.normalize_categories(&["ok", ""]),
            Err(BusError::InvalidCategory(_))
        ));
    }

    #[test]
    fn test_zero_timeout_returns_immediately() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::open(test_config(&dir)).unwrap();

        let subscription = bus
            .begin_subscribe(&["room1"], EventId::ZERO, Some(Duration::ZERO))
            .unwrap();
        assert!(matches!(subscription, Subscription::Ready(ref events) if events.is_empty()));
        assert_eq!(bus.stats().pending_waiters, 0);
    }

    #[test]
    fn test_shutdown_rejects_and_releases() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::open(test_config(&dir)).unwrap();
        bus.publish("room1", json!({"msg": "hi"})).unwrap();

        let pending = bus
            .begin_subscribe(&["room1"], EventId(1), Some(Duration::from_secs(30)))
            .unwrap();
        assert_eq!(bus.stats().pending_waiters, 1);

        bus.shutdown().unwrap();
        assert!(pending.wait().is_empty());
        assert!(matches!(
            bus.publish("room1", json!({"msg": "late"})),
            Err(BusError::ShutDown)
        ));
        assert!(matches!(
            bus.subscribe(&["room1"], EventId(0), None),
            Err(BusError::ShutDown)
        ));

        // Idempotent
        bus.shutdown().unwrap();
    }

    #[test]
    fn test_failed_publish_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let bus = EventBus::open(config.clone()).unwrap();
        bus.publish("room1", json!({"msg": "kept"})).unwrap();

        let subscription = bus
            .begin_subscribe(&["room1"], EventId(1), Some(Duration::from_secs(30)))
            .unwrap();
        let pending = match subscription {
            Subscription::Pending(pending) => pending,
            Subscription::Ready(events) => panic!("Unexpected events: {:?}", events),
        };

        let read_only = std::fs::File::open(&config.log_path).unwrap();
        let writable = bus.log.lock().replace_file(read_only);

        let result = bus.publish("room1", json!({"msg": "lost"}));
        assert!(matches!(result, Err(BusError::Persistence(_))));

        // No id consumed, no buffer insert, no cache update, no wakeup
        assert_eq!(bus.stats().last_event_id, EventId(1));
        assert_eq!(bus.fetch(&["room1"], EventId::ZERO).unwrap().len(), 1);
        assert_eq!(bus.last_event("room1").unwrap().id, EventId(1));
        assert!(pending.receiver().is_empty());
        assert_eq!(bus.stats().pending_waiters, 1);

        bus.log.lock().replace_file(writable);
        let event = bus.publish("room1", json!({"msg": "after"})).unwrap();
        assert_eq!(event.id, EventId(2));
        assert_eq!(pending.wait().into_events(), vec![event]);
    }

    #[test]
    fn test_batched_sync_still_writes_before_delivery() {
        let dir = TempDir::new().unwrap();
        let config = BusConfig {
            sync_interval: 100,
            ..test_config(&dir)
        };
        let bus = EventBus::open(config.clone()).unwrap();

        let event = bus.publish("room1", json!({"msg": "unsynced"})).unwrap();
        assert_eq!(bus.fetch(&["room1"], EventId::ZERO).unwrap(), vec![event.clone()]);

        // In the file, though not necessarily fsynced yet
        let logged = EventLog::read_all(&config.log_path).unwrap();
        assert_eq!(logged, vec![event]);
    }

    #[test]
    fn test_event_ttl_hides_old_events() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::open(BusConfig {
            event_ttl: Some(Duration::from_millis(50)),
            ..test_config(&dir)
        })
        .unwrap();

        bus.publish("room1", json!({"msg": "old"})).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        bus.publish("room1", json!({"msg": "new"})).unwrap();

        let events = bus.fetch(&["room1"], EventId::ZERO).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["msg"], "new");

        // The cache is unaffected by expiry
        assert_eq!(bus.last_event("room1").unwrap().id, EventId(2));
    }
}
