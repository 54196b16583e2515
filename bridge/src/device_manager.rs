use chrono::{DateTime, Duration as ChronoDuration, Utc};
use iiot_shared::{
    generate_command_id, BrokerCredentials, CacheConfig, DeviceConfigResponse,
    DeviceStatusSnapshot, TopicMap,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Time source, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// 缓存的设备配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedDeviceConfig {
    pub device_id: String,
    pub broker_credentials: BrokerCredentials,
    pub topic_map: TopicMap,
    pub firmware_version: Option<String>,
    pub cached_at: DateTime<Utc>,
}

// 排队中的设备命令
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedCommand {
    pub command_id: String,
    pub device_id: String,
    pub command: Value,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("device connection limit of {limit} reached")]
pub struct ConnectionLimitReached {
    pub limit: usize,
}

// 单个分片: 同一设备的所有数据都在同一个分片里
#[derive(Default)]
struct Shard {
    configs: HashMap<String, CachedDeviceConfig>,
    connections: HashMap<String, DateTime<Utc>>,
    last_seen: HashMap<String, DateTime<Utc>>,
    command_queues: HashMap<String, VecDeque<QueuedCommand>>,
}

impl Shard {
    /// Drop the cached config when it is past its TTL.
    fn live_config(
        &mut self,
        device_id: &str,
        now: DateTime<Utc>,
        ttl: ChronoDuration,
    ) -> Option<&CachedDeviceConfig> {
        let expired = self
            .configs
            .get(device_id)
            .map(|config| now >= config.cached_at + ttl)?;

        if expired {
            self.configs.remove(device_id);
            debug!("Config for device {} expired", device_id);
            return None;
        }
        self.configs.get(device_id)
    }

    fn snapshot(&mut self, device_id: &str, now: DateTime<Utc>, ttl: ChronoDuration) -> DeviceStatusSnapshot {
        let (has_config, mqtt_client_id, firmware_version) = match self.live_config(device_id, now, ttl) {
            Some(config) => (
                true,
                Some(config.broker_credentials.client_id.clone()),
                config.firmware_version.clone(),
            ),
            None => (false, None, None),
        };

        DeviceStatusSnapshot {
            device_id: device_id.to_string(),
            connected: self.connections.contains_key(device_id),
            has_config,
            last_seen: self.last_seen.get(device_id).copied(),
            pending_commands: self.command_queues.get(device_id).map_or(0, VecDeque::len),
            mqtt_client_id,
            firmware_version,
        }
    }
}

/// Per-device gateway state: config cache, connections, command queues.
pub struct DeviceManager {
    shards: Vec<Mutex<Shard>>,
    ttl: ChronoDuration,
    idle_timeout: ChronoDuration,
    max_connections: usize,
    max_queued_commands: usize,
    connection_count: AtomicUsize,
    clock: Arc<dyn Clock>,
}

impl DeviceManager {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let shard_count = config.shards.max(1);
        let ttl = ChronoDuration::from_std(config.device_config_ttl())
            .unwrap_or_else(|_| ChronoDuration::hours(1));
        let idle_timeout = ChronoDuration::from_std(config.idle_timeout())
            .unwrap_or_else(|_| ChronoDuration::minutes(10));

        Self {
            shards: (0..shard_count).map(|_| Mutex::new(Shard::default())).collect(),
            ttl,
            idle_timeout,
            max_connections: config.max_device_connections,
            max_queued_commands: config.max_queued_commands.max(1),
            connection_count: AtomicUsize::new(0),
            clock,
        }
    }

    fn shard(&self, device_id: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    // 配置缓存
    pub async fn set_device_config(&self, device_id: &str, config: &DeviceConfigResponse) {
        let now = self.clock.now();
        let cached = CachedDeviceConfig {
            device_id: device_id.to_string(),
            broker_credentials: config.broker_credentials.clone(),
            topic_map: config.topic_map.clone(),
            firmware_version: config.firmware_version.clone(),
            cached_at: now,
        };

        let mut shard = self.shard(device_id).lock().await;
        shard.configs.insert(device_id.to_string(), cached);
        info!("Cached config for device {}", device_id);
    }

    pub async fn get_device_config(&self, device_id: &str) -> Option<CachedDeviceConfig> {
        let now = self.clock.now();
        let mut shard = self.shard(device_id).lock().await;
        shard.live_config(device_id, now, self.ttl).cloned()
    }

    // 连接跟踪
    pub async fn register_device_connection(&self, device_id: &str) -> Result<(), ConnectionLimitReached> {
        let now = self.clock.now();
        let mut shard = self.shard(device_id).lock().await;

        if !shard.connections.contains_key(device_id) {
            self.reserve_connection_slot()?;
            shard.connections.insert(device_id.to_string(), now);
            info!("Device {} connected", device_id);
        }
        shard.last_seen.insert(device_id.to_string(), now);
        Ok(())
    }

    pub async fn unregister_device_connection(&self, device_id: &str) {
        let mut shard = self.shard(device_id).lock().await;
        if shard.connections.remove(device_id).is_some() {
            self.connection_count.fetch_sub(1, Ordering::SeqCst);
            info!("Device {} disconnected", device_id);
        }
    }

    pub async fn update_device_last_seen(&self, device_id: &str) {
        let now = self.clock.now();
        let mut shard = self.shard(device_id).lock().await;
        shard.last_seen.insert(device_id.to_string(), now);
    }

    /// Record activity, registering the connection on first sight.
    pub async fn touch_device(&self, device_id: &str) {
        if let Err(e) = self.register_device_connection(device_id).await {
            warn!("Not tracking connection for {}: {}", device_id, e);
            self.update_device_last_seen(device_id).await;
        }
    }

    pub async fn is_device_connected(&self, device_id: &str) -> bool {
        let shard = self.shard(device_id).lock().await;
        shard.connections.contains_key(device_id)
    }

    pub async fn get_connected_devices(&self) -> Vec<String> {
        let mut devices = Vec::new();
        for shard in &self.shards {
            devices.extend(shard.lock().await.connections.keys().cloned());
        }
        devices.sort();
        devices
    }

    fn reserve_connection_slot(&self) -> Result<(), ConnectionLimitReached> {
        let limit = self.max_connections;
        self.connection_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < limit).then_some(count + 1)
            })
            .map(|_| ())
            .map_err(|_| ConnectionLimitReached { limit })
    }

    pub fn active_connections(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    // 命令队列
    pub async fn queue_command(&self, device_id: &str, command: Value) -> QueuedCommand {
        let queued = QueuedCommand {
            command_id: generate_command_id(),
            device_id: device_id.to_string(),
            command,
            queued_at: self.clock.now(),
        };
        self.push_command(queued.clone()).await;
        queued
    }

    /// Queue a command whose id was assigned by the caller.
    pub async fn push_command(&self, queued: QueuedCommand) {
        let mut shard = self.shard(&queued.device_id).lock().await;
        let queue = shard.command_queues.entry(queued.device_id.clone()).or_default();

        while queue.len() >= self.max_queued_commands {
            if let Some(evicted) = queue.pop_front() {
                warn!(
                    "Command queue for {} full, dropping oldest command {}",
                    queued.device_id, evicted.command_id
                );
            }
        }

        debug!("Queued command {} for {}", queued.command_id, queued.device_id);
        queue.push_back(queued);
    }

    pub async fn get_pending_commands(&self, device_id: &str) -> Vec<QueuedCommand> {
        let shard = self.shard(device_id).lock().await;
        shard
            .command_queues
            .get(device_id)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn clear_commands(&self, device_id: &str) -> usize {
        let mut shard = self.shard(device_id).lock().await;
        shard.command_queues.remove(device_id).map_or(0, |queue| queue.len())
    }

    /// Remove one command after the device answered it.
    pub async fn acknowledge_command(&self, device_id: &str, command_id: &str) -> Option<QueuedCommand> {
        let mut shard = self.shard(device_id).lock().await;
        let queue = shard.command_queues.get_mut(device_id)?;
        let position = queue.iter().position(|c| c.command_id == command_id)?;
        let acknowledged = queue.remove(position);

        if queue.is_empty() {
            shard.command_queues.remove(device_id);
        }
        acknowledged
    }

    // 状态查询
    pub async fn get_device_status(&self, device_id: &str) -> DeviceStatusSnapshot {
        let now = self.clock.now();
        let mut shard = self.shard(device_id).lock().await;
        shard.snapshot(device_id, now, self.ttl)
    }

    /// Snapshot of every device that is connected or has a live config.
    pub async fn get_all_device_statuses(&self) -> HashMap<String, DeviceStatusSnapshot> {
        let now = self.clock.now();
        let mut statuses = HashMap::new();

        for shard in &self.shards {
            let mut shard = shard.lock().await;
            let device_ids: HashSet<String> = shard
                .connections
                .keys()
                .chain(shard.configs.keys())
                .cloned()
                .collect();

            for device_id in device_ids {
                let snapshot = shard.snapshot(&device_id, now, self.ttl);
                if snapshot.connected || snapshot.has_config {
                    statuses.insert(device_id, snapshot);
                }
            }
        }

        statuses
    }

    /// Drop every expired config; returns how many were removed.
    pub async fn cleanup_expired_configs(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;

        for shard in &self.shards {
            let mut shard = shard.lock().await;
            let before = shard.configs.len();
            shard.configs.retain(|_, config| now < config.cached_at + self.ttl);
            removed += before - shard.configs.len();
        }

        if removed > 0 {
            info!("Removed {} expired device configs", removed);
        }
        removed
    }

    /// Disconnect devices silent for longer than the idle timeout.
    ///
    /// Their `last_seen` is kept only while a config or queued commands
    /// still reference the device. Returns how many were disconnected.
    pub async fn cleanup_idle_devices(&self) -> usize {
        let now = self.clock.now();
        let cutoff = now - self.idle_timeout;
        let mut disconnected = 0;

        for shard in &self.shards {
            let mut shard = shard.lock().await;
            let Shard {
                configs,
                connections,
                last_seen,
                command_queues,
            } = &mut *shard;

            connections.retain(|device_id, connected_at| {
                let active = last_seen.get(device_id).copied().unwrap_or(*connected_at);
                if active > cutoff {
                    return true;
                }
                debug!("Device {} idle since {}, disconnecting", device_id, active);
                disconnected += 1;
                false
            });

            last_seen.retain(|device_id, seen| {
                *seen > cutoff || configs.contains_key(device_id) || command_queues.contains_key(device_id)
            });
        }

        if disconnected > 0 {
            self.connection_count.fetch_sub(disconnected, Ordering::SeqCst);
            info!("Disconnected {} idle devices", disconnected);
        }
        disconnected
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    pub(crate) struct ManualClock {
        now: StdMutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                now: StdMutex::new(Utc::now()),
            })
        }

        pub(crate) fn advance(&self, by: ChronoDuration) {
            let mut now = self.now.lock().unwrap();
            *now = *now + by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    fn cache_config() -> CacheConfig {
        CacheConfig {
            device_config_ttl_secs: 60,
            max_device_connections: 2,
            max_queued_commands: 3,
            shards: 4,
            cleanup_interval_secs: 300,
            idle_timeout_secs: 120,
            ota_retention_secs: 3600,
        }
    }

    fn config_response(device_id: &str) -> DeviceConfigResponse {
        DeviceConfigResponse {
            status: "success".to_string(),
            device_id: device_id.to_string(),
            broker_credentials: BrokerCredentials {
                host: "mqtt.factory.com".to_string(),
                port: 8883,
                use_tls: true,
                client_id: device_id.to_string(),
                username: device_id.to_string(),
                password: "secret".to_string(),
            },
            topic_map: TopicMap::default(),
            firmware_version: Some("1.0.0".to_string()),
        }
    }

    #[tokio::test]
    async fn test_config_expires_after_ttl() {
        let clock = ManualClock::new();
        let manager = DeviceManager::with_clock(&cache_config(), clock.clone());

        manager.set_device_config("dev1", &config_response("dev1")).await;
        assert!(manager.get_device_config("dev1").await.is_some());
        assert!(manager.get_device_status("dev1").await.has_config);

        clock.advance(ChronoDuration::seconds(59));
        assert!(manager.get_device_config("dev1").await.is_some());

        clock.advance(ChronoDuration::seconds(1));
        assert!(manager.get_device_config("dev1").await.is_none());

        let status = manager.get_device_status("dev1").await;
        assert!(!status.has_config);
        assert!(status.mqtt_client_id.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired() {
        let clock = ManualClock::new();
        let manager = DeviceManager::with_clock(&cache_config(), clock.clone());

        manager.set_device_config("old", &config_response("old")).await;
        clock.advance(ChronoDuration::seconds(30));
        manager.set_device_config("fresh", &config_response("fresh")).await;
        clock.advance(ChronoDuration::seconds(31));

        assert_eq!(manager.cleanup_expired_configs().await, 1);
        assert!(manager.get_device_config("fresh").await.is_some());
        assert!(manager.get_device_config("old").await.is_none());
    }

    #[tokio::test]
    async fn test_command_queues_are_per_device() {
        let manager = DeviceManager::new(&cache_config());

        manager.queue_command("a", json!({"action": "reset"})).await;
        manager.queue_command("a", json!({"action": "reboot"})).await;
        manager.queue_command("b", json!({"action": "reset"})).await;

        assert_eq!(manager.get_pending_commands("a").await.len(), 2);
        assert_eq!(manager.get_pending_commands("b").await.len(), 1);

        assert_eq!(manager.clear_commands("a").await, 2);
        assert!(manager.get_pending_commands("a").await.is_empty());
        assert_eq!(manager.get_pending_commands("b").await.len(), 1);
    }

    #[tokio::test]
    async fn test_queue_cap_evicts_oldest() {
        let manager = DeviceManager::new(&cache_config());

        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(manager.queue_command("a", json!({"n": n})).await.command_id);
        }

        let pending = manager.get_pending_commands("a").await;
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].command_id, ids[2]);
        assert_eq!(pending[2].command["n"], 4);
    }

    #[tokio::test]
    async fn test_acknowledge_removes_single_command() {
        let manager = DeviceManager::new(&cache_config());
        let first = manager.queue_command("a", json!({"action": "x"})).await;
        let second = manager.queue_command("a", json!({"action": "y"})).await;

        let acked = manager.acknowledge_command("a", &first.command_id).await;
        assert_eq!(acked.map(|c| c.command_id), Some(first.command_id.clone()));
        assert!(manager.acknowledge_command("a", &first.command_id).await.is_none());

        let pending = manager.get_pending_commands("a").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].command_id, second.command_id);
        assert_eq!(manager.get_device_status("a").await.pending_commands, 1);
    }

    #[tokio::test]
    async fn test_connection_cap() {
        let manager = DeviceManager::new(&cache_config());

        manager.register_device_connection("a").await.unwrap();
        manager.register_device_connection("b").await.unwrap();
        // re-registering is idempotent
        manager.register_device_connection("a").await.unwrap();
        assert_eq!(
            manager.register_device_connection("c").await,
            Err(ConnectionLimitReached { limit: 2 })
        );
        assert_eq!(manager.active_connections(), 2);

        manager.unregister_device_connection("a").await;
        manager.unregister_device_connection("a").await;
        assert_eq!(manager.active_connections(), 1);
        assert!(!manager.is_device_connected("a").await);
        manager.register_device_connection("c").await.unwrap();
        assert_eq!(manager.get_connected_devices().await, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_touch_updates_last_seen_beyond_cap() {
        let clock = ManualClock::new();
        let manager = DeviceManager::with_clock(&cache_config(), clock.clone());
        manager.touch_device("a").await;
        manager.touch_device("b").await;
        manager.touch_device("c").await;

        let status = manager.get_device_status("c").await;
        assert!(!status.connected);
        assert_eq!(status.last_seen, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_idle_devices_release_their_slots() {
        let clock = ManualClock::new();
        let manager = DeviceManager::with_clock(&cache_config(), clock.clone());

        manager.touch_device("a").await;
        manager.touch_device("b").await;
        manager.queue_command("b", json!({"action": "reset"})).await;
        assert_eq!(manager.active_connections(), 2);

        clock.advance(ChronoDuration::seconds(60));
        manager.touch_device("a").await;
        assert_eq!(manager.cleanup_idle_devices().await, 0);

        clock.advance(ChronoDuration::seconds(61));
        assert_eq!(manager.cleanup_idle_devices().await, 1);
        assert!(manager.is_device_connected("a").await);
        assert!(!manager.is_device_connected("b").await);
        // 还有排队命令, 保留 last_seen
        assert!(manager.get_device_status("b").await.last_seen.is_some());

        clock.advance(ChronoDuration::seconds(120));
        assert_eq!(manager.cleanup_idle_devices().await, 1);
        assert_eq!(manager.active_connections(), 0);
        assert!(manager.get_device_status("a").await.last_seen.is_none());

        // 释放的名额可以给新设备
        manager.touch_device("c").await;
        manager.touch_device("d").await;
        assert_eq!(manager.get_connected_devices().await, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_all_statuses_cover_connected_and_configured() {
        let clock = ManualClock::new();
        let manager = DeviceManager::with_clock(&cache_config(), clock.clone());

        manager.register_device_connection("a").await.unwrap();
        manager.set_device_config("b", &config_response("b")).await;
        manager.queue_command("c", json!({})).await;

        let statuses = manager.get_all_device_statuses().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses["a"].connected);
        assert!(!statuses["a"].has_config);
        assert!(statuses["b"].has_config);
        assert_eq!(statuses["b"].firmware_version.as_deref(), Some("1.0.0"));

        clock.advance(ChronoDuration::seconds(120));
        let statuses = manager.get_all_device_statuses().await;
        assert_eq!(statuses.len(), 1);
        assert!(statuses.contains_key("a"));
    }

    #[tokio::test]
    async fn test_unknown_device_status() {
        let manager = DeviceManager::new(&cache_config());
        let status = manager.get_device_status("nobody").await;
        assert!(!status.connected);
        assert!(!status.has_config);
        assert!(status.last_seen.is_none());
        assert_eq!(status.pending_commands, 0);
    }
}
