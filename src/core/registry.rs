//! Reference-counted cache of stream bridges, one per device file.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::Result;
use super::gateway::{Channel, DeviceChannelGateway};
use super::stream::{BridgeOptions, StreamBridge};
use crate::config::AppConfig;

type SessionKey = (Channel, String);

/// One live bridge and the number of callers holding it.
struct StreamSession {
    bridge: StreamBridge,
    ref_count: usize,
}

pub struct StreamBridgeRegistry {
    gateway: DeviceChannelGateway,
    config: Arc<AppConfig>,
    sessions: Mutex<HashMap<SessionKey, StreamSession>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl StreamBridgeRegistry {
    pub fn new(gateway: DeviceChannelGateway, config: Arc<AppConfig>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            gateway,
            config,
            sessions: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// URL of a bridge serving `path`, reusing a healthy one when present.
    pub async fn acquire(&self, channel: Channel, path: &str) -> Result<String> {
        let key = (channel, path.to_string());
        let mut sessions = self.sessions.lock().await;

        match sessions.get_mut(&key) {
            Some(session) if session.bridge.is_listening() => {
                session.ref_count += 1;
                debug!(path = %path, ref_count = session.ref_count, "Reusing stream bridge");
                return Ok(session.bridge.url());
            }
            Some(_) => {
                warn!(path = %path, "Stream bridge stopped listening, replacing it");
                if let Some(stale) = sessions.remove(&key) {
                    stale.bridge.abort();
                }
            }
            None => {}
        }

        let options = BridgeOptions {
            chunk_size: self.config.chunk_size(),
            bind_attempts: self.config.stream.bind_attempts,
        };
        let bridge = StreamBridge::start(self.gateway.clone(), channel, path, options).await?;
        let url = bridge.url();
        sessions.insert(
            key,
            StreamSession {
                bridge,
                ref_count: 1,
            },
        );
        Ok(url)
    }

    /// Drop one reference. The last release starts the idle grace period;
    /// the bridge stays up until a sweep finds it idle past that.
    pub async fn release(&self, channel: Channel, path: &str) {
        let key = (channel, path.to_string());
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&key) {
            Some(session) => {
                session.ref_count = session.ref_count.saturating_sub(1);
                if session.ref_count == 0 {
                    session.bridge.touch();
                }
                debug!(path = %path, ref_count = session.ref_count, "Released stream bridge");
            }
            None => debug!(path = %path, "Release for unknown stream bridge"),
        }
    }

    /// Close bridges that are unreferenced and idle past the grace period, and
    /// any whose listener died. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let grace = self.config.idle_grace();
        let mut sessions = self.sessions.lock().await;

        let expired: Vec<SessionKey> = sessions
            .iter()
            .filter(|(_, s)| is_reclaimable(s, grace))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(session) = sessions.remove(key) {
                debug!(path = %key.1, "Reclaiming stream bridge");
                session.bridge.close();
            }
        }
        expired.len()
    }

    pub async fn ref_count(&self, channel: Channel, path: &str) -> Option<usize> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(&(channel, path.to_string()))
            .map(|s| s.ref_count)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close every bridge regardless of references and stop the sweeper.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let mut sessions = self.sessions.lock().await;
        let count = sessions.len();
        for (_, session) in sessions.drain() {
            session.bridge.abort();
        }
        if count > 0 {
            info!(device = %self.gateway.device_id(), bridges = count, "Stream bridges shut down");
        }
    }

    /// Run `cleanup` every sweep interval until `shutdown` is called.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = registry.cleanup().await;
                        if removed > 0 {
                            debug!(removed, "Swept idle stream bridges");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}

fn is_reclaimable(session: &StreamSession, grace: Duration) -> bool {
    if !session.bridge.is_listening() {
        return true;
    }
    session.ref_count == 0
        && session.bridge.active_connections() == 0
        && session.bridge.idle_for() >= grace
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulated::SimulatedDevice;

    fn registry(grace_secs: u64) -> (SimulatedDevice, StreamBridgeRegistry) {
        let device = SimulatedDevice::new();
        device.add_file("/DCIM/clip.mp4", vec![1u8; 1000]);
        device.add_file("/DCIM/other.mp4", vec![2u8; 10]);
        let gateway = DeviceChannelGateway::new("sim", Box::new(device.service()), None);

        let mut config = AppConfig::default();
        config.stream.idle_grace_secs = grace_secs;
        (device, StreamBridgeRegistry::new(gateway, Arc::new(config)))
    }

    #[tokio::test]
    async fn test_acquire_twice_reuses_listener() {
        let (_device, registry) = registry(10);

        let first = registry.acquire(Channel::Primary, "/DCIM/clip.mp4").await.unwrap();
        let second = registry.acquire(Channel::Primary, "/DCIM/clip.mp4").await.unwrap();

        assert_eq!(first, second);
        assert!(first.starts_with("http://127.0.0.1:"));
        assert_eq!(registry.ref_count(Channel::Primary, "/DCIM/clip.mp4").await, Some(2));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_distinct_paths_get_distinct_listeners() {
        let (_device, registry) = registry(10);

        let a = registry.acquire(Channel::Primary, "/DCIM/clip.mp4").await.unwrap();
        let b = registry.acquire(Channel::Primary, "/DCIM/other.mp4").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_release_keeps_entry_within_grace() {
        let (_device, registry) = registry(60);

        let url = registry.acquire(Channel::Primary, "/DCIM/clip.mp4").await.unwrap();
        registry.release(Channel::Primary, "/DCIM/clip.mp4").await;
        assert_eq!(registry.cleanup().await, 0);

        let again = registry.acquire(Channel::Primary, "/DCIM/clip.mp4").await.unwrap();
        assert_eq!(url, again);
    }

    #[tokio::test]
    async fn test_grace_starts_at_last_release() {
        let (_device, registry) = registry(1);

        let url = registry.acquire(Channel::Primary, "/DCIM/clip.mp4").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        registry.release(Channel::Primary, "/DCIM/clip.mp4").await;
        assert_eq!(registry.cleanup().await, 0);

        let again = registry.acquire(Channel::Primary, "/DCIM/clip.mp4").await.unwrap();
        assert_eq!(url, again);
        registry.release(Channel::Primary, "/DCIM/clip.mp4").await;

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(registry.cleanup().await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_reclaims_unreferenced_after_grace() {
        let (_device, registry) = registry(0);

        registry.acquire(Channel::Primary, "/DCIM/clip.mp4").await.unwrap();
        registry.acquire(Channel::Primary, "/DCIM/other.mp4").await.unwrap();
        registry.release(Channel::Primary, "/DCIM/clip.mp4").await;

        assert_eq!(registry.cleanup().await, 1);
        assert_eq!(registry.ref_count(Channel::Primary, "/DCIM/clip.mp4").await, None);
        assert_eq!(registry.ref_count(Channel::Primary, "/DCIM/other.mp4").await, Some(1));
    }

    #[tokio::test]
    async fn test_release_never_goes_negative() {
        let (_device, registry) = registry(10);

        registry.acquire(Channel::Primary, "/DCIM/clip.mp4").await.unwrap();
        registry.release(Channel::Primary, "/DCIM/clip.mp4").await;
        registry.release(Channel::Primary, "/DCIM/clip.mp4").await;
        assert_eq!(registry.ref_count(Channel::Primary, "/DCIM/clip.mp4").await, Some(0));
    }

    #[tokio::test]
    async fn test_dead_listener_is_replaced() {
        let (_device, registry) = registry(60);

        let first = registry.acquire(Channel::Primary, "/DCIM/clip.mp4").await.unwrap();
        {
            let sessions = registry.sessions.lock().await;
            let session = sessions
                .get(&(Channel::Primary, "/DCIM/clip.mp4".to_string()))
                .unwrap();
            session.bridge.abort();
        }

        let second = registry.acquire(Channel::Primary, "/DCIM/clip.mp4").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.ref_count(Channel::Primary, "/DCIM/clip.mp4").await, Some(1));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (_device, registry) = registry(60);

        registry.acquire(Channel::Primary, "/DCIM/clip.mp4").await.unwrap();
        registry.acquire(Channel::Primary, "/DCIM/other.mp4").await.unwrap();
        registry.shutdown().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let (_device, registry) = registry(0);
        let registry = Arc::new(registry);

        let sweeper = registry.spawn_sweeper();
        registry.shutdown().await;
        tokio::time::timeout(Duration::from_secs(2), sweeper)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
