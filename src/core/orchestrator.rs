use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::context::AppContext;
use crate::core::device::{AttachedDevice, DeviceEvent};
use crate::core::session::DeviceSession;

/// Owns one session per attached device and reacts to attach and detach
/// notifications.
pub struct Orchestrator {
    ctx: AppContext,
    sessions: HashMap<String, DeviceSession>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            sessions: HashMap::new(),
        }
    }

    /// Process device events until the channel closes or shutdown is
    /// signalled, then close every session.
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<DeviceEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Orchestrator running");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_device_event(event).await,
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        self.shutdown().await;
    }

    pub async fn handle_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Attached(device) => self.handle_device_attached(device).await,
            DeviceEvent::Detached(id) => self.handle_device_detached(&id).await,
        }
    }

    async fn handle_device_attached(&mut self, device: AttachedDevice) {
        info!(device = %device.id, label = %device.label, "Device attached");
        if let Some(previous) = self.sessions.remove(&device.id) {
            warn!(device = %device.id, "Device re-attached, closing stale session");
            previous.close().await;
        }
        let id = device.id.clone();
        let session = DeviceSession::open(device, self.ctx.config.clone());
        self.sessions.insert(id, session);
    }

    async fn handle_device_detached(&mut self, id: &str) {
        match self.sessions.remove(id) {
            Some(session) => {
                info!(device = %id, "Device detached");
                session.close().await;
            }
            None => warn!(device = %id, "Detach for unknown device"),
        }
    }

    pub fn session(&self, id: &str) -> Option<&DeviceSession> {
        self.sessions.get(id)
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn shutdown(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulated::SimulatedDevice;
    use crate::config::AppConfig;

    fn attach(id: &str, device: &SimulatedDevice) -> DeviceEvent {
        DeviceEvent::Attached(AttachedDevice {
            id: id.to_string(),
            label: format!("Device {}", id),
            primary: Box::new(device.service()),
            alternate: None,
        })
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let mut orchestrator = Orchestrator::new(AppContext::new(AppConfig::default()));
        let device = SimulatedDevice::new();

        orchestrator.handle_device_event(attach("a", &device)).await;
        assert_eq!(orchestrator.device_ids(), vec!["a".to_string()]);
        assert!(orchestrator.session("a").is_some());

        orchestrator.handle_device_event(DeviceEvent::Detached("a".into())).await;
        assert!(orchestrator.session("a").is_none());
        assert_eq!(device.stats().shutdowns, 1);
    }

    #[tokio::test]
    async fn test_reattach_replaces_session() {
        let mut orchestrator = Orchestrator::new(AppContext::new(AppConfig::default()));
        let first = SimulatedDevice::new();
        let second = SimulatedDevice::new();

        orchestrator.handle_device_event(attach("a", &first)).await;
        orchestrator.handle_device_event(attach("a", &second)).await;

        assert_eq!(first.stats().shutdowns, 1);
        assert_eq!(second.stats().shutdowns, 0);
        assert_eq!(orchestrator.device_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_run_closes_sessions_on_shutdown() {
        let ctx = AppContext::new(AppConfig::default());
        let shutdown = ctx.subscribe_shutdown();
        let mut orchestrator = Orchestrator::new(ctx.clone());
        let device = SimulatedDevice::new();
        let (tx, rx) = mpsc::channel(8);

        tx.send(attach("a", &device)).await.unwrap();
        let runner = tokio::spawn(async move {
            orchestrator.run(rx, shutdown).await;
            orchestrator
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        ctx.trigger_shutdown();

        let orchestrator = runner.await.unwrap();
        assert!(orchestrator.device_ids().is_empty());
        assert_eq!(device.stats().shutdowns, 1);
    }
}
