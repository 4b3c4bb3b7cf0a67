use crate::config::AppConfig;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    shutdown_tx: broadcast::Sender<()>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            shutdown_tx,
        }
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
