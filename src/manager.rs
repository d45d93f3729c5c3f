//! Lifecycle owner for a set of named proxies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use color_eyre::eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::config::{ProxyConfig, Settings};
use crate::lock;
use crate::proxy::Proxy;

/// Owns the proxies, the shutdown signal and the orderly teardown.
pub struct ProxyManager {
    proxies: Mutex<HashMap<String, Arc<Proxy>>>,
    cancel: CancellationToken,
}

impl ProxyManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            proxies: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Number of proxies currently running.
    pub fn proxy_count(&self) -> usize {
        lock(&self.proxies).len()
    }

    pub fn proxy(&self, name: &str) -> Option<Arc<Proxy>> {
        lock(&self.proxies).get(name).cloned()
    }

    /// Request termination: the running [`ProxyManager::run`] call performs
    /// the ordered teardown and returns.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Start every active proxy from the settings, then park until stopped.
    ///
    /// A proxy that fails to resolve or bind is logged and skipped; the
    /// remaining proxies keep running.
    pub async fn run(self: &Arc<Self>, settings: Settings) -> Result<()> {
        let span = info_span!("manager", channel = "net.proxy_manager");
        let manager = Arc::clone(self);
        async move {
            info!("starting");
            manager.install_signal_handler();

            for config in settings.proxies.iter().filter(|p| p.active) {
                let proxy = Proxy::new(config.clone(), manager.cancel.child_token());
                match proxy.start().await {
                    Ok(()) => {
                        lock(&manager.proxies).insert(config.name.clone(), proxy);
                    }
                    Err(e) => {
                        error!(proxy = %config.name, error = %e, "proxy failed to start");
                    }
                }
            }

            info!(proxies = manager.proxy_count(), "started");

            manager.cancel.cancelled().await;
            manager.shutdown();
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Single-proxy convenience: run with exactly one configuration.
    pub async fn run_single(self: &Arc<Self>, config: ProxyConfig) -> Result<()> {
        self.run(Settings {
            proxies: vec![config],
            ..Settings::default()
        })
        .await
    }

    fn install_signal_handler(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(
            async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("interrupt received");
                        manager.stop();
                    }
                    Err(e) => error!(error = %e, "failed to install interrupt handler"),
                }
            }
            .instrument(info_span!("manager", channel = "net.proxy_manager")),
        );
    }

    /// Stop every proxy in turn and clear the map.
    fn shutdown(&self) {
        info!("stopping now");

        let proxies: Vec<Arc<Proxy>> = {
            let mut map = lock(&self.proxies);
            map.drain().map(|(_, proxy)| proxy).collect()
        };
        for proxy in &proxies {
            proxy.stop();
        }

        info!("stopped");
    }
}
