//! Application state management

use anyhow::{Context, Result};
use meshgate_core::{
    Device, EndpointDescriptor, Events, GatewayEvent, LogicalType, NodeDescriptor, Registry, Store,
};
use meshgate_engine::CapabilityManager;
use meshgate_zcl::types::{cluster, on_off, PROFILE_HOME_AUTOMATION};
use meshgate_zcl::{AttributeValue, DataType, MessageRouter, SimulatedNode, SimulatedTransport};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::{Config, SimulatedNodeConfig};
use crate::on_off::OnOffCapability;

/// Shared application state
pub struct AppState {
    /// Gateway core
    pub manager: Arc<CapabilityManager>,
    /// Simulated network the gateway talks to
    pub sim: Arc<SimulatedTransport>,
    /// On/off capability
    pub on_off: Arc<OnOffCapability>,
    /// Persisted state backing the registry and capabilities
    pub store: Store,
    /// Configuration
    pub config: Config,
}

impl AppState {
    /// Create new application state
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let store = Store::load_or_create(Path::new(&config.gateway.state_path))
            .with_context(|| format!("Loading state from {}", config.gateway.state_path))?;

        let registry = Arc::new(Registry::new(Events::default()));
        let router = Arc::new(MessageRouter::new());
        let sim = Arc::new(SimulatedTransport::new(router.clone()));
        for node in &config.simulated_nodes {
            add_simulated_node(&sim, node)?;
        }

        let manager = Arc::new(CapabilityManager::new(
            config.to_manager_config(),
            registry,
            sim.clone(),
            router,
            store.clone(),
        ));
        let on_off = Arc::new(OnOffCapability::new(&manager));
        manager.register(on_off.clone());

        let restored = manager.restore().await?;
        info!(
            nodes = manager.registry().nodes().await.len(),
            capabilities = restored,
            "State restored"
        );

        let state = Arc::new(Self {
            manager,
            sim,
            on_off,
            store,
            config,
        });
        state.spawn_event_logger();
        Ok(state)
    }

    fn spawn_event_logger(&self) {
        let mut rx = self.manager.events().subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => log_event(&event),
                    Err(RecvError::Lagged(missed)) => warn!(missed, "Event logger lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Announce every configured node to the gateway
    pub async fn join_simulated_nodes(&self) -> Result<()> {
        for node in &self.config.simulated_nodes {
            self.manager
                .node_joined(node.address()?, node.short_address)
                .await?;
        }
        Ok(())
    }

    /// Wait until no enumeration is queued or running
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let mut busy = self.manager.enumerator().queued() > 0;
                for node in self.manager.registry().nodes().await {
                    busy |= node.is_enumerating();
                }
                if !busy {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    pub async fn devices(&self) -> Vec<Arc<Device>> {
        self.manager.registry().devices().await
    }

    /// Persist the registry and write the state file
    pub async fn save(&self) -> Result<()> {
        self.manager.persist().await;
        let path = Path::new(&self.config.gateway.state_path);
        self.store.save(path)?;
        info!(path = %path.display(), "Saved state");
        Ok(())
    }

    /// Save periodically until the task is dropped
    pub async fn autosave(self: Arc<Self>) {
        let secs = self.config.gateway.autosave_interval_secs;
        if secs == 0 {
            return;
        }
        let mut interval = tokio::time::interval(Duration::from_secs(secs));
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = self.save().await {
                warn!(error = %e, "Auto-save failed");
            }
        }
    }

    pub fn stop(&self) {
        self.manager.stop();
    }
}

fn log_event(event: &GatewayEvent) {
    match event {
        GatewayEvent::EnumerationFailed { node, device, error } => {
            warn!(node = %node, device = ?device, error = %error, "Enumeration failed");
        }
        GatewayEvent::EnumerationSucceeded(device) => {
            info!(device = %device, "Device enumerated");
        }
        other => debug!(event = ?other, "Gateway event"),
    }
}

fn add_simulated_node(sim: &SimulatedTransport, config: &SimulatedNodeConfig) -> Result<()> {
    let address = config.address()?;
    let mut flags = 0;
    if config.mains_powered {
        flags |= NodeDescriptor::FLAG_MAINS_POWERED | NodeDescriptor::FLAG_RX_ON_WHEN_IDLE;
    }
    let descriptor = NodeDescriptor {
        logical_type: if config.mains_powered {
            LogicalType::Router
        } else {
            LogicalType::EndDevice
        },
        manufacturer_code: config.manufacturer_code,
        mac_capability_flags: flags,
    };

    let mut node = SimulatedNode::new(descriptor);
    for endpoint in &config.endpoints {
        node = node.with_endpoint(EndpointDescriptor {
            endpoint: endpoint.endpoint,
            profile_id: PROFILE_HOME_AUTOMATION,
            device_id: endpoint.device_id,
            device_version: 1,
            in_clusters: endpoint.in_clusters.clone(),
            out_clusters: Vec::new(),
        });
    }
    sim.add_node(address, node);

    for endpoint in &config.endpoints {
        if endpoint.in_clusters.contains(&cluster::ON_OFF) {
            sim.set_attribute(
                address,
                endpoint.endpoint,
                cluster::ON_OFF,
                on_off::ATTR_ON_OFF,
                DataType::Boolean,
                AttributeValue::Bool(endpoint.on),
            );
        }
    }
    debug!(node = %address, endpoints = config.endpoints.len(), "Simulated node added");
    Ok(())
}
