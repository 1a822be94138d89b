//! Node enumeration
//!
//! Walks a node through descriptor discovery, maps its endpoints onto
//! logical devices and hands every device to the registered capabilities.
//! Requests go through a bounded queue drained by a fixed worker pool; a
//! node can only be in the pipeline once at a time.

use meshgate_core::{
    Device, Endpoint, EndpointDescriptor, EnumerationPermit, GatewayEvent, IeeeAddress, Node,
    NodeDescriptor, Registry, RegistryError, Store,
};
use meshgate_zcl::{
    query_active_endpoints, query_node_descriptor, query_simple_descriptor, RetryPolicy,
    Transport, TransportError, DEFAULT_TIMEOUT_MS,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::capability::{release_device, snapshot, CapabilityList};

#[derive(Error, Debug)]
pub enum EnumerationError {
    #[error("Enumeration queue is full")]
    QueueFull,
    #[error("Enumeration of node {0} already in progress")]
    AlreadyInProgress(IeeeAddress),
    #[error("Enumerator is stopped")]
    Stopped,
    #[error("Enumeration timed out after {0:?}")]
    Timeout(Duration),
    #[error("Descriptor discovery failed: {0}")]
    Transport(#[from] TransportError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Enumerator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnumeratorConfig {
    /// Number of worker tasks
    pub workers: usize,
    /// Nodes that may wait for a worker
    pub queue_capacity: usize,
    /// Attempts per descriptor query
    pub attempts: u32,
    /// Deadline of a single attempt in milliseconds
    pub attempt_timeout_ms: u64,
    /// Deadline of the whole discovery pass in milliseconds
    pub timeout_ms: u64,
}

impl Default for EnumeratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            attempts: 3,
            attempt_timeout_ms: DEFAULT_TIMEOUT_MS,
            timeout_ms: 60_000,
        }
    }
}

impl EnumeratorConfig {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
        }
    }
}

/// A queued node together with its claim on enumeration
struct WorkItem {
    node: Arc<Node>,
    permit: EnumerationPermit,
}

struct Context {
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    capabilities: CapabilityList,
    store: Store,
    policy: RetryPolicy,
    timeout: Duration,
}

/// What descriptor discovery learned, committed to the node only once complete
struct Discovery {
    descriptor: NodeDescriptor,
    endpoints: Vec<EndpointDescriptor>,
}

/// Queue-driven enumeration service
pub struct Enumerator {
    tx: mpsc::Sender<WorkItem>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Enumerator {
    /// Create the enumerator and spawn its workers on the current runtime
    pub fn new(
        config: EnumeratorConfig,
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        capabilities: CapabilityList,
        store: Store,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let ctx = Arc::new(Context {
            registry,
            transport,
            capabilities,
            store,
            policy: config.retry_policy(),
            timeout: Duration::from_millis(config.timeout_ms),
        });

        // Without a worker the queue would close and nothing could be enumerated
        if config.workers == 0 {
            warn!("Enumerator configured with no workers, starting one");
        }
        let worker_count = config.workers.max(1);

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..worker_count)
            .map(|worker| {
                let rx = rx.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    loop {
                        let item = rx.lock().await.recv().await;
                        let Some(item) = item else {
                            break;
                        };
                        process(&ctx, item).await;
                    }
                    debug!(worker, "Enumeration worker exiting");
                })
            })
            .collect();

        info!(
            workers = worker_count,
            queue_capacity = config.queue_capacity,
            "Enumerator started"
        );

        Self {
            tx,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a node for enumeration without waiting.
    ///
    /// Fails if the node is already being enumerated or the queue is full;
    /// in both cases nothing is queued.
    pub fn enumerate(&self, node: &Arc<Node>) -> Result<(), EnumerationError> {
        let permit = node
            .try_begin_enumeration()
            .ok_or(EnumerationError::AlreadyInProgress(node.address()))?;

        self.tx
            .try_send(WorkItem {
                node: node.clone(),
                permit,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    warn!(node = %node.address(), "Enumeration queue full");
                    EnumerationError::QueueFull
                }
                TrySendError::Closed(_) => EnumerationError::Stopped,
            })?;

        debug!(node = %node.address(), "Node queued for enumeration");
        Ok(())
    }

    /// Nodes waiting for a worker
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn stop(&self) {
        for worker in self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            worker.abort();
        }
        info!("Enumerator stopped");
    }
}

impl Drop for Enumerator {
    fn drop(&mut self) {
        for worker in self
            .workers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            worker.abort();
        }
    }
}

async fn process(ctx: &Context, item: WorkItem) {
    let WorkItem { node, permit } = item;
    let address = node.address();
    let events = ctx.registry.events();
    events.send(GatewayEvent::EnumerationStarted(address));
    info!(node = %address, "Enumerating node");

    // One deadline bounds discovery and the capability hooks together
    let deadline = Instant::now() + ctx.timeout;
    let outcome = match timeout_at(deadline, discover(ctx, &node)).await {
        Ok(Ok(discovery)) => commit(ctx, &node, discovery).await,
        Ok(Err(e)) => Err(e),
        Err(_) => Err(EnumerationError::Timeout(ctx.timeout)),
    };

    match outcome {
        Ok(devices) => {
            run_hooks(ctx, &devices, deadline).await;
            drop(permit);
            for device in &devices {
                events.send(GatewayEvent::EnumerationSucceeded(device.id()));
            }
            info!(node = %address, devices = devices.len(), "Enumeration complete");
        }
        Err(e) => {
            drop(permit);
            warn!(node = %address, error = %e, "Enumeration failed");
            let error = e.to_string();
            let devices = ctx.registry.devices_on_node(address).await;
            if devices.is_empty() {
                events.send(GatewayEvent::EnumerationFailed {
                    node: address,
                    device: None,
                    error,
                });
            } else {
                for device in devices {
                    events.send(GatewayEvent::EnumerationFailed {
                        node: address,
                        device: Some(device.id()),
                        error: error.clone(),
                    });
                }
            }
        }
    }
}

/// Query node descriptor, endpoint list and every endpoint's descriptor.
///
/// Nothing is written to the node here, so a failed pass leaves it as it was.
async fn discover(ctx: &Context, node: &Node) -> Result<Discovery, EnumerationError> {
    let transport = ctx.transport.as_ref();

    let descriptor = query_node_descriptor(transport, node, ctx.policy).await?;
    let active = query_active_endpoints(transport, node, ctx.policy).await?;

    let mut endpoints = Vec::with_capacity(active.len());
    for endpoint in active {
        let descriptor = query_simple_descriptor(transport, node, endpoint, ctx.policy).await?;
        debug!(
            node = %node.address(),
            endpoint,
            device_id = descriptor.device_id,
            clusters = descriptor.in_clusters.len(),
            "Endpoint discovered"
        );
        endpoints.push(descriptor);
    }

    Ok(Discovery {
        descriptor,
        endpoints,
    })
}

/// Store a completed discovery on the node and re-allocate its devices
async fn commit(
    ctx: &Context,
    node: &Node,
    discovery: Discovery,
) -> Result<Vec<Arc<Device>>, EnumerationError> {
    let endpoints: Vec<Endpoint> = discovery.endpoints.iter().map(|d| d.endpoint).collect();

    // Shrink devices first so they never hold an endpoint the node lacks
    for device in ctx.registry.devices_on_node(node.address()).await {
        let kept: Vec<Endpoint> = device
            .endpoints()
            .await
            .into_iter()
            .filter(|endpoint| endpoints.contains(endpoint))
            .collect();
        device.set_endpoints(kept).await?;
    }

    node.set_descriptor(discovery.descriptor).await;
    node.set_endpoints(endpoints).await;
    for descriptor in discovery.endpoints {
        node.set_endpoint_descriptor(descriptor).await;
    }
    node.touch().await;

    allocate_devices(ctx, node).await
}

/// Group endpoints by their descriptor's device id, lowest endpoint first
pub fn group_endpoints(descriptors: &[EndpointDescriptor]) -> Vec<Vec<Endpoint>> {
    let mut groups: BTreeMap<u16, Vec<Endpoint>> = BTreeMap::new();
    for descriptor in descriptors {
        groups
            .entry(descriptor.device_id)
            .or_default()
            .push(descriptor.endpoint);
    }
    let mut groups: Vec<Vec<Endpoint>> = groups
        .into_values()
        .map(|mut endpoints| {
            endpoints.sort_unstable();
            endpoints
        })
        .collect();
    groups.sort_by_key(|endpoints| endpoints.first().copied());
    groups
}

/// Map endpoint groups onto the node's devices, reusing existing ones
async fn allocate_devices(
    ctx: &Context,
    node: &Node,
) -> Result<Vec<Arc<Device>>, EnumerationError> {
    let address = node.address();
    let groups = group_endpoints(&node.endpoint_descriptors().await);
    let mut existing = ctx.registry.devices_on_node(address).await.into_iter();

    let mut devices = Vec::with_capacity(groups.len());
    for endpoints in groups {
        let device = match existing.next() {
            Some(device) => device,
            None => ctx.registry.create_next_device(address).await?,
        };
        device.set_endpoints(endpoints).await?;
        devices.push(device);
    }

    for surplus in existing {
        release_device(&ctx.capabilities, &ctx.store, &surplus).await;
        info!(device = %surplus.id(), "Removing device no longer backed by an endpoint");
        ctx.registry.remove_device(surplus.id()).await;
    }

    Ok(devices)
}

/// Give every capability a look at every device; failures stay isolated.
///
/// Hooks still running at `deadline` are cut off and the rest are skipped.
async fn run_hooks(ctx: &Context, devices: &[Arc<Device>], deadline: Instant) {
    let capabilities = snapshot(&ctx.capabilities);
    for device in devices {
        for capability in &capabilities {
            if Instant::now() >= deadline {
                warn!(
                    capability = capability.name(),
                    device = %device.id(),
                    "Enumeration deadline passed, capability skipped"
                );
                continue;
            }
            let span = info_span!("capability", capability = capability.name(), device = %device.id());
            match timeout_at(deadline, capability.enumerate_device(device).instrument(span)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    capability = capability.name(),
                    device = %device.id(),
                    error = %e,
                    "Capability enumeration failed"
                ),
                Err(_) => warn!(
                    capability = capability.name(),
                    device = %device.id(),
                    timeout_ms = ctx.timeout.as_millis() as u64,
                    "Capability enumeration cut off by the enumeration deadline"
                ),
            }
        }
    }
}
