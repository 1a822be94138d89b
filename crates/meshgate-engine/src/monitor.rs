//! Attribute monitoring
//!
//! An [`AttributeMonitor`] keeps one (device, cluster, attribute) value fresh
//! for a capability. Attaching tries to bind and configure reporting on the
//! device, falls back to polling when asked to, and listens for reports and
//! read responses addressed to the gateway. The outcome is persisted so the
//! monitor can be resumed after a restart without repeating the handshake.
//!
//! Persisted record (one section per monitor):
//!
//! | key | value |
//! |---|---|
//! | `Endpoint` | remote endpoint |
//! | `LocalEndpoint` | gateway endpoint |
//! | `ClusterId` | cluster |
//! | `AttributeId` | attribute |
//! | `AttributeDataType` | data type code |
//! | `ReportingConfigured` | configure-reporting succeeded |
//! | `PollingConfigured` | a poll job is required |
//! | `PollingInterval` | poll interval in milliseconds |

use futures_util::FutureExt;
use meshgate_core::{
    ClusterId, Device, DeviceId, Endpoint, IeeeAddress, Node, Registry, Section, StoreError,
};
use meshgate_zcl::{
    with_deadline, AttributeId, AttributeValue, DataType, Direction, EndpointPair, ListenerId,
    MessageRouter, ReportingRequest, Transport, TransportError, ZclCommand, ZclMessage,
    DEFAULT_TIMEOUT_MS,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::poller::{PollHandle, PollTarget, Poller};

const KEY_ENDPOINT: &str = "Endpoint";
const KEY_LOCAL_ENDPOINT: &str = "LocalEndpoint";
const KEY_CLUSTER: &str = "ClusterId";
const KEY_ATTRIBUTE: &str = "AttributeId";
const KEY_DATA_TYPE: &str = "AttributeDataType";
const KEY_REPORTING_CONFIGURED: &str = "ReportingConfigured";
const KEY_POLLING_CONFIGURED: &str = "PollingConfigured";
const KEY_POLLING_INTERVAL: &str = "PollingInterval";

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Monitor is already attached, detach it first")]
    AlreadyAttached,
    #[error("Monitor is not attached")]
    NotAttached,
    #[error("Device {0} not found")]
    DeviceNotFound(DeviceId),
    #[error("Node {0} not found")]
    NodeNotFound(IeeeAddress),
    #[error("Persisted monitor configuration unusable: {0}")]
    Config(#[from] StoreError),
    #[error("Persisted data type {0:#04x} is not known")]
    UnknownDataType(u8),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportingMode {
    None,
    AttemptConfigureReporting,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportingConfig {
    pub mode: ReportingMode,
    pub minimum_interval: Duration,
    pub maximum_interval: Duration,
    pub reportable_change: Option<AttributeValue>,
}

impl ReportingConfig {
    pub fn none() -> Self {
        Self {
            mode: ReportingMode::None,
            minimum_interval: Duration::ZERO,
            maximum_interval: Duration::ZERO,
            reportable_change: None,
        }
    }

    pub fn attempt(minimum_interval: Duration, maximum_interval: Duration) -> Self {
        Self {
            mode: ReportingMode::AttemptConfigureReporting,
            minimum_interval,
            maximum_interval,
            reportable_change: None,
        }
    }

    pub fn with_reportable_change(mut self, change: AttributeValue) -> Self {
        self.reportable_change = Some(change);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingMode {
    NeverPoll,
    AlwaysPoll,
    PollIfReportingFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    pub mode: PollingMode,
    pub interval: Duration,
}

impl PollingConfig {
    pub fn never() -> Self {
        Self {
            mode: PollingMode::NeverPoll,
            interval: Duration::ZERO,
        }
    }

    pub fn always(interval: Duration) -> Self {
        Self {
            mode: PollingMode::AlwaysPoll,
            interval,
        }
    }

    pub fn if_reporting_failed(interval: Duration) -> Self {
        Self {
            mode: PollingMode::PollIfReportingFailed,
            interval,
        }
    }
}

/// Whether a poll job is needed given how configuring reporting went
pub fn polling_required(mode: PollingMode, reporting_configured: bool) -> bool {
    match mode {
        PollingMode::NeverPoll => false,
        PollingMode::AlwaysPoll => true,
        PollingMode::PollIfReportingFailed => !reporting_configured,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Unattached,
    Attaching,
    Reporting,
    Polling,
    ReportingAndPolling,
    Neither,
    Detached,
}

impl MonitorState {
    fn settled(reporting: bool, polling: bool) -> Self {
        match (reporting, polling) {
            (true, true) => MonitorState::ReportingAndPolling,
            (true, false) => MonitorState::Reporting,
            (false, true) => MonitorState::Polling,
            (false, false) => MonitorState::Neither,
        }
    }
}

/// What an attached monitor is watching and how
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub device: DeviceId,
    pub endpoints: EndpointPair,
    pub cluster: ClusterId,
    pub attribute: AttributeId,
    pub data_type: DataType,
    pub reporting_configured: bool,
    pub polling_configured: bool,
    pub polling_interval: Duration,
}

impl Attachment {
    fn persist(&self, section: &Section) {
        section.set(KEY_ENDPOINT, self.endpoints.remote);
        section.set(KEY_LOCAL_ENDPOINT, self.endpoints.local);
        section.set(KEY_CLUSTER, self.cluster);
        section.set(KEY_ATTRIBUTE, self.attribute);
        section.set(KEY_DATA_TYPE, self.data_type.as_u8());
        section.set(KEY_REPORTING_CONFIGURED, self.reporting_configured);
        section.set(KEY_POLLING_CONFIGURED, self.polling_configured);
        section.set(KEY_POLLING_INTERVAL, self.polling_interval.as_millis() as u64);
    }

    fn restore(device: DeviceId, section: &Section) -> Result<Self, MonitorError> {
        let data_type: u8 = section.get_uint(KEY_DATA_TYPE)?;
        Ok(Self {
            device,
            endpoints: EndpointPair::new(
                section.get_uint(KEY_LOCAL_ENDPOINT)?,
                section.get_uint(KEY_ENDPOINT)?,
            ),
            cluster: section.get_uint(KEY_CLUSTER)?,
            attribute: section.get_uint(KEY_ATTRIBUTE)?,
            data_type: DataType::from_u8(data_type)
                .ok_or(MonitorError::UnknownDataType(data_type))?,
            reporting_configured: section.get_bool(KEY_REPORTING_CONFIGURED)?,
            polling_configured: section.get_bool(KEY_POLLING_CONFIGURED)?,
            polling_interval: Duration::from_millis(section.get_u64(KEY_POLLING_INTERVAL)?),
        })
    }

    fn filter(&self) -> MessageFilter {
        MessageFilter {
            source: self.device.node,
            local_endpoint: self.endpoints.local,
            remote_endpoint: self.endpoints.remote,
            cluster: self.cluster,
        }
    }
}

/// Matches inbound frames sent by the monitored cluster to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFilter {
    pub source: IeeeAddress,
    pub local_endpoint: Endpoint,
    pub remote_endpoint: Endpoint,
    pub cluster: ClusterId,
}

impl MessageFilter {
    pub fn matches(&self, message: &ZclMessage) -> bool {
        message.source == self.source
            && message.destination_endpoint == self.local_endpoint
            && message.source_endpoint == self.remote_endpoint
            && message.direction == Direction::ServerToClient
            && message.cluster == self.cluster
    }
}

/// Successful values for `attribute` carried by a message
pub fn attribute_values(attribute: AttributeId, command: &ZclCommand) -> Vec<AttributeValue> {
    match command {
        ZclCommand::ReportAttributes(reports) => reports
            .iter()
            .filter(|r| r.attribute == attribute)
            .map(|r| r.value.clone())
            .collect(),
        ZclCommand::ReadAttributesResponse(records) => records
            .iter()
            .filter(|r| r.attribute == attribute)
            .filter_map(|r| r.successful_value().cloned())
            .collect(),
        _ => Vec::new(),
    }
}

/// Receives every fresh value of the monitored attribute
pub type AttributeCallback = Arc<dyn Fn(DeviceId, &AttributeValue) + Send + Sync>;

/// Collaborators shared by every monitor
#[derive(Clone)]
struct MonitorContext {
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    router: Arc<MessageRouter>,
    poller: Arc<Poller>,
    gateway_endpoint: Endpoint,
    operation_timeout: Duration,
}

impl MonitorContext {
    async fn node(&self, device: DeviceId) -> Result<Arc<Node>, MonitorError> {
        let device = self
            .registry
            .get_device(device)
            .await
            .ok_or(MonitorError::DeviceNotFound(device))?;
        device
            .node()
            .ok_or(MonitorError::NodeNotFound(device.ieee_address()))
    }

    /// Read the attribute once and forward a successful value
    async fn read(
        &self,
        attachment: &Attachment,
        callback: &AttributeCallback,
    ) -> Result<(), MonitorError> {
        let node = self.node(attachment.device).await?;
        let records = with_deadline(
            self.operation_timeout,
            self.transport.read_attributes(
                &node,
                attachment.endpoints,
                attachment.cluster,
                &[attachment.attribute],
            ),
        )
        .await?;

        match records
            .get(&attachment.attribute)
            .and_then(|record| record.successful_value())
        {
            Some(value) => callback(attachment.device, value),
            None => debug!(
                device = %attachment.device,
                cluster = attachment.cluster,
                attribute = attachment.attribute,
                "Read returned no usable value"
            ),
        }
        Ok(())
    }
}

/// Builds monitors wired to the gateway's shared collaborators
#[derive(Clone)]
pub struct MonitorFactory {
    context: Arc<MonitorContext>,
}

impl MonitorFactory {
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        router: Arc<MessageRouter>,
        poller: Arc<Poller>,
        gateway_endpoint: Endpoint,
    ) -> Self {
        Self {
            context: Arc::new(MonitorContext {
                registry,
                transport,
                router,
                poller,
                gateway_endpoint,
                operation_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            }),
        }
    }

    /// Deadline applied to every protocol round-trip a monitor makes
    pub fn with_operation_timeout(self, operation_timeout: Duration) -> Self {
        let mut context = (*self.context).clone();
        context.operation_timeout = operation_timeout;
        Self {
            context: Arc::new(context),
        }
    }

    pub fn gateway_endpoint(&self) -> Endpoint {
        self.context.gateway_endpoint
    }

    /// New unattached monitor persisting into `section`
    pub fn create<F>(&self, section: Section, callback: F) -> AttributeMonitor
    where
        F: Fn(DeviceId, &AttributeValue) + Send + Sync + 'static,
    {
        AttributeMonitor {
            context: self.context.clone(),
            section,
            callback: Arc::new(callback),
            inner: Mutex::new(Inner {
                state: MonitorState::Unattached,
                attachment: None,
                listener: None,
                poll: None,
            }),
        }
    }
}

struct Inner {
    state: MonitorState,
    attachment: Option<Attachment>,
    listener: Option<ListenerId>,
    poll: Option<PollHandle>,
}

/// Keeps one attribute of one device fresh for a capability
pub struct AttributeMonitor {
    context: Arc<MonitorContext>,
    section: Section,
    callback: AttributeCallback,
    inner: Mutex<Inner>,
}

impl fmt::Debug for AttributeMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeMonitor")
            .field("section", &self.section.path())
            .finish_non_exhaustive()
    }
}

impl AttributeMonitor {
    pub async fn state(&self) -> MonitorState {
        self.inner.lock().await.state
    }

    pub async fn attachment(&self) -> Option<Attachment> {
        self.inner.lock().await.attachment
    }

    pub fn section(&self) -> &Section {
        &self.section
    }

    /// Start monitoring an attribute on `device`.
    ///
    /// Bind and configure-reporting failures are not errors: they only feed
    /// the decision to poll.
    #[allow(clippy::too_many_arguments)]
    pub async fn attach(
        &self,
        device: &Device,
        remote_endpoint: Endpoint,
        cluster: ClusterId,
        attribute: AttributeId,
        data_type: DataType,
        reporting: ReportingConfig,
        polling: PollingConfig,
    ) -> Result<MonitorState, MonitorError> {
        let mut inner = self.inner.lock().await;
        if inner.attachment.is_some() {
            return Err(MonitorError::AlreadyAttached);
        }
        self.attach_locked(
            &mut inner,
            device,
            remote_endpoint,
            cluster,
            attribute,
            data_type,
            reporting,
            polling,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn attach_locked(
        &self,
        inner: &mut Inner,
        device: &Device,
        remote_endpoint: Endpoint,
        cluster: ClusterId,
        attribute: AttributeId,
        data_type: DataType,
        reporting: ReportingConfig,
        polling: PollingConfig,
    ) -> Result<MonitorState, MonitorError> {
        let node = device
            .node()
            .ok_or(MonitorError::NodeNotFound(device.ieee_address()))?;
        let ctx = &self.context;
        let endpoints = EndpointPair::new(ctx.gateway_endpoint, remote_endpoint);
        inner.state = MonitorState::Attaching;

        let mut reporting_configured = false;
        if reporting.mode == ReportingMode::AttemptConfigureReporting {
            // Configure-reporting is still sent after a failed bind, but
            // without a binding reports are not trusted to arrive
            let bound = match with_deadline(
                ctx.operation_timeout,
                ctx.transport.bind(&node, endpoints, cluster),
            )
            .await
            {
                Ok(()) => true,
                Err(e) => {
                    warn!(device = %device.id(), cluster, error = %e, "Bind failed");
                    false
                }
            };

            let request = ReportingRequest {
                attribute,
                data_type,
                minimum_interval: interval_secs(reporting.minimum_interval),
                maximum_interval: interval_secs(reporting.maximum_interval),
                reportable_change: reporting.reportable_change,
            };
            match with_deadline(
                ctx.operation_timeout,
                ctx.transport
                    .configure_reporting(&node, endpoints, cluster, request),
            )
            .await
            {
                Ok(()) => reporting_configured = bound,
                Err(e) => warn!(
                    device = %device.id(),
                    cluster,
                    attribute,
                    error = %e,
                    "Configure reporting failed"
                ),
            }
        }

        let attachment = Attachment {
            device: device.id(),
            endpoints,
            cluster,
            attribute,
            data_type,
            reporting_configured,
            polling_configured: polling_required(polling.mode, reporting_configured),
            polling_interval: polling.interval,
        };

        self.start(inner, attachment);
        attachment.persist(&self.section);

        info!(
            device = %attachment.device,
            cluster,
            attribute,
            reporting = attachment.reporting_configured,
            polling = attachment.polling_configured,
            "Attribute monitor attached"
        );
        Ok(inner.state)
    }

    /// Register the listener and, if required, the poll job
    fn start(&self, inner: &mut Inner, attachment: Attachment) {
        if attachment.polling_configured {
            let ctx = self.context.clone();
            let callback = self.callback.clone();
            let handle = self.context.poller.add(
                PollTarget::Device(attachment.device),
                attachment.polling_interval,
                move || {
                    let ctx = ctx.clone();
                    let callback = callback.clone();
                    async move {
                        if let Err(e) = ctx.read(&attachment, &callback).await {
                            debug!(device = %attachment.device, error = %e, "Scheduled poll failed");
                        }
                    }
                    .boxed()
                },
            );
            inner.poll = Some(handle);
        }

        let filter = attachment.filter();
        let attribute = attachment.attribute;
        let device = attachment.device;
        let callback = self.callback.clone();
        inner.listener = Some(self.context.router.listen(
            move |message| filter.matches(message),
            move |message| {
                for value in attribute_values(attribute, &message.command) {
                    callback(device, &value);
                }
            },
        ));

        inner.state =
            MonitorState::settled(attachment.reporting_configured, attachment.polling_configured);
        inner.attachment = Some(attachment);
    }

    /// Stop monitoring.
    ///
    /// With `unconfigure` the device is asked to stop reporting (best effort)
    /// and the persisted record is cleared.
    pub async fn detach(&self, unconfigure: bool) -> Result<(), MonitorError> {
        let mut inner = self.inner.lock().await;
        self.detach_locked(&mut inner, unconfigure).await;
        Ok(())
    }

    async fn detach_locked(&self, inner: &mut Inner, unconfigure: bool) {
        if let Some(handle) = inner.poll.take() {
            handle.cancel();
        }

        let attachment = inner.attachment.take();
        if unconfigure {
            if let Some(attachment) = &attachment {
                self.unconfigure(attachment).await;
            }
            self.section.delete();
        }

        if let Some(listener) = inner.listener.take() {
            self.context.router.unlisten(listener);
        }

        if let Some(attachment) = attachment {
            debug!(device = %attachment.device, cluster = attachment.cluster, attribute = attachment.attribute, "Attribute monitor detached");
        }
        inner.state = MonitorState::Detached;
    }

    async fn unconfigure(&self, attachment: &Attachment) {
        let ctx = &self.context;
        let node = match ctx.node(attachment.device).await {
            Ok(node) => node,
            Err(e) => {
                warn!(device = %attachment.device, error = %e, "Cannot cancel reporting");
                return;
            }
        };
        let request = ReportingRequest::cancel(attachment.attribute, attachment.data_type);
        if let Err(e) = with_deadline(
            ctx.operation_timeout,
            ctx.transport
                .configure_reporting(&node, attachment.endpoints, attachment.cluster, request),
        )
        .await
        {
            warn!(device = %attachment.device, cluster = attachment.cluster, error = %e, "Cancel reporting failed");
        }
    }

    /// Read the attribute now, outside the poll schedule
    pub async fn poll(&self) -> Result<(), MonitorError> {
        let attachment = self
            .inner
            .lock()
            .await
            .attachment
            .ok_or(MonitorError::NotAttached)?;
        self.context.read(&attachment, &self.callback).await
    }

    /// Resume a persisted monitor without repeating bind or reporting setup
    pub async fn load(&self, device: &Device) -> Result<MonitorState, MonitorError> {
        let mut inner = self.inner.lock().await;
        if inner.attachment.is_some() {
            return Err(MonitorError::AlreadyAttached);
        }
        let attachment = Attachment::restore(device.id(), &self.section)?;
        self.start(&mut inner, attachment);

        debug!(
            device = %attachment.device,
            cluster = attachment.cluster,
            attribute = attachment.attribute,
            polling = attachment.polling_configured,
            "Attribute monitor loaded"
        );
        Ok(inner.state)
    }

    /// Detach without unconfiguring and attach again to the same attribute
    pub async fn reattach(
        &self,
        reporting: ReportingConfig,
        polling: PollingConfig,
    ) -> Result<MonitorState, MonitorError> {
        let mut inner = self.inner.lock().await;
        let previous = inner.attachment.ok_or(MonitorError::NotAttached)?;
        let device = self
            .context
            .registry
            .get_device(previous.device)
            .await
            .ok_or(MonitorError::DeviceNotFound(previous.device))?;

        self.detach_locked(&mut inner, false).await;
        self.attach_locked(
            &mut inner,
            &device,
            previous.endpoints.remote,
            previous.cluster,
            previous.attribute,
            previous.data_type,
            reporting,
            polling,
        )
        .await
    }
}

/// Reporting intervals go over the air as whole seconds below the cancel value
fn interval_secs(interval: Duration) -> u16 {
    interval
        .as_secs()
        .min(u64::from(ReportingRequest::CANCEL_MAXIMUM_INTERVAL - 1)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::PollerConfig;
    use meshgate_core::{EndpointDescriptor, Events, NodeDescriptor, Store};
    use meshgate_zcl::types::{cluster, on_off, PROFILE_HOME_AUTOMATION};
    use meshgate_zcl::{
        AttributeReport, Operation, ReadAttributeRecord, SimulatedNode, SimulatedTransport,
        ZclStatus,
    };
    use std::sync::Mutex as StdMutex;

    const NODE: IeeeAddress = IeeeAddress(0x00124b0001020304);
    const GATEWAY: Endpoint = 1;
    const REMOTE: Endpoint = 3;

    struct Harness {
        registry: Arc<Registry>,
        sim: Arc<SimulatedTransport>,
        poller: Arc<Poller>,
        factory: MonitorFactory,
        device: Arc<Device>,
        store: Store,
        values: Arc<StdMutex<Vec<AttributeValue>>>,
    }

    impl Harness {
        async fn new() -> Self {
            let registry = Arc::new(Registry::new(Events::default()));
            let router = Arc::new(MessageRouter::new());
            let sim = Arc::new(SimulatedTransport::new(router.clone()));
            sim.add_node(
                NODE,
                SimulatedNode::new(NodeDescriptor::default()).with_endpoint(EndpointDescriptor {
                    endpoint: REMOTE,
                    profile_id: PROFILE_HOME_AUTOMATION,
                    device_id: 0x0100,
                    device_version: 1,
                    in_clusters: vec![cluster::ON_OFF],
                    out_clusters: Vec::new(),
                }),
            );
            sim.set_attribute(
                NODE,
                REMOTE,
                cluster::ON_OFF,
                on_off::ATTR_ON_OFF,
                DataType::Boolean,
                AttributeValue::Bool(true),
            );

            let (node, _) = registry.create_node(NODE).await;
            node.set_endpoints(vec![REMOTE]).await;
            let (device, _) = registry.create_device(NODE, 0).await.unwrap();
            device.set_endpoints(vec![REMOTE]).await.unwrap();

            let poller = Arc::new(Poller::new(PollerConfig::default(), registry.clone()));
            let factory = MonitorFactory::new(
                registry.clone(),
                sim.clone(),
                router,
                poller.clone(),
                GATEWAY,
            )
            .with_operation_timeout(Duration::from_millis(200));

            Self {
                registry,
                sim,
                poller,
                factory,
                device,
                store: Store::new(),
                values: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        fn monitor(&self) -> AttributeMonitor {
            let values = self.values.clone();
            self.factory
                .create(self.store.section("OnOff"), move |_, value| {
                    values.lock().unwrap().push(value.clone())
                })
        }

        async fn attach(
            &self,
            monitor: &AttributeMonitor,
            reporting: ReportingConfig,
            polling: PollingConfig,
        ) -> MonitorState {
            monitor
                .attach(
                    &self.device,
                    REMOTE,
                    cluster::ON_OFF,
                    on_off::ATTR_ON_OFF,
                    DataType::Boolean,
                    reporting,
                    polling,
                )
                .await
                .unwrap()
        }

        fn values(&self) -> Vec<AttributeValue> {
            self.values.lock().unwrap().clone()
        }

        fn inbound(&self, command: ZclCommand) -> ZclMessage {
            ZclMessage {
                source: NODE,
                source_endpoint: REMOTE,
                destination_endpoint: GATEWAY,
                cluster: cluster::ON_OFF,
                direction: Direction::ServerToClient,
                transaction_sequence: 7,
                manufacturer_code: None,
                command,
            }
        }
    }

    fn reporting_60_300() -> ReportingConfig {
        ReportingConfig::attempt(Duration::from_secs(60), Duration::from_secs(300))
    }

    fn report(value: bool) -> ZclCommand {
        ZclCommand::ReportAttributes(vec![AttributeReport {
            attribute: on_off::ATTR_ON_OFF,
            data_type: DataType::Boolean,
            value: AttributeValue::Bool(value),
        }])
    }

    #[test]
    fn test_poll_decision_table() {
        for reporting_configured in [false, true] {
            assert!(!polling_required(PollingMode::NeverPoll, reporting_configured));
            assert!(polling_required(PollingMode::AlwaysPoll, reporting_configured));
            assert_eq!(
                polling_required(PollingMode::PollIfReportingFailed, reporting_configured),
                !reporting_configured
            );
        }
    }

    #[test]
    fn test_filter_rejects_any_single_field_flip() {
        let filter = MessageFilter {
            source: NODE,
            local_endpoint: GATEWAY,
            remote_endpoint: REMOTE,
            cluster: cluster::ON_OFF,
        };
        let base = ZclMessage {
            source: NODE,
            source_endpoint: REMOTE,
            destination_endpoint: GATEWAY,
            cluster: cluster::ON_OFF,
            direction: Direction::ServerToClient,
            transaction_sequence: 0,
            manufacturer_code: None,
            command: report(true),
        };
        assert!(filter.matches(&base));

        let flips: Vec<Box<dyn Fn(&mut ZclMessage)>> = vec![
            Box::new(|m| m.source = IeeeAddress(0xdead)),
            Box::new(|m| m.destination_endpoint = GATEWAY + 1),
            Box::new(|m| m.source_endpoint = REMOTE + 1),
            Box::new(|m| m.direction = Direction::ClientToServer),
            Box::new(|m| m.cluster = cluster::LEVEL_CONTROL),
        ];
        for flip in flips {
            let mut message = base.clone();
            flip(&mut message);
            assert!(!filter.matches(&message));
        }
    }

    #[test]
    fn test_failed_records_yield_nothing() {
        let response = ZclCommand::ReadAttributesResponse(vec![
            ReadAttributeRecord::failure(on_off::ATTR_ON_OFF, ZclStatus::UnsupportedAttribute),
            ReadAttributeRecord::success(0x4003, DataType::Enum8, AttributeValue::Unsigned(1)),
        ]);
        assert!(attribute_values(on_off::ATTR_ON_OFF, &response).is_empty());

        let ok = ZclCommand::ReadAttributesResponse(vec![ReadAttributeRecord::success(
            on_off::ATTR_ON_OFF,
            DataType::Boolean,
            AttributeValue::Bool(false),
        )]);
        assert_eq!(
            attribute_values(on_off::ATTR_ON_OFF, &ok),
            vec![AttributeValue::Bool(false)]
        );
    }

    #[test]
    fn test_interval_secs_stays_below_cancel() {
        assert_eq!(interval_secs(Duration::from_secs(60)), 60);
        assert_eq!(interval_secs(Duration::from_secs(1_000_000)), 0xFFFE);
    }

    #[tokio::test]
    async fn test_reporting_configured_without_polling() {
        let h = Harness::new().await;
        let monitor = h.monitor();

        let state = h.attach(&monitor, reporting_60_300(), PollingConfig::never()).await;
        assert_eq!(state, MonitorState::Reporting);

        let attachment = monitor.attachment().await.unwrap();
        assert!(attachment.reporting_configured);
        assert!(!attachment.polling_configured);
        assert_eq!(h.poller.active_jobs_for(PollTarget::Device(h.device.id())), 0);

        let section = monitor.section();
        assert!(section.get_bool(KEY_REPORTING_CONFIGURED).unwrap());
        assert!(!section.get_bool(KEY_POLLING_CONFIGURED).unwrap());
        assert_eq!(section.get_u64(KEY_LOCAL_ENDPOINT).unwrap(), GATEWAY as u64);

        let request = h
            .sim
            .requests()
            .into_iter()
            .find(|r| r.operation == Operation::ConfigureReporting)
            .and_then(|r| r.reporting)
            .unwrap();
        assert_eq!(request.minimum_interval, 60);
        assert_eq!(request.maximum_interval, 300);
    }

    #[tokio::test]
    async fn test_bind_failure_falls_back_to_polling() {
        let h = Harness::new().await;
        h.sim.fail_always(NODE, Operation::Bind);
        h.sim.fail_always(NODE, Operation::ConfigureReporting);
        let monitor = h.monitor();

        let state = h
            .attach(
                &monitor,
                reporting_60_300(),
                PollingConfig::if_reporting_failed(Duration::from_secs(60)),
            )
            .await;
        assert_eq!(state, MonitorState::Polling);

        let attachment = monitor.attachment().await.unwrap();
        assert!(!attachment.reporting_configured);
        assert!(attachment.polling_configured);
        assert_eq!(monitor.section().get_u64(KEY_POLLING_INTERVAL).unwrap(), 60_000);
        assert_eq!(h.poller.active_jobs_for(PollTarget::Device(h.device.id())), 1);

        // Configure-reporting was still attempted after the bind failed
        assert_eq!(h.sim.request_count(Operation::ConfigureReporting), 1);
    }

    #[tokio::test]
    async fn test_bind_failure_alone_still_polls() {
        let h = Harness::new().await;
        h.sim.fail_always(NODE, Operation::Bind);
        let monitor = h.monitor();

        let state = h
            .attach(
                &monitor,
                reporting_60_300(),
                PollingConfig::if_reporting_failed(Duration::from_secs(60)),
            )
            .await;
        assert_eq!(state, MonitorState::Polling);

        let attachment = monitor.attachment().await.unwrap();
        assert!(!attachment.reporting_configured);
        assert!(attachment.polling_configured);
        assert!(!monitor.section().get_bool(KEY_REPORTING_CONFIGURED).unwrap());
        assert_eq!(h.poller.active_jobs_for(PollTarget::Device(h.device.id())), 1);

        // The device accepted the reporting configuration all the same
        assert_eq!(h.sim.request_count(Operation::ConfigureReporting), 1);
        assert!(h.sim.reporting_configured(NODE, REMOTE, cluster::ON_OFF, on_off::ATTR_ON_OFF));
    }

    #[tokio::test]
    async fn test_attach_twice_is_rejected() {
        let h = Harness::new().await;
        let monitor = h.monitor();
        h.attach(&monitor, ReportingConfig::none(), PollingConfig::never()).await;
        let again = monitor
            .attach(
                &h.device,
                REMOTE,
                cluster::ON_OFF,
                on_off::ATTR_ON_OFF,
                DataType::Boolean,
                ReportingConfig::none(),
                PollingConfig::never(),
            )
            .await;
        assert!(matches!(again, Err(MonitorError::AlreadyAttached)));
    }

    #[tokio::test]
    async fn test_detach_unconfigure_leaves_no_job() {
        let h = Harness::new().await;
        let monitor = h.monitor();
        h.attach(
            &monitor,
            reporting_60_300(),
            PollingConfig::always(Duration::from_secs(30)),
        )
        .await;
        assert_eq!(h.poller.active_jobs_for(PollTarget::Device(h.device.id())), 1);

        monitor.detach(true).await.unwrap();
        assert_eq!(monitor.state().await, MonitorState::Detached);
        assert_eq!(h.poller.active_jobs_for(PollTarget::Device(h.device.id())), 0);
        assert!(!monitor.section().exists());
        assert!(!h.sim.reporting_configured(NODE, REMOTE, cluster::ON_OFF, on_off::ATTR_ON_OFF));

        let cancel = h
            .sim
            .requests()
            .into_iter()
            .filter_map(|r| r.reporting)
            .last()
            .unwrap();
        assert_eq!(cancel.minimum_interval, 0x0000);
        assert_eq!(cancel.maximum_interval, 0xFFFF);

        // No listener left behind
        let before = h.values().len();
        assert_eq!(h.sim.inject(&h.inbound(report(false))), 0);
        assert_eq!(h.values().len(), before);
    }

    #[tokio::test]
    async fn test_detach_tolerates_cancel_failure() {
        let h = Harness::new().await;
        let monitor = h.monitor();
        h.attach(&monitor, reporting_60_300(), PollingConfig::never()).await;
        h.sim.fail_always(NODE, Operation::ConfigureReporting);
        assert!(monitor.detach(true).await.is_ok());
        assert_eq!(monitor.state().await, MonitorState::Detached);
    }

    #[tokio::test]
    async fn test_reports_reach_callback() {
        let h = Harness::new().await;
        let monitor = h.monitor();
        h.attach(&monitor, reporting_60_300(), PollingConfig::never()).await;

        h.sim.set_attribute(
            NODE,
            REMOTE,
            cluster::ON_OFF,
            on_off::ATTR_ON_OFF,
            DataType::Boolean,
            AttributeValue::Bool(false),
        );
        h.sim.inject(&h.inbound(ZclCommand::ReadAttributesResponse(vec![
            ReadAttributeRecord::failure(on_off::ATTR_ON_OFF, ZclStatus::Failure),
        ])));
        h.sim.inject(&h.inbound(report(true)));

        assert_eq!(
            h.values(),
            vec![AttributeValue::Bool(false), AttributeValue::Bool(true)]
        );
    }

    #[tokio::test]
    async fn test_manual_poll() {
        let h = Harness::new().await;
        let monitor = h.monitor();
        assert!(matches!(monitor.poll().await, Err(MonitorError::NotAttached)));

        h.attach(&monitor, ReportingConfig::none(), PollingConfig::never()).await;
        monitor.poll().await.unwrap();
        assert_eq!(h.values(), vec![AttributeValue::Bool(true)]);

        h.sim.fail(NODE, Operation::ReadAttributes, 1);
        assert!(matches!(monitor.poll().await, Err(MonitorError::Transport(_))));
    }

    #[tokio::test]
    async fn test_scheduled_poll_forwards_values() {
        let h = Harness::new().await;
        let monitor = h.monitor();
        h.attach(
            &monitor,
            ReportingConfig::none(),
            PollingConfig::always(Duration::from_millis(20)),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!h.values().is_empty());
        monitor.detach(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_resumes_without_rebinding() {
        let h = Harness::new().await;
        h.sim.fail_always(NODE, Operation::ConfigureReporting);
        let first = h.monitor();
        h.attach(
            &first,
            reporting_60_300(),
            PollingConfig::if_reporting_failed(Duration::from_secs(60)),
        )
        .await;
        first.detach(false).await.unwrap();
        let binds = h.sim.request_count(Operation::Bind);

        let second = h.monitor();
        let state = second.load(&h.device).await.unwrap();
        assert_eq!(state, MonitorState::Polling);
        assert_eq!(h.sim.request_count(Operation::Bind), binds);
        assert_eq!(h.poller.active_jobs_for(PollTarget::Device(h.device.id())), 1);

        h.sim.inject(&h.inbound(report(false)));
        assert_eq!(h.values(), vec![AttributeValue::Bool(false)]);
    }

    #[tokio::test]
    async fn test_load_reporting_only_starts_no_job() {
        let h = Harness::new().await;
        let first = h.monitor();
        h.attach(&first, reporting_60_300(), PollingConfig::if_reporting_failed(Duration::from_secs(60)))
            .await;
        first.detach(false).await.unwrap();

        let second = h.monitor();
        assert_eq!(second.load(&h.device).await.unwrap(), MonitorState::Reporting);
        assert_eq!(h.poller.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_load_missing_record_is_an_error() {
        let h = Harness::new().await;
        let monitor = h.monitor();
        assert!(matches!(
            monitor.load(&h.device).await,
            Err(MonitorError::Config(StoreError::MissingKey { .. }))
        ));

        monitor.section().set(KEY_ENDPOINT, "three");
        assert!(matches!(
            monitor.load(&h.device).await,
            Err(MonitorError::Config(_))
        ));
        assert_eq!(monitor.state().await, MonitorState::Unattached);
    }

    #[tokio::test]
    async fn test_reattach_switches_to_polling() {
        let h = Harness::new().await;
        let monitor = h.monitor();
        h.attach(&monitor, reporting_60_300(), PollingConfig::never()).await;

        let state = monitor
            .reattach(ReportingConfig::none(), PollingConfig::always(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(state, MonitorState::Polling);
        assert_eq!(h.poller.active_jobs(), 1);
        assert_eq!(h.registry.devices().await.len(), 1);
        assert_eq!(monitor.section().get_u64(KEY_POLLING_INTERVAL).unwrap(), 10_000);
    }
}
