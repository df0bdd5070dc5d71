//! BACnet client
//!
//! Bootstraps the transport, dispatcher, directory and optional local device
//! from a [`ClientConfig`] and exposes the caller-facing API.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::codec::{Ack, ApduCodec, ConfirmedRequest, UnconfirmedRequest};
use crate::collector::InstanceRange;
use crate::config::ClientConfig;
use crate::directory::{Directory, RemoteDeviceEntry};
use crate::dispatcher::Dispatcher;
use crate::error::{ServiceResult, StartupError};
use crate::future::ServiceFuture;
use crate::listener::{NotificationFilter, SubscriptionId};
use crate::local_device::LocalDevice;
use crate::policy::TimeoutPolicy;
use crate::transport::{Transport, UdpTransport};
use crate::types::{DeviceAddress, Destination, Notification, ObjectId, PropertyId, PropertyValue};

/// Handle to a running client. Clones share the same state.
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    dispatcher: Dispatcher,
    directory: Directory,
}

impl Client {
    /// Bind BACnet/IP on the configured interface and start the client
    pub async fn bootstrap(config: ClientConfig) -> Result<Self, StartupError> {
        config.validate()?;
        let transport = UdpTransport::bind(config.bind_addr()?, config.broadcast_addr()?).await?;
        Ok(Self::with_transport(config, Arc::new(transport), Handle::current()))
    }

    /// Start the client on an existing transport
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>, runtime: Handle) -> Self {
        let dispatcher = Dispatcher::new(transport, Arc::new(ApduCodec::new()), runtime);
        let directory = Directory::new(dispatcher.clone(), config.timeout_policy());
        dispatcher.add_announcement_sink(directory.announcement_sink());

        let client = Self {
            config: Arc::new(config),
            dispatcher,
            directory,
        };

        if let Some(device) = &client.config.device {
            let local = LocalDevice::from_config(device);
            let announcement = local.announcement();
            client.dispatcher.set_local_device(Some(local));
            if let Err(e) = client.dispatcher.dispatch_unconfirmed(&Destination::Broadcast, &announcement) {
                warn!("Failed to announce local device: {}", e);
            }
        }

        info!("BACnet client started");
        client
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Confirmed request with the configured timeout policy
    pub fn send_confirmed(&self, destination: &DeviceAddress, request: &ConfirmedRequest) -> ServiceFuture<Ack> {
        self.send_confirmed_with(destination, request, self.config.timeout_policy())
    }

    pub fn send_confirmed_with(
        &self,
        destination: &DeviceAddress,
        request: &ConfirmedRequest,
        policy: TimeoutPolicy,
    ) -> ServiceFuture<Ack> {
        self.dispatcher.dispatch_confirmed(destination, request, policy)
    }

    pub fn send_unconfirmed(&self, destination: &Destination, message: &UnconfirmedRequest) -> ServiceResult<()> {
        self.dispatcher.dispatch_unconfirmed(destination, message)
    }

    /// Broadcast Who-Is and collect every device that answers within
    /// `window`. Each device found is upserted into the directory.
    pub fn discover(&self, window: Duration) -> ServiceFuture<Vec<RemoteDeviceEntry>> {
        self.collect(window, None)
    }

    /// Like [`Client::discover`] for instances in `low..=high` only
    pub fn discover_range(&self, window: Duration, low: u32, high: u32) -> ServiceFuture<Vec<RemoteDeviceEntry>> {
        self.collect(window, Some(InstanceRange::new(low, high)))
    }

    fn collect(&self, window: Duration, range: Option<InstanceRange>) -> ServiceFuture<Vec<RemoteDeviceEntry>> {
        let directory = self.directory.clone();
        self.dispatcher.discover(window, range).map(move |found| {
            Ok(found.iter().map(|announcement| directory.upsert(announcement)).collect())
        })
    }

    /// Cancel a request, or stop a discovery early (it then resolves with
    /// what it found so far)
    pub fn cancel<T>(&self, future: &ServiceFuture<T>)
    where
        T: Clone + Send + 'static,
    {
        self.dispatcher.cancel(future);
    }

    pub fn device(&self, instance: u32) -> ServiceResult<RemoteDeviceEntry> {
        self.directory.lookup(instance)
    }

    pub fn devices(&self) -> Vec<RemoteDeviceEntry> {
        self.directory.list_all()
    }

    pub fn read_property(&self, instance: u32, object: ObjectId, property: PropertyId) -> ServiceFuture<PropertyValue> {
        match self.directory.lookup(instance) {
            Ok(device) => self.directory.read_property(&device, object, property),
            Err(e) => ServiceFuture::ready(Err(e)),
        }
    }

    pub fn write_property(
        &self,
        instance: u32,
        object: ObjectId,
        property: PropertyId,
        value: PropertyValue,
        priority: Option<u8>,
    ) -> ServiceFuture<()> {
        match self.directory.lookup(instance) {
            Ok(device) => self.directory.write_property(&device, object, property, value, priority),
            Err(e) => ServiceFuture::ready(Err(e)),
        }
    }

    pub fn read_object_list(&self, instance: u32) -> ServiceFuture<Vec<ObjectId>> {
        match self.directory.lookup(instance) {
            Ok(device) => self.directory.read_object_list(&device),
            Err(e) => ServiceFuture::ready(Err(e)),
        }
    }

    /// Ask the device to send change-of-value notifications for `object`;
    /// they are delivered to listeners
    pub fn subscribe_cov(
        &self,
        instance: u32,
        object: ObjectId,
        process_id: u32,
        lifetime: Option<u32>,
    ) -> ServiceFuture<()> {
        match self.directory.lookup(instance) {
            Ok(device) => self.directory.subscribe_cov(&device, object, process_id, lifetime),
            Err(e) => ServiceFuture::ready(Err(e)),
        }
    }

    pub fn unsubscribe_cov(&self, instance: u32, object: ObjectId, process_id: u32) -> ServiceFuture<()> {
        match self.directory.lookup(instance) {
            Ok(device) => self.directory.unsubscribe_cov(&device, object, process_id),
            Err(e) => ServiceFuture::ready(Err(e)),
        }
    }

    /// Register a listener for COV and event notifications
    pub fn add_listener<F>(&self, filter: NotificationFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.dispatcher.listeners().subscribe(filter, handler)
    }

    /// Listener delivering into a channel
    pub fn listen(
        &self,
        filter: NotificationFilter,
    ) -> (SubscriptionId, tokio::sync::mpsc::UnboundedReceiver<Notification>) {
        self.dispatcher.listeners().subscribe_channel(filter)
    }

    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        self.dispatcher.listeners().unsubscribe(id)
    }

    /// Evict devices silent for longer than the configured staleness window
    pub fn sweep(&self) -> Vec<u32> {
        self.directory.sweep(self.config.stale_after())
    }

    /// Cancel all outstanding requests, close open discoveries and the
    /// transport. Later calls fail with `Shutdown`.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        info!("BACnet client stopped");
    }
}
