//! Remote Directory
//!
//! Registry of discovered devices keyed by instance number, with a lazily
//! populated object list and a property cache per object. Reads through the
//! directory refresh the cache as a side effect of a successful response.
//!
//! Entries handed out are snapshots; they stay valid while the directory
//! keeps changing underneath.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::codec::{Ack, ConfirmedRequest};
use crate::dispatcher::{AnnouncementSink, Dispatcher};
use crate::error::{ServiceError, ServiceResult};
use crate::future::ServiceFuture;
use crate::policy::{Backoff, TimeoutPolicy};
use crate::types::{
    ConfirmedService, DeviceAddress, DeviceAnnouncement, MAX_INSTANCE, ObjectId, ObjectType, PropertyId,
    PropertyValue, Segmentation,
};

/// Whether an ack naming `acked` answers a request for `requested`. The
/// wildcard device instance is answered with the real one.
fn acks_object(requested: ObjectId, acked: ObjectId) -> bool {
    requested == acked
        || (requested.object_type == ObjectType::Device
            && requested.instance == MAX_INSTANCE
            && acked.object_type == ObjectType::Device)
}

/// Cached property value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedValue {
    pub property: PropertyId,
    pub value: PropertyValue,
    /// Monotonic time of the last successful read or write
    #[serde(skip)]
    pub read_at: Instant,
    pub read_at_utc: DateTime<Utc>,
}

/// Snapshot of one object on a remote device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteObjectEntry {
    pub id: ObjectId,
    pub properties: Vec<CachedValue>,
}

impl RemoteObjectEntry {
    pub fn property(&self, property: PropertyId) -> Option<&CachedValue> {
        self.properties.iter().find(|c| c.property == property)
    }
}

/// Snapshot of one remote device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteDeviceEntry {
    pub instance: u32,
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub vendor_id: u16,
    pub max_apdu: u32,
    pub segmentation: Segmentation,
    /// Protocol-services-supported bits, once read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services_supported: Option<Vec<bool>>,
    pub objects: Vec<RemoteObjectEntry>,
    #[serde(skip)]
    pub last_contact: Instant,
    pub last_contact_utc: DateTime<Utc>,
}

impl RemoteDeviceEntry {
    pub fn object(&self, id: ObjectId) -> Option<&RemoteObjectEntry> {
        self.objects.iter().find(|o| o.id == id)
    }

    /// Whether the device advertises `service` (unknown until read)
    pub fn supports(&self, service: ConfirmedService) -> Option<bool> {
        let bits = self.services_supported.as_ref()?;
        Some(bits.get(service.to_u8() as usize).copied().unwrap_or(false))
    }
}

struct RemoteDevice {
    address: DeviceAddress,
    name: Option<String>,
    vendor_id: u16,
    max_apdu: u32,
    segmentation: Segmentation,
    services_supported: Option<Vec<bool>>,
    objects: HashMap<ObjectId, HashMap<PropertyId, CachedValue>>,
    last_contact: Instant,
    last_contact_utc: DateTime<Utc>,
}

impl RemoteDevice {
    fn from_announcement(announcement: &DeviceAnnouncement) -> Self {
        Self {
            address: announcement.address.clone(),
            name: announcement.name.clone(),
            vendor_id: announcement.identity.vendor_id,
            max_apdu: announcement.identity.max_apdu,
            segmentation: announcement.identity.segmentation,
            services_supported: None,
            objects: HashMap::new(),
            last_contact: Instant::now(),
            last_contact_utc: Utc::now(),
        }
    }

    fn touch(&mut self) {
        self.last_contact = Instant::now();
        self.last_contact_utc = Utc::now();
    }

    fn snapshot(&self, instance: u32) -> RemoteDeviceEntry {
        let mut objects: Vec<RemoteObjectEntry> = self
            .objects
            .iter()
            .map(|(id, properties)| {
                let mut properties: Vec<CachedValue> = properties.values().cloned().collect();
                properties.sort_by_key(|c| c.property.to_u32());
                RemoteObjectEntry { id: *id, properties }
            })
            .collect();
        objects.sort_by_key(|o| o.id.to_u32());

        RemoteDeviceEntry {
            instance,
            address: self.address.clone(),
            name: self.name.clone(),
            vendor_id: self.vendor_id,
            max_apdu: self.max_apdu,
            segmentation: self.segmentation,
            services_supported: self.services_supported.clone(),
            objects,
            last_contact: self.last_contact,
            last_contact_utc: self.last_contact_utc,
        }
    }
}

#[derive(Default)]
struct DirectoryState {
    devices: RwLock<HashMap<u32, RemoteDevice>>,
}

impl DirectoryState {
    fn upsert(&self, announcement: &DeviceAnnouncement) -> RemoteDeviceEntry {
        let instance = announcement.instance();
        let mut devices = self.devices.write();

        if let Some(device) = devices.get_mut(&instance) {
            if device.address != announcement.address {
                info!(
                    "Device {} moved from {} to {}",
                    instance, device.address, announcement.address
                );
                device.address = announcement.address.clone();
            }
            if announcement.name.is_some() {
                device.name = announcement.name.clone();
            }
            device.vendor_id = announcement.identity.vendor_id;
            device.max_apdu = announcement.identity.max_apdu;
            device.segmentation = announcement.identity.segmentation;
            device.touch();
            return device.snapshot(instance);
        }

        info!("Discovered device {} at {}", instance, announcement.address);
        let device = RemoteDevice::from_announcement(announcement);
        let entry = device.snapshot(instance);
        devices.insert(instance, device);
        entry
    }

    /// Store a freshly read (or written) value. Ignored if the device has
    /// been evicted in the meantime.
    fn record(&self, instance: u32, object: ObjectId, property: PropertyId, value: PropertyValue) {
        let mut devices = self.devices.write();
        let Some(device) = devices.get_mut(&instance) else {
            return;
        };
        device.touch();
        device.objects.entry(object).or_default().insert(
            property,
            CachedValue {
                property,
                value,
                read_at: Instant::now(),
                read_at_utc: Utc::now(),
            },
        );
    }

    fn invalidate(&self, instance: u32, object: ObjectId, property: PropertyId) {
        let mut devices = self.devices.write();
        if let Some(device) = devices.get_mut(&instance) {
            device.touch();
            if let Some(properties) = device.objects.get_mut(&object) {
                properties.remove(&property);
            }
        }
    }

    fn update<F>(&self, instance: u32, f: F)
    where
        F: FnOnce(&mut RemoteDevice),
    {
        if let Some(device) = self.devices.write().get_mut(&instance) {
            device.touch();
            f(device);
        }
    }
}

/// Directory of remote devices
#[derive(Clone)]
pub struct Directory {
    state: Arc<DirectoryState>,
    dispatcher: Dispatcher,
    policy: TimeoutPolicy,
}

impl Directory {
    /// `policy` applies to every request made through the directory
    pub fn new(dispatcher: Dispatcher, policy: TimeoutPolicy) -> Self {
        Self {
            state: Arc::new(DirectoryState::default()),
            dispatcher,
            policy,
        }
    }

    /// Sink that upserts unsolicited announcements
    pub fn announcement_sink(&self) -> AnnouncementSink {
        let state = Arc::clone(&self.state);
        Arc::new(move |announcement: &DeviceAnnouncement| {
            state.upsert(announcement);
        })
    }

    /// Insert or update by instance number
    pub fn upsert(&self, announcement: &DeviceAnnouncement) -> RemoteDeviceEntry {
        self.state.upsert(announcement)
    }

    pub fn lookup(&self, instance: u32) -> ServiceResult<RemoteDeviceEntry> {
        self.state
            .devices
            .read()
            .get(&instance)
            .map(|device| device.snapshot(instance))
            .ok_or(ServiceError::NotFound(instance))
    }

    /// Point-in-time copy of every entry, ordered by instance
    pub fn list_all(&self) -> Vec<RemoteDeviceEntry> {
        let mut entries: Vec<RemoteDeviceEntry> = self
            .state
            .devices
            .read()
            .iter()
            .map(|(instance, device)| device.snapshot(*instance))
            .collect();
        entries.sort_by_key(|e| e.instance);
        entries
    }

    pub fn len(&self) -> usize {
        self.state.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.devices.read().is_empty()
    }

    pub fn remove(&self, instance: u32) -> bool {
        self.state.devices.write().remove(&instance).is_some()
    }

    /// Evict devices with no successful contact within `staleness`.
    /// Returns the evicted instance numbers.
    pub fn sweep(&self, staleness: Duration) -> Vec<u32> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        let mut addresses = Vec::new();
        {
            let mut devices = self.state.devices.write();
            devices.retain(|instance, device| {
                let fresh = now.saturating_duration_since(device.last_contact) <= staleness;
                if !fresh {
                    evicted.push(*instance);
                    addresses.push(device.address.clone());
                }
                fresh
            });
            // Another live device may have taken over the address
            addresses.retain(|addr| !devices.values().any(|d| &d.address == addr));
        }
        for address in &addresses {
            self.dispatcher.forget(address);
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted stale devices {:?}", evicted);
        }
        evicted.sort_unstable();
        evicted
    }

    /// Cached value, without touching the network
    pub fn cached_property(&self, instance: u32, object: ObjectId, property: PropertyId) -> Option<CachedValue> {
        self.state
            .devices
            .read()
            .get(&instance)?
            .objects
            .get(&object)?
            .get(&property)
            .cloned()
    }

    /// Policy for requests to `device`; routed devices back off exponentially
    pub fn policy_for(&self, device: &RemoteDeviceEntry) -> TimeoutPolicy {
        match (device.address.remote.is_some(), self.policy.backoff) {
            (true, Backoff::Fixed) => self
                .policy
                .with_exponential_backoff(2.0, self.policy.initial_timeout * 8),
            _ => self.policy,
        }
    }

    pub fn read_property(
        &self,
        device: &RemoteDeviceEntry,
        object: ObjectId,
        property: PropertyId,
    ) -> ServiceFuture<PropertyValue> {
        self.read_property_indexed(device, object, property, None)
    }

    /// Read one property (or array element). Whole-property reads refresh
    /// the cache.
    pub fn read_property_indexed(
        &self,
        device: &RemoteDeviceEntry,
        object: ObjectId,
        property: PropertyId,
        array_index: Option<u32>,
    ) -> ServiceFuture<PropertyValue> {
        let request = ConfirmedRequest::ReadProperty {
            object,
            property,
            array_index,
        };
        let state = Arc::clone(&self.state);
        let instance = device.instance;

        self.dispatcher
            .dispatch_confirmed(&device.address, &request, self.policy_for(device))
            .map(move |ack| match ack {
                Ack::ReadProperty {
                    object: acked_object,
                    property: acked,
                    value,
                    ..
                } if acked == property && acks_object(object, acked_object) => {
                    match array_index {
                        None => state.record(instance, object, property, value.clone()),
                        Some(_) => state.update(instance, |_| {}),
                    }
                    Ok(value)
                }
                other => Err(ServiceError::UnexpectedResponse(format!(
                    "expected {} for {}, got {:?}",
                    property, object, other
                ))),
            })
    }

    /// Write a property. On success the cache takes the written value, unless
    /// a priority was given, in which case the cached value is dropped since
    /// the effective value depends on the priority array.
    pub fn write_property(
        &self,
        device: &RemoteDeviceEntry,
        object: ObjectId,
        property: PropertyId,
        value: PropertyValue,
        priority: Option<u8>,
    ) -> ServiceFuture<()> {
        if priority.is_some_and(|p| !(1..=16).contains(&p)) {
            return ServiceFuture::ready(Err(ServiceError::Malformed(format!(
                "write priority {:?} outside 1..=16",
                priority
            ))));
        }
        let request = ConfirmedRequest::WriteProperty {
            object,
            property,
            array_index: None,
            value: value.clone(),
            priority,
        };
        let state = Arc::clone(&self.state);
        let instance = device.instance;

        self.dispatcher
            .dispatch_confirmed(&device.address, &request, self.policy_for(device))
            .map(move |ack| match ack {
                Ack::Simple(ConfirmedService::WriteProperty) => {
                    match priority {
                        None => state.record(instance, object, property, value),
                        Some(_) => state.invalidate(instance, object, property),
                    }
                    Ok(())
                }
                other => Err(ServiceError::UnexpectedResponse(format!("{:?}", other))),
            })
    }

    /// Read the device's object list and make it the set of known objects.
    /// Cached values of objects still listed are kept.
    pub fn read_object_list(&self, device: &RemoteDeviceEntry) -> ServiceFuture<Vec<ObjectId>> {
        let state = Arc::clone(&self.state);
        let instance = device.instance;
        self.read_property(device, ObjectId::device(instance), PropertyId::ObjectList)
            .map(move |value| {
                let ids = value.as_object_ids();
                state.update(instance, |device| {
                    device.objects
                        .retain(|id, _| ids.contains(id) || *id == ObjectId::device(instance));
                    for id in &ids {
                        device.objects.entry(*id).or_default();
                    }
                });
                debug!(device = instance, objects = ids.len(), "Object list read");
                Ok(ids)
            })
    }

    /// Read object-name of the device object and store it as the display name
    pub fn read_device_name(&self, device: &RemoteDeviceEntry) -> ServiceFuture<String> {
        let state = Arc::clone(&self.state);
        let instance = device.instance;
        self.read_property(device, ObjectId::device(instance), PropertyId::ObjectName)
            .map(move |value| {
                let name = value
                    .as_str()
                    .ok_or_else(|| ServiceError::UnexpectedResponse(format!("object-name {}", value)))?
                    .to_string();
                let stored = name.clone();
                state.update(instance, move |device| device.name = Some(stored));
                Ok(name)
            })
    }

    /// Read protocol-services-supported into the entry's service summary
    pub fn read_services_supported(&self, device: &RemoteDeviceEntry) -> ServiceFuture<Vec<bool>> {
        let state = Arc::clone(&self.state);
        let instance = device.instance;
        self.read_property(device, ObjectId::device(instance), PropertyId::ProtocolServicesSupported)
            .map(move |value| match value {
                PropertyValue::BitString(bits) => {
                    let stored = bits.clone();
                    state.update(instance, move |device| device.services_supported = Some(stored));
                    Ok(bits)
                }
                other => Err(ServiceError::UnexpectedResponse(format!(
                    "protocol-services-supported {}",
                    other
                ))),
            })
    }

    /// Subscribe to change-of-value notifications for `object`.
    /// `lifetime` in seconds; `None` asks for an indefinite subscription.
    pub fn subscribe_cov(
        &self,
        device: &RemoteDeviceEntry,
        object: ObjectId,
        process_id: u32,
        lifetime: Option<u32>,
    ) -> ServiceFuture<()> {
        self.cov_request(
            device,
            ConfirmedRequest::SubscribeCov {
                process_id,
                object,
                issue_confirmed: Some(false),
                lifetime: Some(lifetime.unwrap_or(0)),
            },
        )
    }

    pub fn unsubscribe_cov(&self, device: &RemoteDeviceEntry, object: ObjectId, process_id: u32) -> ServiceFuture<()> {
        self.cov_request(
            device,
            ConfirmedRequest::SubscribeCov {
                process_id,
                object,
                issue_confirmed: None,
                lifetime: None,
            },
        )
    }

    fn cov_request(&self, device: &RemoteDeviceEntry, request: ConfirmedRequest) -> ServiceFuture<()> {
        let state = Arc::clone(&self.state);
        let instance = device.instance;
        self.dispatcher
            .dispatch_confirmed(&device.address, &request, self.policy_for(device))
            .map(move |ack| match ack {
                Ack::Simple(ConfirmedService::SubscribeCov) => {
                    state.update(instance, |_| {});
                    Ok(())
                }
                other => Err(ServiceError::UnexpectedResponse(format!("{:?}", other))),
            })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ApduCodec, Codec, Response};
    use crate::future::{Binding, FutureState};
    use crate::transport::MemoryTransport;
    use crate::types::IAm;
    use std::net::SocketAddr;
    use tokio::runtime::Handle;

    const PEER: ([u8; 4], u16) = ([10, 1, 1, 5], 47808);

    fn announcement(instance: u32, addr: SocketAddr) -> DeviceAnnouncement {
        DeviceAnnouncement::new(
            DeviceAddress::local(addr),
            IAm {
                device: ObjectId::device(instance),
                max_apdu: 1476,
                segmentation: Segmentation::None,
                vendor_id: 5,
            },
        )
    }

    fn setup() -> (Directory, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::standalone(([10, 1, 1, 2], 47808).into()));
        let dispatcher = Dispatcher::new(transport.clone(), Arc::new(ApduCodec::new()), Handle::current());
        (Directory::new(dispatcher, TimeoutPolicy::default()), transport)
    }

    fn reply<T: Clone + Send + 'static>(transport: &MemoryTransport, future: &ServiceFuture<T>, response: Response) {
        let Some(Binding::Request { invoke_id, .. }) = future.binding() else {
            panic!("unbound future");
        };
        let frame = ApduCodec::new().encode_response(None, *invoke_id, &response).unwrap();
        transport.inject(PEER.into(), frame);
    }

    fn read_ack(object: ObjectId, property: PropertyId, value: PropertyValue) -> Response {
        Response::Ack(Ack::ReadProperty {
            object,
            property,
            array_index: None,
            value,
        })
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let (directory, _) = setup();
        let a = announcement(100, PEER.into()).with_name("AHU-1");

        directory.upsert(&a);
        let entry = directory.upsert(&a);
        assert_eq!(directory.len(), 1);
        assert_eq!(entry.name.as_deref(), Some("AHU-1"));
    }

    #[tokio::test]
    async fn test_address_change_replaces_entry() {
        let (directory, _) = setup();
        directory.upsert(&announcement(100, PEER.into()).with_name("AHU-1"));
        let moved = directory.upsert(&announcement(100, ([10, 1, 1, 99], 47808).into()));

        assert_eq!(directory.len(), 1);
        assert_eq!(moved.address.link, ([10, 1, 1, 99], 47808).into());
        // A name-less announcement keeps the known name
        assert_eq!(moved.name.as_deref(), Some("AHU-1"));
    }

    #[tokio::test]
    async fn test_lookup_and_snapshot() {
        let (directory, _) = setup();
        assert_eq!(directory.lookup(7), Err(ServiceError::NotFound(7)));

        directory.upsert(&announcement(2, PEER.into()));
        directory.upsert(&announcement(1, PEER.into()));
        let snapshot = directory.list_all();
        directory.upsert(&announcement(3, PEER.into()));

        assert_eq!(snapshot.iter().map(|e| e.instance).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(directory.list_all().len(), 3);
        assert_eq!(directory.lookup(3).unwrap().instance, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_updates_cache() {
        let (directory, transport) = setup();
        let device = directory.upsert(&announcement(100, PEER.into()));
        let ai = ObjectId::new(ObjectType::AnalogInput, 1);

        let read = directory.read_property(&device, ai, PropertyId::PresentValue);
        assert_eq!(read.state(), FutureState::Pending);
        assert!(directory.cached_property(100, ai, PropertyId::PresentValue).is_none());

        reply(&transport, &read, read_ack(ai, PropertyId::PresentValue, PropertyValue::Real(20.5)));
        assert_eq!(read.resolved().await, Ok(PropertyValue::Real(20.5)));

        let cached = directory.cached_property(100, ai, PropertyId::PresentValue).unwrap();
        assert_eq!(cached.value, PropertyValue::Real(20.5));
        let entry = directory.lookup(100).unwrap();
        assert_eq!(
            entry.object(ai).and_then(|o| o.property(PropertyId::PresentValue)),
            Some(&cached)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_read_leaves_cache_alone() {
        let (directory, transport) = setup();
        let device = directory.upsert(&announcement(100, PEER.into()));
        let ai = ObjectId::new(ObjectType::AnalogInput, 9);

        let read = directory.read_property(&device, ai, PropertyId::PresentValue);
        reply(
            &transport,
            &read,
            Response::Error {
                service: ConfirmedService::ReadProperty,
                class: 1,
                code: 31,
            },
        );
        assert_eq!(
            read.resolved().await,
            Err(ServiceError::ProtocolError { class: 1, code: 31 })
        );
        assert!(directory.lookup(100).unwrap().object(ai).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_for_other_object_is_not_cached() {
        let (directory, transport) = setup();
        let device = directory.upsert(&announcement(100, PEER.into()));
        let requested = ObjectId::new(ObjectType::AnalogInput, 9);
        let other = ObjectId::new(ObjectType::AnalogInput, 10);

        let read = directory.read_property(&device, requested, PropertyId::PresentValue);
        reply(
            &transport,
            &read,
            read_ack(other, PropertyId::PresentValue, PropertyValue::Real(21.5)),
        );
        assert!(matches!(
            read.resolved().await,
            Err(ServiceError::UnexpectedResponse(_))
        ));
        assert!(directory.cached_property(100, requested, PropertyId::PresentValue).is_none());
        assert!(directory.cached_property(100, other, PropertyId::PresentValue).is_none());
    }

    #[test]
    fn test_wildcard_device_ack_matches() {
        let real = ObjectId::device(100);
        assert!(acks_object(real, real));
        assert!(acks_object(ObjectId::device(MAX_INSTANCE), real));
        assert!(!acks_object(ObjectId::device(101), real));
        assert!(!acks_object(ObjectId::new(ObjectType::AnalogInput, 9), ObjectId::new(ObjectType::AnalogInput, 10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_updates_cache_optimistically() {
        let (directory, transport) = setup();
        let device = directory.upsert(&announcement(100, PEER.into()));
        let av = ObjectId::new(ObjectType::AnalogValue, 3);

        let write = directory.write_property(&device, av, PropertyId::PresentValue, PropertyValue::Real(22.0), None);
        reply(&transport, &write, Response::Ack(Ack::Simple(ConfirmedService::WriteProperty)));
        assert_eq!(write.resolved().await, Ok(()));
        assert_eq!(
            directory.cached_property(100, av, PropertyId::PresentValue).map(|c| c.value),
            Some(PropertyValue::Real(22.0))
        );

        let commanded = directory.write_property(&device, av, PropertyId::PresentValue, PropertyValue::Real(23.0), Some(8));
        reply(&transport, &commanded, Response::Ack(Ack::Simple(ConfirmedService::WriteProperty)));
        assert_eq!(commanded.resolved().await, Ok(()));
        assert!(directory.cached_property(100, av, PropertyId::PresentValue).is_none());

        let invalid = directory.write_property(&device, av, PropertyId::PresentValue, PropertyValue::Null, Some(17));
        assert!(matches!(invalid.state(), FutureState::Failed(ServiceError::Malformed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_object_list_populates_objects() {
        let (directory, transport) = setup();
        let device = directory.upsert(&announcement(100, PEER.into()));
        let ai = ObjectId::new(ObjectType::AnalogInput, 1);
        let bo = ObjectId::new(ObjectType::BinaryOutput, 2);

        let list = directory.read_object_list(&device);
        reply(
            &transport,
            &list,
            read_ack(
                ObjectId::device(100),
                PropertyId::ObjectList,
                PropertyValue::Array(vec![
                    PropertyValue::ObjectId(ObjectId::device(100)),
                    PropertyValue::ObjectId(ai),
                    PropertyValue::ObjectId(bo),
                ]),
            ),
        );
        assert_eq!(list.resolved().await.unwrap().len(), 3);

        let entry = directory.lookup(100).unwrap();
        assert!(entry.object(ai).is_some() && entry.object(bo).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_stale_devices() {
        let (directory, _) = setup();
        directory.upsert(&announcement(1, PEER.into()));
        tokio::time::advance(Duration::from_secs(300)).await;
        directory.upsert(&announcement(2, PEER.into()));
        tokio::time::advance(Duration::from_secs(400)).await;

        assert_eq!(directory.sweep(Duration::from_secs(600)), vec![1]);
        assert_eq!(directory.list_all().iter().map(|e| e.instance).collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_releases_idle_id_pools() {
        let (directory, transport) = setup();
        let gone = directory.upsert(&announcement(1, PEER.into()));
        let read = directory.read_property(&gone, ObjectId::device(1), PropertyId::ObjectName);
        reply(
            &transport,
            &read,
            read_ack(
                ObjectId::device(1),
                PropertyId::ObjectName,
                PropertyValue::CharacterString("AHU-1".into()),
            ),
        );
        assert!(read.is_terminal());
        assert_eq!(directory.dispatcher.tracked_destinations(), 1);

        tokio::time::advance(Duration::from_secs(700)).await;
        assert_eq!(directory.sweep(Duration::from_secs(600)), vec![1]);
        assert_eq!(directory.dispatcher.tracked_destinations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_routed_devices_back_off() {
        let (directory, _) = setup();
        let routed = DeviceAnnouncement::new(
            DeviceAddress::routed(PEER.into(), 5, vec![0x0A]),
            announcement(50, PEER.into()).identity,
        );
        let entry = directory.upsert(&routed);
        assert!(matches!(directory.policy_for(&entry).backoff, Backoff::Exponential { .. }));

        let local = directory.upsert(&announcement(51, PEER.into()));
        assert_eq!(directory.policy_for(&local), TimeoutPolicy::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_services_supported_summary() {
        let (directory, transport) = setup();
        let device = directory.upsert(&announcement(100, PEER.into()));
        assert_eq!(device.supports(ConfirmedService::ReadProperty), None);

        let mut bits = vec![false; 40];
        bits[12] = true;
        let read = directory.read_services_supported(&device);
        reply(
            &transport,
            &read,
            read_ack(
                ObjectId::device(100),
                PropertyId::ProtocolServicesSupported,
                PropertyValue::BitString(bits),
            ),
        );
        read.resolved().await.unwrap();

        let entry = directory.lookup(100).unwrap();
        assert_eq!(entry.supports(ConfirmedService::ReadProperty), Some(true));
        assert_eq!(entry.supports(ConfirmedService::WriteProperty), Some(false));
    }
}
