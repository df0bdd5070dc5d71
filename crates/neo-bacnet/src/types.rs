//! BACnet types shared by the dispatcher, directory and codec

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Largest valid object instance number (22 bits).
pub const MAX_INSTANCE: u32 = 0x3F_FFFF;

// ─────────────────────────────────────────────────────────────────────────────
// Addressing
// ─────────────────────────────────────────────────────────────────────────────

/// Station on a remote BACnet network, reached through a router.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RemoteStation {
    /// Logical network number
    pub network: u16,
    /// MAC address on that network (empty for a remote broadcast)
    pub mac: Vec<u8>,
}

/// Network address of a BACnet device.
///
/// `link` is the next hop on the local link. `remote` is set when the device
/// lives behind a router on another logical network.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub link: SocketAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteStation>,
}

impl DeviceAddress {
    /// Device on the local link
    pub fn local(link: SocketAddr) -> Self {
        Self { link, remote: None }
    }

    /// Device behind the router at `link`
    pub fn routed(link: SocketAddr, network: u16, mac: impl Into<Vec<u8>>) -> Self {
        Self {
            link,
            remote: Some(RemoteStation {
                network,
                mac: mac.into(),
            }),
        }
    }

    /// Logical network number, if routed
    pub fn network(&self) -> Option<u16> {
        self.remote.as_ref().map(|r| r.network)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.remote {
            None => write!(f, "{}", self.link),
            Some(r) => {
                write!(f, "{}/{}:", self.link, r.network)?;
                for b in &r.mac {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// Where an outbound frame goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Device(DeviceAddress),
    /// Local broadcast on the link
    Broadcast,
}

impl From<DeviceAddress> for Destination {
    fn from(addr: DeviceAddress) -> Self {
        Destination::Device(addr)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Device(addr) => write!(f, "{}", addr),
            Destination::Broadcast => write!(f, "broadcast"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Objects and properties
// ─────────────────────────────────────────────────────────────────────────────

/// BACnet object types
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum ObjectType {
    AnalogInput,
    AnalogOutput,
    AnalogValue,
    BinaryInput,
    BinaryOutput,
    BinaryValue,
    Calendar,
    Device,
    EventEnrollment,
    MultiStateInput,
    MultiStateOutput,
    NotificationClass,
    Schedule,
    MultiStateValue,
    TrendLog,
    Other(u16),
}

impl ObjectType {
    pub fn from_u16(v: u16) -> Self {
        match v {
            0 => Self::AnalogInput,
            1 => Self::AnalogOutput,
            2 => Self::AnalogValue,
            3 => Self::BinaryInput,
            4 => Self::BinaryOutput,
            5 => Self::BinaryValue,
            6 => Self::Calendar,
            8 => Self::Device,
            9 => Self::EventEnrollment,
            13 => Self::MultiStateInput,
            14 => Self::MultiStateOutput,
            15 => Self::NotificationClass,
            17 => Self::Schedule,
            19 => Self::MultiStateValue,
            20 => Self::TrendLog,
            other => Self::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::AnalogInput => 0,
            Self::AnalogOutput => 1,
            Self::AnalogValue => 2,
            Self::BinaryInput => 3,
            Self::BinaryOutput => 4,
            Self::BinaryValue => 5,
            Self::Calendar => 6,
            Self::Device => 8,
            Self::EventEnrollment => 9,
            Self::MultiStateInput => 13,
            Self::MultiStateOutput => 14,
            Self::NotificationClass => 15,
            Self::Schedule => 17,
            Self::MultiStateValue => 19,
            Self::TrendLog => 20,
            Self::Other(v) => v,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectType::AnalogInput => write!(f, "analog-input"),
            ObjectType::AnalogOutput => write!(f, "analog-output"),
            ObjectType::AnalogValue => write!(f, "analog-value"),
            ObjectType::BinaryInput => write!(f, "binary-input"),
            ObjectType::BinaryOutput => write!(f, "binary-output"),
            ObjectType::BinaryValue => write!(f, "binary-value"),
            ObjectType::Calendar => write!(f, "calendar"),
            ObjectType::Device => write!(f, "device"),
            ObjectType::EventEnrollment => write!(f, "event-enrollment"),
            ObjectType::MultiStateInput => write!(f, "multi-state-input"),
            ObjectType::MultiStateOutput => write!(f, "multi-state-output"),
            ObjectType::NotificationClass => write!(f, "notification-class"),
            ObjectType::Schedule => write!(f, "schedule"),
            ObjectType::MultiStateValue => write!(f, "multi-state-value"),
            ObjectType::TrendLog => write!(f, "trend-log"),
            ObjectType::Other(v) => write!(f, "{}", v),
        }
    }
}

impl FromStr for ObjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "analog_input" | "analoginput" | "ai" => Ok(Self::AnalogInput),
            "analog_output" | "analogoutput" | "ao" => Ok(Self::AnalogOutput),
            "analog_value" | "analogvalue" | "av" => Ok(Self::AnalogValue),
            "binary_input" | "binaryinput" | "bi" => Ok(Self::BinaryInput),
            "binary_output" | "binaryoutput" | "bo" => Ok(Self::BinaryOutput),
            "binary_value" | "binaryvalue" | "bv" => Ok(Self::BinaryValue),
            "calendar" => Ok(Self::Calendar),
            "device" | "dev" => Ok(Self::Device),
            "event_enrollment" | "eventenrollment" => Ok(Self::EventEnrollment),
            "multi_state_input" | "multistateinput" | "msi" => Ok(Self::MultiStateInput),
            "multi_state_output" | "multistateoutput" | "mso" => Ok(Self::MultiStateOutput),
            "notification_class" | "notificationclass" => Ok(Self::NotificationClass),
            "schedule" => Ok(Self::Schedule),
            "multi_state_value" | "multistatevalue" | "msv" => Ok(Self::MultiStateValue),
            "trend_log" | "trendlog" => Ok(Self::TrendLog),
            other => other
                .parse::<u16>()
                .ok()
                .filter(|v| *v < 1024)
                .map(Self::from_u16)
                .ok_or_else(|| format!("Unknown object type: {}", s)),
        }
    }
}

/// BACnet object identifier (type + instance)
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ObjectId {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectId {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance: instance & MAX_INSTANCE,
        }
    }

    pub fn device(instance: u32) -> Self {
        Self::new(ObjectType::Device, instance)
    }

    /// Packed wire form: 10 bits of type, 22 bits of instance
    pub fn to_u32(self) -> u32 {
        ((self.object_type.to_u16() as u32) << 22) | (self.instance & MAX_INSTANCE)
    }

    pub fn from_u32(raw: u32) -> Self {
        Self {
            object_type: ObjectType::from_u16((raw >> 22) as u16),
            instance: raw & MAX_INSTANCE,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

impl FromStr for ObjectId {
    type Err = String;

    /// Parses `analog-input:3` style identifiers
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, inst) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("Expected <type>:<instance>, got {}", s))?;
        let instance: u32 = inst
            .parse()
            .map_err(|_| format!("Invalid instance number: {}", inst))?;
        if instance > MAX_INSTANCE {
            return Err(format!("Instance {} out of range", instance));
        }
        Ok(Self::new(ty.parse()?, instance))
    }
}

/// Property identifiers. Treated as opaque keys by the core.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum PropertyId {
    Description,
    EventState,
    MaxApduLengthAccepted,
    ObjectIdentifier,
    ObjectList,
    ObjectName,
    ObjectType,
    OutOfService,
    PresentValue,
    PriorityArray,
    ProtocolServicesSupported,
    ProtocolVersion,
    Reliability,
    SegmentationSupported,
    StatusFlags,
    SystemStatus,
    Units,
    VendorIdentifier,
    VendorName,
    Other(u32),
}

impl PropertyId {
    pub fn from_u32(v: u32) -> Self {
        match v {
            28 => Self::Description,
            36 => Self::EventState,
            62 => Self::MaxApduLengthAccepted,
            75 => Self::ObjectIdentifier,
            76 => Self::ObjectList,
            77 => Self::ObjectName,
            79 => Self::ObjectType,
            81 => Self::OutOfService,
            85 => Self::PresentValue,
            87 => Self::PriorityArray,
            97 => Self::ProtocolServicesSupported,
            98 => Self::ProtocolVersion,
            103 => Self::Reliability,
            107 => Self::SegmentationSupported,
            111 => Self::StatusFlags,
            112 => Self::SystemStatus,
            117 => Self::Units,
            120 => Self::VendorIdentifier,
            121 => Self::VendorName,
            other => Self::Other(other),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::Description => 28,
            Self::EventState => 36,
            Self::MaxApduLengthAccepted => 62,
            Self::ObjectIdentifier => 75,
            Self::ObjectList => 76,
            Self::ObjectName => 77,
            Self::ObjectType => 79,
            Self::OutOfService => 81,
            Self::PresentValue => 85,
            Self::PriorityArray => 87,
            Self::ProtocolServicesSupported => 97,
            Self::ProtocolVersion => 98,
            Self::Reliability => 103,
            Self::SegmentationSupported => 107,
            Self::StatusFlags => 111,
            Self::SystemStatus => 112,
            Self::Units => 117,
            Self::VendorIdentifier => 120,
            Self::VendorName => 121,
            Self::Other(v) => v,
        }
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyId::Description => "description",
            PropertyId::EventState => "event-state",
            PropertyId::MaxApduLengthAccepted => "max-apdu-length-accepted",
            PropertyId::ObjectIdentifier => "object-identifier",
            PropertyId::ObjectList => "object-list",
            PropertyId::ObjectName => "object-name",
            PropertyId::ObjectType => "object-type",
            PropertyId::OutOfService => "out-of-service",
            PropertyId::PresentValue => "present-value",
            PropertyId::PriorityArray => "priority-array",
            PropertyId::ProtocolServicesSupported => "protocol-services-supported",
            PropertyId::ProtocolVersion => "protocol-version",
            PropertyId::Reliability => "reliability",
            PropertyId::SegmentationSupported => "segmentation-supported",
            PropertyId::StatusFlags => "status-flags",
            PropertyId::SystemStatus => "system-status",
            PropertyId::Units => "units",
            PropertyId::VendorIdentifier => "vendor-identifier",
            PropertyId::VendorName => "vendor-name",
            PropertyId::Other(v) => return write!(f, "{}", v),
        };
        f.write_str(name)
    }
}

impl FromStr for PropertyId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "present_value" | "presentvalue" | "pv" => Ok(Self::PresentValue),
            "object_name" | "objectname" | "name" => Ok(Self::ObjectName),
            "object_type" | "objecttype" => Ok(Self::ObjectType),
            "object_identifier" | "objectidentifier" => Ok(Self::ObjectIdentifier),
            "object_list" | "objectlist" => Ok(Self::ObjectList),
            "description" => Ok(Self::Description),
            "status_flags" | "statusflags" => Ok(Self::StatusFlags),
            "event_state" | "eventstate" => Ok(Self::EventState),
            "out_of_service" | "outofservice" => Ok(Self::OutOfService),
            "priority_array" | "priorityarray" => Ok(Self::PriorityArray),
            "units" => Ok(Self::Units),
            "reliability" => Ok(Self::Reliability),
            "vendor_identifier" | "vendorid" => Ok(Self::VendorIdentifier),
            "vendor_name" | "vendorname" => Ok(Self::VendorName),
            "system_status" | "systemstatus" => Ok(Self::SystemStatus),
            "protocol_version" | "protocolversion" => Ok(Self::ProtocolVersion),
            "protocol_services_supported" => Ok(Self::ProtocolServicesSupported),
            "segmentation_supported" => Ok(Self::SegmentationSupported),
            "max_apdu_length_accepted" | "max_apdu" => Ok(Self::MaxApduLengthAccepted),
            other => other
                .parse::<u32>()
                .map(Self::from_u32)
                .map_err(|_| format!("Unknown property: {}", s)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Values
// ─────────────────────────────────────────────────────────────────────────────

/// Calendar date. `0xFF` in any field means "unspecified".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Date {
    /// Years since 1900
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub weekday: u8,
}

/// Time of day. `0xFF` in any field means "unspecified".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Time {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub hundredths: u8,
}

/// Application-tagged property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(String),
    BitString(Vec<bool>),
    Enumerated(u32),
    Date(Date),
    Time(Time),
    ObjectId(ObjectId),
    Array(Vec<PropertyValue>),
}

impl PropertyValue {
    pub fn as_object_ids(&self) -> Vec<ObjectId> {
        match self {
            PropertyValue::ObjectId(oid) => vec![*oid],
            PropertyValue::Array(values) => values
                .iter()
                .filter_map(|v| match v {
                    PropertyValue::ObjectId(oid) => Some(*oid),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::CharacterString(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => write!(f, "null"),
            PropertyValue::Boolean(v) => write!(f, "{}", v),
            PropertyValue::Unsigned(v) => write!(f, "{}", v),
            PropertyValue::Signed(v) => write!(f, "{}", v),
            PropertyValue::Real(v) => write!(f, "{:.2}", v),
            PropertyValue::Double(v) => write!(f, "{:.4}", v),
            PropertyValue::OctetString(v) => write!(f, "{:02x?}", v),
            PropertyValue::CharacterString(v) => write!(f, "\"{}\"", v),
            PropertyValue::BitString(bits) => {
                for b in bits {
                    f.write_str(if *b { "1" } else { "0" })?;
                }
                Ok(())
            }
            PropertyValue::Enumerated(v) => write!(f, "enum({})", v),
            PropertyValue::Date(d) => write!(f, "{}-{:02}-{:02}", 1900 + d.year as u32, d.month, d.day),
            PropertyValue::Time(t) => write!(
                f,
                "{:02}:{:02}:{:02}.{:02}",
                t.hour, t.minute, t.second, t.hundredths
            ),
            PropertyValue::ObjectId(oid) => write!(f, "{}", oid),
            PropertyValue::Array(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Segmentation support advertised in I-Am
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segmentation {
    Both,
    Transmit,
    Receive,
    None,
}

impl Segmentation {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Both,
            1 => Self::Transmit,
            2 => Self::Receive,
            _ => Self::None,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::Both => 0,
            Self::Transmit => 1,
            Self::Receive => 2,
            Self::None => 3,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service tags
// ─────────────────────────────────────────────────────────────────────────────

/// Confirmed service choices understood by the core
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmedService {
    SubscribeCov,
    ReadProperty,
    WriteProperty,
    Other(u8),
}

impl ConfirmedService {
    pub fn from_u8(v: u8) -> Self {
        match v {
            5 => Self::SubscribeCov,
            12 => Self::ReadProperty,
            15 => Self::WriteProperty,
            other => Self::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::SubscribeCov => 5,
            Self::ReadProperty => 12,
            Self::WriteProperty => 15,
            Self::Other(v) => v,
        }
    }
}

/// Unconfirmed service choices understood by the core
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnconfirmedService {
    IAm,
    CovNotification,
    EventNotification,
    WhoIs,
    Other(u8),
}

impl UnconfirmedService {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::IAm,
            2 => Self::CovNotification,
            3 => Self::EventNotification,
            8 => Self::WhoIs,
            other => Self::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::IAm => 0,
            Self::CovNotification => 2,
            Self::EventNotification => 3,
            Self::WhoIs => 8,
            Self::Other(v) => v,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Announcements and notifications
// ─────────────────────────────────────────────────────────────────────────────

/// Identity claimed in an I-Am
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IAm {
    pub device: ObjectId,
    pub max_apdu: u32,
    pub segmentation: Segmentation,
    pub vendor_id: u16,
}

/// An I-Am together with the address it arrived from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAnnouncement {
    pub address: DeviceAddress,
    pub identity: IAm,
    /// Display name, when known from elsewhere (I-Am does not carry one)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DeviceAnnouncement {
    pub fn new(address: DeviceAddress, identity: IAm) -> Self {
        Self {
            address,
            identity,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn instance(&self) -> u32 {
        self.identity.device.instance
    }
}

/// One property value inside a notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyReading {
    pub property: PropertyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_index: Option<u32>,
    pub value: PropertyValue,
}

/// Unconfirmed change-of-value notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovNotification {
    pub process_id: u32,
    pub initiating_device: ObjectId,
    pub monitored_object: ObjectId,
    /// Seconds remaining on the subscription
    pub time_remaining: u32,
    pub values: Vec<PropertyReading>,
}

/// Unconfirmed event (alarm) notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNotification {
    pub process_id: u32,
    pub initiating_device: ObjectId,
    pub event_object: ObjectId,
    pub notification_class: u32,
    pub priority: u8,
    pub event_type: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub notify_type: u32,
    pub to_state: u32,
}

/// Unsolicited message delivered to notification listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Notification {
    Cov {
        source: DeviceAddress,
        notification: CovNotification,
    },
    Event {
        source: DeviceAddress,
        notification: EventNotification,
    },
}

impl Notification {
    pub fn source(&self) -> &DeviceAddress {
        match self {
            Notification::Cov { source, .. } | Notification::Event { source, .. } => source,
        }
    }

    pub fn device_instance(&self) -> u32 {
        match self {
            Notification::Cov { notification, .. } => notification.initiating_device.instance,
            Notification::Event { notification, .. } => notification.initiating_device.instance,
        }
    }

    pub fn object(&self) -> ObjectId {
        match self {
            Notification::Cov { notification, .. } => notification.monitored_object,
            Notification::Event { notification, .. } => notification.event_object,
        }
    }

    /// Properties carried by the notification. Event notifications carry none.
    pub fn properties(&self) -> Vec<PropertyId> {
        match self {
            Notification::Cov { notification, .. } => {
                notification.values.iter().map(|r| r.property).collect()
            }
            Notification::Event { .. } => Vec::new(),
        }
    }
}
