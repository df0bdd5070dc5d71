//! Local BACnet device
//!
//! Gives the client a device object so it is discoverable: it answers Who-Is
//! with an I-Am and serves ReadProperty on its own device object. Everything
//! else is refused with the appropriate Error, Reject or Abort.

use tracing::{debug, info};

use crate::codec::{abort_reason, error_code, reject_reason, Ack, ConfirmedRequest, Response, UnconfirmedRequest};
use crate::config::DeviceConfig;
use crate::types::{
    ConfirmedService, IAm, ObjectId, ObjectType, PropertyId, PropertyValue, Segmentation,
    MAX_INSTANCE,
};

const MAX_APDU_LENGTH: u32 = 1476;
const PROTOCOL_VERSION: u64 = 1;
const SYSTEM_STATUS_OPERATIONAL: u32 = 0;

/// The device object this client presents on the network
#[derive(Debug, Clone)]
pub struct LocalDevice {
    identity: IAm,
    name: String,
}

impl LocalDevice {
    pub fn new(instance: u32, name: impl Into<String>, vendor_id: u16) -> Self {
        let name = name.into();
        info!("Local BACnet device {} ({})", instance, name);
        Self {
            identity: IAm {
                device: ObjectId::device(instance.min(MAX_INSTANCE)),
                max_apdu: MAX_APDU_LENGTH,
                segmentation: Segmentation::None,
                vendor_id,
            },
            name,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.instance, config.name.clone(), config.vendor_id)
    }

    pub fn instance(&self) -> u32 {
        self.identity.device.instance
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Our I-Am
    pub fn announcement(&self) -> UnconfirmedRequest {
        UnconfirmedRequest::IAm(self.identity.clone())
    }

    /// I-Am to broadcast if we fall inside the Who-Is range.
    ///
    /// A missing limit is treated as unbounded on that side.
    pub fn answer_who_is(&self, low: Option<u32>, high: Option<u32>) -> Option<UnconfirmedRequest> {
        let instance = self.instance();
        let matches = low.is_none_or(|low| instance >= low) && high.is_none_or(|high| instance <= high);
        debug!(?low, ?high, instance, matches, "Who-Is received");
        matches.then(|| self.announcement())
    }

    /// Response to a decoded confirmed request
    pub fn handle_request(&self, request: &ConfirmedRequest) -> Response {
        match request {
            ConfirmedRequest::ReadProperty {
                object,
                property,
                array_index,
            } => self.read_property(*object, *property, *array_index),
            ConfirmedRequest::WriteProperty { object, .. } => {
                if self.is_own(*object) {
                    Response::Error {
                        service: ConfirmedService::WriteProperty,
                        class: error_code::CLASS_PROPERTY,
                        code: error_code::WRITE_ACCESS_DENIED,
                    }
                } else {
                    unknown_object(ConfirmedService::WriteProperty)
                }
            }
            ConfirmedRequest::SubscribeCov { .. } => Response::Reject {
                reason: reject_reason::UNRECOGNIZED_SERVICE,
            },
        }
    }

    /// Response to a confirmed request the codec could not model.
    ///
    /// Known services only end up here when they arrived segmented.
    pub fn handle_unsupported(&self, service: ConfirmedService) -> Response {
        match service {
            ConfirmedService::Other(_) => Response::Reject {
                reason: reject_reason::UNRECOGNIZED_SERVICE,
            },
            _ => Response::Abort {
                reason: abort_reason::SEGMENTATION_NOT_SUPPORTED,
                server: true,
            },
        }
    }

    fn is_own(&self, object: ObjectId) -> bool {
        object.object_type == ObjectType::Device
            && (object.instance == self.instance() || object.instance == MAX_INSTANCE)
    }

    fn read_property(&self, object: ObjectId, property: PropertyId, array_index: Option<u32>) -> Response {
        const SERVICE: ConfirmedService = ConfirmedService::ReadProperty;
        if !self.is_own(object) {
            return unknown_object(SERVICE);
        }

        let device = self.identity.device;
        let value = match property {
            PropertyId::ObjectList => {
                let list = vec![PropertyValue::ObjectId(device)];
                match array_index {
                    None => PropertyValue::Array(list),
                    Some(0) => PropertyValue::Unsigned(list.len() as u64),
                    Some(i) => match list.get(i as usize - 1) {
                        Some(item) => item.clone(),
                        None => return property_error(SERVICE, error_code::INVALID_ARRAY_INDEX),
                    },
                }
            }
            _ if array_index.is_some() => {
                return property_error(SERVICE, error_code::PROPERTY_IS_NOT_AN_ARRAY);
            }
            PropertyId::ObjectIdentifier => PropertyValue::ObjectId(device),
            PropertyId::ObjectName => PropertyValue::CharacterString(self.name.clone()),
            PropertyId::ObjectType => PropertyValue::Enumerated(ObjectType::Device.to_u16() as u32),
            PropertyId::VendorIdentifier => PropertyValue::Unsigned(self.identity.vendor_id as u64),
            PropertyId::MaxApduLengthAccepted => PropertyValue::Unsigned(self.identity.max_apdu as u64),
            PropertyId::SegmentationSupported => {
                PropertyValue::Enumerated(self.identity.segmentation.to_u32())
            }
            PropertyId::ProtocolVersion => PropertyValue::Unsigned(PROTOCOL_VERSION),
            PropertyId::SystemStatus => PropertyValue::Enumerated(SYSTEM_STATUS_OPERATIONAL),
            _ => return property_error(SERVICE, error_code::UNKNOWN_PROPERTY),
        };

        Response::Ack(Ack::ReadProperty {
            object: device,
            property,
            array_index,
            value,
        })
    }
}

fn unknown_object(service: ConfirmedService) -> Response {
    Response::Error {
        service,
        class: error_code::CLASS_OBJECT,
        code: error_code::UNKNOWN_OBJECT,
    }
}

fn property_error(service: ConfirmedService, code: u32) -> Response {
    Response::Error {
        service,
        class: error_code::CLASS_PROPERTY,
        code,
    }
}
