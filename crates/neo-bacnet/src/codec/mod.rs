//! Codec boundary
//!
//! Converts typed service messages to and from frame payloads (NPDU + APDU).
//! The dispatcher only sees the [`Codec`] trait; [`ApduCodec`] is the BACnet
//! implementation used by the client.

mod apdu;
mod tags;

pub use apdu::ApduCodec;

use bytes::Bytes;

use crate::error::CodecError;
use crate::types::{
    ConfirmedService, CovNotification, EventNotification, IAm, ObjectId, PropertyId,
    PropertyValue, RemoteStation, UnconfirmedService,
};

/// Confirmed service requests
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmedRequest {
    ReadProperty {
        object: ObjectId,
        property: PropertyId,
        array_index: Option<u32>,
    },
    WriteProperty {
        object: ObjectId,
        property: PropertyId,
        array_index: Option<u32>,
        value: PropertyValue,
        priority: Option<u8>,
    },
    /// Omitting both `issue_confirmed` and `lifetime` cancels the subscription
    SubscribeCov {
        process_id: u32,
        object: ObjectId,
        issue_confirmed: Option<bool>,
        lifetime: Option<u32>,
    },
}

impl ConfirmedRequest {
    pub fn service(&self) -> ConfirmedService {
        match self {
            ConfirmedRequest::ReadProperty { .. } => ConfirmedService::ReadProperty,
            ConfirmedRequest::WriteProperty { .. } => ConfirmedService::WriteProperty,
            ConfirmedRequest::SubscribeCov { .. } => ConfirmedService::SubscribeCov,
        }
    }
}

/// Unconfirmed service messages
#[derive(Debug, Clone, PartialEq)]
pub enum UnconfirmedRequest {
    WhoIs { low: Option<u32>, high: Option<u32> },
    IAm(IAm),
    CovNotification(CovNotification),
    EventNotification(EventNotification),
}

impl UnconfirmedRequest {
    pub fn service(&self) -> UnconfirmedService {
        match self {
            UnconfirmedRequest::WhoIs { .. } => UnconfirmedService::WhoIs,
            UnconfirmedRequest::IAm(_) => UnconfirmedService::IAm,
            UnconfirmedRequest::CovNotification(_) => UnconfirmedService::CovNotification,
            UnconfirmedRequest::EventNotification(_) => UnconfirmedService::EventNotification,
        }
    }
}

/// Positive acknowledgement of a confirmed request
#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    Simple(ConfirmedService),
    ReadProperty {
        object: ObjectId,
        property: PropertyId,
        array_index: Option<u32>,
        value: PropertyValue,
    },
}

/// Any response to a confirmed request
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ack(Ack),
    Error {
        service: ConfirmedService,
        class: u32,
        code: u32,
    },
    Reject {
        reason: u8,
    },
    Abort {
        reason: u8,
        server: bool,
    },
}

/// Decoded application message
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    ConfirmedRequest {
        invoke_id: u8,
        request: ConfirmedRequest,
    },
    /// Confirmed request for a service this codec does not model
    UnsupportedRequest {
        invoke_id: u8,
        service: ConfirmedService,
    },
    ConfirmedResponse {
        invoke_id: u8,
        response: Response,
    },
    Unconfirmed(UnconfirmedRequest),
    /// Well-formed but of no interest to the core (network-layer messages,
    /// segment acks, unmodelled unconfirmed services)
    Ignored(&'static str),
}

/// Decoded frame with its network-layer source, if routed
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub source: Option<RemoteStation>,
    pub message: Decoded,
}

/// Reject reasons used by the local device
pub mod reject_reason {
    pub const UNRECOGNIZED_SERVICE: u8 = 9;
}

/// Abort reasons
pub mod abort_reason {
    pub const SEGMENTATION_NOT_SUPPORTED: u8 = 4;
}

/// Error classes and codes used by the local device
pub mod error_code {
    pub const CLASS_OBJECT: u32 = 1;
    pub const CLASS_PROPERTY: u32 = 2;
    pub const UNKNOWN_OBJECT: u32 = 31;
    pub const UNKNOWN_PROPERTY: u32 = 32;
    pub const WRITE_ACCESS_DENIED: u32 = 40;
    pub const INVALID_ARRAY_INDEX: u32 = 42;
    pub const PROPERTY_IS_NOT_AN_ARRAY: u32 = 50;
}

/// Encoder/decoder for service messages.
///
/// `route` carries the remote network station when the destination is
/// behind a router; `None` addresses the local link.
pub trait Codec: Send + Sync + 'static {
    fn encode_request(
        &self,
        route: Option<&RemoteStation>,
        invoke_id: u8,
        request: &ConfirmedRequest,
    ) -> Result<Bytes, CodecError>;

    fn encode_unconfirmed(
        &self,
        route: Option<&RemoteStation>,
        message: &UnconfirmedRequest,
    ) -> Result<Bytes, CodecError>;

    fn encode_response(
        &self,
        route: Option<&RemoteStation>,
        invoke_id: u8,
        response: &Response,
    ) -> Result<Bytes, CodecError>;

    /// Decode one frame payload. An error means the frame is malformed.
    fn decode(&self, frame: &[u8]) -> Result<DecodedFrame, CodecError>;
}
