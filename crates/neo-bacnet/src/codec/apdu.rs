//! BACnet NPDU + APDU codec
//!
//! Covers the services the dispatcher and local device use. Segmented
//! messages are not reassembled: a segmented complex ack is turned into a
//! server abort so the waiting request fails instead of timing out.

use bytes::{BufMut, Bytes, BytesMut};

use super::tags::{TagReader, TagWriter};
use super::{
    abort_reason, Ack, Codec, ConfirmedRequest, Decoded, DecodedFrame, Response,
    UnconfirmedRequest,
};
use crate::error::CodecError;
use crate::types::{
    ConfirmedService, CovNotification, EventNotification, IAm, PropertyId, PropertyReading,
    RemoteStation, Segmentation, UnconfirmedService,
};

const NPDU_VERSION: u8 = 0x01;

/// NPDU control bits
mod control {
    pub const NETWORK_MESSAGE: u8 = 0x80;
    pub const DNET_PRESENT: u8 = 0x20;
    pub const SNET_PRESENT: u8 = 0x08;
    pub const EXPECTING_REPLY: u8 = 0x04;
}

/// APDU types (high nibble of the first octet)
mod pdu_type {
    pub const CONFIRMED_REQUEST: u8 = 0x00;
    pub const UNCONFIRMED_REQUEST: u8 = 0x10;
    pub const SIMPLE_ACK: u8 = 0x20;
    pub const COMPLEX_ACK: u8 = 0x30;
    pub const SEGMENT_ACK: u8 = 0x40;
    pub const ERROR: u8 = 0x50;
    pub const REJECT: u8 = 0x60;
    pub const ABORT: u8 = 0x70;
}

const FLAG_SEGMENTED: u8 = 0x08;
const FLAG_SEGMENTED_ACCEPTED: u8 = 0x02;
const FLAG_ABORT_SERVER: u8 = 0x01;

/// Max APDU code 5 = 1476 octets (BACnet/IP)
const MAX_APDU_1476: u8 = 0x05;

/// Codec for BACnet/IP payloads
#[derive(Debug, Clone)]
pub struct ApduCodec {
    /// Max-APDU-length-accepted code sent with confirmed requests
    max_apdu_code: u8,
    hop_count: u8,
}

impl Default for ApduCodec {
    fn default() -> Self {
        Self {
            max_apdu_code: MAX_APDU_1476,
            hop_count: 255,
        }
    }
}

impl ApduCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_npdu(&self, buf: &mut BytesMut, route: Option<&RemoteStation>, expecting_reply: bool) {
        let mut ctrl = 0u8;
        if expecting_reply {
            ctrl |= control::EXPECTING_REPLY;
        }
        if route.is_some() {
            ctrl |= control::DNET_PRESENT;
        }
        buf.put_u8(NPDU_VERSION);
        buf.put_u8(ctrl);
        if let Some(station) = route {
            buf.put_u16(station.network);
            buf.put_u8(station.mac.len() as u8);
            buf.put_slice(&station.mac);
            buf.put_u8(self.hop_count);
        }
    }

    /// Parse the NPDU header, returning the routed source and the APDU offset
    fn read_npdu(frame: &[u8]) -> Result<(Option<RemoteStation>, bool, usize), CodecError> {
        let byte = |at: usize| frame.get(at).copied().ok_or(CodecError::Truncated(at));

        let version = byte(0)?;
        if version != NPDU_VERSION {
            return Err(CodecError::Version(version));
        }
        let ctrl = byte(1)?;
        let mut at = 2;

        let has_dnet = ctrl & control::DNET_PRESENT != 0;
        if has_dnet {
            let dlen = byte(at + 2)? as usize;
            at += 3 + dlen;
        }

        let mut source = None;
        if ctrl & control::SNET_PRESENT != 0 {
            let network = u16::from_be_bytes([byte(at)?, byte(at + 1)?]);
            let slen = byte(at + 2)? as usize;
            let start = at + 3;
            let mac = frame
                .get(start..start + slen)
                .ok_or(CodecError::Truncated(start))?
                .to_vec();
            source = Some(RemoteStation { network, mac });
            at = start + slen;
        }

        if has_dnet {
            // hop count
            byte(at)?;
            at += 1;
        }

        let network_message = ctrl & control::NETWORK_MESSAGE != 0;
        Ok((source, network_message, at))
    }

    fn decode_apdu(&self, apdu: &[u8]) -> Result<Decoded, CodecError> {
        let byte = |at: usize| apdu.get(at).copied().ok_or(CodecError::Truncated(at));
        let first = byte(0)?;

        match first & 0xF0 {
            pdu_type::CONFIRMED_REQUEST => {
                let invoke_id = byte(2)?;
                if first & FLAG_SEGMENTED != 0 {
                    // Cannot reassemble; the local device answers with an abort
                    let service = ConfirmedService::from_u8(byte(5)?);
                    return Ok(Decoded::UnsupportedRequest { invoke_id, service });
                }
                let service = ConfirmedService::from_u8(byte(3)?);
                let data = &apdu[4..];
                match decode_confirmed_request(service, data) {
                    Some(request) => Ok(Decoded::ConfirmedRequest {
                        invoke_id,
                        request: request?,
                    }),
                    None => Ok(Decoded::UnsupportedRequest { invoke_id, service }),
                }
            }
            pdu_type::UNCONFIRMED_REQUEST => {
                let service = UnconfirmedService::from_u8(byte(1)?);
                let data = &apdu[2..];
                let message = match service {
                    UnconfirmedService::WhoIs => decode_who_is(data)?,
                    UnconfirmedService::IAm => UnconfirmedRequest::IAm(decode_i_am(data)?),
                    UnconfirmedService::CovNotification => {
                        UnconfirmedRequest::CovNotification(decode_cov_notification(data)?)
                    }
                    UnconfirmedService::EventNotification => {
                        UnconfirmedRequest::EventNotification(decode_event_notification(data)?)
                    }
                    UnconfirmedService::Other(_) => {
                        return Ok(Decoded::Ignored("unmodelled unconfirmed service"));
                    }
                };
                Ok(Decoded::Unconfirmed(message))
            }
            pdu_type::SIMPLE_ACK => Ok(Decoded::ConfirmedResponse {
                invoke_id: byte(1)?,
                response: Response::Ack(Ack::Simple(ConfirmedService::from_u8(byte(2)?))),
            }),
            pdu_type::COMPLEX_ACK => {
                let invoke_id = byte(1)?;
                if first & FLAG_SEGMENTED != 0 {
                    return Ok(Decoded::ConfirmedResponse {
                        invoke_id,
                        response: Response::Abort {
                            reason: abort_reason::SEGMENTATION_NOT_SUPPORTED,
                            server: true,
                        },
                    });
                }
                let service = ConfirmedService::from_u8(byte(2)?);
                let ack = match service {
                    ConfirmedService::ReadProperty => decode_read_property_ack(&apdu[3..])?,
                    other => {
                        return Err(CodecError::InvalidValue(format!(
                            "complex ack for unmodelled service {:?}",
                            other
                        )));
                    }
                };
                Ok(Decoded::ConfirmedResponse {
                    invoke_id,
                    response: Response::Ack(ack),
                })
            }
            pdu_type::SEGMENT_ACK => Ok(Decoded::Ignored("segment ack")),
            pdu_type::ERROR => {
                let invoke_id = byte(1)?;
                let service = ConfirmedService::from_u8(byte(2)?);
                let mut reader = TagReader::new(&apdu[3..]);
                // Some services wrap the error in context tag 0
                let wrapped = reader.at_opening(0);
                if wrapped {
                    reader.expect_opening(0)?;
                }
                let class = reader.app_enumerated()?;
                let code = reader.app_enumerated()?;
                Ok(Decoded::ConfirmedResponse {
                    invoke_id,
                    response: Response::Error {
                        service,
                        class,
                        code,
                    },
                })
            }
            pdu_type::REJECT => Ok(Decoded::ConfirmedResponse {
                invoke_id: byte(1)?,
                response: Response::Reject { reason: byte(2)? },
            }),
            pdu_type::ABORT => Ok(Decoded::ConfirmedResponse {
                invoke_id: byte(1)?,
                response: Response::Abort {
                    reason: byte(2)?,
                    server: first & FLAG_ABORT_SERVER != 0,
                },
            }),
            other => Err(CodecError::UnknownPdu(other)),
        }
    }
}

impl Codec for ApduCodec {
    fn encode_request(
        &self,
        route: Option<&RemoteStation>,
        invoke_id: u8,
        request: &ConfirmedRequest,
    ) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(64);
        self.write_npdu(&mut buf, route, true);

        buf.put_u8(pdu_type::CONFIRMED_REQUEST | FLAG_SEGMENTED_ACCEPTED);
        buf.put_u8(self.max_apdu_code & 0x0F);
        buf.put_u8(invoke_id);
        buf.put_u8(request.service().to_u8());

        let mut w = TagWriter::new(&mut buf);
        match request {
            ConfirmedRequest::ReadProperty {
                object,
                property,
                array_index,
            } => {
                w.ctx_object_id(0, *object);
                w.ctx_enumerated(1, property.to_u32());
                if let Some(index) = array_index {
                    w.ctx_unsigned(2, *index as u64);
                }
            }
            ConfirmedRequest::WriteProperty {
                object,
                property,
                array_index,
                value,
                priority,
            } => {
                w.ctx_object_id(0, *object);
                w.ctx_enumerated(1, property.to_u32());
                if let Some(index) = array_index {
                    w.ctx_unsigned(2, *index as u64);
                }
                w.opening(3);
                w.app_value(value);
                w.closing(3);
                if let Some(priority) = priority {
                    if !(1..=16).contains(priority) {
                        return Err(CodecError::InvalidValue(format!(
                            "write priority {} outside 1..=16",
                            priority
                        )));
                    }
                    w.ctx_unsigned(4, *priority as u64);
                }
            }
            ConfirmedRequest::SubscribeCov {
                process_id,
                object,
                issue_confirmed,
                lifetime,
            } => {
                w.ctx_unsigned(0, *process_id as u64);
                w.ctx_object_id(1, *object);
                if let Some(confirmed) = issue_confirmed {
                    w.ctx_bool(2, *confirmed);
                }
                if let Some(lifetime) = lifetime {
                    w.ctx_unsigned(3, *lifetime as u64);
                }
            }
        }
        Ok(buf.freeze())
    }

    fn encode_unconfirmed(
        &self,
        route: Option<&RemoteStation>,
        message: &UnconfirmedRequest,
    ) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(64);
        self.write_npdu(&mut buf, route, false);
        buf.put_u8(pdu_type::UNCONFIRMED_REQUEST);
        buf.put_u8(message.service().to_u8());

        let mut w = TagWriter::new(&mut buf);
        match message {
            UnconfirmedRequest::WhoIs { low, high } => match (low, high) {
                (Some(low), Some(high)) => {
                    w.ctx_unsigned(0, *low as u64);
                    w.ctx_unsigned(1, *high as u64);
                }
                (None, None) => {}
                _ => {
                    return Err(CodecError::InvalidValue(
                        "Who-Is limits must be given together".into(),
                    ));
                }
            },
            UnconfirmedRequest::IAm(i_am) => {
                w.app_object_id(i_am.device);
                w.app_unsigned(i_am.max_apdu as u64);
                w.app_enumerated(i_am.segmentation.to_u32());
                w.app_unsigned(i_am.vendor_id as u64);
            }
            UnconfirmedRequest::CovNotification(n) => {
                w.ctx_unsigned(0, n.process_id as u64);
                w.ctx_object_id(1, n.initiating_device);
                w.ctx_object_id(2, n.monitored_object);
                w.ctx_unsigned(3, n.time_remaining as u64);
                w.opening(4);
                for reading in &n.values {
                    w.ctx_enumerated(0, reading.property.to_u32());
                    if let Some(index) = reading.array_index {
                        w.ctx_unsigned(1, index as u64);
                    }
                    w.opening(2);
                    w.app_value(&reading.value);
                    w.closing(2);
                }
                w.closing(4);
            }
            UnconfirmedRequest::EventNotification(n) => {
                w.ctx_unsigned(0, n.process_id as u64);
                w.ctx_object_id(1, n.initiating_device);
                w.ctx_object_id(2, n.event_object);
                // Timestamp as sequence number choice
                w.opening(3);
                w.ctx_unsigned(1, 0);
                w.closing(3);
                w.ctx_unsigned(4, n.notification_class as u64);
                w.ctx_unsigned(5, n.priority as u64);
                w.ctx_enumerated(6, n.event_type);
                if let Some(message) = &n.message {
                    w.ctx_string(7, message);
                }
                w.ctx_enumerated(8, n.notify_type);
                w.ctx_enumerated(11, n.to_state);
            }
        }
        Ok(buf.freeze())
    }

    fn encode_response(
        &self,
        route: Option<&RemoteStation>,
        invoke_id: u8,
        response: &Response,
    ) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(64);
        self.write_npdu(&mut buf, route, false);

        match response {
            Response::Ack(Ack::Simple(service)) => {
                buf.put_u8(pdu_type::SIMPLE_ACK);
                buf.put_u8(invoke_id);
                buf.put_u8(service.to_u8());
            }
            Response::Ack(Ack::ReadProperty {
                object,
                property,
                array_index,
                value,
            }) => {
                buf.put_u8(pdu_type::COMPLEX_ACK);
                buf.put_u8(invoke_id);
                buf.put_u8(ConfirmedService::ReadProperty.to_u8());
                let mut w = TagWriter::new(&mut buf);
                w.ctx_object_id(0, *object);
                w.ctx_enumerated(1, property.to_u32());
                if let Some(index) = array_index {
                    w.ctx_unsigned(2, *index as u64);
                }
                w.opening(3);
                w.app_value(value);
                w.closing(3);
            }
            Response::Error {
                service,
                class,
                code,
            } => {
                buf.put_u8(pdu_type::ERROR);
                buf.put_u8(invoke_id);
                buf.put_u8(service.to_u8());
                let mut w = TagWriter::new(&mut buf);
                w.app_enumerated(*class);
                w.app_enumerated(*code);
            }
            Response::Reject { reason } => {
                buf.put_u8(pdu_type::REJECT);
                buf.put_u8(invoke_id);
                buf.put_u8(*reason);
            }
            Response::Abort { reason, server } => {
                let flags = if *server { FLAG_ABORT_SERVER } else { 0 };
                buf.put_u8(pdu_type::ABORT | flags);
                buf.put_u8(invoke_id);
                buf.put_u8(*reason);
            }
        }
        Ok(buf.freeze())
    }

    fn decode(&self, frame: &[u8]) -> Result<DecodedFrame, CodecError> {
        let (source, network_message, offset) = Self::read_npdu(frame)?;
        if network_message {
            return Ok(DecodedFrame {
                source,
                message: Decoded::Ignored("network layer message"),
            });
        }
        let apdu = frame.get(offset..).unwrap_or_default();
        if apdu.is_empty() {
            return Err(CodecError::Truncated(offset));
        }
        let message = self.decode_apdu(apdu)?;
        Ok(DecodedFrame { source, message })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service bodies
// ─────────────────────────────────────────────────────────────────────────────

/// `None` when the service is not modelled
fn decode_confirmed_request(
    service: ConfirmedService,
    data: &[u8],
) -> Option<Result<ConfirmedRequest, CodecError>> {
    let mut r = TagReader::new(data);
    match service {
        ConfirmedService::ReadProperty => Some(decode_read_property(&mut r)),
        ConfirmedService::WriteProperty => Some(decode_write_property(&mut r)),
        ConfirmedService::SubscribeCov => Some(decode_subscribe_cov(&mut r)),
        ConfirmedService::Other(_) => None,
    }
}

fn decode_read_property(r: &mut TagReader<'_>) -> Result<ConfirmedRequest, CodecError> {
    let object = r.ctx_object_id(0)?;
    let property = PropertyId::from_u32(r.ctx_u32(1)?);
    let array_index = r.opt_ctx_u32(2)?;
    Ok(ConfirmedRequest::ReadProperty {
        object,
        property,
        array_index,
    })
}

fn decode_write_property(r: &mut TagReader<'_>) -> Result<ConfirmedRequest, CodecError> {
    let object = r.ctx_object_id(0)?;
    let property = PropertyId::from_u32(r.ctx_u32(1)?);
    let array_index = r.opt_ctx_u32(2)?;
    r.expect_opening(3)?;
    let value = r.values_until_closing(3)?;
    let priority = r.opt_ctx_u32(4)?.map(|p| p as u8);
    Ok(ConfirmedRequest::WriteProperty {
        object,
        property,
        array_index,
        value,
        priority,
    })
}

fn decode_subscribe_cov(r: &mut TagReader<'_>) -> Result<ConfirmedRequest, CodecError> {
    let process_id = r.ctx_u32(0)?;
    let object = r.ctx_object_id(1)?;
    let issue_confirmed = if r.at_context(2) {
        Some(r.ctx_bool(2)?)
    } else {
        None
    };
    let lifetime = r.opt_ctx_u32(3)?;
    Ok(ConfirmedRequest::SubscribeCov {
        process_id,
        object,
        issue_confirmed,
        lifetime,
    })
}

fn decode_read_property_ack(data: &[u8]) -> Result<Ack, CodecError> {
    let mut r = TagReader::new(data);
    let object = r.ctx_object_id(0)?;
    let property = PropertyId::from_u32(r.ctx_u32(1)?);
    let array_index = r.opt_ctx_u32(2)?;
    r.expect_opening(3)?;
    let value = r.values_until_closing(3)?;
    Ok(Ack::ReadProperty {
        object,
        property,
        array_index,
        value,
    })
}

fn decode_who_is(data: &[u8]) -> Result<UnconfirmedRequest, CodecError> {
    let mut r = TagReader::new(data);
    if r.is_empty() {
        return Ok(UnconfirmedRequest::WhoIs {
            low: None,
            high: None,
        });
    }
    let low = r.ctx_u32(0)?;
    let high = r.ctx_u32(1)?;
    Ok(UnconfirmedRequest::WhoIs {
        low: Some(low),
        high: Some(high),
    })
}

fn decode_i_am(data: &[u8]) -> Result<IAm, CodecError> {
    let mut r = TagReader::new(data);
    let device = r.app_object_id()?;
    let max_apdu = u32::try_from(r.app_unsigned()?)
        .map_err(|_| CodecError::InvalidValue("max APDU overflow".into()))?;
    let segmentation = Segmentation::from_u32(r.app_enumerated()?);
    let vendor_id = u16::try_from(r.app_unsigned()?)
        .map_err(|_| CodecError::InvalidValue("vendor id overflow".into()))?;
    Ok(IAm {
        device,
        max_apdu,
        segmentation,
        vendor_id,
    })
}

fn decode_cov_notification(data: &[u8]) -> Result<CovNotification, CodecError> {
    let mut r = TagReader::new(data);
    let process_id = r.ctx_u32(0)?;
    let initiating_device = r.ctx_object_id(1)?;
    let monitored_object = r.ctx_object_id(2)?;
    let time_remaining = r.ctx_u32(3)?;

    r.expect_opening(4)?;
    let mut values = Vec::new();
    while !r.at_closing(4) {
        let property = PropertyId::from_u32(r.ctx_u32(0)?);
        let array_index = r.opt_ctx_u32(1)?;
        r.expect_opening(2)?;
        let value = r.values_until_closing(2)?;
        // priority, not kept
        r.opt_ctx_u32(3)?;
        values.push(PropertyReading {
            property,
            array_index,
            value,
        });
    }
    r.expect_closing(4)?;

    Ok(CovNotification {
        process_id,
        initiating_device,
        monitored_object,
        time_remaining,
        values,
    })
}

fn decode_event_notification(data: &[u8]) -> Result<EventNotification, CodecError> {
    let mut r = TagReader::new(data);
    let process_id = r.ctx_u32(0)?;
    let initiating_device = r.ctx_object_id(1)?;
    let event_object = r.ctx_object_id(2)?;
    r.skip_constructed(3)?;
    let notification_class = r.ctx_u32(4)?;
    let priority = r.ctx_u32(5)? as u8;
    let event_type = r.ctx_u32(6)?;
    let message = if r.at_context(7) {
        Some(r.ctx_string(7)?)
    } else {
        None
    };
    let notify_type = r.ctx_u32(8)?;
    if r.at_context(9) {
        r.ctx_bool(9)?;
    }
    r.opt_ctx_u32(10)?;
    let to_state = r.ctx_u32(11)?;
    if r.at_opening(12) {
        r.skip_constructed(12)?;
    }

    Ok(EventNotification {
        process_id,
        initiating_device,
        event_object,
        notification_class,
        priority,
        event_type,
        message,
        notify_type,
        to_state,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObjectId, ObjectType, PropertyValue};

    fn decode(frame: &[u8]) -> DecodedFrame {
        ApduCodec::new().decode(frame).unwrap()
    }

    #[test]
    fn test_who_is_broadcast_bytes() {
        let codec = ApduCodec::new();
        let frame = codec
            .encode_unconfirmed(None, &UnconfirmedRequest::WhoIs { low: None, high: None })
            .unwrap();
        assert_eq!(&frame[..], &[0x01, 0x00, 0x10, 0x08]);

        let ranged = codec
            .encode_unconfirmed(
                None,
                &UnconfirmedRequest::WhoIs {
                    low: Some(10),
                    high: Some(300),
                },
            )
            .unwrap();
        assert_eq!(&ranged[..], &[0x01, 0x00, 0x10, 0x08, 0x09, 0x0A, 0x1A, 0x01, 0x2C]);
        assert_eq!(
            decode(&ranged).message,
            Decoded::Unconfirmed(UnconfirmedRequest::WhoIs {
                low: Some(10),
                high: Some(300)
            })
        );
    }

    #[test]
    fn test_decode_i_am_from_wire() {
        // I-Am device 1234, max APDU 1476, segmentation none, vendor 260
        let frame = [
            0x01, 0x00, 0x10, 0x00, 0xC4, 0x02, 0x00, 0x04, 0xD2, 0x22, 0x05, 0xC4, 0x91, 0x03,
            0x22, 0x01, 0x04,
        ];
        let decoded = decode(&frame);
        assert_eq!(
            decoded.message,
            Decoded::Unconfirmed(UnconfirmedRequest::IAm(IAm {
                device: ObjectId::device(1234),
                max_apdu: 1476,
                segmentation: Segmentation::None,
                vendor_id: 260,
            }))
        );
        assert_eq!(decoded.source, None);
    }

    #[test]
    fn test_read_property_request_bytes() {
        let codec = ApduCodec::new();
        let frame = codec
            .encode_request(
                None,
                7,
                &ConfirmedRequest::ReadProperty {
                    object: ObjectId::new(ObjectType::AnalogInput, 1),
                    property: PropertyId::PresentValue,
                    array_index: None,
                },
            )
            .unwrap();
        assert_eq!(
            &frame[..],
            &[0x01, 0x04, 0x02, 0x05, 0x07, 0x0C, 0x0C, 0x00, 0x00, 0x00, 0x01, 0x19, 0x55]
        );
    }

    #[test]
    fn test_read_property_ack_decodes_array() {
        let codec = ApduCodec::new();
        let value = PropertyValue::Array(vec![
            PropertyValue::ObjectId(ObjectId::device(5)),
            PropertyValue::ObjectId(ObjectId::new(ObjectType::BinaryValue, 2)),
        ]);
        let frame = codec
            .encode_response(
                None,
                3,
                &Response::Ack(Ack::ReadProperty {
                    object: ObjectId::device(5),
                    property: PropertyId::ObjectList,
                    array_index: None,
                    value: value.clone(),
                }),
            )
            .unwrap();

        match decode(&frame).message {
            Decoded::ConfirmedResponse {
                invoke_id: 3,
                response: Response::Ack(Ack::ReadProperty { value: decoded, .. }),
            } => assert_eq!(decoded, value),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_routed_source_is_reported() {
        // NPDU with SNET 5, SLEN 1, SADR 0x0A, then Simple-ACK for WriteProperty
        let frame = [0x01, 0x08, 0x00, 0x05, 0x01, 0x0A, 0x20, 0x09, 0x0F];
        let decoded = decode(&frame);
        assert_eq!(
            decoded.source,
            Some(RemoteStation {
                network: 5,
                mac: vec![0x0A]
            })
        );
        assert_eq!(
            decoded.message,
            Decoded::ConfirmedResponse {
                invoke_id: 9,
                response: Response::Ack(Ack::Simple(ConfirmedService::WriteProperty)),
            }
        );
    }

    #[test]
    fn test_routed_request_carries_dnet() {
        let codec = ApduCodec::new();
        let station = RemoteStation {
            network: 0x0102,
            mac: vec![0x33],
        };
        let frame = codec
            .encode_request(
                Some(&station),
                1,
                &ConfirmedRequest::ReadProperty {
                    object: ObjectId::device(1),
                    property: PropertyId::ObjectName,
                    array_index: None,
                },
            )
            .unwrap();
        assert_eq!(&frame[..7], &[0x01, 0x24, 0x01, 0x02, 0x01, 0x33, 0xFF]);
    }

    #[test]
    fn test_error_reject_abort() {
        let error = decode(&[0x01, 0x00, 0x50, 0x04, 0x0C, 0x91, 0x02, 0x91, 0x20]);
        assert_eq!(
            error.message,
            Decoded::ConfirmedResponse {
                invoke_id: 4,
                response: Response::Error {
                    service: ConfirmedService::ReadProperty,
                    class: 2,
                    code: 32
                },
            }
        );

        let reject = decode(&[0x01, 0x00, 0x60, 0x04, 0x09]);
        assert_eq!(
            reject.message,
            Decoded::ConfirmedResponse {
                invoke_id: 4,
                response: Response::Reject { reason: 9 }
            }
        );

        let abort = decode(&[0x01, 0x00, 0x71, 0x04, 0x04]);
        assert_eq!(
            abort.message,
            Decoded::ConfirmedResponse {
                invoke_id: 4,
                response: Response::Abort {
                    reason: 4,
                    server: true
                }
            }
        );
    }

    #[test]
    fn test_segmented_complex_ack_becomes_abort() {
        let frame = [0x01, 0x00, 0x3C, 0x11, 0x00, 0x04, 0x0C];
        assert_eq!(
            decode(&frame).message,
            Decoded::ConfirmedResponse {
                invoke_id: 0x11,
                response: Response::Abort {
                    reason: abort_reason::SEGMENTATION_NOT_SUPPORTED,
                    server: true
                }
            }
        );
    }

    #[test]
    fn test_cov_notification_decode() {
        let codec = ApduCodec::new();
        let notification = CovNotification {
            process_id: 18,
            initiating_device: ObjectId::device(100),
            monitored_object: ObjectId::new(ObjectType::AnalogInput, 10),
            time_remaining: 60,
            values: vec![
                PropertyReading {
                    property: PropertyId::PresentValue,
                    array_index: None,
                    value: PropertyValue::Real(65.0),
                },
                PropertyReading {
                    property: PropertyId::StatusFlags,
                    array_index: None,
                    value: PropertyValue::BitString(vec![false; 4]),
                },
            ],
        };
        let frame = codec
            .encode_unconfirmed(None, &UnconfirmedRequest::CovNotification(notification.clone()))
            .unwrap();
        assert_eq!(
            decode(&frame).message,
            Decoded::Unconfirmed(UnconfirmedRequest::CovNotification(notification))
        );
    }

    #[test]
    fn test_event_notification_decode() {
        let codec = ApduCodec::new();
        let notification = EventNotification {
            process_id: 1,
            initiating_device: ObjectId::device(9),
            event_object: ObjectId::new(ObjectType::AnalogInput, 2),
            notification_class: 4,
            priority: 100,
            event_type: 5,
            message: Some("High limit".into()),
            notify_type: 0,
            to_state: 3,
        };
        let frame = codec
            .encode_unconfirmed(None, &UnconfirmedRequest::EventNotification(notification.clone()))
            .unwrap();
        assert_eq!(
            decode(&frame).message,
            Decoded::Unconfirmed(UnconfirmedRequest::EventNotification(notification))
        );
    }

    #[test]
    fn test_unknown_request_service() {
        // ReadPropertyMultiple (14) is not modelled
        let frame = [0x01, 0x04, 0x00, 0x05, 0x21, 0x0E, 0x0C, 0x02, 0x00, 0x00, 0x01];
        assert_eq!(
            decode(&frame).message,
            Decoded::UnsupportedRequest {
                invoke_id: 0x21,
                service: ConfirmedService::Other(14)
            }
        );
    }

    #[test]
    fn test_malformed_frames() {
        let codec = ApduCodec::new();
        assert!(codec.decode(&[]).is_err());
        assert!(matches!(codec.decode(&[0x02, 0x00, 0x10]), Err(CodecError::Version(2))));
        assert!(codec.decode(&[0x01, 0x00]).is_err());
        // I-Am cut short
        assert!(codec.decode(&[0x01, 0x00, 0x10, 0x00, 0xC4, 0x02]).is_err());
        assert!(matches!(
            codec.decode(&[0x01, 0x00, 0x90, 0x00]),
            Err(CodecError::UnknownPdu(0x90))
        ));
    }

    #[test]
    fn test_network_message_ignored() {
        let frame = [0x01, 0x80, 0x00, 0x00, 0x05];
        assert_eq!(decode(&frame).message, Decoded::Ignored("network layer message"));
    }

    #[test]
    fn test_write_priority_validated() {
        let codec = ApduCodec::new();
        let request = ConfirmedRequest::WriteProperty {
            object: ObjectId::new(ObjectType::AnalogValue, 1),
            property: PropertyId::PresentValue,
            array_index: None,
            value: PropertyValue::Real(1.0),
            priority: Some(17),
        };
        assert!(codec.encode_request(None, 1, &request).is_err());
    }
}
