//! Application-layer PDU codec (ASHRAE 135 clause 20.1).

use thiserror::Error;

use super::encoding::{self, EncodingError};

pub type Result<T> = std::result::Result<T, ApduError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApduError {
    #[error("APDU too short")]
    Truncated,
    #[error("unsupported APDU type {0}")]
    UnsupportedType(u8),
    #[error("malformed APDU: {0}")]
    Malformed(#[from] EncodingError),
}

/// Maximum number of response segments a requester accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxSegments {
    Unspecified,
    Two,
    Four,
    Eight,
    Sixteen,
    ThirtyTwo,
    SixtyFour,
    GreaterThan64,
}

impl MaxSegments {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            1 => MaxSegments::Two,
            2 => MaxSegments::Four,
            3 => MaxSegments::Eight,
            4 => MaxSegments::Sixteen,
            5 => MaxSegments::ThirtyTwo,
            6 => MaxSegments::SixtyFour,
            7 => MaxSegments::GreaterThan64,
            _ => MaxSegments::Unspecified,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            MaxSegments::Unspecified => 0,
            MaxSegments::Two => 1,
            MaxSegments::Four => 2,
            MaxSegments::Eight => 3,
            MaxSegments::Sixteen => 4,
            MaxSegments::ThirtyTwo => 5,
            MaxSegments::SixtyFour => 6,
            MaxSegments::GreaterThan64 => 7,
        }
    }

    /// Segment budget, `None` meaning unlimited.
    pub fn limit(self) -> Option<usize> {
        match self {
            MaxSegments::Unspecified | MaxSegments::GreaterThan64 => None,
            MaxSegments::Two => Some(2),
            MaxSegments::Four => Some(4),
            MaxSegments::Eight => Some(8),
            MaxSegments::Sixteen => Some(16),
            MaxSegments::ThirtyTwo => Some(32),
            MaxSegments::SixtyFour => Some(64),
        }
    }
}

/// Maximum APDU octet count a requester accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxApduSize {
    Up50,
    Up128,
    Up206,
    Up480,
    Up1024,
    Up1476,
}

impl MaxApduSize {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            1 => MaxApduSize::Up128,
            2 => MaxApduSize::Up206,
            3 => MaxApduSize::Up480,
            4 => MaxApduSize::Up1024,
            5 => MaxApduSize::Up1476,
            _ => MaxApduSize::Up50,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            MaxApduSize::Up50 => 0,
            MaxApduSize::Up128 => 1,
            MaxApduSize::Up206 => 2,
            MaxApduSize::Up480 => 3,
            MaxApduSize::Up1024 => 4,
            MaxApduSize::Up1476 => 5,
        }
    }

    pub fn octets(self) -> usize {
        match self {
            MaxApduSize::Up50 => 50,
            MaxApduSize::Up128 => 128,
            MaxApduSize::Up206 => 206,
            MaxApduSize::Up480 => 480,
            MaxApduSize::Up1024 => 1024,
            MaxApduSize::Up1476 => 1476,
        }
    }
}

/// Abort reasons BacProp emits.
pub mod abort_reason {
    pub const OTHER: u8 = 0;
    pub const BUFFER_OVERFLOW: u8 = 1;
}

/// Reject reasons BacProp emits.
pub mod reject_reason {
    pub const INVALID_TAG: u8 = 4;
    pub const UNRECOGNIZED_SERVICE: u8 = 9;
}

/// Application-layer PDU.
#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    ConfirmedRequest {
        segmented: bool,
        more_follows: bool,
        segmented_response_accepted: bool,
        max_segments: MaxSegments,
        max_response_size: MaxApduSize,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: u8,
        service_data: Vec<u8>,
    },
    UnconfirmedRequest {
        service_choice: u8,
        service_data: Vec<u8>,
    },
    SimpleAck {
        invoke_id: u8,
        service_choice: u8,
    },
    ComplexAck {
        segmented: bool,
        more_follows: bool,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: u8,
        service_data: Vec<u8>,
    },
    SegmentAck {
        negative: bool,
        server: bool,
        invoke_id: u8,
        sequence_number: u8,
        actual_window_size: u8,
    },
    Error {
        invoke_id: u8,
        service_choice: u8,
        error_class: u32,
        error_code: u32,
    },
    Reject {
        invoke_id: u8,
        reject_reason: u8,
    },
    Abort {
        server: bool,
        invoke_id: u8,
        abort_reason: u8,
    },
}

const TYPE_CONFIRMED: u8 = 0;
const TYPE_UNCONFIRMED: u8 = 1;
const TYPE_SIMPLE_ACK: u8 = 2;
const TYPE_COMPLEX_ACK: u8 = 3;
const TYPE_SEGMENT_ACK: u8 = 4;
const TYPE_ERROR: u8 = 5;
const TYPE_REJECT: u8 = 6;
const TYPE_ABORT: u8 = 7;

impl Apdu {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        match self {
            Apdu::ConfirmedRequest {
                segmented,
                more_follows,
                segmented_response_accepted,
                max_segments,
                max_response_size,
                invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice,
                service_data,
            } => {
                let mut first = TYPE_CONFIRMED << 4;
                if *segmented {
                    first |= 0x08;
                }
                if *more_follows {
                    first |= 0x04;
                }
                if *segmented_response_accepted {
                    first |= 0x02;
                }
                buffer.push(first);
                buffer.push((max_segments.to_bits() << 4) | max_response_size.to_bits());
                buffer.push(*invoke_id);
                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(proposed_window_size.unwrap_or(1));
                }
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                buffer.push(TYPE_UNCONFIRMED << 4);
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }
            Apdu::SimpleAck {
                invoke_id,
                service_choice,
            } => {
                buffer.push(TYPE_SIMPLE_ACK << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
            }
            Apdu::ComplexAck {
                segmented,
                more_follows,
                invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice,
                service_data,
            } => {
                let mut first = TYPE_COMPLEX_ACK << 4;
                if *segmented {
                    first |= 0x08;
                }
                if *more_follows {
                    first |= 0x04;
                }
                buffer.push(first);
                buffer.push(*invoke_id);
                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(proposed_window_size.unwrap_or(1));
                }
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }
            Apdu::SegmentAck {
                negative,
                server,
                invoke_id,
                sequence_number,
                actual_window_size,
            } => {
                let mut first = TYPE_SEGMENT_ACK << 4;
                if *negative {
                    first |= 0x02;
                }
                if *server {
                    first |= 0x01;
                }
                buffer.push(first);
                buffer.push(*invoke_id);
                buffer.push(*sequence_number);
                buffer.push(*actual_window_size);
            }
            Apdu::Error {
                invoke_id,
                service_choice,
                error_class,
                error_code,
            } => {
                buffer.push(TYPE_ERROR << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
                encoding::encode_enumerated(&mut buffer, *error_class);
                encoding::encode_enumerated(&mut buffer, *error_code);
            }
            Apdu::Reject {
                invoke_id,
                reject_reason,
            } => {
                buffer.push(TYPE_REJECT << 4);
                buffer.push(*invoke_id);
                buffer.push(*reject_reason);
            }
            Apdu::Abort {
                server,
                invoke_id,
                abort_reason,
            } => {
                let mut first = TYPE_ABORT << 4;
                if *server {
                    first |= 0x01;
                }
                buffer.push(first);
                buffer.push(*invoke_id);
                buffer.push(*abort_reason);
            }
        }
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let first = *data.first().ok_or(ApduError::Truncated)?;
        match first >> 4 {
            TYPE_CONFIRMED => {
                if data.len() < 4 {
                    return Err(ApduError::Truncated);
                }
                let segmented = first & 0x08 != 0;
                let more_follows = first & 0x04 != 0;
                let segmented_response_accepted = first & 0x02 != 0;
                let max_segments = MaxSegments::from_bits(data[1] >> 4);
                let max_response_size = MaxApduSize::from_bits(data[1]);
                let invoke_id = data[2];
                let mut pos = 3;
                let (sequence_number, proposed_window_size) = if segmented {
                    if data.len() < 6 {
                        return Err(ApduError::Truncated);
                    }
                    pos += 2;
                    (Some(data[3]), Some(data[4]))
                } else {
                    (None, None)
                };
                let service_choice = *data.get(pos).ok_or(ApduError::Truncated)?;
                pos += 1;
                Ok(Apdu::ConfirmedRequest {
                    segmented,
                    more_follows,
                    segmented_response_accepted,
                    max_segments,
                    max_response_size,
                    invoke_id,
                    sequence_number,
                    proposed_window_size,
                    service_choice,
                    service_data: data[pos..].to_vec(),
                })
            }
            TYPE_UNCONFIRMED => {
                let service_choice = *data.get(1).ok_or(ApduError::Truncated)?;
                Ok(Apdu::UnconfirmedRequest {
                    service_choice,
                    service_data: data[2..].to_vec(),
                })
            }
            TYPE_SIMPLE_ACK => {
                if data.len() < 3 {
                    return Err(ApduError::Truncated);
                }
                Ok(Apdu::SimpleAck {
                    invoke_id: data[1],
                    service_choice: data[2],
                })
            }
            TYPE_COMPLEX_ACK => {
                if data.len() < 3 {
                    return Err(ApduError::Truncated);
                }
                let segmented = first & 0x08 != 0;
                let more_follows = first & 0x04 != 0;
                let invoke_id = data[1];
                let mut pos = 2;
                let (sequence_number, proposed_window_size) = if segmented {
                    if data.len() < 5 {
                        return Err(ApduError::Truncated);
                    }
                    pos += 2;
                    (Some(data[2]), Some(data[3]))
                } else {
                    (None, None)
                };
                let service_choice = *data.get(pos).ok_or(ApduError::Truncated)?;
                pos += 1;
                Ok(Apdu::ComplexAck {
                    segmented,
                    more_follows,
                    invoke_id,
                    sequence_number,
                    proposed_window_size,
                    service_choice,
                    service_data: data[pos..].to_vec(),
                })
            }
            TYPE_SEGMENT_ACK => {
                if data.len() < 4 {
                    return Err(ApduError::Truncated);
                }
                Ok(Apdu::SegmentAck {
                    negative: first & 0x02 != 0,
                    server: first & 0x01 != 0,
                    invoke_id: data[1],
                    sequence_number: data[2],
                    actual_window_size: data[3],
                })
            }
            TYPE_ERROR => {
                if data.len() < 3 {
                    return Err(ApduError::Truncated);
                }
                let invoke_id = data[1];
                let service_choice = data[2];
                let (error_class, consumed) = encoding::decode_enumerated(&data[3..])?;
                let (error_code, _) = encoding::decode_enumerated(&data[3 + consumed..])?;
                Ok(Apdu::Error {
                    invoke_id,
                    service_choice,
                    error_class,
                    error_code,
                })
            }
            TYPE_REJECT => {
                if data.len() < 3 {
                    return Err(ApduError::Truncated);
                }
                Ok(Apdu::Reject {
                    invoke_id: data[1],
                    reject_reason: data[2],
                })
            }
            TYPE_ABORT => {
                if data.len() < 3 {
                    return Err(ApduError::Truncated);
                }
                Ok(Apdu::Abort {
                    server: first & 0x01 != 0,
                    invoke_id: data[1],
                    abort_reason: data[2],
                })
            }
            other => Err(ApduError::UnsupportedType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmed_request_round_trips() {
        let apdu = Apdu::ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: true,
            max_segments: MaxSegments::Unspecified,
            max_response_size: MaxApduSize::Up1476,
            invoke_id: 17,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: 12,
            service_data: vec![0x0C, 0x02, 0x00, 0x00, 0x01],
        };
        let encoded = apdu.encode();
        assert_eq!(encoded[0], 0x02);
        assert_eq!(encoded[1], 0x05);
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);
    }

    #[test]
    fn segmented_complex_ack_carries_sequence_fields() {
        let apdu = Apdu::ComplexAck {
            segmented: true,
            more_follows: true,
            invoke_id: 3,
            sequence_number: Some(0),
            proposed_window_size: Some(1),
            service_choice: 14,
            service_data: vec![0xAA; 8],
        };
        let encoded = apdu.encode();
        assert_eq!(encoded[0], 0x3C);
        assert_eq!(&encoded[1..5], &[3, 0, 1, 14]);
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);
    }

    #[test]
    fn error_pdu_uses_tagged_enumerations() {
        let apdu = Apdu::Error {
            invoke_id: 9,
            service_choice: 12,
            error_class: 1,
            error_code: 31,
        };
        let encoded = apdu.encode();
        assert_eq!(encoded, vec![0x50, 9, 12, 0x91, 1, 0x91, 31]);
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);
    }

    #[test]
    fn empty_datagram_is_truncated() {
        assert_eq!(Apdu::decode(&[]), Err(ApduError::Truncated));
    }
}
