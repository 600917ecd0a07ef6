//! Primitive BACnet application-layer encoding (ASHRAE 135 clause 20.2).
//!
//! Values are tagged with either an application tag (the datatype) or a
//! context-specific tag (the position in a service sequence). Only the
//! datatypes BacProp serves are implemented.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EncodingError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("buffer underflow")]
    BufferUnderflow,
    #[error("unexpected tag")]
    InvalidTag,
    #[error("invalid length")]
    InvalidLength,
    #[error("value out of range: {0}")]
    ValueOutOfRange(&'static str),
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
}

/// BACnet application tag numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApplicationTag {
    Null = 0,
    Boolean = 1,
    UnsignedInt = 2,
    SignedInt = 3,
    Real = 4,
    Double = 5,
    OctetString = 6,
    CharacterString = 7,
    BitString = 8,
    Enumerated = 9,
    Date = 10,
    Time = 11,
    ObjectIdentifier = 12,
}

impl TryFrom<u8> for ApplicationTag {
    type Error = EncodingError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => ApplicationTag::Null,
            1 => ApplicationTag::Boolean,
            2 => ApplicationTag::UnsignedInt,
            3 => ApplicationTag::SignedInt,
            4 => ApplicationTag::Real,
            5 => ApplicationTag::Double,
            6 => ApplicationTag::OctetString,
            7 => ApplicationTag::CharacterString,
            8 => ApplicationTag::BitString,
            9 => ApplicationTag::Enumerated,
            10 => ApplicationTag::Date,
            11 => ApplicationTag::Time,
            12 => ApplicationTag::ObjectIdentifier,
            _ => return Err(EncodingError::InvalidTag),
        })
    }
}

fn push_tag(buffer: &mut Vec<u8>, initial: u8, length: usize) {
    if length < 5 {
        buffer.push(initial | length as u8);
        return;
    }
    buffer.push(initial | 5);
    if length < 254 {
        buffer.push(length as u8);
    } else if length < 65536 {
        buffer.push(254);
        buffer.extend_from_slice(&(length as u16).to_be_bytes());
    } else {
        buffer.push(255);
        buffer.extend_from_slice(&(length as u32).to_be_bytes());
    }
}

/// Encode an application tag octet with its length/value/type field.
pub fn encode_application_tag(buffer: &mut Vec<u8>, tag: ApplicationTag, length: usize) {
    push_tag(buffer, (tag as u8) << 4, length);
}

/// Decode an application tag, returning `(tag, content length, octets consumed)`.
pub fn decode_application_tag(data: &[u8]) -> Result<(ApplicationTag, usize, usize)> {
    if data.is_empty() {
        return Err(EncodingError::BufferUnderflow);
    }
    if data[0] & 0x08 != 0 {
        // Context-specific class bit set
        return Err(EncodingError::InvalidTag);
    }
    let tag = ApplicationTag::try_from(data[0] >> 4)?;
    let (length, consumed) = decode_extended_length(data)?;
    Ok((tag, length, consumed))
}

fn decode_extended_length(data: &[u8]) -> Result<(usize, usize)> {
    let mut length = (data[0] & 0x07) as usize;
    let mut consumed = 1;
    if length == 5 {
        let ext = *data.get(1).ok_or(EncodingError::BufferUnderflow)?;
        consumed += 1;
        if ext < 254 {
            length = ext as usize;
        } else if ext == 254 {
            if data.len() < 4 {
                return Err(EncodingError::BufferUnderflow);
            }
            length = u16::from_be_bytes([data[2], data[3]]) as usize;
            consumed += 2;
        } else {
            if data.len() < 6 {
                return Err(EncodingError::BufferUnderflow);
            }
            length = u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize;
            consumed += 4;
        }
    }
    Ok((length, consumed))
}

fn unsigned_content(value: u32) -> Vec<u8> {
    if value <= 0xFF {
        vec![value as u8]
    } else if value <= 0xFFFF {
        (value as u16).to_be_bytes().to_vec()
    } else if value <= 0xFF_FFFF {
        value.to_be_bytes()[1..].to_vec()
    } else {
        value.to_be_bytes().to_vec()
    }
}

fn unsigned_from_content(data: &[u8]) -> Result<u32> {
    let mut value: u32 = 0;
    if data.is_empty() || data.len() > 4 {
        return Err(EncodingError::InvalidLength);
    }
    for byte in data {
        value = (value << 8) | *byte as u32;
    }
    Ok(value)
}

/// Encode a BACnet unsigned integer.
pub fn encode_unsigned(buffer: &mut Vec<u8>, value: u32) {
    let content = unsigned_content(value);
    encode_application_tag(buffer, ApplicationTag::UnsignedInt, content.len());
    buffer.extend_from_slice(&content);
}

/// Decode a BACnet unsigned integer, returning `(value, octets consumed)`.
pub fn decode_unsigned(data: &[u8]) -> Result<(u32, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::UnsignedInt {
        return Err(EncodingError::InvalidTag);
    }
    if data.len() < consumed + length {
        return Err(EncodingError::BufferUnderflow);
    }
    let value = unsigned_from_content(&data[consumed..consumed + length])?;
    Ok((value, consumed + length))
}

/// Encode a BACnet enumerated value.
pub fn encode_enumerated(buffer: &mut Vec<u8>, value: u32) {
    let content = unsigned_content(value);
    encode_application_tag(buffer, ApplicationTag::Enumerated, content.len());
    buffer.extend_from_slice(&content);
}

/// Decode a BACnet enumerated value, returning `(value, octets consumed)`.
pub fn decode_enumerated(data: &[u8]) -> Result<(u32, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::Enumerated {
        return Err(EncodingError::InvalidTag);
    }
    if data.len() < consumed + length {
        return Err(EncodingError::BufferUnderflow);
    }
    let value = unsigned_from_content(&data[consumed..consumed + length])?;
    Ok((value, consumed + length))
}

/// Encode a BACnet real (IEEE-754 single precision).
pub fn encode_real(buffer: &mut Vec<u8>, value: f32) {
    encode_application_tag(buffer, ApplicationTag::Real, 4);
    buffer.extend_from_slice(&value.to_be_bytes());
}

/// Decode a BACnet real, returning `(value, octets consumed)`.
pub fn decode_real(data: &[u8]) -> Result<(f32, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::Real {
        return Err(EncodingError::InvalidTag);
    }
    if length != 4 {
        return Err(EncodingError::InvalidLength);
    }
    if data.len() < consumed + 4 {
        return Err(EncodingError::BufferUnderflow);
    }
    let value = f32::from_be_bytes([
        data[consumed],
        data[consumed + 1],
        data[consumed + 2],
        data[consumed + 3],
    ]);
    Ok((value, consumed + 4))
}

/// Encode a BACnet character string with ANSI X3.4 (UTF-8 compatible) charset.
pub fn encode_character_string(buffer: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    encode_application_tag(buffer, ApplicationTag::CharacterString, bytes.len() + 1);
    buffer.push(0); // charset octet
    buffer.extend_from_slice(bytes);
}

/// Decode a BACnet character string, returning `(value, octets consumed)`.
pub fn decode_character_string(data: &[u8]) -> Result<(String, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::CharacterString {
        return Err(EncodingError::InvalidTag);
    }
    if length == 0 || data.len() < consumed + length {
        return Err(EncodingError::BufferUnderflow);
    }
    // First content octet names the character set; everything after is text.
    let text = &data[consumed + 1..consumed + length];
    let value = String::from_utf8(text.to_vec())
        .map_err(|_| EncodingError::InvalidValue("character string is not UTF-8"))?;
    Ok((value, consumed + length))
}

/// Encode a BACnet bit string.
pub fn encode_bit_string(buffer: &mut Vec<u8>, bits: &[bool]) {
    let byte_count = bits.len().div_ceil(8);
    let unused = (byte_count * 8 - bits.len()) as u8;
    encode_application_tag(buffer, ApplicationTag::BitString, byte_count + 1);
    buffer.push(unused);
    let mut current = 0u8;
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            current |= 1 << (7 - i % 8);
        }
        if i % 8 == 7 {
            buffer.push(current);
            current = 0;
        }
    }
    if bits.len() % 8 != 0 {
        buffer.push(current);
    }
}

/// Decode a BACnet bit string, returning `(bits, octets consumed)`.
pub fn decode_bit_string(data: &[u8]) -> Result<(Vec<bool>, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::BitString {
        return Err(EncodingError::InvalidTag);
    }
    if length == 0 || data.len() < consumed + length {
        return Err(EncodingError::BufferUnderflow);
    }
    let unused = data[consumed] as usize;
    if unused > 7 {
        return Err(EncodingError::InvalidValue("unused bit count above 7"));
    }
    let content = &data[consumed + 1..consumed + length];
    let mut bits = Vec::with_capacity(content.len() * 8);
    for (i, byte) in content.iter().enumerate() {
        let take = if i == content.len() - 1 { 8 - unused } else { 8 };
        for bit in 0..take {
            bits.push(byte & (1 << (7 - bit)) != 0);
        }
    }
    Ok((bits, consumed + length))
}

/// Encode an object identifier as `(type << 22) | instance`.
pub fn encode_object_identifier(buffer: &mut Vec<u8>, object_type: u16, instance: u32) {
    let value = ((object_type as u32) << 22) | (instance & 0x003F_FFFF);
    encode_application_tag(buffer, ApplicationTag::ObjectIdentifier, 4);
    buffer.extend_from_slice(&value.to_be_bytes());
}

/// Decode an object identifier, returning `((type, instance), octets consumed)`.
pub fn decode_object_identifier(data: &[u8]) -> Result<((u16, u32), usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::ObjectIdentifier {
        return Err(EncodingError::InvalidTag);
    }
    if length != 4 {
        return Err(EncodingError::InvalidLength);
    }
    if data.len() < consumed + 4 {
        return Err(EncodingError::BufferUnderflow);
    }
    let value = u32::from_be_bytes([
        data[consumed],
        data[consumed + 1],
        data[consumed + 2],
        data[consumed + 3],
    ]);
    Ok((((value >> 22) as u16, value & 0x003F_FFFF), consumed + 4))
}

// Context-specific tags. The class bit (0x08) distinguishes these from
// application tags; opening/closing tags bracket constructed values.

fn context_initial(tag_number: u8) -> Result<u8> {
    if tag_number > 14 {
        return Err(EncodingError::ValueOutOfRange("context tag number above 14"));
    }
    Ok(0x08 | (tag_number << 4))
}

/// Encode a context-specific tag octet.
pub fn encode_context_tag(buffer: &mut Vec<u8>, tag_number: u8, length: usize) -> Result<()> {
    push_tag(buffer, context_initial(tag_number)?, length);
    Ok(())
}

/// Decode a context-specific tag, returning `(tag number, content length, octets consumed)`.
pub fn decode_context_tag(data: &[u8]) -> Result<(u8, usize, usize)> {
    if data.is_empty() {
        return Err(EncodingError::BufferUnderflow);
    }
    if data[0] & 0x08 == 0 || matches!(data[0] & 0x07, 6 | 7) {
        // application class, or an opening/closing bracket
        return Err(EncodingError::InvalidTag);
    }
    let tag_number = data[0] >> 4;
    let (length, consumed) = decode_extended_length(data)?;
    Ok((tag_number, length, consumed))
}

/// Encode a context-tagged unsigned integer.
pub fn encode_context_unsigned(buffer: &mut Vec<u8>, tag_number: u8, value: u32) -> Result<()> {
    let content = unsigned_content(value);
    encode_context_tag(buffer, tag_number, content.len())?;
    buffer.extend_from_slice(&content);
    Ok(())
}

/// Decode a context-tagged unsigned integer with the expected tag number.
pub fn decode_context_unsigned(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    let (tag, length, consumed) = decode_context_tag(data)?;
    if tag != tag_number {
        return Err(EncodingError::InvalidTag);
    }
    if data.len() < consumed + length {
        return Err(EncodingError::BufferUnderflow);
    }
    let value = unsigned_from_content(&data[consumed..consumed + length])?;
    Ok((value, consumed + length))
}

/// Encode a context-tagged object identifier.
pub fn encode_context_object_id(
    buffer: &mut Vec<u8>,
    tag_number: u8,
    object_type: u16,
    instance: u32,
) -> Result<()> {
    encode_context_tag(buffer, tag_number, 4)?;
    let value = ((object_type as u32) << 22) | (instance & 0x003F_FFFF);
    buffer.extend_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Decode a context-tagged object identifier with the expected tag number.
pub fn decode_context_object_id(data: &[u8], tag_number: u8) -> Result<((u16, u32), usize)> {
    let (tag, length, consumed) = decode_context_tag(data)?;
    if tag != tag_number {
        return Err(EncodingError::InvalidTag);
    }
    if length != 4 {
        return Err(EncodingError::InvalidLength);
    }
    if data.len() < consumed + 4 {
        return Err(EncodingError::BufferUnderflow);
    }
    let value = u32::from_be_bytes([
        data[consumed],
        data[consumed + 1],
        data[consumed + 2],
        data[consumed + 3],
    ]);
    Ok((((value >> 22) as u16, value & 0x003F_FFFF), consumed + 4))
}

/// Encode the opening bracket of a constructed value.
pub fn encode_opening_tag(buffer: &mut Vec<u8>, tag_number: u8) -> Result<()> {
    buffer.push(context_initial(tag_number)? | 0x06);
    Ok(())
}

/// Encode the closing bracket of a constructed value.
pub fn encode_closing_tag(buffer: &mut Vec<u8>, tag_number: u8) -> Result<()> {
    buffer.push(context_initial(tag_number)? | 0x07);
    Ok(())
}

/// Skip one application-tagged primitive value, returning the octets consumed.
///
/// Needed when scanning bracketed payloads: value content octets may collide
/// with bracket octets, so brackets can only be recognized between values.
pub fn skip_application_value(data: &[u8]) -> Result<usize> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    // Boolean keeps its value in the tag octet itself.
    let content = if tag == ApplicationTag::Boolean { 0 } else { length };
    if data.len() < consumed + content {
        return Err(EncodingError::BufferUnderflow);
    }
    Ok(consumed + content)
}

/// True if the next octet opens constructed context tag `tag_number`.
pub fn is_opening_tag(data: &[u8], tag_number: u8) -> bool {
    data.first() == Some(&(0x08 | (tag_number << 4) | 0x06))
}

/// True if the next octet closes constructed context tag `tag_number`.
pub fn is_closing_tag(data: &[u8], tag_number: u8) -> bool {
    data.first() == Some(&(0x08 | (tag_number << 4) | 0x07))
}

/// True if the next octet is a context tag (not a bracket) with `tag_number`.
pub fn is_context_tag(data: &[u8], tag_number: u8) -> bool {
    match data.first() {
        Some(byte) => {
            byte & 0x08 != 0 && byte >> 4 == tag_number && !matches!(byte & 0x07, 6 | 7)
        }
        None => false,
    }
}
