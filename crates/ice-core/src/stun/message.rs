use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::Sha1;

use super::attribute::{StunAttribute, StunAttributeType};
use super::{FINGERPRINT_XOR, STUN_HEADER_SIZE, STUN_MAGIC_COOKIE};
use crate::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

/// Size of a MESSAGE-INTEGRITY attribute including its header
const INTEGRITY_ATTR_SIZE: usize = 24;

/// Size of a FINGERPRINT attribute including its header
const FINGERPRINT_ATTR_SIZE: usize = 8;

/// 96-bit STUN transaction id
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate a random transaction id
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut id = [0u8; 12];
        rng.fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl StunClass {
    fn bits(self) -> u16 {
        match self {
            Self::Request => 0b00,
            Self::Indication => 0b01,
            Self::SuccessResponse => 0b10,
            Self::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Self::Request,
            0b01 => Self::Indication,
            0b10 => Self::SuccessResponse,
            _ => Self::ErrorResponse,
        }
    }

    /// Success or error response
    pub fn is_response(self) -> bool {
        matches!(self, Self::SuccessResponse | Self::ErrorResponse)
    }
}

/// STUN/TURN method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunMethod {
    Binding,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
    Other(u16),
}

impl From<u16> for StunMethod {
    fn from(value: u16) -> Self {
        match value {
            0x001 => Self::Binding,
            0x003 => Self::Allocate,
            0x004 => Self::Refresh,
            0x006 => Self::Send,
            0x007 => Self::Data,
            0x008 => Self::CreatePermission,
            0x009 => Self::ChannelBind,
            other => Self::Other(other),
        }
    }
}

impl From<StunMethod> for u16 {
    fn from(method: StunMethod) -> Self {
        match method {
            StunMethod::Binding => 0x001,
            StunMethod::Allocate => 0x003,
            StunMethod::Refresh => 0x004,
            StunMethod::Send => 0x006,
            StunMethod::Data => 0x007,
            StunMethod::CreatePermission => 0x008,
            StunMethod::ChannelBind => 0x009,
            StunMethod::Other(value) => value & 0x0FFF,
        }
    }
}

/// STUN message type: a method and a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StunMessageType {
    pub method: StunMethod,
    pub class: StunClass,
}

impl StunMessageType {
    pub const BINDING_REQUEST: Self = Self::new(StunMethod::Binding, StunClass::Request);
    pub const BINDING_RESPONSE: Self = Self::new(StunMethod::Binding, StunClass::SuccessResponse);
    pub const BINDING_ERROR_RESPONSE: Self = Self::new(StunMethod::Binding, StunClass::ErrorResponse);
    pub const BINDING_INDICATION: Self = Self::new(StunMethod::Binding, StunClass::Indication);

    pub const fn new(method: StunMethod, class: StunClass) -> Self {
        Self { method, class }
    }

    /// Convert to u16 for encoding.
    ///
    /// The class bits are interleaved with the method bits (RFC 5389 section 6):
    /// `M11..M7 C1 M6..M4 C0 M3..M0`.
    pub fn to_u16(self) -> u16 {
        let method = u16::from(self.method);
        let class = self.class.bits();
        (method & 0x000F)
            | ((method & 0x0070) << 1)
            | ((method & 0x0F80) << 2)
            | ((class & 0x01) << 4)
            | ((class & 0x02) << 7)
    }

    /// Convert from u16 to message type
    pub fn from_u16(value: u16) -> Self {
        let method = (value & 0x000F) | ((value & 0x00E0) >> 1) | ((value & 0x3E00) >> 2);
        let class = ((value & 0x0010) >> 4) | ((value & 0x0100) >> 7);
        Self {
            method: StunMethod::from(method),
            class: StunClass::from_bits(class),
        }
    }
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message type
    pub msg_type: StunMessageType,
    /// Transaction ID
    pub transaction_id: TransactionId,
    /// Attributes in wire order
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a new STUN message with a random transaction id
    pub fn new(msg_type: StunMessageType) -> Self {
        Self::with_transaction_id(msg_type, TransactionId::random(&mut rand::thread_rng()))
    }

    /// Create a new STUN message with the given transaction id
    pub fn with_transaction_id(msg_type: StunMessageType, transaction_id: TransactionId) -> Self {
        Self {
            msg_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Create a new binding request
    pub fn binding_request() -> Self {
        Self::new(StunMessageType::BINDING_REQUEST)
    }

    /// Create a success response to `request`, reusing its transaction id
    pub fn success_response(request: &StunMessage) -> Self {
        Self::with_transaction_id(
            StunMessageType::new(request.msg_type.method, StunClass::SuccessResponse),
            request.transaction_id,
        )
    }

    /// Create an error response to `request` carrying ERROR-CODE
    pub fn error_response(request: &StunMessage, code: u16, reason: &str) -> Self {
        let mut msg = Self::with_transaction_id(
            StunMessageType::new(request.msg_type.method, StunClass::ErrorResponse),
            request.transaction_id,
        );
        msg.add_attribute(StunAttribute::error_code(code, reason));
        msg
    }

    /// Add an attribute
    pub fn add_attribute(&mut self, attr: StunAttribute) -> &mut Self {
        self.attributes.push(attr);
        self
    }

    /// Get the first attribute of the given type
    pub fn get_attribute(&self, attr_type: StunAttributeType) -> Option<&StunAttribute> {
        self.attributes.iter().find(|attr| attr.attr_type == attr_type)
    }

    /// Whether an attribute of the given type is present
    pub fn has_attribute(&self, attr_type: StunAttributeType) -> bool {
        self.get_attribute(attr_type).is_some()
    }

    /// ERROR-CODE value, if this message carries one
    pub fn error_code(&self) -> Option<u16> {
        self.get_attribute(StunAttributeType::ErrorCode)
            .and_then(|attr| attr.as_error_code().ok())
            .map(|(code, _)| code)
    }

    /// Decode the address carried by XOR-MAPPED-ADDRESS, falling back to MAPPED-ADDRESS
    pub fn mapped_address(&self) -> Option<std::net::SocketAddr> {
        if let Some(attr) = self.get_attribute(StunAttributeType::XorMappedAddress) {
            return attr.as_xor_address(&self.transaction_id).ok();
        }
        self.get_attribute(StunAttributeType::MappedAddress)
            .and_then(|attr| attr.as_mapped_address().ok())
    }

    /// Encode the message without MESSAGE-INTEGRITY or FINGERPRINT
    pub fn encode(&self) -> Bytes {
        self.encode_with(None, false)
    }

    /// Encode the message followed by FINGERPRINT
    pub fn encode_with_fingerprint(&self) -> Bytes {
        self.encode_with(None, true)
    }

    /// Encode the message followed by MESSAGE-INTEGRITY (HMAC-SHA1 keyed by
    /// `key`) and FINGERPRINT
    pub fn encode_with_integrity(&self, key: &[u8]) -> Bytes {
        self.encode_with(Some(key), true)
    }

    fn encode_with(&self, key: Option<&[u8]>, fingerprint: bool) -> Bytes {
        let attrs_size: usize = self
            .attributes
            .iter()
            .map(|attr| 4 + padded_len(attr.value.len()))
            .sum();
        let mut buf = BytesMut::with_capacity(
            STUN_HEADER_SIZE + attrs_size + INTEGRITY_ATTR_SIZE + FINGERPRINT_ATTR_SIZE,
        );

        buf.put_u16(self.msg_type.to_u16());
        buf.put_u16(0); // patched below
        buf.put_u32(STUN_MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            buf.put_u16(attr.attr_type.into());
            buf.put_u16(attr.value.len() as u16);
            buf.put_slice(&attr.value);
            let padding = padded_len(attr.value.len()) - attr.value.len();
            buf.put_bytes(0, padding);
        }

        if let Some(key) = key {
            // The length must already cover MESSAGE-INTEGRITY when the HMAC is computed
            let length = buf.len() - STUN_HEADER_SIZE + INTEGRITY_ATTR_SIZE;
            BigEndian::write_u16(&mut buf[2..4], length as u16);
            let tag = hmac_sha1(key, &buf);
            buf.put_u16(StunAttributeType::MessageIntegrity.into());
            buf.put_u16(20);
            buf.put_slice(&tag);
        }

        if fingerprint {
            let length = buf.len() - STUN_HEADER_SIZE + FINGERPRINT_ATTR_SIZE;
            BigEndian::write_u16(&mut buf[2..4], length as u16);
            let crc = crc32fast::hash(&buf) ^ FINGERPRINT_XOR;
            buf.put_u16(StunAttributeType::Fingerprint.into());
            buf.put_u16(4);
            buf.put_u32(crc);
        }

        let length = buf.len() - STUN_HEADER_SIZE;
        BigEndian::write_u16(&mut buf[2..4], length as u16);
        buf.freeze()
    }

    /// Decode a message from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < STUN_HEADER_SIZE {
            return Err(Error::StunError(format!(
                "STUN message too short: {} bytes",
                data.len()
            )));
        }

        // The two most significant bits of every STUN message are zero
        if data[0] & 0xC0 != 0 {
            return Err(Error::StunError("Not a STUN message".to_string()));
        }

        let msg_type = StunMessageType::from_u16(BigEndian::read_u16(&data[0..2]));
        let msg_length = BigEndian::read_u16(&data[2..4]) as usize;

        if BigEndian::read_u32(&data[4..8]) != STUN_MAGIC_COOKIE {
            return Err(Error::StunError("Invalid STUN magic cookie".to_string()));
        }
        if msg_length % 4 != 0 {
            return Err(Error::StunError(format!(
                "STUN message length {} is not a multiple of 4",
                msg_length
            )));
        }
        if data.len() < STUN_HEADER_SIZE + msg_length {
            return Err(Error::StunError(format!(
                "STUN message truncated: header says {} bytes, got {}",
                msg_length,
                data.len() - STUN_HEADER_SIZE
            )));
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);
        let transaction_id = TransactionId(transaction_id);

        let end = STUN_HEADER_SIZE + msg_length;
        let mut offset = STUN_HEADER_SIZE;
        let mut attributes = Vec::new();

        while offset + 4 <= end {
            let attr_type = StunAttributeType::from(BigEndian::read_u16(&data[offset..offset + 2]));
            let attr_length = BigEndian::read_u16(&data[offset + 2..offset + 4]) as usize;
            offset += 4;

            if offset + attr_length > end {
                return Err(Error::StunError(format!(
                    "Attribute {:?} overruns message ({} bytes at offset {})",
                    attr_type, attr_length, offset
                )));
            }

            attributes.push(StunAttribute::new(
                attr_type,
                Bytes::copy_from_slice(&data[offset..offset + attr_length]),
            ));
            offset += padded_len(attr_length);
        }

        Ok(Self {
            msg_type,
            transaction_id,
            attributes,
        })
    }
}

/// Cheap check whether a datagram looks like a STUN message
pub fn is_stun(data: &[u8]) -> bool {
    data.len() >= STUN_HEADER_SIZE
        && data[0] & 0xC0 == 0
        && BigEndian::read_u32(&data[4..8]) == STUN_MAGIC_COOKIE
}

/// Verify MESSAGE-INTEGRITY of a raw message against `key`
pub fn verify_integrity(raw: &[u8], key: &[u8]) -> Result<()> {
    let offset = find_attribute(raw, StunAttributeType::MessageIntegrity)
        .ok_or_else(|| Error::IntegrityFailure("MESSAGE-INTEGRITY missing".to_string()))?;
    if offset + INTEGRITY_ATTR_SIZE > raw.len() || BigEndian::read_u16(&raw[offset + 2..offset + 4]) != 20 {
        return Err(Error::IntegrityFailure("MESSAGE-INTEGRITY malformed".to_string()));
    }

    let mut covered = raw[..offset].to_vec();
    let length = offset - STUN_HEADER_SIZE + INTEGRITY_ATTR_SIZE;
    BigEndian::write_u16(&mut covered[2..4], length as u16);

    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|e| Error::IntegrityFailure(format!("Invalid HMAC key: {}", e)))?;
    mac.update(&covered);
    mac.verify_slice(&raw[offset + 4..offset + INTEGRITY_ATTR_SIZE])
        .map_err(|_| Error::IntegrityFailure("HMAC mismatch".to_string()))
}

/// Verify FINGERPRINT of a raw message. `Ok(false)` means the attribute is absent.
pub fn verify_fingerprint(raw: &[u8]) -> Result<bool> {
    let Some(offset) = find_attribute(raw, StunAttributeType::Fingerprint) else {
        return Ok(false);
    };
    if offset + FINGERPRINT_ATTR_SIZE > raw.len() {
        return Err(Error::IntegrityFailure("FINGERPRINT malformed".to_string()));
    }

    let mut covered = raw[..offset].to_vec();
    let length = offset - STUN_HEADER_SIZE + FINGERPRINT_ATTR_SIZE;
    BigEndian::write_u16(&mut covered[2..4], length as u16);

    let expected = crc32fast::hash(&covered) ^ FINGERPRINT_XOR;
    if BigEndian::read_u32(&raw[offset + 4..offset + 8]) != expected {
        return Err(Error::IntegrityFailure("FINGERPRINT mismatch".to_string()));
    }
    Ok(true)
}

/// Offset of the header of the first attribute of `attr_type`
fn find_attribute(raw: &[u8], attr_type: StunAttributeType) -> Option<usize> {
    if raw.len() < STUN_HEADER_SIZE {
        return None;
    }
    let wanted = u16::from(attr_type);
    let end = (STUN_HEADER_SIZE + BigEndian::read_u16(&raw[2..4]) as usize).min(raw.len());
    let mut offset = STUN_HEADER_SIZE;
    while offset + 4 <= end {
        if BigEndian::read_u16(&raw[offset..offset + 2]) == wanted {
            return Some(offset);
        }
        let length = BigEndian::read_u16(&raw[offset + 2..offset + 4]) as usize;
        offset += 4 + padded_len(length);
    }
    None
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha1::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return [0u8; 20],
    };
    mac.update(data);
    let mut tag = [0u8; 20];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    tag
}

fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn test_message_type_encoding() {
        assert_eq!(StunMessageType::BINDING_REQUEST.to_u16(), 0x0001);
        assert_eq!(StunMessageType::BINDING_RESPONSE.to_u16(), 0x0101);
        assert_eq!(StunMessageType::BINDING_ERROR_RESPONSE.to_u16(), 0x0111);
        assert_eq!(StunMessageType::BINDING_INDICATION.to_u16(), 0x0011);
        assert_eq!(
            StunMessageType::new(StunMethod::Data, StunClass::Indication).to_u16(),
            0x0017
        );
        assert_eq!(
            StunMessageType::new(StunMethod::Allocate, StunClass::ErrorResponse).to_u16(),
            0x0113
        );

        for value in [0x0001u16, 0x0101, 0x0111, 0x0003, 0x0113, 0x0009, 0x0016] {
            assert_eq!(StunMessageType::from_u16(value).to_u16(), value);
        }
    }

    #[test]
    fn test_binding_request_encode_decode() {
        let mut request = StunMessage::binding_request();
        request.add_attribute(StunAttribute::username("remote:local"));
        request.add_attribute(StunAttribute::priority(1853824767));
        request.add_attribute(StunAttribute::ice_controlling(42));

        let encoded = request.encode();
        assert_eq!(encoded.len() % 4, 0);
        assert!(is_stun(&encoded));

        let decoded = StunMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(
            decoded.get_attribute(StunAttributeType::Username).unwrap().as_string().unwrap(),
            "remote:local"
        );
    }

    #[test]
    fn test_integrity_and_fingerprint() {
        let mut request = StunMessage::binding_request();
        request.add_attribute(StunAttribute::username("abcd:efgh"));
        request.add_attribute(StunAttribute::use_candidate());

        let encoded = request.encode_with_integrity(b"the-password");
        assert!(verify_integrity(&encoded, b"the-password").is_ok());
        assert_eq!(verify_fingerprint(&encoded), Ok(true));
        assert!(matches!(
            verify_integrity(&encoded, b"wrong-password"),
            Err(Error::IntegrityFailure(_))
        ));

        // Decoding keeps the trailing attributes visible to the caller
        let decoded = StunMessage::decode(&encoded).unwrap();
        assert!(decoded.has_attribute(StunAttributeType::MessageIntegrity));
        assert!(decoded.has_attribute(StunAttributeType::Fingerprint));

        let mut tampered = encoded.to_vec();
        tampered[STUN_HEADER_SIZE + 5] ^= 0x01;
        assert!(verify_integrity(&tampered, b"the-password").is_err());
        assert!(verify_fingerprint(&tampered).is_err());
    }

    #[test]
    fn test_missing_integrity_is_a_failure() {
        let encoded = StunMessage::binding_request().encode();
        assert!(verify_integrity(&encoded, b"key").is_err());
        assert_eq!(verify_fingerprint(&encoded), Ok(false));
    }

    #[test]
    fn test_success_response_reuses_transaction_id() {
        let request = StunMessage::binding_request();
        let addr: SocketAddr = "203.0.113.7:4000".parse().unwrap();
        let mut response = StunMessage::success_response(&request);
        response.add_attribute(StunAttribute::xor_mapped_address(addr, &request.transaction_id));

        let decoded = StunMessage::decode(&response.encode_with_integrity(b"pw")).unwrap();
        assert_eq!(decoded.transaction_id, request.transaction_id);
        assert_eq!(decoded.msg_type, StunMessageType::BINDING_RESPONSE);
        assert_eq!(decoded.mapped_address(), Some(addr));

        let error = StunMessage::error_response(&request, 487, "Role Conflict");
        let decoded = StunMessage::decode(&error.encode()).unwrap();
        assert_eq!(decoded.msg_type, StunMessageType::BINDING_ERROR_RESPONSE);
        assert_eq!(decoded.error_code(), Some(487));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(StunMessage::decode(&[0u8; 10]).is_err());

        let mut encoded = StunMessage::binding_request().encode().to_vec();
        encoded[4] = 0;
        assert!(StunMessage::decode(&encoded).is_err());

        // Attribute claiming more bytes than the message carries
        let mut request = StunMessage::binding_request();
        request.add_attribute(StunAttribute::username("user"));
        let mut encoded = request.encode().to_vec();
        encoded[STUN_HEADER_SIZE + 3] = 200;
        assert!(StunMessage::decode(&encoded).is_err());

        assert!(!is_stun(&[0x80u8; 20]));
    }
}
