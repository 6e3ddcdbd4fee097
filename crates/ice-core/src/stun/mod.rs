//! STUN message codec and transaction layer
//!
//! Messages follow RFC 5389 framing: a 20-byte header (type, length, magic
//! cookie, 96-bit transaction id) followed by TLV attributes padded to four
//! bytes. MESSAGE-INTEGRITY uses HMAC-SHA1 and FINGERPRINT is CRC-32 XORed
//! with `0x5354554E`.

pub mod attribute;
pub mod message;
pub mod transaction;

pub use attribute::{StunAttribute, StunAttributeType};
pub use message::{
    is_stun, verify_fingerprint, verify_integrity, StunClass, StunMessage, StunMessageType,
    StunMethod, TransactionId,
};
pub use transaction::{PendingTransaction, RetransmitPolicy, TransactionTable, TransactionTimer};

/// STUN message header size (20 bytes)
pub const STUN_HEADER_SIZE: usize = 20;

/// STUN magic cookie value (RFC 5389)
pub const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

/// Value XORed into the CRC-32 of FINGERPRINT
pub const FINGERPRINT_XOR: u32 = 0x5354554E;
