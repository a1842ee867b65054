//! Minimal RFC 7252 message framing.
//!
//! ```txt
//!      0                   1                   2                   3
//!      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!     |Ver| T |  TKL  |      Code     |          Message ID           |
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!     |   Token (if any, TKL bytes) ...
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!     |   Options (if any) ...
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!     |1 1 1 1 1 1 1 1|    Payload (if any) ...
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Just enough of the protocol for the daemons to exchange requests,
//! responses and notifications: the fixed header, tokens, the option
//! delta/length encoding with its 13/14 extensions, and the option numbers
//! the runtime uses. Retransmission and blockwise transfer stay with the
//! peer stack.

use bytes::{Buf, BufMut};
use thiserror::Error;

use super::CoapMethod;

pub const OPTION_OBSERVE: u16 = 6;
pub const OPTION_LOCATION_PATH: u16 = 8;
pub const OPTION_URI_PATH: u16 = 11;
pub const OPTION_CONTENT_FORMAT: u16 = 12;
pub const OPTION_URI_QUERY: u16 = 15;
pub const OPTION_ACCEPT: u16 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("datagram shorter than the fixed header")]
    ShortHeader,
    #[error("unsupported CoAP version {0}")]
    BadVersion(u8),
    #[error("token length {0} exceeds 8")]
    BadTokenLength(u8),
    #[error("truncated or malformed options")]
    BadOptions,
    #[error("reserved option nibble 15")]
    ReservedOptionNibble,
}

/// One decoded (or to-be-encoded) CoAP message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub message_type: Option<MessageType>,
    pub code: u8,
    pub message_id: u16,
    pub token: Vec<u8>,
    /// `(number, value)`, kept sorted by number for encoding.
    pub options: Vec<(u16, Vec<u8>)>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn request(method: CoapMethod, message_id: u16, token: Vec<u8>) -> Self {
        Self {
            message_type: Some(MessageType::Confirmable),
            code: method_code(method),
            message_id,
            token,
            ..Default::default()
        }
    }

    pub fn response(code: u8, message_id: u16, token: Vec<u8>) -> Self {
        Self {
            message_type: Some(MessageType::Acknowledgement),
            code,
            message_id,
            token,
            ..Default::default()
        }
    }

    pub fn is_request(&self) -> bool {
        (1..=4).contains(&self.code)
    }

    pub fn is_response(&self) -> bool {
        self.code >> 5 >= 2
    }

    pub fn method(&self) -> Option<CoapMethod> {
        Some(match self.code {
            1 => CoapMethod::Get,
            2 => CoapMethod::Post,
            3 => CoapMethod::Put,
            4 => CoapMethod::Delete,
            _ => return None,
        })
    }

    pub fn add_option(&mut self, number: u16, value: Vec<u8>) {
        let at = self
            .options
            .partition_point(|(existing, _)| *existing <= number);
        self.options.insert(at, (number, value));
    }

    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |(existing, _)| *existing == number)
            .map(|(_, value)| value.as_slice())
    }

    pub fn first_option(&self, number: u16) -> Option<&[u8]> {
        self.option_values(number).next()
    }

    /// Join the Uri-Path segments: `["3", "0"]` becomes `/3/0`.
    pub fn uri_path(&self) -> String {
        let mut path = String::new();
        for segment in self.option_values(OPTION_URI_PATH) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }
        path
    }

    pub fn set_uri_path(&mut self, path: &str) {
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            self.add_option(OPTION_URI_PATH, segment.as_bytes().to_vec());
        }
    }

    pub fn uri_query(&self) -> String {
        self.option_values(OPTION_URI_QUERY)
            .map(|value| String::from_utf8_lossy(value).into_owned())
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn set_uri_query(&mut self, query: &str) {
        for segment in query.split('&').filter(|segment| !segment.is_empty()) {
            self.add_option(OPTION_URI_QUERY, segment.as_bytes().to_vec());
        }
    }

    pub fn location_path(&self) -> Option<String> {
        let segments: Vec<String> = self
            .option_values(OPTION_LOCATION_PATH)
            .map(|value| String::from_utf8_lossy(value).into_owned())
            .collect();
        (!segments.is_empty()).then(|| segments.join("/"))
    }

    pub fn set_location_path(&mut self, location: &str) {
        for segment in location.split('/').filter(|segment| !segment.is_empty()) {
            self.add_option(OPTION_LOCATION_PATH, segment.as_bytes().to_vec());
        }
    }

    pub fn uint_option(&self, number: u16) -> Option<u32> {
        let value = self.first_option(number)?;
        if value.len() > 4 {
            return None;
        }
        Some(
            value
                .iter()
                .fold(0u32, |accumulator, &byte| (accumulator << 8) | byte as u32),
        )
    }

    pub fn set_uint_option(&mut self, number: u16, value: u32) {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|&&byte| byte == 0).count();
        self.add_option(number, bytes[skip..].to_vec());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.token.len() + self.payload.len());
        let message_type = self.message_type.unwrap_or(MessageType::NonConfirmable);
        buf.put_u8((1 << 6) | (message_type.bits() << 4) | self.token.len() as u8);
        buf.put_u8(self.code);
        buf.put_u16(self.message_id);
        buf.extend_from_slice(&self.token);

        let mut previous = 0u16;
        for (number, value) in &self.options {
            let delta = number - previous;
            previous = *number;

            let (delta_nibble, delta_ext) = nibble_for(delta);
            let (length_nibble, length_ext) = nibble_for(value.len() as u16);
            buf.put_u8((delta_nibble << 4) | length_nibble);
            put_extended(&mut buf, delta_nibble, delta_ext);
            put_extended(&mut buf, length_nibble, length_ext);
            buf.extend_from_slice(value);
        }

        if !self.payload.is_empty() {
            buf.put_u8(0xFF);
            buf.extend_from_slice(&self.payload);
        }
        buf
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        if datagram.len() < 4 {
            return Err(WireError::ShortHeader);
        }
        let mut buf = datagram;
        let first = buf.get_u8();
        let version = first >> 6;
        if version != 1 {
            return Err(WireError::BadVersion(version));
        }
        let message_type = MessageType::from_bits(first >> 4);
        let token_length = first & 0x0F;
        if token_length > 8 {
            return Err(WireError::BadTokenLength(token_length));
        }
        let code = buf.get_u8();
        let message_id = buf.get_u16();
        if buf.remaining() < token_length as usize {
            return Err(WireError::ShortHeader);
        }
        let token = buf[..token_length as usize].to_vec();
        buf.advance(token_length as usize);

        let mut options = vec![];
        let mut previous = 0u16;
        let mut payload = vec![];
        while buf.has_remaining() {
            let byte = buf.get_u8();
            if byte == 0xFF {
                if !buf.has_remaining() {
                    return Err(WireError::BadOptions);
                }
                payload = buf.to_vec();
                break;
            }
            let delta = read_extended(&mut buf, byte >> 4)?;
            let length = read_extended(&mut buf, byte & 0x0F)? as usize;
            if buf.remaining() < length {
                return Err(WireError::BadOptions);
            }
            previous += delta;
            options.push((previous, buf[..length].to_vec()));
            buf.advance(length);
        }

        Ok(Self {
            message_type: Some(message_type),
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

fn method_code(method: CoapMethod) -> u8 {
    match method {
        CoapMethod::Get => 1,
        CoapMethod::Post => 2,
        CoapMethod::Put => 3,
        CoapMethod::Delete => 4,
    }
}

fn nibble_for(value: u16) -> (u8, u16) {
    match value {
        0..=12 => (value as u8, 0),
        13..=268 => (13, value - 13),
        _ => (14, value - 269),
    }
}

/// The extension field width is fixed by the nibble: one byte for 13, two
/// for 14, none otherwise.
fn put_extended(buf: &mut Vec<u8>, nibble: u8, extension: u16) {
    match nibble {
        13 => buf.put_u8(extension as u8),
        14 => buf.put_u16(extension),
        _ => {}
    }
}

fn read_extended(buf: &mut &[u8], nibble: u8) -> Result<u16, WireError> {
    Ok(match nibble {
        0..=12 => nibble as u16,
        13 => {
            if !buf.has_remaining() {
                return Err(WireError::BadOptions);
            }
            buf.get_u8() as u16 + 13
        }
        14 => {
            if buf.remaining() < 2 {
                return Err(WireError::BadOptions);
            }
            buf.get_u16().saturating_add(269)
        }
        _ => return Err(WireError::ReservedOptionNibble),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_request_round_trips() {
        let mut message = Message::request(CoapMethod::Get, 0x1234, vec![0xAB, 0xCD]);
        message.set_uri_path("/3/0/9");
        message.set_uint_option(OPTION_ACCEPT, 11542);

        let encoded = message.encode();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.uri_path(), "/3/0/9");
        assert_eq!(decoded.method(), Some(CoapMethod::Get));
        assert_eq!(decoded.uint_option(OPTION_ACCEPT), Some(11542));
    }

    #[test]
    fn registration_request_carries_query_and_payload() {
        let mut message = Message::request(CoapMethod::Post, 1, vec![1]);
        message.set_uri_path("/rd");
        message.set_uri_query("ep=client1&lt=60&b=U");
        message.set_uint_option(OPTION_CONTENT_FORMAT, 40);
        message.payload = b"</3/0>".to_vec();

        let decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded.uri_path(), "/rd");
        assert_eq!(decoded.uri_query(), "ep=client1&lt=60&b=U");
        assert_eq!(decoded.uint_option(OPTION_CONTENT_FORMAT), Some(40));
        assert_eq!(decoded.payload, b"</3/0>");
    }

    #[test]
    fn response_with_location_round_trips() {
        let mut message = Message::response(0x41, 7, vec![9]);
        message.set_location_path("rd/3");

        let decoded = Message::decode(&message.encode()).unwrap();
        assert!(decoded.is_response());
        assert!(!decoded.is_request());
        assert_eq!(decoded.location_path().as_deref(), Some("rd/3"));
    }

    #[test]
    fn observe_option_encodes_small_uints() {
        let mut message = Message::response(0x45, 2, vec![1]);
        message.set_uint_option(OPTION_OBSERVE, 0);
        message.set_uint_option(OPTION_CONTENT_FORMAT, 0);

        let decoded = Message::decode(&message.encode()).unwrap();
        // A zero encodes as the empty option value.
        assert_eq!(decoded.first_option(OPTION_OBSERVE), Some(&[][..]));
        assert_eq!(decoded.uint_option(OPTION_OBSERVE), Some(0));
    }

    #[test]
    fn large_option_numbers_use_extended_deltas() {
        let mut message = Message::request(CoapMethod::Put, 3, vec![]);
        message.set_uint_option(OPTION_CONTENT_FORMAT, 11542);
        // Content-format 11542 needs a two-byte value.
        let decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded.uint_option(OPTION_CONTENT_FORMAT), Some(11542));
    }

    #[test]
    fn malformed_datagrams_are_rejected() {
        assert_eq!(Message::decode(&[0x40, 0x01]), Err(WireError::ShortHeader));
        assert_eq!(
            Message::decode(&[0x00, 0x01, 0x00, 0x01]),
            Err(WireError::BadVersion(0))
        );
        assert_eq!(
            Message::decode(&[0x49, 0x01, 0x00, 0x01]),
            Err(WireError::BadTokenLength(9))
        );
        // Option claims more bytes than remain.
        assert_eq!(
            Message::decode(&[0x40, 0x01, 0x00, 0x01, 0xB5, 0x33]),
            Err(WireError::BadOptions)
        );
    }

    #[test]
    fn empty_ack_has_no_token_or_options() {
        let message = Message {
            message_type: Some(MessageType::Acknowledgement),
            code: 0,
            message_id: 0x99,
            ..Default::default()
        };
        let encoded = message.encode();
        assert_eq!(encoded.len(), 4);
        assert_eq!(Message::decode(&encoded).unwrap(), message);
    }
}
