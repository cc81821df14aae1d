//! Field escaping and frame encoding for the socket protocol
//!
//! Binary frames are a big-endian `u16` type code, a big-endian `u16`
//! payload length and the payload. Legacy frames are a decimal type code,
//! a space and the payload, terminated by CRLF. In both, the payload is the
//! message's fields separated by single spaces.

use log::trace;

use crate::error::{ChatError, Result};
use crate::protocol::schema::WireMessage;

const HEADER_LEN: usize = 4;
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;
const LIST_PREFIX: &str = "[]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Binary,
    /// Text lines used by older clients
    Legacy,
}

impl Framing {
    /// Legacy clients open with a decimal type code
    pub fn detect(first_byte: u8) -> Self {
        if first_byte.is_ascii_digit() {
            Framing::Legacy
        } else {
            Framing::Binary
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u16,
    pub payload: String,
}

fn needs_quotes(value: &str, extra: &[char]) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\' || extra.contains(&c))
}

fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Quote a field if it is empty or holds whitespace, quotes or backslashes
pub fn encode_field(value: &str) -> String {
    if needs_quotes(value, &[]) {
        quote(value)
    } else {
        value.to_string()
    }
}

pub fn join_fields(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| encode_field(f))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Read one possibly quoted token starting at `chars`, stopping at any of `separators`
fn read_token<I>(chars: &mut std::iter::Peekable<I>, separators: &[char]) -> Result<String>
where
    I: Iterator<Item = char>,
{
    let mut token = String::new();
    if chars.peek() == Some(&'"') {
        chars.next();
        loop {
            match chars.next() {
                Some('\\') => match chars.next() {
                    Some(c) => token.push(c),
                    None => {
                        return Err(ChatError::MessageParseError(
                            "dangling escape at end of payload".to_string(),
                        ))
                    }
                },
                Some('"') => break,
                Some(c) => token.push(c),
                None => {
                    return Err(ChatError::MessageParseError(
                        "unterminated quoted field".to_string(),
                    ))
                }
            }
        }
        match chars.peek() {
            None => {}
            Some(c) if separators.contains(c) || (separators.is_empty() && c.is_whitespace()) => {}
            Some(c) => {
                return Err(ChatError::MessageParseError(format!(
                    "unexpected {:?} after quoted field",
                    c
                )))
            }
        }
    } else {
        while let Some(&c) = chars.peek() {
            if separators.contains(&c) || (separators.is_empty() && c.is_whitespace()) {
                break;
            }
            token.push(c);
            chars.next();
        }
    }
    Ok(token)
}

/// Split a payload into its fields, undoing quoting
pub fn decode_fields(payload: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut chars = payload.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }
        fields.push(read_token(&mut chars, &[])?);
    }
    Ok(fields)
}

/// Encode a list field: `[]` then comma-separated items
pub fn encode_list(items: &[String]) -> String {
    let body = items
        .iter()
        .map(|item| {
            if needs_quotes(item, &[',']) {
                quote(item)
            } else {
                item.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("{}{}", LIST_PREFIX, body)
}

pub fn decode_list(value: &str) -> Result<Vec<String>> {
    let body = value.strip_prefix(LIST_PREFIX).ok_or_else(|| {
        ChatError::MessageParseError(format!("list field must start with []: {:?}", value))
    })?;
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let mut items = Vec::new();
    let mut chars = body.chars().peekable();
    loop {
        items.push(read_token(&mut chars, &[','])?);
        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(c) => {
                return Err(ChatError::MessageParseError(format!(
                    "unexpected {:?} in list",
                    c
                )))
            }
        }
    }
    Ok(items)
}

/// Wrap a payload in a frame of the given style
pub fn encode_frame(framing: Framing, code: u16, payload: &str) -> Result<Vec<u8>> {
    match framing {
        Framing::Binary => {
            let bytes = payload.as_bytes();
            if bytes.len() > MAX_PAYLOAD_LEN {
                return Err(ChatError::MessageTooLarge(bytes.len()));
            }
            let mut frame = Vec::with_capacity(HEADER_LEN + bytes.len());
            frame.extend_from_slice(&code.to_be_bytes());
            frame.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            frame.extend_from_slice(bytes);
            Ok(frame)
        }
        Framing::Legacy => {
            if payload.len() > MAX_PAYLOAD_LEN {
                return Err(ChatError::MessageTooLarge(payload.len()));
            }
            // A line break would end the line early; flatten it
            let payload = payload.replace("\r\n", " ").replace(['\r', '\n'], " ");
            Ok(format!("{} {}\r\n", code, payload).into_bytes())
        }
    }
}

/// Decode one complete binary frame; trailing bytes beyond the declared length are ignored
pub fn decode_binary_frame(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() < HEADER_LEN {
        return Err(ChatError::FrameTooShort(bytes.len()));
    }
    let code = u16::from_be_bytes([bytes[0], bytes[1]]);
    let declared = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let available = bytes.len() - HEADER_LEN;
    if available < declared {
        return Err(ChatError::FrameLengthMismatch {
            declared,
            available,
        });
    }
    let payload = std::str::from_utf8(&bytes[HEADER_LEN..HEADER_LEN + declared])
        .map_err(|e| ChatError::MessageParseError(format!("payload is not UTF-8: {}", e)))?;
    Ok(Frame {
        code,
        payload: payload.to_string(),
    })
}

/// Decode one legacy line, without its line terminator
pub fn decode_legacy_line(line: &str) -> Result<Frame> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (code, payload) = line.split_once(' ').unwrap_or((line, ""));
    let code = code
        .parse()
        .map_err(|_| ChatError::MessageParseError(format!("bad message type {:?}", code)))?;
    Ok(Frame {
        code,
        payload: payload.to_string(),
    })
}

pub fn encode<M: WireMessage>(framing: Framing, message: &M) -> Result<Vec<u8>> {
    let payload = join_fields(&message.to_fields());
    trace!("Encoding type {} ({} bytes)", message.code(), payload.len());
    encode_frame(framing, message.code(), &payload)
}

pub fn decode<M: WireMessage>(frame: &Frame) -> Result<M> {
    M::from_fields(frame.code, decode_fields(&frame.payload)?)
}

/// Accumulates bytes from a stream and splits them into frames.
///
/// The framing is fixed by the first byte received.
#[derive(Debug, Default)]
pub struct FrameReader {
    framing: Option<Framing>,
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn framing(&self) -> Option<Framing> {
        self.framing
    }

    pub fn push(&mut self, data: &[u8]) {
        if self.framing.is_none() {
            if let Some(&first) = data.first() {
                self.framing = Some(Framing::detect(first));
            }
        }
        self.buffer.extend_from_slice(data);
    }

    /// Take the next complete frame, if any.
    ///
    /// A malformed frame is consumed and reported; later frames are still readable.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.framing {
            None => Ok(None),
            Some(Framing::Binary) => self.next_binary(),
            Some(Framing::Legacy) => self.next_legacy(),
        }
    }

    fn next_binary(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let declared = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
        let total = HEADER_LEN + declared;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buffer.drain(..total).collect();
        decode_binary_frame(&frame).map(Some)
    }

    fn next_legacy(&mut self) -> Result<Option<Frame>> {
        let Some(end) = self.buffer.iter().position(|&b| b == b'\n') else {
            if self.buffer.len() > MAX_PAYLOAD_LEN {
                let len = self.buffer.len();
                self.buffer.clear();
                return Err(ChatError::MessageTooLarge(len));
            }
            return Ok(None);
        };
        let line: Vec<u8> = self.buffer.drain(..=end).collect();
        let line = String::from_utf8(line)
            .map_err(|e| ChatError::MessageParseError(format!("line is not UTF-8: {}", e)))?;
        if line.trim().is_empty() {
            return self.next_legacy();
        }
        decode_legacy_line(&line).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::schema::{ClientMessage, MessageSent, ServerMessage, WireUser};

    #[test]
    fn test_field_quoting() {
        assert_eq!(encode_field("plain"), "plain");
        assert_eq!(encode_field(""), "\"\"");
        assert_eq!(encode_field("two words"), "\"two words\"");
        assert_eq!(encode_field("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(encode_field("back\\slash"), "\"back\\\\slash\"");
    }

    #[test]
    fn test_decode_fields_handles_quotes_and_empties() {
        let fields = decode_fields("a \"b c\" \"\" \"d \\\"e\\\"\" f").unwrap();
        assert_eq!(fields, vec!["a", "b c", "", "d \"e\"", "f"]);
        assert!(decode_fields("").unwrap().is_empty());
        assert!(decode_fields("\"open").is_err());
    }

    #[test]
    fn test_list_fields() {
        let items = vec!["#FF0000".to_string(), "Light Red".to_string(), "a,b".to_string()];
        let encoded = encode_list(&items);
        assert_eq!(encoded, "[]#FF0000,\"Light Red\",\"a,b\"");
        assert_eq!(decode_list(&encoded).unwrap(), items);
        assert_eq!(decode_list("[]").unwrap(), Vec::<String>::new());
        assert!(decode_list("nope").is_err());
    }

    #[test]
    fn test_binary_frame_layout() {
        let frame = encode_frame(Framing::Binary, 110, "abc").unwrap();
        assert_eq!(frame, vec![0, 110, 0, 3, b'a', b'b', b'c']);
        let decoded = decode_binary_frame(&frame).unwrap();
        assert_eq!(decoded, Frame { code: 110, payload: "abc".to_string() });
    }

    #[test]
    fn test_binary_frame_errors() {
        assert!(matches!(decode_binary_frame(&[0, 1]), Err(ChatError::FrameTooShort(2))));
        assert!(matches!(
            decode_binary_frame(&[0, 1, 0, 10, b'x']),
            Err(ChatError::FrameLengthMismatch { declared: 10, available: 1 })
        ));
        let huge = "x".repeat(MAX_PAYLOAD_LEN + 1);
        assert!(matches!(
            encode_frame(Framing::Binary, 0, &huge),
            Err(ChatError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn test_legacy_frame_layout() {
        let frame = encode_frame(Framing::Legacy, 3, "a b").unwrap();
        assert_eq!(frame, b"3 a b\r\n".to_vec());
        assert_eq!(
            decode_legacy_line("110 abc\r\n").unwrap(),
            Frame { code: 110, payload: "abc".to_string() }
        );
        assert_eq!(decode_legacy_line("106").unwrap().payload, "");
        assert!(decode_legacy_line("x1 abc").is_err());
    }

    #[test]
    fn test_legacy_frame_flattens_line_breaks() {
        let frame = encode_frame(Framing::Legacy, 3, "one\ntwo\r\nthree\rfour").unwrap();
        assert_eq!(frame, b"3 one two three four\r\n".to_vec());

        let mut reader = FrameReader::new();
        reader.push(&frame);
        let decoded = reader.next_frame().unwrap().unwrap();
        assert_eq!(decoded.payload, "one two three four");
        assert_eq!(reader.next_frame().unwrap(), None);
    }

    #[test]
    fn test_framing_detection() {
        assert_eq!(Framing::detect(b'1'), Framing::Legacy);
        assert_eq!(Framing::detect(0), Framing::Binary);
    }

    #[test]
    fn test_reader_splits_binary_stream() {
        let mut bytes = encode(Framing::Binary, &ClientMessage::Ping { user_id: "u1".to_string() }).unwrap();
        bytes.extend(encode(Framing::Binary, &ClientMessage::RoomListRequest).unwrap());

        let mut reader = FrameReader::new();
        reader.push(&bytes[..3]);
        assert_eq!(reader.next_frame().unwrap(), None);
        reader.push(&bytes[3..]);
        assert_eq!(reader.framing(), Some(Framing::Binary));

        let first = reader.next_frame().unwrap().unwrap();
        assert_eq!(decode::<ClientMessage>(&first).unwrap(), ClientMessage::Ping { user_id: "u1".to_string() });
        let second = reader.next_frame().unwrap().unwrap();
        assert_eq!(decode::<ClientMessage>(&second).unwrap(), ClientMessage::RoomListRequest);
        assert_eq!(reader.next_frame().unwrap(), None);
    }

    #[test]
    fn test_reader_splits_legacy_lines() {
        let mut reader = FrameReader::new();
        reader.push(b"110 abc\r\n106 \r\n\r\n10");
        assert_eq!(reader.framing(), Some(Framing::Legacy));
        assert_eq!(reader.next_frame().unwrap().unwrap().code, 110);
        assert_eq!(reader.next_frame().unwrap().unwrap().code, 106);
        assert_eq!(reader.next_frame().unwrap(), None);
        reader.push(b"5 x\r\n");
        assert_eq!(reader.next_frame().unwrap().unwrap().code, 105);
    }

    #[test]
    fn test_reader_recovers_after_bad_frame() {
        let mut reader = FrameReader::new();
        reader.push(b"oops\r\n");
        // First byte is not a digit, so this is read as a binary header
        assert_eq!(reader.framing(), Some(Framing::Binary));

        let mut reader = FrameReader::new();
        reader.push(b"1x0 a\r\n110 b\r\n");
        assert!(reader.next_frame().is_err());
        assert_eq!(reader.next_frame().unwrap().unwrap().code, 110);
    }

    #[test]
    fn test_message_sent_round_trip() {
        let alice = WireUser {
            user_id: "u-1".to_string(),
            nickname: "Alice Smith".to_string(),
            color: "#FF0000".to_string(),
            room_id: "lobby".to_string(),
        };
        let message = ServerMessage::MessageSent(MessageSent {
            room_id: "lobby".to_string(),
            from: Some(alice.clone()),
            to: None,
            privately: false,
            speech_mode: "says-to".to_string(),
            time: "12:30:00".to_string(),
            is_system_message: true,
            system_message_subject: Some(alice),
            is_history: false,
            message: "she said \"hi\" \\ waved".to_string(),
        });

        for framing in [Framing::Binary, Framing::Legacy] {
            let bytes = encode(framing, &message).unwrap();
            let mut reader = FrameReader::new();
            reader.push(&bytes);
            let frame = reader.next_frame().unwrap().unwrap();
            assert_eq!(decode::<ServerMessage>(&frame).unwrap(), message);
        }
    }
}
