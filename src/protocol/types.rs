//! RESP (Redis Serialization Protocol) Data Types
//!
//! This module defines the values RelayKV writes on the wire and the
//! [`Command`] it reads off the wire.
//!
//! ## Protocol Format
//!
//! Each RESP type starts with a type prefix byte:
//! - `+` Simple String
//! - `:` Integer
//! - `$` Bulk String
//! - `*` Array
//!
//! All headers are terminated with CRLF (`\r\n`).
//!
//! ## Examples
//!
//! Simple String: `+OK\r\n`
//! Integer: `:1000\r\n`
//! Bulk String: `$5\r\nhello\r\n`
//! Array: `*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`
//! Null Bulk String: `$-1\r\n`
//! Snapshot file: `$<len>\r\n<raw bytes>` (no trailing CRLF)

use bytes::Bytes;
use std::borrow::Cow;
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// Represents a value written in the RESP protocol.
///
/// Encoding is deterministic and byte-exact: the leader's replication offset
/// is derived from the length of exactly these bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Simple strings cannot contain CRLF characters.
    /// Format: `+<string>\r\n`
    SimpleString(String),

    /// 64-bit signed integers.
    /// Format: `:<integer>\r\n`
    Integer(i64),

    /// Binary-safe bulk strings.
    /// Format: `$<length>\r\n<data>\r\n`
    BulkString(Bytes),

    /// Null bulk string.
    /// Format: `$-1\r\n`
    Null,

    /// Arrays of RESP values.
    /// Format: `*<count>\r\n<element1><element2>...`
    Array(Vec<RespValue>),

    /// Raw snapshot payload sent during a full resync.
    /// Format: `$<length>\r\n<data>`, without the trailing CRLF.
    File(Bytes),
}

impl RespValue {
    /// Creates a new simple string response.
    ///
    /// # Example
    /// ```
    /// use relaykv::protocol::types::RespValue;
    /// let ok = RespValue::simple_string("OK");
    /// assert_eq!(ok.serialize(), b"+OK\r\n");
    /// ```
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Creates a new integer response.
    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    /// Creates a new bulk string response.
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Creates a null response.
    pub fn null() -> Self {
        RespValue::Null
    }

    /// Creates an array response.
    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// Creates a raw file frame carrying snapshot bytes.
    pub fn file(data: impl Into<Bytes>) -> Self {
        RespValue::File(data.into())
    }

    /// Encodes an argument vector as an array of bulk strings.
    ///
    /// This is the form used for requests: handshake steps, propagated
    /// commands and `REPLCONF GETACK`.
    ///
    /// # Example
    /// ```
    /// use relaykv::protocol::types::RespValue;
    /// let ping = RespValue::command(["PING"]);
    /// assert_eq!(ping.serialize(), b"*1\r\n$4\r\nPING\r\n");
    /// ```
    pub fn command<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        RespValue::Array(
            args.into_iter()
                .map(|arg| RespValue::BulkString(Bytes::copy_from_slice(arg.as_ref())))
                .collect(),
        )
    }

    /// Common response for successful operations
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// Common response for PONG
    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Serializes the RESP value to bytes for sending over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the RESP value into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::BulkString(data) => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
            RespValue::Array(values) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
            RespValue::File(data) => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
            }
        }
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "\"{}\"", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "(binary data, {} bytes)", data.len())
                }
            }
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) => {
                if values.is_empty() {
                    write!(f, "(empty array)")
                } else {
                    let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                    write!(f, "[{}]", parts.join(", "))
                }
            }
            RespValue::File(data) => write!(f, "(snapshot, {} bytes)", data.len()),
        }
    }
}

/// A request read off the wire.
///
/// Holds the argument vector (`argv[0]` is the verb), the verb lower-cased
/// once at parse time, and the exact number of bytes the frame occupied on
/// the wire. `size` is what replicas add to their replication offset, so it
/// is never recomputed from the arguments.
///
/// Arguments are raw bytes; only the verb is interpreted as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<Bytes>,
    size: usize,
}

impl Command {
    /// Creates a command from its arguments and consumed byte count.
    pub fn new(args: Vec<Bytes>, size: usize) -> Self {
        let name = args
            .first()
            .map(|verb| String::from_utf8_lossy(verb).to_ascii_lowercase())
            .unwrap_or_default();
        Self { name, args, size }
    }

    /// The lower-cased verb, or `""` for a zero-argument command.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The full argument vector, verb included.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Returns `argv[index]` if present.
    pub fn arg(&self, index: usize) -> Option<&Bytes> {
        self.args.get(index)
    }

    /// Returns `argv[index]` as text, with invalid UTF-8 replaced.
    ///
    /// For options, numbers and subcommands; keys and values stay bytes.
    pub fn arg_str(&self, index: usize) -> Option<Cow<'_, str>> {
        self.args.get(index).map(|arg| String::from_utf8_lossy(arg))
    }

    /// Number of arguments after the verb.
    pub fn arity(&self) -> usize {
        self.args.len().saturating_sub(1)
    }

    /// Bytes this command occupied on the wire.
    pub fn size(&self) -> usize {
        self.size
    }

    /// True for frames that carried no arguments at all.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Re-encodes the argument vector as a RESP array of bulk strings.
    pub fn to_resp(&self) -> RespValue {
        RespValue::Array(self.args.iter().cloned().map(RespValue::BulkString).collect())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(&String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_string_serialize() {
        let value = RespValue::simple_string("OK");
        assert_eq!(value.serialize(), b"+OK\r\n");
    }

    #[test]
    fn test_integer_serialize() {
        let value = RespValue::integer(1000);
        assert_eq!(value.serialize(), b":1000\r\n");

        let negative = RespValue::integer(-42);
        assert_eq!(negative.serialize(), b":-42\r\n");
    }

    #[test]
    fn test_bulk_string_serialize() {
        let value = RespValue::bulk_string(Bytes::from("hello"));
        assert_eq!(value.serialize(), b"$5\r\nhello\r\n");
    }

    #[test]
    fn test_null_serialize() {
        assert_eq!(RespValue::null().serialize(), b"$-1\r\n");
    }

    #[test]
    fn test_array_serialize() {
        let value = RespValue::array(vec![
            RespValue::bulk_string(Bytes::from("GET")),
            RespValue::bulk_string(Bytes::from("name")),
        ]);
        assert_eq!(value.serialize(), b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
    }

    #[test]
    fn test_file_has_no_trailing_crlf() {
        let value = RespValue::file(Bytes::from_static(b"REDIS0011\xff"));
        assert_eq!(value.serialize(), b"$10\r\nREDIS0011\xff");
    }

    #[test]
    fn test_command_encoding_matches_wire_form() {
        let value = RespValue::command(["SET", "foo", "bar"]);
        assert_eq!(
            value.serialize(),
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n"
        );
    }

    #[test]
    fn test_getack_encoding_length() {
        // Replicas count these 37 bytes into their offset.
        let value = RespValue::command(["REPLCONF", "GETACK", "*"]);
        assert_eq!(value.serialize().len(), 37);
    }

    #[test]
    fn test_command_name_is_lowercased() {
        let command = Command::new(vec!["SeT".into(), "k".into(), "v".into()], 29);
        assert_eq!(command.name(), "set");
        assert_eq!(command.arg_str(0).as_deref(), Some("SeT"));
        assert_eq!(command.arity(), 2);
        assert_eq!(command.size(), 29);
    }

    #[test]
    fn test_empty_command() {
        let command = Command::new(vec![], 3);
        assert!(command.is_empty());
        assert_eq!(command.name(), "");
        assert_eq!(command.arity(), 0);
    }

    #[test]
    fn test_command_reencodes_original_case() {
        let command = Command::new(vec!["set".into(), "Key".into(), "Value".into()], 0);
        assert_eq!(
            command.to_resp().serialize(),
            b"*3\r\n$3\r\nset\r\n$3\r\nKey\r\n$5\r\nValue\r\n"
        );
    }

    #[test]
    fn test_command_keeps_binary_arguments() {
        let command = Command::new(
            vec!["SET".into(), "bin".into(), Bytes::from_static(b"\xff\xfe")],
            29,
        );
        assert_eq!(command.arg(2).map(|v| &v[..]), Some(&b"\xff\xfe"[..]));
        assert_eq!(command.arg_str(2).as_deref(), Some("\u{fffd}\u{fffd}"));
        assert_eq!(
            command.to_resp().serialize(),
            b"*3\r\n$3\r\nSET\r\n$3\r\nbin\r\n$2\r\n\xff\xfe\r\n"
        );
        assert_eq!(command.to_string(), "SET bin \u{fffd}\u{fffd}");
    }
}
