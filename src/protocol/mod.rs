//! Wire Protocol
//!
//! RelayKV speaks the Redis Serialization Protocol (RESP) to clients and to
//! replicas alike. Replicas are just long-lived clients that issued `PSYNC`.
//!
//! ## Modules
//!
//! - `types`: the reply encoder (`RespValue`) and the parsed request (`Command`)
//! - `parser`: incremental parser turning buffered bytes into commands
//!
//! ## Example
//!
//! ```
//! use relaykv::protocol::{parse_command, RespValue};
//!
//! let data = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
//! let (command, consumed) = parse_command(data).unwrap().unwrap();
//! assert_eq!(command.name(), "get");
//! assert_eq!(consumed, data.len());
//!
//! let response = RespValue::bulk_string("Ariz");
//! assert_eq!(response.serialize(), b"$4\r\nAriz\r\n");
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_command, parse_file_frame, CommandParser, ParseError, ParseResult};
pub use types::{Command, RespValue};
