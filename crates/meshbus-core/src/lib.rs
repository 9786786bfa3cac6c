//! meshbus-core - message model and name management for the meshbus daemon.
//!
//! This crate holds the daemon's domain model: the typed message and
//! header-field representation, bus name forms and the ownership table,
//! the daemon GUID, the message-codec seam, and the configuration schema.
//! Everything runtime-shaped (endpoints, routing, transports, the control
//! object) lives in `meshbus-daemon`.
//!
//! # Modules
//!
//! - [`message`]: typed messages, header fields, arguments, TTL expiry
//! - [`name`]: name forms, request flags, reply codes
//! - [`name_table`]: alias ownership with queued claimants and listeners
//! - [`codec`]: marshal/unmarshal seam with the JSON default
//! - [`guid`]: per-daemon 128-bit identifier
//! - [`config`]: TOML configuration schema
//! - [`error`]: bus error kinds with stable wire names

pub mod codec;
pub mod config;
pub mod error;
pub mod guid;
pub mod message;
pub mod name;
pub mod name_table;

pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use config::{BusConfig, BusType, ConfigError, Limits};
pub use error::BusError;
pub use guid::BusGuid;
pub use message::{
    flags, signature_of, Endianness, HeaderFields, Message, MessageType, MsgArg, SerialCounter,
    PROTOCOL_VERSION,
};
pub use name::{
    is_bus_name, is_unique_name, is_well_known_name, request_flags, ReleaseNameReply,
    RequestNameReply, MAX_NAME_LEN,
};
pub use name_table::{NameListener, NameTable};
