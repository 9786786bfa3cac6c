//! In-memory message representation.
//!
//! A [`Message`] is the unit the router moves between endpoints: a type
//! (method call, method reply, error, signal), a serial number, flags, an
//! endianness marker, a typed header-field table, and a list of arguments.
//! Marshalling to and from the peer wire format is the codec's job (see
//! [`crate::codec`]); this module owns the shape and the invariants.
//!
//! Header fields are a typed struct rather than an indexed slot array, so a
//! handler reads `msg.fields.destination` instead of poking a field table by
//! ordinal.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 2;

/// Message flag bits.
pub mod flags {
    /// The sender does not expect a reply to this method call.
    pub const NO_REPLY_EXPECTED: u8 = 0x01;
    /// The destination service may be auto-started (accepted, unused here).
    pub const AUTO_START: u8 = 0x02;
    /// A broadcast signal carrying this flag is forwarded once over each
    /// bus-to-bus link.
    pub const ALLOW_REMOTE: u8 = 0x04;
}

/// Kind of a bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A call expecting (unless flagged otherwise) a reply.
    MethodCall,
    /// A successful reply to a method call.
    MethodReturn,
    /// An error reply to a method call.
    Error,
    /// A one-way notification, unicast or broadcast.
    Signal,
}

/// Byte order the sender marshalled its body with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Endianness of this host.
    #[must_use]
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }
}

/// A single typed message argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgArg {
    Byte(u8),
    Bool(bool),
    U16(u16),
    U32(u32),
    U64(u64),
    String(String),
    ObjectPath(String),
    Signature(String),
    Array(Vec<MsgArg>),
    Struct(Vec<MsgArg>),
}

impl MsgArg {
    /// Type signature of this argument.
    #[must_use]
    pub fn signature(&self) -> String {
        match self {
            Self::Byte(_) => "y".into(),
            Self::Bool(_) => "b".into(),
            Self::U16(_) => "q".into(),
            Self::U32(_) => "u".into(),
            Self::U64(_) => "t".into(),
            Self::String(_) => "s".into(),
            Self::ObjectPath(_) => "o".into(),
            Self::Signature(_) => "g".into(),
            // The element signature of an empty array is unknowable from the
            // value alone; "s" is the convention used by the control plane.
            Self::Array(elems) => {
                let elem = elems.first().map_or_else(|| "s".into(), Self::signature);
                format!("a{elem}")
            }
            Self::Struct(fields) => {
                let inner: String = fields.iter().map(|f| f.signature()).collect();
                format!("({inner})")
            }
        }
    }

    /// Borrows the string payload of string-like variants.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::ObjectPath(s) | Self::Signature(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the u32 payload, if this is a `U32`.
    #[must_use]
    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            _ => None,
        }
    }
}

/// Computes the signature of an argument list.
#[must_use]
pub fn signature_of(args: &[MsgArg]) -> String {
    args.iter().map(MsgArg::signature).collect()
}

/// Typed header-field table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderFields {
    /// Object path, required for method calls and signals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Interface name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Member (method or signal) name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    /// Error name, required for error replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    /// Serial of the call this message replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_serial: Option<u32>,
    /// Destination bus name; absent on broadcast signals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Sender unique name, rewritten by the router on entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Body signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Sender-side timestamp in milliseconds, only meaningful with a TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Time-to-live in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<u32>,
}

/// A routable bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind.
    pub msg_type: MessageType,
    /// Sender-assigned serial number, non-zero.
    pub serial: u32,
    /// Flag bits, see [`flags`].
    pub flags: u8,
    /// Byte order of the original marshalling.
    pub endianness: Endianness,
    /// Header-field table.
    pub fields: HeaderFields,
    /// Argument list.
    pub args: Vec<MsgArg>,
    /// Local arrival instant, stamped at creation or decode. Not part of
    /// the wire form; drives TTL expiry against the local monotonic clock.
    #[serde(skip)]
    pub arrival: Option<Instant>,
}

impl Message {
    /// Builds a method call.
    #[must_use]
    pub fn method_call(
        serial: u32,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        destination: impl Into<String>,
        args: Vec<MsgArg>,
    ) -> Self {
        let signature = non_empty(signature_of(&args));
        Self {
            msg_type: MessageType::MethodCall,
            serial,
            flags: 0,
            endianness: Endianness::native(),
            fields: HeaderFields {
                path: Some(path.into()),
                interface: Some(interface.into()),
                member: Some(member.into()),
                destination: Some(destination.into()),
                signature,
                ..HeaderFields::default()
            },
            args,
            arrival: Some(Instant::now()),
        }
    }

    /// Builds the successful reply to `call`.
    #[must_use]
    pub fn method_return(serial: u32, call: &Self, args: Vec<MsgArg>) -> Self {
        let signature = non_empty(signature_of(&args));
        Self {
            msg_type: MessageType::MethodReturn,
            serial,
            flags: 0,
            endianness: Endianness::native(),
            fields: HeaderFields {
                reply_serial: Some(call.serial),
                destination: call.fields.sender.clone(),
                signature,
                ..HeaderFields::default()
            },
            args,
            arrival: Some(Instant::now()),
        }
    }

    /// Builds an error reply to `call` carrying the stable wire name of
    /// `error` and a human-readable description.
    #[must_use]
    pub fn error_reply(serial: u32, call: &Self, error: &BusError) -> Self {
        Self {
            msg_type: MessageType::Error,
            serial,
            flags: 0,
            endianness: Endianness::native(),
            fields: HeaderFields {
                error_name: Some(error.name().to_string()),
                reply_serial: Some(call.serial),
                destination: call.fields.sender.clone(),
                signature: Some("s".into()),
                ..HeaderFields::default()
            },
            args: vec![MsgArg::String(error.to_string())],
            arrival: Some(Instant::now()),
        }
    }

    /// Builds a signal. Broadcast unless a destination is set with
    /// [`Message::with_destination`].
    #[must_use]
    pub fn signal(
        serial: u32,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        args: Vec<MsgArg>,
    ) -> Self {
        let signature = non_empty(signature_of(&args));
        Self {
            msg_type: MessageType::Signal,
            serial,
            flags: 0,
            endianness: Endianness::native(),
            fields: HeaderFields {
                path: Some(path.into()),
                interface: Some(interface.into()),
                member: Some(member.into()),
                signature,
                ..HeaderFields::default()
            },
            args,
            arrival: Some(Instant::now()),
        }
    }

    /// Sets the destination field.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.fields.destination = Some(destination.into());
        self
    }

    /// Sets flag bits.
    #[must_use]
    pub const fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Attaches a time-to-live in milliseconds. The expiry clock starts at
    /// the message's arrival instant.
    #[must_use]
    pub fn with_ttl_ms(mut self, ttl_ms: u32) -> Self {
        self.fields.time_to_live = Some(ttl_ms);
        if self.arrival.is_none() {
            self.arrival = Some(Instant::now());
        }
        self
    }

    /// Rewrites the sender field. Routers call this on message entry so the
    /// sender can never spoof another endpoint's name.
    pub fn set_sender(&mut self, sender: impl Into<String>) {
        self.fields.sender = Some(sender.into());
    }

    /// Whether a reply should be generated for this message.
    #[must_use]
    pub fn reply_expected(&self) -> bool {
        self.msg_type == MessageType::MethodCall && self.flags & flags::NO_REPLY_EXPECTED == 0
    }

    /// Whether this is a signal with no explicit destination.
    #[must_use]
    pub fn is_broadcast_signal(&self) -> bool {
        self.msg_type == MessageType::Signal && self.fields.destination.is_none()
    }

    /// Whether the message's TTL has elapsed. Messages without a TTL never
    /// expire. Re-evaluated at every queue dequeue.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        match (self.fields.time_to_live, self.arrival) {
            (Some(ttl_ms), Some(arrival)) => {
                arrival.elapsed() >= Duration::from_millis(u64::from(ttl_ms))
            }
            _ => false,
        }
    }

    /// Stamps the arrival instant, if not already set.
    pub fn stamp_arrival(&mut self) {
        if self.arrival.is_none() {
            self.arrival = Some(Instant::now());
        }
    }
}

fn non_empty(signature: String) -> Option<String> {
    if signature.is_empty() {
        None
    } else {
        Some(signature)
    }
}

/// Monotonic serial-number source. Serials are per-daemon and never zero.
#[derive(Debug)]
pub struct SerialCounter(AtomicU32);

impl SerialCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    /// Returns the next serial, skipping zero on wrap.
    pub fn next(&self) -> u32 {
        let mut serial = self.0.fetch_add(1, Ordering::Relaxed);
        if serial == 0 {
            serial = self.0.fetch_add(1, Ordering::Relaxed);
        }
        serial
    }
}

impl Default for SerialCounter {
    fn default() -> Self {
        Self::new()
    }
}
