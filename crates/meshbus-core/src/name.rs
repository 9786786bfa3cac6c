//! Bus name forms, request flags, and reply codes.
//!
//! Two name spaces exist on the bus: unique names of the form `:<num>.<num>`
//! assigned by the daemon, and well-known names (aliases), dotted strings
//! chosen by applications. The numeric flag and reply values here are wire
//! contract and must stay stable.

/// Maximum length of any bus name.
pub const MAX_NAME_LEN: usize = 255;

/// Flags accepted by a name request.
pub mod request_flags {
    /// The owner permits another endpoint to take the name over.
    pub const ALLOW_REPLACEMENT: u32 = 0x01;
    /// The requester wants to take the name from a willing owner.
    pub const REPLACE_EXISTING: u32 = 0x02;
    /// The requester refuses to wait in the alias queue.
    pub const DO_NOT_QUEUE: u32 = 0x04;
}

/// Outcome of a name request. Values are wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestNameReply {
    /// The requester is now the primary owner.
    PrimaryOwner = 1,
    /// The requester was appended to the alias queue.
    InQueue = 2,
    /// The name is taken and the requester declined to queue.
    Exists = 3,
    /// The requester already owns the name.
    AlreadyOwner = 4,
}

/// Outcome of a name release. Values are wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReleaseNameReply {
    /// The requester's claim was removed.
    Released = 1,
    /// No such name is registered.
    NonExistent = 2,
    /// The requester had no claim on the name.
    NotOwner = 3,
}

/// Whether `name` is a daemon-assigned unique name (`:<num>.<num>`).
#[must_use]
pub fn is_unique_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LEN {
        return false;
    }
    let Some(rest) = name.strip_prefix(':') else {
        return false;
    };
    let mut parts = rest.split('.');
    let (Some(a), Some(b), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    is_decimal(a) && is_decimal(b)
}

/// Whether `name` is a valid well-known name: two or more dot-separated
/// elements of `[A-Za-z0-9_-]`, no element starting with a digit.
#[must_use]
pub fn is_well_known_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.starts_with(':') {
        return false;
    }
    let mut elements = 0usize;
    for element in name.split('.') {
        let mut chars = element.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-' => {}
            _ => return false,
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return false;
        }
        elements += 1;
    }
    elements >= 2
}

/// Whether `name` is valid in either name space.
#[must_use]
pub fn is_bus_name(name: &str) -> bool {
    is_unique_name(name) || is_well_known_name(name)
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_name_form() {
        assert!(is_unique_name(":1.0"));
        assert!(is_unique_name(":0.1"));
        assert!(is_unique_name(":4093.117"));
        assert!(!is_unique_name(":1"));
        assert!(!is_unique_name(":1.a"));
        assert!(!is_unique_name(":1.0.2"));
        assert!(!is_unique_name("1.0"));
        assert!(!is_unique_name(":"));
    }

    #[test]
    fn well_known_name_form() {
        assert!(is_well_known_name("org.example.A"));
        assert!(is_well_known_name("org.alljoyn.Bus"));
        assert!(is_well_known_name("a.b"));
        assert!(!is_well_known_name("org"));
        assert!(!is_well_known_name("org..example"));
        assert!(!is_well_known_name(".org.example"));
        assert!(!is_well_known_name("org.3example"));
        assert!(!is_well_known_name(":1.0"));
        assert!(!is_well_known_name(""));
    }

    #[test]
    fn length_limit_applies() {
        let long = format!("a.{}", "b".repeat(MAX_NAME_LEN));
        assert!(!is_well_known_name(&long));
    }
}
