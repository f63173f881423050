use crate::core::attr::AttrKind;
use thiserror::Error;

/// Core error types for nftset
#[derive(Debug, Error)]
pub enum Error {
    /// The batch buffer could not be allocated
    #[error("Allocation failed: {0}")]
    AllocationFailure(String),

    /// Attribute name is not part of the object's table
    #[error("Unknown {object} attribute: {name}")]
    UnknownAttribute { object: &'static str, name: String },

    /// Attribute exists but the requested access is not allowed
    #[error("Cannot perform {access} on attribute {name}")]
    PermissionDenied { name: String, access: Access },

    /// Supplied value does not have the attribute's declared kind
    #[error("Attribute {name} must be {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: AttrKind,
        actual: AttrKind,
    },

    /// Raw value exceeds the kernel's data register size
    #[error("Attribute {name} is {len} bytes, max {max}")]
    ValueTooLong { name: String, len: usize, max: usize },

    /// Element is already linked into a set
    #[error("Element already belongs to set #{owner}")]
    AlreadyOwned { owner: u64 },

    /// Batch operation invoked outside its valid state
    #[error("Batch state error: {0}")]
    BatchState(#[from] BatchStateError),

    /// Message does not fit into the remaining batch capacity
    #[error("Batch buffer full: message of {needed} bytes, {remaining} of {capacity} left")]
    BufferFull {
        needed: usize,
        remaining: usize,
        capacity: usize,
    },

    /// Attribute or nest longer than its 16-bit netlink length field
    #[error("Attribute {attr_type} is {len} bytes, netlink allows {max}")]
    AttributeTooLong {
        attr_type: u16,
        len: usize,
        max: usize,
    },

    /// Attribute type overlaps the netlink nested/byte-order flag bits
    #[error("Attribute type {attr_type} exceeds {max}")]
    AttributeTypeOutOfRange { attr_type: usize, max: u16 },

    /// Message longer than its 32-bit netlink length field
    #[error("Netlink message of {len} bytes is too long")]
    MessageTooLong { len: usize },

    /// I/O operation failed (plan files, dump output)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Plan file content is structurally valid JSON but not a usable plan
    #[error("Invalid plan: {0}")]
    Plan(String),
}

/// Batch lifecycle violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BatchStateError {
    #[error("begin has already been called")]
    AlreadyStarted,

    #[error("begin must be called prior")]
    NotOpen,
}

/// Direction of an attribute access, for permission errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Access {
    #[strum(serialize = "read")]
    Read,
    #[strum(serialize = "write")]
    Write,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors caused by how the caller used the API, as opposed to
    /// resource exhaustion or netlink size limits.
    pub fn is_caller_error(&self) -> bool {
        !matches!(
            self,
            Error::AllocationFailure(_)
                | Error::BufferFull { .. }
                | Error::AttributeTooLong { .. }
                | Error::AttributeTypeOutOfRange { .. }
                | Error::MessageTooLong { .. }
                | Error::Io(_)
        )
    }
}
