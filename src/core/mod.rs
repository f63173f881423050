//! Core nf_tables set and batch logic
//!
//! - [`attr`]: Attribute tables and the name-based get/set/unset protocol
//! - [`element`]: Set elements and their wire payload
//! - [`set`]: Sets, element ownership and the set/element-list payloads
//! - [`batch`]: Batch state machine framing operations into one buffer
//! - [`netlink`]: nlmsghdr/nfgenmsg/attribute encoding and a small reader
//! - [`error`]: Error types

pub mod attr;
pub mod batch;
pub mod element;
pub mod error;
pub mod netlink;
pub mod set;

#[cfg(test)]
pub mod test_helpers;
