//! nftset - nf_tables set batches
//!
//! Models nftables sets and set elements as attribute bags and frames their
//! create, replace and delete operations into nfnetlink batch buffers ready
//! for a netlink socket.
//!
//! # Architecture
//!
//! - [`core`] - Attribute protocol, sets, elements, batch builder and netlink encoding
//! - [`config`] - Batch configuration and JSON batch plans

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod config;
pub mod core;

// Re-export commonly used types
pub use core::attr::{AttrValue, Attributes};
pub use core::batch::{Batch, BatchState};
pub use core::element::{ELEMENT_ATTRIBUTES, Element};
pub use core::error::{Error, Result};
pub use core::netlink::Family;
pub use core::set::{SET_ATTRIBUTES, Set};
