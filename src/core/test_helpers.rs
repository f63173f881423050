//! Shared test utilities for core module tests
//!
//! This module is only compiled in test mode.

use crate::config::BatchConfig;
use crate::core::attr::Attributes;
use crate::core::batch::Batch;
use crate::core::element::Element;
use crate::core::netlink::{Header, messages};
use crate::core::set::Set;
use std::net::Ipv4Addr;

/// NFT_SET_TIMEOUT
pub const SET_FLAG_TIMEOUT: u32 = 0x10;

/// Creates the canonical IPv4 blocklist set: `filter`/`blocklist`, 4-byte keys,
/// timeout support.
pub fn blocklist_set() -> Set {
    let mut set = Set::new();
    set.set_attribute("table", "filter").unwrap();
    set.set_attribute("name", "blocklist").unwrap();
    set.set_attribute("key_len", 4u32).unwrap();
    set.set_attribute("flags", SET_FLAG_TIMEOUT).unwrap();
    set
}

/// Creates an element keyed by `addr`.
pub fn ipv4_element(addr: Ipv4Addr) -> Element {
    let mut element = Element::new();
    element.set_attribute("key", addr).unwrap();
    element
}

/// Blocklist set holding one element per address.
pub fn populated_blocklist(addrs: &[Ipv4Addr]) -> Set {
    let mut set = blocklist_set();
    for addr in addrs {
        let mut element = ipv4_element(*addr);
        set.add_element(&mut element).unwrap();
    }
    set
}

/// Batch whose first sequence number is `seed`.
pub fn seeded_batch(seed: u32) -> Batch {
    Batch::with_config(BatchConfig {
        seq_seed: Some(seed),
        ..BatchConfig::default()
    })
}

/// Headers of every message currently in the batch.
pub fn dump_headers(batch: &Batch) -> Vec<Header> {
    let dump = batch.dump();
    messages(&dump).map(|(header, _)| header).collect()
}
