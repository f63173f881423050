//! nftables sets
//!
//! A [`Set`] wraps the native set record plus the element records linked into
//! it. It knows how to serialize itself as the payload of a `NEWSET`/`DELSET`
//! message and its members as the payload of `NEWSETELEM`/`DELSETELEM`.

use crate::core::attr::sealed::RecordAccess;
use crate::core::attr::{AttrKind, AttrSpec, AttrTable, Attributes, NativeRecord};
use crate::core::element::{Element, ElementRecord, Ownership, SetId, USERDATA_MAXLEN};
use crate::core::error::{Error, Result};
use crate::core::netlink::{Message, NLA_MAX_TYPE};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const NFTNL_SET_TABLE: u16 = 0;
pub const NFTNL_SET_NAME: u16 = 1;
pub const NFTNL_SET_FLAGS: u16 = 2;
pub const NFTNL_SET_KEY_TYPE: u16 = 3;
pub const NFTNL_SET_KEY_LEN: u16 = 4;
pub const NFTNL_SET_DATA_TYPE: u16 = 5;
pub const NFTNL_SET_DATA_LEN: u16 = 6;
pub const NFTNL_SET_FAMILY: u16 = 7;
pub const NFTNL_SET_ID: u16 = 8;
pub const NFTNL_SET_POLICY: u16 = 9;
pub const NFTNL_SET_DESC_SIZE: u16 = 10;
pub const NFTNL_SET_TIMEOUT: u16 = 11;
pub const NFTNL_SET_GC_INTERVAL: u16 = 12;
pub const NFTNL_SET_USERDATA: u16 = 13;
pub const NFTNL_SET_OBJ_TYPE: u16 = 14;
pub const NFTNL_SET_HANDLE: u16 = 15;

// enum nft_set_attributes
pub const NFTA_SET_TABLE: u16 = 1;
pub const NFTA_SET_NAME: u16 = 2;
pub const NFTA_SET_FLAGS: u16 = 3;
pub const NFTA_SET_KEY_TYPE: u16 = 4;
pub const NFTA_SET_KEY_LEN: u16 = 5;
pub const NFTA_SET_DATA_TYPE: u16 = 6;
pub const NFTA_SET_DATA_LEN: u16 = 7;
pub const NFTA_SET_POLICY: u16 = 8;
pub const NFTA_SET_DESC: u16 = 9;
pub const NFTA_SET_ID: u16 = 10;
pub const NFTA_SET_TIMEOUT: u16 = 11;
pub const NFTA_SET_GC_INTERVAL: u16 = 12;
pub const NFTA_SET_USERDATA: u16 = 13;
pub const NFTA_SET_OBJ_TYPE: u16 = 15;
pub const NFTA_SET_HANDLE: u16 = 16;
pub const NFTA_SET_DESC_SIZE: u16 = 1;

// enum nft_set_elem_list_attributes
pub const NFTA_SET_ELEM_LIST_TABLE: u16 = 1;
pub const NFTA_SET_ELEM_LIST_SET: u16 = 2;
pub const NFTA_SET_ELEM_LIST_ELEMENTS: u16 = 3;
pub const NFTA_SET_ELEM_LIST_SET_ID: u16 = 4;

/// Set attributes, in export order
pub static SET_ATTRIBUTES: AttrTable = AttrTable {
    object: "set",
    entries: &[
        AttrSpec::rw("table", NFTNL_SET_TABLE, AttrKind::String),
        AttrSpec::rw("name", NFTNL_SET_NAME, AttrKind::String),
        AttrSpec::rw("flags", NFTNL_SET_FLAGS, AttrKind::U32),
        AttrSpec::rw("key_type", NFTNL_SET_KEY_TYPE, AttrKind::U32),
        AttrSpec::rw("key_len", NFTNL_SET_KEY_LEN, AttrKind::U32),
        AttrSpec::rw("data_type", NFTNL_SET_DATA_TYPE, AttrKind::U32),
        AttrSpec::rw("data_len", NFTNL_SET_DATA_LEN, AttrKind::U32),
        AttrSpec::rw("family", NFTNL_SET_FAMILY, AttrKind::U32),
        AttrSpec::rw("id", NFTNL_SET_ID, AttrKind::U32),
        AttrSpec::rw("policy", NFTNL_SET_POLICY, AttrKind::U32),
        AttrSpec::rw("desc_size", NFTNL_SET_DESC_SIZE, AttrKind::U32),
        AttrSpec::rw("timeout", NFTNL_SET_TIMEOUT, AttrKind::U64),
        AttrSpec::rw("gc_interval", NFTNL_SET_GC_INTERVAL, AttrKind::U32),
        AttrSpec::rw("userdata", NFTNL_SET_USERDATA, AttrKind::Raw),
        AttrSpec::rw("obj_type", NFTNL_SET_OBJ_TYPE, AttrKind::U32),
        AttrSpec::rw("handle", NFTNL_SET_HANDLE, AttrKind::U64),
    ],
};

static NEXT_SET_ID: AtomicU64 = AtomicU64::new(1);

/// Native set record; `None` fields are unset and never reach the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetRecord {
    table: Option<String>,
    name: Option<String>,
    flags: Option<u32>,
    key_type: Option<u32>,
    key_len: Option<u32>,
    data_type: Option<u32>,
    data_len: Option<u32>,
    family: Option<u32>,
    id: Option<u32>,
    policy: Option<u32>,
    desc_size: Option<u32>,
    timeout: Option<u64>,
    gc_interval: Option<u32>,
    userdata: Option<Vec<u8>>,
    obj_type: Option<u32>,
    handle: Option<u64>,
}

impl SetRecord {
    fn u32_slot(&mut self, code: u16) -> Option<&mut Option<u32>> {
        Some(match code {
            NFTNL_SET_FLAGS => &mut self.flags,
            NFTNL_SET_KEY_TYPE => &mut self.key_type,
            NFTNL_SET_KEY_LEN => &mut self.key_len,
            NFTNL_SET_DATA_TYPE => &mut self.data_type,
            NFTNL_SET_DATA_LEN => &mut self.data_len,
            NFTNL_SET_FAMILY => &mut self.family,
            NFTNL_SET_ID => &mut self.id,
            NFTNL_SET_POLICY => &mut self.policy,
            NFTNL_SET_DESC_SIZE => &mut self.desc_size,
            NFTNL_SET_GC_INTERVAL => &mut self.gc_interval,
            NFTNL_SET_OBJ_TYPE => &mut self.obj_type,
            _ => return None,
        })
    }

    /// Serializes the set definition (`NEWSET`/`DELSET` payload).
    ///
    /// The family travels in the nfgenmsg header, not as an attribute.
    pub fn build_payload(&self, msg: &mut Message) -> Result<()> {
        if let Some(table) = &self.table {
            msg.put_strz(NFTA_SET_TABLE, table)?;
        }
        if let Some(name) = &self.name {
            msg.put_strz(NFTA_SET_NAME, name)?;
        }
        if let Some(handle) = self.handle {
            msg.put_u64(NFTA_SET_HANDLE, handle)?;
        }
        let scalars = [
            (NFTA_SET_FLAGS, self.flags),
            (NFTA_SET_KEY_TYPE, self.key_type),
            (NFTA_SET_KEY_LEN, self.key_len),
            (NFTA_SET_DATA_TYPE, self.data_type),
            (NFTA_SET_DATA_LEN, self.data_len),
            (NFTA_SET_OBJ_TYPE, self.obj_type),
            (NFTA_SET_ID, self.id),
            (NFTA_SET_POLICY, self.policy),
        ];
        for (attr, value) in scalars {
            if let Some(value) = value {
                msg.put_u32(attr, value)?;
            }
        }
        if let Some(size) = self.desc_size {
            let nest = msg.nest_start(NFTA_SET_DESC)?;
            msg.put_u32(NFTA_SET_DESC_SIZE, size)?;
            msg.nest_end(nest)?;
        }
        if let Some(timeout) = self.timeout {
            msg.put_u64(NFTA_SET_TIMEOUT, timeout)?;
        }
        if let Some(interval) = self.gc_interval {
            msg.put_u32(NFTA_SET_GC_INTERVAL, interval)?;
        }
        if let Some(userdata) = &self.userdata {
            msg.put_attr(NFTA_SET_USERDATA, userdata)?;
        }
        Ok(())
    }

    /// Serializes the set identification that heads an element list:
    /// name, id, then table.
    fn build_element_list_header(&self, msg: &mut Message) -> Result<()> {
        if let Some(name) = &self.name {
            msg.put_strz(NFTA_SET_ELEM_LIST_SET, name)?;
        }
        if let Some(id) = self.id {
            msg.put_u32(NFTA_SET_ELEM_LIST_SET_ID, id)?;
        }
        if let Some(table) = &self.table {
            msg.put_strz(NFTA_SET_ELEM_LIST_TABLE, table)?;
        }
        Ok(())
    }
}

impl NativeRecord for SetRecord {
    fn get_data(&self, code: u16) -> Option<&[u8]> {
        match code {
            NFTNL_SET_USERDATA => self.userdata.as_deref(),
            _ => None,
        }
    }

    fn get_str(&self, code: u16) -> Option<&str> {
        match code {
            NFTNL_SET_TABLE => self.table.as_deref(),
            NFTNL_SET_NAME => self.name.as_deref(),
            _ => None,
        }
    }

    fn get_u32(&self, code: u16) -> Option<u32> {
        match code {
            NFTNL_SET_FLAGS => self.flags,
            NFTNL_SET_KEY_TYPE => self.key_type,
            NFTNL_SET_KEY_LEN => self.key_len,
            NFTNL_SET_DATA_TYPE => self.data_type,
            NFTNL_SET_DATA_LEN => self.data_len,
            NFTNL_SET_FAMILY => self.family,
            NFTNL_SET_ID => self.id,
            NFTNL_SET_POLICY => self.policy,
            NFTNL_SET_DESC_SIZE => self.desc_size,
            NFTNL_SET_GC_INTERVAL => self.gc_interval,
            NFTNL_SET_OBJ_TYPE => self.obj_type,
            _ => None,
        }
    }

    fn get_u64(&self, code: u16) -> Option<u64> {
        match code {
            NFTNL_SET_TIMEOUT => self.timeout,
            NFTNL_SET_HANDLE => self.handle,
            _ => None,
        }
    }

    fn set_data(&mut self, code: u16, data: &[u8]) {
        if code == NFTNL_SET_USERDATA {
            self.userdata = Some(data.to_vec());
        }
    }

    fn set_str(&mut self, code: u16, value: &str) {
        match code {
            NFTNL_SET_TABLE => self.table = Some(value.to_string()),
            NFTNL_SET_NAME => self.name = Some(value.to_string()),
            _ => {}
        }
    }

    fn set_u32(&mut self, code: u16, value: u32) {
        if let Some(slot) = self.u32_slot(code) {
            *slot = Some(value);
        }
    }

    fn set_u64(&mut self, code: u16, value: u64) {
        match code {
            NFTNL_SET_TIMEOUT => self.timeout = Some(value),
            NFTNL_SET_HANDLE => self.handle = Some(value),
            _ => {}
        }
    }

    fn unset(&mut self, code: u16) {
        match code {
            NFTNL_SET_TABLE => self.table = None,
            NFTNL_SET_NAME => self.name = None,
            NFTNL_SET_TIMEOUT => self.timeout = None,
            NFTNL_SET_HANDLE => self.handle = None,
            NFTNL_SET_USERDATA => self.userdata = None,
            _ => {
                if let Some(slot) = self.u32_slot(code) {
                    *slot = None;
                }
            }
        }
    }

    fn max_len(&self, code: u16) -> Option<usize> {
        (code == NFTNL_SET_USERDATA).then_some(USERDATA_MAXLEN)
    }
}

/// Handle to one nftables set and the elements linked into it
#[derive(Debug)]
pub struct Set {
    id: SetId,
    record: SetRecord,
    elements: Vec<Rc<RefCell<ElementRecord>>>,
}

impl Default for Set {
    fn default() -> Self {
        Self::new()
    }
}

impl Set {
    /// Allocates an empty set with a process-unique identity.
    pub fn new() -> Self {
        Self {
            id: SetId(NEXT_SET_ID.fetch_add(1, Ordering::Relaxed)),
            record: SetRecord::default(),
            elements: Vec::new(),
        }
    }

    pub fn id(&self) -> SetId {
        self.id
    }

    /// Links `element` into this set and marks it owned.
    ///
    /// Only the in-memory set changes; nothing is queued for the kernel.
    ///
    /// # Errors
    ///
    /// `AlreadyOwned` if the element was added to any set before, this one
    /// included. The element is left untouched.
    pub fn add_element(&mut self, element: &mut Element) -> Result<()> {
        if let Ownership::OwnedBy(owner) = element.ownership() {
            tracing::warn!(set = %self.id, %owner, "element already owned");
            return Err(Error::AlreadyOwned { owner: owner.get() });
        }
        self.elements.push(element.adopt(self.id));
        tracing::trace!(set = %self.id, count = self.elements.len(), "element added");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Snapshots of the member records, in insertion order.
    pub fn elements(&self) -> impl Iterator<Item = ElementRecord> + '_ {
        self.elements.iter().map(|record| record.borrow().clone())
    }

    /// `NEWSET`/`DELSET` payload.
    pub fn build_payload(&self, msg: &mut Message) -> Result<()> {
        self.record.build_payload(msg)
    }

    /// `NEWSETELEM`/`DELSETELEM` payload: set identification followed by one
    /// nested entry per element, numbered from 1.
    ///
    /// # Errors
    ///
    /// `AttributeTooLong` once the element list outgrows a 16-bit `nla_len`,
    /// `AttributeTypeOutOfRange` if an entry number no longer fits.
    pub fn build_elements_payload(&self, msg: &mut Message) -> Result<()> {
        self.record.build_element_list_header(msg)?;
        let list = msg.nest_start(NFTA_SET_ELEM_LIST_ELEMENTS)?;
        for (index, element) in self.elements.iter().enumerate() {
            let number = u16::try_from(index + 1).map_err(|_| Error::AttributeTypeOutOfRange {
                attr_type: index + 1,
                max: NLA_MAX_TYPE,
            })?;
            let entry = msg.nest_start(number)?;
            element.borrow().build_payload(msg)?;
            msg.nest_end(entry)?;
        }
        msg.nest_end(list)
    }
}

impl RecordAccess for Set {
    type Record = SetRecord;

    fn with_record<T>(&self, f: impl FnOnce(&SetRecord) -> T) -> T {
        f(&self.record)
    }

    fn with_record_mut<T>(&mut self, f: impl FnOnce(&mut SetRecord) -> T) -> T {
        f(&mut self.record)
    }
}

impl Attributes for Set {
    fn table() -> &'static AttrTable {
        &SET_ATTRIBUTES
    }
}
