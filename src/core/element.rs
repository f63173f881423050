//! Set elements and their ownership
//!
//! An [`Element`] starts out unowned. [`Set::add_element`](crate::core::set::Set::add_element)
//! links its record into the set exactly once; from then on the set serializes
//! it and keeps it alive, while the handle can still read and write it.

use crate::core::attr::sealed::RecordAccess;
use crate::core::attr::{AttrKind, AttrSpec, AttrTable, Attributes, NativeRecord};
use crate::core::error::Result;
use crate::core::netlink::Message;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub const NFTNL_SET_ELEM_FLAGS: u16 = 0;
pub const NFTNL_SET_ELEM_KEY: u16 = 1;
pub const NFTNL_SET_ELEM_VERDICT: u16 = 2;
pub const NFTNL_SET_ELEM_CHAIN: u16 = 3;
pub const NFTNL_SET_ELEM_DATA: u16 = 4;
pub const NFTNL_SET_ELEM_TIMEOUT: u16 = 5;
pub const NFTNL_SET_ELEM_EXPIRATION: u16 = 6;
pub const NFTNL_SET_ELEM_USERDATA: u16 = 7;
pub const NFTNL_SET_ELEM_OBJREF: u16 = 9;

// Kernel-side attribute numbers (enum nft_set_elem_attributes and friends)
pub const NFTA_SET_ELEM_KEY: u16 = 1;
pub const NFTA_SET_ELEM_DATA: u16 = 2;
pub const NFTA_SET_ELEM_FLAGS: u16 = 3;
pub const NFTA_SET_ELEM_TIMEOUT: u16 = 4;
pub const NFTA_SET_ELEM_EXPIRATION: u16 = 5;
pub const NFTA_SET_ELEM_USERDATA: u16 = 6;
pub const NFTA_SET_ELEM_OBJREF: u16 = 9;
pub const NFTA_DATA_VALUE: u16 = 1;
pub const NFTA_DATA_VERDICT: u16 = 2;
pub const NFTA_VERDICT_CODE: u16 = 1;
pub const NFTA_VERDICT_CHAIN: u16 = 2;

/// Size of a kernel data register (`NFT_DATA_VALUE_MAXLEN`)
pub const DATA_VALUE_MAXLEN: usize = 64;

/// Kernel limit on opaque user data (`NFT_USERDATA_MAXLEN`)
pub const USERDATA_MAXLEN: usize = 256;

/// Element attributes, in export order
pub static ELEMENT_ATTRIBUTES: AttrTable = AttrTable {
    object: "element",
    entries: &[
        AttrSpec::rw("flags", NFTNL_SET_ELEM_FLAGS, AttrKind::U32),
        AttrSpec::rw("key", NFTNL_SET_ELEM_KEY, AttrKind::Raw),
        AttrSpec::rw("verdict", NFTNL_SET_ELEM_VERDICT, AttrKind::U32),
        AttrSpec::rw("chain", NFTNL_SET_ELEM_CHAIN, AttrKind::String),
        AttrSpec::rw("data", NFTNL_SET_ELEM_DATA, AttrKind::Raw),
        AttrSpec::rw("timeout", NFTNL_SET_ELEM_TIMEOUT, AttrKind::U64),
        AttrSpec::rw("userdata", NFTNL_SET_ELEM_USERDATA, AttrKind::Raw),
        AttrSpec::rw("objref", NFTNL_SET_ELEM_OBJREF, AttrKind::String),
        AttrSpec::ro("expiration", NFTNL_SET_ELEM_EXPIRATION, AttrKind::U64),
    ],
};

/// Identity of a set, used to record element ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetId(pub(crate) u64);

impl SetId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who is responsible for an element record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ownership {
    /// Released together with the handle
    #[default]
    Unowned,
    /// Linked into a set, which keeps the record
    OwnedBy(SetId),
}

/// Native element record; `None` fields are unset and never reach the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementRecord {
    flags: Option<u32>,
    key: Option<Vec<u8>>,
    verdict: Option<u32>,
    chain: Option<String>,
    data: Option<Vec<u8>>,
    timeout: Option<u64>,
    expiration: Option<u64>,
    userdata: Option<Vec<u8>>,
    objref: Option<String>,
}

impl NativeRecord for ElementRecord {
    fn get_data(&self, code: u16) -> Option<&[u8]> {
        match code {
            NFTNL_SET_ELEM_KEY => self.key.as_deref(),
            NFTNL_SET_ELEM_DATA => self.data.as_deref(),
            NFTNL_SET_ELEM_USERDATA => self.userdata.as_deref(),
            _ => None,
        }
    }

    fn get_str(&self, code: u16) -> Option<&str> {
        match code {
            NFTNL_SET_ELEM_CHAIN => self.chain.as_deref(),
            NFTNL_SET_ELEM_OBJREF => self.objref.as_deref(),
            _ => None,
        }
    }

    fn get_u32(&self, code: u16) -> Option<u32> {
        match code {
            NFTNL_SET_ELEM_FLAGS => self.flags,
            NFTNL_SET_ELEM_VERDICT => self.verdict,
            _ => None,
        }
    }

    fn get_u64(&self, code: u16) -> Option<u64> {
        match code {
            NFTNL_SET_ELEM_TIMEOUT => self.timeout,
            NFTNL_SET_ELEM_EXPIRATION => self.expiration,
            _ => None,
        }
    }

    fn set_data(&mut self, code: u16, data: &[u8]) {
        let slot = match code {
            NFTNL_SET_ELEM_KEY => &mut self.key,
            NFTNL_SET_ELEM_DATA => &mut self.data,
            NFTNL_SET_ELEM_USERDATA => &mut self.userdata,
            _ => return,
        };
        *slot = Some(data.to_vec());
    }

    fn set_str(&mut self, code: u16, value: &str) {
        let slot = match code {
            NFTNL_SET_ELEM_CHAIN => &mut self.chain,
            NFTNL_SET_ELEM_OBJREF => &mut self.objref,
            _ => return,
        };
        *slot = Some(value.to_string());
    }

    fn set_u32(&mut self, code: u16, value: u32) {
        match code {
            NFTNL_SET_ELEM_FLAGS => self.flags = Some(value),
            NFTNL_SET_ELEM_VERDICT => self.verdict = Some(value),
            _ => {}
        }
    }

    fn set_u64(&mut self, code: u16, value: u64) {
        match code {
            NFTNL_SET_ELEM_TIMEOUT => self.timeout = Some(value),
            NFTNL_SET_ELEM_EXPIRATION => self.expiration = Some(value),
            _ => {}
        }
    }

    fn unset(&mut self, code: u16) {
        match code {
            NFTNL_SET_ELEM_FLAGS => self.flags = None,
            NFTNL_SET_ELEM_KEY => self.key = None,
            NFTNL_SET_ELEM_VERDICT => self.verdict = None,
            NFTNL_SET_ELEM_CHAIN => self.chain = None,
            NFTNL_SET_ELEM_DATA => self.data = None,
            NFTNL_SET_ELEM_TIMEOUT => self.timeout = None,
            NFTNL_SET_ELEM_EXPIRATION => self.expiration = None,
            NFTNL_SET_ELEM_USERDATA => self.userdata = None,
            NFTNL_SET_ELEM_OBJREF => self.objref = None,
            _ => {}
        }
    }

    fn max_len(&self, code: u16) -> Option<usize> {
        match code {
            NFTNL_SET_ELEM_KEY | NFTNL_SET_ELEM_DATA => Some(DATA_VALUE_MAXLEN),
            NFTNL_SET_ELEM_USERDATA => Some(USERDATA_MAXLEN),
            _ => None,
        }
    }
}

impl ElementRecord {
    /// Serializes the element's attributes in kernel order.
    ///
    /// A verdict goes into a nested `NFTA_SET_ELEM_DATA/NFTA_DATA_VERDICT`
    /// with its chain when one is set; a chain without a verdict is not sent.
    pub fn build_payload(&self, msg: &mut Message) -> Result<()> {
        if let Some(flags) = self.flags {
            msg.put_u32(NFTA_SET_ELEM_FLAGS, flags)?;
        }
        if let Some(timeout) = self.timeout {
            msg.put_u64(NFTA_SET_ELEM_TIMEOUT, timeout)?;
        }
        if let Some(expiration) = self.expiration {
            msg.put_u64(NFTA_SET_ELEM_EXPIRATION, expiration)?;
        }
        if let Some(key) = &self.key {
            let nest = msg.nest_start(NFTA_SET_ELEM_KEY)?;
            msg.put_attr(NFTA_DATA_VALUE, key)?;
            msg.nest_end(nest)?;
        }
        if let Some(verdict) = self.verdict {
            let data = msg.nest_start(NFTA_SET_ELEM_DATA)?;
            let nest = msg.nest_start(NFTA_DATA_VERDICT)?;
            msg.put_u32(NFTA_VERDICT_CODE, verdict)?;
            if let Some(chain) = &self.chain {
                msg.put_strz(NFTA_VERDICT_CHAIN, chain)?;
            }
            msg.nest_end(nest)?;
            msg.nest_end(data)?;
        }
        if let Some(value) = &self.data {
            let nest = msg.nest_start(NFTA_SET_ELEM_DATA)?;
            msg.put_attr(NFTA_DATA_VALUE, value)?;
            msg.nest_end(nest)?;
        }
        if let Some(userdata) = &self.userdata {
            msg.put_attr(NFTA_SET_ELEM_USERDATA, userdata)?;
        }
        if let Some(objref) = &self.objref {
            msg.put_strz(NFTA_SET_ELEM_OBJREF, objref)?;
        }
        Ok(())
    }
}

/// Handle to one set element
#[derive(Debug, Default)]
pub struct Element {
    record: Rc<RefCell<ElementRecord>>,
    ownership: Ownership,
}

impl Element {
    /// Allocates an empty, unowned element.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.ownership, Ownership::OwnedBy(_))
    }

    /// Hands the record to `owner`. Ownership checks happen in the set.
    pub(crate) fn adopt(&mut self, owner: SetId) -> Rc<RefCell<ElementRecord>> {
        self.ownership = Ownership::OwnedBy(owner);
        Rc::clone(&self.record)
    }
}

impl RecordAccess for Element {
    type Record = ElementRecord;

    fn with_record<T>(&self, f: impl FnOnce(&ElementRecord) -> T) -> T {
        f(&*self.record.borrow())
    }

    fn with_record_mut<T>(&mut self, f: impl FnOnce(&mut ElementRecord) -> T) -> T {
        f(&mut *self.record.borrow_mut())
    }
}

impl Attributes for Element {
    fn table() -> &'static AttrTable {
        &ELEMENT_ATTRIBUTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::attr::AttrValue;
    use crate::core::error::{Access, Error};
    use crate::core::netlink::{NLMSG_HDRLEN, attributes};
    use std::net::Ipv4Addr;

    fn payload_of(element: &Element) -> Vec<u8> {
        let mut msg = Message::new(0, 0, 0);
        element
            .with_record(|record| record.build_payload(&mut msg))
            .unwrap();
        msg.finish().unwrap()[NLMSG_HDRLEN..].to_vec()
    }

    #[test]
    fn test_new_element_is_unowned_and_empty() {
        let element = Element::new();
        assert_eq!(element.ownership(), Ownership::Unowned);
        assert!(element.attributes().is_empty());
        assert!(payload_of(&element).is_empty());
    }

    #[test]
    fn test_expiration_is_read_only() {
        let mut element = Element::new();
        element.with_record_mut(|r| r.set_u64(NFTNL_SET_ELEM_EXPIRATION, 30_000));

        let err = element.set_attribute("expiration", 1u64).unwrap_err();
        assert!(matches!(
            err,
            Error::PermissionDenied {
                access: Access::Write,
                ..
            }
        ));
        assert_eq!(
            element.get_attribute("expiration").unwrap(),
            Some(AttrValue::U64(30_000))
        );
    }

    #[test]
    fn test_key_limited_to_data_register() {
        let mut element = Element::new();
        assert!(matches!(
            element.set_attribute("key", vec![0u8; DATA_VALUE_MAXLEN + 1]),
            Err(Error::ValueTooLong { .. })
        ));
        element
            .set_attribute("key", vec![0u8; DATA_VALUE_MAXLEN])
            .unwrap();
    }

    #[test]
    fn test_key_payload_is_nested_data_value() {
        let mut element = Element::new();
        element
            .set_attribute("key", Ipv4Addr::new(10, 0, 0, 1))
            .unwrap();

        let payload = payload_of(&element);
        let (ty, nested, inner) = attributes(&payload).next().unwrap();
        assert_eq!((ty, nested), (NFTA_SET_ELEM_KEY, true));
        let (ty, nested, key) = attributes(inner).next().unwrap();
        assert_eq!((ty, nested), (NFTA_DATA_VALUE, false));
        assert_eq!(key, &[10, 0, 0, 1]);
    }

    #[test]
    fn test_verdict_with_chain_payload() {
        let mut element = Element::new();
        element.set_attribute("key", [80u8, 0]).unwrap();
        // NFT_JUMP (-3)
        element.set_attribute("verdict", 0xffff_fffd_u32).unwrap();
        element.set_attribute("chain", "web").unwrap();

        let payload = payload_of(&element);
        let top: Vec<_> = attributes(&payload).map(|(ty, _, _)| ty).collect();
        assert_eq!(top, vec![NFTA_SET_ELEM_KEY, NFTA_SET_ELEM_DATA]);

        let (_, _, data) = attributes(&payload).nth(1).unwrap();
        let (ty, nested, verdict) = attributes(data).next().unwrap();
        assert_eq!((ty, nested), (NFTA_DATA_VERDICT, true));
        let inner: Vec<_> = attributes(verdict).collect();
        assert_eq!(inner[0], (NFTA_VERDICT_CODE, false, &(-3i32).to_be_bytes()[..]));
        assert_eq!(inner[1], (NFTA_VERDICT_CHAIN, false, &b"web\0"[..]));
    }

    #[test]
    fn test_chain_without_verdict_is_not_sent() {
        let mut element = Element::new();
        element.set_attribute("chain", "orphan").unwrap();
        assert!(payload_of(&element).is_empty());
    }

    #[test]
    fn test_scalar_payload_order() {
        let mut element = Element::new();
        element.set_attribute("objref", "counter0").unwrap();
        element.set_attribute("timeout", 60_000u64).unwrap();
        element.set_attribute("flags", 1u32).unwrap();
        element.set_attribute("userdata", vec![0xaa]).unwrap();

        let payload = payload_of(&element);
        let types: Vec<_> = attributes(&payload).map(|(ty, _, _)| ty).collect();
        assert_eq!(
            types,
            vec![
                NFTA_SET_ELEM_FLAGS,
                NFTA_SET_ELEM_TIMEOUT,
                NFTA_SET_ELEM_USERDATA,
                NFTA_SET_ELEM_OBJREF
            ]
        );
        let (_, _, timeout) = attributes(&payload).nth(1).unwrap();
        assert_eq!(timeout, &60_000u64.to_be_bytes());
    }

    #[test]
    fn test_oversized_chain_is_refused() {
        let mut element = Element::new();
        element.set_attribute("verdict", 0xffff_fffd_u32).unwrap();
        element.set_attribute("chain", "c".repeat(70_000)).unwrap();

        let mut msg = Message::new(0, 0, 0);
        let err = element
            .with_record(|record| record.build_payload(&mut msg))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::AttributeTooLong {
                attr_type: NFTA_VERDICT_CHAIN,
                ..
            }
        ));
    }
}
