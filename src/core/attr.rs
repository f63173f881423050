//! Typed attribute tables and the generic accessor built on them
//!
//! Sets and elements expose their fields the same way: a static [`AttrTable`]
//! maps attribute names to a wire code, a value kind and a permission, and the
//! [`Attributes`] trait turns a name plus an [`AttrValue`] into a call on one of
//! the four typed accessors of a [`NativeRecord`].
//!
//! # Example
//!
//! ```
//! use nftset::core::attr::{AttrValue, Attributes};
//! use nftset::core::set::Set;
//!
//! let mut set = Set::new();
//! set.set_attribute("name", "blocklist").unwrap();
//! set.set_attribute("key_len", 4u32).unwrap();
//!
//! assert_eq!(
//!     set.get_attribute("name").unwrap(),
//!     Some(AttrValue::String("blocklist".into()))
//! );
//! assert!(set.get_attribute("colour").is_err());
//! ```

use crate::core::error::{Access, Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Encoding of an attribute value in the native record
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum AttrKind {
    /// Length-prefixed byte string
    #[strum(serialize = "bytes")]
    #[serde(rename = "bytes")]
    Raw,
    /// NUL-terminated string
    #[strum(serialize = "string")]
    String,
    #[strum(serialize = "u32")]
    U32,
    #[strum(serialize = "u64")]
    U64,
}

/// Which accesses an attribute allows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    #[strum(serialize = "r")]
    ReadOnly,
    #[strum(serialize = "w")]
    WriteOnly,
    #[strum(serialize = "rw")]
    ReadWrite,
}

impl Permission {
    pub const fn can_read(self) -> bool {
        matches!(self, Permission::ReadOnly | Permission::ReadWrite)
    }

    pub const fn can_write(self) -> bool {
        matches!(self, Permission::WriteOnly | Permission::ReadWrite)
    }

    const fn allows(self, access: Access) -> bool {
        match access {
            Access::Read => self.can_read(),
            Access::Write => self.can_write(),
        }
    }
}

/// One row of an attribute table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttrSpec {
    pub name: &'static str,
    pub code: u16,
    pub kind: AttrKind,
    pub permission: Permission,
}

impl AttrSpec {
    pub const fn rw(name: &'static str, code: u16, kind: AttrKind) -> Self {
        Self {
            name,
            code,
            kind,
            permission: Permission::ReadWrite,
        }
    }

    pub const fn ro(name: &'static str, code: u16, kind: AttrKind) -> Self {
        Self {
            name,
            code,
            kind,
            permission: Permission::ReadOnly,
        }
    }
}

/// Ordered attribute table of one object kind
///
/// Order is significant only for enumeration; lookups go by name.
#[derive(Debug, Serialize)]
pub struct AttrTable {
    pub object: &'static str,
    pub entries: &'static [AttrSpec],
}

impl AttrTable {
    pub fn lookup(&self, name: &str) -> Option<&'static AttrSpec> {
        self.entries.iter().find(|spec| spec.name == name)
    }

    pub fn by_code(&self, code: u16) -> Option<&'static AttrSpec> {
        self.entries.iter().find(|spec| spec.code == code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static AttrSpec> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> {
        self.entries.iter().map(|spec| spec.name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves `name` and checks that `access` is permitted on it.
    ///
    /// # Errors
    ///
    /// `UnknownAttribute` if absent, `PermissionDenied` if the access is excluded.
    pub fn resolve(&self, name: &str, access: Access) -> Result<&'static AttrSpec> {
        let spec = self.lookup(name).ok_or_else(|| Error::UnknownAttribute {
            object: self.object,
            name: name.to_string(),
        })?;
        if !spec.permission.allows(access) {
            tracing::warn!(object = self.object, name, %access, "attribute access refused");
            return Err(Error::PermissionDenied {
                name: name.to_string(),
                access,
            });
        }
        Ok(spec)
    }
}

/// Value of a single attribute, tagged with its kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    #[serde(rename = "bytes")]
    Raw(Vec<u8>),
    String(String),
    U32(u32),
    U64(u64),
}

impl AttrValue {
    pub const fn kind(&self) -> AttrKind {
        match self {
            AttrValue::Raw(_) => AttrKind::Raw,
            AttrValue::String(_) => AttrKind::String,
            AttrValue::U32(_) => AttrKind::U32,
            AttrValue::U64(_) => AttrKind::U64,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            AttrValue::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            AttrValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_u64(&self) -> Option<u64> {
        match self {
            AttrValue::U64(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<Vec<u8>> for AttrValue {
    fn from(bytes: Vec<u8>) -> Self {
        AttrValue::Raw(bytes)
    }
}

impl From<&[u8]> for AttrValue {
    fn from(bytes: &[u8]) -> Self {
        AttrValue::Raw(bytes.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for AttrValue {
    fn from(bytes: [u8; N]) -> Self {
        AttrValue::Raw(bytes.to_vec())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::String(s)
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::String(s.to_string())
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        AttrValue::U32(v)
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::U64(v)
    }
}

/// Addresses are keyed in network byte order, as the kernel compares them.
impl From<Ipv4Addr> for AttrValue {
    fn from(addr: Ipv4Addr) -> Self {
        AttrValue::Raw(addr.octets().to_vec())
    }
}

impl From<Ipv6Addr> for AttrValue {
    fn from(addr: Ipv6Addr) -> Self {
        AttrValue::Raw(addr.octets().to_vec())
    }
}

impl From<IpAddr> for AttrValue {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => v4.into(),
            IpAddr::V6(v6) => v6.into(),
        }
    }
}

/// Typed storage behind a set or element handle.
///
/// Getters return `None` for attributes that were never set (or were unset);
/// setters mark the attribute present. Codes outside the record's table are
/// ignored by both.
pub trait NativeRecord {
    fn get_data(&self, code: u16) -> Option<&[u8]>;
    fn get_str(&self, code: u16) -> Option<&str>;
    fn get_u32(&self, code: u16) -> Option<u32>;
    fn get_u64(&self, code: u16) -> Option<u64>;

    fn set_data(&mut self, code: u16, data: &[u8]);
    fn set_str(&mut self, code: u16, value: &str);
    fn set_u32(&mut self, code: u16, value: u32);
    fn set_u64(&mut self, code: u16, value: u64);

    fn unset(&mut self, code: u16);

    /// Upper bound on raw attribute length, if the kernel imposes one.
    fn max_len(&self, _code: u16) -> Option<usize> {
        None
    }
}

/// Reads `spec` from `record` through the getter matching its kind.
pub fn read_value<R: NativeRecord + ?Sized>(record: &R, spec: &AttrSpec) -> Option<AttrValue> {
    match spec.kind {
        AttrKind::Raw => record.get_data(spec.code).map(|d| AttrValue::Raw(d.to_vec())),
        AttrKind::String => record
            .get_str(spec.code)
            .map(|s| AttrValue::String(s.to_string())),
        AttrKind::U32 => record.get_u32(spec.code).map(AttrValue::U32),
        AttrKind::U64 => record.get_u64(spec.code).map(AttrValue::U64),
    }
}

/// Checks `value` against `spec` without touching the record.
///
/// # Errors
///
/// `TypeMismatch` on a kind mismatch or a string carrying an interior NUL,
/// `ValueTooLong` when a raw value exceeds the record's limit.
pub fn check_value<R: NativeRecord + ?Sized>(
    record: &R,
    spec: &AttrSpec,
    value: &AttrValue,
) -> Result<()> {
    if value.kind() != spec.kind {
        return Err(Error::TypeMismatch {
            name: spec.name.to_string(),
            expected: spec.kind,
            actual: value.kind(),
        });
    }
    match value {
        // Cannot be NUL-terminated faithfully.
        AttrValue::String(s) if s.contains('\0') => Err(Error::TypeMismatch {
            name: spec.name.to_string(),
            expected: AttrKind::String,
            actual: AttrKind::Raw,
        }),
        AttrValue::Raw(bytes) => match record.max_len(spec.code) {
            Some(max) if bytes.len() > max => Err(Error::ValueTooLong {
                name: spec.name.to_string(),
                len: bytes.len(),
                max,
            }),
            _ => Ok(()),
        },
        _ => Ok(()),
    }
}

/// Writes an already checked `value` through the setter matching its kind.
fn write_value<R: NativeRecord + ?Sized>(record: &mut R, spec: &AttrSpec, value: &AttrValue) {
    match value {
        AttrValue::Raw(bytes) => record.set_data(spec.code, bytes),
        AttrValue::String(s) => record.set_str(spec.code, s),
        AttrValue::U32(v) => record.set_u32(spec.code, *v),
        AttrValue::U64(v) => record.set_u64(spec.code, *v),
    }
}

pub(crate) mod sealed {
    use super::NativeRecord;

    /// Raw record access. Crate-private so permission checks cannot be
    /// bypassed from outside, e.g. to write a read-only attribute.
    #[doc(hidden)]
    pub trait RecordAccess {
        type Record: NativeRecord;

        fn with_record<T>(&self, f: impl FnOnce(&Self::Record) -> T) -> T;

        fn with_record_mut<T>(&mut self, f: impl FnOnce(&mut Self::Record) -> T) -> T;
    }
}

/// Name-based attribute access shared by [`Set`](crate::core::set::Set) and
/// [`Element`](crate::core::element::Element).
///
/// Implementors only say where their record lives and which table describes
/// it; lookup, permission and kind checks are the same for every object.
///
/// The trait is sealed. Records are only reachable through the checked
/// accessors, so a read-only attribute cannot be written from outside:
///
/// ```compile_fail
/// use nftset::core::attr::sealed::RecordAccess;
/// use nftset::{Attributes, Element};
///
/// let mut element = Element::new();
/// element.with_record_mut(|_| ());
/// ```
pub trait Attributes: sealed::RecordAccess {
    fn table() -> &'static AttrTable;

    /// Returns the current value of `name`, `None` if it was never set.
    ///
    /// # Errors
    ///
    /// `UnknownAttribute` or `PermissionDenied`.
    fn get_attribute(&self, name: &str) -> Result<Option<AttrValue>> {
        let spec = Self::table().resolve(name, Access::Read)?;
        Ok(self.with_record(|record| read_value(record, spec)))
    }

    /// Stores `value` into the record in place.
    ///
    /// # Errors
    ///
    /// `UnknownAttribute`, `PermissionDenied`, `TypeMismatch` or `ValueTooLong`.
    /// The record is left untouched on every error.
    fn set_attribute(&mut self, name: &str, value: impl Into<AttrValue>) -> Result<()> {
        let spec = Self::table().resolve(name, Access::Write)?;
        let value = value.into();
        self.with_record_mut(|record| {
            check_value(record, spec, &value)?;
            write_value(record, spec, &value);
            Ok(())
        })
    }

    /// Removes `name` so it is omitted from the wire.
    ///
    /// # Errors
    ///
    /// `UnknownAttribute` or `PermissionDenied` (unsetting is a write).
    fn unset_attribute(&mut self, name: &str) -> Result<()> {
        let spec = Self::table().resolve(name, Access::Write)?;
        self.with_record_mut(|record| record.unset(spec.code));
        Ok(())
    }

    /// All readable attributes that currently hold a value, in table order.
    fn attributes(&self) -> Vec<(&'static str, AttrValue)> {
        self.with_record(|record| {
            Self::table()
                .iter()
                .filter(|spec| spec.permission.can_read())
                .filter_map(|spec| read_value(record, spec).map(|v| (spec.name, v)))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    static TEST_TABLE: AttrTable = AttrTable {
        object: "scratch",
        entries: &[
            AttrSpec::rw("blob", 0, AttrKind::Raw),
            AttrSpec::rw("label", 1, AttrKind::String),
            AttrSpec::rw("small", 2, AttrKind::U32),
            AttrSpec::ro("big", 3, AttrKind::U64),
            AttrSpec {
                name: "secret",
                code: 4,
                kind: AttrKind::U32,
                permission: Permission::WriteOnly,
            },
        ],
    };

    #[derive(Default)]
    struct Scratch {
        values: HashMap<u16, AttrValue>,
    }

    impl NativeRecord for Scratch {
        fn get_data(&self, code: u16) -> Option<&[u8]> {
            self.values.get(&code).and_then(AttrValue::as_bytes)
        }
        fn get_str(&self, code: u16) -> Option<&str> {
            self.values.get(&code).and_then(AttrValue::as_str)
        }
        fn get_u32(&self, code: u16) -> Option<u32> {
            self.values.get(&code).and_then(AttrValue::as_u32)
        }
        fn get_u64(&self, code: u16) -> Option<u64> {
            self.values.get(&code).and_then(AttrValue::as_u64)
        }
        fn set_data(&mut self, code: u16, data: &[u8]) {
            self.values.insert(code, AttrValue::Raw(data.to_vec()));
        }
        fn set_str(&mut self, code: u16, value: &str) {
            self.values.insert(code, AttrValue::String(value.to_string()));
        }
        fn set_u32(&mut self, code: u16, value: u32) {
            self.values.insert(code, AttrValue::U32(value));
        }
        fn set_u64(&mut self, code: u16, value: u64) {
            self.values.insert(code, AttrValue::U64(value));
        }
        fn unset(&mut self, code: u16) {
            self.values.remove(&code);
        }
        fn max_len(&self, code: u16) -> Option<usize> {
            (code == 0).then_some(8)
        }
    }

    impl sealed::RecordAccess for Scratch {
        type Record = Scratch;

        fn with_record<T>(&self, f: impl FnOnce(&Scratch) -> T) -> T {
            f(self)
        }

        fn with_record_mut<T>(&mut self, f: impl FnOnce(&mut Scratch) -> T) -> T {
            f(self)
        }
    }

    impl Attributes for Scratch {
        fn table() -> &'static AttrTable {
            &TEST_TABLE
        }
    }

    #[test]
    fn test_permission_bits() {
        assert!(Permission::ReadOnly.can_read());
        assert!(!Permission::ReadOnly.can_write());
        assert!(!Permission::WriteOnly.can_read());
        assert!(Permission::WriteOnly.can_write());
        assert!(Permission::ReadWrite.can_read() && Permission::ReadWrite.can_write());
    }

    #[test]
    fn test_lookup_by_name_and_code() {
        let spec = TEST_TABLE.lookup("small").unwrap();
        assert_eq!(spec.code, 2);
        assert_eq!(spec.kind, AttrKind::U32);
        assert_eq!(TEST_TABLE.by_code(3).unwrap().name, "big");
        assert!(TEST_TABLE.lookup("missing").is_none());
    }

    #[test]
    fn test_dispatch_per_kind() {
        let mut scratch = Scratch::default();
        scratch.set_attribute("blob", vec![1, 2, 3]).unwrap();
        scratch.set_attribute("label", "hello").unwrap();
        scratch.set_attribute("small", 7u32).unwrap();

        assert_eq!(
            scratch.get_attribute("blob").unwrap(),
            Some(AttrValue::Raw(vec![1, 2, 3]))
        );
        assert_eq!(
            scratch.get_attribute("label").unwrap(),
            Some(AttrValue::String("hello".into()))
        );
        assert_eq!(scratch.get_attribute("small").unwrap(), Some(AttrValue::U32(7)));
        assert_eq!(scratch.get_attribute("big").unwrap(), None);
    }

    #[test]
    fn test_write_only_refuses_read() {
        let mut scratch = Scratch::default();
        scratch.set_attribute("secret", 1u32).unwrap();
        assert!(matches!(
            scratch.get_attribute("secret"),
            Err(Error::PermissionDenied {
                access: Access::Read,
                ..
            })
        ));
    }

    #[test]
    fn test_mismatch_leaves_record_untouched() {
        let mut scratch = Scratch::default();
        scratch.set_attribute("small", 5u32).unwrap();

        let err = scratch.set_attribute("small", 5u64).unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch {
                expected: AttrKind::U32,
                actual: AttrKind::U64,
                ..
            }
        ));
        assert_eq!(scratch.get_attribute("small").unwrap(), Some(AttrValue::U32(5)));
    }

    #[test]
    fn test_interior_nul_rejected() {
        let mut scratch = Scratch::default();
        assert!(matches!(
            scratch.set_attribute("label", "a\0b"),
            Err(Error::TypeMismatch { .. })
        ));
        assert_eq!(scratch.get_attribute("label").unwrap(), None);
    }

    #[test]
    fn test_max_len_enforced() {
        let mut scratch = Scratch::default();
        assert!(matches!(
            scratch.set_attribute("blob", vec![0u8; 9]),
            Err(Error::ValueTooLong { len: 9, max: 8, .. })
        ));
        scratch.set_attribute("blob", vec![0u8; 8]).unwrap();
    }

    #[test]
    fn test_unset_and_enumeration() {
        let mut scratch = Scratch::default();
        scratch.set_attribute("label", "x").unwrap();
        scratch.set_attribute("small", 1u32).unwrap();
        scratch.set_attribute("secret", 2u32).unwrap();

        let names: Vec<_> = scratch.attributes().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["label", "small"]);

        scratch.unset_attribute("label").unwrap();
        assert_eq!(scratch.get_attribute("label").unwrap(), None);
        assert!(scratch.unset_attribute("big").is_err());
    }

    #[test]
    fn test_ip_conversions() {
        let v4: AttrValue = Ipv4Addr::new(192, 0, 2, 1).into();
        assert_eq!(v4, AttrValue::Raw(vec![192, 0, 2, 1]));
        let v6: AttrValue = IpAddr::V6(Ipv6Addr::LOCALHOST).into();
        assert_eq!(v6.as_bytes().unwrap().len(), 16);
    }

    #[test]
    fn test_value_json_shape() {
        let json = serde_json::to_value(AttrValue::U32(4)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "u32", "value": 4}));
        let json = serde_json::to_value(AttrValue::Raw(vec![1, 2])).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "bytes", "value": [1, 2]}));
    }

    #[test]
    fn test_kind_names_agree_between_json_and_display() {
        use strum::IntoEnumIterator;

        for kind in AttrKind::iter() {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, serde_json::Value::String(kind.to_string()));
            assert_eq!(kind.to_string().parse::<AttrKind>().unwrap(), kind);
            let back: AttrKind = serde_json::from_value(json).unwrap();
            assert_eq!(back, kind);
        }
    }
}
