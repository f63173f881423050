//! nfnetlink message framing for nf_tables
//!
//! Every message starts with a `nlmsghdr` followed by a `nfgenmsg`, then a
//! sequence of netlink attributes (TLVs):
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ len u32 │ type u16 │ flags u16 │ seq u32 │ pid u32        │  nlmsghdr (native endian)
//! ├──────────────────────────────────────────────────────────┤
//! │ family u8 │ version u8 │ res_id u16 (big endian)          │  nfgenmsg
//! ├──────────────────────────────────────────────────────────┤
//! │ nla_len u16 │ nla_type u16 │ value ... padded to 4        │  attributes
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Attribute payloads holding integers are big endian, strings carry their
//! NUL terminator. The nlmsghdr and the generic attribute TLVs go through
//! `netlink-packet-core`; the nfgenmsg and the nf_tables attribute layouts are
//! written here. Reference: `<linux/netlink.h>`, `<linux/netfilter/nfnetlink.h>`.

use crate::core::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use netlink_packet_core::{
    DefaultNla, Emitable, NLA_HEADER_SIZE, NetlinkBuffer, NetlinkHeader,
    NlaBuffer, NlasIterator,
};
use nix::libc;
use nix::unistd::{SysconfVar, sysconf};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub use netlink_packet_core::{NLA_F_NESTED, NLM_F_ACK, NLM_F_CREATE, NLM_F_REPLACE, NLM_F_REQUEST};

/// `sizeof(struct nlmsghdr)`; `netlink-packet-core` does not re-export its constant.
pub const NLMSG_HDRLEN: usize = 16;
pub const NFGENMSG_LEN: usize = 4;
pub const NLA_HDRLEN: usize = NLA_HEADER_SIZE;

/// Largest attribute, header included, a 16-bit `nla_len` can describe.
pub const NLA_MAX_LEN: usize = u16::MAX as usize;

/// Largest attribute type; the top two bits are the nested/byte-order flags.
pub const NLA_MAX_TYPE: u16 = 0x3fff;

pub const NFNETLINK_V0: u8 = 0;
pub const NFNL_SUBSYS_NFTABLES: u16 = 10;
pub const NFNL_MSG_BATCH_BEGIN: u16 = 0x10;
pub const NFNL_MSG_BATCH_END: u16 = 0x11;

/// Netlink protocol number of the netfilter subsystem, for the socket layer.
pub const NETLINK_NETFILTER: i32 = libc::NETLINK_NETFILTER;

/// Port id sentinel asking the kernel to assign one on bind.
pub const SOCKET_AUTOPID: u32 = 0;

const MAX_SOCKET_BUFFER_SIZE: usize = 8192;

/// Batch buffer size used by the socket layer: one page, capped at 8 KiB.
pub static SOCKET_BUFFER_SIZE: LazyLock<usize> = LazyLock::new(|| {
    let page = sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|p| usize::try_from(p).ok())
        .unwrap_or(MAX_SOCKET_BUFFER_SIZE);
    tracing::debug!(page, "resolved page size");
    page.min(MAX_SOCKET_BUFFER_SIZE)
});

/// Rounds `len` up to the 4-byte netlink alignment.
pub const fn align(len: usize) -> usize {
    (len + 3) & !3
}

fn check_type(attr_type: usize) -> Result<u16> {
    u16::try_from(attr_type)
        .ok()
        .filter(|ty| *ty <= NLA_MAX_TYPE)
        .ok_or(Error::AttributeTypeOutOfRange {
            attr_type,
            max: NLA_MAX_TYPE,
        })
}

fn check_len(attr_type: u16, len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::AttributeTooLong {
        attr_type,
        len,
        max: NLA_MAX_LEN,
    })
}

/// nf_tables commands this crate emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[repr(u16)]
pub enum NftCommand {
    #[strum(serialize = "NEWSET")]
    NewSet = 9,
    #[strum(serialize = "DELSET")]
    DelSet = 11,
    #[strum(serialize = "NEWSETELEM")]
    NewSetElem = 12,
    #[strum(serialize = "DELSETELEM")]
    DelSetElem = 14,
}

impl NftCommand {
    /// Full `nlmsg_type`: subsystem in the high byte, command in the low byte.
    pub const fn msg_type(self) -> u16 {
        (NFNL_SUBSYS_NFTABLES << 8) | self as u16
    }

    /// Create commands always ask for create-or-replace; deletes force nothing.
    pub const fn default_flags(self) -> u16 {
        match self {
            NftCommand::NewSet | NftCommand::NewSetElem => NLM_F_CREATE | NLM_F_REPLACE,
            NftCommand::DelSet | NftCommand::DelSetElem => 0,
        }
    }

    pub const fn from_msg_type(msg_type: u16) -> Option<Self> {
        if msg_type >> 8 != NFNL_SUBSYS_NFTABLES {
            return None;
        }
        match msg_type & 0xff {
            9 => Some(NftCommand::NewSet),
            11 => Some(NftCommand::DelSet),
            12 => Some(NftCommand::NewSetElem),
            14 => Some(NftCommand::DelSetElem),
            _ => None,
        }
    }
}

/// Netfilter address families a set can live in
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
#[repr(u8)]
pub enum Family {
    #[strum(to_string = "ipv4", serialize = "ip")]
    #[serde(alias = "ip")]
    Ipv4 = libc::NFPROTO_IPV4 as u8,
    #[strum(to_string = "ipv6", serialize = "ip6")]
    #[serde(alias = "ip6")]
    Ipv6 = libc::NFPROTO_IPV6 as u8,
    #[strum(serialize = "bridge")]
    Bridge = libc::NFPROTO_BRIDGE as u8,
    #[strum(serialize = "arp")]
    Arp = libc::NFPROTO_ARP as u8,
}

impl From<Family> for u8 {
    fn from(family: Family) -> Self {
        family as u8
    }
}

impl Family {
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw as i32 {
            libc::NFPROTO_IPV4 => Some(Family::Ipv4),
            libc::NFPROTO_IPV6 => Some(Family::Ipv6),
            libc::NFPROTO_BRIDGE => Some(Family::Bridge),
            libc::NFPROTO_ARP => Some(Family::Arp),
            _ => None,
        }
    }
}

/// Open nested attribute, closed by [`Message::nest_end`].
#[must_use = "nested attributes must be closed with nest_end"]
#[derive(Debug)]
pub struct Nest {
    start: usize,
    attr_type: u16,
}

/// One netlink message under construction.
///
/// The nlmsghdr is emitted in [`Message::finish`] once the length is known;
/// nest lengths are patched in [`Message::nest_end`]. Every length is checked
/// against its header field, nothing is truncated.
#[derive(Debug)]
pub struct Message {
    header: NetlinkHeader,
    buf: BytesMut,
}

impl Message {
    /// Starts a message. `NLM_F_REQUEST` is always set.
    pub fn new(msg_type: u16, flags: u16, seq: u32) -> Self {
        let mut header = NetlinkHeader::default();
        header.message_type = msg_type;
        header.flags = NLM_F_REQUEST | flags;
        header.sequence_number = seq;

        let mut buf = BytesMut::with_capacity(256);
        buf.put_bytes(0, NLMSG_HDRLEN);
        Self { header, buf }
    }

    /// Appends the nfgenmsg extra header.
    pub fn put_nfgen(&mut self, family: u8, res_id: u16) {
        self.buf.put_u8(family);
        self.buf.put_u8(NFNETLINK_V0);
        self.buf.put_u16(res_id);
    }

    /// # Errors
    ///
    /// `AttributeTooLong` if `data` does not fit a 16-bit `nla_len`,
    /// `AttributeTypeOutOfRange` if `attr_type` collides with the flag bits.
    pub fn put_attr(&mut self, attr_type: u16, data: &[u8]) -> Result<()> {
        let attr_type = check_type(attr_type.into())?;
        check_len(attr_type, NLA_HDRLEN + data.len())?;

        let nla = DefaultNla::new(attr_type, data.to_vec());
        let start = self.buf.len();
        self.buf.resize(start + nla.buffer_len(), 0);
        nla.emit(&mut self.buf[start..]);
        Ok(())
    }

    pub fn put_strz(&mut self, attr_type: u16, value: &str) -> Result<()> {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);
        self.put_attr(attr_type, &data)
    }

    pub fn put_u32(&mut self, attr_type: u16, value: u32) -> Result<()> {
        self.put_attr(attr_type, &value.to_be_bytes())
    }

    pub fn put_u64(&mut self, attr_type: u16, value: u64) -> Result<()> {
        self.put_attr(attr_type, &value.to_be_bytes())
    }

    /// Opens a nested attribute; types above [`NLA_MAX_TYPE`] are refused.
    pub fn nest_start(&mut self, attr_type: u16) -> Result<Nest> {
        let attr_type = check_type(attr_type.into())?;
        let start = self.buf.len();
        self.buf.put_u16_ne(0);
        self.buf.put_u16_ne(attr_type | NLA_F_NESTED);
        Ok(Nest { start, attr_type })
    }

    /// # Errors
    ///
    /// `AttributeTooLong` if the nest grew past a 16-bit `nla_len`.
    pub fn nest_end(&mut self, nest: Nest) -> Result<()> {
        let len = check_len(nest.attr_type, self.buf.len() - nest.start)?;
        NlaBuffer::new(&mut self.buf[nest.start..]).set_length(len);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Emits the nlmsghdr and freezes the message.
    ///
    /// # Errors
    ///
    /// `MessageTooLong` if the message does not fit a 32-bit `nlmsg_len`.
    pub fn finish(mut self) -> Result<Bytes> {
        let len = self.buf.len();
        self.header.length = u32::try_from(len).map_err(|_| Error::MessageTooLong { len })?;
        self.header.emit(&mut self.buf[..NLMSG_HDRLEN]);
        Ok(self.buf.freeze())
    }
}

/// Batch begin/end marker: no payload, res_id names the target subsystem.
pub fn batch_marker(msg_type: u16, seq: u32) -> Result<Bytes> {
    let mut msg = Message::new(msg_type, 0, seq);
    msg.put_nfgen(libc::AF_UNSPEC as u8, NFNL_SUBSYS_NFTABLES);
    msg.finish()
}

/// nf_tables message header for `command` in `family`.
pub fn nft_message(command: NftCommand, family: u8, flags: u16, seq: u32) -> Message {
    let mut msg = Message::new(command.msg_type(), flags, seq);
    msg.put_nfgen(family, 0);
    msg
}

/// Decoded nlmsghdr
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub len: u32,
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl Header {
    /// Decodes the header at the start of `buf`, `None` if truncated.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let nl = NetlinkBuffer::new_checked(buf).ok()?;
        Some(Self {
            len: nl.length(),
            msg_type: nl.message_type(),
            flags: nl.flags(),
            seq: nl.sequence_number(),
            pid: nl.port_number(),
        })
    }

    pub const fn is_batch_marker(&self) -> bool {
        self.msg_type == NFNL_MSG_BATCH_BEGIN || self.msg_type == NFNL_MSG_BATCH_END
    }
}

/// Walks the messages of a dumped batch.
///
/// Yields the header and the bytes after the nlmsghdr (nfgenmsg included).
/// Stops at the first truncated or malformed header.
pub fn messages(buf: &[u8]) -> impl Iterator<Item = (Header, &[u8])> {
    let mut rest = buf;
    std::iter::from_fn(move || {
        let header = Header::parse(rest)?;
        let len = header.len as usize;
        if len < NLMSG_HDRLEN || len > rest.len() {
            return None;
        }
        let body = &rest[NLMSG_HDRLEN..len];
        rest = &rest[align(len).min(rest.len())..];
        Some((header, body))
    })
}

/// Walks a run of attributes, yielding `(type, nested, value)`.
///
/// Stops at the first malformed attribute.
pub fn attributes(buf: &[u8]) -> impl Iterator<Item = (u16, bool, &[u8])> {
    NlasIterator::new(buf)
        .map_while(std::result::Result::ok)
        .map(|nla| {
            let (kind, nested, len) = (nla.kind(), nla.nested_flag(), nla.value_length());
            (kind, nested, &nla.into_inner()[NLA_HEADER_SIZE..NLA_HEADER_SIZE + len])
        })
}
