//! Batch builder: frames set and element operations into one nfnetlink batch
//!
//! A [`Batch`] moves through three states:
//!
//! - `Unstarted`: nothing allocated
//! - `Open`: after [`Batch::begin`]; operations can be queued, [`Batch::end`] closes the frame
//! - `Closed`: after [`Batch::close`]; the buffer is released
//!
//! Every message, the begin/end markers included, consumes exactly one
//! sequence number. That is what lets the socket layer match kernel
//! acknowledgements to queued operations.
//!
//! # Example
//!
//! ```
//! use nftset::core::attr::Attributes;
//! use nftset::core::batch::Batch;
//! use nftset::core::element::Element;
//! use nftset::core::netlink::Family;
//! use nftset::core::set::Set;
//! use nftset::config::BatchConfig;
//!
//! let mut set = Set::new();
//! set.set_attribute("table", "filter").unwrap();
//! set.set_attribute("name", "blocklist").unwrap();
//!
//! let mut element = Element::new();
//! element.set_attribute("key", [192u8, 0, 2, 1]).unwrap();
//! set.add_element(&mut element).unwrap();
//!
//! let mut batch = Batch::with_config(BatchConfig { seq_seed: Some(100), ..Default::default() });
//! batch.begin().unwrap();
//! assert_eq!(batch.queue_set_put(&set, Family::Ipv4, true).unwrap(), 101);
//! assert_eq!(batch.queue_element_put(&set, Family::Ipv4, true).unwrap(), 102);
//! batch.end().unwrap();
//!
//! let bytes = batch.dump();
//! assert!(!bytes.is_empty());
//! ```

use crate::config::BatchConfig;
use crate::core::error::{BatchStateError, Error, Result};
use crate::core::netlink::{
    self, NFNL_MSG_BATCH_BEGIN, NFNL_MSG_BATCH_END, NLM_F_ACK, NftCommand,
};
use crate::core::set::Set;
use bytes::{BufMut, Bytes};
use tracing::{debug, warn};

/// Externally visible lifecycle of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum BatchState {
    #[strum(serialize = "unstarted")]
    Unstarted,
    #[strum(serialize = "open")]
    Open,
    #[strum(serialize = "closed")]
    Closed,
}

/// Fixed-capacity message buffer; never grows past `capacity`.
#[derive(Debug)]
struct Buffer {
    bytes: Vec<u8>,
    capacity: usize,
    messages: usize,
}

impl Buffer {
    fn allocate(capacity: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(capacity).map_err(|e| {
            Error::AllocationFailure(format!("batch buffer of {capacity} bytes: {e}"))
        })?;
        Ok(Self {
            bytes,
            capacity,
            messages: 0,
        })
    }

    fn remaining(&self) -> usize {
        self.capacity - self.bytes.len()
    }

    /// Appends a whole message or nothing.
    fn append(&mut self, msg: &[u8]) -> Result<()> {
        if msg.len() > self.remaining() {
            return Err(Error::BufferFull {
                needed: msg.len(),
                remaining: self.remaining(),
                capacity: self.capacity,
            });
        }
        self.bytes.put_slice(msg);
        self.messages += 1;
        Ok(())
    }
}

#[derive(Debug)]
enum State {
    Unstarted,
    Open(Buffer),
    Closed,
}

/// Builder for one atomic nfnetlink batch
#[derive(Debug)]
pub struct Batch {
    config: BatchConfig,
    state: State,
    seq: u32,
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// Seconds since the epoch, truncated to 32 bits like `time(NULL)` stored in a `u32`.
fn time_seed() -> u32 {
    u32::try_from(chrono::Utc::now().timestamp() & 0xffff_ffff).unwrap_or_default()
}

impl Batch {
    pub fn new() -> Self {
        Self::with_config(BatchConfig::default())
    }

    pub fn with_config(config: BatchConfig) -> Self {
        Self {
            config,
            state: State::Unstarted,
            seq: 0,
        }
    }

    pub fn state(&self) -> BatchState {
        match self.state {
            State::Unstarted => BatchState::Unstarted,
            State::Open(_) => BatchState::Open,
            State::Closed => BatchState::Closed,
        }
    }

    /// Sequence number the next message will carry.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        match &self.state {
            State::Open(buffer) => buffer.bytes.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of framed messages written so far.
    pub fn message_count(&self) -> usize {
        match &self.state {
            State::Open(buffer) => buffer.messages,
            _ => 0,
        }
    }

    /// Capacity left in the open buffer, 0 in any other state.
    pub fn remaining(&self) -> usize {
        match &self.state {
            State::Open(buffer) => buffer.remaining(),
            _ => 0,
        }
    }

    /// Allocates the buffer, seeds the sequence counter and writes the
    /// batch-begin marker.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` unless the batch is unstarted, `AllocationFailure` if
    /// the buffer cannot be reserved, `BufferFull` if the configured capacity
    /// cannot even hold the marker. On error nothing is kept allocated.
    pub fn begin(&mut self) -> Result<()> {
        if !matches!(self.state, State::Unstarted) {
            warn!(state = %self.state(), "begin called twice");
            return Err(BatchStateError::AlreadyStarted.into());
        }

        let mut buffer = Buffer::allocate(self.config.buffer_size())?;
        let seq = self.config.seq_seed.unwrap_or_else(time_seed);
        buffer.append(&netlink::batch_marker(NFNL_MSG_BATCH_BEGIN, seq)?)?;

        debug!(seq, capacity = buffer.capacity, "batch begin");
        self.seq = seq.wrapping_add(1);
        self.state = State::Open(buffer);
        Ok(())
    }

    /// Queues `NEWSET` (create or replace). Returns the sequence number used.
    ///
    /// # Errors
    ///
    /// `NotOpen` outside the open state, `BufferFull` if the message does not fit,
    /// `AttributeTooLong` if an attribute outgrows its netlink length field.
    /// The batch is unchanged on error.
    pub fn queue_set_put(&mut self, set: &Set, family: impl Into<u8>, ack: bool) -> Result<u32> {
        self.queue(NftCommand::NewSet, set, family.into(), ack)
    }

    /// Queues `DELSET`. Returns the sequence number used.
    ///
    /// # Errors
    ///
    /// `NotOpen` outside the open state, `BufferFull` if the message does not fit,
    /// `AttributeTooLong` if an attribute outgrows its netlink length field.
    /// The batch is unchanged on error.
    pub fn queue_set_delete(
        &mut self,
        set: &Set,
        family: impl Into<u8>,
        ack: bool,
    ) -> Result<u32> {
        self.queue(NftCommand::DelSet, set, family.into(), ack)
    }

    /// Queues `NEWSETELEM` for every element currently linked into `set`.
    ///
    /// # Errors
    ///
    /// `NotOpen` outside the open state, `BufferFull` if the message does not fit,
    /// `AttributeTooLong` if an attribute outgrows its netlink length field.
    /// The batch is unchanged on error.
    pub fn queue_element_put(
        &mut self,
        set: &Set,
        family: impl Into<u8>,
        ack: bool,
    ) -> Result<u32> {
        self.queue(NftCommand::NewSetElem, set, family.into(), ack)
    }

    /// Queues `DELSETELEM` for every element currently linked into `set`.
    ///
    /// # Errors
    ///
    /// `NotOpen` outside the open state, `BufferFull` if the message does not fit,
    /// `AttributeTooLong` if an attribute outgrows its netlink length field.
    /// The batch is unchanged on error.
    pub fn queue_element_delete(
        &mut self,
        set: &Set,
        family: impl Into<u8>,
        ack: bool,
    ) -> Result<u32> {
        self.queue(NftCommand::DelSetElem, set, family.into(), ack)
    }

    fn queue(&mut self, command: NftCommand, set: &Set, family: u8, ack: bool) -> Result<u32> {
        let State::Open(buffer) = &mut self.state else {
            warn!(%command, "queue before begin");
            return Err(BatchStateError::NotOpen.into());
        };

        let flags = command.default_flags() | if ack { NLM_F_ACK } else { 0 };
        let mut msg = netlink::nft_message(command, family, flags, self.seq);
        match command {
            NftCommand::NewSet | NftCommand::DelSet => set.build_payload(&mut msg)?,
            NftCommand::NewSetElem | NftCommand::DelSetElem => {
                set.build_elements_payload(&mut msg)?;
            }
        }
        let msg = msg.finish()?;
        buffer.append(&msg)?;

        let seq = self.seq;
        self.seq = seq.wrapping_add(1);
        debug!(
            %command,
            seq,
            family,
            flags,
            len = msg.len(),
            elements = set.len(),
            "queued"
        );
        Ok(seq)
    }

    /// Writes the batch-end marker. The batch stays open so it can be dumped.
    ///
    /// # Errors
    ///
    /// `NotOpen` outside the open state, `BufferFull` if the marker does not fit.
    pub fn end(&mut self) -> Result<u32> {
        let State::Open(buffer) = &mut self.state else {
            warn!(state = %self.state(), "end before begin");
            return Err(BatchStateError::NotOpen.into());
        };

        let seq = self.seq;
        buffer.append(&netlink::batch_marker(NFNL_MSG_BATCH_END, seq)?)?;
        self.seq = seq.wrapping_add(1);
        debug!(seq, len = buffer.bytes.len(), messages = buffer.messages, "batch end");
        Ok(seq)
    }

    /// Copy of everything written since `begin`, empty before `begin` and after `close`.
    pub fn dump(&self) -> Bytes {
        match &self.state {
            State::Open(buffer) => Bytes::copy_from_slice(&buffer.bytes),
            _ => Bytes::new(),
        }
    }

    /// Releases the buffer. Terminal: the batch cannot be reopened.
    pub fn close(&mut self) {
        if let State::Open(buffer) = &self.state {
            debug!(len = buffer.bytes.len(), "batch closed");
        }
        self.state = State::Closed;
    }
}
