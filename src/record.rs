//! Canonical trace records, the converter's output format.
//!
//! The output is a flat stream of packed 16-byte records consumed by the
//! downstream cache and TLB simulators.
//!
//! # Format
//!
//! `| type: le16 | size: le16 | reserved: [u8; 4] | addr: le64 |`
//!
//! The reserved bytes are written as zero and keep `addr` eight-byte aligned
//! for consumers that map the trace. The first record of a trace is
//! [`TraceType::Header`] with `addr` holding the format version; the last is
//! [`TraceType::Footer`].

use std::io::{self, Write};

/// Size in bytes of one canonical record.
pub const TRACE_RECORD_SIZE: usize = 16;

/// Version stamped into the header record of every trace.
pub const TRACE_FORMAT_VERSION: u64 = 2;

/// Enumeration of canonical record types.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TraceType {
    Read = 0,
    Write = 1,
    Prefetch = 2,
    PrefetchT0 = 3,
    PrefetchT1 = 4,
    PrefetchT2 = 5,
    PrefetchNta = 6,
    Instr = 7,
    InstrDirectJump = 8,
    InstrIndirectJump = 9,
    InstrConditionalJump = 10,
    InstrDirectCall = 11,
    InstrIndirectCall = 12,
    InstrReturn = 13,
    InstrFlush = 14,
    DataFlush = 15,
    ThreadId = 16,
    ThreadExit = 17,
    ProcessId = 18,
    Header = 19,
    Footer = 20,
}

impl TraceType {
    /// True for every instruction-fetch specialization.
    pub fn is_instr_fetch(self) -> bool {
        matches!(
            self,
            Self::Instr
                | Self::InstrDirectJump
                | Self::InstrIndirectJump
                | Self::InstrConditionalJump
                | Self::InstrDirectCall
                | Self::InstrIndirectCall
                | Self::InstrReturn
        )
    }
}

#[derive(thiserror::Error, Debug)]
#[error("unknown canonical record type {0}")]
pub struct UnknownTraceType(pub u16);

impl TryFrom<u16> for TraceType {
    type Error = UnknownTraceType;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::Prefetch),
            3 => Ok(Self::PrefetchT0),
            4 => Ok(Self::PrefetchT1),
            5 => Ok(Self::PrefetchT2),
            6 => Ok(Self::PrefetchNta),
            7 => Ok(Self::Instr),
            8 => Ok(Self::InstrDirectJump),
            9 => Ok(Self::InstrIndirectJump),
            10 => Ok(Self::InstrConditionalJump),
            11 => Ok(Self::InstrDirectCall),
            12 => Ok(Self::InstrIndirectCall),
            13 => Ok(Self::InstrReturn),
            14 => Ok(Self::InstrFlush),
            15 => Ok(Self::DataFlush),
            16 => Ok(Self::ThreadId),
            17 => Ok(Self::ThreadExit),
            18 => Ok(Self::ProcessId),
            19 => Ok(Self::Header),
            20 => Ok(Self::Footer),
            n => Err(UnknownTraceType(n)),
        }
    }
}

/// One canonical trace record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TraceRecord {
    pub kind: TraceType,
    pub size: u16,
    pub addr: u64,
}

impl TraceRecord {
    /// Parses one raw 16-byte record.
    pub fn parse(raw: &[u8; TRACE_RECORD_SIZE]) -> Result<Self, UnknownTraceType> {
        let kind = TraceType::try_from(u16::from_le_bytes([raw[0], raw[1]]))?;
        let size = u16::from_le_bytes([raw[2], raw[3]]);
        let addr = u64::from_le_bytes(raw[8..16].try_into().unwrap());
        Ok(Self { kind, size, addr })
    }

    /// Writes the serialized record into the provided buffer.
    pub fn emit(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&(self.kind as u16).to_le_bytes());
        buffer.extend_from_slice(&self.size.to_le_bytes());
        buffer.extend_from_slice(&[0u8; 4]);
        buffer.extend_from_slice(&self.addr.to_le_bytes());
    }
}

/// Writes framed canonical records to a borrowed output stream.
#[derive(Debug)]
pub struct TraceWriter<W> {
    inner: W,
    buffer: Vec<u8>,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(TRACE_RECORD_SIZE),
        }
    }

    pub fn write(&mut self, record: &TraceRecord) -> io::Result<()> {
        record.emit(&mut self.buffer);
        self.inner.write_all(self.buffer.as_slice())?;
        self.buffer.clear();
        Ok(())
    }

    pub fn header(&mut self, version: u64) -> io::Result<()> {
        self.write(&TraceRecord {
            kind: TraceType::Header,
            size: 0,
            addr: version,
        })
    }

    pub fn footer(&mut self) -> io::Result<()> {
        self.write(&TraceRecord {
            kind: TraceType::Footer,
            size: 0,
            addr: 0,
        })
    }

    /// Re-anchors the consumer on a thread; emitted on every thread switch
    /// and for every thread-id entry seen in a log.
    pub fn thread_id(&mut self, tid: u32) -> io::Result<()> {
        self.write(&TraceRecord {
            kind: TraceType::ThreadId,
            size: 4,
            addr: tid as u64,
        })
    }

    pub fn thread_exit(&mut self, tid: u32) -> io::Result<()> {
        self.write(&TraceRecord {
            kind: TraceType::ThreadExit,
            size: 4,
            addr: tid as u64,
        })
    }

    pub fn process_id(&mut self, pid: u32) -> io::Result<()> {
        self.write(&TraceRecord {
            kind: TraceType::ProcessId,
            size: 4,
            addr: pid as u64,
        })
    }

    /// One instruction-flush record spanning `[start, start + len)`.
    pub fn instr_flush(&mut self, start: u64, len: u64) -> io::Result<()> {
        self.write(&TraceRecord {
            kind: TraceType::InstrFlush,
            size: len as u16,
            addr: start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        let mut buffer = Vec::new();
        TraceRecord {
            kind: TraceType::Write,
            size: 4,
            addr: 0x1122334455667788,
        }
        .emit(&mut buffer);
        assert_eq!(
            buffer,
            [
                0x01, 0x00, // type
                0x04, 0x00, // size
                0x00, 0x00, 0x00, 0x00, // reserved
                0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, // addr
            ]
        );
        let parsed = TraceRecord::parse(buffer.as_slice().try_into().unwrap()).unwrap();
        assert_eq!(parsed.kind, TraceType::Write);
        assert_eq!(parsed.size, 4);
        assert_eq!(parsed.addr, 0x1122334455667788);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut raw = [0u8; TRACE_RECORD_SIZE];
        raw[0] = 200;
        assert!(TraceRecord::parse(&raw).is_err());
    }
}
