//! On-disk format of the per-thread raw logs.
//!
//! The tracer appends fixed-width 16-byte entries to one file per thread.
//! All fields are little-endian on every supported host.
//!
//! # Format
//!
//! `| kind: u16 | aux: u16 | arg: u32 | value: u64 |`
//!
//! Field use per kind:
//!
//! | kind        | aux          | arg          | value             |
//! |-------------|--------------|--------------|-------------------|
//! | `Memref`    | -            | -            | address (low)     |
//! | `MemrefHigh`| -            | -            | address (high)    |
//! | `Pc`        | instr count  | module index | module offset     |
//! | `ThreadId`  | -            | -            | thread id         |
//! | `ProcessId` | -            | -            | process id        |
//! | `Timestamp` | -            | -            | microseconds      |
//! | `IFlush`    | -            | -            | address           |
//! | `Extended`  | subtype      | -            | version (header)  |
//!
//! The low/high memref pairing is a tracer implementation detail; the
//! converter consumes the combined `value` field directly as a full address.

use std::io::{self, BufReader, Read, Seek};

/// Size in bytes of one log entry.
pub const ENTRY_SIZE: usize = 16;

/// Version stamped into the header entry of every thread log.
pub const OFFLINE_FILE_VERSION: u64 = 3;

/// Enumeration of entry kinds, the first field of every entry.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKind {
    Memref = 0,
    MemrefHigh = 1,
    Pc = 2,
    ThreadId = 3,
    ProcessId = 4,
    Timestamp = 5,
    IFlush = 6,
    Extended = 7,
}

impl TryFrom<u16> for EntryKind {
    type Error = EntryError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Memref),
            1 => Ok(Self::MemrefHigh),
            2 => Ok(Self::Pc),
            3 => Ok(Self::ThreadId),
            4 => Ok(Self::ProcessId),
            5 => Ok(Self::Timestamp),
            6 => Ok(Self::IFlush),
            7 => Ok(Self::Extended),
            n => Err(EntryError::UnknownKind(n)),
        }
    }
}

/// `Extended` subtype marking the final entry of a log.
pub const EXT_FOOTER: u16 = 0;
/// `Extended` subtype carrying the log-format version, always first.
pub const EXT_HEADER: u16 = 1;

#[derive(thiserror::Error, Debug)]
pub enum EntryError {
    #[error("Unknown trace type {0}")]
    UnknownKind(u16),

    #[error("Invalid extension type {0}")]
    UnknownExtension(u16),
}

/// A parsed log entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OfflineEntry {
    Header { version: u64 },
    Footer,
    Timestamp { usec: u64 },
    ThreadId { tid: u32 },
    ProcessId { pid: u32 },
    Pc { modidx: u32, modoffs: u64, instr_count: u16 },
    Memref { addr: u64 },
    MemrefHigh { addr: u64 },
    IFlush { addr: u64 },
}

impl OfflineEntry {
    /// Returns the corresponding [`EntryKind`] for this entry.
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Header { .. } | Self::Footer => EntryKind::Extended,
            Self::Timestamp { .. } => EntryKind::Timestamp,
            Self::ThreadId { .. } => EntryKind::ThreadId,
            Self::ProcessId { .. } => EntryKind::ProcessId,
            Self::Pc { .. } => EntryKind::Pc,
            Self::Memref { .. } => EntryKind::Memref,
            Self::MemrefHigh { .. } => EntryKind::MemrefHigh,
            Self::IFlush { .. } => EntryKind::IFlush,
        }
    }

    /// Parses one raw 16-byte entry.
    pub fn parse(raw: &[u8; ENTRY_SIZE]) -> Result<Self, EntryError> {
        let kind = u16::from_le_bytes([raw[0], raw[1]]);
        let aux = u16::from_le_bytes([raw[2], raw[3]]);
        let arg = u32::from_le_bytes(raw[4..8].try_into().unwrap());
        let value = u64::from_le_bytes(raw[8..16].try_into().unwrap());
        match EntryKind::try_from(kind)? {
            EntryKind::Memref => Ok(Self::Memref { addr: value }),
            EntryKind::MemrefHigh => Ok(Self::MemrefHigh { addr: value }),
            EntryKind::Pc => Ok(Self::Pc {
                modidx: arg,
                modoffs: value,
                instr_count: aux,
            }),
            EntryKind::ThreadId => Ok(Self::ThreadId { tid: value as u32 }),
            EntryKind::ProcessId => Ok(Self::ProcessId { pid: value as u32 }),
            EntryKind::Timestamp => Ok(Self::Timestamp { usec: value }),
            EntryKind::IFlush => Ok(Self::IFlush { addr: value }),
            EntryKind::Extended => match aux {
                EXT_FOOTER => Ok(Self::Footer),
                EXT_HEADER => Ok(Self::Header { version: value }),
                n => Err(EntryError::UnknownExtension(n)),
            },
        }
    }

    /// Serializes this entry into its raw 16-byte form.
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let (aux, arg, value) = match *self {
            Self::Header { version } => (EXT_HEADER, 0, version),
            Self::Footer => (EXT_FOOTER, 0, 0),
            Self::Timestamp { usec } => (0, 0, usec),
            Self::ThreadId { tid } => (0, 0, tid as u64),
            Self::ProcessId { pid } => (0, 0, pid as u64),
            Self::Pc {
                modidx,
                modoffs,
                instr_count,
            } => (instr_count, modidx, modoffs),
            Self::Memref { addr } | Self::MemrefHigh { addr } | Self::IFlush { addr } => {
                (0, 0, addr)
            }
        };
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0..2].copy_from_slice(&(self.kind() as u16).to_le_bytes());
        raw[2..4].copy_from_slice(&aux.to_le_bytes());
        raw[4..8].copy_from_slice(&arg.to_le_bytes());
        raw[8..16].copy_from_slice(&value.to_le_bytes());
        raw
    }

    /// True for both halves of a memory-reference pair.
    pub fn is_memref(&self) -> bool {
        matches!(self, Self::Memref { .. } | Self::MemrefHigh { .. })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error(transparent)]
    Entry(#[from] EntryError),

    #[error("Failed to read from input file")]
    Io(#[source] io::Error),
}

/// Forward cursor over one thread's raw log with a one-entry rewind.
///
/// Reading past the end of the file (including a partial trailing entry)
/// yields `Ok(None)`; the caller decides whether that is a clean end or a
/// truncated log.
#[derive(Debug)]
pub struct LogReader<R> {
    inner: BufReader<R>,
}

impl<R: Read + Seek> LogReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Reads and parses the next entry, or `Ok(None)` at end of input.
    pub fn read_entry(&mut self) -> Result<Option<OfflineEntry>, LogError> {
        let mut raw = [0u8; ENTRY_SIZE];
        let mut filled = 0;
        while filled < raw.len() {
            match self.inner.read(&mut raw[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(LogError::Io(e)),
            }
        }
        if filled < raw.len() {
            // Either a clean EOF or a torn final entry.
            return Ok(None);
        }
        Ok(Some(OfflineEntry::parse(&raw)?))
    }

    /// Puts back the entry returned by the last successful [`read_entry`].
    ///
    /// [`read_entry`]: Self::read_entry
    pub fn put_back(&mut self) -> io::Result<()> {
        self.inner.seek_relative(-(ENTRY_SIZE as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn pc_entry_round_trip() {
        let entry = OfflineEntry::Pc {
            modidx: 3,
            modoffs: 0x1040,
            instr_count: 12,
        };
        assert_eq!(OfflineEntry::parse(&entry.encode()).unwrap(), entry);
    }

    #[test]
    fn header_layout() {
        let raw = OfflineEntry::Header { version: 3 }.encode();
        assert_eq!(u16::from_le_bytes([raw[0], raw[1]]), EntryKind::Extended as u16);
        assert_eq!(u16::from_le_bytes([raw[2], raw[3]]), EXT_HEADER);
        assert_eq!(u64::from_le_bytes(raw[8..16].try_into().unwrap()), 3);
    }

    #[test]
    fn unknown_kind_is_reported() {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0] = 42;
        let err = OfflineEntry::parse(&raw).unwrap_err();
        assert_eq!(err.to_string(), "Unknown trace type 42");
    }

    #[test]
    fn put_back_rewinds_one_entry() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&OfflineEntry::Timestamp { usec: 7 }.encode());
        bytes.extend_from_slice(&OfflineEntry::Footer.encode());
        let mut reader = LogReader::new(Cursor::new(bytes));
        assert_eq!(
            reader.read_entry().unwrap(),
            Some(OfflineEntry::Timestamp { usec: 7 })
        );
        reader.put_back().unwrap();
        assert_eq!(
            reader.read_entry().unwrap(),
            Some(OfflineEntry::Timestamp { usec: 7 })
        );
        assert_eq!(reader.read_entry().unwrap(), Some(OfflineEntry::Footer));
        assert_eq!(reader.read_entry().unwrap(), None);
    }
}
