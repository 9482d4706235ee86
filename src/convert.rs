//! The converter: merges the per-thread raw logs into one canonical trace.
//!
//! Threads are read in lockstep and interleaved in global timestamp order
//! while keeping basic blocks atomic. For each PC entry the block expander
//! walks the module-resolved bytes, drives the decode cache, and emits
//! instruction-fetch records interleaved with the memory references pulled
//! from the same thread's log.

use crate::decode::{DecodeCache, DecodeError, InstrDesc, IsaMode};
use crate::entry::{EntryError, LogError, LogReader, OfflineEntry, OFFLINE_FILE_VERSION};
use crate::modmap::{CustomFieldHooks, ModMapError, ModuleTable};
use crate::record::{TraceRecord, TraceType, TraceWriter, TRACE_FORMAT_VERSION};
use std::io::{self, Read, Seek, Write};

/// Construction-time configuration.
#[derive(Default)]
pub struct ConvertConfig {
    pub isa: IsaMode,
    /// Hooks for the sidecar's opaque custom field; all or none.
    pub hooks: Option<CustomFieldHooks>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
    #[error(transparent)]
    ModMap(#[from] ModMapError),

    #[error(transparent)]
    Decoder(#[from] DecodeError),

    #[error(transparent)]
    Entry(#[from] EntryError),

    #[error("Failed to read from input file")]
    Read(#[source] io::Error),

    #[error("Failed to write to output file")]
    Write(#[source] io::Error),

    #[error("Unable to read thread log file")]
    UnreadableLog(#[source] io::Error),

    #[error("Thread log file is corrupted: missing version entry")]
    MissingVersion,

    #[error("Version mismatch: expect {expect} vs {got}")]
    VersionMismatch { expect: u64, got: u64 },

    #[error("Missing timestamp entry")]
    MissingTimestamp,

    #[error("Footer is not the final entry")]
    FooterNotFinal,

    #[error("Missing thread id")]
    MissingThreadId,

    #[error("unexpected header entry in the middle of a thread log")]
    MisplacedHeader,

    #[error("memref entry found outside of bb")]
    MemrefOutsideBlock,

    #[error("Trace ends mid-block")]
    TraceEndsMidBlock,

    #[error("Flush missing 2nd entry")]
    FlushMissingSecond,

    #[error("cannot mix 0-count and >1-count")]
    MixedFilterModes,

    #[error("control transfer in the middle of a basic block")]
    MidBlockControlTransfer,
}

impl From<LogError> for ConvertError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::Entry(e) => Self::Entry(e),
            LogError::Io(e) => Self::Read(e),
        }
    }
}

struct ThreadLog<R> {
    reader: LogReader<R>,
    /// Cached thread id, unknown until the first thread-id entry.
    tid: Option<u32>,
    /// Pending merge timestamp; 0 means "read the next one".
    time: u64,
    /// Latched when an L0-filtered zero-count PC entry is seen.
    separate_instrs: bool,
    done: bool,
}

impl<R> ThreadLog<R> {
    fn describe(&self, index: usize) -> String {
        match self.tid {
            Some(tid) => format!("{tid}"),
            None => format!("#{index}"),
        }
    }
}

/// Converts a set of raw thread logs plus a module-map sidecar into one
/// canonical trace.
///
/// The sidecar buffer, the thread-log streams, and the output stream are
/// borrowed from the caller; module mappings and cached instruction
/// descriptors are owned and released when the converter is dropped.
pub struct Converter<'m, R, W> {
    modules: ModuleTable<'m>,
    decoder: DecodeCache,
    threads: Vec<ThreadLog<R>>,
    writer: TraceWriter<W>,
    prev_was_rep_string: bool,
}

impl<'m, R: Read + Seek, W: Write> Converter<'m, R, W> {
    /// Parses and maps the module table and readies every thread log.
    pub fn new(
        module_map: &'m [u8],
        thread_files: Vec<R>,
        out_file: W,
        config: ConvertConfig,
    ) -> Result<Self, ConvertError> {
        let modules = ModuleTable::load(module_map, config.hooks.as_ref())?;
        let decoder = DecodeCache::new(config.isa)?;
        let threads = thread_files
            .into_iter()
            .map(|file| ThreadLog {
                reader: LogReader::new(file),
                tid: None,
                time: 0,
                separate_instrs: false,
                done: false,
            })
            .collect();
        Ok(Self {
            modules,
            decoder,
            threads,
            writer: TraceWriter::new(out_file),
            prev_was_rep_string: false,
        })
    }

    /// Runs the conversion to completion.
    pub fn run(mut self) -> Result<(), ConvertError> {
        for thread in &mut self.threads {
            check_thread_file(&mut thread.reader)?;
        }
        self.writer
            .header(TRACE_FORMAT_VERSION)
            .map_err(ConvertError::Write)?;
        self.merge_thread_files()?;
        self.writer.footer().map_err(ConvertError::Write)?;
        log::info!(
            "Successfully converted {} thread files ({} cached decodes)",
            self.threads.len(),
            self.decoder.len()
        );
        Ok(())
    }

    /// Reads the thread logs simultaneously and merges them in timestamp
    /// order, converting each log entry into canonical records.
    fn merge_thread_files(&mut self) -> Result<(), ConvertError> {
        let mut live = self.threads.len();
        let mut current: Option<usize> = None;
        let mut last_bb_handled = true;
        while live > 0 {
            let tidx = match current {
                Some(tidx) => tidx,
                None => {
                    let tidx = self.select_thread()?;
                    current = Some(tidx);
                    tidx
                }
            };
            let entry = match self.threads[tidx].reader.read_entry() {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    // Keep going with partial results in case the disk was
                    // full or there was some other issue.
                    log::warn!(
                        "Input file for thread {} is truncated",
                        self.threads[tidx].describe(tidx)
                    );
                    OfflineEntry::Footer
                }
                Err(err) => return Err(err.into()),
            };
            match entry {
                OfflineEntry::Header { .. } => return Err(ConvertError::MisplacedHeader),
                OfflineEntry::Footer => {
                    // Nothing may follow a footer.
                    if !matches!(self.threads[tidx].reader.read_entry(), Ok(None)) {
                        return Err(ConvertError::FooterNotFinal);
                    }
                    let tid = self.threads[tidx]
                        .tid
                        .ok_or(ConvertError::MissingThreadId)?;
                    log::debug!("Thread {tid} exit");
                    self.writer.thread_exit(tid).map_err(ConvertError::Write)?;
                    self.threads[tidx].done = true;
                    live -= 1;
                    current = None;
                }
                OfflineEntry::Timestamp { usec } => {
                    log::debug!(
                        "Thread {} timestamp {usec:#x}",
                        self.threads[tidx].describe(tidx)
                    );
                    self.threads[tidx].time = usec;
                    current = None;
                }
                OfflineEntry::ThreadId { tid } => {
                    log::debug!("Thread {tid} entry");
                    if self.threads[tidx].tid.is_none() {
                        self.threads[tidx].tid = Some(tid);
                    }
                    self.writer.thread_id(tid).map_err(ConvertError::Write)?;
                }
                OfflineEntry::ProcessId { pid } => {
                    log::debug!("Process {pid} entry");
                    self.writer.process_id(pid).map_err(ConvertError::Write)?;
                }
                OfflineEntry::Pc {
                    modidx,
                    modoffs,
                    instr_count,
                } => {
                    last_bb_handled = self.append_bb_entries(tidx, modidx, modoffs, instr_count)?;
                }
                OfflineEntry::Memref { addr } | OfflineEntry::MemrefHigh { addr } => {
                    if last_bb_handled {
                        // Memrefs must originate inside a block expansion.
                        return Err(ConvertError::MemrefOutsideBlock);
                    }
                    // Data touched by code outside any known module; emit a
                    // placeholder reference.
                    log::trace!("Appended non-module memref to {addr:#x}");
                    self.writer
                        .write(&TraceRecord {
                            kind: TraceType::Read,
                            size: 1,
                            addr,
                        })
                        .map_err(ConvertError::Write)?;
                }
                OfflineEntry::IFlush { addr: start } => {
                    let Ok(Some(OfflineEntry::IFlush { addr: end })) =
                        self.threads[tidx].reader.read_entry()
                    else {
                        return Err(ConvertError::FlushMissingSecond);
                    };
                    log::debug!("Flush {start:#x}-{end:#x}");
                    self.writer
                        .instr_flush(start, end.saturating_sub(start))
                        .map_err(ConvertError::Write)?;
                }
            }
        }
        Ok(())
    }

    /// Picks the thread with the smallest pending timestamp (ties broken by
    /// index), reading the next timestamp for every thread that needs one.
    fn select_thread(&mut self) -> Result<usize, ConvertError> {
        for (index, thread) in self.threads.iter_mut().enumerate() {
            if thread.done || thread.time != 0 {
                continue;
            }
            match thread.reader.read_entry() {
                Ok(Some(OfflineEntry::Timestamp { usec })) => {
                    log::trace!("Thread {} timestamp is @{usec:#x}", thread.describe(index));
                    thread.time = usec;
                }
                Ok(_) => return Err(ConvertError::MissingTimestamp),
                Err(err) => return Err(err.into()),
            }
        }
        let (tidx, _) = self
            .threads
            .iter()
            .enumerate()
            .filter(|(_, thread)| thread.time != 0)
            .min_by_key(|(_, thread)| thread.time)
            .ok_or(ConvertError::MissingTimestamp)?;
        log::debug!(
            "Next thread in timestamp order is {} @{:#x}",
            self.threads[tidx].describe(tidx),
            self.threads[tidx].time
        );
        self.threads[tidx].time = 0;
        if let Some(tid) = self.threads[tidx].tid {
            // Re-anchor the consumer; the initial read from a file may not
            // have seen its tid entry yet.
            self.writer.thread_id(tid).map_err(ConvertError::Write)?;
        }
        Ok(tidx)
    }

    /// Expands one basic block: decodes `instr_count` instructions starting
    /// at `modidx+modoffs` and emits fetch records interleaved with the
    /// memrefs consumed from the thread's log.
    ///
    /// Returns false when the target module has no bytes to decode from, so
    /// the caller knows to treat subsequent memref entries as orphan data
    /// references.
    fn append_bb_entries(
        &mut self,
        tidx: usize,
        modidx: u32,
        modoffs: u64,
        instr_count: u16,
    ) -> Result<bool, ConvertError> {
        // (0, 0) is the tracer's marker for code outside any known module.
        let source = if modidx == 0 && modoffs == 0 {
            None
        } else {
            self.modules.resolve(modidx)?
        };
        let Some(source) = source else {
            log::debug!("Skipping ifetch for {instr_count} instrs not in a module");
            return Ok(false);
        };
        log::debug!(
            "Appending {instr_count} instrs in bb mod {modidx} +{modoffs:#x} = {}",
            source.path
        );

        let mut count = u32::from(instr_count);
        let mut skip_icache = false;
        if count == 0 {
            // L0 filtering adds a PC entry with a count of 0 prior to each
            // memref; the entry stands for a single instruction.
            skip_icache = true;
            count = 1;
            self.threads[tidx].separate_instrs = true;
        }
        let separate_instrs = self.threads[tidx].separate_instrs;
        if separate_instrs && count != 1 {
            return Err(ConvertError::MixedFilterModes);
        }

        let mut offs = modoffs;
        for i in 0..count {
            let orig_pc = source.orig_base.wrapping_add(offs);
            let window = source.bytes.get(offs as usize..).unwrap_or(&[]);
            let Some(desc) = self
                .decoder
                .lookup_or_decode((source.primary, offs), window, orig_pc)
            else {
                // Leave the rest of the block alone: no memrefs were recorded
                // for an instruction the tracer could not decode either.
                log::warn!(
                    "Encountered invalid/undecodable instr @ {}+{offs:#x}",
                    source.path
                );
                break;
            };
            if desc.is_cti && i != count - 1 {
                return Err(ConvertError::MidBlockControlTransfer);
            }

            let mut skip_instr = false;
            if desc.rep_string {
                // Make it look like the original rep string instead of the
                // expanded per-iteration loop.
                if !self.prev_was_rep_string {
                    self.prev_was_rep_string = true;
                } else {
                    skip_instr = true;
                }
            } else {
                self.prev_was_rep_string = false;
            }

            if !skip_instr {
                self.writer
                    .write(&TraceRecord {
                        kind: desc.fetch_type(),
                        size: if skip_icache { 0 } else { u16::from(desc.length) },
                        addr: orig_pc,
                    })
                    .map_err(ConvertError::Write)?;
            } else {
                log::trace!("Skipping instr fetch for {orig_pc:#x}");
            }

            // Interleave the instruction with its memrefs. There is no
            // following memref under separate-instrs unless this is the
            // L0 singleton form.
            if (!separate_instrs || skip_icache) && desc.accesses_memory() {
                for &size in &desc.src_sizes {
                    append_memref(
                        &mut self.threads[tidx].reader,
                        &mut self.writer,
                        desc,
                        size,
                        false,
                    )?;
                }
                for &size in &desc.dst_sizes {
                    append_memref(
                        &mut self.threads[tidx].reader,
                        &mut self.writer,
                        desc,
                        size,
                        true,
                    )?;
                }
            }
            offs += u64::from(desc.length);
        }
        Ok(true)
    }
}

/// Reads and checks the mandatory version header of one thread log.
fn check_thread_file<R: Read + Seek>(reader: &mut LogReader<R>) -> Result<(), ConvertError> {
    match reader.read_entry() {
        Ok(Some(OfflineEntry::Header { version })) if version == OFFLINE_FILE_VERSION => Ok(()),
        Ok(Some(OfflineEntry::Header { version })) => Err(ConvertError::VersionMismatch {
            expect: OFFLINE_FILE_VERSION,
            got: version,
        }),
        Ok(_) | Err(LogError::Entry(_)) => Err(ConvertError::MissingVersion),
        Err(LogError::Io(err)) => Err(ConvertError::UnreadableLog(err)),
    }
}

/// Consumes one memref entry for a memory operand and emits the matching
/// canonical record.
fn append_memref<R: Read + Seek, W: Write>(
    reader: &mut LogReader<R>,
    writer: &mut TraceWriter<W>,
    desc: &InstrDesc,
    op_size: u16,
    write: bool,
) -> Result<(), ConvertError> {
    let entry = match reader.read_entry() {
        Ok(Some(entry)) => entry,
        Ok(None) => return Err(ConvertError::TraceEndsMidBlock),
        Err(err) => return Err(err.into()),
    };
    let (OfflineEntry::Memref { addr } | OfflineEntry::MemrefHigh { addr }) = entry else {
        // A predicated memref that did not fire; the entry belongs to
        // whatever comes next. With multiple predicated memrefs in one block
        // the instr and data streams may not be in the correct order here.
        log::trace!("Missing memref (next entry is {:?})", entry.kind());
        reader.put_back().map_err(ConvertError::Read)?;
        return Ok(());
    };
    let record = if let Some(kind) = desc.prefetch {
        TraceRecord {
            kind: kind.trace_type(),
            size: 1,
            addr,
        }
    } else if desc.is_flush {
        TraceRecord {
            kind: TraceType::DataFlush,
            size: op_size,
            addr,
        }
    } else {
        TraceRecord {
            kind: if write {
                TraceType::Write
            } else {
                TraceType::Read
            },
            size: op_size,
            addr,
        }
    };
    log::trace!("Appended memref to {:#x}", addr);
    writer.write(&record).map_err(ConvertError::Write)
}
