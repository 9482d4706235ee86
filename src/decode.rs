//! Instruction decoding and the address-keyed decode cache.
//!
//! Hot instructions are decoded once and the resulting descriptor is reused
//! for every subsequent dynamic execution. Descriptors are keyed by
//! `(module, offset)` so that split segments sharing one mapping also share
//! cache entries. The cache grows monotonically and is freed when the
//! converter is dropped.

use crate::record::TraceType;
use capstone::arch::x86::{X86Insn, X86Operand, X86OperandType};
use capstone::arch::{self, ArchOperand, BuildsCapstone};
use capstone::{Capstone, Insn, RegAccessType};
use hashbrown::HashMap;

/// Initial bucket allocation; sized generously for lookup-heavy workloads.
const CACHE_CAPACITY: usize = 1 << 16;

/// Longest possible x86 instruction encoding.
const MAX_INSTR_BYTES: usize = 16;

/// Instruction-set mode the decoder starts in. The default follows the host
/// architecture; a 32-bit postprocessor is required for 32-bit applications.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IsaMode {
    X86_64,
    X86_32,
}

impl Default for IsaMode {
    fn default() -> Self {
        if cfg!(target_arch = "x86") {
            Self::X86_32
        } else {
            Self::X86_64
        }
    }
}

/// Opcode class of an instruction, which selects the instruction-fetch
/// record type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InstrClass {
    Other,
    DirectJump,
    IndirectJump,
    ConditionalJump,
    DirectCall,
    IndirectCall,
    Return,
}

impl InstrClass {
    pub fn trace_type(self) -> TraceType {
        match self {
            Self::Other => TraceType::Instr,
            Self::DirectJump => TraceType::InstrDirectJump,
            Self::IndirectJump => TraceType::InstrIndirectJump,
            Self::ConditionalJump => TraceType::InstrConditionalJump,
            Self::DirectCall => TraceType::InstrDirectCall,
            Self::IndirectCall => TraceType::InstrIndirectCall,
            Self::Return => TraceType::InstrReturn,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PrefetchKind {
    T0,
    T1,
    T2,
    Nta,
    Plain,
}

impl PrefetchKind {
    pub fn trace_type(self) -> TraceType {
        match self {
            Self::T0 => TraceType::PrefetchT0,
            Self::T1 => TraceType::PrefetchT1,
            Self::T2 => TraceType::PrefetchT2,
            Self::Nta => TraceType::PrefetchNta,
            Self::Plain => TraceType::Prefetch,
        }
    }
}

/// Everything the block expander needs to know about one decoded instruction.
#[derive(Debug, Clone)]
pub struct InstrDesc {
    pub length: u8,
    pub class: InstrClass,
    pub is_cti: bool,
    /// A `rep`/`repne`-prefixed string instruction (ins/outs/movs/stos/lods/
    /// cmps/scas). The tracer expands these into per-iteration entries that
    /// the converter collapses back into one fetch.
    pub rep_string: bool,
    pub prefetch: Option<PrefetchKind>,
    pub is_flush: bool,
    /// Widths in bytes of the source memory operands, in operand order.
    pub src_sizes: Vec<u16>,
    /// Widths in bytes of the destination memory operands, in operand order.
    pub dst_sizes: Vec<u16>,
}

impl InstrDesc {
    /// True when the instruction actually touches memory. Address-only
    /// operands (`lea`, long-`nop` filler) are already excluded.
    pub fn accesses_memory(&self) -> bool {
        !self.src_sizes.is_empty() || !self.dst_sizes.is_empty()
    }

    pub fn fetch_type(&self) -> TraceType {
        self.class.trace_type()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("failed to build the instruction decoder")]
    Backend(#[from] capstone::Error),
}

/// Address-keyed cache of decoded instruction descriptors.
pub struct DecodeCache {
    cs: Capstone,
    cache: HashMap<(u32, u64), InstrDesc>,
}

impl DecodeCache {
    pub fn new(isa: IsaMode) -> Result<Self, DecodeError> {
        let mode = match isa {
            IsaMode::X86_64 => arch::x86::ArchMode::Mode64,
            IsaMode::X86_32 => arch::x86::ArchMode::Mode32,
        };
        let cs = Capstone::new().x86().mode(mode).detail(true).build()?;
        Ok(Self {
            cs,
            cache: HashMap::with_capacity(CACHE_CAPACITY),
        })
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Returns the descriptor for the instruction at `key`, decoding the
    /// leading bytes of `window` on a miss. `None` is the distinguished
    /// undecodable result: the caller reports it and aborts the current
    /// basic block. Failed decodes are not cached.
    pub fn lookup_or_decode(
        &mut self,
        key: (u32, u64),
        window: &[u8],
        pc: u64,
    ) -> Option<&InstrDesc> {
        if !self.cache.contains_key(&key) {
            let desc = self.decode(window, pc)?;
            self.cache.insert(key, desc);
        }
        self.cache.get(&key)
    }

    fn decode(&self, window: &[u8], pc: u64) -> Option<InstrDesc> {
        let window = &window[..window.len().min(MAX_INSTR_BYTES)];
        let insns = self.cs.disasm_count(window, pc, 1).ok()?;
        let insn = insns.iter().next()?;
        self.classify(insn)
    }

    fn classify(&self, insn: &Insn) -> Option<InstrDesc> {
        let detail = self.cs.insn_detail(insn).ok()?;
        let groups: Vec<Option<String>> = detail
            .groups()
            .iter()
            .map(|id| self.cs.group_name(*id))
            .collect();
        let in_group = |name: &str| groups.iter().any(|g| g.as_deref() == Some(name));
        let has_jump = in_group("jump");
        let has_call = in_group("call");
        let has_ret = in_group("ret");

        let id = insn.id().0;
        let operands = detail.arch_detail().operands();
        let has_imm = operands.iter().any(|op| {
            matches!(
                op,
                ArchOperand::X86Operand(X86Operand {
                    op_type: X86OperandType::Imm(_),
                    ..
                })
            )
        });

        let class = if has_ret {
            InstrClass::Return
        } else if has_call {
            if has_imm {
                InstrClass::DirectCall
            } else {
                InstrClass::IndirectCall
            }
        } else if has_jump {
            if id == X86Insn::X86_INS_JMP as u32 || id == X86Insn::X86_INS_LJMP as u32 {
                if has_imm {
                    InstrClass::DirectJump
                } else {
                    InstrClass::IndirectJump
                }
            } else {
                InstrClass::ConditionalJump
            }
        } else {
            InstrClass::Other
        };

        let prefetch = prefetch_kind(id);
        let is_flush =
            id == X86Insn::X86_INS_CLFLUSH as u32 || id == X86Insn::X86_INS_CLFLUSHOPT as u32;
        let rep_string = is_rep_string(insn.mnemonic().unwrap_or(""));

        let mut src_sizes = Vec::new();
        let mut dst_sizes = Vec::new();
        // lea computes an address without touching it, and multi-byte nop
        // filler encodes a memory operand it never dereferences.
        let address_only =
            id == X86Insn::X86_INS_LEA as u32 || id == X86Insn::X86_INS_NOP as u32;
        if !address_only {
            for op in &operands {
                let ArchOperand::X86Operand(op) = op else {
                    continue;
                };
                if !matches!(op.op_type, X86OperandType::Mem(_)) {
                    continue;
                }
                let size = op.size as u16;
                match op.access {
                    Some(RegAccessType::ReadOnly) => src_sizes.push(size),
                    Some(RegAccessType::WriteOnly) => dst_sizes.push(size),
                    Some(RegAccessType::ReadWrite) => {
                        src_sizes.push(size);
                        dst_sizes.push(size);
                    }
                    // Some decoders leave prefetch/flush operands unmarked;
                    // they read their target line.
                    None if prefetch.is_some() || is_flush => src_sizes.push(size),
                    None => {}
                }
            }
        }

        Some(InstrDesc {
            length: insn.len() as u8,
            class,
            is_cti: has_jump || has_call || has_ret,
            rep_string,
            prefetch,
            is_flush,
            src_sizes,
            dst_sizes,
        })
    }
}

fn prefetch_kind(id: u32) -> Option<PrefetchKind> {
    if id == X86Insn::X86_INS_PREFETCHT0 as u32 {
        Some(PrefetchKind::T0)
    } else if id == X86Insn::X86_INS_PREFETCHT1 as u32 {
        Some(PrefetchKind::T1)
    } else if id == X86Insn::X86_INS_PREFETCHT2 as u32 {
        Some(PrefetchKind::T2)
    } else if id == X86Insn::X86_INS_PREFETCHNTA as u32 {
        Some(PrefetchKind::Nta)
    } else if id == X86Insn::X86_INS_PREFETCH as u32
        || id == X86Insn::X86_INS_PREFETCHW as u32
        || id == X86Insn::X86_INS_PREFETCHWT1 as u32
    {
        Some(PrefetchKind::Plain)
    } else {
        None
    }
}

/// The `rep`/`repne` string family: ins, outs, movs, stos, lods, cmps, scas.
/// Matching on the rendered mnemonic keeps SSE encodings that reuse the
/// `f2`/`f3` prefix bytes (e.g. `movsd xmm, m64`) out of the set.
fn is_rep_string(mnemonic: &str) -> bool {
    let mut parts = mnemonic.split_whitespace();
    let (Some(prefix), Some(op)) = (parts.next(), parts.next()) else {
        return false;
    };
    matches!(prefix, "rep" | "repe" | "repne")
        && ["ins", "outs", "movs", "stos", "lods", "cmps", "scas"]
            .iter()
            .any(|family| op.starts_with(family))
}
