//! Offline raw-trace post-processor.
//!
//! A dynamic-instrumentation tracer writes one binary log per traced thread
//! plus a module-map sidecar describing every executable image loaded during
//! the run. This crate merges those logs into a single canonical memory-access
//! trace in global timestamp order, reconstructing instruction-fetch records
//! by disassembling the original program text out of the mapped images.
//!
//! The pieces:
//!
//! - [`modmap`] parses the sidecar and maps module images ([`modmap::ModuleTable`]).
//! - [`decode`] caches decoded instruction descriptors ([`decode::DecodeCache`]).
//! - [`entry`] is the on-disk format of the per-thread raw logs.
//! - [`record`] is the canonical output format consumed by the simulators.
//! - [`convert`] drives the whole thing ([`convert::Converter`]).
//!
//! The converter is single threaded; the first error encountered aborts the
//! run and is returned to the caller.

pub mod convert;
pub mod decode;
pub mod entry;
pub mod modmap;
pub mod record;

pub use convert::{ConvertConfig, ConvertError, Converter};
