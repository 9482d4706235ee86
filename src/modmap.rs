//! Module table: parses the module-map sidecar and resolves module bytes.
//!
//! The tracer writes one sidecar per run describing every executable image
//! that was loaded. The converter parses it into an ordered list of module
//! records and, for each record, resolves the bytes to decode from: embedded
//! sidecar contents, a read-only file mapping, or the mapping of an earlier
//! split-segment sibling.
//!
//! # Sidecar format
//!
//! A header line followed by one record per module:
//!
//! ```text
//! Module Table: version 1, count <N>
//! <index>, <containing_index>, <start>, <end>, <entry>, <custom>, <path>
//! ```
//!
//! `<custom>` is `v#1,<S>,` followed by exactly `S` raw bytes of embedded
//! module contents (used for anonymous regions such as a kernel-exported
//! helper page) and then an optional caller-defined opaque field consumed by
//! the [`CustomFieldHooks::parse`] hook. The embedded bytes may contain
//! commas and newlines, so records are parsed with a cursor rather than by
//! line. A record whose custom field does not carry the expected `v#` token
//! is handled through a legacy fallback: the parse hook alone, then a path
//! prefix heuristic (`/` or the literal `[vdso]`). Mixing legacy and current
//! records in one sidecar is rejected.

use memmap::Mmap;
use std::any::Any;
use std::fs::File;
use std::io;
use std::str;

/// Version of the sidecar table header this parser understands.
pub const MODULE_TABLE_VERSION: u32 = 1;

/// Version of the per-record custom field.
pub const CUSTOM_FIELD_VERSION: u32 = 1;

/// Substring identifying the instrumentation runtime's own images. These are
/// mapped at fixed addresses in the traced run and are expected to fail to
/// map here; the failure is not fatal.
pub const RUNTIME_IMAGE_IDENT: &str = "memtracer";

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Caller-supplied hooks for the sidecar's opaque custom field.
///
/// `parse` receives the unconsumed tail of a record and returns the number of
/// bytes it consumed plus the decoded payload; returning `None` fails the
/// record. `process` runs once per module after the whole table has been
/// parsed. The original interface carried a third `free` callback; here the
/// payload is released when the boxed value is dropped.
pub struct CustomFieldHooks {
    pub parse: fn(&[u8]) -> Option<(usize, Box<dyn Any>)>,
    pub process: fn(&ModuleInfo<'_>, &dyn Any) -> Result<(), BoxError>,
}

/// One parsed sidecar record, before image resolution.
pub struct ModuleInfo<'m> {
    pub index: u32,
    pub containing_index: u32,
    pub start: u64,
    pub end: u64,
    pub entry: u64,
    pub path: String,
    /// Embedded module contents, borrowed from the sidecar buffer.
    pub contents: Option<&'m [u8]>,
    /// Payload produced by the custom-field parse hook.
    pub custom: Option<Box<dyn Any>>,
}

impl std::fmt::Debug for ModuleInfo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInfo")
            .field("index", &self.index)
            .field("containing_index", &self.containing_index)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("entry", &self.entry)
            .field("path", &self.path)
            .field("contents", &self.contents)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

/// The parsed sidecar.
#[derive(Debug)]
pub struct ModuleMap<'m> {
    pub records: Vec<ModuleInfo<'m>>,
    /// False when the sidecar was recognized through the legacy fallback.
    pub has_custom_data: bool,
}

/// Where a module's bytes come from.
pub enum ModuleBytes<'m> {
    /// No bytes available; block expansions referencing this module are
    /// skipped without error.
    Unmapped,
    /// Contents embedded in the sidecar. Never unmapped.
    External(&'m [u8]),
    /// Read-only mapping of the on-disk image, unmapped on drop.
    Mapped(Mmap),
    /// Secondary split segment covered by the single mapping of its primary.
    Shared { primary: u32 },
}

/// One resolved module.
pub struct Module<'m> {
    pub path: String,
    /// Base address of the module in the traced run. For a secondary split
    /// segment this is the primary's (lowest) base, which is what PC-entry
    /// offsets are relative to.
    pub orig_base: u64,
    pub bytes: ModuleBytes<'m>,
}

impl Module<'_> {
    pub fn map_size(&self) -> usize {
        match &self.bytes {
            ModuleBytes::Unmapped | ModuleBytes::Shared { .. } => 0,
            ModuleBytes::External(b) => b.len(),
            ModuleBytes::Mapped(m) => m.len(),
        }
    }
}

/// Decode source for one basic block, handed to the block expander.
#[derive(Debug)]
pub struct BlockSource<'a> {
    /// Index of the module owning the bytes (the primary for split segments).
    /// Together with an offset this keys the decode cache.
    pub primary: u32,
    /// The full mapped image.
    pub bytes: &'a [u8],
    pub orig_base: u64,
    pub path: &'a str,
}

#[derive(thiserror::Error, Debug)]
pub enum ModMapError {
    #[error("Failed to parse module file: missing or malformed table header")]
    Header,

    #[error("Unsupported module table version {0}")]
    TableVersion(u32),

    #[error("Failed to parse module record {0}")]
    Record(u32),

    #[error("Unable to parse module data: custom field mismatch in record {0}")]
    CustomField(u32),

    #[error("module map mixes legacy and current records")]
    MixedFormats,

    #[error("module record {index} references invalid containing index {containing}")]
    BadContainingIndex { index: u32, containing: u32 },

    #[error("PC entry references unknown module index {0}")]
    BadIndex(u32),

    #[error("Failed to map module {path}")]
    MapFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("custom field processing failed for module {path}")]
    Process {
        path: String,
        #[source]
        source: BoxError,
    },
}

/// Byte cursor over the sidecar buffer.
struct Scanner<'m> {
    buf: &'m [u8],
    pos: usize,
}

impl<'m> Scanner<'m> {
    fn rest(&self) -> &'m [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    fn bump(&mut self, n: usize) {
        self.pos += n;
    }

    /// Consumes `token` if the input continues with it.
    fn accept(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token.as_bytes()) {
            self.bump(token.len());
            return true;
        }
        false
    }

    /// Consumes through the next `delim`, returning the bytes before it.
    fn take_until(&mut self, delim: u8) -> Option<&'m [u8]> {
        let rest = self.rest();
        let at = rest.iter().position(|&b| b == delim)?;
        self.bump(at + 1);
        Some(&rest[..at])
    }

    fn take(&mut self, n: usize) -> Option<&'m [u8]> {
        let rest = self.rest();
        if rest.len() < n {
            return None;
        }
        self.bump(n);
        Some(&rest[..n])
    }

    /// One `", "`-terminated numeric column (decimal or `0x` hex).
    fn number_field(&mut self) -> Option<u64> {
        let field = self.take_until(b',')?;
        self.accept(" ");
        let text = str::from_utf8(field).ok()?.trim();
        match text.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => text.parse().ok(),
        }
    }

    /// The path column: everything up to end of line (or end of buffer).
    fn path_field(&mut self) -> Option<&'m str> {
        let rest = self.rest();
        let at = rest
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(rest.len());
        self.bump(at + 1);
        str::from_utf8(&rest[..at]).ok()
    }
}

pub struct ModuleTable<'m> {
    modules: Vec<Module<'m>>,
}

impl<'m> ModuleMap<'m> {
    /// Parses the in-memory sidecar contents.
    pub fn parse(
        sidecar: &'m [u8],
        hooks: Option<&CustomFieldHooks>,
    ) -> Result<Self, ModMapError> {
        let mut scanner = Scanner {
            buf: sidecar,
            pos: 0,
        };
        let count = parse_table_header(&mut scanner)?;
        let mut records = Vec::with_capacity(count as usize);
        // Latched across the whole table; a sidecar cannot mix formats.
        let mut has_custom_data: Option<bool> = None;
        let mut warned_legacy = false;
        for i in 0..count {
            let record = parse_record(&mut scanner, i, hooks, &mut warned_legacy)?;
            let current = record.1;
            match has_custom_data {
                None => has_custom_data = Some(current),
                Some(mode) if mode != current => return Err(ModMapError::MixedFormats),
                Some(_) => {}
            }
            records.push(record.0);
        }
        log::debug!("Read {} modules from the module map", records.len());
        Ok(Self {
            records,
            has_custom_data: has_custom_data.unwrap_or(true),
        })
    }
}

fn parse_table_header(scanner: &mut Scanner) -> Result<u32, ModMapError> {
    let line = scanner.take_until(b'\n').ok_or(ModMapError::Header)?;
    let line = str::from_utf8(line).map_err(|_| ModMapError::Header)?;
    let rest = line
        .strip_prefix("Module Table: version ")
        .ok_or(ModMapError::Header)?;
    let (version, count) = rest.split_once(", count ").ok_or(ModMapError::Header)?;
    let version: u32 = version.trim().parse().map_err(|_| ModMapError::Header)?;
    if version != MODULE_TABLE_VERSION {
        return Err(ModMapError::TableVersion(version));
    }
    count.trim().parse().map_err(|_| ModMapError::Header)
}

/// Parses one record; the second tuple field is false when the record was
/// recognized through the legacy fallback.
fn parse_record<'m>(
    scanner: &mut Scanner<'m>,
    index: u32,
    hooks: Option<&CustomFieldHooks>,
    warned_legacy: &mut bool,
) -> Result<(ModuleInfo<'m>, bool), ModMapError> {
    let err = || ModMapError::Record(index);
    let idx = scanner.number_field().ok_or_else(err)? as u32;
    if idx != index {
        return Err(err());
    }
    let containing_index = scanner.number_field().ok_or_else(err)? as u32;
    let start = scanner.number_field().ok_or_else(err)?;
    let end = scanner.number_field().ok_or_else(err)?;
    let entry = scanner.number_field().ok_or_else(err)?;

    let mut contents = None;
    let mut custom = None;
    let current = match peek_custom_version(scanner) {
        Some((CUSTOM_FIELD_VERSION, token_len)) => {
            scanner.bump(token_len);
            let size = scanner.number_field().ok_or_else(err)? as usize;
            if size > 0 {
                contents = Some(scanner.take(size).ok_or_else(err)?);
            }
            if let Some(hooks) = hooks {
                let (used, data) =
                    (hooks.parse)(scanner.rest()).ok_or(ModMapError::CustomField(index))?;
                scanner.bump(used);
                custom = Some(data);
            }
            scanner.accept(", ");
            true
        }
        _ => {
            if !*warned_legacy {
                log::warn!(
                    "Incorrect module field version: attempting to handle legacy format"
                );
                *warned_legacy = true;
            }
            let parsed_by_hook = hooks.and_then(|hooks| (hooks.parse)(scanner.rest()));
            match parsed_by_hook {
                Some((used, data)) => {
                    // Legacy format with a user field but none of our own.
                    scanner.bump(used);
                    custom = Some(data);
                    scanner.accept(", ");
                }
                None => {
                    // Legacy format with no custom column at all: the path
                    // must come next.
                    let rest = scanner.rest();
                    if !(rest.starts_with(b"/") || rest.starts_with(b"[vdso]")) {
                        return Err(ModMapError::CustomField(index));
                    }
                }
            }
            false
        }
    };

    let path = scanner.path_field().ok_or_else(err)?.to_owned();
    Ok((
        ModuleInfo {
            index,
            containing_index,
            start,
            end,
            entry,
            path,
            contents,
            custom,
        },
        current,
    ))
}

/// Reads a leading `v#<N>,` token without consuming it, returning the version
/// and the token length. The caller consumes the token only on a version
/// match so that the legacy fallback sees the record from the start of the
/// custom column.
fn peek_custom_version(scanner: &Scanner) -> Option<(u32, usize)> {
    let rest = scanner.rest();
    if !rest.starts_with(b"v#") {
        return None;
    }
    let comma = rest.iter().take(16).position(|&b| b == b',')?;
    let version = str::from_utf8(&rest[2..comma]).ok()?.parse().ok()?;
    Some((version, comma + 1))
}

impl<'m> ModuleTable<'m> {
    /// Parses the sidecar, runs the process hook, and resolves every module's
    /// bytes. Mappings established here live until the table is dropped.
    pub fn load(
        sidecar: &'m [u8],
        hooks: Option<&CustomFieldHooks>,
    ) -> Result<Self, ModMapError> {
        let map = ModuleMap::parse(sidecar, hooks)?;
        if let Some(hooks) = hooks {
            for info in &map.records {
                if let Some(custom) = info.custom.as_deref() {
                    (hooks.process)(info, custom).map_err(|source| ModMapError::Process {
                        path: info.path.clone(),
                        source,
                    })?;
                }
            }
        }

        let mut modules: Vec<Module<'m>> = Vec::with_capacity(map.records.len());
        for info in map.records {
            if let Some(contents) = info.contents {
                log::debug!(
                    "Using module {} {} stored {}-byte contents",
                    modules.len(),
                    info.path,
                    contents.len()
                );
                modules.push(Module {
                    path: info.path,
                    orig_base: info.start,
                    bytes: ModuleBytes::External(contents),
                });
            } else if info.path == "<unknown>"
                || (!map.has_custom_data && info.path == "[vdso]")
            {
                // Nothing to decode from; expansions referencing this module
                // are skipped one block at a time.
                modules.push(Module {
                    path: info.path,
                    orig_base: info.start,
                    bytes: ModuleBytes::Unmapped,
                });
            } else if info.containing_index != info.index {
                let primary = info.containing_index;
                let Some(owner) = modules.get(primary as usize) else {
                    return Err(ModMapError::BadContainingIndex {
                        index: info.index,
                        containing: primary,
                    });
                };
                // The single mapping of the first segment covers this one;
                // offsets are relative to the lowest base, not this segment's.
                log::debug!(
                    "Separate segment assumed covered: module {} seg {:#x} = {}",
                    modules.len(),
                    info.start,
                    info.path
                );
                modules.push(Module {
                    path: info.path,
                    orig_base: owner.orig_base,
                    bytes: ModuleBytes::Shared { primary },
                });
            } else {
                match map_image(&info.path) {
                    Ok(mapping) => {
                        log::debug!(
                            "Mapped module {} ({} bytes) = {}",
                            modules.len(),
                            mapping.len(),
                            info.path
                        );
                        modules.push(Module {
                            path: info.path,
                            orig_base: info.start,
                            bytes: ModuleBytes::Mapped(mapping),
                        });
                    }
                    Err(source) => {
                        // The runtime's own images are mapped at fixed
                        // addresses and are expected to be unmappable here.
                        if info.path.contains(RUNTIME_IMAGE_IDENT) {
                            log::warn!("Failed to map runtime module {}", info.path);
                            modules.push(Module {
                                path: info.path,
                                orig_base: info.start,
                                bytes: ModuleBytes::Unmapped,
                            });
                        } else {
                            return Err(ModMapError::MapFailed {
                                path: info.path,
                                source,
                            });
                        }
                    }
                }
            }
        }
        log::debug!("Successfully resolved {} modules", modules.len());
        Ok(Self { modules })
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn module(&self, index: u32) -> Option<&Module<'m>> {
        self.modules.get(index as usize)
    }

    /// Resolves a PC entry's module index to a decode source, following
    /// split-segment sharing. `Ok(None)` means the module has no bytes and
    /// the block must be skipped.
    pub fn resolve(&self, modidx: u32) -> Result<Option<BlockSource<'_>>, ModMapError> {
        let module = self
            .modules
            .get(modidx as usize)
            .ok_or(ModMapError::BadIndex(modidx))?;
        let (primary, bytes) = match &module.bytes {
            ModuleBytes::Unmapped => return Ok(None),
            ModuleBytes::External(bytes) => (modidx, *bytes),
            ModuleBytes::Mapped(mapping) => (modidx, &mapping[..]),
            ModuleBytes::Shared { primary } => {
                let owner = self
                    .modules
                    .get(*primary as usize)
                    .ok_or(ModMapError::BadIndex(*primary))?;
                match &owner.bytes {
                    ModuleBytes::External(bytes) => (*primary, *bytes),
                    ModuleBytes::Mapped(mapping) => (*primary, &mapping[..]),
                    _ => return Ok(None),
                }
            }
        };
        Ok(Some(BlockSource {
            primary,
            bytes,
            orig_base: module.orig_base,
            path: &module.path,
        }))
    }
}

fn map_image(path: &str) -> io::Result<Mmap> {
    let file = File::open(path)?;
    // Read-only: the converter only decodes from the image, the writable
    // sections are never needed.
    unsafe { Mmap::map(&file) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(records: &[&[u8]]) -> Vec<u8> {
        let mut out = format!("Module Table: version 1, count {}\n", records.len()).into_bytes();
        for record in records {
            out.extend_from_slice(record);
            out.push(b'\n');
        }
        out
    }

    #[test]
    fn parses_current_format_with_embedded_bytes() {
        let mut row = b"0, 0, 0x7000, 0x7004, 0x0, v#1,4,".to_vec();
        row.extend_from_slice(&[0x90, 0x90, 0x0f, 0x05]);
        row.extend_from_slice(b", [vdso]");
        let sidecar = table(&[&row]);
        let map = ModuleMap::parse(&sidecar, None).unwrap();
        assert!(map.has_custom_data);
        assert_eq!(map.records.len(), 1);
        let info = &map.records[0];
        assert_eq!(info.path, "[vdso]");
        assert_eq!(info.start, 0x7000);
        assert_eq!(info.contents, Some(&[0x90u8, 0x90, 0x0f, 0x05][..]));
    }

    #[test]
    fn legacy_record_falls_back_to_path_heuristic() {
        let sidecar = table(&[b"0, 0, 0x400000, 0x401000, 0x400100, /usr/lib/libc.so"]);
        let map = ModuleMap::parse(&sidecar, None).unwrap();
        assert!(!map.has_custom_data);
        assert_eq!(map.records[0].path, "/usr/lib/libc.so");
        assert!(map.records[0].contents.is_none());
    }

    #[test]
    fn mixed_sidecar_is_rejected() {
        let sidecar = table(&[
            b"0, 0, 0x400000, 0x401000, 0x0, v#1,0,, /usr/lib/libc.so",
            b"1, 1, 0x500000, 0x501000, 0x0, /usr/lib/libm.so",
        ]);
        let err = ModuleMap::parse(&sidecar, None).unwrap_err();
        assert!(matches!(err, ModMapError::MixedFormats));
    }

    #[test]
    fn unrecognized_custom_field_is_rejected() {
        let sidecar = table(&[b"0, 0, 0x400000, 0x401000, 0x0, garbage, libc.so"]);
        let err = ModuleMap::parse(&sidecar, None).unwrap_err();
        assert!(matches!(err, ModMapError::CustomField(0)));
    }

    #[test]
    fn table_version_mismatch_is_fatal() {
        let sidecar = b"Module Table: version 9, count 0\n";
        let err = ModuleMap::parse(sidecar, None).unwrap_err();
        assert!(matches!(err, ModMapError::TableVersion(9)));
    }

    #[test]
    fn custom_field_hooks_consume_the_opaque_field() {
        fn parse(rest: &[u8]) -> Option<(usize, Box<dyn Any>)> {
            let len = rest.iter().position(|&b| b == b'!')?;
            let text = str::from_utf8(&rest[..len]).ok()?.to_owned();
            Some((len + 1, Box::new(text)))
        }
        fn process(info: &ModuleInfo<'_>, data: &dyn Any) -> Result<(), super::BoxError> {
            let text = data.downcast_ref::<String>().ok_or("wrong payload")?;
            if text != "opaque" || info.index != 0 {
                return Err("unexpected custom field".into());
            }
            Ok(())
        }
        let hooks = CustomFieldHooks { parse, process };
        let sidecar = table(&[b"0, 0, 0x400000, 0x401000, 0x0, v#1,0,opaque!, /usr/lib/libc.so"]);
        let map = ModuleMap::parse(&sidecar, Some(&hooks)).unwrap();
        let custom = map.records[0].custom.as_deref().unwrap();
        assert_eq!(custom.downcast_ref::<String>().unwrap(), "opaque");
        (hooks.process)(&map.records[0], custom).unwrap();
    }

    #[test]
    fn split_segment_shares_the_primary_mapping() {
        let mut rows = Vec::new();
        let mut row = b"0, 0, 0x400000, 0x400004, 0x0, v#1,4,".to_vec();
        row.extend_from_slice(&[0xc3, 0x90, 0x90, 0x90]);
        row.extend_from_slice(b", /usr/lib/libsplit.so");
        rows.push(row);
        rows.push(b"1, 0, 0x600000, 0x600fff, 0x0, v#1,0,, /usr/lib/libsplit.so".to_vec());
        let rows: Vec<&[u8]> = rows.iter().map(|r| r.as_slice()).collect();
        let sidecar = table(&rows);
        let modtable = ModuleTable::load(&sidecar, None).unwrap();
        assert_eq!(modtable.len(), 2);
        let source = modtable.resolve(1).unwrap().unwrap();
        assert_eq!(source.primary, 0);
        assert_eq!(source.orig_base, 0x400000);
        assert_eq!(source.bytes[0], 0xc3);
        assert_eq!(modtable.module(1).unwrap().map_size(), 0);
    }

    #[test]
    fn unknown_module_resolves_to_none() {
        let sidecar = table(&[b"0, 0, 0x500000, 0x501000, 0x0, v#1,0,, <unknown>"]);
        let modtable = ModuleTable::load(&sidecar, None).unwrap();
        assert!(modtable.resolve(0).unwrap().is_none());
        assert!(matches!(
            modtable.resolve(7).unwrap_err(),
            ModMapError::BadIndex(7)
        ));
    }
}
