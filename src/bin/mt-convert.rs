use anyhow::{Context, Result};
use clap::Parser;
use memtrace::{ConvertConfig, Converter};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;

/// Converts the raw per-thread logs captured by the tracer into the
/// canonical memory-access trace consumed by the simulators.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Tracer output directory (expects a raw/ subdirectory with the
    /// thread logs and the module map).
    #[arg(short, long)]
    indir: PathBuf,

    /// Verbosity level for stderr logging.
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    stderrlog::new().verbosity(args.verbose as usize).init()?;

    let rawdir = args.indir.join("raw");
    let module_map = fs::read(rawdir.join("modules.log"))
        .with_context(|| format!("failed to read module map in {}", rawdir.display()))?;

    let mut log_paths = Vec::new();
    for dirent in
        fs::read_dir(&rawdir).with_context(|| format!("failed to list {}", rawdir.display()))?
    {
        let path = dirent?.path();
        if path.extension().is_some_and(|ext| ext == "raw") {
            log_paths.push(path);
        }
    }
    log_paths.sort();
    anyhow::ensure!(
        !log_paths.is_empty(),
        "no .raw thread logs under {}",
        rawdir.display()
    );

    let mut thread_files = Vec::with_capacity(log_paths.len());
    for path in &log_paths {
        thread_files
            .push(File::open(path).with_context(|| format!("failed to open {}", path.display()))?);
    }

    let out_path = args.indir.join("memtrace.trace");
    let out_file = File::create(&out_path)
        .with_context(|| format!("failed to create {}", out_path.display()))?;
    let mut out = BufWriter::new(out_file);

    Converter::new(
        module_map.as_slice(),
        thread_files,
        &mut out,
        ConvertConfig::default(),
    )?
    .run()?;

    log::info!("wrote {}", out_path.display());
    Ok(())
}
