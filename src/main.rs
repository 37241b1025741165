//! machkit - Inspect and rewrite kernel extension Mach-O images.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use memmap2::Mmap;
use rayon::prelude::*;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use machkit::macho::{
    cpu_type_from_name, cpu_type_name, Bitness, HeaderRecord, MachWidth, Macho32, Macho64,
    SectionRecord, SegmentRecord, VmProt, CPU_TYPE_X86, CPU_TYPE_X86_64, MH_EXECUTE, MH_FILESET,
    MH_KEXT_BUNDLE, MH_OBJECT,
};
use machkit::{detect_bitness, fat_architectures, MachoContext};

/// Inspect and rewrite kernel extension Mach-O images.
#[derive(Parser, Debug)]
#[command(name = "machkit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    #[arg(short, long, default_value = "1", global = true)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show header, segments, sections and image-wide properties
    Info {
        /// Architecture to use in a fat archive ("i386" or "x86_64")
        #[arg(short, long)]
        arch: Option<String>,

        /// Path to the Mach-O or fat file
        file: PathBuf,
    },

    /// List the architectures of a fat archive
    Arches {
        /// Path to the Mach-O or fat file
        file: PathBuf,
    },

    /// List symbols
    Symbols {
        /// Architecture to use in a fat archive ("i386" or "x86_64")
        #[arg(short, long)]
        arch: Option<String>,

        /// Only show locally-defined symbols
        #[arg(short, long)]
        local: bool,

        /// Filter symbols by substring match
        #[arg(short, long)]
        filter: Option<String>,

        /// Path to the Mach-O or fat file
        file: PathBuf,
    },

    /// Expand images into their virtual-memory layout
    Expand {
        /// Architecture to use in a fat archive ("i386" or "x86_64")
        #[arg(short, long)]
        arch: Option<String>,

        /// Remove load commands a loaded image does not need
        #[arg(short, long)]
        strip: bool,

        /// Output path (file for a single input, directory for multiple)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of parallel jobs (default: number of CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Paths to the Mach-O or fat files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Merge adjacent segments sharing a name prefix into one
    Merge {
        /// Segment name prefix (e.g., "__KLD")
        #[arg(short, long)]
        prefix: String,

        /// Architecture to use in a fat archive ("i386" or "x86_64")
        #[arg(short, long)]
        arch: Option<String>,

        /// Output path (default: rewrite the input)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Path to the Mach-O or fat file
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbosity);

    match cli.command {
        Commands::Info { arch, file } => cmd_info(&file, arch.as_deref()),
        Commands::Arches { file } => cmd_arches(&file),
        Commands::Symbols {
            arch,
            local,
            filter,
            file,
        } => cmd_symbols(&file, arch.as_deref(), local, filter.as_deref()),
        Commands::Expand {
            arch,
            strip,
            output,
            jobs,
            files,
        } => cmd_expand(files, arch.as_deref(), strip, output, jobs),
        Commands::Merge {
            prefix,
            arch,
            output,
            file,
        } => cmd_merge(&file, arch.as_deref(), &prefix, output),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Memory-maps a file read-only.
fn map_file(path: &Path) -> Result<Mmap> {
    let file =
        File::open(path).with_context(|| format!("Failed to open: {}", path.display()))?;
    // SAFETY: the mapping is read-only and lives no longer than this process's
    // use of the file.
    unsafe { Mmap::map(&file) }.with_context(|| format!("Failed to map: {}", path.display()))
}

/// Chooses the record width from `--arch`, or from the file itself.
fn resolve_bitness(data: &[u8], arch: Option<&str>) -> Result<Bitness> {
    let Some(name) = arch else {
        return Ok(detect_bitness(data)?);
    };
    match cpu_type_from_name(name) {
        Some(CPU_TYPE_X86) => Ok(Bitness::Narrow),
        Some(CPU_TYPE_X86_64) => Ok(Bitness::Wide),
        _ => bail!("Unsupported architecture '{}'. Available: i386, x86_64", name),
    }
}

fn file_type_name(filetype: u32) -> &'static str {
    match filetype {
        MH_OBJECT => "object",
        MH_EXECUTE => "executable",
        MH_KEXT_BUNDLE => "kext bundle",
        MH_FILESET => "fileset",
        _ => "unknown",
    }
}

fn cmd_info(path: &Path, arch: Option<&str>) -> Result<()> {
    let mmap = map_file(path)?;
    match resolve_bitness(&mmap, arch)? {
        Bitness::Narrow => print_info::<Macho32>(path, &mmap),
        Bitness::Wide => print_info::<Macho64>(path, &mmap),
    }
}

fn print_info<W: MachWidth>(path: &Path, data: &[u8]) -> Result<()> {
    let ctx = MachoContext::<W, _>::new(data, 0)
        .with_context(|| format!("Not a valid Mach-O: {}", path.display()))?;
    let header = ctx.header();

    println!("Mach-O Information");
    println!("==================");
    println!("Path:         {}", path.display());
    println!("Architecture: {}", cpu_type_name(header.cputype()));
    println!("File type:    {}", file_type_name(header.filetype()));
    println!("Slice:        {:#x} ({})", ctx.slice_offset(), format_size(ctx.file_size() as u64));
    println!("Commands:     {} ({} bytes)", header.ncmds(), header.sizeofcmds());
    if let Some(uuid) = ctx.uuid() {
        println!("UUID:         {}", format_uuid(&uuid));
    }
    if let Some(entry) = ctx.entry_address() {
        println!("Entry:        {:#x}", entry);
    }
    println!("Last address: {:#x}", ctx.last_address());
    match ctx.vm_size() {
        Some(size) => println!("VM size:      {:#x}", size),
        None => println!("VM size:      (overflows 32 bits)"),
    }
    match ctx.expanded_size() {
        Ok(size) => println!("Expanded:     {:#x}", size),
        Err(e) => println!("Expanded:     (cannot expand: {})", e),
    }

    println!("\nSegments:");
    for (i, segment) in ctx.segments().enumerate() {
        let cmd = &segment.command;
        println!(
            "  [{:2}] {:<16} {:#018x} - {:#018x} file {:#010x} ({:>8}) {}",
            i,
            segment.name(),
            cmd.vmaddr(),
            cmd.vmaddr().saturating_add(cmd.vmsize()),
            cmd.fileoff(),
            format_size(cmd.filesize()),
            VmProt::from_bits_truncate(cmd.initprot()).to_rwx(),
        );
        for section in ctx.sections(&segment) {
            let record = &section.record;
            println!(
                "         {:<16} {:#018x} ({:>8}) offset {:#010x} align 2^{}",
                section.name(),
                record.addr(),
                format_size(record.size()),
                record.offset(),
                record.align(),
            );
        }
    }

    if let Ok(tables) = ctx.symbol_tables() {
        println!("\nSymbols:      {}", tables.symbol_count());
        println!("Strings:      {} bytes", tables.string_size());
        println!("Indirect:     {}", tables.indirect_count());
    }

    Ok(())
}

fn cmd_arches(path: &Path) -> Result<()> {
    let mmap = map_file(path)?;
    let arches = fat_architectures(&mmap)
        .with_context(|| format!("Invalid fat archive: {}", path.display()))?;

    if arches.is_empty() {
        let bitness = detect_bitness(&mmap)
            .with_context(|| format!("Not a valid Mach-O: {}", path.display()))?;
        println!("Thin image ({:?}, {}-byte words)", bitness, bitness.word_size());
        return Ok(());
    }

    println!("Architectures in {}:", path.display());
    for arch in &arches {
        println!(
            "  {:<8} offset {:#010x} size {:>8} align 2^{}",
            cpu_type_name(arch.cputype),
            arch.offset,
            format_size(arch.size.into()),
            arch.align
        );
    }

    Ok(())
}

fn cmd_symbols(path: &Path, arch: Option<&str>, local: bool, filter: Option<&str>) -> Result<()> {
    let mmap = map_file(path)?;
    match resolve_bitness(&mmap, arch)? {
        Bitness::Narrow => print_symbols::<Macho32>(path, &mmap, local, filter),
        Bitness::Wide => print_symbols::<Macho64>(path, &mmap, local, filter),
    }
}

fn print_symbols<W: MachWidth>(
    path: &Path,
    data: &[u8],
    local: bool,
    filter: Option<&str>,
) -> Result<()> {
    let ctx = MachoContext::<W, _>::new(data, 0)
        .with_context(|| format!("Not a valid Mach-O: {}", path.display()))?;
    let table = ctx
        .symbol_table()
        .with_context(|| format!("Failed to load symbols: {}", path.display()))?;

    let width = W::WORD_SIZE * 2;
    for symbol in table.iter() {
        if symbol.is_stab() || (local && !ctx.is_local_defined(&symbol)) {
            continue;
        }
        let Some(name) = ctx.symbol_name(&symbol) else {
            warn!("Symbol {:?} has an invalid name", symbol.slot);
            continue;
        };
        if filter.is_some_and(|f| !name.contains(f)) {
            continue;
        }

        let kind = if !symbol.is_defined() {
            'U'
        } else if symbol.is_external() {
            'T'
        } else {
            't'
        };
        if symbol.is_defined() {
            println!("{:0width$x} {} {}", symbol.value, kind, name);
        } else {
            println!("{:>width$} {} {}", "", kind, name);
        }
    }

    Ok(())
}

/// Default output name for an expanded image.
fn expanded_name(input: &Path) -> PathBuf {
    let mut name = input.file_name().unwrap_or_default().to_os_string();
    name.push(".expanded");
    PathBuf::from(name)
}

fn expand_file(input: &Path, output: &Path, arch: Option<&str>, strip: bool) -> Result<usize> {
    let mmap = map_file(input)?;
    let expanded = match resolve_bitness(&mmap, arch)? {
        Bitness::Narrow => MachoContext::<Macho32, _>::new(&mmap[..], 0)?.expand_to_vec(strip)?,
        Bitness::Wide => MachoContext::<Macho64, _>::new(&mmap[..], 0)?.expand_to_vec(strip)?,
    };

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(output, &expanded)
        .with_context(|| format!("Failed to write: {}", output.display()))?;
    Ok(expanded.len())
}

fn cmd_expand(
    files: Vec<PathBuf>,
    arch: Option<&str>,
    strip: bool,
    output: Option<PathBuf>,
    jobs: Option<usize>,
) -> Result<()> {
    let start = Instant::now();

    // Single file expansion
    if let [input] = files.as_slice() {
        let output_path = output.unwrap_or_else(|| expanded_name(input));
        info!("Expanding {} to {}", input.display(), output_path.display());

        let size = expand_file(input, &output_path, arch, strip)
            .with_context(|| format!("Failed to expand: {}", input.display()))?;

        info!(
            "Expanded {} ({}) in {:.2}s",
            input.display(),
            format_size(size as u64),
            start.elapsed().as_secs_f64()
        );
        return Ok(());
    }

    // Multiple file expansion
    let output_dir = output.unwrap_or_else(|| PathBuf::from("expanded"));
    info!("Expanding {} files to {}", files.len(), output_dir.display());

    let progress = ProgressBar::new(files.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )?
            .progress_chars("#>-"),
    );

    if let Some(n) = jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
            .ok();
    }

    let errors: Vec<_> = files
        .par_iter()
        .filter_map(|input| {
            let output_path = output_dir.join(expanded_name(input));
            let result = expand_file(input, &output_path, arch, strip);
            progress.inc(1);
            result.err().map(|e| (input.clone(), e))
        })
        .collect();

    progress.finish_with_message("Done");

    if !errors.is_empty() {
        warn!("{} files failed to expand:", errors.len());
        for (path, err) in &errors {
            error!("  {}: {:#}", path.display(), err);
        }
    }

    info!(
        "Expanded {}/{} files in {:.2}s",
        files.len() - errors.len(),
        files.len(),
        start.elapsed().as_secs_f64()
    );

    Ok(())
}

fn cmd_merge(path: &Path, arch: Option<&str>, prefix: &str, output: Option<PathBuf>) -> Result<()> {
    let mut data = fs::read(path).with_context(|| format!("Failed to read: {}", path.display()))?;

    match resolve_bitness(&data, arch)? {
        Bitness::Narrow => MachoContext::<Macho32, _>::new(&mut data[..], 0)?.merge_by_prefix(prefix)?,
        Bitness::Wide => MachoContext::<Macho64, _>::new(&mut data[..], 0)?.merge_by_prefix(prefix)?,
    }

    let output_path = output.unwrap_or_else(|| path.to_path_buf());
    fs::write(&output_path, &data)
        .with_context(|| format!("Failed to write: {}", output_path.display()))?;
    info!("Merged {} segments into {}", prefix, output_path.display());

    Ok(())
}

fn format_uuid(uuid: &[u8; 16]) -> String {
    let hex: String = uuid.iter().map(|b| format!("{:02X}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn format_size(size: u64) -> String {
    if size >= 1024 * 1024 * 1024 {
        format!("{:.1}G", size as f64 / 1024.0 / 1024.0 / 1024.0)
    } else if size >= 1024 * 1024 {
        format!("{:.1}M", size as f64 / 1024.0 / 1024.0)
    } else if size >= 1024 {
        format!("{:.1}K", size as f64 / 1024.0)
    } else {
        format!("{}B", size)
    }
}
