//! j2kcs CLI - inspect JPEG 2000 codestreams and exercise rate control.

use clap::{Parser, Subcommand, ValueEnum};
use j2kcs_rs::{
    BlockEncoding, CodingParams, Codestream, CountingTarget, IoSource, IoTarget, ProgressionOrder,
    TilePartDivision,
};
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

/// JPEG 2000 codestream structure and rate control tool
#[derive(Parser)]
#[command(name = "j2kcs")]
#[command(version)]
#[command(about = "Inspect JPEG 2000 codestreams and simulate rate-controlled encoding", long_about = None)]
#[command(after_help = "EXAMPLES:
    j2kcs info -i image.j2k
    j2kcs simulate -w 512 -H 512 --layers 3 --targets 2000,8000,20000
    j2kcs -vv simulate -w 256 -H 256 -p rpcl --tile 128 --sop --eph -o out.j2k")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk a codestream's tile-part headers and packet structure
    #[command(visible_alias = "i")]
    Info {
        /// Input codestream (.j2k / .j2c)
        #[arg(short, long)]
        input: PathBuf,

        /// Parse with error resilience
        #[arg(long)]
        resilient: bool,
    },

    /// Build synthetic tiles, run rate control and report the result
    #[command(visible_alias = "s")]
    Simulate {
        #[arg(short, long, default_value = "256")]
        width: u32,

        #[arg(short = 'H', long, default_value = "256")]
        height: u32,

        #[arg(short = 'n', long, default_value = "1")]
        components: u16,

        /// Tile size (square); defaults to one tile
        #[arg(long)]
        tile: Option<u32>,

        #[arg(long, default_value = "5")]
        levels: u8,

        #[arg(long, default_value = "1")]
        layers: u16,

        /// Cumulative byte targets per layer, comma separated
        #[arg(long, value_delimiter = ',')]
        targets: Vec<u64>,

        #[arg(short, long, default_value = "lrcp", value_enum)]
        progression: Progression,

        #[arg(long)]
        sop: bool,

        #[arg(long)]
        eph: bool,

        /// Write PLT segments
        #[arg(long)]
        plt: bool,

        /// Start a new tile-part at every resolution
        #[arg(long)]
        split_resolutions: bool,

        /// Write the codestream here instead of only counting bytes
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Progression {
    Lrcp,
    Rlcp,
    Rpcl,
    Pcrl,
    Cprl,
}

impl From<Progression> for ProgressionOrder {
    fn from(p: Progression) -> Self {
        match p {
            Progression::Lrcp => Self::Lrcp,
            Progression::Rlcp => Self::Rlcp,
            Progression::Rpcl => Self::Rpcl,
            Progression::Pcrl => Self::Pcrl,
            Progression::Cprl => Self::Cprl,
        }
    }
}

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Info { input, resilient } => show_info(&input, resilient),
        Commands::Simulate {
            width,
            height,
            components,
            tile,
            levels,
            layers,
            targets,
            progression,
            sop,
            eph,
            plt,
            split_resolutions,
            output,
        } => {
            let mut params = CodingParams::new(width, height, components);
            if let Some(size) = tile {
                params.tile_width = size;
                params.tile_height = size;
            }
            params.style.levels = levels;
            params.num_layers = layers;
            params.progression = progression.into();
            params.use_sop = sop;
            params.use_eph = eph;
            params.write_plt = plt;
            if split_resolutions {
                params.tile_part_division = TilePartDivision::RESOLUTION;
            }
            simulate(params, &targets, output.as_ref())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn show_info(input: &PathBuf, resilient: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut source = IoSource::new(BufReader::new(File::open(input)?))?;
    let mut cs = Codestream::open_input(&mut source)?;
    {
        let p = cs.params();
        println!("File: {:?}", input);
        println!(
            "Image: {}x{} at ({}, {}), {} components",
            p.image_x1 - p.image_x0,
            p.image_y1 - p.image_y0,
            p.image_x0,
            p.image_y0,
            p.components.len()
        );
        let (across, down) = p.tile_grid();
        println!(
            "Tiles: {}x{} of {}x{} ({} total)",
            across,
            down,
            p.tile_width,
            p.tile_height,
            p.num_tiles()
        );
        println!(
            "Coding: {} levels, {} layers, {}, {}x{} blocks",
            p.style.levels,
            p.num_layers,
            p.progression.name(),
            1u32 << p.style.block_width_exponent,
            1u32 << p.style.block_height_exponent
        );
        println!("Main header: {} bytes", cs.header_bytes());
    }
    if resilient {
        // Resilience is a decoder-side choice, so it is not in the header.
        let mut params = cs.params().clone();
        params.resilient = true;
        let mut source = IoSource::new(BufReader::new(File::open(input)?))?;
        cs = Codestream::open_input_with_params(&mut source, params)?;
        return walk_tile_parts(&mut cs, &mut source);
    }
    walk_tile_parts(&mut cs, &mut source)
}

fn walk_tile_parts(
    cs: &mut Codestream,
    source: &mut dyn j2kcs_rs::CompressedSource,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut parts = 0usize;
    let mut packets = 0u64;
    while let Some(s) = cs.read_tile_part(source)? {
        let h = &s.header;
        println!(
            "  tile {:>5} part {:>3}{}: {:>9} bytes, {} packets{}{}",
            h.tile,
            h.part_index,
            if h.num_parts > 0 {
                format!("/{}", h.num_parts)
            } else {
                String::new()
            },
            h.length,
            s.read.parsed,
            if h.packet_lengths.is_some() { ", PLT" } else { "" },
            if s.read.recoveries > 0 {
                format!(", {} recoveries", s.read.recoveries)
            } else {
                String::new()
            }
        );
        parts += 1;
        packets += s.read.parsed as u64;
    }
    println!("Total: {parts} tile-parts, {packets} packets");
    for cause in cs.profile().relaxed_causes() {
        println!("Profile relaxed: {cause:?}");
    }
    Ok(())
}

/// Deterministic stand-in for a block coder: pass lengths grow with the block area and
/// slopes fall with pass index and resolution.
fn synthetic_block(area: i64, resolution: usize, seed: usize) -> Result<BlockEncoding, j2kcs_rs::J2kError> {
    let passes = 10usize;
    let per_pass = ((area / 64).max(1) as u32).min(400);
    let lengths: Vec<u32> = (1..=passes as u32).map(|p| p * per_pass).collect();
    let total = per_pass as usize * passes;
    let bytes = (0..total).map(|i| ((i * 31 + seed * 7) % 0xF0) as u8).collect();
    let base = 60000u32.saturating_sub(resolution as u32 * 1500);
    let slopes = (0..passes as u32)
        .map(|p| base.saturating_sub(p * 5000).max(1) as u16)
        .collect();
    BlockEncoding::new(bytes, lengths, slopes, 1)
}

fn simulate(
    params: CodingParams,
    targets: &[u64],
    output: Option<&PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let num_tiles = params.num_tiles();
    let mut cs = Codestream::create_output(params)?;
    if !targets.is_empty() {
        cs.set_max_bytes(targets)?;
    }
    let all: Vec<u32> = (0..num_tiles).collect();
    cs.for_each_tile_parallel(&all, |tile| {
        for c in 0..tile.num_components() {
            for r in 0..tile.component(c)?.num_resolutions() {
                let bands = tile.component(c)?.resolution(r)?.subbands.clone();
                for band in &bands {
                    for i in 0..band.block_indices.area() as usize {
                        let idx = band.block_indices.position_of(i);
                        let area = band.block_rect(idx).area();
                        tile.store_block(c, r, band.index, idx, synthetic_block(area, r, i)?)?;
                    }
                }
            }
        }
        tile.close();
        Ok(())
    })?;

    let (total, report) = match output {
        Some(path) => {
            let mut target = IoTarget::new(BufWriter::new(File::create(path)?), 0);
            let report = cs.flush(&mut target)?;
            let total = cs.finish(&mut target)?;
            target.into_inner()?;
            (total, report)
        }
        None => {
            let mut target = CountingTarget::new();
            let report = cs.flush(&mut target)?;
            (cs.finish(&mut target)?, report)
        }
    };

    println!("Tiles: {num_tiles}");
    println!("Main header: {} bytes", cs.header_bytes());
    for (l, (t, bytes)) in report
        .plan
        .thresholds
        .iter()
        .zip(&report.plan.layer_bytes)
        .enumerate()
    {
        let target = targets.get(l).map_or(String::from("-"), |t| t.to_string());
        println!("  layer {l}: threshold {t:>5}, {bytes:>9} bytes, target {target}");
    }
    println!("Tile-parts: {}", report.tile_parts.len());
    println!(
        "Packets: {}",
        report.tile_parts.iter().map(|tp| tp.packets as u64).sum::<u64>()
    );
    println!("Codestream: {total} bytes");
    Ok(())
}
