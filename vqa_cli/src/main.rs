use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use xxhash_rust::xxh3::xxh3_64;

use vqa_codecs::{Decoder, Raster, SKIP_AUDIO, SKIP_METADATA, SKIP_NONE};
use vqa_core::{Error, Reader};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "vqa",
    about = "Inspect, decode, and benchmark WVQA cutscene files",
    version
)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print header, loops, and descriptor tables
    Inspect {
        /// WVQA file to inspect
        file: PathBuf,
        /// Print the per-frame offset table
        #[arg(long)]
        frames: bool,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Decode every frame, printing an xxh3 digest of each raster
    Decode {
        /// WVQA file
        file: PathBuf,
        /// Decode only loop N
        #[arg(long = "loop", value_name = "N")]
        loop_index: Option<usize>,
        /// Write each frame as a PPM image into this directory
        #[arg(long, value_name = "DIR")]
        frames: Option<PathBuf>,
        /// Write decoded audio as raw 16-bit little-endian mono PCM
        #[arg(long, value_name = "OUT.pcm")]
        audio: Option<PathBuf>,
    },
    /// Decode up to one frame and save it as a PPM image
    ExtractFrame {
        /// WVQA file
        file: PathBuf,
        /// Zero-based frame index
        #[arg(short, long)]
        index: usize,
        /// Destination PPM file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Time a full decode of video and audio
    Bench {
        /// WVQA file
        file: PathBuf,
    },
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn open_decoder(path: &Path) -> anyhow::Result<Decoder<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("opening {:?}", path))?;
    Decoder::open(BufReader::new(file)).with_context(|| format!("reading WVQA container {:?}", path))
}

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

fn frame_digest(raster: &Raster) -> u64 {
    xxh3_64(&raster.to_le_bytes())
}

fn write_ppm(path: &Path, raster: &Raster) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating {:?}", path))?;
    let mut out = BufWriter::new(file);
    write!(out, "P6\n{} {}\n255\n", raster.width(), raster.height())?;
    out.write_all(&raster.to_rgb888())?;
    out.flush()?;
    Ok(())
}

fn write_pcm(out: &mut impl Write, samples: &[i16]) -> io::Result<()> {
    for s in samples {
        out.write_all(&s.to_le_bytes())?;
    }
    Ok(())
}

// ── inspect ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct InspectReport {
    file: String,
    size: u64,
    version: u16,
    frames: u16,
    width: u16,
    height: u16,
    block_width: u8,
    block_height: u8,
    frame_rate: u8,
    codebook_blocks: u16,
    codebook_parts: u8,
    offset: (u16, u16),
    max_vptr_size: u16,
    max_cbfz_size: u32,
    audio: Option<AudioReport>,
    loops: Vec<LoopReport>,
    codebook_info: Vec<CodebookReport>,
    limits: Vec<LimitReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame_offsets: Option<Vec<FrameReport>>,
}

#[derive(Serialize)]
struct AudioReport {
    rate: u16,
    channels: u8,
    bits: u8,
}

#[derive(Serialize)]
struct LoopReport {
    name: String,
    begin: u16,
    end: u16,
}

#[derive(Serialize)]
struct CodebookReport {
    frame: u16,
    size: u32,
}

#[derive(Serialize)]
struct LimitReport {
    tag: String,
    max: u32,
}

#[derive(Serialize)]
struct FrameReport {
    frame: usize,
    offset: u64,
    flags: u8,
}

fn build_report(file: &Path, show_frames: bool) -> anyhow::Result<InspectReport> {
    let f = File::open(file).with_context(|| format!("opening {:?}", file))?;
    let reader = Reader::open(BufReader::new(f))
        .with_context(|| format!("reading WVQA container {:?}", file))?;
    let h = reader.header();

    let frame_offsets = if show_frames {
        let index = reader.frame_index();
        let mut frames = Vec::with_capacity(index.len());
        for frame in 0..index.len() {
            frames.push(FrameReport {
                frame,
                offset: index.byte_offset(frame)?,
                flags: index.flags(frame)?,
            });
        }
        Some(frames)
    } else {
        None
    };

    Ok(InspectReport {
        file: file.display().to_string(),
        size: reader.stream_len(),
        version: h.version,
        frames: h.frame_count,
        width: h.width,
        height: h.height,
        block_width: h.block_w,
        block_height: h.block_h,
        frame_rate: h.frame_rate,
        codebook_blocks: h.max_blocks,
        codebook_parts: h.cb_parts,
        offset: (h.offset_x, h.offset_y),
        max_vptr_size: h.max_vptr_size,
        max_cbfz_size: h.max_cbfz_size,
        audio: h.has_audio().then(|| AudioReport {
            rate: h.freq,
            channels: h.channels,
            bits: h.bits,
        }),
        loops: reader
            .loops()
            .iter()
            .map(|l| LoopReport {
                name: l.name.clone(),
                begin: l.begin,
                end: l.end,
            })
            .collect(),
        codebook_info: reader
            .codebook_info()
            .iter()
            .map(|c| CodebookReport {
                frame: c.frame,
                size: c.size,
            })
            .collect(),
        limits: reader
            .limits()
            .sorted()
            .into_iter()
            .map(|(tag, max)| LimitReport {
                tag: tag.to_string(),
                max,
            })
            .collect(),
        frame_offsets,
    })
}

fn run_inspect(file: PathBuf, show_frames: bool, json: bool) -> anyhow::Result<()> {
    let report = build_report(&file, show_frames)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("=== WVQA File: {:?} ===", file);
    println!();
    println!("  version        : {}", report.version);
    println!("  file size      : {}", human_bytes(report.size));
    println!("  frames         : {} @ {} fps", report.frames, report.frame_rate);
    println!("  dimensions     : {}x{}", report.width, report.height);
    println!(
        "  blocks         : {}x{}, codebook of {} in {} parts",
        report.block_width, report.block_height, report.codebook_blocks, report.codebook_parts
    );
    println!("  image offset   : {}x{}", report.offset.0, report.offset.1);
    match &report.audio {
        Some(a) => println!("  audio          : {} Hz, {} ch, {} bit", a.rate, a.channels, a.bits),
        None => println!("  audio          : none"),
    }
    println!("  max VPTR       : {}", human_bytes(report.max_vptr_size as u64));
    println!("  max CBFZ       : {}", human_bytes(report.max_cbfz_size as u64));

    if !report.loops.is_empty() {
        println!();
        println!("  {:>4}  {:>6}  {:>6}  name", "loop", "begin", "end");
        for (i, l) in report.loops.iter().enumerate() {
            println!("  {:>4}  {:>6}  {:>6}  {}", i, l.begin, l.end, l.name);
        }
    }
    if !report.codebook_info.is_empty() {
        println!();
        println!("  codebook snapshots:");
        for c in &report.codebook_info {
            println!("    frame {:>6}  {}", c.frame, human_bytes(c.size as u64));
        }
    }
    println!();
    println!("  chunk limits:");
    for l in &report.limits {
        println!("    {}  {}", l.tag, human_bytes(l.max as u64));
    }

    if let Some(frames) = &report.frame_offsets {
        println!();
        println!("  {:>8}  {:>14}  {:>5}", "frame", "file offset", "flags");
        println!("  {}", "-".repeat(31));
        for f in frames {
            println!("  {:>8}  {:>14}  {:>5x}", f.frame, f.offset, f.flags);
        }
    }
    Ok(())
}

// ── decode ─────────────────────────────────────────────────────────────────

fn run_decode(
    file: PathBuf,
    loop_index: Option<usize>,
    frames_dir: Option<PathBuf>,
    audio_out: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut decoder = open_decoder(&file)?;

    let last = match loop_index {
        Some(i) => {
            let (begin, end) = decoder
                .seek_to_loop(i)
                .with_context(|| format!("seeking to loop {}", i))?;
            eprintln!("  loop {} : frames {}..={}", i, begin, end);
            end as usize
        }
        None => decoder.frame_count() - 1,
    };
    if let Some(dir) = &frames_dir {
        fs::create_dir_all(dir).with_context(|| format!("creating {:?}", dir))?;
    }
    let mut pcm = match &audio_out {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("creating {:?}", path))?,
        )),
        None => None,
    };
    let skip = if pcm.is_some() { SKIP_METADATA } else { SKIP_AUDIO | SKIP_METADATA };

    let t0 = Instant::now();
    let mut decoded = 0usize;
    let mut dropped = 0usize;
    let mut samples = 0usize;

    while decoder.next_frame() <= last {
        let summary = match decoder.read_packet(skip) {
            Ok(s) => s,
            Err(Error::EndOfStream) => break,
            Err(e) if e.is_frame_local() => {
                println!("frame {:>5}  dropped: {}", decoder.next_frame().saturating_sub(1), e);
                dropped += 1;
                continue;
            }
            Err(e) => return Err(e).context("reading packet"),
        };

        if summary.audio_unit {
            if let Some(out) = pcm.as_mut() {
                match decoder.decode_audio_unit() {
                    Ok(unit) => {
                        samples += unit.len();
                        write_pcm(out, unit)?;
                    }
                    Err(e) => eprintln!("frame {:>5}  audio dropped: {}", summary.frame, e),
                }
            }
        }
        if !summary.video {
            continue;
        }
        match decoder.decode_video_frame() {
            Ok(raster) => {
                println!("frame {:>5}  {:016x}", summary.frame, frame_digest(raster));
                if let Some(dir) = &frames_dir {
                    write_ppm(&dir.join(format!("frame_{:05}.ppm", summary.frame)), raster)?;
                }
                decoded += 1;
            }
            Err(e) => {
                println!("frame {:>5}  dropped: {}", summary.frame, e);
                dropped += 1;
            }
        }
    }

    // Audio packed after the last frame
    if let Some(out) = pcm.as_mut() {
        if loop_index.is_none() {
            loop {
                match decoder.read_packet(SKIP_METADATA) {
                    Ok(s) if s.audio_unit => {
                        let unit = decoder.decode_audio_unit()?;
                        samples += unit.len();
                        write_pcm(out, unit)?;
                    }
                    Ok(_) => {}
                    Err(Error::EndOfStream) => break,
                    Err(e) if e.is_frame_local() => eprintln!("  trailing audio dropped: {}", e),
                    Err(e) => return Err(e).context("reading trailing audio"),
                }
            }
        }
        out.flush()?;
    }

    let elapsed = t0.elapsed();
    eprintln!("  frames      : {} decoded, {} dropped", decoded, dropped);
    if audio_out.is_some() {
        eprintln!("  audio       : {} samples", samples);
    }
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

// ── extract-frame ──────────────────────────────────────────────────────────

fn run_extract_frame(file: PathBuf, index: usize, output: PathBuf) -> anyhow::Result<()> {
    let mut decoder = open_decoder(&file)?;
    if index >= decoder.frame_count() {
        anyhow::bail!(
            "frame {} out of range; file has {} frames",
            index,
            decoder.frame_count()
        );
    }

    // Codebook state builds up frame by frame, so decode from the start.
    let t0 = Instant::now();
    loop {
        let summary = decoder
            .read_packet(SKIP_AUDIO | SKIP_METADATA)
            .with_context(|| format!("reading frame {}", decoder.next_frame()))?;
        if !summary.video {
            continue;
        }
        let raster = decoder
            .decode_video_frame()
            .with_context(|| format!("decoding frame {}", summary.frame))?;
        if summary.frame == index {
            write_ppm(&output, raster)?;
            eprintln!(
                "  frame {} ({}x{}) written to {:?} in {:.3}ms",
                index,
                raster.width(),
                raster.height(),
                output,
                t0.elapsed().as_secs_f64() * 1000.0
            );
            return Ok(());
        }
    }
}

// ── bench ──────────────────────────────────────────────────────────────────

fn run_bench(file: PathBuf) -> anyhow::Result<()> {
    let size = fs::metadata(&file)?.len();
    let mut decoder = open_decoder(&file)?;
    let frame_count = decoder.frame_count();
    let fps = decoder.frame_rate();

    eprintln!("benchmarking full decode of {} frames...", frame_count);

    let t0 = Instant::now();
    let mut latencies_us: Vec<u64> = Vec::with_capacity(frame_count);
    let mut samples = 0usize;
    loop {
        let t = Instant::now();
        let summary = match decoder.read_packet(SKIP_NONE) {
            Ok(s) => s,
            Err(Error::EndOfStream) => break,
            Err(e) if e.is_frame_local() => continue,
            Err(e) => return Err(e).context("reading packet"),
        };
        if summary.audio_unit {
            samples += decoder.decode_audio_unit().map(|u| u.len()).unwrap_or(0);
        }
        if summary.video && decoder.decode_video_frame().is_ok() {
            latencies_us.push(t.elapsed().as_micros() as u64);
        }
    }
    let elapsed = t0.elapsed();

    if latencies_us.is_empty() {
        anyhow::bail!("no frames decoded");
    }
    latencies_us.sort_unstable();
    let pct = |p: f64| latencies_us[((latencies_us.len() as f64 * p) as usize).min(latencies_us.len() - 1)];
    let decoded = latencies_us.len();
    let achieved = decoded as f64 / elapsed.as_secs_f64();

    println!();
    println!("=== Full Decode Benchmark ===");
    println!("  file size   : {}", human_bytes(size));
    println!("  frames      : {} of {}", decoded, frame_count);
    println!("  audio       : {} samples", samples);
    println!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    println!(
        "  throughput  : {:.1} frames/s ({:.1}x realtime at {} fps)",
        achieved,
        achieved / fps.max(1) as f64,
        fps
    );
    println!(
        "  input rate  : {}/s",
        human_bytes((size as f64 / elapsed.as_secs_f64()) as u64)
    );
    println!("  latency:");
    println!("    min  : {} µs", latencies_us[0]);
    println!("    p50  : {} µs", pct(0.50));
    println!("    p95  : {} µs", pct(0.95));
    println!("    p99  : {} µs", pct(0.99));
    println!("    max  : {} µs", latencies_us[decoded - 1]);
    Ok(())
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Inspect { file, frames, json } => run_inspect(file, frames, json),
        Commands::Decode {
            file,
            loop_index,
            frames,
            audio,
        } => run_decode(file, loop_index, frames, audio),
        Commands::ExtractFrame {
            file,
            index,
            output,
        } => run_extract_frame(file, index, output),
        Commands::Bench { file } => run_bench(file),
    }
}
