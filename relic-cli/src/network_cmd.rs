//! The `network` subcommand: packet and frame recovery into PCAP files.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::ArgMatches;

use relic_carve::{
    extract_arp_frames, extract_ip_packets, recover_iomem_frames, BufferError, BufferedFile,
    Frames,
};
use relic_common::hexdump;
use relic_coredump::{CoreDump, MemoryBlocks, BLOCK_LISTING_HEADER};

use crate::input::read_evidence;

pub fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    if let Some(pcap) = matches.get_one::<PathBuf>("frames") {
        let coredump: &PathBuf = matches
            .get_one("coredump")
            .context("--frames requires --coredump & --iomem")?;
        let iomem: &PathBuf = matches
            .get_one("iomem")
            .context("--frames requires --coredump & --iomem")?;
        frames(coredump, iomem, pcap, matches.get_flag("verbose"))
    } else if let Some(pcap) = matches.get_one::<PathBuf>("packets") {
        let files: Vec<&PathBuf> = matches
            .get_many("files")
            .context("--packets requires --files")?
            .collect();
        packets(&files, pcap, matches)
    } else {
        unreachable!("argument group is required")
    }
}

fn new_session(matches: &ArgMatches) -> anyhow::Result<Frames> {
    match matches.get_one::<PathBuf>("ouitxt") {
        Some(path) => Frames::with_oui_file(path)
            .with_context(|| format!("error reading {}", path.display())),
        None => Ok(Frames::new()),
    }
}

fn packets(files: &[&PathBuf], pcap: &Path, matches: &ArgMatches) -> anyhow::Result<()> {
    tracing::info!("start");
    let mut frames = new_session(matches)?;
    let options = matches.get_flag("options");
    let duplicates = matches.get_flag("duplicates");
    let buffered = matches.get_flag("buffer");
    let buffer_size = *matches.get_one::<usize>("buffersize").expect("defaulted") * 1024 * 1024;
    let overlap_size =
        *matches.get_one::<usize>("bufferoverlapsize").expect("defaulted") * 1024 * 1024;

    let mut processed = 0usize;
    for path in files {
        let filename = path.display().to_string();
        if buffered {
            tracing::info!(file = %filename, "buffering file");
            let mut reader = BufferedFile::new(path, buffer_size, overlap_size)?;
            loop {
                match reader.read() {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(BufferError::OutOfMemory) => {
                        tracing::error!("data is too large to fit in memory, use a smaller buffer");
                        break;
                    }
                    Err(BufferError::Io(error)) => {
                        tracing::error!(%error, "error reading file");
                        break;
                    }
                }
                let index = reader.index.unwrap_or(0);
                tracing::info!(
                    index,
                    size = reader.buffer.len(),
                    progress = reader.progress(),
                    "processing buffer"
                );
                extract_ip_packets(
                    &mut frames,
                    index,
                    &reader.buffer,
                    options,
                    duplicates,
                    true,
                    &filename,
                );
                extract_arp_frames(&mut frames, index, &reader.buffer, duplicates, true, &filename);
            }
            processed += 1;
        } else {
            tracing::info!(file = %filename, "reading file");
            match read_evidence(path) {
                Ok(view) => {
                    tracing::info!("searching for IPv4 packets");
                    extract_ip_packets(&mut frames, 0, &view, options, duplicates, true, &filename);
                    tracing::info!("searching for ARP Ethernet frames");
                    extract_arp_frames(&mut frames, 0, &view, duplicates, true, &filename);
                    processed += 1;
                }
                Err(error) => tracing::error!(%error, "error reading file"),
            }
        }
    }

    if processed > 0 {
        tracing::info!(pcap = %pcap.display(), "writing PCAP file");
        frames
            .write_pcap_file(pcap)
            .with_context(|| format!("error writing {}", pcap.display()))?;
        println!("Number of identified frames:   {:5}", frames.count_frames);
        println!("Number of identified packets:  {:5}", frames.count_packets);
        println!("Number of frames in PCAP file: {:5}", frames.len());
    }
    tracing::info!("done");
    Ok(())
}

fn frames(coredump: &Path, iomem: &Path, pcap: &Path, verbose: bool) -> anyhow::Result<()> {
    tracing::info!("start");
    tracing::info!(file = %coredump.display(), "reading core dump");
    let core_view = read_evidence(coredump)?;
    let core = CoreDump::parse(&core_view)?;
    let (_, memory) = core.region_heap().context("heap region not found")?;
    let memory = memory.context("heap region not found")?;
    let mut heap = MemoryBlocks::parse(memory);
    heap.resolve_names(&core);

    tracing::info!(file = %iomem.display(), "reading IOMEM");
    let iomem_view = read_evidence(iomem)?;

    let mut frames = Frames::new();
    if verbose {
        println!("{BLOCK_LISTING_HEADER}");
    }
    let recovered = recover_iomem_frames(&heap, &iomem_view, &mut frames)?;
    if verbose {
        for frame in &recovered {
            let start = frame.index as usize;
            print!(
                "{}",
                hexdump(&iomem_view[start..start + frame.size], frame.address)
            );
        }
    }
    frames
        .write_pcap_file(pcap)
        .with_context(|| format!("error writing {}", pcap.display()))?;
    println!(
        "{} frames written to {}",
        frames.count_frames,
        pcap.display()
    );
    tracing::info!("done");
    Ok(())
}
