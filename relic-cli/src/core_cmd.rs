//! The `core` subcommand: everything recoverable from a core dump alone.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::ArgMatches;

use relic_common::{ascii_runs, hexdump};
use relic_coredump::{
    check_heap, check_sysdescr, check_text, column_stats, command_history, logged_events,
    CoreDump, CoreDumpAnalysis, MemoryBlock, MemoryBlocks, SysdescrComparison,
    BLOCK_LISTING_HEADER, PROCESS_LISTING_HEADER,
};
use relic_image::{CwStrings, IosImage};

use crate::input::read_evidence;

pub fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let coredump_path: &PathBuf = matches.get_one("coredump").expect("required arg");

    if matches.get_flag("regions") {
        regions(coredump_path, matches.get_one::<PathBuf>("output"))
    } else if matches.get_flag("cwstrings") {
        cwstrings(coredump_path, matches.get_flag("raw"))
    } else if matches.get_flag("heap") {
        if !matches.get_one::<String>("grep").expect("defaulted").is_empty()
            && !matches.get_flag("strings")
        {
            anyhow::bail!("-g/--grep requires -s/--strings");
        }
        heap(coredump_path, matches)
    } else if matches.get_flag("history") {
        history(coredump_path)
    } else if matches.get_flag("events") {
        events(coredump_path)
    } else if matches.get_flag("processes") {
        processes(coredump_path, matches)
    } else if matches.get_flag("check") {
        let bin: &PathBuf = matches
            .get_one("bin")
            .context("--check requires an IOS bin file, use --bin")?;
        check(coredump_path, bin)
    } else if matches.get_flag("integrity") {
        integrity(coredump_path)
    } else {
        unreachable!("argument group is required")
    }
}

fn regions(path: &Path, output: Option<&PathBuf>) -> anyhow::Result<()> {
    let view = read_evidence(path)?;
    let core = CoreDump::parse(&view)?;
    println!("Start      End        Size       Name");
    for region in &core.regions {
        match region.len {
            Some(len) => {
                println!(
                    "0x{:08X} 0x{:08X} {:<10} {}",
                    region.start,
                    region.start + len - 1,
                    len,
                    region.name
                );
                if let Some(directory) = output {
                    if let Some((_, Some(bytes))) = core.region(region.name) {
                        let filename = format!(
                            "{}-{}-0x{:08X}",
                            basename(path),
                            region.name,
                            region.start
                        );
                        std::fs::write(directory.join(&filename), bytes)
                            .with_context(|| format!("error writing {filename}"))?;
                    }
                }
            }
            None => println!("0x{:08X} {:21} {}", region.start, "", region.name),
        }
    }
    Ok(())
}

fn print_cwstrings(data: &[u8]) {
    let strings = CwStrings::parse(data);
    if let Some(error) = strings.error {
        println!("Error: {error}");
        return;
    }
    let mut entries: Vec<(&[u8], &[u8])> = strings.iter().collect();
    entries.sort_by_key(|(key, _)| key.to_vec());
    for (key, value) in entries {
        let key_text = String::from_utf8_lossy(key);
        let value_text = String::from_utf8_lossy(value);
        if key == b"CW_SYSDESCR" {
            println!("{key_text}:");
            println!("{value_text}");
        } else {
            let padding = 22usize.saturating_sub(key.len());
            println!("{key_text}:{:padding$}{value_text}", "");
        }
    }
}

fn cwstrings(path: &Path, raw: bool) -> anyhow::Result<()> {
    let view = read_evidence(path)?;
    if raw {
        print_cwstrings(&view);
        return Ok(());
    }
    let core = CoreDump::parse(&view)?;
    let (_, data) = core.region_data().context("data region not found")?;
    let data = data.context("data region not found")?;
    print_cwstrings(data);
    Ok(())
}

fn heap(path: &Path, matches: &ArgMatches) -> anyhow::Result<()> {
    let view = read_evidence(path)?;
    let core = CoreDump::parse(&view)?;
    let (_, memory) = core.region_heap().context("heap region not found")?;
    let memory = memory.context("heap region not found")?;
    let mut blocks = MemoryBlocks::parse(memory);

    let filter = matches.get_one::<String>("filter").expect("defaulted");
    if matches.get_flag("resolve") || !filter.is_empty() {
        blocks.resolve_names(&core);
    }

    let output = matches.get_one::<PathBuf>("output");
    let output_dir = match output {
        Some(directory) => {
            let target = directory.join("heap_data");
            std::fs::create_dir_all(&target)
                .with_context(|| format!("error creating {}", target.display()))?;
            Some(target)
        }
        None => None,
    };

    println!("{BLOCK_LISTING_HEADER}");
    for block in &blocks.blocks {
        if !filter.is_empty() && block.alloc_name_resolved.as_deref() != Some(filter.as_str()) {
            continue;
        }
        print_heap_block(&blocks, block, matches, path, output_dir.as_deref())?;
    }
    Ok(())
}

fn print_heap_block(
    blocks: &MemoryBlocks<'_>,
    block: &MemoryBlock,
    matches: &ArgMatches,
    coredump_path: &Path,
    output_dir: Option<&Path>,
) -> anyhow::Result<()> {
    let grep = matches.get_one::<String>("grep").expect("defaulted");
    let minimum = *matches.get_one::<usize>("minimum").expect("defaulted");

    if !matches.get_flag("strings") {
        println!("{}", block.render_line());
    } else {
        let runs = ascii_runs(blocks.block_data(block), 5);
        if !grep.is_empty() {
            let mut header_printed = false;
            for run in &runs {
                if relic_common::find(run.bytes, grep.as_bytes(), 0).is_some() {
                    if !header_printed {
                        println!("{}", block.render_line());
                        header_printed = true;
                    }
                    println!(
                        " {:08X}: {}",
                        block.address as u64 + block.size as u64 + run.end as u64,
                        String::from_utf8_lossy(run.bytes)
                    );
                }
            }
        } else if minimum == 0 || runs.len() >= minimum {
            println!("{}", block.render_line());
            for run in &runs {
                println!(
                    " {:08X}: {}",
                    block.address as u64 + block.size as u64 + run.end as u64,
                    String::from_utf8_lossy(run.bytes)
                );
            }
        }
    }
    if matches.get_flag("dump") {
        print!(
            "{}",
            hexdump(blocks.block_data(block), block.data_address())
        );
    }
    if matches.get_flag("dumpraw") {
        print!("{}", hexdump(blocks.block_raw(block), block.address));
    }
    if let Some(directory) = output_dir {
        let filename = format!("{}-heap-0x{:08X}.data", basename(coredump_path), block.address);
        let target = directory.join(&filename);
        std::fs::write(&target, blocks.block_data(block))
            .with_context(|| format!("error writing {}", target.display()))?;
        if matches.get_flag("verbose") {
            println!("\tFile: {} created.\n", target.display());
        }
    }
    Ok(())
}

fn history(path: &Path) -> anyhow::Result<()> {
    let view = read_evidence(path)?;
    let (_core, heap) = heap_with_names(&view)?;
    let history = command_history(&heap);
    for entry in &history {
        println!(
            "{} UTC: {}",
            entry.time.format("%b %d %Y %H:%M:%S"),
            entry.command
        );
    }
    if history.is_empty() {
        println!("No history found");
    }
    Ok(())
}

fn events(path: &Path) -> anyhow::Result<()> {
    let view = read_evidence(path)?;
    let (_core, heap) = heap_with_names(&view)?;
    for entry in logged_events(&heap) {
        println!(
            "{}.{} UTC: {}",
            entry.time.format("%b %d %Y %H:%M:%S"),
            entry.millis,
            entry.message
        );
    }
    Ok(())
}

/// Parses the dump and returns the core plus its name-resolved heap chain.
fn heap_with_names<'data>(
    view: &'data [u8],
) -> anyhow::Result<(CoreDump<'data>, MemoryBlocks<'data>)> {
    let core = CoreDump::parse(view)?;
    let (_, memory) = core.region_heap().context("heap region not found")?;
    let memory = memory.context("heap region not found")?;
    let mut blocks = MemoryBlocks::parse(memory);
    blocks.resolve_names(&core);
    Ok((core, blocks))
}

fn processes(path: &Path, matches: &ArgMatches) -> anyhow::Result<()> {
    let view = read_evidence(path)?;
    let analysis = CoreDumpAnalysis::parse(&view)?;
    let filter = matches.get_one::<String>("filter").expect("defaulted");
    let filter_pid: Option<usize> = if filter.is_empty() {
        None
    } else {
        Some(filter.parse().context("-f expects a PID number")?)
    };

    println!("{PROCESS_LISTING_HEADER}");
    for slot in &analysis.processes {
        if filter_pid.is_some_and(|pid| pid != slot.pid) {
            continue;
        }
        match &slot.process {
            Some(process) => {
                match &process.error {
                    None => println!("{}", process.render_line()),
                    Some(error) => println!("{:4} Error: {error}", slot.pid),
                }
                if matches.get_flag("dump") {
                    if let Some(block) = analysis.heap.block_by_data_address(slot.address) {
                        print!("{}", hexdump(analysis.heap.block_data(block), slot.address));
                    }
                }
            }
            None => println!(
                " {:>3} {:08X} - process structure address not found",
                slot.pid, slot.address
            ),
        }
    }

    if analysis.ran_heuristics {
        println!();
        println!("*** WARNING ***");
        println!("Unexpected process structure");
        println!("Fields determined with heuristics:");
        if let Some(size) = analysis.heuristics_size {
            println!("Process structure size: {size}");
        }
        if let Some(layout) = &analysis.heuristics_layout {
            let fields = [
                ("addressProcessName", layout.address_process_name),
                ("addressStackBlock", layout.address_stack_block),
                ("addressTTY", layout.address_tty),
                ("Invoked", layout.invoked),
                ("PC", layout.pc),
                ("Q", layout.q),
                ("Runtime", layout.runtime),
                ("Stack1", layout.stack1),
                ("Stack2", layout.stack2),
                ("Ty", layout.ty),
            ];
            for (name, offset) in fields {
                if let Some(offset) = offset {
                    println!("{name:<22}: 0x{offset:04X}");
                }
            }
        }
    }

    if matches.get_flag("stats") {
        println!(
            "Number of different process structures: {}",
            analysis.stats.len()
        );
        for (length, columns) in &analysis.stats {
            println!("Process structures length: {length}");
            for (column, stats) in column_stats(columns, &analysis.core) {
                println!(
                    "{:3} {:3X}: {:3} {:08X} {:08X} {:08X} {}",
                    column,
                    column * 4,
                    stats.distinct,
                    stats.min,
                    stats.min_nonzero,
                    stats.max,
                    stats.regions.join(" ")
                );
            }
        }
    }
    Ok(())
}

fn check(path: &Path, bin: &Path) -> anyhow::Result<()> {
    println!("Comparing CW_SYSDESCR between core dump and IOS image");
    let view = read_evidence(path)?;
    let core = CoreDump::parse(&view)?;
    let image_view = read_evidence(bin)?;
    let image = IosImage::parse(&image_view);

    // the sysdescr verdict is printed even when the image is too damaged
    // for the text comparison below
    match check_sysdescr(&core, &image) {
        SysdescrComparison::Absent => {}
        SysdescrComparison::Identical(descr) => {
            println!("CW_SYSDESCR are identical:\n\n{descr}\n");
        }
        SysdescrComparison::Equivalent(descr) => {
            println!("CW_SYSDESCR are equivalent:\n\n{descr}\n");
        }
        SysdescrComparison::Different { core, image } => {
            println!("CW_SYSDESCR are different:\n\n{core}\n\n{image}\n");
        }
    }

    let report = match check_text(&core, &image) {
        Ok(report) => report,
        Err(error) => {
            println!("{error}");
            return Ok(());
        }
    };
    if report.core_len != report.image_len {
        println!("the text region and the text section differ in length");
        println!("core dump text region: {} bytes", report.core_len);
        println!("image text section:    {} bytes", report.image_len);
    }
    if report.is_identical() {
        println!("text region and section are identical");
    } else {
        if let Some(address) = report.first_difference {
            println!("text region and section are different starting 0x{address:08X} in coredump");
        }
        println!(
            "number of different bytes: {} ({:.2}%)",
            report.different,
            report.different as f64 * 100.0 / report.compared as f64
        );
    }
    Ok(())
}

fn integrity(path: &Path) -> anyhow::Result<()> {
    let view = read_evidence(path)?;
    let core = CoreDump::parse(&view)?;
    let (_, memory) = core.region_heap().context("heap region not found")?;
    let memory = memory.context("heap region not found")?;
    let blocks = MemoryBlocks::parse(memory);
    let report = check_heap(&blocks);

    let show = |title: &str, violations: &[usize]| {
        println!("{title}");
        if violations.is_empty() {
            println!("OK");
        } else {
            for &index in violations {
                println!("{}", blocks.blocks[index].render_line());
            }
        }
    };
    show("Check start magic:", &report.start_magic);
    show("Check end magic:", &report.end_magic);
    show("Check previous block:", &report.prev_block);
    show("Check next block:", &report.next_block);
    Ok(())
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
