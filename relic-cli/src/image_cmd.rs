//! The `image` subcommand: IOS firmware inspection, extraction and bulk
//! scanning.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::ArgMatches;
use md5::{Digest, Md5};

use relic_image::IosImage;

use crate::input::read_evidence;
use crate::md5db::Md5Database;
use crate::scan::{append_log, collect_bins, entropy, Checkpoint};

/// Name of the checkpoint file written when a scan aborts.
const CHECKPOINT_FILE: &str = "relic-scan.checkpoint.json";

pub fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    if let Some(dir) = matches.get_one::<PathBuf>("scan") {
        return scan(dir, matches);
    }
    let bin: &PathBuf = matches
        .get_one("bin")
        .context("this function requires an IOS bin file, use --bin")?;
    inspect(bin, matches)
}

fn format_checksum(value: Option<u32>) -> String {
    match value {
        Some(value) => format!("0x{value:08X}"),
        None => "Not found".to_owned(),
    }
}

fn verdict(declared: Option<u32>, calculated: Option<u32>) -> &'static str {
    if declared.is_some() && declared == calculated {
        "identical"
    } else {
        "DIFFERENT"
    }
}

fn inspect(bin: &Path, matches: &ArgMatches) -> anyhow::Result<()> {
    let view = read_evidence(bin)?;
    let image = IosImage::parse(&view);

    println!("IOS Image Metadata:\n");
    if let Some(strings) = image.cw_strings.as_ref().filter(|s| s.error.is_none()) {
        for key in relic_image::KNOWN_KEYS {
            if let Some(value) = strings.get_str(key) {
                let padding = 22usize.saturating_sub(key.len());
                println!("{}:{:padding$}{value}", String::from_utf8_lossy(key), "");
            }
        }
    }
    if let Some(error) = image.elf.error {
        println!("ELF parsing error {}.", error.code());
        return Ok(());
    }

    let not_found = || "Not found".to_owned();
    println!("Entry point:           0x{:08X}", image.elf.entry);
    println!("Number of sections:    {}", image.elf.section_count);
    println!(
        "Embedded MD5:          {}",
        image.embedded_md5.clone().unwrap_or_else(not_found)
    );
    println!(
        "Calculated MD5:        {}",
        image.calculated_md5.clone().unwrap_or_else(not_found)
    );
    println!(
        "Compressed size:       {}",
        image
            .size_compressed
            .map(|size| size.to_string())
            .unwrap_or_else(not_found)
    );
    println!(
        "Checksum compressed:   {}",
        format_checksum(image.checksum_compressed)
    );
    println!(
        "Calculated checksum:   {} ({})",
        format_checksum(image.calculated_checksum_compressed),
        verdict(
            image.checksum_compressed,
            image.calculated_checksum_compressed
        )
    );
    println!(
        "Uncompressed size:     {}",
        image
            .size_uncompressed
            .map(|size| size.to_string())
            .unwrap_or_else(not_found)
    );
    println!(
        "Image name:            {}",
        image.image_uncompressed_name.clone().unwrap_or_else(not_found)
    );
    println!(
        "Checksum uncompressed: {}",
        format_checksum(image.checksum_uncompressed)
    );
    println!(
        "Calculated checksum:   {} ({})",
        format_checksum(image.calculated_checksum_uncompressed),
        verdict(
            image.checksum_uncompressed,
            image.calculated_checksum_uncompressed
        )
    );

    if let Some(csv) = matches.get_one::<PathBuf>("md5db") {
        let database = Md5Database::load(csv)?;
        println!(
            "{} unique entries in md5 database, {} doubles of which {} empty string",
            database.len(),
            database.doubles,
            database.empty_doubles
        );
        let digest = format!("{:x}", Md5::digest(&view));
        match database.find(&digest) {
            Some((csv_name, filename)) => {
                println!("File found in md5 database: {csv_name}, filename: {filename}");
            }
            None => println!("File not found in md5 database"),
        }
    }

    if matches.get_flag("verbose") {
        println!("\nELF Headers:\n");
        println!("index       name       type      flags     offset       size       data");
        for section in &image.elf.sections {
            println!(
                "   {:2} {:>10} {:10} {:10}   {:08X} {:10}       {:02X?}",
                section.name_index,
                section.name,
                section.section_type,
                section.flags,
                section.offset,
                section.size,
                &section.data[..section.data.len().min(8)]
            );
        }
    }

    if let Some(target) = matches.get_one::<PathBuf>("extract") {
        let payload = image
            .image_uncompressed
            .as_deref()
            .context("image carries no uncompressed payload")?;
        let name = image
            .image_uncompressed_name
            .as_deref()
            .unwrap_or("image.extracted");
        std::fs::write(target.join(name), payload)
            .with_context(|| format!("error writing to {}", target.display()))?;
        println!("\n{name} written to: {}", target.display());
    }
    if let Some(target) = matches.get_one::<PathBuf>("ida") {
        let payload = image
            .image_uncompressed_ida()
            .context("image carries no uncompressed payload")?;
        let name = image
            .image_uncompressed_name
            .as_deref()
            .unwrap_or("image.extracted");
        println!("\nPatching for IDA Pro...");
        std::fs::write(target.join(name), payload)
            .with_context(|| format!("error writing to {}", target.display()))?;
        println!("{name} written to: {}", target.display());
    }
    Ok(())
}

const SCAN_HEADER: [&str; 16] = [
    "#",
    "filename",
    "CW_VERSION",
    "CW_FAMILY",
    "imageSize",
    "entropy",
    "errorCode",
    "oELFerrorCode",
    "oELFsectionCount",
    "oELFstringTableIndex",
    "cksumCompressed",
    "cksumCompEqCalculated",
    "cksumUncompressed",
    "cksumUncompEqCalculated",
    "uncompressedFilename",
    "embeddedMD5",
];

fn scan(dir: &Path, matches: &ArgMatches) -> anyhow::Result<()> {
    let database = match matches.get_one::<PathBuf>("md5db") {
        Some(csv) => Some(Md5Database::load(csv)?),
        None => None,
    };

    let (mut remaining, total, mut counter) = match matches.get_one::<PathBuf>("resume") {
        Some(checkpoint_path) => {
            let checkpoint = Checkpoint::load(checkpoint_path)?;
            println!("Checkpoint loaded, {} files remaining", checkpoint.remaining.len());
            (checkpoint.remaining, checkpoint.total, checkpoint.counter)
        }
        None => {
            let bins = collect_bins(dir, matches.get_flag("recurse"));
            if bins.is_empty() {
                anyhow::bail!("no image(s) found, verify FILE/DIR path");
            }
            println!("Target path: {}", dir.display());
            if matches.get_flag("recurse") {
                println!("Recursive search");
            }
            println!("Performing scan on {} file(s):\n", bins.len());
            // a fresh scan starts the log over; resumed scans keep appending
            if let Some(log) = matches.get_one::<PathBuf>("log") {
                std::fs::File::create(log)
                    .with_context(|| format!("error creating {}", log.display()))?;
            }
            let total = bins.len();
            (bins, total, 1)
        }
    };

    let log = matches.get_one::<PathBuf>("log");
    let mut header = SCAN_HEADER.map(str::to_owned).to_vec();
    if database.is_some() {
        header.extend(["md5hash", "csvFilename", "dbFilename"].map(str::to_owned));
    }
    println!("{}", header.join(","));

    while let Some(path) = remaining.first().cloned() {
        let line = match scan_one(&path, counter, database.as_ref()) {
            Ok(line) => line,
            Err(error) => {
                // persist the scan position so -r can pick it back up
                let checkpoint = Checkpoint {
                    remaining,
                    total,
                    counter,
                };
                checkpoint.save(Path::new(CHECKPOINT_FILE))?;
                println!("Checkpoint saved to {CHECKPOINT_FILE}");
                return Err(error);
            }
        };
        println!("{line}");
        if let Some(log) = log {
            append_log(log, &line)?;
        }
        counter += 1;
        remaining.remove(0);
    }
    println!();
    println!("{} file(s) scanned.", counter - 1);
    Ok(())
}

fn scan_one(path: &Path, counter: usize, database: Option<&Md5Database>) -> anyhow::Result<String> {
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut line: Vec<String> = vec![counter.to_string(), filename];

    let view = read_evidence(path)?;
    let image = IosImage::parse(&view);

    let not_found = || "Not found".to_owned();
    match image.cw_strings.as_ref().filter(|s| s.error.is_none()) {
        Some(strings) => {
            line.push(strings.get_str(b"CW_VERSION").unwrap_or_else(not_found));
            line.push(strings.get_str(b"CW_FAMILY").unwrap_or_else(not_found));
        }
        None => {
            line.push(not_found());
            line.push(not_found());
        }
    }
    line.push(view.len().to_string());
    line.push(format!("{:.2}", entropy(&view)));
    line.push(image.error.map(|e| e.code()).unwrap_or(0).to_string());
    line.push(image.elf.error.map(|e| e.code()).unwrap_or(0).to_string());
    line.push(image.elf.section_count.to_string());
    line.push(image.elf.string_table_index.to_string());
    line.push(format_checksum(image.checksum_compressed));
    line.push(
        (image.checksum_compressed.is_some()
            && image.checksum_compressed == image.calculated_checksum_compressed)
            .to_string(),
    );
    line.push(format_checksum(image.checksum_uncompressed));
    line.push(
        (image.checksum_uncompressed.is_some()
            && image.checksum_uncompressed == image.calculated_checksum_uncompressed)
            .to_string(),
    );
    line.push(image.image_uncompressed_name.clone().unwrap_or_else(not_found));
    line.push(image.embedded_md5.clone().unwrap_or_else(not_found));

    if let Some(database) = database {
        let digest = format!("{:x}", Md5::digest(&view));
        match database.find(&digest) {
            Some((csv_name, db_filename)) => {
                line.push(digest);
                line.push(csv_name.to_owned());
                line.push(db_filename.to_owned());
            }
            None => {
                line.push(digest);
                line.push(not_found());
                line.push(not_found());
            }
        }
    }
    Ok(line.join(","))
}
