//! The `relic` command line: forensic analysis of Cisco IOS core dumps,
//! network captures hidden in memory, and firmware images.

use std::path::PathBuf;

use clap::{value_parser, Arg, ArgAction, ArgGroup, ArgMatches, Command};

mod core_cmd;
mod image_cmd;
mod input;
mod md5db;
mod network_cmd;
mod scan;

fn core_command() -> Command {
    Command::new("core")
        .about("Core dump analysis")
        .arg(
            Arg::new("coredump")
                .required(true)
                .value_name("COREDUMP")
                .value_parser(value_parser!(PathBuf))
                .help("Core dump file"),
        )
        .arg(flag("regions", None, "List regions: [-o]"))
        .arg(flag("cwstrings", None, "Print CW_ strings: [-a]"))
        .arg(flag(
            "heap",
            None,
            "List heap blocks: [-d] [-D] [-s] [-m] [-g] [-r] [-f] [-o] [-v]",
        ))
        .arg(flag("history", None, "Print command history"))
        .arg(flag("events", None, "Print logged events"))
        .arg(flag("processes", None, "Print processes: [-f] [-d] [-S]"))
        .arg(flag(
            "check",
            None,
            "Compare text in dump to IOS bin, requires --bin",
        ))
        .arg(flag("integrity", None, "Check integrity of core dump"))
        .group(
            ArgGroup::new("function")
                .args([
                    "regions",
                    "cwstrings",
                    "heap",
                    "history",
                    "events",
                    "processes",
                    "check",
                    "integrity",
                ])
                .required(true),
        )
        .arg(flag(
            "raw",
            Some('a'),
            "Search the whole core dump for CW_ strings",
        ))
        .arg(flag("dump", Some('d'), "Dump data"))
        .arg(flag("dumpraw", Some('D'), "Dump raw data"))
        .arg(flag("strings", Some('s'), "Dump strings in data"))
        .arg(
            Arg::new("minimum")
                .short('m')
                .long("minimum")
                .value_name("COUNT")
                .value_parser(value_parser!(usize))
                .default_value("0")
                .help("Minimum count number of strings"),
        )
        .arg(
            Arg::new("grep")
                .short('g')
                .long("grep")
                .value_name("STRING")
                .default_value("")
                .help("Grep for strings"),
        )
        .arg(flag("resolve", Some('r'), "Resolve names for heap blocks"))
        .arg(
            Arg::new("filter")
                .short('f')
                .long("filter")
                .value_name("NAME")
                .default_value("")
                .help("Filter for a given name"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Output the regions or heap blocks to path"),
        )
        .arg(
            Arg::new("bin")
                .long("bin")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("IOS bin file"),
        )
        .arg(flag("verbose", Some('v'), "Increase output verbosity"))
        .arg(flag(
            "stats",
            Some('S'),
            "Print process structure statistics",
        ))
}

fn network_command() -> Command {
    Command::new("network")
        .about("Generic frame and packet extraction")
        .arg(
            Arg::new("frames")
                .long("frames")
                .value_name("PCAP")
                .value_parser(value_parser!(PathBuf))
                .help("Extract frames into a .pcap file, requires --coredump & --iomem"),
        )
        .arg(
            Arg::new("packets")
                .long("packets")
                .value_name("PCAP")
                .value_parser(value_parser!(PathBuf))
                .help("Extract packets into a .pcap file, requires --files"),
        )
        .group(
            ArgGroup::new("function")
                .args(["frames", "packets"])
                .required(true),
        )
        .arg(
            Arg::new("coredump")
                .long("coredump")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Core dump file"),
        )
        .arg(
            Arg::new("iomem")
                .long("iomem")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("IOMEM dump file"),
        )
        .arg(
            Arg::new("files")
                .long("files")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .action(ArgAction::Append)
                .num_args(1..)
                .help("Files to extract packets from"),
        )
        .arg(flag("duplicates", Some('d'), "Include duplicates"))
        .arg(flag(
            "options",
            Some('p'),
            "Search for IPv4 headers with options",
        ))
        .arg(
            Arg::new("ouitxt")
                .short('t')
                .long("ouitxt")
                .value_name("OUIFILE")
                .value_parser(value_parser!(PathBuf))
                .help("File containing OUIs to filter for MAC addresses"),
        )
        .arg(flag(
            "buffer",
            Some('b'),
            "Buffer the file in 100MB blocks with 1MB overlap",
        ))
        .arg(
            Arg::new("buffersize")
                .short('B')
                .long("buffersize")
                .value_name("MB")
                .value_parser(value_parser!(usize))
                .default_value("100")
                .help("Size of the buffer in MB"),
        )
        .arg(
            Arg::new("bufferoverlapsize")
                .short('O')
                .long("bufferoverlapsize")
                .value_name("MB")
                .value_parser(value_parser!(usize))
                .default_value("1")
                .help("Size of the buffer overlap in MB"),
        )
        .arg(flag("verbose", Some('v'), "Increase output verbosity"))
}

fn image_command() -> Command {
    Command::new("image")
        .about("IOS image analysis")
        .arg(flag(
            "info",
            None,
            "Scan defined image and output metadata, requires --bin",
        ))
        .arg(
            Arg::new("extract")
                .long("extract")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Extract the compressed image to path, requires --bin: [-m] [-v]"),
        )
        .arg(
            Arg::new("ida")
                .long("ida")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Extract the image patched for IDA Pro, requires --bin: [-m] [-v]"),
        )
        .arg(
            Arg::new("scan")
                .long("scan")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Find and scan all images within DIR: [-R] [-r] [-m] [-l]"),
        )
        .group(
            ArgGroup::new("function")
                .args(["info", "extract", "ida", "scan"])
                .required(true),
        )
        .arg(
            Arg::new("bin")
                .long("bin")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("IOS bin file"),
        )
        .arg(
            Arg::new("md5db")
                .short('m')
                .long("md5db")
                .value_name("CSV")
                .value_parser(value_parser!(PathBuf))
                .help("Compare MD5 hash with provided CSV formatted db"),
        )
        .arg(flag(
            "recurse",
            Some('R'),
            "Recursively search sub-directories for images",
        ))
        .arg(
            Arg::new("resume")
                .short('r')
                .long("resume")
                .value_name("CHECKPOINT")
                .value_parser(value_parser!(PathBuf))
                .help("Resume an interrupted scan from a checkpoint file"),
        )
        .arg(
            Arg::new("log")
                .short('l')
                .long("log")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Write scan result to log file"),
        )
        .arg(flag("verbose", Some('v'), "Increase output verbosity"))
}

fn flag(name: &'static str, short: Option<char>, help: &'static str) -> Arg {
    let mut arg = Arg::new(name)
        .long(name)
        .action(ArgAction::SetTrue)
        .help(help);
    if let Some(short) = short {
        arg = arg.short(short);
    }
    arg
}

fn execute(matches: &ArgMatches) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("core", matches)) => core_cmd::run(matches),
        Some(("network", matches)) => network_cmd::run(matches),
        Some(("image", matches)) => image_cmd::run(matches),
        _ => unreachable!("subcommand required"),
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let matches = Command::new("relic")
        .about("Network appliance forensic toolkit")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(core_command())
        .subcommand(network_command())
        .subcommand(image_command())
        .get_matches();

    if let Err(error) = execute(&matches) {
        eprintln!("Error: {error:#}");
        std::process::exit(1);
    }
}
