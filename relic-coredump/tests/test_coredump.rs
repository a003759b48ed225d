use relic_coredump::{
    check_heap, check_sysdescr, check_text, command_history, logged_events, CoreDump,
    CoreDumpAnalysis, MemoryBlocks, SysdescrComparison, TextCheckError,
};
use relic_testutils::{process_structure, CoreDumpBuilder, DEFAULT_BASE_ADDRESS};

#[test]
fn test_region_table() {
    let mut builder = CoreDumpBuilder::new();
    let name = builder.add_data_string("Init");
    builder.heap.add_block(name, 1, &[0u8; 32]);
    builder.heap.add_block(name, 1, &[0u8; 16]);
    let dump = builder.build();

    let core = CoreDump::parse(&dump).unwrap();
    assert_eq!(core.address, DEFAULT_BASE_ADDRESS);

    let names: Vec<&str> = core.regions.iter().map(|region| region.name).collect();
    assert_eq!(names, ["begin", "text", "data", "bss", "heap"]);

    let (begin_start, begin) = core.region("begin").unwrap();
    assert_eq!(begin_start, DEFAULT_BASE_ADDRESS);
    assert_eq!(begin.unwrap().len(), 64);

    let (text_start, text) = core.region_text().unwrap();
    assert_eq!(text_start, DEFAULT_BASE_ADDRESS + 64);
    assert_eq!(text.unwrap().len(), 256);

    let (data_start, data) = core.region_data().unwrap();
    assert_eq!(data_start, DEFAULT_BASE_ADDRESS + 64 + 256);
    assert_eq!(data.unwrap().len(), 512);

    let (bss_start, bss) = core.region_bss().unwrap();
    assert_eq!(bss_start, DEFAULT_BASE_ADDRESS + 64 + 256 + 512);
    assert_eq!(bss.unwrap().len(), 32);

    let (heap_start, heap) = core.region_heap().unwrap();
    assert_eq!(heap_start, builder.heap_address());
    // the heap runs to the end of the dump
    let heap = heap.unwrap();
    assert_eq!(
        heap_start as usize + heap.len(),
        DEFAULT_BASE_ADDRESS as usize + dump.len()
    );
}

#[test]
fn test_get_string_is_capped() {
    let mut builder = CoreDumpBuilder::new();
    let long = "x".repeat(80);
    let address = builder.add_data_string(&long);
    let name = builder.add_data_string("Init");
    builder.heap.add_block(name, 1, &[0u8; 16]);
    builder.heap.add_block(name, 1, &[0u8; 16]);
    let dump = builder.build();

    let core = CoreDump::parse(&dump).unwrap();
    assert_eq!(core.get_string(address).unwrap(), "x".repeat(50));
    assert_eq!(core.get_string(0x1000), None);
}

#[test]
fn test_heap_walk_three_blocks() {
    let mut builder = CoreDumpBuilder::new();
    let name_a = builder.add_data_string("CEF: fib");
    let name_b = builder.add_data_string("TTY data");
    let address_a = builder.heap.add_block(name_a, 1, b"payload of block A.!");
    let address_b = builder.heap.add_block(name_b, 2, &[0xAA; 64]);
    let address_c = builder.heap.add_block(name_a, 1, &[0x55; 32]);
    let dump = builder.build();

    let core = CoreDump::parse(&dump).unwrap();
    let (heap_address, memory) = core.region_heap().unwrap();
    let mut blocks = MemoryBlocks::parse(memory.unwrap());
    assert_eq!(blocks.error, None);
    assert_eq!(blocks.header_size, 40);
    assert_eq!(blocks.base_address, Some(heap_address));
    assert_eq!(blocks.blocks.len(), 3);

    // address arithmetic: address == base + index
    for block in &blocks.blocks {
        assert_eq!(block.address, heap_address + block.index as u32);
    }
    assert_eq!(blocks.blocks[0].data_address(), address_a);
    assert_eq!(blocks.blocks[1].data_address(), address_b);
    assert_eq!(blocks.blocks[2].data_address(), address_c);

    // chain pointers: forward links close, first/last are open
    assert_eq!(blocks.blocks[0].prev_block, 0);
    assert_eq!(blocks.blocks[0].next_block, blocks.blocks[1].address);
    assert_eq!(blocks.blocks[1].prev_block, blocks.blocks[0].address);
    assert_eq!(blocks.blocks[2].next_block, 0);

    // the canary is stripped from payload views
    let payload = blocks.block_data(&blocks.blocks[0]);
    assert_eq!(payload, b"payload of block A.!");
    let raw = blocks.block_raw(&blocks.blocks[0]);
    assert_eq!(&raw[raw.len() - 4..], b"\xFD\x01\x10\xDF");

    blocks.resolve_names(&core);
    assert_eq!(
        blocks.blocks[0].alloc_name_resolved.as_deref(),
        Some("CEF: fib")
    );
    assert_eq!(
        blocks.blocks[1].alloc_name_resolved.as_deref(),
        Some("TTY data")
    );
    assert_eq!(blocks.blocks_named("CEF: fib").count(), 2);

    // scenario: a clean three-block chain passes all four checks
    let report = check_heap(&blocks);
    assert!(report.is_ok());
}

#[test]
fn test_free_block_chain_record() {
    let mut builder = CoreDumpBuilder::new();
    let name = builder.add_data_string("Free slot");
    builder.heap.add_block(name, 1, &[0u8; 16]);
    builder.heap.add_free_block(name, 32);
    builder.heap.add_block(name, 1, &[0u8; 16]);
    let dump = builder.build();

    let core = CoreDump::parse(&dump).unwrap();
    let (_, memory) = core.region_heap().unwrap();
    let blocks = MemoryBlocks::parse(memory.unwrap());
    assert_eq!(blocks.blocks.len(), 3);

    let free = &blocks.blocks[1];
    assert!(free.free);
    assert_eq!(free.next_free, Some(0));
    assert_eq!(free.prev_free, Some(0));
    // no canary on a free block: the payload view is the whole block body
    assert_eq!(blocks.block_data(free).len(), free.size);

    let in_use = &blocks.blocks[0];
    assert!(!in_use.free);
    assert_eq!(in_use.next_free, None);
    assert_eq!(in_use.prev_free, None);
}

#[test]
fn test_integrity_detects_violations() {
    let mut builder = CoreDumpBuilder::new();
    let name = builder.add_data_string("Init");
    builder.heap.add_block(name, 1, &[0u8; 16]);
    builder.heap.add_block(name, 1, &[0u8; 16]);
    builder.heap.add_block(name, 3, &[0u8; 16]);
    let mut dump = builder.build();

    // corrupt the canary of the last block and zero the prev pointer of the
    // third block (the second block's prev is needed for base recovery)
    let (heap_file_offset, canary_offset, prev_offset) = {
        let core = CoreDump::parse(&dump).unwrap();
        let (_, memory) = core.region_heap().unwrap();
        let heap_file_offset = dump.len() - memory.unwrap().len();
        let blocks = MemoryBlocks::parse(&dump[heap_file_offset..]);
        let last = &blocks.blocks[2];
        (
            heap_file_offset,
            heap_file_offset + last.index + 40 + last.size - 4,
            heap_file_offset + last.index + 24,
        )
    };
    dump[canary_offset..canary_offset + 4].copy_from_slice(&[0; 4]);
    dump[prev_offset..prev_offset + 4].copy_from_slice(&[0; 4]);

    let blocks = MemoryBlocks::parse(&dump[heap_file_offset..]);
    let report = check_heap(&blocks);
    assert!(!report.is_ok());
    assert_eq!(report.end_magic, vec![2]);
    assert_eq!(report.prev_block, vec![2]);
    assert!(report.start_magic.is_empty());
    assert!(report.next_block.is_empty());
}

/// Builds a dump whose process table spans two chained arrays: the
/// predecessor array holds three processes, the terminal array two.
fn process_table_dump() -> (Vec<u8>, Vec<String>) {
    let mut builder = CoreDumpBuilder::with_layout(DEFAULT_BASE_ADDRESS, 256, 1024, 32);
    let array_name = builder.add_data_string("Process Array");

    let mut process_addresses = Vec::new();
    let mut names = Vec::new();
    for index in 0..5usize {
        let name = format!("Proc {index}");
        let name_address = builder.add_data_string(&name);
        let structure = process_structure(
            692,
            &[
                (0xD0, name_address),        // process name pointer
                (0x6C, 0x8000_1000 + index as u32), // PC
                (0xD4, 3),                   // priority H
                (0x64, 4),                   // type we
                (0xB8, 1500),                // runtime
                (0xC8, 300),                 // invoked
                (0xF0, 9000),                // stack size
                (0xF8, 0),                   // no TTY
            ],
        );
        let process_name = builder.add_data_string(&format!("alloc {index}"));
        let address = builder.heap.add_block(process_name, 1, &structure);
        process_addresses.push(address);
        names.push(name);
    }

    // terminal array: next = 0, two processes
    let mut terminal = Vec::new();
    terminal.extend_from_slice(&0u32.to_be_bytes());
    terminal.extend_from_slice(&2u32.to_be_bytes());
    terminal.extend_from_slice(&process_addresses[3].to_be_bytes());
    terminal.extend_from_slice(&process_addresses[4].to_be_bytes());
    let terminal_address = builder.heap.add_block(array_name, 1, &terminal);

    // predecessor array: next points at the terminal array, three processes
    let mut predecessor = Vec::new();
    predecessor.extend_from_slice(&terminal_address.to_be_bytes());
    predecessor.extend_from_slice(&3u32.to_be_bytes());
    predecessor.extend_from_slice(&process_addresses[0].to_be_bytes());
    predecessor.extend_from_slice(&process_addresses[1].to_be_bytes());
    predecessor.extend_from_slice(&process_addresses[2].to_be_bytes());
    builder.heap.add_block(array_name, 1, &predecessor);

    (builder.build(), names)
}

#[test]
fn test_process_array_order_restored() {
    let (dump, names) = process_table_dump();
    let analysis = CoreDumpAnalysis::parse(&dump).unwrap();

    assert!(!analysis.ran_heuristics);
    assert_eq!(analysis.processes.len(), 5);
    // the predecessor array's three processes come first
    let recovered: Vec<&str> = analysis
        .processes
        .iter()
        .map(|slot| {
            slot.process
                .as_ref()
                .and_then(|process| process.name.as_deref())
                .unwrap_or("?")
        })
        .collect();
    assert_eq!(recovered, names.iter().map(String::as_str).collect::<Vec<_>>());
    for (index, slot) in analysis.processes.iter().enumerate() {
        assert_eq!(slot.pid, index + 1);
    }
}

#[test]
fn test_process_fields() {
    let (dump, _) = process_table_dump();
    let analysis = CoreDumpAnalysis::parse(&dump).unwrap();

    let process = analysis.processes[0].process.as_ref().unwrap();
    assert_eq!(process.error, None);
    assert_eq!(process.structure_len, Some(692));
    assert_eq!(process.pc, Some(0x8000_1000));
    assert_eq!(process.q, Some(3));
    assert_eq!(process.q_str, "H");
    assert_eq!(process.ty, Some(4));
    assert_eq!(process.ty_str, "we");
    assert_eq!(process.runtime, Some(1500));
    assert_eq!(process.invoked, Some(300));
    assert_eq!(process.stack2, Some(9000));
    assert_eq!(process.tty, Some(0));
    assert_eq!(process.name.as_deref(), Some("Proc 0"));

    let line = process.render_line();
    assert!(line.starts_with("   1 Hwe"));
    assert!(line.ends_with("Proc 0"));
}

#[test]
fn test_early_end_magic_is_ignored() {
    let mut builder = CoreDumpBuilder::new();
    let array_name = builder.add_data_string("Process Array");
    // a decoy terminator well before the searched range
    let structure = process_structure(692, &[(200, 0xBEEF_CAFE)]);
    let process_address = builder.heap.add_block(array_name, 1, &structure);

    let mut terminal = Vec::new();
    terminal.extend_from_slice(&0u32.to_be_bytes());
    terminal.extend_from_slice(&1u32.to_be_bytes());
    terminal.extend_from_slice(&process_address.to_be_bytes());
    builder.heap.add_block(array_name, 1, &terminal);
    let dump = builder.build();

    let analysis = CoreDumpAnalysis::parse(&dump).unwrap();
    let process = analysis.processes[0].process.as_ref().unwrap();
    assert_eq!(process.structure_len, Some(692));
}

#[test]
fn test_heuristics_discover_unknown_layout() {
    let mut builder = CoreDumpBuilder::with_layout(DEFAULT_BASE_ADDRESS, 256, 1024, 32);
    let array_name = builder.add_data_string("Process Array");

    let mut process_addresses = Vec::new();
    let mut name_addresses = Vec::new();
    for index in 0..3u32 {
        let name_address = builder.add_data_string(&format!("Heur {index}"));
        name_addresses.push(name_address);
        // unknown structure length 700 with name/Q/Ty columns planted
        let structure = process_structure(
            700,
            &[
                (0x40, name_address), // distinct pointers into the data region
                (0x50, 2 + index),    // priority range 2..=4
                (0x60, [0, 4, 5][index as usize]), // type range 0..=5
            ],
        );
        let alloc = builder.add_data_string(&format!("halloc {index}"));
        process_addresses.push(builder.heap.add_block(alloc, 1, &structure));
    }

    let mut terminal = Vec::new();
    terminal.extend_from_slice(&0u32.to_be_bytes());
    terminal.extend_from_slice(&3u32.to_be_bytes());
    for address in &process_addresses {
        terminal.extend_from_slice(&address.to_be_bytes());
    }
    builder.heap.add_block(array_name, 1, &terminal);
    let dump = builder.build();

    let analysis = CoreDumpAnalysis::parse(&dump).unwrap();
    assert!(analysis.ran_heuristics);
    assert_eq!(analysis.heuristics_size, Some(700));

    let layout = analysis.heuristics_layout.unwrap();
    assert_eq!(layout.address_process_name, Some(0x40));
    assert_eq!(layout.q, Some(0x50));
    assert_eq!(layout.ty, Some(0x60));
    assert_eq!(layout.address_stack_block, Some(0x00));
    assert_eq!(layout.pc, None);

    // the re-parse resolves names through the discovered layout
    let process = analysis.processes[1].process.as_ref().unwrap();
    assert_eq!(process.error, None);
    assert_eq!(process.name.as_deref(), Some("Heur 1"));
    assert_eq!(process.q, Some(3));
    assert_eq!(process.q_str, "H");
}

#[test]
fn test_history_and_events() {
    let mut builder = CoreDumpBuilder::new();
    let init_name = builder.add_data_string("Init");

    let mut payload = vec![0u8; 4];
    payload.extend_from_slice(b"CMD: 'show running-config' 10:23:33 UTC Mon Mar  1 2021");
    payload.push(0);
    payload.extend_from_slice(b"CMD: 'show version' 09:11:02 UTC Mon Mar  1 2021");
    payload.push(0);
    payload.extend_from_slice(b"*Mar  1 00:01:07.607: %SYS-5-CONFIG_I: Configured from console");
    payload.push(0);
    if payload.len() % 2 != 0 {
        payload.push(0);
    }
    builder.heap.add_block(init_name, 1, &payload);
    builder.heap.add_block(init_name, 1, &[0u8; 16]);
    let dump = builder.build();

    let core = CoreDump::parse(&dump).unwrap();
    let (_, memory) = core.region_heap().unwrap();
    let mut heap = MemoryBlocks::parse(memory.unwrap());
    heap.resolve_names(&core);

    let history = command_history(&heap);
    assert_eq!(history.len(), 2);
    // sorted ascending: show version at 09:11 precedes show running-config
    assert_eq!(history[0].command, "show version");
    assert_eq!(history[1].command, "show running-config");
    assert!(history[0].time < history[1].time);

    let events = logged_events(&heap);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].millis, "607");
    assert_eq!(
        events[0].message,
        "%SYS-5-CONFIG_I: Configured from console"
    );
}

#[test]
fn test_check_text_identical_and_divergent() {
    let text: Vec<u8> = (0u8..=255).cycle().take(400).collect();

    // the comparison starts (text_address & 0xFF) bytes into the section
    let text_address = DEFAULT_BASE_ADDRESS + 64;
    let start = (text_address & 0xFF) as usize;
    assert_eq!(start, 64);

    let mut builder = CoreDumpBuilder::new();
    builder.set_text(&text[start..start + 256]);
    let init = builder.add_data_string("Init");
    builder.add_data_string(
        "CW_BEGIN$CW_SYSDESCR$IOS (tm) C2600 Software (C2600-I-M)$CW_END$",
    );
    builder.heap.add_block(init, 1, &[0u8; 16]);
    builder.heap.add_block(init, 1, &[0u8; 16]);
    let dump = builder.build();
    let core = CoreDump::parse(&dump).unwrap();

    let inner = relic_testutils::inner_elf(&text);
    let image_bytes = relic_testutils::ios_image(
        b"CW_BEGIN$CW_SYSDESCR$IOS (tm) C2600 Software (C2600-I-MZ)$CW_END$",
        &[0u8; 16],
        "c2600-i-mz",
        &inner,
    );
    let image = relic_image::IosImage::parse(&image_bytes);
    assert_eq!(image.error, None);

    assert!(matches!(
        check_sysdescr(&core, &image),
        SysdescrComparison::Equivalent(_)
    ));
    let report = check_text(&core, &image).unwrap();
    assert_eq!(report.different, 0);
    assert!(report.is_identical());

    // flip one byte in the dump's text region and the check pinpoints it
    let mut divergent = dump.clone();
    divergent[64 + 10] ^= 0xFF;
    let core = CoreDump::parse(&divergent).unwrap();
    let report = check_text(&core, &image).unwrap();
    assert_eq!(report.different, 1);
    assert_eq!(report.first_difference, Some(text_address + 10));
}

#[test]
fn test_sysdescr_survives_unusable_image() {
    let mut builder = CoreDumpBuilder::new();
    let init = builder.add_data_string("Init");
    builder.add_data_string("CW_BEGIN$CW_SYSDESCR$IOS (tm) C2600 Software$CW_END$");
    builder.heap.add_block(init, 1, &[0u8; 16]);
    builder.heap.add_block(init, 1, &[0u8; 16]);
    let dump = builder.build();
    let core = CoreDump::parse(&dump).unwrap();

    // not an image at all: the text comparison aborts, the sysdescr verdict
    // is still produced from the dump side
    let image = relic_image::IosImage::parse(b"not an image");
    assert!(image.error.is_some());
    assert_eq!(
        check_sysdescr(&core, &image),
        SysdescrComparison::Different {
            core: "IOS (tm) C2600 Software".to_owned(),
            image: String::new(),
        }
    );
    assert_eq!(
        check_text(&core, &image),
        Err(TextCheckError::ImageUnusable)
    );
}
