use relic_carve::{recover_iomem_frames, Frames, RecoverError};
use relic_coredump::{CoreDump, MemoryBlocks};
use relic_testutils::{CoreDumpBuilder, HeapBuilder};

const IOMEM_BASE: u32 = 0x0E00_0000;

/// Builds an IOMEM capture with two recoverable frames and returns the
/// capture plus each frame's (address, bytes).
fn iomem_fixture() -> (Vec<u8>, Vec<(u32, Vec<u8>)>) {
    let mut iomem = HeapBuilder::new(IOMEM_BASE);
    let frame_a = b"\xFF\xFF\xFF\xFF\xFF\xFF\x00\x11\x22\x33\x44\x55\x08\x06frameA".to_vec();
    let frame_b = b"\x00\x11\x22\x33\x44\x55\x66\x77\x88\x99\xAA\xBB\x08\x00frameBB!".to_vec();
    let address_a = iomem.add_block(0, 1, &frame_a);
    let address_b = iomem.add_block(0, 1, &frame_b);
    iomem.add_block(0, 1, &[0u8; 16]);
    (
        iomem.build(),
        vec![(address_a, frame_a), (address_b, frame_b)],
    )
}

/// A `*Packet Header*` payload pointing at `address` with `size` at the
/// primary or fallback offset.
fn packet_header_payload(address: u32, size: u16, use_fallback: bool) -> Vec<u8> {
    let mut payload = vec![0u8; 76];
    payload[40..44].copy_from_slice(&address.to_be_bytes());
    if use_fallback {
        payload[72..74].copy_from_slice(&1u16.to_be_bytes());
        payload[68..70].copy_from_slice(&size.to_be_bytes());
    } else {
        payload[72..74].copy_from_slice(&size.to_be_bytes());
    }
    payload
}

#[test]
fn test_recover_frames_from_iomem() {
    let (iomem, frames_in_iomem) = iomem_fixture();

    let mut builder = CoreDumpBuilder::new();
    let name = builder.add_data_string("*Packet Header*");
    let other = builder.add_data_string("Init");
    for (index, (address, bytes)) in frames_in_iomem.iter().enumerate() {
        let payload = packet_header_payload(*address, bytes.len() as u16, index == 1);
        builder.heap.add_block(name, 1, &payload);
    }
    // a block with zero frame address is skipped
    builder.heap.add_block(name, 1, &packet_header_payload(0, 64, false));
    builder.heap.add_block(other, 1, &[0u8; 16]);
    let dump = builder.build();

    let core = CoreDump::parse(&dump).unwrap();
    let (_, memory) = core.region_heap().unwrap();
    let mut heap = MemoryBlocks::parse(memory.unwrap());
    heap.resolve_names(&core);

    let mut frames = Frames::new();
    let recovered = recover_iomem_frames(&heap, &iomem, &mut frames).unwrap();

    assert_eq!(recovered.len(), 2);
    assert_eq!(frames.count_frames, 2);
    for (found, (address, bytes)) in recovered.iter().zip(&frames_in_iomem) {
        assert_eq!(found.address, *address);
        assert_eq!(found.index, (*address - IOMEM_BASE) as u64);
        assert_eq!(found.size, bytes.len());
    }
    // the carved bytes are the original frames
    let collected = frames.frames();
    assert_eq!(&collected[0].1, &frames_in_iomem[0].1);
    assert_eq!(&collected[1].1, &frames_in_iomem[1].1);
}

#[test]
fn test_recover_rejects_unparseable_iomem() {
    let mut builder = CoreDumpBuilder::new();
    let name = builder.add_data_string("*Packet Header*");
    builder.heap.add_block(name, 1, &packet_header_payload(0x0E00_0100, 32, false));
    builder.heap.add_block(name, 1, &[0u8; 16]);
    let dump = builder.build();

    let core = CoreDump::parse(&dump).unwrap();
    let (_, memory) = core.region_heap().unwrap();
    let mut heap = MemoryBlocks::parse(memory.unwrap());
    heap.resolve_names(&core);

    let mut frames = Frames::new();
    assert_eq!(
        recover_iomem_frames(&heap, &[0u8; 256], &mut frames),
        Err(RecoverError::IomemUnparseable)
    );
}

#[test]
fn test_recovered_frames_reach_pcap() {
    let (iomem, frames_in_iomem) = iomem_fixture();

    let mut builder = CoreDumpBuilder::new();
    let name = builder.add_data_string("*Packet Header*");
    let payload = packet_header_payload(frames_in_iomem[0].0, frames_in_iomem[0].1.len() as u16, false);
    builder.heap.add_block(name, 1, &payload);
    builder.heap.add_block(name, 1, &[0u8; 16]);
    let dump = builder.build();

    let core = CoreDump::parse(&dump).unwrap();
    let (_, memory) = core.region_heap().unwrap();
    let mut heap = MemoryBlocks::parse(memory.unwrap());
    heap.resolve_names(&core);

    let mut frames = Frames::new();
    recover_iomem_frames(&heap, &iomem, &mut frames).unwrap();

    let mut pcap = Vec::new();
    frames.write_pcap(&mut pcap).unwrap();
    let frame = &frames_in_iomem[0].1;
    assert_eq!(pcap.len(), 24 + 16 + frame.len());
    assert_eq!(&pcap[24 + 16..], frame.as_slice());
}
