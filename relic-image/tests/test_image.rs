use relic_image::{calc_checksum, CwStrings, Elf, ElfError, ImageError, IosImage};

const CW_REGION: &[u8] =
    b"pad CW_BEGIN$CW_VERSION$12.4(13r)$CW_FAMILY$C2600$CW_SYSDESCR$Cisco IOS (tm) C2600$CW_END$ pad";
const DIGEST: [u8; 16] = [
    0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE,
    0xFF,
];

fn fixture() -> Vec<u8> {
    let inner = relic_testutils::inner_elf(b"executable text segment of the inner image");
    relic_testutils::ios_image(CW_REGION, &DIGEST, "c2600-i-mz.124-13r", &inner)
}

#[test]
fn test_parse_sections_and_metadata() {
    let data = fixture();
    let image = IosImage::parse(&data);

    assert_eq!(image.error, None);
    assert_eq!(image.elf.error, None);
    assert_eq!(image.elf.section_count, 6);
    assert!(image.compressed_section().is_some());
    assert!(image.embedded_md5_section().is_some());
    assert!(image.cw_section().is_some());

    assert_eq!(
        image.embedded_md5.as_deref(),
        Some("00112233445566778899aabbccddeeff")
    );
    let strings = image.cw_strings.as_ref().unwrap();
    assert_eq!(strings.error, None);
    assert_eq!(strings.get_str(b"CW_VERSION").as_deref(), Some("12.4(13r)"));
    assert_eq!(strings.get_str(b"CW_FAMILY").as_deref(), Some("C2600"));
}

#[test]
fn test_checksums_match_declared() {
    let data = fixture();
    let image = IosImage::parse(&data);

    assert_eq!(
        image.checksum_compressed,
        image.calculated_checksum_compressed
    );
    assert_eq!(
        image.checksum_uncompressed,
        image.calculated_checksum_uncompressed
    );
    let inner = image.image_uncompressed.as_deref().unwrap();
    assert_eq!(image.size_uncompressed, Some(inner.len() as u32));
    assert_eq!(image.calculated_checksum_uncompressed, Some(calc_checksum(inner)));
    assert_eq!(
        image.image_uncompressed_name.as_deref(),
        Some("c2600-i-mz.124-13r")
    );
}

#[test]
fn test_fallback_section_names() {
    let data = fixture();
    let elf = Elf::parse(&data);
    assert_eq!(elf.error, None);
    let names: Vec<&str> = elf.sections.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["", ".rodata", ".data", ".sdata", ".sbss", ".bss"]);
}

#[test]
fn test_header_reserialization_is_byte_identical() {
    let data = fixture();
    let elf = Elf::parse(&data);
    assert_eq!(elf.error, None);

    let total_data: u32 = elf.sections.iter().map(|s| s.size).sum();
    let mut rebuilt = Vec::new();
    rebuilt.extend_from_slice(elf.header());
    rebuilt.extend_from_slice(&elf.program_header(total_data));
    for section in &elf.sections {
        rebuilt.extend_from_slice(section.header());
    }
    assert_eq!(rebuilt.as_slice(), &data[..rebuilt.len()]);
}

#[test]
fn test_pack_round_trip() {
    let data = fixture();
    let image = IosImage::parse(&data);
    let inner = image.image_uncompressed.clone().unwrap();
    let name = image.image_uncompressed_name.clone().unwrap();

    let packed = image.pack(&name, &inner).unwrap();
    let repacked = IosImage::parse(&packed);

    assert_eq!(repacked.elf.error, None);
    assert_eq!(repacked.error, None);
    let strings = repacked.cw_strings.as_ref().unwrap();
    let original = image.cw_strings.as_ref().unwrap();
    assert_eq!(
        strings.get_str(b"CW_VERSION"),
        original.get_str(b"CW_VERSION")
    );
    assert_eq!(strings.get_str(b"CW_FAMILY"), original.get_str(b"CW_FAMILY"));

    // the payload is unchanged, so its checksum survives the round trip
    assert_eq!(
        repacked.calculated_checksum_uncompressed,
        image.calculated_checksum_uncompressed
    );
    // and the freshly declared checksums agree with the recalculated ones
    assert_eq!(
        repacked.checksum_compressed,
        repacked.calculated_checksum_compressed
    );
    assert_eq!(
        repacked.checksum_uncompressed,
        repacked.calculated_checksum_uncompressed
    );
    assert_eq!(repacked.image_uncompressed.as_deref(), Some(&inner[..]));
}

#[test]
fn test_ida_patch_changes_only_machine_field() {
    let data = fixture();
    let image = IosImage::parse(&data);
    let original = image.image_uncompressed.as_deref().unwrap();
    let patched = image.image_uncompressed_ida().unwrap();

    assert_eq!(patched.len(), original.len());
    assert_eq!(&patched[18..20], b"\x00\x14");
    for (index, (a, b)) in original.iter().zip(patched.iter()).enumerate() {
        if !(18..20).contains(&index) {
            assert_eq!(a, b, "byte {index} changed");
        }
    }
}

#[test]
fn test_missing_feedface_is_error_4() {
    // an image whose payload section was stripped of its magic
    let mut data = fixture();
    let position = data
        .windows(4)
        .position(|window| window == b"\xFE\xED\xFA\xCE")
        .unwrap();
    data[position] = 0x00;
    let image = IosImage::parse(&data);
    assert_eq!(image.error, Some(ImageError::CompressedMissing));
    assert_eq!(image.error.map(ImageError::code), Some(4));
}

#[test]
fn test_elf_failure_is_error_1() {
    let image = IosImage::parse(b"not an elf at all");
    assert_eq!(image.error, Some(ImageError::Elf));
    assert_eq!(image.elf.error, Some(ElfError::BadMagic));
}

#[test]
fn test_corrupt_zip_is_error_5() {
    let mut data = fixture();
    // destroy the end-of-central-directory record of the payload archive
    let position = data
        .windows(4)
        .rposition(|window| window == b"PK\x05\x06")
        .unwrap();
    data[position..position + 4].copy_from_slice(&[0; 4]);
    let image = IosImage::parse(&data);
    assert_eq!(image.error, Some(ImageError::ZipParse));
    assert_eq!(image.error.map(ImageError::code), Some(5));
}

#[test]
fn test_cw_strings_from_section_bytes() {
    let strings = CwStrings::parse(CW_REGION);
    assert_eq!(strings.error, None);
    assert_eq!(strings.len(), 3);
}
