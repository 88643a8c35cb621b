//! End-to-end pipeline scenarios with hand-assembled container bytes.

use std::io::Write as _;

use rasterstack::{CodecError, Reference, translate};

// ── Fixture builders ────────────────────────────────────────────────

fn png_chunk(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut crc = flate2::Crc::new();
    crc.update(kind);
    crc.update(data);

    let mut out = Vec::new();
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    out.extend_from_slice(&crc.sum().to_be_bytes());
    out
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::best());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Assemble a PNG from an IHDR tuple, optional PLTE/tRNS, and raw
/// (already filtered) scanline bytes.
fn build_png(
    (w, h, depth, color_type, interlace): (u32, u32, u8, u8, u8),
    plte: Option<&[u8]>,
    trns: Option<&[u8]>,
    scanlines: &[u8],
) -> Vec<u8> {
    let mut ihdr = Vec::new();
    ihdr.extend_from_slice(&w.to_be_bytes());
    ihdr.extend_from_slice(&h.to_be_bytes());
    ihdr.extend_from_slice(&[depth, color_type, 0, 0, interlace]);

    let mut png = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    png.extend_from_slice(&png_chunk(b"IHDR", &ihdr));
    if let Some(plte) = plte {
        png.extend_from_slice(&png_chunk(b"PLTE", plte));
    }
    if let Some(trns) = trns {
        png.extend_from_slice(&png_chunk(b"tRNS", trns));
    }
    png.extend_from_slice(&png_chunk(b"IDAT", &deflate(scanlines)));
    png.extend_from_slice(&png_chunk(b"IEND", &[]));
    png
}

/// Assemble a BI_RGB BMP with a file header and 40-byte info header.
fn build_bmp_rgb(w: i32, h: i32, bpp: u16, palette: &[u8], pixel_data: &[u8]) -> Vec<u8> {
    build_bmp(w, h, bpp, 0, 0, palette, pixel_data)
}

fn build_bmp(
    w: i32,
    h: i32,
    bpp: u16,
    compression: u32,
    clr_used: u32,
    palette: &[u8],
    pixel_data: &[u8],
) -> Vec<u8> {
    let offset = 14 + 40 + palette.len();
    let total = offset + pixel_data.len();

    let mut bmp = Vec::with_capacity(total);
    bmp.extend_from_slice(b"BM");
    bmp.extend_from_slice(&(total as u32).to_le_bytes());
    bmp.extend_from_slice(&[0; 4]);
    bmp.extend_from_slice(&(offset as u32).to_le_bytes());

    bmp.extend_from_slice(&40u32.to_le_bytes());
    bmp.extend_from_slice(&w.to_le_bytes());
    bmp.extend_from_slice(&h.to_le_bytes());
    bmp.extend_from_slice(&1u16.to_le_bytes());
    bmp.extend_from_slice(&bpp.to_le_bytes());
    bmp.extend_from_slice(&compression.to_le_bytes());
    bmp.extend_from_slice(&(pixel_data.len() as u32).to_le_bytes());
    bmp.extend_from_slice(&0u32.to_le_bytes());
    bmp.extend_from_slice(&0u32.to_le_bytes());
    bmp.extend_from_slice(&clr_used.to_le_bytes());
    bmp.extend_from_slice(&0u32.to_le_bytes());
    bmp.extend_from_slice(palette);
    bmp.extend_from_slice(pixel_data);
    bmp
}

fn decode_to(format: &str, data: &[u8], source_format: &str) -> Vec<u8> {
    let source = Reference::from_slice(data).with_format(source_format);
    let mut destination = Reference::new_owned().with_format(format);
    translate(&source, &mut destination, false).unwrap();
    destination.data().to_vec()
}

// ── S1: 24-bit BI_RGB BMP through PNG ───────────────────────────────

/// 2x2 bottom-up BMP: red and green on the bottom row, blue and white on
/// the top.
fn s1_bmp() -> Vec<u8> {
    let mut rows = Vec::new();
    rows.extend_from_slice(&[0x00, 0x00, 0xFF, 0x00, 0xFF, 0x00, 0, 0]); // bottom: red, green
    rows.extend_from_slice(&[0xFF, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0, 0]); // top: blue, white
    build_bmp_rgb(2, 2, 24, &[], &rows)
}

#[rustfmt::skip]
const S1_RGBA_TOP_DOWN: [u8; 16] = [
    0, 0, 255, 255,   255, 255, 255, 255,
    255, 0, 0, 255,   0, 255, 0, 255,
];

#[test]
fn s1_bmp_decodes_top_down_rgba() {
    let rgba = decode_to("R8G8B8A8*REPA255", &s1_bmp(), ".BMP");
    assert_eq!(rgba, S1_RGBA_TOP_DOWN);
}

#[test]
fn s1_bmp_to_png_roundtrip() {
    let bmp = s1_bmp();
    let source = Reference::from_slice(&bmp).with_format(".BMP");
    let mut png = Reference::new_owned().with_format("R8G8B8A8*PAD1.PNG");
    translate(&source, &mut png, false).unwrap();

    assert_eq!(&png.data()[..8], &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);
    assert_eq!((png.w, png.h), (2, 2));

    let rgba = decode_to("R8G8B8A8", png.data(), ".PNG");
    assert_eq!(rgba, S1_RGBA_TOP_DOWN);
}

// ── S2: indexed PNG with tRNS ───────────────────────────────────────

#[test]
fn s2_palette_png_with_trns_alpha() {
    let plte = [255, 0, 0, 0, 255, 0, 0, 0, 255, 0, 0, 0];
    let trns = [255, 128, 0];
    let png = build_png(
        (4, 1, 8, 3, 0),
        Some(&plte),
        Some(&trns),
        &[0, 0, 1, 2, 3],
    );

    let rgba = decode_to("R8G8B8A8", &png, ".PNG");
    #[rustfmt::skip]
    assert_eq!(rgba, vec![
        255, 0, 0, 255,
        0, 255, 0, 128,
        0, 0, 255, 0,
        0, 0, 0, 255,
    ]);
}

// ── S3: baseline JPEG, one white MCU ────────────────────────────────

/// 8x8 baseline 4:4:4 YCbCr JPEG whose single MCU decodes fully white:
/// flat quantization tables of 8, luma DC difference 127 (category 7),
/// zero chroma.
fn s3_jpeg(components: u8) -> Vec<u8> {
    let mut jpeg = vec![0xFF, 0xD8];

    // DQT: table 0, 8-bit precision, all entries 8.
    jpeg.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x43, 0x00]);
    jpeg.extend_from_slice(&[8u8; 64]);

    // SOF0: 8-bit, 8x8, n components, all 1x1 sampling, table 0.
    let sof_len = 8 + 3 * u16::from(components);
    jpeg.extend_from_slice(&[0xFF, 0xC0]);
    jpeg.extend_from_slice(&sof_len.to_be_bytes());
    jpeg.extend_from_slice(&[8, 0, 8, 0, 8, components]);
    for id in 1..=components {
        jpeg.extend_from_slice(&[id, 0x11, 0]);
    }

    // DHT: DC table 0 with codes 00 -> 0 and 01 -> 7.
    jpeg.extend_from_slice(&[0xFF, 0xC4, 0x00, 0x15, 0x00]);
    let mut counts = [0u8; 16];
    counts[1] = 2;
    jpeg.extend_from_slice(&counts);
    jpeg.extend_from_slice(&[0, 7]);

    // DHT: AC table 0 with the single code 0 -> EOB.
    jpeg.extend_from_slice(&[0xFF, 0xC4, 0x00, 0x14, 0x10]);
    let mut counts = [0u8; 16];
    counts[0] = 1;
    jpeg.extend_from_slice(&counts);
    jpeg.push(0);

    // SOS over all components, spectral range 0..=63.
    let sos_len = 6 + 2 * u16::from(components);
    jpeg.extend_from_slice(&[0xFF, 0xDA]);
    jpeg.extend_from_slice(&sos_len.to_be_bytes());
    jpeg.push(components);
    for id in 1..=components {
        jpeg.extend_from_slice(&[id, 0x00]);
    }
    jpeg.extend_from_slice(&[0, 63, 0]);

    // Entropy: luma DC `01` + 1111111 (+127), EOB; chroma DC `00`, EOB.
    // For one component that is 10 bits; for three, 16 bits.
    match components {
        1 => jpeg.extend_from_slice(&[0b0111_1111, 0b1000_0000]),
        3 => jpeg.extend_from_slice(&[0b0111_1111, 0b1000_0000]),
        _ => unreachable!(),
    }

    jpeg.extend_from_slice(&[0xFF, 0xD9]);
    jpeg
}

#[test]
fn s3_baseline_jpeg_decodes_white() {
    let rgb = decode_to("R8G8B8", &s3_jpeg(3), ".JPG");
    assert_eq!(rgb.len(), 64 * 3);
    assert!(rgb.iter().all(|&v| v == 255), "{rgb:?}");
}

#[test]
fn s3_grayscale_jpeg_decodes_white() {
    let gray = decode_to("G8", &s3_jpeg(1), ".JPG");
    assert_eq!(gray, vec![255u8; 64]);
}

#[test]
fn jpeg_restart_markers_reset_predictors() {
    // 16x8 grayscale: two MCUs with a restart between them, both white.
    let mut jpeg = vec![0xFF, 0xD8];
    jpeg.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x43, 0x00]);
    jpeg.extend_from_slice(&[8u8; 64]);
    jpeg.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 8, 0, 8, 0, 16, 1, 1, 0x11, 0]);
    jpeg.extend_from_slice(&[0xFF, 0xC4, 0x00, 0x15, 0x00]);
    let mut counts = [0u8; 16];
    counts[1] = 2;
    jpeg.extend_from_slice(&counts);
    jpeg.extend_from_slice(&[0, 7]);
    jpeg.extend_from_slice(&[0xFF, 0xC4, 0x00, 0x14, 0x10]);
    let mut counts = [0u8; 16];
    counts[0] = 1;
    jpeg.extend_from_slice(&counts);
    jpeg.push(0);
    // DRI: restart every MCU.
    jpeg.extend_from_slice(&[0xFF, 0xDD, 0x00, 0x04, 0x00, 0x01]);
    jpeg.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 1, 1, 0x00, 0, 63, 0]);
    jpeg.extend_from_slice(&[0b0111_1111, 0b1000_0000]);
    jpeg.extend_from_slice(&[0xFF, 0xD0]);
    jpeg.extend_from_slice(&[0b0111_1111, 0b1000_0000]);
    jpeg.extend_from_slice(&[0xFF, 0xD9]);

    let gray = decode_to("G8", &jpeg, ".JPG");
    assert_eq!(gray, vec![255u8; 16 * 8]);
}

// ── S4: 16-bit bitfields BMP ────────────────────────────────────────

#[test]
fn s4_rgb565_bitfields() {
    // One RGB565 pixel, 0xF81F: full red and blue, zero green.
    let mut data = Vec::new();
    data.extend_from_slice(&0xF800u32.to_le_bytes()); // red mask
    data.extend_from_slice(&0x07E0u32.to_le_bytes()); // green mask
    data.extend_from_slice(&0x001Fu32.to_le_bytes()); // blue mask
    let masks_then_pixels = [data.as_slice(), &[0x1F, 0xF8, 0, 0]].concat();
    let bmp = build_bmp(1, 1, 16, 3, 0, &[], &masks_then_pixels);

    let rgb = decode_to("R8G8B8", &bmp, ".BMP");
    assert_eq!(rgb, vec![255, 0, 255]);
}

// ── S5: area-weighted downscale ─────────────────────────────────────

#[test]
fn s5_checkerboard_downscale() {
    let mut pixels = Vec::new();
    for y in 0..4 {
        for x in 0..4 {
            let v = if (x + y) % 2 == 0 { 0u8 } else { 255 };
            pixels.extend_from_slice(&[v, v, v]);
        }
    }
    let source = Reference::from_slice(&pixels)
        .with_format("R8G8B8*ALPHA_")
        .with_size(4, 4);
    let mut destination = Reference::new_owned()
        .with_format("R8G8B8*ALPHA_")
        .with_size(2, 2);
    translate(&source, &mut destination, true).unwrap();

    // Each destination pixel covers two black and two white source
    // pixels: the normalized average is exactly 0.5, which rounds half
    // to even, giving 128.
    assert_eq!(destination.data(), vec![128u8; 12].as_slice());
}

// ── S6: Adam7 roundtrip ─────────────────────────────────────────────

#[test]
fn s6_adam7_roundtrip_7x7() {
    let mut rgba = Vec::new();
    for y in 0u8..7 {
        for x in 0u8..7 {
            rgba.extend_from_slice(&[x * 30, y * 30, x * 10 + y, 255 - x - y]);
        }
    }

    let source = Reference::from_slice(&rgba)
        .with_format("R8G8B8A8")
        .with_size(7, 7);
    let mut png = Reference::new_owned().with_format(".PNG");
    translate(&source, &mut png, false).unwrap();

    let decoded = decode_to("R8G8B8A8", png.data(), ".PNG");
    assert_eq!(decoded, rgba);
}

// ── Further container coverage ──────────────────────────────────────

#[test]
fn rle8_bmp_decodes_through_palette() {
    // 4x2 indexed: bottom row an encoded run of 4 black, top row a
    // literal run alternating white and black.
    let palette = [0u8, 0, 0, 0, 255, 255, 255, 0];
    let rle = [4, 0, 0, 0, 0, 4, 1, 0, 1, 0, 0, 1];
    let bmp = build_bmp(4, 2, 8, 1, 2, &palette, &rle);

    let rgb = decode_to("R8G8B8", &bmp, ".BMP");
    #[rustfmt::skip]
    assert_eq!(rgb, vec![
        255, 255, 255,  0, 0, 0,  255, 255, 255,  0, 0, 0,
        0, 0, 0,  0, 0, 0,  0, 0, 0,  0, 0, 0,
    ]);
}

#[test]
fn rle_delta_skips_are_zero_filled() {
    // 4x2 indexed RLE8: one pixel, then a delta of (2, 1), one more
    // pixel, end of bitmap. Skipped pixels read as palette entry 0.
    let palette = [10u8, 20, 30, 0, 200, 210, 220, 0];
    let rle = [1, 1, 0, 2, 2, 1, 1, 1, 0, 1];
    let bmp = build_bmp(4, 2, 8, 1, 2, &palette, &rle);

    let rgb = decode_to("R8G8B8", &bmp, ".BMP");
    // Bottom row starts with entry 1; the delta lands at (3, top row).
    #[rustfmt::skip]
    assert_eq!(rgb, vec![
        30, 20, 10,  30, 20, 10,  30, 20, 10,  220, 210, 200,
        220, 210, 200,  30, 20, 10,  30, 20, 10,  30, 20, 10,
    ]);
}

#[test]
fn grayscale_1bit_png() {
    // 8x1, bits 10110100.
    let png = build_png((8, 1, 1, 0, 0), None, None, &[0, 0b1011_0100]);
    let gray = decode_to("G8", &png, ".PNG");
    assert_eq!(gray, vec![255, 0, 255, 255, 0, 255, 0, 0]);
}

#[test]
fn truecolor_png_chroma_key() {
    // 2x1 truecolor with a green tRNS key.
    let trns = [0, 0, 0, 255, 0, 0];
    let scanline = [0u8, 0, 255, 0, 255, 0, 0];
    let png = build_png((2, 1, 8, 2, 0), None, Some(&trns), &scanline);

    let rgba = decode_to("R8G8B8A8", &png, ".PNG");
    assert_eq!(rgba, vec![0, 255, 0, 0, 255, 0, 0, 255]);
}

#[test]
fn adam7_roundtrip_4x4() {
    // 4x4 gradient through our own Adam7 encoder and back.
    let mut rgba = Vec::new();
    for y in 0u8..4 {
        for x in 0u8..4 {
            rgba.extend_from_slice(&[x * 60, y * 60, x + y, 255]);
        }
    }
    let source = Reference::from_slice(&rgba)
        .with_format("R8G8B8A8")
        .with_size(4, 4);
    let mut png = Reference::new_owned().with_format(".PNG");
    translate(&source, &mut png, false).unwrap();
    assert_eq!(decode_to("R8G8B8A8", png.data(), ".PNG"), rgba);
}

#[test]
fn anyf_detects_all_three_containers() {
    let bmp = s1_bmp();
    assert_eq!(decode_to("R8G8B8A8", &bmp, ".ANYF"), S1_RGBA_TOP_DOWN);

    let png = build_png((8, 1, 1, 0, 0), None, None, &[0, 0b1011_0100]);
    assert_eq!(
        decode_to("G8", &png, ".ANYF"),
        vec![255, 0, 255, 255, 0, 255, 0, 0]
    );

    let jpeg = s3_jpeg(1);
    assert_eq!(decode_to("G8", &jpeg, ".ANYF"), vec![255u8; 64]);
}

#[test]
fn anyf_rejects_unknown_magic() {
    let source = Reference::from_slice(b"farbfeld........").with_format(".ANYF");
    let mut destination = Reference::new_owned().with_format("R8G8B8");
    assert!(matches!(
        translate(&source, &mut destination, false),
        Err(CodecError::UnrecognizedFormat)
    ));
}

#[test]
fn jpeg_encode_is_refused() {
    let pixels = [0u8; 3];
    let source = Reference::from_slice(&pixels)
        .with_format("R8G8B8")
        .with_size(1, 1);
    let mut destination = Reference::new_owned().with_format(".JPG");
    assert!(matches!(
        translate(&source, &mut destination, false),
        Err(CodecError::UnsupportedVariant(_))
    ));
}

#[test]
fn arithmetic_jpeg_is_refused() {
    // SOF9 (arithmetic sequential) frame.
    let mut jpeg = vec![0xFF, 0xD8];
    jpeg.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x43, 0x00]);
    jpeg.extend_from_slice(&[8u8; 64]);
    jpeg.extend_from_slice(&[0xFF, 0xC9, 0x00, 0x0B, 8, 0, 8, 0, 8, 1, 1, 0x11, 0]);
    jpeg.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 1, 1, 0x00, 0, 63, 0]);
    jpeg.push(0x00);
    jpeg.extend_from_slice(&[0xFF, 0xD9]);

    let source = Reference::from_slice(&jpeg).with_format(".JPG");
    let mut destination = Reference::new_owned().with_format("R8G8B8");
    assert!(matches!(
        translate(&source, &mut destination, false),
        Err(CodecError::UnsupportedVariant(_))
    ));
}
