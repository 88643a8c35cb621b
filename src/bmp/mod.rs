//! BMP container: header dispatch, palette and bitfield extraction, RLE
//! decoding, and the 32-bit BGRA output writer.
//!
//! Header parsing dispatches on the info-header size discriminant
//! (12, 40, 52, 56, 64, 108, 124). Decoding builds a stage stack of
//! (outermost first) optional [`Rle`], then [`Orient`] for the bottom-up
//! row order, then [`Palette`] for indexed depths. Output always writes a
//! `BITMAPV4HEADER` with 32bpp `BI_BITFIELDS` BGRA masks.

use crate::bitio::{BitOrder, BitReader, BitWriter};
use crate::error::CodecError;
use crate::format::Format;
use crate::pixel::{Channel, Pixel, PixelFormat};
use crate::pixelio::{PixelReader, PixelWriter};
use crate::reference::Reference;
use crate::stage::{Orient, Palette, Stage, StageBase};
use crate::translate::HeaderWriter;

const BI_RGB: u32 = 0;
const BI_RLE8: u32 = 1;
const BI_RLE4: u32 = 2;
const BI_BITFIELDS: u32 = 3;

/// BITMAPFILEHEADER length.
const FILE_HEADER_BYTES: usize = 14;
/// BITMAPV4HEADER length, used for output.
const V4_HEADER_BYTES: usize = 108;

// ── RLE stage ───────────────────────────────────────────────────────

/// BMP run-length decoding at 4- or 8-bit granules.
#[derive(Clone, PartialEq)]
pub struct Rle {
    pub(crate) base: StageBase,
    /// Bits per palette index in the stream: 4 for RLE4, 8 for RLE8.
    pub(crate) granule: u32,
}

impl Rle {
    pub(crate) fn new(size: usize, pixel: &PixelFormat, granule: u32) -> Self {
        Self {
            base: StageBase::new(size, pixel),
            granule,
        }
    }

    pub(crate) fn decompress(
        &self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        assert!(
            8 % self.granule == 0 && fmt.pixel.bits == self.granule,
            "RLE granule must match the indexed pixel width"
        );

        let mut reader = PixelReader::new(fmt, source);

        fmt.offset = 0;
        fmt.pixel.copy_from(&self.base.pixel);
        crate::format::sync(fmt, destination);

        let mut writer = PixelWriter::new(fmt, destination);

        let cycle = (8 / self.granule) as usize;
        let mut pixel = Pixel::new();

        loop {
            let count = reader.read_bits(8)?;

            if count > 0 {
                // Encoded run: one granule-cycle of indices, repeated.
                let mut pixels = vec![Pixel::new(); cycle];
                for p in &mut pixels {
                    reader.get_pixel(p)?;
                }
                let mut remaining = count;
                let mut i = 0;
                while remaining > 0 {
                    writer.put_pixel_ln(&pixels[i])?;
                    i = (i + 1) % cycle;
                    remaining -= 1;
                }
                continue;
            }

            let command = reader.read_bits(8)?;

            // Literal run, padded up to 16-bit alignment. Commands in
            // 3..=255 that are not recognized below are literal runs too.
            if command > 2 {
                let run = command;
                let pad = 16 * ((run * u64::from(self.granule) + 15) / 16)
                    - run * u64::from(self.granule);
                for _ in 0..run {
                    reader.get_pixel(&mut pixel)?;
                    writer.put_pixel_ln(&pixel)?;
                }
                reader.read_bits(pad as u32)?;
            }

            match command {
                0 => writer.next_line()?,
                1 => break,
                2 => {
                    let dx = reader.read_bits(8)?;
                    let dy = reader.read_bits(8)?;
                    writer.add(dx as u32, dy as u32)?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    pub(crate) fn compress(
        &mut self,
        _fmt: &mut Format,
        _source: &Reference<'_>,
        _destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        Err(CodecError::UnsupportedVariant(
            "BMP RLE compression is not implemented".into(),
        ))
    }
}

// ── Header parsing ──────────────────────────────────────────────────

/// Normalized info-header fields shared by every non-CORE variant.
struct InfoHeader {
    size: u32,
    width: i32,
    height: i32,
    bit_count: u16,
    compression: u32,
    image_size: u32,
    clr_used: u32,
}

/// Parse a BMP (or headerless DIB) source into `format`.
pub(crate) fn parse(
    reference: &Reference<'_>,
    file_header: bool,
    format: &mut Format,
) -> Result<(), CodecError> {
    format.w = reference.w;
    format.h = reference.h;
    format.offset = if file_header { FILE_HEADER_BYTES } else { 0 };
    format.pad = 4;

    let data = reference.data();
    if file_header && (data.len() < 2 || &data[..2] != b"BM") {
        return Err(CodecError::UnrecognizedFormat);
    }
    extract(format, data)
}

fn extract(format: &mut Format, data: &[u8]) -> Result<(), CodecError> {
    if data.len() < format.offset + 4 {
        return Err(CodecError::UnexpectedEof);
    }
    let mut r = BitReader::new(&data[format.offset..]);
    let size = r.read_u32_le()?;

    if size == 12 {
        // BITMAPCOREHEADER: 16-bit dims, no compression, 3-byte palette.
        let width = r.read_u16_le()?;
        let height = r.read_u16_le()?;
        let _planes = r.read_u16_le()?;
        let bit_count = r.read_u16_le()?;

        format.offset += size as usize;
        format.pixel.bits = u32::from(bit_count);
        format.w = i32::from(width);
        format.h = i32::from(height);

        if format.offset > data.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let rest = format.buffer_size();
        if rest > data.len() {
            return Err(CodecError::UnexpectedEof);
        }
        // Trailing palette bytes may include padding; extras are ignored.
        let palette_bytes = data.len() - rest;
        let color_number = (palette_bytes / 3) as u32;

        return extract_channels(format, data, color_number, false, false);
    }

    if !matches!(size, 40 | 52 | 56 | 64 | 108 | 124) {
        return Err(CodecError::InvalidHeader(format!(
            "unknown BMP info header size: {size}"
        )));
    }

    let info = InfoHeader {
        size,
        width: r.read_i32_le()?,
        height: r.read_i32_le()?,
        bit_count: {
            let _planes = r.read_u16_le()?;
            r.read_u16_le()?
        },
        compression: r.read_u32_le()?,
        image_size: r.read_u32_le()?,
        clr_used: {
            let _x_pels = r.read_i32_le()?;
            let _y_pels = r.read_i32_le()?;
            r.read_u32_le()?
        },
    };
    let _clr_important = r.read_u32_le()?;

    // In-header masks start at byte 40 for V2+; the 64-byte OS/2 variant
    // keeps them (when used at all) after the full header, like INFO.
    let (num_masks, masks_in_header, reserved, alpha) = match size {
        40 => (3, false, true, false),
        52 => (3, true, true, false),
        56 => (4, true, true, false),
        64 => (3, false, false, false),
        108 => (4, true, true, true),
        124 => (4, true, true, true),
        _ => unreachable!(),
    };

    let mut masks = [0u32; 4];
    if masks_in_header {
        for m in masks.iter_mut().take(num_masks) {
            *m = r.read_u32_le()?;
        }
    }

    extract_info(
        format,
        data,
        &info,
        num_masks,
        if masks_in_header { Some(masks) } else { None },
        reserved,
        alpha,
    )
}

fn extract_info(
    format: &mut Format,
    data: &[u8],
    info: &InfoHeader,
    num_masks: usize,
    masks: Option<[u32; 4]>,
    reserved: bool,
    alpha: bool,
) -> Result<(), CodecError> {
    format.offset += info.size as usize;
    format.pixel.bits = u32::from(info.bit_count);
    format.w = info.width;
    format.h = info.height;

    if format.offset > data.len() {
        return Err(CodecError::UnexpectedEof);
    }

    let palette_count = if info.clr_used > 0 {
        info.clr_used
    } else if info.bit_count < 16 {
        1u32 << info.bit_count
    } else {
        0
    };

    match info.compression {
        BI_RGB => extract_channels(format, data, palette_count, reserved, alpha),
        BI_RLE4 | BI_RLE8 => {
            let granule = if info.compression == BI_RLE4 { 4 } else { 8 };
            if format.pixel.bits != granule {
                return Err(CodecError::InvalidHeader(format!(
                    "RLE{granule} requires {granule}-bit pixels, got {}",
                    format.pixel.bits
                )));
            }
            extract_channels(format, data, palette_count, reserved, alpha)?;
            let rle = Rle::new(info.image_size as usize, &format.pixel, granule);
            format.compression.push_front(Stage::Rle(rle));
            Ok(())
        }
        BI_BITFIELDS => {
            let masks = match masks {
                Some(m) => m,
                None => {
                    // External masks immediately after the header.
                    let mut r = BitReader::new(&data[format.offset..]);
                    let mut m = [0u32; 4];
                    for slot in m.iter_mut().take(num_masks) {
                        *slot = r.read_u32_le()?;
                    }
                    format.offset += num_masks * 4;
                    if format.offset > data.len() {
                        return Err(CodecError::UnexpectedEof);
                    }
                    m
                }
            };

            format.pixel.channels =
                channels_from_masks(&masks[..num_masks], format.pixel.bits)?;
            format.pixel.calculate_bits();
            // Packed-integer pixels: channel fields count up from the
            // integer's least significant bit.
            format.bit_order = BitOrder::LsbFirst;

            let size = format.buffer_size() - format.offset;
            let orient = Orient::new(size, false, true, None, &format.pixel);
            format.compression.push_front(Stage::Orient(orient));
            Ok(())
        }
        other => Err(CodecError::UnsupportedVariant(format!(
            "BMP compression scheme {other} is not supported"
        ))),
    }
}

/// Assign channel layouts for BI_RGB depths, reading the palette when the
/// depth is indexed.
fn extract_channels(
    format: &mut Format,
    data: &[u8],
    color_number: u32,
    reserved: bool,
    alpha: bool,
) -> Result<(), CodecError> {
    let bits = format.pixel.bits;

    if matches!(bits, 1 | 4 | 8) {
        format.pixel.channels.push(Channel { tag: '#', bits });
        format.pixel.calculate_bits();

        let color_bytes = if reserved { 4usize } else { 3 };
        if u64::from(color_number) > 1u64 << bits {
            return Err(CodecError::InvalidHeader(format!(
                "BMP palette count ({color_number}) exceeds max for {bits}-bit depth"
            )));
        }

        let mut palette_pixel = PixelFormat::new();
        for tag in ['B', 'G', 'R'] {
            palette_pixel.channels.push(Channel { tag, bits: 8 });
        }
        if reserved {
            palette_pixel.channels.push(Channel {
                tag: if alpha { 'A' } else { '_' },
                bits: 8,
            });
        }
        palette_pixel.calculate_bits();

        let mut palette = Palette::new(format.buffer_size() - format.offset, &palette_pixel);

        let table_len = color_bytes * color_number as usize;
        if format.offset + table_len > data.len() {
            return Err(CodecError::UnexpectedEof);
        }
        for entry in data[format.offset..format.offset + table_len].chunks_exact(color_bytes) {
            palette
                .samples
                .push(entry.iter().map(|&b| u64::from(b)).collect());
        }
        format.offset += table_len;

        push_row_orient(format, &format.pixel.clone());
        format.compression.insert(1, Stage::Palette(palette));
        return Ok(());
    }

    match bits {
        16 => {
            for (tag, width) in [('B', 5), ('G', 5), ('R', 5), ('_', 1)] {
                format.pixel.channels.push(Channel { tag, bits: width });
            }
            format.pixel.calculate_bits();
            format.bit_order = BitOrder::LsbFirst;
        }
        24 => {
            for tag in ['B', 'G', 'R'] {
                format.pixel.channels.push(Channel { tag, bits: 8 });
            }
            format.pixel.calculate_bits();
        }
        32 => {
            for (tag, width) in [('B', 8), ('G', 8), ('R', 8), ('_', 8)] {
                format.pixel.channels.push(Channel { tag, bits: width });
            }
            format.pixel.calculate_bits();
        }
        other => {
            return Err(CodecError::UnsupportedVariant(format!(
                "BMP bit depth {other} unsupported"
            )));
        }
    }

    push_row_orient(format, &format.pixel.clone());
    Ok(())
}

/// Push the bottom-up row-order normalization stage.
fn push_row_orient(format: &mut Format, pixel: &PixelFormat) {
    let size = format.buffer_size() - format.offset;
    let orient = Orient::new(size, false, true, None, pixel);
    format.compression.push_front(Stage::Orient(orient));
}

// ── Output ──────────────────────────────────────────────────────────

/// Prepare `format` for BMP output and return the header writer.
///
/// The payload is 32bpp BGRA rows written bottom-up; the header writer
/// stamps the file header (when `file_header`) and a `BITMAPV4HEADER`
/// with identity bitfield masks.
pub(crate) fn prepare_write(file_header: bool, format: &mut Format) -> HeaderWriter {
    format.offset = if file_header { FILE_HEADER_BYTES } else { 0 };
    format.pad = 4;
    format.offset += V4_HEADER_BYTES;

    format.pixel.channels.clear();
    for tag in ['B', 'G', 'R', 'A'] {
        format.pixel.channels.push(Channel { tag, bits: 8 });
    }
    format.pixel.calculate_bits();
    // Sources without an alpha channel encode as fully opaque.
    format.pixel.replacements.push(crate::pixel::Replacement {
        id: 3,
        channel: None,
        constant: Some(255),
    });

    let orient = Orient::new(0, false, true, None, &format.pixel);
    format.compression.push_front(Stage::Orient(orient));

    Box::new(move |fmt: &Format, reference: &mut Reference<'_>| {
        let total_bytes = reference.bytes() as u32;
        let mut w = BitWriter::new(reference.data_mut());

        if file_header {
            w.write_bytes(b"BM")?;
            w.write_u32_le(total_bytes)?;
            w.write_u32_le(0)?; // reserved
            w.write_u32_le((FILE_HEADER_BYTES + V4_HEADER_BYTES) as u32)?;
        }

        w.write_u32_le(V4_HEADER_BYTES as u32)?;
        w.write_u32_le(fmt.w as u32)?;
        w.write_u32_le(fmt.h as u32)?; // positive: bottom-up
        w.write_u16_le(1)?; // planes
        w.write_u16_le(32)?; // bit count
        w.write_u32_le(BI_BITFIELDS)?;
        w.write_u32_le(0)?; // image size
        w.write_u32_le(0)?; // x pixels per meter
        w.write_u32_le(0)?; // y pixels per meter
        w.write_u32_le(0)?; // colors used
        w.write_u32_le(0)?; // important colors
        w.write_u32_le(0x00FF_0000)?; // red mask
        w.write_u32_le(0x0000_FF00)?; // green mask
        w.write_u32_le(0x0000_00FF)?; // blue mask
        w.write_u32_le(0xFF00_0000)?; // alpha mask
        w.write_u32_le(0x7352_4742)?; // "sRGB" color space
        for _ in 0..12 {
            w.write_u32_le(0)?; // endpoints and gamma
        }
        Ok(())
    })
}

/// Derive channels from bitfield masks, ordered by mask offset, with
/// unclaimed high bits collected into a trailing reserved channel.
fn channels_from_masks(masks: &[u32], total_bits: u32) -> Result<Vec<Channel>, CodecError> {
    const NAMES: [char; 4] = ['R', 'G', 'B', 'A'];
    assert!(masks.len() <= 4);

    let mut remaining = total_bits;
    let mut offsetted: Vec<(u32, Channel)> = Vec::new();
    for (name, &mask) in NAMES.iter().zip(masks) {
        let offset = mask.trailing_zeros();
        let bits = mask.count_ones();
        if bits > remaining {
            return Err(CodecError::InvalidHeader(format!(
                "bitfield mask {mask:#010x} wider than the {total_bits}-bit pixel"
            )));
        }
        remaining -= bits;
        if bits > 0 {
            offsetted.push((offset, Channel { tag: *name, bits }));
        }
    }
    offsetted.sort_by_key(|&(offset, _)| offset);

    let mut channels: Vec<Channel> = offsetted.into_iter().map(|(_, c)| c).collect();
    if remaining > 0 {
        channels.push(Channel {
            tag: '_',
            bits: remaining,
        });
    }
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_become_offset_ordered_channels() {
        let channels = channels_from_masks(&[0xF800, 0x07E0, 0x001F], 16).unwrap();
        assert_eq!(
            channels,
            vec![
                Channel { tag: 'B', bits: 5 },
                Channel { tag: 'G', bits: 6 },
                Channel { tag: 'R', bits: 5 },
            ]
        );
    }

    #[test]
    fn unclaimed_mask_bits_become_reserved() {
        let channels =
            channels_from_masks(&[0x00FF_0000, 0x0000_FF00, 0x0000_00FF], 32).unwrap();
        assert_eq!(
            channels,
            vec![
                Channel { tag: 'B', bits: 8 },
                Channel { tag: 'G', bits: 8 },
                Channel { tag: 'R', bits: 8 },
                Channel { tag: '_', bits: 8 },
            ]
        );
    }

    #[test]
    fn oversized_mask_is_rejected() {
        assert!(matches!(
            channels_from_masks(&[0xFFFF_FFFF, 0, 0], 16),
            Err(CodecError::InvalidHeader(_))
        ));
    }
}
