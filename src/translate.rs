//! The translate driver: format-string parsing, pipeline execution, and
//! pixel-level translation with optional area-weighted scaling.
//!
//! Format strings are parsed left to right: channel specs (`R8G8B8A8`),
//! `*`-commands (`*PAD<n>`, `*SAME`, `*REP<X><Y>`, `*ALPHA<X>`), and a
//! container tag (`.BMP`, `.DIB`, `.PNG`, `.JPG`, `.ANYF`). Translation
//! peels the source stack front to back, converts or scales the bare
//! pixels, pushes the destination stack back to front, and stamps the
//! container header.

use crate::error::CodecError;
use crate::format::{Format, sync};
use crate::limits::Limits;
use crate::pixel::{Channel, ChannelMap, Color, ImageFormat, Pixel, Replacement};
use crate::pixelio::{PixelReader, PixelWriter};
use crate::reference::Reference;
use crate::{bmp, jpeg, png};

/// Stamps fixed container header bytes into the finished destination.
pub(crate) type HeaderWriter = Box<dyn Fn(&Format, &mut Reference<'_>) -> Result<(), CodecError>>;

/// Detect a container format from magic bytes.
pub fn detect_format(data: &[u8]) -> Option<ImageFormat> {
    if data.len() >= 2 && data[0] == 0xFF && data[1] == 0xD8 {
        return Some(ImageFormat::Jpeg);
    }
    if data.len() >= 2 && &data[..2] == b"BM" {
        return Some(ImageFormat::Bmp);
    }
    if data.len() >= 8 && data[..8] == png::SIGNATURE {
        return Some(ImageFormat::Png);
    }
    None
}

// ── Format-string parsing ───────────────────────────────────────────

fn get_word<'w>(
    string: &str,
    i: &mut usize,
    words: &[&'w str],
) -> Result<&'w str, CodecError> {
    for &word in words {
        if string[*i..].starts_with(word) {
            *i += word.len();
            return Ok(word);
        }
    }
    Err(CodecError::BadFormatString(format!(
        "expected one of {words:?} at position {i} in {string:?}"
    )))
}

fn get_number(string: &str, i: &mut usize) -> u64 {
    let mut result = 0u64;
    let bytes = string.as_bytes();
    while *i < bytes.len() && bytes[*i].is_ascii_digit() {
        result = result * 10 + u64::from(bytes[*i] - b'0');
        *i += 1;
    }
    result
}

fn check_tag(c: char) -> Result<(), CodecError> {
    if c.is_ascii_uppercase() || c == '_' {
        Ok(())
    } else {
        Err(CodecError::BadFormatString(format!(
            "invalid channel tag {c:?}"
        )))
    }
}

fn next_char(string: &str, i: &mut usize) -> Result<char, CodecError> {
    let c = string.as_bytes().get(*i).copied().ok_or_else(|| {
        CodecError::BadFormatString("format string ends mid-command".into())
    })?;
    *i += 1;
    Ok(c as char)
}

/// Parse a reference's format string into a [`Format`].
///
/// `sample` is the already-parsed source format and is only given when
/// parsing a destination; destination-only commands (`*SAME`, `*REP`) are
/// ignored without it. `writing` receives the container's header writer
/// on the destination side.
fn parse_format(
    reference: &Reference<'_>,
    mut writing: Option<&mut Option<HeaderWriter>>,
    sample: Option<&Format>,
) -> Result<Format, CodecError> {
    const CONTAINERS: [&str; 5] = ["DIB", "BMP", "PNG", "JPG", "ANYF"];
    const COMMANDS: [&str; 4] = ["PAD", "SAME", "REP", "ALPHA"];

    let string = reference
        .format
        .as_deref()
        .ok_or_else(|| CodecError::BadFormatString("reference has no format string".into()))?;

    let mut format = Format::new();
    let mut container: Option<&str> = None;
    // Replacement rules keep the tag they were declared with, so they can
    // be re-resolved against a container's own channel layout below.
    let mut user_replacements: Vec<(char, Replacement)> = Vec::new();

    let mut i = 0usize;
    while i < string.len() {
        let c = next_char(string, &mut i)?;

        if c == '.' {
            container = Some(get_word(string, &mut i, &CONTAINERS)?);
            continue;
        }

        if c == '*' {
            match get_word(string, &mut i, &COMMANDS)? {
                "PAD" => format.pad = get_number(string, &mut i) as u32,
                "SAME" => {
                    if let Some(sample) = sample {
                        return Ok(sample.clone());
                    }
                }
                "REP" => {
                    let target = next_char(string, &mut i)?;
                    let id = format.pixel.id(target).ok_or_else(|| {
                        CodecError::BadFormatString(format!(
                            "*REP names undeclared channel {target:?}"
                        ))
                    })?;

                    let mut replacement = Replacement {
                        id,
                        channel: None,
                        constant: None,
                    };
                    let value = next_char(string, &mut i)?;
                    if value.is_ascii_digit() {
                        i -= 1;
                        replacement.constant = Some(get_number(string, &mut i));
                    } else {
                        replacement.channel = Some(value);
                    }

                    if sample.is_some() {
                        user_replacements.push((target, replacement));
                    }
                }
                "ALPHA" => {
                    let tag = next_char(string, &mut i)?;
                    check_tag(tag)?;
                    format.pixel.alpha = tag;
                }
                _ => unreachable!(),
            }
            continue;
        }

        check_tag(c)?;
        let bits = get_number(string, &mut i) as u32;
        format.pixel.channels.push(Channel { tag: c, bits });
    }

    match container {
        None => {
            // Raw pixels: dimensions come from the reference.
            format.w = reference.w;
            format.h = reference.h;
        }
        Some(tag @ ("DIB" | "BMP")) => {
            format.pixel.clear();
            let file_header = tag == "BMP";
            match writing.as_deref_mut() {
                Some(slot) => {
                    format.w = reference.w;
                    format.h = reference.h;
                    *slot = Some(bmp::prepare_write(file_header, &mut format));
                }
                None => bmp::parse(reference, file_header, &mut format)?,
            }
        }
        Some("PNG") => {
            format.pixel.clear();
            match writing.as_deref_mut() {
                Some(slot) => {
                    format.w = reference.w;
                    format.h = reference.h;
                    *slot = Some(png::prepare_write(&mut format));
                }
                None => png::parse(reference, &mut format)?,
            }
        }
        Some("JPG") => {
            format.pixel.clear();
            match writing {
                Some(_) => {
                    return Err(CodecError::UnsupportedVariant(
                        "JPEG encoding is not implemented".into(),
                    ));
                }
                None => jpeg::parse(reference, &mut format)?,
            }
        }
        Some("ANYF") => {
            format.pixel.clear();
            match writing.as_deref_mut() {
                // Auto-detect defaults to PNG on write.
                Some(slot) => {
                    format.w = reference.w;
                    format.h = reference.h;
                    *slot = Some(png::prepare_write(&mut format));
                }
                None => match detect_format(reference.data()) {
                    Some(ImageFormat::Jpeg) => jpeg::parse(reference, &mut format)?,
                    Some(ImageFormat::Bmp) => bmp::parse(reference, true, &mut format)?,
                    Some(ImageFormat::Png) => png::parse(reference, &mut format)?,
                    None => return Err(CodecError::UnrecognizedFormat),
                },
            }
        }
        Some(_) => unreachable!(),
    }

    // Re-resolve user replacements against the layout conversion actually
    // targets: the innermost stage's for a container, the typed channels
    // otherwise. User rules take precedence over container defaults; tags
    // the layout lacks are dropped.
    if !user_replacements.is_empty() {
        let raw_pixel = format
            .compression
            .back()
            .map(|s| s.pixel())
            .unwrap_or(&format.pixel);
        let mut resolved: Vec<Replacement> = Vec::new();
        for (tag, mut replacement) in user_replacements {
            if let Some(id) = raw_pixel.id(tag) {
                replacement.id = id;
                resolved.push(replacement);
            }
        }

        if let Some(stage) = format.compression.back_mut() {
            let pixel = &mut stage.base_mut().pixel;
            let mut merged = resolved.clone();
            merged.extend(pixel.replacements.drain(..));
            pixel.replacements = merged;
        } else {
            let mut merged = resolved;
            merged.extend(format.pixel.replacements.drain(..));
            format.pixel.replacements = merged;
        }
    }

    format.pixel.calculate_bits();
    Ok(format)
}

// ── Translation helpers ─────────────────────────────────────────────

/// Verbatim payload copy, honoring any difference in header offsets.
fn copy_translate(
    src_fmt: &Format,
    source: &Reference<'_>,
    dst_fmt: &mut Format,
    destination: &mut Reference<'_>,
) -> Result<(), CodecError> {
    if source.bytes() < src_fmt.offset {
        return Err(CodecError::UnexpectedEof);
    }
    let available = source.bytes() - src_fmt.offset + dst_fmt.offset;

    dst_fmt.w = src_fmt.w;
    dst_fmt.h = src_fmt.h;
    sync(dst_fmt, destination);
    if destination.bytes() > available || destination.bytes() < dst_fmt.offset {
        return Err(CodecError::BufferTooSmall {
            needed: destination.bytes(),
            actual: available,
        });
    }

    if dst_fmt.offset != src_fmt.offset {
        let count = destination.bytes() - dst_fmt.offset;
        let payload = &source.data()[src_fmt.offset..src_fmt.offset + count];
        let offset = dst_fmt.offset;
        destination.data_mut()[offset..offset + count].copy_from_slice(payload);
    } else {
        let count = destination.bytes();
        destination
            .data_mut()
            .copy_from_slice(&source.data()[..count]);
    }
    Ok(())
}

/// Per-pixel conversion between equal-sized images. Sign flips are
/// honored only when `flip` is set (the identity-scale path); otherwise
/// the destination adopts the source's signed dimensions.
fn direct_translate(
    src_fmt: &Format,
    source: &Reference<'_>,
    dst_fmt: &mut Format,
    destination: &mut Reference<'_>,
    flip: bool,
) -> Result<(), CodecError> {
    assert!(
        src_fmt.compression.is_empty() && dst_fmt.compression.is_empty(),
        "direct translation works on bare pixels"
    );

    if *src_fmt == *dst_fmt {
        return copy_translate(src_fmt, source, dst_fmt, destination);
    }

    let width = src_fmt.w.unsigned_abs() as usize;
    let height = src_fmt.h.unsigned_abs() as usize;

    let mut pixels: Vec<Pixel> = vec![Pixel::new(); width * height];
    let mut reader = PixelReader::new(src_fmt, source);
    for pixel in &mut pixels {
        reader.get_pixel_ln(pixel)?;
    }

    let mut flip_x = (src_fmt.w < 0) != (dst_fmt.w < 0);
    let mut flip_y = (src_fmt.h < 0) != (dst_fmt.h < 0);

    if width != dst_fmt.w.unsigned_abs() as usize
        || height != dst_fmt.h.unsigned_abs() as usize
        || (!flip && (flip_x || flip_y))
    {
        dst_fmt.w = src_fmt.w;
        dst_fmt.h = src_fmt.h;
        flip_x = false;
        flip_y = false;
    }
    sync(dst_fmt, destination);

    let map = ChannelMap::new(&src_fmt.pixel, &dst_fmt.pixel);
    let mut writer = PixelWriter::new(dst_fmt, destination);
    for y in 0..height {
        let sy = if flip_y { height - 1 - y } else { y };
        for x in 0..width {
            let sx = if flip_x { width - 1 - x } else { x };
            writer.put_pixel_ln(&map.pixel_to_pixel(&pixels[sy * width + sx]))?;
        }
    }
    Ok(())
}

/// Area-weighted scaling: each destination pixel averages the normalized
/// source colors it covers, weighted by overlap area and (for non-alpha
/// channels) by the destination's alpha channel.
fn scale_translate(
    src_fmt: &Format,
    source: &Reference<'_>,
    dst_fmt: &mut Format,
    destination: &mut Reference<'_>,
) -> Result<(), CodecError> {
    assert!(
        src_fmt.compression.is_empty() && dst_fmt.compression.is_empty(),
        "scaling works on bare pixels"
    );

    let src_width = src_fmt.w.unsigned_abs() as usize;
    let src_height = src_fmt.h.unsigned_abs() as usize;
    let dst_width = dst_fmt.w.unsigned_abs() as usize;
    let dst_height = dst_fmt.h.unsigned_abs() as usize;

    if src_width == dst_width && src_height == dst_height {
        return direct_translate(src_fmt, source, dst_fmt, destination, true);
    }
    if dst_width == 0 || dst_height == 0 {
        sync(dst_fmt, destination);
        return Ok(());
    }

    let scale_x = src_width as f64 / dst_width as f64;
    let scale_y = src_height as f64 / dst_height as f64;

    let flip_x = (src_fmt.w < 0) != (dst_fmt.w < 0);
    let flip_y = (src_fmt.h < 0) != (dst_fmt.h < 0);

    // Normalize the whole source up front.
    let normalize = ChannelMap::new(&src_fmt.pixel, &src_fmt.pixel);
    let mut src_colors: Vec<Color> = Vec::with_capacity(src_width * src_height);
    {
        let mut reader = PixelReader::new(src_fmt, source);
        let mut pixel = Pixel::new();
        for _ in 0..src_width * src_height {
            reader.get_pixel_ln(&mut pixel)?;
            src_colors.push(normalize.pixel_to_color(&pixel));
        }
    }

    sync(dst_fmt, destination);

    let alpha_id = dst_fmt.pixel.alpha_id();
    let cross = ChannelMap::new(&src_fmt.pixel, &dst_fmt.pixel);
    let denormalize = ChannelMap::new(&dst_fmt.pixel, &dst_fmt.pixel);
    let channels = dst_fmt.pixel.channels.len();

    let mut writer = PixelWriter::new(dst_fmt, destination);
    for dy in 0..dst_height {
        for dx in 0..dst_width {
            // Source region this destination pixel covers.
            let (src_x0, src_x1) = if flip_x {
                (
                    src_width as f64 - (dx + 1) as f64 * scale_x,
                    src_width as f64 - dx as f64 * scale_x,
                )
            } else {
                (dx as f64 * scale_x, (dx + 1) as f64 * scale_x)
            };
            let (src_y0, src_y1) = if flip_y {
                (
                    src_height as f64 - (dy + 1) as f64 * scale_y,
                    src_height as f64 - dy as f64 * scale_y,
                )
            } else {
                (dy as f64 * scale_y, (dy + 1) as f64 * scale_y)
            };

            let sx0 = (src_x0.floor().max(0.0)) as usize;
            let sy0 = (src_y0.floor().max(0.0)) as usize;
            let sx1 = (src_x1.ceil() as usize).min(src_width);
            let sy1 = (src_y1.ceil() as usize).min(src_height);

            let mut accum = vec![0.0f64; channels];
            let mut area_sum = vec![0.0f64; channels];

            for sy in sy0..sy1 {
                for sx in sx0..sx1 {
                    let overlap_x = src_x1.min((sx + 1) as f64) - src_x0.max(sx as f64);
                    let overlap_y = src_y1.min((sy + 1) as f64) - src_y0.max(sy as f64);
                    let area = overlap_x * overlap_y;
                    if area <= 0.0 {
                        continue;
                    }

                    let color = cross.color_to_color(&src_colors[sy * src_width + sx]);
                    for i in 0..channels {
                        let mut weight = match alpha_id {
                            Some(a) if a != i => color[a],
                            _ => 1.0,
                        };
                        weight *= area;
                        accum[i] += color[i] * weight;
                        area_sum[i] += weight;
                    }
                }
            }

            let mut dst_color = Color::with_capacity(channels);
            for i in 0..channels {
                let value = if area_sum[i] > 0.0 {
                    accum[i] / area_sum[i]
                } else {
                    0.0
                };
                dst_color.push(value.clamp(0.0, 1.0));
            }
            writer.put_pixel_ln(&denormalize.color_to_pixel(&dst_color))?;
        }
    }
    Ok(())
}

// ── Driver ──────────────────────────────────────────────────────────

/// Translate `source` into `destination` according to their format
/// strings, optionally scaling to the destination's dimensions.
///
/// `destination` must own its storage; its format string defaults to the
/// source's when absent.
pub fn translate(
    source: &Reference<'_>,
    destination: &mut Reference<'_>,
    scale: bool,
) -> Result<(), CodecError> {
    translate_impl(source, destination, scale, None)
}

/// [`translate`] with resource limits applied to parsed dimensions and
/// intermediate buffers.
pub fn translate_with_limits(
    source: &Reference<'_>,
    destination: &mut Reference<'_>,
    scale: bool,
    limits: &Limits,
) -> Result<(), CodecError> {
    translate_impl(source, destination, scale, Some(limits))
}

fn translate_impl(
    source: &Reference<'_>,
    destination: &mut Reference<'_>,
    scale: bool,
    limits: Option<&Limits>,
) -> Result<(), CodecError> {
    assert!(
        destination.is_owned(),
        "translate needs a growable destination"
    );
    if source.format.is_none() {
        return Err(CodecError::BadFormatString(
            "source reference has no format string".into(),
        ));
    }
    if destination.format.is_none() {
        destination.format = source.format.clone();
    }

    let mut header_writer: Option<HeaderWriter> = None;
    let src_fmt = parse_format(source, None, None)?;
    let mut dst_fmt = parse_format(destination, Some(&mut header_writer), Some(&src_fmt))?;

    if let Some(limits) = limits {
        limits.check(src_fmt.w.unsigned_abs(), src_fmt.h.unsigned_abs())?;
        limits.check(dst_fmt.w.unsigned_abs(), dst_fmt.h.unsigned_abs())?;
    }
    if source.bytes() < src_fmt.buffer_size() {
        return Err(CodecError::BufferTooSmall {
            needed: src_fmt.buffer_size(),
            actual: source.bytes(),
        });
    }

    if src_fmt == dst_fmt {
        copy_translate(&src_fmt, source, &mut dst_fmt, destination)?;
        if let Some(writer) = &header_writer {
            writer(&dst_fmt, destination)?;
        }
        return Ok(());
    }

    // Peel the source stack front to back down to bare pixels.
    let mut work_fmt = src_fmt.clone();
    work_fmt.offset = 0;
    let mut work = Reference::new_owned();
    copy_translate(&src_fmt, source, &mut work_fmt, &mut work)?;

    while let Some(stage) = work_fmt.compression.pop_front() {
        let mut peeled = Reference::new_owned();
        stage.decompress(&mut work_fmt, &work, &mut peeled)?;
        if let Some(limits) = limits {
            limits.check_memory(peeled.bytes())?;
        }
        work = peeled;
    }

    // The scaler target: the destination with its compression stripped;
    // with a container, the innermost stage's layout is the raw form.
    let dst_offset = dst_fmt.offset;
    let mut pending = std::mem::take(&mut dst_fmt.compression);
    let mut target_fmt = dst_fmt.clone();
    target_fmt.offset = 0;
    if let Some(innermost) = pending.back() {
        target_fmt.pixel.copy_from(innermost.pixel());
    }

    let mut converted = Reference::new_owned();
    if scale {
        scale_translate(&work_fmt, &work, &mut target_fmt, &mut converted)?;
    } else {
        direct_translate(&work_fmt, &work, &mut target_fmt, &mut converted, false)?;
    }
    work = converted;
    work_fmt = target_fmt;

    // Push the destination stack back to front.
    while let Some(mut stage) = pending.pop_back() {
        let mut packed = Reference::new_owned();
        stage.compress(&mut work_fmt, &work, &mut packed)?;
        if let Some(limits) = limits {
            limits.check_memory(packed.bytes())?;
        }
        work_fmt.compression.push_front(stage);
        work = packed;
    }

    let mut final_fmt = work_fmt.clone();
    final_fmt.offset = dst_offset;
    copy_translate(&work_fmt, &work, &mut final_fmt, destination)?;
    if let Some(writer) = &header_writer {
        writer(&final_fmt, destination)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_raw_channel_spec() {
        let data = [0u8; 4];
        let r = Reference::from_slice(&data)
            .with_format("R8G8B8A8")
            .with_size(1, 1);
        let fmt = parse_format(&r, None, None).unwrap();
        assert_eq!(fmt.pixel.channels.len(), 4);
        assert_eq!(fmt.pixel.bits, 32);
        assert_eq!(fmt.pad, 0);
        assert_eq!((fmt.w, fmt.h), (1, 1));
    }

    #[test]
    fn parse_pad_and_alpha_commands() {
        let data = [0u8; 4];
        let r = Reference::from_slice(&data).with_format("G8*PAD4*ALPHA_");
        let fmt = parse_format(&r, None, None).unwrap();
        assert_eq!(fmt.pad, 4);
        assert_eq!(fmt.pixel.alpha, '_');
    }

    #[test]
    fn parse_rep_constant_and_channel() {
        let data = [0u8; 4];
        let sample = Format::new();
        let r = Reference::from_slice(&data).with_format("R8A8*REPA255*REPRG");
        let fmt = parse_format(&r, None, Some(&sample)).unwrap();
        assert_eq!(
            fmt.pixel.replacements,
            vec![
                Replacement {
                    id: 1,
                    channel: None,
                    constant: Some(255)
                },
                Replacement {
                    id: 0,
                    channel: Some('G'),
                    constant: None
                },
            ]
        );
    }

    #[test]
    fn rep_is_ignored_for_sources() {
        let data = [0u8; 4];
        let r = Reference::from_slice(&data).with_format("R8*REPR0");
        let fmt = parse_format(&r, None, None).unwrap();
        assert!(fmt.pixel.replacements.is_empty());
    }

    #[test]
    fn same_clones_the_sample() {
        let data = [0u8; 4];
        let mut sample = Format::new();
        sample.pad = 7;
        sample.w = 3;
        let r = Reference::from_slice(&data).with_format("*SAMEanything ignored");
        let fmt = parse_format(&r, None, Some(&sample)).unwrap();
        assert_eq!(fmt.pad, 7);
        assert_eq!(fmt.w, 3);
    }

    #[test]
    fn unknown_command_is_rejected() {
        let data = [0u8; 4];
        let r = Reference::from_slice(&data).with_format("R8*WAT");
        assert!(matches!(
            parse_format(&r, None, None),
            Err(CodecError::BadFormatString(_))
        ));
    }

    #[test]
    fn lowercase_tag_is_rejected() {
        let data = [0u8; 4];
        let r = Reference::from_slice(&data).with_format("r8");
        assert!(matches!(
            parse_format(&r, None, None),
            Err(CodecError::BadFormatString(_))
        ));
    }

    #[test]
    fn detect_format_magics() {
        assert_eq!(detect_format(&[0xFF, 0xD8, 0xFF]), Some(ImageFormat::Jpeg));
        assert_eq!(detect_format(b"BM\x00\x00"), Some(ImageFormat::Bmp));
        assert_eq!(
            detect_format(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
            Some(ImageFormat::Png)
        );
        assert_eq!(detect_format(b"farbfeld"), None);
        assert_eq!(detect_format(&[]), None);
    }

    #[test]
    fn raw_identity_translate_copies() {
        let pixels = [1u8, 2, 3, 4, 5, 6];
        let source = Reference::from_slice(&pixels)
            .with_format("R8G8B8")
            .with_size(2, 1);
        let mut destination = Reference::new_owned().with_format("R8G8B8");
        translate(&source, &mut destination, false).unwrap();
        assert_eq!(destination.data(), &pixels);
        assert_eq!((destination.w, destination.h), (2, 1));
    }

    #[test]
    fn raw_channel_reorder() {
        let pixels = [10u8, 20, 30];
        let source = Reference::from_slice(&pixels)
            .with_format("R8G8B8")
            .with_size(1, 1);
        let mut destination = Reference::new_owned().with_format("B8G8R8");
        translate(&source, &mut destination, false).unwrap();
        assert_eq!(destination.data(), &[30, 20, 10]);
    }

    #[test]
    fn raw_replacement_fills_alpha() {
        let pixels = [10u8, 20, 30];
        let source = Reference::from_slice(&pixels)
            .with_format("R8G8B8")
            .with_size(1, 1);
        let mut destination = Reference::new_owned().with_format("R8G8B8A8*REPA255");
        translate(&source, &mut destination, false).unwrap();
        assert_eq!(destination.data(), &[10, 20, 30, 255]);
    }

    #[test]
    fn missing_source_format_is_an_error() {
        let data = [0u8; 4];
        let source = Reference::from_slice(&data);
        let mut destination = Reference::new_owned();
        assert!(matches!(
            translate(&source, &mut destination, false),
            Err(CodecError::BadFormatString(_))
        ));
    }

    #[test]
    fn identity_scale_flips_on_sign_change() {
        // Two rows, bottom-up source to top-down destination.
        let pixels = [1u8, 2];
        let source = Reference::from_slice(&pixels)
            .with_format("G8")
            .with_size(1, -2);
        let mut destination = Reference::new_owned().with_format("G8").with_size(1, 2);
        translate(&source, &mut destination, true).unwrap();
        assert_eq!(destination.data(), &[2, 1]);
    }

    #[test]
    fn checkerboard_downscale_averages_with_ties_to_even() {
        // 4x4 black/white checkerboard, alpha weighting disabled.
        let mut pixels = [0u8; 16];
        for y in 0..4 {
            for x in 0..4 {
                pixels[y * 4 + x] = if (x + y) % 2 == 0 { 0 } else { 255 };
            }
        }
        let source = Reference::from_slice(&pixels)
            .with_format("G8*ALPHA_")
            .with_size(4, 4);
        let mut destination = Reference::new_owned()
            .with_format("G8*ALPHA_")
            .with_size(2, 2);
        translate(&source, &mut destination, true).unwrap();
        // Every destination pixel averages two 0s and two 255s: exactly
        // 0.5, which denormalizes to the even 128.
        assert_eq!(destination.data(), &[128, 128, 128, 128]);
    }

    #[test]
    fn upscale_with_limits_rejects_large_output() {
        let pixels = [0u8; 4];
        let source = Reference::from_slice(&pixels)
            .with_format("G8")
            .with_size(2, 2);
        let mut destination = Reference::new_owned().with_format("G8").with_size(100, 100);
        let limits = Limits {
            max_pixels: Some(64),
            ..Default::default()
        };
        assert!(matches!(
            translate_with_limits(&source, &mut destination, true, &limits),
            Err(CodecError::LimitExceeded(_))
        ));
    }
}
