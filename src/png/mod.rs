//! PNG container: chunk framing with CRC-32, the zlib stream, scanline
//! filters with Adam7 interlacing, and palette/transparency extraction.
//!
//! The decode stack, outermost first: [`Chunking`] concatenates IDAT
//! bodies, [`Deflate`] inflates the zlib stream, [`FilterInterlace`]
//! undoes per-row filters and reassembles interlace passes, then an
//! [`Orient`] stage expands a `tRNS` chroma key (or passes through) and a
//! [`Palette`] stage expands indexed color. Encoding always produces
//! truecolor-alpha 8-bit Adam7 output.

use std::io::{Read, Write};

use crate::bitio::{BitReader, BitWriter};
use crate::error::CodecError;
use crate::format::{Format, sync, sync_bytes};
use crate::pixel::{Channel, Pixel, PixelFormat};
use crate::pixelio::{PixelReader, PixelWriter};
use crate::reference::Reference;
use crate::stage::{Orient, Palette, Stage, StageBase};
use crate::translate::HeaderWriter;

pub(crate) const SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

const COLOR_GRAYSCALE: u8 = 0;
const COLOR_TRUECOLOR: u8 = 2;
const COLOR_INDEXED: u8 = 3;
const COLOR_GRAYSCALE_ALPHA: u8 = 4;
const COLOR_TRUECOLOR_ALPHA: u8 = 6;

const FILTER_NONE: u64 = 0;
const FILTER_SUB: u64 = 1;
const FILTER_UP: u64 = 2;
const FILTER_AVERAGE: u64 = 3;
const FILTER_PAETH: u64 = 4;

/// Per-chunk framing overhead: length, type, and CRC fields.
const CHUNK_OVERHEAD: usize = 12;
/// IDAT payload cap on the encode path.
const MAX_CHUNK: usize = 64 * 1024;

// ── Chunk framing ───────────────────────────────────────────────────

struct Chunk {
    kind: [u8; 4],
    /// Declared body length; `data` is empty for skipped chunks.
    length: usize,
    data: Vec<u8>,
}

impl Chunk {
    /// Framed size on disk.
    fn size(&self) -> usize {
        CHUNK_OVERHEAD + self.length
    }
}

fn crc32(kind: &[u8; 4], data: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(kind);
    crc.update(data);
    crc.sum()
}

/// Read one chunk. Returns `None` on a clean end of input. Bodies are
/// retained (and their CRC verified) only when `include` approves the
/// chunk type; skipped bodies are not validated.
fn read_chunk(
    r: &mut BitReader<'_>,
    include: impl Fn(&[u8; 4]) -> bool,
) -> Result<Option<Chunk>, CodecError> {
    let length = match r.read_u32_be() {
        Ok(v) => v as usize,
        Err(_) => return Ok(None),
    };
    let mut kind = [0u8; 4];
    if r.read_bytes(&mut kind).is_err() {
        return Ok(None);
    }

    // A chunk claiming more data than the buffer holds is corrupt.
    if r.bytes_left(usize::MAX) < length {
        return Err(CodecError::UnexpectedEof);
    }

    let retain = include(&kind);
    let mut data = Vec::new();
    if retain {
        data.resize(length, 0);
        r.read_bytes(&mut data)?;
    } else {
        r.skip_bytes(length)?;
    }

    let crc = match r.read_u32_be() {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    if retain && crc != crc32(&kind, &data) {
        return Err(CodecError::InvalidData(format!(
            "PNG chunk {} fails CRC validation",
            String::from_utf8_lossy(&kind)
        )));
    }
    Ok(Some(Chunk { kind, length, data }))
}

fn write_chunk(w: &mut BitWriter<'_>, kind: &[u8; 4], data: &[u8]) -> Result<(), CodecError> {
    w.write_u32_be(data.len() as u32)?;
    w.write_bytes(kind)?;
    w.write_bytes(data)?;
    w.write_u32_be(crc32(kind, data))
}

// ── Chunking stage ──────────────────────────────────────────────────

/// IDAT concatenation: strips chunk framing on decode, splits the zlib
/// stream into capped IDAT chunks plus IEND on encode.
#[derive(Clone, PartialEq)]
pub struct Chunking {
    pub(crate) base: StageBase,
}

impl Chunking {
    pub(crate) fn new(size: usize, pixel: &PixelFormat) -> Self {
        Self {
            base: StageBase::new(size, pixel),
        }
    }

    pub(crate) fn decompress(
        &self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        let mut r = BitReader::new(&source.data()[fmt.offset..]);

        fmt.offset = 0;
        fmt.pixel.copy_from(&self.base.pixel);
        sync(fmt, destination);

        let mut w = BitWriter::new(destination.data_mut());
        while let Some(chunk) = read_chunk(&mut r, |_| true)? {
            if &chunk.kind == b"IDAT" {
                w.write_bytes(&chunk.data)?;
            } else if &chunk.kind == b"IEND" {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn compress(
        &mut self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        let mut r = BitReader::new(&source.data()[fmt.offset..]);

        self.base.pixel.copy_from(&fmt.pixel);
        fmt.offset = 0;
        let payload = fmt.buffer_size();
        self.base.size = payload + (payload.div_ceil(MAX_CHUNK) + 1) * CHUNK_OVERHEAD;
        fmt.pixel.clear();

        sync_bytes(self.base.size, fmt, destination);

        let mut w = BitWriter::new(destination.data_mut());
        let mut body = vec![0u8; MAX_CHUNK];
        loop {
            let chunk_size = r.bytes_left(MAX_CHUNK);
            if chunk_size == 0 {
                break;
            }
            r.read_bytes(&mut body[..chunk_size])?;
            write_chunk(&mut w, b"IDAT", &body[..chunk_size])?;
        }
        write_chunk(&mut w, b"IEND", &[])
    }
}

// ── Deflate stage ───────────────────────────────────────────────────

/// The zlib stream wrapped around PNG's filtered scanlines.
#[derive(Clone, PartialEq)]
pub struct Deflate {
    pub(crate) base: StageBase,
}

impl Deflate {
    pub(crate) fn new(size: usize, pixel: &PixelFormat) -> Self {
        Self {
            base: StageBase::new(size, pixel),
        }
    }

    pub(crate) fn decompress(
        &self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        let input = &source.data()[fmt.offset..];

        fmt.offset = 0;
        fmt.pixel.copy_from(&self.base.pixel);
        sync(fmt, destination);

        let mut inflated = Vec::new();
        flate2::read::ZlibDecoder::new(input)
            .read_to_end(&mut inflated)
            .map_err(|e| CodecError::InvalidData(format!("zlib inflate failed: {e}")))?;

        let needed = destination.bytes();
        if inflated.len() < needed {
            return Err(CodecError::InvalidData(format!(
                "zlib stream yielded {} bytes, expected {needed}",
                inflated.len()
            )));
        }
        destination.data_mut().copy_from_slice(&inflated[..needed]);
        Ok(())
    }

    pub(crate) fn compress(
        &mut self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        let input = &source.data()[fmt.offset..];

        self.base.pixel.copy_from(&fmt.pixel);
        fmt.offset = 0;
        fmt.pixel.clear();

        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::best());
        encoder
            .write_all(input)
            .and_then(|_| encoder.finish())
            .map(|out| {
                self.base.size = out.len();
                sync_bytes(self.base.size, fmt, destination);
                destination.data_mut().copy_from_slice(&out);
            })
            .map_err(|e| CodecError::InvalidData(format!("zlib deflate failed: {e}")))
    }
}

// ── Filter + interlace stage ────────────────────────────────────────

/// Adam7 pass start offsets, `(x, y)` per pass.
const PASS_START: [(u32, u32); 7] = [(0, 0), (4, 0), (0, 4), (2, 0), (0, 2), (1, 0), (0, 1)];
/// Adam7 pass increments, `(x, y)` per pass.
const PASS_INC: [(u32, u32); 7] = [(8, 8), (8, 8), (4, 8), (4, 4), (2, 4), (2, 2), (1, 2)];

/// One interlace pass's coordinate mapping.
#[derive(Clone, Copy)]
struct Step {
    start_x: u32,
    start_y: u32,
    inc_x: u32,
    inc_y: u32,
}

impl Step {
    fn pass(pass: usize) -> Self {
        Self {
            start_x: PASS_START[pass].0,
            start_y: PASS_START[pass].1,
            inc_x: PASS_INC[pass].0,
            inc_y: PASS_INC[pass].1,
        }
    }

    /// Identity step for non-interlaced images.
    fn whole() -> Self {
        Self {
            start_x: 0,
            start_y: 0,
            inc_x: 1,
            inc_y: 1,
        }
    }

    fn x(&self, px: u32) -> u32 {
        self.start_x + self.inc_x * px
    }

    fn y(&self, py: u32) -> u32 {
        self.start_y + self.inc_y * py
    }
}

/// Scanline geometry of one pass.
#[derive(Clone, Copy)]
struct PassSize {
    /// Pixels per scanline.
    scanline: u32,
    /// Number of scanlines.
    number: u32,
}

impl PassSize {
    fn of(step: &Step, w: u32, h: u32) -> Self {
        Self {
            scanline: if w > step.start_x {
                (w - step.start_x).div_ceil(step.inc_x)
            } else {
                0
            },
            number: if h > step.start_y {
                (h - step.start_y).div_ceil(step.inc_y)
            } else {
                0
            },
        }
    }

    /// Bytes per stored line: the filter byte plus packed samples.
    fn line_bytes(&self, bits: u32) -> usize {
        1 + ((self.scanline as u64 * u64::from(bits) + 7) / 8) as usize
    }

    fn bytes(&self, bits: u32) -> usize {
        self.number as usize * self.line_bytes(bits)
    }

    fn empty(&self) -> bool {
        self.scanline == 0 || self.number == 0
    }
}

fn paeth_predictor(a: i32, b: i32, c: i32) -> i32 {
    let p = a + b - c;
    let pa = (p - a).abs();
    let pb = (p - b).abs();
    let pc = (p - c).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

/// Filter-selection heuristic: sum of the bytes reinterpreted as signed.
fn score_candidate(candidate: &[u8]) -> u32 {
    candidate
        .iter()
        .map(|&v| (v as i8).unsigned_abs() as u32)
        .sum()
}

/// Apply (`forward = true`) or undo one scanline filter. `previous` is
/// empty for the first line of a pass; `pixel_bytes` is the predictor
/// stride, `ceil(bits / 8)`.
fn apply_filter(
    line: &[u8],
    previous: &[u8],
    filter: u64,
    forward: bool,
    pixel_bytes: usize,
) -> Result<Vec<u8>, CodecError> {
    let width = line.len();
    let mut result = vec![0u8; width];

    // The predictor reads reconstructed bytes: the input line when
    // filtering, the output line when reconstructing.
    macro_rules! orig {
        ($i:expr) => {
            if forward { line[$i] } else { result[$i] }
        };
    }

    let combine = |a: u8, b: u8| -> u8 {
        if forward {
            a.wrapping_sub(b)
        } else {
            a.wrapping_add(b)
        }
    };

    match filter {
        FILTER_NONE => result.copy_from_slice(line),
        FILTER_SUB => {
            for i in 0..width {
                let left = if i >= pixel_bytes {
                    orig!(i - pixel_bytes)
                } else {
                    0
                };
                result[i] = combine(line[i], left);
            }
        }
        FILTER_UP => {
            for i in 0..width {
                let up = if previous.is_empty() { 0 } else { previous[i] };
                result[i] = combine(line[i], up);
            }
        }
        FILTER_AVERAGE => {
            for i in 0..width {
                let left = if i >= pixel_bytes {
                    i32::from(orig!(i - pixel_bytes))
                } else {
                    0
                };
                let up = if previous.is_empty() {
                    0
                } else {
                    i32::from(previous[i])
                };
                result[i] = combine(line[i], ((left + up) / 2) as u8);
            }
        }
        FILTER_PAETH => {
            for i in 0..width {
                let left = if i >= pixel_bytes {
                    i32::from(orig!(i - pixel_bytes))
                } else {
                    0
                };
                let up = if previous.is_empty() {
                    0
                } else {
                    i32::from(previous[i])
                };
                let up_left = if i >= pixel_bytes && !previous.is_empty() {
                    i32::from(previous[i - pixel_bytes])
                } else {
                    0
                };
                result[i] = combine(line[i], paeth_predictor(left, up, up_left) as u8);
            }
        }
        other => {
            return Err(CodecError::InvalidData(format!(
                "unknown PNG filter type {other}"
            )));
        }
    }
    Ok(result)
}

/// Per-scanline filtering and Adam7 interlacing.
#[derive(Clone, PartialEq)]
pub struct FilterInterlace {
    pub(crate) base: StageBase,
    pub(crate) interlaced: bool,
    pub(crate) w: i32,
    pub(crate) h: i32,
}

impl FilterInterlace {
    pub(crate) fn new(interlaced: bool, w: i32, h: i32, pixel: &PixelFormat) -> Self {
        let mut stage = Self {
            base: StageBase::new(0, pixel),
            interlaced,
            w,
            h,
        };
        stage.calculate_size();
        stage
    }

    /// Total filtered byte count over all passes.
    fn calculate_size(&mut self) {
        let bits = self.base.pixel.bits;
        let (w, h) = (self.w.unsigned_abs(), self.h.unsigned_abs());
        self.base.size = self
            .passes()
            .map(|step| PassSize::of(&step, w, h))
            .filter(|size| !size.empty())
            .map(|size| size.bytes(bits))
            .sum();
    }

    fn passes(&self) -> impl Iterator<Item = Step> {
        let interlaced = self.interlaced;
        (0..if interlaced { 7 } else { 1 }).map(move |pass| {
            if interlaced {
                Step::pass(pass)
            } else {
                Step::whole()
            }
        })
    }

    pub(crate) fn decompress(
        &self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        let mut r = BitReader::new(&source.data()[fmt.offset..]);

        fmt.offset = 0;

        // Reconstructed (unfiltered) pass data, same shape as the input
        // with every filter byte zeroed.
        let mut unfiltered = Reference::new_owned();
        sync_bytes(self.base.size, fmt, &mut unfiltered);

        fmt.pixel.copy_from(&self.base.pixel);
        sync(fmt, destination);

        let bits = fmt.pixel.bits;
        let width = fmt.w.unsigned_abs();
        let height = fmt.h.unsigned_abs();

        {
            let mut w = BitWriter::new(unfiltered.data_mut());
            let pixel_bytes = (bits as usize).div_ceil(8);
            for step in self.passes() {
                let size = PassSize::of(&step, width, height);
                if size.empty() {
                    continue;
                }
                let bytes = size.line_bytes(bits) - 1;
                let mut previous: Vec<u8> = Vec::new();
                let mut line = vec![0u8; bytes];
                for _ in 0..size.number {
                    let filter = r.read_bits(8)?;
                    r.read_bytes(&mut line)?;
                    let recon = apply_filter(&line, &previous, filter, false, pixel_bytes)?;
                    w.write_u8(0)?;
                    w.write_bytes(&recon)?;
                    previous = recon;
                }
            }
        }

        // Second pass: pick pixels out of the reconstructed scanlines
        // into their interlace positions.
        let mut image: Vec<Pixel> = vec![Pixel::new(); width as usize * height as usize];
        let mut reader = PixelReader::new(fmt, &unfiltered);
        for step in self.passes() {
            let size = PassSize::of(&step, width, height);
            if size.empty() {
                continue;
            }
            let bytes = size.line_bytes(bits) as u64 - 1;
            let padding = (8 * bytes - u64::from(bits) * u64::from(size.scanline)) as u32;
            for py in 0..size.number {
                reader.read_bits(8)?;
                for px in 0..size.scanline {
                    let (x, y) = (step.x(px), step.y(py));
                    if x < width && y < height {
                        reader.get_pixel(&mut image[(y * width + x) as usize])?;
                    }
                }
                reader.read_bits(padding)?;
            }
        }

        let mut writer = PixelWriter::new(fmt, destination);
        for pixel in &image {
            writer.put_pixel_ln(pixel)?;
        }
        Ok(())
    }

    pub(crate) fn compress(
        &mut self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        let mut reader = PixelReader::new(fmt, source);

        let width = fmt.w.unsigned_abs();
        let height = fmt.h.unsigned_abs();
        self.w = width as i32;
        self.h = height as i32;
        self.base.pixel.copy_from(&fmt.pixel);
        self.calculate_size();

        let mut raw_fmt = fmt.clone();
        raw_fmt.offset = 0;
        fmt.offset = 0;
        fmt.pixel.clear();

        sync_bytes(self.base.size, &raw_fmt, destination);

        let bits = raw_fmt.pixel.bits;

        let mut image: Vec<Pixel> = vec![Pixel::new(); width as usize * height as usize];
        for pixel in &mut image {
            reader.get_pixel_ln(pixel)?;
        }

        // First pass: lay the pixels out in pass order with zero filter
        // bytes and row padding.
        {
            let mut writer = PixelWriter::new(&raw_fmt, destination);
            for step in self.passes() {
                let size = PassSize::of(&step, width, height);
                if size.empty() {
                    continue;
                }
                let bytes = size.line_bytes(bits) as u64 - 1;
                let padding = (8 * bytes - u64::from(bits) * u64::from(size.scanline)) as u32;
                for py in 0..size.number {
                    writer.write_bits(8, 0)?;
                    for px in 0..size.scanline {
                        let (x, y) = (step.x(px), step.y(py));
                        if x < width && y < height {
                            writer.put_pixel(&image[(y * width + x) as usize])?;
                        }
                    }
                    writer.write_bits(padding, 0)?;
                }
            }
        }

        // Second pass: choose the best filter per row and rewrite in
        // place (working from a snapshot of the unfiltered layout).
        let unfiltered = destination.data().to_vec();
        let mut r = BitReader::new(&unfiltered);
        let mut w = BitWriter::new(destination.data_mut());
        let pixel_bytes = (bits as usize).div_ceil(8);

        for step in self.passes() {
            let size = PassSize::of(&step, width, height);
            if size.empty() {
                continue;
            }
            let bytes = size.line_bytes(bits) - 1;
            let mut previous: Vec<u8> = Vec::new();
            let mut line = vec![0u8; bytes];
            for _ in 0..size.number {
                r.read_bits(8)?;
                r.read_bytes(&mut line)?;

                let mut best_filter = FILTER_NONE;
                let mut best: Option<(u32, Vec<u8>)> = None;
                for filter in FILTER_NONE..=FILTER_PAETH {
                    let candidate = apply_filter(&line, &previous, filter, true, pixel_bytes)?;
                    let score = score_candidate(&candidate);
                    if best.as_ref().is_none_or(|(s, _)| score < *s) {
                        best_filter = filter;
                        best = Some((score, candidate));
                    }
                }
                let (_, filtered) = best.expect("five candidates always exist");

                w.write_u8(best_filter as u8)?;
                w.write_bytes(&filtered)?;
                previous = line.clone();
            }
        }
        Ok(())
    }
}

// ── Container parse and output ──────────────────────────────────────

/// Parse a PNG source into `format`, building its decode stack.
pub(crate) fn parse(reference: &Reference<'_>, format: &mut Format) -> Result<(), CodecError> {
    format.w = reference.w;
    format.h = reference.h;

    let data = reference.data();
    if data.len() < SIGNATURE.len() || data[..8] != SIGNATURE {
        return Err(CodecError::UnrecognizedFormat);
    }
    let mut r = BitReader::new(&data[SIGNATURE.len()..]);

    let ihdr_chunk = read_chunk(&mut r, |_| true)?
        .ok_or(CodecError::UnexpectedEof)?;
    if &ihdr_chunk.kind != b"IHDR" || ihdr_chunk.data.len() != 13 {
        return Err(CodecError::InvalidHeader("missing or malformed IHDR".into()));
    }

    let mut ihdr = BitReader::new(&ihdr_chunk.data);
    let width = ihdr.read_u32_be()?;
    let height = ihdr.read_u32_be()?;
    if width > i32::MAX as u32 || height > i32::MAX as u32 {
        return Err(CodecError::DimensionsTooLarge { width, height });
    }
    format.w = width as i32;
    format.h = height as i32;
    let bit_depth = ihdr.read_u8()?;
    let color_type = ihdr.read_u8()?;
    let _compression_method = ihdr.read_u8()?;
    let _filter_method = ihdr.read_u8()?;
    let interlace_method = ihdr.read_u8()?;

    // Walk the remaining chunks: total the IDAT payload, keep PLTE and
    // tRNS, and measure the framed size of everything.
    let mut volume = 0usize;
    let mut chunks = 0usize;
    let mut plte: Option<Chunk> = None;
    let mut trns: Option<Chunk> = None;
    let include = |kind: &[u8; 4]| kind == b"PLTE" || kind == b"tRNS";
    while let Some(chunk) = read_chunk(&mut r, include)? {
        chunks += chunk.size();
        match &chunk.kind {
            b"IDAT" => volume += chunk.length,
            b"PLTE" => {
                if plte.replace(chunk).is_some() {
                    return Err(CodecError::InvalidData("duplicate PLTE chunk".into()));
                }
            }
            b"tRNS" => {
                if trns.replace(chunk).is_some() {
                    return Err(CodecError::InvalidData("duplicate tRNS chunk".into()));
                }
            }
            _ => {}
        }
    }

    // A suggested palette on a truecolor image is not used.
    if color_type == COLOR_TRUECOLOR || color_type == COLOR_TRUECOLOR_ALPHA {
        plte = None;
    }
    if plte.is_some() != (color_type == COLOR_INDEXED) {
        return Err(CodecError::InvalidHeader(
            "PLTE presence does not match the color type".into(),
        ));
    }
    if trns.is_some()
        && matches!(color_type, COLOR_GRAYSCALE_ALPHA | COLOR_TRUECOLOR_ALPHA)
    {
        return Err(CodecError::InvalidData(
            "tRNS is forbidden on color types that carry alpha".into(),
        ));
    }

    format.pixel.clear();
    format.pad = 1;
    format.offset = SIGNATURE.len() + ihdr_chunk.size();
    let bits = u32::from(bit_depth);

    let depth_ok = match color_type {
        COLOR_GRAYSCALE => matches!(bit_depth, 1 | 2 | 4 | 8 | 16),
        COLOR_TRUECOLOR | COLOR_TRUECOLOR_ALPHA | COLOR_GRAYSCALE_ALPHA => {
            matches!(bit_depth, 8 | 16)
        }
        COLOR_INDEXED => matches!(bit_depth, 1 | 2 | 4 | 8),
        _ => {
            return Err(CodecError::InvalidHeader(format!(
                "unknown PNG color type {color_type}"
            )));
        }
    };
    if !depth_ok {
        return Err(CodecError::InvalidHeader(format!(
            "bit depth {bit_depth} is invalid for color type {color_type}"
        )));
    }

    match color_type {
        COLOR_GRAYSCALE => {
            format.pixel.channels.push(Channel { tag: 'G', bits });
            if trns.is_some() {
                format.pixel.channels.push(Channel { tag: 'A', bits });
            }
        }
        COLOR_TRUECOLOR => {
            for tag in ['R', 'G', 'B'] {
                format.pixel.channels.push(Channel { tag, bits });
            }
            if trns.is_some() {
                format.pixel.channels.push(Channel { tag: 'A', bits });
            }
        }
        COLOR_INDEXED => {
            for tag in ['R', 'G', 'B'] {
                format.pixel.channels.push(Channel { tag, bits: 8 });
            }
            if trns.is_some() {
                format.pixel.channels.push(Channel { tag: 'A', bits: 8 });
            }
        }
        COLOR_GRAYSCALE_ALPHA => {
            format.pixel.channels.push(Channel { tag: 'G', bits });
            format.pixel.channels.push(Channel { tag: 'A', bits });
        }
        COLOR_TRUECOLOR_ALPHA => {
            for tag in ['R', 'G', 'B', 'A'] {
                format.pixel.channels.push(Channel { tag, bits });
            }
        }
        _ => unreachable!(),
    }
    format.pixel.calculate_bits();

    if let Some(plte) = plte {
        extract_palette(format, &plte, trns.as_ref(), bit_depth)?;
    } else if let Some(trns) = trns {
        extract_chroma_key(format, &trns, color_type, bit_depth)?;
    } else {
        let size = format.buffer_size() - format.offset;
        let orient = Orient::new(size, false, false, None, &format.pixel);
        format.compression.push_front(Stage::Orient(orient));
    }

    let filter = FilterInterlace::new(
        interlace_method == 1,
        format.w.abs(),
        format.h.abs(),
        &format.pixel,
    );
    format.compression.push_front(Stage::FilterInterlace(filter));
    format.pixel.clear();

    let deflate = Deflate::new(volume, &format.pixel);
    format.compression.push_front(Stage::Deflate(deflate));

    let chunking = Chunking::new(chunks, &format.pixel);
    format.compression.push_front(Stage::Chunking(chunking));
    Ok(())
}

/// Build the palette stage for indexed color, merging per-index tRNS
/// alpha (missing entries default to opaque).
fn extract_palette(
    format: &mut Format,
    plte: &Chunk,
    trns: Option<&Chunk>,
    bit_depth: u8,
) -> Result<(), CodecError> {
    let alpha_bytes = usize::from(trns.is_some());
    let mut alpha_number = trns.map_or(0, |t| t.data.len());

    assert!(format.pixel.bits as usize > alpha_bytes * 8);
    let color_bytes = format.pixel.bits as usize / 8 - alpha_bytes;
    if plte.data.len() % color_bytes != 0 {
        return Err(CodecError::InvalidData(format!(
            "PLTE length {} is not a multiple of {color_bytes}",
            plte.data.len()
        )));
    }
    let color_number = plte.data.len() / color_bytes;

    let mut palette = Palette::new(0, &format.pixel);

    format.pixel.clear();
    format.pixel.channels.push(Channel {
        tag: '#',
        bits: u32::from(bit_depth),
    });
    format.pixel.calculate_bits();
    palette.base.size = format.buffer_size() - format.offset;

    let alpha = trns.map(|t| t.data.as_slice()).unwrap_or(&[]);
    for (i, entry) in plte.data.chunks_exact(color_bytes).enumerate() {
        let mut pixel: Pixel = entry.iter().map(|&b| u64::from(b)).collect();
        if trns.is_some() {
            if alpha_number > 0 {
                alpha_number -= 1;
                pixel.push(u64::from(alpha[i]));
            } else {
                pixel.push(255);
            }
        }
        palette.samples.push(pixel);
    }
    debug_assert_eq!(palette.samples.len(), color_number);
    if alpha_number != 0 {
        return Err(CodecError::InvalidData(
            "tRNS has more entries than the palette".into(),
        ));
    }

    format.compression.push_front(Stage::Palette(palette));

    let size = format.buffer_size() - format.offset;
    let orient = Orient::new(size, false, false, None, &format.pixel);
    format.compression.push_front(Stage::Orient(orient));
    Ok(())
}

/// Build the chroma-key stage for a grayscale or truecolor tRNS key.
///
/// Key samples are the chunk's 2-byte big-endian fields; sub-byte bit
/// depths are rejected.
fn extract_chroma_key(
    format: &mut Format,
    trns: &Chunk,
    color_type: u8,
    bit_depth: u8,
) -> Result<(), CodecError> {
    if !matches!(bit_depth, 8 | 16) {
        return Err(CodecError::UnsupportedVariant(format!(
            "tRNS chroma key at bit depth {bit_depth} is not supported"
        )));
    }
    let samples = match color_type {
        COLOR_GRAYSCALE => 1,
        COLOR_TRUECOLOR => 3,
        _ => {
            return Err(CodecError::InvalidData(
                "tRNS chroma key on an alpha-carrying color type".into(),
            ));
        }
    };
    if trns.data.len() != samples * 2 {
        return Err(CodecError::InvalidData(format!(
            "tRNS length {} does not match {samples} 16-bit samples",
            trns.data.len()
        )));
    }

    let mut r = BitReader::new(&trns.data);
    let mut key = Pixel::new();
    for _ in 0..samples {
        key.push(u64::from(r.read_u16_be()?));
    }

    // The keyed layout (with alpha) is what this stage produces; the
    // wire layout below it drops the alpha channel.
    let keyed_pixel = format.pixel.clone();
    format.pixel.channels.pop();
    format.pixel.calculate_bits();

    let size = format.buffer_size() - format.offset;
    let orient = Orient::new(size, false, false, Some(key), &keyed_pixel);
    format.compression.push_front(Stage::Orient(orient));
    Ok(())
}

/// Prepare `format` for PNG output and return the header writer.
///
/// Output is always truecolor-alpha 8-bit, Adam7 interlaced.
pub(crate) fn prepare_write(format: &mut Format) -> HeaderWriter {
    format.offset += SIGNATURE.len() + CHUNK_OVERHEAD + 13;

    format.pixel.channels.clear();
    for tag in ['R', 'G', 'B', 'A'] {
        format.pixel.channels.push(Channel { tag, bits: 8 });
    }
    format.pixel.calculate_bits();
    // Sources without an alpha channel encode as fully opaque.
    format.pixel.replacements.push(crate::pixel::Replacement {
        id: 3,
        channel: None,
        constant: Some(255),
    });

    let size = format.buffer_size() - format.offset;
    let orient = Orient::new(size, false, false, None, &format.pixel);
    format.compression.push_front(Stage::Orient(orient));

    let filter = FilterInterlace::new(true, format.w.abs(), format.h.abs(), &format.pixel);
    format.compression.push_front(Stage::FilterInterlace(filter));
    format.pixel.clear();

    let deflate = Deflate::new(0, &format.pixel);
    format.compression.push_front(Stage::Deflate(deflate));

    let chunking = Chunking::new(0, &format.pixel);
    format.compression.push_front(Stage::Chunking(chunking));

    Box::new(|fmt: &Format, reference: &mut Reference<'_>| {
        let mut w = BitWriter::new(reference.data_mut());
        w.write_bytes(&SIGNATURE)?;

        let mut ihdr = [0u8; 13];
        {
            let mut b = BitWriter::new(&mut ihdr);
            b.write_u32_be(fmt.w as u32)?;
            b.write_u32_be(fmt.h as u32)?;
            b.write_u8(8)?; // bit depth
            b.write_u8(COLOR_TRUECOLOR_ALPHA)?;
            b.write_u8(0)?; // compression method
            b.write_u8(0)?; // filter method
            b.write_u8(1)?; // Adam7
        }
        write_chunk(&mut w, b"IHDR", &ihdr)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paeth_breaks_ties_left_up_upleft() {
        assert_eq!(paeth_predictor(1, 1, 1), 1);
        // p = a + b - c; equal distances prefer a, then b.
        assert_eq!(paeth_predictor(10, 20, 15), 10);
        assert_eq!(paeth_predictor(0, 4, 2), 0);
        assert_eq!(paeth_predictor(0, 2, 4), 0);
    }

    #[test]
    fn filters_roundtrip() {
        let line = [12u8, 250, 3, 80, 200, 44];
        let previous = [9u8, 1, 130, 130, 7, 255];
        for filter in FILTER_NONE..=FILTER_PAETH {
            for stride in [1usize, 3] {
                let filtered = apply_filter(&line, &previous, filter, true, stride).unwrap();
                let recon = apply_filter(&filtered, &previous, filter, false, stride).unwrap();
                assert_eq!(recon, line, "filter {filter} stride {stride}");
            }
        }
    }

    #[test]
    fn first_line_filters_roundtrip_without_previous() {
        let line = [1u8, 2, 3, 4];
        for filter in FILTER_NONE..=FILTER_PAETH {
            let filtered = apply_filter(&line, &[], filter, true, 2).unwrap();
            let recon = apply_filter(&filtered, &[], filter, false, 2).unwrap();
            assert_eq!(recon, line);
        }
    }

    #[test]
    fn score_uses_signed_magnitudes() {
        // 0xFF is -1 signed, scoring 1 rather than 255.
        assert_eq!(score_candidate(&[0xFF, 0x01, 0x80]), 1 + 1 + 128);
    }

    #[test]
    fn pass_sizes_cover_a_7x7_image() {
        let mut total = 0u32;
        for pass in 0..7 {
            let step = Step::pass(pass);
            let size = PassSize::of(&step, 7, 7);
            total += size.scanline * size.number;
        }
        assert_eq!(total, 49);
    }

    #[test]
    fn chunk_crc_matches_png_reference() {
        // CRC of "IEND" with no data is the well-known AE 42 60 82.
        assert_eq!(crc32(b"IEND", &[]), 0xAE42_6082);
    }

    #[test]
    fn corrupted_chunk_crc_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(b"tRNS");
        bytes.extend_from_slice(&[1, 2]);
        bytes.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        let mut r = BitReader::new(&bytes);
        assert!(matches!(
            read_chunk(&mut r, |_| true),
            Err(CodecError::InvalidData(_))
        ));
    }
}
