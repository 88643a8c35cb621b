//! The compression stage algebra.
//!
//! Every reversible transformation between raw container bytes and bare
//! pixels is one [`Stage`]. A stage knows the pixel layout its output has
//! after `decompress` and the byte count of its compressed form. The
//! translate driver pops a stage off the format's stack before invoking
//! it, hands it the format it must update, and moves the produced buffer
//! to the next stage.

use crate::error::CodecError;
use crate::format::{Format, sync};
use crate::pixel::{Pixel, PixelFormat};
use crate::pixelio::{PixelReader, PixelWriter};
use crate::reference::Reference;

/// Data common to all stages: the pixel layout after decompression and the
/// compressed byte count.
#[derive(Clone, Debug)]
pub struct StageBase {
    pub pixel: PixelFormat,
    pub size: usize,
}

impl StageBase {
    pub(crate) fn new(size: usize, pixel: &PixelFormat) -> Self {
        let mut p = PixelFormat::new();
        p.copy_from(pixel);
        Self { pixel: p, size }
    }
}

impl PartialEq for StageBase {
    /// Stage-level equality compares the pixel layout, not the size.
    fn eq(&self, other: &Self) -> bool {
        self.pixel.same_channels(&other.pixel)
    }
}

/// One reversible pipeline transformation.
#[derive(Clone, PartialEq)]
pub enum Stage {
    /// Palette-index expansion.
    Palette(Palette),
    /// Row-order / axis-flip normalization and chroma-key alpha expansion.
    Orient(Orient),
    /// BMP run-length decoding.
    Rle(crate::bmp::Rle),
    /// PNG chunk framing: IDAT concatenation.
    Chunking(crate::png::Chunking),
    /// PNG zlib stream.
    Deflate(crate::png::Deflate),
    /// PNG scanline filters and Adam7 interlacing.
    FilterInterlace(crate::png::FilterInterlace),
    /// JPEG entropy coding.
    Huffman(crate::jpeg::Huffman),
    /// JPEG arithmetic entropy coding (declared; decode unimplemented).
    Arithmetic(crate::jpeg::Arithmetic),
    /// JPEG coefficient dequantization and zig-zag undo.
    Quantize(crate::jpeg::Quantize),
    /// JPEG 8x8 inverse DCT.
    Dct(crate::jpeg::Dct),
    /// JPEG MCU-to-plane block regrouping.
    BlockGroup(crate::jpeg::BlockGroup),
    /// JPEG chroma plane upsampling.
    Upsample(crate::jpeg::Upsample),
    /// JPEG YCbCr(K) to RGB conversion.
    Ycck(crate::jpeg::Ycck),
    /// JPEG CMYK to RGB conversion.
    Cmyk(crate::jpeg::Cmyk),
}

impl Stage {
    pub fn base(&self) -> &StageBase {
        match self {
            Stage::Palette(s) => &s.base,
            Stage::Orient(s) => &s.base,
            Stage::Rle(s) => &s.base,
            Stage::Chunking(s) => &s.base,
            Stage::Deflate(s) => &s.base,
            Stage::FilterInterlace(s) => &s.base,
            Stage::Huffman(s) => &s.base,
            Stage::Arithmetic(s) => &s.base,
            Stage::Quantize(s) => &s.base,
            Stage::Dct(s) => &s.base,
            Stage::BlockGroup(s) => &s.base,
            Stage::Upsample(s) => &s.base,
            Stage::Ycck(s) => &s.base,
            Stage::Cmyk(s) => &s.base,
        }
    }

    pub(crate) fn base_mut(&mut self) -> &mut StageBase {
        match self {
            Stage::Palette(s) => &mut s.base,
            Stage::Orient(s) => &mut s.base,
            Stage::Rle(s) => &mut s.base,
            Stage::Chunking(s) => &mut s.base,
            Stage::Deflate(s) => &mut s.base,
            Stage::FilterInterlace(s) => &mut s.base,
            Stage::Huffman(s) => &mut s.base,
            Stage::Arithmetic(s) => &mut s.base,
            Stage::Quantize(s) => &mut s.base,
            Stage::Dct(s) => &mut s.base,
            Stage::BlockGroup(s) => &mut s.base,
            Stage::Upsample(s) => &mut s.base,
            Stage::Ycck(s) => &mut s.base,
            Stage::Cmyk(s) => &mut s.base,
        }
    }

    /// Compressed byte count of this stage's representation.
    pub fn size(&self) -> usize {
        self.base().size
    }

    /// Pixel layout the data has after this stage's `decompress`.
    pub fn pixel(&self) -> &PixelFormat {
        &self.base().pixel
    }

    /// Undo this transformation. `fmt` describes the incoming data and must
    /// already have this stage popped from its stack; on return it
    /// describes `destination`.
    pub(crate) fn decompress(
        &self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        match self {
            Stage::Palette(s) => s.decompress(fmt, source, destination),
            Stage::Orient(s) => s.decompress(fmt, source, destination),
            Stage::Rle(s) => s.decompress(fmt, source, destination),
            Stage::Chunking(s) => s.decompress(fmt, source, destination),
            Stage::Deflate(s) => s.decompress(fmt, source, destination),
            Stage::FilterInterlace(s) => s.decompress(fmt, source, destination),
            Stage::Huffman(s) => s.decompress(fmt, source, destination),
            Stage::Arithmetic(s) => s.decompress(fmt, source, destination),
            Stage::Quantize(s) => s.decompress(fmt, source, destination),
            Stage::Dct(s) => s.decompress(fmt, source, destination),
            Stage::BlockGroup(s) => s.decompress(fmt, source, destination),
            Stage::Upsample(s) => s.decompress(fmt, source, destination),
            Stage::Ycck(s) => s.decompress(fmt, source, destination),
            Stage::Cmyk(s) => s.decompress(fmt, source, destination),
        }
    }

    /// Apply this transformation. `fmt` describes the incoming data with
    /// the already-compressed inner stages on its stack but not this one;
    /// the stage records the incoming pixel layout and its new size.
    pub(crate) fn compress(
        &mut self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        match self {
            Stage::Palette(s) => s.compress(fmt, source, destination),
            Stage::Orient(s) => s.compress(fmt, source, destination),
            Stage::Rle(s) => s.compress(fmt, source, destination),
            Stage::Chunking(s) => s.compress(fmt, source, destination),
            Stage::Deflate(s) => s.compress(fmt, source, destination),
            Stage::FilterInterlace(s) => s.compress(fmt, source, destination),
            Stage::Huffman(s) => s.compress(fmt, source, destination),
            Stage::Arithmetic(s) => s.compress(fmt, source, destination),
            Stage::Quantize(s) => s.compress(fmt, source, destination),
            Stage::Dct(s) => s.compress(fmt, source, destination),
            Stage::BlockGroup(s) => s.compress(fmt, source, destination),
            Stage::Upsample(s) => s.compress(fmt, source, destination),
            Stage::Ycck(s) => s.compress(fmt, source, destination),
            Stage::Cmyk(s) => s.compress(fmt, source, destination),
        }
    }
}

// ── Orient ──────────────────────────────────────────────────────────

/// Normalizes row/column order and optionally expands a chroma key into an
/// explicit alpha channel.
///
/// `flip_x`/`flip_y` negate the respective signed dimension; axes left
/// negative after that are physically flipped and the dimensions stored
/// positive, so decompressed output is always top-down.
#[derive(Clone, PartialEq)]
pub struct Orient {
    pub(crate) base: StageBase,
    pub(crate) flip_x: bool,
    pub(crate) flip_y: bool,
    /// Pixels equal to this key become fully transparent; all others
    /// fully opaque.
    pub(crate) chroma_key: Option<Pixel>,
}

impl Orient {
    pub(crate) fn new(
        size: usize,
        flip_x: bool,
        flip_y: bool,
        chroma_key: Option<Pixel>,
        pixel: &PixelFormat,
    ) -> Self {
        Self {
            base: StageBase::new(size, pixel),
            flip_x,
            flip_y,
            chroma_key,
        }
    }

    fn decompress(
        &self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        let mut reader = PixelReader::new(fmt, source);

        fmt.offset = 0;
        fmt.pixel.copy_from(&self.base.pixel);

        if self.flip_x {
            fmt.w = -fmt.w;
        }
        if self.flip_y {
            fmt.h = -fmt.h;
        }
        let flip_cols = fmt.w < 0;
        let flip_rows = fmt.h < 0;
        fmt.w = fmt.w.abs();
        fmt.h = fmt.h.abs();
        sync(fmt, destination);

        let width = fmt.w as usize;
        let height = fmt.h as usize;
        let alpha_id = fmt.pixel.id('A');

        let mut image: Vec<Pixel> = vec![Pixel::new(); width * height];
        for row in image.chunks_mut(width.max(1)) {
            for pixel in row {
                reader.get_pixel_ln(pixel)?;
                if let Some(key) = &self.chroma_key {
                    let id = alpha_id.expect("chroma key requires an alpha channel");
                    let value = if *pixel == *key {
                        0
                    } else {
                        fmt.pixel.channels[id].max()
                    };
                    pixel.insert(id, value);
                }
            }
        }

        let mut writer = PixelWriter::new(fmt, destination);
        for y in 0..height {
            let sy = if flip_rows { height - 1 - y } else { y };
            for x in 0..width {
                let sx = if flip_cols { width - 1 - x } else { x };
                writer.put_pixel_ln(&image[sy * width + sx])?;
            }
        }
        Ok(())
    }

    fn compress(
        &mut self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        if self.chroma_key.is_some() {
            return Err(CodecError::UnsupportedVariant(
                "chroma-key compression is not implemented".into(),
            ));
        }
        let mut reader = PixelReader::new(fmt, source);

        fmt.offset = 0;
        self.base.pixel.copy_from(&fmt.pixel);
        self.base.size = fmt.buffer_size();

        if self.flip_x {
            fmt.w = -fmt.w;
        }
        if self.flip_y {
            fmt.h = -fmt.h;
        }
        let flip_cols = fmt.w < 0;
        let flip_rows = fmt.h < 0;
        fmt.w = fmt.w.abs();
        fmt.h = fmt.h.abs();
        sync(fmt, destination);

        let width = fmt.w as usize;
        let height = fmt.h as usize;

        let mut image: Vec<Pixel> = vec![Pixel::new(); width * height];
        for pixel in &mut image {
            reader.get_pixel_ln(pixel)?;
        }

        let mut writer = PixelWriter::new(fmt, destination);
        for y in 0..height {
            let sy = if flip_rows { height - 1 - y } else { y };
            for x in 0..width {
                let sx = if flip_cols { width - 1 - x } else { x };
                writer.put_pixel_ln(&image[sy * width + sx])?;
            }
        }
        Ok(())
    }
}

// ── Palette ─────────────────────────────────────────────────────────

/// Maps palette indices (`'#'` channel) to sample pixels.
#[derive(Clone, PartialEq)]
pub struct Palette {
    pub(crate) base: StageBase,
    /// Sample table, in the stage's output pixel layout.
    pub(crate) samples: Vec<Pixel>,
}

impl Palette {
    pub(crate) fn new(size: usize, pixel: &PixelFormat) -> Self {
        Self {
            base: StageBase::new(size, pixel),
            samples: Vec::new(),
        }
    }

    fn decompress(
        &self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        let mut reader = PixelReader::new(fmt, source);

        fmt.offset = 0;
        fmt.pixel.copy_from(&self.base.pixel);
        sync(fmt, destination);

        let mut writer = PixelWriter::new(fmt, destination);

        let mut area = fmt.w.unsigned_abs() as u64 * fmt.h.unsigned_abs() as u64;
        let mut pixel = Pixel::new();
        while area > 0 {
            reader.get_pixel_ln(&mut pixel)?;
            debug_assert_eq!(pixel.len(), 1);
            let index = pixel[0] as usize;
            if index >= self.samples.len() {
                return Err(CodecError::InvalidData(format!(
                    "palette index {index} out of range (palette has {} entries)",
                    self.samples.len()
                )));
            }
            writer.put_pixel_ln(&self.samples[index])?;
            area -= 1;
        }
        Ok(())
    }

    fn compress(
        &mut self,
        _fmt: &mut Format,
        _source: &Reference<'_>,
        _destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        Err(CodecError::UnsupportedVariant(
            "palette compression is not implemented".into(),
        ))
    }
}
