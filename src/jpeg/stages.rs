//! The post-entropy JPEG stages: dequantization, the inverse DCT, MCU
//! block regrouping, chroma upsampling, and color conversion.
//!
//! Stages hand data forward in little-endian serialized protocols:
//! dequantization and the IDCT keep the entropy stage's block stream,
//! regrouping emits per-component raster block planes, upsampling emits
//! full-resolution `i16` sample planes, and color conversion produces the
//! final interleaved 8-bit pixels.

use std::rc::Rc;
use std::sync::OnceLock;

use crate::bitio::{BitReader, BitWriter};
use crate::error::CodecError;
use crate::format::{Format, sync_bytes};
use crate::pixel::PixelFormat;
use crate::reference::Reference;
use crate::stage::StageBase;

use super::huffman::BLOCK_BYTES;
use super::segment::JpegImage;
use super::{Geometry, jpeg_eq};

/// Natural position to zig-zag sequence index.
#[rustfmt::skip]
const ZIGZAG: [usize; 64] = [
     0,  1,  5,  6, 14, 15, 27, 28,
     2,  4,  7, 13, 16, 26, 29, 42,
     3,  8, 12, 17, 25, 30, 41, 43,
     9, 11, 18, 24, 31, 40, 44, 53,
    10, 19, 23, 32, 39, 45, 52, 54,
    20, 22, 33, 38, 46, 51, 55, 60,
    21, 34, 37, 47, 50, 56, 59, 61,
    35, 36, 48, 49, 57, 58, 62, 63,
];

fn unsupported(stage: &str) -> CodecError {
    CodecError::UnsupportedVariant(format!("JPEG {stage} compression is not implemented"))
}

/// Read the entropy stage's block-stream header and validate its size.
fn read_block_count(
    r: &mut BitReader<'_>,
    available: usize,
) -> Result<usize, CodecError> {
    let count = r.read_u32_le()? as usize;
    let expected = 4 + count * BLOCK_BYTES;
    if expected != available {
        return Err(CodecError::InvalidData(format!(
            "block stream claims {count} blocks ({expected} bytes) in {available} bytes"
        )));
    }
    Ok(count)
}

// ── Arithmetic (declared only) ──────────────────────────────────────

/// Arithmetic entropy coding. Declared so arithmetic frames are
/// recognized, but decoding is not implemented.
#[derive(Clone)]
pub struct Arithmetic {
    pub(crate) base: StageBase,
    pub(crate) image: Rc<JpegImage>,
}

impl PartialEq for Arithmetic {
    fn eq(&self, other: &Self) -> bool {
        jpeg_eq(&self.base, &self.image, &other.base, &other.image)
    }
}

impl Arithmetic {
    pub(crate) fn decompress(
        &self,
        _fmt: &mut Format,
        _source: &Reference<'_>,
        _destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        Err(CodecError::UnsupportedVariant(
            "JPEG arithmetic decoding is not implemented".into(),
        ))
    }

    pub(crate) fn compress(
        &mut self,
        _fmt: &mut Format,
        _source: &Reference<'_>,
        _destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        Err(unsupported("arithmetic"))
    }
}

// ── Quantize ────────────────────────────────────────────────────────

/// Multiplies each coefficient by its component's quantization table
/// entry and drops zig-zag order into natural order.
#[derive(Clone)]
pub struct Quantize {
    pub(crate) base: StageBase,
    pub(crate) image: Rc<JpegImage>,
}

impl PartialEq for Quantize {
    fn eq(&self, other: &Self) -> bool {
        jpeg_eq(&self.base, &self.image, &other.base, &other.image)
    }
}

impl Quantize {
    pub(crate) fn new(image: Rc<JpegImage>, size: usize, pixel: &PixelFormat) -> Self {
        Self {
            base: StageBase::new(size, pixel),
            image,
        }
    }

    pub(crate) fn decompress(
        &self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        let sof = self
            .image
            .sof()
            .ok_or_else(|| CodecError::InvalidHeader("missing SOF segment".into()))?;

        // Later tables with the same id replace earlier ones.
        let mut tables: [Option<[u16; 64]>; 4] = [None; 4];
        for dqt in self.image.dqt_segments() {
            for t in &dqt.tables {
                tables[usize::from(t.id)] = Some(t.values);
            }
        }

        let mut r = BitReader::new(&source.data()[fmt.offset..]);
        let count = read_block_count(&mut r, source.bytes() - fmt.offset)?;

        fmt.offset = 0;
        fmt.pixel.copy_from(&self.base.pixel);
        sync_bytes(4 + count * BLOCK_BYTES, fmt, destination);

        let mut w = BitWriter::new(destination.data_mut());
        w.write_u32_le(count as u32)?;

        for _ in 0..count {
            let component_id = r.read_u8()?;
            let quant_id = sof
                .component(component_id)
                .map(|c| c.quant_table)
                .ok_or_else(|| {
                    CodecError::InvalidData(format!(
                        "block references unknown component {component_id}"
                    ))
                })?;
            let table = tables[usize::from(quant_id) & 3].as_ref().ok_or_else(|| {
                CodecError::InvalidData(format!("missing quantization table {quant_id}"))
            })?;

            let mut coefficients = [0i32; 64];
            for (c, &q) in coefficients.iter_mut().zip(table.iter()) {
                let v = r.read_u32_le()? as i32;
                let scaled = i64::from(v) * i64::from(q);
                *c = i32::try_from(scaled).map_err(|_| {
                    CodecError::InvalidData("dequantized coefficient overflow".into())
                })?;
            }

            w.write_u8(component_id)?;
            for i in 0..64 {
                w.write_u32_le(coefficients[ZIGZAG[i]] as u32)?;
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
        Err(unsupported("quantization"))
    }
}

// ── Inverse DCT ─────────────────────────────────────────────────────

/// Fixed-point precision of the IDCT coefficient table.
const IDCT_BITS: u32 = 20;
const IDCT_HALF: i64 = 1 << (IDCT_BITS - 1);

/// Basis table: `coef[u][x] = Cu * cos((2x+1)u * pi/16) / 2`, scaled to
/// fixed point. Built once, immutable afterwards.
fn idct_coefficients() -> &'static [[i32; 8]; 8] {
    static COEFFICIENTS: OnceLock<[[i32; 8]; 8]> = OnceLock::new();
    COEFFICIENTS.get_or_init(|| {
        let scale = f64::from(1u32 << IDCT_BITS);
        let mut coef = [[0i32; 8]; 8];
        for (u, row) in coef.iter_mut().enumerate() {
            let cu = if u == 0 {
                1.0 / 2.0_f64.sqrt()
            } else {
                1.0
            };
            for (x, value) in row.iter_mut().enumerate() {
                let c =
                    cu * ((2.0 * x as f64 + 1.0) * u as f64 * std::f64::consts::PI / 16.0).cos()
                        * 0.5;
                *value = (c * scale).round() as i32;
            }
        }
        coef
    })
}

/// Two-pass separable integer 8x8 inverse DCT with 64-bit accumulators.
pub(crate) fn idct8x8(input: &[i32; 64], output: &mut [i32; 64]) {
    let coef = idct_coefficients();
    let mut tmp = [0i32; 64];

    for y in 0..8 {
        for x in 0..8 {
            let mut sum: i64 = 0;
            for u in 0..8 {
                sum += i64::from(input[y * 8 + u]) * i64::from(coef[u][x]);
            }
            tmp[y * 8 + x] = ((sum + IDCT_HALF) >> IDCT_BITS) as i32;
        }
    }

    for x in 0..8 {
        for y in 0..8 {
            let mut sum: i64 = 0;
            for v in 0..8 {
                sum += i64::from(tmp[v * 8 + x]) * i64::from(coef[v][y]);
            }
            output[y * 8 + x] = ((sum + IDCT_HALF) >> IDCT_BITS) as i32;
        }
    }
}

/// 8x8 inverse DCT per block, output as spatial samples before the level
/// shift, in the same block-stream protocol.
#[derive(Clone)]
pub struct Dct {
    pub(crate) base: StageBase,
    pub(crate) image: Rc<JpegImage>,
}

impl PartialEq for Dct {
    fn eq(&self, other: &Self) -> bool {
        jpeg_eq(&self.base, &self.image, &other.base, &other.image)
    }
}

impl Dct {
    pub(crate) fn new(image: Rc<JpegImage>, size: usize, pixel: &PixelFormat) -> Self {
        Self {
            base: StageBase::new(size, pixel),
            image,
        }
    }

    pub(crate) fn decompress(
        &self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        let mut r = BitReader::new(&source.data()[fmt.offset..]);
        let count = read_block_count(&mut r, source.bytes() - fmt.offset)?;

        fmt.offset = 0;
        fmt.pixel.copy_from(&self.base.pixel);
        sync_bytes(4 + count * BLOCK_BYTES, fmt, destination);

        let mut w = BitWriter::new(destination.data_mut());
        w.write_u32_le(count as u32)?;

        let mut input = [0i32; 64];
        let mut output = [0i32; 64];
        for _ in 0..count {
            let component_id = r.read_u8()?;
            for v in &mut input {
                *v = r.read_u32_le()? as i32;
            }

            idct8x8(&input, &mut output);

            w.write_u8(component_id)?;
            for &v in &output {
                w.write_u32_le(v as u32)?;
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
        Err(unsupported("forward DCT"))
    }
}

// ── Block regrouping ────────────────────────────────────────────────

/// Reassembles the MCU-interleaved block stream into per-component
/// raster-order block planes.
///
/// Output protocol: `width_blocks: u16`, `height_blocks: u16` (both in
/// MCU-padded units of the maximum sampling factors), `count: u8`, then
/// per component: id, sampling byte, quant table id, `num_blocks: u32`,
/// and the blocks as 64 `i16` values each.
#[derive(Clone)]
pub struct BlockGroup {
    pub(crate) base: StageBase,
    pub(crate) image: Rc<JpegImage>,
}

impl PartialEq for BlockGroup {
    fn eq(&self, other: &Self) -> bool {
        jpeg_eq(&self.base, &self.image, &other.base, &other.image)
    }
}

impl BlockGroup {
    pub(crate) fn new(image: Rc<JpegImage>, size: usize, pixel: &PixelFormat) -> Self {
        Self {
            base: StageBase::new(size, pixel),
            image,
        }
    }

    pub(crate) fn decompress(
        &self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        let sof = self
            .image
            .sof()
            .ok_or_else(|| CodecError::InvalidHeader("missing SOF segment".into()))?;
        let geometry = Geometry::of(&self.image)?;

        let mut r = BitReader::new(&source.data()[fmt.offset..]);
        let count = read_block_count(&mut r, source.bytes() - fmt.offset)?;

        struct RawBlock {
            component_id: u8,
            values: [i32; 64],
        }
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let component_id = r.read_u8()?;
            let mut values = [0i32; 64];
            for v in &mut values {
                *v = r.read_u32_le()? as i32;
            }
            blocks.push(RawBlock {
                component_id,
                values,
            });
        }

        let component_count = sof.components.len();
        let mut planes: Vec<Vec<i16>> = (0..component_count)
            .map(|i| {
                let (bw, bh) = geometry.comp_block_dims(i);
                vec![0i16; bw * bh * 64]
            })
            .collect();

        let mut in_index = 0usize;
        for my in 0..geometry.mcus_y {
            for mx in 0..geometry.mcus_x {
                let mut placed = vec![0usize; component_count];
                for component in &sof.components {
                    let per_mcu = usize::from(component.h()) * usize::from(component.v());
                    for _ in 0..per_mcu {
                        let block = blocks.get(in_index).ok_or_else(|| {
                            CodecError::InvalidData("block stream ends mid-MCU".into())
                        })?;

                        let target = sof
                            .components
                            .iter()
                            .position(|c| c.id == block.component_id)
                            .ok_or_else(|| {
                                CodecError::InvalidData(format!(
                                    "block references unknown component {}",
                                    block.component_id
                                ))
                            })?;
                        let h = usize::from(sof.components[target].h());
                        let v = usize::from(sof.components[target].v());
                        let (bw, bh) = geometry.comp_block_dims(target);

                        let index = placed[target];
                        placed[target] += 1;
                        let block_x = mx * h + index % h;
                        let block_y = my * v + index / h;
                        if block_x >= bw || block_y >= bh {
                            return Err(CodecError::InvalidData(
                                "more blocks than the component plane holds".into(),
                            ));
                        }

                        let plane = &mut planes[target];
                        let dest = (block_y * bw + block_x) * 64;
                        for (d, &s) in plane[dest..dest + 64].iter_mut().zip(&block.values) {
                            *d = i16::try_from(s).map_err(|_| {
                                CodecError::InvalidData("spatial sample overflows 16 bits".into())
                            })?;
                        }
                        in_index += 1;
                    }
                }
            }
        }

        let mut bytes = 2 + 2 + 1;
        for i in 0..component_count {
            let (bw, bh) = geometry.comp_block_dims(i);
            bytes += 1 + 1 + 1 + 4 + bw * bh * 64 * 2;
        }

        fmt.offset = 0;
        fmt.pixel.copy_from(&self.base.pixel);
        sync_bytes(bytes, fmt, destination);

        let mut w = BitWriter::new(destination.data_mut());
        w.write_u16_le((geometry.mcus_x * usize::from(geometry.max_h)) as u16)?;
        w.write_u16_le((geometry.mcus_y * usize::from(geometry.max_v)) as u16)?;
        w.write_u8(component_count as u8)?;
        for (i, component) in sof.components.iter().enumerate() {
            let (bw, bh) = geometry.comp_block_dims(i);
            w.write_u8(component.id)?;
            w.write_u8(component.sampling)?;
            w.write_u8(component.quant_table)?;
            w.write_u32_le((bw * bh) as u32)?;
            for &v in &planes[i] {
                w.write_u16_le(v as u16)?;
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
        Err(unsupported("block grouping"))
    }
}

// ── Chroma upsampling ───────────────────────────────────────────────

/// One decoded component plane of `i16` samples.
struct Plane {
    component_id: u8,
    w: usize,
    h: usize,
    samples: Vec<i16>,
}

/// Bilinear upsampling of each component plane to the frame size.
///
/// Output protocol: `width: u16`, `height: u16`, `count: u8`, then per
/// plane: component id, element size (2), and `width * height` `i16`
/// samples.
#[derive(Clone)]
pub struct Upsample {
    pub(crate) base: StageBase,
    pub(crate) image: Rc<JpegImage>,
}

impl PartialEq for Upsample {
    fn eq(&self, other: &Self) -> bool {
        jpeg_eq(&self.base, &self.image, &other.base, &other.image)
    }
}

impl Upsample {
    pub(crate) fn new(image: Rc<JpegImage>, size: usize, pixel: &PixelFormat) -> Self {
        Self {
            base: StageBase::new(size, pixel),
            image,
        }
    }

    pub(crate) fn decompress(
        &self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        let sof = self
            .image
            .sof()
            .ok_or_else(|| CodecError::InvalidHeader("missing SOF segment".into()))?;
        let geometry = Geometry::of(&self.image)?;

        let mut r = BitReader::new(&source.data()[fmt.offset..]);
        let width_blocks = usize::from(r.read_u16_le()?);
        let height_blocks = usize::from(r.read_u16_le()?);
        let component_count = usize::from(r.read_u8()?);

        let mcus_x = width_blocks / usize::from(geometry.max_h);
        let mcus_y = height_blocks / usize::from(geometry.max_v);

        let mut planes = Vec::with_capacity(component_count);
        for _ in 0..component_count {
            let component_id = r.read_u8()?;
            let _sampling = r.read_u8()?;
            let _quant_table = r.read_u8()?;
            let num_blocks = r.read_u32_le()? as usize;

            let component = sof.component(component_id).ok_or_else(|| {
                CodecError::InvalidData(format!(
                    "plane references unknown component {component_id}"
                ))
            })?;
            let block_w = mcus_x * usize::from(component.h());
            let block_h = mcus_y * usize::from(component.v());
            if num_blocks != block_w * block_h {
                return Err(CodecError::InvalidData(format!(
                    "component {component_id} block count {num_blocks} does not match its \
                     {block_w}x{block_h} grid"
                )));
            }

            // Blocks arrive in raster order over the block grid; scatter
            // each 8x8 into its row-major sample positions.
            let w = block_w * 8;
            let h = block_h * 8;
            let mut samples = vec![0i16; w * h];
            for by in 0..block_h {
                for bx in 0..block_w {
                    for ry in 0..8 {
                        for rx in 0..8 {
                            samples[(by * 8 + ry) * w + bx * 8 + rx] =
                                r.read_u16_le()? as i16;
                        }
                    }
                }
            }

            planes.push(Plane {
                component_id,
                w,
                h,
                samples,
            });
        }

        let image_w = usize::from(sof.width);
        let image_h = usize::from(geometry.frame_height);

        fmt.offset = 0;
        fmt.pixel.copy_from(&self.base.pixel);
        sync_bytes(
            2 + 2 + 1 + planes.len() * (1 + 1 + 2 * image_w * image_h),
            fmt,
            destination,
        );

        let mut w = BitWriter::new(destination.data_mut());
        w.write_u16_le(image_w as u16)?;
        w.write_u16_le(image_h as u16)?;
        w.write_u8(planes.len() as u8)?;

        for plane in &planes {
            w.write_u8(plane.component_id)?;
            w.write_u8(2)?; // element size

            let sx_factor = plane.w as f64 / image_w as f64;
            let sy_factor = plane.h as f64 / image_h as f64;

            for y in 0..image_h {
                let sy = ((y as f64 + 0.5) * sy_factor - 0.5)
                    .clamp(0.0, (plane.h - 1) as f64);
                let y0 = sy.floor() as usize;
                let y1 = (y0 + 1).min(plane.h - 1);
                let wy = sy - y0 as f64;

                for x in 0..image_w {
                    let sx = ((x as f64 + 0.5) * sx_factor - 0.5)
                        .clamp(0.0, (plane.w - 1) as f64);
                    let x0 = sx.floor() as usize;
                    let x1 = (x0 + 1).min(plane.w - 1);
                    let wx = sx - x0 as f64;

                    let v00 = f64::from(plane.samples[y0 * plane.w + x0]);
                    let v10 = f64::from(plane.samples[y0 * plane.w + x1]);
                    let v01 = f64::from(plane.samples[y1 * plane.w + x0]);
                    let v11 = f64::from(plane.samples[y1 * plane.w + x1]);

                    let value = (1.0 - wx) * (1.0 - wy) * v00
                        + wx * (1.0 - wy) * v10
                        + (1.0 - wx) * wy * v01
                        + wx * wy * v11;

                    let v = value.round();
                    if !(f64::from(i16::MIN)..=f64::from(i16::MAX)).contains(&v) {
                        return Err(CodecError::InvalidData(
                            "upsampled sample overflows 16 bits".into(),
                        ));
                    }
                    w.write_u16_le(v as i16 as u16)?;
                }
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
        Err(unsupported("chroma downsampling"))
    }
}

// ── Color conversion ────────────────────────────────────────────────

fn clamp8(v: f64) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Read the upsample stage's plane protocol.
fn read_planes(
    r: &mut BitReader<'_>,
) -> Result<(usize, usize, Vec<Plane>), CodecError> {
    let width = usize::from(r.read_u16_le()?);
    let height = usize::from(r.read_u16_le()?);
    let count = usize::from(r.read_u8()?);

    let mut planes = Vec::with_capacity(count);
    for _ in 0..count {
        let component_id = r.read_u8()?;
        let element_size = r.read_u8()?;
        if element_size != 2 {
            return Err(CodecError::InvalidData(format!(
                "unsupported plane element size {element_size}"
            )));
        }
        let mut samples = vec![0i16; width * height];
        for s in &mut samples {
            *s = r.read_u16_le()? as i16;
        }
        planes.push(Plane {
            component_id,
            w: width,
            h: height,
            samples,
        });
    }
    Ok((width, height, planes))
}

/// Which route the color stage takes to RGB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ColorMode {
    /// Single luminance component, level-shifted to 8-bit gray.
    Gray,
    /// Three components stored as RGB; level shift only.
    Rgb,
    /// Three components, YCbCr to RGB.
    YCbCr,
    /// Four components, YCbCr plus K (YCCK).
    Ycck,
}

/// Luminance/chroma color conversion to 8-bit output.
#[derive(Clone)]
pub struct Ycck {
    pub(crate) base: StageBase,
    pub(crate) image: Rc<JpegImage>,
    pub(crate) mode: ColorMode,
}

impl PartialEq for Ycck {
    fn eq(&self, other: &Self) -> bool {
        self.mode == other.mode
            && jpeg_eq(&self.base, &self.image, &other.base, &other.image)
    }
}

impl Ycck {
    pub(crate) fn new(
        image: Rc<JpegImage>,
        mode: ColorMode,
        size: usize,
        pixel: &PixelFormat,
    ) -> Self {
        Self {
            base: StageBase::new(size, pixel),
            image,
            mode,
        }
    }

    pub(crate) fn decompress(
        &self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        let mut r = BitReader::new(&source.data()[fmt.offset..]);
        let (width, height, planes) = read_planes(&mut r)?;
        let pixel_count = width * height;

        let needed = match self.mode {
            ColorMode::Gray => 1,
            ColorMode::Rgb | ColorMode::YCbCr => 3,
            ColorMode::Ycck => 4,
        };
        if planes.len() < needed {
            return Err(CodecError::InvalidData(format!(
                "color conversion needs {needed} planes, got {}",
                planes.len()
            )));
        }

        // Locate planes by their conventional component ids, falling
        // back to stream order.
        let by_id = |id: u8, fallback: usize| -> &Plane {
            planes
                .iter()
                .find(|p| p.component_id == id)
                .unwrap_or(&planes[fallback])
        };

        let out_channels = if self.mode == ColorMode::Gray { 1 } else { 3 };

        fmt.offset = 0;
        fmt.pixel.copy_from(&self.base.pixel);
        sync_bytes(pixel_count * out_channels, fmt, destination);

        let mut w = BitWriter::new(destination.data_mut());

        match self.mode {
            ColorMode::Gray => {
                let y = by_id(1, 0);
                for i in 0..pixel_count {
                    w.write_u8(clamp8(f64::from(y.samples[i]) + 128.0))?;
                }
            }
            ColorMode::Rgb => {
                let (red, green, blue) = (by_id(1, 0), by_id(2, 1), by_id(3, 2));
                for i in 0..pixel_count {
                    w.write_u8(clamp8(f64::from(red.samples[i]) + 128.0))?;
                    w.write_u8(clamp8(f64::from(green.samples[i]) + 128.0))?;
                    w.write_u8(clamp8(f64::from(blue.samples[i]) + 128.0))?;
                }
            }
            ColorMode::YCbCr | ColorMode::Ycck => {
                let (luma, cb, cr) = (by_id(1, 0), by_id(2, 1), by_id(3, 2));
                let black = (self.mode == ColorMode::Ycck).then(|| by_id(4, 3));

                for i in 0..pixel_count {
                    let y = f64::from(luma.samples[i]) + 128.0;
                    let cb = f64::from(cb.samples[i]);
                    let cr = f64::from(cr.samples[i]);
                    let k = black
                        .map(|p| 1.0 - (f64::from(p.samples[i]) + 128.0) / 255.0)
                        .unwrap_or(1.0);

                    let red = y + 1.402 * cr;
                    let green = y - 0.344136 * cb - 0.714136 * cr;
                    let blue = y + 1.772 * cb;

                    w.write_u8(clamp8(k * red))?;
                    w.write_u8(clamp8(k * green))?;
                    w.write_u8(clamp8(k * blue))?;
                }
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
        Err(unsupported("color conversion"))
    }
}

/// CMYK to RGB conversion for Adobe-tagged four-component images.
#[derive(Clone)]
pub struct Cmyk {
    pub(crate) base: StageBase,
    pub(crate) image: Rc<JpegImage>,
}

impl PartialEq for Cmyk {
    fn eq(&self, other: &Self) -> bool {
        jpeg_eq(&self.base, &self.image, &other.base, &other.image)
    }
}

impl Cmyk {
    pub(crate) fn new(image: Rc<JpegImage>, size: usize, pixel: &PixelFormat) -> Self {
        Self {
            base: StageBase::new(size, pixel),
            image,
        }
    }

    pub(crate) fn decompress(
        &self,
        fmt: &mut Format,
        source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        let mut r = BitReader::new(&source.data()[fmt.offset..]);
        let (width, height, planes) = read_planes(&mut r)?;
        let pixel_count = width * height;

        if planes.len() != 4 {
            return Err(CodecError::InvalidData(format!(
                "CMYK conversion needs 4 planes, got {}",
                planes.len()
            )));
        }
        let by_id = |id: u8, fallback: usize| -> &Plane {
            planes
                .iter()
                .find(|p| p.component_id == id)
                .unwrap_or(&planes[fallback])
        };
        let (c, m, y, k) = (by_id(1, 0), by_id(2, 1), by_id(3, 2), by_id(4, 3));

        fmt.offset = 0;
        fmt.pixel.copy_from(&self.base.pixel);
        sync_bytes(pixel_count * 3, fmt, destination);

        let mut w = BitWriter::new(destination.data_mut());
        for i in 0..pixel_count {
            let cyan = (f64::from(c.samples[i]) + 128.0) / 255.0;
            let magenta = (f64::from(m.samples[i]) + 128.0) / 255.0;
            let yellow = (f64::from(y.samples[i]) + 128.0) / 255.0;
            let key = (f64::from(k.samples[i]) + 128.0) / 255.0;

            w.write_u8(clamp8((1.0 - cyan) * (1.0 - key) * 255.0))?;
            w.write_u8(clamp8((1.0 - magenta) * (1.0 - key) * 255.0))?;
            w.write_u8(clamp8((1.0 - yellow) * (1.0 - key) * 255.0))?;
        }
        Ok(())
    }

    pub(crate) fn compress(
        &mut self,
        _fmt: &mut Format,
        _source: &Reference<'_>,
        _destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        Err(unsupported("CMYK conversion"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Textbook IDCT over f64, used to bound the integer version's error.
    fn idct8x8_f64(input: &[f64; 64], output: &mut [f64; 64]) {
        let pi = std::f64::consts::PI;
        let mut tmp = [0.0f64; 64];

        for y in 0..8 {
            for x in 0..8 {
                let mut s = 0.0;
                for (u, &v) in input[y * 8..y * 8 + 8].iter().enumerate() {
                    let cu = if u == 0 { 1.0 / 2.0_f64.sqrt() } else { 1.0 };
                    s += cu * v * ((2.0 * x as f64 + 1.0) * u as f64 * pi / 16.0).cos();
                }
                tmp[y * 8 + x] = s * 0.5;
            }
        }
        for x in 0..8 {
            for y in 0..8 {
                let mut s = 0.0;
                for v in 0..8 {
                    let cv = if v == 0 { 1.0 / 2.0_f64.sqrt() } else { 1.0 };
                    s += cv * tmp[v * 8 + x] * ((2.0 * y as f64 + 1.0) * v as f64 * pi / 16.0).cos();
                }
                output[y * 8 + x] = s * 0.5;
            }
        }
    }

    fn assert_close_to_reference(input: &[i32; 64]) {
        let mut float_in = [0.0f64; 64];
        for (f, &i) in float_in.iter_mut().zip(input) {
            *f = f64::from(i);
        }
        let mut float_out = [0.0f64; 64];
        idct8x8_f64(&float_in, &mut float_out);

        let mut int_out = [0i32; 64];
        idct8x8(input, &mut int_out);

        for i in 0..64 {
            let err = (float_out[i] - f64::from(int_out[i])).abs();
            assert!(err < 2.0, "coefficient {i}: error {err}");
        }
    }

    #[test]
    fn idct_dc_only_block_is_flat() {
        let mut input = [0i32; 64];
        input[0] = 1016;
        let mut output = [0i32; 64];
        idct8x8(&input, &mut output);
        assert!(output.iter().all(|&v| v == 127), "{output:?}");
    }

    #[test]
    fn idct_matches_f64_reference() {
        let mut block = [0i32; 64];
        block[0] = -512;
        block[1] = 300;
        block[8] = -150;
        block[9] = 75;
        block[63] = 41;
        assert_close_to_reference(&block);

        // A deterministic pseudo-random block.
        let mut seed = 0x2F6E_2B1Fu32;
        let mut block = [0i32; 64];
        for v in &mut block {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            *v = ((seed >> 16) & 0x7FF) as i32 - 1024;
        }
        assert_close_to_reference(&block);
    }

    #[test]
    fn zigzag_table_is_a_permutation() {
        let mut seen = [false; 64];
        for &z in &ZIGZAG {
            assert!(!seen[z]);
            seen[z] = true;
        }
        // Spot checks against T.81's serpentine walk.
        assert_eq!(ZIGZAG[0], 0);
        assert_eq!(ZIGZAG[1], 1);
        assert_eq!(ZIGZAG[8], 2);
        assert_eq!(ZIGZAG[63], 63);
    }

    #[test]
    fn clamp8_saturates() {
        assert_eq!(clamp8(-3.0), 0);
        assert_eq!(clamp8(255.4), 255);
        assert_eq!(clamp8(300.0), 255);
        assert_eq!(clamp8(127.5), 128);
    }
}
