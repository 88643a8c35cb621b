//! JPEG container: the marker segment list, frame geometry, and the
//! decode pipeline assembly.
//!
//! The decode stack, outermost first: [`Huffman`] entropy decoding,
//! [`Quantize`] dequantization, [`Dct`] inverse transform, [`BlockGroup`]
//! MCU-to-plane regrouping, [`Upsample`] chroma upsampling, then a color
//! conversion stage ([`Ycck`] or [`Cmyk`]) selected by the component
//! count and the Adobe APP14 transform. Sequential baseline (SOF0) and
//! progressive (SOF2) frames are accepted; arithmetic-coded frames fail
//! fast. Encoding to JPEG is not supported.

mod huffman;
mod segment;
mod stages;

pub use huffman::Huffman;
pub use stages::{Arithmetic, BlockGroup, Cmyk, Dct, Quantize, Upsample, Ycck};

use std::rc::Rc;

use crate::error::CodecError;
use crate::format::Format;
use crate::pixel::{Channel, PixelFormat};
use crate::reference::Reference;
use crate::stage::{Stage, StageBase};

use segment::{Adobe, JpegImage, MARKER_SOF0, MARKER_SOF2, Sof};
use stages::ColorMode;

/// Shared stage equality: same pixel layout over the same parsed
/// container.
pub(crate) fn jpeg_eq(
    base_a: &StageBase,
    image_a: &Rc<JpegImage>,
    base_b: &StageBase,
    image_b: &Rc<JpegImage>,
) -> bool {
    base_a == base_b && Rc::ptr_eq(image_a, image_b)
}

/// Frame height, honoring a DNL segment when the SOF height is zero.
fn frame_height(image: &JpegImage, sof: &Sof) -> Result<u16, CodecError> {
    let height = if sof.height != 0 {
        sof.height
    } else {
        image.dnl().map_or(0, |d| d.lines)
    };
    if height == 0 {
        return Err(CodecError::InvalidHeader(
            "frame height is zero and no DNL defines it".into(),
        ));
    }
    Ok(height)
}

/// MCU and per-component block geometry of one frame.
pub(crate) struct Geometry {
    pub mcus_x: usize,
    pub mcus_y: usize,
    pub max_h: u8,
    pub max_v: u8,
    /// Data units per MCU across all components.
    pub blocks_per_mcu: usize,
    /// Offset of each component's first block within an MCU.
    pub comp_offsets: Vec<usize>,
    /// Sampling factors per component, SOF order.
    comps: Vec<(u8, u8)>,
    pub width: usize,
    pub frame_height: u16,
}

impl Geometry {
    pub(crate) fn of(image: &JpegImage) -> Result<Self, CodecError> {
        let sof = image
            .sof()
            .ok_or_else(|| CodecError::InvalidHeader("missing SOF segment".into()))?;
        let height = frame_height(image, sof)?;
        if sof.width == 0 {
            return Err(CodecError::InvalidHeader("frame width is zero".into()));
        }

        let (max_h, max_v) = sof.max_sampling();
        let mut comps = Vec::with_capacity(sof.components.len());
        let mut comp_offsets = Vec::with_capacity(sof.components.len());
        let mut blocks_per_mcu = 0usize;
        for c in &sof.components {
            if c.h() == 0 || c.v() == 0 {
                return Err(CodecError::InvalidHeader(format!(
                    "component {} has a zero sampling factor",
                    c.id
                )));
            }
            comp_offsets.push(blocks_per_mcu);
            blocks_per_mcu += usize::from(c.h()) * usize::from(c.v());
            comps.push((c.h(), c.v()));
        }

        Ok(Self {
            mcus_x: usize::from(sof.width).div_ceil(8 * usize::from(max_h)),
            mcus_y: usize::from(height).div_ceil(8 * usize::from(max_v)),
            max_h,
            max_v,
            blocks_per_mcu,
            comp_offsets,
            comps,
            width: usize::from(sof.width),
            frame_height: height,
        })
    }

    pub(crate) fn mcu_count(&self) -> usize {
        self.mcus_x * self.mcus_y
    }

    /// Component block grid, padded to whole MCUs.
    pub(crate) fn comp_block_dims(&self, component: usize) -> (usize, usize) {
        let (h, v) = self.comps[component];
        (self.mcus_x * usize::from(h), self.mcus_y * usize::from(v))
    }

    /// Component block grid as a non-interleaved scan sees it: padded to
    /// whole blocks of the component's own sampling, not to MCUs.
    pub(crate) fn scan_block_dims(&self, component: usize) -> (usize, usize) {
        let (h, v) = self.comps[component];
        let comp_w = (self.width * usize::from(h)).div_ceil(usize::from(self.max_h));
        let comp_h = (usize::from(self.frame_height) * usize::from(v))
            .div_ceil(usize::from(self.max_v));
        (comp_w.div_ceil(8), comp_h.div_ceil(8))
    }

    /// Index into the MCU-interleaved accumulator of a component's block
    /// at grid position `(bx, by)`.
    pub(crate) fn block_index(&self, component: usize, bx: usize, by: usize) -> usize {
        let (h, v) = self.comps[component];
        let (h, v) = (usize::from(h), usize::from(v));
        let mcu = (by / v) * self.mcus_x + bx / h;
        mcu * self.blocks_per_mcu + self.comp_offsets[component] + (by % v) * h + (bx % h)
    }
}

fn pixel_of(tags: &[char], bits: u32) -> PixelFormat {
    let mut pixel = PixelFormat::new();
    for &tag in tags {
        pixel.channels.push(Channel { tag, bits });
    }
    pixel.calculate_bits();
    pixel
}

/// The color route selected by the SOF component count and the Adobe
/// APP14 transform flag.
fn select_color_route(
    components: usize,
    adobe: Option<&Adobe>,
) -> Result<Option<ColorMode>, CodecError> {
    // `None` means CMYK (a separate stage); `Some` is a Ycck mode.
    match (components, adobe.map(|a| a.color_transform)) {
        (1, _) => Ok(Some(ColorMode::Gray)),
        (3, Some(0)) => Ok(Some(ColorMode::Rgb)),
        (3, Some(1) | None) => Ok(Some(ColorMode::YCbCr)),
        (4, Some(2)) => Ok(Some(ColorMode::Ycck)),
        (4, Some(0) | None) => Ok(None),
        (3 | 4, Some(t)) => Err(CodecError::InvalidHeader(format!(
            "Adobe color transform {t} does not fit a {components}-component frame"
        ))),
        _ => Err(CodecError::InvalidHeader(format!(
            "unsupported component count {components}"
        ))),
    }
}

/// Parse a JPEG source into `format`, building its decode stack.
pub(crate) fn parse(reference: &Reference<'_>, format: &mut Format) -> Result<(), CodecError> {
    format.w = reference.w;
    format.h = reference.h;

    let image = Rc::new(JpegImage::read(reference.data())?);
    let sof = image
        .sof()
        .ok_or_else(|| CodecError::InvalidHeader("missing or duplicated SOF segment".into()))?;

    match sof.marker {
        MARKER_SOF0 | MARKER_SOF2 => {}
        0xC9..=0xCF => {
            return Err(CodecError::UnsupportedVariant(
                "arithmetic-coded JPEG is not implemented".into(),
            ));
        }
        other => {
            return Err(CodecError::UnsupportedVariant(format!(
                "JPEG frame type {other:#04x} is not supported"
            )));
        }
    }
    if sof.precision != 8 {
        return Err(CodecError::UnsupportedVariant(format!(
            "JPEG sample precision {} is not supported",
            sof.precision
        )));
    }
    if image.dht_segments().next().is_none() {
        return Err(CodecError::InvalidHeader("no Huffman tables".into()));
    }
    if image.dqt_segments().next().is_none() {
        return Err(CodecError::InvalidHeader("no quantization tables".into()));
    }
    if image.scans().next().is_none() {
        return Err(CodecError::InvalidHeader("no scan data".into()));
    }

    format.w = i32::from(sof.width);
    format.h = i32::from(frame_height(&image, sof)?);
    format.pad = 1;
    format.offset = 0;
    let bits = u32::from(sof.precision);

    // The color stage is innermost: its output is the decoded raster.
    let inner = match select_color_route(sof.components.len(), image.adobe())? {
        Some(mode) => {
            let (out_tags, in_tags): (&[char], &[char]) = match mode {
                ColorMode::Gray => (&['G'], &['Y']),
                ColorMode::Rgb => (&['R', 'G', 'B'], &['R', 'G', 'B']),
                ColorMode::YCbCr => (&['R', 'G', 'B'], &['Y', 'B', 'R']),
                ColorMode::Ycck => (&['R', 'G', 'B'], &['Y', 'B', 'R', 'K']),
            };
            format.pixel = pixel_of(out_tags, bits);
            let stage = Ycck::new(Rc::clone(&image), mode, 0, &format.pixel);
            format.compression.push_front(Stage::Ycck(stage));
            pixel_of(in_tags, bits)
        }
        None => {
            format.pixel = pixel_of(&['R', 'G', 'B'], bits);
            let stage = Cmyk::new(Rc::clone(&image), 0, &format.pixel);
            format.compression.push_front(Stage::Cmyk(stage));
            pixel_of(&['C', 'M', 'Y', 'K'], bits)
        }
    };

    let upsample = Upsample::new(Rc::clone(&image), 0, &inner);
    format.compression.push_front(Stage::Upsample(upsample));

    let group = BlockGroup::new(Rc::clone(&image), 0, &inner);
    format.compression.push_front(Stage::BlockGroup(group));

    let dct = Dct::new(Rc::clone(&image), 0, &inner);
    format.compression.push_front(Stage::Dct(dct));

    let quantize = Quantize::new(Rc::clone(&image), 0, &inner);
    format.compression.push_front(Stage::Quantize(quantize));

    let huffman = Huffman::new(Rc::clone(&image), 0, &inner);
    format.compression.push_front(Stage::Huffman(huffman));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_route_dispatch() {
        let adobe = |transform| Adobe {
            version: 100,
            flags0: 0,
            flags1: 0,
            color_transform: transform,
            extra: Vec::new(),
        };

        assert_eq!(select_color_route(1, None).unwrap(), Some(ColorMode::Gray));
        assert_eq!(
            select_color_route(3, None).unwrap(),
            Some(ColorMode::YCbCr)
        );
        assert_eq!(
            select_color_route(3, Some(&adobe(0))).unwrap(),
            Some(ColorMode::Rgb)
        );
        assert_eq!(
            select_color_route(3, Some(&adobe(1))).unwrap(),
            Some(ColorMode::YCbCr)
        );
        assert_eq!(
            select_color_route(4, Some(&adobe(2))).unwrap(),
            Some(ColorMode::Ycck)
        );
        assert_eq!(select_color_route(4, Some(&adobe(0))).unwrap(), None);
        assert!(select_color_route(2, None).is_err());
        assert!(select_color_route(3, Some(&adobe(2))).is_err());
    }

    #[test]
    fn geometry_for_420_sampling() {
        // 3 components, luma 2x2, chroma 1x1, 17x17 frame.
        let mut bytes = vec![0xFF, 0xD8];
        bytes.extend_from_slice(&[
            0xFF, 0xC0, 0x00, 0x11, 8, 0, 17, 0, 17, 3, 1, 0x22, 0, 2, 0x11, 1, 3, 0x11, 1,
        ]);
        bytes.extend_from_slice(&[0xFF, 0xD9]);
        let image = JpegImage::read(&bytes).unwrap();
        let g = Geometry::of(&image).unwrap();

        assert_eq!((g.max_h, g.max_v), (2, 2));
        assert_eq!((g.mcus_x, g.mcus_y), (2, 2));
        assert_eq!(g.blocks_per_mcu, 6);
        assert_eq!(g.comp_offsets, vec![0, 4, 5]);
        assert_eq!(g.comp_block_dims(0), (4, 4));
        assert_eq!(g.comp_block_dims(1), (2, 2));
        // Non-interleaved luma grid: ceil(17/8) = 3 per axis.
        assert_eq!(g.scan_block_dims(0), (3, 3));
        // Chroma: ceil(ceil(17/2)/8) = 2 per axis.
        assert_eq!(g.scan_block_dims(1), (2, 2));
    }

    #[test]
    fn block_index_walks_mcu_interleave() {
        let mut bytes = vec![0xFF, 0xD8];
        bytes.extend_from_slice(&[
            0xFF, 0xC0, 0x00, 0x11, 8, 0, 32, 0, 32, 3, 1, 0x22, 0, 2, 0x11, 1, 3, 0x11, 1,
        ]);
        bytes.extend_from_slice(&[0xFF, 0xD9]);
        let image = JpegImage::read(&bytes).unwrap();
        let g = Geometry::of(&image).unwrap();

        // Luma block (0,0) is the first block of the first MCU.
        assert_eq!(g.block_index(0, 0, 0), 0);
        // Luma block (1,1) is still inside MCU 0.
        assert_eq!(g.block_index(0, 1, 1), 3);
        // Luma block (2,0) opens MCU 1.
        assert_eq!(g.block_index(0, 2, 0), 6);
        // Chroma Cb of MCU 1.
        assert_eq!(g.block_index(1, 1, 0), 10);
    }
}
