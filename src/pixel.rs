//! Per-channel pixel layouts and value conversion between them.
//!
//! A [`PixelFormat`] is an ordered list of tagged channels with bit widths.
//! Conversion matches channels by tag, normalizing through `f64` in `[0, 1]`
//! whenever bit widths differ, with round-half-to-even on the way back to
//! integers. Destination channels missing from the source are filled from
//! [`Replacement`] rules.

use crate::bitio::BitList;

/// Container format detected from magic bytes.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// BMP (Windows bitmap).
    Bmp,
    /// PNG.
    Png,
    /// JPEG (baseline or progressive DCT).
    Jpeg,
}

/// One channel: a tag plus its width in bits.
///
/// Tags are `'A'..='Z'`, `'_'` (reserved: ignored when read, written as
/// zero), or `'#'` (palette index).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Channel {
    pub tag: char,
    pub bits: u32,
}

impl Channel {
    /// Maximum value this channel can store.
    pub fn max(&self) -> BitList {
        if self.bits > 0 {
            (1u64 << self.bits) - 1
        } else {
            0
        }
    }
}

/// Rule filling a destination channel that has no same-tag source channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Replacement {
    /// Index of the destination channel to fill.
    pub id: usize,
    /// Take the value from this source channel, if it exists.
    pub channel: Option<char>,
    /// Otherwise use this constant, in the destination channel's scale.
    pub constant: Option<BitList>,
}

/// Ordered channel layout with replacement rules and an alpha tag.
#[derive(Clone, Debug)]
pub struct PixelFormat {
    pub channels: Vec<Channel>,
    /// Cached sum of channel bit widths.
    pub bits: u32,
    pub replacements: Vec<Replacement>,
    /// Tag treated as alpha for area-weighted scaling; `'_'` disables it.
    pub alpha: char,
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelFormat {
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            bits: 0,
            replacements: Vec::new(),
            alpha: 'A',
        }
    }

    /// Recompute `bits` from the channel list.
    pub fn calculate_bits(&mut self) {
        self.bits = self.channels.iter().map(|c| c.bits).sum();
    }

    /// Copy the channel layout and replacements from `other`.
    pub fn copy_from(&mut self, other: &PixelFormat) {
        self.replacements = other.replacements.clone();
        self.channels = other.channels.clone();
        self.bits = other.bits;
    }

    /// Drop all channels and replacements.
    pub fn clear(&mut self) {
        self.replacements.clear();
        self.channels.clear();
        self.bits = 0;
    }

    /// Index of the first channel with the given tag.
    pub fn id(&self, tag: char) -> Option<usize> {
        self.channels.iter().position(|c| c.tag == tag)
    }

    /// Index of the alpha channel, if an alpha tag is configured.
    pub fn alpha_id(&self) -> Option<usize> {
        if self.alpha == '_' {
            return None;
        }
        self.id(self.alpha)
    }

    /// Resolve the first applicable replacement rule for destination
    /// channel `id` against the given source layout.
    fn replace(&self, id: usize, source: &PixelFormat) -> Option<ChannelOp> {
        for r in &self.replacements {
            if r.id != id {
                continue;
            }
            if let Some(tag) = r.channel {
                if let Some(src_id) = source.id(tag) {
                    return Some(ChannelOp::Source(src_id));
                }
            }
            if let Some(constant) = r.constant {
                return Some(ChannelOp::Constant(constant));
            }
        }
        None
    }

    /// Layout equality: same channel tags and widths in order.
    pub fn same_channels(&self, other: &PixelFormat) -> bool {
        self.channels == other.channels
    }
}

/// One pixel as raw unsigned channel values, one entry per format channel.
pub type Pixel = Vec<BitList>;

/// One pixel as normalized `f64` channel values in `[0, 1]`.
pub type Color = Vec<f64>;

/// Normalize an integer channel value into `[0, 1]`.
pub(crate) fn to_float(x: BitList, c: &Channel) -> f64 {
    let max = c.max();
    assert!(x <= max, "channel value {x} exceeds max {max}");
    if max > 0 { x as f64 / max as f64 } else { 0.0 }
}

/// Denormalize into the channel's integer range, rounding half to even.
pub(crate) fn to_int(x: f64, c: &Channel) -> BitList {
    assert!(
        (0.0..=1.0).contains(&x),
        "normalized channel value {x} out of range"
    );
    let max = c.max();
    if max > 0 {
        (x * max as f64).round_ties_even() as BitList
    } else {
        0
    }
}

/// How one destination channel obtains its value.
#[derive(Clone, Copy, Debug)]
enum ChannelOp {
    /// Reserved (`'_'`) destination: always zero.
    Zero,
    /// Constant from a replacement rule, in destination scale.
    Constant(BitList),
    /// Copy/rescale from this source channel index.
    Source(usize),
}

/// Precomputed per-channel conversion plan between two layouts.
///
/// Building the map is where channel matching happens; the per-pixel
/// methods then run without any tag lookups. A destination channel with no
/// same-tag source and no applicable replacement is a configuration error
/// and panics here.
pub(crate) struct ChannelMap {
    ops: Vec<ChannelOp>,
    src_channels: Vec<Channel>,
    dst_channels: Vec<Channel>,
}

impl ChannelMap {
    pub(crate) fn new(src_fmt: &PixelFormat, dst_fmt: &PixelFormat) -> Self {
        let mut ops = Vec::with_capacity(dst_fmt.channels.len());
        for (dst_id, dst_channel) in dst_fmt.channels.iter().enumerate() {
            if dst_channel.tag == '_' {
                ops.push(ChannelOp::Zero);
                continue;
            }
            let op = match src_fmt.id(dst_channel.tag) {
                Some(src_id) => ChannelOp::Source(src_id),
                None => dst_fmt.replace(dst_id, src_fmt).unwrap_or_else(|| {
                    panic!(
                        "no source channel or replacement for destination channel '{}'",
                        dst_channel.tag
                    )
                }),
            };
            ops.push(op);
        }
        Self {
            ops,
            src_channels: src_fmt.channels.clone(),
            dst_channels: dst_fmt.channels.clone(),
        }
    }

    pub(crate) fn pixel_to_pixel(&self, src: &[BitList]) -> Pixel {
        self.map(|op, dst_c| match op {
            ChannelOp::Zero => 0,
            ChannelOp::Constant(v) => v,
            ChannelOp::Source(i) => {
                let src_c = &self.src_channels[i];
                if src_c.bits == dst_c.bits {
                    src[i]
                } else {
                    to_int(to_float(src[i], src_c), dst_c)
                }
            }
        })
    }

    pub(crate) fn pixel_to_color(&self, src: &[BitList]) -> Color {
        self.map(|op, dst_c| match op {
            ChannelOp::Zero => 0.0,
            ChannelOp::Constant(v) => to_float(v, dst_c),
            ChannelOp::Source(i) => to_float(src[i], &self.src_channels[i]),
        })
    }

    pub(crate) fn color_to_color(&self, src: &[f64]) -> Color {
        self.map(|op, dst_c| match op {
            ChannelOp::Zero => 0.0,
            ChannelOp::Constant(v) => to_float(v, dst_c),
            ChannelOp::Source(i) => src[i],
        })
    }

    pub(crate) fn color_to_pixel(&self, src: &[f64]) -> Pixel {
        self.map(|op, dst_c| match op {
            ChannelOp::Zero => 0,
            ChannelOp::Constant(v) => v,
            ChannelOp::Source(i) => to_int(src[i], dst_c),
        })
    }

    fn map<T>(&self, f: impl Fn(ChannelOp, &Channel) -> T) -> Vec<T> {
        self.ops
            .iter()
            .zip(&self.dst_channels)
            .map(|(&op, c)| f(op, c))
            .collect()
    }
}
