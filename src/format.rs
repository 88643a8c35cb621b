//! Physical image formats: a pixel layout plus the stack of compression
//! stages between raw container bytes and bare pixels.

use std::collections::VecDeque;

use crate::bitio::BitOrder;
use crate::pixel::PixelFormat;
use crate::reference::Reference;
use crate::stage::Stage;

/// A complete description of one on-disk or in-memory representation.
#[derive(Clone, Default)]
pub struct Format {
    /// Layout of one pixel at this representation level.
    pub pixel: PixelFormat,
    /// Stage stack; front is outermost (closest to raw bytes).
    pub compression: VecDeque<Stage>,
    /// Bytes of container metadata preceding the pixel payload.
    pub offset: usize,
    /// Row byte alignment; 0 disables padding.
    pub pad: u32,
    /// Signed width: negative flips X.
    pub w: i32,
    /// Signed height: negative flips Y (bottom-up).
    pub h: i32,
    /// Sub-byte addressing order for pixel data at this level.
    pub bit_order: BitOrder,
}

impl Format {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes needed for one row, with `extra_bits` of per-row overhead
    /// (e.g. a leading filter byte), honoring `pad`.
    pub fn line_size(&self, extra_bits: u64) -> usize {
        let mut bytes =
            ((self.w.unsigned_abs() as u64 * u64::from(self.pixel.bits) + extra_bits + 7) / 8)
                as usize;
        if self.pad > 0 {
            let remainder = bytes % self.pad as usize;
            if remainder > 0 {
                bytes += self.pad as usize - remainder;
            }
        }
        bytes
    }

    /// Bytes needed for the whole representation: the outermost stage's
    /// compressed size if any, otherwise the padded row total.
    pub fn buffer_size(&self) -> usize {
        if let Some(front) = self.compression.front() {
            return self.offset + front.size();
        }
        if self.pad == 0 {
            let bits = self.w.unsigned_abs() as u64
                * self.h.unsigned_abs() as u64
                * u64::from(self.pixel.bits);
            return self.offset + ((bits + 7) / 8) as usize;
        }
        self.offset + self.h.unsigned_abs() as usize * self.line_size(0)
    }
}

impl PartialEq for Format {
    /// Padding, signed dimensions, channel vector, and the stage stack
    /// (length plus pairwise stage equality). The header offset is not
    /// part of format identity.
    fn eq(&self, other: &Self) -> bool {
        if self.pad != other.pad
            || self.w != other.w
            || self.h != other.h
            || self.bit_order != other.bit_order
        {
            return false;
        }
        if !self.pixel.same_channels(&other.pixel) {
            return false;
        }
        if self.compression.len() != other.compression.len() {
            return false;
        }
        self.compression
            .iter()
            .zip(&other.compression)
            .all(|(a, b)| a == b)
    }
}

impl std::fmt::Debug for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Format")
            .field("pixel", &self.pixel)
            .field("stages", &self.compression.len())
            .field("offset", &self.offset)
            .field("pad", &self.pad)
            .field("w", &self.w)
            .field("h", &self.h)
            .finish()
    }
}

/// Grow `destination` to hold `fmt` and adopt its dimensions.
///
/// This is the only growth point for owned buffers: when dimensions or the
/// byte count change, the buffer is reallocated (zeroed); otherwise only
/// the length is updated.
pub(crate) fn sync(fmt: &Format, destination: &mut Reference<'_>) {
    sync_bytes(fmt.buffer_size(), fmt, destination);
}

/// [`sync`] with an explicit byte count for stages whose output size does
/// not follow from the format geometry.
pub(crate) fn sync_bytes(bytes: usize, fmt: &Format, destination: &mut Reference<'_>) {
    let fresh =
        destination.w != fmt.w || destination.h != fmt.h || destination.bytes() < bytes;
    destination.w = fmt.w;
    destination.h = fmt.h;
    destination.resize(bytes, fresh);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::Channel;

    fn rgb_format(w: i32, h: i32, pad: u32) -> Format {
        let mut f = Format::new();
        for tag in ['R', 'G', 'B'] {
            f.pixel.channels.push(Channel { tag, bits: 8 });
        }
        f.pixel.calculate_bits();
        f.w = w;
        f.h = h;
        f.pad = pad;
        f
    }

    #[test]
    fn line_size_honors_padding() {
        let f = rgb_format(2, 2, 4);
        // 2 pixels * 24 bits = 6 bytes, padded up to 8.
        assert_eq!(f.line_size(0), 8);
        let f = rgb_format(2, 2, 0);
        assert_eq!(f.line_size(0), 6);
    }

    #[test]
    fn line_size_counts_extra_bits() {
        let f = rgb_format(3, 1, 1);
        // 3 * 24 bits + 8 filter bits = 80 bits = 10 bytes.
        assert_eq!(f.line_size(8), 10);
    }

    #[test]
    fn buffer_size_without_padding_packs_bits() {
        let mut f = Format::new();
        f.pixel.channels.push(Channel { tag: '#', bits: 4 });
        f.pixel.calculate_bits();
        f.w = 3;
        f.h = 3;
        // 9 pixels * 4 bits = 36 bits = 5 bytes.
        assert_eq!(f.buffer_size(), 5);
    }

    #[test]
    fn zero_dimension_buffer_is_offset_only() {
        let mut f = rgb_format(0, 4, 4);
        f.offset = 54;
        assert_eq!(f.buffer_size(), 54);
        let mut f = rgb_format(4, 0, 0);
        f.offset = 10;
        assert_eq!(f.buffer_size(), 10);
    }

    #[test]
    fn negative_dimensions_use_magnitudes() {
        let f = rgb_format(-2, -2, 4);
        assert_eq!(f.buffer_size(), 16);
    }

    #[test]
    fn equality_ignores_offset() {
        let mut a = rgb_format(2, 2, 4);
        let mut b = rgb_format(2, 2, 4);
        a.offset = 54;
        b.offset = 0;
        assert_eq!(a, b);
        b.w = -2;
        assert_ne!(a, b);
    }
}
