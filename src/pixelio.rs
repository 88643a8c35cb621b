//! Pixel-granular cursors over a [`Reference`] buffer.
//!
//! A layer above the bit cursors that iterates pixels honoring the format's
//! dimensions, bit layout, and row padding. Row advance inserts the padding
//! bits (the reader skips them, the writer zero-fills), and absolute and
//! relative seeks support RLE deltas and MCU placement.

use crate::bitio::{BitList, BitReader, BitWriter};
use crate::error::CodecError;
use crate::format::Format;
use crate::pixel::Pixel;
use crate::reference::Reference;

pub(crate) struct PixelReader<'a> {
    inner: BitReader<'a>,
    fmt: Format,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    total_line_bits: u64,
    previous_bit_position: u64,
    line_pixel_bits: u64,
}

impl<'a> PixelReader<'a> {
    pub(crate) fn new(fmt: &Format, source: &'a Reference<'_>) -> Self {
        assert!(fmt.pixel.bits > 0, "pixel reader needs a nonempty layout");
        assert!(
            source.bytes() >= fmt.offset,
            "source shorter than its header offset"
        );
        Self {
            inner: BitReader::with_order(&source.data()[fmt.offset..], fmt.bit_order),
            fmt: fmt.clone(),
            x: 0,
            y: 0,
            width: fmt.w.unsigned_abs(),
            height: fmt.h.unsigned_abs(),
            total_line_bits: 0,
            previous_bit_position: 0,
            line_pixel_bits: 0,
        }
    }

    /// Raw bit read at the cursor, counted toward the current row.
    pub(crate) fn read_bits(&mut self, bits: u32) -> Result<BitList, CodecError> {
        self.inner.read_bits(bits)
    }

    /// Skip to the start of the next row, consuming padding bits.
    ///
    /// The row length is measured on first use: pixel bits plus whatever
    /// extra bits (e.g. a leading filter byte) were read through
    /// [`Self::read_bits`], padded per the format.
    pub(crate) fn next_line(&mut self) -> Result<(), CodecError> {
        let line_bits = self.inner.bit_position() - self.previous_bit_position;

        if self.total_line_bits == 0 {
            self.total_line_bits = self.fmt.line_size(line_bits - self.line_pixel_bits) as u64 * 8;
        }
        let delta = self
            .total_line_bits
            .checked_sub(line_bits)
            .expect("row overflow: more bits consumed than the row holds");

        self.inner.skip_bits(delta)?;
        self.line_pixel_bits = 0;
        self.x = 0;
        self.y += 1;
        self.previous_bit_position = self.inner.bit_position();
        Ok(())
    }

    /// Read one pixel's channels at the cursor.
    pub(crate) fn get_pixel(&mut self, pixel: &mut Pixel) -> Result<(), CodecError> {
        pixel.clear();
        for channel in &self.fmt.pixel.channels {
            pixel.push(self.inner.read_bits(channel.bits)?);
        }
        self.line_pixel_bits += u64::from(self.fmt.pixel.bits);
        self.x += 1;
        Ok(())
    }

    /// [`Self::get_pixel`], advancing to the next row when this one is done.
    pub(crate) fn get_pixel_ln(&mut self, pixel: &mut Pixel) -> Result<(), CodecError> {
        if self.x >= self.width {
            self.next_line()?;
        }
        self.get_pixel(pixel)
    }

    /// Absolute seek to pixel `(x0, y0)`.
    pub(crate) fn set(&mut self, x0: u32, y0: u32) -> Result<(), CodecError> {
        if self.total_line_bits == 0 {
            assert_eq!(
                self.inner.bit_position(),
                self.line_pixel_bits,
                "seek before the first row with extra bits consumed"
            );
            self.total_line_bits = self.fmt.line_size(0) as u64 * 8;
        }
        if x0 >= self.width || y0 >= self.height {
            return Err(CodecError::InvalidData(format!(
                "pixel seek ({x0}, {y0}) outside {}x{}",
                self.width, self.height
            )));
        }
        self.x = x0;
        self.y = y0;
        self.line_pixel_bits = u64::from(x0) * u64::from(self.fmt.pixel.bits);
        self.previous_bit_position = u64::from(y0) * self.total_line_bits;
        self.inner
            .seek_bits(self.previous_bit_position + self.line_pixel_bits);
        Ok(())
    }

    /// Relative seek by `(dx, dy)` pixels.
    pub(crate) fn add(&mut self, dx: u32, dy: u32) -> Result<(), CodecError> {
        self.set(self.x + dx, self.y + dy)
    }
}

pub(crate) struct PixelWriter<'a> {
    inner: BitWriter<'a>,
    fmt: Format,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    line_bits: u64,
    line_pixel_bits: u64,
}

impl<'a> PixelWriter<'a> {
    pub(crate) fn new(fmt: &Format, destination: &'a mut Reference<'_>) -> Self {
        assert!(fmt.pixel.bits > 0, "pixel writer needs a nonempty layout");
        assert!(
            destination.bytes() >= fmt.offset,
            "destination shorter than its header offset"
        );
        let offset = fmt.offset;
        Self {
            fmt: fmt.clone(),
            x: 0,
            y: 0,
            width: fmt.w.unsigned_abs(),
            height: fmt.h.unsigned_abs(),
            line_bits: 0,
            line_pixel_bits: 0,
            inner: BitWriter::with_order(&mut destination.data_mut()[offset..], fmt.bit_order),
        }
    }

    /// Raw bit write at the cursor, counted toward the current row.
    pub(crate) fn write_bits(&mut self, bits: u32, value: BitList) -> Result<(), CodecError> {
        self.inner.write_bits(bits, value)
    }

    /// Zero-fill to the start of the next row.
    pub(crate) fn next_line(&mut self) -> Result<(), CodecError> {
        if self.line_bits == 0 {
            self.line_bits = self
                .fmt
                .line_size(self.inner.bit_position() - self.line_pixel_bits)
                as u64
                * 8;
        }
        assert!(
            self.line_bits >= self.line_pixel_bits,
            "row overflow: more pixel bits than the row holds"
        );

        self.inner
            .write_zero_bits(self.line_bits - self.line_pixel_bits)?;
        self.line_pixel_bits = 0;
        self.x = 0;
        self.y += 1;
        Ok(())
    }

    /// Emit one pixel's channels at the cursor.
    pub(crate) fn put_pixel(&mut self, pixel: &[BitList]) -> Result<(), CodecError> {
        debug_assert_eq!(pixel.len(), self.fmt.pixel.channels.len());
        for (channel, &value) in self.fmt.pixel.channels.iter().zip(pixel) {
            self.inner.write_bits(channel.bits, value)?;
        }
        self.line_pixel_bits += u64::from(self.fmt.pixel.bits);
        self.x += 1;
        Ok(())
    }

    /// [`Self::put_pixel`], zero-padding into the next row when this one
    /// is full.
    pub(crate) fn put_pixel_ln(&mut self, pixel: &[BitList]) -> Result<(), CodecError> {
        if self.x >= self.width {
            self.next_line()?;
        }
        self.put_pixel(pixel)
    }

    /// Absolute seek to pixel `(x0, y0)`. Seeking forward zero-fills the
    /// gap; seeking backward rewinds for overwrite.
    pub(crate) fn set(&mut self, x0: u32, y0: u32) -> Result<(), CodecError> {
        if self.line_bits == 0 {
            assert_eq!(
                self.inner.bit_position(),
                self.line_pixel_bits,
                "seek before the first row with extra bits written"
            );
            self.line_bits = self.fmt.line_size(0) as u64 * 8;
        }
        if x0 >= self.width || y0 >= self.height {
            return Err(CodecError::InvalidData(format!(
                "pixel seek ({x0}, {y0}) outside {}x{}",
                self.width, self.height
            )));
        }
        self.x = x0;
        self.y = y0;
        self.line_pixel_bits = u64::from(x0) * u64::from(self.fmt.pixel.bits);
        let position = u64::from(y0) * self.line_bits + self.line_pixel_bits;

        if position > self.inner.bit_position() {
            self.inner
                .write_zero_bits(position - self.inner.bit_position())?;
        } else {
            self.inner.seek_bits(position);
        }
        Ok(())
    }

    /// Relative seek by `(dx, dy)` pixels.
    pub(crate) fn add(&mut self, dx: u32, dy: u32) -> Result<(), CodecError> {
        self.set(self.x + dx, self.y + dy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::Channel;

    fn fmt(channels: &[(char, u32)], w: i32, h: i32, pad: u32) -> Format {
        let mut f = Format::new();
        for &(tag, bits) in channels {
            f.pixel.channels.push(Channel { tag, bits });
        }
        f.pixel.calculate_bits();
        f.w = w;
        f.h = h;
        f.pad = pad;
        f
    }

    #[test]
    fn reader_skips_row_padding() {
        // Two rows of 2 RGB bytes padded to 8 bytes each.
        let f = fmt(&[('R', 8), ('G', 8), ('B', 8)], 2, 2, 4);
        let data: Vec<u8> = vec![
            1, 2, 3, 4, 5, 6, 0, 0, // row 0 + pad
            7, 8, 9, 10, 11, 12, 0, 0, // row 1 + pad
        ];
        let r = Reference::from_slice(&data);
        let mut reader = PixelReader::new(&f, &r);
        let mut p = Pixel::new();
        reader.get_pixel_ln(&mut p).unwrap();
        assert_eq!(p, vec![1, 2, 3]);
        reader.get_pixel_ln(&mut p).unwrap();
        assert_eq!(p, vec![4, 5, 6]);
        reader.get_pixel_ln(&mut p).unwrap();
        assert_eq!(p, vec![7, 8, 9]);
        reader.get_pixel_ln(&mut p).unwrap();
        assert_eq!(p, vec![10, 11, 12]);
    }

    #[test]
    fn writer_zero_fills_row_padding() {
        let f = fmt(&[('G', 8)], 2, 2, 4);
        let mut dst = Reference::new_owned();
        dst.resize(8, false);
        {
            let mut writer = PixelWriter::new(&f, &mut dst);
            for v in [0xAAu64, 0xBB, 0xCC, 0xDD] {
                writer.put_pixel_ln(&[v]).unwrap();
            }
        }
        assert_eq!(dst.data(), &[0xAA, 0xBB, 0, 0, 0xCC, 0xDD, 0, 0]);
    }

    #[test]
    fn sub_byte_pixels_pack_msb_first() {
        let f = fmt(&[('#', 4)], 4, 1, 0);
        let data = [0x12u8, 0x34];
        let r = Reference::from_slice(&data);
        let mut reader = PixelReader::new(&f, &r);
        let mut p = Pixel::new();
        let mut seen = Vec::new();
        for _ in 0..4 {
            reader.get_pixel_ln(&mut p).unwrap();
            seen.push(p[0]);
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn writer_seek_forward_fills_zeroes() {
        let f = fmt(&[('G', 8)], 4, 2, 0);
        let mut dst = Reference::new_owned();
        dst.resize(8, false);
        {
            let mut writer = PixelWriter::new(&f, &mut dst);
            writer.put_pixel(&[1]).unwrap();
            writer.add(1, 1).unwrap();
            writer.put_pixel(&[9]).unwrap();
        }
        assert_eq!(dst.data(), &[1, 0, 0, 0, 0, 0, 9, 0]);
    }

    #[test]
    fn reader_seek_is_absolute() {
        let f = fmt(&[('G', 8)], 3, 2, 0);
        let data = [10u8, 11, 12, 13, 14, 15];
        let r = Reference::from_slice(&data);
        let mut reader = PixelReader::new(&f, &r);
        reader.set(2, 1).unwrap();
        let mut p = Pixel::new();
        reader.get_pixel(&mut p).unwrap();
        assert_eq!(p, vec![15]);
        reader.set(0, 0).unwrap();
        reader.get_pixel(&mut p).unwrap();
        assert_eq!(p, vec![10]);
    }

    #[test]
    fn out_of_range_seek_is_an_error() {
        let f = fmt(&[('G', 8)], 2, 2, 0);
        let data = [0u8; 4];
        let r = Reference::from_slice(&data);
        let mut reader = PixelReader::new(&f, &r);
        assert!(matches!(
            reader.set(2, 0),
            Err(CodecError::InvalidData(_))
        ));
    }
}
