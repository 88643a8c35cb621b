//! JPEG marker segments.
//!
//! Each segment type parses its big-endian body fields from the marker
//! stream and can serialize itself back. SOS additionally captures the
//! entropy-coded data that follows its header, un-stuffing `FF 00`,
//! splitting slices at restart markers, and recording the terminating
//! marker so the container loop can resume.

use crate::bitio::{BitReader, BitWriter};
use crate::error::CodecError;

pub(crate) const MARKER_TEM: u8 = 0x01;
pub(crate) const MARKER_SOF0: u8 = 0xC0;
pub(crate) const MARKER_SOF2: u8 = 0xC2;
pub(crate) const MARKER_DHT: u8 = 0xC4;
pub(crate) const MARKER_DAC: u8 = 0xCC;
pub(crate) const MARKER_RST0: u8 = 0xD0;
pub(crate) const MARKER_RST7: u8 = 0xD7;
pub(crate) const MARKER_SOI: u8 = 0xD8;
pub(crate) const MARKER_EOI: u8 = 0xD9;
pub(crate) const MARKER_SOS: u8 = 0xDA;
pub(crate) const MARKER_DQT: u8 = 0xDB;
pub(crate) const MARKER_DNL: u8 = 0xDC;
pub(crate) const MARKER_DRI: u8 = 0xDD;
pub(crate) const MARKER_APP0: u8 = 0xE0;
pub(crate) const MARKER_APP1: u8 = 0xE1;
pub(crate) const MARKER_APP2: u8 = 0xE2;
pub(crate) const MARKER_APP14: u8 = 0xEE;
pub(crate) const MARKER_COM: u8 = 0xFE;

fn write_marker(w: &mut BitWriter<'_>, marker: u8) -> Result<(), CodecError> {
    w.write_bytes(&[0xFF, marker])
}

fn write_length(w: &mut BitWriter<'_>, body: usize) -> Result<(), CodecError> {
    w.write_u16_be((body + 2) as u16)
}

// ── APP0: JFIF ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Jfif {
    pub identifier: [u8; 5],
    pub version_major: u8,
    pub version_minor: u8,
    pub units: u8,
    pub x_density: u16,
    pub y_density: u16,
    pub x_thumbnail: u8,
    pub y_thumbnail: u8,
    pub thumbnail: Vec<u8>,
}

impl Jfif {
    fn read(r: &mut BitReader<'_>, length: usize) -> Result<Self, CodecError> {
        let mut identifier = [0u8; 5];
        r.read_bytes(&mut identifier)?;
        let version_major = r.read_u8()?;
        let version_minor = r.read_u8()?;
        let units = r.read_u8()?;
        let x_density = r.read_u16_be()?;
        let y_density = r.read_u16_be()?;
        let x_thumbnail = r.read_u8()?;
        let y_thumbnail = r.read_u8()?;

        let thumb_bytes = 3 * usize::from(x_thumbnail) * usize::from(y_thumbnail);
        let mut thumbnail = vec![0u8; thumb_bytes];
        r.read_bytes(&mut thumbnail)?;

        if 14 + thumb_bytes != length {
            return Err(CodecError::InvalidHeader("JFIF length mismatch".into()));
        }
        Ok(Self {
            identifier,
            version_major,
            version_minor,
            units,
            x_density,
            y_density,
            x_thumbnail,
            y_thumbnail,
            thumbnail,
        })
    }

    fn write(&self, w: &mut BitWriter<'_>) -> Result<(), CodecError> {
        write_marker(w, MARKER_APP0)?;
        write_length(w, 14 + self.thumbnail.len())?;
        w.write_bytes(&self.identifier)?;
        w.write_u8(self.version_major)?;
        w.write_u8(self.version_minor)?;
        w.write_u8(self.units)?;
        w.write_u16_be(self.x_density)?;
        w.write_u16_be(self.y_density)?;
        w.write_u8(self.x_thumbnail)?;
        w.write_u8(self.y_thumbnail)?;
        w.write_bytes(&self.thumbnail)
    }
}

// ── APP1: EXIF ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Exif {
    pub tiff: Vec<u8>,
}

impl Exif {
    fn read(r: &mut BitReader<'_>, length: usize) -> Result<Self, CodecError> {
        let mut tiff = vec![0u8; length];
        r.read_bytes(&mut tiff)?;
        Ok(Self { tiff })
    }

    fn write(&self, w: &mut BitWriter<'_>) -> Result<(), CodecError> {
        write_marker(w, MARKER_APP1)?;
        write_length(w, self.tiff.len())?;
        w.write_bytes(&self.tiff)
    }
}

// ── APP2: ICC profile chunk ─────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Icc {
    pub identifier: [u8; 12],
    pub seq_number: u8,
    pub total_chunks: u8,
    pub data: Vec<u8>,
}

impl Icc {
    fn read(r: &mut BitReader<'_>, length: usize) -> Result<Self, CodecError> {
        if length < 14 {
            return Err(CodecError::InvalidHeader("ICC segment too short".into()));
        }
        let mut identifier = [0u8; 12];
        r.read_bytes(&mut identifier)?;
        let seq_number = r.read_u8()?;
        let total_chunks = r.read_u8()?;
        let mut data = vec![0u8; length - 14];
        r.read_bytes(&mut data)?;
        Ok(Self {
            identifier,
            seq_number,
            total_chunks,
            data,
        })
    }

    fn write(&self, w: &mut BitWriter<'_>) -> Result<(), CodecError> {
        write_marker(w, MARKER_APP2)?;
        write_length(w, 14 + self.data.len())?;
        w.write_bytes(&self.identifier)?;
        w.write_u8(self.seq_number)?;
        w.write_u8(self.total_chunks)?;
        w.write_bytes(&self.data)
    }
}

// ── APP14: Adobe ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Adobe {
    pub version: u16,
    pub flags0: u16,
    pub flags1: u16,
    /// 0 = untransformed (RGB or CMYK), 1 = YCbCr, 2 = YCCK.
    pub color_transform: u8,
    pub extra: Vec<u8>,
}

impl Adobe {
    fn read(r: &mut BitReader<'_>, length: usize) -> Result<Self, CodecError> {
        if length < 12 {
            return Err(CodecError::InvalidHeader("Adobe segment too short".into()));
        }
        let mut identifier = [0u8; 5];
        r.read_bytes(&mut identifier)?;
        if &identifier != b"Adobe" {
            return Err(CodecError::InvalidHeader(
                "Adobe segment identifier mismatch".into(),
            ));
        }
        let version = r.read_u16_be()?;
        let flags0 = r.read_u16_be()?;
        let flags1 = r.read_u16_be()?;
        let color_transform = r.read_u8()?;
        let mut extra = vec![0u8; length - 12];
        r.read_bytes(&mut extra)?;
        Ok(Self {
            version,
            flags0,
            flags1,
            color_transform,
            extra,
        })
    }

    fn write(&self, w: &mut BitWriter<'_>) -> Result<(), CodecError> {
        write_marker(w, MARKER_APP14)?;
        write_length(w, 12 + self.extra.len())?;
        w.write_bytes(b"Adobe")?;
        w.write_u16_be(self.version)?;
        w.write_u16_be(self.flags0)?;
        w.write_u16_be(self.flags1)?;
        w.write_u8(self.color_transform)?;
        w.write_bytes(&self.extra)
    }
}

// ── COM ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Com {
    pub text: Vec<u8>,
}

impl Com {
    fn read(r: &mut BitReader<'_>, length: usize) -> Result<Self, CodecError> {
        let mut text = vec![0u8; length];
        r.read_bytes(&mut text)?;
        Ok(Self { text })
    }

    fn write(&self, w: &mut BitWriter<'_>) -> Result<(), CodecError> {
        write_marker(w, MARKER_COM)?;
        write_length(w, self.text.len())?;
        w.write_bytes(&self.text)
    }
}

// ── SOF ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SofComponent {
    pub id: u8,
    /// High nibble: horizontal factor; low nibble: vertical factor.
    pub sampling: u8,
    pub quant_table: u8,
}

impl SofComponent {
    pub(crate) fn h(&self) -> u8 {
        (self.sampling >> 4) & 0x0F
    }

    pub(crate) fn v(&self) -> u8 {
        self.sampling & 0x0F
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Sof {
    /// The SOF marker byte: 0xC0 baseline, 0xC2 progressive, etc.
    pub marker: u8,
    pub precision: u8,
    pub height: u16,
    pub width: u16,
    pub components: Vec<SofComponent>,
}

impl Sof {
    fn read(r: &mut BitReader<'_>, length: usize, marker: u8) -> Result<Self, CodecError> {
        let precision = r.read_u8()?;
        let height = r.read_u16_be()?;
        let width = r.read_u16_be()?;
        let count = r.read_u8()?;

        let mut components = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            components.push(SofComponent {
                id: r.read_u8()?,
                sampling: r.read_u8()?,
                quant_table: r.read_u8()?,
            });
        }
        if 6 + 3 * usize::from(count) != length {
            return Err(CodecError::InvalidHeader("SOF length mismatch".into()));
        }
        Ok(Self {
            marker,
            precision,
            height,
            width,
            components,
        })
    }

    fn write(&self, w: &mut BitWriter<'_>) -> Result<(), CodecError> {
        write_marker(w, self.marker)?;
        write_length(w, 6 + 3 * self.components.len())?;
        w.write_u8(self.precision)?;
        w.write_u16_be(self.height)?;
        w.write_u16_be(self.width)?;
        w.write_u8(self.components.len() as u8)?;
        for c in &self.components {
            w.write_u8(c.id)?;
            w.write_u8(c.sampling)?;
            w.write_u8(c.quant_table)?;
        }
        Ok(())
    }

    /// Largest sampling factors over all components.
    pub(crate) fn max_sampling(&self) -> (u8, u8) {
        let mut max_h = 1;
        let mut max_v = 1;
        for c in &self.components {
            max_h = max_h.max(c.h());
            max_v = max_v.max(c.v());
        }
        (max_h, max_v)
    }

    pub(crate) fn component(&self, id: u8) -> Option<&SofComponent> {
        self.components.iter().find(|c| c.id == id)
    }
}

// ── DNL ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Dnl {
    pub lines: u16,
}

impl Dnl {
    fn read(r: &mut BitReader<'_>, length: usize) -> Result<Self, CodecError> {
        if length != 2 {
            return Err(CodecError::InvalidHeader("DNL length mismatch".into()));
        }
        Ok(Self {
            lines: r.read_u16_be()?,
        })
    }

    fn write(&self, w: &mut BitWriter<'_>) -> Result<(), CodecError> {
        write_marker(w, MARKER_DNL)?;
        write_length(w, 2)?;
        w.write_u16_be(self.lines)
    }
}

// ── DAC ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct DacTable {
    /// High nibble: table class; low nibble: table id.
    pub tc_tb: u8,
    /// Conditioning value.
    pub cs: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Dac {
    pub tables: Vec<DacTable>,
}

impl Dac {
    fn read(r: &mut BitReader<'_>, length: usize) -> Result<Self, CodecError> {
        if length % 2 != 0 {
            return Err(CodecError::InvalidHeader("DAC length mismatch".into()));
        }
        let mut tables = Vec::with_capacity(length / 2);
        for _ in 0..length / 2 {
            let table = DacTable {
                tc_tb: r.read_u8()?,
                cs: r.read_u8()?,
            };
            let tc = table.tc_tb >> 4;
            let tb = table.tc_tb & 0x0F;
            if tc > 1 || tb > 3 {
                return Err(CodecError::InvalidHeader(
                    "DAC table selector out of range".into(),
                ));
            }
            if tc == 1 {
                if table.cs < 1 || table.cs > 63 {
                    return Err(CodecError::InvalidHeader(
                        "DAC AC conditioning out of range".into(),
                    ));
                }
            } else {
                let upper = table.cs >> 4;
                let lower = table.cs & 0x0F;
                if lower > upper {
                    return Err(CodecError::InvalidHeader(
                        "DAC DC conditioning out of range".into(),
                    ));
                }
            }
            tables.push(table);
        }
        Ok(Self { tables })
    }

    fn write(&self, w: &mut BitWriter<'_>) -> Result<(), CodecError> {
        write_marker(w, MARKER_DAC)?;
        write_length(w, 2 * self.tables.len())?;
        for t in &self.tables {
            w.write_u8(t.tc_tb)?;
            w.write_u8(t.cs)?;
        }
        Ok(())
    }
}

// ── DQT ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DqtTable {
    /// 0 = 8-bit entries, 1 = 16-bit entries.
    pub precision: u8,
    pub id: u8,
    /// Entries in zig-zag order, widened to 16 bits.
    pub values: [u16; 64],
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Dqt {
    pub tables: Vec<DqtTable>,
}

impl Dqt {
    fn read(r: &mut BitReader<'_>, length: usize) -> Result<Self, CodecError> {
        let mut remaining = length;
        let mut tables = Vec::new();
        while remaining > 0 {
            let pq_tq = r.read_u8()?;
            remaining -= 1;
            let precision = (pq_tq >> 4) & 0x0F;
            let id = pq_tq & 0x0F;
            if precision > 1 || id > 3 {
                return Err(CodecError::InvalidHeader(
                    "DQT table selector out of range".into(),
                ));
            }
            let entry_size = if precision == 0 { 1 } else { 2 };
            if remaining < 64 * entry_size {
                return Err(CodecError::InvalidHeader("DQT truncated".into()));
            }
            let mut values = [0u16; 64];
            for v in &mut values {
                *v = if precision == 0 {
                    u16::from(r.read_u8()?)
                } else {
                    r.read_u16_be()?
                };
            }
            remaining -= 64 * entry_size;
            tables.push(DqtTable {
                precision,
                id,
                values,
            });
        }
        Ok(Self { tables })
    }

    fn write(&self, w: &mut BitWriter<'_>) -> Result<(), CodecError> {
        write_marker(w, MARKER_DQT)?;
        let body: usize = self
            .tables
            .iter()
            .map(|t| 1 + 64 * if t.precision == 0 { 1 } else { 2 })
            .sum();
        write_length(w, body)?;
        for t in &self.tables {
            w.write_u8((t.precision << 4) | t.id)?;
            for &v in &t.values {
                if t.precision == 0 {
                    w.write_u8(v as u8)?;
                } else {
                    w.write_u16_be(v)?;
                }
            }
        }
        Ok(())
    }
}

// ── DHT ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DhtTable {
    /// 0 = DC, 1 = AC.
    pub class: u8,
    pub id: u8,
    /// Code count per code length 1..=16.
    pub counts: [u8; 16],
    pub symbols: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Dht {
    pub tables: Vec<DhtTable>,
}

impl Dht {
    fn read(r: &mut BitReader<'_>, length: usize) -> Result<Self, CodecError> {
        let mut remaining = length;
        let mut tables = Vec::new();
        while remaining > 0 {
            if remaining < 17 {
                return Err(CodecError::InvalidHeader("DHT truncated".into()));
            }
            let tc_th = r.read_u8()?;
            let mut counts = [0u8; 16];
            r.read_bytes(&mut counts)?;
            remaining -= 17;

            let total: usize = counts.iter().map(|&c| usize::from(c)).sum();
            if total > 256 || total > remaining {
                return Err(CodecError::InvalidHeader("DHT symbol overflow".into()));
            }
            let mut symbols = vec![0u8; total];
            r.read_bytes(&mut symbols)?;
            remaining -= total;

            tables.push(DhtTable {
                class: (tc_th >> 4) & 0x0F,
                id: tc_th & 0x0F,
                counts,
                symbols,
            });
        }
        Ok(Self { tables })
    }

    fn write(&self, w: &mut BitWriter<'_>) -> Result<(), CodecError> {
        write_marker(w, MARKER_DHT)?;
        let body: usize = self.tables.iter().map(|t| 17 + t.symbols.len()).sum();
        write_length(w, body)?;
        for t in &self.tables {
            w.write_u8((t.class << 4) | t.id)?;
            w.write_bytes(&t.counts)?;
            w.write_bytes(&t.symbols)?;
        }
        Ok(())
    }
}

// ── DRI ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Dri {
    pub interval: u16,
}

impl Dri {
    fn read(r: &mut BitReader<'_>, length: usize) -> Result<Self, CodecError> {
        if length != 2 {
            return Err(CodecError::InvalidHeader("DRI length mismatch".into()));
        }
        Ok(Self {
            interval: r.read_u16_be()?,
        })
    }

    fn write(&self, w: &mut BitWriter<'_>) -> Result<(), CodecError> {
        write_marker(w, MARKER_DRI)?;
        write_length(w, 2)?;
        w.write_u16_be(self.interval)
    }
}

// ── SOS ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SosComponent {
    pub id: u8,
    /// High nibble: DC table id; low nibble: AC table id.
    pub selectors: u8,
}

impl SosComponent {
    pub(crate) fn dc_table(&self) -> u8 {
        (self.selectors >> 4) & 0x0F
    }

    pub(crate) fn ac_table(&self) -> u8 {
        self.selectors & 0x0F
    }
}

/// One run of entropy-coded bytes, delimited by restart markers.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct EntropySlice {
    /// The restart marker that opened this slice, if any.
    pub restart_marker: Option<u8>,
    /// De-stuffed entropy bytes.
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Sos {
    pub components: Vec<SosComponent>,
    pub spectral_start: u8,
    pub spectral_end: u8,
    /// High nibble Ah, low nibble Al.
    pub approximation: u8,
    /// Entropy bytes exactly as stored, stuffing and restarts included.
    pub raw_entropy: Vec<u8>,
    /// De-stuffed entropy split at restart markers.
    pub entropy: Vec<EntropySlice>,
    /// The non-restart marker that terminated the entropy stream.
    pub next_marker: Option<u8>,
}

impl Sos {
    pub(crate) fn ah(&self) -> u8 {
        (self.approximation >> 4) & 0x0F
    }

    pub(crate) fn al(&self) -> u8 {
        self.approximation & 0x0F
    }

    fn read(r: &mut BitReader<'_>, length: usize) -> Result<Self, CodecError> {
        let count = r.read_u8()?;
        let mut components = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            components.push(SosComponent {
                id: r.read_u8()?,
                selectors: r.read_u8()?,
            });
        }
        let spectral_start = r.read_u8()?;
        let spectral_end = r.read_u8()?;
        let approximation = r.read_u8()?;

        let consumed = 1 + 2 * usize::from(count) + 3;
        if consumed > length {
            return Err(CodecError::InvalidHeader("SOS length mismatch".into()));
        }
        // Some encoders append extra header bytes; discard them.
        r.skip_bytes(length - consumed)?;

        let mut sos = Self {
            components,
            spectral_start,
            spectral_end,
            approximation,
            raw_entropy: Vec::new(),
            entropy: vec![EntropySlice {
                restart_marker: None,
                data: Vec::new(),
            }],
            next_marker: None,
        };

        loop {
            let b = r.read_u8()?;
            if b != 0xFF {
                sos.entropy.last_mut().unwrap().data.push(b);
                sos.raw_entropy.push(b);
                continue;
            }
            loop {
                let c = r.read_u8()?;
                match c {
                    0x00 => {
                        // FF stored as FF 00.
                        sos.entropy.last_mut().unwrap().data.push(0xFF);
                        sos.raw_entropy.push(0xFF);
                        sos.raw_entropy.push(0x00);
                        break;
                    }
                    0xFF => {
                        // Fill byte.
                        sos.raw_entropy.push(0xFF);
                        continue;
                    }
                    MARKER_RST0..=MARKER_RST7 => {
                        sos.entropy.push(EntropySlice {
                            restart_marker: Some(c),
                            data: Vec::new(),
                        });
                        sos.raw_entropy.push(0xFF);
                        sos.raw_entropy.push(c);
                        break;
                    }
                    _ => {
                        sos.next_marker = Some(c);
                        return Ok(sos);
                    }
                }
            }
        }
    }

    fn write(&self, w: &mut BitWriter<'_>) -> Result<(), CodecError> {
        write_marker(w, MARKER_SOS)?;
        write_length(w, 1 + 2 * self.components.len() + 3)?;
        w.write_u8(self.components.len() as u8)?;
        for c in &self.components {
            w.write_u8(c.id)?;
            w.write_u8(c.selectors)?;
        }
        w.write_u8(self.spectral_start)?;
        w.write_u8(self.spectral_end)?;
        w.write_u8(self.approximation)?;
        w.write_bytes(&self.raw_entropy)
    }
}

// ── Generic (other APPn) ────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Generic {
    pub marker: u8,
    pub data: Vec<u8>,
}

impl Generic {
    fn read(r: &mut BitReader<'_>, length: usize, marker: u8) -> Result<Self, CodecError> {
        let mut data = vec![0u8; length];
        r.read_bytes(&mut data)?;
        Ok(Self { marker, data })
    }

    fn write(&self, w: &mut BitWriter<'_>) -> Result<(), CodecError> {
        write_marker(w, self.marker)?;
        write_length(w, self.data.len())?;
        w.write_bytes(&self.data)
    }
}

// ── Segment list ────────────────────────────────────────────────────

/// One parsed marker segment.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Segment {
    Soi,
    Eoi,
    Tem,
    Jfif(Jfif),
    Exif(Exif),
    Icc(Icc),
    Adobe(Adobe),
    Com(Com),
    Sof(Sof),
    Dnl(Dnl),
    Dac(Dac),
    Dqt(Dqt),
    Dht(Dht),
    Dri(Dri),
    Sos(Sos),
    Generic(Generic),
}

impl Segment {
    fn write(&self, w: &mut BitWriter<'_>) -> Result<(), CodecError> {
        match self {
            Segment::Soi => w.write_bytes(&[0xFF, MARKER_SOI]),
            Segment::Eoi => w.write_bytes(&[0xFF, MARKER_EOI]),
            Segment::Tem => w.write_bytes(&[0xFF, MARKER_TEM]),
            Segment::Jfif(s) => s.write(w),
            Segment::Exif(s) => s.write(w),
            Segment::Icc(s) => s.write(w),
            Segment::Adobe(s) => s.write(w),
            Segment::Com(s) => s.write(w),
            Segment::Sof(s) => s.write(w),
            Segment::Dnl(s) => s.write(w),
            Segment::Dac(s) => s.write(w),
            Segment::Dqt(s) => s.write(w),
            Segment::Dht(s) => s.write(w),
            Segment::Dri(s) => s.write(w),
            Segment::Sos(s) => s.write(w),
            Segment::Generic(s) => s.write(w),
        }
    }
}

/// Seek the next inter-segment marker byte. Byte-stuffing (`FF 00`) and
/// restart markers are invalid here: they only occur inside entropy data,
/// which [`Sos::read`] consumes itself.
fn read_next_marker(r: &mut BitReader<'_>) -> Result<u8, CodecError> {
    loop {
        if r.read_u8()? == 0xFF {
            break;
        }
    }
    loop {
        let b = r.read_u8()?;
        match b {
            0xFF => continue, // padding
            0x00 | MARKER_RST0..=MARKER_RST7 => {
                return Err(CodecError::InvalidData(
                    "entropy-only marker outside a scan".into(),
                ));
            }
            _ => return Ok(b),
        }
    }
}

/// A parsed JPEG container: the ordered marker segment list.
#[derive(Debug, PartialEq)]
pub(crate) struct JpegImage {
    pub segments: Vec<Segment>,
}

impl JpegImage {
    pub(crate) fn read(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = BitReader::new(data);

        let mut soi = [0u8; 2];
        if r.read_bytes(&mut soi).is_err() || soi != [0xFF, MARKER_SOI] {
            return Err(CodecError::UnrecognizedFormat);
        }
        let mut segments = vec![Segment::Soi];
        let mut pending: Option<u8> = None;

        loop {
            let marker = match pending.take() {
                Some(m) => m,
                None => read_next_marker(&mut r)?,
            };

            if marker == MARKER_EOI {
                segments.push(Segment::Eoi);
                break;
            }
            if marker == MARKER_TEM {
                segments.push(Segment::Tem);
                continue;
            }

            let length = r
                .read_u16_be()?
                .checked_sub(2)
                .ok_or_else(|| CodecError::InvalidHeader("segment length below 2".into()))?
                as usize;

            let segment = match marker {
                MARKER_APP0 => Segment::Jfif(Jfif::read(&mut r, length)?),
                MARKER_APP1 => Segment::Exif(Exif::read(&mut r, length)?),
                MARKER_APP2 => Segment::Icc(Icc::read(&mut r, length)?),
                MARKER_APP14 => Segment::Adobe(Adobe::read(&mut r, length)?),
                MARKER_COM => Segment::Com(Com::read(&mut r, length)?),
                0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => {
                    Segment::Sof(Sof::read(&mut r, length, marker)?)
                }
                MARKER_DNL => Segment::Dnl(Dnl::read(&mut r, length)?),
                MARKER_DAC => Segment::Dac(Dac::read(&mut r, length)?),
                MARKER_DQT => Segment::Dqt(Dqt::read(&mut r, length)?),
                MARKER_DHT => Segment::Dht(Dht::read(&mut r, length)?),
                MARKER_DRI => Segment::Dri(Dri::read(&mut r, length)?),
                MARKER_SOS => {
                    let sos = Sos::read(&mut r, length)?;
                    pending = sos.next_marker;
                    debug_assert!(pending.is_some());
                    Segment::Sos(sos)
                }
                0xE0..=0xEF => Segment::Generic(Generic::read(&mut r, length, marker)?),
                other => {
                    return Err(CodecError::InvalidData(format!(
                        "unknown JPEG marker {other:#04x}"
                    )));
                }
            };
            segments.push(segment);
        }

        Ok(Self { segments })
    }

    /// Serialize the container back to bytes.
    pub(crate) fn write(&self, w: &mut BitWriter<'_>) -> Result<(), CodecError> {
        for segment in &self.segments {
            segment.write(w)?;
        }
        Ok(())
    }

    /// Total serialized byte count.
    pub(crate) fn byte_size(&self) -> usize {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Soi | Segment::Eoi | Segment::Tem => 2,
                Segment::Jfif(j) => 4 + 14 + j.thumbnail.len(),
                Segment::Exif(e) => 4 + e.tiff.len(),
                Segment::Icc(i) => 4 + 14 + i.data.len(),
                Segment::Adobe(a) => 4 + 12 + a.extra.len(),
                Segment::Com(c) => 4 + c.text.len(),
                Segment::Sof(f) => 4 + 6 + 3 * f.components.len(),
                Segment::Dnl(_) | Segment::Dri(_) => 4 + 2,
                Segment::Dac(d) => 4 + 2 * d.tables.len(),
                Segment::Dqt(q) => {
                    4 + q
                        .tables
                        .iter()
                        .map(|t| 1 + 64 * if t.precision == 0 { 1 } else { 2 })
                        .sum::<usize>()
                }
                Segment::Dht(h) => {
                    4 + h.tables.iter().map(|t| 17 + t.symbols.len()).sum::<usize>()
                }
                Segment::Sos(s) => 4 + 1 + 2 * s.components.len() + 3 + s.raw_entropy.len(),
                Segment::Generic(g) => 4 + g.data.len(),
            })
            .sum()
    }

    /// The unique segment matched by `pick`, or `None` when absent or
    /// duplicated.
    pub(crate) fn find_single<'a, T>(
        &'a self,
        pick: impl Fn(&'a Segment) -> Option<&'a T>,
    ) -> Option<&'a T> {
        let mut found = None;
        for segment in &self.segments {
            if let Some(t) = pick(segment) {
                if found.is_some() {
                    return None;
                }
                found = Some(t);
            }
        }
        found
    }

    pub(crate) fn sof(&self) -> Option<&Sof> {
        self.find_single(|s| match s {
            Segment::Sof(f) => Some(f),
            _ => None,
        })
    }

    pub(crate) fn dnl(&self) -> Option<&Dnl> {
        self.find_single(|s| match s {
            Segment::Dnl(d) => Some(d),
            _ => None,
        })
    }

    pub(crate) fn dri(&self) -> Option<&Dri> {
        self.find_single(|s| match s {
            Segment::Dri(d) => Some(d),
            _ => None,
        })
    }

    pub(crate) fn adobe(&self) -> Option<&Adobe> {
        self.find_single(|s| match s {
            Segment::Adobe(a) => Some(a),
            _ => None,
        })
    }

    pub(crate) fn dht_segments(&self) -> impl Iterator<Item = &Dht> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Dht(d) => Some(d),
            _ => None,
        })
    }

    pub(crate) fn dqt_segments(&self) -> impl Iterator<Item = &Dqt> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Dqt(d) => Some(d),
            _ => None,
        })
    }

    pub(crate) fn scans(&self) -> impl Iterator<Item = &Sos> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Sos(sos) => Some(sos),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_jpeg() -> Vec<u8> {
        let mut bytes = vec![0xFF, MARKER_SOI];
        // DQT, table 0, 8-bit, all ones
        bytes.extend_from_slice(&[0xFF, MARKER_DQT, 0x00, 0x43, 0x00]);
        bytes.extend_from_slice(&[1u8; 64]);
        // SOF0, 8-bit, 8x8, one component 1:1
        bytes.extend_from_slice(&[
            0xFF, MARKER_SOF0, 0x00, 0x0B, 8, 0, 8, 0, 8, 1, 1, 0x11, 0,
        ]);
        // DHT, DC table 0: single code of length 2, symbol 0
        bytes.extend_from_slice(&[0xFF, MARKER_DHT, 0x00, 0x14, 0x00]);
        let mut counts = [0u8; 16];
        counts[1] = 1;
        bytes.extend_from_slice(&counts);
        bytes.push(0);
        // DHT, AC table 0: single code of length 1, symbol 0 (EOB)
        bytes.extend_from_slice(&[0xFF, MARKER_DHT, 0x00, 0x14, 0x10]);
        let mut counts = [0u8; 16];
        counts[0] = 1;
        bytes.extend_from_slice(&counts);
        bytes.push(0);
        // SOS: one component, full spectral range
        bytes.extend_from_slice(&[0xFF, MARKER_SOS, 0x00, 0x08, 1, 1, 0x00, 0, 63, 0]);
        // Entropy: DC code `00` + EOB `0`, padded with zeros
        bytes.push(0b0000_0000);
        bytes.extend_from_slice(&[0xFF, MARKER_EOI]);
        bytes
    }

    #[test]
    fn container_parses_and_rewrites_byte_exact() {
        let bytes = minimal_jpeg();
        let image = JpegImage::read(&bytes).unwrap();

        assert_eq!(image.byte_size(), bytes.len());
        let mut out = vec![0u8; bytes.len()];
        image.write(&mut BitWriter::new(&mut out)).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn sos_captures_entropy_and_terminator() {
        let image = JpegImage::read(&minimal_jpeg()).unwrap();
        let sos = image.scans().next().unwrap();
        assert_eq!(sos.entropy.len(), 1);
        assert_eq!(sos.entropy[0].data, vec![0]);
        assert_eq!(sos.next_marker, Some(MARKER_EOI));
        assert_eq!(sos.spectral_end, 63);
    }

    #[test]
    fn byte_stuffing_is_removed() {
        // Entropy containing FF 00 must decode to a single FF byte.
        let mut bytes = vec![0xFF, MARKER_SOI];
        bytes.extend_from_slice(&[0xFF, MARKER_SOS, 0x00, 0x08, 1, 1, 0x00, 0, 63, 0]);
        bytes.extend_from_slice(&[0x12, 0xFF, 0x00, 0x34]);
        bytes.extend_from_slice(&[0xFF, MARKER_EOI]);

        let image = JpegImage::read(&bytes).unwrap();
        let sos = image.scans().next().unwrap();
        assert_eq!(sos.entropy[0].data, vec![0x12, 0xFF, 0x34]);
    }

    #[test]
    fn restart_markers_split_slices() {
        let mut bytes = vec![0xFF, MARKER_SOI];
        bytes.extend_from_slice(&[0xFF, MARKER_SOS, 0x00, 0x08, 1, 1, 0x00, 0, 63, 0]);
        bytes.extend_from_slice(&[0x11, 0xFF, MARKER_RST0, 0x22, 0xFF, 0xD1, 0x33]);
        bytes.extend_from_slice(&[0xFF, MARKER_EOI]);

        let image = JpegImage::read(&bytes).unwrap();
        let sos = image.scans().next().unwrap();
        assert_eq!(sos.entropy.len(), 3);
        assert_eq!(sos.entropy[0].data, vec![0x11]);
        assert_eq!(sos.entropy[1].restart_marker, Some(MARKER_RST0));
        assert_eq!(sos.entropy[2].data, vec![0x33]);
    }

    #[test]
    fn unknown_marker_is_rejected() {
        let bytes = [0xFF, MARKER_SOI, 0xFF, 0xC8, 0x00, 0x02];
        assert!(matches!(
            JpegImage::read(&bytes),
            Err(CodecError::InvalidData(_))
        ));
    }
}
