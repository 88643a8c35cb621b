//! JPEG entropy decoding: canonical Huffman tables, the DC predictor and
//! AC run-length protocol, and progressive spectral-selection and
//! successive-approximation scans with EOBRUN handling.

use std::collections::HashMap;
use std::rc::Rc;

use crate::bitio::{BitReader, BitWriter};
use crate::error::CodecError;
use crate::format::{Format, sync_bytes};
use crate::reference::Reference;
use crate::stage::StageBase;

use super::segment::{JpegImage, Sos, SosComponent};
use super::{Geometry, jpeg_eq};

/// Serialized size of one coefficient block: component id plus 64
/// little-endian `i32` values.
pub(crate) const BLOCK_BYTES: usize = 1 + 64 * 4;

/// Canonical decoding tables per ITU-T T.81 F.2.2.3.
struct HuffmanTable {
    /// Smallest code of each length 1..=16; -1 when the length is empty.
    min_code: [i32; 17],
    /// Largest code of each length; -1 when the length is empty.
    max_code: [i32; 17],
    /// Index of the first symbol of each length.
    val_ptr: [usize; 17],
    symbols: Vec<u8>,
}

impl HuffmanTable {
    fn build(counts: &[u8; 16], symbols: &[u8]) -> Result<Self, CodecError> {
        let total: usize = counts.iter().map(|&c| usize::from(c)).sum();
        if total != symbols.len() || total == 0 {
            return Err(CodecError::InvalidData(
                "Huffman table symbol count mismatch".into(),
            ));
        }

        let mut table = Self {
            min_code: [-1; 17],
            max_code: [-1; 17],
            val_ptr: [0; 17],
            symbols: symbols.to_vec(),
        };

        let mut code: u32 = 0;
        let mut p = 0usize;
        for length in 1..=16usize {
            let count = usize::from(counts[length - 1]);
            if count > 0 {
                table.val_ptr[length] = p;
                table.min_code[length] = code as i32;
                code += count as u32;
                if code > (1u32 << length) {
                    return Err(CodecError::InvalidData(
                        "Huffman table overflows its code space".into(),
                    ));
                }
                table.max_code[length] = code as i32 - 1;
                p += count;
            }
            code <<= 1;
        }
        Ok(table)
    }

    fn contains(&self, code: u32, length: usize) -> bool {
        length >= 1
            && length <= 16
            && self.max_code[length] >= 0
            && self.min_code[length] <= code as i32
            && code as i32 <= self.max_code[length]
    }

    fn lookup(&self, code: u32, length: usize) -> u8 {
        let index = self.val_ptr[length] + (code as i32 - self.min_code[length]) as usize;
        self.symbols[index]
    }

    /// Longest code length present.
    fn max_length(&self) -> usize {
        (1..=16).rev().find(|&l| self.max_code[l] >= 0).unwrap_or(0)
    }
}

/// Shift a `category`-bit amplitude into its signed value (HUFF_EXTEND).
fn extend(bits: u64, category: u32) -> i64 {
    if category == 0 {
        return 0;
    }
    if bits < (1u64 << (category - 1)) {
        bits as i64 - ((1i64 << category) - 1)
    } else {
        bits as i64
    }
}

fn decode_symbol(reader: &mut BitReader<'_>, table: &HuffmanTable) -> Result<u8, CodecError> {
    let max_length = table.max_length();
    let mut code: u32 = 0;
    let mut length = 0usize;
    loop {
        code = (code << 1) | reader.read_bits(1)? as u32;
        length += 1;
        if table.contains(code, length) {
            return Ok(table.lookup(code, length));
        }
        if length >= max_length {
            return Err(CodecError::InvalidData("invalid Huffman code".into()));
        }
    }
}

/// One decoded coefficient block, coefficients in zig-zag order.
struct Block {
    component_id: u8,
    coefficients: [i32; 64],
}

/// JPEG entropy decoding.
///
/// Output protocol: `count: u32`, then per block `component_id: u8` and 64
/// `i32` coefficients in zig-zag order (MCU-interleaved, SOF component
/// order within each MCU). All integers little-endian.
#[derive(Clone)]
pub struct Huffman {
    pub(crate) base: StageBase,
    pub(crate) image: Rc<JpegImage>,
}

impl PartialEq for Huffman {
    fn eq(&self, other: &Self) -> bool {
        jpeg_eq(&self.base, &self.image, &other.base, &other.image)
    }
}

impl Huffman {
    pub(crate) fn new(image: Rc<JpegImage>, size: usize, pixel: &crate::pixel::PixelFormat) -> Self {
        Self {
            base: StageBase::new(size, pixel),
            image,
        }
    }

    pub(crate) fn decompress(
        &self,
        fmt: &mut Format,
        _source: &Reference<'_>,
        destination: &mut Reference<'_>,
    ) -> Result<(), CodecError> {
        let sof = self
            .image
            .sof()
            .ok_or_else(|| CodecError::InvalidHeader("missing SOF segment".into()))?;
        let geometry = Geometry::of(&self.image)?;

        // Table key: (class, id); class 0 = DC, 1 = AC.
        let mut tables: HashMap<(u8, u8), HuffmanTable> = HashMap::new();
        for dht in self.image.dht_segments() {
            for t in &dht.tables {
                let key = (t.class, t.id);
                if tables.contains_key(&key) {
                    return Err(CodecError::InvalidData(format!(
                        "duplicate Huffman table class {} id {}",
                        t.class, t.id
                    )));
                }
                tables.insert(key, HuffmanTable::build(&t.counts, &t.symbols)?);
            }
        }

        let restart_interval = self.image.dri().map_or(0, |d| usize::from(d.interval));

        // The accumulator holds the full interleaved geometry so that
        // later progressive scans refine the blocks earlier scans wrote.
        let total_blocks = geometry.mcu_count() * geometry.blocks_per_mcu;
        let mut blocks: Vec<Block> = Vec::with_capacity(total_blocks);
        for _ in 0..geometry.mcu_count() {
            for component in &sof.components {
                let per_mcu = usize::from(component.h()) * usize::from(component.v());
                for _ in 0..per_mcu {
                    blocks.push(Block {
                        component_id: component.id,
                        coefficients: [0; 64],
                    });
                }
            }
        }

        for scan in self.image.scans() {
            self.decode_scan(scan, sof, &geometry, &tables, restart_interval, &mut blocks)?;
        }

        fmt.offset = 0;
        fmt.pixel.copy_from(&self.base.pixel);
        sync_bytes(4 + total_blocks * BLOCK_BYTES, fmt, destination);

        let mut w = BitWriter::new(destination.data_mut());
        w.write_u32_le(total_blocks as u32)?;
        for block in &blocks {
            w.write_u8(block.component_id)?;
            for &c in &block.coefficients {
                w.write_u32_le(c as u32)?;
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
            "JPEG Huffman compression is not implemented".into(),
        ))
    }

    fn decode_scan(
        &self,
        scan: &Sos,
        sof: &super::segment::Sof,
        geometry: &Geometry,
        tables: &HashMap<(u8, u8), HuffmanTable>,
        restart_interval: usize,
        blocks: &mut [Block],
    ) -> Result<(), CodecError> {
        let ss = usize::from(scan.spectral_start);
        let se = usize::from(scan.spectral_end);
        let ah = u32::from(scan.ah());
        let al = u32::from(scan.al());
        if ss > 63 || se > 63 || ss > se || al > 13 {
            return Err(CodecError::InvalidData(format!(
                "bad spectral parameters Ss={ss} Se={se} Ah={ah} Al={al}"
            )));
        }
        if scan.components.is_empty() {
            return Err(CodecError::InvalidData("scan has no components".into()));
        }

        for sc in &scan.components {
            if sof.component(sc.id).is_none() {
                return Err(CodecError::InvalidData(format!(
                    "scan references unknown component {}",
                    sc.id
                )));
            }
            if ss == 0 && !tables.contains_key(&(0, sc.dc_table())) {
                return Err(CodecError::InvalidData(format!(
                    "missing DC Huffman table {}",
                    sc.dc_table()
                )));
            }
            if se >= 1 && !tables.contains_key(&(1, sc.ac_table())) {
                return Err(CodecError::InvalidData(format!(
                    "missing AC Huffman table {}",
                    sc.ac_table()
                )));
            }
        }

        // Decode units: MCUs for interleaved scans, single component
        // blocks (in that component's raster order) otherwise.
        let interleaved = scan.components.len() > 1;
        let solo_component = sof
            .components
            .iter()
            .position(|c| c.id == scan.components[0].id)
            .expect("checked above");
        let total_units = if interleaved {
            geometry.mcu_count()
        } else {
            let (bw, bh) = geometry.scan_block_dims(solo_component);
            bw * bh
        };

        let mut last_dc: HashMap<u8, i32> = HashMap::new();
        let mut eobrun: u32 = 0;
        let mut unit = 0usize;

        for slice in &scan.entropy {
            if slice.restart_marker.is_some() {
                last_dc.clear();
                eobrun = 0;
            }
            let mut reader = BitReader::new(&slice.data);
            let limit = if restart_interval > 0 {
                total_units.min(unit + restart_interval)
            } else {
                total_units
            };

            while unit < limit {
                if interleaved {
                    let offset = unit * geometry.blocks_per_mcu;
                    for sc in &scan.components {
                        let c = sof.component(sc.id).expect("checked above");
                        let comp_index = sof
                            .components
                            .iter()
                            .position(|x| x.id == sc.id)
                            .expect("checked above");
                        let base = offset + geometry.comp_offsets[comp_index];
                        let per_mcu = usize::from(c.h()) * usize::from(c.v());
                        for b in 0..per_mcu {
                            self.decode_block(
                                &mut reader,
                                &mut blocks[base + b],
                                sc,
                                tables,
                                (ss, se, ah, al),
                                &mut last_dc,
                                &mut eobrun,
                            )?;
                        }
                    }
                } else {
                    let sc = &scan.components[0];
                    let (bw, _bh) = geometry.scan_block_dims(solo_component);
                    let (bx, by) = (unit % bw, unit / bw);
                    let index = geometry.block_index(solo_component, bx, by);
                    self.decode_block(
                        &mut reader,
                        &mut blocks[index],
                        sc,
                        tables,
                        (ss, se, ah, al),
                        &mut last_dc,
                        &mut eobrun,
                    )?;
                }
                unit += 1;
            }
        }

        if unit < total_units {
            return Err(CodecError::InvalidData(format!(
                "scan ended after {unit} of {total_units} units"
            )));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_block(
        &self,
        reader: &mut BitReader<'_>,
        block: &mut Block,
        sc: &SosComponent,
        tables: &HashMap<(u8, u8), HuffmanTable>,
        (ss, se, ah, al): (usize, usize, u32, u32),
        last_dc: &mut HashMap<u8, i32>,
        eobrun: &mut u32,
    ) -> Result<(), CodecError> {
        if ss == 0 {
            let dc = &tables[&(0, sc.dc_table())];
            decode_dc(reader, block, dc, ah, al, last_dc)?;
        }
        if se >= 1 {
            let ac = &tables[&(1, sc.ac_table())];
            let start = if ss == 0 { 1 } else { ss };
            if ah == 0 {
                decode_ac_initial(reader, block, ac, start, se, al, eobrun)?;
            } else {
                decode_ac_refine(reader, block, ac, start, se, al, eobrun)?;
            }
        }
        Ok(())
    }
}

fn decode_dc(
    reader: &mut BitReader<'_>,
    block: &mut Block,
    table: &HuffmanTable,
    ah: u32,
    al: u32,
    last_dc: &mut HashMap<u8, i32>,
) -> Result<(), CodecError> {
    if ah == 0 {
        let category = u32::from(decode_symbol(reader, table)?);
        if category > 15 {
            return Err(CodecError::InvalidData(format!(
                "DC category {category} out of range"
            )));
        }
        let amplitude = extend(reader.read_bits(category)?, category) << al;

        let previous = *last_dc.get(&block.component_id).unwrap_or(&0);
        let value = i64::from(previous) + amplitude;
        let value = i32::try_from(value)
            .map_err(|_| CodecError::InvalidData("DC coefficient overflow".into()))?;
        block.coefficients[0] = value;
        last_dc.insert(block.component_id, value);
    } else {
        // Refinement: one appended bit per block.
        if reader.read_bits(1)? != 0 {
            block.coefficients[0] |= 1 << al;
        }
    }
    Ok(())
}

fn decode_ac_initial(
    reader: &mut BitReader<'_>,
    block: &mut Block,
    table: &HuffmanTable,
    start: usize,
    se: usize,
    al: u32,
    eobrun: &mut u32,
) -> Result<(), CodecError> {
    if *eobrun > 0 {
        *eobrun -= 1;
        return Ok(());
    }

    let mut k = start;
    while k <= se {
        let symbol = decode_symbol(reader, table)?;
        let run = usize::from(symbol >> 4);
        let category = u32::from(symbol & 0x0F);

        if category == 0 {
            if run == 15 {
                // ZRL: sixteen zero coefficients.
                k += 16;
                continue;
            }
            // EOB run: this block's band ends; `eobrun` more follow.
            *eobrun = (1u32 << run) - 1;
            if run > 0 {
                *eobrun += reader.read_bits(run as u32)? as u32;
            }
            break;
        }

        k += run;
        if k > se {
            return Err(CodecError::InvalidData(
                "AC run passes the spectral band end".into(),
            ));
        }
        let amplitude = extend(reader.read_bits(category)?, category) << al;
        block.coefficients[k] = amplitude as i32;
        k += 1;
    }
    Ok(())
}

fn decode_ac_refine(
    reader: &mut BitReader<'_>,
    block: &mut Block,
    table: &HuffmanTable,
    start: usize,
    se: usize,
    al: u32,
    eobrun: &mut u32,
) -> Result<(), CodecError> {
    let positive = 1i32 << al;
    let negative = -(1i32 << al);

    // Append a correction bit to one already-nonzero coefficient.
    let correct = |reader: &mut BitReader<'_>, c: &mut i32| -> Result<(), CodecError> {
        if reader.read_bits(1)? != 0 && (*c & positive) == 0 {
            *c += if *c >= 0 { positive } else { negative };
        }
        Ok(())
    };

    if *eobrun > 0 {
        for k in start..=se {
            if block.coefficients[k] != 0 {
                correct(reader, &mut block.coefficients[k])?;
            }
        }
        *eobrun -= 1;
        return Ok(());
    }

    let mut k = start;
    while k <= se {
        let symbol = decode_symbol(reader, table)?;
        let mut run = usize::from(symbol >> 4);
        let category = symbol & 0x0F;

        if category == 0 {
            if run == 15 {
                // ZRL: pass sixteen zero-history coefficients, still
                // correcting nonzeros along the way.
                let mut zeros = 16;
                while k <= se && zeros > 0 {
                    if block.coefficients[k] != 0 {
                        correct(reader, &mut block.coefficients[k])?;
                    } else {
                        zeros -= 1;
                    }
                    k += 1;
                }
                continue;
            }
            *eobrun = (1u32 << run) - 1;
            if run > 0 {
                *eobrun += reader.read_bits(run as u32)? as u32;
            }
            // Finish this block: correct the remaining nonzeros.
            for kk in k..=se {
                if block.coefficients[kk] != 0 {
                    correct(reader, &mut block.coefficients[kk])?;
                }
            }
            break;
        }
        if category != 1 {
            return Err(CodecError::InvalidData(
                "refinement scan with multi-bit amplitude".into(),
            ));
        }

        // New nonzero coefficient: its sign bit, placed after `run`
        // zero-history coefficients.
        let new_value = if reader.read_bits(1)? != 0 {
            positive
        } else {
            negative
        };
        loop {
            if k > se {
                break;
            }
            if block.coefficients[k] != 0 {
                correct(reader, &mut block.coefficients[k])?;
            } else {
                if run == 0 {
                    break;
                }
                run -= 1;
            }
            k += 1;
        }
        if k <= se {
            block.coefficients[k] = new_value;
        }
        k += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_matches_huff_extend_semantics() {
        // Category 3: amplitudes 0..=3 map to -7..=-4, 4..=7 stay.
        assert_eq!(extend(0, 3), -7);
        assert_eq!(extend(3, 3), -4);
        assert_eq!(extend(4, 3), 4);
        assert_eq!(extend(7, 3), 7);
        assert_eq!(extend(0, 0), 0);
        // Category 1: 0 is -1, 1 is 1.
        assert_eq!(extend(0, 1), -1);
        assert_eq!(extend(1, 1), 1);
    }

    #[test]
    fn canonical_table_decodes_its_codes() {
        // Two codes of length 2 (symbols 0 and 7), one of length 3.
        let mut counts = [0u8; 16];
        counts[1] = 2;
        counts[2] = 1;
        let table = HuffmanTable::build(&counts, &[0, 7, 9]).unwrap();

        // Codes: 00 -> 0, 01 -> 7, 100 -> 9.
        let data = [0b0001_1000u8];
        let mut r = BitReader::new(&data);
        assert_eq!(decode_symbol(&mut r, &table).unwrap(), 0);
        assert_eq!(decode_symbol(&mut r, &table).unwrap(), 7);
        assert_eq!(decode_symbol(&mut r, &table).unwrap(), 9);
    }

    #[test]
    fn overfull_table_is_rejected() {
        let mut counts = [0u8; 16];
        counts[0] = 3; // three codes of length 1 cannot exist
        assert!(HuffmanTable::build(&counts, &[1, 2, 3]).is_err());
    }

    #[test]
    fn invalid_code_is_an_error() {
        let mut counts = [0u8; 16];
        counts[0] = 1; // only code `0`
        let table = HuffmanTable::build(&counts, &[5]).unwrap();
        let data = [0b1000_0000u8];
        let mut r = BitReader::new(&data);
        assert!(decode_symbol(&mut r, &table).is_err());
    }
}
