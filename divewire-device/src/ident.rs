//! Model identification
//!
//! A family's version command returns a fixed-size record; the model
//! table maps those records to layouts. A pattern byte of zero is a
//! wildcard, and the firmware version is read big-endian out of the
//! first run of wildcards, so the same table row both matches a model
//! and extracts its firmware.

/// One row of a family's model table
pub struct ModelMatch<L: 'static> {
    /// Version-record pattern; zero bytes match anything.
    pub pattern: &'static [u8],
    /// Oldest firmware this driver handles; older devices are
    /// reported unsupported rather than mis-driven.
    pub firmware_min: u32,
    /// Family-scoped model code.
    pub model: u32,
    /// Marketing name, for humans reading logs.
    pub name: &'static str,
    /// The memory and ring layout of this model.
    pub layout: &'static L,
}

/// Match `version` against `table`, in order.
///
/// Returns the first row whose pattern matches and whose extracted
/// firmware meets the row's minimum, along with that firmware value.
pub fn match_version<'t, L>(
    table: &'t [ModelMatch<L>],
    version: &[u8],
) -> Option<(&'t ModelMatch<L>, u32)> {
    'rows: for row in table {
        if version.len() < row.pattern.len() {
            continue;
        }
        let mut firmware: u32 = 0;
        let mut firmware_bytes = 0;
        let mut in_run = false;
        let mut run_seen = false;
        for (&p, &v) in row.pattern.iter().zip(version) {
            if p == 0 {
                if (!run_seen || in_run) && firmware_bytes < 4 {
                    firmware = (firmware << 8) | v as u32;
                    firmware_bytes += 1;
                    in_run = true;
                    run_seen = true;
                }
            } else {
                if p != v {
                    continue 'rows;
                }
                in_run = false;
            }
        }
        if firmware >= row.firmware_min {
            return Some((row, firmware));
        }
    }
    None
}

/// How a model encodes its serial number
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum SerialFormat {
    /// Plain big-endian binary.
    Binary,
    /// One decimal digit per byte.
    Bcd,
    /// Two decimal digits per byte, high nibble first.
    PackedBcd,
}

/// Decode a serial number field.
pub fn decode_serial(data: &[u8], format: SerialFormat) -> u32 {
    match format {
        SerialFormat::Binary => data
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | b as u32),
        SerialFormat::Bcd => data
            .iter()
            .fold(0u32, |acc, &b| {
                acc.wrapping_mul(10).wrapping_add((b & 0x0F) as u32)
            }),
        SerialFormat::PackedBcd => data.iter().fold(0u32, |acc, &b| {
            acc.wrapping_mul(100)
                .wrapping_add(((b >> 4) * 10 + (b & 0x0F)) as u32)
        }),
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/ident.rs"]
mod tests;
