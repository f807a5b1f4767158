// SPDX-License-Identifier: AGPL-3.0-only

//! Per-partition checkpoint files (`*.qcg`).
//!
//! Layout: 64 little-endian `u32` header words, then the measurement,
//! energy, plaquette-energy, Wilson-loop and Polyakov-loop buffers (each
//! present iff its count is non-zero), then the lattice. Elements are
//! little-endian `f32` or `f64` according to the precision tag.
//!
//! | Word | Field |
//! |------|-------|
//! | 0 | magic `"QCGF"` |
//! | 1 | format version |
//! | 2 | initialized flag |
//! | 3 | start type |
//! | 4–5 | PRNG seed (lo, hi) |
//! | 6 | PRNG generator |
//! | 7 | PRNG skip |
//! | 8–9 | PRNG counter (lo, hi) |
//! | 10, 11 | `nav`, `iter` |
//! | 12, 13 | thermalization / working passes done |
//! | 14 | multi-hit |
//! | 15, 16 | Wilson R, T |
//! | 17 | precision tag |
//! | 18–23 | β, φ, ω as f64 bit halves |
//! | 24 | Polyakov level |
//! | 25–27 | tensor μ, ν, flags |
//! | 28–32 | buffer counts (measurement … Polyakov) |
//! | 33–35 | topology kind, group N, dimensionality |
//! | 36–39 | full lattice extents |
//! | 40–43 | partition extents |
//! | 44 | lattice element count |

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::field::{FieldData, Precision};

pub const MAGIC: u32 = u32::from_le_bytes(*b"QCGF");
pub const VERSION: u32 = 2;
pub const HEADER_WORDS: usize = 64;

/// Checkpoint validation and I/O failures. Non-fatal to a run.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown precision tag {0}")]
    BadPrecision(u32),
    #[error("file truncated")]
    Truncated,
    #[error("partition shape {found:?} does not match {expected:?}")]
    Shape { expected: [u32; 4], found: [u32; 4] },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Where checkpoints are written and read.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CheckpointLocation {
    pub dir: PathBuf,
    pub prefix: String,
}

impl Default for CheckpointLocation {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            prefix: "lattice".into(),
        }
    }
}

impl CheckpointLocation {
    /// File for partition `index`.
    #[must_use]
    pub fn path_for(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}_p{index:03}.qcg", self.prefix))
    }
}

/// Decoded header fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CheckpointHeader {
    pub initialized: bool,
    pub start: u32,
    pub seed: u64,
    pub generator: u32,
    pub skip: u32,
    pub counter: u64,
    pub nav: u32,
    pub iter: u32,
    pub therm_done: u32,
    pub iter_done: u32,
    pub multi_hit: u32,
    pub wilson_r: u32,
    pub wilson_t: u32,
    pub precision: Precision,
    pub beta: f64,
    pub phi: f64,
    pub omega: f64,
    pub polyakov_level: u32,
    pub tensor: [u32; 3],
    pub kind: u32,
    pub group: u32,
    pub full_dims: [u32; 4],
    pub domain_dims: [u32; 4],
}

/// Full contents of one partition checkpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub header: CheckpointHeader,
    pub measurement: FieldData,
    pub energy: FieldData,
    pub plaquette_energy: Option<FieldData>,
    pub wilson_loop: Option<FieldData>,
    pub polyakov_loop: Option<FieldData>,
    pub lattice: FieldData,
}

fn split_u64(v: u64) -> (u32, u32) {
    (v as u32, (v >> 32) as u32)
}

fn join_u64(lo: u32, hi: u32) -> u64 {
    u64::from(lo) | (u64::from(hi) << 32)
}

fn count_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl Checkpoint {
    fn optional(&self) -> [Option<&FieldData>; 3] {
        [
            self.plaquette_energy.as_ref(),
            self.wilson_loop.as_ref(),
            self.polyakov_loop.as_ref(),
        ]
    }

    fn header_words(&self) -> [u32; HEADER_WORDS] {
        let h = &self.header;
        let mut w = [0u32; HEADER_WORDS];
        w[0] = MAGIC;
        w[1] = VERSION;
        w[2] = u32::from(h.initialized);
        w[3] = h.start;
        (w[4], w[5]) = split_u64(h.seed);
        w[6] = h.generator;
        w[7] = h.skip;
        (w[8], w[9]) = split_u64(h.counter);
        w[10] = h.nav;
        w[11] = h.iter;
        w[12] = h.therm_done;
        w[13] = h.iter_done;
        w[14] = h.multi_hit;
        w[15] = h.wilson_r;
        w[16] = h.wilson_t;
        w[17] = h.precision.tag();
        (w[18], w[19]) = split_u64(h.beta.to_bits());
        (w[20], w[21]) = split_u64(h.phi.to_bits());
        (w[22], w[23]) = split_u64(h.omega.to_bits());
        w[24] = h.polyakov_level;
        w[25..28].copy_from_slice(&h.tensor);
        w[28] = count_u32(self.measurement.len());
        w[29] = count_u32(self.energy.len());
        for (slot, buf) in w[30..33].iter_mut().zip(self.optional()) {
            *slot = buf.map_or(0, |b| count_u32(b.len()));
        }
        w[33] = h.kind;
        w[34] = h.group;
        w[35] = 4;
        w[36..40].copy_from_slice(&h.full_dims);
        w[40..44].copy_from_slice(&h.domain_dims);
        w[44] = count_u32(self.lattice.len());
        w
    }

    /// Serialize to `out`.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::Io`] on write failure.
    pub fn write_to(&self, mut out: impl Write) -> Result<(), CheckpointError> {
        let header: Vec<u8> = self
            .header_words()
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        out.write_all(&header)?;
        out.write_all(&self.measurement.to_le_bytes())?;
        out.write_all(&self.energy.to_le_bytes())?;
        for buf in self.optional().into_iter().flatten() {
            out.write_all(&buf.to_le_bytes())?;
        }
        out.write_all(&self.lattice.to_le_bytes())?;
        out.flush()?;
        Ok(())
    }

    /// Parse from `input`, validating magic and version before anything else.
    ///
    /// # Errors
    ///
    /// [`CheckpointError`] describing the first validation failure.
    pub fn read_from(mut input: impl Read) -> Result<Self, CheckpointError> {
        let mut raw = [0u8; HEADER_WORDS * 4];
        read_exact(&mut input, &mut raw)?;
        let mut w = [0u32; HEADER_WORDS];
        for (word, chunk) in w.iter_mut().zip(raw.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        if w[0] != MAGIC {
            return Err(CheckpointError::BadMagic(w[0]));
        }
        if w[1] != VERSION {
            return Err(CheckpointError::UnsupportedVersion(w[1]));
        }
        let precision = Precision::from_tag(w[17]).ok_or(CheckpointError::BadPrecision(w[17]))?;

        let dims = |a: usize| [w[a], w[a + 1], w[a + 2], w[a + 3]];
        let header = CheckpointHeader {
            initialized: w[2] != 0,
            start: w[3],
            seed: join_u64(w[4], w[5]),
            generator: w[6],
            skip: w[7],
            counter: join_u64(w[8], w[9]),
            nav: w[10],
            iter: w[11],
            therm_done: w[12],
            iter_done: w[13],
            multi_hit: w[14],
            wilson_r: w[15],
            wilson_t: w[16],
            precision,
            beta: f64::from_bits(join_u64(w[18], w[19])),
            phi: f64::from_bits(join_u64(w[20], w[21])),
            omega: f64::from_bits(join_u64(w[22], w[23])),
            polyakov_level: w[24],
            tensor: [w[25], w[26], w[27]],
            kind: w[33],
            group: w[34],
            full_dims: dims(36),
            domain_dims: dims(40),
        };

        let mut next = |count: u32| read_section(&mut input, count, precision);
        let measurement = next(w[28])?;
        let energy = next(w[29])?;
        let mut optional = [None, None, None];
        for (slot, &count) in optional.iter_mut().zip(&w[30..33]) {
            if count > 0 {
                *slot = Some(next(count)?);
            }
        }
        let lattice = next(w[44])?;
        let [plaquette_energy, wilson_loop, polyakov_loop] = optional;
        Ok(Self {
            header,
            measurement,
            energy,
            plaquette_energy,
            wilson_loop,
            polyakov_loop,
            lattice,
        })
    }

    /// Write to `path`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::Io`] on failure.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    /// # Errors
    ///
    /// As [`Self::read_from`], plus [`CheckpointError::Io`] if unreadable.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let bytes = fs::read(path)?;
        Self::read_from(bytes.as_slice())
    }

    /// Reject a checkpoint written for a different partition shape.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::Shape`] on mismatch.
    pub fn check_domain(&self, expected: [u32; 4]) -> Result<(), CheckpointError> {
        if self.header.domain_dims == expected {
            Ok(())
        } else {
            Err(CheckpointError::Shape {
                expected,
                found: self.header.domain_dims,
            })
        }
    }
}

fn read_exact(input: &mut impl Read, buf: &mut [u8]) -> Result<(), CheckpointError> {
    input.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CheckpointError::Truncated
        } else {
            CheckpointError::Io(e)
        }
    })
}

/// Read `count` elements. The buffer grows with the bytes actually present,
/// so a corrupt count fails as truncation instead of a huge allocation.
fn read_section(
    input: &mut impl Read,
    count: u32,
    precision: Precision,
) -> Result<FieldData, CheckpointError> {
    let len = usize::try_from(count)
        .ok()
        .and_then(|n| n.checked_mul(precision.elem_size()))
        .ok_or(CheckpointError::Truncated)?;
    let mut bytes = Vec::new();
    input.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(CheckpointError::Truncated);
    }
    Ok(FieldData::from_le_bytes(precision, &bytes))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample(precision: Precision) -> Checkpoint {
        Checkpoint {
            header: CheckpointHeader {
                initialized: true,
                start: 1,
                seed: 0x1234_5678_9abc_def0,
                counter: 77,
                nav: 5,
                iter: 20,
                therm_done: 5,
                iter_done: 12,
                precision,
                beta: 5.7,
                phi: -0.25,
                full_dims: [8, 4, 4, 4],
                domain_dims: [2, 4, 4, 4],
                ..CheckpointHeader::default()
            },
            measurement: FieldData::zeros(precision, 8),
            energy: FieldData::zeros(precision, 2),
            plaquette_energy: None,
            wilson_loop: Some(FieldData::zeros(precision, 1)),
            polyakov_loop: None,
            lattice: FieldData::zeros(precision, 32),
        }
    }

    #[test]
    fn magic_is_ascii_tag() {
        assert_eq!(&MAGIC.to_le_bytes(), b"QCGF");
    }

    #[test]
    fn round_trip_preserves_everything() {
        for precision in [Precision::Single, Precision::Double] {
            let ckpt = sample(precision);
            let mut bytes = Vec::new();
            ckpt.write_to(&mut bytes).unwrap();
            let expected_len =
                HEADER_WORDS * 4 + (8 + 2 + 1 + 32) * precision.elem_size();
            assert_eq!(bytes.len(), expected_len);
            let back = Checkpoint::read_from(bytes.as_slice()).unwrap();
            assert_eq!(back, ckpt);
        }
    }

    #[test]
    fn f64_fields_split_exactly() {
        let ckpt = sample(Precision::Single);
        let w = ckpt.header_words();
        assert_eq!(join_u64(w[18], w[19]), 5.7f64.to_bits());
        assert_eq!(join_u64(w[4], w[5]), 0x1234_5678_9abc_def0);
    }

    #[test]
    fn bad_magic_rejected_first() {
        let mut bytes = Vec::new();
        sample(Precision::Single).write_to(&mut bytes).unwrap();
        bytes[0] = b'X';
        bytes[4] = 99;
        assert!(matches!(
            Checkpoint::read_from(bytes.as_slice()),
            Err(CheckpointError::BadMagic(_))
        ));
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut bytes = Vec::new();
        sample(Precision::Single).write_to(&mut bytes).unwrap();
        bytes[4] = 1;
        assert!(matches!(
            Checkpoint::read_from(bytes.as_slice()),
            Err(CheckpointError::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn truncation_detected() {
        let mut bytes = Vec::new();
        sample(Precision::Double).write_to(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            Checkpoint::read_from(bytes.as_slice()),
            Err(CheckpointError::Truncated)
        ));
    }

    #[test]
    fn oversized_counts_fail_as_truncation() {
        let mut bytes = Vec::new();
        sample(Precision::Double).write_to(&mut bytes).unwrap();
        for word in [28, 29, 44] {
            bytes[word * 4..word * 4 + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        }
        assert!(matches!(
            Checkpoint::read_from(bytes.as_slice()),
            Err(CheckpointError::Truncated)
        ));

        let mut header_only = vec![0u8; HEADER_WORDS * 4];
        header_only[..4].copy_from_slice(&MAGIC.to_le_bytes());
        header_only[4..8].copy_from_slice(&VERSION.to_le_bytes());
        header_only[17 * 4..17 * 4 + 4].copy_from_slice(&2u32.to_le_bytes());
        header_only[44 * 4..44 * 4 + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Checkpoint::read_from(header_only.as_slice()),
            Err(CheckpointError::Truncated)
        ));
    }

    #[test]
    fn domain_check() {
        let ckpt = sample(Precision::Single);
        assert!(ckpt.check_domain([2, 4, 4, 4]).is_ok());
        assert!(matches!(
            ckpt.check_domain([4, 4, 4, 4]),
            Err(CheckpointError::Shape { .. })
        ));
    }
}
