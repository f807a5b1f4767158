// SPDX-License-Identifier: AGPL-3.0-only

//! Host-side lattice storage in single or double precision.
//!
//! A [`ShadowBuffer`] mirrors one partition's device buffer row for row:
//! with ghost rows, row 0 is the low ghost, rows `1..=rows` are real and
//! row `rows + 1` is the high ghost.

use serde::Deserialize;

/// Floating-point width of the lattice and its measurement buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Single,
    Double,
}

impl Precision {
    #[must_use]
    pub const fn elem_size(self) -> usize {
        match self {
            Self::Single => 4,
            Self::Double => 8,
        }
    }

    /// Checkpoint header tag.
    #[must_use]
    pub const fn tag(self) -> u32 {
        match self {
            Self::Single => 1,
            Self::Double => 2,
        }
    }

    #[must_use]
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::Single),
            2 => Some(Self::Double),
            _ => None,
        }
    }
}

/// Typed element vector.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldData {
    Single(Vec<f32>),
    Double(Vec<f64>),
}

impl FieldData {
    #[must_use]
    pub fn zeros(precision: Precision, len: usize) -> Self {
        match precision {
            Precision::Single => Self::Single(vec![0.0; len]),
            Precision::Double => Self::Double(vec![0.0; len]),
        }
    }

    /// Decode native-endian bytes (trailing partial element dropped).
    #[must_use]
    pub fn from_bytes(precision: Precision, bytes: &[u8]) -> Self {
        match precision {
            Precision::Single => Self::Single(crate::gpu::pod_from_bytes(bytes)),
            Precision::Double => Self::Double(crate::gpu::pod_from_bytes(bytes)),
        }
    }

    #[must_use]
    pub const fn precision(&self) -> Precision {
        match self {
            Self::Single(_) => Precision::Single,
            Self::Double(_) => Precision::Double,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Single(v) => v.len(),
            Self::Double(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Single(v) => bytemuck::cast_slice(v),
            Self::Double(v) => bytemuck::cast_slice(v),
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Single(v) => bytemuck::cast_slice_mut(v),
            Self::Double(v) => bytemuck::cast_slice_mut(v),
        }
    }

    /// Element `i` widened to f64.
    #[must_use]
    pub fn get(&self, i: usize) -> Option<f64> {
        match self {
            Self::Single(v) => v.get(i).map(|&x| f64::from(x)),
            Self::Double(v) => v.get(i).copied(),
        }
    }

    /// Little-endian serialization, independent of host byte order.
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Self::Single(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Double(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    /// Inverse of [`Self::to_le_bytes`]; `bytes` must hold whole elements.
    #[must_use]
    pub fn from_le_bytes(precision: Precision, bytes: &[u8]) -> Self {
        match precision {
            Precision::Single => Self::Single(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            Precision::Double => Self::Double(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(c);
                        f64::from_le_bytes(b)
                    })
                    .collect(),
            ),
        }
    }
}

/// Orchestrator-owned host copy of one partition's device buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct ShadowBuffer {
    data: FieldData,
    rows: usize,
    row_elems: usize,
    ghosts: bool,
}

impl ShadowBuffer {
    /// `rows` real rows, plus two ghost rows when `ghosts` is set.
    #[must_use]
    pub fn new(precision: Precision, rows: usize, row_elems: usize, ghosts: bool) -> Self {
        let total = rows + if ghosts { 2 } else { 0 };
        Self {
            data: FieldData::zeros(precision, total * row_elems),
            rows,
            row_elems,
            ghosts,
        }
    }

    #[must_use]
    pub const fn data(&self) -> &FieldData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut FieldData {
        &mut self.data
    }

    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub const fn row_elems(&self) -> usize {
        self.row_elems
    }

    #[must_use]
    pub const fn has_ghosts(&self) -> bool {
        self.ghosts
    }

    #[must_use]
    pub const fn first_real(&self) -> usize {
        if self.ghosts {
            1
        } else {
            0
        }
    }

    #[must_use]
    pub const fn last_real(&self) -> usize {
        self.first_real() + self.rows - 1
    }

    /// Row index of the low ghost, if present.
    #[must_use]
    pub const fn low_ghost(&self) -> Option<usize> {
        if self.ghosts {
            Some(0)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn high_ghost(&self) -> Option<usize> {
        if self.ghosts {
            Some(self.rows + 1)
        } else {
            None
        }
    }

    fn row_range(&self, row: usize) -> std::ops::Range<usize> {
        let bytes = self.row_elems * self.data.precision().elem_size();
        row * bytes..(row + 1) * bytes
    }

    /// Raw bytes of `row`.
    #[must_use]
    pub fn row(&self, row: usize) -> &[u8] {
        &self.data.as_bytes()[self.row_range(row)]
    }

    /// Overwrite `row` with `bytes` (one row of the same precision).
    pub fn set_row(&mut self, row: usize, bytes: &[u8]) {
        let range = self.row_range(row);
        self.data.as_bytes_mut()[range].copy_from_slice(bytes);
    }

    /// Row `row` widened to f64.
    #[must_use]
    pub fn row_values(&self, row: usize) -> Vec<f64> {
        let start = row * self.row_elems;
        (start..start + self.row_elems)
            .filter_map(|i| self.data.get(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_tags() {
        assert_eq!(Precision::from_tag(Precision::Double.tag()), Some(Precision::Double));
        assert_eq!(Precision::from_tag(0), None);
        assert_eq!(Precision::Single.elem_size(), 4);
    }

    #[test]
    fn ghost_layout() {
        let s = ShadowBuffer::new(Precision::Single, 3, 4, true);
        assert_eq!(s.data().len(), 20);
        assert_eq!((s.first_real(), s.last_real()), (1, 3));
        assert_eq!((s.low_ghost(), s.high_ghost()), (Some(0), Some(4)));

        let sole = ShadowBuffer::new(Precision::Double, 3, 4, false);
        assert_eq!(sole.data().len(), 12);
        assert_eq!((sole.first_real(), sole.last_real()), (0, 2));
        assert_eq!(sole.low_ghost(), None);
    }

    #[test]
    fn row_copy_between_shadows() {
        let mut a = ShadowBuffer::new(Precision::Double, 2, 3, true);
        if let FieldData::Double(v) = a.data_mut() {
            for (i, x) in v.iter_mut().enumerate() {
                *x = i as f64;
            }
        }
        let mut b = ShadowBuffer::new(Precision::Double, 2, 3, true);
        b.set_row(0, a.row(a.last_real()));
        assert_eq!(b.row_values(0), vec![6.0, 7.0, 8.0]);
    }

    #[test]
    fn le_bytes_round_trip() {
        let f = FieldData::Single(vec![1.0, -2.5, 3.25]);
        let back = FieldData::from_le_bytes(Precision::Single, &f.to_le_bytes());
        assert_eq!(back, f);
    }
}
