// SPDX-License-Identifier: AGPL-3.0-only

//! Static decomposition of the lattice along its leading axis.
//!
//! Partitions are assigned to devices in contiguous blocks: with P
//! partitions on D devices, partition `p` lives on device `p * D / P`.
//! Rows are split as evenly as possible, the first `L mod P` partitions
//! taking one extra row.

use crate::error::{ForgeError, Result};

/// One contiguous slice of the lattice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Absolute partition index (ring position).
    pub index: usize,
    /// Owning device slot.
    pub device: usize,
    /// Position among the partitions of its device.
    pub local_index: usize,
    /// Only partition on its device: no ghost rows, no shadow traffic.
    pub sole_occupant: bool,
    pub first_row: usize,
    pub rows: usize,
    pub row_elems: usize,
}

impl Partition {
    /// Ghost rows carried by the device buffer.
    #[must_use]
    pub const fn ghost_rows(&self) -> usize {
        if self.sole_occupant {
            0
        } else {
            2
        }
    }

    /// Elements in the device buffer, ghosts included.
    #[must_use]
    pub const fn buffer_elems(&self) -> usize {
        (self.rows + self.ghost_rows()) * self.row_elems
    }
}

/// Partitions grouped by device slot, in local order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSlot {
    pub index: usize,
    pub partitions: Vec<usize>,
}

/// Split `leading_extent` rows into `partitions` slices on `devices` devices.
///
/// # Errors
///
/// [`ForgeError::Config`] if there are more partitions than rows or more
/// devices than partitions.
pub fn decompose(
    partitions: usize,
    devices: usize,
    leading_extent: usize,
    row_elems: usize,
) -> Result<(Vec<Partition>, Vec<DeviceSlot>)> {
    if partitions == 0 || devices == 0 {
        return Err(ForgeError::Config("partition and device counts must be positive".into()));
    }
    if partitions > leading_extent {
        return Err(ForgeError::Config(format!(
            "{partitions} partitions exceed leading extent {leading_extent}"
        )));
    }
    if devices > partitions {
        return Err(ForgeError::Config(format!(
            "{devices} devices for {partitions} partitions"
        )));
    }

    let mut slots: Vec<DeviceSlot> = (0..devices)
        .map(|index| DeviceSlot {
            index,
            partitions: Vec::new(),
        })
        .collect();
    for p in 0..partitions {
        slots[p * devices / partitions].partitions.push(p);
    }

    let base = leading_extent / partitions;
    let extra = leading_extent % partitions;
    let mut first_row = 0;
    let mut out = Vec::with_capacity(partitions);
    for slot in &slots {
        for (local_index, &index) in slot.partitions.iter().enumerate() {
            let rows = base + usize::from(index < extra);
            out.push(Partition {
                index,
                device: slot.index,
                local_index,
                sole_occupant: slot.partitions.len() == 1,
                first_row,
                rows,
                row_elems,
            });
            first_row += rows;
        }
    }
    Ok((out, slots))
}

/// Partitions launched in one pass: local index `2k` (red) or `2k + 1`
/// (black) on every device that has one.
#[must_use]
pub fn pass_set(slots: &[DeviceSlot], black: bool, k: usize) -> Vec<usize> {
    let local = 2 * k + usize::from(black);
    slots
        .iter()
        .filter_map(|s| s.partitions.get(local).copied())
        .collect()
}

/// Passes per color: `(red, black)` with `black = passes >> 1`, where
/// `passes` is the largest partition count on any device.
#[must_use]
pub fn pass_counts(slots: &[DeviceSlot]) -> (usize, usize) {
    let passes = slots.iter().map(|s| s.partitions.len()).max().unwrap_or(0);
    let black = passes >> 1;
    (passes - black, black)
}
