// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Grid snapping and neighborhoods.
//!
//! A position snaps to the minimum corner of its cell:
//! `floor(p / size) * size` per axis. Neighborhoods extend in the x/z plane
//! only; `y` is carried through unchanged.

use super::types::{Position, RealmCoord};

fn snap_axis(value: f64, size: u32) -> i64 {
    let size = f64::from(size);
    // `as` saturates out-of-range floats.
    ((value / size).floor() * size) as i64
}

impl RealmCoord {
    /// Cell containing `position` on a grid of edge `size`.
    ///
    /// `size` must be positive.
    pub fn containing(position: Position, size: u32) -> Self {
        Self {
            x: snap_axis(position.x, size),
            y: snap_axis(position.y, size),
            z: snap_axis(position.z, size),
            size,
        }
    }

    /// The cell offset by `dx`, `dz` cells in the x/z plane.
    pub fn offset(&self, dx: i64, dz: i64) -> Self {
        let step = i64::from(self.size);
        Self {
            x: self.x.saturating_add(dx.saturating_mul(step)),
            y: self.y,
            z: self.z.saturating_add(dz.saturating_mul(step)),
            size: self.size,
        }
    }

    /// The (2·radius + 1)² cells centered on this one, row-major from the
    /// minimum corner.
    pub fn neighborhood(&self, radius: u32) -> Vec<RealmCoord> {
        let r = i64::from(radius);
        let mut cells = Vec::with_capacity(((2 * r + 1) * (2 * r + 1)) as usize);
        for dz in -r..=r {
            for dx in -r..=r {
                cells.push(self.offset(dx, dz));
            }
        }
        cells
    }

    /// Whether `other` lies within `radius` cells of this one in the x/z plane
    /// (same `y` and grid size).
    pub fn is_near(&self, other: &RealmCoord, radius: u32) -> bool {
        if self.size != other.size || self.y != other.y {
            return false;
        }
        let step = i128::from(self.size);
        let r = i128::from(radius);
        let dx = (i128::from(other.x) - i128::from(self.x)) / step;
        let dz = (i128::from(other.z) - i128::from(self.z)) / step;
        dx.abs() <= r && dz.abs() <= r
    }
}
