//! Layered soil column mechanics: supply-limited detachment with an
//! erodibility-weighted partition across the size classes, cascading down
//! the column, and top-layer deposition.
//!
//! Two write paths exist. Flow erosion goes through the *staged* thickness
//! fields so that every cell's routing sees the same committed soil
//! snapshot; the stage is folded into the committed fields once per
//! iteration. The slower processes (splash, slump, topple, headcut,
//! infiltration deposit) run after routing and write the committed fields
//! in place.

use crate::grid::{Grid, SEDIMENT_TOLERANCE, THICKNESS_TOLERANCE};
use crate::numerics::fp_eq;

/// Which erodibility triple a withdrawal uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErodibilityKind {
    Flow,
    Splash,
    Slump,
}

/// Whether a withdrawal or deposit goes through the staged fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WritePath {
    Staged,
    InPlace,
}

fn erodibility(grid: &Grid, layer: usize, kind: ErodibilityKind) -> [f64; 3] {
    let l = &grid.layers[layer];
    match kind {
        ErodibilityKind::Flow => l.flow_erodibility,
        ErodibilityKind::Splash => l.splash_erodibility,
        ErodibilityKind::Slump => l.slump_erodibility,
    }
}

/// Withdraw up to `depth` (mm) from one layer at a cell, partitioned across
/// the size classes present in the layer in proportion to their
/// erodibilities. Returns the per-class depths actually withdrawn.
fn detach_from_layer(
    grid: &mut Grid,
    layer: usize,
    x: usize,
    y: usize,
    depth: f64,
    kind: ErodibilityKind,
    path: WritePath,
) -> [f64; 3] {
    let mut taken = [0.0; 3];

    let total_thickness = grid.layers[layer].layer_thickness(x, y);
    if fp_eq(total_thickness, 0.0, THICKNESS_TOLERANCE) {
        return taken;
    }

    let erod = erodibility(grid, layer, kind);

    // Classes with no material get weight zero; the request is shared among
    // the rest by relative erodibility
    let mut weights = [0.0; 3];
    let mut total_erod = 0.0;
    for c in 0..3 {
        if *grid.layers[layer].thickness[c].get(x, y) > 0.0 {
            weights[c] = 1.0;
            total_erod += erod[c];
        }
    }
    if total_erod == 0.0 {
        return taken;
    }

    for c in 0..3 {
        if weights[c] == 0.0 {
            continue;
        }
        let share = erod[c] * depth / total_erod;
        let available = match path {
            WritePath::Staged => *grid.layers[layer].staged[c].get(x, y),
            WritePath::InPlace => *grid.layers[layer].thickness[c].get(x, y),
        };
        let actual = share.min(available);
        taken[c] = actual;
        match path {
            WritePath::Staged => *grid.layers[layer].staged[c].get_mut(x, y) -= actual,
            WritePath::InPlace => *grid.layers[layer].thickness[c].get_mut(x, y) -= actual,
        }
    }

    taken
}

/// Withdraw up to `depth` (mm) from the soil column at a cell, starting at
/// the top layer and cascading down until the request is met or the column
/// is exhausted. Returns the per-class depths actually withdrawn.
pub fn detach(
    grid: &mut Grid,
    x: usize,
    y: usize,
    depth: f64,
    kind: ErodibilityKind,
    path: WritePath,
) -> [f64; 3] {
    let mut total = [0.0; 3];
    if depth <= 0.0 {
        return total;
    }

    let mut remaining = depth;
    for layer in 0..grid.layers.len() {
        let taken = detach_from_layer(grid, layer, x, y, remaining, kind, path);
        for c in 0..3 {
            total[c] += taken[c];
        }
        let got = taken[0] + taken[1] + taken[2];
        remaining -= got;
        if fp_eq(total[0] + total[1] + total[2], depth, SEDIMENT_TOLERANCE) || remaining <= 0.0 {
            break;
        }
    }

    total
}

/// Deposit per-class depths onto the top layer, even if that layer has been
/// eroded to zero thickness.
pub fn deposit_top_layer(grid: &mut Grid, x: usize, y: usize, amounts: [f64; 3], path: WritePath) {
    for c in 0..3 {
        if amounts[c] <= 0.0 {
            continue;
        }
        match path {
            WritePath::Staged => *grid.layers[0].staged[c].get_mut(x, y) += amounts[c],
            WritePath::InPlace => *grid.layers[0].thickness[c].get_mut(x, y) += amounts[c],
        }
    }
}

/// Bulk density (kg/m3) of the topmost layer with non-zero thickness; None
/// once the column is down to unerodible basement.
pub fn top_nonzero_bulk_density(grid: &Grid, x: usize, y: usize) -> Option<f64> {
    for layer in &grid.layers {
        if layer.layer_thickness(x, y) > 0.0 {
            return Some(layer.bulk_density);
        }
    }
    None
}

/// Copy every layer's committed thicknesses into the staged fields; run at
/// the start of each iteration before flow routing.
pub fn init_staged(grid: &mut Grid) {
    for layer in &mut grid.layers {
        for c in 0..3 {
            layer.staged[c] = layer.thickness[c].clone();
        }
    }
}

/// Fold the staged thicknesses back into the committed fields; run once per
/// iteration after all cells have routed.
pub fn commit_staged(grid: &mut Grid) {
    for layer in &mut grid.layers {
        for c in 0..3 {
            layer.thickness[c] = layer.staged[c].clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{flat_dem, test_params};

    fn grid_with_layers(n: usize) -> Grid {
        Grid::new(&flat_dem(3, 3, 100.0 * n as f64), 10.0, &test_params(n))
    }

    #[test]
    fn detach_partitions_by_relative_erodibility() {
        let mut grid = grid_with_layers(1);
        let taken = detach(&mut grid, 1, 1, 0.9, ErodibilityKind::Flow, WritePath::InPlace);
        // Erodibilities 0.8 / 0.6 / 0.4, all classes present
        assert!((taken[0] - 0.9 * 0.8 / 1.8).abs() < 1e-12);
        assert!((taken[1] - 0.9 * 0.6 / 1.8).abs() < 1e-12);
        assert!((taken[2] - 0.9 * 0.4 / 1.8).abs() < 1e-12);
        assert!((taken.iter().sum::<f64>() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn absent_class_gets_no_share() {
        let mut grid = grid_with_layers(1);
        // Empty the clay store of the only layer
        grid.layers[0].thickness[0].set(1, 1, 0.0);
        let taken = detach(&mut grid, 1, 1, 0.5, ErodibilityKind::Flow, WritePath::InPlace);
        assert_eq!(taken[0], 0.0);
        // Remaining classes split 0.6 : 0.4
        assert!((taken[1] - 0.5 * 0.6 / 1.0).abs() < 1e-12);
        assert!((taken[2] - 0.5 * 0.4 / 1.0).abs() < 1e-12);
    }

    #[test]
    fn detach_cascades_to_lower_layer_when_top_is_exhausted() {
        let mut grid = grid_with_layers(2);
        // Shrink the top layer to a sliver
        for c in 0..3 {
            grid.layers[0].thickness[c].set(1, 1, 0.001);
        }
        let taken = detach(&mut grid, 1, 1, 1.0, ErodibilityKind::Flow, WritePath::InPlace);
        let total: f64 = taken.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        // The lower layer must have contributed
        assert!(grid.layers[1].layer_thickness(1, 1) < 200.0);
    }

    #[test]
    fn detach_is_supply_limited() {
        let mut grid = grid_with_layers(1);
        for c in 0..3 {
            grid.layers[0].thickness[c].set(1, 1, 0.01);
        }
        let taken = detach(&mut grid, 1, 1, 5.0, ErodibilityKind::Flow, WritePath::InPlace);
        let total: f64 = taken.iter().sum();
        assert!((total - 0.03).abs() < 1e-9);
        assert!(grid.layers[0].layer_thickness(1, 1).abs() < 1e-12);
    }

    #[test]
    fn detach_then_deposit_restores_thickness() {
        let mut grid = grid_with_layers(1);
        let before = grid.layers[0].layer_thickness(1, 1);
        let taken = detach(&mut grid, 1, 1, 0.7, ErodibilityKind::Splash, WritePath::InPlace);
        deposit_top_layer(&mut grid, 1, 1, taken, WritePath::InPlace);
        let after = grid.layers[0].layer_thickness(1, 1);
        assert!((after - before).abs() < 1e-12);
    }

    #[test]
    fn staged_writes_leave_committed_until_commit() {
        let mut grid = grid_with_layers(1);
        init_staged(&mut grid);
        let before = grid.layers[0].layer_thickness(1, 1);
        detach(&mut grid, 1, 1, 0.5, ErodibilityKind::Flow, WritePath::Staged);
        // Committed field untouched until the commit
        assert_eq!(grid.layers[0].layer_thickness(1, 1), before);
        commit_staged(&mut grid);
        assert!((grid.layers[0].layer_thickness(1, 1) - (before - 0.5)).abs() < 1e-9);
    }

    #[test]
    fn bulk_density_skips_empty_layers() {
        let mut grid = grid_with_layers(2);
        grid.layers[1].bulk_density = 1500.0;
        for c in 0..3 {
            grid.layers[0].thickness[c].set(1, 1, 0.0);
        }
        assert_eq!(top_nonzero_bulk_density(&grid, 1, 1), Some(1500.0));
        for c in 0..3 {
            grid.layers[1].thickness[c].set(1, 1, 0.0);
        }
        assert_eq!(top_nonzero_bulk_density(&grid, 1, 1), None);
    }
}
