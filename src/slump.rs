//! Slumping of saturated sidewalls and toppling of oversteepened slopes.
//!
//! Shear stress from flow detachment is spread over a precomputed patch of
//! weights. Every slump interval, each interior cell sums the stress of
//! itself and its wet neighbours; scaled by the top layer's saturation and
//! the elapsed interval, a threshold exceedance triggers one slump hop down
//! the steepest wet soil-surface gradient, which may in turn topple the
//! cells above it.

use crate::grid::{is_diagonal, Grid, MAX_TOPPLE_DEPTH};
use crate::params::{ErodibilitySource, RunParams};
use crate::soil::{self, ErodibilityKind, WritePath};

/// Quadrant of normalised weights for spatially distributing shear stress.
///
/// Weight at offset (i, j) is max(0, 1 - sqrt(i^2 + j^2) / Q); the full
/// four-quadrant patch is normalised to sum to one.
pub struct ShearPatch {
    size: usize,
    /// Row-major quadrant, indexed [m][n]
    weights: Vec<Vec<f64>>,
}

impl ShearPatch {
    pub fn new(patch_size_mm: f64, cell_side: f64) -> Self {
        let size = ((patch_size_mm / cell_side).floor() as usize).max(1);
        let mut weights = vec![vec![0.0; size]; size];

        let dist = |i: usize, j: usize| ((i * i + j * j) as f64).sqrt();

        weights[0][0] = 1.0;
        let mut total = 1.0;

        // Axis cells, each covering four rotated positions
        for n in 1..size {
            let w = 1.0 - dist(n, 0) / size as f64;
            weights[n][0] = w;
            weights[0][n] = w;
            total += 4.0 * w;
        }

        // Interior cells
        for n in 1..size {
            for m in 1..size {
                let w = (1.0 - dist(n, m) / size as f64).max(0.0);
                weights[n][m] = w;
                total += 4.0 * w;
            }
        }

        for row in weights.iter_mut() {
            for w in row.iter_mut() {
                *w /= total;
            }
        }

        Self { size, weights }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Sum of all weights over the four reflected quadrants (one when
    /// nothing is clipped by the grid edge).
    pub fn total_weight(&self) -> f64 {
        let mut total = self.weights[0][0];
        for m in 1..self.size {
            for n in 0..self.size {
                total += 4.0 * self.weights[m][n];
            }
        }
        total
    }
}

/// Spread a shear-stress increment over the patch around a cell. Off-grid
/// and missing-cell shares are dropped, not redistributed.
pub fn distribute_shear_stress(grid: &mut Grid, patch: &ShearPatch, x: usize, y: usize, tau: f64) {
    let add = |grid: &mut Grid, xi: i32, yi: i32, t: f64| {
        if grid.in_bounds(xi, yi) && !grid.is_missing(xi as usize, yi as usize) {
            *grid.shear_stress.get_mut(xi as usize, yi as usize) += t;
            *grid.cumul_shear_stress.get_mut(xi as usize, yi as usize) += t;
        }
    };

    add(grid, x as i32, y as i32, tau * patch.weights[0][0]);

    for m in 1..patch.size {
        for n in 0..patch.size {
            let t = tau * patch.weights[m][n];
            if t == 0.0 {
                continue;
            }
            let (xi, yi) = (x as i32, y as i32);
            let (mi, ni) = (m as i32, n as i32);
            // The four 90-degree rotations of the quadrant offset
            add(grid, xi + mi, yi + ni, t);
            add(grid, xi - mi, yi - ni, t);
            add(grid, xi + ni, yi - mi, t);
            add(grid, xi - ni, yi + mi, t);
        }
    }
}

/// Plot totals from one slump/topple pass, per size class.
#[derive(Clone, Copy, Debug, Default)]
pub struct SlumpOutcome {
    pub slump_detach: [f64; 3],
    pub slump_deposit: [f64; 3],
    pub slump_to_sed_load: [f64; 3],
    pub topple_detach: [f64; 3],
    pub topple_deposit: [f64; 3],
    pub topple_to_sed_load: [f64; 3],
}

fn erodibility_kind(source: ErodibilitySource) -> ErodibilityKind {
    match source {
        ErodibilitySource::Slump => ErodibilityKind::Slump,
        ErodibilitySource::Flow => ErodibilityKind::Flow,
    }
}

/// Run slumping (and any triggered toppling) over the whole grid.
///
/// `interval` is the simulated time since the last slump pass.
pub fn do_all_slump(grid: &mut Grid, params: &RunParams, interval: f64) -> SlumpOutcome {
    let mut out = SlumpOutcome::default();
    if interval <= 0.0 {
        return out;
    }

    let allowance_orth = grid.cell_side * params.slump_angle_of_rest_percent / 100.0;
    let allowance_diag = grid.cell_diag * params.slump_angle_of_rest_percent / 100.0;

    for y in 0..grid.ny {
        for x in 0..grid.nx {
            // Slumping never starts on edge cells, to avoid edge effects
            if grid.is_missing_or_edge(x, y) {
                continue;
            }

            // Stress of this cell plus every wet interior neighbour
            let mut stress = *grid.shear_stress.get(x, y);
            for dir in 0..8 {
                if let Some((nx, ny)) = grid.neighbour(x, y, dir) {
                    if !grid.is_missing_or_edge(nx, ny) && grid.is_wet(nx, ny) {
                        stress += *grid.shear_stress.get(nx, ny);
                    }
                }
            }
            if stress == 0.0 {
                continue;
            }

            // Wetter sidewalls fail sooner: scale by the top layer's
            // saturation fraction (fully saturated when infiltration is off)
            let water_frac = if params.enable_infiltration {
                let max = grid.layers[0].max_soil_water(x, y);
                if max > 0.0 {
                    *grid.layers[0].soil_water.get(x, y) / max
                } else {
                    1.0
                }
            } else {
                1.0
            };

            stress *= water_frac;
            stress /= interval;

            if stress < params.critical_shear_stress {
                continue;
            }

            let Some((dir, (lx, ly), diff)) = steepest_wet_soil_surface(grid, x, y) else {
                continue;
            };

            let allowance = if is_diagonal(dir) {
                allowance_diag
            } else {
                allowance_orth
            };
            if diff <= allowance {
                continue;
            }

            // Saturated soil flows toward its angle of rest; move half the
            // excess so the hop relaxes rather than overshoots
            let to_move = (diff - allowance) / 2.0;

            let taken = soil::detach(grid, x, y, to_move, ErodibilityKind::Slump, WritePath::InPlace);
            grid.slump_ledger.add_detach(x, y, taken);
            for c in 0..3 {
                out.slump_detach[c] += taken[c];
            }

            if grid.is_wet(lx, ly) {
                for c in 0..3 {
                    grid.add_sed_load(lx, ly, c, taken[c]);
                    *grid.sed_from_slump[c].get_mut(lx, ly) += taken[c];
                    out.slump_to_sed_load[c] += taken[c];
                }
            } else {
                soil::deposit_top_layer(grid, lx, ly, taken, WritePath::InPlace);
                grid.slump_ledger.add_deposit(lx, ly, taken);
                for c in 0..3 {
                    out.slump_deposit[c] += taken[c];
                }
            }

            // The lowered sidewall may leave the cells above too steep
            topple_cascade(grid, params, x, y, &mut out);
        }
    }

    out
}

/// Steepest downhill *wet* soil-surface neighbour, excluding edge cells.
fn steepest_wet_soil_surface(grid: &Grid, x: usize, y: usize) -> Option<(usize, (usize, usize), f64)> {
    let this_elev = grid.soil_surface_elevation(x, y);
    let mut best: Option<(usize, (usize, usize), f64)> = None;
    let mut best_slope = 0.0;

    for dir in 0..8 {
        let Some((nx, ny)) = grid.neighbour(x, y, dir) else {
            continue;
        };
        if grid.is_missing_or_edge(nx, ny) || !grid.is_wet(nx, ny) {
            continue;
        }
        let diff = this_elev - grid.soil_surface_elevation(nx, ny);
        if diff <= 0.0 {
            continue;
        }
        let slope = diff / grid.hop_length(dir);
        if slope > best_slope {
            best_slope = slope;
            best = Some((dir, (nx, ny), diff));
        }
    }

    best
}

/// Topple every unstable cell above a point of slumping, working outward
/// with an explicit queue bounded by the same depth the recursive form had.
fn topple_cascade(grid: &mut Grid, params: &RunParams, x: usize, y: usize, out: &mut SlumpOutcome) {
    let crit_orth = grid.cell_side * params.topple_critical_angle_percent / 100.0;
    let crit_diag = grid.cell_diag * params.topple_critical_angle_percent / 100.0;

    let mut queue: Vec<(usize, usize, usize)> = vec![(x, y, MAX_TOPPLE_DEPTH)];

    while let Some((cx, cy, depth)) = queue.pop() {
        if depth == 0 {
            continue;
        }

        let this_elev = grid.soil_surface_elevation(cx, cy);
        for dir in 0..8 {
            let Some((nx, ny)) = grid.neighbour(cx, cy, dir) else {
                continue;
            };
            // No toppling in edge cells
            if grid.is_missing_or_edge(nx, ny) {
                continue;
            }
            let crit = if is_diagonal(dir) { crit_diag } else { crit_orth };
            let diff = grid.soil_surface_elevation(nx, ny) - this_elev;
            if diff > crit {
                do_topple(grid, params, cx, cy, nx, ny, diff, is_diagonal(dir), out);
                queue.push((nx, ny, depth - 1));
            }
        }
    }
}

/// Move half the excess over the angle of rest from the upslope cell onto
/// the downslope cell.
#[allow(clippy::too_many_arguments)]
fn do_topple(
    grid: &mut Grid,
    params: &RunParams,
    x: usize,
    y: usize,
    ux: usize,
    uy: usize,
    diff: f64,
    diag: bool,
    out: &mut SlumpOutcome,
) {
    let rest = if diag {
        grid.cell_diag * params.topple_angle_of_rest_percent / 100.0
    } else {
        grid.cell_side * params.topple_angle_of_rest_percent / 100.0
    };

    let to_move = (diff - rest) / 2.0;
    if to_move <= 0.0 {
        return;
    }

    let kind = erodibility_kind(params.topple_erodibility);
    let taken = soil::detach(grid, ux, uy, to_move, kind, WritePath::InPlace);
    grid.topple_ledger.add_detach(ux, uy, taken);
    for c in 0..3 {
        out.topple_detach[c] += taken[c];
    }

    if grid.is_wet(x, y) {
        for c in 0..3 {
            grid.add_sed_load(x, y, c, taken[c]);
            *grid.sed_from_topple[c].get_mut(x, y) += taken[c];
            out.topple_to_sed_load[c] += taken[c];
        }
    } else {
        soil::deposit_top_layer(grid, x, y, taken, WritePath::InPlace);
        grid.topple_ledger.add_deposit(x, y, taken);
        for c in 0..3 {
            out.topple_deposit[c] += taken[c];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{flat_dem, test_params};

    #[test]
    fn patch_weights_sum_to_one() {
        for (patch_mm, cell) in [(100.0, 10.0), (35.0, 10.0), (5.0, 10.0)] {
            let patch = ShearPatch::new(patch_mm, cell);
            assert!((patch.total_weight() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn patch_size_is_at_least_one() {
        let patch = ShearPatch::new(1.0, 10.0);
        assert_eq!(patch.size(), 1);
    }

    #[test]
    fn distributed_stress_is_conserved_in_the_interior() {
        let params = test_params(1);
        let mut grid = Grid::new(&flat_dem(20, 20, 100.0), 10.0, &params);
        let patch = ShearPatch::new(50.0, 10.0);
        distribute_shear_stress(&mut grid, &patch, 10, 10, 2.0);
        assert!((grid.shear_stress.sum() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn clipped_stress_is_dropped_at_the_boundary() {
        let params = test_params(1);
        let mut grid = Grid::new(&flat_dem(20, 20, 100.0), 10.0, &params);
        let patch = ShearPatch::new(50.0, 10.0);
        distribute_shear_stress(&mut grid, &patch, 0, 0, 2.0);
        let total = grid.shear_stress.sum();
        assert!(total < 2.0);
        assert!(total > 0.0);
    }

    /// The S5 construction: a 200 mm peak in a 100 mm plain, everything
    /// wet, stress far above threshold.
    fn peak_grid() -> (Grid, RunParams) {
        let mut params = test_params(1);
        params.enable_infiltration = false;
        params.critical_shear_stress = 1.0e-9;
        params.slump_angle_of_rest_percent = 45.0;
        // Keep toppling out of the way for the basic assertions
        params.topple_critical_angle_percent = 1.0e6;

        let mut dem = flat_dem(5, 5, 100.0);
        dem.set(2, 2, 200.0);
        let mut grid = Grid::new(&dem, 10.0, &params);
        for y in 0..5 {
            for x in 0..5 {
                grid.add_surface_water(x, y, 1.0);
            }
        }
        *grid.shear_stress.get_mut(2, 2) += 1.0;
        (grid, params)
    }

    #[test]
    fn slump_moves_half_the_excess_over_angle_of_rest() {
        let (mut grid, params) = peak_grid();
        let out = do_all_slump(&mut grid, &params, 1.0);

        let detached: f64 = out.slump_detach.iter().sum();
        // Excess over the orthogonal angle-of-rest allowance, halved:
        // (100 - 10 * 0.45) / 2
        let expected = (100.0 - 10.0 * 0.45) / 2.0;
        assert!((detached - expected).abs() < 1e-9);

        // Partitioned by the slump erodibilities 0.8/0.6/0.4
        assert!((out.slump_detach[0] - expected * 0.8 / 1.8).abs() < 1e-9);
        assert!((out.slump_detach[1] - expected * 0.6 / 1.8).abs() < 1e-9);
        assert!((out.slump_detach[2] - expected * 0.4 / 1.8).abs() < 1e-9);

        // The receiving neighbour was wet, so everything went to sediment
        // load rather than the soil column
        let to_load: f64 = out.slump_to_sed_load.iter().sum();
        assert!((to_load - expected).abs() < 1e-9);
        assert!((grid.soil_surface_elevation(2, 2) - (200.0 - expected)).abs() < 1e-9);
    }

    #[test]
    fn no_slump_below_threshold() {
        let (mut grid, mut params) = peak_grid();
        params.critical_shear_stress = 1.0e9;
        let out = do_all_slump(&mut grid, &params, 1.0);
        assert_eq!(out.slump_detach.iter().sum::<f64>(), 0.0);
    }

    #[test]
    fn saturation_scales_the_trigger() {
        let (mut grid, mut params) = peak_grid();
        params.enable_infiltration = true;
        // Drain the top layer: stress * 0 never exceeds a positive
        // threshold
        params.critical_shear_stress = 1.0e-3;
        grid.layers[0].soil_water.fill(0.0);
        let out = do_all_slump(&mut grid, &params, 1.0);
        assert_eq!(out.slump_detach.iter().sum::<f64>(), 0.0);
    }

    #[test]
    fn topple_relaxes_an_oversteepened_wall() {
        let mut params = test_params(2);
        params.enable_infiltration = false;
        params.critical_shear_stress = 1.0e-9;
        params.slump_angle_of_rest_percent = 45.0;
        params.topple_critical_angle_percent = 100.0; // 45 degrees
        params.topple_angle_of_rest_percent = 45.0;

        // A 7x7 plot: the cell at (2,3) slumps toward its lower neighbour,
        // and the tall column at (3,3) beside it is left oversteepened
        let mut dem = flat_dem(7, 7, 200.0);
        dem.set(2, 3, 250.0);
        dem.set(3, 3, 400.0);
        let mut grid = Grid::new(&dem, 10.0, &params);
        for y in 0..7 {
            for x in 0..7 {
                grid.add_surface_water(x, y, 1.0);
            }
        }
        *grid.shear_stress.get_mut(2, 3) += 1.0;

        let out = do_all_slump(&mut grid, &params, 1.0);
        // The column at (3,3) is > 100% slope above its neighbours, so the
        // cascade must have toppled some of it
        assert!(out.topple_detach.iter().sum::<f64>() > 0.0);
        assert!(grid.soil_surface_elevation(3, 3) < 400.0);
    }
}
