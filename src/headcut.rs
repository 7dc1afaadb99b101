//! Headcut retreat: upslope propagation of an erosional step.
//!
//! Flow detachment banks retreat debt in the stored-retreat scalar opposite
//! the flow direction. Once a direction's debt exceeds the hop length, soil
//! moves between the cell and its upstream neighbour: normally from the
//! higher upstream cell down onto this one, or the other way round when the
//! "upstream" cell is in fact lower (a watershed boundary).

use crate::grid::{Grid, SEDIMENT_TOLERANCE};
use crate::numerics::fp_eq;
use crate::params::{ErodibilitySource, RunParams};
use crate::soil::{self, ErodibilityKind, WritePath};

/// Plot totals from one headcut-retreat pass, per size class.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeadcutOutcome {
    pub detach: [f64; 3],
    pub deposit: [f64; 3],
    pub to_sed_load: [f64; 3],
    pub events: usize,
}

/// Check every interior cell for pending retreat events and fire them.
pub fn do_all_headcut_retreat(grid: &mut Grid, params: &RunParams) -> HeadcutOutcome {
    let mut out = HeadcutOutcome::default();

    for y in 0..grid.ny {
        for x in 0..grid.nx {
            // Never retreat on missing or edge cells
            if grid.is_missing_or_edge(x, y) {
                continue;
            }

            for dir in 0..8 {
                let hop = grid.hop_length(dir);
                if *grid.stored_retreat[dir].get(x, y) < hop {
                    continue;
                }

                // The upstream cell lies in the stored direction; interior
                // cells always have it on the grid, but it may be missing
                // on an irregular plot
                let Some((ux, uy)) = grid.neighbour(x, y, dir) else {
                    continue;
                };
                if grid.is_missing(ux, uy) {
                    continue;
                }

                let this_elev = grid.soil_surface_elevation(x, y);
                let up_elev = grid.soil_surface_elevation(ux, uy);
                let elev_diff = up_elev - this_elev;

                // A vanishing difference is left for a later iteration; the
                // upstream elevation may change in the meantime
                if fp_eq(elev_diff, 0.0, SEDIMENT_TOLERANCE) {
                    continue;
                }

                if elev_diff < 0.0 {
                    // Watershed boundary: this cell is the higher one
                    move_soil(grid, params, dir, (x, y), (ux, uy), -elev_diff, &mut out);
                } else {
                    move_soil(grid, params, dir, (ux, uy), (x, y), elev_diff, &mut out);
                }

                grid.has_retreated.set(x, y, true);
                out.events += 1;
            }
        }
    }

    out
}

/// Move half the elevation difference from one cell to the other and reset
/// both cells' stored retreat in that direction.
fn move_soil(
    grid: &mut Grid,
    params: &RunParams,
    dir: usize,
    from: (usize, usize),
    to: (usize, usize),
    diff: f64,
    out: &mut HeadcutOutcome,
) {
    let half = diff * 0.5;

    let kind = match params.headcut_erodibility {
        ErodibilitySource::Slump => ErodibilityKind::Slump,
        ErodibilitySource::Flow => ErodibilityKind::Flow,
    };
    let taken = soil::detach(grid, from.0, from.1, half, kind, WritePath::InPlace);
    grid.headcut_ledger.add_detach(from.0, from.1, taken);
    for c in 0..3 {
        out.detach[c] += taken[c];
    }

    if grid.is_wet(to.0, to.1) {
        for c in 0..3 {
            grid.add_sed_load(to.0, to.1, c, taken[c]);
            *grid.sed_from_headcut[c].get_mut(to.0, to.1) += taken[c];
            out.to_sed_load[c] += taken[c];
        }
    } else {
        soil::deposit_top_layer(grid, to.0, to.1, taken, WritePath::InPlace);
        grid.headcut_ledger.add_deposit(to.0, to.1, taken);
        for c in 0..3 {
            out.deposit[c] += taken[c];
        }
    }

    grid.stored_retreat[dir].set(from.0, from.1, 0.0);
    grid.stored_retreat[dir].set(to.0, to.1, 0.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Raster;
    use crate::testutil::{flat_dem, test_params};

    /// A 5x5 plot stepping down to the south; cell (2,2) has banked a full
    /// cell of retreat debt pointing north (upstream).
    fn stepped_grid() -> (Grid, RunParams) {
        let params = test_params(1);
        let mut dem = Raster::new(5, 5);
        for y in 0..5 {
            for x in 0..5 {
                dem.set(x, y, 150.0 - 10.0 * y as f64);
            }
        }
        let mut grid = Grid::new(&dem, 10.0, &params);
        grid.stored_retreat[crate::grid::DIR_TOP].set(2, 2, 10.0);
        (grid, params)
    }

    #[test]
    fn retreat_fires_once_debt_reaches_hop_length() {
        let (mut grid, params) = stepped_grid();
        let up_before = grid.soil_surface_elevation(2, 1);
        let this_before = grid.soil_surface_elevation(2, 2);

        let out = do_all_headcut_retreat(&mut grid, &params);
        assert_eq!(out.events, 1);

        // Half of the 10 mm step moved from the upstream cell to this one
        let moved: f64 = out.detach.iter().sum();
        assert!((moved - 5.0).abs() < 1e-9);
        assert!((grid.soil_surface_elevation(2, 1) - (up_before - 5.0)).abs() < 1e-9);
        assert!((grid.soil_surface_elevation(2, 2) - (this_before + 5.0)).abs() < 1e-9);

        // Both stored values reset, destination flagged
        assert_eq!(*grid.stored_retreat[crate::grid::DIR_TOP].get(2, 2), 0.0);
        assert_eq!(*grid.stored_retreat[crate::grid::DIR_TOP].get(2, 1), 0.0);
        assert!(*grid.has_retreated.get(2, 2));
    }

    #[test]
    fn no_event_below_the_hop_length() {
        let (mut grid, params) = stepped_grid();
        grid.stored_retreat[crate::grid::DIR_TOP].set(2, 2, 9.99);
        let out = do_all_headcut_retreat(&mut grid, &params);
        assert_eq!(out.events, 0);
    }

    #[test]
    fn diagonal_debt_needs_the_longer_hop() {
        let (mut grid, params) = stepped_grid();
        grid.stored_retreat[crate::grid::DIR_TOP].set(2, 2, 0.0);
        // Direction 1 (top-right) is diagonal: 10 mm is not enough
        grid.stored_retreat[1].set(2, 2, 10.0);
        let out = do_all_headcut_retreat(&mut grid, &params);
        assert_eq!(out.events, 0);

        grid.stored_retreat[1].set(2, 2, 15.0);
        let out = do_all_headcut_retreat(&mut grid, &params);
        assert_eq!(out.events, 1);
    }

    #[test]
    fn wet_destination_receives_sediment_load() {
        let (mut grid, params) = stepped_grid();
        grid.add_surface_water(2, 2, 1.0);
        let out = do_all_headcut_retreat(&mut grid, &params);
        assert!(out.to_sed_load.iter().sum::<f64>() > 0.0);
        assert_eq!(out.deposit.iter().sum::<f64>(), 0.0);
        assert!(grid.sed_load_total(2, 2) > 0.0);
    }

    #[test]
    fn watershed_boundary_moves_soil_the_other_way() {
        let (mut grid, params) = stepped_grid();
        // Point the debt south, where the neighbour is LOWER than this cell
        grid.stored_retreat[crate::grid::DIR_TOP].set(2, 2, 0.0);
        grid.stored_retreat[crate::grid::DIR_BOTTOM].set(2, 2, 10.0);

        let this_before = grid.soil_surface_elevation(2, 2);
        let down_before = grid.soil_surface_elevation(2, 3);

        let out = do_all_headcut_retreat(&mut grid, &params);
        assert_eq!(out.events, 1);
        // This cell is the higher one, so it loses soil to the neighbour
        assert!(grid.soil_surface_elevation(2, 2) < this_before);
        assert!(grid.soil_surface_elevation(2, 3) > down_before);
    }

    #[test]
    fn near_zero_difference_keeps_the_debt() {
        let params = test_params(1);
        let mut grid = Grid::new(&flat_dem(5, 5, 100.0), 10.0, &params);
        grid.stored_retreat[crate::grid::DIR_TOP].set(2, 2, 10.0);
        let out = do_all_headcut_retreat(&mut grid, &params);
        assert_eq!(out.events, 0);
        assert_eq!(*grid.stored_retreat[crate::grid::DIR_TOP].get(2, 2), 10.0);
    }
}
