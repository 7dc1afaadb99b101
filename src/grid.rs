//! Grid state for the simulation.
//!
//! The per-cell state is stored struct-of-arrays: one dense raster per
//! scalar field, all sharing the grid dimensions. Kernels are free
//! functions that take the grid and cell coordinates; there are no
//! back-pointers from sub-state to cell. Elevation is never stored
//! directly: the soil surface is always basement plus the sum of layer
//! thicknesses, and the top surface adds the water depth.

use crate::params::{RunParams, SoilLayerParams};
use crate::raster::Raster;

/// Depths smaller than this (mm) are not worth moving.
pub const WATER_TOLERANCE: f64 = 1.0e-6;
/// Tolerance for "the detachment request has been met" comparisons (mm).
pub const SEDIMENT_TOLERANCE: f64 = 1.0e-6;
/// Tolerance for zero-thickness layer checks (mm).
pub const THICKNESS_TOLERANCE: f64 = 1.0e-10;
/// Bound on the topple cascade.
pub const MAX_TOPPLE_DEPTH: usize = 100;

/// Compass directions, clockwise from north; odd values are diagonals.
pub const DX: [i32; 8] = [0, 1, 1, 1, 0, -1, -1, -1];
pub const DY: [i32; 8] = [-1, -1, 0, 1, 1, 1, 0, -1];

pub const DIR_TOP: usize = 0;
pub const DIR_RIGHT: usize = 2;
pub const DIR_BOTTOM: usize = 4;
pub const DIR_LEFT: usize = 6;
/// Sentinel for "no flow direction this iteration".
pub const DIR_NONE: u8 = 8;

#[inline]
pub fn is_diagonal(dir: usize) -> bool {
    dir % 2 == 1
}

#[inline]
pub fn opposite(dir: usize) -> usize {
    (dir + 4) % 8
}

/// Sides of the plot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    Top = 0,
    Right = 1,
    Bottom = 2,
    Left = 3,
}

pub const EDGES: [Edge; 4] = [Edge::Top, Edge::Right, Edge::Bottom, Edge::Left];
/// Edge raster sentinel for interior cells.
pub const EDGE_NONE: u8 = 4;

/// Sediment size classes; used to index the per-class arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeClass {
    Clay = 0,
    Silt = 1,
    Sand = 2,
}

pub const SIZE_CLASSES: [SizeClass; 3] = [SizeClass::Clay, SizeClass::Silt, SizeClass::Sand];

/// Lawrence inundation regimes, plus "dry".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inundation {
    Dry = 0,
    Shallow = 1,
    Marginal = 2,
    Deep = 3,
}

/// One soil layer: uniform properties plus per-cell state sheets.
pub struct SoilLayer {
    pub name: String,
    /// Bulk density (kg/m3)
    pub bulk_density: f64,
    /// [clay, silt, sand]
    pub flow_erodibility: [f64; 3],
    pub splash_erodibility: [f64; 3],
    pub slump_erodibility: [f64; 3],

    // Green-Ampt properties and precomputed terms
    pub ga_theta_sat: f64,
    pub ga_theta_init: f64,
    pub ga_k_sat: f64,
    /// Capillary pressure head at the wetting front: nu_ga * psi_air /
    /// (nu_ga - 1) with nu_ga = 2 + 3 lambda
    pub ga_cphwf: f64,
    /// (theta_sat - theta_init) / K_sat
    pub ga_chi_part: f64,

    /// Per-class thickness (mm), the committed field
    pub thickness: [Raster<f64>; 3],
    /// Per-class staged thickness, used by flow erosion within an iteration
    pub staged: [Raster<f64>; 3],
    /// Soil water depth equivalent (mm)
    pub soil_water: Raster<f64>,
}

impl SoilLayer {
    fn from_params(p: &SoilLayerParams, nx: usize, ny: usize) -> Self {
        let nu_ga = 2.0 + 3.0 * p.ga_lambda;
        Self {
            name: p.name.clone(),
            bulk_density: p.bulk_density,
            flow_erodibility: p.flow_erodibility,
            splash_erodibility: p.splash_erodibility,
            slump_erodibility: p.slump_erodibility,
            ga_theta_sat: p.ga_theta_sat,
            ga_theta_init: p.ga_theta_init,
            ga_k_sat: p.ga_k_sat,
            ga_cphwf: nu_ga * p.ga_air_head / (nu_ga - 1.0),
            ga_chi_part: (p.ga_theta_sat - p.ga_theta_init) / p.ga_k_sat,
            thickness: [Raster::new(nx, ny), Raster::new(nx, ny), Raster::new(nx, ny)],
            staged: [Raster::new(nx, ny), Raster::new(nx, ny), Raster::new(nx, ny)],
            soil_water: Raster::new(nx, ny),
        }
    }

    /// Total thickness (mm) of this layer at a cell.
    #[inline]
    pub fn layer_thickness(&self, x: usize, y: usize) -> f64 {
        self.thickness[0].get(x, y) + self.thickness[1].get(x, y) + self.thickness[2].get(x, y)
    }

    /// Saturated (maximum) soil water depth equivalent (mm) at a cell.
    #[inline]
    pub fn max_soil_water(&self, x: usize, y: usize) -> f64 {
        self.ga_theta_sat * self.layer_thickness(x, y)
    }
}

/// Per-cell detach/deposit bookkeeping for one process, this-iteration and
/// cumulative, per size class.
pub struct ProcessLedger {
    pub detach: [Raster<f64>; 3],
    pub cumul_detach: [Raster<f64>; 3],
    pub deposit: [Raster<f64>; 3],
    pub cumul_deposit: [Raster<f64>; 3],
}

impl ProcessLedger {
    fn new(nx: usize, ny: usize) -> Self {
        Self {
            detach: [Raster::new(nx, ny), Raster::new(nx, ny), Raster::new(nx, ny)],
            cumul_detach: [Raster::new(nx, ny), Raster::new(nx, ny), Raster::new(nx, ny)],
            deposit: [Raster::new(nx, ny), Raster::new(nx, ny), Raster::new(nx, ny)],
            cumul_deposit: [Raster::new(nx, ny), Raster::new(nx, ny), Raster::new(nx, ny)],
        }
    }

    pub fn add_detach(&mut self, x: usize, y: usize, amounts: [f64; 3]) {
        for c in 0..3 {
            *self.detach[c].get_mut(x, y) += amounts[c];
            *self.cumul_detach[c].get_mut(x, y) += amounts[c];
        }
    }

    pub fn add_deposit(&mut self, x: usize, y: usize, amounts: [f64; 3]) {
        for c in 0..3 {
            *self.deposit[c].get_mut(x, y) += amounts[c];
            *self.cumul_deposit[c].get_mut(x, y) += amounts[c];
        }
    }

    pub fn zero_this_iter(&mut self) {
        for c in 0..3 {
            self.detach[c].fill(0.0);
            self.deposit[c].fill(0.0);
        }
    }

    /// This-iteration detachment total over the plot (all classes).
    pub fn detach_total(&self) -> f64 {
        self.detach.iter().map(|r| r.sum()).sum()
    }

    /// This-iteration deposition total over the plot (all classes).
    pub fn deposit_total(&self) -> f64 {
        self.deposit.iter().map(|r| r.sum()).sum()
    }
}

/// The whole grid state.
pub struct Grid {
    pub nx: usize,
    pub ny: usize,
    /// Cell side (mm); cells are square
    pub cell_side: f64,
    pub cell_diag: f64,
    pub cell_area: f64,
    pub n_active_cells: usize,

    pub missing: Raster<bool>,
    /// Edge side of each cell (EDGE_NONE for interior cells)
    pub edge: Raster<u8>,
    pub basement: Raster<f64>,
    /// Soil-surface elevation at setup, for net-change reporting
    pub init_elev: Raster<f64>,

    /// Soil layers, top first
    pub layers: Vec<SoilLayer>,

    // ---- surface water ----
    pub water_depth: Raster<f64>,
    pub cumul_water_depth: Raster<f64>,
    /// Off-edge water this iteration (edge cells only)
    pub water_lost: Raster<f64>,
    pub cumul_water_lost: Raster<f64>,
    pub stream_power: Raster<f64>,
    pub transport_capacity: Raster<f64>,
    pub friction_factor: Raster<f64>,
    pub flow_dir: Raster<u8>,
    pub inundation: Raster<u8>,
    pub vel_x: Raster<f64>,
    pub vel_y: Raster<f64>,
    pub dw_vel_x: Raster<f64>,
    pub dw_vel_y: Raster<f64>,
    /// Time-weighted cumulative velocity vectors (mm, i.e. mm/s * s)
    pub cumul_vel_x: Raster<f64>,
    pub cumul_vel_y: Raster<f64>,
    pub cumul_dw_vel_x: Raster<f64>,
    pub cumul_dw_vel_y: Raster<f64>,

    // ---- rain and run-on ----
    pub rain: Raster<f64>,
    pub cumul_rain: Raster<f64>,
    pub runon: Raster<f64>,
    pub cumul_runon: Raster<f64>,
    pub rain_var: Raster<f64>,

    // ---- suspended sediment ----
    pub sed_load: [Raster<f64>; 3],
    pub cumul_sed_load: [Raster<f64>; 3],
    /// Most recent contributions per originating process
    pub sed_from_splash: [Raster<f64>; 3],
    pub sed_from_slump: [Raster<f64>; 3],
    pub sed_from_topple: [Raster<f64>; 3],
    pub sed_from_headcut: [Raster<f64>; 3],
    /// Sediment removed from the load to deposit, this iteration
    pub sed_removed: [Raster<f64>; 3],
    /// Sediment carried off the edge via this cell, this iteration
    pub sed_off_edge: [Raster<f64>; 3],
    pub cumul_sed_off_edge: [Raster<f64>; 3],

    // ---- process ledgers ----
    pub flow_ledger: ProcessLedger,
    pub splash_ledger: ProcessLedger,
    pub slump_ledger: ProcessLedger,
    pub topple_ledger: ProcessLedger,
    pub headcut_ledger: ProcessLedger,
    /// Deposit-only: suspended load written to the top layer on dry-out
    pub infilt_deposit: [Raster<f64>; 3],
    pub cumul_infilt_deposit: [Raster<f64>; 3],
    /// Soil splashed off the plot via edge cells, this iteration
    pub splash_off_edge: [Raster<f64>; 3],
    pub cumul_splash_off_edge: [Raster<f64>; 3],

    // ---- infiltration ----
    pub infilt: Raster<f64>,
    pub cumul_infilt: Raster<f64>,
    pub exfilt: Raster<f64>,
    pub cumul_exfilt: Raster<f64>,

    // ---- mass movement ----
    pub shear_stress: Raster<f64>,
    pub cumul_shear_stress: Raster<f64>,

    // ---- headcut retreat ----
    /// Accumulated retreat debt (mm) per compass direction
    pub stored_retreat: [Raster<f64>; 8],
    pub has_retreated: Raster<bool>,

    // ---- splash scratch ----
    pub splash_temp_deposit: Raster<f64>,
    pub laplacian: Raster<f64>,
    /// Rain KE (J) per cell since the last splash pass
    pub splash_ke: Raster<f64>,
}

fn three(nx: usize, ny: usize) -> [Raster<f64>; 3] {
    [Raster::new(nx, ny), Raster::new(nx, ny), Raster::new(nx, ny)]
}

impl Grid {
    /// Build the grid from a DEM (soil-surface elevations in mm, NaN for
    /// missing cells) and the configured soil layers.
    pub fn new(dem: &Raster<f64>, cell_side: f64, params: &RunParams) -> Self {
        let (nx, ny) = (dem.width, dem.height);

        let mut missing = Raster::new_with(nx, ny, false);
        let mut n_active = 0usize;
        for (x, y, &z) in dem.iter() {
            if z.is_nan() {
                missing.set(x, y, true);
            } else {
                n_active += 1;
            }
        }

        let mut grid = Self {
            nx,
            ny,
            cell_side,
            cell_diag: cell_side * std::f64::consts::SQRT_2,
            cell_area: cell_side * cell_side,
            n_active_cells: n_active,
            missing,
            edge: Raster::new_with(nx, ny, EDGE_NONE),
            basement: Raster::new(nx, ny),
            init_elev: Raster::new(nx, ny),
            layers: params
                .layers
                .iter()
                .map(|p| SoilLayer::from_params(p, nx, ny))
                .collect(),
            water_depth: Raster::new(nx, ny),
            cumul_water_depth: Raster::new(nx, ny),
            water_lost: Raster::new(nx, ny),
            cumul_water_lost: Raster::new(nx, ny),
            stream_power: Raster::new(nx, ny),
            transport_capacity: Raster::new(nx, ny),
            friction_factor: Raster::new(nx, ny),
            flow_dir: Raster::new_with(nx, ny, DIR_NONE),
            inundation: Raster::new(nx, ny),
            vel_x: Raster::new(nx, ny),
            vel_y: Raster::new(nx, ny),
            dw_vel_x: Raster::new(nx, ny),
            dw_vel_y: Raster::new(nx, ny),
            cumul_vel_x: Raster::new(nx, ny),
            cumul_vel_y: Raster::new(nx, ny),
            cumul_dw_vel_x: Raster::new(nx, ny),
            cumul_dw_vel_y: Raster::new(nx, ny),
            rain: Raster::new(nx, ny),
            cumul_rain: Raster::new(nx, ny),
            runon: Raster::new(nx, ny),
            cumul_runon: Raster::new(nx, ny),
            rain_var: Raster::new_with(nx, ny, 1.0),
            sed_load: three(nx, ny),
            cumul_sed_load: three(nx, ny),
            sed_from_splash: three(nx, ny),
            sed_from_slump: three(nx, ny),
            sed_from_topple: three(nx, ny),
            sed_from_headcut: three(nx, ny),
            sed_removed: three(nx, ny),
            sed_off_edge: three(nx, ny),
            cumul_sed_off_edge: three(nx, ny),
            flow_ledger: ProcessLedger::new(nx, ny),
            splash_ledger: ProcessLedger::new(nx, ny),
            slump_ledger: ProcessLedger::new(nx, ny),
            topple_ledger: ProcessLedger::new(nx, ny),
            headcut_ledger: ProcessLedger::new(nx, ny),
            infilt_deposit: three(nx, ny),
            cumul_infilt_deposit: three(nx, ny),
            splash_off_edge: three(nx, ny),
            cumul_splash_off_edge: three(nx, ny),
            infilt: Raster::new(nx, ny),
            cumul_infilt: Raster::new(nx, ny),
            exfilt: Raster::new(nx, ny),
            cumul_exfilt: Raster::new(nx, ny),
            shear_stress: Raster::new(nx, ny),
            cumul_shear_stress: Raster::new(nx, ny),
            stored_retreat: [
                Raster::new(nx, ny),
                Raster::new(nx, ny),
                Raster::new(nx, ny),
                Raster::new(nx, ny),
                Raster::new(nx, ny),
                Raster::new(nx, ny),
                Raster::new(nx, ny),
                Raster::new(nx, ny),
            ],
            has_retreated: Raster::new_with(nx, ny, false),
            splash_temp_deposit: Raster::new(nx, ny),
            laplacian: Raster::new(nx, ny),
            splash_ke: Raster::new(nx, ny),
        };

        grid.build_soil_columns(dem, params);
        grid.mark_edge_cells();
        grid.init_soil_water();
        grid
    }

    /// Distribute each cell's soil depth into the configured layers and set
    /// the basement.
    ///
    /// With a configured basement elevation the top layer absorbs whatever
    /// remains above the deeper layers; otherwise the basement simply sits
    /// below the configured column and follows the terrain.
    fn build_soil_columns(&mut self, dem: &Raster<f64>, params: &RunParams) {
        let lower_sum: f64 = params.layers.iter().skip(1).map(|l| l.thickness).sum();

        for y in 0..self.ny {
            for x in 0..self.nx {
                if *self.missing.get(x, y) {
                    continue;
                }
                let surface = *dem.get(x, y);
                self.init_elev.set(x, y, surface);

                let (basement, top_thickness) = match params.basement_elevation {
                    Some(b) => (b, (surface - b - lower_sum).max(0.0)),
                    None => {
                        let total: f64 = params.layers.iter().map(|l| l.thickness).sum();
                        (surface - total, params.layers[0].thickness)
                    }
                };
                self.basement.set(x, y, basement);

                for (i, lp) in params.layers.iter().enumerate() {
                    let thickness = if i == 0 { top_thickness } else { lp.thickness };
                    let layer = &mut self.layers[i];
                    layer.thickness[0].set(x, y, thickness * lp.percent_clay / 100.0);
                    layer.thickness[1].set(x, y, thickness * lp.percent_silt / 100.0);
                    layer.thickness[2].set(x, y, thickness * lp.percent_sand / 100.0);
                }
            }
        }
    }

    /// Flag each active cell that sits on the plot boundary with the side
    /// it faces: grid perimeter first, then orthogonal adjacency to a
    /// missing cell (irregular plot shapes).
    fn mark_edge_cells(&mut self) {
        for y in 0..self.ny {
            for x in 0..self.nx {
                if *self.missing.get(x, y) {
                    continue;
                }

                let side = if y == 0 {
                    Some(Edge::Top)
                } else if x == self.nx - 1 {
                    Some(Edge::Right)
                } else if y == self.ny - 1 {
                    Some(Edge::Bottom)
                } else if x == 0 {
                    Some(Edge::Left)
                } else if *self.missing.get(x, y - 1) {
                    Some(Edge::Top)
                } else if *self.missing.get(x + 1, y) {
                    Some(Edge::Right)
                } else if *self.missing.get(x, y + 1) {
                    Some(Edge::Bottom)
                } else if *self.missing.get(x - 1, y) {
                    Some(Edge::Left)
                } else {
                    None
                };

                if let Some(side) = side {
                    self.edge.set(x, y, side as u8);
                }
            }
        }
    }

    /// Set every layer's initial soil water from theta_init.
    fn init_soil_water(&mut self) {
        for i in 0..self.layers.len() {
            for y in 0..self.ny {
                for x in 0..self.nx {
                    if *self.missing.get(x, y) {
                        continue;
                    }
                    let initial = self.layers[i].ga_theta_init * self.layers[i].layer_thickness(x, y);
                    self.layers[i].soil_water.set(x, y, initial);
                }
            }
        }
    }

    // =========================================================================
    // Geometry and flags
    // =========================================================================

    #[inline]
    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.nx && (y as usize) < self.ny
    }

    /// Neighbour coordinate in a compass direction, if on the grid.
    #[inline]
    pub fn neighbour(&self, x: usize, y: usize, dir: usize) -> Option<(usize, usize)> {
        let nx = x as i32 + DX[dir];
        let ny = y as i32 + DY[dir];
        if self.in_bounds(nx, ny) {
            Some((nx as usize, ny as usize))
        } else {
            None
        }
    }

    #[inline]
    pub fn is_missing(&self, x: usize, y: usize) -> bool {
        *self.missing.get(x, y)
    }

    #[inline]
    pub fn is_edge(&self, x: usize, y: usize) -> bool {
        *self.edge.get(x, y) != EDGE_NONE
    }

    #[inline]
    pub fn is_missing_or_edge(&self, x: usize, y: usize) -> bool {
        self.is_missing(x, y) || self.is_edge(x, y)
    }

    /// Hop length (mm) for a compass direction.
    #[inline]
    pub fn hop_length(&self, dir: usize) -> f64 {
        if is_diagonal(dir) {
            self.cell_diag
        } else {
            self.cell_side
        }
    }

    // =========================================================================
    // Elevations
    // =========================================================================

    /// Soil surface = basement + committed layer thicknesses.
    pub fn soil_surface_elevation(&self, x: usize, y: usize) -> f64 {
        let mut elev = *self.basement.get(x, y);
        for layer in &self.layers {
            elev += layer.layer_thickness(x, y);
        }
        elev
    }

    /// Top surface = soil surface + surface water depth.
    pub fn top_elevation(&self, x: usize, y: usize) -> f64 {
        self.soil_surface_elevation(x, y) + self.water_depth.get(x, y)
    }

    // =========================================================================
    // Surface water
    // =========================================================================

    #[inline]
    pub fn is_wet(&self, x: usize, y: usize) -> bool {
        *self.water_depth.get(x, y) > 0.0
    }

    pub fn add_surface_water(&mut self, x: usize, y: usize, depth: f64) {
        *self.water_depth.get_mut(x, y) += depth;
    }

    /// Remove up to `depth` of surface water; returns the depth actually
    /// removed. Removing the last of the water zeroes the velocities.
    pub fn remove_surface_water(&mut self, x: usize, y: usize, depth: f64) -> f64 {
        let current = *self.water_depth.get(x, y);
        if depth >= current {
            self.water_depth.set(x, y, 0.0);
            self.zero_velocities(x, y);
            current
        } else {
            self.water_depth.set(x, y, current - depth);
            depth
        }
    }

    pub fn zero_velocities(&mut self, x: usize, y: usize) {
        self.vel_x.set(x, y, 0.0);
        self.vel_y.set(x, y, 0.0);
        self.dw_vel_x.set(x, y, 0.0);
        self.dw_vel_y.set(x, y, 0.0);
    }

    /// Scalar flow speed (mm/s).
    pub fn flow_speed(&self, x: usize, y: usize) -> f64 {
        let vx = *self.vel_x.get(x, y);
        let vy = *self.vel_y.get(x, y);
        (vx * vx + vy * vy).sqrt()
    }

    // =========================================================================
    // Suspended sediment
    // =========================================================================

    pub fn sed_load_total(&self, x: usize, y: usize) -> f64 {
        self.sed_load[0].get(x, y) + self.sed_load[1].get(x, y) + self.sed_load[2].get(x, y)
    }

    pub fn add_sed_load(&mut self, x: usize, y: usize, class: usize, depth: f64) {
        if depth > 0.0 {
            *self.sed_load[class].get_mut(x, y) += depth;
            *self.cumul_sed_load[class].get_mut(x, y) += depth;
        }
    }

    /// Remove up to `depth` of one class from the load; returns the depth
    /// actually removed.
    pub fn remove_sed_load(&mut self, x: usize, y: usize, class: usize, depth: f64) -> f64 {
        let current = *self.sed_load[class].get(x, y);
        let removed = depth.min(current);
        if removed > 0.0 {
            *self.sed_load[class].get_mut(x, y) -= removed;
            *self.cumul_sed_load[class].get_mut(x, y) -= removed;
        }
        removed
    }

    /// Zero the suspended load (used when a dry cell first wets up).
    pub fn zero_sed_load(&mut self, x: usize, y: usize) {
        for c in 0..3 {
            self.sed_load[c].set(x, y, 0.0);
        }
    }

    /// Sediment concentration in per cent of the water column.
    pub fn sed_concentration(&self, x: usize, y: usize) -> f64 {
        let depth = *self.water_depth.get(x, y);
        if depth == 0.0 {
            return 0.0;
        }
        100.0 * self.sed_load_total(x, y) / depth
    }

    // =========================================================================
    // Plot-wide totals (used by the mass-balance ledger and tests)
    // =========================================================================

    pub fn total_surface_water(&self) -> f64 {
        let mut total = 0.0;
        for (x, y, &d) in self.water_depth.iter() {
            if !*self.missing.get(x, y) {
                total += d;
            }
        }
        total
    }

    pub fn total_soil_water(&self) -> f64 {
        let mut total = 0.0;
        for layer in &self.layers {
            for (x, y, &w) in layer.soil_water.iter() {
                if !*self.missing.get(x, y) {
                    total += w;
                }
            }
        }
        total
    }

    pub fn total_sed_load(&self, class: usize) -> f64 {
        let mut total = 0.0;
        for (x, y, &d) in self.sed_load[class].iter() {
            if !*self.missing.get(x, y) {
                total += d;
            }
        }
        total
    }

    /// Total committed soil thickness of one size class over the plot (mm).
    pub fn total_soil_thickness(&self, class: usize) -> f64 {
        let mut total = 0.0;
        for layer in &self.layers {
            for (x, y, &t) in layer.thickness[class].iter() {
                if !*self.missing.get(x, y) {
                    total += t;
                }
            }
        }
        total
    }

    /// Maximum flow speed over the wet plot (mm/s).
    pub fn max_flow_speed(&self) -> f64 {
        let mut max = 0.0;
        for y in 0..self.ny {
            for x in 0..self.nx {
                if !self.is_missing(x, y) {
                    let v = self.flow_speed(x, y);
                    if v > max {
                        max = v;
                    }
                }
            }
        }
        max
    }

    pub fn count_wet_cells(&self) -> usize {
        let mut n = 0;
        for y in 0..self.ny {
            for x in 0..self.nx {
                if !self.is_missing(x, y) && self.is_wet(x, y) {
                    n += 1;
                }
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{flat_dem, test_params};

    #[test]
    fn elevation_is_basement_plus_layers() {
        let params = test_params(2);
        let grid = Grid::new(&flat_dem(4, 4, 500.0), 10.0, &params);
        // Two 100 mm layers below a 500 mm surface: basement at 300
        assert!((grid.soil_surface_elevation(1, 1) - 500.0).abs() < 1e-9);
        assert!((*grid.basement.get(1, 1) - 300.0).abs() < 1e-9);
    }

    #[test]
    fn top_elevation_adds_water() {
        let params = test_params(1);
        let mut grid = Grid::new(&flat_dem(3, 3, 100.0), 10.0, &params);
        grid.add_surface_water(1, 1, 2.5);
        assert!((grid.top_elevation(1, 1) - 102.5).abs() < 1e-9);
    }

    #[test]
    fn edge_marking_on_regular_plot() {
        let params = test_params(1);
        let grid = Grid::new(&flat_dem(5, 5, 100.0), 10.0, &params);
        assert_eq!(*grid.edge.get(2, 0), Edge::Top as u8);
        assert_eq!(*grid.edge.get(4, 2), Edge::Right as u8);
        assert_eq!(*grid.edge.get(2, 4), Edge::Bottom as u8);
        assert_eq!(*grid.edge.get(0, 2), Edge::Left as u8);
        assert_eq!(*grid.edge.get(2, 2), EDGE_NONE);
    }

    #[test]
    fn missing_cells_make_their_neighbours_edges() {
        let params = test_params(1);
        let mut dem = flat_dem(5, 5, 100.0);
        dem.set(2, 2, f64::NAN);
        let grid = Grid::new(&dem, 10.0, &params);
        assert!(grid.is_missing(2, 2));
        assert!(grid.is_edge(2, 1));
        assert!(grid.is_edge(1, 2));
        assert_eq!(grid.n_active_cells, 24);
    }

    #[test]
    fn remove_surface_water_clamps_and_reports() {
        let params = test_params(1);
        let mut grid = Grid::new(&flat_dem(3, 3, 100.0), 10.0, &params);
        grid.add_surface_water(0, 0, 1.0);
        assert_eq!(grid.remove_surface_water(0, 0, 0.4), 0.4);
        assert_eq!(grid.remove_surface_water(0, 0, 2.0), 0.6);
        assert!(!grid.is_wet(0, 0));
    }

    #[test]
    fn sed_load_remove_clamps() {
        let params = test_params(1);
        let mut grid = Grid::new(&flat_dem(3, 3, 100.0), 10.0, &params);
        grid.add_sed_load(1, 1, SizeClass::Silt as usize, 0.2);
        let removed = grid.remove_sed_load(1, 1, SizeClass::Silt as usize, 0.5);
        assert!((removed - 0.2).abs() < 1e-12);
        assert_eq!(grid.sed_load_total(1, 1), 0.0);
    }

    #[test]
    fn opposite_and_diagonal_helpers() {
        assert_eq!(opposite(DIR_TOP), DIR_BOTTOM);
        assert_eq!(opposite(1), 5);
        assert!(is_diagonal(1));
        assert!(!is_diagonal(DIR_LEFT));
    }

    #[test]
    fn soil_water_initialised_from_theta_init() {
        let params = test_params(1);
        let grid = Grid::new(&flat_dem(3, 3, 100.0), 10.0, &params);
        // 100 mm layer at theta_init 0.2 -> 20 mm depth equivalent
        assert!((*grid.layers[0].soil_water.get(1, 1) - 20.0).abs() < 1e-9);
    }
}
