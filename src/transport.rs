//! Transport capacity, flow detachment, and flow deposition.
//!
//! Capacity follows Nearing et al. (1997): the unit sediment load is an
//! empirical log-linear function of stream power, worked in cgs units and
//! converted to a depth equivalent through the bulk density of the topmost
//! non-empty soil layer. When the suspended load exceeds capacity the
//! surplus settles out at the Cheng fall speeds; otherwise the hop detaches
//! soil at the probabilistic Nearing (1991) rate.

use crate::flow::FlowCtx;
use crate::grid::{opposite, Grid};
use crate::numerics::gauss_cdf;
use crate::slump;
use crate::soil::{self, ErodibilityKind, WritePath};

/// Shear multiplier relating flow shear stress to the burst stress at the
/// bed, eq. 12 in Nearing (1991).
const TAUB_CONST: f64 = 150.0;

/// Settling speeds (mm/s) of the three size classes from Cheng's formula,
/// evaluated on the representative diameter of each class.
pub fn settling_speeds(params: &crate::params::RunParams) -> [f64; 3] {
    let delta = params.deposition_grain_density - params.rho;
    let d = params.class_diameters_m();
    [
        crate::numerics::cheng_settling_speed(d[0], delta, params.g, params.nu),
        crate::numerics::cheng_settling_speed(d[1], delta, params.g, params.nu),
        crate::numerics::cheng_settling_speed(d[2], delta, params.g, params.nu),
    ]
}

/// Decide whether a hop erodes or deposits, and do it.
///
/// `dest` is None for off-edge outflow, in which case only the source cell
/// is eroded and the detached soil leaves the plot directly.
#[allow(clippy::too_many_arguments)]
pub fn apply_capacity(
    grid: &mut Grid,
    ctx: &FlowCtx,
    x: usize,
    y: usize,
    dest: Option<(usize, usize)>,
    dir: usize,
    water_depth: f64,
    top_diff: f64,
    top_slope: f64,
    hop_len: f64,
    speed: f64,
    moved_depth: f64,
) {
    let p = ctx.params;

    // Unit discharge in cm2/s from mm (depth) * mm/s (speed)
    let q = moved_depth * speed * 0.01;

    // Stream power in the cgs units the Nearing fit was made in
    let w = p.rho * p.g * top_slope * q * 0.01;
    if w <= 0.0 {
        return;
    }
    grid.stream_power.set(x, y, w * 0.001);

    // Nearing et al. (1997) eq. 5: log of unit sediment load
    let e_w = (p.nearing_gamma + p.nearing_delta * w.ln()).exp();
    let qs = ((p.nearing_alpha * (e_w + 1.0) + p.nearing_beta * e_w) / (e_w + 1.0)).exp();

    // Unit-width load -> full cell width (mm -> cm), in g/s
    let mut load_g_per_s = qs * grid.cell_side * 0.1;

    // Amount transportable during the residence time of the hop, in g
    load_g_per_s *= (hop_len * hop_len + top_diff * top_diff).sqrt() / speed;

    let Some(bulk_density) = soil::top_nonzero_bulk_density(grid, x, y) else {
        // Down to unerodible basement: nothing to transport
        return;
    };

    // g -> mm3 through the bulk density, then to a depth over the cell
    let volume_mm3 = load_g_per_s * 1.0e6 / bulk_density;
    let capacity = volume_mm3 / grid.cell_area;
    grid.transport_capacity.set(x, y, capacity);

    let sed_load = grid.sed_load_total(x, y);
    if sed_load > capacity {
        deposit_from_load(grid, ctx, x, y, water_depth, sed_load, capacity);
    } else {
        let load_weight = 1.0 - sed_load / capacity;
        erode_cell(
            grid, ctx, x, y, dest, dir, top_slope, hop_len, speed, load_weight, moved_depth,
        );
    }
}

/// Probabilistic detachment after Nearing (1991): e = K v P S with
/// P = Phi((tau_b - T) / sigma), halved between source and destination.
#[allow(clippy::too_many_arguments)]
fn erode_cell(
    grid: &mut Grid,
    ctx: &FlowCtx,
    x: usize,
    y: usize,
    dest: Option<(usize, usize)>,
    dir: usize,
    top_slope: f64,
    hop_len: f64,
    speed: f64,
    load_weight: f64,
    moved_depth: f64,
) {
    let p = ctx.params;

    let tau = p.rho * p.g * moved_depth * top_slope * 1.0e-6;
    let tau_b = TAUB_CONST * tau;
    let s_tau_b = p.cv_taub * tau_b;

    // Shear stress feeds the slump trigger; without slumping it simply
    // accrues on this cell
    match ctx.patch {
        Some(patch) => slump::distribute_shear_stress(grid, patch, x, y, tau),
        None => {
            *grid.shear_stress.get_mut(x, y) += tau;
            *grid.cumul_shear_stress.get_mut(x, y) += tau;
        }
    }

    // Normalised margin of burst stress over strength, sampled through the
    // standard-normal CDF (the reliability-analysis variant of Nearing's
    // eq. 9); speed is mm/s hence the 0.001
    let st2 = (p.cv_t * p.nearing_t).powi(2);
    let z = (tau_b - p.nearing_t) / (st2 + s_tau_b * s_tau_b).sqrt();
    let mut e = p.nearing_k * speed * gauss_cdf(z) * top_slope * 0.001;

    // Pre-existing load linearly suppresses detachment (Lei et al. 1998)
    e *= load_weight;

    let Some(bulk_density) = soil::top_nonzero_bulk_density(grid, x, y) else {
        return;
    };
    let mut thickness = 1000.0 * e / bulk_density;

    match dest {
        None => {
            // Edge cell: erosion cannot cut below a configured baselevel
            if let Some(base) = p.base_level {
                thickness = thickness.min(grid.soil_surface_elevation(x, y) - base);
            }
            if thickness > 0.0 {
                flow_detach(grid, x, y, thickness, true);
            }
        }
        Some((lx, ly)) => {
            // Split between source and destination so erosion propagates
            // both upstream and downstream of the hop
            let half = thickness * 0.5;
            flow_detach(grid, x, y, half, false);
            flow_detach(grid, lx, ly, half, false);

            // Build up headcut-retreat debt against the flow direction
            let elev_slope = ((grid.soil_surface_elevation(x, y)
                - grid.soil_surface_elevation(lx, ly))
                / hop_len)
                .atan();
            let retreat = p.headcut_retreat_const * elev_slope.sin();
            *grid.stored_retreat[opposite(dir)].get_mut(x, y) += retreat;
        }
    }
}

/// Supply-limited withdrawal through the staged thickness fields; detached
/// soil joins the cell's suspended load, or leaves the plot from an edge
/// cell.
pub fn flow_detach(grid: &mut Grid, x: usize, y: usize, depth: f64, off_edge: bool) {
    let taken = soil::detach(grid, x, y, depth, ErodibilityKind::Flow, WritePath::Staged);

    if off_edge {
        for c in 0..3 {
            if taken[c] > 0.0 {
                *grid.sed_off_edge[c].get_mut(x, y) += taken[c];
                *grid.cumul_sed_off_edge[c].get_mut(x, y) += taken[c];
            }
        }
    } else {
        for c in 0..3 {
            grid.add_sed_load(x, y, c, taken[c]);
        }
    }

    grid.flow_ledger.add_detach(x, y, taken);
}

/// Settle part of the suspended load onto the top soil layer: per class,
/// the fall distance over the water depth (capped at one) scaled by the
/// capacity deficit.
fn deposit_from_load(
    grid: &mut Grid,
    ctx: &FlowCtx,
    x: usize,
    y: usize,
    water_depth: f64,
    sed_load: f64,
    capacity: f64,
) {
    let tc_frac = if capacity > 0.0 {
        (sed_load / capacity).min(1.0)
    } else {
        1.0
    };

    let mut deposited = [0.0; 3];
    for c in 0..3 {
        let fall = ctx.dt * ctx.settling_speed[c];
        let frac = (fall / water_depth).min(1.0) * tc_frac;
        let want = frac * *grid.sed_load[c].get(x, y);
        if want > 0.0 {
            let got = grid.remove_sed_load(x, y, c, want);
            deposited[c] = got;
            *grid.sed_removed[c].get_mut(x, y) += got;
        }
    }

    soil::deposit_top_layer(grid, x, y, deposited, WritePath::Staged);
    grid.flow_ledger.add_deposit(x, y, deposited);
}
