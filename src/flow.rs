//! Surface-water routing: one steepest-energy-descent hop per wet cell per
//! iteration.
//!
//! The destination is the neighbour with the steepest downhill gradient of
//! *top* elevation (soil + water). Half the head may move, capped by the
//! water on the source cell, gated by the travel time across the hop at the
//! Darcy-Weisbach (or Manning) speed. Edge cells on open edges discharge
//! against a synthesised off-edge head. After each water move the transport
//! kernel decides whether the hop erodes or deposits.

use crate::grid::{is_diagonal, Grid, DIR_NONE, DX, DY, EDGE_NONE, WATER_TOLERANCE};
use crate::params::{FrictionModel, RunParams};
use crate::rng::TauswortheRng;
use crate::slump::ShearPatch;
use crate::transport;

/// Aggregates produced by one routing pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlowOutcome {
    /// Sum of heads moved this iteration (mm), for the off-edge head rule
    pub total_head: f64,
    pub num_heads: u64,
    /// Highest flow speed computed this iteration (mm/s), drives the
    /// Courant timestep for the next iteration
    pub max_speed: f64,
    /// Water lost across open edges (mm summed over cells)
    pub water_off_edge: f64,
    /// Suspended sediment lost across open edges, per size class
    pub sed_off_edge: [f64; 3],
}

/// Everything the routing pass needs besides the grid.
pub struct FlowCtx<'a> {
    pub params: &'a RunParams,
    pub dt: f64,
    /// Mean head of the previous iteration (mm), for open-edge outflow
    pub last_iter_avg_head: f64,
    /// Shear-stress patch, present when slumping is enabled
    pub patch: Option<&'a ShearPatch>,
    /// Settling speeds per size class (mm/s)
    pub settling_speed: [f64; 3],
}

/// Route water from every wet cell, in row-major order. Also performs the
/// inline flow detachment/deposition through the transport kernel.
pub fn route_all(
    grid: &mut Grid,
    ctx: &FlowCtx,
    flow_rng: &mut TauswortheRng,
) -> FlowOutcome {
    let mut out = FlowOutcome::default();

    for y in 0..grid.ny {
        for x in 0..grid.nx {
            if grid.is_missing(x, y) || !grid.is_wet(x, y) {
                continue;
            }

            let edge = *grid.edge.get(x, y);
            if edge != EDGE_NONE && !ctx.params.edges[edge as usize].closed {
                try_edge_outflow(grid, ctx, &mut out, x, y, edge);
            } else {
                // Closed-edge cells route like interior cells
                try_cell_outflow(grid, ctx, flow_rng, &mut out, x, y);
            }
        }
    }

    out
}

/// Find the neighbour with the steepest downhill top-surface gradient.
/// Returns (direction, dest, head, tan slope, hop length) or None.
fn steepest_energy_descent(
    grid: &Grid,
    x: usize,
    y: usize,
) -> Option<(usize, (usize, usize), f64, f64, f64)> {
    let this_top = grid.top_elevation(x, y);
    let mut best: Option<(usize, (usize, usize), f64, f64, f64)> = None;
    let mut best_slope = 0.0;

    for dir in 0..8 {
        let Some((nx, ny)) = grid.neighbour(x, y, dir) else {
            continue;
        };
        if grid.is_missing(nx, ny) {
            continue;
        }
        let diff = this_top - grid.top_elevation(nx, ny);
        if diff <= 0.0 {
            continue;
        }
        let hop = grid.hop_length(dir);
        let slope = diff / hop;
        if slope > best_slope {
            best_slope = slope;
            best = Some((dir, (nx, ny), diff, slope, hop));
        }
    }

    best
}

fn try_cell_outflow(
    grid: &mut Grid,
    ctx: &FlowCtx,
    flow_rng: &mut TauswortheRng,
    out: &mut FlowOutcome,
    x: usize,
    y: usize,
) {
    let Some((dir, (lx, ly), top_diff, top_slope, hop_len)) = steepest_energy_descent(grid, x, y)
    else {
        // Ponded: no downhill neighbour. Re-seed the velocity to keep the
        // symmetry-breaking perturbation alive for Reynolds friction
        grid.flow_dir.set(x, y, DIR_NONE);
        seed_velocity(grid, flow_rng, x, y);
        return;
    };

    grid.flow_dir.set(x, y, dir as u8);

    // Moving half the head equalises the two water surfaces; there may not
    // be that much water on the source cell
    let this_depth = *grid.water_depth.get(x, y);
    let head = (top_diff / 2.0).min(this_depth);

    out.total_head += head;
    out.num_heads += 1;

    let speed = flow_speed(grid, ctx, x, y, top_slope, this_depth);
    if speed <= 0.0 {
        seed_velocity(grid, flow_rng, x, y);
        return;
    }
    out.max_speed = out.max_speed.max(speed);

    // Diagonal flow is faster by sqrt(2): with eight-way routing the only
    // way to keep outflow equally probable in all directions
    let (vx, vy, scalar_speed) = directed_velocity(speed, dir);

    let outflow_time = hop_len / scalar_speed;
    let mut depth_to_move = head;
    if outflow_time > ctx.dt {
        depth_to_move = head * (ctx.dt / outflow_time);
    }

    set_velocity(grid, ctx.dt, x, y, vx, vy);
    let frac = (depth_to_move / this_depth).min(1.0);
    set_dw_velocity(grid, ctx.dt, x, y, vx * frac, vy * frac);

    if depth_to_move < WATER_TOLERANCE {
        return;
    }

    move_water_and_sediment(grid, x, y, lx, ly, this_depth, depth_to_move);

    if ctx.params.enable_flow_erosion {
        transport::apply_capacity(
            grid,
            ctx,
            x,
            y,
            Some((lx, ly)),
            dir,
            this_depth,
            top_diff,
            top_slope,
            hop_len,
            scalar_speed,
            depth_to_move,
        );
    }
}

fn try_edge_outflow(
    grid: &mut Grid,
    ctx: &FlowCtx,
    out: &mut FlowOutcome,
    x: usize,
    y: usize,
    edge: u8,
) {
    // No real downhill neighbour exists off-grid, so synthesise a head from
    // the previous iteration's mean on-grid head
    let this_depth = *grid.water_depth.get(x, y);
    let head = (ctx.last_iter_avg_head * ctx.params.off_edge_head_const).min(this_depth);

    let dir = match edge {
        0 => crate::grid::DIR_TOP,
        1 => crate::grid::DIR_RIGHT,
        2 => crate::grid::DIR_BOTTOM,
        _ => crate::grid::DIR_LEFT,
    };
    grid.flow_dir.set(x, y, dir as u8);

    let top_slope = head / grid.cell_side;
    let speed = flow_speed(grid, ctx, x, y, top_slope, this_depth);
    if speed <= 0.0 {
        return;
    }
    out.max_speed = out.max_speed.max(speed);

    let (vx, vy, scalar_speed) = directed_velocity(speed, dir);
    let outflow_time = grid.cell_side / scalar_speed;

    let frac_of_dt = (ctx.dt / outflow_time).min(1.0);
    let depth_to_move = head * frac_of_dt;
    let mut frac_to_move = if this_depth > 0.0 {
        (depth_to_move / this_depth).min(1.0)
    } else {
        0.0
    };

    set_velocity(grid, ctx.dt, x, y, vx, vy);
    set_dw_velocity(grid, ctx.dt, x, y, vx * frac_to_move, vy * frac_to_move);

    let removed = grid.remove_surface_water(x, y, depth_to_move);
    *grid.water_lost.get_mut(x, y) += removed;
    *grid.cumul_water_lost.get_mut(x, y) += removed;
    out.water_off_edge += removed;

    // Transported sediment is assumed well mixed in the water column, so it
    // leaves in proportion to the water (or entirely, in a flume run)
    if ctx.params.flume {
        frac_to_move = 1.0;
    }
    for c in 0..3 {
        let want = *grid.sed_load[c].get(x, y) * frac_to_move;
        if want > 0.0 {
            let got = grid.remove_sed_load(x, y, c, want);
            *grid.sed_off_edge[c].get_mut(x, y) += got;
            *grid.cumul_sed_off_edge[c].get_mut(x, y) += got;
            out.sed_off_edge[c] += got;
        }
    }

    // The outflow may still have eroded the edge cell itself (or deposited
    // on it); note the pre-outflow depth is used
    if ctx.params.enable_flow_erosion {
        transport::apply_capacity(
            grid,
            ctx,
            x,
            y,
            None,
            dir,
            this_depth,
            head,
            top_slope,
            grid.cell_side,
            scalar_speed,
            depth_to_move,
        );
    }
}

/// Velocity vector for a compass direction; diagonal hops report a sqrt(2)
/// faster scalar speed.
fn directed_velocity(speed: f64, dir: usize) -> (f64, f64, f64) {
    let vx = DX[dir] as f64 * speed;
    let vy = DY[dir] as f64 * speed;
    let scalar = if is_diagonal(dir) {
        speed * std::f64::consts::SQRT_2
    } else {
        speed
    };
    (vx, vy, scalar)
}

fn seed_velocity(grid: &mut Grid, flow_rng: &mut TauswortheRng, x: usize, y: usize) {
    grid.vel_x.set(x, y, flow_rng.gaussian() * crate::rain::INIT_SPEED_SEED);
    grid.vel_y.set(x, y, flow_rng.gaussian() * crate::rain::INIT_SPEED_SEED);
    grid.dw_vel_x.set(x, y, 0.0);
    grid.dw_vel_y.set(x, y, 0.0);
}

fn set_velocity(grid: &mut Grid, dt: f64, x: usize, y: usize, vx: f64, vy: f64) {
    grid.vel_x.set(x, y, vx);
    grid.vel_y.set(x, y, vy);
    *grid.cumul_vel_x.get_mut(x, y) += vx * dt;
    *grid.cumul_vel_y.get_mut(x, y) += vy * dt;
}

fn set_dw_velocity(grid: &mut Grid, dt: f64, x: usize, y: usize, vx: f64, vy: f64) {
    grid.dw_vel_x.set(x, y, vx);
    grid.dw_vel_y.set(x, y, vy);
    *grid.cumul_dw_vel_x.get_mut(x, y) += vx * dt;
    *grid.cumul_dw_vel_y.get_mut(x, y) += vy * dt;
}

/// Move water from source to destination, carrying a proportional share of
/// the suspended sediment along.
fn move_water_and_sediment(
    grid: &mut Grid,
    fx: usize,
    fy: usize,
    tx: usize,
    ty: usize,
    this_depth: f64,
    depth_to_move: f64,
) {
    let moved = grid.remove_surface_water(fx, fy, depth_to_move);
    grid.add_surface_water(tx, ty, moved);

    if grid.sed_load_total(fx, fy) > 0.0 {
        let frac = moved / this_depth;
        for c in 0..3 {
            let want = *grid.sed_load[c].get(fx, fy) * frac;
            if want > 0.0 {
                let got = grid.remove_sed_load(fx, fy, c, want);
                grid.add_sed_load(tx, ty, c, got);
            }
        }
    }
}

/// Hydraulic radius (mm) from the wetness of the two neighbours orthogonal
/// to the flow direction: both wet gives R = d, one wet R = w d / (w + d),
/// none R = w d / (w + 2d).
pub fn hydraulic_radius(grid: &Grid, x: usize, y: usize) -> f64 {
    let depth = *grid.water_depth.get(x, y);
    let dir = *grid.flow_dir.get(x, y);
    if dir == DIR_NONE {
        return grid.cell_side * depth / (grid.cell_side + 2.0 * depth);
    }

    // The two cells perpendicular to the flow axis
    let (a, b): ((i32, i32), (i32, i32)) = match dir as usize {
        0 | 4 => ((-1, 0), (1, 0)),
        2 | 6 => ((0, -1), (0, 1)),
        1 | 5 => ((-1, -1), (1, 1)),
        _ => ((1, -1), (-1, 1)),
    };

    let mut wet = 0;
    for (dx, dy) in [a, b] {
        let nx = x as i32 + dx;
        let ny = y as i32 + dy;
        if grid.in_bounds(nx, ny)
            && !grid.is_missing(nx as usize, ny as usize)
            && grid.is_wet(nx as usize, ny as usize)
        {
            wet += 1;
        }
    }

    let w = grid.cell_side;
    match wet {
        2 => depth,
        1 => w * depth / (w + depth),
        _ => w * depth / (w + 2.0 * depth),
    }
}

/// Reynolds number from the previous iteration's flow speed.
pub fn reynolds(grid: &Grid, nu: f64, x: usize, y: usize) -> f64 {
    let speed = grid.flow_speed(x, y);
    let r = hydraulic_radius(grid, x, y);
    // Speed and radius are mm/s and mm; the equation wants m/s and m
    1.0e-6 * speed * r / nu
}

/// Froude number for diagnostics output.
pub fn froude(grid: &Grid, g: f64, x: usize, y: usize) -> f64 {
    let depth = *grid.water_depth.get(x, y);
    if depth <= 0.0 {
        return 0.0;
    }
    grid.flow_speed(x, y) * 1.0e-3 / (depth * g * 1.0e-3).sqrt()
}

/// Flow speed (mm/s) for a cell under the configured friction model; also
/// records the friction factor and (for Lawrence) the inundation class.
fn flow_speed(grid: &mut Grid, ctx: &FlowCtx, x: usize, y: usize, top_slope: f64, depth: f64) -> f64 {
    // Darcy-Weisbach in SI is v = sqrt(8 g R S / f); hydraulic radius is
    // held in mm so the 8 becomes 0.008, and the m/s result is scaled to
    // mm/s
    const DW_CONST: f64 = 0.008;
    const TO_MM_PER_S: f64 = 1000.0;

    let p = ctx.params;
    match p.friction_model {
        FrictionModel::Manning => {
            let r_m = hydraulic_radius(grid, x, y) * 1.0e-3;
            let v = r_m.powf(2.0 / 3.0) * top_slope.sqrt() / p.manning_n;
            grid.friction_factor.set(x, y, p.manning_n);
            v * TO_MM_PER_S
        }
        FrictionModel::DarcyWeisbachConstant => {
            let r = hydraulic_radius(grid, x, y);
            grid.friction_factor.set(x, y, p.ff_constant);
            TO_MM_PER_S * (DW_CONST * p.g * r * top_slope / p.ff_constant).sqrt()
        }
        FrictionModel::DarcyWeisbachReynolds => {
            let re = reynolds(grid, p.nu, x, y);
            let mut speed = 0.0;
            let mut ff = 0.0;
            if re > 0.0 {
                ff = p.ff_reynolds_a * re.powf(p.ff_reynolds_b);
                let r = hydraulic_radius(grid, x, y);
                speed = TO_MM_PER_S * (DW_CONST * p.g * r * top_slope / ff).sqrt();
            }
            // Runaway speeds are clamped; the friction factor is then
            // unknown and reported as missing
            if speed > p.max_flow_speed {
                speed = p.max_flow_speed;
                ff = f64::NAN;
            }
            if ff > f32::MAX as f64 {
                ff = f32::MAX as f64;
            }
            grid.friction_factor.set(x, y, ff);
            speed
        }
        FrictionModel::DarcyWeisbachLawrence => {
            let lambda = depth / p.ff_lawrence_epsilon;
            let ff = lawrence_friction_factor(grid, p, x, y, lambda);
            let r = hydraulic_radius(grid, x, y);
            grid.friction_factor.set(x, y, ff);
            TO_MM_PER_S * (DW_CONST * p.g * r * top_slope / ff).sqrt()
        }
    }
}

/// Lawrence (1997) friction factor from the inundation ratio lambda =
/// depth / roughness height; also records the inundation class.
pub fn lawrence_friction_factor(
    grid: &mut Grid,
    p: &RunParams,
    x: usize,
    y: usize,
    lambda: f64,
) -> f64 {
    use crate::grid::Inundation;
    use std::f64::consts::PI;

    if lambda <= 1.0 {
        // Shallow flow, eq. 19
        grid.inundation.set(x, y, Inundation::Shallow as u8);
        (8.0 / PI) * p.ff_lawrence_pr * p.ff_lawrence_cd * (PI / 4.0).min(lambda)
    } else if lambda <= 10.0 {
        // Marginally inundated, eq. 15
        grid.inundation.set(x, y, Inundation::Marginal as u8);
        10.0 / (lambda * lambda)
    } else {
        // Well inundated, eq. 12
        grid.inundation.set(x, y, Inundation::Deep as u8);
        (1.64 + 0.803 * lambda.ln()).powi(2)
    }
}
