//! End-to-end scenarios on small constructed plots.

use rillsim::grid::{DIR_BOTTOM, DIR_TOP};
use rillsim::numerics::SplashSpline;
use rillsim::params::{RunParams, SoilLayerParams};
use rillsim::raster::Raster;
use rillsim::sim::Simulation;

fn layer(name: &str, thickness: f64) -> SoilLayerParams {
    SoilLayerParams {
        name: name.to_string(),
        thickness,
        percent_clay: 30.0,
        percent_silt: 30.0,
        percent_sand: 40.0,
        bulk_density: 1300.0,
        flow_erodibility: [0.8, 0.6, 0.4],
        splash_erodibility: [0.8, 0.6, 0.4],
        slump_erodibility: [0.8, 0.6, 0.4],
        ga_air_head: 10.0,
        ga_lambda: 0.5,
        ga_theta_sat: 0.45,
        ga_theta_init: 0.2,
        ga_k_sat: 1.0,
    }
}

fn base_params() -> RunParams {
    let mut p = RunParams::default();
    p.layers.push(layer("topsoil", 100.0));
    p.enable_infiltration = false;
    p
}

fn unity_spline() -> SplashSpline {
    SplashSpline::new(vec![0.0, 1.0e6], vec![1.0, 1.0])
}

fn flat_dem(nx: usize, ny: usize, elev: f64) -> Raster<f64> {
    Raster::new_with(nx, ny, elev)
}

/// S1: a dry static plot. No rain, twenty iterations, nothing may move.
#[test]
fn s1_dry_static_plot() {
    let mut params = base_params();
    params.rain_intensity = 0.0;
    params.rain_duration = 0.0;
    params.simulation_duration = 10.0;

    let mut sim = Simulation::new(params, &flat_dem(10, 10, 100.0), 10.0, None, unity_spline())
        .expect("setup");

    for _ in 0..20 {
        let s = sim.step().expect("step");
        assert_eq!(s.wet_cells, 0);
        assert_eq!(s.rain, 0.0);
        assert_eq!(s.flow_detach, 0.0);
        assert_eq!(s.flow_deposit, 0.0);
        assert_eq!(s.splash_detach, 0.0);
        assert_eq!(s.splash_deposit, 0.0);
        assert_eq!(s.slump_detach, 0.0);
        assert_eq!(s.topple_detach, 0.0);
        assert_eq!(s.headcut_detach, 0.0);
        assert_eq!(s.water_off_edge, 0.0);
        assert_eq!(s.sed_load, [0.0; 3]);
        assert_eq!(s.surface_water, 0.0);
    }

    for y in 0..10 {
        for x in 0..10 {
            assert!((sim.grid.soil_surface_elevation(x, y) - 100.0).abs() < 1e-12);
        }
    }
}

/// S2: uniform rain on a flat closed plot accumulates the nominal depth.
#[test]
fn s2_uniform_rain_closed_edges() {
    let mut params = base_params();
    params.rain_intensity = 60.0; // mm/h -> 1 mm over 60 s
    params.rain_duration = 60.0;
    params.simulation_duration = 60.0;
    params.rain_intensity_cv = 0.0;
    params.enable_flow_erosion = false;
    params.enable_splash = false;
    params.enable_slumping = false;
    params.enable_headcut_retreat = false;
    for e in params.edges.iter_mut() {
        e.closed = true;
    }
    // Keep the iteration count manageable for the test
    params.timestep_rain = 0.05;

    let mut sim = Simulation::new(params, &flat_dem(5, 5, 50.0), 10.0, None, unity_spline())
        .expect("setup");

    let mut rained = 0.0;
    while sim.elapsed < 60.0 {
        let s = sim.step().expect("step");
        rained += s.rain;
        assert_eq!(s.water_off_edge, 0.0);
        assert_eq!(s.sed_load, [0.0; 3]);
        assert_eq!(s.flow_detach, 0.0);
    }

    // Nominal depth is 1 mm on each of the 25 cells; the drop-count
    // correction holds the stochastic total near the target
    assert!((rained - 25.0).abs() < 25.0 * 0.25, "rained {rained}");
    assert!((sim.grid.total_surface_water() - rained).abs() < 1e-6);
}

/// S3: a three-cell channel tilted to the south moves ponded water
/// downhill and conserves it.
#[test]
fn s3_single_cell_tilt() {
    let mut params = base_params();
    params.rain_intensity = 0.0;
    params.rain_duration = 0.0;
    params.simulation_duration = 10.0;
    params.enable_flow_erosion = false;
    params.enable_splash = false;
    params.enable_slumping = false;
    params.enable_headcut_retreat = false;
    params.ff_constant = 0.1;
    for e in params.edges.iter_mut() {
        e.closed = true;
    }

    // Centre column steps 10 -> 5 -> 0 from north to south; the flanking
    // columns form 100 mm walls
    let mut dem = flat_dem(3, 3, 100.0);
    dem.set(1, 0, 10.0);
    dem.set(1, 1, 5.0);
    dem.set(1, 2, 0.0);

    let mut sim = Simulation::new(params, &dem, 10.0, None, unity_spline()).expect("setup");
    // 10 mm of water on the north channel cell
    sim.grid.add_surface_water(1, 0, 10.0);

    let before = sim.grid.total_surface_water();
    let mut moved = false;
    for _ in 0..2000 {
        sim.step().expect("step");
        if *sim.grid.water_depth.get(1, 1) > 0.0 {
            moved = true;
            break;
        }
    }

    assert!(moved, "water never reached the middle channel cell");
    assert_eq!(*sim.grid.flow_dir.get(1, 0), DIR_BOTTOM as u8);
    assert!(sim.grid.flow_speed(1, 0) > 0.0);
    assert!((sim.grid.total_surface_water() - before).abs() < 1e-9);
}

/// S5: a raised wet cell slumps half its excess over the angle of rest to
/// the steepest wet neighbour, split by the slump erodibilities.
#[test]
fn s5_angle_of_rest_slump() {
    let mut params = base_params();
    params.layers[0].thickness = 150.0;
    params.rain_intensity = 0.0;
    params.rain_duration = 0.0;
    params.simulation_duration = 10.0;
    params.enable_flow_erosion = false;
    params.enable_splash = false;
    params.enable_headcut_retreat = false;
    params.enable_slumping = true;
    params.critical_shear_stress = 1.0e-12;
    params.slump_angle_of_rest_percent = 45.0;
    params.topple_critical_angle_percent = 1.0e9;
    params.slump_interval = 1;
    for e in params.edges.iter_mut() {
        e.closed = true;
    }

    let mut dem = flat_dem(5, 5, 100.0);
    dem.set(2, 2, 200.0);
    let mut sim = Simulation::new(params, &dem, 10.0, None, unity_spline()).expect("setup");
    for y in 0..5 {
        for x in 0..5 {
            sim.grid.add_surface_water(x, y, 1.0);
        }
    }
    *sim.grid.shear_stress.get_mut(2, 2) += 1.0;

    let s = sim.step().expect("step");

    // Excess above the angle-of-rest allowance (cell side 10 mm, 45%),
    // halved
    let expected = (100.0 - 10.0 * 0.45) / 2.0;
    assert!((s.slump_detach - expected).abs() < 1e-9, "slumped {}", s.slump_detach);
    assert!((sim.grid.soil_surface_elevation(2, 2) - (200.0 - expected)).abs() < 1e-9);

    // Partitioned by the peak cell's slump erodibilities
    let detach = &sim.grid.slump_ledger.detach;
    let total: f64 = (0..3).map(|c| detach[c].get(2, 2)).sum();
    assert!((detach[0].get(2, 2) / total - 0.8 / 1.8).abs() < 1e-9);
    assert!((detach[1].get(2, 2) / total - 0.6 / 1.8).abs() < 1e-9);
    assert!((detach[2].get(2, 2) / total - 0.4 / 1.8).abs() < 1e-9);
}

/// S6: flow-accumulated retreat debt fires a headcut event that moves
/// soil from the upstream cell and resets the debt.
#[test]
fn s6_headcut_retreat_debt() {
    let mut params = base_params();
    params.rain_intensity = 0.0;
    params.rain_duration = 0.0;
    params.simulation_duration = 10.0;
    params.enable_flow_erosion = false;
    params.enable_splash = false;
    params.enable_slumping = false;
    params.enable_headcut_retreat = true;
    for e in params.edges.iter_mut() {
        e.closed = true;
    }

    // A southward staircase: the upstream (north) neighbour is higher
    let mut dem = Raster::new(5, 5);
    for y in 0..5 {
        for x in 0..5 {
            dem.set(x, y, 150.0 - 10.0 * y as f64);
        }
    }
    let mut sim = Simulation::new(params, &dem, 10.0, None, unity_spline()).expect("setup");

    // Bank the debt in small parcels, as sustained flow detachment would
    let per_iter = 2.6;
    for k in 0..4 {
        *sim.grid.stored_retreat[DIR_TOP].get_mut(2, 2) += per_iter;
        let s = sim.step().expect("step");
        if k < 3 {
            // Debt below one cell side: nothing fires
            assert_eq!(s.headcut_detach, 0.0);
        } else {
            // Fourth parcel crosses 10 mm: the event fires
            assert!(s.headcut_detach > 0.0);
        }
    }

    // Half of the 10 mm step moved down from the upstream cell, levelling
    // the pair at 135 mm
    assert!((sim.grid.soil_surface_elevation(2, 1) - 135.0).abs() < 1e-9);
    assert!((sim.grid.soil_surface_elevation(2, 2) - 135.0).abs() < 1e-9);
    assert_eq!(*sim.grid.stored_retreat[DIR_TOP].get(2, 2), 0.0);
    assert_eq!(*sim.grid.stored_retreat[DIR_TOP].get(2, 1), 0.0);
    assert!(*sim.grid.has_retreated.get(2, 2));
}

/// Two runs with identical configuration and seeds are bit-identical.
#[test]
fn deterministic_reproducibility() {
    let make = || {
        let mut params = base_params();
        params.rain_intensity = 90.0;
        params.rain_duration = 1.0e6;
        params.simulation_duration = 1.0e6;
        params.rain_intensity_cv = 0.4;
        params.rain_seed = 77;
        params.flow_seed = 78;
        Simulation::new(params, &flat_dem(8, 8, 100.0), 10.0, None, unity_spline()).expect("setup")
    };

    let mut a = make();
    let mut b = make();
    for _ in 0..150 {
        let sa = a.step().expect("step a");
        let sb = b.step().expect("step b");
        assert_eq!(sa.rain, sb.rain);
        assert_eq!(sa.flow_detach, sb.flow_detach);
    }

    for y in 0..8 {
        for x in 0..8 {
            assert_eq!(*a.grid.water_depth.get(x, y), *b.grid.water_depth.get(x, y));
            assert_eq!(
                a.grid.soil_surface_elevation(x, y),
                b.grid.soil_surface_elevation(x, y)
            );
        }
    }
}

/// Changing a seed changes the realisation.
#[test]
fn different_seed_different_run() {
    let make = |seed| {
        let mut params = base_params();
        params.rain_intensity = 90.0;
        params.rain_duration = 1.0e6;
        params.simulation_duration = 1.0e6;
        params.rain_intensity_cv = 0.4;
        params.rain_seed = seed;
        Simulation::new(params, &flat_dem(8, 8, 100.0), 10.0, None, unity_spline()).expect("setup")
    };

    let mut a = make(1);
    let mut b = make(2);
    let mut diverged = false;
    for _ in 0..50 {
        let sa = a.step().expect("step a");
        let sb = b.step().expect("step b");
        if sa.rain != sb.rain {
            diverged = true;
            break;
        }
    }
    assert!(diverged);
}

/// With every process off and closed edges, total water is conserved
/// exactly while it rains and routes.
#[test]
fn closed_plot_water_budget() {
    let mut params = base_params();
    params.rain_intensity = 120.0;
    params.rain_duration = 1.0e6;
    params.simulation_duration = 1.0e6;
    params.enable_flow_erosion = false;
    params.enable_splash = false;
    params.enable_slumping = false;
    params.enable_headcut_retreat = false;
    for e in params.edges.iter_mut() {
        e.closed = true;
    }

    // An irregular basin so routing actually happens
    let mut dem = Raster::new(6, 6);
    for y in 0..6 {
        for x in 0..6 {
            let dx = x as f64 - 2.5;
            let dy = y as f64 - 2.5;
            dem.set(x, y, 100.0 + 2.0 * (dx * dx + dy * dy));
        }
    }

    let mut sim = Simulation::new(params, &dem, 10.0, None, unity_spline()).expect("setup");
    let mut rained = 0.0;
    for _ in 0..300 {
        let s = sim.step().expect("step");
        rained += s.rain;
    }
    assert!(rained > 0.0);
    assert!((sim.grid.total_surface_water() - rained).abs() < 1e-6);
}

/// Rain-variation multipliers bias where the water lands.
#[test]
fn rain_variation_raster_scales_depths() {
    let mut params = base_params();
    params.rain_intensity = 600.0;
    params.rain_duration = 1.0e6;
    params.simulation_duration = 1.0e6;
    params.enable_flow_erosion = false;
    params.enable_splash = false;
    params.enable_slumping = false;
    params.enable_headcut_retreat = false;
    for e in params.edges.iter_mut() {
        e.closed = true;
    }

    // Left half gets double rain, right half none
    let mut rv = Raster::new_with(6, 6, 0.0);
    for y in 0..6 {
        for x in 0..3 {
            rv.set(x, y, 2.0);
        }
    }

    let mut sim = Simulation::new(
        params,
        &flat_dem(6, 6, 100.0),
        10.0,
        Some(&rv),
        unity_spline(),
    )
    .expect("setup");

    for _ in 0..500 {
        sim.step().expect("step");
    }

    let mut left = 0.0;
    let mut right = 0.0;
    for y in 0..6 {
        for x in 0..6 {
            if x < 3 {
                left += *sim.grid.cumul_rain.get(x, y);
            } else {
                right += *sim.grid.cumul_rain.get(x, y);
            }
        }
    }
    assert!(left > 0.0);
    assert_eq!(right, 0.0);
}
