//! Shared helpers for unit tests: small grids and a filled-in parameter set.

use crate::params::{RunParams, SoilLayerParams};
use crate::raster::Raster;

/// A complete layer definition with round numbers, for tests.
pub fn test_layer(name: &str, thickness: f64) -> SoilLayerParams {
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

/// Default params with `n` identical 100 mm layers.
pub fn test_params(n: usize) -> RunParams {
    let mut p = RunParams::default();
    for i in 0..n {
        p.layers.push(test_layer(&format!("layer{i}"), 100.0));
    }
    p
}

pub fn flat_dem(nx: usize, ny: usize, elev: f64) -> Raster<f64> {
    Raster::new_with(nx, ny, elev)
}
