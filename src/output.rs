//! Run outputs: the per-iteration results table, GIS rasters at save
//! times, per-quantity time series, and the end-of-run JSON manifest.

use crate::dem;
use crate::error::{Result, SimError};
use crate::flow;
use crate::raster::Raster;
use crate::sim::{IterationSummary, Simulation};
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Every raster field name the run file may select.
pub const RASTER_FIELDS: &[&str] = &[
    "elevation",
    "initial_elevation",
    "elevation_change",
    "water_depth",
    "cumul_water_depth",
    "flow_direction",
    "flow_speed",
    "dw_flow_speed",
    "stream_power",
    "friction_factor",
    "shear_stress",
    "cumul_shear_stress",
    "reynolds",
    "froude",
    "transport_capacity",
    "inundation",
    "sediment_load",
    "sediment_concentration",
    "rain",
    "cumul_rain",
    "cumul_runon",
    "infiltration",
    "cumul_infiltration",
    "soil_water",
    "flow_detach",
    "cumul_flow_detach",
    "flow_deposit",
    "cumul_flow_deposit",
    "splash_detach",
    "cumul_splash_detach",
    "splash_deposit",
    "cumul_splash_deposit",
    "slump_detach",
    "cumul_slump_detach",
    "slump_deposit",
    "cumul_slump_deposit",
    "topple_detach",
    "cumul_topple_detach",
    "topple_deposit",
    "cumul_topple_deposit",
    "headcut_detach",
    "cumul_headcut_detach",
    "headcut_deposit",
    "cumul_headcut_deposit",
    "cumul_infilt_deposit",
    "water_lost",
    "cumul_water_lost",
];

/// Time-series quantities (one scalar per iteration).
pub const TS_FIELDS: &[&str] = &[
    "timestep",
    "wet_cells",
    "rain",
    "runon",
    "infiltration",
    "exfiltration",
    "surface_water",
    "water_off_edge",
    "flow_detach",
    "flow_deposit",
    "splash_detach",
    "splash_deposit",
    "slump_detach",
    "topple_detach",
    "headcut_detach",
    "sed_load",
    "sed_off_edge",
];

/// Builds a raster view of a named output field.
pub fn field_raster(sim: &Simulation, name: &str) -> Option<Raster<f64>> {
    let grid = &sim.grid;
    let mut out = Raster::new(grid.nx, grid.ny);

    let per_cell: Box<dyn Fn(usize, usize) -> f64 + '_> = match name {
        "elevation" => Box::new(|x, y| grid.soil_surface_elevation(x, y)),
        "initial_elevation" => Box::new(|x, y| *grid.init_elev.get(x, y)),
        "elevation_change" => {
            Box::new(|x, y| grid.soil_surface_elevation(x, y) - grid.init_elev.get(x, y))
        }
        "water_depth" => Box::new(|x, y| *grid.water_depth.get(x, y)),
        "cumul_water_depth" => Box::new(|x, y| *grid.cumul_water_depth.get(x, y)),
        "flow_direction" => Box::new(|x, y| *grid.flow_dir.get(x, y) as f64),
        "flow_speed" => Box::new(|x, y| grid.flow_speed(x, y)),
        "dw_flow_speed" => Box::new(|x, y| {
            let vx = *grid.dw_vel_x.get(x, y);
            let vy = *grid.dw_vel_y.get(x, y);
            (vx * vx + vy * vy).sqrt()
        }),
        "stream_power" => Box::new(|x, y| *grid.stream_power.get(x, y)),
        "friction_factor" => Box::new(|x, y| *grid.friction_factor.get(x, y)),
        "shear_stress" => Box::new(|x, y| *grid.shear_stress.get(x, y)),
        "cumul_shear_stress" => Box::new(|x, y| *grid.cumul_shear_stress.get(x, y)),
        "reynolds" => Box::new(|x, y| flow::reynolds(grid, sim.params.nu, x, y)),
        "froude" => Box::new(|x, y| flow::froude(grid, sim.params.g, x, y)),
        "transport_capacity" => Box::new(|x, y| *grid.transport_capacity.get(x, y)),
        "inundation" => Box::new(|x, y| *grid.inundation.get(x, y) as f64),
        "sediment_load" => Box::new(|x, y| grid.sed_load_total(x, y)),
        "sediment_concentration" => Box::new(|x, y| grid.sed_concentration(x, y)),
        "rain" => Box::new(|x, y| *grid.rain.get(x, y)),
        "cumul_rain" => Box::new(|x, y| *grid.cumul_rain.get(x, y)),
        "cumul_runon" => Box::new(|x, y| *grid.cumul_runon.get(x, y)),
        "infiltration" => Box::new(|x, y| *grid.infilt.get(x, y)),
        "cumul_infiltration" => Box::new(|x, y| *grid.cumul_infilt.get(x, y)),
        "soil_water" => Box::new(|x, y| {
            grid.layers.iter().map(|l| *l.soil_water.get(x, y)).sum()
        }),
        "flow_detach" => ledger_view(&grid.flow_ledger.detach),
        "cumul_flow_detach" => ledger_view(&grid.flow_ledger.cumul_detach),
        "flow_deposit" => ledger_view(&grid.flow_ledger.deposit),
        "cumul_flow_deposit" => ledger_view(&grid.flow_ledger.cumul_deposit),
        "splash_detach" => ledger_view(&grid.splash_ledger.detach),
        "cumul_splash_detach" => ledger_view(&grid.splash_ledger.cumul_detach),
        "splash_deposit" => ledger_view(&grid.splash_ledger.deposit),
        "cumul_splash_deposit" => ledger_view(&grid.splash_ledger.cumul_deposit),
        "slump_detach" => ledger_view(&grid.slump_ledger.detach),
        "cumul_slump_detach" => ledger_view(&grid.slump_ledger.cumul_detach),
        "slump_deposit" => ledger_view(&grid.slump_ledger.deposit),
        "cumul_slump_deposit" => ledger_view(&grid.slump_ledger.cumul_deposit),
        "topple_detach" => ledger_view(&grid.topple_ledger.detach),
        "cumul_topple_detach" => ledger_view(&grid.topple_ledger.cumul_detach),
        "topple_deposit" => ledger_view(&grid.topple_ledger.deposit),
        "cumul_topple_deposit" => ledger_view(&grid.topple_ledger.cumul_deposit),
        "headcut_detach" => ledger_view(&grid.headcut_ledger.detach),
        "cumul_headcut_detach" => ledger_view(&grid.headcut_ledger.cumul_detach),
        "headcut_deposit" => ledger_view(&grid.headcut_ledger.deposit),
        "cumul_headcut_deposit" => ledger_view(&grid.headcut_ledger.cumul_deposit),
        "cumul_infilt_deposit" => ledger_view(&grid.cumul_infilt_deposit),
        "water_lost" => Box::new(|x, y| *grid.water_lost.get(x, y)),
        "cumul_water_lost" => Box::new(|x, y| *grid.cumul_water_lost.get(x, y)),
        _ => return None,
    };

    for y in 0..grid.ny {
        for x in 0..grid.nx {
            let v = if grid.is_missing(x, y) {
                f64::NAN
            } else {
                per_cell(x, y)
            };
            out.set(x, y, v);
        }
    }
    Some(out)
}

fn ledger_view<'a>(rasters: &'a [Raster<f64>; 3]) -> Box<dyn Fn(usize, usize) -> f64 + 'a> {
    Box::new(move |x, y| rasters[0].get(x, y) + rasters[1].get(x, y) + rasters[2].get(x, y))
}

/// Scalar time-series value from an iteration summary.
pub fn ts_value(s: &IterationSummary, name: &str) -> Option<f64> {
    let v = match name {
        "timestep" => s.dt,
        "wet_cells" => s.wet_cells as f64,
        "rain" => s.rain,
        "runon" => s.runon,
        "infiltration" => s.infiltration,
        "exfiltration" => s.exfiltration,
        "surface_water" => s.surface_water,
        "water_off_edge" => s.water_off_edge,
        "flow_detach" => s.flow_detach,
        "flow_deposit" => s.flow_deposit,
        "splash_detach" => s.splash_detach,
        "splash_deposit" => s.splash_deposit,
        "slump_detach" => s.slump_detach,
        "topple_detach" => s.topple_detach,
        "headcut_detach" => s.headcut_detach,
        "sed_load" => s.sed_load.iter().sum(),
        "sed_off_edge" => s.sed_off_edge.iter().sum(),
        _ => return None,
    };
    Some(v)
}

/// Georeferencing carried from the input DEM to every output raster.
#[derive(Clone, Copy, Debug)]
pub struct GeoRef {
    pub cellsize: f64,
    pub xllcorner: f64,
    pub yllcorner: f64,
    pub nodata: f64,
}

#[derive(Debug)]
pub struct OutputWriter {
    out_dir: PathBuf,
    run_name: String,
    geo: GeoRef,
    results: Option<BufWriter<File>>,
    ts_files: HashMap<String, BufWriter<File>>,
    save_times: Vec<f64>,
    next_save: usize,
    fields: Vec<String>,
    png: bool,
    progress_interval: u64,
    started: DateTime<Local>,
}

impl OutputWriter {
    pub fn new(sim: &Simulation, out_dir: &Path, geo: GeoRef, quiet: bool) -> Result<Self> {
        let p = &sim.params;

        // Validate the field selections up front: a typo should be a setup
        // error, not a silent gap in the outputs
        for f in &p.output_fields {
            if !RASTER_FIELDS.contains(&f.as_str()) {
                return Err(SimError::Config(format!("unknown output field '{f}'")));
            }
        }
        for f in &p.timeseries_fields {
            if !TS_FIELDS.contains(&f.as_str()) {
                return Err(SimError::Config(format!("unknown time-series field '{f}'")));
            }
        }

        std::fs::create_dir_all(out_dir).map_err(|e| SimError::OutputIo {
            path: out_dir.to_path_buf(),
            source: e,
        })?;

        // Regular interval or an explicit list of save times
        let save_times = if !p.save_times.is_empty() {
            p.save_times.clone()
        } else if let Some(interval) = p.save_interval {
            let mut times = Vec::new();
            let mut t = interval;
            while t <= p.simulation_duration + 1e-9 {
                times.push(t);
                t += interval;
            }
            times
        } else {
            vec![p.simulation_duration]
        };

        let results = if quiet {
            None
        } else {
            let path = out_dir.join(format!("{}_results.txt", p.run_name));
            let file = File::create(&path).map_err(|e| SimError::OutputIo { path, source: e })?;
            let mut w = BufWriter::new(file);
            writeln!(
                w,
                "{:>10} {:>12} {:>11} {:>9} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12}",
                "iter", "time_s", "dt_s", "wet", "rain_mm", "runon_mm", "infilt_mm",
                "storage_mm", "off_edge_mm", "flow_det", "flow_dep", "splash_det",
                "slump_det", "sed_off"
            )
            .ok();
            Some(w)
        };

        let mut ts_files = HashMap::new();
        for field in &p.timeseries_fields {
            let path = out_dir.join(format!("{}_{}_ts.csv", p.run_name, field));
            let file = File::create(&path).map_err(|e| SimError::OutputIo { path, source: e })?;
            let mut w = BufWriter::new(file);
            writeln!(w, "time,{field}").ok();
            ts_files.insert(field.clone(), w);
        }

        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            run_name: p.run_name.clone(),
            geo,
            results,
            ts_files,
            save_times,
            next_save: 0,
            fields: p.output_fields.clone(),
            png: p.png_output,
            progress_interval: p.progress_interval as u64,
            started: Local::now(),
        })
    }

    /// Per-iteration hook: progress row, time series, raster saves.
    pub fn after_iteration(&mut self, sim: &Simulation, s: &IterationSummary) -> Result<()> {
        let out_dir = self.out_dir.clone();
        if let Some(w) = self.results.as_mut() {
            if s.iteration % self.progress_interval == 0 {
                writeln!(
                    w,
                    "{:>10} {:>12.4} {:>11.3e} {:>9} {:>12.5} {:>12.5} {:>12.5} {:>12.5} {:>12.5} {:>12.5} {:>12.5} {:>12.5} {:>12.5} {:>12.5}",
                    s.iteration,
                    s.elapsed,
                    s.dt,
                    s.wet_cells,
                    s.rain,
                    s.runon,
                    s.infiltration,
                    s.surface_water,
                    s.water_off_edge,
                    s.flow_detach,
                    s.flow_deposit,
                    s.splash_detach,
                    s.slump_detach,
                    s.sed_off_edge.iter().sum::<f64>(),
                )
                .map_err(|e| SimError::OutputIo {
                    path: out_dir,
                    source: e,
                })?;
            }
        }

        for (field, w) in self.ts_files.iter_mut() {
            if let Some(v) = ts_value(s, field) {
                writeln!(w, "{:.6},{v:.9}", s.elapsed).ok();
            }
        }

        while self.next_save < self.save_times.len() && sim.elapsed >= self.save_times[self.next_save]
        {
            self.save_rasters(sim)?;
            self.next_save += 1;
        }

        Ok(())
    }

    /// Write every selected field at the current save index.
    fn save_rasters(&mut self, sim: &Simulation) -> Result<()> {
        for field in &self.fields {
            let Some(raster) = field_raster(sim, field) else {
                continue;
            };
            let base = format!("{}_{}_{:03}", self.run_name, field, self.next_save);
            let asc = self.out_dir.join(format!("{base}.asc"));
            dem::write_ascii_grid(
                &asc,
                &raster,
                self.geo.cellsize,
                self.geo.xllcorner,
                self.geo.yllcorner,
                self.geo.nodata,
            )?;
            if self.png {
                dem::write_png(&self.out_dir.join(format!("{base}.png")), &raster)?;
            }
        }
        Ok(())
    }

    /// End-of-run JSON manifest: parameters, duration, grand totals.
    pub fn write_manifest(&mut self, sim: &Simulation) -> Result<()> {
        let t = &sim.totals;
        let manifest = serde_json::json!({
            "run_name": self.run_name,
            "started": self.started.to_rfc3339(),
            "finished": Local::now().to_rfc3339(),
            "iterations": sim.iteration,
            "simulated_seconds": sim.elapsed,
            "mean_elevation_change_mm": sim.mean_elevation_change(),
            "params": &sim.params,
            "totals": {
                "rain_mm": t.rain.get(),
                "runon_mm": t.runon.get(),
                "water_off_edge_mm": t.water_off_edge.get(),
                "infiltration_mm": t.infiltration.get(),
                "exfiltration_mm": t.exfiltration.get(),
                "flow_detach_mm": t.flow_detach.get(),
                "flow_deposit_mm": t.flow_deposit.get(),
                "splash_detach_mm": t.splash_detach.get(),
                "splash_deposit_mm": t.splash_deposit.get(),
                "splash_off_edge_mm": t.splash_off_edge.get(),
                "slump_detach_mm": t.slump_detach.get(),
                "slump_deposit_mm": t.slump_deposit.get(),
                "topple_detach_mm": t.topple_detach.get(),
                "topple_deposit_mm": t.topple_deposit.get(),
                "headcut_detach_mm": t.headcut_detach.get(),
                "headcut_deposit_mm": t.headcut_deposit.get(),
                "infilt_deposit_mm": t.infilt_deposit.get(),
                "sed_off_edge_mm": [
                    t.sed_off_edge[0].get(),
                    t.sed_off_edge[1].get(),
                    t.sed_off_edge[2].get(),
                ],
            },
        });

        let path = self.out_dir.join(format!("{}_manifest.json", self.run_name));
        let file = File::create(&path).map_err(|e| SimError::OutputIo {
            path: path.clone(),
            source: e,
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), &manifest).map_err(|e| {
            SimError::OutputIo {
                path,
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            }
        })
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(w) = self.results.as_mut() {
            w.flush().map_err(|e| SimError::OutputIo {
                path: self.out_dir.clone(),
                source: e,
            })?;
        }
        for w in self.ts_files.values_mut() {
            w.flush().ok();
        }
        Ok(())
    }
}
