//! The simulation driver: adaptive timestep control, the per-iteration
//! process ordering, the mass-balance ledger, and the stability checks.

use crate::error::{Result, SimError, StabilityQuantity};
use crate::flow::{self, FlowCtx};
use crate::grid::{Grid, Inundation, DIR_NONE};
use crate::headcut;
use crate::infilt;
use crate::numerics::{KahanSum, SplashSpline};
use crate::params::RunParams;
use crate::rain::RainState;
use crate::raster::Raster;
use crate::rng::TauswortheRng;
use crate::slump::{self, ShearPatch};
use crate::soil;
use crate::splash;
use crate::transport;
use tracing::warn;

/// Hard cap on the mean per-cell depth an iteration may move by flow or
/// splash (mm).
pub const STABILITY_CAP_FLOW: f64 = 10.0;
/// Hard cap for the mass-movement processes (mm).
pub const STABILITY_CAP_MASS_MOVEMENT: f64 = 100.0;

/// Cumulative mass-balance drift per active cell that earns a warning (mm).
pub const MASS_BALANCE_WARN: f64 = 1.0e-2;
/// Drift per active cell that aborts the run (mm).
pub const MASS_BALANCE_FATAL: f64 = 1.0;

/// Smallest allowed timestep (s).
const MIN_TIMESTEP: f64 = 1.0e-6;

/// Everything the per-iteration results table wants to know.
#[derive(Clone, Copy, Debug, Default)]
pub struct IterationSummary {
    pub iteration: u64,
    pub elapsed: f64,
    pub dt: f64,
    pub wet_cells: usize,
    pub rain: f64,
    pub runon: f64,
    pub infiltration: f64,
    pub exfiltration: f64,
    pub surface_water: f64,
    pub water_off_edge: f64,
    pub flow_detach: f64,
    pub flow_deposit: f64,
    pub splash_detach: f64,
    pub splash_deposit: f64,
    pub slump_detach: f64,
    pub slump_deposit: f64,
    pub topple_detach: f64,
    pub topple_deposit: f64,
    pub headcut_detach: f64,
    pub headcut_deposit: f64,
    pub sed_load: [f64; 3],
    pub sed_off_edge: [f64; 3],
    pub splash_off_edge: f64,
    pub infilt_deposit: f64,
}

/// Kahan-compensated grand totals over the whole run.
#[derive(Default)]
pub struct GrandTotals {
    pub rain: KahanSum,
    pub runon: KahanSum,
    pub water_off_edge: KahanSum,
    pub infiltration: KahanSum,
    pub exfiltration: KahanSum,
    pub flow_detach: KahanSum,
    pub flow_deposit: KahanSum,
    pub sed_off_edge: [KahanSum; 3],
    pub splash_detach: KahanSum,
    pub splash_deposit: KahanSum,
    pub splash_off_edge: KahanSum,
    pub slump_detach: KahanSum,
    pub slump_deposit: KahanSum,
    pub topple_detach: KahanSum,
    pub topple_deposit: KahanSum,
    pub headcut_detach: KahanSum,
    pub headcut_deposit: KahanSum,
    pub infilt_deposit: KahanSum,
}

/// Start-of-iteration mass totals, for the per-iteration balance check.
#[derive(Clone, Copy, Debug, Default)]
struct MassSnapshot {
    water: f64,
    sediment: [f64; 3],
}

pub struct Simulation {
    pub grid: Grid,
    pub params: RunParams,
    pub rain_state: RainState,
    rain_rng: TauswortheRng,
    flow_rng: TauswortheRng,
    spline: SplashSpline,
    patch: Option<ShearPatch>,
    settling: [f64; 3],

    pub dt: f64,
    pub elapsed: f64,
    pub iteration: u64,
    last_iter_avg_head: f64,
    last_slump_time: f64,
    ke_since_splash: f64,
    splash_forward: bool,
    last_wet_cells: usize,

    pub totals: GrandTotals,
    water_drift: KahanSum,
    sediment_drift: [KahanSum; 3],
}

impl Simulation {
    /// Assemble a runnable simulation from parsed inputs. The DEM is in mm
    /// with NaN for missing cells; the spline comes from the splash
    /// attenuation table (a flat unity curve when splash is disabled).
    pub fn new(
        params: RunParams,
        dem: &Raster<f64>,
        cell_side: f64,
        rain_var: Option<&Raster<f64>>,
        spline: SplashSpline,
    ) -> Result<Self> {
        if params.layers.is_empty() {
            return Err(SimError::Config("at least one soil layer is required".into()));
        }
        if params.infilt_interval == 0 || params.slump_interval == 0 {
            return Err(SimError::Config(
                "infilt_interval and slump_interval must be at least 1".into(),
            ));
        }
        if params.drop_diameter <= 0.0 {
            return Err(SimError::Config("drop_diameter must be positive".into()));
        }
        if !params.time_varying_rain && params.rain_intensity > 0.0 && params.rain_duration <= 0.0 {
            return Err(SimError::Config(
                "rain_duration must be positive when rain_intensity is set".into(),
            ));
        }

        // Roughly 130 f64 fields per cell across the state rasters; refuse
        // grids whose footprint cannot even be expressed
        dem.width
            .checked_mul(dem.height)
            .and_then(|c| c.checked_mul(130 * 8))
            .ok_or_else(|| {
                SimError::OutOfMemory(format!("grid of {}x{} cells", dem.width, dem.height))
            })?;

        let mut grid = Grid::new(dem, cell_side, &params);
        if grid.n_active_cells == 0 {
            return Err(SimError::Config("the DEM contains no active cells".into()));
        }

        if let Some(rv) = rain_var {
            if rv.width != grid.nx || rv.height != grid.ny {
                return Err(SimError::Config(format!(
                    "rain variation raster is {}x{} but the DEM is {}x{}",
                    rv.width, rv.height, grid.nx, grid.ny
                )));
            }
            for (x, y, &m) in rv.iter() {
                if !m.is_nan() {
                    grid.rain_var.set(x, y, m);
                }
            }
        }

        let patch = params
            .enable_slumping
            .then(|| ShearPatch::new(params.patch_size, cell_side));

        let rain_state = RainState::new(&params, &grid);
        let dt = if rain_state.is_raining() {
            params.timestep_rain
        } else {
            params.timestep_dry
        };

        Ok(Self {
            rain_rng: TauswortheRng::new(params.rain_seed),
            flow_rng: TauswortheRng::new(params.flow_seed),
            settling: transport::settling_speeds(&params),
            rain_state,
            spline,
            patch,
            dt,
            elapsed: 0.0,
            iteration: 0,
            last_iter_avg_head: 0.0,
            last_slump_time: 0.0,
            ke_since_splash: 0.0,
            splash_forward: true,
            last_wet_cells: 0,
            totals: GrandTotals::default(),
            water_drift: KahanSum::new(),
            sediment_drift: Default::default(),
            grid,
            params,
        })
    }

    /// True once simulated time is up, or the rain has ended and the plot
    /// has drained dry.
    pub fn is_finished(&self) -> bool {
        if self.elapsed >= self.params.simulation_duration {
            return true;
        }
        self.iteration > 0 && self.rain_is_over() && self.last_wet_cells == 0
    }

    fn rain_is_over(&self) -> bool {
        if self.params.time_varying_rain {
            !self.rain_state.is_raining()
                && self
                    .params
                    .rain_schedule
                    .iter()
                    .all(|&(t, i)| t <= self.elapsed || i == 0.0)
        } else {
            self.elapsed > self.params.rain_duration
        }
    }

    /// Advance the simulation by one iteration.
    pub fn step(&mut self) -> Result<IterationSummary> {
        self.iteration += 1;
        let dt = self.dt;
        let slump_this_iter = self.params.enable_slumping
            && self.iteration % self.params.slump_interval as u64 == 0;
        let infilt_this_iter = self.params.enable_infiltration
            && self.iteration % self.params.infilt_interval as u64 == 0;

        let start = self.snapshot();
        self.reset_per_iteration_state(slump_this_iter);

        // 1: rainfall and run-on
        self.rain_state.update_intensity(&self.params, self.elapsed);
        let added = self.rain_state.fall_rain(
            &mut self.grid,
            &self.params,
            &mut self.rain_rng,
            &mut self.flow_rng,
            dt,
            self.elapsed,
        );
        let runon = if self.params.any_runon() {
            self.rain_state.fall_runon(
                &mut self.grid,
                &self.params,
                &mut self.rain_rng,
                &mut self.flow_rng,
                dt,
                self.elapsed,
            )
        } else {
            0.0
        };
        self.ke_since_splash += added.kinetic_energy;

        // 2: flow routing, with inline detachment/deposition
        if self.params.enable_flow_erosion {
            soil::init_staged(&mut self.grid);
        }
        let flow_out = {
            let ctx = FlowCtx {
                params: &self.params,
                dt,
                last_iter_avg_head: self.last_iter_avg_head,
                patch: self.patch.as_ref(),
                settling_speed: self.settling,
            };
            flow::route_all(&mut self.grid, &ctx, &mut self.flow_rng)
        };

        // 3: infiltration / exfiltration on its own cadence
        let infilt_out = if infilt_this_iter {
            infilt::do_all_infiltration(&mut self.grid, &self.params, dt, self.elapsed)
        } else {
            infilt::InfiltOutcome::default()
        };

        // 4: splash, once enough raindrop energy has accumulated
        let splash_out = if self.params.enable_splash
            && self.ke_since_splash > self.params.splash_ke_threshold
        {
            let out = splash::do_all_splash(&mut self.grid, &self.params, &self.spline, self.splash_forward);
            self.splash_forward = !self.splash_forward;
            self.ke_since_splash = 0.0;
            out
        } else {
            splash::SplashOutcome::default()
        };

        // 5: slump and topple on their own cadence
        let slump_out = if slump_this_iter {
            let interval = self.elapsed + dt - self.last_slump_time;
            let out = slump::do_all_slump(&mut self.grid, &self.params, interval);
            self.last_slump_time = self.elapsed + dt;
            // The accumulated stress has been consumed by this pass
            self.grid.shear_stress.fill(0.0);
            out
        } else {
            slump::SlumpOutcome::default()
        };

        // 6: headcut retreat
        let headcut_out = if self.params.enable_headcut_retreat {
            headcut::do_all_headcut_retreat(&mut self.grid, &self.params)
        } else {
            headcut::HeadcutOutcome::default()
        };

        // 7: fold the staged layer thicknesses into the committed fields
        if self.params.enable_flow_erosion {
            soil::commit_staged(&mut self.grid);
        }

        self.elapsed += dt;
        self.last_wet_cells = self.grid.count_wet_cells();

        // Depth-averaging accumulator
        for y in 0..self.grid.ny {
            for x in 0..self.grid.nx {
                let d = *self.grid.water_depth.get(x, y);
                *self.grid.cumul_water_depth.get_mut(x, y) += d;
            }
        }

        let summary = self.build_summary(
            dt,
            added.rain_depth,
            runon,
            &flow_out,
            &infilt_out,
            &splash_out,
            &slump_out,
            &headcut_out,
        );

        self.accumulate_totals(&summary);
        self.check_mass_balance(&start, &summary)?;
        self.check_stability(&summary)?;

        // Courant-limited, damped timestep for the next iteration
        self.update_timestep(flow_out.max_speed);
        self.last_iter_avg_head = if flow_out.num_heads > 0 {
            flow_out.total_head / flow_out.num_heads as f64
        } else {
            0.0
        };

        Ok(summary)
    }

    fn snapshot(&self) -> MassSnapshot {
        MassSnapshot {
            water: self.grid.total_surface_water() + self.grid.total_soil_water(),
            sediment: [
                self.grid.total_soil_thickness(0) + self.grid.total_sed_load(0),
                self.grid.total_soil_thickness(1) + self.grid.total_sed_load(1),
                self.grid.total_soil_thickness(2) + self.grid.total_sed_load(2),
            ],
        }
    }

    fn reset_per_iteration_state(&mut self, slump_this_iter: bool) {
        let g = &mut self.grid;
        g.rain.fill(0.0);
        g.runon.fill(0.0);
        g.water_lost.fill(0.0);
        g.stream_power.fill(0.0);
        g.transport_capacity.fill(0.0);
        g.flow_dir.fill(DIR_NONE);
        g.inundation.fill(Inundation::Dry as u8);
        g.flow_ledger.zero_this_iter();
        g.splash_ledger.zero_this_iter();
        g.headcut_ledger.zero_this_iter();
        g.infilt.fill(0.0);
        g.exfilt.fill(0.0);
        for c in 0..3 {
            g.sed_removed[c].fill(0.0);
            g.sed_off_edge[c].fill(0.0);
            g.splash_off_edge[c].fill(0.0);
            g.sed_from_splash[c].fill(0.0);
            g.sed_from_headcut[c].fill(0.0);
            g.infilt_deposit[c].fill(0.0);
        }
        if slump_this_iter {
            g.slump_ledger.zero_this_iter();
            g.topple_ledger.zero_this_iter();
            for c in 0..3 {
                g.sed_from_slump[c].fill(0.0);
                g.sed_from_topple[c].fill(0.0);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_summary(
        &self,
        dt: f64,
        rain: f64,
        runon: f64,
        flow_out: &flow::FlowOutcome,
        infilt_out: &infilt::InfiltOutcome,
        splash_out: &splash::SplashOutcome,
        slump_out: &slump::SlumpOutcome,
        headcut_out: &headcut::HeadcutOutcome,
    ) -> IterationSummary {
        IterationSummary {
            iteration: self.iteration,
            elapsed: self.elapsed,
            dt,
            wet_cells: self.last_wet_cells,
            rain,
            runon,
            infiltration: infilt_out.infiltration,
            exfiltration: infilt_out.exfiltration,
            surface_water: self.grid.total_surface_water(),
            water_off_edge: flow_out.water_off_edge,
            flow_detach: self.grid.flow_ledger.detach_total(),
            flow_deposit: self.grid.flow_ledger.deposit_total(),
            splash_detach: splash_out.detach.iter().sum(),
            splash_deposit: splash_out.deposit.iter().sum::<f64>()
                + splash_out.to_sed_load.iter().sum::<f64>(),
            slump_detach: slump_out.slump_detach.iter().sum(),
            slump_deposit: slump_out.slump_deposit.iter().sum::<f64>()
                + slump_out.slump_to_sed_load.iter().sum::<f64>(),
            topple_detach: slump_out.topple_detach.iter().sum(),
            topple_deposit: slump_out.topple_deposit.iter().sum::<f64>()
                + slump_out.topple_to_sed_load.iter().sum::<f64>(),
            headcut_detach: headcut_out.detach.iter().sum(),
            headcut_deposit: headcut_out.deposit.iter().sum::<f64>()
                + headcut_out.to_sed_load.iter().sum::<f64>(),
            sed_load: [
                self.grid.total_sed_load(0),
                self.grid.total_sed_load(1),
                self.grid.total_sed_load(2),
            ],
            // The per-cell ledger covers both suspended load carried off
            // and soil detached straight over the edge
            sed_off_edge: [
                self.grid.sed_off_edge[0].sum(),
                self.grid.sed_off_edge[1].sum(),
                self.grid.sed_off_edge[2].sum(),
            ],
            splash_off_edge: splash_out.off_edge.iter().sum(),
            infilt_deposit: infilt_out.deposit.iter().sum(),
        }
    }

    fn accumulate_totals(&mut self, s: &IterationSummary) {
        let t = &mut self.totals;
        t.rain.add(s.rain);
        t.runon.add(s.runon);
        t.water_off_edge.add(s.water_off_edge);
        t.infiltration.add(s.infiltration);
        t.exfiltration.add(s.exfiltration);
        t.flow_detach.add(s.flow_detach);
        t.flow_deposit.add(s.flow_deposit);
        for c in 0..3 {
            t.sed_off_edge[c].add(s.sed_off_edge[c]);
        }
        t.splash_detach.add(s.splash_detach);
        t.splash_deposit.add(s.splash_deposit);
        t.splash_off_edge.add(s.splash_off_edge);
        t.slump_detach.add(s.slump_detach);
        t.slump_deposit.add(s.slump_deposit);
        t.topple_detach.add(s.topple_detach);
        t.topple_deposit.add(s.topple_deposit);
        t.headcut_detach.add(s.headcut_detach);
        t.headcut_deposit.add(s.headcut_deposit);
        t.infilt_deposit.add(s.infilt_deposit);
    }

    /// Per-iteration conservation identities: water against its sources and
    /// sinks, and each sediment class against its off-edge losses.
    fn check_mass_balance(&mut self, start: &MassSnapshot, s: &IterationSummary) -> Result<()> {
        let end = self.snapshot();
        let n = self.grid.n_active_cells as f64;

        let expected_water = s.rain + s.runon - s.water_off_edge;
        let water_drift = (end.water - start.water) - expected_water;
        self.water_drift.add(water_drift.abs());
        let per_cell = self.water_drift.get() / n;
        if per_cell > MASS_BALANCE_FATAL {
            return Err(SimError::MassBalance {
                quantity: "water",
                drift: per_cell,
                iteration: self.iteration,
            });
        }
        if per_cell > MASS_BALANCE_WARN {
            warn!(
                iteration = self.iteration,
                drift_per_cell = per_cell,
                "cumulative water mass-balance drift"
            );
        }

        let splash_off = [
            self.grid.splash_off_edge[0].sum(),
            self.grid.splash_off_edge[1].sum(),
            self.grid.splash_off_edge[2].sum(),
        ];
        for c in 0..3 {
            let drift =
                (end.sediment[c] - start.sediment[c]) + s.sed_off_edge[c] + splash_off[c];
            self.sediment_drift[c].add(drift.abs());
            let per_cell = self.sediment_drift[c].get() / n;
            if per_cell > MASS_BALANCE_FATAL {
                return Err(SimError::MassBalance {
                    quantity: ["clay", "silt", "sand"][c],
                    drift: per_cell,
                    iteration: self.iteration,
                });
            }
            if per_cell > MASS_BALANCE_WARN {
                warn!(
                    iteration = self.iteration,
                    class = ["clay", "silt", "sand"][c],
                    drift_per_cell = per_cell,
                    "cumulative sediment mass-balance drift"
                );
            }
        }

        Ok(())
    }

    fn check_stability(&self, s: &IterationSummary) -> Result<()> {
        let n = self.grid.n_active_cells as f64;
        let checks = [
            (StabilityQuantity::FlowDetach, s.flow_detach, STABILITY_CAP_FLOW),
            (StabilityQuantity::FlowDeposit, s.flow_deposit, STABILITY_CAP_FLOW),
            (
                StabilityQuantity::TransportRate,
                self.grid.transport_capacity.sum(),
                STABILITY_CAP_FLOW,
            ),
            (StabilityQuantity::SplashDetach, s.splash_detach, STABILITY_CAP_FLOW),
            (StabilityQuantity::SplashDeposit, s.splash_deposit, STABILITY_CAP_FLOW),
            (
                StabilityQuantity::SlumpDetach,
                s.slump_detach,
                STABILITY_CAP_MASS_MOVEMENT,
            ),
            (
                StabilityQuantity::ToppleDetach,
                s.topple_detach,
                STABILITY_CAP_MASS_MOVEMENT,
            ),
        ];

        for (quantity, total, cap) in checks {
            let mean = total / n;
            if mean > cap {
                return Err(SimError::Stability {
                    quantity,
                    value: mean,
                    cap,
                    iteration: self.iteration,
                });
            }
        }
        Ok(())
    }

    /// Choose the next timestep: v_max * dt <= alpha * cell side, with the
    /// per-step change damped.
    fn update_timestep(&mut self, max_speed: f64) {
        let default = if self.rain_state.is_raining() {
            self.params.timestep_rain
        } else {
            self.params.timestep_dry
        };

        let target = if max_speed > 0.0 {
            self.params.courant_alpha * self.grid.cell_side / max_speed
        } else {
            default
        };

        let lo = 1.0 - self.params.max_timestep_change;
        let hi = 1.0 + self.params.max_timestep_change;
        let ratio = (target / self.dt).clamp(lo, hi);
        self.dt = (self.dt * ratio).clamp(MIN_TIMESTEP, self.params.timestep_dry);
    }

    /// Mean elevation change since setup (mm, negative is net erosion).
    pub fn mean_elevation_change(&self) -> f64 {
        let mut total = 0.0;
        for y in 0..self.grid.ny {
            for x in 0..self.grid.nx {
                if !self.grid.is_missing(x, y) {
                    total += self.grid.soil_surface_elevation(x, y) - self.grid.init_elev.get(x, y);
                }
            }
        }
        total / self.grid.n_active_cells as f64
    }
}
