//! Run parameters and configuration types.

use serde::Serialize;
use std::path::PathBuf;

/// Flow-speed model for the routing kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FrictionModel {
    /// Manning-type equation with a configured roughness n
    Manning,
    /// Darcy-Weisbach with a constant friction factor
    DarcyWeisbachConstant,
    /// Darcy-Weisbach with ff = A * Re^B (explicit: Re uses the previous
    /// iteration's velocity)
    DarcyWeisbachReynolds,
    /// Darcy-Weisbach with the Lawrence (1997) three-regime friction factor
    DarcyWeisbachLawrence,
}

impl std::fmt::Display for FrictionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manning => write!(f, "manning"),
            Self::DarcyWeisbachConstant => write!(f, "dw_constant"),
            Self::DarcyWeisbachReynolds => write!(f, "dw_reynolds"),
            Self::DarcyWeisbachLawrence => write!(f, "dw_lawrence"),
        }
    }
}

/// Which erodibility triple a mass-movement process withdraws with.
///
/// The established behaviour charges both toppling and headcut retreat to
/// the slump erodibilities; this is kept as the default but is switchable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ErodibilitySource {
    Slump,
    Flow,
}

/// One soil layer as configured, ordered top-first in `RunParams::layers`.
#[derive(Clone, Debug, Serialize)]
pub struct SoilLayerParams {
    pub name: String,
    /// Layer thickness (mm). The top layer absorbs any remainder when a
    /// basement elevation is configured.
    pub thickness: f64,
    pub percent_clay: f64,
    pub percent_silt: f64,
    pub percent_sand: f64,
    /// Bulk density (kg/m3)
    pub bulk_density: f64,
    /// Normalised 0-1 erodibilities, [clay, silt, sand]
    pub flow_erodibility: [f64; 3],
    pub splash_erodibility: [f64; 3],
    pub slump_erodibility: [f64; 3],
    /// Green-Ampt air-entry head (cm)
    pub ga_air_head: f64,
    /// Green-Ampt pore-size distribution index lambda
    pub ga_lambda: f64,
    /// Saturated volumetric water content theta_sat
    pub ga_theta_sat: f64,
    /// Initial volumetric water content theta_init
    pub ga_theta_init: f64,
    /// Saturated hydraulic conductivity (cm/h)
    pub ga_k_sat: f64,
}

/// Per-edge behaviour: top, right, bottom, left (indexable by `Edge`).
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct EdgeParams {
    /// Closed edges route like interior cells; open edges may discharge
    pub closed: bool,
    /// Run-on from a virtual contributing strip beyond this edge
    pub runon: bool,
    /// Length of the contributing strip, orthogonal to the edge (mm)
    pub runon_length: f64,
    /// Flow speed across the strip (mm/s), sets the arrival ramp
    pub runon_speed: f64,
    /// Rain multiplier over the strip
    pub runon_rain_variation: f64,
}

/// Z units of the input DEM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ZUnits {
    Mm,
    Cm,
    M,
}

impl ZUnits {
    /// Conversion factor to mm.
    pub fn to_mm(self) -> f64 {
        match self {
            Self::Mm => 1.0,
            Self::Cm => 10.0,
            Self::M => 1000.0,
        }
    }
}

/// Everything a run needs, parsed from the run-data file.
#[derive(Clone, Debug, Serialize)]
pub struct RunParams {
    pub run_name: String,

    // Input files (resolved relative to the run file)
    pub dem_file: PathBuf,
    pub rain_variation_file: Option<PathBuf>,
    pub splash_attenuation_file: Option<PathBuf>,
    pub dem_z_units: ZUnits,

    // =========================================================================
    // Time
    // =========================================================================
    /// Duration of the simulation (s)
    pub simulation_duration: f64,
    /// Duration of rainfall (s), for time-invariant rain
    pub rain_duration: f64,
    /// Initial timestep while raining (s)
    pub timestep_rain: f64,
    /// Initial timestep once rain has stopped (s)
    pub timestep_dry: f64,
    /// Courant-like limit: v_max * dt <= alpha * cell side
    pub courant_alpha: f64,
    /// Maximum relative change of dt per iteration
    pub max_timestep_change: f64,

    // =========================================================================
    // Rainfall
    // =========================================================================
    /// Rain intensity (mm/h)
    pub rain_intensity: f64,
    /// Coefficient of variation of rain intensity
    pub rain_intensity_cv: f64,
    /// Mean raindrop diameter (mm)
    pub drop_diameter: f64,
    /// Standard deviation of raindrop diameter (mm)
    pub drop_diameter_std: f64,
    /// Raindrop fall speed (m/s)
    pub rain_speed: f64,
    pub time_varying_rain: bool,
    /// (time s, intensity mm/h) pairs, ascending in time
    pub rain_schedule: Vec<(f64, f64)>,

    /// Top, right, bottom, left
    pub edges: [EdgeParams; 4],

    // =========================================================================
    // Flow
    // =========================================================================
    pub friction_model: FrictionModel,
    pub ff_constant: f64,
    pub ff_reynolds_a: f64,
    pub ff_reynolds_b: f64,
    /// Lawrence roughness height epsilon (mm)
    pub ff_lawrence_epsilon: f64,
    pub ff_lawrence_pr: f64,
    pub ff_lawrence_cd: f64,
    /// Manning roughness n
    pub manning_n: f64,
    /// Clamp on computed flow speed (mm/s)
    pub max_flow_speed: f64,
    /// Off-edge head = last-iteration mean head * this constant
    pub off_edge_head_const: f64,
    /// Flume mode: all suspended sediment leaves with edge outflow
    pub flume: bool,

    // =========================================================================
    // Process switches
    // =========================================================================
    pub enable_flow_erosion: bool,
    pub enable_splash: bool,
    pub enable_slumping: bool,
    pub enable_headcut_retreat: bool,
    pub enable_infiltration: bool,

    /// Run infiltration every this many iterations
    pub infilt_interval: usize,
    /// Run slump/topple every this many iterations
    pub slump_interval: usize,
    /// Cumulative rain KE (J) between splash passes; 0 = every rainy step
    pub splash_ke_threshold: f64,

    // =========================================================================
    // Soil
    // =========================================================================
    /// Ordered top-first
    pub layers: Vec<SoilLayerParams>,
    /// Basement elevation (mm); when set, the top layer's thickness is the
    /// DEM surface minus basement minus the deeper layers
    pub basement_elevation: Option<f64>,

    // Sediment size class boundaries (mm)
    pub clay_min: f64,
    pub clay_silt_boundary: f64,
    pub silt_sand_boundary: f64,
    pub sand_max: f64,
    /// Grain density used for settling-speed calculations (kg/m3)
    pub deposition_grain_density: f64,

    // Fluid constants
    /// Water density (kg/m3)
    pub rho: f64,
    /// Gravity (m/s2)
    pub g: f64,
    /// Kinematic viscosity (m2/s)
    pub nu: f64,

    // =========================================================================
    // Flow erosion (Nearing) constants
    // =========================================================================
    pub nearing_alpha: f64,
    pub nearing_beta: f64,
    pub nearing_gamma: f64,
    pub nearing_delta: f64,
    /// Detachment coefficient K (kg/m3)
    pub nearing_k: f64,
    /// Soil tensile strength T (Pa-scaled, matches the tau units of the
    /// detachment expression)
    pub nearing_t: f64,
    /// Coefficient of variation of T
    pub cv_t: f64,
    /// Coefficient of variation of tau_b
    pub cv_taub: f64,
    /// Erosion on edge cells never cuts below this elevation (mm)
    pub base_level: Option<f64>,

    // =========================================================================
    // Slump / topple
    // =========================================================================
    pub critical_shear_stress: f64,
    /// Angle of rest for slumping, as a percent slope
    pub slump_angle_of_rest_percent: f64,
    /// Critical angle for toppling, percent slope
    pub topple_critical_angle_percent: f64,
    /// Angle of rest after toppling, percent slope
    pub topple_angle_of_rest_percent: f64,
    /// Side of the shear-stress distribution patch (mm)
    pub patch_size: f64,
    pub topple_erodibility: ErodibilitySource,

    // =========================================================================
    // Splash
    // =========================================================================
    /// Splash efficiency: elevation change per joule of drop KE per unit
    /// Laplacian
    pub splash_efficiency: f64,

    // =========================================================================
    // Headcut retreat
    // =========================================================================
    pub headcut_retreat_const: f64,
    pub headcut_erodibility: ErodibilitySource,

    // =========================================================================
    // RNG and output
    // =========================================================================
    pub rain_seed: u32,
    pub flow_seed: u32,
    /// Save rasters every this many simulated seconds (if no explicit list)
    pub save_interval: Option<f64>,
    /// Explicit save times (s), ascending
    pub save_times: Vec<f64>,
    pub output_fields: Vec<String>,
    pub timeseries_fields: Vec<String>,
    pub png_output: bool,
    /// Emit a progress row every this many iterations
    pub progress_interval: usize,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            run_name: "run".to_string(),
            dem_file: PathBuf::new(),
            rain_variation_file: None,
            splash_attenuation_file: None,
            dem_z_units: ZUnits::Mm,

            simulation_duration: 60.0,
            rain_duration: 60.0,
            timestep_rain: 5.0e-4,      // s, while raining
            timestep_dry: 5.0e-2,       // s, once rain has stopped
            courant_alpha: 0.95,
            max_timestep_change: 0.01,  // at most 1% change per iteration

            rain_intensity: 60.0,       // mm/h
            rain_intensity_cv: 0.0,
            drop_diameter: 2.0,         // mm
            drop_diameter_std: 0.0,
            rain_speed: 6.0,            // m/s terminal velocity
            time_varying_rain: false,
            rain_schedule: Vec::new(),

            edges: [EdgeParams::default(); 4],

            friction_model: FrictionModel::DarcyWeisbachConstant,
            ff_constant: 0.1,
            ff_reynolds_a: 24.0,
            ff_reynolds_b: -0.3,
            ff_lawrence_epsilon: 1.0,   // mm
            ff_lawrence_pr: 0.5,
            ff_lawrence_cd: 0.4,
            manning_n: 0.03,
            max_flow_speed: 10000.0,    // mm/s
            off_edge_head_const: 1.0,
            flume: false,

            enable_flow_erosion: true,
            enable_splash: true,
            enable_slumping: true,
            enable_headcut_retreat: true,
            enable_infiltration: false,

            infilt_interval: 4,
            slump_interval: 10,
            splash_ke_threshold: 0.0,

            layers: Vec::new(),
            basement_elevation: None,

            clay_min: 0.0,
            clay_silt_boundary: 0.002,  // mm
            silt_sand_boundary: 0.0625, // mm
            sand_max: 2.0,              // mm
            deposition_grain_density: 2650.0,

            rho: 1000.0,
            g: 9.81,
            nu: 1.0e-6,

            nearing_alpha: -34.47,
            nearing_beta: 38.61,
            nearing_gamma: 0.845,
            nearing_delta: 0.412,
            nearing_k: 440.54,          // kg/m3, Lei et al. (1998)
            nearing_t: 1100.0,
            cv_t: 0.4,
            cv_taub: 0.4,
            base_level: None,

            critical_shear_stress: 0.25,
            slump_angle_of_rest_percent: 45.0,
            topple_critical_angle_percent: 80.0,
            topple_angle_of_rest_percent: 45.0,
            patch_size: 100.0,          // mm
            topple_erodibility: ErodibilitySource::Slump,

            splash_efficiency: 0.01,

            headcut_retreat_const: 0.01,
            headcut_erodibility: ErodibilitySource::Slump,

            rain_seed: 1,
            flow_seed: 2,
            save_interval: None,
            save_times: Vec::new(),
            output_fields: Vec::new(),
            timeseries_fields: Vec::new(),
            png_output: false,
            progress_interval: 100,
        }
    }
}

impl RunParams {
    /// Standard deviation of rain intensity (mm/h).
    pub fn rain_intensity_std(&self) -> f64 {
        self.rain_intensity * self.rain_intensity_cv
    }

    /// Mean water volume of one raindrop (mm3), from the mean diameter.
    pub fn mean_drop_volume(&self) -> f64 {
        std::f64::consts::PI * self.drop_diameter.powi(3) / 6.0
    }

    /// Standard deviation of drop volume (mm3), from the diameter spread.
    pub fn std_drop_volume(&self) -> f64 {
        let d = self.drop_diameter;
        let hi = d + self.drop_diameter_std;
        std::f64::consts::PI * (hi.powi(3) - d.powi(3)) / 6.0
    }

    /// Kinetic energy (J) delivered by 1 mm of rain depth on one cell of
    /// side `cell_side` mm: 0.5 * m * v^2 with the drop mass taken from the
    /// water column.
    pub fn rain_ke_per_mm(&self, cell_side: f64) -> f64 {
        let cell_area_m2 = (cell_side * 1.0e-3).powi(2);
        let mass_kg = self.rho * cell_area_m2 * 1.0e-3; // 1 mm of water
        0.5 * mass_kg * self.rain_speed * self.rain_speed
    }

    /// Representative grain diameter (m) of each size class, half the class
    /// width as the established convention has it.
    pub fn class_diameters_m(&self) -> [f64; 3] {
        [
            1.0e-3 * (self.clay_silt_boundary - self.clay_min) / 2.0,
            1.0e-3 * (self.silt_sand_boundary - self.clay_silt_boundary) / 2.0,
            1.0e-3 * (self.sand_max - self.silt_sand_boundary) / 2.0,
        ]
    }

    /// Is anything configured to produce run-on?
    pub fn any_runon(&self) -> bool {
        self.edges.iter().any(|e| e.runon)
    }
}
