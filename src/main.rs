use clap::Parser;
use rillsim::config;
use rillsim::dem;
use rillsim::error::{Result, SimError};
use rillsim::numerics::SplashSpline;
use rillsim::output::{GeoRef, OutputWriter};
use rillsim::sim::Simulation;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rillsim")]
#[command(about = "Simulate rill erosion on a bare-soil plot under rainfall")]
struct Args {
    /// Path to the run-data file
    run_file: PathBuf,

    /// Output directory (defaults to the run file's directory)
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Override the configured simulation duration (seconds)
    #[arg(long)]
    duration: Option<f64>,

    /// Override the rainfall RNG seed
    #[arg(long)]
    seed0: Option<u32>,

    /// Override the flow RNG seed
    #[arg(long)]
    seed1: Option<u32>,

    /// Suppress the per-iteration progress table
    #[arg(short, long)]
    quiet: bool,
}

fn run(args: &Args) -> Result<()> {
    let mut params = config::parse_run_file(&args.run_file)?;

    if let Some(duration) = args.duration {
        if duration <= 0.0 {
            return Err(SimError::BadCliParameter(format!(
                "--duration must be positive, got {duration}"
            )));
        }
        params.simulation_duration = duration;
    }
    if let Some(seed) = args.seed0 {
        params.rain_seed = seed;
    }
    if let Some(seed) = args.seed1 {
        params.flow_seed = seed;
    }

    // The DEM fixes the grid shape, the cell side, and the georeferencing
    let dem_grid = dem::read_ascii_grid(&params.dem_file)?;
    let z_factor = params.dem_z_units.to_mm();
    let cell_side = dem_grid.cellsize * z_factor;

    let mut elevations = dem_grid.raster.clone();
    if z_factor != 1.0 {
        for (_, _, v) in elevations.iter_mut() {
            *v *= z_factor;
        }
    }

    let rain_var = params
        .rain_variation_file
        .as_ref()
        .map(|p| dem::read_ascii_grid(p))
        .transpose()?
        .map(|g| g.raster);

    // Splash attenuation: splined from the input table, or flat unity when
    // splash is disabled
    let spline = match (&params.splash_attenuation_file, params.enable_splash) {
        (Some(path), true) => {
            let (depths, effs) = config::read_splash_table(path, params.drop_diameter)?;
            SplashSpline::new(depths, effs)
        }
        (None, true) => {
            return Err(SimError::Config(
                "enable_splash is set but no splash_attenuation_file is given".into(),
            ))
        }
        _ => SplashSpline::new(vec![0.0, 1.0e6], vec![1.0, 1.0]),
    };

    let mut sim = Simulation::new(params, &elevations, cell_side, rain_var.as_ref(), spline)?;

    let out_dir = args
        .out_dir
        .clone()
        .or_else(|| args.run_file.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."));
    let geo = GeoRef {
        cellsize: dem_grid.cellsize,
        xllcorner: dem_grid.xllcorner,
        yllcorner: dem_grid.yllcorner,
        nodata: dem_grid.nodata,
    };
    let mut outputs = OutputWriter::new(&sim, &out_dir, geo, args.quiet)?;

    while !sim.is_finished() {
        let summary = sim.step()?;
        outputs.after_iteration(&sim, &summary)?;
    }

    outputs.write_manifest(&sim)?;
    outputs.flush()?;

    tracing::info!(
        iterations = sim.iteration,
        simulated_seconds = sim.elapsed,
        "run complete"
    );
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rillsim=info".parse().unwrap()))
        .with_target(false)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("rillsim: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
