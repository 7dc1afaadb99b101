//! Run-data file parsing.
//!
//! The run file is plain text: one `key value` (or `key = value`) pair per
//! line, `#` comments, case-insensitive keys, later duplicates winning.
//! Soil layers are indexed key groups (`layer_1_name`, `layer_1_thickness_mm`,
//! ...), ordered top-first.

use crate::error::{Result, SimError};
use crate::params::{
    EdgeParams, ErodibilitySource, FrictionModel, RunParams, SoilLayerParams, ZUnits,
};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

fn config_err(msg: impl std::fmt::Display) -> SimError {
    SimError::Config(msg.to_string())
}

/// Parsed key-value view of a run file.
struct KeyValues {
    map: HashMap<String, String>,
}

impl KeyValues {
    fn parse(text: &str) -> Result<Self> {
        let mut map = HashMap::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => match line.split_once(char::is_whitespace) {
                    Some((k, v)) => (k.trim(), v.trim()),
                    None => {
                        return Err(config_err(format!(
                            "line {}: '{}' is not a key-value pair",
                            lineno + 1,
                            line
                        )))
                    }
                },
            };
            if value.is_empty() {
                return Err(config_err(format!("line {}: key '{key}' has no value", lineno + 1)));
            }
            map.insert(key.to_ascii_lowercase(), value.to_string());
        }
        Ok(Self { map })
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| config_err(format!("missing required option '{key}'")))
    }

    fn f64_or(&self, key: &str, default: f64) -> Result<f64> {
        match self.get(key) {
            Some(v) => v
                .parse()
                .map_err(|_| config_err(format!("'{key}' is not a number: '{v}'"))),
            None => Ok(default),
        }
    }

    fn require_f64(&self, key: &str) -> Result<f64> {
        let v = self.require(key)?;
        v.parse()
            .map_err(|_| config_err(format!("'{key}' is not a number: '{v}'")))
    }

    fn usize_or(&self, key: &str, default: usize) -> Result<usize> {
        match self.get(key) {
            Some(v) => v
                .parse()
                .map_err(|_| config_err(format!("'{key}' is not an integer: '{v}'"))),
            None => Ok(default),
        }
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            Some("0") => Ok(false),
            Some("1") => Ok(true),
            Some(other) => Err(config_err(format!("'{key}' must be 0 or 1, got '{other}'"))),
            None => Ok(default),
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parse a run file from disk. Referenced paths are resolved relative to
/// the run file's directory.
pub fn parse_run_file(path: &Path) -> Result<RunParams> {
    let text = fs::read_to_string(path).map_err(|e| SimError::MissingInput {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_run_text(&text, base)
}

/// Parse run-file text against a base directory for relative paths.
pub fn parse_run_text(text: &str, base: &Path) -> Result<RunParams> {
    let kv = KeyValues::parse(text)?;
    let mut p = RunParams::default();

    if let Some(name) = kv.get("run_name") {
        p.run_name = name.to_string();
    }

    p.dem_file = base.join(kv.require("dem_file")?);
    p.rain_variation_file = kv.get("rain_variation_file").map(|f| base.join(f));
    p.splash_attenuation_file = kv.get("splash_attenuation_file").map(|f| base.join(f));
    p.dem_z_units = match kv.get("dem_z_units").unwrap_or("mm") {
        "mm" => ZUnits::Mm,
        "cm" => ZUnits::Cm,
        "m" => ZUnits::M,
        other => return Err(config_err(format!("dem_z_units must be mm, cm or m, got '{other}'"))),
    };

    p.simulation_duration = kv.require_f64("simulation_duration")?;
    p.rain_duration = kv.f64_or("rain_duration", p.simulation_duration)?;
    p.rain_intensity = kv.f64_or("rain_intensity", p.rain_intensity)?;
    p.rain_intensity_cv = kv.f64_or("rain_intensity_cv", p.rain_intensity_cv)?;
    p.drop_diameter = kv.f64_or("drop_diameter", p.drop_diameter)?;
    p.drop_diameter_std = kv.f64_or("drop_diameter_std", p.drop_diameter_std)?;
    p.rain_speed = kv.f64_or("rain_speed", p.rain_speed)?;

    p.time_varying_rain = kv.bool_or("time_varying_rain", false)?;
    if p.time_varying_rain {
        let raw = kv.require("rain_schedule")?;
        p.rain_schedule = parse_schedule(raw)?;
    }

    for (i, side) in ["top", "right", "bottom", "left"].iter().enumerate() {
        let mut e = EdgeParams {
            closed: kv.bool_or(&format!("{side}_closed"), false)?,
            runon: kv.bool_or(&format!("{side}_runon"), false)?,
            ..Default::default()
        };
        if e.runon {
            e.runon_length = kv.require_f64(&format!("{side}_runon_length_mm"))?;
            e.runon_speed = kv.require_f64(&format!("{side}_runon_speed_mm_per_s"))?;
            e.runon_rain_variation = kv.f64_or(&format!("{side}_runon_rain_variation"), 1.0)?;
        }
        p.edges[i] = e;
    }

    p.friction_model = match kv.get("friction_model").unwrap_or("dw_constant") {
        "manning" => FrictionModel::Manning,
        "dw_constant" => FrictionModel::DarcyWeisbachConstant,
        "dw_reynolds" => FrictionModel::DarcyWeisbachReynolds,
        "dw_lawrence" => FrictionModel::DarcyWeisbachLawrence,
        other => return Err(config_err(format!("unknown friction_model '{other}'"))),
    };
    p.ff_constant = kv.f64_or("ff_constant", p.ff_constant)?;
    p.ff_reynolds_a = kv.f64_or("ff_reynolds_a", p.ff_reynolds_a)?;
    p.ff_reynolds_b = kv.f64_or("ff_reynolds_b", p.ff_reynolds_b)?;
    p.ff_lawrence_epsilon = kv.f64_or("ff_lawrence_epsilon", p.ff_lawrence_epsilon)?;
    p.ff_lawrence_pr = kv.f64_or("ff_lawrence_pr", p.ff_lawrence_pr)?;
    p.ff_lawrence_cd = kv.f64_or("ff_lawrence_cd", p.ff_lawrence_cd)?;
    p.manning_n = kv.f64_or("manning_n", p.manning_n)?;
    p.max_flow_speed = kv.f64_or("max_flow_speed_mm_per_s", p.max_flow_speed)?;
    p.off_edge_head_const = kv.f64_or("off_edge_head_const", p.off_edge_head_const)?;
    p.flume = kv.bool_or("flume", false)?;

    p.enable_flow_erosion = kv.bool_or("enable_flow_erosion", true)?;
    p.enable_splash = kv.bool_or("enable_splash", true)?;
    p.enable_slumping = kv.bool_or("enable_slumping", true)?;
    p.enable_headcut_retreat = kv.bool_or("enable_headcut_retreat", true)?;
    p.enable_infiltration = kv.bool_or("enable_infiltration", false)?;

    p.infilt_interval = kv.usize_or("infilt_interval", p.infilt_interval)?;
    p.slump_interval = kv.usize_or("slump_interval", p.slump_interval)?;
    p.splash_ke_threshold = kv.f64_or("splash_ke_threshold", p.splash_ke_threshold)?;

    p.layers = parse_layers(&kv)?;
    if p.layers.is_empty() {
        return Err(config_err("at least one soil layer must be defined (layer_1_...)"));
    }
    p.basement_elevation = kv.get("basement_elevation").map(|v| v.parse()).transpose()
        .map_err(|_| config_err("basement_elevation is not a number"))?;

    p.clay_min = kv.f64_or("clay_min", p.clay_min)?;
    p.clay_silt_boundary = kv.f64_or("clay_silt", p.clay_silt_boundary)?;
    p.silt_sand_boundary = kv.f64_or("silt_sand", p.silt_sand_boundary)?;
    p.sand_max = kv.f64_or("sand_max", p.sand_max)?;
    if !(p.clay_min < p.clay_silt_boundary
        && p.clay_silt_boundary < p.silt_sand_boundary
        && p.silt_sand_boundary < p.sand_max)
    {
        return Err(config_err("sediment size boundaries must be strictly ascending"));
    }
    p.deposition_grain_density = kv.f64_or("deposition_grain_density", p.deposition_grain_density)?;

    p.rho = kv.f64_or("rho", p.rho)?;
    p.g = kv.f64_or("g", p.g)?;
    p.nu = kv.f64_or("nu", p.nu)?;

    p.nearing_alpha = kv.f64_or("nearing_alpha", p.nearing_alpha)?;
    p.nearing_beta = kv.f64_or("nearing_beta", p.nearing_beta)?;
    p.nearing_gamma = kv.f64_or("nearing_gamma", p.nearing_gamma)?;
    p.nearing_delta = kv.f64_or("nearing_delta", p.nearing_delta)?;
    p.nearing_k = kv.f64_or("nearing_k", p.nearing_k)?;
    p.nearing_t = kv.f64_or("nearing_t", p.nearing_t)?;
    p.cv_t = kv.f64_or("cv_t", p.cv_t)?;
    p.cv_taub = kv.f64_or("cv_taub", p.cv_taub)?;
    p.base_level = kv.get("base_level").map(|v| v.parse()).transpose()
        .map_err(|_| config_err("base_level is not a number"))?;

    p.critical_shear_stress = kv.f64_or("critical_shear_stress", p.critical_shear_stress)?;
    p.slump_angle_of_rest_percent =
        kv.f64_or("slump_angle_of_rest_percent", p.slump_angle_of_rest_percent)?;
    p.topple_critical_angle_percent =
        kv.f64_or("topple_critical_angle_percent", p.topple_critical_angle_percent)?;
    p.topple_angle_of_rest_percent =
        kv.f64_or("topple_angle_of_rest_percent", p.topple_angle_of_rest_percent)?;
    p.patch_size = kv.f64_or("patch_size_mm", p.patch_size)?;
    p.topple_erodibility = parse_erodibility_source(&kv, "topple_erodibility")?;

    p.splash_efficiency = kv.f64_or("splash_efficiency", p.splash_efficiency)?;

    p.headcut_retreat_const = kv.f64_or("headcut_retreat_const", p.headcut_retreat_const)?;
    p.headcut_erodibility = parse_erodibility_source(&kv, "headcut_erodibility")?;

    p.rain_seed = kv.usize_or("rain_seed", p.rain_seed as usize)? as u32;
    p.flow_seed = kv.usize_or("flow_seed", p.flow_seed as usize)? as u32;

    p.save_interval = kv.get("save_interval").map(|v| v.parse()).transpose()
        .map_err(|_| config_err("save_interval is not a number"))?;
    p.save_times = kv
        .list("save_times")
        .iter()
        .map(|s| s.parse().map_err(|_| config_err(format!("save time '{s}' is not a number"))))
        .collect::<Result<Vec<f64>>>()?;
    if p.save_times.windows(2).any(|w| w[0] >= w[1]) {
        return Err(config_err("save_times must be strictly ascending"));
    }
    p.output_fields = kv.list("output_fields");
    p.timeseries_fields = kv.list("timeseries_fields");
    p.png_output = kv.bool_or("png_output", false)?;
    p.progress_interval = kv.usize_or("progress_interval", p.progress_interval)?;

    Ok(p)
}

fn parse_erodibility_source(kv: &KeyValues, key: &str) -> Result<ErodibilitySource> {
    match kv.get(key).unwrap_or("slump") {
        "slump" => Ok(ErodibilitySource::Slump),
        "flow" => Ok(ErodibilitySource::Flow),
        other => Err(config_err(format!("'{key}' must be slump or flow, got '{other}'"))),
    }
}

/// Parse `t:intensity` pairs, comma-separated, ascending in time.
fn parse_schedule(raw: &str) -> Result<Vec<(f64, f64)>> {
    let mut schedule = Vec::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        let (t, i) = pair
            .split_once(':')
            .ok_or_else(|| config_err(format!("rain_schedule entry '{pair}' is not time:intensity")))?;
        let t: f64 = t
            .trim()
            .parse()
            .map_err(|_| config_err(format!("rain_schedule time '{t}' is not a number")))?;
        let i: f64 = i
            .trim()
            .parse()
            .map_err(|_| config_err(format!("rain_schedule intensity '{i}' is not a number")))?;
        schedule.push((t, i));
    }
    if schedule.windows(2).any(|w| w[0].0 >= w[1].0) {
        return Err(config_err("rain_schedule times must be strictly ascending"));
    }
    Ok(schedule)
}

fn parse_layers(kv: &KeyValues) -> Result<Vec<SoilLayerParams>> {
    let mut layers = Vec::new();
    for n in 1.. {
        let prefix = format!("layer_{n}_");
        if kv.get(&format!("{prefix}name")).is_none() {
            break;
        }

        let req = |suffix: &str| kv.require_f64(&format!("{prefix}{suffix}"));

        let layer = SoilLayerParams {
            name: kv.require(&format!("{prefix}name"))?.to_string(),
            thickness: req("thickness_mm")?,
            percent_clay: req("percent_clay")?,
            percent_silt: req("percent_silt")?,
            percent_sand: req("percent_sand")?,
            bulk_density: req("bulk_density")?,
            flow_erodibility: [
                req("flow_erodibility_clay")?,
                req("flow_erodibility_silt")?,
                req("flow_erodibility_sand")?,
            ],
            splash_erodibility: [
                req("splash_erodibility_clay")?,
                req("splash_erodibility_silt")?,
                req("splash_erodibility_sand")?,
            ],
            slump_erodibility: [
                req("slump_erodibility_clay")?,
                req("slump_erodibility_silt")?,
                req("slump_erodibility_sand")?,
            ],
            ga_air_head: req("ga_air_head")?,
            ga_lambda: req("ga_lambda")?,
            ga_theta_sat: req("ga_theta_sat")?,
            ga_theta_init: req("ga_theta_init")?,
            ga_k_sat: req("ga_k_sat")?,
        };

        let pct = layer.percent_clay + layer.percent_silt + layer.percent_sand;
        if (pct - 100.0).abs() > 0.5 {
            return Err(config_err(format!(
                "layer {n} size-class percentages sum to {pct}, expected 100"
            )));
        }

        layers.push(layer);
    }
    Ok(layers)
}

/// Read the splash attenuation table: two columns, `depth_multiplier
/// efficiency`, depths ascending. Depths are scaled by the drop diameter.
pub fn read_splash_table(path: &Path, drop_diameter: f64) -> Result<(Vec<f64>, Vec<f64>)> {
    let text = fs::read_to_string(path).map_err(|e| SimError::MissingInput {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut depths = Vec::new();
    let mut effs = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }

        let mut tokens = line.split_whitespace();
        let (Some(d), Some(e)) = (tokens.next(), tokens.next()) else {
            return Err(SimError::MissingInput {
                path: path.to_path_buf(),
                reason: format!("line {} is not a depth/efficiency pair", lineno + 1),
            });
        };
        let depth: f64 = d.parse().map_err(|_| SimError::MissingInput {
            path: path.to_path_buf(),
            reason: format!("bad depth '{d}' on line {}", lineno + 1),
        })?;
        let eff: f64 = e.parse().map_err(|_| SimError::MissingInput {
            path: path.to_path_buf(),
            reason: format!("bad efficiency '{e}' on line {}", lineno + 1),
        })?;
        if depth < 0.0 || eff < 0.0 {
            return Err(SimError::MissingInput {
                path: path.to_path_buf(),
                reason: format!("negative value on line {}", lineno + 1),
            });
        }
        depths.push(depth * drop_diameter);
        effs.push(eff);
    }

    if depths.len() < 2 {
        return Err(SimError::MissingInput {
            path: path.to_path_buf(),
            reason: "splash table needs at least two rows".into(),
        });
    }
    if depths.windows(2).any(|w| w[0] >= w[1]) {
        return Err(SimError::MissingInput {
            path: path.to_path_buf(),
            reason: "splash table depths must be strictly ascending".into(),
        });
    }

    Ok((depths, effs))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
run_name           test_run
dem_file           plot.asc
simulation_duration 60

layer_1_name            topsoil
layer_1_thickness_mm    150
layer_1_percent_clay    30
layer_1_percent_silt    30
layer_1_percent_sand    40
layer_1_bulk_density    1300
layer_1_flow_erodibility_clay  0.8
layer_1_flow_erodibility_silt  0.6
layer_1_flow_erodibility_sand  0.4
layer_1_splash_erodibility_clay 0.8
layer_1_splash_erodibility_silt 0.6
layer_1_splash_erodibility_sand 0.4
layer_1_slump_erodibility_clay 0.8
layer_1_slump_erodibility_silt 0.6
layer_1_slump_erodibility_sand 0.4
layer_1_ga_air_head     10
layer_1_ga_lambda       0.5
layer_1_ga_theta_sat    0.45
layer_1_ga_theta_init   0.2
layer_1_ga_k_sat        1.0
"#;

    #[test]
    fn minimal_run_file_parses() {
        let p = parse_run_text(MINIMAL, Path::new("/data")).unwrap();
        assert_eq!(p.run_name, "test_run");
        assert_eq!(p.dem_file, Path::new("/data/plot.asc"));
        assert_eq!(p.simulation_duration, 60.0);
        assert_eq!(p.layers.len(), 1);
        assert_eq!(p.layers[0].name, "topsoil");
        assert_eq!(p.layers[0].flow_erodibility, [0.8, 0.6, 0.4]);
    }

    #[test]
    fn comments_and_equals_signs_are_accepted() {
        let text = format!("{MINIMAL}\n# a comment\nrain_intensity = 45  # trailing\n");
        let p = parse_run_text(&text, Path::new(".")).unwrap();
        assert_eq!(p.rain_intensity, 45.0);
    }

    #[test]
    fn missing_dem_key_is_a_config_error() {
        let err = parse_run_text("simulation_duration 1", Path::new(".")).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn missing_layers_are_rejected() {
        let text = "dem_file x.asc\nsimulation_duration 1\n";
        let err = parse_run_text(text, Path::new(".")).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn bad_percentage_sum_is_rejected() {
        let text = MINIMAL.replace("layer_1_percent_sand    40", "layer_1_percent_sand    60");
        let err = parse_run_text(&text, Path::new(".")).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn schedule_parses_and_must_ascend() {
        let text = format!("{MINIMAL}\ntime_varying_rain 1\nrain_schedule 0:30, 60:90, 120:0\n");
        let p = parse_run_text(&text, Path::new(".")).unwrap();
        assert_eq!(p.rain_schedule, vec![(0.0, 30.0), (60.0, 90.0), (120.0, 0.0)]);

        let bad = format!("{MINIMAL}\ntime_varying_rain 1\nrain_schedule 60:30, 10:90\n");
        assert!(parse_run_text(&bad, Path::new(".")).is_err());
    }

    #[test]
    fn edge_options_parse() {
        let text = format!(
            "{MINIMAL}\ntop_closed 1\nleft_runon 1\nleft_runon_length_mm 2000\nleft_runon_speed_mm_per_s 150\n"
        );
        let p = parse_run_text(&text, Path::new(".")).unwrap();
        assert!(p.edges[0].closed);
        assert!(p.edges[3].runon);
        assert_eq!(p.edges[3].runon_length, 2000.0);
        assert_eq!(p.edges[3].runon_rain_variation, 1.0);
    }

    #[test]
    fn unknown_friction_model_is_rejected() {
        let text = format!("{MINIMAL}\nfriction_model chezy\n");
        assert!(parse_run_text(&text, Path::new(".")).is_err());
    }

    #[test]
    fn splash_table_scales_by_drop_diameter() {
        let path = std::env::temp_dir().join(format!("rillsim_splash_{}", std::process::id()));
        std::fs::write(&path, "# depth eff\n0.0 1.0\n1.0 0.6\n3.0 0.1\n").unwrap();
        let (depths, effs) = read_splash_table(&path, 2.0).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(depths, vec![0.0, 2.0, 6.0]);
        assert_eq!(effs, vec![1.0, 0.6, 0.1]);
    }
}
