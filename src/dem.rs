//! ESRI ASCII grid input/output, plus optional grayscale PNG renders.
//!
//! The DEM and the rain-variation raster come in as ASCII grids; every
//! output field goes out in the same format so any GIS can ingest it.
//! Missing cells are NaN in memory and the nodata value on disk.

use crate::error::{Result, SimError};
use crate::raster::Raster;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// An ASCII grid plus its georeferencing header.
#[derive(Debug)]
pub struct AsciiGrid {
    pub raster: Raster<f64>,
    pub cellsize: f64,
    pub xllcorner: f64,
    pub yllcorner: f64,
    pub nodata: f64,
}

fn missing_input(path: &Path, reason: impl std::fmt::Display) -> SimError {
    SimError::MissingInput {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Read an ESRI ASCII grid. Values equal to the declared nodata become NaN.
pub fn read_ascii_grid(path: &Path) -> Result<AsciiGrid> {
    let file = File::open(path).map_err(|e| missing_input(path, e))?;
    let reader = BufReader::new(file);

    let mut ncols: Option<usize> = None;
    let mut nrows: Option<usize> = None;
    let mut xllcorner = 0.0;
    let mut yllcorner = 0.0;
    let mut cellsize: Option<f64> = None;
    let mut nodata = -9999.0;
    let mut values: Vec<f64> = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| missing_input(path, e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut tokens = trimmed.split_whitespace();
        let Some(first) = tokens.next() else {
            continue;
        };

        // Header lines are keyword-value pairs; anything numeric is data
        if first.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
            let value = tokens.next().ok_or_else(|| {
                missing_input(path, format!("header line {} has no value", lineno + 1))
            })?;
            match first.to_ascii_lowercase().as_str() {
                "ncols" => ncols = Some(parse_num(path, value, lineno)? as usize),
                "nrows" => nrows = Some(parse_num(path, value, lineno)? as usize),
                "xllcorner" => xllcorner = parse_num(path, value, lineno)?,
                "yllcorner" => yllcorner = parse_num(path, value, lineno)?,
                "cellsize" => cellsize = Some(parse_num(path, value, lineno)?),
                "nodata_value" => nodata = parse_num(path, value, lineno)?,
                other => {
                    return Err(missing_input(
                        path,
                        format!("unknown header keyword '{other}' on line {}", lineno + 1),
                    ))
                }
            }
        } else {
            values.push(parse_num(path, first, lineno)?);
            for tok in tokens {
                values.push(parse_num(path, tok, lineno)?);
            }
        }
    }

    let ncols = ncols.ok_or_else(|| missing_input(path, "missing ncols header"))?;
    let nrows = nrows.ok_or_else(|| missing_input(path, "missing nrows header"))?;
    let cellsize = cellsize.ok_or_else(|| missing_input(path, "missing cellsize header"))?;

    if values.len() != ncols * nrows {
        return Err(missing_input(
            path,
            format!("expected {} values, found {}", ncols * nrows, values.len()),
        ));
    }

    let data: Vec<f64> = values
        .into_iter()
        .map(|v| if v == nodata { f64::NAN } else { v })
        .collect();

    Ok(AsciiGrid {
        raster: Raster::from_vec(ncols, nrows, data),
        cellsize,
        xllcorner,
        yllcorner,
        nodata,
    })
}

fn parse_num(path: &Path, token: &str, lineno: usize) -> Result<f64> {
    token.parse::<f64>().map_err(|_| {
        missing_input(
            path,
            format!("cannot parse '{token}' as a number on line {}", lineno + 1),
        )
    })
}

/// Write a raster as an ESRI ASCII grid; NaN cells become the nodata value.
pub fn write_ascii_grid(
    path: &Path,
    raster: &Raster<f64>,
    cellsize: f64,
    xllcorner: f64,
    yllcorner: f64,
    nodata: f64,
) -> Result<()> {
    let io_err = |e: std::io::Error| SimError::OutputIo {
        path: path.to_path_buf(),
        source: e,
    };

    let file = File::create(path).map_err(io_err)?;
    let mut w = BufWriter::new(file);

    writeln!(w, "ncols {}", raster.width).map_err(io_err)?;
    writeln!(w, "nrows {}", raster.height).map_err(io_err)?;
    writeln!(w, "xllcorner {xllcorner}").map_err(io_err)?;
    writeln!(w, "yllcorner {yllcorner}").map_err(io_err)?;
    writeln!(w, "cellsize {cellsize}").map_err(io_err)?;
    writeln!(w, "NODATA_value {nodata}").map_err(io_err)?;

    for y in 0..raster.height {
        let mut row = String::with_capacity(raster.width * 12);
        for x in 0..raster.width {
            if x > 0 {
                row.push(' ');
            }
            let v = *raster.get(x, y);
            if v.is_nan() {
                row.push_str(&format!("{nodata}"));
            } else {
                row.push_str(&format!("{v:.6}"));
            }
        }
        writeln!(w, "{row}").map_err(io_err)?;
    }

    w.flush().map_err(io_err)
}

/// Render a raster to a normalised 8-bit grayscale PNG; NaN cells are
/// black.
pub fn write_png(path: &Path, raster: &Raster<f64>) -> Result<()> {
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    for (_, _, &v) in raster.iter() {
        if !v.is_nan() {
            min = min.min(v);
            max = max.max(v);
        }
    }
    let range = (max - min).max(f64::MIN_POSITIVE);

    let mut img = image::GrayImage::new(raster.width as u32, raster.height as u32);
    for (x, y, &v) in raster.iter() {
        let px = if v.is_nan() {
            0
        } else {
            (255.0 * (v - min) / range).round().clamp(0.0, 255.0) as u8
        };
        img.put_pixel(x as u32, y as u32, image::Luma([px]));
    }

    img.save(path).map_err(|e| SimError::OutputIo {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
    })
}
