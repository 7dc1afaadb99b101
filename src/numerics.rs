//! Numerical utilities shared by the process kernels: compensated
//! summation, the standard-normal CDF, grain settling speed, and the
//! splash-attenuation cubic spline.

/// Kahan-compensated accumulator.
///
/// The plot-wide cumulative totals add an enormous number of very small
/// depths to a single large sum; naive f64 accumulation loses mass-balance
/// accuracy over a long run.
#[derive(Clone, Copy, Debug, Default)]
pub struct KahanSum {
    sum: f64,
    correction: f64,
}

impl KahanSum {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, value: f64) {
        let y = value - self.correction;
        let t = self.sum + y;
        self.correction = (t - self.sum) - y;
        self.sum = t;
    }

    #[inline]
    pub fn get(&self) -> f64 {
        self.sum
    }
}

/// Round half away from zero.
pub fn round_half(d: f64) -> f64 {
    if d < 0.0 {
        (d - 0.5).ceil()
    } else {
        (d + 0.5).floor()
    }
}

/// Round a double to the nearest integer, half away from zero.
pub fn round_to_int(d: f64) -> i64 {
    round_half(d) as i64
}

/// Relative floating-point comparison with special handling of zero
/// operands (for which only an absolute test makes sense).
pub fn fp_eq(d1: f64, d2: f64, epsilon: f64) -> bool {
    if d1 == 0.0 {
        d2.abs() < epsilon
    } else if d2 == 0.0 {
        d1.abs() < epsilon
    } else {
        (d1 - d2).abs() < epsilon * d1.abs()
    }
}

/// Cumulative distribution function of the standard normal, by the
/// Abramowitz & Stegun 26.2.17 rational approximation (|error| < 7.5e-8).
pub fn gauss_cdf(z: f64) -> f64 {
    const P: f64 = 0.2316419;
    const B1: f64 = 0.319381530;
    const B2: f64 = -0.356563782;
    const B3: f64 = 1.781477937;
    const B4: f64 = -1.821255978;
    const B5: f64 = 1.330274429;

    let x = z.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = t * (B1 + t * (B2 + t * (B3 + t * (B4 + t * B5))));
    let pdf = (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt();
    let tail = pdf * poly;

    if z >= 0.0 {
        1.0 - tail
    } else {
        tail
    }
}

/// Settling speed (mm/s) of a grain by Cheng's formula.
///
/// `diameter_m` is the representative grain diameter in metres,
/// `density_diff` the difference between grain and water density (kg/m3),
/// `g` gravity (m/s2) and `nu` kinematic viscosity (m2/s).
pub fn cheng_settling_speed(diameter_m: f64, density_diff: f64, g: f64, nu: f64) -> f64 {
    if diameter_m <= 0.0 {
        return 0.0;
    }
    let d_star = ((density_diff * g) / (nu * nu)).powf(1.0 / 3.0) * diameter_m;
    1000.0 * ((25.0 + 1.2 * d_star * d_star).sqrt() - 5.0).powf(1.5) * nu / diameter_m
}

/// Cubic spline through the splash-attenuation table.
///
/// This is the Numerical Recipes tridiagonal construction, except that the
/// left-endpoint condition is not the textbook natural spline: the first
/// second-derivative coefficient is pinned at 100, and the endpoint slope
/// terms use the tabulated efficiency values directly. Both quirks are
/// load-bearing for reproducing the established attenuation curve and must
/// not be "corrected".
#[derive(Clone, Debug)]
pub struct SplashSpline {
    depth: Vec<f64>,
    eff: Vec<f64>,
    coeff: Vec<f64>,
}

impl SplashSpline {
    /// Build the spline from ascending depths and their efficiencies.
    /// Panics if fewer than two knots are supplied.
    pub fn new(depth: Vec<f64>, eff: Vec<f64>) -> Self {
        assert!(depth.len() >= 2 && depth.len() == eff.len());
        let n = depth.len();
        let mut coeff = vec![0.0; n];
        let mut u = vec![0.0; n];

        coeff[0] = 100.0;
        u[0] = (3.0 / (depth[1] - depth[0])) * ((eff[1] - eff[0]) / (depth[1] - depth[0]) - eff[0]);

        for i in 1..n - 1 {
            let sig = (depth[i] - depth[i - 1]) / (depth[i + 1] - depth[i - 1]);
            let p = sig * coeff[i - 1] + 2.0;
            coeff[i] = (sig - 1.0) / p;

            let du = (eff[i + 1] - eff[i]) / (depth[i + 1] - depth[i])
                - (eff[i] - eff[i - 1]) / (depth[i] - depth[i - 1]);
            u[i] = (6.0 * du / (depth[i + 1] - depth[i - 1]) - sig * u[i - 1]) / p;
        }

        let qn = 0.5;
        let un = (3.0 / (depth[n - 1] - depth[n - 2]))
            * (eff[n - 1] - (eff[n - 1] - eff[n - 2]) / (depth[n - 1] - depth[n - 2]));
        coeff[n - 1] = (un - qn * u[n - 2]) / (qn * coeff[n - 2] + 1.0);

        for j in (0..n - 1).rev() {
            coeff[j] = coeff[j] * coeff[j + 1] + u[j];
        }

        Self { depth, eff, coeff }
    }

    /// Interpolated splash efficiency for a water depth (mm).
    ///
    /// Zero depth short-circuits to full efficiency; depths beyond the last
    /// knot return zero rather than extrapolating.
    pub fn eval(&self, depth: f64) -> f64 {
        if depth == 0.0 {
            return 1.0;
        }

        let n = self.depth.len();
        if depth > self.depth[n - 1] {
            return 0.0;
        }

        let mut lo = 0;
        let mut hi = n - 1;
        while hi - lo > 1 {
            let mid = (hi + lo) >> 1;
            if self.depth[mid] > depth {
                hi = mid;
            } else {
                lo = mid;
            }
        }

        let h = self.depth[hi] - self.depth[lo];
        let b = depth - self.depth[lo];
        let a = self.depth[hi] - depth;
        let eff = ((self.eff[lo] - self.coeff[lo] / 6.0 * b * (a + h)) * a
            + (self.eff[hi] - self.coeff[hi] / 6.0 * a * (b + h)) * b)
            / h;

        eff.max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kahan_beats_naive_on_many_small_adds() {
        let mut kahan = KahanSum::new();
        let mut naive = 1.0e9_f64;
        kahan.add(1.0e9);
        for _ in 0..1_000_000 {
            kahan.add(1.0e-3);
            naive += 1.0e-3;
        }
        let exact = 1.0e9 + 1.0e3;
        assert!((kahan.get() - exact).abs() <= (naive - exact).abs());
        assert!((kahan.get() - exact).abs() < 1e-6);
    }

    #[test]
    fn round_half_away_from_zero() {
        assert_eq!(round_to_int(2.5), 3);
        assert_eq!(round_to_int(-2.5), -3);
        assert_eq!(round_to_int(2.4), 2);
        assert_eq!(round_to_int(-2.4), -2);
    }

    #[test]
    fn gauss_cdf_reference_points() {
        assert!((gauss_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((gauss_cdf(1.0) - 0.8413447).abs() < 1e-6);
        assert!((gauss_cdf(-1.0) - 0.1586553).abs() < 1e-6);
        assert!((gauss_cdf(3.0) - 0.9986501).abs() < 1e-6);
        assert!(gauss_cdf(8.0) > 0.999999);
    }

    #[test]
    fn settling_speed_increases_with_diameter() {
        let nu = 1.0e-6;
        let fine = cheng_settling_speed(1.0e-6, 1650.0, 9.81, nu);
        let coarse = cheng_settling_speed(1.0e-3, 1650.0, 9.81, nu);
        assert!(fine > 0.0);
        assert!(coarse > fine);
    }

    #[test]
    fn spline_endpoints_and_clamps() {
        let spline = SplashSpline::new(
            vec![0.5, 1.0, 2.0, 4.0, 8.0],
            vec![1.0, 0.8, 0.5, 0.2, 0.0],
        );
        // No water: full efficiency without touching the spline
        assert_eq!(spline.eval(0.0), 1.0);
        // Beyond the table: zero
        assert_eq!(spline.eval(9.0), 0.0);
        // Interior values never go negative
        for i in 0..100 {
            let d = 0.5 + i as f64 * 0.075;
            assert!(spline.eval(d) >= 0.0);
        }
    }

    #[test]
    fn spline_left_coefficient_is_pinned() {
        let spline = SplashSpline::new(vec![0.0, 1.0, 2.0], vec![1.0, 0.5, 0.1]);
        // The construction starts from coeff[0] = 100 (not the natural
        // spline's 0); the back-substituted value must reflect that choice
        let natural = SplashSplineNatural::build(&[0.0, 1.0, 2.0], &[1.0, 0.5, 0.1]);
        assert!((spline.coeff[0] - natural[0]).abs() > 1e-9);
    }

    // Textbook natural spline, used only to show the pinned-endpoint
    // construction diverges from it
    struct SplashSplineNatural;
    impl SplashSplineNatural {
        fn build(x: &[f64], y: &[f64]) -> Vec<f64> {
            let n = x.len();
            let mut c = vec![0.0; n];
            let mut u = vec![0.0; n];
            for i in 1..n - 1 {
                let sig = (x[i] - x[i - 1]) / (x[i + 1] - x[i - 1]);
                let p = sig * c[i - 1] + 2.0;
                c[i] = (sig - 1.0) / p;
                let du = (y[i + 1] - y[i]) / (x[i + 1] - x[i]) - (y[i] - y[i - 1]) / (x[i] - x[i - 1]);
                u[i] = (6.0 * du / (x[i + 1] - x[i - 1]) - sig * u[i - 1]) / p;
            }
            for j in (0..n - 1).rev() {
                c[j] = c[j] * c[j + 1] + u[j];
            }
            c
        }
    }
}
