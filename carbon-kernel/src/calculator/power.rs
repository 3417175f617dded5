use super::CalculationError;
use serde::{Deserialize, Serialize};

/// One measured sample of a power curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerPoint {
    pub percentage: f64,
    pub wattage: f64,
}

impl PowerPoint {
    pub fn new(percentage: f64, wattage: f64) -> Self {
        Self { percentage, wattage }
    }
}

/// Wattage as a function of utilization, immutable once built.
///
/// Two points interpolate linearly, more points go through a natural cubic
/// spline (second derivative pinned to zero at both ends). Inputs outside the
/// sampled range are clamped to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PowerPoint>", into = "Vec<PowerPoint>")]
pub struct PowerCurve {
    points: Vec<PowerPoint>,
    /// Second derivatives at each knot, empty unless spline
    second: Vec<f64>,
}

impl PowerCurve {
    pub fn new(points: Vec<PowerPoint>) -> Result<Self, CalculationError> {
        if points.is_empty() {
            return Err(CalculationError::NoPowerData);
        }
        for p in &points {
            if !p.percentage.is_finite() || !p.wattage.is_finite() {
                return Err(CalculationError::InvalidPowerCurve("non finite sample".into()));
            }
        }
        if points.windows(2).any(|w| w[1].percentage <= w[0].percentage) {
            return Err(CalculationError::InvalidPowerCurve(
                "utilization must be strictly increasing".into(),
            ));
        }
        let second = if points.len() > 2 { natural_second_derivatives(&points) } else { vec![] };
        Ok(Self { points, second })
    }

    /// Two-point curve from idle to full load
    pub fn linear(min_watts: f64, max_watts: f64) -> Result<Self, CalculationError> {
        Self::new(vec![PowerPoint::new(0.0, min_watts), PowerPoint::new(100.0, max_watts)])
    }

    pub fn points(&self) -> &[PowerPoint] {
        &self.points
    }

    /// Every sample reads zero watts, the placeholder some datasets ship
    pub fn is_flat_zero(&self) -> bool {
        self.points.iter().all(|p| p.wattage == 0.0)
    }

    pub fn watts_at(&self, usage: f64) -> f64 {
        let pts = &self.points;
        let first = pts[0];
        let last = pts[pts.len() - 1];
        let x = if usage.is_nan() { first.percentage } else { usage.clamp(first.percentage, last.percentage) };

        if let Some(knot) = pts.iter().find(|p| p.percentage == x) {
            return knot.wattage;
        }
        // x lies strictly inside (pts[i], pts[i + 1])
        let i = pts.partition_point(|p| p.percentage < x) - 1;
        let (lo, hi) = (pts[i], pts[i + 1]);

        if self.second.is_empty() {
            return lo.wattage + (x - lo.percentage) / (hi.percentage - lo.percentage) * (hi.wattage - lo.wattage);
        }

        let h = hi.percentage - lo.percentage;
        let left = x - lo.percentage;
        let right = hi.percentage - x;
        let (m0, m1) = (self.second[i], self.second[i + 1]);
        m0 * right.powi(3) / (6.0 * h)
            + m1 * left.powi(3) / (6.0 * h)
            + (lo.wattage / h - m0 * h / 6.0) * right
            + (hi.wattage / h - m1 * h / 6.0) * left
    }

    pub fn kilowatts_at(&self, usage: f64) -> f64 {
        self.watts_at(usage) / 1000.0
    }
}

impl TryFrom<Vec<PowerPoint>> for PowerCurve {
    type Error = CalculationError;

    fn try_from(points: Vec<PowerPoint>) -> Result<Self, Self::Error> {
        Self::new(points)
    }
}

impl From<PowerCurve> for Vec<PowerPoint> {
    fn from(curve: PowerCurve) -> Self {
        curve.points
    }
}

/// Thomas algorithm over the interior knots, M0 = Mn = 0
fn natural_second_derivatives(pts: &[PowerPoint]) -> Vec<f64> {
    let n = pts.len();
    let h: Vec<f64> = pts.windows(2).map(|w| w[1].percentage - w[0].percentage).collect();
    let k = n - 2;
    let mut sub = vec![0.0; k];
    let mut diag = vec![0.0; k];
    let mut sup = vec![0.0; k];
    let mut rhs = vec![0.0; k];
    for j in 0..k {
        let i = j + 1;
        sub[j] = h[i - 1];
        diag[j] = 2.0 * (h[i - 1] + h[i]);
        sup[j] = h[i];
        rhs[j] = 6.0
            * ((pts[i + 1].wattage - pts[i].wattage) / h[i] - (pts[i].wattage - pts[i - 1].wattage) / h[i - 1]);
    }
    for j in 1..k {
        let w = sub[j] / diag[j - 1];
        diag[j] -= w * sup[j - 1];
        rhs[j] -= w * rhs[j - 1];
    }

    let mut m = vec![0.0; n];
    m[k] = rhs[k - 1] / diag[k - 1];
    for j in (0..k - 1).rev() {
        m[j + 1] = (rhs[j] - sup[j] * m[j + 2]) / diag[j];
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_curve() -> PowerCurve {
        PowerCurve::new(vec![
            PowerPoint::new(0.0, 1.21),
            PowerPoint::new(10.0, 3.05),
            PowerPoint::new(50.0, 7.16),
            PowerPoint::new(100.0, 9.96),
        ])
        .unwrap()
    }

    #[test]
    fn test_spline_reference_value() {
        let kw = reference_curve().kilowatts_at(27.0);
        assert!((kw - 0.005324117210365854).abs() < 1e-15, "got {kw}");
    }

    #[test]
    fn test_knots_are_exact() {
        let curve = reference_curve();
        assert!((curve.kilowatts_at(10.0) - 0.00305).abs() < 1e-15);
        for p in curve.points() {
            assert_eq!(curve.watts_at(p.percentage), p.wattage);
        }
        let linear = PowerCurve::linear(10.0, 20.0).unwrap();
        assert_eq!(linear.watts_at(0.0), 10.0);
        assert_eq!(linear.watts_at(100.0), 20.0);
    }

    #[test]
    fn test_two_points_are_linear() {
        let curve = PowerCurve::linear(10.0, 20.0).unwrap();
        assert_eq!(curve.watts_at(25.0), 12.5);
        assert_eq!(curve.kilowatts_at(50.0), 0.015);
    }

    #[test]
    fn test_usage_is_clamped_to_the_curve() {
        let curve = reference_curve();
        assert_eq!(curve.watts_at(-5.0), 1.21);
        assert_eq!(curve.watts_at(250.0), 9.96);
        assert_eq!(curve.watts_at(f64::NAN), 1.21);
    }

    #[test]
    fn test_invalid_curves() {
        assert!(matches!(PowerCurve::new(vec![]), Err(CalculationError::NoPowerData)));
        let unordered = vec![PowerPoint::new(50.0, 1.0), PowerPoint::new(10.0, 2.0)];
        assert!(matches!(PowerCurve::new(unordered), Err(CalculationError::InvalidPowerCurve(_))));
        let dup = vec![PowerPoint::new(10.0, 1.0), PowerPoint::new(10.0, 2.0)];
        assert!(matches!(PowerCurve::new(dup), Err(CalculationError::InvalidPowerCurve(_))));
    }

    #[test]
    fn test_single_point_is_constant() {
        let curve = PowerCurve::new(vec![PowerPoint::new(50.0, 4.0)]).unwrap();
        assert_eq!(curve.watts_at(0.0), 4.0);
        assert_eq!(curve.watts_at(90.0), 4.0);
    }

    #[test]
    fn test_flat_zero_and_yaml() {
        let yaml = "- {percentage: 0, wattage: 0}\n- {percentage: 10, wattage: 0}\n- {percentage: 100, wattage: 0}\n";
        let curve: PowerCurve = serde_yaml::from_str(yaml).unwrap();
        assert!(curve.is_flat_zero());
        assert!(serde_yaml::from_str::<PowerCurve>("[]").is_err());
    }
}
