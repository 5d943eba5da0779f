use serde::{Deserialize, Serialize};

/// Equatorial position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquPosition {
    pub ra: f64,
    pub dec: f64,
}

impl EquPosition {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }

    /// Great-circle distance to `other`, in degrees
    pub fn angular_separation(&self, other: &EquPosition) -> f64 {
        let (ra1, dec1) = (self.ra.to_radians(), self.dec.to_radians());
        let (ra2, dec2) = (other.ra.to_radians(), other.dec.to_radians());
        let sin_ddec = ((dec2 - dec1) / 2.0).sin();
        let sin_dra = ((ra2 - ra1) / 2.0).sin();
        let a = sin_ddec * sin_ddec + dec1.cos() * dec2.cos() * sin_dra * sin_dra;
        (2.0 * a.sqrt().min(1.0).asin()).to_degrees()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separation_along_dec() {
        let a = EquPosition::new(10.0, 20.0);
        let b = EquPosition::new(10.0, 25.0);
        assert!((a.angular_separation(&b) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_separation_poles() {
        let a = EquPosition::new(0.0, 90.0);
        let b = EquPosition::new(180.0, -90.0);
        assert!((a.angular_separation(&b) - 180.0).abs() < 1e-9);
    }
}
