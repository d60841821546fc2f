//! Spectrum value type and the instrument's fixed unit conversions.
//!
//! The detector has 128 pixels spread linearly over 900–1700 nm. Each pixel
//! is read as a 16-bit ADC count; intensities are reported as the fraction of
//! full scale.

/// Number of detector pixels in one frame.
pub const PIXEL_COUNT: usize = 128;

/// First pixel centre, in nanometres.
pub const WAVELENGTH_MIN_NM: f64 = 900.0;

/// Last pixel centre, in nanometres.
pub const WAVELENGTH_MAX_NM: f64 = 1700.0;

/// Wavelength assigned to pixel `index`, rounded to the nearest nanometre.
pub fn wavelength_nm(index: usize) -> u16 {
    let step = (WAVELENGTH_MAX_NM - WAVELENGTH_MIN_NM) / (PIXEL_COUNT - 1) as f64;
    (WAVELENGTH_MIN_NM + index as f64 * step).round() as u16
}

/// Normalized intensity for a raw 16-bit sample, in `[0, 1]`.
pub fn intensity(raw: u16) -> f64 {
    raw as f64 / u16::MAX as f64
}

/// One (wavelength, intensity) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectrumPoint {
    pub wavelength_nm: u16,
    pub intensity: f64,
}

/// A complete 128-pixel acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    raw: [u16; PIXEL_COUNT],
}

impl Spectrum {
    pub fn from_raw(raw: [u16; PIXEL_COUNT]) -> Self {
        Self { raw }
    }

    /// Raw ADC counts, in pixel order.
    pub fn raw(&self) -> &[u16; PIXEL_COUNT] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        PIXEL_COUNT
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn point(&self, index: usize) -> Option<SpectrumPoint> {
        self.raw.get(index).map(|&r| SpectrumPoint {
            wavelength_nm: wavelength_nm(index),
            intensity: intensity(r),
        })
    }

    pub fn points(&self) -> impl Iterator<Item = SpectrumPoint> + '_ {
        self.raw
            .iter()
            .enumerate()
            .map(|(i, &r)| SpectrumPoint {
                wavelength_nm: wavelength_nm(i),
                intensity: intensity(r),
            })
    }

    pub fn wavelengths(&self) -> Vec<u16> {
        (0..PIXEL_COUNT).map(wavelength_nm).collect()
    }

    pub fn intensities(&self) -> Vec<f64> {
        self.raw.iter().map(|&r| intensity(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wavelength_endpoints_and_monotonicity() {
        assert_eq!(wavelength_nm(0), 900);
        assert_eq!(wavelength_nm(PIXEL_COUNT - 1), 1700);
        for i in 1..PIXEL_COUNT {
            assert!(wavelength_nm(i) > wavelength_nm(i - 1), "pixel {i}");
        }
    }

    #[test]
    fn wavelength_matches_rounded_interpolation() {
        // 900 + 64 * 800 / 127 = 1303.15
        assert_eq!(wavelength_nm(64), 1303);
        // 900 + 1 * 800 / 127 = 906.29
        assert_eq!(wavelength_nm(1), 906);
    }

    #[test]
    fn intensity_is_a_fraction_of_full_scale() {
        assert_eq!(intensity(0), 0.0);
        assert_eq!(intensity(u16::MAX), 1.0);
        for raw in [1u16, 255, 32768, 65534] {
            let v = intensity(raw);
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn points_pair_wavelength_with_intensity() {
        let mut raw = [0u16; PIXEL_COUNT];
        raw[127] = u16::MAX;
        let spectrum = Spectrum::from_raw(raw);

        let points: Vec<_> = spectrum.points().collect();
        assert_eq!(points.len(), PIXEL_COUNT);
        assert_eq!(points[0].wavelength_nm, 900);
        assert_eq!(points[127].intensity, 1.0);
        assert_eq!(spectrum.point(128), None);
    }
}
