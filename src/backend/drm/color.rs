//! Gamma and color transformation blobs
//!
//! Both are uploaded as property blobs and referenced from the `GAMMA_LUT` and `CTM`
//! crtc properties, so they change atomically with the rest of a commit.

use super::error::Error;

/// A gamma lookup table with one entry per channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GammaRamp {
    red: Vec<u16>,
    green: Vec<u16>,
    blue: Vec<u16>,
}

impl GammaRamp {
    /// Create a ramp from three channels of equal, non-zero length
    pub fn new(red: Vec<u16>, green: Vec<u16>, blue: Vec<u16>) -> Result<GammaRamp, Error> {
        if red.is_empty() {
            return Err(Error::InvalidConfiguration("gamma ramp is empty"));
        }
        if red.len() != green.len() || red.len() != blue.len() {
            return Err(Error::InvalidConfiguration("gamma channels differ in length"));
        }
        Ok(GammaRamp { red, green, blue })
    }

    /// A linear ramp of the given size
    pub fn identity(size: usize) -> GammaRamp {
        let max = size.saturating_sub(1).max(1) as u64;
        let channel: Vec<u16> = (0..size as u64).map(|i| (i * 0xffff / max) as u16).collect();
        GammaRamp {
            red: channel.clone(),
            green: channel.clone(),
            blue: channel,
        }
    }

    /// Number of entries per channel
    pub fn size(&self) -> usize {
        self.red.len()
    }

    /// Returns true if the ramp maps every value onto itself
    pub fn is_identity(&self) -> bool {
        *self == GammaRamp::identity(self.size())
    }

    /// Red channel
    pub fn red(&self) -> &[u16] {
        &self.red
    }

    /// Green channel
    pub fn green(&self) -> &[u16] {
        &self.green
    }

    /// Blue channel
    pub fn blue(&self) -> &[u16] {
        &self.blue
    }

    /// Encode as an array of `struct drm_color_lut`
    pub fn to_blob_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.size() * 8);
        for ((r, g), b) in self.red.iter().zip(&self.green).zip(&self.blue) {
            data.extend_from_slice(&r.to_ne_bytes());
            data.extend_from_slice(&g.to_ne_bytes());
            data.extend_from_slice(&b.to_ne_bytes());
            data.extend_from_slice(&0u16.to_ne_bytes());
        }
        data
    }
}

/// A 3x3 color transformation matrix in row-major order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTransform(pub [f64; 9]);

impl ColorTransform {
    /// The identity matrix
    pub fn identity() -> ColorTransform {
        ColorTransform([1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    }

    /// Returns true for the identity matrix
    pub fn is_identity(&self) -> bool {
        *self == ColorTransform::identity()
    }

    /// Encode as `struct drm_color_ctm`
    pub fn to_blob_data(&self) -> Vec<u8> {
        self.0
            .iter()
            .flat_map(|v| to_s31_32(*v).to_ne_bytes())
            .collect()
    }
}

impl Default for ColorTransform {
    fn default() -> Self {
        ColorTransform::identity()
    }
}

/// Convert into the sign-magnitude S31.32 fixed point format used by the kernel
pub fn to_s31_32(value: f64) -> u64 {
    let magnitude = (value.abs() * (1u64 << 32) as f64) as u64 & !(1 << 63);
    if value.is_sign_negative() && magnitude != 0 {
        magnitude | (1 << 63)
    } else {
        magnitude
    }
}

#[cfg(test)]
mod test {
    use super::{to_s31_32, ColorTransform, GammaRamp};

    #[test]
    fn identity_ramp() {
        let ramp = GammaRamp::identity(256);
        assert_eq!(ramp.size(), 256);
        assert_eq!(ramp.red()[0], 0);
        assert_eq!(ramp.green()[255], 0xffff);
        assert_eq!(ramp.blue()[1], 257);
        assert!(ramp.is_identity());
        assert_eq!(ramp.to_blob_data().len(), 256 * 8);
    }

    #[test]
    fn channels_must_match() {
        assert!(GammaRamp::new(vec![0; 4], vec![0; 4], vec![0; 3]).is_err());
        assert!(GammaRamp::new(vec![], vec![], vec![]).is_err());
        let ramp = GammaRamp::new(vec![1, 2], vec![3, 4], vec![5, 6]).unwrap();
        assert!(!ramp.is_identity());
        let data = ramp.to_blob_data();
        assert_eq!(&data[..8], &[1u16, 3, 5, 0].map(u16::to_ne_bytes).concat()[..]);
    }

    #[test]
    fn fixed_point_ctm() {
        assert_eq!(to_s31_32(1.0), 1 << 32);
        assert_eq!(to_s31_32(0.0), 0);
        assert_eq!(to_s31_32(-0.5), (1 << 63) | (1 << 31));
        assert_eq!(ColorTransform::identity().to_blob_data().len(), 9 * 8);
        assert!(ColorTransform::default().is_identity());
    }
}
