//! Gaussian noise added to simulated channels

use crate::error::{Error, Result};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand_distr::{Distribution, Normal};

/// Zero-mean normal noise source
///
/// A seed of 0 draws from OS entropy; any other seed replays the same
/// sequence, which the tests rely on.
#[derive(Clone)]
pub struct ChannelNoise {
    rng: SmallRng,
    normal: Normal<f64>,
}

impl ChannelNoise {
    pub fn new(stddev: f64, seed: u64) -> Result<Self> {
        let normal = Normal::new(0.0, stddev)
            .map_err(|e| Error::Config(format!("invalid noise_stddev {}: {}", stddev, e)))?;
        let rng = match seed {
            0 => SmallRng::from_os_rng(),
            seed => SmallRng::seed_from_u64(seed),
        };
        Ok(Self { rng, normal })
    }

    pub fn sample(&mut self) -> f64 {
        self.normal.sample(&mut self.rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_replays() {
        let mut a = ChannelNoise::new(2.0, 9).unwrap();
        let mut b = ChannelNoise::new(2.0, 9).unwrap();
        let left: Vec<f64> = (0..50).map(|_| a.sample()).collect();
        let right: Vec<f64> = (0..50).map(|_| b.sample()).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn test_silent_when_stddev_is_zero() {
        let mut noise = ChannelNoise::new(0.0, 9).unwrap();
        assert!((0..20).all(|_| noise.sample() == 0.0));
    }

    #[test]
    fn test_rejects_negative_stddev() {
        assert!(ChannelNoise::new(-1.0, 9).is_err());
    }

    #[test]
    fn test_spread_matches_stddev() {
        let mut noise = ChannelNoise::new(5.0, 7).unwrap();
        let n = 20_000;
        let samples: Vec<f64> = (0..n).map(|_| noise.sample()).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.2);
        assert!((var.sqrt() - 5.0).abs() < 0.2);
    }
}
