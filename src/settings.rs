use std::time::Duration;

/// Which channel totals are summed before dividing by four in the reference PSNR.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ChannelSum {
    /// R + G + B + A.
    #[default]
    Rgba,
    /// R + G + B + B. Blue is counted twice and alpha is dropped; kept only to
    /// reproduce scores of older tooling.
    LegacyRgbb,
}

/// Settings shared by the compressor and the PSNR evaluators.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Settings {
    pub(crate) readback_timeout: Duration,
    pub(crate) max_psnr: f64,
    pub(crate) channel_sum: ChannelSum,
}

impl Settings {
    /// Default timeout of a blocking buffer read.
    pub const DEFAULT_READBACK_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default PSNR reported for identical images.
    pub const DEFAULT_MAX_PSNR: f64 = 100.0;

    pub const fn new() -> Self {
        Self {
            readback_timeout: Self::DEFAULT_READBACK_TIMEOUT,
            max_psnr: Self::DEFAULT_MAX_PSNR,
            channel_sum: ChannelSum::Rgba,
        }
    }

    /// Upper bound for blocking on a GPU readback before giving up.
    pub const fn with_readback_timeout(mut self, timeout: Duration) -> Self {
        self.readback_timeout = timeout;
        self
    }

    /// Largest PSNR ever reported. A zero MSE yields exactly this value.
    ///
    /// `max_psnr` must be finite and positive.
    pub fn with_max_psnr(mut self, max_psnr: f64) -> Self {
        debug_assert!(
            max_psnr.is_finite() && max_psnr > 0.0,
            "max_psnr must be finite and positive, got {max_psnr}"
        );
        self.max_psnr = max_psnr;
        self
    }

    pub const fn with_channel_sum(mut self, channel_sum: ChannelSum) -> Self {
        self.channel_sum = channel_sum;
        self
    }

    pub const fn readback_timeout(&self) -> Duration {
        self.readback_timeout
    }

    pub const fn max_psnr(&self) -> f64 {
        self.max_psnr
    }

    pub const fn channel_sum(&self) -> ChannelSum {
        self.channel_sum
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}
