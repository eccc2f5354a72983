use std::sync::Arc;

use tracing::{debug, trace};

use crate::queue::{ComputeQueue, ReductionParams};
use crate::{AstcError, BlockDecoder, ChannelSum, Image, Result, Settings};

/// Elements combined by one workgroup of a reduction pass.
pub const REDUCTION_GROUP_SIZE: u32 = 1024;

/// Largest workgroup count of a single dispatch dimension.
const MAX_WORKGROUPS_PER_DIMENSION: u32 = 65535;

/// Bytes of one accumulator: four `f32` channel sums.
const ACCUMULATOR_BYTE_SIZE: u64 = 16;

/// One dispatch of the reduction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReductionPass {
    /// The pass reads the two images instead of partial sums.
    pub first_step: bool,
    /// Number of input elements of this pass.
    pub thread_count: u32,
    /// Number of accumulators written, one per group of 1024 elements.
    pub group_count: u32,
}

impl ReductionPass {
    /// Workgroup counts, folded into two dimensions when one is not enough.
    pub const fn workgroups(&self) -> [u32; 3] {
        if self.group_count <= MAX_WORKGROUPS_PER_DIMENSION {
            [self.group_count, 1, 1]
        } else {
            [
                MAX_WORKGROUPS_PER_DIMENSION,
                self.group_count.div_ceil(MAX_WORKGROUPS_PER_DIMENSION),
                1,
            ]
        }
    }
}

/// The sequence of passes reducing `element_count` texels to a single accumulator.
///
/// Each pass shrinks the element count by a factor of 1024, rounding up, until
/// one accumulator remains. A trailing remainder of 2..=1023 elements becomes
/// a final single-group pass with that many active threads.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReductionPlan {
    passes: Vec<ReductionPass>,
}

impl ReductionPlan {
    pub fn new(element_count: u32) -> Self {
        debug_assert!(element_count > 0);

        let mut passes = Vec::new();
        let mut active = element_count;

        loop {
            let group_count = active.div_ceil(REDUCTION_GROUP_SIZE);
            passes.push(ReductionPass {
                first_step: passes.is_empty(),
                thread_count: active,
                group_count,
            });

            if group_count <= 1 {
                break;
            }
            active = group_count;
        }

        Self { passes }
    }

    pub fn passes(&self) -> &[ReductionPass] {
        &self.passes
    }
}

/// Result of a successful PSNR measurement.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PsnrReport {
    /// PSNR in dB, at most [`Settings::max_psnr`].
    pub psnr: f64,
    pub mse: f64,
    /// Summed squared error of R, G, B and A.
    pub channel_sums: [f64; 4],
    /// The raw PSNR exceeded the maximum, or the images were identical.
    pub clamped: bool,
}

impl PsnrReport {
    /// Derives MSE and PSNR from the channel sums, assuming a peak signal of 1.
    pub(crate) fn new(channel_sums: [f64; 4], total: f64, texel_count: u64, max_psnr: f64) -> Self {
        let mse = total / (texel_count as f64 * 4.0);
        let raw = 10.0 * (1.0 / mse).log10();

        let (psnr, clamped) = if mse <= 0.0 || raw > max_psnr {
            (max_psnr, true)
        } else {
            (raw, false)
        };

        Self {
            psnr,
            mse,
            channel_sums,
            clamped,
        }
    }
}

/// Outcome of a PSNR measurement.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PsnrOutcome {
    Measured(PsnrReport),
    /// The images have different dimensions. No work was submitted.
    Incomparable {
        source: (u32, u32),
        target: (u32, u32),
    },
}

impl PsnrOutcome {
    fn incomparable(source: &Image, target: &Image) -> Self {
        debug!(
            source = ?source.dimensions(),
            target = ?target.dimensions(),
            "images are not comparable"
        );
        PsnrOutcome::Incomparable {
            source: source.dimensions(),
            target: target.dimensions(),
        }
    }

    pub fn psnr(&self) -> Option<f64> {
        self.report().map(|report| report.psnr)
    }

    pub fn report(&self) -> Option<&PsnrReport> {
        match self {
            PsnrOutcome::Measured(report) => Some(report),
            PsnrOutcome::Incomparable { .. } => None,
        }
    }

    pub fn is_comparable(&self) -> bool {
        matches!(self, PsnrOutcome::Measured(_))
    }

    /// Turns the incomparable sentinel into [`AstcError::Incomparable`].
    pub fn into_result(self) -> Result<PsnrReport> {
        match self {
            PsnrOutcome::Measured(report) => Ok(report),
            PsnrOutcome::Incomparable { source, target } => Err(AstcError::Incomparable {
                source_width: source.0,
                source_height: source.1,
                target_width: target.0,
                target_height: target.1,
            }),
        }
    }
}

/// Measures PSNR with a tree reduction on the compute queue.
///
/// Only the final accumulator of four floats is read back to the host.
pub struct PsnrEvaluator<Q: ComputeQueue> {
    queue: Arc<Q>,
    settings: Settings,
}

impl<Q: ComputeQueue> PsnrEvaluator<Q> {
    pub fn new(queue: Arc<Q>, settings: Settings) -> Self {
        Self { queue, settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Computes the PSNR between `source` and `target`.
    ///
    /// Images of different dimensions yield [`PsnrOutcome::Incomparable`]
    /// instead of an error.
    pub fn evaluate(&self, source: &Image, target: &Image) -> Result<PsnrOutcome> {
        if !source.is_comparable(target) {
            return Ok(PsnrOutcome::incomparable(source, target));
        }

        let texel_count = u32::try_from(source.texel_count()).map_err(|_| {
            AstcError::PreconditionMissing(format!(
                "reduction over at most {} texels, got {}",
                u32::MAX,
                source.texel_count()
            ))
        })?;

        let plan = ReductionPlan::new(texel_count);
        debug!(
            queue = self.queue.name(),
            texel_count,
            passes = plan.passes().len(),
            "evaluating PSNR"
        );

        let source_texture = self.queue.upload_image(source)?;
        let target_texture = self.queue.upload_image(target)?;

        let passes = plan.passes();
        let mut front = self.queue.create_buffer(
            "psnr partial sums",
            passes[0].group_count as u64 * ACCUMULATOR_BYTE_SIZE,
        )?;
        let mut back = match passes.get(1) {
            Some(pass) => Some(self.queue.create_buffer(
                "psnr partial sums",
                pass.group_count as u64 * ACCUMULATOR_BYTE_SIZE,
            )?),
            None => None,
        };

        for pass in passes {
            let params = ReductionParams {
                texel_width: source.width(),
                texel_height: source.height(),
                thread_count: pass.thread_count,
                first_step: pass.first_step as u32,
            };
            trace!(?pass, "dispatching reduction pass");

            if pass.first_step {
                self.queue.dispatch_reduction(
                    &source_texture,
                    &target_texture,
                    None,
                    &mut front,
                    params,
                    pass.workgroups(),
                )?;
            } else {
                let Some(output) = back.as_mut() else {
                    return Err(AstcError::DispatchFailed(
                        "missing accumulator buffer for reduction pass".to_string(),
                    ));
                };
                self.queue.dispatch_reduction(
                    &source_texture,
                    &target_texture,
                    Some(&front),
                    output,
                    params,
                    pass.workgroups(),
                )?;
                std::mem::swap(&mut front, output);
            }
        }

        let bytes = self.queue.read_buffer(
            &front,
            ACCUMULATOR_BYTE_SIZE,
            self.settings.readback_timeout(),
        )?;

        let mut channel_sums = [0.0; 4];
        for (sum, chunk) in channel_sums.iter_mut().zip(bytes.chunks_exact(4)) {
            *sum = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64;
        }

        let total = channel_sums.iter().sum();
        let report = PsnrReport::new(
            channel_sums,
            total,
            source.texel_count(),
            self.settings.max_psnr(),
        );
        debug!(psnr = report.psnr, mse = report.mse, clamped = report.clamped, "PSNR measured");

        Ok(PsnrOutcome::Measured(report))
    }
}

/// Computes the PSNR on the host by visiting every texel.
///
/// ASTC images are decoded with `decoder` first. [`Settings::channel_sum`] selects
/// which channel totals make up the error.
pub fn reference_psnr(
    source: &Image,
    target: &Image,
    decoder: Option<&dyn BlockDecoder>,
    settings: &Settings,
) -> Result<PsnrOutcome> {
    if !source.is_comparable(target) {
        return Ok(PsnrOutcome::incomparable(source, target));
    }

    let source_rgba = source.to_rgba8(decoder)?;
    let target_rgba = target.to_rgba8(decoder)?;

    let mut channel_sums = [0.0f64; 4];
    for (a, b) in source_rgba
        .chunks_exact(4)
        .zip(target_rgba.chunks_exact(4))
    {
        for channel in 0..4 {
            let diff = (a[channel] as f64 - b[channel] as f64) / 255.0;
            channel_sums[channel] += diff * diff;
        }
    }

    let [r, g, b, a] = channel_sums;
    let total = match settings.channel_sum() {
        ChannelSum::Rgba => r + g + b + a,
        ChannelSum::LegacyRgbb => r + g + b + b,
    };

    let report = PsnrReport::new(channel_sums, total, source.texel_count(), settings.max_psnr());
    debug!(psnr = report.psnr, mse = report.mse, "reference PSNR measured");

    Ok(PsnrOutcome::Measured(report))
}
