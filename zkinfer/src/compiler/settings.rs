//! Settings generation: choosing the fixed-point scale and lookup bit width.
//!
//! Without calibration data the generator propagates value intervals and a
//! worst-case quantization error bound through every layer, starting from the
//! configured conservative input range. With calibration data it measures the
//! real per-layer magnitudes with a floating-point forward pass and checks the
//! chosen scale empirically with a fixed-point simulation.
//!
//! In both cases the scale is the smallest one in `[min_scale, max_scale]`
//! whose error stays within tolerance, and the bit width is the number of
//! signed bits needed for the largest value at that scale plus headroom.

use std::collections::BTreeSet;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::compiler::circuit::{rescale_is_sound, MAX_LOOKUP_BITS};
use crate::compiler::graph::{DescriptorError, LayerKind, ModelDescriptor, OpKind};
use crate::fields::m31::SIGNED_BITS;
use crate::gadgets::quantize::{dequantize_tensor, quantize_tensor, FixedPoint};
use crate::gadgets::range_check::signed_bits_for;
use crate::hash::{hash_json, ContentHash};

/// Knobs for settings generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Maximum tolerated absolute output error.
    pub tolerance: f64,
    pub min_scale: u32,
    pub max_scale: u32,
    /// Largest lookup table the generator may request (`2^bits` rows).
    pub max_lookup_bits: u32,
    /// Extra bits added on top of the measured requirement.
    pub headroom_bits: u32,
    /// Input range assumed when no calibration data is given.
    pub default_input_range: (f64, f64),
    /// Relative widening applied to calibrated ranges.
    pub calibration_margin: f64,
    /// Operations the compiled circuit may use.
    pub supported_ops: BTreeSet<OpKind>,
    pub max_rows: usize,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-2,
            min_scale: 4,
            max_scale: 16,
            max_lookup_bits: 24,
            headroom_bits: 1,
            default_input_range: (-1.0, 1.0),
            calibration_margin: 0.1,
            supported_ops: OpKind::all(),
            max_rows: 1 << 22,
        }
    }
}

/// Sample tensors used to calibrate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationData {
    pub inputs: Vec<Vec<f64>>,
    /// Expected outputs. When absent, the floating-point forward pass of the
    /// descriptor is used as reference.
    pub outputs: Option<Vec<Vec<f64>>>,
}

impl CalibrationData {
    pub fn new(inputs: Vec<Vec<f64>>) -> Self {
        Self {
            inputs,
            outputs: None,
        }
    }

    pub fn hash(&self) -> ContentHash {
        hash_json("zkinfer/calibration/v1", self).unwrap_or(ContentHash::ZERO)
    }
}

/// Circuit parameters derived from a descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Fractional bits of the fixed-point encoding.
    pub scale: u32,
    pub input_range: (f64, f64),
    /// Signed bit width of every rescaled value and lookup input.
    pub lookup_bit_width: u32,
    pub supported_ops: BTreeSet<OpKind>,
    /// Hash of the descriptor these settings were derived from.
    pub descriptor_hash: ContentHash,
    pub max_rows: usize,
    pub calibrated: bool,
    /// Bound (static) or measurement (calibrated) of the output error.
    pub estimated_error: f64,
}

impl Settings {
    pub fn fixed_point(&self) -> FixedPoint {
        FixedPoint::new(self.scale)
    }

    pub fn hash(&self) -> ContentHash {
        hash_json("zkinfer/settings/v1", self).unwrap_or(ContentHash::ZERO)
    }

    /// Copy with a different lookup bit width, e.g. to retry after `OutOfRange`.
    pub fn with_lookup_bit_width(&self, bits: u32) -> Self {
        Self {
            lookup_bit_width: bits,
            ..self.clone()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
    #[error("insufficient precision: {detail} (requires {required_bits} bits, max {max_bits})")]
    InsufficientPrecision {
        required_bits: u32,
        max_bits: u32,
        detail: String,
    },
    #[error("calibration sample {sample}: expected {expected} values, got {actual}")]
    CalibrationShape {
        sample: usize,
        expected: usize,
        actual: usize,
    },
    #[error("invalid settings config: {0}")]
    InvalidConfig(String),
}

impl SettingsError {
    /// Bit width a retry with wider parameters would need.
    pub fn required_bits(&self) -> Option<u32> {
        match self {
            SettingsError::InsufficientPrecision { required_bits, .. } => Some(*required_bits),
            _ => None,
        }
    }
}

/// Derive settings for `descriptor`, optionally calibrated against samples.
pub fn generate_settings(
    descriptor: &ModelDescriptor,
    calibration: Option<&CalibrationData>,
    config: &SettingsConfig,
) -> Result<Settings, SettingsError> {
    descriptor.validate()?;
    if config.min_scale == 0 || config.min_scale > config.max_scale {
        return Err(SettingsError::InvalidConfig(format!(
            "scale range [{}, {}]",
            config.min_scale, config.max_scale
        )));
    }
    if config.tolerance <= 0.0 {
        return Err(SettingsError::InvalidConfig(format!(
            "tolerance {}",
            config.tolerance
        )));
    }

    let settings = match calibration {
        Some(calib) => calibrated_settings(descriptor, calib, config)?,
        None => static_settings(descriptor, config)?,
    };
    info!(
        model = %descriptor.name,
        scale = settings.scale,
        bits = settings.lookup_bit_width,
        calibrated = settings.calibrated,
        error = settings.estimated_error,
        "generated settings"
    );
    Ok(settings)
}

/// Worst-case magnitudes and error at a given scale.
#[derive(Debug, Clone, Copy)]
struct Analysis {
    output_error: f64,
    /// Largest real value (including error) on any wire.
    max_value: f64,
    /// Largest integer magnitude of any accumulator, rounding bias included.
    max_accumulator: f64,
}

fn interval_analysis(
    descriptor: &ModelDescriptor,
    input_range: (f64, f64),
    fp: FixedPoint,
) -> Analysis {
    let res = fp.resolution();
    let bias_res = FixedPoint::new(2 * fp.scale).resolution();
    let mult = fp.multiplier();

    let n = descriptor.input_dim;
    let mut lo = vec![input_range.0; n];
    let mut hi = vec![input_range.1; n];
    let mut err = vec![res; n];
    let magnitude = |lo: &[f64], hi: &[f64], err: &[f64]| {
        lo.iter()
            .zip(hi)
            .zip(err)
            .map(|((l, h), e)| l.abs().max(h.abs()) + e)
            .fold(0.0, f64::max)
    };
    let mut max_value = magnitude(&lo, &hi, &err);
    let mut max_accumulator: f64 = 0.0;

    for layer in &descriptor.layers {
        match &layer.kind {
            LayerKind::Linear(params) => {
                let out = params.weights.len();
                let (mut nlo, mut nhi, mut nerr) =
                    (Vec::with_capacity(out), Vec::with_capacity(out), Vec::with_capacity(out));
                for (row, &b) in params.weights.iter().zip(&params.bias) {
                    let (mut l, mut h) = (b, b);
                    let mut e = bias_res + res;
                    let mut acc = b.abs() * mult * mult + 0.5 + mult / 2.0;
                    for (i, &w) in row.iter().enumerate() {
                        let (a, c) = (w * lo[i], w * hi[i]);
                        l += a.min(c);
                        h += a.max(c);
                        let mag = lo[i].abs().max(hi[i].abs()) + err[i];
                        e += w.abs() * err[i] + mag * res;
                        acc += (w.abs() * mult + 0.5) * mag * mult;
                    }
                    nlo.push(l);
                    nhi.push(h);
                    nerr.push(e);
                    max_accumulator = max_accumulator.max(acc);
                }
                lo = nlo;
                hi = nhi;
                err = nerr;
            }
            LayerKind::Activation(act) => {
                for i in 0..lo.len() {
                    let (l, h) = act.output_bounds(lo[i], hi[i]);
                    lo[i] = l;
                    hi[i] = h;
                    err[i] *= act.lipschitz();
                    if !act.is_exact() {
                        err[i] += res;
                    }
                }
            }
        }
        max_value = max_value.max(magnitude(&lo, &hi, &err));
    }

    Analysis {
        output_error: err.iter().copied().fold(0.0, f64::max),
        max_value,
        max_accumulator,
    }
}

/// Signed bit width for `max_value` at `fp`, plus headroom.
fn lookup_bits(max_value: f64, fp: FixedPoint, headroom: u32) -> u32 {
    let q = (max_value * fp.multiplier()).ceil();
    let bits = if q.is_finite() && q < u64::MAX as f64 {
        signed_bits_for(q as u64)
    } else {
        u64::BITS + 1
    };
    (bits + headroom).max(fp.scale + 1)
}

fn check_widths(
    scale: u32,
    bits: u32,
    max_accumulator: f64,
    config: &SettingsConfig,
) -> Result<(), SettingsError> {
    if bits > config.max_lookup_bits {
        return Err(SettingsError::InsufficientPrecision {
            required_bits: bits,
            max_bits: config.max_lookup_bits,
            detail: "lookup bit width exceeds limit".to_string(),
        });
    }
    if !rescale_is_sound(scale, bits) {
        return Err(SettingsError::InsufficientPrecision {
            required_bits: scale + bits,
            max_bits: MAX_LOOKUP_BITS,
            detail: format!("rescale by 2^{scale} of {bits}-bit values wraps the field"),
        });
    }
    let acc = max_accumulator.ceil();
    let acc_bits = if acc.is_finite() && acc < u64::MAX as f64 {
        signed_bits_for(acc as u64)
    } else {
        u64::BITS + 1
    };
    if acc_bits > SIGNED_BITS {
        return Err(SettingsError::InsufficientPrecision {
            required_bits: acc_bits,
            max_bits: SIGNED_BITS,
            detail: "accumulator exceeds the field's signed range".to_string(),
        });
    }
    Ok(())
}

fn static_settings(
    descriptor: &ModelDescriptor,
    config: &SettingsConfig,
) -> Result<Settings, SettingsError> {
    let input_range = config.default_input_range;
    let mut last_error = f64::INFINITY;

    for scale in config.min_scale..=config.max_scale {
        let fp = FixedPoint::new(scale);
        let analysis = interval_analysis(descriptor, input_range, fp);
        debug!(scale, error = analysis.output_error, "static error bound");
        last_error = analysis.output_error;
        if analysis.output_error > config.tolerance {
            continue;
        }
        let bits = lookup_bits(analysis.max_value, fp, config.headroom_bits);
        check_widths(scale, bits, analysis.max_accumulator, config)?;
        return Ok(Settings {
            scale,
            input_range,
            lookup_bit_width: bits,
            supported_ops: config.supported_ops.clone(),
            descriptor_hash: descriptor.hash(),
            max_rows: config.max_rows,
            calibrated: false,
            estimated_error: analysis.output_error,
        });
    }

    Err(precision_exhausted(last_error, config))
}

/// Error halves with every extra fractional bit, so estimate the scale needed.
fn precision_exhausted(error: f64, config: &SettingsConfig) -> SettingsError {
    let extra = if error.is_finite() {
        (error / config.tolerance).log2().ceil().max(1.0) as u32
    } else {
        1
    };
    SettingsError::InsufficientPrecision {
        required_bits: config.max_scale + extra,
        max_bits: config.max_scale,
        detail: format!(
            "output error {error:.3e} exceeds tolerance {:.3e} at max scale",
            config.tolerance
        ),
    }
}

fn calibrated_settings(
    descriptor: &ModelDescriptor,
    calib: &CalibrationData,
    config: &SettingsConfig,
) -> Result<Settings, SettingsError> {
    if calib.inputs.is_empty() {
        return Err(SettingsError::InvalidConfig(
            "calibration data has no samples".to_string(),
        ));
    }
    for (i, sample) in calib.inputs.iter().enumerate() {
        if sample.len() != descriptor.input_dim {
            return Err(SettingsError::CalibrationShape {
                sample: i,
                expected: descriptor.input_dim,
                actual: sample.len(),
            });
        }
    }
    let expected: Vec<Vec<f64>> = match &calib.outputs {
        Some(outputs) => {
            for (i, out) in outputs.iter().enumerate() {
                if out.len() != descriptor.output_dim() {
                    return Err(SettingsError::CalibrationShape {
                        sample: i,
                        expected: descriptor.output_dim(),
                        actual: out.len(),
                    });
                }
            }
            if outputs.len() != calib.inputs.len() {
                return Err(SettingsError::CalibrationShape {
                    sample: outputs.len().min(calib.inputs.len()),
                    expected: calib.inputs.len(),
                    actual: outputs.len(),
                });
            }
            outputs.clone()
        }
        None => calib.inputs.iter().map(|x| descriptor.forward(x)).collect(),
    };

    let (min, max) = calib
        .inputs
        .iter()
        .flatten()
        .copied()
        .minmax_by(|a, b| a.total_cmp(b))
        .into_option()
        .unwrap_or((0.0, 0.0));
    let pad = config.calibration_margin * (max - min).max(min.abs().max(max.abs())).max(1.0);
    let input_range = (min - pad, max + pad);

    let widen = 1.0 + config.calibration_margin;
    let boundaries = measure_magnitudes(descriptor, &calib.inputs);
    let mut last_error = f64::INFINITY;

    for scale in config.min_scale..=config.max_scale {
        let fp = FixedPoint::new(scale);
        let measured = calib
            .inputs
            .iter()
            .zip(&expected)
            .map(|(x, y)| {
                let got = dequantize_tensor(&simulate_fixed(descriptor, fp, x), fp);
                got.iter()
                    .zip(y)
                    .map(|(a, b)| (a - b).abs())
                    .fold(0.0, f64::max)
            })
            .fold(0.0, f64::max);
        debug!(scale, error = measured, "calibrated error");
        last_error = measured;
        if measured > config.tolerance {
            continue;
        }

        let max_value = boundaries
            .iter()
            .copied()
            .fold(input_range.0.abs().max(input_range.1.abs()), f64::max)
            * widen;
        let bits = lookup_bits(max_value, fp, config.headroom_bits);
        let max_accumulator = calibrated_accumulator(descriptor, &boundaries, widen, fp);
        check_widths(scale, bits, max_accumulator, config)?;

        return Ok(Settings {
            scale,
            input_range,
            lookup_bit_width: bits,
            supported_ops: config.supported_ops.clone(),
            descriptor_hash: descriptor.hash(),
            max_rows: config.max_rows,
            calibrated: true,
            estimated_error: measured,
        });
    }

    Err(precision_exhausted(last_error, config))
}

/// Largest absolute value at each layer boundary (index 0 is the input).
fn measure_magnitudes(descriptor: &ModelDescriptor, inputs: &[Vec<f64>]) -> Vec<f64> {
    let mut maxima = vec![0.0f64; descriptor.num_layers() + 1];
    for input in inputs {
        let mut x = input.clone();
        maxima[0] = x.iter().fold(maxima[0], |m, v| m.max(v.abs()));
        for (i, layer) in descriptor.layers.iter().enumerate() {
            x = match &layer.kind {
                LayerKind::Linear(params) => params.forward(&x),
                LayerKind::Activation(act) => x.iter().map(|&v| act.eval_f64(v)).collect(),
            };
            maxima[i + 1] = x.iter().fold(maxima[i + 1], |m, v| m.max(v.abs()));
        }
    }
    maxima
}

fn calibrated_accumulator(
    descriptor: &ModelDescriptor,
    boundaries: &[f64],
    widen: f64,
    fp: FixedPoint,
) -> f64 {
    let mult = fp.multiplier();
    descriptor
        .layers
        .iter()
        .enumerate()
        .filter_map(|(i, layer)| match &layer.kind {
            LayerKind::Linear(params) => {
                let mag = boundaries[i] * widen + fp.resolution();
                let worst = params
                    .weights
                    .iter()
                    .zip(&params.bias)
                    .map(|(row, b)| {
                        row.iter()
                            .map(|w| (w.abs() * mult + 0.5) * mag * mult)
                            .sum::<f64>()
                            + b.abs() * mult * mult
                            + 0.5
                            + mult / 2.0
                    })
                    .fold(0.0, f64::max);
                Some(worst)
            }
            LayerKind::Activation(_) => None,
        })
        .fold(0.0, f64::max)
}

/// Integer forward pass with exactly the arithmetic the circuit enforces.
pub fn simulate_fixed(descriptor: &ModelDescriptor, fp: FixedPoint, input: &[f64]) -> Vec<i64> {
    let mut x = quantize_tensor(input, fp);
    for layer in &descriptor.layers {
        x = match &layer.kind {
            LayerKind::Linear(params) => {
                let (weights, bias) = params.quantize(fp);
                weights
                    .iter()
                    .zip(&bias)
                    .map(|(row, &b)| {
                        let acc = row.iter().zip(&x).map(|(w, v)| w * v).sum::<i64>() + b;
                        fp.rescale(acc).0
                    })
                    .collect()
            }
            LayerKind::Activation(act) => x.iter().map(|&v| act.eval_fixed(v, fp)).collect(),
        };
    }
    x
}
