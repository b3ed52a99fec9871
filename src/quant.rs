//! 16-bit storage encoding for activations
//!
//! A value is rounded to IEEE half precision and its bit pattern stored as
//! `i16`. Consumers reinterpret the column as `f16`. Values beyond the half
//! range saturate to `±65504`.

use anyhow::Result;
use candle_core::{DType, Tensor};
use half::f16;

/// Largest finite half-precision magnitude
pub const F16_MAX: f32 = 65504.0;

/// Encode one value (deterministic, lossy)
pub fn quantize(x: f32) -> i16 {
    f16::from_f32(x.clamp(-F16_MAX, F16_MAX)).to_bits() as i16
}

/// Decode a stored value
pub fn dequantize(q: i16) -> f32 {
    f16::from_bits(q as u16).to_f32()
}

/// Worst-case absolute error of [`quantize`] for an in-range input
pub fn max_error(x: f32) -> f32 {
    // 11-bit significand: half an ulp is |x| * 2^-11, subnormal spacing 2^-24
    x.abs() * 2f32.powi(-11) + 2f32.powi(-24)
}

pub fn quantize_slice(values: &[f32]) -> Vec<i16> {
    values.iter().map(|&v| quantize(v)).collect()
}

pub fn dequantize_slice(values: &[i16]) -> Vec<f32> {
    values.iter().map(|&v| dequantize(v)).collect()
}

/// Flatten a tensor of any float dtype and encode it
pub fn quantize_tensor(tensor: &Tensor) -> Result<Vec<i16>> {
    let values: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    Ok(quantize_slice(&values))
}
