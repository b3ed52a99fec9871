//! Cached causal attention masks
//!
//! One mask is kept per `(device, dtype)`, sized to the longest sequence seen
//! so far. Shorter requests narrow its top-left block, which is itself a
//! causal mask, so the cache holds at most one tensor per device and dtype.
//! Clones are shallow (Arc bump).

use anyhow::Result;
use candle_core::{DType, Device, DeviceLocation, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

type MaskKey = ((u8, usize), DType);

/// Type alias for the causal mask cache to reduce type complexity
type CausalMaskCache = LazyLock<Mutex<HashMap<MaskKey, Tensor>>>;

static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Cache key component distinguishing device kind and ordinal
fn device_key(device: &Device) -> (u8, usize) {
    match device.location() {
        DeviceLocation::Cpu => (0, 0),
        DeviceLocation::Cuda { gpu_id } => (1, gpu_id),
        DeviceLocation::Metal { gpu_id } => (2, gpu_id),
    }
}

fn build_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?)
}

/// Create or retrieve a causal mask of shape `[1, 1, seq_len, seq_len]`
///
/// `0.0` where position j may attend to i (j <= i), `-inf` elsewhere:
/// ```text
/// [[[[0, -inf, -inf],
///    [0,    0, -inf],
///    [0,    0,    0]]]]
/// ```
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let cache_key = (device_key(device), dtype);

    {
        let cache = CAUSAL_MASK_CACHE
            .lock()
            .map_err(|_| anyhow::anyhow!("causal mask cache poisoned"))?;
        if let Some(cached) = cache.get(&cache_key) {
            if cached.dim(2)? >= seq_len {
                return Ok(cached.narrow(2, 0, seq_len)?.narrow(3, 0, seq_len)?);
            }
        }
    }

    let mask_tensor = build_causal_mask(seq_len, device, dtype)?;

    let mut cache = CAUSAL_MASK_CACHE
        .lock()
        .map_err(|_| anyhow::anyhow!("causal mask cache poisoned"))?;
    // Another worker may have grown the entry while this one was building
    let keep_existing = match cache.get(&cache_key) {
        Some(existing) => existing.dim(2)? >= seq_len,
        None => false,
    };
    if !keep_existing {
        cache.insert(cache_key, mask_tensor.clone());
    }

    Ok(mask_tensor)
}

/// Drop every cached mask
pub fn clear_mask_caches() {
    if let Ok(mut cache) = CAUSAL_MASK_CACHE.lock() {
        cache.clear();
    }
}

/// Number of cached masks
pub fn mask_cache_size() -> usize {
    CAUSAL_MASK_CACHE.lock().map(|c| c.len()).unwrap_or(0)
}

/// Sequence length of the cached mask for `device` and `dtype`, if any
pub fn cached_mask_len(device: &Device, dtype: DType) -> Option<usize> {
    let cache = CAUSAL_MASK_CACHE.lock().ok()?;
    cache.get(&(device_key(device), dtype)).and_then(|m| m.dim(2).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn rows(mask: &Tensor) -> Vec<Vec<f32>> {
        mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap()
    }

    #[test]
    #[serial]
    fn test_causal_mask_values() {
        clear_mask_caches();
        let mask = create_causal_mask(3, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);

        let rows = rows(&mask);
        assert_eq!(rows[0][0], 0.0);
        assert_eq!(rows[0][1], f32::NEG_INFINITY);
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    #[serial]
    fn test_causal_mask_cached() {
        clear_mask_caches();
        create_causal_mask(4, &Device::Cpu, DType::F32).unwrap();
        create_causal_mask(4, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_size(), 1);
        create_causal_mask(4, &Device::Cpu, DType::F16).unwrap();
        assert_eq!(mask_cache_size(), 2);
        clear_mask_caches();
        assert_eq!(mask_cache_size(), 0);
    }

    #[test]
    #[serial]
    fn test_mask_cache_bounded_across_lengths() {
        clear_mask_caches();
        for len in (1..=64).chain((1..=32).rev()) {
            let mask = create_causal_mask(len, &Device::Cpu, DType::F32).unwrap();
            assert_eq!(mask.dims(), &[1, 1, len, len]);
        }
        assert_eq!(mask_cache_size(), 1);
        assert_eq!(cached_mask_len(&Device::Cpu, DType::F32), Some(64));

        // A block narrowed from the longer mask is still causal
        let small = rows(&create_causal_mask(3, &Device::Cpu, DType::F32).unwrap());
        let fresh = rows(&build_causal_mask(3, &Device::Cpu, DType::F32).unwrap());
        assert_eq!(small, fresh);
        assert_eq!(small[1], vec![0.0, 0.0, f32::NEG_INFINITY]);
        clear_mask_caches();
    }
}
