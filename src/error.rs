//! Typed failures that callers need to tell apart
//!
//! Everything else flows through `anyhow`. These variants are raised inside
//! an `anyhow::Error` and recovered with `downcast_ref::<ExtractError>()`.

use thiserror::Error;

/// Errors raised by configuration, device selection and prompt validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// Explicit layers and a layer stride were both requested
    #[error("cannot use both explicit layers {layers:?} and layer stride {stride}; use only one")]
    ConflictingLayerOptions { layers: Vec<usize>, stride: usize },

    /// A stride of zero never advances
    #[error("layer stride must be at least 1")]
    InvalidLayerStride,

    /// Token location policy outside {first, last, mean}
    #[error("invalid token location '{0}': expected one of first, last, mean")]
    InvalidTokenLoc(String),

    /// Variants of one example disagree on their number of choices
    #[error("ragged example: variant {variant} has {found} choices, expected {expected}")]
    RaggedChoices {
        variant: usize,
        expected: usize,
        found: usize,
    },

    /// Requested layer index beyond the model's hidden-state count
    #[error("layer {layer} out of range: model exposes hidden states 0..={num_layers}")]
    LayerOutOfRange { layer: usize, num_layers: usize },

    /// No accelerator met the memory floor and CPU fallback was disabled
    #[error("no device has at least {min_memory} bytes of free memory")]
    NoUsableDevice { min_memory: u64 },

    /// Dataset does not declare a train and a validation split
    #[error("need at least two splits (train + validation), found {0:?}")]
    MissingSplits(Vec<String>),

    /// Model architecture or capability the provider cannot serve
    #[error("unsupported: {0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = ExtractError::InvalidLayerStride.into();
        assert_eq!(
            err.downcast_ref::<ExtractError>(),
            Some(&ExtractError::InvalidLayerStride)
        );
    }

    #[test]
    fn test_ragged_message() {
        let err = ExtractError::RaggedChoices {
            variant: 1,
            expected: 2,
            found: 3,
        };
        assert_eq!(
            err.to_string(),
            "ragged example: variant 1 has 3 choices, expected 2"
        );
    }
}
