//! Layer resolution
//!
//! Hidden state 0 is always the embedding output; hidden states `1..=L` are
//! the outputs of the L transformer blocks.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;

/// Concrete set of hidden-state indices to extract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerSelection {
    /// Every hidden state, `0..=num_hidden_layers`; resolved at extraction time
    All,
    /// Ordered, unique indices used verbatim
    Explicit(Vec<usize>),
}

impl LayerSelection {
    /// Materialize the indices for a model with `num_hidden_layers` blocks
    pub fn indices(&self, num_hidden_layers: usize) -> Vec<usize> {
        match self {
            LayerSelection::All => (0..=num_hidden_layers).collect(),
            LayerSelection::Explicit(layers) => layers.clone(),
        }
    }

    /// Check every index exists in a model with `num_hidden_layers` blocks
    pub fn validate(&self, num_hidden_layers: usize) -> Result<()> {
        if let LayerSelection::Explicit(layers) = self {
            if let Some(&layer) = layers.iter().find(|&&l| l > num_hidden_layers) {
                return Err(ExtractError::LayerOutOfRange {
                    layer,
                    num_layers: num_hidden_layers,
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Pure check of the layer options, no model metadata needed
pub fn check_layer_options(layers: &[usize], layer_stride: usize) -> Result<()> {
    if layer_stride == 0 {
        return Err(ExtractError::InvalidLayerStride.into());
    }
    if !layers.is_empty() && layer_stride > 1 {
        return Err(ExtractError::ConflictingLayerOptions {
            layers: layers.to_vec(),
            stride: layer_stride,
        }
        .into());
    }
    let mut seen = std::collections::HashSet::with_capacity(layers.len());
    for &layer in layers {
        anyhow::ensure!(seen.insert(layer), "layer {layer} listed more than once");
    }
    Ok(())
}

/// `{0} ∪ {1, 1+k, 1+2k, ...} ≤ L`
pub fn stride_layers(num_hidden_layers: usize, layer_stride: usize) -> Vec<usize> {
    std::iter::once(0)
        .chain((1..=num_hidden_layers).step_by(layer_stride.max(1)))
        .collect()
}

/// Resolve explicit layers XOR a stride against the model's block count
pub fn resolve_layers(
    layers: &[usize],
    layer_stride: usize,
    num_hidden_layers: usize,
) -> Result<LayerSelection> {
    check_layer_options(layers, layer_stride)?;

    let selection = if layer_stride > 1 {
        LayerSelection::Explicit(stride_layers(num_hidden_layers, layer_stride))
    } else if layers.is_empty() {
        LayerSelection::All
    } else {
        LayerSelection::Explicit(layers.to_vec())
    };
    selection.validate(num_hidden_layers)?;
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_two_on_four_layers() {
        let selection = resolve_layers(&[], 2, 4).unwrap();
        assert_eq!(selection, LayerSelection::Explicit(vec![0, 1, 3]));
    }

    #[test]
    fn test_stride_always_has_embedding_and_increases() {
        for num_layers in 1..40 {
            for stride in 2..9 {
                let layers = stride_layers(num_layers, stride);
                assert_eq!(layers[0], 0);
                assert!(layers.windows(2).all(|w| w[0] < w[1]));
                assert!(layers.iter().all(|&l| l <= num_layers));
            }
        }
    }

    #[test]
    fn test_conflicting_options() {
        let err = resolve_layers(&[1, 2], 3, 12).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExtractError>(),
            Some(ExtractError::ConflictingLayerOptions { stride: 3, .. })
        ));
    }

    #[test]
    fn test_explicit_layers_verbatim() {
        let selection = resolve_layers(&[5, 0, 2], 1, 6).unwrap();
        assert_eq!(selection.indices(6), vec![5, 0, 2]);
    }

    #[test]
    fn test_neither_means_all() {
        let selection = resolve_layers(&[], 1, 3).unwrap();
        assert_eq!(selection, LayerSelection::All);
        assert_eq!(selection.indices(3), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_out_of_range_and_duplicates() {
        let err = resolve_layers(&[0, 7], 1, 6).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExtractError>(),
            Some(ExtractError::LayerOutOfRange { layer: 7, .. })
        ));
        assert!(check_layer_options(&[1, 1], 1).is_err());
        assert!(check_layer_options(&[], 0).is_err());
    }
}
