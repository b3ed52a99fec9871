//! Output column layout
//!
//! The layout is fixed from model and prompt metadata before any worker
//! starts; every record a worker emits must match it exactly.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::ResolvedExtraction;
use crate::extract::HiddenRecord;
use crate::model::ModelMetadata;

/// Scalar type of a column's cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Int16,
    Int64,
    Float32,
    String,
}

/// Shape and element type of one column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnType {
    Value {
        dtype: ElementType,
    },
    /// Fixed-length list
    Sequence {
        dtype: ElementType,
        length: usize,
    },
    /// Fixed number of inner lists
    NestedSequence {
        dtype: ElementType,
        length: usize,
    },
    Array2 {
        dtype: ElementType,
        shape: [usize; 2],
    },
    Array3 {
        dtype: ElementType,
        shape: [usize; 3],
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(flatten)]
    pub column_type: ColumnType,
}

/// Column name of a layer's activations
pub fn hidden_column(layer: usize) -> String {
    format!("hidden_{layer}")
}

/// Ordered column layout of the dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub layers: Vec<usize>,
    pub num_variants: usize,
    pub num_classes: usize,
    pub hidden_size: usize,
    pub columns: Vec<Column>,
}

impl Schema {
    /// Lay out one activation column per layer plus the text, label and
    /// (for autoregressive models) log-probability columns
    pub fn build(
        layers: &[usize],
        num_variants: usize,
        num_classes: usize,
        hidden_size: usize,
        autoregressive: bool,
    ) -> Self {
        let mut columns: Vec<Column> = layers
            .iter()
            .map(|&layer| Column {
                name: hidden_column(layer),
                column_type: ColumnType::Array3 {
                    dtype: ElementType::Int16,
                    shape: [num_variants, num_classes, hidden_size],
                },
            })
            .collect();

        columns.push(Column {
            name: "variant_ids".into(),
            column_type: ColumnType::Sequence {
                dtype: ElementType::String,
                length: num_variants,
            },
        });
        columns.push(Column {
            name: "label".into(),
            column_type: ColumnType::Value {
                dtype: ElementType::Int64,
            },
        });
        columns.push(Column {
            name: "text_questions".into(),
            column_type: ColumnType::NestedSequence {
                dtype: ElementType::String,
                length: num_variants,
            },
        });
        if autoregressive {
            columns.push(Column {
                name: "model_logits".into(),
                column_type: ColumnType::Array2 {
                    dtype: ElementType::Float32,
                    shape: [num_variants, num_classes],
                },
            });
        }

        Self {
            layers: layers.to_vec(),
            num_variants,
            num_classes,
            hidden_size,
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_log_probs(&self) -> bool {
        self.column("model_logits").is_some()
    }

    /// Check a record against every column's shape
    pub fn validate(&self, record: &HiddenRecord) -> Result<()> {
        let (nv, nc, hs) = (self.num_variants, self.num_classes, self.hidden_size);

        anyhow::ensure!(
            record.hiddens.len() == self.layers.len(),
            "record has {} activation columns, schema has {}",
            record.hiddens.len(),
            self.layers.len()
        );
        for &layer in &self.layers {
            let name = hidden_column(layer);
            let hidden = record
                .hiddens
                .get(&name)
                .ok_or_else(|| anyhow::anyhow!("record is missing column {name}"))?;
            anyhow::ensure!(
                hidden.shape() == [nv, nc, hs],
                "{name} has shape {:?}, schema expects {:?}",
                hidden.shape(),
                [nv, nc, hs]
            );
        }

        anyhow::ensure!(
            record.variant_ids.len() == nv,
            "variant_ids has {} entries, schema expects {nv}",
            record.variant_ids.len()
        );
        anyhow::ensure!(
            record.text_questions.len() == nv && record.text_questions.iter().all(|v| v.len() == nc),
            "text_questions is not shaped [{nv}, {nc}]"
        );
        anyhow::ensure!(
            record.label >= 0 && (record.label as usize) < nc,
            "label {} outside 0..{nc}",
            record.label
        );

        match (&record.model_logits, self.has_log_probs()) {
            (Some(logits), true) => anyhow::ensure!(
                logits.shape() == [nv, nc],
                "model_logits has shape {:?}, schema expects {:?}",
                logits.shape(),
                [nv, nc]
            ),
            (None, false) => {}
            (Some(_), false) => anyhow::bail!("record has model_logits but schema does not"),
            (None, true) => anyhow::bail!("record is missing model_logits"),
        }
        Ok(())
    }
}

/// Derive the schema for a resolved extraction
pub fn build_schema(
    resolved: &ResolvedExtraction,
    metadata: &ModelMetadata,
    num_variants: usize,
    num_classes: usize,
) -> Schema {
    let layers = resolved.layers.indices(metadata.num_hidden_layers);
    let autoregressive = metadata.is_autoregressive(!resolved.config.use_encoder_states);
    Schema::build(
        &layers,
        num_variants,
        num_classes,
        metadata.hidden_size,
        autoregressive,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};
    use std::collections::BTreeMap;

    fn record(nv: usize, nc: usize, hs: usize, layers: &[usize], logits: bool) -> HiddenRecord {
        HiddenRecord {
            label: 1,
            variant_ids: (0..nv).map(|i| format!("t{i}")).collect(),
            text_questions: vec![vec!["q".to_string(); nc]; nv],
            hiddens: layers
                .iter()
                .map(|&l| (hidden_column(l), Array3::zeros((nv, nc, hs))))
                .collect::<BTreeMap<_, _>>(),
            model_logits: logits.then(|| Array2::zeros((nv, nc))),
        }
    }

    #[test]
    fn test_build_columns() {
        let schema = Schema::build(&[0, 2], 3, 2, 8, true);
        let names: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "hidden_0",
                "hidden_2",
                "variant_ids",
                "label",
                "text_questions",
                "model_logits"
            ]
        );
        assert_eq!(
            schema.column("hidden_2").unwrap().column_type,
            ColumnType::Array3 {
                dtype: ElementType::Int16,
                shape: [3, 2, 8]
            }
        );
        assert!(!Schema::build(&[0], 3, 2, 8, false).has_log_probs());
    }

    #[test]
    fn test_validate() {
        let schema = Schema::build(&[0, 1], 2, 2, 4, false);
        assert!(schema.validate(&record(2, 2, 4, &[0, 1], false)).is_ok());
        assert!(schema.validate(&record(2, 2, 5, &[0, 1], false)).is_err());
        assert!(schema.validate(&record(2, 2, 4, &[0], false)).is_err());
        assert!(schema.validate(&record(2, 2, 4, &[0, 1], true)).is_err());

        let mut bad_label = record(2, 2, 4, &[0, 1], false);
        bad_label.label = 2;
        assert!(schema.validate(&bad_label).is_err());
    }

    #[test]
    fn test_schema_serializes() {
        let schema = Schema::build(&[0], 1, 2, 3, true);
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains(r#""kind":"array3""#));
        let back: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schema);
    }
}
