//! Output normalization
//!
//! Execution results come back as arbitrary [`Value`]s. [`normalize`] maps
//! every one of them onto [`TypedOutput`], a closed tagged union whose `kind`
//! fully determines the shape of `data`:
//!
//! | kind     | data                                  |
//! |----------|---------------------------------------|
//! | `text`   | string                                |
//! | `table`  | `{headers: [..], rows: [[..], ..]}`    |
//! | `image`  | base64 PNG                            |
//! | `plotly` | chart spec object                     |
//! | `json`   | any JSON value                        |
//! | `multi`  | list of typed outputs                 |

mod image;
mod normalize;
pub mod value;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use normalize::normalize;
pub use value::{cell_text, Bindings, ChartSpec, Column, DType, DataTable, ImageSurface, Series, Value};

/// Payload of a `kind = "table"` output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Optional descriptive fields attached to a typed output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtypes: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Position inside a `multi` parent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Name inside a `multi` parent built from a map
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_names: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_type: Option<String>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self == &Metadata::default()
    }
}

/// Normalized, wire-safe execution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TypedOutput {
    Text {
        data: String,
        #[serde(default, skip_serializing_if = "Metadata::is_empty")]
        metadata: Metadata,
    },
    Table {
        data: TableData,
        #[serde(default, skip_serializing_if = "Metadata::is_empty")]
        metadata: Metadata,
    },
    Image {
        data: String,
        #[serde(default, skip_serializing_if = "Metadata::is_empty")]
        metadata: Metadata,
    },
    Plotly {
        data: serde_json::Value,
        #[serde(default, skip_serializing_if = "Metadata::is_empty")]
        metadata: Metadata,
    },
    Json {
        data: serde_json::Value,
        #[serde(default, skip_serializing_if = "Metadata::is_empty")]
        metadata: Metadata,
    },
    Multi {
        data: Vec<TypedOutput>,
        #[serde(default, skip_serializing_if = "Metadata::is_empty")]
        metadata: Metadata,
    },
}

/// Every tag a typed output can carry
pub const OUTPUT_KINDS: [&str; 6] = ["text", "table", "image", "plotly", "json", "multi"];

impl TypedOutput {
    pub fn text(data: impl Into<String>) -> Self {
        TypedOutput::Text {
            data: data.into(),
            metadata: Metadata::default(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TypedOutput::Text { .. } => "text",
            TypedOutput::Table { .. } => "table",
            TypedOutput::Image { .. } => "image",
            TypedOutput::Plotly { .. } => "plotly",
            TypedOutput::Json { .. } => "json",
            TypedOutput::Multi { .. } => "multi",
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            TypedOutput::Text { metadata, .. }
            | TypedOutput::Table { metadata, .. }
            | TypedOutput::Image { metadata, .. }
            | TypedOutput::Plotly { metadata, .. }
            | TypedOutput::Json { metadata, .. }
            | TypedOutput::Multi { metadata, .. } => metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        match self {
            TypedOutput::Text { metadata, .. }
            | TypedOutput::Table { metadata, .. }
            | TypedOutput::Image { metadata, .. }
            | TypedOutput::Plotly { metadata, .. }
            | TypedOutput::Json { metadata, .. }
            | TypedOutput::Multi { metadata, .. } => metadata,
        }
    }
}
