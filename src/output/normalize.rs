//! Ordered normalization rules
//!
//! Rules are tried top to bottom and the first one that returns `Some` wins.
//! Later rules are structural supersets of earlier ones (a map of tables is
//! also a map), so the order below must not change.

use std::collections::BTreeMap;

use serde_json::Value as Json;

use super::image::encode_png_base64;
use super::value::{cell_text, DType, DataTable, Series, Value};
use super::{Metadata, TableData, TypedOutput, OUTPUT_KINDS};

struct Rule {
    name: &'static str,
    apply: fn(&Value) -> Option<TypedOutput>,
}

const RULES: &[Rule] = &[
    Rule { name: "typed", apply: already_typed },
    Rule { name: "tabular_collection", apply: tabular_collection },
    Rule { name: "table", apply: table },
    Rule { name: "series", apply: series },
    Rule { name: "image", apply: image },
    Rule { name: "chart", apply: chart },
    Rule { name: "scalar", apply: scalar },
    Rule { name: "structured", apply: structured },
];

/// Convert any execution result into a [`TypedOutput`]
///
/// Total: values no rule recognizes fall back to `kind = "text"`.
/// Idempotent: `normalize(&normalize(x).into()) == normalize(x)`.
pub fn normalize(value: &Value) -> TypedOutput {
    for rule in RULES {
        if let Some(out) = (rule.apply)(value) {
            tracing::trace!(rule = rule.name, kind = out.kind(), "Normalized value");
            return out;
        }
    }
    fallback(value)
}

fn already_typed(value: &Value) -> Option<TypedOutput> {
    match value {
        Value::Typed(typed) => Some(typed.clone()),
        Value::Map(map) => {
            let kind = match map.get("kind") {
                Some(Value::Text(kind)) => kind,
                _ => return None,
            };
            if !OUTPUT_KINDS.contains(&kind.as_str()) || !map.contains_key("data") {
                return None;
            }
            serde_json::from_value(value.to_json()).ok()
        }
        _ => None,
    }
}

fn tabular_collection(value: &Value) -> Option<TypedOutput> {
    match value {
        Value::List(items) if items.iter().any(|v| matches!(v, Value::Table(_))) => {
            let data = items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let mut child = normalize(item);
                    child.metadata_mut().index = Some(i);
                    child
                })
                .collect::<Vec<_>>();
            Some(TypedOutput::Multi {
                metadata: Metadata {
                    count: Some(data.len()),
                    original_type: Some("list".to_string()),
                    ..Metadata::default()
                },
                data,
            })
        }
        Value::Map(map) if map.values().any(|v| matches!(v, Value::Table(_))) => {
            let data = map
                .iter()
                .enumerate()
                .map(|(i, (name, item))| {
                    let mut child = normalize(item);
                    let meta = child.metadata_mut();
                    meta.name = Some(name.clone());
                    meta.index = Some(i);
                    child
                })
                .collect::<Vec<_>>();
            Some(TypedOutput::Multi {
                metadata: Metadata {
                    count: Some(data.len()),
                    has_names: Some(true),
                    original_type: Some("dict".to_string()),
                    ..Metadata::default()
                },
                data,
            })
        }
        _ => None,
    }
}

fn table(value: &Value) -> Option<TypedOutput> {
    let Value::Table(table) = value else {
        return None;
    };
    Some(table_output(table))
}

pub(crate) fn table_output(table: &DataTable) -> TypedOutput {
    let dtypes: BTreeMap<String, String> = table
        .columns()
        .iter()
        .map(|c| (c.name.clone(), c.dtype.as_str().to_string()))
        .collect();

    TypedOutput::Table {
        data: TableData {
            headers: table.column_names(),
            rows: table
                .rows()
                .iter()
                .map(|row| row.iter().map(cell_json).collect())
                .collect(),
        },
        metadata: Metadata {
            rows: Some(table.row_count()),
            columns: Some(table.column_count()),
            dtypes: Some(dtypes),
            ..Metadata::default()
        },
    }
}

fn series(value: &Value) -> Option<TypedOutput> {
    let Value::Series(series) = value else {
        return None;
    };
    Some(series_output(series))
}

fn series_output(series: &Series) -> TypedOutput {
    let rows = series
        .values
        .iter()
        .enumerate()
        .map(|(i, v)| vec![cell_json(&series.index_label(i)), cell_json(v)])
        .collect();

    let index_dtype = match &series.index {
        Some(labels) => DType::infer(labels),
        None => DType::Int64,
    };
    let dtypes = BTreeMap::from([
        ("Index".to_string(), index_dtype.as_str().to_string()),
        (series.display_name().to_string(), DType::infer(&series.values).as_str().to_string()),
    ]);

    TypedOutput::Table {
        data: TableData {
            headers: vec!["Index".to_string(), series.display_name().to_string()],
            rows,
        },
        metadata: Metadata {
            rows: Some(series.len()),
            columns: Some(2),
            dtypes: Some(dtypes),
            name: series.name.clone(),
            ..Metadata::default()
        },
    }
}

fn image(value: &Value) -> Option<TypedOutput> {
    let Value::Image(surface) = value else {
        return None;
    };
    match encode_png_base64(surface) {
        Ok(data) => Some(TypedOutput::Image {
            data,
            metadata: Metadata {
                format: Some("png".to_string()),
                ..Metadata::default()
            },
        }),
        Err(e) => {
            tracing::warn!(error = %e, "Image rasterization failed, falling back to text");
            None
        }
    }
}

fn chart(value: &Value) -> Option<TypedOutput> {
    let Value::Chart(chart) = value else {
        return None;
    };
    Some(TypedOutput::Plotly {
        data: chart.spec.clone(),
        metadata: Metadata::default(),
    })
}

fn scalar(value: &Value) -> Option<TypedOutput> {
    value.is_scalar().then(|| TypedOutput::text(value.to_string()))
}

fn structured(value: &Value) -> Option<TypedOutput> {
    match value {
        Value::List(_) | Value::Map(_) => Some(TypedOutput::Json {
            data: value.to_json(),
            metadata: Metadata::default(),
        }),
        _ => None,
    }
}

fn fallback(value: &Value) -> TypedOutput {
    let data = match value {
        Value::Null => String::new(),
        other => other.to_string(),
    };
    TypedOutput::Text {
        data,
        metadata: Metadata {
            original_type: Some(value.type_name().to_string()),
            ..Metadata::default()
        },
    }
}

/// Table cell as JSON; missing cells become empty strings
fn cell_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::String(String::new()),
        Value::Float(x) if !x.is_finite() => Json::String(cell_text(value)),
        Value::Int(_) | Value::Float(_) | Value::Bool(_) | Value::Text(_) => value.to_json(),
        other => Json::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::value::{ChartSpec, Column, ImageSurface};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sales() -> DataTable {
        DataTable::from_columns(vec![
            Column::new("region", vec!["north".into(), "south".into()]),
            Column::new("total", vec![Value::Int(10), Value::Null]),
        ])
    }

    fn samples() -> Vec<Value> {
        let mut tables = BTreeMap::new();
        tables.insert("q1".to_string(), Value::Table(sales()));
        tables.insert("note".to_string(), Value::from("draft"));

        let mut nested = BTreeMap::new();
        nested.insert("f".to_string(), Value::Function("helper".into()));
        nested.insert("xs".to_string(), Value::List(vec![Value::Int(1), Value::Float(2.5)]));

        vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(4),
            Value::Float(f64::NAN),
            Value::from("hello"),
            Value::Table(sales()),
            Value::Table(DataTable::default()),
            Value::Series(Series::new(Some("total".into()), vec![Value::Int(3), Value::Int(4)])),
            Value::Image(ImageSurface::new(2, 2)),
            Value::Image(ImageSurface { width: 9, height: 9, pixels: vec![] }),
            Value::Chart(ChartSpec { spec: json!({"data": [{"type": "bar"}]}) }),
            Value::List(vec![Value::Table(sales()), Value::Int(1)]),
            Value::Map(tables),
            Value::Map(nested),
            Value::Function("f".into()),
            Value::Opaque { type_name: "socket".into(), repr: "<socket fd=3>".into() },
            Value::List(vec![]),
        ]
    }

    #[test]
    fn test_scalar_becomes_text() {
        assert_eq!(normalize(&Value::Int(4)), TypedOutput::text("4"));
        assert_eq!(normalize(&Value::Bool(false)), TypedOutput::text("false"));
    }

    #[test]
    fn test_table_missing_cells_are_empty_strings() {
        let TypedOutput::Table { data, metadata } = normalize(&Value::Table(sales())) else {
            panic!("expected table");
        };
        assert_eq!(data.headers, vec!["region", "total"]);
        assert_eq!(data.rows, vec![vec![json!("north"), json!(10)], vec![json!("south"), json!("")]]);
        assert_eq!(metadata.rows, Some(2));
        assert_eq!(metadata.columns, Some(2));
        assert_eq!(metadata.dtypes.unwrap()["total"], "int64");
    }

    #[test]
    fn test_series_becomes_two_column_table() {
        let out = normalize(&Value::Series(Series::new(None, vec![Value::from("a")])));
        let TypedOutput::Table { data, metadata } = out else {
            panic!("expected table");
        };
        assert_eq!(data.headers, vec!["Index", "Value"]);
        assert_eq!(data.rows, vec![vec![json!(0), json!("a")]]);

        let dtypes = metadata.dtypes.unwrap();
        assert_eq!(dtypes["Index"], "int64");
        assert_eq!(dtypes["Value"], "object");
    }

    #[test]
    fn test_named_tables_become_multi() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::Table(sales()));
        map.insert("b".to_string(), Value::Table(sales()));

        let TypedOutput::Multi { data, metadata } = normalize(&Value::Map(map)) else {
            panic!("expected multi");
        };
        assert_eq!(metadata.count, Some(2));
        assert_eq!(metadata.has_names, Some(true));
        assert_eq!(data[1].kind(), "table");
        assert_eq!(data[1].metadata().name.as_deref(), Some("b"));
        assert_eq!(data[1].metadata().index, Some(1));
    }

    #[test]
    fn test_image_and_chart() {
        let out = normalize(&Value::Image(ImageSurface::new(1, 1)));
        assert_eq!(out.kind(), "image");
        assert_eq!(out.metadata().format.as_deref(), Some("png"));

        let spec = json!({"data": [], "layout": {"title": "t"}});
        let out = normalize(&Value::Chart(ChartSpec { spec: spec.clone() }));
        assert_eq!(out, TypedOutput::Plotly { data: spec, metadata: Metadata::default() });
    }

    #[test]
    fn test_structured_strips_functions() {
        let mut map = BTreeMap::new();
        map.insert("cb".to_string(), Value::Function("on_done".into()));
        let out = normalize(&Value::Map(map));
        assert_eq!(
            out,
            TypedOutput::Json { data: json!({"cb": "<function on_done>"}), metadata: Metadata::default() }
        );
    }

    #[test]
    fn test_fallback_keeps_original_type() {
        let out = normalize(&Value::Opaque { type_name: "socket".into(), repr: "<socket>".into() });
        assert_eq!(out.kind(), "text");
        assert_eq!(out.metadata().original_type.as_deref(), Some("socket"));

        let broken = normalize(&Value::Image(ImageSurface { width: 3, height: 3, pixels: vec![] }));
        assert_eq!(broken.kind(), "text");
    }

    #[test]
    fn test_totality() {
        for value in samples() {
            let out = normalize(&value);
            assert!(OUTPUT_KINDS.contains(&out.kind()), "{:?}", value);
        }
    }

    #[test]
    fn test_idempotence_in_memory_and_over_the_wire() {
        for value in samples() {
            let once = normalize(&value);
            assert_eq!(normalize(&Value::from(once.clone())), once);

            let wire = Value::from_json(&serde_json::to_value(&once).unwrap());
            assert_eq!(normalize(&wire), once, "wire round trip of {:?}", value);
        }
    }
}
