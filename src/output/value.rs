//! Runtime value model shared by the execution backends and the normalizer
//!
//! Scripts produce and consume [`Value`]s. The enum is closed: every shape an
//! execution can return has a variant, so normalization is a plain `match`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::TypedOutput;

/// Variable bindings handed to an execution backend
pub type Bindings = BTreeMap<String, Value>;

/// Any value an execution can produce or consume
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Table(DataTable),
    Series(Series),
    Image(ImageSurface),
    Chart(ChartSpec),
    /// A callable; only its name survives serialization
    Function(String),
    /// A value the runtime cannot describe structurally
    Opaque { type_name: String, repr: String },
    /// An already-normalized output
    Typed(TypedOutput),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Text(_))
    }

    /// Short type label used in prompts and metadata
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "dict",
            Value::Table(_) => "table",
            Value::Series(_) => "series",
            Value::Image(_) => "image",
            Value::Chart(_) => "chart",
            Value::Function(_) => "function",
            Value::Opaque { type_name, .. } => type_name,
            Value::Typed(_) => "typed_output",
        }
    }

    /// JSON form with every non-serializable leaf replaced by text
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Text(s) => Json::String(s.clone()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Table(table) => Json::Array(
                table
                    .records()
                    .into_iter()
                    .map(|row| Value::Map(row).to_json())
                    .collect(),
            ),
            Value::Series(series) => Json::Array(series.values.iter().map(Value::to_json).collect()),
            Value::Image(image) => Json::String(format!("<image {}x{}>", image.width, image.height)),
            Value::Chart(chart) => chart.spec.clone(),
            Value::Function(name) => Json::String(format!("<function {}>", name)),
            Value::Opaque { repr, .. } => Json::String(repr.clone()),
            Value::Typed(typed) => serde_json::to_value(typed).unwrap_or(Json::Null),
        }
    }

    /// Structural value from JSON (objects become maps, never tables)
    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::Text(s.clone()),
            Json::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Table(table) => write!(f, "{}", table.to_markdown(table.row_count())),
            Value::Series(series) => {
                for (i, v) in series.values.iter().enumerate() {
                    writeln!(f, "{}\t{}", series.index_label(i), v)?;
                }
                write!(f, "Name: {}, Length: {}", series.display_name(), series.len())
            }
            Value::Function(name) => write!(f, "<function {}>", name),
            Value::Opaque { repr, .. } => write!(f, "{}", repr),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(|json| Value::from_json(&json))
    }
}

impl From<TypedOutput> for Value {
    fn from(typed: TypedOutput) -> Self {
        Value::Typed(typed)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Element type of a table column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int64,
    Float64,
    Bool,
    Object,
}

impl DType {
    /// Narrowest type holding every non-null value
    pub fn infer(values: &[Value]) -> Self {
        let mut dtype: Option<DType> = None;
        for value in values {
            let next = match value {
                Value::Null => continue,
                Value::Int(_) => DType::Int64,
                Value::Float(_) => DType::Float64,
                Value::Bool(_) => DType::Bool,
                _ => DType::Object,
            };
            dtype = Some(match (dtype, next) {
                (None, next) => next,
                (Some(a), b) if a == b => a,
                (Some(DType::Int64), DType::Float64) | (Some(DType::Float64), DType::Int64) => {
                    DType::Float64
                }
                _ => DType::Object,
            });
        }
        dtype.unwrap_or(DType::Object)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Int64 => "int64",
            DType::Float64 => "float64",
            DType::Bool => "bool",
            DType::Object => "object",
        }
    }
}

/// One named column of a table
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub dtype: DType,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            dtype: DType::infer(&values),
            values,
        }
    }
}

/// Column-oriented table; `Value::Null` marks a missing cell
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataTable {
    columns: Vec<Column>,
}

impl DataTable {
    /// Build from columns, padding short columns with nulls
    pub fn from_columns(columns: Vec<Column>) -> Self {
        let rows = columns.iter().map(|c| c.values.len()).max().unwrap_or(0);
        let columns = columns
            .into_iter()
            .map(|mut c| {
                c.values.resize(rows, Value::Null);
                c
            })
            .collect();
        Self { columns }
    }

    /// Build from row maps; the column order is the order keys first appear
    pub fn from_records(records: &[BTreeMap<String, Value>]) -> Self {
        let mut names: Vec<String> = Vec::new();
        for record in records {
            for key in record.keys() {
                if !names.contains(key) {
                    names.push(key.clone());
                }
            }
        }
        let columns = names
            .into_iter()
            .map(|name| {
                let values = records
                    .iter()
                    .map(|r| r.get(&name).cloned().unwrap_or(Value::Null))
                    .collect();
                Column::new(name, values)
            })
            .collect();
        Self::from_columns(columns)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, |c| c.values.len())
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Row-major values
    pub fn rows(&self) -> Vec<Vec<Value>> {
        (0..self.row_count())
            .map(|i| self.columns.iter().map(|c| c.values[i].clone()).collect())
            .collect()
    }

    pub fn records(&self) -> Vec<BTreeMap<String, Value>> {
        (0..self.row_count())
            .map(|i| {
                self.columns
                    .iter()
                    .map(|c| (c.name.clone(), c.values[i].clone()))
                    .collect()
            })
            .collect()
    }

    /// Rows `[start, end)`
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.row_count());
        let start = start.min(end);
        Self {
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    dtype: c.dtype,
                    values: c.values[start..end].to_vec(),
                })
                .collect(),
        }
    }

    pub fn head(&self, n: usize) -> Self {
        self.slice(0, n)
    }

    /// Subset of columns in the requested order; unknown names are skipped
    pub fn select(&self, names: &[String]) -> Self {
        Self {
            columns: names
                .iter()
                .filter_map(|n| self.column(n).cloned())
                .collect(),
        }
    }

    /// Rows whose indexes are listed, in that order
    pub fn take(&self, indexes: &[usize]) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    dtype: c.dtype,
                    values: indexes
                        .iter()
                        .filter_map(|&i| c.values.get(i).cloned())
                        .collect(),
                })
                .collect(),
        }
    }

    /// Stable sort on one column; nulls go last in both directions
    pub fn sort_by(&self, column: &str, descending: bool) -> Option<Self> {
        let values = &self.column(column)?.values;
        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&a, &b| {
            let (x, y) = (&values[a], &values[b]);
            match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) if descending => compare_values(y, x),
                (false, false) => compare_values(x, y),
            }
        });
        Some(self.take(&order))
    }

    /// Non-null numeric values of a column
    pub fn numeric(&self, column: &str) -> Option<Vec<f64>> {
        Some(
            self.column(column)?
                .values
                .iter()
                .filter_map(|v| match v {
                    Value::Int(i) => Some(*i as f64),
                    Value::Float(x) if !x.is_nan() => Some(*x),
                    _ => None,
                })
                .collect(),
        )
    }

    /// Markdown rendering of the first `limit` rows
    pub fn to_markdown(&self, limit: usize) -> String {
        let mut out = String::new();
        out.push_str("| ");
        out.push_str(&self.column_names().join(" | "));
        out.push_str(" |\n|");
        for _ in &self.columns {
            out.push_str(" --- |");
        }
        out.push('\n');
        for row in self.head(limit).rows() {
            let cells: Vec<String> = row.iter().map(cell_text).collect();
            out.push_str("| ");
            out.push_str(&cells.join(" | "));
            out.push_str(" |\n");
        }
        out
    }
}

/// Total order over scalar values: numbers, then text, then everything else
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn number(v: &Value) -> Option<f64> {
        match v {
            Value::Int(i) => Some(*i as f64),
            Value::Float(x) => Some(*x),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
    match (number(a), number(b)) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.to_string().cmp(&b.to_string()),
    }
}

/// Display text of a table cell; missing cells render empty
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Float(x) if x.is_nan() => String::new(),
        other => other.to_string(),
    }
}

/// One-dimensional labelled sequence
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Series {
    pub name: Option<String>,
    /// Index labels; positional when `None`
    pub index: Option<Vec<Value>>,
    pub values: Vec<Value>,
}

impl Series {
    pub fn new(name: Option<String>, values: Vec<Value>) -> Self {
        Self { name, index: None, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn index_label(&self, position: usize) -> Value {
        self.index
            .as_ref()
            .and_then(|index| index.get(position).cloned())
            .unwrap_or(Value::Int(position as i64))
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Value")
    }
}

/// RGBA pixel buffer a script drew into
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSurface {
    pub width: u32,
    pub height: u32,
    /// Row-major RGBA8, `width * height * 4` bytes
    pub pixels: Vec<u8>,
}

impl ImageSurface {
    /// Opaque white canvas
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![255; width as usize * height as usize * 4],
        }
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        self.pixels[offset..offset + 4].copy_from_slice(&rgba);
    }

    /// Fill a clipped rectangle row by row
    ///
    /// Returns false if `deadline` passed before every row was written.
    pub fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, rgba: [u8; 4], deadline: Option<Instant>) -> bool {
        let x_end = x.saturating_add(w).min(self.width);
        if x >= x_end {
            return true;
        }
        let stride = self.width as usize * 4;
        for py in y..y.saturating_add(h).min(self.height) {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            let row = py as usize * stride;
            let span = &mut self.pixels[row + x as usize * 4..row + x_end as usize * 4];
            for pixel in span.chunks_exact_mut(4) {
                pixel.copy_from_slice(&rgba);
            }
        }
        true
    }
}

/// Chart object exposing a structured (plotly-compatible) spec
#[derive(Debug, Clone, PartialEq)]
pub struct ChartSpec {
    pub spec: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> DataTable {
        DataTable::from_columns(vec![
            Column::new("city", vec!["Oslo".into(), "Lima".into(), "Pune".into()]),
            Column::new("temp", vec![Value::Float(4.5), Value::Int(19), Value::Null]),
        ])
    }

    #[test]
    fn test_dtype_inference() {
        let table = sample_table();
        assert_eq!(table.column("city").unwrap().dtype, DType::Object);
        assert_eq!(table.column("temp").unwrap().dtype, DType::Float64);
        assert_eq!(DType::infer(&[Value::Null]), DType::Object);
        assert_eq!(DType::infer(&[Value::Int(1), Value::Int(2)]), DType::Int64);
    }

    #[test]
    fn test_from_records_pads_missing_cells() {
        let mut a = BTreeMap::new();
        a.insert("x".to_string(), Value::Int(1));
        let mut b = BTreeMap::new();
        b.insert("y".to_string(), Value::Int(2));

        let table = DataTable::from_records(&[a, b]);
        assert_eq!(table.column_names(), vec!["x", "y"]);
        assert_eq!(table.rows(), vec![vec![Value::Int(1), Value::Null], vec![Value::Null, Value::Int(2)]]);
    }

    #[test]
    fn test_sort_by_puts_nulls_last() {
        let sorted = sample_table().sort_by("temp", true).unwrap();
        assert_eq!(
            sorted.column("city").unwrap().values,
            vec![Value::from("Lima"), Value::from("Oslo"), Value::from("Pune")]
        );
        assert!(sample_table().sort_by("missing", false).is_none());
        assert_eq!(sample_table().numeric("temp").unwrap(), vec![4.5, 19.0]);
    }

    #[test]
    fn test_markdown_renders_missing_as_empty() {
        let md = sample_table().to_markdown(5);
        assert!(md.starts_with("| city | temp |"));
        assert!(md.contains("| Pune |  |"));
    }

    #[test]
    fn test_json_conversion_strips_functions() {
        let mut map = BTreeMap::new();
        map.insert("f".to_string(), Value::Function("clean".into()));
        map.insert("n".to_string(), Value::Float(f64::NAN));

        let json = Value::Map(map).to_json();
        assert_eq!(json["f"], "<function clean>");
        assert!(json["n"].is_null());
    }

    #[test]
    fn test_image_surface_bounds() {
        let mut image = ImageSurface::new(2, 2);
        image.set_pixel(5, 5, [0, 0, 0, 255]);
        assert!(image.fill_rect(1, 1, 10, 10, [255, 0, 0, 255], None));
        assert_eq!(&image.pixels[12..16], &[255, 0, 0, 255]);
        assert_eq!(&image.pixels[0..4], &[255, 255, 255, 255]);
        assert!(image.fill_rect(5, 0, 1, 1, [0, 0, 0, 255], None));
    }

    #[test]
    fn test_fill_rect_stops_at_deadline() {
        let mut image = ImageSurface::new(64, 64);
        let past = Instant::now();
        assert!(!image.fill_rect(0, 0, 64, 64, [0, 0, 0, 255], Some(past)));
        assert!(image.pixels.iter().all(|&b| b == 255));
    }
}
