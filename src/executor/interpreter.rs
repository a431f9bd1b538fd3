//! In-process restricted interpreter
//!
//! Runs Rhai scripts on a blocking thread with a fresh engine per call.
//! Scripts see the bindings as top-level variables, may `import` only the
//! authorized modules, and have their `print`/`debug` output captured. The
//! value of the last expression becomes the result's `output`.
//!
//! Built-in modules:
//!
//! | module  | functions                                                   |
//! |---------|-------------------------------------------------------------|
//! | `table` | `from_map(#{col: [..]})`, `from_records([#{..}])`, `series(name, [..])` |
//! | `chart` | `bar(x, y, title)`, `line(x, y, title)`, `scatter(x, y, title)`, `from_spec(#{..})` |
//! | `image` | `canvas(width, height)`                                     |
//! | `stats` | `sum`, `mean`, `median`, `stdev`, `min`, `max` over arrays  |

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rhai::module_resolvers::StaticModuleResolver;
use rhai::{
    Array, Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Module, NativeCallContext,
    Position, Scope, FLOAT, INT,
};
use serde_json::json;
use tracing::debug;

use super::{CodeExecutor, ExecutionRequest, ExecutionResult, ExecutorKind};
use crate::output::{Bindings, ChartSpec, Column, DataTable, ImageSurface, Series, TypedOutput, Value};

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

/// Modules the interpreter knows how to provide
pub const KNOWN_MODULES: [&str; 4] = ["table", "chart", "image", "stats"];

/// Limits and allow-list for the interpreter
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// Modules scripts may import; anything else fails the import
    pub authorized_modules: Vec<String>,
    /// Upper bound on engine operations per call
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_string_size: usize,
    pub max_collection_size: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            authorized_modules: KNOWN_MODULES.iter().map(|m| m.to_string()).collect(),
            max_operations: 50_000_000,
            max_call_levels: 64,
            max_string_size: 1 << 20,
            max_collection_size: 1_000_000,
        }
    }
}

/// In-process script backend
pub struct Interpreter {
    config: Arc<InterpreterConfig>,
}

impl Interpreter {
    pub fn new(config: InterpreterConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(InterpreterConfig::default())
    }
}

#[async_trait]
impl CodeExecutor for Interpreter {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Interpreter
    }

    fn language(&self) -> &str {
        "rhai"
    }

    fn capabilities(&self) -> String {
        let modules = self.config.authorized_modules.join(", ");
        format!(
            "Code runs in the Rhai scripting language. Use `print(...)` for logs; the value of the \
             last expression is returned as the result. Tables support `columns()`, `len()`, \
             `head(n)`, `column(name)`, `select([..])`, `sort_by(name)`, `sort_by(name, true)`, \
             `filter(|row| ...)`, `records()`, `sum(col)`, `mean(col)`, `min(col)`, `max(col)` and \
             `group_sum(key, value)`. Importable modules: {modules} \
             (e.g. `import \"stats\" as stats; stats::mean([1, 2, 3])`)."
        )
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let config = self.config.clone();
        let start = Instant::now();
        match tokio::task::spawn_blocking(move || run_script(&config, &request)).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::failure(
                format!("Interpreter task failed: {}", e),
                Vec::new(),
                start.elapsed(),
            ),
        }
    }
}

/// Evaluate one script synchronously
fn run_script(config: &InterpreterConfig, request: &ExecutionRequest) -> ExecutionResult {
    let start = Instant::now();
    let logs = Arc::new(Mutex::new(Vec::new()));
    let timeout = request.timeout();
    let engine = build_engine(config, logs.clone(), start + timeout);

    let mut scope = Scope::new();
    for (name, value) in &request.bindings {
        scope.push_dynamic(name.clone(), to_dynamic(value));
    }

    let outcome = engine.eval_with_scope::<Dynamic>(&mut scope, &request.code);
    let logs = logs.lock().map(|l| l.clone()).unwrap_or_default();

    match outcome {
        Ok(result) => {
            let variables: Bindings = scope
                .iter()
                .map(|(name, _, value)| (name.to_string(), from_dynamic(value)))
                .collect();
            debug!(duration_ms = start.elapsed().as_millis() as u64, "Script finished");
            ExecutionResult::success(from_dynamic(result), logs, start.elapsed()).with_variables(variables)
        }
        Err(err) => ExecutionResult::failure(describe_error(&err, timeout), logs, start.elapsed()),
    }
}

fn describe_error(err: &EvalAltResult, timeout: Duration) -> String {
    match err {
        EvalAltResult::ErrorTerminated(..) => {
            format!("Execution timed out after {}s", timeout.as_secs())
        }
        EvalAltResult::ErrorTooManyOperations(..) => {
            "Execution exceeded the operation budget".to_string()
        }
        EvalAltResult::ErrorModuleNotFound(name, _) => {
            format!("Import of module '{}' is not allowed", name)
        }
        other => other.to_string(),
    }
}

fn push_lines(sink: &Mutex<Vec<String>>, text: &str) {
    if let Ok(mut logs) = sink.lock() {
        logs.extend(
            text.lines()
                .map(str::trim_end)
                .filter(|l| !l.is_empty())
                .map(String::from),
        );
    }
}

fn build_engine(config: &InterpreterConfig, logs: Arc<Mutex<Vec<String>>>, deadline: Instant) -> Engine {
    let mut engine = Engine::new();

    engine.set_max_operations(config.max_operations);
    engine.set_max_call_levels(config.max_call_levels);
    engine.set_max_expr_depths(128, 64);
    engine.set_max_string_size(config.max_string_size);
    engine.set_max_array_size(config.max_collection_size);
    engine.set_max_map_size(config.max_collection_size);
    engine.set_max_modules(KNOWN_MODULES.len());
    engine.disable_symbol("eval");

    let sink = logs.clone();
    engine.on_print(move |text| push_lines(&sink, text));
    engine.on_debug(move |text, _source, _pos| push_lines(&logs, text));
    engine.on_progress(move |_ops| (Instant::now() >= deadline).then(|| Dynamic::from("timeout")));

    register_types(&mut engine, deadline);

    let mut resolver = StaticModuleResolver::new();
    for name in &config.authorized_modules {
        if let Some(module) = builtin_module(name) {
            resolver.insert(name.as_str(), module);
        }
    }
    engine.set_module_resolver(resolver);

    engine
}

// ─────────────────────────────────────────────────────────────────────────────
// Value conversion
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(*b),
        Value::Int(i) => Dynamic::from_int(*i),
        Value::Float(x) => Dynamic::from_float(*x),
        Value::Text(s) => Dynamic::from(s.clone()),
        Value::List(items) => Dynamic::from_array(items.iter().map(to_dynamic).collect()),
        Value::Map(map) => Dynamic::from_map(
            map.iter()
                .map(|(k, v)| (k.as_str().into(), to_dynamic(v)))
                .collect(),
        ),
        Value::Table(table) => Dynamic::from(table.clone()),
        Value::Series(series) => Dynamic::from(series.clone()),
        Value::Image(image) => Dynamic::from(image.clone()),
        Value::Chart(chart) => Dynamic::from(chart.clone()),
        Value::Typed(typed) => Dynamic::from(typed.clone()),
        Value::Function(name) => Dynamic::from(format!("<function {}>", name)),
        Value::Opaque { repr, .. } => Dynamic::from(repr.clone()),
    }
}

pub(crate) fn from_dynamic(value: Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::Int(i);
    }
    if let Ok(x) = value.as_float() {
        return Value::Float(x);
    }
    if let Ok(c) = value.as_char() {
        return Value::Text(c.to_string());
    }
    if value.is_string() {
        return Value::Text(value.into_string().unwrap_or_default());
    }
    if value.is_array() {
        let items = value.into_array().unwrap_or_default();
        return Value::List(items.into_iter().map(from_dynamic).collect());
    }
    if value.is_map() {
        let map = value.try_cast::<rhai::Map>().unwrap_or_default();
        return Value::Map(
            map.into_iter()
                .map(|(k, v)| (k.to_string(), from_dynamic(v)))
                .collect(),
        );
    }
    if value.is::<DataTable>() {
        return value.try_cast::<DataTable>().map(Value::Table).unwrap_or_default();
    }
    if value.is::<Series>() {
        return value.try_cast::<Series>().map(Value::Series).unwrap_or_default();
    }
    if value.is::<ImageSurface>() {
        return value.try_cast::<ImageSurface>().map(Value::Image).unwrap_or_default();
    }
    if value.is::<ChartSpec>() {
        return value.try_cast::<ChartSpec>().map(Value::Chart).unwrap_or_default();
    }
    if value.is::<TypedOutput>() {
        return value.try_cast::<TypedOutput>().map(Value::Typed).unwrap_or_default();
    }
    if value.is::<FnPtr>() {
        return value
            .try_cast::<FnPtr>()
            .map(|f| Value::Function(f.fn_name().to_string()))
            .unwrap_or_default();
    }
    Value::Opaque {
        type_name: value.type_name().to_string(),
        repr: value.to_string(),
    }
}

fn numbers(items: &Array) -> RhaiResult<Vec<FLOAT>> {
    items
        .iter()
        .filter(|v| !v.is_unit())
        .map(|v| {
            v.as_float()
                .or_else(|_| v.as_int().map(|i| i as FLOAT))
                .map_err(|t| format!("expected a number, got {}", t).into())
        })
        .collect()
}

fn series_numbers(series: &Series) -> RhaiResult<Vec<FLOAT>> {
    let items: Array = series.values.iter().map(to_dynamic).collect();
    numbers(&items)
}

fn column_values(items: Array) -> Vec<Value> {
    items.into_iter().map(from_dynamic).collect()
}

fn record_map(table: &DataTable, row: usize) -> rhai::Map {
    table
        .columns()
        .iter()
        .map(|c| (c.name.as_str().into(), to_dynamic(&c.values[row])))
        .collect()
}

fn missing_column(name: &str) -> Box<EvalAltResult> {
    format!("no column named '{}'", name).into()
}

// ─────────────────────────────────────────────────────────────────────────────
// Custom types
// ─────────────────────────────────────────────────────────────────────────────

fn register_types(engine: &mut Engine, deadline: Instant) {
    engine
        .register_type_with_name::<DataTable>("Table")
        .register_fn("len", |t: &mut DataTable| t.row_count() as INT)
        .register_fn("columns", |t: &mut DataTable| -> Array {
            t.column_names().into_iter().map(Dynamic::from).collect()
        })
        .register_fn("head", |t: &mut DataTable, n: INT| t.head(n.max(0) as usize))
        .register_fn("column", |t: &mut DataTable, name: ImmutableString| -> RhaiResult<Series> {
            let column = t.column(&name).ok_or_else(|| missing_column(&name))?;
            Ok(Series::new(Some(column.name.clone()), column.values.clone()))
        })
        .register_fn("select", |t: &mut DataTable, names: Array| {
            let names: Vec<String> = names.into_iter().map(|n| n.to_string()).collect();
            t.select(&names)
        })
        .register_fn("sort_by", |t: &mut DataTable, name: ImmutableString| -> RhaiResult<DataTable> {
            t.sort_by(&name, false).ok_or_else(|| missing_column(&name))
        })
        .register_fn(
            "sort_by",
            |t: &mut DataTable, name: ImmutableString, descending: bool| -> RhaiResult<DataTable> {
                t.sort_by(&name, descending).ok_or_else(|| missing_column(&name))
            },
        )
        .register_fn(
            "filter",
            |ctx: NativeCallContext, t: &mut DataTable, predicate: FnPtr| -> RhaiResult<DataTable> {
                let mut keep = Vec::new();
                for row in 0..t.row_count() {
                    if predicate.call_within_context::<bool>(&ctx, (record_map(t, row),))? {
                        keep.push(row);
                    }
                }
                Ok(t.take(&keep))
            },
        )
        .register_fn("records", |t: &mut DataTable| -> Array {
            (0..t.row_count()).map(|row| Dynamic::from_map(record_map(t, row))).collect()
        })
        .register_fn("sum", |t: &mut DataTable, name: ImmutableString| -> RhaiResult<FLOAT> {
            let values = t.numeric(&name).ok_or_else(|| missing_column(&name))?;
            Ok(values.iter().sum())
        })
        .register_fn("mean", |t: &mut DataTable, name: ImmutableString| -> RhaiResult<FLOAT> {
            let values = t.numeric(&name).ok_or_else(|| missing_column(&name))?;
            Ok(mean(&values))
        })
        .register_fn("min", |t: &mut DataTable, name: ImmutableString| -> RhaiResult<Dynamic> {
            let values = t.numeric(&name).ok_or_else(|| missing_column(&name))?;
            Ok(values.into_iter().reduce(FLOAT::min).map_or(Dynamic::UNIT, Dynamic::from_float))
        })
        .register_fn("max", |t: &mut DataTable, name: ImmutableString| -> RhaiResult<Dynamic> {
            let values = t.numeric(&name).ok_or_else(|| missing_column(&name))?;
            Ok(values.into_iter().reduce(FLOAT::max).map_or(Dynamic::UNIT, Dynamic::from_float))
        })
        .register_fn(
            "group_sum",
            |t: &mut DataTable, key: ImmutableString, value: ImmutableString| -> RhaiResult<DataTable> {
                group_sum(t, &key, &value)
            },
        )
        .register_fn("to_string", |t: &mut DataTable| t.to_markdown(20))
        .register_fn("to_debug", |t: &mut DataTable| t.to_markdown(20));

    engine
        .register_type_with_name::<Series>("Series")
        .register_fn("len", |s: &mut Series| s.len() as INT)
        .register_fn("values", |s: &mut Series| -> Array { s.values.iter().map(to_dynamic).collect() })
        .register_fn("name", |s: &mut Series| s.display_name().to_string())
        .register_fn("sum", |s: &mut Series| -> RhaiResult<FLOAT> {
            Ok(series_numbers(s)?.iter().sum())
        })
        .register_fn("mean", |s: &mut Series| -> RhaiResult<FLOAT> {
            Ok(mean(&series_numbers(s)?))
        })
        .register_fn("to_string", |s: &mut Series| Value::Series(s.clone()).to_string());

    engine
        .register_type_with_name::<ImageSurface>("Image")
        .register_fn("width", |i: &mut ImageSurface| i.width as INT)
        .register_fn("height", |i: &mut ImageSurface| i.height as INT)
        .register_fn("set_pixel", |i: &mut ImageSurface, x: INT, y: INT, r: INT, g: INT, b: INT| {
            i.set_pixel(clamp_u32(x), clamp_u32(y), rgba(r, g, b));
        })
        .register_fn(
            "fill_rect",
            move |i: &mut ImageSurface, x: INT, y: INT, w: INT, h: INT, r: INT, g: INT, b: INT| -> RhaiResult<()> {
                let (x, y, w, h) = (clamp_u32(x), clamp_u32(y), clamp_u32(w), clamp_u32(h));
                if i.fill_rect(x, y, w, h, rgba(r, g, b), Some(deadline)) {
                    Ok(())
                } else {
                    Err(EvalAltResult::ErrorTerminated(Dynamic::from("timeout"), Position::NONE).into())
                }
            },
        );

    engine.register_type_with_name::<ChartSpec>("Chart");
    engine.register_type_with_name::<TypedOutput>("TypedOutput");
}

fn clamp_u32(v: INT) -> u32 {
    v.clamp(0, u32::MAX as INT) as u32
}

fn rgba(r: INT, g: INT, b: INT) -> [u8; 4] {
    let c = |v: INT| v.clamp(0, 255) as u8;
    [c(r), c(g), c(b), 255]
}

fn mean(values: &[FLOAT]) -> FLOAT {
    if values.is_empty() {
        return FLOAT::NAN;
    }
    values.iter().sum::<FLOAT>() / values.len() as FLOAT
}

fn group_sum(table: &DataTable, key: &str, value: &str) -> RhaiResult<DataTable> {
    let keys = &table.column(key).ok_or_else(|| missing_column(key))?.values;
    let values = &table.column(value).ok_or_else(|| missing_column(value))?.values;

    let mut order: Vec<Value> = Vec::new();
    let mut totals: BTreeMap<String, FLOAT> = BTreeMap::new();
    for (k, v) in keys.iter().zip(values) {
        let amount = match v {
            Value::Int(i) => *i as FLOAT,
            Value::Float(x) if !x.is_nan() => *x,
            _ => continue,
        };
        let label = k.to_string();
        if !totals.contains_key(&label) {
            order.push(k.clone());
        }
        *totals.entry(label).or_insert(0.0) += amount;
    }

    let sums = order
        .iter()
        .map(|k| Value::Float(totals.get(&k.to_string()).copied().unwrap_or(0.0)))
        .collect();
    Ok(DataTable::from_columns(vec![
        Column::new(key, order),
        Column::new(value, sums),
    ]))
}

// ─────────────────────────────────────────────────────────────────────────────
// Importable modules
// ─────────────────────────────────────────────────────────────────────────────

fn builtin_module(name: &str) -> Option<Module> {
    let mut module = Module::new();
    match name {
        "table" => {
            module.set_native_fn("from_map", |columns: rhai::Map| -> RhaiResult<DataTable> {
                let columns = columns
                    .into_iter()
                    .map(|(name, values)| -> RhaiResult<Column> {
                        let values = values
                            .into_array()
                            .map_err(|t| format!("column '{}' must be an array, got {}", name, t))?;
                        Ok(Column::new(name.to_string(), column_values(values)))
                    })
                    .collect::<RhaiResult<Vec<_>>>()?;
                Ok(DataTable::from_columns(columns))
            });
            module.set_native_fn("from_records", |rows: Array| -> RhaiResult<DataTable> {
                let records = rows
                    .into_iter()
                    .map(|row| -> RhaiResult<BTreeMap<String, Value>> {
                        match from_dynamic(row) {
                            Value::Map(map) => Ok(map),
                            other => Err(format!("records must be maps, got {}", other.type_name()).into()),
                        }
                    })
                    .collect::<RhaiResult<Vec<_>>>()?;
                Ok(DataTable::from_records(&records))
            });
            module.set_native_fn("series", |name: ImmutableString, values: Array| -> RhaiResult<Series> {
                Ok(Series::new(Some(name.to_string()), column_values(values)))
            });
        }
        "chart" => {
            for kind in ["bar", "line", "scatter"] {
                module.set_native_fn(kind, move |x: Array, y: Array, title: ImmutableString| -> RhaiResult<ChartSpec> {
                    Ok(xy_chart(kind, x, y, &title))
                });
            }
            module.set_native_fn("from_spec", |spec: rhai::Map| -> RhaiResult<ChartSpec> {
                Ok(ChartSpec {
                    spec: from_dynamic(Dynamic::from_map(spec)).to_json(),
                })
            });
        }
        "image" => {
            module.set_native_fn("canvas", |width: INT, height: INT| -> RhaiResult<ImageSurface> {
                if !(1..=4096).contains(&width) || !(1..=4096).contains(&height) {
                    return Err(format!("canvas size {}x{} out of range", width, height).into());
                }
                Ok(ImageSurface::new(width as u32, height as u32))
            });
        }
        "stats" => {
            module.set_native_fn("sum", |xs: Array| -> RhaiResult<FLOAT> { Ok(numbers(&xs)?.iter().sum()) });
            module.set_native_fn("mean", |xs: Array| -> RhaiResult<FLOAT> { Ok(mean(&numbers(&xs)?)) });
            module.set_native_fn("median", |xs: Array| -> RhaiResult<FLOAT> {
                let mut values = numbers(&xs)?;
                if values.is_empty() {
                    return Ok(FLOAT::NAN);
                }
                values.sort_by(|a, b| a.total_cmp(b));
                let mid = values.len() / 2;
                Ok(if values.len() % 2 == 0 {
                    (values[mid - 1] + values[mid]) / 2.0
                } else {
                    values[mid]
                })
            });
            module.set_native_fn("stdev", |xs: Array| -> RhaiResult<FLOAT> {
                let values = numbers(&xs)?;
                if values.len() < 2 {
                    return Ok(FLOAT::NAN);
                }
                let m = mean(&values);
                let var = values.iter().map(|v| (v - m).powi(2)).sum::<FLOAT>() / (values.len() - 1) as FLOAT;
                Ok(var.sqrt())
            });
            module.set_native_fn("min", |xs: Array| -> RhaiResult<FLOAT> {
                Ok(numbers(&xs)?.into_iter().reduce(FLOAT::min).unwrap_or(FLOAT::NAN))
            });
            module.set_native_fn("max", |xs: Array| -> RhaiResult<FLOAT> {
                Ok(numbers(&xs)?.into_iter().reduce(FLOAT::max).unwrap_or(FLOAT::NAN))
            });
        }
        _ => return None,
    }
    Some(module)
}

fn xy_chart(kind: &str, x: Array, y: Array, title: &str) -> ChartSpec {
    let x = Value::List(column_values(x)).to_json();
    let y = Value::List(column_values(y)).to_json();
    let trace = match kind {
        "scatter" => json!({"type": "scatter", "mode": "markers", "x": x, "y": y}),
        "line" => json!({"type": "scatter", "mode": "lines", "x": x, "y": y}),
        _ => json!({"type": kind, "x": x, "y": y}),
    };
    ChartSpec {
        spec: json!({"data": [trace], "layout": {"title": {"text": title}}}),
    }
}
