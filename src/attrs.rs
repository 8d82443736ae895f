//! Attribute constructors shared by the trace, metric, and log facades.
//!
//! Thin wrappers over [`KeyValue`] so call sites read uniformly:
//!
//! ```
//! use heron_otel::attrs;
//!
//! let attributes = vec![
//!     attrs::string("order.status", "paid"),
//!     attrs::int("order.items", 3),
//!     attrs::boolean("order.express", false),
//! ];
//! ```

use opentelemetry::{Array, Key, KeyValue, StringValue, Value};

pub fn string(key: impl Into<Key>, value: impl Into<StringValue>) -> KeyValue {
    KeyValue::new(key, Value::String(value.into()))
}

pub fn int(key: impl Into<Key>, value: i64) -> KeyValue {
    KeyValue::new(key, Value::I64(value))
}

pub fn float(key: impl Into<Key>, value: f64) -> KeyValue {
    KeyValue::new(key, Value::F64(value))
}

pub fn boolean(key: impl Into<Key>, value: bool) -> KeyValue {
    KeyValue::new(key, Value::Bool(value))
}

pub fn strings(
    key: impl Into<Key>,
    values: impl IntoIterator<Item = impl Into<StringValue>>,
) -> KeyValue {
    let values: Vec<StringValue> = values.into_iter().map(Into::into).collect();
    KeyValue::new(key, Value::Array(Array::String(values)))
}
