//! Shared (de)serialization helpers for the SQL-backed stores. Both
//! `postgres_store` and `sqlite_store` persist enums and JSON-shaped columns
//! through the same `serde_json` round trip so the two backends stay
//! byte-for-byte compatible in what they accept back.

use cadence_executor::Pipeline;
use cadence_kernel::{KernelError, Value};
use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Serialize};

pub fn to_json_text<T: Serialize>(value: &T) -> Result<String, KernelError> {
    serde_json::to_string(value).map_err(|e| KernelError::Internal(format!("serialize: {e}")))
}

pub fn from_json_text<T: DeserializeOwned>(text: &str) -> Result<T, KernelError> {
    serde_json::from_str(text).map_err(|e| KernelError::Internal(format!("deserialize: {e}")))
}

pub fn value_to_json_text(value: &Value) -> String {
    value.to_string()
}

pub fn value_from_json_text(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or(Value::Null)
}

pub fn pipeline_to_json_text(pipeline: &Pipeline) -> Result<String, KernelError> {
    to_json_text(pipeline)
}

pub fn pipeline_from_json_text(text: &str) -> Result<Pipeline, KernelError> {
    from_json_text(text)
}

pub fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

pub fn opt_dt_to_ms(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(dt_to_ms)
}

pub fn opt_ms_to_dt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(ms_to_dt)
}
