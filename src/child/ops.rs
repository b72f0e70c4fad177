//! Built-in compute operations served by `offload-worker`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Number, Value};
use tracing::warn;

use super::runtime::WorkHandler;
use crate::process::WorkPayload;

/// Largest accepted `long_sum` iteration count.
pub const MAX_ITERATIONS: u64 = 10_000_000_000;

#[derive(Debug, Deserialize)]
struct SumArgs {
    a: Number,
    b: Number,
}

#[derive(Debug, Deserialize)]
struct SleepArgs {
    ms: u64,
    #[serde(default)]
    value: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ExitArgs {
    #[serde(default)]
    code: i32,
}

#[derive(Debug, Deserialize)]
struct FailArgs {
    #[serde(default = "default_failure")]
    message: String,
}

fn default_failure() -> String {
    "requested failure".to_string()
}

#[derive(Debug, Deserialize)]
struct LongSumArgs {
    iterations: u64,
}

/// The operations every worker understands:
///
/// | op         | args                    | result                        |
/// |------------|-------------------------|-------------------------------|
/// | `sum`      | `{a, b}`                | `a + b`                       |
/// | `echo`     | anything                | the args unchanged            |
/// | `sleep`    | `{ms, value?}`          | `value` (or `ms`) after `ms`  |
/// | `long_sum` | `{iterations}`          | `0 + 1 + .. + (iterations-1)` |
/// | `fail`     | `{message?}`            | an error reply                |
/// | `exit`     | `{code?}`               | process exits, no reply       |
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinOps;

#[async_trait]
impl WorkHandler for BuiltinOps {
    async fn handle(&self, payload: WorkPayload) -> Result<Value, String> {
        let WorkPayload { op, args } = payload;
        match op.as_str() {
            "sum" => {
                let args: SumArgs = parse_args(&op, args)?;
                add(&args.a, &args.b)
            }
            "echo" => Ok(args),
            "sleep" => {
                let args: SleepArgs = parse_args(&op, args)?;
                tokio::time::sleep(Duration::from_millis(args.ms)).await;
                Ok(args.value.unwrap_or_else(|| Value::from(args.ms)))
            }
            "long_sum" => {
                let args: LongSumArgs = parse_args(&op, args)?;
                if args.iterations > MAX_ITERATIONS {
                    return Err(format!(
                        "iterations {} exceeds limit {MAX_ITERATIONS}",
                        args.iterations
                    ));
                }
                let total = tokio::task::spawn_blocking(move || long_sum(args.iterations))
                    .await
                    .map_err(|e| format!("computation aborted: {e}"))?;
                Ok(Value::from(total))
            }
            "fail" => {
                let args: FailArgs = parse_args(&op, args)?;
                Err(args.message)
            }
            "exit" => {
                let args: ExitArgs = parse_args(&op, args)?;
                warn!(code = args.code, "Exiting on request without replying");
                std::process::exit(args.code);
            }
            other => Err(format!("unknown op '{other}'")),
        }
    }
}

fn parse_args<T: DeserializeOwned>(op: &str, args: Value) -> Result<T, String> {
    // Missing args behave like an empty object so all-default ops work bare.
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| format!("invalid args for '{op}': {e}"))
}

/// Integer addition when both sides are integers, float otherwise.
fn add(a: &Number, b: &Number) -> Result<Value, String> {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| "integer overflow".to_string());
    }
    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
    Number::from_f64(a + b)
        .map(Value::Number)
        .ok_or_else(|| "result is not a finite number".to_string())
}

/// The deliberately CPU-bound loop used to demonstrate offloading.
fn long_sum(iterations: u64) -> u64 {
    let mut sum: u64 = 0;
    for i in 0..iterations {
        sum = sum.wrapping_add(std::hint::black_box(i));
    }
    sum
}
