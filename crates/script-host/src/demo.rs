//! Demo Modules
//!
//! Natively defined script modules the host ships with:
//!
//! - `example`: arithmetic and collection helpers plus a `Calculator` class
//! - `Core`: a `Client` class speaking the DG-LAB socket message format
//!   against a simulated connection

use std::thread;
use std::time::Duration;

use serde_json::{Map, Value, json};

use script_runtime::{CallResult, CallScope, ClassDef, ModuleDef, Runtime, ScriptException};

/// Register every demo module with `runtime`.
pub fn install(runtime: &Runtime) {
    runtime.register_module("example", || Ok(example_module()));
    runtime.register_module("Core", || Ok(core_module()));
}

// ─────────────────────────────────────────────────────────────────────────────
// example
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Op {
    Add,
    Multiply,
}

fn combine(op: Op, a: &Value, b: &Value) -> CallResult {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            Op::Add => x.checked_add(y),
            Op::Multiply => x.checked_mul(y),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| ScriptException::new("OverflowError", "integer overflow"));
    }
    if let (Op::Add, Some(x), Some(y)) = (op, a.as_str(), b.as_str()) {
        return Ok(json!(format!("{}{}", x, y)));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(json!(match op {
            Op::Add => x + y,
            Op::Multiply => x * y,
        })),
        _ => Err(ScriptException::type_error(format!(
            "unsupported operand types: {} and {}",
            a, b
        ))),
    }
}

pub fn example_module() -> ModuleDef {
    ModuleDef::new("example")
        .function("add", |scope| {
            let (a, b): (Value, Value) = (scope.arg(0)?, scope.arg(1)?);
            combine(Op::Add, &a, &b)
        })
        .function("multiply", |scope| {
            let (a, b): (Value, Value) = (scope.arg(0)?, scope.arg(1)?);
            combine(Op::Multiply, &a, &b)
        })
        .function("process_list", |scope| {
            let data: Vec<Value> = scope.arg(0)?;
            let doubled = data
                .iter()
                .map(|x| combine(Op::Multiply, x, &json!(2)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(doubled))
        })
        .function("process_dict", |scope| {
            let data: Map<String, Value> = scope.arg(0)?;
            let mut result = Map::new();
            for (key, value) in &data {
                result.insert(key.clone(), combine(Op::Multiply, value, &json!(3))?);
            }
            Ok(Value::Object(result))
        })
        .function("heavy_computation", |scope| {
            let n: u64 = scope.arg(0)?;
            let total = scope.allow_threads(|| {
                (0..n).fold(0u64, |acc, i| {
                    thread::sleep(Duration::from_millis(1));
                    acc.wrapping_add(i.wrapping_mul(i))
                })
            });
            Ok(json!(total))
        })
        .class(
            ClassDef::new("Calculator")
                .init(|scope| {
                    let name: String = scope.arg_or(0, "calculator".to_string())?;
                    scope.set_attr("name", name);
                    scope.set_attr("history", json!([]));
                    Ok(())
                })
                .method("calculate", |scope| {
                    let operation: String = scope.arg(0)?;
                    let (a, b): (Value, Value) = (scope.arg(1)?, scope.arg(2)?);
                    let result = match operation.as_str() {
                        "add" => combine(Op::Add, &a, &b)?,
                        "multiply" => combine(Op::Multiply, &a, &b)?,
                        other => {
                            return Err(ScriptException::value_error(format!("Unknown operation: {}", other)));
                        }
                    };
                    push_attr(scope, "history", json!(format!("{}({}, {}) = {}", operation, a, b, result)));
                    Ok(result)
                })
                .method("get_history", |scope| Ok(scope.get_attr("history").unwrap_or_else(|| json!([]))))
                .method("get_name", |scope| Ok(scope.get_attr("name").unwrap_or(Value::Null))),
        )
}

fn push_attr(scope: &mut CallScope<'_, '_>, name: &str, item: Value) {
    let mut list = scope.get_attr(name).unwrap_or_else(|| json!([]));
    if let Some(items) = list.as_array_mut() {
        items.push(item);
    }
    scope.set_attr(name, list);
}

// ─────────────────────────────────────────────────────────────────────────────
// Core
// ─────────────────────────────────────────────────────────────────────────────

const DEFAULT_WS_URL: &str = "ws://localhost:9999";
const QR_PREFIX: &str = "https://www.dungeon-lab.com/app-download.php#DGLAB-SOCKET#";
const MAX_PULSES: usize = 100;
const MAX_STRENGTH: u32 = 200;

/// Description of a DG-LAB socket error code.
pub fn error_message(code: i64) -> &'static str {
    match code {
        200 => "success",
        209 => "peer client disconnected",
        210 => "QR code carries no valid clientID",
        211 => "socket connected but the server never issued an app id",
        400 => "id already bound to another client",
        401 => "target client does not exist",
        402 => "sender and receiver are not bound",
        403 => "message is not a standard JSON object",
        404 => "recipient not found (offline)",
        405 => "message longer than 1950",
        500 => "internal server error",
        _ => "unknown error",
    }
}

fn require_connected(scope: &CallScope<'_, '_>) -> Result<(), ScriptException> {
    if scope.get_attr("connected").and_then(|v| v.as_bool()) == Some(true) {
        Ok(())
    } else {
        Err(ScriptException::runtime_error("client is not connected"))
    }
}

/// Record an outgoing `msg` frame and return it.
fn send_message(scope: &mut CallScope<'_, '_>, message: String) -> CallResult {
    require_connected(scope)?;
    let frame = json!({
        "type": "msg",
        "clientId": scope.get_attr("client_id").unwrap_or(Value::Null),
        "targetId": scope.get_attr("target_id").unwrap_or(Value::Null),
        "message": message,
    });
    push_attr(scope, "sent", frame.clone());
    Ok(frame)
}

fn sleep_ms(scope: &mut CallScope<'_, '_>) -> CallResult {
    let ms: u64 = scope.arg(0)?;
    scope.allow_threads(|| thread::sleep(Duration::from_millis(ms)));
    Ok(json!(ms))
}

fn positive(scope: &CallScope<'_, '_>, name: &str) -> Result<u64, ScriptException> {
    let value: u64 = scope.arg(0)?;
    if value == 0 {
        return Err(ScriptException::value_error(format!("{} must be positive", name)));
    }
    Ok(value)
}

pub fn core_module() -> ModuleDef {
    ModuleDef::new("Core")
        .attr("next_client_id", 1)
        .attr("connect_latency_ms", 0)
        .function("version", |_| Ok(json!(env!("CARGO_PKG_VERSION"))))
        .function("error_message", |scope| {
            let code: i64 = scope.arg(0)?;
            Ok(json!(error_message(code)))
        })
        .function("sleep_ms", sleep_ms)
        .class(client_class())
}

fn client_class() -> ClassDef {
    ClassDef::new("Client")
        .init(|scope| {
            scope.set_attr("ws_url", DEFAULT_WS_URL);
            scope.set_attr("heartbeat_interval", 60);
            scope.set_attr("reconnect_delay", 5);
            scope.set_attr("connected", false);
            scope.set_attr("client_id", Value::Null);
            scope.set_attr("target_id", Value::Null);
            scope.set_attr("sent", json!([]));
            Ok(())
        })
        .method("set_ws_url", |scope| {
            let url: String = scope.arg(0)?;
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ScriptException::value_error(format!("not a websocket url: {}", url)));
            }
            scope.set_attr("ws_url", url);
            Ok(Value::Null)
        })
        .method("set_heartbeat_interval", |scope| {
            let interval = positive(scope, "heartbeat interval")?;
            scope.set_attr("heartbeat_interval", interval);
            Ok(Value::Null)
        })
        .method("set_reconnect_delay", |scope| {
            let delay = positive(scope, "reconnect delay")?;
            scope.set_attr("reconnect_delay", delay);
            Ok(Value::Null)
        })
        .method("connect", |scope| {
            if require_connected(scope).is_ok() && scope.get_attr("client_id").is_some_and(|id| !id.is_null()) {
                return Ok(json!(true));
            }
            let latency = scope
                .module_attr("connect_latency_ms")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            if latency > 0 {
                scope.allow_threads(|| thread::sleep(Duration::from_millis(latency)));
            }

            let next = scope
                .module_attr("next_client_id")
                .and_then(|v| v.as_u64())
                .unwrap_or(1);
            scope.set_module_attr("next_client_id", next + 1);
            scope.set_attr("client_id", format!("client-{}", next));
            scope.set_attr("connected", true);
            Ok(json!(true))
        })
        .method("close", |scope| {
            scope.set_attr("connected", false);
            Ok(Value::Null)
        })
        .method("is_connected", |scope| Ok(json!(require_connected(scope).is_ok())))
        .method("bind_target", |scope| {
            require_connected(scope)?;
            let target: String = scope.arg(0)?;
            scope.set_attr("target_id", target.clone());
            Ok(json!({
                "type": "bind",
                "clientId": scope.get_attr("client_id").unwrap_or(Value::Null),
                "targetId": target,
                "message": "DGLAB",
            }))
        })
        .method("send_strength_operation", |scope| {
            let channel: u32 = scope.arg(0)?;
            let mode: u32 = scope.arg(1)?;
            let value: u32 = scope.arg(2)?;
            if !(1..=2).contains(&channel) || mode > 2 || value > MAX_STRENGTH {
                return Err(ScriptException::value_error(format!(
                    "invalid strength operation: channel={} mode={} value={}",
                    channel, mode, value
                )));
            }
            send_message(scope, format!("strength-{}+{}+{}", channel, mode, value))
        })
        .method("send_pulse", |scope| {
            let channel: String = scope.arg(0)?;
            let pulses: Vec<String> = scope.arg(1)?;
            if !(channel == "A" || channel == "B") || pulses.len() > MAX_PULSES {
                return Err(ScriptException::value_error(format!(
                    "invalid pulse: channel={} count={}",
                    channel,
                    pulses.len()
                )));
            }
            let encoded = serde_json::to_string(&pulses)
                .map_err(|e| ScriptException::value_error(e.to_string()))?;
            send_message(scope, format!("pulse-{}:{}", channel, encoded))
        })
        .method("send_clear_queue", |scope| {
            let channel: u32 = scope.arg(0)?;
            send_message(scope, format!("clear-{}", channel))
        })
        .method("generate_qr_content", |scope| {
            let Some(client_id) = scope.get_attr("client_id").and_then(|v| v.as_str().map(str::to_string)) else {
                return Ok(Value::Null);
            };
            let url = scope
                .get_attr("ws_url")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| DEFAULT_WS_URL.to_string());
            let server = url.split("://").nth(1).unwrap_or(url.as_str());
            Ok(json!(format!("{}{}/{}", QR_PREFIX, server, client_id)))
        })
        .method("get_status", |scope| {
            Ok(json!({
                "ws_url": scope.get_attr("ws_url"),
                "connected": scope.get_attr("connected"),
                "client_id": scope.get_attr("client_id"),
                "target_id": scope.get_attr("target_id"),
                "heartbeat_interval": scope.get_attr("heartbeat_interval"),
                "reconnect_delay": scope.get_attr("reconnect_delay"),
            }))
        })
        .method("sent_messages", |scope| Ok(scope.get_attr("sent").unwrap_or_else(|| json!([]))))
        .method("sleep_ms", sleep_ms)
}
