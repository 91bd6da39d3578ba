//! Scriptable VM server stub.
//!
//! Stands in for the real engine in the integration tests: speaks the
//! same newline-delimited JSON protocol on stdio and takes directives
//! through the `code` / `functionName` fields so tests can provoke
//! delayed replies, remote errors, console events and malformed output.
//!
//! Directives for `run`:
//! - `delay:<ms>:<json>`  reply after a delay (enables reordering)
//! - `error:<msg>`        reply with `status: "error"`
//! - `log:<text>`         emit a `console.log` event, then succeed
//! - `elog:<text>`        emit a `console.error` event, then succeed
//! - `garbage`            print a non-JSON line and send no response
//! - `id`                 reply with the request's own id as the value
//! - anything else        echo the code back as the value
//!
//! For `call`, `log`/`elog` emit an event carrying the first argument.
//! When any launch argument contains `fail-ping`, `ping` is answered
//! with an error so handshake failure can be tested.

use serde_json::{json, Value};
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type Out = Arc<Mutex<std::io::Stdout>>;

fn write_frame(out: &Out, frame: Value) {
    let mut out = out.lock().unwrap();
    writeln!(out, "{frame}").unwrap();
    out.flush().unwrap();
}

fn success(id: u64, value: Value) -> Value {
    json!({"type": "response", "id": id, "status": "success", "value": value})
}

fn failure(id: u64, message: &str) -> Value {
    json!({"type": "response", "id": id, "status": "error", "error": message})
}

fn event(vm_id: Value, name: &str, value: &str) -> Value {
    json!({"type": "event", "vmId": vm_id, "name": name, "value": value})
}

fn main() {
    let fail_ping = std::env::args().any(|arg| arg.contains("fail-ping"));
    let out: Out = Arc::new(Mutex::new(std::io::stdout()));
    let mut next_vm_id: u64 = 1;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let request: Value = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(_) => continue,
        };
        let id = request["id"].as_u64().unwrap_or(0);
        let action = request["action"].as_str().unwrap_or("");

        match action {
            "ping" => {
                if fail_ping {
                    write_frame(&out, failure(id, "ping disabled"));
                } else {
                    write_frame(&out, success(id, Value::Null));
                }
            }
            "create" => {
                if request["options"]["failCreate"].as_bool() == Some(true) {
                    write_frame(&out, failure(id, "create refused"));
                } else {
                    let vm_id = next_vm_id;
                    next_vm_id += 1;
                    write_frame(&out, success(id, json!(vm_id)));
                }
            }
            "destroy" => {
                write_frame(&out, success(id, Value::Null));
            }
            "close" => {
                write_frame(&out, success(id, Value::Null));
                std::process::exit(0);
            }
            "run" => {
                let code = request["code"].as_str().unwrap_or("").to_string();
                handle_code(&out, id, request["vmId"].clone(), code);
            }
            "call" => {
                let function = request["functionName"].as_str().unwrap_or("");
                let first = request["args"][0].as_str().unwrap_or("").to_string();
                match function {
                    "log" => {
                        write_frame(&out, event(request["vmId"].clone(), "console.log", &first));
                        write_frame(&out, success(id, Value::Null));
                    }
                    "elog" => {
                        write_frame(
                            &out,
                            event(request["vmId"].clone(), "console.error", &first),
                        );
                        write_frame(&out, success(id, Value::Null));
                    }
                    "echo" => {
                        write_frame(&out, success(id, request["args"].clone()));
                    }
                    other => {
                        write_frame(&out, success(id, json!(other)));
                    }
                }
            }
            other => {
                write_frame(&out, failure(id, &format!("Unknown action: {other}")));
            }
        }
    }
}

fn handle_code(out: &Out, id: u64, vm_id: Value, code: String) {
    if let Some(rest) = code.strip_prefix("delay:") {
        let (millis, payload) = rest.split_once(':').unwrap_or((rest, "null"));
        let millis: u64 = millis.parse().unwrap_or(0);
        let value: Value = serde_json::from_str(payload).unwrap_or(Value::Null);
        let out = Arc::clone(out);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(millis));
            write_frame(&out, success(id, value));
        });
    } else if let Some(message) = code.strip_prefix("error:") {
        write_frame(out, failure(id, message));
    } else if let Some(text) = code.strip_prefix("log:") {
        write_frame(out, event(vm_id, "console.log", text));
        write_frame(out, success(id, Value::Null));
    } else if let Some(text) = code.strip_prefix("elog:") {
        write_frame(out, event(vm_id, "console.error", text));
        write_frame(out, success(id, Value::Null));
    } else if code == "garbage" {
        let mut locked = out.lock().unwrap();
        writeln!(locked, "this is not json").unwrap();
        locked.flush().unwrap();
    } else if code == "id" {
        write_frame(out, success(id, json!(id)));
    } else {
        write_frame(out, success(id, json!(code)));
    }
}
