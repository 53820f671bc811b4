//! A stand-in analysis engine speaking the line-delimited JSON protocol.
//!
//! Reads one request per line from stdin and answers on stdout. The `mock`
//! field of a request selects a behaviour:
//!
//! - absent: `{"id", "result", "query"}` where `result` echoes `echo` or is 42
//! - `"error"`: an error response
//! - `"warning"`: a warning, then a normal result
//! - `"silent"`: no response at all
//! - `"garbage"`: a non-JSON line, then a normal result
//! - `"crash"`: a crash banner on stderr, then hang
//! - `"exit"`: exit immediately with `code` (default 3)
//!
//! `"streaming": true` sends a partial result before the final one and
//! `"delay_ms"` delays the answer. Flags: `--stubborn` ignores SIGTERM and
//! keeps running after stdin closes; `--exit-code N` sets the exit code on
//! stdin EOF.

use std::{
  io::{self, BufRead, Write},
  time::Duration,
};

use serde_json::{Value, json};

const BANNER: &str = "Started, ready to begin handling requests";

fn main() {
  let mut stubborn = false;
  let mut exit_code = 0;

  let mut args = std::env::args().skip(1);
  while let Some(arg) = args.next() {
    match arg.as_str() {
      "--stubborn" => stubborn = true,
      "--exit-code" => exit_code = args.next().and_then(|v| v.parse().ok()).unwrap_or(0),
      other => eprintln!("ignoring unknown argument {other}"),
    }
  }

  if stubborn {
    ignore_sigterm();
  }

  eprintln!("mock engine starting");
  eprintln!("{BANNER}");

  let stdin = io::stdin();
  for line in stdin.lock().lines() {
    let Ok(line) = line else {
      break;
    };
    if line.trim().is_empty() {
      continue;
    }
    handle(&line);
  }

  if stubborn {
    loop {
      std::thread::sleep(Duration::from_secs(60));
    }
  }
  std::process::exit(exit_code);
}

fn handle(line: &str) {
  let request: Value = match serde_json::from_str(line) {
    Ok(Value::Object(map)) => Value::Object(map),
    Ok(_) | Err(_) => {
      emit(&json!({"error": format!("could not parse request: {line}")}));
      return;
    }
  };

  let id = request.get("id").cloned().unwrap_or(Value::Null);

  if request.get("action").and_then(Value::as_str) == Some("terminate") {
    emit(&json!({
      "id": id,
      "action": "terminate",
      "terminateId": request.get("terminateId").cloned().unwrap_or(Value::Null),
    }));
    return;
  }

  if let Some(delay) = request.get("delay_ms").and_then(Value::as_u64) {
    std::thread::sleep(Duration::from_millis(delay));
  }

  let result = request.get("echo").cloned().unwrap_or(json!(42));
  let reply = json!({"id": id, "result": result, "query": request});

  match request.get("mock").and_then(Value::as_str) {
    Some("error") => emit(&json!({"id": id, "error": "mock failure"})),
    Some("warning") => {
      emit(&json!({"id": id, "warning": "mock warning", "field": "mock"}));
      emit(&reply);
    }
    Some("silent") => {}
    Some("garbage") => {
      println!("this is not json");
      emit(&reply);
    }
    Some("crash") => {
      eprintln!("Uncaught exception: mock engine crashed");
      loop {
        std::thread::sleep(Duration::from_secs(60));
      }
    }
    Some("exit") => {
      let code = request.get("code").and_then(Value::as_i64).unwrap_or(3);
      std::process::exit(code as i32);
    }
    _ => {
      if request.get("streaming").and_then(Value::as_bool) == Some(true) {
        emit(&json!({"id": id, "isDuringSearch": true, "result": result}));
        emit(&json!({"id": id, "isDuringSearch": false, "result": result, "query": request}));
      } else {
        emit(&reply);
      }
    }
  }
}

fn emit(value: &Value) {
  let mut out = io::stdout().lock();
  let _ = writeln!(out, "{value}");
  let _ = out.flush();
}

#[cfg(unix)]
fn ignore_sigterm() {
  unsafe {
    libc::signal(libc::SIGTERM, libc::SIG_IGN);
  }
}

#[cfg(not(unix))]
fn ignore_sigterm() {}
