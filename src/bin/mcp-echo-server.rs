// Binary: mcp-echo-server
// Usage: mcp-echo-server [--noisy]
//
// Deterministic MCP server over stdio for tests and smoke checks.
// Tools:
// - echo: returns its arguments unchanged
// - delay: answers `{"value": value}` after `ms` milliseconds; calls overlap
// - fail: answers with a JSON-RPC error
// - crash: exits without answering
// - silent: never answers
// - garbage: writes undecodable lines and a stray response before answering
//
// With --noisy, non-JSON chatter is printed on stdout at startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;

use mcp_hub::mcp_client::types::error_codes;

type Out = Arc<Mutex<Stdout>>;

const PROTOCOL_VERSION: &str = "2024-11-05";

async fn send(out: &Out, message: &Value) -> Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    let mut stdout = out.lock().await;
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}

async fn send_raw(out: &Out, text: &str) -> Result<()> {
    let mut stdout = out.lock().await;
    stdout.write_all(text.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

fn result(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error(id: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

fn tool_list() -> Value {
    let object = json!({"type": "object"});
    json!({
        "tools": [
            {"name": "echo", "description": "Return the arguments unchanged", "inputSchema": object},
            {
                "name": "delay",
                "description": "Answer after a delay",
                "inputSchema": {
                    "type": "object",
                    "properties": {"ms": {"type": "integer"}, "value": {}},
                    "required": ["ms"]
                }
            },
            {"name": "fail", "description": "Always answer with an error", "inputSchema": object},
            {"name": "crash", "description": "Exit without answering", "inputSchema": object},
            {"name": "silent", "description": "Never answer", "inputSchema": object},
            {"name": "garbage", "description": "Emit noise, then answer", "inputSchema": object}
        ]
    })
}

async fn handle_call(out: Out, id: Value, params: Value) -> Result<()> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name {
        "echo" => send(&out, &result(&id, arguments)).await,
        "delay" => {
            let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
            let value = arguments.get("value").cloned().unwrap_or(Value::Null);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                if let Err(e) = send(&out, &result(&id, json!({"value": value}))).await {
                    eprintln!("mcp-echo-server: write failed: {e}");
                }
            });
            Ok(())
        }
        "fail" => send(&out, &error(&id, -32000, "tool failed on purpose")).await,
        "crash" => {
            eprintln!("mcp-echo-server: crashing on request");
            std::process::exit(3);
        }
        "silent" => Ok(()),
        "garbage" => {
            send_raw(&out, "this is not json").await?;
            send_raw(&out, r#"{"jsonrpc":"1.0","id":1,"result":{}}"#).await?;
            send(&out, &result(&json!(987_654_321), json!("stray"))).await?;
            send(&out, &result(&id, json!({"survived": true}))).await
        }
        other => send(&out, &error(&id, error_codes::INVALID_PARAMS, &format!("unknown tool: {other}"))).await,
    }
}

async fn handle_line(out: &Out, line: &str) -> Result<()> {
    let message: Value = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(_) => return send(out, &error(&Value::Null, error_codes::PARSE_ERROR, "Parse error")).await,
    };

    let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
    let params = message.get("params").cloned().unwrap_or_else(|| json!({}));

    // Notifications carry no id and get no answer.
    let Some(id) = message.get("id").cloned() else {
        return Ok(());
    };

    match method {
        "initialize" => {
            send(
                out,
                &result(
                    &id,
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "mcp-echo-server", "version": env!("CARGO_PKG_VERSION")}
                    }),
                ),
            )
            .await
        }
        "tools/list" => send(out, &result(&id, tool_list())).await,
        "tools/call" => handle_call(Arc::clone(out), id, params).await,
        other => send(out, &error(&id, error_codes::METHOD_NOT_FOUND, &format!("Method not found: {other}"))).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let noisy = std::env::args().skip(1).any(|arg| arg == "--noisy");
    let out: Out = Arc::new(Mutex::new(tokio::io::stdout()));

    if noisy {
        send_raw(&out, "mcp-echo-server starting up...").await?;
        send_raw(&out, "").await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        handle_line(&out, line).await?;
    }
    Ok(())
}
