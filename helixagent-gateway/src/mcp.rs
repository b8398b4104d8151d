//! `mcp-server` subcommand: the gateway's ensemble exposed as MCP tools
//! over stdio.
//!
//! JSON-RPC 2.0, one message per line. Three methods matter:
//! `initialize`, `tools/list`, and `tools/call` with the `debate` and
//! `providers_status` tools. Anything else gets a method-not-found error.

use crate::server::AppState;
use helixagent_ensemble::context::RequestContext;
use helixagent_ensemble::models::{ChatRequest, Message};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Serve MCP over stdin/stdout until EOF.
pub async fn serve_stdio(state: AppState) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "malformed MCP request line");
                continue;
            }
        };

        // Notifications carry no id and get no reply
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        let method = request
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let response = match handle(&state, method, params).await {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message},
            }),
        };

        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn handle(
    state: &AppState,
    method: &str,
    params: Value,
) -> Result<Value, (i64, String)> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": "helixagent",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {"tools": {}},
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({"tools": tool_definitions()})),
        "tools/call" => {
            let name = params
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default();
            let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
            call_tool(state, name, arguments).await
        }
        other => Err((-32601, format!("method not found: {other}"))),
    }
}

fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "debate",
            "description": "Run a multi-provider ensemble debate on a prompt and return the consensus answer",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "prompt": {"type": "string"},
                    "rounds": {"type": "integer", "minimum": 1},
                },
                "required": ["prompt"],
            },
        }),
        json!({
            "name": "providers_status",
            "description": "Health, verification and score snapshot of every registered provider",
            "inputSchema": {"type": "object", "properties": {}},
        }),
    ]
}

async fn call_tool(
    state: &AppState,
    name: &str,
    arguments: Value,
) -> Result<Value, (i64, String)> {
    match name {
        "debate" => {
            let prompt = arguments
                .get("prompt")
                .and_then(|p| p.as_str())
                .ok_or((-32602, "prompt is required".to_string()))?;
            let rounds = arguments
                .get("rounds")
                .and_then(|r| r.as_u64())
                .map(|r| r.max(1) as u32);

            let request = ChatRequest {
                model: "ensemble".to_string(),
                messages: vec![Message::user(prompt)],
                extra_params: Some(helixagent_ensemble::models::ExtraParams {
                    rounds,
                    ..Default::default()
                }),
                ..Default::default()
            };
            let ctx = RequestContext::new().with_timeout(Duration::from_secs(
                state.config.server.request_timeout_secs,
            ));
            let config = state.orchestrator.config_for(&request);
            let outcome = state
                .orchestrator
                .run(&request, config, &ctx)
                .await
                .map_err(|e| (-32000, e.to_string()))?;

            Ok(json!({
                "content": [{"type": "text", "text": outcome.consensus}],
                "confidence": outcome.confidence,
                "rounds_completed": outcome.stats.rounds_completed,
            }))
        }
        "providers_status" => {
            let providers: Vec<Value> = state
                .registry
                .all()
                .iter()
                .map(|p| {
                    json!({
                        "id": p.config.id,
                        "admissible": state.registry.admissible(p),
                        "health": state.registry.health_record(&p.config.id),
                    })
                })
                .collect();
            Ok(json!({
                "content": [{
                    "type": "text",
                    "text": serde_json::to_string_pretty(&providers).unwrap_or_default(),
                }],
            }))
        }
        other => Err((-32602, format!("unknown tool: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_definitions_are_well_formed() {
        let tools = tool_definitions();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "debate");
        assert!(tools[0]["inputSchema"]["required"]
            .as_array()
            .unwrap()
            .contains(&json!("prompt")));
    }
}
