//! `pamr list`, `pamr send` and `pamr echo`: short-lived and long-running
//! agents.

use super::{apply_router_override, fail, runtime};
use async_trait::async_trait;
use bytes::Bytes;
use pamr_agent::{Agent, IncomingMessage, MessageHandler};
use pamr_types::config::PamrConfig;
use pamr_types::{AgentId, MagicCookie};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Handler for agents that only make requests.
struct NotServing;

#[async_trait]
impl MessageHandler for NotServing {
    async fn handle_message(&self, _message: IncomingMessage) -> Result<Bytes, String> {
        Err("this agent does not accept messages".to_string())
    }
}

/// Sends every payload straight back.
struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn handle_message(&self, message: IncomingMessage) -> Result<Bytes, String> {
        info!(
            source = %message.source,
            bytes = message.payload.len(),
            one_way = message.one_way,
            "Echoing"
        );
        Ok(message.payload)
    }
}

pub fn cmd_list(config: PamrConfig, router: Option<String>, json: bool) {
    let mut agent_config = config.agent;
    apply_router_override(&mut agent_config, router.as_deref());

    let rt = runtime();
    rt.block_on(async move {
        let agent = Agent::from_config(agent_config, Arc::new(NotServing))
            .await
            .unwrap_or_else(|e| fail(e));
        let agents = agent.list_agents().await.unwrap_or_else(|e| fail(e));
        let own = agent.agent_id();
        agent.shutdown().await;

        // Our own short-lived registration is noise.
        let agents: Vec<_> = agents
            .into_iter()
            .filter(|d| Some(d.agent_id) != own)
            .collect();

        if json {
            let arr: Vec<serde_json::Value> = agents
                .iter()
                .map(|d| {
                    serde_json::json!({
                        "agent_id": d.agent_id.get(),
                        "reserved": d.reserved,
                        "idle_ms": d.idle_ms,
                        "endpoint": d.endpoint,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&arr).unwrap_or_default());
            return;
        }
        if agents.is_empty() {
            println!("No agents registered.");
            return;
        }
        println!("{:<12} {:<10} {:<10} ENDPOINT", "AGENT", "KIND", "IDLE");
        println!("{}", "-".repeat(58));
        for d in &agents {
            let kind = if d.reserved { "reserved" } else { "dynamic" };
            let idle = format!("{:.1}s", f64::from(d.idle_ms) / 1000.0);
            println!("{:<12} {:<10} {:<10} {}", d.agent_id, kind, idle, d.endpoint);
        }
    });
}

pub fn cmd_send(
    config: PamrConfig,
    dest: u32,
    payload: String,
    one_way: bool,
    timeout_ms: Option<u64>,
    router: Option<String>,
) {
    let destination = AgentId::new(dest).unwrap_or_else(|e| fail(e));
    let mut agent_config = config.agent;
    apply_router_override(&mut agent_config, router.as_deref());
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .or(agent_config.call_timeout());

    let rt = runtime();
    rt.block_on(async move {
        let agent = Agent::from_config(agent_config, Arc::new(NotServing))
            .await
            .unwrap_or_else(|e| fail(e));
        let outcome = if one_way {
            agent
                .send_one_way(destination, payload)
                .await
                .map(|()| Bytes::new())
        } else {
            agent.call_with_timeout(destination, payload, timeout).await
        };
        agent.shutdown().await;

        match outcome {
            Ok(_) if one_way => {}
            Ok(reply) => println!("{}", String::from_utf8_lossy(&reply)),
            Err(e) => fail(e),
        }
    });
}

pub fn cmd_echo(config: PamrConfig, id: Option<u32>, cookie: Option<String>) {
    let mut agent_config = config.agent;
    if id.is_some() {
        agent_config.agent_id = id;
    }
    if let Some(cookie) = cookie {
        agent_config.magic_cookie = Some(MagicCookie::new(cookie).unwrap_or_else(|e| fail(e)));
    }

    let rt = runtime();
    rt.block_on(async move {
        let agent = Agent::from_config(agent_config, Arc::new(Echo))
            .await
            .unwrap_or_else(|e| fail(e));
        match agent.agent_id() {
            Some(id) => println!("Echo agent registered as {id}"),
            None => println!("Echo agent registered"),
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            fail(format!("cannot wait for Ctrl+C: {e}"));
        }
        agent.shutdown().await;
    });
}
