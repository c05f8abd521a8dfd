//! Smallest possible worker: one handler, default config, in-process broker.

use std::sync::Arc;

use relayq::prelude::*;
use serde_json::{Map, Value, json};

struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    type Resources = ();
    type Output = Value;

    fn worker_type(&self) -> &'static str {
        "echo"
    }

    async fn initialize(&self) -> Result<Self::Resources, TaskError> {
        Ok(())
    }

    async fn execute(
        &self,
        task: &Task,
        _resources: &Self::Resources,
        ctx: &mut TaskContext,
    ) -> Result<Self::Output, TaskError> {
        ctx.log(LogLevel::Info, format!("echoing task {}", task.id));
        Ok(json!({ "echo": Value::Object(task.payload.clone()) }))
    }
}

#[tokio::main]
async fn main() -> RelayResult<()> {
    let config = RelayConfig::development();
    relayq::logging::init(&config.logging);

    let broker = Arc::new(InMemoryBroker::new());
    let mut runtime = WorkerRuntime::new(config, broker, EchoHandler);
    runtime.start().await?;

    println!("📮 Worker is consuming! Press Ctrl+C to stop...");

    let mut payload = Map::new();
    payload.insert("text".to_string(), json!("hello queue"));
    runtime.queue().enqueue(&Task::new("echo", payload)).await?;

    runtime.wait_for_shutdown().await?;
    runtime.shutdown().await?;

    println!("📪 Worker stopped");
    Ok(())
}
