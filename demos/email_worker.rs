//! Email delivery worker over the in-process broker.
//!
//! The SMTP transport here is a stand-in that logs instead of connecting,
//! with two recipients wired to fail so the retry ladder and the
//! dead-letter path are visible. Configuration comes from `EMAIL_*`
//! environment variables (see `RelayConfig::from_env`).

use std::sync::Arc;
use std::time::Duration;

use relayq::prelude::*;
use serde::Deserialize;
use serde_json::{Map, Value, json};

/// SMTP reply codes that mark a delivery as beyond retrying.
const PERMANENT_SMTP_CODES: [&str; 5] = ["550", "551", "553", "501", "421"];

/// Message fragments that mark a delivery as beyond retrying.
const PERMANENT_PATTERNS: [&str; 4] = ["spam", "blocked", "no such user", "address rejected"];

#[derive(Debug, Deserialize)]
struct EmailPayload {
    to: String,
    subject: String,
    #[serde(default)]
    text: String,
}

/// Pretend SMTP connection: sleeps and logs instead of talking to a server.
struct SmtpTransport {
    from: String,
}

impl SmtpTransport {
    async fn verify(&self) -> Result<(), TaskError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        println!("🔗 SMTP transport verified for sender {}", self.from);
        Ok(())
    }

    async fn send(&self, email: &EmailPayload) -> Result<String, TaskError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if email.to.ends_with("@bounce.test") {
            return Err(TaskError::transient("mailbox unavailable").with_code("550"));
        }
        if email.to.ends_with("@flaky.test") {
            return Err(TaskError::transient("connection reset by peer"));
        }
        println!(
            "✉️  {} -> {}: {} ({} bytes)",
            self.from,
            email.to,
            email.subject,
            email.text.len()
        );
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

struct EmailHandler {
    from: String,
    throttle: Throttle,
}

#[async_trait]
impl TaskHandler for EmailHandler {
    type Resources = SmtpTransport;
    type Output = Value;

    fn worker_type(&self) -> &'static str {
        "email"
    }

    async fn initialize(&self) -> Result<Self::Resources, TaskError> {
        let transport = SmtpTransport {
            from: self.from.clone(),
        };
        transport.verify().await?;
        Ok(transport)
    }

    fn initial_step(&self, task: &Task) -> String {
        match task.payload.get("to").and_then(Value::as_str) {
            Some(to) => format!("preparing email to {to}"),
            None => "preparing email".to_string(),
        }
    }

    async fn execute(
        &self,
        task: &Task,
        transport: &Self::Resources,
        ctx: &mut TaskContext,
    ) -> Result<Self::Output, TaskError> {
        let email: EmailPayload = task.payload_as()?;
        ctx.log(LogLevel::Info, format!("sending email to {}", email.to));

        self.throttle.acquire().await;
        ctx.set_step("sending");
        let message_id = transport.send(&email).await?;

        ctx.log(LogLevel::Info, format!("email sent, message id {message_id}"));
        Ok(json!({
            "messageId": message_id,
            "sentAt": chrono::Utc::now().to_rfc3339(),
        }))
    }

    fn is_permanent_error(&self, error: &TaskError, _task: &Task) -> bool {
        if error.is_permanent() {
            return true;
        }
        if let Some(code) = error.code() {
            if PERMANENT_SMTP_CODES.contains(&code) {
                return true;
            }
        }
        let message = error.message().to_lowercase();
        PERMANENT_PATTERNS
            .iter()
            .any(|pattern| message.contains(pattern))
    }

    async fn shutdown(&self, transport: &Self::Resources) -> Result<(), TaskError> {
        println!("🔌 Closing SMTP transport for {}", transport.from);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> RelayResult<()> {
    let config = RelayConfig::from_env("EMAIL")?;
    relayq::logging::init(&config.logging);

    if let Err(problems) = config.validate() {
        for problem in &problems {
            eprintln!("config error: {problem}");
        }
        return Err(RelayError::config(problems.join("; ")));
    }

    println!(
        "📧 Email worker starting on queue '{}'",
        config.queue.main_queue
    );

    let broker = Arc::new(InMemoryBroker::new());
    let handler = EmailHandler {
        from: "noreply@example.com".to_string(),
        throttle: Throttle::new(Duration::from_millis(1000)),
    };
    let mut runtime = WorkerRuntime::new(config, broker, handler);
    runtime.start().await?;

    println!("📬 Worker is consuming! Press Ctrl+C to stop...");

    let samples = [
        ("ana@example.com", "Welcome aboard"),
        ("bruno@flaky.test", "Retry ladder demo"),
        ("carla@bounce.test", "Dead-letter demo"),
        ("diego@example.com", "Weekly digest"),
    ];
    for (to, subject) in samples {
        let mut payload = Map::new();
        payload.insert("to".to_string(), json!(to));
        payload.insert("subject".to_string(), json!(subject));
        payload.insert("text".to_string(), json!("sent by the email worker demo"));
        let task = Task::new("send_email", payload);
        runtime.queue().enqueue(&task).await?;
        println!("📥 Task enqueued for {to}");
    }

    runtime.wait_for_shutdown().await?;
    runtime.shutdown().await?;

    println!("📪 Email worker stopped");
    Ok(())
}
