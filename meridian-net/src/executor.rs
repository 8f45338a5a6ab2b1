use async_trait::async_trait;
use meridian_base::ShardId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// A shard-facing command body. Field augmentation (spec §4.2/§6) operates on
/// this directly; on-the-wire encoding is an external collaborator's concern.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandBody(pub Map<String, Value>);

impl CommandBody {
    pub fn new() -> Self {
        CommandBody(Map::new())
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteConcern {
    pub w: Option<String>,
    pub wtimeout_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub name: String,
    pub database: String,
    pub body: CommandBody,
    pub write_concern: Option<WriteConcern>,
}

impl Command {
    pub fn new(name: impl Into<String>, database: impl Into<String>, body: CommandBody) -> Self {
        Command {
            name: name.into(),
            database: database.into(),
            body,
            write_concern: None,
        }
    }

    pub fn with_write_concern(mut self, wc: WriteConcern) -> Self {
        self.write_concern = Some(wc);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommandResponse {
    pub ok: bool,
    /// driver-style numeric error code, absent on success.
    pub code: Option<i32>,
    pub body: CommandBody,
}

impl CommandResponse {
    pub fn ok(body: CommandBody) -> Self {
        CommandResponse {
            ok: true,
            code: None,
            body,
        }
    }

    pub fn err(code: i32, body: CommandBody) -> Self {
        CommandResponse {
            ok: false,
            code: Some(code),
            body,
        }
    }

    pub fn code_name(&self) -> Option<&str> {
        self.body.get("codeName").and_then(Value::as_str)
    }

    pub fn is_no_such_transaction(&self) -> bool {
        !self.ok && self.code_name() == Some("NoSuchTransaction")
    }

    pub fn read_only(&self) -> Option<bool> {
        self.body.get("readOnly").and_then(Value::as_bool)
    }
}

/// Well-known driver-style error codes the router and blocker need to branch
/// on. Kept as plain constants rather than a full code registry, which is
/// out of scope (spec §1).
pub mod codes {
    pub const NO_SUCH_TRANSACTION: &str = "NoSuchTransaction";
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransportError {
    pub code: Option<i32>,
    pub retryable: bool,
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>, retryable: bool) -> Self {
        TransportError {
            code: None,
            retryable,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport error: {}", self.message)
    }
}
impl std::error::Error for TransportError {}

#[derive(Clone, Debug, PartialEq)]
pub enum ExecutorError {
    Transport(TransportError),
    Cancelled,
}

impl std::fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorError::Transport(t) => write!(f, "{}", t),
            ExecutorError::Cancelled => write!(f, "cancelled"),
        }
    }
}
impl std::error::Error for ExecutorError {}

/// Sends a named command to a shard's primary. The router owns retry policy
/// (spec §2 item 2); this trait is purely "send one and await the outcome".
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn send(&self, shard: &ShardId, command: Command) -> Result<CommandResponse, ExecutorError>;
}

/// A test double that plays back a scripted queue of responses per shard and
/// records every command it was sent, for the literal scenarios in spec §8.
#[derive(Default)]
pub struct SimulatedExecutor {
    scripts: Mutex<HashMap<ShardId, VecDeque<Result<CommandResponse, ExecutorError>>>>,
    calls: Mutex<Vec<(ShardId, Command)>>,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn program(&self, shard: ShardId, response: Result<CommandResponse, ExecutorError>) {
        self.scripts.lock().await.entry(shard).or_default().push_back(response);
    }

    pub async fn calls(&self) -> Vec<(ShardId, Command)> {
        self.calls.lock().await.clone()
    }

    pub async fn calls_named(&self, name: &str) -> Vec<(ShardId, Command)> {
        self.calls()
            .await
            .into_iter()
            .filter(|(_, c)| c.name == name)
            .collect()
    }
}

#[async_trait]
impl RemoteExecutor for SimulatedExecutor {
    async fn send(&self, shard: &ShardId, command: Command) -> Result<CommandResponse, ExecutorError> {
        self.calls.lock().await.push((shard.clone(), command));
        let mut scripts = self.scripts.lock().await;
        match scripts.get_mut(shard).and_then(VecDeque::pop_front) {
            Some(resp) => resp,
            None => Ok(CommandResponse::ok(CommandBody::new())),
        }
    }
}

/// An executor that dispatches over a `tokio::sync::mpsc`-backed fake wire
/// (spec §4.4) rather than a scripted table, for integration-style tests
/// that want an async handler in the loop without a real network socket.
pub struct TokioExecutor {
    outbound: tokio::sync::mpsc::UnboundedSender<WireRequest>,
}

struct WireRequest {
    shard: ShardId,
    command: Command,
    reply: tokio::sync::oneshot::Sender<Result<CommandResponse, ExecutorError>>,
}

impl TokioExecutor {
    /// Spawns the fake wire's receive loop, driving every request through
    /// `handler` in arrival order.
    pub fn new<F, Fut>(mut handler: F) -> Self
    where
        F: FnMut(ShardId, Command) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<CommandResponse, ExecutorError>> + Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<WireRequest>();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let result = handler(request.shard, request.command).await;
                let _ = request.reply.send(result);
            }
        });
        TokioExecutor { outbound: tx }
    }
}

#[async_trait]
impl RemoteExecutor for TokioExecutor {
    async fn send(&self, shard: &ShardId, command: Command) -> Result<CommandResponse, ExecutorError> {
        let (reply, reply_rx) = tokio::sync::oneshot::channel();
        self.outbound
            .send(WireRequest {
                shard: shard.clone(),
                command,
                reply,
            })
            .map_err(|_| ExecutorError::Cancelled)?;
        reply_rx.await.map_err(|_| ExecutorError::Cancelled)?
    }
}

#[cfg(test)]
mod tokio_executor_tests {
    use super::*;

    #[tokio::test]
    async fn fake_wire_round_trips_through_the_handler() {
        let executor = TokioExecutor::new(|_shard, command| async move {
            let mut body = CommandBody::new();
            body.insert("echo", command.name.clone());
            Ok(CommandResponse::ok(body))
        });
        let command = Command::new("ping", "admin", CommandBody::new());
        let response = executor.send(&ShardId::new("shard1"), command).await.unwrap();
        assert_eq!(response.body.get("echo"), Some(&Value::String("ping".to_string())));
    }
}
