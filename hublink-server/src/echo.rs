//! Built-in hub used by the `hublink` binary and integration tests.

use async_trait::async_trait;
use hublink_connection::{ConnectionError, HubConnection, HubDispatcher};
use hublink_protocol::{
    ArgumentShape, CompletionMessage, HubMessage, InvocationMessage, Parameters,
    StreamInvocationMessage, StreamItemMessage, TargetRegistry,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Running streams per connection id, by invocation id.
type StreamTable = HashMap<String, HashMap<String, CancellationToken>>;

/// Hub with four targets:
///
/// - `Echo(any) -> any`
/// - `Count(int)`, streaming `0..n`
/// - `Fail(string)`, completing with that error
/// - `Add(int, int) -> int`
pub struct EchoHub {
    targets: Arc<TargetRegistry>,
    streams: Arc<Mutex<StreamTable>>,
    item_interval: Duration,
}

impl Default for EchoHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoHub {
    pub fn new() -> Self {
        Self {
            targets: Arc::new(Self::registry()),
            streams: Arc::new(Mutex::new(HashMap::new())),
            item_interval: Duration::ZERO,
        }
    }

    /// Pauses between stream items.
    pub fn with_item_interval(mut self, interval: Duration) -> Self {
        self.item_interval = interval;
        self
    }

    /// Signatures of the echo targets.
    pub fn registry() -> TargetRegistry {
        TargetRegistry::new()
            .with_target(
                "Echo",
                Parameters::Fixed(vec![ArgumentShape::Any]),
                ArgumentShape::Any,
            )
            .with_target(
                "Count",
                Parameters::Fixed(vec![ArgumentShape::Integer]),
                ArgumentShape::Integer,
            )
            .with_target(
                "Fail",
                Parameters::Fixed(vec![ArgumentShape::String]),
                ArgumentShape::Any,
            )
            .with_target(
                "Add",
                Parameters::Fixed(vec![ArgumentShape::Integer, ArgumentShape::Integer]),
                ArgumentShape::Integer,
            )
    }

    /// Number of streams still producing items.
    pub fn active_streams(&self) -> usize {
        self.streams.lock().values().map(HashMap::len).sum()
    }

    async fn invoke(
        &self,
        connection: &Arc<HubConnection>,
        invocation: InvocationMessage,
    ) -> Result<(), ConnectionError> {
        let outcome = Self::call(&invocation.target, &invocation.arguments);
        let Some(invocation_id) = invocation.invocation_id else {
            tracing::debug!(
                "[{}] Fire-and-forget {}",
                connection.context().sequence(),
                invocation.target
            );
            return Ok(());
        };

        let completion = match outcome {
            Ok(result) => CompletionMessage::with_result(invocation_id, result),
            Err(error) => CompletionMessage::with_error(invocation_id, error),
        };
        connection.send_reply(completion.into()).await
    }

    fn call(target: &str, arguments: &[Value]) -> Result<Value, String> {
        match target {
            "Echo" => Ok(arguments.first().cloned().unwrap_or(Value::Null)),
            "Add" => {
                let a = integer(arguments, 0)?;
                let b = integer(arguments, 1)?;
                a.checked_add(b)
                    .map(|sum| json!(sum))
                    .ok_or_else(|| "integer overflow".to_string())
            }
            "Fail" => Err(arguments
                .first()
                .and_then(Value::as_str)
                .unwrap_or("failed")
                .to_string()),
            "Count" => Err("Count is a streaming target".to_string()),
            other => Err(format!("unknown target '{}'", other)),
        }
    }

    async fn start_stream(
        &self,
        connection: &Arc<HubConnection>,
        invocation: StreamInvocationMessage,
    ) -> Result<(), ConnectionError> {
        let invocation_id = invocation.invocation_id;
        let count = match invocation.target.as_str() {
            "Count" => integer(&invocation.arguments, 0).and_then(|n| {
                if n < 0 {
                    Err("count must not be negative".to_string())
                } else {
                    Ok(n)
                }
            }),
            other => Err(format!("{} is not a streaming target", other)),
        };
        let count = match count {
            Ok(n) => n,
            Err(error) => {
                return connection
                    .send_reply(CompletionMessage::with_error(invocation_id, error).into())
                    .await
            }
        };

        let token = CancellationToken::new();
        self.streams
            .lock()
            .entry(connection.connection_id().to_string())
            .or_default()
            .insert(invocation_id.clone(), token.clone());

        let connection = connection.clone();
        let streams = self.streams.clone();
        let interval = self.item_interval;
        tokio::spawn(async move {
            let result = produce(&connection, &invocation_id, count, interval, &token).await;
            if let Err(e) = result {
                tracing::debug!(
                    "[{}] Stream {} ended: {}",
                    connection.context().sequence(),
                    invocation_id,
                    e
                );
            }
            let mut streams = streams.lock();
            if let Some(running) = streams.get_mut(connection.connection_id()) {
                running.remove(&invocation_id);
                if running.is_empty() {
                    streams.remove(connection.connection_id());
                }
            }
        });
        Ok(())
    }

    fn cancel(&self, connection: &HubConnection, invocation_id: &str) {
        let token = self
            .streams
            .lock()
            .get_mut(connection.connection_id())
            .and_then(|running| running.remove(invocation_id));
        // None when the stream already finished
        if let Some(token) = token {
            tracing::debug!(
                "[{}] Canceled stream {}",
                connection.context().sequence(),
                invocation_id
            );
            token.cancel();
        }
    }
}

/// Sends `0..count` followed by the completion.
///
/// A canceled stream stops early and completes with an error, which lets the
/// caller forget the id it canceled.
async fn produce(
    connection: &HubConnection,
    invocation_id: &str,
    count: i64,
    interval: Duration,
    token: &CancellationToken,
) -> Result<(), ConnectionError> {
    for i in 0..count {
        if !interval.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = token.cancelled() => break,
            }
        }
        if token.is_cancelled() {
            break;
        }
        connection
            .send_reply(StreamItemMessage::new(invocation_id, json!(i)).into())
            .await?;
    }

    let completion = if token.is_cancelled() {
        CompletionMessage::with_error(invocation_id, "stream canceled")
    } else {
        CompletionMessage::empty(invocation_id)
    };
    connection.send_reply(completion.into()).await
}

fn integer(arguments: &[Value], index: usize) -> Result<i64, String> {
    arguments
        .get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| format!("argument {} must be an integer", index))
}

#[async_trait]
impl HubDispatcher for EchoHub {
    fn targets(&self) -> Arc<TargetRegistry> {
        self.targets.clone()
    }

    async fn dispatch(
        &self,
        connection: &Arc<HubConnection>,
        message: HubMessage,
    ) -> Result<(), ConnectionError> {
        match message {
            HubMessage::Invocation(invocation) => self.invoke(connection, invocation).await,
            HubMessage::StreamInvocation(invocation) => {
                self.start_stream(connection, invocation).await
            }
            HubMessage::CancelInvocation(cancel) => {
                self.cancel(connection, &cancel.invocation_id);
                Ok(())
            }
            other => Err(ConnectionError::violation(format!(
                "hub cannot handle {}",
                other.message_type()
            ))),
        }
    }

    async fn disconnected(&self, connection: &Arc<HubConnection>) {
        let running = self.streams.lock().remove(connection.connection_id());
        for (_, token) in running.into_iter().flatten() {
            token.cancel();
        }
    }
}
