//! Hub endpoint over a duplex pipe.

use crate::config::DEFAULT_MAX_MESSAGE_SIZE;
use crate::context::ConnectionContext;
use crate::correlator::{
    CorrelatedBinder, DispatchOutcome, InvocationCorrelator, InvocationHandle, InvocationKind,
};
use crate::dispatcher::HubDispatcher;
use crate::error::ConnectionError;
use crate::pipe::DuplexPipe;
use hublink_protocol::message::*;
use hublink_protocol::{HubProtocolCodec, TargetRegistry};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One side of a negotiated hub connection.
///
/// Reads happen on a single path that decodes frames strictly in order.
/// Writes may come from any task; each frame is written whole.
pub struct HubConnection {
    context: Arc<ConnectionContext>,
    pipe: DuplexPipe,
    codec: HubProtocolCodec,
    targets: Arc<TargetRegistry>,
    correlator: InvocationCorrelator,
    /// Decoded messages not yet handed out by `read_message`.
    inbox: Mutex<VecDeque<HubMessage>>,
    /// Serializes writers so backpressure waits do not interleave.
    write_lock: Mutex<()>,
    /// Unconsumed bytes tolerated while a frame is incomplete.
    max_message_size: usize,
    finished: AtomicBool,
}

impl HubConnection {
    pub fn new(
        context: Arc<ConnectionContext>,
        pipe: DuplexPipe,
        codec: HubProtocolCodec,
        targets: Arc<TargetRegistry>,
    ) -> Self {
        Self {
            context,
            pipe,
            codec,
            targets,
            correlator: InvocationCorrelator::new(),
            inbox: Mutex::new(VecDeque::new()),
            write_lock: Mutex::new(()),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            finished: AtomicBool::new(false),
        }
    }

    /// Fails reads once an incomplete frame grows past `size` bytes.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size.max(1);
        self
    }

    /// Endpoint over the context's own transport pipe.
    pub fn over_transport(
        context: Arc<ConnectionContext>,
        codec: HubProtocolCodec,
        targets: Arc<TargetRegistry>,
    ) -> Self {
        let pipe = context.transport();
        Self::new(context, pipe, codec, targets)
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.context
    }

    pub fn connection_id(&self) -> &str {
        self.context.connection_id()
    }

    pub fn codec(&self) -> &HubProtocolCodec {
        &self.codec
    }

    pub fn targets(&self) -> &Arc<TargetRegistry> {
        &self.targets
    }

    pub fn correlator(&self) -> &InvocationCorrelator {
        &self.correlator
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    async fn write(&self, message: &HubMessage) -> Result<(), ConnectionError> {
        let framed = self.codec.write_message(message)?;
        let _guard = self.write_lock.lock().await;
        self.pipe.output.write(&framed).await?;
        tracing::debug!(
            "[{}] Sent {} ({} bytes)",
            self.context.sequence(),
            message.message_type(),
            framed.len()
        );
        Ok(())
    }

    /// Sends an invocation.
    ///
    /// Tracks it when a reply is expected or it streams, and returns the
    /// handle to wait on. Fire-and-forget invocations return `None`.
    pub async fn send_invocation(
        &self,
        target: &str,
        arguments: Vec<Value>,
        expect_reply: bool,
        streaming: bool,
    ) -> Result<Option<InvocationHandle>, ConnectionError> {
        if streaming {
            self.stream(target, arguments).await.map(Some)
        } else if expect_reply {
            self.invoke(target, arguments).await.map(Some)
        } else {
            self.send(target, arguments).await.map(|_| None)
        }
    }

    /// Sends an invocation that expects one completion.
    pub async fn invoke(
        &self,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<InvocationHandle, ConnectionError> {
        let handle = self
            .correlator
            .register(InvocationKind::Invocation, target)?;
        let message = InvocationMessage::new(handle.id(), target, arguments);
        self.write_tracked(handle, message.into()).await
    }

    /// Sends a streaming invocation.
    pub async fn stream(
        &self,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<InvocationHandle, ConnectionError> {
        let handle = self
            .correlator
            .register(InvocationKind::StreamInvocation, target)?;
        let message = StreamInvocationMessage::new(handle.id(), target, arguments);
        self.write_tracked(handle, message.into()).await
    }

    /// Sends a fire-and-forget invocation.
    pub async fn send(&self, target: &str, arguments: Vec<Value>) -> Result<(), ConnectionError> {
        if self.correlator.is_closed() {
            return Err(ConnectionError::TransportClosed);
        }
        self.write(&InvocationMessage::non_blocking(target, arguments).into())
            .await
    }

    async fn write_tracked(
        &self,
        handle: InvocationHandle,
        message: HubMessage,
    ) -> Result<InvocationHandle, ConnectionError> {
        if let Err(e) = self.write(&message).await {
            self.correlator.unregister(handle.id());
            return Err(e);
        }
        Ok(handle)
    }

    /// Sends an untracked message: a reply to the peer, a ping or a close.
    pub async fn send_reply(&self, message: HubMessage) -> Result<(), ConnectionError> {
        if matches!(
            message,
            HubMessage::Invocation(_) | HubMessage::StreamInvocation(_)
        ) {
            return Err(ConnectionError::violation(
                "invocations must be sent through the correlator",
            ));
        }
        self.write(&message).await
    }

    /// Stops a stream this side started and tells the peer.
    pub async fn cancel_stream(&self, invocation_id: &str) -> Result<bool, ConnectionError> {
        let Some(record) = self.correlator.cancel(invocation_id) else {
            return Ok(false);
        };
        if record.kind == InvocationKind::StreamInvocation {
            self.write(&CancelInvocationMessage::new(invocation_id).into())
                .await?;
        }
        Ok(true)
    }

    /// Returns the next decoded message, or `None` once the peer completed.
    ///
    /// A read may decode several frames; the extra messages are queued and
    /// handed out by later calls.
    pub async fn read_message(&self) -> Result<Option<HubMessage>, ConnectionError> {
        let mut inbox = self.inbox.lock().await;

        loop {
            if let Some(message) = inbox.pop_front() {
                return Ok(Some(message));
            }

            let result = self.pipe.input.read().await?;
            let len = result.buffer.len();
            let binder = CorrelatedBinder::new(&self.targets, &self.correlator);

            let decoded = match self.codec.decode_all(&result.buffer, &binder) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.pipe.input.advance_to(0, len)?;
                    return Err(e.into());
                }
            };
            self.pipe
                .input
                .advance_to(decoded.consumed, decoded.examined)?;

            let unconsumed = len - decoded.consumed;
            if unconsumed > self.max_message_size {
                return Err(ConnectionError::violation(format!(
                    "incomplete message of {} bytes exceeds the limit of {} bytes",
                    unconsumed, self.max_message_size
                )));
            }

            if !decoded.messages.is_empty() {
                tracing::debug!(
                    "[{}] Decoded {} message(s) from {} bytes",
                    self.context.sequence(),
                    decoded.messages.len(),
                    decoded.consumed
                );
            }
            inbox.extend(decoded.messages);

            if inbox.is_empty() && result.is_completed {
                if decoded.consumed < len {
                    return Err(ConnectionError::violation(format!(
                        "connection ended inside a frame ({} bytes left)",
                        len - decoded.consumed
                    )));
                }
                return Ok(None);
            }
        }
    }

    /// Routes an inbound message through the correlator.
    pub fn dispatch(&self, message: HubMessage) -> Result<DispatchOutcome, ConnectionError> {
        self.correlator.dispatch_inbound(message)
    }

    /// Read loop: delivers replies and forwards invocations until the peer
    /// closes or an error ends the connection.
    pub async fn run(self: &Arc<Self>, dispatcher: &dyn HubDispatcher) -> Result<(), ConnectionError> {
        loop {
            let message = match self.read_message().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    tracing::debug!("[{}] Peer completed", self.context.sequence());
                    self.finish();
                    return Ok(());
                }
                Err(e) => return Err(self.terminate(e).await),
            };

            match self.dispatch(message) {
                Ok(DispatchOutcome::Delivered) | Ok(DispatchOutcome::Consumed) => {}
                Ok(DispatchOutcome::Forward(message)) => {
                    if let Err(e) = dispatcher.dispatch(self, message).await {
                        return Err(self.terminate(e).await);
                    }
                }
                Ok(DispatchOutcome::Closed(error)) => {
                    match &error {
                        Some(error) => tracing::info!(
                            "[{}] Peer closed the connection: {}",
                            self.context.sequence(),
                            error
                        ),
                        None => tracing::debug!(
                            "[{}] Peer closed the connection",
                            self.context.sequence()
                        ),
                    }
                    self.finish();
                    return Ok(());
                }
                Err(e) => return Err(self.terminate(e).await),
            }
        }
    }

    /// Ends the connection because of `error` and returns it.
    ///
    /// Peer faults are reported in a `Close` message first.
    pub async fn terminate(&self, error: ConnectionError) -> ConnectionError {
        if error.is_peer_fault() && !self.is_finished() {
            tracing::warn!("[{}] {}", self.context.sequence(), error);
            let _ = self
                .write(&CloseMessage::with_error(error.to_string()).into())
                .await;
        } else {
            tracing::debug!("[{}] Connection ended: {}", self.context.sequence(), error);
        }
        self.finish();
        error
    }

    /// Sends `Close` and tears the connection down.
    pub async fn close(&self, error: Option<String>) -> Result<(), ConnectionError> {
        if self.is_finished() {
            return Ok(());
        }
        let result = self.write(&CloseMessage { error }.into()).await;
        self.finish();
        result
    }

    /// Tears the connection down without cancelling in-flight bytes.
    ///
    /// Pending invocations resolve with `ConnectionAborted`, the output is
    /// completed so already written frames still drain, and the input stops.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.correlator.abort_all();
        self.pipe.output.complete();
        self.pipe.input.complete();
        self.context.mark_disconnected();
        tracing::debug!("[{}] Connection finished", self.context.sequence());
    }

    /// Tears the connection down and cancels every pipe operation.
    pub fn abort(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.correlator.abort_all();
        self.context.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::PipeOptions;
    use async_trait::async_trait;
    use hublink_protocol::{ArgumentShape, ErrorKind, Parameters};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn targets() -> Arc<TargetRegistry> {
        Arc::new(
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
                ),
        )
    }

    /// Server endpoint on the transport pipe, peer endpoint on the application pipe.
    fn connected_pair(codec: HubProtocolCodec) -> (Arc<HubConnection>, Arc<HubConnection>) {
        let context = Arc::new(ConnectionContext::new(
            PipeOptions::default(),
            PipeOptions::default(),
        ));
        let server = HubConnection::over_transport(context.clone(), codec.clone(), targets());
        let peer = HubConnection::new(context.clone(), context.application(), codec, targets());
        (Arc::new(server), Arc::new(peer))
    }

    struct Echo;

    #[async_trait]
    impl HubDispatcher for Echo {
        fn targets(&self) -> Arc<TargetRegistry> {
            targets()
        }

        async fn dispatch(
            &self,
            connection: &Arc<HubConnection>,
            message: HubMessage,
        ) -> Result<(), ConnectionError> {
            match message {
                HubMessage::Invocation(inv) => {
                    if let Some(id) = inv.invocation_id {
                        let result = inv.arguments.into_iter().next().unwrap_or(Value::Null);
                        connection
                            .send_reply(CompletionMessage::with_result(id, result).into())
                            .await?;
                    }
                }
                HubMessage::StreamInvocation(inv) => {
                    let count = inv.arguments[0].as_i64().unwrap_or(0);
                    for i in 0..count {
                        connection
                            .send_reply(StreamItemMessage::new(&inv.invocation_id, json!(i)).into())
                            .await?;
                    }
                    connection
                        .send_reply(CompletionMessage::empty(&inv.invocation_id).into())
                        .await?;
                }
                _ => {}
            }
            Ok(())
        }
    }

    /// Drives the peer's read path until `handle` has its answer.
    async fn pump(peer: &HubConnection) {
        let message = peer.read_message().await.unwrap().unwrap();
        peer.dispatch(message).unwrap();
    }

    #[tokio::test]
    async fn test_echo_over_duplex_pipe() {
        for codec in [HubProtocolCodec::json(), HubProtocolCodec::cbor()] {
            let (server, peer) = connected_pair(codec);
            let run = tokio::spawn({
                let server = server.clone();
                async move { server.run(&Echo).await }
            });

            let mut handle = peer.invoke("Echo", vec![json!("hello")]).await.unwrap();
            pump(&peer).await;
            let completion = handle.completion().await.unwrap();
            assert_eq!(completion.result, Some(json!("hello")));
            assert_eq!(peer.correlator().pending_count(), 0);

            peer.close(None).await.unwrap();
            timeout(Duration::from_secs(1), run)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert!(server.is_finished());
        }
    }

    #[tokio::test]
    async fn test_stream_items_arrive_in_order() {
        let (server, peer) = connected_pair(HubProtocolCodec::cbor());
        tokio::spawn({
            let server = server.clone();
            async move { server.run(&Echo).await }
        });

        let mut handle = peer.stream("Count", vec![json!(3)]).await.unwrap();
        for _ in 0..4 {
            pump(&peer).await;
        }
        assert_eq!(
            handle.collect_stream().await.unwrap(),
            vec![json!(0), json!(1), json!(2)]
        );
    }

    #[tokio::test]
    async fn test_read_message_queues_extra_frames() {
        let (server, peer) = connected_pair(HubProtocolCodec::json());
        server.send_reply(HubMessage::Ping).await.unwrap();
        server
            .send_reply(CloseMessage::with_error("bye").into())
            .await
            .unwrap();

        assert_eq!(peer.read_message().await.unwrap(), Some(HubMessage::Ping));
        assert_eq!(
            peer.read_message().await.unwrap(),
            Some(CloseMessage::with_error("bye").into())
        );
    }

    #[tokio::test]
    async fn test_fire_and_forget_is_untracked() {
        let (server, peer) = connected_pair(HubProtocolCodec::json());
        let handle = peer
            .send_invocation("Echo", vec![json!(1)], false, false)
            .await
            .unwrap();
        assert!(handle.is_none());
        assert_eq!(peer.correlator().pending_count(), 0);

        let message = server.read_message().await.unwrap().unwrap();
        assert_eq!(
            message,
            InvocationMessage::non_blocking("Echo", vec![json!(1)]).into()
        );
    }

    #[tokio::test]
    async fn test_unknown_completion_closes_with_error() {
        let (server, peer) = connected_pair(HubProtocolCodec::json());
        let pending = peer.invoke("Echo", vec![json!(1)]).await.unwrap();

        // Reply to an id the peer never issued
        server
            .send_reply(CompletionMessage::empty("12345").into())
            .await
            .unwrap();

        let err = peer.run(&Echo).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ProtocolViolation));
        assert!(peer.is_finished());

        // Pending invocations resolve with ConnectionAborted
        let mut pending = pending;
        assert!(matches!(
            pending.completion().await,
            Err(ConnectionError::ConnectionAborted)
        ));

        // The server side receives the invocation, then Close with the error
        let first = server.read_message().await.unwrap().unwrap();
        assert!(matches!(first, HubMessage::Invocation(_)));
        match server.read_message().await.unwrap() {
            Some(HubMessage::Close(close)) => {
                assert!(close.error.unwrap().contains("unknown invocation id"))
            }
            other => panic!("expected close, got {:?}", other),
        }

        // After teardown nothing can be sent or dispatched
        assert!(matches!(
            peer.invoke("Echo", vec![]).await,
            Err(ConnectionError::TransportClosed)
        ));
        assert!(matches!(
            peer.dispatch(HubMessage::Ping),
            Err(ConnectionError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_binding_error_is_fatal() {
        let (server, peer) = connected_pair(HubProtocolCodec::json());
        peer.send("Count", vec![json!("three")]).await.unwrap();

        let err = server.run(&Echo).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::BindingError));
    }

    #[tokio::test]
    async fn test_partial_frame_at_end_is_violation() {
        let (server, peer) = connected_pair(HubProtocolCodec::json());
        let pipe = peer.context().application();
        pipe.output.write(b"[6").await.unwrap();
        pipe.output.complete();

        let err = server.read_message().await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ProtocolViolation));
    }

    #[tokio::test]
    async fn test_chunked_frame_larger_than_pause_threshold() {
        for codec in [HubProtocolCodec::json(), HubProtocolCodec::cbor()] {
            let (server, peer) = connected_pair(codec.clone());
            let payload = "x".repeat(100 * 1024);
            let framed = codec
                .write_message(&InvocationMessage::new("1", "Echo", vec![json!(payload)]).into())
                .unwrap();
            assert!(framed.len() > PipeOptions::default().pause_writer_threshold);

            let pipe = peer.context().application();
            let writer = tokio::spawn(async move {
                for chunk in framed.chunks(8 * 1024) {
                    pipe.output.write(chunk).await.unwrap();
                }
            });

            let message = timeout(Duration::from_secs(2), server.read_message())
                .await
                .unwrap()
                .unwrap();
            match message {
                Some(HubMessage::Invocation(inv)) => {
                    assert_eq!(inv.arguments, vec![json!(payload)])
                }
                other => panic!("expected invocation, got {:?}", other),
            }
            timeout(Duration::from_secs(1), writer)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_oversized_incomplete_frame_is_violation() {
        let context = Arc::new(ConnectionContext::new(
            PipeOptions::default(),
            PipeOptions::default(),
        ));
        let server = HubConnection::over_transport(
            context.clone(),
            HubProtocolCodec::json(),
            targets(),
        )
        .with_max_message_size(1024);

        let framed = HubProtocolCodec::json()
            .write_message(
                &InvocationMessage::new("1", "Echo", vec![json!("y".repeat(4096))]).into(),
            )
            .unwrap();
        let pipe = context.application();
        pipe.output.write(&framed[..2048]).await.unwrap();

        let err = timeout(Duration::from_secs(1), server.read_message())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ProtocolViolation));
        assert!(err.to_string().contains("limit of 1024 bytes"));
    }

    #[tokio::test]
    async fn test_cancel_stream_sends_cancel() {
        let (server, peer) = connected_pair(HubProtocolCodec::json());
        let handle = peer.stream("Count", vec![json!(100)]).await.unwrap();
        let id = handle.id().to_string();

        assert!(peer.cancel_stream(&id).await.unwrap());
        assert!(!peer.cancel_stream(&id).await.unwrap());

        assert!(matches!(
            server.read_message().await.unwrap(),
            Some(HubMessage::StreamInvocation(_))
        ));
        assert_eq!(
            server.read_message().await.unwrap(),
            Some(CancelInvocationMessage::new(&id).into())
        );
    }

    #[tokio::test]
    async fn test_send_reply_rejects_invocations() {
        let (_server, peer) = connected_pair(HubProtocolCodec::json());
        let err = peer
            .send_reply(InvocationMessage::new("1", "Echo", vec![]).into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ProtocolViolation));
    }

    #[tokio::test]
    async fn test_abort_cancels_reads() {
        let (server, _peer) = connected_pair(HubProtocolCodec::json());
        let read = tokio::spawn({
            let server = server.clone();
            async move { server.read_message().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        server.abort();
        let result = timeout(Duration::from_secs(1), read).await.unwrap().unwrap();
        assert!(result.is_err());
        assert!(server.context().is_disconnected());
    }
}
