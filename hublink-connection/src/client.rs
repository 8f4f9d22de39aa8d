//! High-level client API.

use crate::config::ConnectionOptions;
use crate::connection::HubConnection;
use crate::context::ConnectionContext;
use crate::correlator::{completion_result, DispatchOutcome, InvocationHandle};
use crate::error::ConnectionError;
use crate::handshake::send_negotiation;
use crate::pipe::DuplexPipe;
use crate::socket;
use hublink_protocol::{CompletionMessage, HubMessage, HubProtocolCodec};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Client that issues one call at a time and reads its replies inline.
///
/// While a call is outstanding, any message other than a reply to that call
/// (or a ping) is a protocol violation and ends the connection.
pub struct HubClient {
    connection: Arc<HubConnection>,
    /// Held for the duration of a call.
    calls: Mutex<()>,
    request_timeout: Duration,
    /// Socket pump of a TCP client, awaited on close.
    bridge: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HubClient {
    /// Connects over TCP and negotiates `options.protocol`.
    pub async fn connect(
        addr: SocketAddr,
        options: ConnectionOptions,
    ) -> Result<Self, ConnectionError> {
        let codec = HubProtocolCodec::for_protocol(&options.protocol)
            .ok_or_else(|| ConnectionError::UnsupportedProtocol(options.protocol.clone()))?;

        tracing::debug!("Connecting to {}...", addr);
        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                tracing::debug!("Connection timeout");
                ConnectionError::Timeout
            })??;
        stream.set_nodelay(true).ok();

        let context =
            Arc::new(ConnectionContext::new(options.pipe, options.pipe).with_remote_addr(addr));
        let application = context.application();
        let read_buffer_size = options.read_buffer_size;
        let bridge = tokio::spawn(async move {
            if let Err(e) = socket::bridge(stream, application, read_buffer_size).await {
                tracing::debug!("Socket bridge ended: {}", e);
            }
        });

        let pipe = context.transport();
        match Self::start(context.clone(), pipe, codec, options).await {
            Ok(client) => {
                *client.bridge.lock() = Some(bridge);
                Ok(client)
            }
            Err(e) => {
                context.abort();
                Err(e)
            }
        }
    }

    /// Starts a client on an existing pipe and sends the negotiation.
    pub async fn start(
        context: Arc<ConnectionContext>,
        pipe: DuplexPipe,
        codec: HubProtocolCodec,
        options: ConnectionOptions,
    ) -> Result<Self, ConnectionError> {
        send_negotiation(&pipe.output, &codec).await?;
        context.mark_negotiated(codec.name())?;
        tracing::debug!(
            "Negotiated {} on connection {}",
            codec.name(),
            context.connection_id()
        );

        let connection = HubConnection::new(context, pipe, codec, options.targets)
            .with_max_message_size(options.max_message_size);
        Ok(Self {
            connection: Arc::new(connection),
            calls: Mutex::new(()),
            request_timeout: options.request_timeout,
            bridge: parking_lot::Mutex::new(None),
        })
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> &Arc<HubConnection> {
        &self.connection
    }

    /// Invokes `target` and waits for its result.
    pub async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Value, ConnectionError> {
        let _call = self.calls.lock().await;
        let mut handle = self.connection.invoke(target, arguments).await?;
        let invocation_id = handle.id().to_string();

        match tokio::time::timeout(self.request_timeout, self.await_completion(&mut handle)).await {
            Ok(completion) => completion_result(completion?),
            Err(_) => Err(self.timed_out(&invocation_id)),
        }
    }

    /// Invokes a streaming `target` and collects every item.
    pub async fn stream(
        &self,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<Vec<Value>, ConnectionError> {
        let _call = self.calls.lock().await;
        let mut handle = self.connection.stream(target, arguments).await?;
        let invocation_id = handle.id().to_string();

        match tokio::time::timeout(self.request_timeout, self.collect_items(&mut handle)).await {
            Ok(items) => items,
            Err(_) => Err(self.timed_out(&invocation_id)),
        }
    }

    /// Sends a fire-and-forget invocation.
    pub async fn send(&self, target: &str, arguments: Vec<Value>) -> Result<(), ConnectionError> {
        self.connection.send(target, arguments).await
    }

    /// Sends a ping. Pings are never answered.
    pub async fn ping(&self) -> Result<(), ConnectionError> {
        self.connection.send_reply(HubMessage::Ping).await
    }

    /// Sends `Close` and tears the connection down.
    ///
    /// A TCP client returns once every written frame reached the socket, or
    /// after the request timeout, when the socket is dropped instead.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let result = self.connection.close(None).await;

        let bridge = self.bridge.lock().take();
        if let Some(mut bridge) = bridge {
            if tokio::time::timeout(self.request_timeout, &mut bridge)
                .await
                .is_err()
            {
                tracing::debug!("Socket did not drain within {:?}", self.request_timeout);
                self.connection.abort();
                bridge.abort();
            }
        }
        result
    }

    async fn await_completion(
        &self,
        handle: &mut InvocationHandle,
    ) -> Result<CompletionMessage, ConnectionError> {
        match self.next_reply(handle).await? {
            HubMessage::Completion(completion) => Ok(completion),
            other => Err(unexpected(&other, handle)),
        }
    }

    async fn collect_items(&self, handle: &mut InvocationHandle) -> Result<Vec<Value>, ConnectionError> {
        let mut items = Vec::new();
        loop {
            match self.next_reply(handle).await? {
                HubMessage::StreamItem(item) => items.push(item.item),
                HubMessage::Completion(completion) => {
                    completion_result(completion)?;
                    return Ok(items);
                }
                other => return Err(unexpected(&other, handle)),
            }
        }
    }

    /// Forgets a timed-out invocation so its late replies are dropped.
    fn timed_out(&self, invocation_id: &str) -> ConnectionError {
        tracing::debug!("Invocation {} timed out", invocation_id);
        self.connection.correlator().cancel(invocation_id);
        ConnectionError::Timeout
    }

    /// Reads until `handle` has a delivery.
    async fn next_reply(&self, handle: &mut InvocationHandle) -> Result<HubMessage, ConnectionError> {
        loop {
            if let Some(delivery) = handle.try_next() {
                return delivery;
            }

            let message = match self.connection.read_message().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    self.connection.finish();
                    return Err(ConnectionError::TransportClosed);
                }
                Err(e) => return Err(self.connection.terminate(e).await),
            };

            match message {
                HubMessage::Ping => continue,
                HubMessage::Close(close) => {
                    self.connection.finish();
                    return Err(ConnectionError::Closed { error: close.error });
                }
                message if message.is_reply() => {
                    let reply_id = message.invocation_id().unwrap_or_default().to_string();
                    match self.connection.dispatch(message) {
                        // Late reply to a call that timed out
                        Ok(DispatchOutcome::Consumed) => {}
                        Ok(_) if reply_id == handle.id() => {}
                        Ok(_) => {
                            let error = ConnectionError::violation(format!(
                                "reply for invocation {} while waiting for invocation {}",
                                reply_id,
                                handle.id()
                            ));
                            return Err(self.connection.terminate(error).await);
                        }
                        Err(e) => return Err(self.connection.terminate(e).await),
                    }
                }
                other => {
                    let error = ConnectionError::violation(format!(
                        "received {} while waiting for invocation {}",
                        other.message_type(),
                        handle.id()
                    ));
                    return Err(self.connection.terminate(error).await);
                }
            }
        }
    }
}

fn unexpected(message: &HubMessage, handle: &InvocationHandle) -> ConnectionError {
    ConnectionError::violation(format!(
        "unexpected {} for invocation {}",
        message.message_type(),
        handle.id()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::PipeOptions;
    use hublink_protocol::{
        ArgumentShape, ErrorKind, InvocationMessage, NegotiationMessage, Parameters,
        StreamItemMessage, TargetRegistry,
    };
    use serde_json::json;

    /// A client on the application pipe and the raw transport side it talks to.
    async fn client_pair(codec: HubProtocolCodec) -> (HubClient, Arc<HubConnection>) {
        let context = Arc::new(ConnectionContext::new(
            PipeOptions::default(),
            PipeOptions::default(),
        ));
        let targets = Arc::new(TargetRegistry::new().with_target(
            "Add",
            Parameters::Fixed(vec![ArgumentShape::Integer, ArgumentShape::Integer]),
            ArgumentShape::Integer,
        ));
        let options = ConnectionOptions::new()
            .with_targets(targets.clone())
            .with_request_timeout(Duration::from_millis(200));

        let client = HubClient::start(context.clone(), context.application(), codec.clone(), options)
            .await
            .unwrap();

        let transport = context.transport();
        let negotiation = crate::handshake::read_negotiation(&transport.input)
            .await
            .unwrap();
        assert_eq!(negotiation, NegotiationMessage::new(codec.name(), 1));

        let server = HubConnection::new(context, transport, codec, targets);
        (client, Arc::new(server))
    }

    async fn expect_invocation(server: &HubConnection) -> InvocationMessage {
        match server.read_message().await.unwrap() {
            Some(HubMessage::Invocation(inv)) => inv,
            other => panic!("expected invocation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invoke() {
        let (client, server) = client_pair(HubProtocolCodec::json()).await;

        let call = tokio::spawn(async move {
            let result = client.invoke("Add", vec![json!(1), json!(2)]).await;
            (client, result)
        });

        let inv = expect_invocation(&server).await;
        assert_eq!(inv.target, "Add");
        let id = inv.invocation_id.unwrap();

        server.send_reply(HubMessage::Ping).await.unwrap();
        server
            .send_reply(CompletionMessage::with_result(&id, json!(3.0)).into())
            .await
            .unwrap();

        let (_client, result) = call.await.unwrap();
        // Materialized as an integer by the declared return shape
        assert_eq!(result.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_invoke_error_completion() {
        let (client, server) = client_pair(HubProtocolCodec::cbor()).await;

        let call = tokio::spawn(async move { client.invoke("Add", vec![json!(1), json!(2)]).await });
        let id = expect_invocation(&server).await.invocation_id.unwrap();
        server
            .send_reply(CompletionMessage::with_error(&id, "overflow").into())
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::Invocation { message, .. } if message == "overflow"));
    }

    #[tokio::test]
    async fn test_stream() {
        let (client, server) = client_pair(HubProtocolCodec::json()).await;

        let call = tokio::spawn(async move { client.stream("Count", vec![json!(2)]).await });
        let id = match server.read_message().await.unwrap() {
            Some(HubMessage::StreamInvocation(inv)) => inv.invocation_id,
            other => panic!("expected stream invocation, got {:?}", other),
        };

        for i in 0..2 {
            server
                .send_reply(StreamItemMessage::new(&id, json!(i)).into())
                .await
                .unwrap();
        }
        server
            .send_reply(CompletionMessage::empty(&id).into())
            .await
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), vec![json!(0), json!(1)]);
    }

    #[tokio::test]
    async fn test_reply_for_other_id_is_violation() {
        let (client, server) = client_pair(HubProtocolCodec::json()).await;

        let call = tokio::spawn(async move { client.invoke("Add", vec![json!(1), json!(2)]).await });
        expect_invocation(&server).await;
        server
            .send_reply(CompletionMessage::empty("not-mine").into())
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ProtocolViolation));

        // The client reports the violation before tearing down
        match server.read_message().await.unwrap() {
            Some(HubMessage::Close(close)) => assert!(close.error.is_some()),
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsolicited_invocation_is_violation() {
        let (client, server) = client_pair(HubProtocolCodec::json()).await;

        let call = tokio::spawn(async move { client.invoke("Add", vec![json!(1), json!(2)]).await });
        expect_invocation(&server).await;
        server.send("Add", vec![json!(1), json!(1)]).await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("while waiting for invocation"));
    }

    #[tokio::test]
    async fn test_close_from_server() {
        let (client, server) = client_pair(HubProtocolCodec::json()).await;

        let call = tokio::spawn(async move { client.invoke("Add", vec![json!(1), json!(2)]).await });
        expect_invocation(&server).await;
        server.close(Some("shutting down".into())).await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(
            matches!(err, ConnectionError::Closed { error: Some(e) } if e == "shutting down")
        );
    }

    #[tokio::test]
    async fn test_timeout_forgets_invocation() {
        let (client, server) = client_pair(HubProtocolCodec::json()).await;

        let err = client
            .invoke("Add", vec![json!(1), json!(2)])
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout));
        assert_eq!(client.connection().correlator().pending_count(), 0);

        // A late completion is dropped rather than treated as unknown
        let id = expect_invocation(&server).await.invocation_id.unwrap();
        server
            .send_reply(CompletionMessage::empty(&id).into())
            .await
            .unwrap();

        let call = tokio::spawn(async move { client.invoke("Add", vec![json!(2), json!(2)]).await });
        let id = expect_invocation(&server).await.invocation_id.unwrap();
        server
            .send_reply(CompletionMessage::with_result(&id, json!(4)).into())
            .await
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!(4));
    }

    #[tokio::test]
    async fn test_close_flushes_socket() {
        use std::io::Read;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).unwrap();
            received
        });

        let client = HubClient::connect(addr, ConnectionOptions::new())
            .await
            .unwrap();
        client.send("Echo", vec![json!("fire")]).await.unwrap();
        client.close().await.unwrap();

        // Joined without yielding to the runtime: the bytes are already out
        let received = String::from_utf8(peer.join().unwrap()).unwrap();
        assert!(received.contains("\"protocol\":\"json\""));
        assert!(received.contains("\"fire\""));
        assert_eq!(received.matches('\u{1e}').count(), 3);
    }
}
