//! Negotiation over a duplex pipe.

use crate::error::ConnectionError;
use crate::pipe::{PipeReader, PipeWriter};
use hublink_protocol::{HubProtocolCodec, NegotiationMessage};

/// Largest negotiation frame accepted before giving up (4 KiB).
pub const MAX_NEGOTIATION_SIZE: usize = 4 * 1024;

/// Announces the codec's protocol to the peer.
pub async fn send_negotiation(
    output: &PipeWriter,
    codec: &HubProtocolCodec,
) -> Result<(), ConnectionError> {
    let message = NegotiationMessage::new(codec.name(), codec.version());
    let framed = message.write()?;
    tracing::debug!("Sending negotiation: protocol={}", message.protocol);
    output.write(&framed).await?;
    Ok(())
}

/// Reads the negotiation frame. Bytes after it stay in the pipe.
pub async fn read_negotiation(input: &PipeReader) -> Result<NegotiationMessage, ConnectionError> {
    loop {
        let result = input.read().await?;
        let len = result.buffer.len();

        match NegotiationMessage::try_parse(&result.buffer) {
            Ok(Some((message, consumed))) => {
                input.advance_to(consumed, consumed)?;
                return Ok(message);
            }
            Ok(None) => {
                input.advance_to(0, len)?;
                if result.is_completed {
                    return Err(ConnectionError::TransportClosed);
                }
                if len > MAX_NEGOTIATION_SIZE {
                    return Err(ConnectionError::Negotiation(format!(
                        "no terminator within {} bytes",
                        MAX_NEGOTIATION_SIZE
                    )));
                }
            }
            Err(e) => {
                input.advance_to(0, len)?;
                return Err(e.into());
            }
        }
    }
}

/// Reads the negotiation and resolves a codec among `allowed` protocols.
pub async fn accept_negotiation(
    input: &PipeReader,
    allowed: &[String],
) -> Result<HubProtocolCodec, ConnectionError> {
    let message = read_negotiation(input).await?;
    if !allowed.iter().any(|p| p == &message.protocol) {
        return Err(ConnectionError::UnsupportedProtocol(message.protocol));
    }

    let codec = HubProtocolCodec::for_protocol(&message.protocol)
        .ok_or_else(|| ConnectionError::UnsupportedProtocol(message.protocol.clone()))?;
    if message.version > codec.version() {
        return Err(ConnectionError::Negotiation(format!(
            "protocol {} version {} not supported (max {})",
            message.protocol,
            message.version,
            codec.version()
        )));
    }
    Ok(codec)
}
