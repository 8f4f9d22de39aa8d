//! Pumps bytes between a socket and a duplex pipe.

use crate::error::ConnectionError;
use crate::pipe::DuplexPipe;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Copies socket bytes into `pipe.output` and `pipe.input` bytes into the
/// socket until both directions end.
///
/// The inbound direction ends on EOF or once the pipe's reader completes;
/// the outbound direction ends when the pipe's writer completes, after which
/// the socket's write half is shut down. Either pipe end is completed when
/// its direction stops, so the hub endpoint always observes the end.
pub async fn bridge<S>(
    stream: S,
    pipe: DuplexPipe,
    read_buffer_size: usize,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let inbound = async {
        let mut buf = vec![0u8; read_buffer_size];
        let result: Result<(), ConnectionError> = async {
            loop {
                let n = tokio::select! {
                    n = reader.read(&mut buf) => n?,
                    _ = pipe.output.closed() => return Ok(()),
                };
                if n == 0 {
                    tracing::debug!("Socket reached EOF");
                    return Ok(());
                }
                pipe.output.write(&buf[..n]).await?;
            }
        }
        .await;
        pipe.output.complete();
        result
    };

    let outbound = async {
        let result: Result<(), ConnectionError> = async {
            loop {
                let read = pipe.input.read().await?;
                let len = read.buffer.len();
                if len > 0 {
                    writer.write_all(&read.buffer).await?;
                }
                pipe.input.advance_to(len, len)?;
                if read.is_completed {
                    writer.shutdown().await?;
                    return Ok(());
                }
            }
        }
        .await;
        pipe.input.complete();
        result
    };

    let (inbound, outbound) = tokio::join!(inbound, outbound);
    inbound.and(outbound)
}
