//! Bridge between a live session and a line-oriented terminal

use std::future::Future;

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use tunnel_session::TunnelSessionController;

/// Forward input lines to the host and host messages to `output`
///
/// Returns once input ends, `interrupt` fires, or the session closes on its
/// own. The session is closed on the way out.
pub async fn run<R, W>(
    session: &TunnelSessionController,
    input: R,
    mut output: W,
    interrupt: impl Future<Output = ()>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut incoming = session.incoming();
    let mut lines = input.lines();
    let closed = session.wait_closed();
    tokio::pin!(closed, interrupt);

    loop {
        tokio::select! {
            _ = &mut interrupt => break,
            _ = &mut closed => {
                debug!("Session closed by remote side");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    let mut data = line.into_bytes();
                    data.push(b'\n');
                    session.send(Bytes::from(data)).await?;
                }
                None => {
                    debug!("Input closed");
                    break;
                }
            },
            message = incoming.recv() => match message {
                Ok(data) => {
                    output.write_all(&data).await?;
                    output.flush().await?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Output fell behind, dropped host messages");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.close_session(None).await;
    match session.close_error() {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
