use std::io;

use n0_future::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, trace};

pub use self::prebuffered::Prebuffered;

mod prebuffered;

const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// Bytes copied in each direction by [`relay`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Copies bytes between `client` and `upstream` until either side is done.
///
/// Each direction runs in its own task. When one direction ends, by EOF or by
/// an error, the write side it fed is shut down and the other direction is
/// cancelled, so both streams are closed exactly once.
pub(crate) async fn relay<C, U>(client: C, upstream: U) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let start = Instant::now();
    let close = CancellationToken::new();
    let (client_recv, client_send) = tokio::io::split(client);
    let (upstream_recv, upstream_send) = tokio::io::split(upstream);

    let up = tokio::spawn(
        pump(client_recv, upstream_send, close.clone(), "client-to-upstream")
            .in_current_span(),
    );
    let down = tokio::spawn(
        pump(upstream_recv, client_send, close.clone(), "upstream-to-client")
            .in_current_span(),
    );
    let (up, down) = tokio::join!(up, down);
    let stats = RelayStats {
        client_to_upstream: up.unwrap_or_default(),
        upstream_to_client: down.unwrap_or_default(),
    };
    debug!(
        up = stats.client_to_upstream,
        down = stats.upstream_to_client,
        elapsed = ?start.elapsed(),
        "relay finished"
    );
    stats
}

/// One direction of [`relay`]. Returns the number of bytes written.
async fn pump<R, W>(
    mut recv: ReadHalf<R>,
    mut send: WriteHalf<W>,
    close: CancellationToken,
    direction: &'static str,
) -> u64
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut copied = 0u64;
    let res = close
        .run_until_cancelled(copy_counting(&mut recv, &mut send, &mut copied))
        .await;
    match res {
        Some(Ok(())) => trace!(direction, copied, "reached EOF"),
        Some(Err(err)) => trace!(direction, copied, "copy failed: {err:#}"),
        None => trace!(direction, copied, "cancelled"),
    }
    send.shutdown().await.ok();
    close.cancel();
    copied
}

async fn copy_counting(
    recv: &mut (impl AsyncRead + Unpin),
    send: &mut (impl AsyncWrite + Unpin),
    copied: &mut u64,
) -> io::Result<()> {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = recv.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        send.write_all(&buf[..n]).await?;
        send.flush().await?;
        *copied += n as u64;
    }
}
