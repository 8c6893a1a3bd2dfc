//! Bidirectional byte relay between a client and its upstream
//!
//! Each direction copies until its source reaches end-of-stream, then
//! half-closes its destination so the opposite direction can keep draining.
//! The relay completes once both directions have ended. An I/O error in
//! either direction ends both immediately.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default per-direction copy buffer
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    pub buffer_size: usize,
    /// Close the relay after this long without bytes in either direction
    pub idle_timeout: Option<Duration>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
        }
    }
}

/// How the relay ended
#[derive(Debug)]
pub enum RelayEnd {
    /// Both directions reached end-of-stream
    Completed,
    /// A read or write failed on either connection
    Failed(io::Error),
    /// No bytes moved for the idle timeout
    Idle,
    /// Cancelled from outside
    Cancelled,
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    pub end: RelayEnd,
}

/// Time of the last byte moved in either direction
struct Activity {
    base: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.base.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.base + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Relay between `client` and `upstream` until both sides are done
///
/// Both connections are owned by the relay and dropped before it returns,
/// whatever the outcome.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    options: RelayOptions,
    cancel: &CancellationToken,
) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Send,
    U: AsyncRead + AsyncWrite + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = AtomicU64::new(0);
    let upstream_to_client = AtomicU64::new(0);
    let activity = Activity::new();
    let buffer_size = options.buffer_size.max(1);

    let forward = copy_half(
        &mut client_read,
        &mut upstream_write,
        buffer_size,
        &client_to_upstream,
        &activity,
    );
    let backward = copy_half(
        &mut upstream_read,
        &mut client_write,
        buffer_size,
        &upstream_to_client,
        &activity,
    );

    let end = tokio::select! {
        result = async { tokio::try_join!(forward, backward) } => match result {
            Ok(_) => RelayEnd::Completed,
            Err(e) => RelayEnd::Failed(e),
        },
        _ = idle_expired(&activity, options.idle_timeout) => RelayEnd::Idle,
        _ = cancel.cancelled() => RelayEnd::Cancelled,
    };

    RelayOutcome {
        client_to_upstream: client_to_upstream.load(Ordering::Relaxed),
        upstream_to_client: upstream_to_client.load(Ordering::Relaxed),
        end,
    }
}

/// Copy one direction, counting only bytes the destination accepted
async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    counter: &AtomicU64,
    activity: &Activity,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        activity.touch();

        // Every partial write counts as activity and as accepted bytes
        let mut written = 0;
        while written < n {
            let accepted = writer.write(&buf[written..n]).await?;
            if accepted == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            written += accepted;
            counter.fetch_add(accepted as u64, Ordering::Relaxed);
            activity.touch();
        }
        writer.flush().await?;
    }
}

async fn idle_expired(activity: &Activity, idle_timeout: Option<Duration>) {
    let Some(idle_timeout) = idle_timeout else {
        return std::future::pending().await;
    };

    loop {
        // A deadline past the clock's range never expires
        let Some(deadline) = activity.last().checked_add(idle_timeout) else {
            return std::future::pending().await;
        };
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}
