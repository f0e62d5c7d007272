//! Bidirectional frame relay
//!
//! Once a session is ready, two tasks copy frames between the client and its
//! origin, each writing the frame's wire bytes unchanged. Either task ending
//! cancels a shared token that the other observes between frames, so neither
//! side is abandoned halfway through writing a frame.
//!
//! Along the way both directions keep just enough bookkeeping to decide
//! whether the origin connection is back at a clean ReadyForQuery boundary
//! when the session ends, and can therefore be pooled again.

use crate::error::{ProxyError, Result};
use crate::origin::{OriginConnection, OriginInfo};
use crate::protocol::message::tags;
use crate::protocol::{parser, Frame, FrameDecoder, TransactionStatus};
use crate::stats::{self, Direction};
use futures_util::StreamExt;
use log::{debug, warn};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Relay timeouts and limits
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// End the session when neither side has sent anything for this long
    pub idle_timeout: Option<Duration>,

    /// Bound on writing one frame
    pub write_timeout: Duration,

    /// Largest frame accepted from the origin
    pub max_frame_len: usize,
}

/// Whether an origin connection can be pooled again after a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseVerdict {
    /// Back at an idle ReadyForQuery boundary
    Reuse,

    /// Must be closed, with the reason
    Evict(&'static str),
}

impl fmt::Display for ReleaseVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseVerdict::Reuse => write!(f, "reuse"),
            ReleaseVerdict::Evict(reason) => write!(f, "evict ({})", reason),
        }
    }
}

/// What the client to origin direction saw
#[derive(Debug, Default)]
struct ClientSide {
    /// Frames forwarded
    frames: u64,

    /// Query, Sync and FunctionCall frames forwarded; each earns one ReadyForQuery
    sync_points: u64,

    /// Extended-protocol frames forwarded after the last Sync
    dirty_tail: bool,

    /// The client sent Terminate
    terminated: bool,

    /// Writing to the origin failed
    origin_failed: bool,

    /// Error that ended the direction
    error: Option<ProxyError>,
}

impl ClientSide {
    fn track(&mut self, frame: &Frame) {
        match frame.tag() {
            Some(tags::QUERY) | Some(tags::SYNC) | Some(tags::FUNCTION_CALL) => {
                self.sync_points += 1;
                self.dirty_tail = false;
            }
            // Parse, Bind, Describe, Execute, Close
            Some(b'P') | Some(b'B') | Some(b'D') | Some(b'E') | Some(b'C') => {
                self.dirty_tail = true;
            }
            _ => {}
        }
    }
}

/// What the origin to client direction saw
#[derive(Debug, Default)]
struct OriginSide {
    /// Frames forwarded
    frames: u64,

    /// ReadyForQuery frames received
    ready: u64,

    /// Status of the last ReadyForQuery
    last_status: Option<TransactionStatus>,

    /// Reading from the origin failed or the origin closed
    origin_failed: bool,

    /// Error that ended the direction
    error: Option<ProxyError>,
}

impl OriginSide {
    fn track(&mut self, frame: &Frame) -> Result<()> {
        if frame.is(tags::READY_FOR_QUERY) {
            self.ready += 1;
            self.last_status = Some(parser::parse_ready_for_query(frame)?);
        }
        Ok(())
    }
}

/// Result of a finished relay
#[derive(Debug)]
pub struct RelayReport {
    /// Whether the origin can be pooled again
    pub verdict: ReleaseVerdict,

    /// The origin connection, unless a relay task was lost
    pub origin: Option<OriginConnection>,

    /// Client write half, for the final shutdown
    pub client_write: Option<OwnedWriteHalf>,

    /// The client ended the session with Terminate
    pub client_terminated: bool,

    /// Frames forwarded client to origin
    pub client_frames: u64,

    /// Frames forwarded origin to client
    pub origin_frames: u64,
}

/// Time of last traffic in either direction, as a change counter
#[derive(Default)]
struct Activity(AtomicU64);

impl Activity {
    fn touch(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn seen(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Aborts the direction tasks when the owning relay is dropped
struct AbortOnDrop([AbortHandle; 2]);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Relay frames until either side stops, then judge the origin
pub async fn relay(
    session: Uuid,
    client_frames: FramedRead<OwnedReadHalf, FrameDecoder>,
    client_write: OwnedWriteHalf,
    origin: OriginConnection,
    settings: RelaySettings,
) -> RelayReport {
    let (origin_stream, info) = origin.into_parts();
    let (origin_read, origin_write) = origin_stream.into_split();
    let origin_frames = FramedRead::new(
        origin_read,
        FrameDecoder::tagged().with_max_frame_len(settings.max_frame_len),
    );

    let token = CancellationToken::new();
    let activity = Arc::new(Activity::default());

    let upstream = tokio::spawn(client_to_origin(
        session,
        client_frames,
        origin_write,
        token.clone(),
        Arc::clone(&activity),
        settings,
    ));
    let downstream = tokio::spawn(origin_to_client(
        session,
        origin_frames,
        client_write,
        token.clone(),
        activity,
        settings,
    ));
    // Dropping the relay future (an aborted session) stops both directions
    let _tasks = AbortOnDrop([upstream.abort_handle(), downstream.abort_handle()]);

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    match (upstream, downstream) {
        (Ok((_, origin_write, client)), Ok((origin_frames, client_write, origin))) => {
            finish(session, origin_frames, origin_write, client_write, info, client, origin)
        }
        (upstream, downstream) => {
            warn!("[{}] Relay task failed, evicting origin", session);
            RelayReport {
                verdict: ReleaseVerdict::Evict("relay task failed"),
                origin: None,
                client_write: downstream.ok().map(|(_, client_write, _)| client_write),
                client_terminated: upstream.map(|(_, _, c)| c.terminated).unwrap_or(false),
                client_frames: 0,
                origin_frames: 0,
            }
        }
    }
}

fn finish(
    session: Uuid,
    origin_frames: FramedRead<OwnedReadHalf, FrameDecoder>,
    origin_write: OwnedWriteHalf,
    client_write: OwnedWriteHalf,
    info: OriginInfo,
    client: ClientSide,
    origin: OriginSide,
) -> RelayReport {
    if let Some(e) = &client.error {
        if e.is_disconnect() {
            debug!("[{}] Client disconnected: {}", session, e);
        } else {
            warn!("[{}] Client stream error: {}", session, e);
        }
    }
    if let Some(e) = &origin.error {
        warn!("[{}] Origin stream error: {}", session, e);
    }

    let mut verdict = judge(&client, &origin);
    if verdict == ReleaseVerdict::Reuse && !origin_frames.read_buffer().is_empty() {
        verdict = ReleaseVerdict::Evict("undelivered origin bytes");
    }

    let origin_read = origin_frames.into_inner();
    let origin_conn = match origin_read.reunite(origin_write) {
        Ok(stream) => Some(OriginConnection::from_parts(stream, info)),
        Err(_) => {
            verdict = ReleaseVerdict::Evict("origin stream halves mismatched");
            None
        }
    };

    debug!(
        "[{}] Relay finished: {} frames up, {} frames down, {}",
        session, client.frames, origin.frames, verdict
    );

    RelayReport {
        verdict,
        origin: origin_conn,
        client_write: Some(client_write),
        client_terminated: client.terminated,
        client_frames: client.frames,
        origin_frames: origin.frames,
    }
}

fn judge(client: &ClientSide, origin: &OriginSide) -> ReleaseVerdict {
    if client.origin_failed || origin.origin_failed {
        return ReleaseVerdict::Evict("origin stream failed");
    }
    if client.dirty_tail {
        return ReleaseVerdict::Evict("extended query without Sync");
    }
    if client.sync_points != origin.ready {
        return ReleaseVerdict::Evict("request in flight");
    }
    match origin.last_status {
        None | Some(TransactionStatus::Idle) => ReleaseVerdict::Reuse,
        Some(_) => ReleaseVerdict::Evict("transaction left open"),
    }
}

async fn read_next<R>(
    frames: &mut FramedRead<R, FrameDecoder>,
    idle_timeout: Option<Duration>,
    activity: &Activity,
) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let limit = match idle_timeout {
        Some(limit) => limit,
        None => return frames.next().await.transpose(),
    };

    loop {
        let seen = activity.seen();
        match timeout(limit, frames.next()).await {
            Ok(next) => return next.transpose(),
            // The other direction was busy; keep waiting
            Err(_) if activity.seen() != seen => continue,
            Err(_) => {
                return Err(ProxyError::Timeout(format!(
                    "session idle for {:?}",
                    limit
                )))
            }
        }
    }
}

async fn write_frame<W>(writer: &mut W, frame: &Frame, limit: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    timeout(limit, writer.write_all(frame.raw()))
        .await
        .map_err(|_| ProxyError::Timeout(format!("writing {} took over {:?}", frame, limit)))??;
    Ok(())
}

async fn client_to_origin(
    session: Uuid,
    mut frames: FramedRead<OwnedReadHalf, FrameDecoder>,
    mut origin: OwnedWriteHalf,
    token: CancellationToken,
    activity: Arc<Activity>,
    settings: RelaySettings,
) -> (FramedRead<OwnedReadHalf, FrameDecoder>, OwnedWriteHalf, ClientSide) {
    let mut side = ClientSide::default();

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = read_next(&mut frames, settings.idle_timeout, &activity) => next,
        };

        match next {
            Ok(Some(frame)) => {
                activity.touch();
                if frame.is_terminate() {
                    debug!("[{}] Client sent Terminate", session);
                    side.terminated = true;
                    break;
                }
                side.track(&frame);
                if let Err(e) = write_frame(&mut origin, &frame, settings.write_timeout).await {
                    side.origin_failed = true;
                    side.error = Some(e);
                    break;
                }
                side.frames += 1;
                stats::frame_relayed(Direction::ClientToOrigin);
            }
            Ok(None) => {
                debug!("[{}] Client closed its stream", session);
                break;
            }
            Err(e) => {
                side.error = Some(e);
                break;
            }
        }
    }

    token.cancel();
    (frames, origin, side)
}

async fn origin_to_client(
    session: Uuid,
    mut frames: FramedRead<OwnedReadHalf, FrameDecoder>,
    mut client: OwnedWriteHalf,
    token: CancellationToken,
    activity: Arc<Activity>,
    settings: RelaySettings,
) -> (FramedRead<OwnedReadHalf, FrameDecoder>, OwnedWriteHalf, OriginSide) {
    let mut side = OriginSide::default();

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = read_next(&mut frames, settings.idle_timeout, &activity) => next,
        };

        match next {
            Ok(Some(frame)) => {
                activity.touch();
                if let Err(e) = side.track(&frame) {
                    side.origin_failed = true;
                    side.error = Some(e);
                    break;
                }
                if let Err(e) = write_frame(&mut client, &frame, settings.write_timeout).await {
                    side.error = Some(e);
                    break;
                }
                side.frames += 1;
                stats::frame_relayed(Direction::OriginToClient);
            }
            Ok(None) => {
                debug!("[{}] Origin closed its stream", session);
                side.origin_failed = true;
                break;
            }
            Err(e) => {
                side.origin_failed = !matches!(e, ProxyError::Timeout(_));
                side.error = Some(e);
                break;
            }
        }
    }

    token.cancel();
    (frames, client, side)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::formatter;
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    fn tagged(bytes: Bytes) -> Frame {
        use tokio_util::codec::Decoder;
        let mut buf = bytes::BytesMut::from(&bytes[..]);
        FrameDecoder::tagged().decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_judge_balanced_idle_is_reusable() {
        let mut client = ClientSide::default();
        client.track(&tagged(formatter::query("SELECT 1")));
        let mut origin = OriginSide::default();
        origin
            .track(&tagged(formatter::ready_for_query(TransactionStatus::Idle)))
            .unwrap();
        assert_eq!(judge(&client, &origin), ReleaseVerdict::Reuse);
    }

    #[test]
    fn test_judge_open_transaction() {
        let mut client = ClientSide::default();
        client.track(&tagged(formatter::query("BEGIN")));
        let mut origin = OriginSide::default();
        origin
            .track(&tagged(formatter::ready_for_query(
                TransactionStatus::InTransaction,
            )))
            .unwrap();
        assert_eq!(
            judge(&client, &origin),
            ReleaseVerdict::Evict("transaction left open")
        );
    }

    #[test]
    fn test_judge_unanswered_query() {
        let mut client = ClientSide::default();
        client.track(&tagged(formatter::query("SELECT pg_sleep(10)")));
        assert_eq!(
            judge(&client, &OriginSide::default()),
            ReleaseVerdict::Evict("request in flight")
        );
    }

    #[test]
    fn test_judge_extended_query_without_sync() {
        let mut client = ClientSide::default();
        client.track(&tagged(Bytes::from_static(b"P\0\0\0\x08\0\0\0\0")));
        assert_eq!(
            judge(&client, &OriginSide::default()),
            ReleaseVerdict::Evict("extended query without Sync")
        );

        client.track(&tagged(Bytes::from_static(b"S\0\0\0\x04")));
        assert!(!client.dirty_tail);
    }

    #[test]
    fn test_judge_untouched_session_is_reusable() {
        assert_eq!(
            judge(&ClientSide::default(), &OriginSide::default()),
            ReleaseVerdict::Reuse
        );
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    fn settings() -> RelaySettings {
        RelaySettings {
            idle_timeout: Some(Duration::from_secs(5)),
            write_timeout: Duration::from_secs(5),
            max_frame_len: 1 << 20,
        }
    }

    #[tokio::test]
    async fn test_relay_forwards_and_stops_on_terminate() {
        let (mut client, proxy_client_side) = socket_pair().await;
        let (proxy_origin_side, mut origin) = socket_pair().await;

        let (read, write) = proxy_client_side.into_split();
        let frames = FramedRead::new(read, FrameDecoder::tagged());
        let origin_conn = OriginConnection::from_stream(proxy_origin_side).unwrap();
        let relay = tokio::spawn(relay(Uuid::new_v4(), frames, write, origin_conn, settings()));

        let query = formatter::query("SELECT 1");
        client.write_all(&query).await.unwrap();
        let mut received = vec![0u8; query.len()];
        origin.read_exact(&mut received).await.unwrap();
        assert_eq!(received, query.as_ref());

        let mut reply = Vec::new();
        reply.extend_from_slice(b"C\0\0\0\x0dSELECT 1\0");
        reply.extend_from_slice(&formatter::ready_for_query(TransactionStatus::Idle));
        origin.write_all(&reply).await.unwrap();
        let mut echoed = vec![0u8; reply.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, reply);

        client.write_all(&formatter::terminate()).await.unwrap();
        let report = relay.await.unwrap();
        assert_eq!(report.verdict, ReleaseVerdict::Reuse);
        assert!(report.client_terminated);
        assert_eq!(report.client_frames, 1);
        assert_eq!(report.origin_frames, 2);
        assert!(report.origin.is_some());

        // Terminate was consumed, not forwarded
        let mut probe = [0u8; 1];
        let pending = timeout(Duration::from_millis(100), origin.read(&mut probe)).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_aborted_relay_closes_both_sockets() {
        let (mut client, proxy_client_side) = socket_pair().await;
        let (proxy_origin_side, mut origin) = socket_pair().await;

        let (read, write) = proxy_client_side.into_split();
        let frames = FramedRead::new(read, FrameDecoder::tagged());
        let origin_conn = OriginConnection::from_stream(proxy_origin_side).unwrap();
        let relay = tokio::spawn(relay(Uuid::new_v4(), frames, write, origin_conn, settings()));

        let query = formatter::query("SELECT 1");
        client.write_all(&query).await.unwrap();
        let mut received = vec![0u8; query.len()];
        origin.read_exact(&mut received).await.unwrap();

        relay.abort();
        assert!(relay.await.unwrap_err().is_cancelled());

        let mut byte = [0u8; 1];
        let origin_read = timeout(Duration::from_secs(2), origin.read(&mut byte)).await;
        assert!(matches!(origin_read, Ok(Ok(0)) | Ok(Err(_))));
        let client_read = timeout(Duration::from_secs(2), client.read(&mut byte)).await;
        assert!(matches!(client_read, Ok(Ok(0)) | Ok(Err(_))));

        // Traffic sent after the abort goes nowhere
        let _ = client.write_all(&formatter::query("SELECT 2")).await;
        let after = timeout(Duration::from_millis(100), origin.read(&mut byte)).await;
        assert!(!matches!(after, Ok(Ok(n)) if n > 0));
    }

    #[tokio::test]
    async fn test_origin_close_evicts() {
        let (_client, proxy_client_side) = socket_pair().await;
        let (proxy_origin_side, origin) = socket_pair().await;

        let (read, write) = proxy_client_side.into_split();
        let frames = FramedRead::new(read, FrameDecoder::tagged());
        let origin_conn = OriginConnection::from_stream(proxy_origin_side).unwrap();
        let relay = tokio::spawn(relay(Uuid::new_v4(), frames, write, origin_conn, settings()));

        drop(origin);
        let report = relay.await.unwrap();
        assert_eq!(report.verdict, ReleaseVerdict::Evict("origin stream failed"));
    }

    #[tokio::test]
    async fn test_malformed_client_frame_is_not_forwarded() {
        let (mut client, proxy_client_side) = socket_pair().await;
        let (proxy_origin_side, mut origin) = socket_pair().await;

        let (read, write) = proxy_client_side.into_split();
        let frames = FramedRead::new(read, FrameDecoder::tagged());
        let origin_conn = OriginConnection::from_stream(proxy_origin_side).unwrap();
        let relay = tokio::spawn(relay(Uuid::new_v4(), frames, write, origin_conn, settings()));

        client.write_all(b"Q\0\0\0\x02").await.unwrap();
        let report = relay.await.unwrap();
        assert!(!report.client_terminated);
        assert_eq!(report.client_frames, 0);

        let mut probe = [0u8; 1];
        let pending = timeout(Duration::from_millis(100), origin.read(&mut probe)).await;
        assert!(pending.is_err());
    }
}
