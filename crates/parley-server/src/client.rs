use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parley_core::{decode_frame, ConnectionId, FrameError, Identity, UserId};
use parley_telemetry::names;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::config::ServerConfig;
use crate::hub::{ConnectionHandle, HubHandle, OutboundQueue};

/// How long a finished reader waits for the writer to flush and close.
const CLOSE_LINGER: Duration = Duration::from_secs(5);

/// One accepted WebSocket session.
#[derive(Clone, Debug)]
pub struct Connection {
    pub conn_id: ConnectionId,
    pub identity: Identity,
}

impl Connection {
    pub fn new(identity: Identity) -> Self {
        Self {
            conn_id: ConnectionId::new(),
            identity,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }
}

#[derive(Clone, Debug)]
pub struct PumpSettings {
    pub outbound_queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
}

impl From<&ServerConfig> for PumpSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            outbound_queue_capacity: config.outbound_queue_capacity,
            heartbeat_interval: config.heartbeat_interval(),
            client_timeout: config.client_timeout(),
        }
    }
}

/// Why the inbound pump stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundExit {
    PeerClosed,
    TransportError,
    IdleTimeout,
    Cancelled,
    HubClosed,
}

/// Why the outbound pump stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutboundExit {
    QueueClosed,
    WriteFailed,
}

/// Read frames from the peer and submit them to the hub until the peer
/// goes away, stays silent past the client timeout, or `cancel` fires.
///
/// Always asks the hub to unregister the connection on the way out.
pub async fn inbound_pump<S, E>(
    mut reader: S,
    connection: &Connection,
    hub: &HubHandle,
    client_timeout: Duration,
    cancel: &CancellationToken,
) -> InboundExit
where
    S: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    let identity = &connection.identity;
    let exit = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break InboundExit::Cancelled,
            next = timeout(client_timeout, reader.next()) => next,
        };
        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "read failed");
                break InboundExit::TransportError;
            }
            Ok(None) => break InboundExit::PeerClosed,
            Err(_) => break InboundExit::IdleTimeout,
        };

        let decoded = match frame {
            WsMessage::Text(text) => decode_frame(text.as_str(), identity),
            WsMessage::Binary(bytes) => std::str::from_utf8(&bytes)
                .map_err(|_| FrameError::NotUtf8)
                .and_then(|text| decode_frame(text, identity)),
            // Any traffic, pongs included, resets the idle timer.
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => break InboundExit::PeerClosed,
        };

        match decoded {
            Ok(event) => {
                let routed = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break InboundExit::Cancelled,
                    routed = hub.submit(connection, event) => routed,
                };
                if routed.is_err() {
                    break InboundExit::HubClosed;
                }
            }
            Err(e) => {
                debug!(error = %e, "malformed frame ignored");
                if let Some(m) = hub.metrics() {
                    m.counter_inc(names::FRAMES_MALFORMED, &[("reason", e.reason())], 1);
                }
            }
        }
    };

    if hub
        .unregister(connection.user_id(), &connection.conn_id)
        .await
        .is_err()
    {
        debug!("hub already stopped, skipping unregister");
    }
    exit
}

/// Drain the outbound queue onto the socket, pinging every `heartbeat`.
///
/// A closed queue means the hub is done with this connection: send a close
/// frame and stop. Either way the connection is cancelled on exit so the
/// reader stops too. Never unregisters.
pub async fn outbound_pump<W>(
    mut writer: W,
    mut queue: OutboundQueue,
    heartbeat: Duration,
    cancel: CancellationToken,
) -> OutboundExit
where
    W: Sink<WsMessage> + Unpin,
    W::Error: Display,
{
    let mut ping = interval_at(Instant::now() + heartbeat, heartbeat);
    let exit = loop {
        let frame = tokio::select! {
            event = queue.recv() => match event {
                Some(event) => match event.to_json() {
                    Ok(json) => WsMessage::Text(json.into()),
                    Err(e) => {
                        warn!(error = %e, "failed to serialize event");
                        continue;
                    }
                },
                None => {
                    let _ = writer.send(WsMessage::Close(None)).await;
                    break OutboundExit::QueueClosed;
                }
            },
            _ = ping.tick() => {
                trace!("sending ping");
                WsMessage::Ping(Vec::new().into())
            }
        };
        if let Err(e) = writer.send(frame).await {
            debug!(error = %e, "write failed");
            break OutboundExit::WriteFailed;
        }
    };

    cancel.cancel();
    let _ = writer.close().await;
    exit
}

/// Run one WebSocket session from registration to teardown.
pub async fn serve_socket(
    socket: WebSocket,
    identity: Identity,
    hub: HubHandle,
    settings: PumpSettings,
    shutdown: CancellationToken,
) {
    let connection = Connection::new(identity);
    let span = info_span!(
        "connection",
        user_id = %connection.user_id(),
        conn_id = %connection.conn_id,
    );
    run_session(socket, connection, hub, settings, shutdown)
        .instrument(span)
        .await;
}

async fn run_session(
    socket: WebSocket,
    connection: Connection,
    hub: HubHandle,
    settings: PumpSettings,
    shutdown: CancellationToken,
) {
    let (handle, queue) = ConnectionHandle::open(&connection, settings.outbound_queue_capacity);
    let (mut sink, stream) = socket.split();

    if let Err(e) = hub.register(handle).await {
        warn!(error = %e, "rejecting connection");
        let _ = sink.send(WsMessage::Close(None)).await;
        return;
    }
    info!("client connected");

    let cancel = shutdown.child_token();
    let mut writer = tokio::spawn(
        outbound_pump(sink, queue, settings.heartbeat_interval, cancel.clone()).in_current_span(),
    );
    let inbound = inbound_pump(stream, &connection, &hub, settings.client_timeout, &cancel).await;

    match timeout(CLOSE_LINGER, &mut writer).await {
        Ok(Ok(outbound)) => info!(?inbound, ?outbound, "client disconnected"),
        Ok(Err(e)) => warn!(?inbound, error = %e, "writer task failed"),
        Err(_) => {
            writer.abort();
            warn!(?inbound, "writer did not finish in time, aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::hub::{Hub, HubSettings};
    use futures::channel::mpsc as fmpsc;
    use futures::stream;
    use parley_core::{ChatEvent, EventKind};
    use parley_store::MemoryChatStore;
    use parley_telemetry::MetricsRecorder;
    use tokio::sync::mpsc;

    type Frame = Result<WsMessage, std::io::Error>;

    struct Fixture {
        hub: HubHandle,
        store: Arc<MemoryChatStore>,
        metrics: Arc<MetricsRecorder>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryChatStore::new());
        let metrics = Arc::new(MetricsRecorder::in_memory().unwrap());
        let (hub, _task) = Hub::spawn(
            store.clone(),
            HubSettings::default(),
            Some(metrics.clone()),
            CancellationToken::new(),
        );
        Fixture {
            hub,
            store,
            metrics,
        }
    }

    async fn join(hub: &HubHandle, user: &str) -> (Connection, OutboundQueue) {
        join_with_capacity(hub, user, 32).await
    }

    async fn join_with_capacity(
        hub: &HubHandle,
        user: &str,
        capacity: usize,
    ) -> (Connection, OutboundQueue) {
        let connection = Connection::new(Identity::new(UserId::from_raw(user)));
        let (handle, queue) = ConnectionHandle::open(&connection, capacity);
        hub.register(handle).await.unwrap();
        (connection, queue)
    }

    fn text(json: &str) -> Frame {
        Ok(WsMessage::Text(json.to_string().into()))
    }

    fn received_messages(queue: &mut OutboundQueue) -> Vec<Arc<ChatEvent>> {
        let mut out = Vec::new();
        while let Ok(event) = queue.try_recv() {
            if event.kind == EventKind::Message {
                out.push(event);
            }
        }
        out
    }

    #[tokio::test]
    async fn frames_are_stamped_with_sender_and_routed() {
        let f = fixture();
        let (alice, _alice_q) = join(&f.hub, "alice").await;
        let (_bob, mut bob_q) = join(&f.hub, "bob").await;

        let frames = stream::iter(vec![
            text(r#"{"type":"message","content":"hi bob","user_id":"mallory"}"#),
            Ok(WsMessage::Pong(Vec::new().into())),
            Ok(WsMessage::Binary(br#"{"type":"message","content":"raw"}"#.to_vec().into())),
        ]);
        let exit = inbound_pump(
            frames,
            &alice,
            &f.hub,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await;
        f.hub.barrier().await.unwrap();

        assert_eq!(exit, InboundExit::PeerClosed);
        let received = received_messages(&mut bob_q);
        let contents: Vec<_> = received.iter().filter_map(|e| e.content.as_deref()).collect();
        assert_eq!(contents, ["hi bob", "raw"]);
        assert!(received.iter().all(|e| e.user_id.as_str() == "alice"));
        assert_eq!(f.store.save_calls(), 2);
    }

    #[tokio::test]
    async fn malformed_frames_are_counted_and_skipped() {
        let f = fixture();
        let (alice, mut alice_q) = join(&f.hub, "alice").await;

        let frames = stream::iter(vec![
            text("not json"),
            text(r#"{"type":"status","status":"offline"}"#),
            text(r#"{"type":"typing"}"#),
            Ok(WsMessage::Binary(vec![0xff, 0xfe].into())),
            text(r#"{"type":"message","content":"still alive"}"#),
        ]);
        inbound_pump(frames, &alice, &f.hub, Duration::from_secs(5), &CancellationToken::new())
            .await;
        f.hub.barrier().await.unwrap();

        let received = received_messages(&mut alice_q);
        assert_eq!(received.len(), 1);
        for reason in ["invalid_json", "server_only", "missing_field", "not_utf8"] {
            assert_eq!(
                f.metrics.counter_get(names::FRAMES_MALFORMED, &[("reason", reason)]),
                1,
                "{reason}"
            );
        }
    }

    #[tokio::test]
    async fn exit_unregisters_the_connection() {
        let f = fixture();
        let (alice, _q) = join(&f.hub, "alice").await;
        let frames = stream::iter(vec![Ok::<_, std::io::Error>(WsMessage::Close(None))]);
        let exit = inbound_pump(
            frames,
            &alice,
            &f.hub,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await;
        f.hub.barrier().await.unwrap();

        assert_eq!(exit, InboundExit::PeerClosed);
        assert!(f.hub.list_online().is_empty());
    }

    #[tokio::test]
    async fn transport_error_ends_the_pump() {
        let f = fixture();
        let (alice, _q) = join(&f.hub, "alice").await;
        let frames = stream::iter(vec![Err(std::io::Error::other("reset"))]);
        let exit = inbound_pump(
            frames,
            &alice,
            &f.hub,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(exit, InboundExit::TransportError);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let f = fixture();
        let (alice, _q) = join(&f.hub, "alice").await;
        let frames = Box::pin(stream::pending::<Frame>());
        let exit = inbound_pump(
            frames,
            &alice,
            &f.hub,
            Duration::from_secs(90),
            &CancellationToken::new(),
        )
        .await;
        f.hub.barrier().await.unwrap();

        assert_eq!(exit, InboundExit::IdleTimeout);
        assert!(!f.hub.is_online(alice.user_id()));
    }

    #[tokio::test]
    async fn cancellation_stops_the_reader() {
        let f = fixture();
        let (alice, _q) = join(&f.hub, "alice").await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let frames = Box::pin(stream::pending::<Frame>());
        let exit = inbound_pump(frames, &alice, &f.hub, Duration::from_secs(90), &cancel).await;
        assert_eq!(exit, InboundExit::Cancelled);
    }

    /// Run both pumps for `connection` the way a live session does.
    async fn run_pumps(
        f: &Fixture,
        connection: &Connection,
        queue: OutboundQueue,
        frames: impl Stream<Item = Frame> + Unpin,
    ) -> (InboundExit, OutboundExit) {
        let cancel = CancellationToken::new();
        let (sink, _written) = fmpsc::unbounded::<WsMessage>();
        let writer = tokio::spawn(outbound_pump(
            sink,
            queue,
            Duration::from_secs(30),
            cancel.clone(),
        ));
        let inbound = inbound_pump(frames, connection, &f.hub, Duration::from_secs(90), &cancel).await;
        (inbound, writer.await.unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn evicted_connection_stops_reading() {
        let f = fixture();
        let (slow, slow_q) = join_with_capacity(&f.hub, "slow", 1).await;
        let (_fast, mut fast_q) = join(&f.hub, "fast").await;
        f.hub.barrier().await.unwrap();
        assert!(!f.hub.is_online(slow.user_id()));

        let frames = stream::iter(vec![text(r#"{"type":"message","content":"too late"}"#)])
            .chain(stream::pending());
        let exits = run_pumps(&f, &slow, slow_q, Box::pin(frames)).await;
        f.hub.barrier().await.unwrap();

        assert_eq!(exits, (InboundExit::Cancelled, OutboundExit::QueueClosed));
        assert!(received_messages(&mut fast_q).is_empty());
        assert_eq!(f.store.save_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_connection_stops_reading() {
        let f = fixture();
        let (first, first_q) = join(&f.hub, "alice").await;
        let (second, mut second_q) = join(&f.hub, "alice").await;
        f.hub.barrier().await.unwrap();

        let frames = stream::iter(vec![text(r#"{"type":"message","content":"old tab"}"#)])
            .chain(stream::pending());
        let exits = run_pumps(&f, &first, first_q, Box::pin(frames)).await;
        f.hub.barrier().await.unwrap();

        assert_eq!(exits, (InboundExit::Cancelled, OutboundExit::QueueClosed));
        assert!(received_messages(&mut second_q).is_empty());
        assert_eq!(f.store.save_calls(), 0);
        assert!(f.hub.is_online(second.user_id()));
    }

    fn event(content: &str) -> Arc<ChatEvent> {
        Arc::new(ChatEvent::message(
            &Identity::new(UserId::from_raw("alice")),
            content,
            None,
        ))
    }

    #[tokio::test]
    async fn queued_events_are_written_then_closed() {
        let (tx, queue) = mpsc::channel(8);
        tx.send(event("one")).await.unwrap();
        tx.send(event("two")).await.unwrap();
        drop(tx);

        let (sink, written) = fmpsc::unbounded::<WsMessage>();
        let cancel = CancellationToken::new();
        let exit = outbound_pump(sink, queue, Duration::from_secs(30), cancel.clone()).await;
        let written: Vec<WsMessage> = written.collect().await;

        assert_eq!(exit, OutboundExit::QueueClosed);
        assert!(cancel.is_cancelled(), "reader must stop once the hub drops us");
        assert_eq!(written.len(), 3);
        for (frame, expected) in written.iter().zip(["one", "two"]) {
            let WsMessage::Text(json) = frame else {
                panic!("expected text frame, got {frame:?}");
            };
            let value: serde_json::Value = serde_json::from_str(json.as_str()).unwrap();
            assert_eq!(value["type"], "message");
            assert_eq!(value["content"], expected);
        }
        assert!(matches!(written[2], WsMessage::Close(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_writer_sends_heartbeats() {
        let (tx, queue) = mpsc::channel(8);
        let (sink, written) = fmpsc::unbounded::<WsMessage>();
        let pump = tokio::spawn(outbound_pump(
            sink,
            queue,
            Duration::from_secs(30),
            CancellationToken::new(),
        ));

        tokio::time::sleep(Duration::from_secs(61)).await;
        drop(tx);
        assert_eq!(pump.await.unwrap(), OutboundExit::QueueClosed);

        let written: Vec<WsMessage> = written.collect().await;
        let pings = written
            .iter()
            .filter(|m| matches!(m, WsMessage::Ping(_)))
            .count();
        assert_eq!(pings, 2);
    }

    #[tokio::test]
    async fn write_failure_cancels_the_connection() {
        let (tx, queue) = mpsc::channel(8);
        tx.send(event("lost")).await.unwrap();
        let (sink, written) = fmpsc::unbounded::<WsMessage>();
        drop(written);

        let cancel = CancellationToken::new();
        let exit = outbound_pump(sink, queue, Duration::from_secs(30), cancel.clone()).await;

        assert_eq!(exit, OutboundExit::WriteFailed);
        assert!(cancel.is_cancelled());
    }
}
