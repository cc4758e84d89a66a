//! Command log delivery: snapshot, chunked follow, and WebSocket streaming.
//!
//! On the WebSocket path the inbound reader never writes to the socket. It
//! forwards ping payloads to a small pong queue and the single writer task
//! sends queued pongs ahead of any log data, so keepalives are answered even
//! while a large backlog is being streamed.
//!
//! The underlying tungstenite connection also queues an automatic pong for
//! every ping it reads and flushes it with the next write. A client can
//! therefore see two pongs for one ping (both carry the ping payload, which
//! RFC 6455 allows), or one when the queued pong replaces a still-pending
//! automatic one.

use crate::{error::session_error, state::AppState, types::LogsQuery};
use async_stream::stream;
use axum::{
    body::Body,
    extract::{
        Path, Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use sandboxd_shared::shell_session::{FollowEnd, LogFollower};
use std::convert::Infallible;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const LOG_CHANNEL_CAPACITY: usize = 16;
const PONG_QUEUE_CAPACITY: usize = 8;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

pub(crate) async fn command_logs_handler(
    State(state): State<AppState>,
    Path((session_id, command_id)): Path<(String, String)>,
    Query(params): Query<LogsQuery>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, Response> {
    match upgrade {
        Ok(upgrade) => {
            let follower = state
                .registry
                .log_follower(&session_id, &command_id, params.combined_output, params.follow)
                .await
                .map_err(session_error)?;
            Ok(upgrade.on_upgrade(move |socket| async move {
                stream_over_websocket(socket, follower).await;
                debug!(session_id = %session_id, command_id = %command_id, "Log stream closed");
            }))
        }
        Err(_) if params.follow => {
            let follower = state
                .registry
                .log_follower(&session_id, &command_id, params.combined_output, true)
                .await
                .map_err(session_error)?;
            Ok(([(CONTENT_TYPE, "application/octet-stream")], follow_body(follower)).into_response())
        }
        Err(_) => {
            let log = state
                .registry
                .read_logs(&session_id, &command_id, params.combined_output)
                .await
                .map_err(session_error)?;
            Ok((StatusCode::OK, [(CONTENT_TYPE, "application/octet-stream")], log).into_response())
        }
    }
}

/// Chunked response body fed by a follower; dropping the body stops it.
fn follow_body(follower: LogFollower) -> Body {
    let (tx, mut rx) = mpsc::channel::<Bytes>(LOG_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        if let Err(error) = follower.run(tx).await {
            warn!(error = %error, "Log follower failed");
        }
    });

    Body::from_stream(stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<Bytes, Infallible>(chunk);
        }
    })
}

async fn stream_over_websocket(socket: WebSocket, follower: LogFollower) {
    let (mut sink, inbound) = socket.split();
    let (pong_tx, mut pong_rx) = mpsc::channel::<Bytes>(PONG_QUEUE_CAPACITY);
    let (data_tx, data_rx) = mpsc::channel::<Bytes>(LOG_CHANNEL_CAPACITY);
    let client_gone = CancellationToken::new();

    let reader = tokio::spawn(read_inbound(inbound, pong_tx, client_gone.clone()));
    let follower_task = tokio::spawn(follower.run(data_tx));

    let exit = write_log_stream(&mut sink, data_rx, &mut pong_rx, &client_gone).await;
    finish_stream(&mut sink, &mut pong_rx, exit, follower_task).await;
    reader.abort();
}

/// Inbound half: answers nothing itself, only queues pongs and notices the client leaving.
pub(crate) async fn read_inbound<R, E>(
    mut inbound: R,
    pong_tx: mpsc::Sender<Bytes>,
    client_gone: CancellationToken,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(message) = inbound.next().await {
        match message {
            Ok(Message::Ping(payload)) => match pong_tx.try_send(payload) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!("Pong queue full, dropping pong"),
                Err(TrySendError::Closed(_)) => break,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                debug!(error = %error, "Log stream client read failed");
                break;
            }
        }
    }
    client_gone.cancel();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriterExit {
    /// The follower finished and closed the data channel
    DataEnded,
    /// The client went away or a write failed
    ClientGone,
}

async fn send_pending_pongs<S>(sink: &mut S, pong_rx: &mut mpsc::Receiver<Bytes>) -> bool
where
    S: Sink<Message> + Unpin,
{
    while let Ok(payload) = pong_rx.try_recv() {
        if sink.send(Message::Pong(payload)).await.is_err() {
            return false;
        }
    }
    true
}

/// The single writer. Pongs always go out before the next data frame.
pub(crate) async fn write_log_stream<S>(
    sink: &mut S,
    mut data_rx: mpsc::Receiver<Bytes>,
    pong_rx: &mut mpsc::Receiver<Bytes>,
    client_gone: &CancellationToken,
) -> WriterExit
where
    S: Sink<Message> + Unpin,
{
    loop {
        tokio::select! {
            biased;

            Some(payload) = pong_rx.recv() => {
                if sink.send(Message::Pong(payload)).await.is_err() {
                    return WriterExit::ClientGone;
                }
            }
            chunk = data_rx.recv() => {
                let Some(chunk) = chunk else {
                    return WriterExit::DataEnded;
                };
                if !send_pending_pongs(sink, pong_rx).await {
                    return WriterExit::ClientGone;
                }
                if sink.send(Message::Binary(chunk)).await.is_err() {
                    return WriterExit::ClientGone;
                }
            }
            _ = client_gone.cancelled() => return WriterExit::ClientGone,
        }
    }
}

/// Close frame describing why the follower stopped; `None` when the client left
pub(crate) fn close_frame(end: &std::io::Result<FollowEnd>) -> Option<CloseFrame> {
    match end {
        Ok(FollowEnd::Completed) => Some(CloseFrame {
            code: CLOSE_NORMAL,
            reason: "command completed".into(),
        }),
        Ok(FollowEnd::SessionCancelled) => Some(CloseFrame {
            code: CLOSE_GOING_AWAY,
            reason: "session terminated".into(),
        }),
        Ok(FollowEnd::ReceiverClosed) => None,
        Err(error) => Some(CloseFrame {
            code: CLOSE_INTERNAL_ERROR,
            reason: error.to_string().into(),
        }),
    }
}

async fn finish_stream<S>(
    sink: &mut S,
    pong_rx: &mut mpsc::Receiver<Bytes>,
    exit: WriterExit,
    follower_task: JoinHandle<std::io::Result<FollowEnd>>,
) where
    S: Sink<Message> + Unpin,
{
    if exit == WriterExit::ClientGone {
        follower_task.abort();
        return;
    }

    let end = match follower_task.await {
        Ok(end) => end,
        Err(error) => Err(std::io::Error::other(error.to_string())),
    };

    if let Some(frame) = close_frame(&end)
        && send_pending_pongs(sink, pong_rx).await
    {
        let _ = sink.send(Message::Close(Some(frame))).await;
    }
}
