//! Duplex connection handling and event dispatch.
//!
//! Each WebSocket gets a stable connection id, a bounded outbound queue
//! drained by a writer task, and a read loop that parses named events and
//! routes them to the registry or the upload store. Malformed frames are
//! dropped, not answered. Teardown leaves the room first (so `user-left`
//! fans out) and then aborts any uploads the connection owned.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use huddle_shared::constants::OUTBOUND_QUEUE_CAPACITY;
use huddle_shared::protocol::{ClientEvent, ServerEvent};
use huddle_shared::types::{ConnectionId, RoomCode};

use crate::api::AppState;
use crate::uploads::UploadError;

struct ConnContext {
    id: ConnectionId,
    /// Room this connection is bound to, set by a successful join.
    room: Option<RoomCode>,
    outbound: mpsc::Sender<ServerEvent>,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = ConnectionId::new();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE_CAPACITY);

    info!(peer = %conn_id, "Connection opened");

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize outbound event");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut ctx = ConnContext {
        id: conn_id,
        room: None,
        outbound: tx,
    };

    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!(peer = %conn_id, error = %e, "Socket error");
                break;
            }
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => dispatch(&state, &mut ctx, event).await,
                Err(e) => debug!(peer = %conn_id, error = %e, "Dropping malformed event"),
            },
            Message::Close(_) => break,
            // Binary frames, pings and pongs are not part of the protocol.
            _ => {}
        }
    }

    teardown(&state, &ctx).await;
    // Dropping the context releases the last outbound sender (the room's
    // clone went away with leave), which lets the writer task finish.
    drop(ctx);
    let _ = writer.await;
    info!(peer = %conn_id, "Connection closed");
}

async fn dispatch(state: &AppState, ctx: &mut ConnContext, event: ClientEvent) {
    match event {
        ClientEvent::JoinRoom { room_id, nickname } => {
            on_join_room(state, ctx, &room_id, &nickname).await;
        }

        ClientEvent::Offer { room_id, offer, to } => {
            relay(state, ctx, &room_id, to, ServerEvent::Offer { offer, from: ctx.id }).await;
        }
        ClientEvent::Answer { room_id, answer, to } => {
            relay(
                state,
                ctx,
                &room_id,
                to,
                ServerEvent::Answer {
                    answer,
                    from: ctx.id,
                },
            )
            .await;
        }
        ClientEvent::ScreenShareOffer { room_id, offer, to } => {
            relay(
                state,
                ctx,
                &room_id,
                to,
                ServerEvent::ScreenShareOffer {
                    offer,
                    from: ctx.id,
                },
            )
            .await;
        }
        ClientEvent::ScreenShareAnswer { room_id, answer, to } => {
            relay(
                state,
                ctx,
                &room_id,
                to,
                ServerEvent::ScreenShareAnswer {
                    answer,
                    from: ctx.id,
                },
            )
            .await;
        }

        // The sender's connection id is authoritative for arbitration; the
        // payload's userId is what the client believes and is not trusted.
        ClientEvent::ScreenShareStart {
            room_id, user_name, ..
        } => {
            let code = RoomCode::folded(&room_id);
            state
                .registry
                .start_screen_share(&code, ctx.id, &user_name)
                .await;
        }
        ClientEvent::ScreenShareStop { room_id, .. } => {
            let code = RoomCode::folded(&room_id);
            state.registry.stop_screen_share(&code, ctx.id).await;
        }

        ClientEvent::ChatMessage { message, file } => {
            let Some(code) = ctx.room.clone() else {
                debug!(peer = %ctx.id, "Dropping chat from unbound connection");
                return;
            };
            state.registry.append_chat(&code, ctx.id, message, file).await;
        }

        ClientEvent::ToggleMute { is_muted } => {
            if let Some(code) = ctx.room.clone() {
                state.registry.set_muted(&code, ctx.id, is_muted).await;
            }
        }
        ClientEvent::ToggleRaiseHand { is_hand_raised } => {
            if let Some(code) = ctx.room.clone() {
                state
                    .registry
                    .set_hand_raised(&code, ctx.id, is_hand_raised)
                    .await;
            }
        }
        ClientEvent::ToggleVideo { is_video_enabled } => {
            if let Some(code) = ctx.room.clone() {
                state
                    .registry
                    .set_video_enabled(&code, ctx.id, is_video_enabled)
                    .await;
            }
        }

        ClientEvent::FileUploadStart {
            room_id,
            original_name,
            mime_type,
            size,
        } => {
            let code = RoomCode::folded(&room_id);
            let ack = if !state.registry.exists(&code).await {
                ServerEvent::FileUploadStartAck {
                    ok: false,
                    upload_id: None,
                    error: Some("RoomNotFound".into()),
                }
            } else {
                match state
                    .uploads
                    .begin(ctx.id, code, &original_name, &mime_type, size)
                    .await
                {
                    Ok(upload_id) => ServerEvent::FileUploadStartAck {
                        ok: true,
                        upload_id: Some(upload_id),
                        error: None,
                    },
                    Err(e) => ServerEvent::FileUploadStartAck {
                        ok: false,
                        upload_id: None,
                        error: Some(e.code().into()),
                    },
                }
            };
            send(ctx, ack).await;
        }

        ClientEvent::FileUploadChunk { upload_id, chunk } => {
            let Ok(bytes) = BASE64.decode(chunk.as_bytes()) else {
                debug!(peer = %ctx.id, upload = %upload_id, "Dropping undecodable chunk");
                return;
            };
            match state.uploads.append(ctx.id, upload_id, &bytes).await {
                Ok(received) => {
                    send(
                        ctx,
                        ServerEvent::FileUploadChunkAck {
                            upload_id,
                            ok: true,
                            received: Some(received),
                            error: None,
                        },
                    )
                    .await;
                }
                Err(e) => {
                    let write_failed = matches!(e, UploadError::WriteFailed(_));
                    send(
                        ctx,
                        ServerEvent::FileUploadChunkAck {
                            upload_id,
                            ok: false,
                            received: None,
                            error: Some(e.code().into()),
                        },
                    )
                    .await;
                    if write_failed {
                        // Out-of-band heads-up so the client can stop pushing
                        // chunks it has already queued.
                        send(
                            ctx,
                            ServerEvent::FileUploadError {
                                upload_id,
                                error: e.code().into(),
                            },
                        )
                        .await;
                    }
                }
            }
        }

        ClientEvent::FileUploadComplete { upload_id } => {
            let ack = match state.uploads.finish(ctx.id, upload_id).await {
                Ok(file) => ServerEvent::FileUploadCompleteAck {
                    upload_id,
                    ok: true,
                    file: Some(file),
                    error: None,
                },
                Err(e) => ServerEvent::FileUploadCompleteAck {
                    upload_id,
                    ok: false,
                    file: None,
                    error: Some(e.code().into()),
                },
            };
            send(ctx, ack).await;
        }
    }
}

async fn on_join_room(state: &AppState, ctx: &mut ConnContext, room_id: &str, nickname: &str) {
    let code = RoomCode::folded(room_id);
    if let Some(bound) = &ctx.room {
        if *bound != code {
            send(
                ctx,
                ServerEvent::Error {
                    message: "Already in a room".into(),
                },
            )
            .await;
            return;
        }
    }

    match state
        .registry
        .join(&code, ctx.id, nickname, ctx.outbound.clone())
        .await
    {
        Ok(view) => {
            ctx.room = Some(view.room_id.clone());
            send(
                ctx,
                ServerEvent::RoomJoined {
                    room_id: view.room_id.as_str().to_string(),
                    participants: view.participants,
                    is_host: view.is_host,
                },
            )
            .await;
        }
        Err(e) => {
            send(
                ctx,
                ServerEvent::Error {
                    message: e.to_string(),
                },
            )
            .await;
        }
    }
}

async fn relay(
    state: &AppState,
    ctx: &ConnContext,
    room_id: &str,
    to: ConnectionId,
    event: ServerEvent,
) {
    let code = RoomCode::folded(room_id);
    state.registry.relay(&code, ctx.id, to, event).await;
}

/// Enqueue an event for this connection itself. Awaiting our own queue gives
/// the client backpressure on its own traffic without involving the room.
async fn send(ctx: &ConnContext, event: ServerEvent) {
    if ctx.outbound.send(event).await.is_err() {
        debug!(peer = %ctx.id, "Outbound channel closed mid-dispatch");
    }
}

async fn teardown(state: &AppState, ctx: &ConnContext) {
    if let Some(code) = &ctx.room {
        state.registry.leave(code, ctx.id).await;
    }
    let aborted = state.uploads.abort_all_for(ctx.id).await;
    if aborted > 0 {
        debug!(peer = %ctx.id, aborted, "Aborted in-flight uploads");
    }
}
