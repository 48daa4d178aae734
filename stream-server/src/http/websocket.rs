//! 订阅者 WebSocket
//!
//! 每个连接拆成两个泵：发送泵从会话队列取消息并按会话帧率节流，同时定时 ping；
//! 接收泵解析控制/定位消息，读超时或对端关闭时结束。任一泵结束后取消订阅。

use super::AppState;
use crate::error::StreamError;
use crate::hub::{StreamHub, SubscriberSession, Subscription};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use common::{ClientMessage, MatchId};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// 订阅帧率，非法时使用默认值
    pub fps: Option<String>,
}

pub async fn stream_websocket(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let match_id: MatchId = match match_id.parse() {
        Ok(id) => id,
        Err(e) => return StreamError::InvalidRequest(e).into_response(),
    };

    let requested = query.fps.as_deref().and_then(|fps| fps.trim().parse::<i64>().ok());
    let frame_rate = state.hub.clamp_frame_rate(requested);

    ws.max_message_size(state.ws.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, match_id, frame_rate))
}

async fn handle_socket(socket: WebSocket, state: AppState, match_id: MatchId, frame_rate: u32) {
    // 内存中没有流时优先回放已完成的采集文件
    let subscription = if state.hub.has_stream(&match_id) {
        state.hub.subscribe(&match_id, frame_rate)
    } else {
        match state.hub.replay(&match_id, frame_rate).await {
            Some(subscription) => subscription,
            None => state.hub.subscribe(&match_id, frame_rate),
        }
    };

    let Subscription { session, outbound } = subscription;
    info!(
        "WebSocket subscriber {} connected to {}",
        session.id(),
        match_id
    );

    let (sink, stream) = socket.split();

    let mut send_task = tokio::spawn(send_pump(
        sink,
        outbound,
        session.clone(),
        state.ws.ping_interval,
    ));
    let mut recv_task = tokio::spawn(receive_pump(
        stream,
        state.hub.clone(),
        session.clone(),
        state.ws.read_timeout,
    ));

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.unsubscribe(&session);
    info!("WebSocket subscriber {} disconnected", session.id());
}

/// 发送泵：每条消息后按会话当前帧率等待一个间隔
pub async fn send_pump<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Arc<str>>,
    session: Arc<SubscriberSession>,
    ping_interval: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let cancel = session.cancel_token().clone();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    debug!("Ping to subscriber {} failed: {}", session.id(), e);
                    break;
                }
            }
            message = outbound.recv() => {
                let Some(message) = message else { break };

                if let Err(e) = sink.send(Message::Text(message.to_string())).await {
                    debug!("Write to subscriber {} failed: {}", session.id(), e);
                    break;
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(session.frame_interval()) => {}
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// 接收泵：格式错误的消息忽略，不断开连接
pub async fn receive_pump<S, E>(
    mut stream: S,
    hub: Arc<StreamHub>,
    session: Arc<SubscriberSession>,
    read_timeout: Duration,
) where
    S: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    let cancel = session.cancel_token().clone();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(read_timeout, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                info!("Subscriber {} read timeout", session.id());
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("Read from subscriber {} failed: {}", session.id(), e);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => match ClientMessage::parse(&text) {
                Ok(request) => hub.handle_client_message(&session, &request),
                Err(e) => debug!("Ignoring malformed message from {}: {}", session.id(), e),
            },
            Message::Close(_) => break,
            // pong 和其他帧只用于刷新读超时
            _ => {}
        }
    }
}
