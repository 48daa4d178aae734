// 采集文件回放
//
// 已结束且已落盘的比赛没有内存中的流，订阅时从采集文件按会话帧率重放，
// 支持暂停和修改帧率，读完后发送 stream_ended。

use super::session::SubscriberSession;
use common::{Envelope, ServerMessage};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

pub(crate) async fn replay_capture(session: Arc<SubscriberSession>, path: PathBuf) {
    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open capture file {:?}: {}", path, e);
            push_notice(&session, ServerMessage::Error {
                error: format!("replay unavailable: {}", e),
            })
            .await;
            return;
        }
    };

    info!(
        "Replaying capture {:?} for subscriber {} at {} fps",
        path,
        session.id(),
        session.frame_rate()
    );

    let cancel = session.cancel_token().clone();
    let mut lines = BufReader::new(file).lines();
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Replay cancelled for subscriber {}", session.id());
                return;
            }
            _ = tokio::time::sleep(session.frame_interval()) => {}
        }

        if session.is_paused() {
            continue;
        }

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read capture file {:?}: {}", path, e);
                break;
            }
        };

        let frame = match Envelope::from_line(&line) {
            Ok(Envelope { frame: Some(frame) }) => frame,
            Ok(Envelope { frame: None }) => continue,
            Err(e) => {
                debug!("Skipping malformed capture line: {}", e);
                continue;
            }
        };

        let message = match ServerMessage::frame_json(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to encode frame {}: {}", frame.frame_index, e);
                continue;
            }
        };

        if !session.push(Arc::from(message)).await {
            return;
        }
        sent += 1;
    }

    push_notice(&session, ServerMessage::StreamEnded).await;
    info!("Replay finished for subscriber {}: {} frames", session.id(), sent);
}

async fn push_notice(session: &SubscriberSession, message: ServerMessage) {
    if let Ok(json) = message.to_json() {
        session.push(Arc::from(json)).await;
    }
}
