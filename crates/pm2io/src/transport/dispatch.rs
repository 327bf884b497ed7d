//! Inbound dispatcher
//!
//! Reads frames off the stream of one connection and routes them: remote
//! action triggers go to the action registry, pm2 protocol requests get
//! their canned answer, everything else is logged. A frame that cannot be
//! decoded is skipped; only a read failure ends the loop.

use super::{FrameStream, LoopGuard, Transporter};
use crate::error::{ActionError, ConnectionError};
use crate::metrics::{ACTIONS_INVOKED, TRANSPORT_FRAMES_RECEIVED, TRANSPORT_MALFORMED_FRAMES};
use crate::protocol::*;
use crate::registry::Action;
use crate::transport::Frame;
use futures::StreamExt;
use serde_json::json;
use std::any::Any;
use tracing::*;

pub(super) async fn run(transporter: Transporter, mut stream: FrameStream, epoch: u64) {
    let _guard = LoopGuard::enter(&transporter.shared.loops.dispatcher);

    let failure = loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = transporter.retired(epoch) => {
                trace!("Dispatcher of connection {} stopped", epoch);
                return;
            }
        };

        match frame {
            // a hung action must not keep a retired dispatcher alive
            Some(Ok(Frame::Text(text))) => tokio::select! {
                _ = transporter.handle_text(&text) => {}
                _ = transporter.retired(epoch) => {
                    trace!("Dispatcher of connection {} stopped during a frame", epoch);
                    return;
                }
            },
            Some(Ok(Frame::Close)) => {
                transporter.mark_closed_by_peer(epoch);
                break ConnectionError::ClosedByPeer;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break e,
            None => {
                break ConnectionError::ReadFailed {
                    reason: "stream ended".to_string(),
                }
            }
        }
    };

    transporter.mark_handling_stopped(epoch);
    warn!("Connection {} lost: {}", epoch, failure);
    transporter.reconnect(Some(epoch), failure.kind()).await;
}

impl Transporter {
    pub(crate) async fn handle_text(&self, text: &str) {
        let message = match InboundMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                TRANSPORT_MALFORMED_FRAMES.inc();
                warn!("Skipping inbound frame: {}", e);
                return;
            }
        };

        let label = match &message {
            InboundMessage::Unknown { .. } => "unknown",
            known => known.channel(),
        };
        TRANSPORT_FRAMES_RECEIVED.with_label_values(&[label]).inc();

        match message {
            InboundMessage::TriggerAction(trigger) => self.trigger_action(trigger).await,
            InboundMessage::Pm2Action(action) if action.method_name == METHOD_START_LOGGING => {
                let result = Envelope::new(CHANNEL_PM2_RESULT, json!({"ret": {"err": null}}));
                self.send_json(&result).await;
            }
            InboundMessage::Pm2Action(action) => {
                warn!("pm2 method not supported: {}", action.method_name)
            }
            InboundMessage::Unknown { channel } => warn!("msg not registered: {}", channel),
        }
    }

    async fn trigger_action(&self, trigger: ActionTrigger) {
        let ActionTrigger {
            action_name,
            process_id,
            ..
        } = trigger;

        let action = self.actions().lookup(&action_name);
        if action.is_none() {
            debug!("Action {} is not registered", action_name);
        }

        match invoke(&action_name, action).await {
            Ok(result) => {
                ACTIONS_INVOKED.with_label_values(&["success"]).inc();
                self.send(
                    CHANNEL_ACTION_SUCCESS,
                    json!({
                        "success": true,
                        "id": process_id,
                        "action_name": action_name,
                    }),
                )
                .await;
                self.send(
                    CHANNEL_AXM_REPLY,
                    json!({
                        "action_name": action_name,
                        "return": result,
                    }),
                )
                .await;
            }
            Err(e) => {
                ACTIONS_INVOKED.with_label_values(&["failure"]).inc();
                error!("{}", e);
                self.send(
                    CHANNEL_ACTION_FAILURE,
                    json!({
                        "success": false,
                        "id": process_id,
                        "action_name": action_name,
                        "err": e.to_string(),
                    }),
                )
                .await;
            }
        }
    }
}

/// Run the callback on the blocking pool so a slow or panicking action
/// cannot stall or kill the dispatcher
async fn invoke(action_name: &str, action: Option<Action>) -> Result<Option<String>, ActionError> {
    let Some(action) = action else {
        return Ok(None);
    };

    tokio::task::spawn_blocking(move || action.invoke())
        .await
        .map_err(|e| {
            if e.is_panic() {
                ActionError::Panicked {
                    action_name: action_name.to_string(),
                    reason: panic_message(e.into_panic()),
                }
            } else {
                ActionError::Cancelled {
                    action_name: action_name.to_string(),
                }
            }
        })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
