//! Routes a decoded `Telecast` to the right handling: forward Safecast
//! measurements to the cloud, answer or relay gateway pingbacks, and
//! merge every message into the snapshot store.
//!
//! The one rule that must survive translation: when `reply_type ==
//! ALLOWED`, the forward happens on the caller's own future — no
//! `tokio::spawn` — so that `route().await` doesn't return, and the state
//! machine doesn't restart receive, until any reply has already been
//! enqueued. Every other path may spawn.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use prost::Message;
use rand::Rng;
use tracing::{info, warn};

use crate::queue::{OutboundCommand, QueueSender};
use crate::service::{ForwardRequest, ServiceClient};
use crate::snapshot::SnapshotStore;
use crate::telecast::{DeviceType, ReplyType, Telecast};

/// Shared state the router needs on every call. Cheap to clone: every
/// field is already an `Arc` or a clone-friendly handle.
#[derive(Clone)]
pub struct RouterContext {
    pub queue: QueueSender,
    pub service: Arc<ServiceClient>,
    pub snapshot: Arc<SnapshotStore>,
    pub location: Arc<str>,
    /// Static gateway position from the `LAT`/`LON`/`ALT` environment
    /// overrides. Forwarded to the service as the gateway's own position,
    /// never the reporting device's.
    pub latitude: Option<f32>,
    pub longitude: Option<f32>,
    pub altitude: Option<f32>,
    /// HWEUI, populated once the init sequence reads it back from the
    /// transceiver. Empty until then.
    pub gateway_id: Arc<Mutex<String>>,
    /// Device id most recently routed, consulted by the state machine's
    /// send-pending-outbound logic when it needs to address a reply.
    pub last_device: Arc<AtomicU32>,
    /// Lifetime count of messages routed, reported in the supervisor's
    /// periodic stats POST.
    pub messages_received: Arc<AtomicU64>,
}

/// Dispatch one decoded message. `legacy` only affects logging.
pub async fn route(msg: Telecast, snr: f32, legacy: bool, ctx: &RouterContext) {
    if legacy {
        info!(
            device_id = msg.device_id,
            "received message via deprecated single-message frame tag"
        );
    }

    ctx.last_device.store(msg.device_id, Ordering::Relaxed);
    ctx.messages_received.fetch_add(1, Ordering::Relaxed);

    match DeviceType::try_from(msg.device_type).unwrap_or(DeviceType::Unknown) {
        DeviceType::Unknown | DeviceType::Solarcast | DeviceType::BgeigieNano => {
            ctx.snapshot.merge(&msg, snr).await;
            forward(msg, snr, ctx).await;
        }
        DeviceType::Ttgate | DeviceType::Ttgateping => {
            handle_gateway_message(msg, snr, ctx).await;
        }
        other => {
            if !msg.message.is_empty() {
                info!(device_id = msg.device_id, device_type = ?other, message = %msg.message, "unrouted device-type message");
            }
        }
    }
}

async fn handle_gateway_message(msg: Telecast, snr: f32, ctx: &RouterContext) {
    if msg.message.is_empty() {
        // A ping request. Don't mislead peers if we can't even reach the
        // service ourselves.
        if !ctx.service.is_reachable() {
            return;
        }
        schedule_pingback(msg.device_id, ctx.clone());
        return;
    }

    // A pong or status message: forward normally, same as any other
    // message, but it never carries a reply window.
    forward(msg, snr, ctx).await;
}

async fn forward(msg: Telecast, snr: f32, ctx: &RouterContext) {
    let reply_allowed = ReplyType::try_from(msg.reply_type) == Ok(ReplyType::Allowed);

    if reply_allowed {
        do_forward(msg, snr, ctx.clone()).await;
    } else {
        let ctx = ctx.clone();
        tokio::spawn(async move { do_forward(msg, snr, ctx).await });
    }
}

async fn do_forward(msg: Telecast, snr: f32, ctx: RouterContext) {
    let device_id = msg.device_id;
    let reply_allowed = ReplyType::try_from(msg.reply_type) == Ok(ReplyType::Allowed);

    let mut buf = Vec::with_capacity(msg.encoded_len());
    if msg.encode(&mut buf).is_err() {
        warn!(device_id, "failed to re-encode message for forwarding");
        return;
    }

    let request = ForwardRequest {
        payload: buf,
        received_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        gateway_id: ctx.gateway_id.lock().expect("mutex poisoned").clone(),
        longitude: ctx.longitude.unwrap_or(0.0),
        latitude: ctx.latitude.unwrap_or(0.0),
        altitude: ctx.altitude.unwrap_or(0.0) as i32,
        snr: (snr != crate::telecast::INVALID_SNR).then_some(snr),
        location: ctx.location.to_string(),
    };

    match ctx.service.forward(&request).await {
        Ok(reply) => {
            if reply_allowed {
                if let Some(bytes) = reply.reply {
                    ctx.queue.enqueue(OutboundCommand(bytes));
                }
            }
        }
        Err(e) => warn!(error = %e, device_id, "forward to service failed"),
    }
}

/// A `TTGATEPING`/empty-message `TTGATE` is answered after a random
/// 1-20s delay so that many gateways hearing the same ping don't all
/// reply in the same instant.
fn schedule_pingback(device_id: u32, ctx: RouterContext) {
    tokio::spawn(async move {
        let delay_secs = rand::thread_rng().gen_range(1..=20);
        tokio::time::sleep(Duration::from_secs(delay_secs)).await;

        let pong = Telecast {
            device_type: DeviceType::Ttgate as i32,
            device_id,
            message: "ping".to_string(),
            ..Default::default()
        };

        let mut buf = Vec::with_capacity(pong.encoded_len());
        if pong.encode(&mut buf).is_ok() {
            ctx.queue.enqueue(OutboundCommand(buf));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;

    fn ctx() -> (RouterContext, queue::QueueReceiver) {
        let (tx, rx) = queue::channel();
        let ctx = RouterContext {
            queue: tx,
            service: Arc::new(ServiceClient::new("example.invalid".to_string())),
            snapshot: Arc::new(SnapshotStore::new()),
            location: Arc::from(""),
            latitude: None,
            longitude: None,
            altitude: None,
            gateway_id: Arc::new(Mutex::new(String::new())),
            last_device: Arc::new(AtomicU32::new(0)),
            messages_received: Arc::new(AtomicU64::new(0)),
        };
        (ctx, rx)
    }

    #[tokio::test]
    async fn routing_updates_last_device() {
        let (ctx, _rx) = ctx();
        let msg = Telecast {
            device_id: 99,
            ..Default::default()
        };
        route(msg, 5.0, false, &ctx).await;
        assert_eq!(ctx.last_device.load(Ordering::Relaxed), 99);
    }

    #[tokio::test]
    async fn routing_merges_safecast_message_into_snapshot() {
        let (ctx, _rx) = ctx();
        let msg = Telecast {
            device_id: 5,
            cpm: 42,
            device_type: DeviceType::BgeigieNano as i32,
            ..Default::default()
        };
        route(msg, 5.0, false, &ctx).await;
        let snapshot = ctx.snapshot.export().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].cpm, Some(42));
    }

    #[tokio::test]
    async fn other_device_types_are_not_forwarded_or_merged() {
        let (ctx, _rx) = ctx();
        let msg = Telecast {
            device_id: 1,
            device_type: DeviceType::Ttapp as i32,
            message: "hello".to_string(),
            ..Default::default()
        };
        route(msg, 5.0, false, &ctx).await;
        assert!(ctx.snapshot.export().await.is_empty());
    }
}
