//! The command state machine: drives the transceiver through init,
//! receive, SNR-query, dispatch, and transmit cycles, one reply at a
//! time, with at most one command ever in flight.
//!
//! Every transition below is a direct translation of the RN2483/RN2903
//! command/reply table. Nothing here is speculative — where the table
//! says "stay", the match arm returns the same state; where it says
//! "full reinit", the arm calls `reinit()` and returns early, since
//! `reinit()` itself forces the next state to `ResetReq`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prost::Message as _;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::codec::router::{self, RouterContext};
use crate::codec::{frame, hex};
use crate::queue::{OutboundCommand, QueueReceiver, QueueSender};
use crate::radio::gpio::ResetLine;
use crate::radio::region::Region;
use crate::radio::serial::SerialWriter;
use crate::telecast::{DeviceType, Telecast};

/// Consecutive `busy` replies tolerated before the state machine gives up
/// and reboots the transceiver.
const BUSY_LIMIT: u32 = 10;
/// Consecutive 1-minute ticks with no state transition before a warning
/// is logged.
const STALL_WARN_TICKS: u32 = 2;
/// Consecutive 1-minute ticks with no state transition before a reinit
/// is forced.
const STALL_REINIT_TICKS: u32 = 3;

/// `mac pause` must reply with an integer at least this large to count
/// as a successful MAC suspend.
const MAC_PAUSE_MIN_TICKS: i64 = 100_000;

/// Gateway identity populated once during init: HWEUI read from the
/// transceiver, region from environment or inferred from the version
/// banner. Immutable for the rest of the process's life in practice,
/// though nothing prevents re-reading it after a `reinit()`.
#[derive(Debug, Clone, Default)]
pub struct GatewayIdentity {
    pub hweui: String,
    pub region: Option<Region>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    ResetReq,
    GetVerReply,
    ResetReply,
    MacPauseReply,
    GetEuiReply,
    SetWdtReply,
    RcvReply,
    SnrReply,
    TxReply1,
    TxReply2,
}

struct Inner {
    state: State,
    region: Option<Region>,
    hweui: String,
    /// `None` until the first `SET_WDT_REPLY` tick populates it from
    /// `region.setup_commands()`; `Some(empty)` once every command in the
    /// list has been sent, which is what tells `on_set_wdt_reply` to fall
    /// through to the receive-start path instead of regenerating the list.
    region_commands: Option<VecDeque<String>>,
    busy_count: u32,
    pending_payload_hex: String,
    unchanged_ticks: u32,
    force_service_down: bool,
}

impl Inner {
    fn new(region: Option<Region>, force_service_down: bool) -> Self {
        Self {
            state: State::Idle,
            region,
            hweui: String::new(),
            region_commands: None,
            busy_count: 0,
            pending_payload_hex: String::new(),
            unchanged_ticks: 0,
            force_service_down,
        }
    }

    /// Any transition, even a re-entry into the same state, counts as
    /// progress: a healthy machine parked in `RcvReply` re-sets that same
    /// state on every `restart_receive()` cycle, and that must not look
    /// like a stall to `on_state_change_tick`.
    fn set_state(&mut self, state: State) {
        self.state = state;
        self.unchanged_ticks = 0;
    }
}

/// Drives the RN2483/RN2903 through its ASCII command protocol. Owns no
/// hardware directly — the serial writer and GPIO reset line are handed
/// in at construction and shared with nothing else, so only this struct
/// ever has a command in flight.
pub struct CommandStateMachine {
    inner: Mutex<Inner>,
    initialized: AtomicBool,
    in_reinit: AtomicBool,
    serial: SerialWriter,
    gpio: Mutex<Box<dyn ResetLine>>,
    queue_tx: QueueSender,
    queue_rx: Mutex<QueueReceiver>,
    router_ctx: RouterContext,
}

impl CommandStateMachine {
    pub fn new(
        serial: SerialWriter,
        gpio: Box<dyn ResetLine>,
        queue_tx: QueueSender,
        queue_rx: QueueReceiver,
        router_ctx: RouterContext,
        region: Option<Region>,
        debug_failover: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::new(region, debug_failover)),
            initialized: AtomicBool::new(false),
            in_reinit: AtomicBool::new(false),
            serial,
            gpio: Mutex::new(gpio),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            router_ctx,
        })
    }

    /// Idempotent first-time setup: performs the first `reinit()`, then
    /// marks the machine initialized so `process()` stops blocking new
    /// callers.
    pub async fn init(self: &Arc<Self>) {
        self.reinit().await;
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// Hardware-resets the transceiver and restarts the init sequence.
    /// Guarded against re-entrancy: a caller that finds a reinit already
    /// in progress simply returns, so only one reinit leader ever runs.
    pub async fn reinit(self: &Arc<Self>) {
        if self.in_reinit.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!("reinitializing transceiver");
        self.gpio.lock().await.pulse().await;
        self.serial.request_flush();
        self.serial.watchdog.disarm();

        {
            let mut inner = self.inner.lock().await;
            inner.set_state(State::ResetReq);
            inner.busy_count = 0;
            inner.region_commands = None;
        }

        self.dispatch(None).await;
        self.in_reinit.store(false, Ordering::SeqCst);
    }

    /// Feed one complete line from the transceiver into the state
    /// machine. Blocks (polling every second) until initialization has
    /// completed and no reinit is in progress, so lines that arrive
    /// mid-reset are safely queued by the caller rather than mishandled.
    pub async fn process(self: &Arc<Self>, line: String) {
        while !self.initialized.load(Ordering::SeqCst) || self.in_reinit.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        self.dispatch(Some(line)).await;
    }

    /// Places a framed payload on the outbound queue. Never blocks.
    pub fn enqueue_outbound(&self, bytes: Vec<u8>) {
        self.queue_tx.enqueue(OutboundCommand(bytes));
    }

    /// Snapshot of the gateway's identity, for stats reporting.
    pub async fn identity(&self) -> GatewayIdentity {
        let inner = self.inner.lock().await;
        GatewayIdentity {
            hweui: inner.hweui.clone(),
            region: inner.region,
        }
    }

    /// 5s cadence: advances the serial reply watchdog. Returns `true` if
    /// the caller should terminate the process.
    pub fn reply_watchdog_tick(&self) -> bool {
        self.serial.watchdog.tick()
    }

    /// 1-minute cadence: advances the state-change watchdog. `set_state`
    /// zeroes the counter on every transition, so this just counts ticks
    /// since the last one; three consecutive ticks with no transition
    /// force a reinit.
    pub async fn on_state_change_tick(self: &Arc<Self>) {
        let trigger_reinit = {
            let mut inner = self.inner.lock().await;
            inner.unchanged_ticks += 1;
            if inner.unchanged_ticks == STALL_WARN_TICKS {
                warn!(state = ?inner.state, "state machine hasn't progressed in a while");
            }
            inner.unchanged_ticks >= STALL_REINIT_TICKS
        };
        if trigger_reinit {
            warn!("state stalled for too long, forcing reinit");
            self.reinit().await;
        }
    }

    async fn send(&self, command: &str) {
        self.serial.send_command(command);
    }

    /// Core transition function. `line` is `None` only for the initial
    /// "kick" that starts the RESET_REQ → GET_VER_REPLY sequence.
    async fn dispatch(self: &Arc<Self>, line: Option<String>) {
        let state = self.inner.lock().await.state;
        let input = line.as_deref().unwrap_or("");

        match state {
            State::Idle | State::ResetReq => self.on_reset_req().await,
            State::GetVerReply => self.on_get_ver_reply(input).await,
            State::ResetReply => self.on_reset_reply().await,
            State::MacPauseReply => self.on_mac_pause_reply(input).await,
            State::GetEuiReply => self.on_get_eui_reply(input).await,
            State::SetWdtReply => self.on_set_wdt_reply().await,
            State::RcvReply => self.on_rcv_reply(input).await,
            State::SnrReply => self.on_snr_reply(input).await,
            State::TxReply1 => self.on_tx_reply_1(input).await,
            State::TxReply2 => self.on_tx_reply_2(input).await,
        }
    }

    async fn set_state(&self, state: State) {
        self.inner.lock().await.set_state(state);
    }

    async fn on_reset_req(&self) {
        tokio::time::sleep(Duration::from_secs(4)).await;
        self.send("sys get ver").await;
        self.set_state(State::GetVerReply).await;
    }

    async fn on_get_ver_reply(&self, input: &str) {
        if input.starts_with("RN2483") || input.starts_with("RN2903") {
            let mut inner = self.inner.lock().await;
            if inner.region.is_none() {
                inner.region = Region::from_version_banner(input);
            }
            drop(inner);
            self.send("sys reset").await;
            self.set_state(State::ResetReply).await;
        } else {
            tokio::time::sleep(Duration::from_secs(4)).await;
            self.send("sys get ver").await;
            // Stays in GetVerReply.
        }
    }

    async fn on_reset_reply(&self) {
        tokio::time::sleep(Duration::from_secs(4)).await;
        self.send("mac pause").await;
        self.set_state(State::MacPauseReply).await;
    }

    async fn on_mac_pause_reply(&self, input: &str) {
        if input.starts_with("RN") {
            // Stale echo of a previous reset banner; absorb and wait.
            return;
        }
        match input.trim().parse::<i64>() {
            Ok(ticks) if ticks >= MAC_PAUSE_MIN_TICKS => {
                self.send("sys get hweui").await;
                self.set_state(State::GetEuiReply).await;
            }
            _ => warn!(reply = input, "unexpected mac pause reply, waiting"),
        }
    }

    async fn on_get_eui_reply(&self, input: &str) {
        let hweui = input.trim().to_string();
        {
            let mut inner = self.inner.lock().await;
            inner.hweui = hweui.clone();
        }
        *self.router_ctx.gateway_id.lock().expect("mutex poisoned") = hweui;
        self.send("radio set wdt 54321").await;
        self.set_state(State::SetWdtReply).await;
    }

    /// Iterates the region's frequency/power commands one per reply; once
    /// exhausted, falls straight through into starting the receive cycle
    /// without waiting for another line.
    async fn on_set_wdt_reply(self: &Arc<Self>) {
        tokio::time::sleep(Duration::from_millis(100)).await;

        let next = {
            let mut inner = self.inner.lock().await;
            if inner.region_commands.is_none() {
                if let Some(region) = inner.region {
                    inner.region_commands = Some(region.setup_commands().into());
                }
            }
            inner.region_commands.as_mut().and_then(VecDeque::pop_front)
        };

        match next {
            Some(command) => {
                self.send(&command).await;
                // Stays in SetWdtReply, awaiting this command's "ok".
            }
            None => {
                tokio::time::sleep(Duration::from_secs(4)).await;
                self.restart_receive().await;
            }
        }
    }

    async fn on_rcv_reply(self: &Arc<Self>, input: &str) {
        if input == "ok" {
            return;
        }
        if input == "radio_err" {
            if !self.send_pending_outbound().await {
                self.restart_receive().await;
            }
            return;
        }
        if input == "busy" {
            self.on_busy().await;
            return;
        }
        if let Some(hex_payload) = input.strip_prefix("radio_rx") {
            let hex_payload: String = hex_payload.chars().filter(|c| !c.is_whitespace()).collect();
            {
                let mut inner = self.inner.lock().await;
                inner.pending_payload_hex = hex_payload;
            }
            self.send("radio get snr").await;
            self.set_state(State::SnrReply).await;
            return;
        }
        warn!(reply = input, "unrecognized reply in RCV_REPLY, forcing reinit");
        self.reinit().await;
    }

    async fn on_snr_reply(self: &Arc<Self>, input: &str) {
        let snr: f32 = input.trim().parse().unwrap_or(crate::telecast::INVALID_SNR);
        let hex_payload = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut inner.pending_payload_hex)
        };

        self.decode_and_route(&hex_payload, snr).await;

        if !self.send_pending_outbound().await {
            self.restart_receive().await;
        }
    }

    async fn decode_and_route(&self, hex_payload: &str, snr: f32) {
        let bytes = hex::decode(hex_payload);
        match frame::parse(&bytes) {
            frame::FrameResult::Single { payload, legacy } => {
                if legacy {
                    warn!("accepted legacy single-message frame (tag 0x08)");
                }
                match Telecast::decode(payload.as_slice()) {
                    Ok(msg) => router::route(msg, snr, legacy, &self.router_ctx).await,
                    Err(e) => warn!(error = %e, "dropping malformed protobuf payload"),
                }
            }
            frame::FrameResult::Dropped(reason) => {
                info!(?reason, "dropped framed payload");
            }
        }
    }

    async fn on_tx_reply_1(self: &Arc<Self>, input: &str) {
        match input {
            "ok" => self.set_state(State::TxReply2).await,
            "busy" => self.on_busy().await,
            _ => self.restart_receive().await,
        }
    }

    async fn on_tx_reply_2(self: &Arc<Self>, input: &str) {
        if input == "radio_tx_ok" {
            if !self.send_pending_outbound().await {
                self.restart_receive().await;
            }
        } else {
            self.restart_receive().await;
        }
    }

    /// A `busy` reply restarts receive like any other error path, but the
    /// busy counter must survive that restart so ten consecutive busies
    /// can actually accumulate — unlike the plain `restart_receive()`
    /// used elsewhere, which deliberately zeroes the counter because it's
    /// only called once a non-busy exchange has completed successfully.
    async fn on_busy(self: &Arc<Self>) {
        tokio::time::sleep(Duration::from_secs(5)).await;
        self.send("radio rx 0").await;
        self.set_state(State::RcvReply).await;

        let busy_count = {
            let mut inner = self.inner.lock().await;
            inner.busy_count += 1;
            inner.busy_count
        };

        if busy_count >= BUSY_LIMIT {
            warn!(busy_count, "too many consecutive busy replies, forcing reinit");
            self.reinit().await;
        }
    }

    /// Sends `radio rx 0`, resets the busy counter, and enters RCV_REPLY.
    async fn restart_receive(&self) {
        self.send("radio rx 0").await;
        self.inner.lock().await.busy_count = 0;
        self.set_state(State::RcvReply).await;
    }

    /// If there's a queued command, dequeue and transmit it, returning
    /// `true` and transitioning to TX_REPLY_1. Otherwise returns `false`
    /// so the caller restarts receive instead.
    ///
    /// Before consulting the queue: if a device was recently seen and the
    /// cloud service is considered unreachable, synthesize a one-shot
    /// "service down" notification addressed to it, so the device can
    /// fail over to cellular.
    async fn send_pending_outbound(&self) -> bool {
        self.maybe_synthesize_service_down().await;

        let next = self.queue_rx.lock().await.try_recv();
        match next {
            Some(OutboundCommand(bytes)) => {
                let command = format!("radio tx {}", hex::encode(&bytes));
                self.send(&command).await;
                self.inner.lock().await.busy_count = 0;
                self.set_state(State::TxReply1).await;
                true
            }
            None => false,
        }
    }

    async fn maybe_synthesize_service_down(&self) {
        let last_device = self.router_ctx.last_device.swap(0, Ordering::Relaxed);
        if last_device == 0 {
            return;
        }

        let should_fire = {
            let mut inner = self.inner.lock().await;
            let forced = std::mem::take(&mut inner.force_service_down);
            forced || !self.router_ctx.service.is_reachable()
        };

        if !should_fire {
            // Not actually down: restore the slot for the next check.
            self.router_ctx.last_device.store(last_device, Ordering::Relaxed);
            return;
        }

        let msg = Telecast {
            device_type: DeviceType::Ttserve as i32,
            device_id: last_device,
            message: "down".to_string(),
            ..Default::default()
        };
        let mut buf = Vec::with_capacity(msg.encoded_len());
        if msg.encode(&mut buf).is_ok() {
            info!(device_id = last_device, "synthesizing service-down notification");
            self.queue_tx.enqueue(OutboundCommand(buf));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize};
    use std::sync::Mutex as StdMutex;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::queue;
    use crate::radio::gpio::FakeResetLine;
    use crate::service::ServiceClient;
    use crate::snapshot::SnapshotStore;

    #[test]
    fn mac_pause_reply_threshold() {
        assert!(MAC_PAUSE_MIN_TICKS <= 4_294_967_245);
    }

    fn test_router_ctx() -> RouterContext {
        RouterContext {
            queue: queue::channel().0,
            service: Arc::new(ServiceClient::new("example.invalid".to_string())),
            snapshot: Arc::new(SnapshotStore::new()),
            location: Arc::from(""),
            latitude: None,
            longitude: None,
            altitude: None,
            gateway_id: Arc::new(StdMutex::new(String::new())),
            last_device: Arc::new(AtomicU32::new(0)),
            messages_received: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Pulls the next written command off the wire, stripping the
    /// trailing `\r\n` that [`SerialWriter::send_command`] appends.
    async fn next_command(written: &mut UnboundedReceiver<Vec<u8>>) -> String {
        let bytes = written.recv().await.expect("writer channel closed");
        String::from_utf8(bytes).expect("command was not utf8").trim_end().to_string()
    }

    /// Drives a fresh machine through a clean init-to-first-receive
    /// scenario and returns it parked in `RCV_REPLY`, along with
    /// its write-side channel and reset-pulse counter for further driving.
    async fn machine_at_rcv_reply() -> (Arc<CommandStateMachine>, UnboundedReceiver<Vec<u8>>, Arc<AtomicUsize>) {
        let (writer, mut written) = SerialWriter::for_test();
        let (gpio, pulses) = FakeResetLine::new();
        let (queue_tx, queue_rx) = queue::channel();
        let sm = CommandStateMachine::new(writer, Box::new(gpio), queue_tx, queue_rx, test_router_ctx(), None, false);

        sm.init().await;
        assert_eq!(next_command(&mut written).await, "sys get ver");

        sm.process("RN2903 1.0.0".to_string()).await;
        assert_eq!(next_command(&mut written).await, "sys reset");

        // The transceiver reboots and reprints its banner; the reply's
        // content doesn't matter here, only that a line arrived.
        sm.process("RN2903 1.0.0".to_string()).await;
        assert_eq!(next_command(&mut written).await, "mac pause");

        sm.process("4294967245".to_string()).await;
        assert_eq!(next_command(&mut written).await, "sys get hweui");

        sm.process("0004A30B001C0530".to_string()).await;
        assert_eq!(next_command(&mut written).await, "radio set wdt 54321");

        sm.process("ok".to_string()).await;
        assert_eq!(next_command(&mut written).await, "radio set mod lora");
        sm.process("ok".to_string()).await;
        assert_eq!(next_command(&mut written).await, "radio set freq 915000000");
        sm.process("ok".to_string()).await;
        assert_eq!(next_command(&mut written).await, "radio set pwr 20");
        sm.process("ok".to_string()).await;
        assert_eq!(next_command(&mut written).await, "radio rx 0");

        (sm, written, pulses)
    }

    #[tokio::test(start_paused = true)]
    async fn clean_init_infers_region_and_reaches_receive() {
        let (sm, _written, pulses) = machine_at_rcv_reply().await;

        let identity = sm.identity().await;
        assert_eq!(identity.hweui, "0004A30B001C0530");
        assert_eq!(identity.region, Some(Region::Us915));
        assert_eq!(pulses.load(Ordering::SeqCst), 1, "init's one reinit should pulse reset exactly once");
    }

    #[tokio::test(start_paused = true)]
    async fn eu868_banner_programs_eu_frequency() {
        let (writer, mut written) = SerialWriter::for_test();
        let (gpio, _pulses) = FakeResetLine::new();
        let (queue_tx, queue_rx) = queue::channel();
        let sm = CommandStateMachine::new(writer, Box::new(gpio), queue_tx, queue_rx, test_router_ctx(), None, false);

        sm.init().await;
        next_command(&mut written).await;
        sm.process("RN2483 1.0.0".to_string()).await;
        next_command(&mut written).await;
        sm.process("RN2483 1.0.0".to_string()).await;
        next_command(&mut written).await;
        sm.process("4294967245".to_string()).await;
        next_command(&mut written).await;
        sm.process("0011223344556677".to_string()).await;
        next_command(&mut written).await;
        sm.process("ok".to_string()).await;
        assert_eq!(next_command(&mut written).await, "radio set mod lora");
        sm.process("ok".to_string()).await;
        assert_eq!(next_command(&mut written).await, "radio set freq 868100000");
        sm.process("ok".to_string()).await;
        assert_eq!(next_command(&mut written).await, "radio set pwr 15");
    }

    #[tokio::test(start_paused = true)]
    async fn receive_snr_dispatch_restarts_receive_when_queue_empty() {
        let (sm, mut written, _pulses) = machine_at_rcv_reply().await;

        // Empty-payload array frame: tag 0x00, count 1, len 0.
        sm.process("radio_rx 000100".to_string()).await;
        assert_eq!(next_command(&mut written).await, "radio get snr");

        sm.process("-7".to_string()).await;
        // Nothing was queued for transmit, so receive restarts.
        assert_eq!(next_command(&mut written).await, "radio rx 0");
    }

    #[tokio::test(start_paused = true)]
    async fn queued_outbound_is_sent_before_restarting_receive() {
        let (sm, mut written, _pulses) = machine_at_rcv_reply().await;
        sm.enqueue_outbound(vec![0xAA, 0xBB]);

        sm.process("radio_rx 000100".to_string()).await;
        assert_eq!(next_command(&mut written).await, "radio get snr");

        sm.process("-7".to_string()).await;
        assert_eq!(next_command(&mut written).await, "radio tx AABB");

        sm.process("ok".to_string()).await;
        sm.process("radio_tx_ok".to_string()).await;
        assert_eq!(next_command(&mut written).await, "radio rx 0");
    }

    #[tokio::test(start_paused = true)]
    async fn busy_replies_accumulate_across_retries_and_force_reinit() {
        let (sm, mut written, pulses) = machine_at_rcv_reply().await;
        assert_eq!(pulses.load(Ordering::SeqCst), 1);

        for _ in 0..(BUSY_LIMIT - 1) {
            sm.process("busy".to_string()).await;
            assert_eq!(next_command(&mut written).await, "radio rx 0");
        }
        assert_eq!(pulses.load(Ordering::SeqCst), 1, "nine busies must not yet trigger a reinit");

        sm.process("busy".to_string()).await;
        assert_eq!(next_command(&mut written).await, "radio rx 0");
        // The tenth busy crosses BUSY_LIMIT and forces a full reinit.
        assert_eq!(next_command(&mut written).await, "sys get ver");
        assert_eq!(pulses.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_service_synthesizes_service_down_before_next_outbound() {
        let (sm, mut written, _pulses) = machine_at_rcv_reply().await;

        // Force the synthesis path without waiting out the real 60-minute
        // debounce, the same escape hatch `DEBUG_FAILOVER` gives operators.
        {
            let mut inner = sm.inner.lock().await;
            inner.force_service_down = true;
        }

        // Array frame wrapping a bare `device_id = 42` message, so routing
        // it is what naturally sets `last_device` to 42.
        sm.process("radio_rx 000102102A".to_string()).await;
        assert_eq!(next_command(&mut written).await, "radio get snr");

        sm.process("-7".to_string()).await;
        // A "down" notification for device 42 was queued ahead of restarting
        // receive, so it goes out as the very next transmit.
        assert_eq!(next_command(&mut written).await, "radio tx 0807102A1A04646F776E");
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognized_reply_in_rcv_reply_forces_reinit() {
        let (sm, mut written, pulses) = machine_at_rcv_reply().await;

        sm.process("garbled nonsense".to_string()).await;
        assert_eq!(next_command(&mut written).await, "sys get ver");
        assert_eq!(pulses.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_state_forces_reinit_after_three_unchanged_ticks() {
        let (sm, mut written, pulses) = machine_at_rcv_reply().await;

        sm.on_state_change_tick().await;
        sm.on_state_change_tick().await;
        assert_eq!(pulses.load(Ordering::SeqCst), 1, "two unchanged ticks only warn");

        sm.on_state_change_tick().await;
        assert_eq!(pulses.load(Ordering::SeqCst), 2, "a third unchanged tick forces reinit");
        assert_eq!(next_command(&mut written).await, "sys get ver");
    }

    #[tokio::test(start_paused = true)]
    async fn set_state_between_ticks_resets_the_stall_counter() {
        let (sm, _written, pulses) = machine_at_rcv_reply().await;

        sm.on_state_change_tick().await;
        sm.on_state_change_tick().await;
        assert_eq!(pulses.load(Ordering::SeqCst), 1, "two unchanged ticks only warn");

        // A healthy machine re-entering RCV_REPLY via restart_receive()
        // counts as progress even though the state value doesn't change.
        sm.set_state(State::RcvReply).await;

        sm.on_state_change_tick().await;
        sm.on_state_change_tick().await;
        assert_eq!(
            pulses.load(Ordering::SeqCst),
            1,
            "set_state reset the counter, so no reinit yet"
        );
    }
}
