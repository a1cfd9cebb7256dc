//! Bridge-side load session.
//!
//! [`Connection`] is a pure transition function: it never touches the UART,
//! GPIO or timers itself. Each call returns the [`Action`]s the event loop must
//! perform, in order. The loop guarantees that timer expiries and receive
//! callbacks are delivered one at a time, so no locking is needed.

use thiserror::Error;
use tracing::{debug, info, warn};

use super::link::{PropellerLink, TargetLink};
use super::source::{ImageSource, ImageStream};
use super::state::LoadState;
use crate::protocol::LoadType;
use crate::protocol::constants::*;

/// HTTP-style status of a successful transfer.
pub const STATUS_OK: u16 = 200;
/// HTTP-style status of a failed or rejected transfer.
pub const STATUS_BAD_REQUEST: u16 = 400;

/// Parameters of one transfer.
#[derive(Debug)]
pub struct LoadRequest {
    pub reset_pin: u8,
    pub baud_rate: u32,
    pub final_baud_rate: u32,
    pub load_type: LoadType,
    /// `None` or an empty source only pulses reset.
    pub source: Option<ImageSource>,
    /// Bytes of program output to capture after a successful load.
    pub response_size: usize,
    pub response_timeout: u32,
}

impl LoadRequest {
    pub fn new(source: ImageSource) -> Self {
        Self {
            source: Some(source),
            ..Self::reset()
        }
    }

    /// A request that only pulses the reset line.
    pub fn reset() -> Self {
        Self {
            reset_pin: DEFAULT_RESET_PIN,
            baud_rate: DEFAULT_INITIAL_BAUD_RATE,
            final_baud_rate: DEFAULT_INITIAL_BAUD_RATE,
            load_type: LoadType::RUN,
            source: None,
            response_size: 0,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_reset_pin(mut self, pin: u8) -> Self {
        self.reset_pin = pin;
        self
    }

    pub fn with_baud_rates(mut self, initial: u32, final_rate: u32) -> Self {
        self.baud_rate = initial;
        self.final_baud_rate = final_rate;
        self
    }

    pub fn with_load_type(mut self, load_type: LoadType) -> Self {
        self.load_type = load_type;
        self
    }

    pub fn with_response(mut self, size: usize, timeout_ms: u32) -> Self {
        self.response_size = size;
        self.response_timeout = timeout_ms;
        self
    }

    pub fn is_reset_only(&self) -> bool {
        self.source.as_ref().is_none_or(ImageSource::is_empty)
    }

    pub fn validate(&self) -> Result<(), StartError> {
        if self.baud_rate == 0 {
            return Err(StartError::Invalid("baud-rate must be non-zero".into()));
        }
        if self.final_baud_rate == 0 {
            return Err(StartError::Invalid("final-baud-rate must be non-zero".into()));
        }
        if self.response_size > MAX_RESPONSE_SIZE {
            return Err(StartError::Invalid(format!(
                "response-size {} exceeds {}",
                self.response_size, MAX_RESPONSE_SIZE
            )));
        }
        if !self.is_reset_only() && self.load_type == LoadType::SHUTDOWN {
            return Err(StartError::Invalid("load type shutdown cannot carry an image".into()));
        }
        Ok(())
    }
}

/// Why a start request was refused. Nothing was done to the hardware.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    #[error("Transfer already in progress: state {0}")]
    Busy(&'static str),
    #[error("Invalid request: {0}")]
    Invalid(String),
}

impl StartError {
    pub fn status(&self) -> u16 {
        STATUS_BAD_REQUEST
    }
}

/// Terminal result of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub status: u16,
    pub message: String,
    /// Captured program output, if requested.
    pub response: Vec<u8>,
}

impl LoadOutcome {
    pub fn success(response: Vec<u8>) -> Self {
        Self {
            status: STATUS_OK,
            message: "OK".into(),
            response,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_BAD_REQUEST,
            message: message.into(),
            response: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Inputs from the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    /// The single-shot timer fired.
    TimerExpired,
    /// Bytes arrived on the target serial line.
    Received(&'a [u8]),
}

/// Side effects for the event loop to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SetPin { pin: u8, high: bool },
    SetBaudRate(u32),
    Transmit(Vec<u8>),
    /// Arm (or re-arm) the single-shot timer.
    ArmTimer(u32),
    DisarmTimer,
    AttachReceiver,
    DetachReceiver,
    Complete(LoadOutcome),
}

/// One long-lived load session.
pub struct Connection<L: TargetLink = PropellerLink> {
    link: L,
    state: LoadState,
    reset_pin: u8,
    reset_asserted: bool,
    baud_rate: u32,
    final_baud_rate: u32,
    load_type: LoadType,
    stream: Option<ImageStream>,
    retries_remaining: u32,
    retry_delay: u32,
    rx_buffer: [u8; RX_RESPONSE_SIZE],
    rx_count: usize,
    response_size: usize,
    response_timeout: u32,
    response: Vec<u8>,
}

impl Default for Connection<PropellerLink> {
    fn default() -> Self {
        Self::new(PropellerLink::new())
    }
}

impl<L: TargetLink> Connection<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            state: LoadState::Idle,
            reset_pin: DEFAULT_RESET_PIN,
            reset_asserted: false,
            baud_rate: DEFAULT_INITIAL_BAUD_RATE,
            final_baud_rate: DEFAULT_INITIAL_BAUD_RATE,
            load_type: LoadType::RUN,
            stream: None,
            retries_remaining: 0,
            retry_delay: CHECKSUM_POLL_INTERVAL,
            rx_buffer: [0; RX_RESPONSE_SIZE],
            rx_count: 0,
            response_size: 0,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            response: Vec::new(),
        }
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Image bytes not yet handed to the link.
    pub fn remaining(&self) -> usize {
        self.stream.as_ref().map_or(0, ImageStream::remaining)
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    /// Begin a transfer.
    ///
    /// Refused without side effects when a transfer is already running or the
    /// request is malformed.
    pub fn start(&mut self, request: LoadRequest) -> Result<Vec<Action>, StartError> {
        if !self.state.is_idle() {
            warn!(state = %self.state, "Start refused");
            return Err(StartError::Busy(self.state.name()));
        }
        request.validate()?;

        let reset_only = request.is_reset_only();
        self.reset_pin = request.reset_pin;
        self.reset_asserted = false;
        self.baud_rate = request.baud_rate;
        self.final_baud_rate = request.final_baud_rate;
        self.load_type = request.load_type;
        self.stream = match request.source {
            Some(source) if !reset_only => Some(ImageStream::new(source)),
            _ => None,
        };
        self.retries_remaining = 0;
        self.retry_delay = CHECKSUM_POLL_INTERVAL;
        self.rx_count = 0;
        self.response_size = request.response_size;
        self.response_timeout = request.response_timeout;
        self.response.clear();

        info!(
            reset_pin = self.reset_pin,
            baud_rate = self.baud_rate,
            final_baud_rate = self.final_baud_rate,
            size = self.remaining(),
            load_type = %self.load_type,
            "Starting transfer"
        );

        let mut actions = Vec::new();
        if self.stream.is_some() {
            actions.push(Action::SetBaudRate(self.baud_rate));
            actions.push(Action::AttachReceiver);
        }
        actions.push(Action::SetPin {
            pin: self.reset_pin,
            high: true,
        });
        actions.push(Action::ArmTimer(RESET_DELAY_1));
        self.goto(LoadState::Reset);
        Ok(actions)
    }

    pub fn handle_event(&mut self, event: Event<'_>) -> Vec<Action> {
        let mut actions = Vec::new();
        match event {
            Event::TimerExpired => self.on_timer(&mut actions),
            Event::Received(data) => self.on_receive(data, &mut actions),
        }
        actions
    }

    fn on_timer(&mut self, actions: &mut Vec<Action>) {
        match self.state {
            LoadState::Idle => debug!("Stray timer expiry"),
            LoadState::Reset if !self.reset_asserted => {
                self.reset_asserted = true;
                actions.push(Action::SetPin {
                    pin: self.reset_pin,
                    high: false,
                });
                actions.push(Action::ArmTimer(RESET_DELAY_2));
            }
            LoadState::Reset => {
                actions.push(Action::SetPin {
                    pin: self.reset_pin,
                    high: true,
                });
                if self.stream.is_none() {
                    self.finish(LoadOutcome::success(Vec::new()), actions);
                } else {
                    actions.push(Action::ArmTimer(RESET_DELAY_3));
                    self.goto(LoadState::TxHandshake);
                }
            }
            LoadState::TxHandshake => {
                let mut out = Vec::new();
                self.link.initiate_handshake(&mut out);
                actions.push(Action::Transmit(out));
                actions.push(Action::ArmTimer(RX_HANDSHAKE_TIMEOUT));
                self.goto(LoadState::RxHandshakeStart);
            }
            LoadState::RxHandshakeStart | LoadState::RxHandshake => {
                self.abort("RX handshake timeout", actions);
            }
            LoadState::LoadContinue => {
                let mut out = Vec::new();
                let result = match self.stream.as_mut() {
                    Some(stream) => self.link.load_image_continue(stream, self.load_type, &mut out),
                    None => Ok(true),
                };
                match result {
                    Ok(finished) => {
                        actions.push(Action::Transmit(out));
                        if finished {
                            self.begin_checksum_poll(actions);
                        } else {
                            actions.push(Action::ArmTimer(LOAD_SEGMENT_DELAY));
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Load continue failed");
                        self.abort("Load image failed", actions);
                    }
                }
            }
            LoadState::VerifyChecksum => {
                if self.retries_remaining > 0 {
                    self.retries_remaining -= 1;
                    actions.push(Action::Transmit(vec![CHECKSUM_POLL_BYTE]));
                    actions.push(Action::ArmTimer(self.retry_delay));
                } else {
                    self.abort("Checksum timeout", actions);
                }
            }
            LoadState::StartAck => self.abort("Response timeout", actions),
        }
    }

    fn on_receive(&mut self, data: &[u8], actions: &mut Vec<Action>) {
        match self.state {
            LoadState::RxHandshakeStart => {
                let sentinel = self.link.response_sentinel();
                if let Some(pos) = data.iter().position(|&b| b == sentinel) {
                    if pos > 0 {
                        debug!(discarded = pos, "Skipped bytes before handshake response");
                    }
                    self.goto(LoadState::RxHandshake);
                    self.receive_handshake(&data[pos..], actions);
                }
            }
            LoadState::RxHandshake => self.receive_handshake(data, actions),
            LoadState::VerifyChecksum => {
                let Some((&first, rest)) = data.split_first() else {
                    return;
                };
                if first != CHECKSUM_OK {
                    warn!(byte = first, "Checksum rejected");
                    self.abort("Checksum error", actions);
                } else if self.response_size > 0 {
                    actions.push(Action::ArmTimer(self.response_timeout));
                    self.goto(LoadState::StartAck);
                    self.receive_response(rest, actions);
                } else {
                    self.finish(LoadOutcome::success(Vec::new()), actions);
                }
            }
            LoadState::StartAck => self.receive_response(data, actions),
            _ => debug!(state = %self.state, len = data.len(), "Ignoring received bytes"),
        }
    }

    fn receive_handshake(&mut self, data: &[u8], actions: &mut Vec<Action>) {
        let expected = self.link.response_len().min(RX_RESPONSE_SIZE);
        let n = (expected - self.rx_count).min(data.len());
        self.rx_buffer[self.rx_count..self.rx_count + n].copy_from_slice(&data[..n]);
        self.rx_count += n;
        if self.rx_count < expected {
            return;
        }

        match self.link.verify_handshake_response(&self.rx_buffer[..expected]) {
            Ok(version) => info!(version, "Target handshake complete"),
            Err(e) => {
                warn!(error = %e, "Handshake verification failed");
                self.abort("RX handshake failed", actions);
                return;
            }
        }

        let mut out = Vec::new();
        let result = match self.stream.as_mut() {
            Some(stream) => self.link.load_image(stream, self.load_type, &mut out),
            None => Ok(true),
        };
        match result {
            Ok(finished) => {
                actions.push(Action::Transmit(out));
                if finished {
                    self.begin_checksum_poll(actions);
                } else {
                    actions.push(Action::ArmTimer(LOAD_SEGMENT_DELAY));
                    self.goto(LoadState::LoadContinue);
                }
            }
            Err(e) => {
                warn!(error = %e, "Load image failed");
                self.abort("Load image failed", actions);
            }
        }
    }

    fn receive_response(&mut self, data: &[u8], actions: &mut Vec<Action>) {
        let n = (self.response_size - self.response.len()).min(data.len());
        self.response.extend_from_slice(&data[..n]);
        if self.response.len() == self.response_size {
            let response = std::mem::take(&mut self.response);
            self.finish(LoadOutcome::success(response), actions);
        }
    }

    fn begin_checksum_poll(&mut self, actions: &mut Vec<Action>) {
        let mut budget = RX_CHECKSUM_TIMEOUT;
        if self.load_type.programs() {
            budget += EEPROM_PROGRAM_TIMEOUT + EEPROM_VERIFY_TIMEOUT;
        }
        self.retry_delay = CHECKSUM_POLL_INTERVAL;
        self.retries_remaining = budget / self.retry_delay;
        actions.push(Action::ArmTimer(self.retry_delay));
        self.goto(LoadState::VerifyChecksum);
    }

    fn abort(&mut self, message: &str, actions: &mut Vec<Action>) {
        warn!(state = %self.state, reason = message, "Transfer aborted");
        self.finish(LoadOutcome::failure(message), actions);
    }

    fn finish(&mut self, outcome: LoadOutcome, actions: &mut Vec<Action>) {
        actions.push(Action::DisarmTimer);
        actions.push(Action::DetachReceiver);
        let loaded = self.stream.take().is_some();
        if outcome.is_success() && loaded && self.final_baud_rate != self.baud_rate {
            actions.push(Action::SetBaudRate(self.final_baud_rate));
        }
        info!(status = outcome.status, reason = %outcome.message, "Transfer finished");
        actions.push(Action::Complete(outcome));
        self.rx_count = 0;
        self.retries_remaining = 0;
        self.goto(LoadState::Idle);
    }

    fn goto(&mut self, next: LoadState) {
        debug!(from = %self.state, to = %next, "State transition");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::source::ImageFile;
    use std::io::{self, Cursor, Read};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TrackedFile {
        data: Cursor<Vec<u8>>,
        closed: Arc<AtomicBool>,
        fail: bool,
    }

    impl TrackedFile {
        fn new(data: Vec<u8>, closed: Arc<AtomicBool>) -> Self {
            Self {
                data: Cursor::new(data),
                closed,
                fail: false,
            }
        }
    }

    impl Read for TrackedFile {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.fail {
                return Err(io::Error::other("flash read error"));
            }
            self.data.read(buf)
        }
    }

    impl ImageFile for TrackedFile {
        fn size(&self) -> usize {
            self.data.get_ref().len()
        }
    }

    impl Drop for TrackedFile {
        fn drop(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn image(len: usize) -> ImageSource {
        ImageSource::memory((0..len).map(|i| i as u8).collect::<Vec<u8>>())
    }

    fn timer(conn: &mut Connection) -> Vec<Action> {
        conn.handle_event(Event::TimerExpired)
    }

    fn outcome(actions: &[Action]) -> Option<&LoadOutcome> {
        actions.iter().find_map(|a| match a {
            Action::Complete(o) => Some(o),
            _ => None,
        })
    }

    fn touches_timer(actions: &[Action]) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, Action::ArmTimer(_) | Action::DisarmTimer))
    }

    /// Drive a connection through reset into RxHandshakeStart.
    fn to_handshake(conn: &mut Connection, request: LoadRequest) {
        conn.start(request).unwrap();
        timer(conn);
        timer(conn);
        assert_eq!(conn.state(), LoadState::TxHandshake);
        timer(conn);
        assert_eq!(conn.state(), LoadState::RxHandshakeStart);
    }

    fn response(conn: &Connection) -> Vec<u8> {
        conn.link().expected_response(P8X32A_VERSION)
    }

    #[test]
    fn test_start_actions() {
        let mut conn = Connection::default();
        let actions = conn
            .start(LoadRequest::new(image(16)).with_reset_pin(5).with_baud_rates(115_200, 921_600))
            .unwrap();
        assert_eq!(
            actions,
            vec![
                Action::SetBaudRate(115_200),
                Action::AttachReceiver,
                Action::SetPin { pin: 5, high: true },
                Action::ArmTimer(RESET_DELAY_1),
            ]
        );
        assert_eq!(conn.state(), LoadState::Reset);
    }

    #[test]
    fn test_full_load() {
        let mut conn = Connection::default();
        let request = LoadRequest::new(image(64)).with_baud_rates(115_200, 921_600);
        conn.start(request).unwrap();

        let pulse_low = timer(&mut conn);
        assert_eq!(
            pulse_low,
            vec![
                Action::SetPin { pin: DEFAULT_RESET_PIN, high: false },
                Action::ArmTimer(RESET_DELAY_2),
            ]
        );
        let pulse_high = timer(&mut conn);
        assert_eq!(pulse_high[1], Action::ArmTimer(RESET_DELAY_3));

        let handshake = timer(&mut conn);
        assert!(matches!(&handshake[0], Action::Transmit(bytes) if bytes[0] == CALIBRATION_BYTE));
        assert_eq!(handshake[1], Action::ArmTimer(RX_HANDSHAKE_TIMEOUT));

        let mut rx = vec![0x00, 0x55, 0xF0];
        rx.extend(response(&conn));
        let load = conn.handle_event(Event::Received(&rx));
        assert!(matches!(&load[0], Action::Transmit(bytes) if !bytes.is_empty()));
        assert_eq!(load[1], Action::ArmTimer(CHECKSUM_POLL_INTERVAL));
        assert_eq!(conn.state(), LoadState::VerifyChecksum);

        let poll = timer(&mut conn);
        assert_eq!(
            poll,
            vec![
                Action::Transmit(vec![CHECKSUM_POLL_BYTE]),
                Action::ArmTimer(CHECKSUM_POLL_INTERVAL),
            ]
        );

        let done = conn.handle_event(Event::Received(&[CHECKSUM_OK]));
        assert_eq!(
            done,
            vec![
                Action::DisarmTimer,
                Action::DetachReceiver,
                Action::SetBaudRate(921_600),
                Action::Complete(LoadOutcome::success(Vec::new())),
            ]
        );
        assert!(conn.state().is_idle());
    }

    #[test]
    fn test_handshake_split_across_events() {
        let mut conn = Connection::default();
        to_handshake(&mut conn, LoadRequest::new(image(8)));
        let rx = response(&conn);

        assert!(conn.handle_event(Event::Received(&rx[..1])).is_empty());
        assert_eq!(conn.state(), LoadState::RxHandshake);
        assert!(conn.handle_event(Event::Received(&rx[1..60])).is_empty());
        let actions = conn.handle_event(Event::Received(&rx[60..]));
        assert!(touches_timer(&actions));
        assert_eq!(conn.state(), LoadState::VerifyChecksum);
    }

    #[test]
    fn test_noise_without_sentinel_is_discarded() {
        let mut conn = Connection::default();
        to_handshake(&mut conn, LoadRequest::new(image(8)));
        assert!(conn.handle_event(Event::Received(&[0x00, 0x11, 0x22])).is_empty());
        assert_eq!(conn.state(), LoadState::RxHandshakeStart);
    }

    #[test]
    fn test_reset_only() {
        let mut conn = Connection::default();
        let start = conn.start(LoadRequest::reset()).unwrap();
        assert!(!start.contains(&Action::AttachReceiver));

        let mut delays = 0;
        for a in start.iter().chain(timer(&mut conn).iter()) {
            if matches!(a, Action::ArmTimer(_)) {
                delays += 1;
            }
        }
        let last = timer(&mut conn);
        assert_eq!(delays, 2);
        assert_eq!(outcome(&last), Some(&LoadOutcome::success(Vec::new())));
        assert!(!last.iter().any(|a| matches!(a, Action::SetBaudRate(_))));
        assert!(conn.state().is_idle());
    }

    #[test]
    fn test_empty_image_is_reset_only() {
        let mut conn = Connection::default();
        conn.start(LoadRequest::new(image(0))).unwrap();
        timer(&mut conn);
        let last = timer(&mut conn);
        assert!(outcome(&last).unwrap().is_success());
    }

    #[test]
    fn test_rx_handshake_timeout() {
        let mut conn = Connection::default();
        to_handshake(&mut conn, LoadRequest::new(image(8)));
        let actions = timer(&mut conn);
        assert_eq!(actions[0], Action::DisarmTimer);
        assert_eq!(actions[1], Action::DetachReceiver);
        let o = outcome(&actions).unwrap();
        assert_eq!(o.status, STATUS_BAD_REQUEST);
        assert_eq!(o.message, "RX handshake timeout");
        assert!(conn.state().is_idle());
    }

    #[test]
    fn test_timeout_mid_handshake() {
        let mut conn = Connection::default();
        to_handshake(&mut conn, LoadRequest::new(image(8)));
        let rx = response(&conn);
        conn.handle_event(Event::Received(&rx[..10]));
        let o = timer(&mut conn);
        assert_eq!(outcome(&o).unwrap().message, "RX handshake timeout");
    }

    #[test]
    fn test_handshake_mismatch_aborts() {
        let mut conn = Connection::default();
        to_handshake(&mut conn, LoadRequest::new(image(8)));
        let mut rx = response(&conn);
        rx[40] ^= 0x20;
        let actions = conn.handle_event(Event::Received(&rx));
        assert_eq!(outcome(&actions).unwrap().message, "RX handshake failed");
        assert!(actions.contains(&Action::DetachReceiver));
        assert!(conn.state().is_idle());
    }

    #[test]
    fn test_busy_does_not_disturb_transfer() {
        let mut conn = Connection::default();
        to_handshake(&mut conn, LoadRequest::new(image(4096)));
        let rx = response(&conn);
        let actions = conn.handle_event(Event::Received(&rx));
        assert_eq!(actions.last(), Some(&Action::ArmTimer(LOAD_SEGMENT_DELAY)));
        assert_eq!(conn.state(), LoadState::LoadContinue);

        let remaining = conn.remaining();
        let retries = conn.retries_remaining();
        assert_eq!(
            conn.start(LoadRequest::reset()),
            Err(StartError::Busy("LoadContinue"))
        );
        assert_eq!(conn.state(), LoadState::LoadContinue);
        assert_eq!(conn.remaining(), remaining);
        assert_eq!(conn.retries_remaining(), retries);

        // Transfer carries on.
        let mut segments = 0;
        while conn.state() == LoadState::LoadContinue {
            let actions = timer(&mut conn);
            assert!(touches_timer(&actions));
            segments += 1;
        }
        assert!(segments > 1);
        assert_eq!(conn.state(), LoadState::VerifyChecksum);
        assert_eq!(conn.remaining(), 0);
    }

    #[test]
    fn test_segment_sizes_bounded() {
        let mut conn = Connection::default();
        to_handshake(&mut conn, LoadRequest::new(image(2048)));
        let rx = response(&conn);
        conn.handle_event(Event::Received(&rx));
        while conn.state() == LoadState::LoadContinue {
            for action in timer(&mut conn) {
                if let Action::Transmit(bytes) = action {
                    assert!(bytes.len() <= LOAD_SEGMENT_MAX_SIZE);
                }
            }
        }
    }

    #[test]
    fn test_checksum_error() {
        let mut conn = Connection::default();
        to_handshake(&mut conn, LoadRequest::new(image(8)));
        let rx = response(&conn);
        conn.handle_event(Event::Received(&rx));
        let actions = conn.handle_event(Event::Received(&[0x00]));
        assert_eq!(outcome(&actions).unwrap().message, "Checksum error");
        assert!(conn.state().is_idle());
    }

    #[test]
    fn test_checksum_poll_budget() {
        let mut conn = Connection::default();
        to_handshake(&mut conn, LoadRequest::new(image(8)));
        let rx = response(&conn);
        conn.handle_event(Event::Received(&rx));
        assert_eq!(conn.retries_remaining(), RX_CHECKSUM_TIMEOUT / CHECKSUM_POLL_INTERVAL);

        let mut polls = 0;
        loop {
            let actions = timer(&mut conn);
            if let Some(o) = outcome(&actions) {
                assert_eq!(o.message, "Checksum timeout");
                break;
            }
            polls += 1;
        }
        assert_eq!(polls, 25);
    }

    #[test]
    fn test_program_extends_checksum_budget() {
        let mut conn = Connection::default();
        to_handshake(
            &mut conn,
            LoadRequest::new(image(8)).with_load_type(LoadType::PROGRAM_AND_RUN),
        );
        let rx = response(&conn);
        conn.handle_event(Event::Received(&rx));
        assert_eq!(conn.retries_remaining(), (250 + 5000 + 2000) / 10);
    }

    #[test]
    fn test_response_capture() {
        let mut conn = Connection::default();
        to_handshake(&mut conn, LoadRequest::new(image(8)).with_response(3, 500));
        let rx = response(&conn);
        conn.handle_event(Event::Received(&rx));

        let actions = conn.handle_event(Event::Received(&[CHECKSUM_OK, b'o', b'k']));
        assert_eq!(actions, vec![Action::ArmTimer(500)]);
        assert_eq!(conn.state(), LoadState::StartAck);

        let actions = conn.handle_event(Event::Received(b"!?"));
        let o = outcome(&actions).unwrap();
        assert_eq!(o.status, STATUS_OK);
        assert_eq!(o.response, b"ok!");
        assert!(conn.state().is_idle());
    }

    #[test]
    fn test_response_timeout() {
        let mut conn = Connection::default();
        to_handshake(&mut conn, LoadRequest::new(image(8)).with_response(4, 500));
        let rx = response(&conn);
        conn.handle_event(Event::Received(&rx));
        conn.handle_event(Event::Received(&[CHECKSUM_OK]));
        let actions = timer(&mut conn);
        assert_eq!(outcome(&actions).unwrap().message, "Response timeout");
    }

    #[test]
    fn test_file_closed_on_abort() {
        let closed = Arc::new(AtomicBool::new(false));
        let file = TrackedFile::new(vec![1; 64], closed.clone());
        let mut conn = Connection::default();
        to_handshake(&mut conn, LoadRequest::new(ImageSource::file(file)));
        assert!(!closed.load(Ordering::SeqCst));
        timer(&mut conn);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_file_closed_on_success() {
        let closed = Arc::new(AtomicBool::new(false));
        let file = TrackedFile::new(vec![1; 64], closed.clone());
        let mut conn = Connection::default();
        to_handshake(&mut conn, LoadRequest::new(ImageSource::file(file)));
        let rx = response(&conn);
        conn.handle_event(Event::Received(&rx));
        let actions = conn.handle_event(Event::Received(&[CHECKSUM_OK]));
        assert!(outcome(&actions).unwrap().is_success());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_file_read_failure() {
        let closed = Arc::new(AtomicBool::new(false));
        let mut file = TrackedFile::new(vec![1; 64], closed.clone());
        file.fail = true;
        let mut conn = Connection::default();
        to_handshake(&mut conn, LoadRequest::new(ImageSource::file(file)));
        let rx = response(&conn);
        let actions = conn.handle_event(Event::Received(&rx));
        assert_eq!(outcome(&actions).unwrap().message, "Load image failed");
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_invalid_requests_have_no_side_effects() {
        let mut conn = Connection::default();
        let bad = [
            LoadRequest::new(image(8)).with_baud_rates(0, 115_200),
            LoadRequest::new(image(8)).with_baud_rates(115_200, 0),
            LoadRequest::new(image(8)).with_response(MAX_RESPONSE_SIZE + 1, 100),
            LoadRequest::new(image(8)).with_load_type(LoadType::SHUTDOWN),
        ];
        for request in bad {
            let err = conn.start(request).unwrap_err();
            assert!(matches!(err, StartError::Invalid(_)));
            assert_eq!(err.status(), 400);
            assert!(conn.state().is_idle());
        }
    }

    #[test]
    fn test_reusable_after_abort() {
        let mut conn = Connection::default();
        to_handshake(&mut conn, LoadRequest::new(image(8)));
        timer(&mut conn);
        to_handshake(&mut conn, LoadRequest::new(image(8)));
        let rx = response(&conn);
        conn.handle_event(Event::Received(&rx));
        assert_eq!(conn.state(), LoadState::VerifyChecksum);
    }

    #[test]
    fn test_every_transition_touches_timer() {
        let mut conn = Connection::default();
        let start = conn.start(LoadRequest::new(image(2048)).with_response(1, 100)).unwrap();
        assert!(touches_timer(&start));
        for _ in 0..3 {
            assert!(touches_timer(&timer(&mut conn)));
        }
        let rx = response(&conn);
        assert!(touches_timer(&conn.handle_event(Event::Received(&rx))));
        while conn.state() == LoadState::LoadContinue {
            assert!(touches_timer(&timer(&mut conn)));
        }
        assert!(touches_timer(&timer(&mut conn)));
        assert!(touches_timer(&conn.handle_event(Event::Received(&[CHECKSUM_OK]))));
        assert!(touches_timer(&conn.handle_event(Event::Received(&[0x42]))));
        assert!(conn.state().is_idle());
    }

    #[test]
    fn test_idle_ignores_events() {
        let mut conn = Connection::default();
        assert!(timer(&mut conn).is_empty());
        assert!(conn.handle_event(Event::Received(&[1, 2, 3])).is_empty());
    }

    #[test]
    fn test_reset_and_settle_ignore_input() {
        let mut conn = Connection::default();
        conn.start(LoadRequest::new(image(32))).unwrap();

        assert!(conn.handle_event(Event::Received(&[0xF9, 0xFE])).is_empty());
        assert_eq!(conn.state(), LoadState::Reset);

        timer(&mut conn);
        assert_eq!(conn.state(), LoadState::Reset);
        assert!(conn.handle_event(Event::Received(&[0x00])).is_empty());
        assert_eq!(conn.state(), LoadState::Reset);

        timer(&mut conn);
        assert_eq!(conn.state(), LoadState::TxHandshake);
        let noise = response(&conn);
        assert!(conn.handle_event(Event::Received(&noise)).is_empty());
        assert_eq!(conn.state(), LoadState::TxHandshake);

        // Noise before the handshake must not count toward the response.
        let handshake = timer(&mut conn);
        assert!(matches!(&handshake[0], Action::Transmit(bytes) if bytes[0] == CALIBRATION_BYTE));
        assert_eq!(conn.state(), LoadState::RxHandshakeStart);
        let load = conn.handle_event(Event::Received(&response(&conn)));
        assert!(matches!(&load[0], Action::Transmit(bytes) if !bytes.is_empty()));
        assert_eq!(conn.state(), LoadState::VerifyChecksum);
    }
}
