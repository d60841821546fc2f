//! Request/response exchanges over a live transport.
//!
//! Each operation moves the controller `Idle → AwaitingResponse` and then to
//! `Completed`, `TimedOut` or `Failed`. While awaiting a frame the controller
//! races four conditions:
//! - the driver's cancel signal (explicit disconnect)
//! - the transport's drop signal
//! - the operation window
//! - the read loop filling the frame
//!
//! The first to resolve wins and the others are dropped, which releases the
//! pending read.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::assembler::{Endianness, PacketAssembler, FRAME_BYTES};
use crate::config::{AcquisitionTimeouts, DriverConfig};
use crate::errors::{AcquisitionError, ProtocolError, TransportError};
use crate::logging::DiagnosticLog;
use crate::protocol::{unframe, Command, Dialect};
use crate::spectrum::Spectrum;
use crate::transport::Transport;

/// Longest single read while listening passively.
const LISTEN_SLICE: Duration = Duration::from_millis(100);

/// Read window used to drain stale input before a command.
const FLUSH_SLICE: Duration = Duration::from_millis(20);
/// Upper bound on reads spent draining stale input.
const FLUSH_MAX_READS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    AwaitingResponse,
    Completed,
    TimedOut,
    Failed,
}

enum Race {
    Cancelled,
    LinkDown,
    Deadline,
    Filled(Result<(), TransportError>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Completed(Spectrum),
    TimedOut { received: usize },
    Failed(AcquisitionError),
}

/// Resolve once `rx` holds `true`. Never resolves if the sender is gone.
pub(crate) async fn raised(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Read until `assembler` holds a full frame.
async fn fill(
    transport: &mut dyn Transport,
    assembler: &mut PacketAssembler,
    slice: Duration,
) -> Result<(), TransportError> {
    while !assembler.is_complete() {
        let bytes = transport.read(slice).await?;
        assembler.append(&bytes);
    }
    Ok(())
}

/// Discard whatever is already queued on the link.
///
/// Returns the number of bytes dropped. Bounded by [`FLUSH_MAX_READS`] so a
/// chattering device cannot stall the caller.
pub async fn flush_input(transport: &mut dyn Transport, log: &DiagnosticLog) -> usize {
    let mut dropped = 0;
    for _ in 0..FLUSH_MAX_READS {
        match transport.read(FLUSH_SLICE).await {
            Ok(bytes) if !bytes.is_empty() => dropped += bytes.len(),
            _ => break,
        }
    }
    if dropped > 0 {
        log.debug(format!("flushed {dropped} stale bytes"));
    }
    dropped
}

/// Listen for up to `window`, logging every fragment.
///
/// Returns everything received. Stops early if the link drops.
pub async fn listen(transport: &mut dyn Transport, window: Duration, log: &DiagnosticLog) -> Vec<u8> {
    let deadline = Instant::now() + window;
    let mut link = transport.link_state();
    let mut received = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::select! {
            biased;
            _ = raised(&mut link) => {
                log.warn("link dropped while listening");
                break;
            }
            read = transport.read(remaining.min(LISTEN_SLICE)) => match read {
                Ok(bytes) if !bytes.is_empty() => {
                    log.rx(&bytes);
                    received.extend_from_slice(&bytes);
                }
                Ok(_) => {}
                Err(e) => {
                    log.warn(format!("listen aborted: {e}"));
                    break;
                }
            }
        }
    }
    received
}

pub struct AcquisitionController {
    dialect: Dialect,
    endianness: Endianness,
    timeouts: AcquisitionTimeouts,
    assembler: PacketAssembler,
    state: AcquisitionState,
    last_received: usize,
    log: DiagnosticLog,
}

impl AcquisitionController {
    pub fn new(config: &DriverConfig, log: DiagnosticLog) -> Self {
        Self {
            dialect: config.effective_dialect(),
            endianness: config.endianness,
            timeouts: config.timeouts.clone(),
            assembler: PacketAssembler::new(),
            state: AcquisitionState::Idle,
            last_received: 0,
            log,
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Bytes received by the most recent frame acquisition, complete or not.
    pub fn last_received(&self) -> usize {
        self.last_received
    }

    pub fn timeouts(&self) -> &AcquisitionTimeouts {
        &self.timeouts
    }

    /// Encode and write `cmd`. Does not wait for an answer.
    pub async fn send(
        &mut self,
        transport: &mut dyn Transport,
        cmd: Command,
    ) -> Result<(), ProtocolError> {
        if !transport.is_alive() {
            return Err(ProtocolError::NotConnected);
        }
        let bytes = cmd.encode(self.dialect);
        match transport.write(&bytes).await {
            Ok(()) => {
                self.log.tx(cmd.label);
                Ok(())
            }
            Err(e) => {
                self.log.error(format!("Error TX {}: {e}", cmd.label));
                Err(e.into())
            }
        }
    }

    /// Send `cmd` and collect one 256-byte frame within the scan window.
    pub async fn acquire_frame(
        &mut self,
        transport: &mut dyn Transport,
        cmd: Command,
        cancel: &mut watch::Receiver<bool>,
    ) -> FrameOutcome {
        self.assembler.reset();
        self.last_received = 0;
        self.state = AcquisitionState::AwaitingResponse;

        if transport.is_alive() {
            flush_input(transport, &self.log).await;
        }
        if let Err(e) = self.send(transport, cmd).await {
            self.state = AcquisitionState::Failed;
            return FrameOutcome::Failed(AcquisitionError::WriteFailure(e.to_string()));
        }

        let window = self.timeouts.scan();
        let mut link = transport.link_state();
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        let race = tokio::select! {
            biased;
            _ = raised(cancel) => Race::Cancelled,
            _ = raised(&mut link) => Race::LinkDown,
            _ = &mut deadline => Race::Deadline,
            filled = fill(transport, &mut self.assembler, window) => Race::Filled(filled),
        };

        let outcome = match race {
            Race::Cancelled => FrameOutcome::Failed(AcquisitionError::Cancelled),
            Race::LinkDown | Race::Filled(Err(TransportError::Disconnected)) => {
                FrameOutcome::Failed(AcquisitionError::UnexpectedDisconnect)
            }
            Race::Deadline => FrameOutcome::TimedOut {
                received: self.assembler.len(),
            },
            Race::Filled(Err(e)) => {
                FrameOutcome::Failed(AcquisitionError::ReadFailure(e.to_string()))
            }
            Race::Filled(Ok(())) => match self.assembler.drain_as_spectrum(self.endianness) {
                Some(spectrum) => FrameOutcome::Completed(spectrum),
                None => FrameOutcome::Failed(AcquisitionError::ReadFailure(
                    "frame incomplete after read loop".into(),
                )),
            },
        };

        match outcome {
            FrameOutcome::Completed(spectrum) => {
                self.last_received = FRAME_BYTES;
                self.state = AcquisitionState::Completed;
                self.log.info(format!("Scan OK: {FRAME_BYTES} bytes."));
                FrameOutcome::Completed(spectrum)
            }
            FrameOutcome::TimedOut { received } => {
                self.last_received = received;
                self.assembler.reset();
                self.state = AcquisitionState::TimedOut;
                self.log.warn(format!(
                    "{} ({})",
                    AcquisitionError::Timeout {
                        window_ms: window.as_millis() as u64
                    },
                    AcquisitionError::PartialFrame {
                        received,
                        expected: FRAME_BYTES
                    }
                ));
                FrameOutcome::TimedOut { received }
            }
            FrameOutcome::Failed(reason) => {
                self.last_received = self.assembler.len();
                self.assembler.reset();
                self.state = AcquisitionState::Failed;
                self.log.error(format!(
                    "Acquisition failed: {reason} ({}/{FRAME_BYTES} bytes)",
                    self.last_received
                ));
                FrameOutcome::Failed(reason)
            }
        }
    }

    pub async fn scan(
        &mut self,
        transport: &mut dyn Transport,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<Spectrum> {
        match self.acquire_frame(transport, Command::scan(), cancel).await {
            FrameOutcome::Completed(spectrum) => Some(spectrum),
            _ => None,
        }
    }

    /// Best effort: `false` if the command could not be written.
    pub async fn set_lamp(&mut self, transport: &mut dyn Transport, on: bool) -> bool {
        self.single(transport, Command::lamp(on)).await
    }

    pub async fn warm_up(&mut self, transport: &mut dyn Transport) -> bool {
        self.single(transport, Command::warm_up()).await
    }

    /// Ask for the firmware version and log whatever comes back.
    pub async fn query_version(
        &mut self,
        transport: &mut dyn Transport,
        cancel: &mut watch::Receiver<bool>,
    ) -> bool {
        if transport.is_alive() {
            flush_input(transport, &self.log).await;
        }
        if !self.single(transport, Command::version()).await {
            return false;
        }
        let window = self.timeouts.system_info();
        let reply = self.listen_cancellable(transport, window, cancel).await;
        if reply.is_empty() {
            self.log.warn(format!(
                "{}",
                AcquisitionError::Timeout {
                    window_ms: window.as_millis() as u64
                }
            ));
            return false;
        }
        let text = String::from_utf8_lossy(unframe(&reply)).trim().to_string();
        if !text.is_empty() {
            self.log.info(format!("Version: {text}"));
        }
        true
    }

    /// Passive listen; `true` if any byte arrived.
    pub async fn sniff(
        &mut self,
        transport: &mut dyn Transport,
        window: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> bool {
        self.log.info(format!("Sniffing for {} ms...", window.as_millis()));
        let got = !self.listen_cancellable(transport, window, cancel).await.is_empty();
        if !got {
            self.log.info("Sniff: no bytes received.");
        }
        got
    }

    async fn listen_cancellable(
        &mut self,
        transport: &mut dyn Transport,
        window: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Vec<u8> {
        self.state = AcquisitionState::AwaitingResponse;
        let log = self.log.clone();
        let received = tokio::select! {
            biased;
            _ = raised(cancel) => None,
            bytes = listen(transport, window, &log) => Some(bytes),
        };
        match received {
            Some(bytes) => {
                self.state = if bytes.is_empty() {
                    AcquisitionState::TimedOut
                } else {
                    AcquisitionState::Completed
                };
                bytes
            }
            None => {
                self.state = AcquisitionState::Failed;
                Vec::new()
            }
        }
    }

    async fn single(&mut self, transport: &mut dyn Transport, cmd: Command) -> bool {
        match self.send(transport, cmd).await {
            Ok(()) => {
                self.state = AcquisitionState::Completed;
                true
            }
            Err(_) => {
                self.state = AcquisitionState::Failed;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn controller(config: &DriverConfig) -> AcquisitionController {
        AcquisitionController::new(config, DiagnosticLog::default())
    }

    fn frame() -> Vec<u8> {
        (0..FRAME_BYTES).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn scan_reassembles_fragmented_frame() {
        let config = DriverConfig::default();
        let mut ctl = controller(&config);
        let (mut transport, handle) = MockTransport::pair("scan");
        handle.reply_to(b"S".to_vec(), frame(), 20);
        let (_tx, mut cancel) = watch::channel(false);

        let spectrum = ctl.scan(&mut transport, &mut cancel).await.unwrap();
        assert_eq!(ctl.state(), AcquisitionState::Completed);
        assert_eq!(ctl.last_received(), FRAME_BYTES);
        assert_eq!(spectrum.raw()[0], u16::from_le_bytes([0, 1]));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_times_out_at_the_window() {
        let config = DriverConfig::default();
        let mut ctl = controller(&config);
        let (mut transport, _handle) = MockTransport::pair("silent");
        let (_tx, mut cancel) = watch::channel(false);

        let start = Instant::now();
        let result = ctl.scan(&mut transport, &mut cancel).await;
        let elapsed = start.elapsed();

        assert!(result.is_none());
        assert_eq!(ctl.state(), AcquisitionState::TimedOut);
        assert_eq!(ctl.last_received(), 0);
        assert!(elapsed >= config.timeouts.scan(), "{elapsed:?}");
        assert!(elapsed < config.timeouts.scan() + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_frame_count_is_reported() {
        let config = DriverConfig::default();
        let mut ctl = controller(&config);
        let (mut transport, handle) = MockTransport::pair("partial");
        handle.reply_to(b"S".to_vec(), vec![1u8; 100], 64);
        let (_tx, mut cancel) = watch::channel(false);

        match ctl
            .acquire_frame(&mut transport, Command::scan(), &mut cancel)
            .await
        {
            FrameOutcome::TimedOut { received } => assert_eq!(received, 100),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(ctl.last_received(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn link_drop_fails_inflight_scan() {
        let config = DriverConfig::default();
        let mut ctl = controller(&config);
        let (mut transport, handle) = MockTransport::pair("drop");
        let (_tx, mut cancel) = watch::channel(false);

        let dropper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            handle.drop_link();
        });
        let start = Instant::now();
        let outcome = ctl
            .acquire_frame(&mut transport, Command::scan(), &mut cancel)
            .await;
        dropper.await.unwrap();

        assert_eq!(
            outcome,
            FrameOutcome::Failed(AcquisitionError::UnexpectedDisconnect)
        );
        assert_eq!(ctl.state(), AcquisitionState::Failed);
        assert!(start.elapsed() < config.timeouts.scan());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_signal_fails_inflight_scan() {
        let config = DriverConfig::default();
        let mut ctl = controller(&config);
        let (mut transport, _handle) = MockTransport::pair("cancel");
        let (tx, mut cancel) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
            // keep the sender alive past the send
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let outcome = ctl
            .acquire_frame(&mut transport, Command::scan(), &mut cancel)
            .await;
        assert_eq!(outcome, FrameOutcome::Failed(AcquisitionError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_resolves_without_waiting() {
        let config = DriverConfig::default();
        let mut ctl = controller(&config);
        let (mut transport, handle) = MockTransport::pair("wf");
        handle.fail_writes(true);
        let (_tx, mut cancel) = watch::channel(false);

        let start = Instant::now();
        assert!(ctl.scan(&mut transport, &mut cancel).await.is_none());
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(ctl.state(), AcquisitionState::Failed);
        assert!(!ctl.set_lamp(&mut transport, true).await);
    }

    #[tokio::test(start_paused = true)]
    async fn big_endian_configuration_is_honoured() {
        let config = DriverConfig::default().with_endianness(Endianness::Big);
        let mut ctl = controller(&config);
        let (mut transport, handle) = MockTransport::pair("be");
        handle.reply_to(b"S".to_vec(), frame(), FRAME_BYTES);
        let (_tx, mut cancel) = watch::channel(false);

        let spectrum = ctl.scan(&mut transport, &mut cancel).await.unwrap();
        assert_eq!(spectrum.raw()[0], 0x0001);
    }

    #[tokio::test(start_paused = true)]
    async fn version_query_reads_framed_reply() {
        let config = DriverConfig::default();
        let mut ctl = controller(&config);
        let (mut transport, handle) = MockTransport::pair("v");
        handle.reply_to(b"V".to_vec(), vec![0x02, b'1', b'.', b'2', 0x03], 2);
        let (_tx, mut cancel) = watch::channel(false);

        assert!(ctl.query_version(&mut transport, &mut cancel).await);
        assert_eq!(handle.writes(), vec![b"V".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn sniff_reports_whether_anything_arrived() {
        let config = DriverConfig::default();
        let mut ctl = controller(&config);
        let (mut transport, handle) = MockTransport::pair("sniff");
        let (_tx, mut cancel) = watch::channel(false);

        assert!(!ctl.sniff(&mut transport, Duration::from_secs(1), &mut cancel).await);
        handle.push(vec![0xAB]);
        assert!(ctl.sniff(&mut transport, Duration::from_secs(1), &mut cancel).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_acknowledgement_is_not_glued_onto_the_frame() {
        let config = DriverConfig::default();
        let mut ctl = controller(&config);
        let (mut transport, handle) = MockTransport::pair("ack");
        handle.reply_to(Command::lamp(false).encode(Dialect::Ascii), b"V1.0".to_vec(), 4);
        handle.reply_to(b"S".to_vec(), frame(), 64);
        let (_tx, mut cancel) = watch::channel(false);

        assert!(ctl.set_lamp(&mut transport, false).await);
        let spectrum = ctl.scan(&mut transport, &mut cancel).await.unwrap();
        assert_eq!(spectrum.raw()[0], u16::from_le_bytes([0, 1]));
        assert_eq!(spectrum.raw()[1], u16::from_le_bytes([2, 3]));
    }

    #[tokio::test(start_paused = true)]
    async fn late_tail_of_a_timed_out_frame_is_discarded() {
        let config = DriverConfig::default();
        let mut ctl = controller(&config);
        let (mut transport, handle) = MockTransport::pair("tail");
        let (_tx, mut cancel) = watch::channel(false);

        assert!(ctl.scan(&mut transport, &mut cancel).await.is_none());
        handle.push(vec![0xEE; 10]);
        handle.reply_to(b"S".to_vec(), frame(), 64);

        let spectrum = ctl.scan(&mut transport, &mut cancel).await.unwrap();
        assert_eq!(spectrum.raw()[0], u16::from_le_bytes([0, 1]));
        assert_eq!(ctl.last_received(), FRAME_BYTES);
    }

    #[tokio::test(start_paused = true)]
    async fn version_query_ignores_earlier_replies() {
        let config = DriverConfig::default();
        let lines = std::sync::Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let captured = lines.clone();
        let log = DiagnosticLog::new(Some(crate::logging::LogSink::new(move |l| {
            captured.lock().unwrap().push(l.to_string())
        })));
        let mut ctl = AcquisitionController::new(&config, log);
        let (mut transport, handle) = MockTransport::pair("v-stale");
        handle.push(b"OLD".to_vec());
        handle.reply_to(b"V".to_vec(), b"1.2".to_vec(), 8);
        let (_tx, mut cancel) = watch::channel(false);

        assert!(ctl.query_version(&mut transport, &mut cancel).await);
        let lines = lines.lock().unwrap();
        assert!(lines.iter().any(|l| l == "Version: 1.2"), "{lines:?}");
        assert!(!lines.iter().any(|l| l.contains("OLD")), "{lines:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn lamp_and_warm_up_use_configured_dialect() {
        let config = DriverConfig::default().with_dialect(Dialect::Binary { etx: false });
        let mut ctl = controller(&config);
        let (mut transport, handle) = MockTransport::pair("lamp");

        assert!(ctl.set_lamp(&mut transport, true).await);
        assert!(ctl.warm_up(&mut transport).await);
        assert_eq!(
            handle.writes(),
            vec![vec![0x02, 0x03, 0x01, 0x00], b"W".to_vec()]
        );
    }
}
