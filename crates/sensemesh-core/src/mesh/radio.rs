//! Radio I/O adapter
//!
//! The radio raises interrupts for "transmission complete" and "packet
//! received" (or "receive failed"). Interrupt context must stay bounded, so
//! the handlers only flip flags and hand the payload over a one-slot
//! channel; the main loop does all decoding and queue work.
//!
//! ```text
//!   interrupt context                    main loop
//!   ─────────────────                    ─────────
//!   on_receive_ready(bytes) ──┐
//!     rx_enabled? swap false  │ bounded(1)
//!     else: event lost        └────────► poll_received()
//!                                          begin_receive()  (re-arm)
//!                                          rx_enabled = true
//!   on_transmit_complete() ───► tx_done ─► poll_transmit_complete()
//!                                          begin_receive()
//! ```
//!
//! Receive delivery is single-flight: after one event is handed over,
//! further receive interrupts are dropped until the main loop drains it
//! and re-arms. Dropped events are counted, not hidden.

use super::traits::{MeshError, MeshResult};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{trace, warn};

/// Non-zero status code reported by a radio driver
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("driver status {0}")]
pub struct DriverError(pub i32);

/// Result of asking the driver to start a transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitStatus {
    /// The frame is on its way; completion arrives as an interrupt
    Accepted,
    /// The radio cannot take a frame right now
    Busy,
    /// The driver rejected the request
    Error(DriverError),
}

/// Why a reception failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveErrorKind {
    CrcMismatch,
    Driver(i32),
}

impl fmt::Display for ReceiveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiveErrorKind::CrcMismatch => write!(f, "CRC mismatch"),
            ReceiveErrorKind::Driver(code) => write!(f, "driver status {}", code),
        }
    }
}

/// Event handed from interrupt context to the main loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxEvent {
    Frame(Vec<u8>),
    Error(ReceiveErrorKind),
}

/// Driver primitives the adapter builds on
///
/// Both calls are non-blocking. Outcomes of an accepted transmit or an
/// armed receive are reported later through the [`InterruptHandle`].
pub trait RadioDriver {
    /// Store the handle the driver's interrupt routine will call into
    fn attach_interrupts(&mut self, irq: InterruptHandle);

    /// Start sending `payload`
    fn begin_transmit(&mut self, payload: &[u8]) -> TransmitStatus;

    /// Put the radio into receive mode
    fn begin_receive(&mut self) -> Result<(), DriverError>;
}

#[derive(Debug)]
struct IrqShared {
    tx_done: AtomicBool,
    rx_enabled: AtomicBool,
    events_lost: AtomicU64,
    rx_slot: Sender<RxEvent>,
}

/// Interrupt-side endpoint; safe to call from any thread or ISR context
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    shared: Arc<IrqShared>,
}

impl InterruptHandle {
    fn new(rx_slot: Sender<RxEvent>) -> Self {
        Self {
            shared: Arc::new(IrqShared {
                tx_done: AtomicBool::new(false),
                rx_enabled: AtomicBool::new(false),
                events_lost: AtomicU64::new(0),
                rx_slot,
            }),
        }
    }

    /// The last accepted transmission finished
    pub fn on_transmit_complete(&self) {
        self.shared.tx_done.store(true, Ordering::Release);
    }

    /// A frame arrived
    pub fn on_receive_ready(&self, payload: Vec<u8>) {
        self.deliver(RxEvent::Frame(payload));
    }

    /// A reception failed
    pub fn on_receive_error(&self, kind: ReceiveErrorKind) {
        self.deliver(RxEvent::Error(kind));
    }

    /// Whether a receive event would currently be accepted
    pub fn is_receive_enabled(&self) -> bool {
        self.shared.rx_enabled.load(Ordering::Acquire)
    }

    /// Receive events dropped because the previous one was still undrained
    pub fn events_lost(&self) -> u64 {
        self.shared.events_lost.load(Ordering::Relaxed)
    }

    fn deliver(&self, event: RxEvent) {
        if !self.shared.rx_enabled.swap(false, Ordering::AcqRel) {
            self.shared.events_lost.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.shared.rx_slot.try_send(event).is_err() {
            self.shared.events_lost.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn enable_receive(&self) {
        self.shared.rx_enabled.store(true, Ordering::Release);
    }

    fn take_tx_done(&self) -> bool {
        self.shared.tx_done.swap(false, Ordering::AcqRel)
    }
}

/// Main-loop side of the radio
#[derive(Debug)]
pub struct RadioAdapter<D> {
    driver: D,
    irq: InterruptHandle,
    rx_events: Receiver<RxEvent>,
    transmitting: bool,
}

impl<D: RadioDriver> RadioAdapter<D> {
    /// Wrap `driver` and attach the interrupt handle to it
    pub fn new(mut driver: D) -> Self {
        let (tx, rx) = bounded(1);
        let irq = InterruptHandle::new(tx);
        driver.attach_interrupts(irq.clone());
        Self {
            driver,
            irq,
            rx_events: rx,
            transmitting: false,
        }
    }

    /// Enter receive mode for the first time
    pub fn start(&mut self) -> MeshResult<()> {
        self.driver
            .begin_receive()
            .map_err(|e| MeshError::RadioInit(e.to_string()))?;
        self.irq.enable_receive();
        Ok(())
    }

    /// Try to start sending a frame
    ///
    /// Returns `Busy` without touching the driver while a previous
    /// transmission is still in progress.
    pub fn transmit(&mut self, payload: &[u8]) -> TransmitStatus {
        if self.transmitting {
            return TransmitStatus::Busy;
        }
        let status = self.driver.begin_transmit(payload);
        match status {
            TransmitStatus::Accepted => {
                self.transmitting = true;
                trace!(len = payload.len(), "Transmission started");
            }
            TransmitStatus::Busy => trace!("Radio busy"),
            TransmitStatus::Error(e) => warn!(error = %e, "Transmit failed"),
        }
        status
    }

    /// Take the pending receive event, if any, and re-arm reception
    ///
    /// A driver that refuses to re-enter receive mode leaves the node deaf,
    /// which is reported as [`MeshError::RadioFatal`].
    pub fn poll_received(&mut self) -> MeshResult<Option<RxEvent>> {
        match self.rx_events.try_recv() {
            Ok(event) => {
                self.rearm_receive()?;
                Ok(Some(event))
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    /// Consume a transmit-complete event; returns true if there was one
    pub fn poll_transmit_complete(&mut self) -> MeshResult<bool> {
        if !self.irq.take_tx_done() {
            return Ok(false);
        }
        self.transmitting = false;
        self.driver
            .begin_receive()
            .map_err(|e| MeshError::RadioFatal(format!("receive after transmit: {}", e)))?;
        Ok(true)
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting
    }

    pub fn events_lost(&self) -> u64 {
        self.irq.events_lost()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    fn rearm_receive(&mut self) -> MeshResult<()> {
        self.driver
            .begin_receive()
            .map_err(|e| MeshError::RadioFatal(format!("receive re-arm: {}", e)))?;
        self.irq.enable_receive();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeDriver {
        irq: Option<InterruptHandle>,
        sent: Vec<Vec<u8>>,
        statuses: VecDeque<TransmitStatus>,
        receive_results: VecDeque<Result<(), DriverError>>,
        receive_calls: usize,
    }

    impl RadioDriver for FakeDriver {
        fn attach_interrupts(&mut self, irq: InterruptHandle) {
            self.irq = Some(irq);
        }

        fn begin_transmit(&mut self, payload: &[u8]) -> TransmitStatus {
            let status = self.statuses.pop_front().unwrap_or(TransmitStatus::Accepted);
            if status == TransmitStatus::Accepted {
                self.sent.push(payload.to_vec());
            }
            status
        }

        fn begin_receive(&mut self) -> Result<(), DriverError> {
            self.receive_calls += 1;
            self.receive_results.pop_front().unwrap_or(Ok(()))
        }
    }

    fn started() -> (RadioAdapter<FakeDriver>, InterruptHandle) {
        let mut adapter = RadioAdapter::new(FakeDriver::default());
        adapter.start().unwrap();
        let irq = adapter.driver().irq.clone().unwrap();
        (adapter, irq)
    }

    #[test]
    fn test_start_failure_is_radio_init() {
        let mut driver = FakeDriver::default();
        driver.receive_results.push_back(Err(DriverError(-2)));
        let mut adapter = RadioAdapter::new(driver);
        assert!(matches!(adapter.start(), Err(MeshError::RadioInit(_))));
    }

    #[test]
    fn test_receive_is_single_flight() {
        let (mut adapter, irq) = started();

        irq.on_receive_ready(b"3,1000".to_vec());
        irq.on_receive_ready(b"3,2000".to_vec());
        assert!(!irq.is_receive_enabled());
        assert_eq!(adapter.events_lost(), 1);

        let event = adapter.poll_received().unwrap();
        assert_eq!(event, Some(RxEvent::Frame(b"3,1000".to_vec())));
        assert!(irq.is_receive_enabled());
        assert_eq!(adapter.poll_received().unwrap(), None);
    }

    #[test]
    fn test_receive_error_is_delivered() {
        let (mut adapter, irq) = started();
        irq.on_receive_error(ReceiveErrorKind::CrcMismatch);
        assert_eq!(
            adapter.poll_received().unwrap(),
            Some(RxEvent::Error(ReceiveErrorKind::CrcMismatch))
        );
    }

    #[test]
    fn test_rearm_failure_is_fatal() {
        let (mut adapter, irq) = started();
        adapter.driver_mut().receive_results.push_back(Err(DriverError(-7)));
        irq.on_receive_ready(b"0".to_vec());
        assert!(matches!(
            adapter.poll_received(),
            Err(MeshError::RadioFatal(_))
        ));
    }

    #[test]
    fn test_transmit_busy_until_complete() {
        let (mut adapter, irq) = started();
        assert_eq!(adapter.transmit(b"0"), TransmitStatus::Accepted);
        assert!(adapter.is_transmitting());
        assert_eq!(adapter.transmit(b"3,1000"), TransmitStatus::Busy);
        assert_eq!(adapter.driver().sent.len(), 1);

        assert!(!adapter.poll_transmit_complete().unwrap());
        irq.on_transmit_complete();
        let calls_before = adapter.driver().receive_calls;
        assert!(adapter.poll_transmit_complete().unwrap());
        assert_eq!(adapter.driver().receive_calls, calls_before + 1);
        assert_eq!(adapter.transmit(b"3,1000"), TransmitStatus::Accepted);
    }

    #[test]
    fn test_transmit_error_leaves_radio_idle() {
        let (mut adapter, _irq) = started();
        adapter
            .driver_mut()
            .statuses
            .push_back(TransmitStatus::Error(DriverError(-5)));
        assert_eq!(
            adapter.transmit(b"0"),
            TransmitStatus::Error(DriverError(-5))
        );
        assert!(!adapter.is_transmitting());
    }
}
