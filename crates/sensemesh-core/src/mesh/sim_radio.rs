//! In-process radio driver for simulation and tests
//!
//! [`SimRadio`] is the driver half, owned by a node's [`RadioAdapter`].
//! [`SimRadioHandle`] is the "air" half: whoever holds it picks up frames
//! the node transmitted, decides when they finish, and injects received
//! frames or receive errors through the node's interrupt handle.
//!
//! [`RadioAdapter`]: super::radio::RadioAdapter

use super::radio::{DriverError, InterruptHandle, RadioDriver, ReceiveErrorKind, TransmitStatus};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Debug, Default)]
struct SimRadioState {
    irq: Option<InterruptHandle>,
    on_air: Option<Vec<u8>>,
    transmitting: bool,
    receiving: bool,
    sent: Vec<Vec<u8>>,
    transmit_script: VecDeque<TransmitStatus>,
    receive_failures: VecDeque<DriverError>,
}

/// Simulated radio driver
#[derive(Debug)]
pub struct SimRadio {
    state: Rc<RefCell<SimRadioState>>,
}

/// Test/simulator side of a [`SimRadio`]
#[derive(Debug, Clone)]
pub struct SimRadioHandle {
    state: Rc<RefCell<SimRadioState>>,
}

impl SimRadio {
    /// Create a driver and the handle that controls it
    pub fn new() -> (SimRadio, SimRadioHandle) {
        let state = Rc::new(RefCell::new(SimRadioState::default()));
        (
            SimRadio {
                state: Rc::clone(&state),
            },
            SimRadioHandle { state },
        )
    }
}

impl RadioDriver for SimRadio {
    fn attach_interrupts(&mut self, irq: InterruptHandle) {
        self.state.borrow_mut().irq = Some(irq);
    }

    fn begin_transmit(&mut self, payload: &[u8]) -> TransmitStatus {
        let mut state = self.state.borrow_mut();
        match state.transmit_script.pop_front() {
            Some(TransmitStatus::Accepted) | None => {}
            Some(other) => return other,
        }
        if state.transmitting {
            return TransmitStatus::Busy;
        }
        state.transmitting = true;
        state.receiving = false;
        state.on_air = Some(payload.to_vec());
        state.sent.push(payload.to_vec());
        TransmitStatus::Accepted
    }

    fn begin_receive(&mut self) -> Result<(), DriverError> {
        let mut state = self.state.borrow_mut();
        if let Some(err) = state.receive_failures.pop_front() {
            state.receiving = false;
            return Err(err);
        }
        state.receiving = true;
        Ok(())
    }
}

impl SimRadioHandle {
    /// Take the frame the node started transmitting, if any
    pub fn take_transmission(&self) -> Option<Vec<u8>> {
        self.state.borrow_mut().on_air.take()
    }

    /// Finish the current transmission and raise the completion interrupt
    pub fn complete_transmission(&self) {
        let irq = {
            let mut state = self.state.borrow_mut();
            if !state.transmitting {
                return;
            }
            state.transmitting = false;
            state.irq.clone()
        };
        if let Some(irq) = irq {
            irq.on_transmit_complete();
        }
    }

    pub fn is_transmitting(&self) -> bool {
        self.state.borrow().transmitting
    }

    /// Whether the radio is in receive mode
    pub fn is_listening(&self) -> bool {
        let state = self.state.borrow();
        state.receiving && !state.transmitting
    }

    /// Offer a frame to the node
    ///
    /// Returns false when the radio is not listening (half duplex). A
    /// frame that reaches the interrupt may still be dropped there if the
    /// previous one has not been drained.
    pub fn deliver(&self, payload: &[u8]) -> bool {
        let irq = {
            let state = self.state.borrow();
            if !state.receiving || state.transmitting {
                return false;
            }
            state.irq.clone()
        };
        match irq {
            Some(irq) => {
                irq.on_receive_ready(payload.to_vec());
                true
            }
            None => false,
        }
    }

    /// Report a failed reception to the node
    pub fn deliver_error(&self, kind: ReceiveErrorKind) {
        let irq = self.state.borrow().irq.clone();
        if let Some(irq) = irq {
            irq.on_receive_error(kind);
        }
    }

    /// Make the next `begin_transmit` return `status`
    pub fn script_transmit(&self, status: TransmitStatus) {
        self.state.borrow_mut().transmit_script.push_back(status);
    }

    /// Make the next `begin_receive` fail with `code`
    pub fn fail_next_receive(&self, code: i32) {
        self.state
            .borrow_mut()
            .receive_failures
            .push_back(DriverError(code));
    }

    /// Every frame accepted for transmission so far
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.state.borrow().sent.clone()
    }

    /// Sent frames rendered as text records
    pub fn sent_records(&self) -> Vec<String> {
        self.state
            .borrow()
            .sent
            .iter()
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
            .collect()
    }
}
