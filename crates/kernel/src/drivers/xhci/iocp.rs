//! I/O completion packets.
//!
//! A submitter parks on an [`Iocp`] while the controller chews on its TRBs;
//! the event path completes it. One packet can span several expected
//! events (a TD whose fragments each raise one); the waiter runs only when
//! the last expected completion arrives.

use core::sync::atomic::{AtomicBool, Ordering};

use vesper_abi::Errno;

use crate::{
    thread::{WakeReason, condvar::CondVar},
    time,
    utils::locks::Mutex,
};

use super::trb::CompletionCode;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IocpResult {
    pub code: CompletionCode,
    /// Completion parameter from the event's status word.
    pub parameter: u32,
    pub slot_id: u8,
    /// Residual bytes of a transfer that completed short.
    pub remaining: u32,
}

impl IocpResult {
    const fn empty() -> Self {
        Self {
            code: CompletionCode::Invalid,
            parameter: 0,
            slot_id: 0,
            remaining: 0,
        }
    }

    pub fn status(&self) -> Result<(), Errno> {
        if self.code.is_success() {
            Ok(())
        } else {
            Err(self.code.as_errno())
        }
    }
}

#[derive(Debug)]
struct IocpState {
    result: IocpResult,
    /// Completions still outstanding; set by the submitter before the
    /// device can produce any.
    expected: u32,
    done: bool,
}

#[derive(Debug)]
pub struct Iocp {
    state: Mutex<IocpState>,
    completed: CondVar,
    cancelled: AtomicBool,
}

impl Iocp {
    pub fn new(expected: u32) -> Self {
        assert!(expected > 0);
        Self {
            state: Mutex::new(IocpState {
                result: IocpResult::empty(),
                expected,
                done: false,
            }),
            completed: CondVar::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Marks the packet abandoned; the event that eventually arrives is
    /// dropped silently.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Records one completion. The last expected one wakes the waiter.
    /// Later events overwrite earlier results, so the waiter observes the
    /// final (IOC) completion of its TD.
    pub fn invoke(&self, result: IocpResult) {
        if self.is_cancelled() {
            return;
        }

        let mut state = self.state.lock();
        state.result = result;
        state.expected = state.expected.saturating_sub(1);
        if state.expected == 0 {
            state.done = true;
            drop(state);
            self.completed.notify_all();
        }
    }

    /// Parks until the packet completes. `timeout_ms` of `None` waits
    /// forever; expiry cancels the packet and reports `Errno::TimedOut`.
    pub fn wait(&self, timeout_ms: Option<u64>) -> Result<IocpResult, Errno> {
        let deadline = timeout_ms.map(|ms| time::uptime_ms() + ms);

        let mut state = self.state.lock();
        while !state.done {
            let (reacquired, reason) = self.completed.wait_deadline(state, deadline);
            state = reacquired;
            if reason == WakeReason::TimedOut && !state.done {
                self.cancel();
                return Err(Errno::TimedOut);
            }
        }
        Ok(state.result)
    }

    /// Non-blocking probe used by poll paths.
    pub fn try_result(&self) -> Option<IocpResult> {
        let state = self.state.lock();
        state.done.then_some(state.result)
    }
}
