//! Debugger control of the execution loop.
//!
//! When a [`DebugStub`] is attached to a hart, every cycle first passes through a gate that decides
//! whether the instruction at `pc` may execute or control has to go to the debugger. The stub
//! drives the hart back through the primitives on [`Hart`]: [`Hart::read_memory_byte`],
//! [`Hart::write_memory_byte`], [`Hart::set_continue`], [`Hart::set_single_step`],
//! [`Hart::record_breakpoint`] and [`Hart::terminate_session`].

use crate::hart::{Halt, Hart};
use crate::Error;
use std::collections::HashMap;

/// Number of cycles between two polls of the stub for an asynchronous interrupt.
pub const POLL_INTERVAL: u64 = 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DebugState {
    /// Run until a breakpoint is reached or the debugger interrupts.
    Continuing,
    /// Execute one instruction, then stop.
    SteppingOne,
    /// Stopped at the given address, waiting for the debugger.
    BreakPending(u32),
}

/// Why control went back to the debugger.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StopReason {
    DoneStep,
    /// Reached a breakpoint of the given kind.
    Breakpoint(BreakpointKind),
    Interrupted,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BreakpointKind {
    Software,
    Hardware,
}

/// Outcome of the debug gate for one cycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Gate {
    /// Execute the instruction at `pc`.
    Run,
    /// Hand control to the debugger. `None` when the stop was already reported.
    Hold(Option<StopReason>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugControl {
    state: DebugState,
    breakpoints: HashMap<u32, BreakpointKind>,
}

impl DebugControl {
    /// Control starts stopped at `entry` so the debugger runs before the first instruction.
    pub fn new(entry: u32) -> Self {
        Self {
            state: DebugState::BreakPending(entry),
            breakpoints: HashMap::new(),
        }
    }

    pub fn state(&self) -> DebugState {
        self.state
    }

    pub fn set_continue(&mut self) {
        self.state = DebugState::Continuing;
    }

    pub fn set_single_step(&mut self) {
        self.state = DebugState::SteppingOne;
    }

    /// Returns `false` if a breakpoint was already recorded at `address`.
    pub fn record_breakpoint(&mut self, kind: BreakpointKind, address: u32) -> bool {
        self.breakpoints.insert(address, kind).is_none()
    }

    /// Returns `false` if there was no breakpoint of this kind at `address`.
    pub fn remove_breakpoint(&mut self, kind: BreakpointKind, address: u32) -> bool {
        if self.breakpoints.get(&address) == Some(&kind) {
            self.breakpoints.remove(&address);
            true
        } else {
            false
        }
    }

    pub fn is_breakpoint(&self, address: u32) -> bool {
        self.breakpoints.contains_key(&address)
    }

    /// Decides whether the instruction at `pc` may run.
    pub(crate) fn gate(&mut self, pc: u32) -> Gate {
        match self.state {
            DebugState::Continuing => match self.breakpoints.get(&pc) {
                Some(&kind) => {
                    self.state = DebugState::BreakPending(pc);
                    Gate::Hold(Some(StopReason::Breakpoint(kind)))
                }
                None => Gate::Run,
            },
            DebugState::SteppingOne => {
                self.state = DebugState::BreakPending(pc);
                Gate::Hold(Some(StopReason::DoneStep))
            }
            DebugState::BreakPending(_) => Gate::Hold(None),
        }
    }

    /// Stops at `pc` because the debugger asked for it.
    pub(crate) fn interrupt(&mut self, pc: u32) {
        self.state = DebugState::BreakPending(pc);
    }
}

/// The debugger side of a session.
pub trait DebugStub {
    /// Checks for an asynchronous interrupt request while the hart is continuing.
    ///
    /// Returns `true` if the hart should stop.
    fn poll(&mut self, hart: &mut Hart) -> bool;

    /// Gives control to the debugger until it resumes the hart or ends the session.
    ///
    /// `reason` is the stop to report, if any.
    fn hold(&mut self, hart: &mut Hart, reason: Option<StopReason>);

    /// Called once when the run has stopped.
    fn finish(&mut self, _hart: &mut Hart, _outcome: &Result<Halt, Error>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm;
    use crate::hart::tests::hart_with_program;
    use crate::registers::Specifier;
    use crate::HandlerTable;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Debug, Copy, Clone)]
    enum Action {
        Step,
        Continue,
        Break(u32),
        Terminate,
        Poke(u32, u8),
    }

    #[derive(Debug, Default)]
    struct Log {
        holds: Vec<(u32, Option<StopReason>)>,
        polls: Vec<u64>,
        finished: Option<Result<Halt, Error>>,
    }

    /// Replays a fixed list of debugger commands.
    struct ScriptedStub {
        script: VecDeque<Vec<Action>>,
        interrupt_on_poll: bool,
        log: Rc<RefCell<Log>>,
    }

    impl ScriptedStub {
        fn new(script: Vec<Vec<Action>>, interrupt_on_poll: bool) -> (Self, Rc<RefCell<Log>>) {
            let log = Rc::new(RefCell::new(Log::default()));
            let stub = Self {
                script: script.into(),
                interrupt_on_poll,
                log: Rc::clone(&log),
            };
            (stub, log)
        }
    }

    impl DebugStub for ScriptedStub {
        fn poll(&mut self, hart: &mut Hart) -> bool {
            self.log.borrow_mut().polls.push(hart.cycle());
            self.interrupt_on_poll
        }

        fn hold(&mut self, hart: &mut Hart, reason: Option<StopReason>) {
            self.log.borrow_mut().holds.push((hart.registers().pc(), reason));
            for action in self.script.pop_front().unwrap_or_default() {
                match action {
                    Action::Step => hart.set_single_step(),
                    Action::Continue => hart.set_continue(),
                    Action::Break(address) => {
                        hart.record_breakpoint(BreakpointKind::Software, address);
                    }
                    Action::Terminate => hart.terminate_session(),
                    Action::Poke(address, value) => hart.write_memory_byte(address, value).unwrap(),
                }
            }
        }

        fn finish(&mut self, _hart: &mut Hart, outcome: &Result<Halt, Error>) {
            self.log.borrow_mut().finished = Some(outcome.clone());
        }
    }

    fn counting_program() -> [u32; 5] {
        [
            asm::li(10, 1),
            asm::li(10, 2),
            asm::li(10, 3),
            asm::li(10, 4),
            asm::EBREAK,
        ]
    }

    #[test]
    fn test_gate_transitions() {
        let mut control = DebugControl::new(0x40);
        assert_eq!(DebugState::BreakPending(0x40), control.state());
        assert_eq!(Gate::Hold(None), control.gate(0x40));

        control.set_single_step();
        assert_eq!(Gate::Hold(Some(StopReason::DoneStep)), control.gate(0x44));
        assert_eq!(DebugState::BreakPending(0x44), control.state());

        assert!(control.record_breakpoint(BreakpointKind::Software, 0x50));
        assert!(!control.record_breakpoint(BreakpointKind::Software, 0x50));
        control.set_continue();
        assert_eq!(Gate::Run, control.gate(0x48));
        assert_eq!(
            Gate::Hold(Some(StopReason::Breakpoint(BreakpointKind::Software))),
            control.gate(0x50)
        );
        assert_eq!(DebugState::BreakPending(0x50), control.state());

        assert!(!control.remove_breakpoint(BreakpointKind::Hardware, 0x50));
        assert!(control.remove_breakpoint(BreakpointKind::Software, 0x50));
        control.set_continue();
        assert_eq!(Gate::Run, control.gate(0x50));
    }

    #[test]
    fn test_step_then_break_then_continue() {
        let (stub, log) = ScriptedStub::new(
            vec![
                vec![Action::Step],
                vec![Action::Break(12), Action::Continue],
                vec![Action::Continue],
            ],
            false,
        );
        let mut hart = hart_with_program(&counting_program(), HandlerTable::default());
        hart.attach_debugger(Box::new(stub));

        assert_eq!(Ok(Halt::Breakpoint), hart.run());
        assert_eq!(4, hart.registers().x(Specifier::A0));
        let log = log.borrow();
        assert_eq!(
            vec![
                (0, None),
                (4, Some(StopReason::DoneStep)),
                (12, Some(StopReason::Breakpoint(BreakpointKind::Software))),
            ],
            log.holds
        );
        assert_eq!(Some(Ok(Halt::Breakpoint)), log.finished);
    }

    #[test]
    fn test_stopped_hart_does_not_execute() {
        let (stub, log) = ScriptedStub::new(vec![], false);
        let mut hart = hart_with_program(&[asm::li(10, 7), asm::EBREAK], HandlerTable::default());
        hart.attach_debugger(Box::new(stub));

        assert_eq!(Ok(None), hart.step());
        assert_eq!(Ok(None), hart.step());
        assert_eq!(DebugState::BreakPending(0), hart.debug_control().state());
        assert_eq!(0, hart.registers().x(Specifier::A0));
        assert_eq!(0, hart.registers().pc());
        assert_eq!(0, hart.cycle());
        assert_eq!(vec![(0, None), (0, None)], log.borrow().holds);
    }

    #[test]
    fn test_interrupted_hart_does_not_execute() {
        let (stub, log) = ScriptedStub::new(vec![vec![Action::Continue]], true);
        let mut hart = hart_with_program(&[asm::jal(0, 0)], HandlerTable::default());
        hart.attach_debugger(Box::new(stub));

        for _ in 0..=POLL_INTERVAL {
            assert_eq!(Ok(None), hart.step());
        }
        assert_eq!(POLL_INTERVAL, hart.cycle());
        assert_eq!(DebugState::BreakPending(0), hart.debug_control().state());
        assert_eq!(
            vec![(0, None), (0, Some(StopReason::Interrupted))],
            log.borrow().holds
        );
    }

    #[test]
    fn test_terminate_before_first_instruction() {
        let (stub, log) = ScriptedStub::new(vec![vec![Action::Terminate]], false);
        let mut hart = hart_with_program(&counting_program(), HandlerTable::default());
        hart.attach_debugger(Box::new(stub));

        assert_eq!(Ok(Halt::Terminated), hart.run());
        assert_eq!(0, hart.cycle());
        assert_eq!(0, hart.registers().x(Specifier::A0));
        assert_eq!(Some(Ok(Halt::Terminated)), log.borrow().finished);
    }

    #[test]
    fn test_poll_interrupts_continuing_hart() {
        let (stub, log) = ScriptedStub::new(
            vec![vec![Action::Continue], vec![Action::Terminate]],
            true,
        );
        let mut hart = hart_with_program(&[asm::jal(0, 0)], HandlerTable::default());
        hart.attach_debugger(Box::new(stub));

        assert_eq!(Ok(Halt::Terminated), hart.run());
        assert_eq!(POLL_INTERVAL, hart.cycle());
        let log = log.borrow();
        assert_eq!(vec![POLL_INTERVAL], log.polls);
        assert_eq!(
            vec![(0, None), (0, Some(StopReason::Interrupted))],
            log.holds
        );
    }

    #[test]
    fn test_debugger_patches_memory() {
        // Turn `li a0, 1` into `li a0, 0x7f` before it runs.
        let patched = asm::li(10, 0x7F);
        let (stub, _log) = ScriptedStub::new(
            vec![vec![
                Action::Poke(2, (patched >> 16) as u8),
                Action::Poke(3, (patched >> 24) as u8),
                Action::Step,
            ]],
            false,
        );
        let mut hart = hart_with_program(&counting_program(), HandlerTable::default());
        hart.attach_debugger(Box::new(stub));

        assert_eq!(Ok(None), hart.step());
        assert_eq!(0x7F, hart.registers().x(Specifier::A0));
        assert_eq!(Ok((patched >> 24) as u8), hart.read_memory_byte(3));
    }
}
