//! GDB remote serial protocol support.
//!
//! [`Hart`] implements [`Target`] directly, and [`GdbSession`] plugs the `gdbstub` state machine
//! into the execution loop as a [`DebugStub`].

use crate::debug::{BreakpointKind, DebugStub, StopReason};
use crate::hart::{Halt, Hart};
use crate::registers::Specifier;
use crate::Error;
use gdbstub::arch::Arch;
use gdbstub::common::Signal;
use gdbstub::conn::ConnectionExt;
use gdbstub::stub::state_machine::GdbStubStateMachine;
use gdbstub::stub::{GdbStub, SingleThreadStopReason};
use gdbstub::target::ext::base::singlethread::{
    SingleThreadBase, SingleThreadResume, SingleThreadResumeOps, SingleThreadSingleStep,
    SingleThreadSingleStepOps,
};
use gdbstub::target::ext::base::BaseOps;
use gdbstub::target::ext::breakpoints::{
    Breakpoints, BreakpointsOps, HwBreakpoint, HwBreakpointOps, SwBreakpoint, SwBreakpointOps,
};
use gdbstub::target::{Target, TargetError, TargetResult};
use gdbstub_arch::riscv::reg::RiscvCoreRegs;
use gdbstub_arch::riscv::Riscv32;
use log::{error, info, warn};
use std::fmt::Debug;
use thiserror::Error;

impl Target for Hart {
    type Arch = Riscv32;
    type Error = Error;

    fn base_ops(&mut self) -> BaseOps<'_, Self::Arch, Self::Error> {
        // Indicate our target is single-threaded
        BaseOps::SingleThread(self)
    }

    fn support_breakpoints(&mut self) -> Option<BreakpointsOps<'_, Self>> {
        Some(self)
    }
}

impl SingleThreadBase for Hart {
    fn read_registers(&mut self, regs: &mut RiscvCoreRegs<u32>) -> TargetResult<(), Self> {
        let snapshot = self.registers().snapshot();
        regs.x.copy_from_slice(&snapshot[..32]);
        regs.pc = snapshot[32];
        Ok(())
    }

    fn write_registers(&mut self, regs: &RiscvCoreRegs<u32>) -> TargetResult<(), Self> {
        let registers = self.registers_mut();
        for r in Specifier::iter_all() {
            registers.set_x(r, regs.x[usize::from(r)]);
        }
        *registers.pc_mut() = regs.pc;
        Ok(())
    }

    fn read_addrs(&mut self, start_addr: u32, data: &mut [u8]) -> TargetResult<usize, Self> {
        let mut read = 0;
        for (offset, byte) in data.iter_mut().enumerate() {
            match self.read_memory_byte(start_addr.wrapping_add(offset as u32)) {
                Ok(value) => *byte = value,
                Err(_) => break,
            }
            read += 1;
        }
        if read == 0 && !data.is_empty() {
            return Err(TargetError::NonFatal);
        }
        Ok(read)
    }

    fn write_addrs(&mut self, start_addr: u32, data: &[u8]) -> TargetResult<(), Self> {
        for (offset, &byte) in data.iter().enumerate() {
            self.write_memory_byte(start_addr.wrapping_add(offset as u32), byte)
                .map_err(|_| TargetError::NonFatal)?;
        }
        Ok(())
    }

    fn support_resume(&mut self) -> Option<SingleThreadResumeOps<'_, Self>> {
        Some(self)
    }
}

impl SingleThreadResume for Hart {
    fn resume(&mut self, signal: Option<Signal>) -> Result<(), Self::Error> {
        if let Some(signal) = signal {
            warn!("Ignoring signal {signal:?} passed on resume");
        }
        self.set_continue();
        Ok(())
    }

    fn support_single_step(&mut self) -> Option<SingleThreadSingleStepOps<'_, Self>> {
        Some(self)
    }
}

impl SingleThreadSingleStep for Hart {
    fn step(&mut self, signal: Option<Signal>) -> Result<(), Self::Error> {
        if let Some(signal) = signal {
            warn!("Ignoring signal {signal:?} passed on step");
        }
        self.set_single_step();
        Ok(())
    }
}

impl Breakpoints for Hart {
    fn support_sw_breakpoint(&mut self) -> Option<SwBreakpointOps<'_, Self>> {
        Some(self)
    }

    fn support_hw_breakpoint(&mut self) -> Option<HwBreakpointOps<'_, Self>> {
        Some(self)
    }
}

impl SwBreakpoint for Hart {
    fn add_sw_breakpoint(
        &mut self,
        addr: u32,
        _kind: <Self::Arch as Arch>::BreakpointKind,
    ) -> TargetResult<bool, Self> {
        self.record_breakpoint(BreakpointKind::Software, addr);
        Ok(true)
    }

    fn remove_sw_breakpoint(
        &mut self,
        addr: u32,
        _kind: <Self::Arch as Arch>::BreakpointKind,
    ) -> TargetResult<bool, Self> {
        Ok(self.remove_breakpoint(BreakpointKind::Software, addr))
    }
}

impl HwBreakpoint for Hart {
    fn add_hw_breakpoint(
        &mut self,
        addr: u32,
        _kind: <Self::Arch as Arch>::BreakpointKind,
    ) -> TargetResult<bool, Self> {
        self.record_breakpoint(BreakpointKind::Hardware, addr);
        Ok(true)
    }

    fn remove_hw_breakpoint(
        &mut self,
        addr: u32,
        _kind: <Self::Arch as Arch>::BreakpointKind,
    ) -> TargetResult<bool, Self> {
        Ok(self.remove_breakpoint(BreakpointKind::Hardware, addr))
    }
}

/// Failures that end a debug session.
#[derive(Error, Debug)]
pub enum GdbSessionError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

fn connection_error(e: impl Debug) -> GdbSessionError {
    GdbSessionError::Connection(format!("{e:?}"))
}

fn protocol_error(e: impl Debug) -> GdbSessionError {
    GdbSessionError::Protocol(format!("{e:?}"))
}

type Machine<C> = GdbStubStateMachine<'static, Hart, C>;

/// A GDB client connected over `C`, driving a hart through the debug gate.
pub struct GdbSession<C: ConnectionExt> {
    machine: Option<Machine<C>>,
}

impl<C> GdbSession<C>
where
    C: ConnectionExt,
    C::Error: Debug,
{
    /// Starts the protocol on an accepted connection.
    pub fn new(connection: C, hart: &mut Hart) -> Result<Self, GdbSessionError> {
        let machine = GdbStub::new(connection)
            .run_state_machine(hart)
            .map_err(protocol_error)?;
        Ok(Self {
            machine: Some(machine),
        })
    }

    /// Advances the state machine until the hart may run again.
    fn serve(
        &mut self,
        hart: &mut Hart,
        mut machine: Machine<C>,
        mut pending: Option<StopReason>,
    ) -> Result<(), GdbSessionError> {
        loop {
            machine = match machine {
                GdbStubStateMachine::Idle(mut gdb) => {
                    // Stopped, so block until the client sends more
                    let byte = gdb.borrow_conn().read().map_err(connection_error)?;
                    gdb.incoming_data(hart, byte).map_err(protocol_error)?
                }
                GdbStubStateMachine::Running(gdb) => match pending.take() {
                    Some(reason) => gdb
                        .report_stop(hart, stop_reason(reason))
                        .map_err(protocol_error)?,
                    None => {
                        self.machine = Some(GdbStubStateMachine::Running(gdb));
                        return Ok(());
                    }
                },
                GdbStubStateMachine::CtrlCInterrupt(gdb) => {
                    // The interrupt itself is the stop to report
                    pending = None;
                    let reason: SingleThreadStopReason<u32> =
                        SingleThreadStopReason::Signal(Signal::SIGINT);
                    gdb.interrupt_handled(hart, Some(reason))
                        .map_err(protocol_error)?
                }
                GdbStubStateMachine::Disconnected(gdb) => {
                    info!("Debugger disconnected: {:?}", gdb.get_reason());
                    hart.terminate_session();
                    return Ok(());
                }
            };
        }
    }
}

fn stop_reason(reason: StopReason) -> SingleThreadStopReason<u32> {
    match reason {
        StopReason::DoneStep => SingleThreadStopReason::DoneStep,
        StopReason::Breakpoint(BreakpointKind::Software) => SingleThreadStopReason::SwBreak(()),
        StopReason::Breakpoint(BreakpointKind::Hardware) => SingleThreadStopReason::HwBreak(()),
        StopReason::Interrupted => SingleThreadStopReason::Signal(Signal::SIGINT),
    }
}

impl<C> DebugStub for GdbSession<C>
where
    C: ConnectionExt,
    C::Error: Debug,
{
    fn poll(&mut self, hart: &mut Hart) -> bool {
        let Some(GdbStubStateMachine::Running(mut gdb)) = self.machine.take() else {
            return false;
        };
        let conn = gdb.borrow_conn();
        let next = match conn.peek() {
            Ok(None) => Ok(GdbStubStateMachine::Running(gdb)),
            Ok(Some(_)) => match conn.read() {
                Ok(byte) => gdb.incoming_data(hart, byte).map_err(protocol_error),
                Err(e) => Err(connection_error(e)),
            },
            Err(e) => Err(connection_error(e)),
        };
        match next {
            Ok(machine) => {
                let interrupted = matches!(machine, GdbStubStateMachine::CtrlCInterrupt(_));
                self.machine = Some(machine);
                interrupted
            }
            Err(e) => {
                error!("Debug session failed, {e}");
                hart.terminate_session();
                false
            }
        }
    }

    fn hold(&mut self, hart: &mut Hart, reason: Option<StopReason>) {
        let Some(machine) = self.machine.take() else {
            hart.terminate_session();
            return;
        };
        if let Err(e) = self.serve(hart, machine, reason) {
            error!("Debug session failed, {e}");
            hart.terminate_session();
        }
    }

    fn finish(&mut self, hart: &mut Hart, outcome: &Result<Halt, Error>) {
        let Some(GdbStubStateMachine::Running(gdb)) = self.machine.take() else {
            return;
        };
        let reason: SingleThreadStopReason<u32> = match outcome {
            Ok(Halt::Terminated) => return,
            Ok(Halt::Exit(code)) => SingleThreadStopReason::Exited(*code as u8),
            Ok(_) => SingleThreadStopReason::Exited(0),
            Err(Error::InvalidInstruction { .. }) => {
                SingleThreadStopReason::Terminated(Signal::SIGILL)
            }
            Err(_) => SingleThreadStopReason::Terminated(Signal::SIGSEGV),
        };
        if let Err(e) = gdb.report_stop(hart, reason) {
            warn!("Failed to report the end of the run to the debugger: {e:?}");
        }
    }
}
