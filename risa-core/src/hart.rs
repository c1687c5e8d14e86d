//! The simulated hardware thread and its fetch-decode-execute loop.

use crate::debug::{DebugControl, DebugState, DebugStub, Gate, StopReason, POLL_INTERVAL};
use crate::execute::execute_instruction;
use crate::handler::{HandlerKind, HandlerTable};
use crate::instruction::{Fields, Format, Instruction};
use crate::memory::{Memory, MemoryError};
use crate::registers::{Registers, Specifier};
use crate::{BreakpointKind, Config, Error};
use log::{debug, error, info, trace};
use std::any::Any;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Reasons for a run to stop normally.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Halt {
    /// The configured number of cycles was reached.
    Timeout,
    /// The interrupt flag was raised, usually by SIGINT.
    Interrupted,
    /// The program called `exit` with this code.
    Exit(i32),
    /// The environment handler stopped the run on `ebreak`.
    Breakpoint,
    /// The debugger ended the session.
    Terminated,
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout reached"),
            Self::Interrupted => f.write_str("interrupted"),
            Self::Exit(code) => write!(f, "program exited with code {code}"),
            Self::Breakpoint => f.write_str("ebreak"),
            Self::Terminated => f.write_str("debug session terminated"),
        }
    }
}

/// A single RV32I hart together with its memory and handlers.
///
/// The hart owns everything a run needs. Handlers and debugger stubs get `&mut Hart` and use the
/// accessors below to inspect and change its state.
///
/// When the hart stops, either at the end of [`Hart::run`] or when it is dropped, the exit handler
/// runs exactly once. Memory is freed after that, then the handler data, then the handler table
/// together with its library.
pub struct Hart {
    config: Config,
    registers: Registers,
    next_pc: u32,
    cycle: u64,
    raw_instruction: u32,
    fields: Fields,
    instruction: Option<Instruction>,
    target_address: u32,
    /// Halt or error requested by a handler or the debugger, picked up by the loop.
    request: Option<Result<Halt, Error>>,
    interrupt: Arc<AtomicBool>,
    debug: DebugControl,
    debug_stub: Option<Box<dyn DebugStub>>,
    console: Box<dyn Write>,
    started_at: Option<Instant>,
    torn_down: bool,
    // Drop order of the remaining fields is significant.
    memory: Memory,
    handler_data: Option<Box<dyn Any>>,
    handlers: HandlerTable,
}

impl Hart {
    /// Creates a hart with zeroed memory of `config.memory_size` bytes.
    ///
    /// `pc` starts at `0`. The stack and frame pointers point at the last byte of memory.
    pub fn new(config: Config, handlers: HandlerTable) -> Self {
        let memory = Memory::new(config.memory_size);
        let mut registers = Registers::new(0);
        let top = memory.size().saturating_sub(1);
        registers.set_x(Specifier::SP, top);
        registers.set_x(Specifier::FP, top);
        Self {
            config,
            registers,
            next_pc: 0,
            cycle: 0,
            raw_instruction: 0,
            fields: Fields::default(),
            instruction: None,
            target_address: 0,
            request: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            debug: DebugControl::new(0),
            debug_stub: None,
            console: Box::new(io::stdout()),
            started_at: None,
            torn_down: false,
            memory,
            handler_data: None,
            handlers,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// Number of cycles executed so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// The most recently fetched instruction word.
    pub fn raw_instruction(&self) -> u32 {
        self.raw_instruction
    }

    /// Fields of the most recently fetched instruction word.
    pub fn fields(&self) -> Fields {
        self.fields
    }

    /// The most recently decoded instruction, `None` before the first successful decode.
    pub fn instruction(&self) -> Option<Instruction> {
        self.instruction
    }

    /// Effective address of the last load, store, branch or jump.
    pub fn target_address(&self) -> u32 {
        self.target_address
    }

    pub(crate) fn set_target_address(&mut self, address: u32) {
        self.target_address = address;
    }

    /// Address of the instruction that runs after the current one.
    pub fn next_pc(&self) -> u32 {
        self.next_pc
    }

    pub(crate) fn set_next_pc(&mut self, pc: u32) {
        self.next_pc = pc;
    }

    /// Output of the `write` system call and the instruction trace.
    pub fn console(&mut self) -> &mut dyn Write {
        &mut *self.console
    }

    pub fn set_console(&mut self, console: Box<dyn Write>) {
        self.console = console;
    }

    /// The flag that stops the run at the start of the next cycle once it is set.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn set_interrupt_flag(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = flag;
    }

    /// Stores state private to the handlers, replacing any previous value.
    pub fn set_handler_data<T: Any>(&mut self, data: T) {
        self.handler_data = Some(Box::new(data));
    }

    pub fn handler_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.handler_data.as_mut()?.downcast_mut()
    }

    /// Stops the run normally at the end of the current cycle.
    ///
    /// The first request wins.
    pub fn halt(&mut self, halt: Halt) {
        self.request.get_or_insert(Ok(halt));
    }

    /// Stops the run with an error at the end of the current cycle.
    pub fn fail(&mut self, error: Error) {
        self.request.get_or_insert(Err(error));
    }

    /// Puts the hart under debugger control, stopped at the current `pc`.
    pub fn attach_debugger(&mut self, stub: Box<dyn DebugStub>) {
        self.debug = DebugControl::new(self.registers.pc());
        self.debug_stub = Some(stub);
    }

    pub fn debug_control(&self) -> &DebugControl {
        &self.debug
    }

    pub fn read_memory_byte(&self, address: u32) -> Result<u8, MemoryError> {
        self.memory.peek(address)
    }

    pub fn write_memory_byte(&mut self, address: u32, value: u8) -> Result<(), MemoryError> {
        self.memory.poke(address, value)
    }

    pub fn set_continue(&mut self) {
        self.debug.set_continue();
    }

    pub fn set_single_step(&mut self) {
        self.debug.set_single_step();
    }

    pub fn record_breakpoint(&mut self, kind: BreakpointKind, address: u32) -> bool {
        debug!("Breakpoint set at {address:#010x}");
        self.debug.record_breakpoint(kind, address)
    }

    pub fn remove_breakpoint(&mut self, kind: BreakpointKind, address: u32) -> bool {
        debug!("Breakpoint removed at {address:#010x}");
        self.debug.remove_breakpoint(kind, address)
    }

    /// Ends the debug session, which stops the run with [`Halt::Terminated`].
    pub fn terminate_session(&mut self) {
        info!("Debug session terminated");
        self.halt(Halt::Terminated);
    }

    /// Runs until the program halts or fails.
    ///
    /// The exit handler has run by the time this returns.
    pub fn run(&mut self) -> Result<Halt, Error> {
        info!("Running simulator");
        let outcome = loop {
            match self.step() {
                Ok(None) => {}
                Ok(Some(halt)) => break Ok(halt),
                Err(error) => break Err(error),
            }
        };
        match &outcome {
            Ok(halt) => info!(cycles = self.cycle; "Simulation halted: {halt}"),
            Err(error) => error!(cycles = self.cycle; "Simulation failed: {error}"),
        }
        if let Some(mut stub) = self.debug_stub.take() {
            stub.finish(self, &outcome);
            self.debug_stub = Some(stub);
        }
        self.teardown();
        outcome
    }

    /// Executes a single cycle.
    ///
    /// Returns `Ok(None)` while the run should continue. The init handler runs before the
    /// first cycle.
    pub fn step(&mut self) -> Result<Option<Halt>, Error> {
        self.start();
        if let Some(outcome) = self.request.take() {
            return outcome.map(Some);
        }

        if self.interrupt.load(Ordering::Relaxed) {
            return Ok(Some(Halt::Interrupted));
        }
        if self.config.timeout == Some(self.cycle) {
            info!("Timeout value reached ({} cycles)", self.cycle);
            return Ok(Some(Halt::Timeout));
        }

        if self.debug_stub.is_some() {
            let may_run = self.debug_gate();
            if let Some(outcome) = self.request.take() {
                return outcome.map(Some);
            }
            if !may_run {
                return Ok(None);
            }
        }

        self.cycle += 1;
        let pc = self.registers.pc();
        let raw = self
            .memory
            .read_word(pc)
            .map_err(|source| Error::Memory { source, pc })?;
        self.raw_instruction = raw;
        self.fields = Fields::extract(raw, Format::of(raw));
        let decoded = Instruction::decode(raw);
        self.instruction = decoded.as_ref().ok().copied();
        if self.config.trace {
            self.trace_line(pc);
        }
        let instruction = decoded.map_err(|e| {
            debug!("Failed to decode {raw:#010x}: {e}");
            Error::InvalidInstruction { raw, pc }
        })?;

        trace!("Executing {instruction:?} at {pc:#010x}");
        self.next_pc = pc.wrapping_add(4);
        execute_instruction(self, instruction)?;
        if let Some(outcome) = self.request.take() {
            return outcome.map(Some);
        }

        if self.next_pc > self.memory.size() {
            return Err(Error::PcOutOfRange { pc: self.next_pc });
        }

        if self.cycle % u64::from(self.config.interrupt_period.get()) == 0 {
            self.invoke(HandlerKind::Interrupt);
            if let Some(outcome) = self.request.take() {
                return outcome.map(Some);
            }
        }

        *self.registers.pc_mut() = self.next_pc;
        Ok(None)
    }

    pub(crate) fn invoke(&mut self, kind: HandlerKind) {
        trace!("Calling {kind} handler");
        let handler = self.handlers.get(kind);
        handler(self);
    }

    fn start(&mut self) {
        if self.started_at.is_some() {
            return;
        }
        self.started_at = Some(Instant::now());
        info!(
            "Interrupt period set to {} cycles",
            self.config.interrupt_period
        );
        info!("Memory size set to {} bytes", self.memory.size());
        self.invoke(HandlerKind::Init);
    }

    /// Runs the exit handler, at most once and only if the hart has started.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        let Some(started_at) = self.started_at else {
            return;
        };
        self.invoke(HandlerKind::Exit);
        self.request = None;
        info!(
            "Simulation stopping, time elapsed: {:.6} seconds",
            started_at.elapsed().as_secs_f64()
        );
    }

    /// Returns `false` while the debugger keeps the hart stopped at `pc`.
    fn debug_gate(&mut self) -> bool {
        let Some(mut stub) = self.debug_stub.take() else {
            return true;
        };
        let pc = self.registers.pc();
        match self.debug.gate(pc) {
            Gate::Run => {
                if self.cycle % POLL_INTERVAL == 0 && stub.poll(self) {
                    self.debug.interrupt(pc);
                    stub.hold(self, Some(StopReason::Interrupted));
                }
            }
            Gate::Hold(reason) => stub.hold(self, reason),
        }
        self.debug_stub = Some(stub);
        !matches!(self.debug.state(), DebugState::BreakPending(_))
    }

    fn trace_line(&mut self, pc: u32) {
        let text = match self.instruction {
            Some(instruction) => instruction.to_string(),
            None => String::from("<invalid>"),
        };
        let line = format!(
            "{pc:8x}:   {:#010x}   {text:<30} CYCLE:[{}]",
            self.raw_instruction, self.cycle
        );
        if let Err(e) = writeln!(self.console, "{line}") {
            debug!("Failed to write trace line: {e}");
        }
    }
}

impl Drop for Hart {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for Hart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hart")
            .field("config", &self.config)
            .field("registers", &self.registers)
            .field("cycle", &self.cycle)
            .field("memory", &self.memory)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}
