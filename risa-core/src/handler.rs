//! The five pluggable hooks a simulation run calls into.
//!
//! Every [`Hart`] owns a [`HandlerTable`] with one slot per [`HandlerKind`]. The slots are bound
//! once when the table is built, either to the built-in defaults, to a [`Handlers`] strategy
//! object, to individual closures, or to the symbols exported by a shared library.

use crate::hart::{Halt, Hart};
use crate::instruction::Instruction;
use crate::registers::Specifier;
use crate::{Error, MemoryError};
use libloading::Library;
use log::{info, warn};
use std::ffi::OsStr;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use thiserror::Error;

/// `exit` in newlib's `machine/syscall.h`.
const SYS_EXIT: u32 = 93;
/// `write` in newlib's `machine/syscall.h`.
const SYS_WRITE: u32 = 64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum HandlerKind {
    /// Called after every store instruction.
    Mmio,
    /// Called every `interrupt_period` cycles.
    Interrupt,
    /// Called for `ecall`, `ebreak` and `fence`.
    Environment,
    /// Called once before the first cycle.
    Init,
    /// Called once when the run stops, whatever the reason.
    Exit,
}

impl HandlerKind {
    pub const ALL: [Self; 5] = [
        Self::Mmio,
        Self::Interrupt,
        Self::Environment,
        Self::Init,
        Self::Exit,
    ];

    /// Name of the symbol a handler library exports for this slot.
    pub fn symbol_name(self) -> &'static str {
        match self {
            Self::Mmio => "risaMmioHandler",
            Self::Interrupt => "risaIntHandler",
            Self::Environment => "risaEnvHandler",
            Self::Init => "risaInitHandler",
            Self::Exit => "risaExitHandler",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mmio => "MMIO",
            Self::Interrupt => "interrupt",
            Self::Environment => "environment",
            Self::Init => "init",
            Self::Exit => "exit",
        })
    }
}

/// A strategy object providing all five handlers at once.
///
/// Every method has a default, so implementors only override the hooks they care about.
/// Methods take `&self`; use interior mutability or the hart's handler data for state.
pub trait Handlers {
    fn mmio(&self, _hart: &mut Hart) {}

    fn interrupt(&self, _hart: &mut Hart) {}

    fn environment(&self, hart: &mut Hart) {
        default_environment(hart)
    }

    fn init(&self, _hart: &mut Hart) {}

    fn exit(&self, _hart: &mut Hart) {}
}

/// The built-in handlers.
#[derive(Debug, Default, Copy, Clone)]
pub struct DefaultHandlers;

impl Handlers for DefaultHandlers {}

pub type Handler = Rc<dyn Fn(&mut Hart)>;

/// Symbol type handler libraries export, e.g. `#[no_mangle] pub fn risaEnvHandler(hart: &mut Hart)`.
pub type HandlerFn = fn(&mut Hart);

pub struct HandlerTable {
    slots: [Handler; 5],
    // Declared after `slots` so the library is unloaded after every handler pointing into it.
    library: Option<Library>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::from_handlers(DefaultHandlers)
    }
}

impl HandlerTable {
    /// Binds every slot to the corresponding method of `handlers`.
    pub fn from_handlers<H: Handlers + 'static>(handlers: H) -> Self {
        let handlers = Rc::new(handlers);
        let bind = |kind: HandlerKind| -> Handler {
            let handlers = Rc::clone(&handlers);
            match kind {
                HandlerKind::Mmio => Rc::new(move |hart: &mut Hart| handlers.mmio(hart)),
                HandlerKind::Interrupt => {
                    Rc::new(move |hart: &mut Hart| handlers.interrupt(hart))
                }
                HandlerKind::Environment => {
                    Rc::new(move |hart: &mut Hart| handlers.environment(hart))
                }
                HandlerKind::Init => Rc::new(move |hart: &mut Hart| handlers.init(hart)),
                HandlerKind::Exit => Rc::new(move |hart: &mut Hart| handlers.exit(hart)),
            }
        };
        Self {
            slots: HandlerKind::ALL.map(bind),
            library: None,
        }
    }

    /// Opens the shared library at `path` and binds every handler symbol it exports.
    ///
    /// Slots whose symbol is missing keep the built-in default.
    pub fn load_library<P: AsRef<OsStr>>(path: P) -> Result<Self, HandlerLibraryError> {
        let path = path.as_ref();
        // SAFETY: running the library's initialisers is what the user asked for by passing it.
        let library = unsafe { Library::new(path) }.map_err(|source| HandlerLibraryError::Open {
            path: PathBuf::from(path),
            source,
        })?;
        info!("Loaded handler library {}", path.to_string_lossy());

        let mut table = Self::default();
        for kind in HandlerKind::ALL {
            let name = kind.symbol_name();
            // SAFETY: handler symbols are required to have the `HandlerFn` signature.
            match unsafe { library.get::<HandlerFn>(name.as_bytes()) } {
                Ok(symbol) => {
                    let handler: HandlerFn = *symbol;
                    table.set(kind, handler);
                    info!("Bound {kind} handler to {name}");
                }
                Err(_) => {
                    warn!("Handler library has no {name}, using the default {kind} handler")
                }
            }
        }
        table.library = Some(library);
        Ok(table)
    }

    /// Overrides a single slot.
    pub fn set<F>(&mut self, kind: HandlerKind, handler: F) -> &mut Self
    where
        F: Fn(&mut Hart) + 'static,
    {
        self.slots[kind.index()] = Rc::new(handler);
        self
    }

    pub fn get(&self, kind: HandlerKind) -> Handler {
        Rc::clone(&self.slots[kind.index()])
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("library", &self.library)
            .finish_non_exhaustive()
    }
}

#[derive(Error, Debug)]
pub enum HandlerLibraryError {
    #[error("failed to open handler library {}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
}

/// Minimal system call shim.
///
/// `ebreak` ends the run, `fence` is a no-op since there is a single hart, and `ecall` dispatches
/// on `a7` using the newlib system call numbers. Only `exit` and `write` are supported.
pub fn default_environment(hart: &mut Hart) {
    match hart.instruction() {
        Some(Instruction::Ebreak) => hart.halt(Halt::Breakpoint),
        Some(Instruction::Ecall) => system_call(hart),
        _ => {}
    }
}

fn system_call(hart: &mut Hart) {
    let registers = hart.registers();
    match registers.x(Specifier::A7) {
        SYS_EXIT => {
            let code = registers.x(Specifier::A0) as i32;
            if code != 0 {
                info!("Program returned error code {code}");
            }
            hart.halt(Halt::Exit(code));
        }
        SYS_WRITE => {
            let address = registers.x(Specifier::A1);
            let len = registers.x(Specifier::A2);
            if let Err(error) = write_to_console(hart, address, len) {
                hart.fail(error);
                return;
            }
            hart.registers_mut().set_x(Specifier::A0, len);
        }
        code => warn!("Unknown syscall code {code}"),
    }
}

fn write_to_console(hart: &mut Hart, address: u32, len: u32) -> Result<(), Error> {
    let pc = hart.registers().pc();
    let out_of_bounds = Error::Memory {
        source: MemoryError::OutOfBounds {
            address,
            width: len as usize,
        },
        pc,
    };
    if u64::from(address) + u64::from(len) > u64::from(hart.memory().size()) {
        return Err(out_of_bounds);
    }
    let mut bytes = vec![0; len as usize];
    hart.memory()
        .read(address, &mut bytes)
        .map_err(|source| Error::Memory { source, pc })?;
    let console = hart.console();
    if let Err(e) = console.write_all(&bytes).and_then(|()| console.flush()) {
        warn!("Failed to write to the console: {e}");
    }
    Ok(())
}
