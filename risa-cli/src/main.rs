use clap::Parser;
use log::{error, info, warn};
use risa_cli::loader::{self, LoadError};
use risa_core::gdb::{GdbSession, GdbSessionError};
use risa_core::handler::HandlerLibraryError;
use risa_core::{Config, HandlerTable, Hart, DEFAULT_INTERRUPT_PERIOD, DEFAULT_MEMORY_SIZE};
use std::io;
use std::net::{TcpListener, TcpStream};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;

const EIO: u8 = 5;
const ENOMEM: u8 = 12;
const EINVAL: u8 = 22;

/// RV32I instruction set simulator
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Program image to run, loaded at address 0 unless --elf is given
    program: PathBuf,

    /// Size of the memory in bytes, decimal or 0x-prefixed hexadecimal
    #[arg(short, long = "mem-size", value_parser = parse_size, default_value_t = DEFAULT_MEMORY_SIZE)]
    mem_size: u32,

    /// Shared library exporting handler overrides
    #[arg(short = 'l', long)]
    handler_library: Option<PathBuf>,

    /// Print every executed instruction
    #[arg(long)]
    tracing: bool,

    /// Stop after this many cycles
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Cycles between two calls of the interrupt handler
    #[arg(short, long, default_value_t = DEFAULT_INTERRUPT_PERIOD)]
    interrupt_period: NonZeroU32,

    /// Wait for a GDB connection before running
    #[arg(short, long)]
    gdb: bool,

    /// Port to listen on for GDB
    #[arg(long, default_value_t = 3333)]
    port: u16,

    /// Treat the program as an ELF file and start at its entry point
    #[arg(long)]
    elf: bool,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

fn parse_size(s: &str) -> Result<u32, String> {
    let size = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| e.to_string())?;
    if size == 0 {
        return Err("memory size must be non-zero".to_owned());
    }
    Ok(size)
}

/// Failures before the simulation starts.
#[derive(Error, Debug)]
enum SetupError {
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    HandlerLibrary(#[from] HandlerLibraryError),
    #[error("failed to accept a GDB connection")]
    GdbConnection(#[source] io::Error),
    #[error(transparent)]
    GdbSession(#[from] GdbSessionError),
    #[error("failed to install the SIGINT handler")]
    Signal(#[source] io::Error),
}

impl SetupError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Load(LoadError::ImageTooLarge { .. } | LoadError::SegmentOutOfRange { .. }) => {
                ENOMEM
            }
            Self::Load(_) | Self::HandlerLibrary(_) => EINVAL,
            Self::Read { .. } | Self::GdbConnection(_) | Self::GdbSession(_) | Self::Signal(_) => {
                EIO
            }
        }
    }
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EINVAL)
            } else {
                // --help and --version
                ExitCode::SUCCESS
            };
        }
    };

    if let Err(e) = stderrlog::new()
        .modules([module_path!(), "risa_core"])
        .verbosity(2 + usize::from(args.verbose))
        .quiet(args.quiet)
        .init()
    {
        eprintln!("Failed to initialise logging: {e}");
    }

    let mut hart = match setup(&args) {
        Ok(hart) => hart,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(e.exit_code());
        }
    };

    match hart.run() {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(u8::MAX)),
    }
}

/// Builds a hart with the program loaded and everything attached, ready to run.
fn setup(args: &Args) -> Result<Hart, SetupError> {
    let program = std::fs::read(&args.program).map_err(|source| SetupError::Read {
        path: args.program.clone(),
        source,
    })?;

    let handlers = match &args.handler_library {
        Some(path) => HandlerTable::load_library(path)?,
        None => HandlerTable::default(),
    };

    let config = Config {
        memory_size: args.mem_size,
        interrupt_period: args.interrupt_period,
        timeout: args.timeout,
        trace: args.tracing,
    };
    let mut hart = Hart::new(config, handlers);

    if args.elf {
        let entry = loader::load_elf(&mut hart, &program)?;
        *hart.registers_mut().pc_mut() = entry;
    } else {
        loader::load_raw(&mut hart, &program)?;
    }

    if args.gdb {
        let connection = wait_for_gdb_connection(args.port).map_err(SetupError::GdbConnection)?;
        let session = GdbSession::new(connection, &mut hart)?;
        hart.attach_debugger(Box::new(session));
    } else if args.port != 3333 {
        warn!("--port has no effect without --gdb");
    }

    // Installed after the accept so Ctrl-C still kills a process waiting for GDB
    signal_hook::flag::register(signal_hook::consts::SIGINT, hart.interrupt_flag())
        .map_err(SetupError::Signal)?;

    Ok(hart)
}

fn wait_for_gdb_connection(port: u16) -> io::Result<TcpStream> {
    let sockaddr = format!("localhost:{}", port);
    info!("Waiting for a GDB connection on {:?}...", sockaddr);
    let sock = TcpListener::bind(sockaddr)?;
    let (stream, addr) = sock.accept()?;

    info!("Debugger connected from {}", addr);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use risa_core::Halt;
    use std::ffi::OsStr;

    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(Ok(4096), parse_size("4096"));
        assert_eq!(Ok(0x8000), parse_size("0x8000"));
        assert_eq!(Ok(0xFF), parse_size("0XfF"));
        assert!(parse_size("0").is_err());
        assert!(parse_size("0x").is_err());
        assert!(parse_size("32k").is_err());
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["risa", "prog.bin"]).unwrap();
        assert_eq!(DEFAULT_MEMORY_SIZE, args.mem_size);
        assert_eq!(DEFAULT_INTERRUPT_PERIOD, args.interrupt_period);
        assert_eq!(3333, args.port);
        assert_eq!(None, args.timeout);
        assert!(!args.gdb && !args.elf && !args.tracing);
    }

    #[test]
    fn test_short_flags() {
        let args = Args::try_parse_from([
            "risa", "-m", "0x1000", "-t", "50", "-i", "7", "-l", "h.so", "-g", "-vv", "p",
        ])
        .unwrap();
        assert_eq!(0x1000, args.mem_size);
        assert_eq!(Some(50), args.timeout);
        assert_eq!(7, args.interrupt_period.get());
        assert_eq!(Some(PathBuf::from("h.so")), args.handler_library);
        assert!(args.gdb);
        assert_eq!(2, args.verbose);
    }

    #[test]
    fn test_zero_interrupt_period_is_rejected() {
        assert!(Args::try_parse_from(["risa", "-i", "0", "p"]).is_err());
    }

    #[test]
    fn test_missing_program_is_rejected() {
        let error = Args::try_parse_from(["risa"]).unwrap_err();
        assert!(error.use_stderr());
    }

    #[test]
    fn test_setup_exit_codes() {
        let too_large = SetupError::Load(LoadError::ImageTooLarge {
            size: 10,
            memory_size: 4,
        });
        assert_eq!(ENOMEM, too_large.exit_code());
        let read = SetupError::Read {
            path: PathBuf::from("missing"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(EIO, read.exit_code());
    }

    #[test]
    fn test_raw_image_too_large() {
        let mut hart = Hart::new(
            Config {
                memory_size: 8,
                ..Config::default()
            },
            HandlerTable::default(),
        );
        let error = loader::load_raw(&mut hart, &[0; 9]).unwrap_err();
        assert!(matches!(error, LoadError::ImageTooLarge { size: 9, memory_size: 8 }));
        loader::load_raw(&mut hart, &[0x13, 0, 0, 0]).unwrap();
        assert_eq!(Ok(0x13), hart.memory().read_word(0));
    }

    #[test]
    fn test_elf_garbage_is_rejected() {
        let mut hart = Hart::new(Config::default(), HandlerTable::default());
        assert!(matches!(
            loader::load_elf(&mut hart, b"not an elf"),
            Err(LoadError::Elf(_))
        ));
    }

    #[test]
    fn test_sigint_after_setup_interrupts_run() {
        let path = std::env::temp_dir().join(format!("risa-sigint-{}.bin", std::process::id()));
        // jal x0, 0
        std::fs::write(&path, 0x0000_006F_u32.to_le_bytes()).unwrap();
        let args = Args::try_parse_from([OsStr::new("risa"), path.as_os_str()]).unwrap();

        let mut hart = setup(&args).unwrap();
        signal_hook::low_level::raise(signal_hook::consts::SIGINT).unwrap();
        assert_eq!(Ok(Halt::Interrupted), hart.run());
        std::fs::remove_file(path).unwrap();
    }
}
