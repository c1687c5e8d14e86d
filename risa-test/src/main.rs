use clap::Parser;
use goblin::elf::Elf;
use log::{error, info};
use risa_cli::loader;
use risa_core::registers::Specifier;
use risa_core::{Config, Halt, HandlerTable, Hart};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, short)]
    // Signature file to output signature to
    signature: Option<PathBuf>,
    // Size of the memory the test is loaded into
    #[arg(long, short, default_value_t = 0x10_0000)]
    mem_size: u32,
    // Give up after this many cycles
    #[arg(long, short, default_value_t = 10_000_000)]
    timeout: u64,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    // Elf file to run
    elf: PathBuf,
}

/// How a test program reported its result.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Verdict {
    Pass,
    Fail,
}

/// Reads the verdict a test leaves in `a1..a3` before `ebreak`: "OK" passes, "ERR" fails.
fn verdict(hart: &Hart, halt: Halt) -> Verdict {
    let registers = hart.registers();
    let mark = [Specifier::A1, Specifier::A2, Specifier::A3].map(|r| registers.x(r));
    match halt {
        Halt::Breakpoint if mark == [b'O' as u32, b'K' as u32, 0] => Verdict::Pass,
        Halt::Exit(0) => Verdict::Pass,
        _ => Verdict::Fail,
    }
}

fn invalid_data(e: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

fn main() -> io::Result<ExitCode> {
    let args = Args::parse();

    stderrlog::new()
        .modules([module_path!(), "risa_cli", "risa_core"])
        .verbosity(2 + usize::from(args.verbose))
        .init()
        .map_err(io::Error::other)?;

    let mut buf = Vec::new();

    let mut file = File::open(&args.elf)?;
    file.read_to_end(&mut buf)?;

    let elf_header = Elf::parse(&buf).map_err(invalid_data)?;

    let config = Config {
        memory_size: args.mem_size,
        timeout: Some(args.timeout),
        ..Config::default()
    };
    let mut hart = Hart::new(config, HandlerTable::default());

    let entry = loader::load_elf(&mut hart, &buf).map_err(invalid_data)?;
    *hart.registers_mut().pc_mut() = entry;

    let verdict = match hart.run() {
        Ok(halt) => verdict(&hart, halt),
        Err(e) => {
            error!("{e}");
            Verdict::Fail
        }
    };

    if let Some(path) = args.signature {
        let mut signature_start = None;
        let mut signature_end = None;
        for sym in elf_header.syms.iter() {
            let Some(name) = elf_header.strtab.get_at(sym.st_name) else {
                continue;
            };
            if name == "begin_signature" {
                signature_start = Some(sym.st_value as u32);
            } else if name == "end_signature" {
                signature_end = Some(sym.st_value as u32);
            }
        }
        let missing = |name| io::Error::new(io::ErrorKind::NotFound, format!("missing symbol `{name}`"));
        let signature_start = signature_start.ok_or_else(|| missing("begin_signature"))?;
        let signature_end = signature_end.ok_or_else(|| missing("end_signature"))?;

        if signature_start % 4 != 0 || signature_end % 4 != 0 || signature_start > signature_end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed signature region",
            ));
        }

        let mut file = File::create(path)?;
        for address in (signature_start..signature_end).step_by(4) {
            let word = hart.memory().read_word(address).map_err(invalid_data)?;
            writeln!(file, "{word:08x}")?;
        }
    }

    match verdict {
        Verdict::Pass => {
            info!("PASS");
            Ok(ExitCode::SUCCESS)
        }
        Verdict::Fail => {
            error!("FAIL");
            Ok(ExitCode::FAILURE)
        }
    }
}
