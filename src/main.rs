#[macro_use]
mod log;

mod commands;
mod dispatch;
mod error;
mod flags;
mod handlers;
mod kernel_abi;
mod paths;
mod process;
mod ptracer;
mod registers;
mod remote_ptr;
mod sink;
mod syscall_table;
mod tracee_mem;

use crate::commands::options::{Options, SubCommand};
use crate::commands::trace_command::TraceCommand;
use crate::commands::Command;
use crate::log::LogLevel::LogFatal;
use structopt::StructOpt;

fn main() {
    let options = Options::from_args();
    let mut cmd = match options.cmd {
        SubCommand::Trace { .. } => TraceCommand::new(&options),
    };
    if let Err(e) = cmd.run() {
        log!(LogFatal, "{}", e);
        std::process::exit(1);
    }
}
