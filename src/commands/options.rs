use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Clone, Debug, StructOpt)]
#[structopt(
    name = "reprotrace",
    about = "Follows a process tree and records its filesystem and exec activity."
)]
pub struct Options {
    #[structopt(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Clone, Debug, StructOpt)]
pub enum SubCommand {
    /// Run a command under the tracer and write its activity as JSON lines.
    Trace {
        /// File the event stream is written to.
        #[structopt(short = "o", long, default_value = "trace.jsonl", parse(from_os_str))]
        output: PathBuf,

        /// Attach to an already-running process instead of spawning one.
        #[structopt(short = "p", long)]
        pid: Option<i32>,

        /// The command to spawn and trace.
        command: Vec<String>,
    },
}
