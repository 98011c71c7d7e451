use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "site-validator-console",
    version,
    about = "Web dashboard for the site validation script"
)]
pub(crate) struct Args {
    #[arg(long, default_value = "config/console.toml")]
    pub(crate) config: PathBuf,
    #[arg(long, default_value = "127.0.0.1:15001")]
    pub(crate) listen_addr: String,
    /// Directory for the rolling JSON log; logs go to stderr only when omitted.
    #[arg(long)]
    pub(crate) log_dir: Option<PathBuf>,
    /// Also log to stderr when a log directory is set.
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
}
