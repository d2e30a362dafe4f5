use clap::Parser;

/// Command-line overrides. Anything not given here comes from the persisted
/// configuration, then from defaults.
#[derive(Parser)]
#[command(name = "anyproxy", about = "Transcoding reverse proxy for LLM chat APIs")]
pub(crate) struct Cli {
    #[arg(long)]
    pub(crate) host: Option<String>,
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// SQLite file holding routes, usage logs and config.
    #[arg(long, default_value = "anyproxy.db")]
    pub(crate) db: String,
    /// Credential clients must present; empty disables the check.
    #[arg(long)]
    pub(crate) credential: Option<String>,
    #[arg(long)]
    pub(crate) redirect_enabled: Option<bool>,
    #[arg(long)]
    pub(crate) redirect_keyword: Option<String>,
    #[arg(long)]
    pub(crate) redirect_target: Option<String>,
}
