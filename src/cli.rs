use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "timereplay",
    version,
    about = "Replays archived sensor history as a live feed"
)]
pub struct Args {
    /// Storage source URL, e.g. postgres://..., sqlite://..., clickhouse://..., or "memory".
    #[arg(long, default_value = "memory")]
    pub db: String,

    /// Path to a sensor catalog JSON file.
    #[arg(long)]
    pub confile: Option<std::path::PathBuf>,

    /// Initial working list selector (ALL, a set name, a comma list, or a glob).
    #[arg(long, default_value = "ALL")]
    pub slist: String,

    /// Start of the replay range (RFC3339).
    #[arg(long)]
    pub from: Option<String>,

    /// End of the replay range (RFC3339).
    #[arg(long)]
    pub to: Option<String>,

    /// Step duration in seconds.
    #[arg(long, default_value_t = 1.0)]
    pub step: f64,

    /// Prefetch window duration in seconds.
    #[arg(long, default_value_t = 60.0)]
    pub window: f64,

    /// Playback speed multiplier (1.0 = real time).
    #[arg(long, default_value_t = 1.0)]
    pub speed: f64,

    /// Maximum updates per emitted batch.
    #[arg(long, default_value_t = 256)]
    pub batch_size: usize,

    /// Output sink: "stdout" or an http(s) URL of a shared-memory service.
    #[arg(long, default_value = "stdout")]
    pub output: String,

    /// Bind address for the HTTP control surface, e.g. 127.0.0.1:8088.
    #[arg(long)]
    pub http_addr: Option<String>,

    /// Controller staleness threshold in seconds (0 disables reclaiming).
    #[arg(long, default_value_t = 30)]
    pub control_timeout: u64,

    /// Print the archive's available time range for the working list and exit.
    #[arg(long, default_value_t = false)]
    pub show_range: bool,
}
