use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::time::Duration;
use wsperf::interval_reporter::{format_snapshot, format_summary};
use wsperf::{
    run_reported, Config, Mode, ProgressCallback, ProgressEvent, Server, ServerConfig, SpeedTest,
    TestOptions,
};

/// Upper bound for `--rate`, far above anything a socket can carry.
const MAX_RATE_MBPS: f64 = 1_000_000.0;

#[derive(Parser)]
#[command(name = "wsperf")]
#[command(about = "Multi-stream WebSocket throughput test", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the speed-test server
    Server {
        /// Port to listen on
        #[arg(short, long, default_value = "4000")]
        port: u16,

        /// Bind to specific address
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Pace each download stream at this many MB/s
        #[arg(long)]
        rate: Option<f64>,

        /// Use X-Forwarded-For/X-Real-Ip/Forwarded headers for client addresses
        #[arg(long)]
        xff_headers: bool,
    },

    /// Measure throughput against a server
    Client {
        /// Server as host:port or ws://host:port
        target: String,

        /// Number of parallel streams
        #[arg(short = 'P', long, default_value = "1")]
        parallel: usize,

        /// Measure upload instead of download
        #[arg(short, long)]
        upload: bool,

        /// Maximum test duration in seconds
        #[arg(short = 't', long, default_value = "8")]
        time: f64,

        /// Download chunk size to request, in bytes
        #[arg(short = 'l', long, default_value = "100000")]
        length: usize,

        /// Report interval in milliseconds
        #[arg(short, long, default_value = "250")]
        interval: u64,

        /// Output a JSON summary
        #[arg(short = 'J', long)]
        json: bool,
    },
}

/// Converts `--rate` in MB/s to bytes per second.
fn rate_limit(mbps: f64) -> anyhow::Result<u64> {
    anyhow::ensure!(
        mbps > 0.0 && mbps <= MAX_RATE_MBPS,
        "--rate must be between 0 and {} MB/s",
        MAX_RATE_MBPS
    );
    Ok((mbps * 1_000_000.0) as u64)
}

fn parse_test_time(secs: f64) -> anyhow::Result<Duration> {
    anyhow::ensure!(secs > 0.0, "--time must be positive");
    Duration::try_from_secs_f64(secs).map_err(|e| anyhow::anyhow!("--time {}: {}", secs, e))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            port,
            bind,
            rate,
            xff_headers,
        } => {
            let mut config = ServerConfig::new(port).with_forwarded_headers(xff_headers);

            if let Some(addr) = bind {
                config = config.with_bind_addr(addr);
            }
            if let Some(mbps) = rate {
                config = config.with_rate_limit(rate_limit(mbps)?);
            }

            let server = Server::new(config);
            server.run().await?;
        }

        Commands::Client {
            target,
            parallel,
            upload,
            time,
            length,
            interval,
            json,
        } => {
            let max_test_duration = parse_test_time(time)?;
            anyhow::ensure!(interval > 0, "--interval must be positive");
            let mode = if upload { Mode::Upload } else { Mode::Download };

            let config = Config::client(target)
                .with_max_test_duration(max_test_duration)
                .with_download_message_size(length)
                .with_interval(Duration::from_millis(interval))
                .with_json(json);

            let mut test = SpeedTest::new(config)?;
            test.connect(TestOptions::new().with_parallel(parallel).with_mode(mode))
                .await?;

            if !json {
                println!(
                    "Connected {} stream(s) to {}",
                    parallel,
                    test.config().endpoint_url()?
                );
            }

            let printer = move |event: ProgressEvent| {
                if json {
                    return;
                }
                match event {
                    ProgressEvent::TestStarted { mode, .. } => {
                        println!("[ ID]   Interval           Transfer     Bitrate       ({})", mode)
                    }
                    ProgressEvent::Update(snapshot) => println!("{}", format_snapshot(&snapshot)),
                    ProgressEvent::TestCompleted(summary) => println!("{}", format_summary(&summary)),
                }
            };
            let callback: &dyn ProgressCallback = &printer;

            let every = test.config().interval;
            let summary = run_reported(&mut test, every, Some(callback)).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
    }

    Ok(())
}
