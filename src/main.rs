mod broadcasters;
mod clip;
mod config;
mod download;
mod filter;
mod pipeline;
mod retry;
mod scoring;
mod selector;
mod twitch;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use clap::{Args, Parser, Subcommand};
use log::info;

use crate::broadcasters::{from_streams, match_logins, read_roster, write_roster, Broadcaster};
use crate::clip::day_folder;
use crate::config::{ClipperConfig, DEFAULT_CONFIG_PATH};
use crate::pipeline::Pipeline;
use crate::retry::RetryPolicy;
use crate::twitch::TwitchClient;

#[derive(Parser)]
#[command(name = "twitch_clipper")]
#[command(about = "Fetch, rank and download recent Twitch clips", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON config file; defaults apply when it does not exist
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rank and download clips for every broadcaster in the roster
    Run {
        #[command(flatten)]
        overrides: Overrides,
        /// Broadcaster roster (overrides the config)
        #[arg(short, long)]
        broadcasters: Option<PathBuf>,
        /// Print the selection without downloading anything
        #[arg(long)]
        dry_run: bool,
        /// With --dry-run, print the selection as JSON
        #[arg(long, requires = "dry_run")]
        json: bool,
    },

    /// Download the top clips of a single broadcaster
    Specify {
        /// Twitch login of the broadcaster
        login: String,
        /// Number of clips to keep
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
        /// Lookback window in hours
        #[arg(long, default_value = "48")]
        hours: u32,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, requires = "dry_run")]
        json: bool,
    },

    /// Look up broadcaster ids by login and write the roster file
    Resolve {
        /// Twitch logins
        #[arg(required = true)]
        logins: Vec<String>,
        /// Where to write the roster (defaults to the configured path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a roster of the most watched live channels in a game
    Discover {
        /// Exact game name, e.g. "League of Legends"
        game: String,
        /// Number of channels to take
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
        /// Where to write the roster (defaults to the configured path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct Overrides {
    /// Lookback window in hours
    #[arg(long)]
    hours: Option<u32>,
    /// Clips kept per broadcaster
    #[arg(short = 'n', long)]
    per_broadcaster: Option<usize>,
    /// Keep only the N most viewed clips across all broadcasters
    #[arg(long)]
    top: Option<usize>,
    /// Only keep clips from this game/category id
    #[arg(long)]
    category: Option<String>,
    /// Drop clips without a source VOD inside the window
    #[arg(long)]
    require_vod: bool,
    /// Base path for the day folder
    #[arg(short, long)]
    out: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut ClipperConfig) {
        let pipeline = &mut config.pipeline;
        if let Some(hours) = self.hours {
            pipeline.lookback_window_hours = hours;
        }
        if let Some(n) = self.per_broadcaster {
            pipeline.clips_per_broadcaster = n;
        }
        if let Some(top) = self.top {
            pipeline.only_download_most_viewed = true;
            pipeline.global_top_count = top;
        }
        if self.category.is_some() {
            pipeline.category_filter_id = self.category;
        }
        if self.require_vod {
            pipeline.require_linked_recording = true;
        }
        if let Some(out) = self.out {
            config.paths.base_download_path = out;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = ClipperConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run {
            overrides,
            broadcasters,
            dry_run,
            json,
        } => {
            overrides.apply(&mut config);
            if let Some(path) = broadcasters {
                config.paths.broadcasters_file = path;
            }
            config.validate()?;

            let roster = read_roster(&config.paths.broadcasters_file)?;
            let client = TwitchClient::from_env().await?;
            run(&config, &client, &roster, Mode::from_flags(dry_run, json)).await
        }
        Commands::Specify {
            login,
            count,
            hours,
            dry_run,
            json,
        } => {
            config.pipeline.clips_per_broadcaster = count;
            config.pipeline.lookback_window_hours = hours;
            config.pipeline.only_download_most_viewed = false;
            config.validate()?;

            let client = TwitchClient::from_env().await?;
            let logins = vec![login.clone()];
            let users = client.users_by_login(&logins).await?;
            let roster = match_logins(&logins, &users);
            if roster.is_empty() {
                bail!("Twitch user {login} not found");
            }
            run(&config, &client, &roster, Mode::from_flags(dry_run, json)).await
        }
        Commands::Resolve { logins, output } => {
            let client = TwitchClient::from_env().await?;
            let users = client.users_by_login(&logins).await?;
            let roster = match_logins(&logins, &users);

            let path = output.unwrap_or(config.paths.broadcasters_file);
            write_roster(&path, &roster)?;
            println!("Wrote {} broadcasters to {}", roster.len(), path.display());
            Ok(())
        }
        Commands::Discover {
            game,
            count,
            output,
        } => {
            let client = TwitchClient::from_env().await?;
            let Some(game_id) = client.game_id(&game).await? else {
                bail!("Game {game} not found");
            };
            let streams = client.top_streams(&game_id, count).await?;
            for stream in &streams {
                println!("{} - {} viewers", stream.user_name, stream.viewer_count);
            }

            let roster = from_streams(&streams);
            let path = output.unwrap_or(config.paths.broadcasters_file);
            write_roster(&path, &roster)?;
            println!("Wrote {} broadcasters to {}", roster.len(), path.display());
            Ok(())
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Download,
    DryRun,
    DryRunJson,
}

impl Mode {
    fn from_flags(dry_run: bool, json: bool) -> Self {
        match (dry_run, json) {
            (true, true) => Mode::DryRunJson,
            (true, false) => Mode::DryRun,
            _ => Mode::Download,
        }
    }
}

async fn run(
    config: &ClipperConfig,
    client: &TwitchClient,
    roster: &[Broadcaster],
    mode: Mode,
) -> Result<()> {
    let pipeline = Pipeline::new(&config.pipeline, client);
    let now = Utc::now();

    if mode == Mode::DryRunJson {
        let selection = pipeline.select(roster, now).await?;
        println!("{}", serde_json::to_string_pretty(&selection.clips)?);
        return Ok(());
    }

    if mode == Mode::DryRun {
        let selection = pipeline.select(roster, now).await?;
        for (i, scored) in selection.clips.iter().enumerate() {
            println!(
                "{:>3}. {:<32} {:>7} views  index {:.3}",
                i + 1,
                scored.clip.broadcaster_name,
                scored.clip.view_count,
                scored.view_index()
            );
        }
        println!(
            "Selected {} of {} fetched clips ({} filtered out)",
            selection.clips.len(),
            selection.stats.fetched,
            selection.stats.dropped_total()
        );
        return Ok(());
    }

    let dest = day_folder(&config.paths.base_download_path, Local::now().date_naive());
    info!("Downloading into {}", dest.display());
    let retry = RetryPolicy::new(config.pipeline.max_retries, config.pipeline.retry_delay());
    let downloader = download::from_config(&config.download, retry)
        .context("failed to set up the clip downloader")?;

    let summary = pipeline.run(roster, downloader.as_ref(), &dest, now).await?;
    println!("{summary}");
    Ok(())
}
