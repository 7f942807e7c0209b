use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

use feedcore::config::Config;
use feedcore::feed::FeedEntry;
use feedcore::{AppContext, Dimensions, Session};

#[derive(Parser, Debug)]
#[command(name = "feedcore")]
#[command(about = "Inspect the feed, profile and image caches from the command line")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/feedcore/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Act as this user
  #[arg(short, long, env = "FEEDCORE_USER_ID")]
  user_id: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Hydrate, refresh and page through the activity feed
  Feed {
    /// Pages to load after the first
    #[arg(short, long, default_value_t = 1)]
    pages: usize,
  },
  /// Load a profile bundle
  Profile { user_name: String },
  /// Resolve a signed image URL
  Sign {
    url: String,
    #[arg(long, default_value_t = 400)]
    width: u32,
    #[arg(long, default_value_t = 400)]
    height: u32,
  },
  /// Drop the signed-in user's cached state
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log = feedcore::logging::init(&config.log)?;

  let session = match &args.user_id {
    Some(user_id) => Session::signed_in(user_id.clone()),
    None => Session::new(),
  };
  let ctx = AppContext::from_config(config, session)?;

  match args.command {
    Command::Feed { pages } => run_feed(&ctx, pages).await,
    Command::Profile { user_name } => run_profile(&ctx, &user_name).await,
    Command::Sign { url, width, height } => run_sign(&ctx, &url, Dimensions::new(width, height)).await,
    Command::Clear => {
      ctx.clear_all();
      println!("Cleared cached state");
      Ok(())
    }
  }
}

async fn run_feed(ctx: &AppContext, pages: usize) -> Result<()> {
  if ctx.session.user_id().is_err() {
    return Err(eyre!("The feed needs a user. Pass --user-id or set FEEDCORE_USER_ID."));
  }

  ctx.feed.enable_network();
  ctx.feed.ensure_hydrated(false).await?;
  ctx.feed.refresh(true, false).await?;
  for _ in 0..pages {
    if !ctx.feed.view().has_more {
      break;
    }
    ctx.feed.fetch_more().await?;
  }

  let view = ctx.feed.view();
  for entry in &view.entries {
    println!("{}", describe(entry));
  }
  println!(
    "{} entries{}",
    view.entries.len(),
    if view.has_more { ", more available" } else { "" }
  );
  Ok(())
}

fn describe(entry: &FeedEntry) -> String {
  let when = entry.created().format("%Y-%m-%d %H:%M");
  match entry {
    FeedEntry::RefAdd {
      actor, ref_summary, ..
    } => format!("{}  {} added {}", when, actor.display_name, ref_summary.title),
    FeedEntry::InterestJoin {
      actor,
      ref_summary,
      community,
      ..
    } => format!(
      "{}  {} joined {}",
      when,
      actor.display_name,
      community.as_deref().unwrap_or(&ref_summary.title)
    ),
  }
}

async fn run_profile(ctx: &AppContext, user_name: &str) -> Result<()> {
  let bundle = ctx.profiles.get_bundle(user_name).await?;
  let bundle = ctx
    .profiles
    .refresh_backlog(user_name)
    .await
    .unwrap_or(bundle);

  println!("{} ({})", bundle.profile.user_name, bundle.profile.id);
  println!("Grid:");
  for item in &bundle.grid_items {
    println!("  {}  {}", item.created.format("%Y-%m-%d"), item.id);
  }
  println!("Backlog: {} items", bundle.backlog_items.len());
  Ok(())
}

async fn run_sign(ctx: &AppContext, url: &str, dims: Dimensions) -> Result<()> {
  let images = ctx
    .images
    .as_ref()
    .ok_or_else(|| eyre!("Image signing is not configured. Set FEEDCORE_SIGNING_TOKEN or PINATA_JWT."))?;

  let resolved = images.resolve(url, dims).await;
  println!("{}", resolved);
  if images.is_exhausted(url, dims) {
    eprintln!("Signing failed after retries; showing the last known-good URL");
  }
  Ok(())
}
