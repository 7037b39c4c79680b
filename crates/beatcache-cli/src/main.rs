//! beatcache - follow, like and profile sync from the terminal.
//!
//! A thin front end over `beatcache-core`: each invocation restores the
//! persisted session, runs one command and saves the social cache.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use beatcache_core::auth::{AdminGate, CredentialStore, Session};
use beatcache_core::cache::{SocialCache, SystemClock};
use beatcache_core::config::Config;
use beatcache_core::context::DEFAULT_SUGGESTION_LIMIT;
use beatcache_core::models::{NewProfile, ProfileUpdate, UserProfile};
use beatcache_core::mutation::MutationOutcome;
use beatcache_core::store::MemoryStore;
use beatcache_core::sync::SyncEvent;
use beatcache_core::upload::ImageUploader;
use beatcache_core::utils::{format_count, format_date};
use beatcache_core::{ActionError, ProfileStore, UserContext};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

const ENV_DISPLAY_NAME: &str = "BEATCACHE_DISPLAY_NAME";
const ENV_PASSKEY: &str = "BEATCACHE_PASSKEY";

/// Daily log files land in the cache directory with this prefix
const LOG_FILE_PREFIX: &str = "beatcache.log";

/// Demo accounts share this passkey
const DEMO_PASSKEY: &str = "demo1234";

const USAGE: &str = "\
Usage: beatcache [--demo] <command> [args]

Session:
  login [display_name]        Sign in (passkey from BEATCACHE_PASSKEY, keychain or prompt)
  signup <display_name> [name]
  logout
  whoami                      Show the signed-in profile
  update [--display-name X] [--name X] [--bio X] [--image URL]
  upload <image>              Upload a profile image and use it

Social:
  follow <user>  unfollow <user>
  stats [user]   followers [user]   following [user]
  suggest [limit]
  search <query>

Liked songs:
  like <track>   unlike <track>   liked

Other:
  watch                       Run background sync and print changes until Ctrl-C
  admin hash                  Set the admin password
  admin unlock                Check the admin password

--demo runs against an in-process store seeded with sample users
(passkey: demo1234).";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr filtered by RUST_LOG (default `warn`), and to a daily
/// file under `log_dir` when one is available. The returned guard must live
/// until exit so buffered file output is flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file = log_dir
        .filter(|dir| std::fs::create_dir_all(dir).is_ok())
        .map(|dir| tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX)));
    let (file_layer, guard) = match file {
        Some((writer, guard)) => (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let demo = take_flag(&mut args, "--demo");

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config, using defaults: {}", e);
            Config::default()
        }
    };
    config.apply_env();

    let _guard = init_tracing(config.cache_dir().ok().as_deref());
    info!(demo, "beatcache starting");

    let Some(command) = args.first().cloned() else {
        println!("{}", USAGE);
        return Ok(());
    };
    let rest = &args[1..];
    if matches!(command.as_str(), "help" | "--help" | "-h") {
        println!("{}", USAGE);
        return Ok(());
    }
    if command == "admin" {
        return admin(&mut config, rest, demo);
    }

    let mut ctx = if demo {
        demo_context(&config).await?
    } else {
        UserContext::from_config(&config)?
    };
    ctx.start().await;

    let result = run(&mut ctx, &mut config, &command, rest, demo).await;

    if let Err(e) = ctx.persist_cache().await {
        warn!(error = %e, "Failed to save cache snapshot");
    }
    info!("beatcache exiting");
    result
}

/// Remove `flag` from `args`, returning whether it was present.
fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != flag);
    args.len() != before
}

/// Turn an action error into its user-facing message.
fn action<T>(result: Result<T, ActionError>) -> Result<T> {
    result.map_err(|e| anyhow!(e.user_message()))
}

fn require_arg<'a>(rest: &'a [String], what: &str) -> Result<&'a str> {
    rest.first()
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Missing {}. Run `beatcache help` for usage.", what))
}

async fn run(
    ctx: &mut UserContext,
    config: &mut Config,
    command: &str,
    rest: &[String],
    demo: bool,
) -> Result<()> {
    match command {
        "login" => login(ctx, config, rest, demo).await,
        "signup" => signup(ctx, config, rest, demo).await,
        "logout" => {
            action(ctx.logout().await)?;
            println!("Signed out.");
            Ok(())
        }
        "whoami" => whoami(ctx).await,
        "update" => {
            let update = parse_update(rest)?;
            if update.is_empty() {
                bail!("Nothing to update. Pass --display-name, --name, --bio or --image.");
            }
            let profile = action(ctx.update_profile(&update).await)?;
            println!("Profile updated for {}.", profile.display_name);
            Ok(())
        }
        "upload" => {
            let path = PathBuf::from(require_arg(rest, "image path")?);
            let uploader = ImageUploader::from_config(config)?;
            let url = action(uploader.upload_file(&path).await)?;
            let update = ProfileUpdate {
                profile_image: Some(url.clone()),
                ..Default::default()
            };
            action(ctx.update_profile(&update).await)?;
            println!("Profile image set to {}", url);
            Ok(())
        }
        "follow" | "unfollow" => {
            let target = resolve_user(ctx, require_arg(rest, "user")?).await?;
            let outcome = if command == "follow" {
                action(ctx.follow(&target).await)?
            } else {
                action(ctx.unfollow(&target).await)?
            };
            print_outcome(command, &target, outcome);
            Ok(())
        }
        "stats" => {
            let user_id = user_or_me(ctx, rest).await?;
            let stats = action(ctx.user_stats(&user_id).await)?;
            let age = ctx.stats_age(&user_id).await.unwrap_or_default();
            println!(
                "{} followers, {} following ({})",
                format_count(stats.followers),
                format_count(stats.following),
                age
            );
            Ok(())
        }
        "followers" | "following" => {
            let user_id = user_or_me(ctx, rest).await?;
            let ids = if command == "followers" {
                action(ctx.followers_of(&user_id).await)?
            } else {
                action(ctx.following_of(&user_id).await)?
            };
            if ids.is_empty() {
                println!("Nobody yet.");
            }
            for id in ids {
                println!("{}", id);
            }
            Ok(())
        }
        "like" | "unlike" => {
            let track = require_arg(rest, "track id")?;
            let outcome = if command == "like" {
                action(ctx.like(track).await)?
            } else {
                action(ctx.unlike(track).await)?
            };
            print_outcome(command, track, outcome);
            Ok(())
        }
        "liked" => {
            let tracks = ctx.liked_songs().await;
            println!("{} liked songs", tracks.len());
            for track in tracks {
                println!("  {}", track);
            }
            Ok(())
        }
        "suggest" => {
            let limit = match rest.first() {
                Some(n) => n.parse().context("Limit must be a number")?,
                None => DEFAULT_SUGGESTION_LIMIT,
            };
            let users = action(ctx.suggested_users(limit).await)?;
            if users.is_empty() {
                println!("No suggestions right now.");
            }
            for user in users {
                println!("{:<20} {}", user.display_name, user.name);
            }
            Ok(())
        }
        "search" => {
            let query = rest.join(" ");
            let users = action(ctx.search_users(&query).await)?;
            println!("{} matches", users.len());
            for user in users {
                println!("{:<20} {:<24} {}", user.display_name, user.name, user.id);
            }
            Ok(())
        }
        "watch" => watch(ctx).await,
        other => bail!("Unknown command: {}. Run `beatcache help` for usage.", other),
    }
}

// ============================================================================
// Session commands
// ============================================================================

fn prompt_passkey(prompt: &str) -> Result<String> {
    rpassword::prompt_password(prompt).context("Failed to read passkey")
}

/// Passkey from the environment, then the keychain, then a prompt.
fn passkey_for(display_name: &str) -> Result<String> {
    if let Ok(passkey) = std::env::var(ENV_PASSKEY) {
        if !passkey.is_empty() {
            return Ok(passkey);
        }
    }
    if let Ok(passkey) = CredentialStore::get_passkey(display_name) {
        return Ok(passkey);
    }
    prompt_passkey("Passkey: ")
}

fn remember(config: &mut Config, display_name: &str, passkey: &str, demo: bool) {
    if demo {
        return;
    }
    config.last_display_name = Some(display_name.to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
    if let Err(e) = CredentialStore::store(display_name, passkey) {
        warn!(error = %e, "Failed to remember passkey");
    }
}

async fn login(ctx: &mut UserContext, config: &mut Config, rest: &[String], demo: bool) -> Result<()> {
    let display_name = rest
        .first()
        .cloned()
        .or_else(|| std::env::var(ENV_DISPLAY_NAME).ok())
        .or_else(|| config.last_display_name.clone())
        .ok_or_else(|| anyhow!("Missing display name."))?;
    let passkey = if demo {
        DEMO_PASSKEY.to_string()
    } else {
        passkey_for(&display_name)?
    };

    let profile = match ctx.login(&display_name, &passkey).await {
        Ok(profile) => profile,
        Err(ActionError::CredentialMismatch) => {
            // A stale remembered passkey should not keep failing
            let _ = CredentialStore::delete(&display_name);
            bail!(ActionError::CredentialMismatch.user_message());
        }
        Err(e) => bail!(e.user_message()),
    };
    remember(config, &profile.display_name, &passkey, demo);
    println!("Signed in as {}.", profile.display_name);
    Ok(())
}

async fn signup(ctx: &mut UserContext, config: &mut Config, rest: &[String], demo: bool) -> Result<()> {
    let display_name = require_arg(rest, "display name")?.to_string();
    let name = match rest.get(1..).map(|r| r.join(" ")) {
        Some(name) if !name.trim().is_empty() => name,
        _ => display_name.clone(),
    };
    let passkey = prompt_passkey("Choose a passkey: ")?;
    if prompt_passkey("Repeat passkey: ")? != passkey {
        bail!("Passkeys do not match.");
    }

    let new = NewProfile {
        display_name,
        name,
        passkey: passkey.clone(),
        bio: String::new(),
        profile_image: None,
    };
    let profile = action(ctx.sign_up(&new).await)?;
    remember(config, &profile.display_name, &passkey, demo);
    println!("Welcome, {}!", profile.display_name);
    Ok(())
}

async fn whoami(ctx: &UserContext) -> Result<()> {
    if ctx.current_user().await.is_none() {
        println!("Not signed in.");
        return Ok(());
    }
    ctx.reconcile_now().await;
    let Some(profile) = ctx.current_user().await else {
        println!("Your account no longer exists; you have been signed out.");
        return Ok(());
    };
    print_profile(&profile);
    if let Ok(stats) = ctx.user_stats(&profile.id).await {
        println!(
            "Followers:   {}   Following: {}",
            format_count(stats.followers),
            format_count(stats.following)
        );
    }
    Ok(())
}

fn print_profile(profile: &UserProfile) {
    println!("{} ({})", profile.display_name, profile.id);
    if !profile.name.is_empty() {
        println!("Name:        {}", profile.name);
    }
    if !profile.bio.is_empty() {
        println!("Bio:         {}", profile.bio);
    }
    if let Some(ref image) = profile.profile_image {
        if !image.starts_with("data:") {
            println!("Image:       {}", image);
        }
    }
    println!("Liked songs: {}", profile.liked_count());
    println!(
        "Logins:      {} (last {})",
        profile.login_count,
        format_date(profile.last_login.as_ref())
    );
}

fn parse_update(rest: &[String]) -> Result<ProfileUpdate> {
    let mut update = ProfileUpdate::default();
    let mut iter = rest.iter();
    while let Some(flag) = iter.next() {
        let value = iter
            .next()
            .cloned()
            .ok_or_else(|| anyhow!("Missing value for {}", flag))?;
        match flag.as_str() {
            "--display-name" => update.display_name = Some(value),
            "--name" => update.name = Some(value),
            "--bio" => update.bio = Some(value),
            "--image" => update.profile_image = Some(value),
            other => bail!("Unknown option: {}", other),
        }
    }
    Ok(update)
}

// ============================================================================
// Social helpers
// ============================================================================

/// Accept either a display name or a user id.
async fn resolve_user(ctx: &UserContext, name_or_id: &str) -> Result<String> {
    let matches = action(ctx.search_users(name_or_id).await)?;
    Ok(matches
        .into_iter()
        .find(|u| u.display_name.eq_ignore_ascii_case(name_or_id))
        .map(|u| u.id)
        .unwrap_or_else(|| name_or_id.to_string()))
}

async fn user_or_me(ctx: &UserContext, rest: &[String]) -> Result<String> {
    match rest.first() {
        Some(user) => resolve_user(ctx, user).await,
        None => ctx
            .current_user()
            .await
            .map(|p| p.id)
            .ok_or_else(|| anyhow!(ActionError::NotSignedIn.user_message())),
    }
}

fn print_outcome(command: &str, target: &str, outcome: MutationOutcome) {
    match outcome {
        MutationOutcome::Applied => println!("Done: {} {}", command, target),
        MutationOutcome::Unchanged => println!("Nothing to do: {} is already in that state", target),
        MutationOutcome::Pending => println!("Still working on the previous {} of {}", command, target),
    }
}

// ============================================================================
// Watch
// ============================================================================

fn describe(event: &SyncEvent) -> String {
    match event {
        SyncEvent::SessionRestored(p) => format!("session restored for {}", p.display_name),
        SyncEvent::SessionStarted(p) => format!("signed in as {}", p.display_name),
        SyncEvent::SessionRefreshed(p) => format!("profile refreshed ({})", p.display_name),
        SyncEvent::SessionRevoked { user_id } => format!("account {} no longer exists, signed out", user_id),
        SyncEvent::SessionEnded { user_id } => format!("signed out {}", user_id),
        SyncEvent::LikedSongsChanged { count, .. } => format!("liked songs now {}", count),
        SyncEvent::StatsCorrected { user_id, stats } => format!(
            "{}: {} followers, {} following",
            user_id, stats.followers, stats.following
        ),
        SyncEvent::FollowConfirmed {
            follower_id,
            followee_id,
            following,
        } => format!(
            "{} {} {}",
            follower_id,
            if *following { "follows" } else { "does not follow" },
            followee_id
        ),
        SyncEvent::SyncFailed { operation, error } => format!("{} failed: {}", operation, error),
    }
}

async fn watch(ctx: &mut UserContext) -> Result<()> {
    let mut events = ctx
        .take_events()
        .ok_or_else(|| anyhow!("Event channel already taken"))?;
    if !ctx.start_background_sync().await {
        bail!(ActionError::NotSignedIn.user_message());
    }
    println!("Watching for changes. Press Ctrl-C to stop.");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), describe(&event));
                if matches!(event, SyncEvent::SessionRevoked { .. }) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    ctx.stop_background_sync();
    Ok(())
}

// ============================================================================
// Admin
// ============================================================================

fn admin(config: &mut Config, rest: &[String], demo: bool) -> Result<()> {
    match rest.first().map(String::as_str) {
        Some("hash") => {
            let password = rpassword::prompt_password("New admin password: ")
                .context("Failed to read password")?;
            if password.is_empty() {
                bail!("Password cannot be empty.");
            }
            config.admin_password_hash = Some(AdminGate::hash_password(&password)?);
            if !demo {
                config.save()?;
            }
            println!("Admin password set.");
            Ok(())
        }
        Some("unlock") => {
            let mut gate = AdminGate::new(
                config.admin_password_hash.clone(),
                config.sync.admin_token_ttl(),
                Arc::new(SystemClock),
            );
            let password = rpassword::prompt_password("Admin password: ")
                .context("Failed to read password")?;
            action(gate.unlock(&password))?;
            println!(
                "Admin unlocked for {} minutes.",
                config.sync.admin_token_ttl().as_secs() / 60
            );
            Ok(())
        }
        _ => bail!("Usage: beatcache admin <hash|unlock>"),
    }
}

// ============================================================================
// Demo mode
// ============================================================================

/// Sample users: (display name, name, bio)
const DEMO_USERS: &[(&str, &str, &str)] = &[
    ("demo", "Demo Listener", "Trying things out"),
    ("nova", "Nova Reyes", "Synthwave and late-night drives"),
    ("orbit", "Orbit Kahale", "Ambient, drone, field recordings"),
    ("lumen", "Lumen Achterberg", "Mostly jazz"),
    ("static_bloom", "", "Noise pop forever"),
];

/// Follow edges between sample users, by index into `DEMO_USERS`
const DEMO_FOLLOWS: &[(usize, usize)] = &[(1, 0), (2, 0), (1, 2), (3, 1), (4, 1)];

/// Seed an in-process store. Creation order is fixed so ids stay stable
/// across runs and a demo session survives a restart.
async fn demo_store() -> Result<MemoryStore> {
    let store = MemoryStore::new();
    let mut ids = Vec::new();
    for (display_name, name, bio) in DEMO_USERS {
        let profile = store
            .create_profile(&NewProfile {
                display_name: display_name.to_string(),
                name: name.to_string(),
                passkey: DEMO_PASSKEY.to_string(),
                bio: bio.to_string(),
                profile_image: None,
            })
            .await?;
        ids.push(profile.id);
    }
    for &(follower, followee) in DEMO_FOLLOWS {
        store.follow(&ids[follower], &ids[followee]).await?;
    }
    for track in ["track-0042", "track-1337"] {
        store.like_song(&ids[1], track).await?;
    }
    Ok(store)
}

async fn demo_context(config: &Config) -> Result<UserContext> {
    let store = demo_store().await.context("Failed to seed demo store")?;
    let dir = std::env::temp_dir().join("beatcache-demo");
    Ok(UserContext::new(
        Arc::new(store),
        Session::new(dir.clone()),
        SocialCache::new(Arc::new(SystemClock), config.sync.cache_ttls()).with_snapshot_dir(dir),
        config.sync,
    ))
}
