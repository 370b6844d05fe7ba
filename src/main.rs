//! readify server entry point.

use clap::Parser;
use readify::{
    AppState,
    auth::AuthService,
    config::{BookCommand, CacheCommand, Cli, Command, Config, UserCommand},
    db::Database,
    library::Library,
    server,
};
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        let mut config = Config::default();
        config.apply_env();
        config
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "readify=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Some(Command::Init { force }) => cmd_init(force),
        Some(Command::User { action }) => cmd_user(action, &config),
        Some(Command::Book { action }) => cmd_book(action, &config).await,
        Some(Command::Cache { action }) => cmd_cache(action, config).await,
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        None => cmd_serve(config, None).await,
    }
}

fn open_db(config: &Config) -> anyhow::Result<Database> {
    if let Some(parent) = config.database.path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Database::open(&config.database.path)?)
}

/// Initialize config and database.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());

    let config = Config::default();
    open_db(&config)?;
    std::fs::create_dir_all(&config.storage.books_dir)?;
    std::fs::create_dir_all(&config.tts.cache_dir)?;
    println!("Initialized database: {}", config.database.path.display());

    println!("\nEdit config.toml to set your AI and TTS API keys.");
    println!("Then run: readify user add <username> --password <password> --role admin");

    Ok(())
}

/// User management commands.
fn cmd_user(action: UserCommand, config: &Config) -> anyhow::Result<()> {
    let db = open_db(config)?;
    let auth = AuthService::new(
        db,
        config.auth.session_days,
        config.auth.registration_enabled(),
    );

    match action {
        UserCommand::Add {
            username,
            password,
            role,
        } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("Password: ")?,
            };

            let user = auth.create_user(&username, &password, &role)?;
            println!(
                "Created user: {} (role: {}, id: {})",
                user.username, user.role, user.id
            );
        }

        UserCommand::Del { username } => {
            if auth.delete_user(&username)? {
                println!("Deleted user: {}", username);
            } else {
                println!("User not found: {}", username);
            }
        }

        UserCommand::List => {
            let users = auth.list_users()?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!("{:<20} {:<10} {:<36} LAST LOGIN", "USERNAME", "ROLE", "ID");
                println!("{}", "-".repeat(80));
                for user in users {
                    let last_login = user
                        .last_login
                        .map(|ts| {
                            chrono::DateTime::from_timestamp(ts, 0)
                                .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                                .unwrap_or_else(|| "unknown".to_string())
                        })
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "{:<20} {:<10} {:<36} {}",
                        user.username, user.role, user.id, last_login
                    );
                }
            }
        }

        UserCommand::Passwd { username, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("New password: ")?,
            };

            if auth.change_password(&username, &password)? {
                println!("Password changed for: {}", username);
            } else {
                println!("User not found: {}", username);
            }
        }
    }

    Ok(())
}

/// Book management commands.
async fn cmd_book(action: BookCommand, config: &Config) -> anyhow::Result<()> {
    let db = open_db(config)?;

    match action {
        BookCommand::Import { dir, user, workers } => {
            if !dir.is_dir() {
                anyhow::bail!("Not a directory: {}", dir.display());
            }
            let owner = db
                .get_user_by_username(&user)?
                .ok_or_else(|| anyhow::anyhow!("User not found: {}", user))?;

            let library = Library::new(db, config.storage.clone(), &config.reader);
            let summary = tokio::task::spawn_blocking(move || {
                library.import_dir(&owner.id, &dir, workers)
            })
            .await??;

            println!(
                "Imported {} books ({} failed)",
                summary.imported, summary.failed
            );
        }

        BookCommand::List { user } => {
            let owner = db
                .get_user_by_username(&user)?
                .ok_or_else(|| anyhow::anyhow!("User not found: {}", user))?;

            let books = db.list_books(&owner.id, None)?;
            if books.is_empty() {
                println!("No books found.");
            } else {
                println!("{:<36} {:<6} {:>8} {:<11} TITLE", "ID", "FORMAT", "CHAPTERS", "STATUS");
                println!("{}", "-".repeat(90));
                for book in books {
                    println!(
                        "{:<36} {:<6} {:>8} {:<11} {}",
                        book.id, book.format, book.chapter_count, book.processing_status, book.title
                    );
                }
            }
        }
    }

    Ok(())
}

/// Cache maintenance commands.
async fn cmd_cache(action: CacheCommand, config: Config) -> anyhow::Result<()> {
    let db = open_db(&config)?;
    let state = AppState::new(config, db)?;

    match action {
        CacheCommand::Cleanup { days } => {
            let days = days.unwrap_or(state.config.cache.max_age_days);
            let (tts, translation) = state.cleanup_caches(days)?;
            println!(
                "Removed {} audio and {} translation entries idle for {} days",
                tts, translation, days
            );
        }

        CacheCommand::Stats => {
            for (name, stats) in [
                ("tts", state.tts.cache_stats()?),
                ("translation", state.translation.cache_stats()?),
            ] {
                println!(
                    "{:<12} entries: {:<8} hits: {}",
                    name, stats.entries, stats.total_hits
                );
            }
        }
    }

    Ok(())
}

/// Start the server.
async fn cmd_serve(mut config: Config, bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    if let Some(addr) = bind {
        config.server.bind = addr;
    }

    let db = open_db(&config)?;
    std::fs::create_dir_all(&config.storage.books_dir)?;
    std::fs::create_dir_all(&config.tts.cache_dir)?;

    if config.ai.api_key.is_empty() {
        tracing::warn!("No AI API key configured; AI, TTS and translation calls will fail");
    }

    tracing::info!(
        bind = %config.server.bind,
        database = %config.database.path.display(),
        provider = %config.ai.provider,
        "Starting readify server"
    );

    let bind = config.server.bind;
    let state = AppState::new(config, db)?;
    state.spawn_maintenance();

    let app = server::create_router(state);

    let listener = TcpListener::bind(bind).await?;
    tracing::info!(address = %bind, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Prompt for password input.
fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut password = String::new();
    io::stdin().read_line(&mut password)?;

    Ok(password.trim().to_string())
}
