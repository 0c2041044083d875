use anyhow::{Context, Result};
use dialoguer::Password;
use std::sync::Arc;

use vidtube_client::auth::{
    AccountUpdate, Attachment, SessionEvent, SessionManager, SignUpProfile, SignUpRequest,
    SqliteCredentialStore, User,
};
use vidtube_client::config::{Command, Config, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    init_logging(&config);

    tracing::debug!(
        api = %config.api_base_url,
        credentials = %config.credential_db_file.display(),
        "Configuration loaded"
    );

    let store = Arc::new(SqliteCredentialStore::open(&config.credential_db_file)?);
    let manager = SessionManager::new(&config.http_settings(), store)?;

    let mut events = manager.session().events();

    let result = run(&manager, command).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    if ended_by_expiry(&seen) {
        eprintln!("Your session has expired. Sign in again with `vidtube login`.");
    }

    result
}

/// Whether the session's last transition was an expiry
///
/// An expiry followed by a sign-out (logout with an expired token) is a
/// sign-out.
fn ended_by_expiry(events: &[SessionEvent]) -> bool {
    matches!(events.last(), Some(SessionEvent::Expired))
}

fn init_logging(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.with_file(true).with_line_number(true).init(),
    }
}

async fn run(manager: &SessionManager, command: Command) -> Result<()> {
    match command {
        Command::Login { email, password } => {
            let password = match password {
                Some(password) => password,
                None => prompt_password("Password", false)?,
            };
            let user = manager.sign_in(&email, &password).await?;
            println!("Signed in as {}", describe(&user));
        }

        Command::Register {
            full_name,
            username,
            email,
            avatar,
            cover_image,
        } => {
            let avatar = match avatar {
                Some(path) => Some(Attachment::from_path(&path).await?),
                None => None,
            };
            let cover_image = match cover_image {
                Some(path) => Some(Attachment::from_path(&path).await?),
                None => None,
            };
            let password = prompt_password("Choose a password", true)?;

            let request = SignUpRequest {
                profile: SignUpProfile {
                    full_name,
                    username,
                    email,
                },
                password,
                avatar,
                cover_image,
            };
            let user = manager.sign_up(request).await?;
            println!("Account created. Signed in as {}", describe(&user));
        }

        Command::Logout => {
            manager.sign_out().await;
            println!("Signed out");
        }

        Command::Whoami => match manager.refresh_current_user().await {
            Some(user) => print_user(&user),
            None => println!("Not signed in"),
        },

        Command::UpdateAccount { full_name, email } => {
            let user = manager
                .update_account(AccountUpdate { full_name, email })
                .await?;
            println!("Account updated");
            print_user(&user);
        }

        Command::ChangePassword => {
            let old_password = prompt_password("Current password", false)?;
            let new_password = prompt_password("New password", true)?;
            manager.change_password(&old_password, &new_password).await?;
            println!("Password changed");
        }

        Command::Avatar { path } => {
            let user = manager.update_avatar(Attachment::from_path(&path).await?).await?;
            println!("Avatar updated: {}", user.avatar_url);
        }

        Command::CoverImage { path } => {
            let user = manager.update_cover_image(Attachment::from_path(&path).await?).await?;
            println!(
                "Cover image updated: {}",
                user.cover_image_url.as_deref().unwrap_or("-")
            );
        }
    }

    Ok(())
}

fn prompt_password(prompt: &str, confirm: bool) -> Result<String> {
    let mut input = Password::new().with_prompt(prompt);
    if confirm {
        input = input.with_confirmation("Confirm password", "Passwords don't match");
    }
    input.interact().context("Failed to read password")
}

fn describe(user: &User) -> String {
    format!("{} (@{})", user.full_name, user.username)
}

fn print_user(user: &User) {
    println!("  Name:     {}", user.full_name);
    println!("  Username: @{}", user.username);
    println!("  Email:    {}", user.email);
    println!("  Avatar:   {}", user.avatar_url);
    if let Some(cover) = &user.cover_image_url {
        println!("  Cover:    {}", cover);
    }
    println!("  Watched:  {} videos", user.watch_history.len());
    println!("  Joined:   {}", user.created_at.format("%Y-%m-%d"));
}
