//! Telegram Parser setup wizard.
//!
//! Asks for the API credentials and listen port on the terminal and writes
//! `config.toml` into `$PARSER_ROOT` (default: current directory). Without a
//! session token it signs in with a phone number and saves the new session.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use grammers_client::{Client, Config, InitParams, SignInError};
use grammers_session::Session;

struct ConfigParams<'a> {
    api_id: i64,
    api_hash: &'a str,
    session: &'a str,
    phone: &'a str,
    port: u16,
}

/// TOML string literal with escaping.
fn quoted(value: &str) -> String {
    toml::Value::String(value.to_owned()).to_string()
}

/// Optional keys are written commented out when left blank.
fn optional_line(key: &str, value: &str) -> String {
    if value.is_empty() {
        format!("# {key} = \"\"")
    } else {
        format!("{key} = {}", quoted(value))
    }
}

/// Produces a valid config.toml string. Extracted so it can be unit-tested.
fn format_config(p: &ConfigParams<'_>) -> String {
    let api_id = p.api_id;
    let api_hash = quoted(p.api_hash);
    let session_line = optional_line("session", p.session);
    let phone_line = optional_line("phone", p.phone);
    let port = p.port;

    format!(
        r#"[telegram]
api_id = {api_id}
api_hash = {api_hash}
{session_line}
{phone_line}

[server]
host = "0.0.0.0"
port = {port}

[parser]
default_limit = 10
max_limit = 200
order = "newest_first"
lifecycle = "reuse"
fetch_timeout_secs = 60

[heartbeat]
enabled = true
cron = "0 */5 * * * *"
"#
    )
}

fn parse_port(input: &str) -> Result<u16> {
    if input.is_empty() {
        return Ok(10000);
    }
    match input.parse::<u16>() {
        Ok(0) | Err(_) => bail!("Port must be a number between 1 and 65535, got '{input}'"),
        Ok(port) => Ok(port),
    }
}

fn read_line(prompt: &str) -> Result<String> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut buf = String::new();
    io::stdin().read_line(&mut buf)?;
    Ok(buf.trim().to_owned())
}

/// Same encoding the service decodes `session` with.
fn session_token(session: &Session) -> String {
    URL_SAFE_NO_PAD.encode(session.save())
}

fn is_phone_number(input: &str) -> bool {
    let digits = input.strip_prefix('+').unwrap_or(input);
    digits.len() >= 5 && digits.chars().all(|c| c.is_ascii_digit())
}

/// Interactive login: code by Telegram message, then the 2FA password if set.
async fn sign_in(api_id: i32, api_hash: &str, phone: &str) -> Result<String> {
    let client = Client::connect(Config {
        session: Session::new(),
        api_id,
        api_hash: api_hash.to_owned(),
        params: InitParams::default(),
    })
    .await
    .context("Could not reach Telegram")?;

    let token = client
        .request_login_code(phone)
        .await
        .context("Telegram refused to send a login code")?;
    let code = read_line("Login code: ")?;

    let user = match client.sign_in(&token, &code).await {
        Ok(user) => user,
        Err(SignInError::PasswordRequired(password_token)) => {
            let hint = password_token.hint().unwrap_or("none").to_owned();
            let password = read_line(&format!("Two-step password (hint: {hint}): "))?;
            client
                .check_password(password_token, password.as_bytes())
                .await
                .context("Password rejected")?
        }
        Err(e) => bail!("Sign-in failed: {e}"),
    };

    println!("Signed in as {}", user.full_name());
    Ok(session_token(client.session()))
}

async fn run_cli(project_root: &Path) -> Result<()> {
    println!("=== Telegram Parser Setup ===\n");

    let config_path = project_root.join("config.toml");
    if config_path.exists() {
        let answer = read_line(&format!(
            "{} already exists. Overwrite? [y/N]: ",
            config_path.display()
        ))?;
        if !answer.eq_ignore_ascii_case("y") {
            println!("Nothing written.");
            return Ok(());
        }
    }

    let api_id_raw = read_line("API ID: ")?;
    let api_id: i64 = api_id_raw
        .parse()
        .with_context(|| format!("API ID must be a number, got '{api_id_raw}'"))?;
    let api_hash = read_line("API hash: ")?;
    if api_hash.is_empty() {
        bail!("API hash is required");
    }
    let mut session = read_line("Session token (leave blank to sign in with a phone number): ")?;
    let mut phone = String::new();
    if session.is_empty() {
        phone = read_line("Phone number (international format): ")?;
        if !is_phone_number(&phone) {
            bail!("'{phone}' does not look like a phone number");
        }
        let app_id = i32::try_from(api_id).context("API ID is out of range")?;
        session = sign_in(app_id, &api_hash, &phone).await?;
    }
    let port = parse_port(&read_line("Listen port [10000]: ")?)?;

    let config = format_config(&ConfigParams {
        api_id,
        api_hash: &api_hash,
        session: &session,
        phone: &phone,
        port,
    });

    std::fs::write(&config_path, &config)
        .with_context(|| format!("Could not write {}", config_path.display()))?;

    println!("\n✓  config.toml saved to {}", config_path.display());
    println!("   Start the service with:  cargo run");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let project_root =
        PathBuf::from(std::env::var("PARSER_ROOT").unwrap_or_else(|_| ".".to_string()));
    run_cli(&project_root).await
}
