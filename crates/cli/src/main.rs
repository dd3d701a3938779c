use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use guild_backup_core::config::{Settings, load_settings, settings_path};
use guild_backup_core::logging::{LogFormat, init_logging};
use guild_backup_core::{
    APP_NAME, BackupConfig, BackupOptions, BackupResult, DiscordRestService,
    DiscordRestServiceConfig, Error, ProgressSink, TaskProgress, run_backup_with,
};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "guildbackup")]
#[command(about = "Archive a chat server's channels, attachments, members and bans to disk", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Run {
        #[arg(long)]
        server_id: Option<String>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: true,
        }
    }
}

impl From<Error> for CliError {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidConfig { .. } => Self::new("config.invalid", e.to_string()),
            Error::ServerNotFound { .. } => Self::new("server.not_found", e.to_string()),
            Error::PermissionDenied { .. } => Self::new("remote.permission_denied", e.to_string()),
            Error::Remote { .. } => Self::retryable("remote.failed", e.to_string()),
            Error::Io(_) => Self::new("io.failed", e.to_string()),
            Error::Json(_) => Self::new("io.invalid_json", e.to_string()),
        }
    }
}

struct NdjsonProgressSink;

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: TaskProgress) {
        let line = serde_json::json!({
            "type": "task.progress",
            "phase": p.phase,
            "channel": p.channel,
            "channelsTotal": p.channels_total,
            "channelsDone": p.channels_done,
            "messages": p.messages,
            "attachmentsSaved": p.attachments_saved,
            "attachmentsReused": p.attachments_reused,
            "bans": p.bans,
        });
        println!("{line}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(if cli.json {
        LogFormat::Json
    } else {
        LogFormat::Text
    });

    let json = cli.json;
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e, json);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| {
            std::env::var("GUILDBACKUP_CONFIG_DIR")
                .ok()
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from("."));

    match cli.cmd {
        Command::Run {
            server_id,
            output_dir,
        } => backup_run(&config_dir, server_id, output_dir, cli.json, cli.events).await,
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, cli.json),
        },
    }
}

fn resolve_settings(
    config_dir: &Path,
    server_id: Option<String>,
    output_dir: Option<PathBuf>,
) -> Result<Settings, CliError> {
    let mut settings = load_settings(config_dir)?;
    settings.apply_env();
    if let Some(id) = server_id {
        settings.server_id = id.trim().to_string();
    }
    if let Some(dir) = output_dir {
        settings.output_dir = dir;
    }
    settings.validate()?;
    Ok(settings)
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut settings = load_settings(config_dir)?;
    settings.apply_env();
    let token_present = settings.bot_token().is_ok();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "settingsPath": settings_path(config_dir),
                "settings": settings,
                "secrets": { "botTokenPresent": token_present }
            })
        );
    } else {
        let text = toml::to_string(&settings)
            .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
        println!();
        println!("botTokenPresent={token_present}");
    }
    Ok(())
}

async fn backup_run(
    config_dir: &Path,
    server_id: Option<String>,
    output_dir: Option<PathBuf>,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let settings = resolve_settings(config_dir, server_id, output_dir)?;
    let service = DiscordRestService::new(DiscordRestServiceConfig {
        bot_token: settings.bot_token()?,
        api_base_url: settings.discord.api_base_url.clone(),
        page_size: settings.discord.page_size,
    });

    tracing::info!(event = "run.start", app = APP_NAME, server_id = %settings.server_id, "run.start");
    let sink = NdjsonProgressSink;
    let options = BackupOptions {
        progress: events.then_some(&sink as &dyn ProgressSink),
    };
    let result = run_backup_with(
        &service,
        BackupConfig {
            server_id: settings.server_id.clone(),
            output_dir: settings.output_dir.clone(),
        },
        options,
    )
    .await?;

    print_result(&result, json);
    Ok(())
}

fn print_result(result: &BackupResult, json: bool) {
    if json {
        println!("{}", serde_json::json!({ "result": result }));
        return;
    }
    println!(
        "backup_{}: {} channels archived, {} skipped, {} messages, {} attachments saved ({} reused, {} failed), {} bans",
        result.sequence,
        result.channels_archived,
        result.channels_skipped,
        result.messages,
        result.attachments_saved,
        result.attachments_reused,
        result.attachments_failed,
        result.bans
    );
    println!("Backup process complete.");
}

fn emit_error(e: &CliError, json: bool) {
    if json {
        eprintln!("{}", serde_json::json!({ "error": e }));
    } else {
        eprintln!("error: {} ({})", e.message, e.code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_overrides() {
        let cli = Cli::try_parse_from([
            "guildbackup",
            "--json",
            "run",
            "--server-id",
            "123",
            "--output-dir",
            "/tmp/x",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.cmd {
            Command::Run {
                server_id,
                output_dir,
            } => {
                assert_eq!(server_id.as_deref(), Some("123"));
                assert_eq!(output_dir, Some(PathBuf::from("/tmp/x")));
            }
            Command::Settings { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn core_errors_map_to_codes() {
        let e: CliError = Error::ServerNotFound {
            server_id: "1".to_string(),
        }
        .into();
        assert_eq!(e.code, "server.not_found");
        assert!(!e.retryable);

        let e: CliError = Error::Remote {
            message: "reset".to_string(),
        }
        .into();
        assert_eq!(e.code, "remote.failed");
        assert!(e.retryable);
    }

    #[test]
    fn cli_flags_override_file_settings() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(settings_path(temp.path()), "server_id = \"1\"\n").unwrap();

        let settings = resolve_settings(
            temp.path(),
            Some("777".to_string()),
            Some(PathBuf::from("out")),
        )
        .unwrap();
        assert_eq!(settings.server_id, "777");
        assert_eq!(settings.output_dir, PathBuf::from("out"));
    }
}
