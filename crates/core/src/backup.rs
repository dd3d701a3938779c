use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::bans::archive_bans;
use crate::channel::{ChannelOutcome, ChannelReport, archive_channel};
use crate::main_log::{
    MAIN_LOG_FILE_NAME, append_marker, next_sequence, read_markers, write_snapshot,
};
use crate::model::sanitize_path_component;
use crate::progress::{ProgressSink, TaskProgress};
use crate::service::ChatService;
use crate::stats::StatsAggregator;
use crate::{Error, Result};

pub const STATS_FILE_NAME: &str = "stats.txt";
pub const BACKUP_DIR_PREFIX: &str = "server_backup_";

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub server_id: String,
    /// Directory that receives `server_backup_<name>/`.
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupResult {
    pub sequence: u64,
    pub root: PathBuf,
    pub channels_total: u64,
    pub channels_archived: u64,
    pub channels_skipped: u64,
    pub messages: u64,
    pub attachments_saved: u64,
    pub attachments_reused: u64,
    pub attachments_failed: u64,
    pub bans: u64,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

#[derive(Default)]
pub struct BackupOptions<'a> {
    pub progress: Option<&'a dyn ProgressSink>,
}

pub async fn run_backup<S: ChatService>(service: &S, config: BackupConfig) -> Result<BackupResult> {
    run_backup_with(service, config, BackupOptions::default()).await
}

/// Runs one full backup of a server.
///
/// Only an unresolvable server or a failure to write the run files under the
/// backup root aborts the run; channel, attachment and ban errors are logged
/// and skipped.
pub async fn run_backup_with<S: ChatService>(
    service: &S,
    config: BackupConfig,
    options: BackupOptions<'_>,
) -> Result<BackupResult> {
    let started_at = Local::now();
    let run_started = Instant::now();
    debug!(
        event = "backup.prepare",
        provider = service.provider(),
        server_id = %config.server_id,
        output_dir = %config.output_dir.display(),
        "backup.prepare"
    );

    let Some(server) = service.resolve_server(&config.server_id).await? else {
        error!(
            event = "backup.server_not_found",
            server_id = %config.server_id,
            "Server not found. Check the server ID."
        );
        return Err(Error::ServerNotFound {
            server_id: config.server_id,
        });
    };

    let root = config.output_dir.join(format!(
        "{BACKUP_DIR_PREFIX}{}",
        sanitize_path_component(&server.name)
    ));
    std::fs::create_dir_all(&root)?;

    // Markers must be read before the snapshot truncates main.txt.
    let main_log = root.join(MAIN_LOG_FILE_NAME);
    let prior_markers = read_markers(&main_log)?;
    let sequence = next_sequence(&prior_markers);
    info!(
        event = "backup.start",
        server = %server.name,
        sequence,
        root = %root.display(),
        "backup.start"
    );

    emit(&options, phase("snapshot"));
    let roles = service.list_roles(&server.id).await.unwrap_or_else(|e| {
        warn!(event = "snapshot.roles_failed", error = %e, "snapshot.roles_failed");
        Vec::new()
    });
    let members = service.list_members(&server.id).await.unwrap_or_else(|e| {
        warn!(event = "snapshot.members_failed", error = %e, "snapshot.members_failed");
        Vec::new()
    });
    write_snapshot(&main_log, &server, &roles, &members, &prior_markers)?;
    append_marker(&main_log, sequence, Local::now())?;

    let channels = match service.list_channels(&server.id).await {
        Ok(channels) => channels,
        Err(e) => {
            error!(event = "channels.list_failed", error = %e, "channels.list_failed");
            Vec::new()
        }
    };
    let text_channels: Vec<_> = channels
        .into_iter()
        .filter(|c| c.kind.has_text_content())
        .collect();

    let mut stats = StatsAggregator::new();
    let mut report = ChannelReport::default();
    let mut channels_archived = 0u64;
    let mut channels_skipped = 0u64;
    let channels_total = text_channels.len() as u64;

    for (done, channel) in text_channels.iter().enumerate() {
        emit(
            &options,
            TaskProgress {
                channel: Some(channel.name.clone()),
                channels_done: Some(done as u64),
                ..counters("channels", channels_total, &report)
            },
        );
        let channel_started = Instant::now();
        match archive_channel(service, channel, &root, &mut stats, &mut report).await {
            ChannelOutcome::Archived { messages } => {
                channels_archived += 1;
                debug!(
                    event = "channel.finish",
                    channel = %channel.name,
                    messages,
                    duration_ms = channel_started.elapsed().as_millis() as u64,
                    "channel.finish"
                );
            }
            ChannelOutcome::PermissionDenied | ChannelOutcome::Failed => channels_skipped += 1,
        }
    }
    emit(
        &options,
        TaskProgress {
            channels_done: Some(channels_total),
            ..counters("channels", channels_total, &report)
        },
    );

    emit(&options, phase("bans"));
    let bans = archive_bans(service, &server.id, &root, Local::now()).await?;

    append_marker(&main_log, sequence, Local::now())?;

    emit(&options, phase("stats"));
    stats.flush(&root.join(STATS_FILE_NAME))?;

    let result = BackupResult {
        sequence,
        root,
        channels_total,
        channels_archived,
        channels_skipped,
        messages: report.messages,
        attachments_saved: report.attachments.saved,
        attachments_reused: report.attachments.reused,
        attachments_failed: report.attachments.failed,
        bans,
        started_at,
        finished_at: Local::now(),
    };
    emit(
        &options,
        TaskProgress {
            channels_done: Some(channels_total),
            bans: Some(bans),
            ..counters("done", channels_total, &report)
        },
    );
    info!(
        event = "backup.finish",
        sequence,
        channels_archived,
        channels_skipped,
        messages = result.messages,
        attachments_saved = result.attachments_saved,
        attachments_reused = result.attachments_reused,
        attachments_failed = result.attachments_failed,
        bans,
        duration_ms = run_started.elapsed().as_millis() as u64,
        "backup.finish"
    );
    Ok(result)
}

fn emit(options: &BackupOptions<'_>, progress: TaskProgress) {
    if let Some(sink) = options.progress {
        sink.on_progress(progress);
    }
}

fn phase(name: &str) -> TaskProgress {
    TaskProgress {
        phase: name.to_string(),
        ..TaskProgress::default()
    }
}

fn counters(name: &str, channels_total: u64, report: &ChannelReport) -> TaskProgress {
    TaskProgress {
        phase: name.to_string(),
        channels_total: Some(channels_total),
        messages: Some(report.messages),
        attachments_saved: Some(report.attachments.saved),
        attachments_reused: Some(report.attachments.reused),
        ..TaskProgress::default()
    }
}
