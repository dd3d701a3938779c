mod attachments;
mod backup;
mod bans;
mod channel;
pub mod config;
mod error;
mod filename;
pub mod logging;
pub mod main_log;
pub mod model;
mod progress;
pub mod service;
mod stats;

pub const APP_NAME: &str = "GuildBackup";

pub use attachments::{AttachmentSink, AttachmentTally, fetch_attachments};
pub use backup::{
    BACKUP_DIR_PREFIX, BackupConfig, BackupOptions, BackupResult, STATS_FILE_NAME, run_backup,
    run_backup_with,
};
pub use bans::{BANS_FILE_NAME, archive_bans};
pub use channel::{ChannelOutcome, ChannelReport, archive_channel, fetch_history, transcript_line};
pub use error::{Error, Result};
pub use filename::{AttachmentIndex, INDEX_FILE_NAME, Resolution, resolve_filename};
pub use progress::{ProgressSink, TaskProgress};
pub use service::discord::{DiscordRestService, DiscordRestServiceConfig};
pub use service::{BanFailure, ChatService, InMemoryService, Listing};
pub use stats::{OrderedMap, StatsAggregator, StatsCounter};
