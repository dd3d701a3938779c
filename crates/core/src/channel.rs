use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::{error, info, warn};

use crate::Result;
use crate::attachments::{AttachmentSink, AttachmentTally, fetch_attachments};
use crate::filename::AttachmentIndex;
use crate::model::{Channel, Message, format_transcript_timestamp};
use crate::service::ChatService;
use crate::stats::StatsAggregator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOutcome {
    Archived { messages: u64 },
    /// The service refused to list the channel.
    PermissionDenied,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelReport {
    pub messages: u64,
    pub attachments: AttachmentTally,
}

/// Archives one channel into `backup_root/<channel>/`.
///
/// Errors never escape: they are logged and reported through the outcome so
/// the caller can move on to the next channel.
pub async fn archive_channel<S: ChatService>(
    service: &S,
    channel: &Channel,
    backup_root: &Path,
    stats: &mut StatsAggregator,
    report: &mut ChannelReport,
) -> ChannelOutcome {
    info!(
        event = "channel.start",
        channel = %channel.name,
        "Backing up channel: {}",
        channel.name
    );
    let dir_name = channel.dir_name();
    let channel_dir = backup_root.join(&dir_name);
    let mut index = AttachmentIndex::load(&channel_dir);

    let result = write_channel(
        service,
        channel,
        &channel_dir,
        &dir_name,
        &mut index,
        stats,
        report,
    )
    .await;

    if channel_dir.is_dir()
        && let Err(e) = index.save(&channel_dir)
    {
        warn!(
            event = "attachment_index.save_failed",
            channel = %channel.name,
            error = %e,
            "attachment_index.save_failed"
        );
    }

    match result {
        Ok(messages) => ChannelOutcome::Archived { messages },
        Err(e) if e.is_permission_denied() => {
            warn!(
                event = "channel.skipped",
                channel = %channel.name,
                error = %e,
                "Skipping channel '{}': no permission to view this channel.",
                channel.name
            );
            ChannelOutcome::PermissionDenied
        }
        Err(e) => {
            error!(
                event = "channel.failed",
                channel = %channel.name,
                error = %e,
                "Error processing channel '{}': {e}",
                channel.name
            );
            ChannelOutcome::Failed
        }
    }
}

async fn write_channel<S: ChatService>(
    service: &S,
    channel: &Channel,
    channel_dir: &Path,
    dir_name: &str,
    index: &mut AttachmentIndex,
    stats: &mut StatsAggregator,
    report: &mut ChannelReport,
) -> Result<u64> {
    std::fs::create_dir_all(channel_dir)?;
    let transcript_name = format!("{dir_name}.txt");
    index.reserve(&transcript_name);
    let mut transcript = BufWriter::new(File::create(channel_dir.join(&transcript_name))?);

    let messages = fetch_history(service, &channel.id).await?;

    let mut written = 0u64;
    for message in &messages {
        let filenames = {
            let mut sink = AttachmentSink {
                channel_dir,
                channel_key: dir_name,
                index: &mut *index,
                stats: &mut *stats,
                tally: &mut report.attachments,
            };
            fetch_attachments(service, message, &mut sink).await
        };
        transcript.write_all(transcript_line(message, &filenames).as_bytes())?;

        stats.increment_message(dir_name, &message.author);
        report.messages += 1;
        written += 1;
    }
    transcript.flush()?;
    Ok(written)
}

/// Full history of a channel, oldest first.
pub async fn fetch_history<S: ChatService>(service: &S, channel_id: &str) -> Result<Vec<Message>> {
    let mut messages: Vec<Message> = Vec::new();
    let mut before: Option<String> = None;
    loop {
        let page = service.message_page(channel_id, before.clone()).await?;
        let Some(oldest) = page.last() else {
            break;
        };
        before = Some(oldest.id.clone());
        messages.extend(page);
    }
    messages.reverse();
    Ok(messages)
}

pub fn transcript_line(message: &Message, filenames: &[String]) -> String {
    let mut line = format!(
        "{} - {}: {}",
        format_transcript_timestamp(&message.created_at),
        message.author,
        message.content
    );
    if !filenames.is_empty() {
        line.push_str(" [Attachments: ");
        line.push_str(&filenames.join(", "));
        line.push(']');
    }
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attachment, Server};
    use crate::service::InMemoryService;
    use chrono::{TimeZone, Utc};

    fn message(id: &str, minute: u32, author: &str) -> Message {
        Message {
            id: id.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
            author: author.to_string(),
            content: format!("msg {id}"),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn transcript_line_lists_attachments_only_when_present() {
        let m = message("1", 0, "alice");
        assert_eq!(
            transcript_line(&m, &[]),
            "2024-05-01 12:00:00+00:00 - alice: msg 1\n"
        );
        assert_eq!(
            transcript_line(&m, &["a.png".to_string(), "b.txt".to_string()]),
            "2024-05-01 12:00:00+00:00 - alice: msg 1 [Attachments: a.png, b.txt]\n"
        );
    }

    #[tokio::test]
    async fn history_is_paged_to_the_end_and_returned_oldest_first() {
        let mut service = InMemoryService::new(Server {
            id: "1".to_string(),
            name: "s".to_string(),
            description: None,
        });
        service.set_page_size(2);
        for i in 0..5 {
            service.push_message("c", message(&format!("m{i}"), i, "bob"));
        }

        let history = fetch_history(&service, "c").await.unwrap();
        let ids: Vec<&str> = history.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn attachment_named_like_transcript_does_not_clobber_it() {
        let temp = tempfile::tempdir().unwrap();
        let mut service = InMemoryService::new(Server {
            id: "1".to_string(),
            name: "s".to_string(),
            description: None,
        });
        let mut m = message("m1", 0, "alice");
        m.attachments.push(Attachment {
            id: "a1".to_string(),
            filename: "general.txt".to_string(),
            url: "mem://a1".to_string(),
            size: 3,
        });
        service.push_message("c", m);
        service.set_payload("a1", b"abc".to_vec());
        let channel = Channel {
            id: "c".to_string(),
            name: "general".to_string(),
            kind: crate::model::ChannelKind::Text,
        };

        let mut stats = StatsAggregator::new();
        let mut report = ChannelReport::default();
        let outcome = archive_channel(&service, &channel, temp.path(), &mut stats, &mut report).await;
        assert_eq!(outcome, ChannelOutcome::Archived { messages: 1 });

        let dir = temp.path().join("general");
        assert_eq!(std::fs::read(dir.join("general_1.txt")).unwrap(), b"abc");
        let transcript = std::fs::read_to_string(dir.join("general.txt")).unwrap();
        assert!(transcript.ends_with("[Attachments: general_1.txt]\n"));
    }
}
