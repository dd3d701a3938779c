use std::path::Path;

use tracing::{debug, error};

use crate::Result;
use crate::filename::{AttachmentIndex, resolve_filename};
use crate::model::{Attachment, Message};
use crate::service::ChatService;
use crate::stats::StatsAggregator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachmentTally {
    pub saved: u64,
    pub reused: u64,
    pub failed: u64,
}

/// Everything one channel's attachment pass writes into.
pub struct AttachmentSink<'a> {
    pub channel_dir: &'a Path,
    pub channel_key: &'a str,
    pub index: &'a mut AttachmentIndex,
    pub stats: &'a mut StatsAggregator,
    pub tally: &'a mut AttachmentTally,
}

/// Stores every attachment of `message` and returns the file names to list in
/// its transcript line, in attachment order.
///
/// Files already on disk are listed but not downloaded or counted again.
/// A failed attachment is logged and left out; it never fails the message.
pub async fn fetch_attachments<S: ChatService>(
    service: &S,
    message: &Message,
    sink: &mut AttachmentSink<'_>,
) -> Vec<String> {
    let mut filenames = Vec::with_capacity(message.attachments.len());
    for attachment in &message.attachments {
        let resolution = match resolve_filename(
            sink.channel_dir,
            &attachment.filename,
            &attachment.id,
            &*sink.index,
        ) {
            Ok(r) => r,
            Err(e) => {
                log_failure(sink, message, attachment, &e);
                continue;
            }
        };

        if resolution.already_exists {
            debug!(
                event = "attachment.reused",
                channel = sink.channel_key,
                filename = %resolution.filename,
                "attachment.reused"
            );
            sink.index.claim(&resolution.filename, &attachment.id);
            sink.tally.reused += 1;
            filenames.push(resolution.filename);
            continue;
        }

        if let Err(e) =
            save_attachment(service, attachment, sink.channel_dir, &resolution.filename).await
        {
            log_failure(sink, message, attachment, &e);
            continue;
        }

        sink.index.claim(&resolution.filename, &attachment.id);
        sink.stats.increment_attachment(sink.channel_key, &message.author);
        sink.tally.saved += 1;
        filenames.push(resolution.filename);
    }
    filenames
}

/// Downloads into a temporary sibling and renames it into place, so a failed
/// write never leaves a file a later run would mistake for a finished one.
async fn save_attachment<S: ChatService>(
    service: &S,
    attachment: &Attachment,
    dir: &Path,
    filename: &str,
) -> Result<()> {
    let bytes = service.download_attachment(attachment).await?;
    let part = dir.join(format!(".{}.part", uuid::Uuid::new_v4().simple()));
    if let Err(e) = std::fs::write(&part, &bytes) {
        let _ = std::fs::remove_file(&part);
        return Err(e.into());
    }
    if let Err(e) = std::fs::rename(&part, dir.join(filename)) {
        let _ = std::fs::remove_file(&part);
        return Err(e.into());
    }
    debug!(
        event = "attachment.saved",
        filename,
        bytes = bytes.len() as u64,
        "attachment.saved"
    );
    Ok(())
}

fn log_failure(
    sink: &mut AttachmentSink<'_>,
    message: &Message,
    attachment: &Attachment,
    e: &crate::Error,
) {
    error!(
        event = "attachment.save_failed",
        channel = sink.channel_key,
        message_id = %message.id,
        attachment = %attachment.filename,
        error = %e,
        "Error saving attachment: {e}"
    );
    sink.tally.failed += 1;
}
