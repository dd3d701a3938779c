use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Local};
use tracing::{error, warn};

use crate::Result;
use crate::service::ChatService;

pub const BANS_FILE_NAME: &str = "banned.txt";

/// Rewrites `banned.txt` with one line per banned account.
///
/// The listing does not expose when a ban happened, so every line carries the
/// time of this run. A permission error leaves the file empty; any other error
/// keeps the lines written so far. Only local I/O failures are returned.
pub async fn archive_bans<S: ChatService>(
    service: &S,
    server_id: &str,
    backup_root: &Path,
    now: DateTime<Local>,
) -> Result<u64> {
    let mut out = BufWriter::new(File::create(backup_root.join(BANS_FILE_NAME))?);
    let banned_on = now.format("%Y-%m-%d %H:%M:%S").to_string();

    let mut written = 0u64;
    let mut after: Option<String> = None;
    loop {
        let page = match service.ban_page(server_id, after.clone()).await {
            Ok(page) => page,
            Err(e) if e.is_permission_denied() => {
                warn!(
                    event = "bans.permission_denied",
                    error = %e,
                    "No permission to view the ban list."
                );
                break;
            }
            Err(e) => {
                error!(
                    event = "bans.failed",
                    bans_written = written,
                    error = %e,
                    "Error retrieving ban list: {e}"
                );
                break;
            }
        };
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.user_id.clone());

        for ban in &page {
            writeln!(
                out,
                "{}#{} - Banned on: {banned_on}",
                ban.name, ban.discriminator
            )?;
            written += 1;
        }
    }
    out.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BanEntry, Server};
    use crate::service::{BanFailure, InMemoryService};
    use chrono::TimeZone;

    fn service_with_bans(n: usize) -> InMemoryService {
        let mut service = InMemoryService::new(Server {
            id: "1".to_string(),
            name: "s".to_string(),
            description: None,
        });
        service.set_page_size(2);
        for i in 0..n {
            service.add_ban(BanEntry {
                user_id: format!("u{i}"),
                name: format!("troll{i}"),
                discriminator: "0".to_string(),
            });
        }
        service
    }

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn every_ban_is_written_across_pages() {
        let temp = tempfile::tempdir().unwrap();
        let service = service_with_bans(5);

        let n = archive_bans(&service, "1", temp.path(), fixed_now())
            .await
            .unwrap();
        assert_eq!(n, 5);

        let text = std::fs::read_to_string(temp.path().join(BANS_FILE_NAME)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "troll0#0 - Banned on: 2024-06-01 08:30:00");
        assert_eq!(lines[4], "troll4#0 - Banned on: 2024-06-01 08:30:00");
    }

    #[tokio::test]
    async fn permission_denied_leaves_empty_file() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join(BANS_FILE_NAME), "stale\n").unwrap();
        let mut service = service_with_bans(3);
        service.fail_bans(BanFailure::PermissionDenied);

        let n = archive_bans(&service, "1", temp.path(), fixed_now())
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(
            std::fs::read_to_string(temp.path().join(BANS_FILE_NAME)).unwrap(),
            ""
        );
    }

    #[tokio::test]
    async fn transport_error_keeps_partial_list() {
        let temp = tempfile::tempdir().unwrap();
        let mut service = service_with_bans(5);
        service.fail_bans(BanFailure::AfterPages(1));

        let n = archive_bans(&service, "1", temp.path(), fixed_now())
            .await
            .unwrap();
        assert_eq!(n, 2);
        let text = std::fs::read_to_string(temp.path().join(BANS_FILE_NAME)).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
