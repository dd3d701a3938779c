use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Local};

use crate::Result;
use crate::model::{Member, Role, Server};

pub const MAIN_LOG_FILE_NAME: &str = "main.txt";
pub const MARKER_PREFIX: &str = "backup_";
const MEMBERS_HEADER: &str = "Server Members:\n";

/// One `backup_<N>: <timestamp>` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub sequence: u64,
    pub line: String,
}

pub fn parse_marker(line: &str) -> Option<Marker> {
    let rest = line.strip_prefix(MARKER_PREFIX)?;
    let (number, _) = rest.split_once(':')?;
    let sequence = number.trim().parse().ok()?;
    Some(Marker {
        sequence,
        line: line.to_string(),
    })
}

/// Markers left by earlier runs. A missing file has none.
///
/// Markers always trail the snapshot, so role names that happen to look like
/// markers are not counted.
pub fn read_markers(path: &Path) -> Result<Vec<Marker>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let tail = match raw.rfind(MEMBERS_HEADER) {
        Some(pos) => &raw[pos..],
        None => raw.as_str(),
    };
    Ok(tail.lines().filter_map(parse_marker).collect())
}

/// Each run leaves a start and an end marker with the same number, so runs are
/// counted by distinct numbers.
pub fn next_sequence(markers: &[Marker]) -> u64 {
    let distinct: BTreeSet<u64> = markers.iter().map(|m| m.sequence).collect();
    distinct.len() as u64 + 1
}

pub fn render_snapshot(server: &Server, roles: &[Role], members: &[Member]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Server Name: {}", server.name);
    let _ = writeln!(
        out,
        "Server Description: {}",
        server.description.as_deref().unwrap_or("None")
    );
    out.push_str("Server Roles:\n");
    for role in roles {
        let _ = writeln!(out, "{}", role.name);
    }
    out.push_str(MEMBERS_HEADER);
    for member in members {
        let names: Vec<&str> = roles
            .iter()
            .filter(|role| !role.is_everyone() && member.role_ids.contains(&role.id))
            .map(|role| role.name.as_str())
            .collect();
        let _ = writeln!(
            out,
            "{}#{} - Roles: {}",
            member.name,
            member.discriminator,
            names.join(", ")
        );
    }
    out
}

/// Replaces `main.txt` with a fresh server snapshot followed by the markers of
/// earlier runs, so only markers accumulate.
pub fn write_snapshot(
    path: &Path,
    server: &Server,
    roles: &[Role],
    members: &[Member],
    prior_markers: &[Marker],
) -> Result<()> {
    let mut out = render_snapshot(server, roles, members);
    for marker in prior_markers {
        out.push_str(&marker.line);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

pub fn marker_line(sequence: u64, at: DateTime<Local>) -> String {
    format!(
        "{MARKER_PREFIX}{sequence}: {}",
        at.format("%Y-%m-%d %H:%M:%S")
    )
}

pub fn append_marker(path: &Path, sequence: u64, at: DateTime<Local>) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", marker_line(sequence, at))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn server() -> Server {
        Server {
            id: "1".to_string(),
            name: "Guild".to_string(),
            description: None,
        }
    }

    fn roles() -> Vec<Role> {
        vec![
            Role {
                id: "1".to_string(),
                name: "@everyone".to_string(),
            },
            Role {
                id: "2".to_string(),
                name: "mod".to_string(),
            },
            Role {
                id: "3".to_string(),
                name: "admin".to_string(),
            },
        ]
    }

    #[test]
    fn snapshot_resolves_role_names_without_everyone() {
        let members = vec![
            Member {
                name: "alice".to_string(),
                discriminator: "0".to_string(),
                role_ids: vec!["3".to_string(), "1".to_string(), "2".to_string()],
            },
            Member {
                name: "bob".to_string(),
                discriminator: "1234".to_string(),
                role_ids: vec![],
            },
        ];
        let text = render_snapshot(&server(), &roles(), &members);
        let expected = [
            "Server Name: Guild",
            "Server Description: None",
            "Server Roles:",
            "@everyone",
            "mod",
            "admin",
            "Server Members:",
            "alice#0 - Roles: mod, admin",
            "bob#1234 - Roles: ",
        ]
        .map(|line| format!("{line}\n"))
        .concat();
        assert_eq!(text, expected);
    }

    #[test]
    fn parse_marker_requires_number_and_colon() {
        assert_eq!(
            parse_marker("backup_3: 2024-01-01 00:00:00").map(|m| m.sequence),
            Some(3)
        );
        assert!(parse_marker("backup_x: 2024").is_none());
        assert!(parse_marker("backup_3 2024").is_none());
        assert!(parse_marker("Server Name: backup_1: x").is_none());
    }

    #[test]
    fn role_named_like_marker_is_not_counted() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(MAIN_LOG_FILE_NAME);
        let mut roles = roles();
        roles.push(Role {
            id: "9".to_string(),
            name: "backup_7: trap".to_string(),
        });
        write_snapshot(&path, &server(), &roles, &[], &[]).unwrap();
        assert!(read_markers(&path).unwrap().is_empty());
    }

    #[test]
    fn role_named_like_members_header_does_not_move_anchor() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(MAIN_LOG_FILE_NAME);
        let mut roles = roles();
        for (id, name) in [("8", "Server Members:"), ("9", "backup_7: trap")] {
            roles.push(Role {
                id: id.to_string(),
                name: name.to_string(),
            });
        }
        write_snapshot(&path, &server(), &roles, &[], &[]).unwrap();
        assert!(read_markers(&path).unwrap().is_empty());

        append_marker(&path, 1, Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()).unwrap();
        assert_eq!(next_sequence(&read_markers(&path).unwrap()), 2);
    }

    #[test]
    fn markers_accumulate_across_rewrites() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(MAIN_LOG_FILE_NAME);
        let at = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

        assert!(read_markers(&path).unwrap().is_empty());
        assert_eq!(next_sequence(&[]), 1);

        for expected in 1..=3u64 {
            let prior = read_markers(&path).unwrap();
            let seq = next_sequence(&prior);
            assert_eq!(seq, expected);
            write_snapshot(&path, &server(), &roles(), &[], &prior).unwrap();
            append_marker(&path, seq, at).unwrap();
            append_marker(&path, seq, at).unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("Server Name: Guild").count(), 1);
        let markers = read_markers(&path).unwrap();
        assert_eq!(markers.len(), 6);
        assert_eq!(markers[5].line, "backup_3: 2024-01-02 03:04:05");
    }
}
