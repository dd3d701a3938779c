use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::model::{Attachment, BanEntry, Channel, Member, Message, Role, Server};
use crate::{Error, Result};

pub mod discord;

pub type ServiceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Read access to a remote chat server.
///
/// Paged listings end with an empty page. Any call may fail with
/// [`Error::PermissionDenied`] or a transport-level [`Error::Remote`].
pub trait ChatService {
    fn provider(&self) -> &'static str;

    /// `Ok(None)` when the identifier does not resolve to a server.
    fn resolve_server<'a>(&'a self, server_id: &'a str) -> ServiceFuture<'a, Option<Server>>;

    fn list_roles<'a>(&'a self, server_id: &'a str) -> ServiceFuture<'a, Vec<Role>>;

    fn list_members<'a>(&'a self, server_id: &'a str) -> ServiceFuture<'a, Vec<Member>>;

    fn list_channels<'a>(&'a self, server_id: &'a str) -> ServiceFuture<'a, Vec<Channel>>;

    fn ban_page<'a>(
        &'a self,
        server_id: &'a str,
        after: Option<String>,
    ) -> ServiceFuture<'a, Vec<BanEntry>>;

    /// Newest-first page of messages strictly older than `before`.
    fn message_page<'a>(
        &'a self,
        channel_id: &'a str,
        before: Option<String>,
    ) -> ServiceFuture<'a, Vec<Message>>;

    fn download_attachment<'a>(&'a self, attachment: &'a Attachment) -> ServiceFuture<'a, Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanFailure {
    PermissionDenied,
    /// Transport error once this many pages have been served.
    AfterPages(usize),
}

/// Server-wide listings whose transport can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Listing {
    Roles,
    Members,
    Channels,
}

fn transport_error(what: &str) -> Error {
    Error::Remote {
        message: format!("connection reset while listing {what}"),
    }
}

/// Deterministic in-process chat server.
#[derive(Debug)]
pub struct InMemoryService {
    pub downloads: AtomicUsize,
    page_size: usize,
    server: Option<Server>,
    roles: Vec<Role>,
    members: Vec<Member>,
    channels: Vec<Channel>,
    // Chronological (oldest first) per channel id.
    messages: HashMap<String, Vec<Message>>,
    payloads: HashMap<String, Vec<u8>>,
    bans: Vec<BanEntry>,
    denied_channels: HashSet<String>,
    failing_channels: HashSet<String>,
    failing_listings: HashSet<Listing>,
    failing_attachments: HashSet<String>,
    ban_failure: Option<BanFailure>,
}

impl InMemoryService {
    pub fn new(server: Server) -> Self {
        Self {
            downloads: AtomicUsize::new(0),
            page_size: 100,
            server: Some(server),
            roles: Vec::new(),
            members: Vec::new(),
            channels: Vec::new(),
            messages: HashMap::new(),
            payloads: HashMap::new(),
            bans: Vec::new(),
            denied_channels: HashSet::new(),
            failing_channels: HashSet::new(),
            failing_listings: HashSet::new(),
            failing_attachments: HashSet::new(),
            ban_failure: None,
        }
    }

    pub fn without_server() -> Self {
        let mut service = Self::new(Server {
            id: String::new(),
            name: String::new(),
            description: None,
        });
        service.server = None;
        service
    }

    pub fn set_page_size(&mut self, page_size: usize) {
        self.page_size = page_size.max(1);
    }

    pub fn add_role(&mut self, role: Role) {
        self.roles.push(role);
    }

    pub fn add_member(&mut self, member: Member) {
        self.members.push(member);
    }

    pub fn add_channel(&mut self, channel: Channel) {
        self.channels.push(channel);
    }

    /// Appends a message as the newest one in its channel.
    pub fn push_message(&mut self, channel_id: &str, message: Message) {
        self.messages
            .entry(channel_id.to_string())
            .or_default()
            .push(message);
    }

    pub fn set_payload(&mut self, attachment_id: &str, bytes: Vec<u8>) {
        self.payloads.insert(attachment_id.to_string(), bytes);
    }

    pub fn add_ban(&mut self, ban: BanEntry) {
        self.bans.push(ban);
    }

    pub fn deny_channel(&mut self, channel_id: &str) {
        self.denied_channels.insert(channel_id.to_string());
    }

    /// Message history of the channel fails with a transport error.
    pub fn fail_channel(&mut self, channel_id: &str) {
        self.failing_channels.insert(channel_id.to_string());
    }

    pub fn fail_listing(&mut self, listing: Listing) {
        self.failing_listings.insert(listing);
    }

    pub fn fail_attachment(&mut self, attachment_id: &str) {
        self.failing_attachments.insert(attachment_id.to_string());
    }

    pub fn clear_attachment_failures(&mut self) {
        self.failing_attachments.clear();
    }

    pub fn fail_bans(&mut self, failure: BanFailure) {
        self.ban_failure = Some(failure);
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::Relaxed)
    }
}

impl ChatService for InMemoryService {
    fn provider(&self) -> &'static str {
        "test.mem"
    }

    fn resolve_server<'a>(&'a self, server_id: &'a str) -> ServiceFuture<'a, Option<Server>> {
        Box::pin(async move {
            Ok(self
                .server
                .as_ref()
                .filter(|server| server.id == server_id)
                .cloned())
        })
    }

    fn list_roles<'a>(&'a self, _server_id: &'a str) -> ServiceFuture<'a, Vec<Role>> {
        Box::pin(async move {
            if self.failing_listings.contains(&Listing::Roles) {
                return Err(transport_error("roles"));
            }
            Ok(self.roles.clone())
        })
    }

    fn list_members<'a>(&'a self, _server_id: &'a str) -> ServiceFuture<'a, Vec<Member>> {
        Box::pin(async move {
            if self.failing_listings.contains(&Listing::Members) {
                return Err(transport_error("members"));
            }
            Ok(self.members.clone())
        })
    }

    fn list_channels<'a>(&'a self, _server_id: &'a str) -> ServiceFuture<'a, Vec<Channel>> {
        Box::pin(async move {
            if self.failing_listings.contains(&Listing::Channels) {
                return Err(transport_error("channels"));
            }
            Ok(self.channels.clone())
        })
    }

    fn ban_page<'a>(
        &'a self,
        _server_id: &'a str,
        after: Option<String>,
    ) -> ServiceFuture<'a, Vec<BanEntry>> {
        Box::pin(async move {
            let start = match &after {
                Some(id) => self
                    .bans
                    .iter()
                    .position(|b| &b.user_id == id)
                    .map(|pos| pos + 1)
                    .unwrap_or(self.bans.len()),
                None => 0,
            };
            let pages_served = start.div_ceil(self.page_size);
            match self.ban_failure {
                Some(BanFailure::PermissionDenied) => {
                    return Err(Error::PermissionDenied {
                        message: "missing ban members permission".to_string(),
                    });
                }
                Some(BanFailure::AfterPages(n)) if pages_served >= n => {
                    return Err(transport_error("bans"));
                }
                _ => {}
            }
            let end = (start + self.page_size).min(self.bans.len());
            Ok(self.bans[start..end].to_vec())
        })
    }

    fn message_page<'a>(
        &'a self,
        channel_id: &'a str,
        before: Option<String>,
    ) -> ServiceFuture<'a, Vec<Message>> {
        Box::pin(async move {
            if self.denied_channels.contains(channel_id) {
                return Err(Error::PermissionDenied {
                    message: format!("missing access to channel {channel_id}"),
                });
            }
            if self.failing_channels.contains(channel_id) {
                return Err(Error::Remote {
                    message: format!("connection reset while reading channel {channel_id}"),
                });
            }
            let Some(history) = self.messages.get(channel_id) else {
                return Ok(Vec::new());
            };
            let end = match &before {
                Some(id) => history.iter().position(|m| &m.id == id).unwrap_or(0),
                None => history.len(),
            };
            let start = end.saturating_sub(self.page_size);
            Ok(history[start..end].iter().rev().cloned().collect())
        })
    }

    fn download_attachment<'a>(&'a self, attachment: &'a Attachment) -> ServiceFuture<'a, Vec<u8>> {
        Box::pin(async move {
            if self.failing_attachments.contains(&attachment.id) {
                return Err(Error::Remote {
                    message: format!("download failed: {}", attachment.url),
                });
            }
            let bytes = self
                .payloads
                .get(&attachment.id)
                .cloned()
                .ok_or_else(|| Error::Remote {
                    message: format!("attachment not found: {}", attachment.id),
                })?;
            self.downloads.fetch_add(1, Ordering::Relaxed);
            Ok(bytes)
        })
    }
}
