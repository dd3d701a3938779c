use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::{ChatService, ServiceFuture};
use crate::model::{Attachment, BanEntry, Channel, ChannelKind, Member, Message, Role, Server};
use crate::{Error, Result};

pub const DEFAULT_API_BASE_URL: &str = "https://discord.com/api/v10";
const MAX_ATTEMPTS: u32 = 3;
const MEMBER_PAGE_LIMIT: u32 = 1000;
const BAN_PAGE_LIMIT: u32 = 1000;

#[derive(Debug, Clone)]
pub struct DiscordRestServiceConfig {
    pub bot_token: String,
    pub api_base_url: String,
    /// Messages per history request (1..=100).
    pub page_size: u32,
}

pub struct DiscordRestService {
    config: DiscordRestServiceConfig,
    client: reqwest::Client,
}

impl DiscordRestService {
    pub fn new(config: DiscordRestServiceConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    /// Sends a request, waiting out rate limits. Returns `Ok(None)` on 404.
    async fn send(
        &self,
        url: &str,
        query: &[(&str, String)],
        authorized: bool,
    ) -> Result<Option<reqwest::Response>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut req = self.client.get(url).query(query);
            if authorized {
                req = req.header(
                    reqwest::header::AUTHORIZATION,
                    format!("Bot {}", self.config.bot_token),
                );
            }
            let res = req.send().await.map_err(|e| Error::Remote {
                message: format!("request failed: {e}"),
            })?;

            let status = res.status();
            if status.is_success() {
                return Ok(Some(res));
            }
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }

            let body = res.text().await.unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_ATTEMPTS {
                let wait = retry_after_secs(&body).unwrap_or(1.0);
                warn!(
                    event = "io.discord.rate_limited",
                    url,
                    attempt,
                    retry_after_secs = wait,
                    "io.discord.rate_limited"
                );
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                continue;
            }
            if status == StatusCode::FORBIDDEN {
                return Err(Error::PermissionDenied {
                    message: format!("http {status}: {body}"),
                });
            }
            return Err(Error::Remote {
                message: format!("http {status}: {body}"),
            });
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>> {
        let Some(res) = self.send(&self.url(path), query, true).await? else {
            return Ok(None);
        };
        let body = res.text().await.map_err(|e| Error::Remote {
            message: format!("read response failed: {e}"),
        })?;
        let parsed = serde_json::from_str(&body).map_err(|e| Error::Remote {
            message: format!("invalid json: {e}; path={path}"),
        })?;
        Ok(Some(parsed))
    }

    async fn get_list<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        self.get_json(path, query)
            .await?
            .ok_or_else(|| Error::Remote {
                message: format!("not found: {path}"),
            })
    }
}

impl ChatService for DiscordRestService {
    fn provider(&self) -> &'static str {
        "discord.rest"
    }

    fn resolve_server<'a>(&'a self, server_id: &'a str) -> ServiceFuture<'a, Option<Server>> {
        Box::pin(async move {
            let guild: Option<WireGuild> =
                self.get_json(&format!("/guilds/{server_id}"), &[]).await?;
            Ok(guild.map(|g| Server {
                id: g.id,
                name: g.name,
                description: g.description,
            }))
        })
    }

    fn list_roles<'a>(&'a self, server_id: &'a str) -> ServiceFuture<'a, Vec<Role>> {
        Box::pin(async move {
            let mut roles: Vec<WireRole> = self
                .get_list(&format!("/guilds/{server_id}/roles"), &[])
                .await?;
            roles.sort_by_key(|r| r.position);
            Ok(roles
                .into_iter()
                .map(|r| Role {
                    id: r.id,
                    name: r.name,
                })
                .collect())
        })
    }

    fn list_members<'a>(&'a self, server_id: &'a str) -> ServiceFuture<'a, Vec<Member>> {
        Box::pin(async move {
            let path = format!("/guilds/{server_id}/members");
            let mut out = Vec::new();
            let mut after: Option<String> = None;
            loop {
                let mut query = vec![("limit", MEMBER_PAGE_LIMIT.to_string())];
                if let Some(id) = &after {
                    query.push(("after", id.clone()));
                }
                let page: Vec<WireMember> = self.get_list(&path, &query).await?;
                let full_page = page.len() as u32 >= MEMBER_PAGE_LIMIT;
                after = page.last().map(|m| m.user.id.clone());
                out.extend(page.into_iter().map(|m| Member {
                    name: m.user.username,
                    discriminator: m.user.discriminator,
                    role_ids: m.roles,
                }));
                if !full_page || after.is_none() {
                    return Ok(out);
                }
            }
        })
    }

    fn list_channels<'a>(&'a self, server_id: &'a str) -> ServiceFuture<'a, Vec<Channel>> {
        Box::pin(async move {
            let channels: Vec<WireChannel> = self
                .get_list(&format!("/guilds/{server_id}/channels"), &[])
                .await?;
            Ok(channels
                .into_iter()
                .map(|c| Channel {
                    kind: channel_kind(c.kind),
                    id: c.id,
                    name: c.name.unwrap_or_default(),
                })
                .collect())
        })
    }

    fn ban_page<'a>(
        &'a self,
        server_id: &'a str,
        after: Option<String>,
    ) -> ServiceFuture<'a, Vec<BanEntry>> {
        Box::pin(async move {
            let mut query = vec![("limit", BAN_PAGE_LIMIT.to_string())];
            if let Some(id) = after {
                query.push(("after", id));
            }
            let bans: Vec<WireBan> = self
                .get_list(&format!("/guilds/{server_id}/bans"), &query)
                .await?;
            Ok(bans
                .into_iter()
                .map(|b| BanEntry {
                    user_id: b.user.id,
                    name: b.user.username,
                    discriminator: b.user.discriminator,
                })
                .collect())
        })
    }

    fn message_page<'a>(
        &'a self,
        channel_id: &'a str,
        before: Option<String>,
    ) -> ServiceFuture<'a, Vec<Message>> {
        Box::pin(async move {
            let mut query = vec![("limit", self.config.page_size.to_string())];
            if let Some(id) = before {
                query.push(("before", id));
            }
            let messages: Vec<WireMessage> = self
                .get_list(&format!("/channels/{channel_id}/messages"), &query)
                .await?;
            Ok(messages.into_iter().map(WireMessage::into_message).collect())
        })
    }

    fn download_attachment<'a>(&'a self, attachment: &'a Attachment) -> ServiceFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let res = self
                .send(&attachment.url, &[], false)
                .await?
                .ok_or_else(|| Error::Remote {
                    message: format!("attachment gone: {}", attachment.url),
                })?;
            let bytes = res.bytes().await.map_err(|e| Error::Remote {
                message: format!("attachment read failed: {e}"),
            })?;
            Ok(bytes.to_vec())
        })
    }
}

fn channel_kind(code: u8) -> ChannelKind {
    match code {
        0 => ChannelKind::Text,
        2 => ChannelKind::Voice,
        4 => ChannelKind::Category,
        5 => ChannelKind::Announcement,
        13 => ChannelKind::Stage,
        15 | 16 => ChannelKind::Forum,
        _ => ChannelKind::Unknown,
    }
}

fn retry_after_secs(body: &str) -> Option<f64> {
    #[derive(Deserialize)]
    struct RateLimited {
        retry_after: f64,
    }
    serde_json::from_str::<RateLimited>(body)
        .ok()
        .map(|r| r.retry_after.clamp(0.0, 60.0))
}

#[derive(Debug, Deserialize)]
struct WireGuild {
    id: String,
    name: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireRole {
    id: String,
    name: String,
    position: i64,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
    username: String,
    #[serde(default = "default_discriminator")]
    discriminator: String,
    global_name: Option<String>,
}

fn default_discriminator() -> String {
    "0".to_string()
}

#[derive(Debug, Deserialize)]
struct WireMember {
    user: WireUser,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireBan {
    user: WireUser,
}

#[derive(Debug, Deserialize)]
struct WirePartialMember {
    nick: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAttachment {
    id: String,
    filename: String,
    url: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    content: String,
    author: WireUser,
    member: Option<WirePartialMember>,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
}

impl WireMessage {
    fn into_message(self) -> Message {
        let author = self
            .member
            .and_then(|m| m.nick)
            .or(self.author.global_name)
            .unwrap_or(self.author.username);
        Message {
            id: self.id,
            created_at: self.timestamp,
            author,
            content: self.content,
            attachments: self
                .attachments
                .into_iter()
                .map(|a| Attachment {
                    id: a.id,
                    filename: a.filename,
                    url: a.url,
                    size: a.size,
                })
                .collect(),
        }
    }
}
