// MediaOffline - Offline content pipeline for mobile media clients
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Collaborators owned by the host application
//!
//! The pipeline never stores credentials or talks to the media API itself.
//! It asks a [`SessionProvider`] for the server's base URL and token, a
//! [`UrlResolver`] for the download endpoint, and a [`NetworkMonitor`] for
//! the connection type.

use crate::download::task::{MediaItem, MediaKind};
use crate::error::{OfflineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Header carrying the access token on download requests
pub const AUTH_HEADER: &str = "X-Emby-Token";

/// Resolved server/credential context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerContext {
    pub server_id: String,
    pub base_url: String,
    pub access_token: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl ServerContext {
    /// Headers every download request for this server carries
    pub fn auth_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(AUTH_HEADER.to_string(), self.access_token.clone());
        headers
    }
}

/// Lookup from server id to its session
pub trait SessionProvider: Send + Sync {
    fn server(&self, server_id: &str) -> Option<ServerContext>;
}

/// Fixed set of sessions, used by the CLI and tests
#[derive(Debug, Clone, Default)]
pub struct StaticSessions {
    servers: HashMap<String, ServerContext>,
}

impl StaticSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, server: ServerContext) -> Self {
        self.servers.insert(server.server_id.clone(), server);
        self
    }
}

impl SessionProvider for StaticSessions {
    fn server(&self, server_id: &str) -> Option<ServerContext> {
        self.servers.get(server_id).cloned()
    }
}

/// Maps an item to a fully-qualified, authorized download URL
pub trait UrlResolver: Send + Sync {
    fn download_url(&self, server: &ServerContext, item: &MediaItem) -> Result<String>;
}

/// Endpoint shapes of a Jellyfin-compatible media server
#[derive(Debug, Clone, Default)]
pub struct JellyfinUrlResolver {
    /// Device id sent with video stream requests
    pub device_id: Option<String>,
}

impl JellyfinUrlResolver {
    const AUDIO_MAX_BITRATE: u32 = 320_000;

    /// Base URL with path segments appended; item ids are percent-encoded
    fn endpoint(server: &ServerContext, segments: &[&str]) -> Result<Url> {
        let base = server.base_url.trim_end_matches('/');
        let mut url = Url::parse(base)
            .map_err(|e| OfflineError::InvalidDownloadUrl(format!("{}: {}", base, e)))?;
        url.path_segments_mut()
            .map_err(|_| OfflineError::InvalidDownloadUrl(format!("{}: not a base URL", base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

impl UrlResolver for JellyfinUrlResolver {
    fn download_url(&self, server: &ServerContext, item: &MediaItem) -> Result<String> {
        let url = match item.kind {
            MediaKind::Audio => {
                let mut url = Self::endpoint(server, &["Audio", item.id.as_str(), "universal"])?;
                {
                    let mut query = url.query_pairs_mut();
                    if let Some(ref user_id) = server.user_id {
                        query.append_pair("userId", user_id);
                    }
                    query
                        .append_pair("api_key", &server.access_token)
                        .append_pair("maxStreamingBitrate", &Self::AUDIO_MAX_BITRATE.to_string())
                        .append_pair("container", "mp3,aac,m4a,flac,wav,ogg")
                        .append_pair("transcodingContainer", "mp3")
                        .append_pair("transcodingProtocol", "http")
                        .append_pair("audioCodec", "mp3");
                }
                url
            }
            MediaKind::Book => {
                let mut url = Self::endpoint(server, &["Items", item.id.as_str(), "Download"])?;
                url.query_pairs_mut().append_pair("api_key", &server.access_token);
                url
            }
            MediaKind::Video => {
                let mut url = Self::endpoint(server, &["Videos", item.id.as_str(), "stream"])?;
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair(
                        "mediaSourceId",
                        item.media_source_id.as_deref().unwrap_or(&item.id),
                    );
                    if let Some(ref device_id) = self.device_id {
                        query.append_pair("deviceId", device_id);
                    }
                    if let Some(ref user_id) = server.user_id {
                        query.append_pair("userId", user_id);
                    }
                    query
                        .append_pair("api_key", &server.access_token)
                        .append_pair("static", "true");
                }
                url
            }
        };

        Ok(url.into())
    }
}

/// Connection type reported by the platform
pub trait NetworkMonitor: Send + Sync {
    fn is_on_wifi(&self) -> bool;
}

/// Treats every connection as Wi-Fi; used when the platform cannot tell
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysWifi;

impl NetworkMonitor for AlwaysWifi {
    fn is_on_wifi(&self) -> bool {
        true
    }
}
