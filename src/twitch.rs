use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio_stream::{Stream, StreamExt};

use crate::broadcasters::Broadcaster;
use crate::clip::{non_empty, ClipRecord, Recording};
use crate::pipeline::ClipSource;
use crate::retry::{RetryHint, Retryable};

const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const HELIX_URL: &str = "https://api.twitch.tv/helix";
/// Largest page Helix serves.
const MAX_PAGE_SIZE: usize = 100;

pub const CLIENT_ID_VAR: &str = "CLIENT_ID";
pub const CLIENT_SECRET_VAR: &str = "CLIENT_SECRET";

#[derive(Debug, Error)]
pub enum TwitchError {
    #[error("Twitch rejected the credentials")]
    Unauthorized,

    #[error("rate limited by Twitch")]
    RateLimited { retry_after: Option<Duration> },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },

    #[error("environment variable {0} is not set")]
    MissingCredential(&'static str),
}

impl TwitchError {
    /// Expired or invalid credentials; ends the whole run.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, TwitchError::Unauthorized | TwitchError::MissingCredential(_))
    }
}

impl Retryable for TwitchError {
    fn retry_hint(&self) -> RetryHint {
        match self {
            TwitchError::Unauthorized | TwitchError::MissingCredential(_) => RetryHint::Stop,
            TwitchError::RateLimited {
                retry_after: Some(wait),
            } => RetryHint::RetryAfter(*wait),
            TwitchError::RateLimited { retry_after: None } => RetryHint::Retry,
            TwitchError::Http(_) => RetryHint::Retry,
            TwitchError::UnexpectedStatus { status, .. } if status.is_server_error() => {
                RetryHint::Retry
            }
            TwitchError::UnexpectedStatus { .. } => RetryHint::Stop,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    data: Vec<T>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    cursor: Option<String>,
}

/// Running total of one paginated listing against its cap.
#[derive(Debug)]
struct ListingCap {
    limit: usize,
    collected: usize,
}

impl ListingCap {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            collected: 0,
        }
    }

    /// Trims `page` to what still fits under the cap. The returned cursor is
    /// `None` once the listing is done: the page was empty, Helix sent no
    /// cursor, or the cap is reached.
    fn accept<T>(&mut self, page: Page<T>) -> (Vec<T>, Option<String>) {
        let Page {
            mut data,
            pagination,
        } = page;
        let exhausted = data.is_empty();
        data.truncate(self.limit.saturating_sub(self.collected));
        self.collected += data.len();

        let next = pagination
            .and_then(|p| p.cursor)
            .filter(|c| !c.is_empty());
        match next {
            Some(cursor) if !exhausted && self.collected < self.limit => (data, Some(cursor)),
            _ => (data, None),
        }
    }
}

/// A clip as Helix returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct HelixClip {
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub broadcaster_name: String,
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub game_id: Option<String>,
    pub view_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub thumbnail_url: String,
}

impl From<HelixClip> for ClipRecord {
    fn from(clip: HelixClip) -> Self {
        ClipRecord {
            id: clip.id,
            broadcaster_name: clip.broadcaster_name,
            view_count: clip.view_count,
            created_at: clip.created_at,
            video_id: non_empty(clip.video_id),
            game_id: non_empty(clip.game_id),
            url: clip.url,
            thumbnail_url: clip.thumbnail_url,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixVideo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub view_count: u64,
}

impl From<HelixVideo> for Recording {
    fn from(video: HelixVideo) -> Self {
        Recording {
            id: video.id,
            created_at: video.created_at,
            view_count: video.view_count,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixUser {
    pub id: String,
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixGame {
    pub id: String,
    pub name: String,
}

/// A live stream from the Helix `streams` listing.
#[derive(Debug, Clone, Deserialize)]
pub struct HelixStream {
    pub user_id: String,
    pub user_login: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub viewer_count: u64,
}

/// App-token client for the Helix endpoints the clipper needs.
#[derive(Debug, Clone)]
pub struct TwitchClient {
    http: Client,
    client_id: String,
    token: String,
}

impl TwitchClient {
    /// Reads `CLIENT_ID` / `CLIENT_SECRET` and exchanges them for an app token.
    pub async fn from_env() -> Result<Self, TwitchError> {
        let client_id = std::env::var(CLIENT_ID_VAR)
            .map_err(|_| TwitchError::MissingCredential(CLIENT_ID_VAR))?;
        let client_secret = std::env::var(CLIENT_SECRET_VAR)
            .map_err(|_| TwitchError::MissingCredential(CLIENT_SECRET_VAR))?;
        Self::authenticate(client_id, client_secret).await
    }

    pub async fn authenticate(
        client_id: String,
        client_secret: String,
    ) -> Result<Self, TwitchError> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;

        let response = http
            .post(TOKEN_URL)
            .query(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST
            || status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
        {
            return Err(TwitchError::Unauthorized);
        }
        let token: TokenResponse = check_status(response).await?.json().await?;
        info!("Obtained Twitch app token");

        Ok(Self {
            http,
            client_id,
            token: token.access_token,
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<Page<T>, TwitchError> {
        debug!("GET helix/{endpoint} {query:?}");
        let response = self
            .http
            .get(format!("{HELIX_URL}/{endpoint}"))
            .header("Client-ID", &self.client_id)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .query(query)
            .send()
            .await?;

        Ok(check_status(response).await?.json().await?)
    }

    /// Looks up users by login name. Unknown logins are simply absent.
    pub async fn users_by_login(&self, logins: &[String]) -> Result<Vec<HelixUser>, TwitchError> {
        let mut users = Vec::with_capacity(logins.len());
        for chunk in logins.chunks(MAX_PAGE_SIZE) {
            let query: Vec<_> = chunk.iter().map(|l| ("login", l.clone())).collect();
            let page: Page<HelixUser> = self.get("users", &query).await?;
            users.extend(page.data);
        }
        Ok(users)
    }

    /// Pages of clips created between `started_at` and `ended_at`, in the
    /// order Helix lists them, stopping once `limit` clips were yielded.
    pub fn clip_pages<'a>(
        &'a self,
        broadcaster_id: &'a str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        limit: usize,
    ) -> impl Stream<Item = Result<Vec<HelixClip>, TwitchError>> + 'a {
        try_stream! {
            let mut cap = ListingCap::new(limit);
            let mut cursor: Option<String> = None;
            loop {
                let mut query = vec![
                    ("broadcaster_id", broadcaster_id.to_string()),
                    ("started_at", started_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
                    ("ended_at", ended_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
                    ("first", limit.clamp(1, MAX_PAGE_SIZE).to_string()),
                ];
                if let Some(after) = &cursor {
                    query.push(("after", after.clone()));
                }

                let page: Page<HelixClip> = self.get("clips", &query).await?;
                let (clips, next) = cap.accept(page);
                yield clips;

                match next {
                    Some(c) => cursor = Some(c),
                    None => break,
                }
            }
        }
    }

    /// Category id for an exact game name, `None` when Twitch has no such game.
    pub async fn game_id(&self, name: &str) -> Result<Option<String>, TwitchError> {
        let page: Page<HelixGame> = self.get("games", &[("name", name.to_string())]).await?;
        Ok(page.data.into_iter().next().map(|game| {
            debug!("Game {} has id {}", game.name, game.id);
            game.id
        }))
    }

    /// Live streams in a category, most watched first.
    pub async fn top_streams(
        &self,
        game_id: &str,
        first: usize,
    ) -> Result<Vec<HelixStream>, TwitchError> {
        let query = [
            ("game_id", game_id.to_string()),
            ("first", first.clamp(1, MAX_PAGE_SIZE).to_string()),
        ];
        let page: Page<HelixStream> = self.get("streams", &query).await?;
        Ok(page.data)
    }

    pub async fn video(&self, video_id: &str) -> Result<Option<HelixVideo>, TwitchError> {
        let page: Page<HelixVideo> = self.get("videos", &[("id", video_id.to_string())]).await?;
        Ok(page.data.into_iter().next())
    }
}

#[async_trait]
impl ClipSource for TwitchClient {
    async fn fetch_clips(
        &self,
        broadcaster: &Broadcaster,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClipRecord>, TwitchError> {
        let mut clips = Vec::new();
        let pages = self.clip_pages(&broadcaster.id, window_start, window_end, limit);
        tokio::pin!(pages);

        while let Some(page) = pages.next().await {
            clips.extend(page?.into_iter().map(ClipRecord::from));
        }

        for clip in clips.iter_mut().filter(|c| c.broadcaster_name.is_empty()) {
            clip.broadcaster_name = broadcaster.username.clone();
        }
        debug!("Listed {} clips for {}", clips.len(), broadcaster.username);
        Ok(clips)
    }

    async fn fetch_recording(&self, video_id: &str) -> Result<Option<Recording>, TwitchError> {
        Ok(self.video(video_id).await?.map(Recording::from))
    }
}

async fn check_status(response: Response) -> Result<Response, TwitchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(TwitchError::Unauthorized);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(TwitchError::RateLimited {
            retry_after: retry_after(response.headers(), Utc::now()),
        });
    }
    let body = response.text().await.unwrap_or_default();
    Err(TwitchError::UnexpectedStatus { status, body })
}

/// Wait requested by a 429: `Retry-After` seconds, else the Helix
/// `Ratelimit-Reset` epoch.
fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };

    if let Some(secs) = header("retry-after") {
        return Some(Duration::from_secs(secs.max(0) as u64));
    }
    header("ratelimit-reset")
        .map(|reset| Duration::from_secs((reset - now.timestamp()).max(0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    #[test]
    fn helix_clip_normalizes_empty_ids() {
        let raw = r#"{
            "id": "AwkwardHelplessSalamanderSwiftRage",
            "url": "https://clips.twitch.tv/AwkwardHelplessSalamanderSwiftRage",
            "broadcaster_id": "67955580",
            "broadcaster_name": "ChewieMelodies",
            "creator_name": "MrMarshall",
            "video_id": "",
            "game_id": "488191",
            "language": "en",
            "title": "babymetal",
            "view_count": 10,
            "created_at": "2017-11-30T22:34:18Z",
            "thumbnail_url": "https://clips-media-assets.twitch.tv/157589949-preview-480x272.jpg",
            "duration": 60,
            "vod_offset": 480
        }"#;

        let clip: ClipRecord = serde_json::from_str::<HelixClip>(raw).unwrap().into();
        assert_eq!(clip.video_id, None);
        assert_eq!(clip.game_id.as_deref(), Some("488191"));
        assert_eq!(clip.view_count, 10);
        assert_eq!(
            clip.created_at,
            Utc.with_ymd_and_hms(2017, 11, 30, 22, 34, 18).unwrap()
        );
    }

    #[test]
    fn page_without_cursor_parses() {
        let raw = r#"{ "data": [], "pagination": {} }"#;
        let page: Page<HelixVideo> = serde_json::from_str(raw).unwrap();
        assert!(page.data.is_empty());
        assert!(page.pagination.and_then(|p| p.cursor).is_none());
    }

    #[test]
    fn retry_after_prefers_explicit_header() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "ratelimit-reset",
            HeaderValue::from_str(&(now.timestamp() + 7).to_string()).unwrap(),
        );
        assert_eq!(retry_after(&headers, now), Some(Duration::from_secs(7)));

        headers.insert("retry-after", HeaderValue::from_static("2"));
        assert_eq!(retry_after(&headers, now), Some(Duration::from_secs(2)));

        assert_eq!(retry_after(&HeaderMap::new(), now), None);
    }

    #[test]
    fn auth_failures_are_not_retried() {
        assert_eq!(TwitchError::Unauthorized.retry_hint(), RetryHint::Stop);
        assert!(TwitchError::Unauthorized.is_auth_failure());
        assert_eq!(
            TwitchError::RateLimited { retry_after: None }.retry_hint(),
            RetryHint::Retry
        );
        let not_found = TwitchError::UnexpectedStatus {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        assert_eq!(not_found.retry_hint(), RetryHint::Stop);
        assert!(!not_found.is_auth_failure());
        let outage = TwitchError::UnexpectedStatus {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert_eq!(outage.retry_hint(), RetryHint::Retry);
    }

    fn page(len: usize, cursor: Option<&str>) -> Page<usize> {
        Page {
            data: (0..len).collect(),
            pagination: Some(Pagination {
                cursor: cursor.map(str::to_string),
            }),
        }
    }

    #[test]
    fn listing_stops_at_cap_across_pages() {
        let mut cap = ListingCap::new(150);

        let (first, next) = cap.accept(page(100, Some("p2")));
        assert_eq!(first.len(), 100);
        assert_eq!(next.as_deref(), Some("p2"));

        let (second, next) = cap.accept(page(100, Some("p3")));
        assert_eq!(second.len(), 50);
        assert_eq!(next, None);
    }

    #[test]
    fn listing_stops_without_cursor() {
        let mut cap = ListingCap::new(100);
        let (clips, next) = cap.accept(page(2, Some("")));
        assert_eq!(clips.len(), 2);
        assert_eq!(next, None);

        let mut cap = ListingCap::new(100);
        let last = Page {
            data: vec![1],
            pagination: None,
        };
        assert_eq!(cap.accept(last).1, None);
    }

    #[test]
    fn listing_stops_on_empty_page() {
        let mut cap = ListingCap::new(100);
        let (clips, next) = cap.accept(page(0, Some("still-a-cursor")));
        assert!(clips.is_empty());
        assert_eq!(next, None);
    }

    #[test]
    fn game_and_stream_payloads_parse() {
        let games = r#"{
            "data": [{
                "id": "21779",
                "name": "League of Legends",
                "box_art_url": "https://static-cdn.jtvnw.net/ttv-boxart/21779-{width}x{height}.jpg",
                "igdb_id": "115301"
            }]
        }"#;
        let page: Page<HelixGame> = serde_json::from_str(games).unwrap();
        assert_eq!(page.data[0].id, "21779");

        let streams = r#"{
            "data": [{
                "id": "40952121085",
                "user_id": "92038375",
                "user_login": "caedrel",
                "user_name": "Caedrel",
                "game_id": "21779",
                "game_name": "League of Legends",
                "type": "live",
                "title": "LEC watch party",
                "viewer_count": 48213,
                "started_at": "2024-06-01T10:02:11Z",
                "language": "en",
                "thumbnail_url": "https://static-cdn.jtvnw.net/previews-ttv/live_user_caedrel.jpg",
                "tags": ["English"],
                "is_mature": false
            }],
            "pagination": { "cursor": "eyJiIjp7IkN1cnNvciI6ImV5SnpJam8z" }
        }"#;
        let page: Page<HelixStream> = serde_json::from_str(streams).unwrap();
        let stream = &page.data[0];
        assert_eq!(stream.user_login, "caedrel");
        assert_eq!(stream.user_id, "92038375");
        assert_eq!(stream.user_name, "Caedrel");
        assert_eq!(stream.viewer_count, 48213);
    }
}
