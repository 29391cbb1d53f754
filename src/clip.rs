use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

/// Separator between fields of a downloaded clip's file name.
pub const FIELD_SEPARATOR: &str = "###";

const MP4_EXTENSION: &str = ".mp4";

/// One clip as normalized from the upstream listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClipRecord {
    pub id: String,
    pub broadcaster_name: String,
    pub view_count: u64,
    pub created_at: DateTime<Utc>,
    /// Source recording, `None` when upstream reports none.
    pub video_id: Option<String>,
    pub game_id: Option<String>,
    pub url: String,
    pub thumbnail_url: String,
}

impl ClipRecord {
    /// The persisted record for this clip: its file name.
    pub fn file_name(&self) -> ClipFileName {
        ClipFileName {
            id: self.id.clone(),
            broadcaster_name: self.broadcaster_name.clone(),
            view_count: Some(self.view_count),
            created_on: Some(self.created_at.date_naive()),
        }
    }
}

/// Empty ids mean "no linked recording" upstream.
pub fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// An archived broadcast (VOD) a clip was cut from.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub view_count: u64,
}

/// `<clipId>###<broadcasterName>###<viewCount>views###<YYYY-MM-DD>.mp4`
///
/// Older runs wrote only `<clipId>###<broadcasterName>.mp4`, so the last two
/// fields are optional when parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipFileName {
    pub id: String,
    pub broadcaster_name: String,
    pub view_count: Option<u64>,
    pub created_on: Option<NaiveDate>,
}

impl fmt::Display for ClipFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.id, FIELD_SEPARATOR, self.broadcaster_name)?;
        if let Some(views) = self.view_count {
            write!(f, "{}{}views", FIELD_SEPARATOR, views)?;
        }
        if let Some(date) = self.created_on {
            write!(f, "{}{}", FIELD_SEPARATOR, date.format("%Y-%m-%d"))?;
        }
        f.write_str(MP4_EXTENSION)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("not a clip file name: {0}")]
pub struct ParseFileNameError(pub String);

impl FromStr for ClipFileName {
    type Err = ParseFileNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseFileNameError(s.to_string());
        let stem = s.strip_suffix(MP4_EXTENSION).ok_or_else(err)?;
        let fields: Vec<&str> = stem.split(FIELD_SEPARATOR).collect();

        let (id, broadcaster_name) = match fields.as_slice() {
            [id, name, ..] if !id.is_empty() => (id.to_string(), name.to_string()),
            _ => return Err(err()),
        };

        let view_count = match fields.get(2) {
            Some(views) => Some(
                views
                    .strip_suffix("views")
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(err)?,
            ),
            None => None,
        };

        let created_on = match fields.get(3) {
            Some(date) => Some(NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| err())?),
            None => None,
        };

        if fields.len() > 4 {
            return Err(err());
        }

        Ok(ClipFileName {
            id,
            broadcaster_name,
            view_count,
            created_on,
        })
    }
}

/// `<base>_<YYYY-MM-DD>` for the run's local calendar date.
pub fn day_folder(base: &Path, date: NaiveDate) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!("_{}", date.format("%Y-%m-%d")));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn clip() -> ClipRecord {
        ClipRecord {
            id: "BraveTinyOtterKappa-abc123".to_string(),
            broadcaster_name: "loltyler1".to_string(),
            view_count: 1532,
            created_at: Utc.with_ymd_and_hms(2024, 11, 3, 21, 15, 0).unwrap(),
            video_id: Some("2290000000".to_string()),
            game_id: Some("21779".to_string()),
            url: "https://clips.twitch.tv/BraveTinyOtterKappa-abc123".to_string(),
            thumbnail_url: "https://clips-media-assets2.twitch.tv/abc-preview-480x272.jpg"
                .to_string(),
        }
    }

    #[test]
    fn file_name_uses_four_fields() {
        assert_eq!(
            clip().file_name().to_string(),
            "BraveTinyOtterKappa-abc123###loltyler1###1532views###2024-11-03.mp4"
        );
    }

    #[test]
    fn parses_current_format() {
        let parsed: ClipFileName = "abc###caedrel###87views###2024-01-09.mp4".parse().unwrap();
        assert_eq!(parsed.id, "abc");
        assert_eq!(parsed.broadcaster_name, "caedrel");
        assert_eq!(parsed.view_count, Some(87));
        assert_eq!(parsed.created_on, NaiveDate::from_ymd_opt(2024, 1, 9));
    }

    #[test]
    fn parses_legacy_two_field_format() {
        let parsed: ClipFileName = "abc###caedrel.mp4".parse().unwrap();
        assert_eq!(parsed.id, "abc");
        assert_eq!(parsed.view_count, None);
        assert_eq!(parsed.created_on, None);
    }

    #[test]
    fn rejects_foreign_files() {
        assert!("notes.txt".parse::<ClipFileName>().is_err());
        assert!("plain.mp4".parse::<ClipFileName>().is_err());
        assert!("abc###caedrel###lots###2024-01-09.mp4".parse::<ClipFileName>().is_err());
        assert!("abc###caedrel###5views###yesterday.mp4".parse::<ClipFileName>().is_err());
        assert!("abc###caedrel###5views###2024-01-09###x.mp4".parse::<ClipFileName>().is_err());
    }

    #[test]
    fn empty_video_id_is_absent() {
        assert_eq!(non_empty(Some(String::new())), None);
        assert_eq!(non_empty(Some("  ".to_string())), None);
        assert_eq!(non_empty(Some("42".to_string())), Some("42".to_string()));
        assert_eq!(non_empty(None), None);
    }

    #[test]
    fn day_folder_appends_date() {
        let folder = day_folder(
            Path::new("/tmp/twitch_clips"),
            NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(),
        );
        assert_eq!(folder, PathBuf::from("/tmp/twitch_clips_2024-03-07"));
    }
}
