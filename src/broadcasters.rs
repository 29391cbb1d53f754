use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::twitch::{HelixStream, HelixUser};

/// One entry of the broadcaster roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcaster {
    pub username: String,
    pub id: String,
}

/// Reads the roster written by `resolve`.
pub fn read_roster(path: &Path) -> Result<Vec<Broadcaster>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read broadcaster roster {}", path.display()))?;
    let roster: Vec<Broadcaster> = serde_json::from_str(&raw)
        .with_context(|| format!("malformed broadcaster roster {}", path.display()))?;
    info!("Loaded {} broadcasters from {}", roster.len(), path.display());
    Ok(roster)
}

pub fn write_roster(path: &Path, roster: &[Broadcaster]) -> Result<()> {
    let json = serde_json::to_string_pretty(roster)?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write broadcaster roster {}", path.display()))?;
    Ok(())
}

/// Pairs each requested login with its looked-up user, in request order.
/// Logins Twitch does not know are logged and left out.
pub fn match_logins(logins: &[String], users: &[HelixUser]) -> Vec<Broadcaster> {
    logins
        .iter()
        .filter_map(|login| {
            let found = users.iter().find(|u| u.login.eq_ignore_ascii_case(login));
            if found.is_none() {
                warn!("User {} not found", login);
            }
            found.map(|user| Broadcaster {
                username: login.clone(),
                id: user.id.clone(),
            })
        })
        .collect()
}

/// Roster of the channels behind a stream listing, keeping its order and
/// the first entry per channel.
pub fn from_streams(streams: &[HelixStream]) -> Vec<Broadcaster> {
    let mut roster: Vec<Broadcaster> = Vec::with_capacity(streams.len());
    for stream in streams {
        if roster.iter().any(|b| b.id == stream.user_id) {
            continue;
        }
        roster.push(Broadcaster {
            username: stream.user_login.clone(),
            id: stream.user_id.clone(),
        });
    }
    roster
}
