//! The user table config file.
//!
//! The administrator lists who may use the spooler and how many slots each
//! user may occupy at once. Without a file the server runs single-user with
//! its own uid.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// One configured user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    /// Display name.
    pub name: String,
    /// Real uid.
    pub uid: u32,
    /// Slot cap for this user; must be positive in the file.
    pub max_slots: i32,
}

/// The on-disk user table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserFile {
    /// Format version; reserved for migrations.
    #[serde(default)]
    pub version: u32,
    /// Configured users, in file order.
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

impl UserFile {
    /// A single-user table for `uid` with `max_slots` capacity.
    pub fn single_user(uid: u32, max_slots: i32) -> Self {
        Self {
            version: 1,
            users: vec![UserEntry {
                name: format!("uid{uid}"),
                uid,
                max_slots,
            }],
        }
    }

    fn normalize(&mut self) {
        self.users.retain(|u| u.max_slots > 0);
        let mut seen = std::collections::HashSet::new();
        self.users.retain(|u| seen.insert(u.uid));
    }
}

/// Load the user table, `Ok(None)` when the file does not exist. The file
/// is authored by the administrator; the server only ever reads it.
pub fn load_user_file(path: &Path) -> anyhow::Result<Option<UserFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let mut file: UserFile = serde_json::from_str(&raw)?;
    file.normalize();
    Ok(Some(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_bad_entries() {
        let mut f = UserFile {
            version: 1,
            users: vec![
                UserEntry { name: "a".into(), uid: 1000, max_slots: 2 },
                UserEntry { name: "dup".into(), uid: 1000, max_slots: 4 },
                UserEntry { name: "zero".into(), uid: 1001, max_slots: 0 },
            ],
        };
        f.normalize();
        assert_eq!(f.users.len(), 1);
        assert_eq!(f.users[0].name, "a");
    }
}
