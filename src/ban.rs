//! Device ban list. Banned addresses are sent a leave request the moment
//! they try to join; the set is persisted so bans survive restarts.

use std::collections::BTreeSet;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::ieee::Ieee;
use crate::storage::DataDir;

const BAN_FILE: &str = "banned_devices.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct BanFile {
    #[serde(default)]
    banned: Vec<String>,
    #[serde(default)]
    count: usize,
}

#[derive(Debug)]
pub struct BanList {
    data: DataDir,
    banned: RwLock<BTreeSet<Ieee>>,
}

impl BanList {
    pub fn load(data: DataDir) -> Self {
        let file: BanFile = data.load_json(BAN_FILE);
        let banned: BTreeSet<Ieee> = file
            .banned
            .iter()
            .filter_map(|raw| Ieee::parse(raw))
            .collect();
        if !banned.is_empty() {
            tracing::info!("Loaded {} banned IEEE addresses", banned.len());
        }
        Self { data, banned: RwLock::new(banned) }
    }

    fn save(&self, banned: &BTreeSet<Ieee>) {
        let file = BanFile {
            banned: banned.iter().map(|i| i.to_string()).collect(),
            count: banned.len(),
        };
        self.data.save_json(BAN_FILE, &file);
    }

    pub fn is_banned(&self, ieee: &Ieee) -> bool {
        self.banned.read().expect("ban list poisoned").contains(ieee)
    }

    /// Returns false if the address was already banned.
    pub fn ban(&self, ieee: &Ieee, reason: Option<&str>) -> bool {
        let mut banned = self.banned.write().expect("ban list poisoned");
        if !banned.insert(ieee.clone()) {
            tracing::info!("[{}] already banned", ieee);
            return false;
        }
        self.save(&banned);
        match reason {
            Some(r) => tracing::warn!("[{}] banned: {}", ieee, r),
            None => tracing::warn!("[{}] banned", ieee),
        }
        true
    }

    /// Returns false if the address was not banned.
    pub fn unban(&self, ieee: &Ieee) -> bool {
        let mut banned = self.banned.write().expect("ban list poisoned");
        if !banned.remove(ieee) {
            return false;
        }
        self.save(&banned);
        tracing::info!("[{}] unbanned", ieee);
        true
    }

    pub fn banned_list(&self) -> Vec<Ieee> {
        self.banned.read().expect("ban list poisoned").iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Ieee {
        Ieee::parse("aa:bb:cc:dd:ee:ff:00:11").unwrap()
    }

    #[test]
    fn ban_unban_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let bans = BanList::load(DataDir::new(dir.path()));

        let before = bans.banned_list();
        assert!(bans.ban(&target(), Some("test")));
        assert!(bans.is_banned(&target()));
        assert!(bans.unban(&target()));
        assert_eq!(bans.banned_list(), before);
    }

    #[test]
    fn ban_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let bans = BanList::load(DataDir::new(dir.path()));
        assert!(bans.ban(&target(), None));
        assert!(!bans.ban(&target(), None));
        assert_eq!(bans.banned_list().len(), 1);
    }

    #[test]
    fn membership_is_normalised() {
        let dir = tempfile::tempdir().unwrap();
        let bans = BanList::load(DataDir::new(dir.path()));
        bans.ban(&target(), None);
        // Any spelling of the same address resolves to the banned entry.
        let other = Ieee::parse("AABBCCDDEEFF0011").unwrap();
        assert!(bans.is_banned(&other));
    }

    #[test]
    fn bans_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let bans = BanList::load(DataDir::new(dir.path()));
            bans.ban(&target(), None);
        }
        let bans = BanList::load(DataDir::new(dir.path()));
        assert!(bans.is_banned(&target()));
    }
}
