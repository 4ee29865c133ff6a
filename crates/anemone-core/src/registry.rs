//! Collaborator interfaces: where shares, users and peers come from.
//!
//! The sync core never owns these records. A deployment backed by a database
//! implements the traits over its own tables; `ConfigRegistry` serves the
//! `[[users]]`, `[[shares]]` and `[[peers]]` tables of the config file.

use std::path::PathBuf;
use std::sync::RwLock;

use crate::config::AnemoneConfig;
use crate::error::{AnemoneError, AnemoneResult};
use crate::types::{Peer, Share, UserRecord};

pub trait ShareRegistry: Send + Sync {
    /// Every known share.
    fn all_shares(&self) -> AnemoneResult<Vec<Share>>;

    /// Look up a share by owner and name.
    fn find_share(&self, user_id: i64, name: &str) -> AnemoneResult<Option<Share>> {
        Ok(self
            .all_shares()?
            .into_iter()
            .find(|s| s.user_id == user_id && s.name == name))
    }
}

pub trait UserDirectory: Send + Sync {
    fn user(&self, user_id: i64) -> AnemoneResult<Option<UserRecord>>;
}

pub trait PeerDirectory: Send + Sync {
    fn peer(&self, peer_id: i64) -> AnemoneResult<Option<Peer>>;
    fn all_peers(&self) -> AnemoneResult<Vec<Peer>>;
}

/// In-memory registry seeded from the config file.
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    shares: RwLock<Vec<Share>>,
    users: Vec<UserRecord>,
    peers: Vec<Peer>,
}

impl ConfigRegistry {
    pub fn new(shares: Vec<Share>, users: Vec<UserRecord>, peers: Vec<Peer>) -> Self {
        Self {
            shares: RwLock::new(shares),
            users,
            peers,
        }
    }

    pub fn from_config(config: &AnemoneConfig) -> Self {
        Self::new(
            config.shares.clone(),
            config.users.clone(),
            config.peers.clone(),
        )
    }

    /// Register a share created at runtime. Replaces an existing share with the
    /// same owner and name.
    pub fn add_share(&self, share: Share) -> AnemoneResult<()> {
        let mut shares = self
            .shares
            .write()
            .map_err(|_| AnemoneError::Registry("share registry lock poisoned".into()))?;
        shares.retain(|s| !(s.user_id == share.user_id && s.name == share.name));
        shares.push(share);
        Ok(())
    }

    /// Forget a share. Returns the removed share's path, if any.
    pub fn remove_share(&self, user_id: i64, name: &str) -> AnemoneResult<Option<PathBuf>> {
        let mut shares = self
            .shares
            .write()
            .map_err(|_| AnemoneError::Registry("share registry lock poisoned".into()))?;
        let pos = shares
            .iter()
            .position(|s| s.user_id == user_id && s.name == name);
        Ok(pos.map(|i| shares.remove(i).path))
    }
}

impl ShareRegistry for ConfigRegistry {
    fn all_shares(&self) -> AnemoneResult<Vec<Share>> {
        self.shares
            .read()
            .map(|s| s.clone())
            .map_err(|_| AnemoneError::Registry("share registry lock poisoned".into()))
    }
}

impl UserDirectory for ConfigRegistry {
    fn user(&self, user_id: i64) -> AnemoneResult<Option<UserRecord>> {
        Ok(self.users.iter().find(|u| u.id == user_id).cloned())
    }
}

impl PeerDirectory for ConfigRegistry {
    fn peer(&self, peer_id: i64) -> AnemoneResult<Option<Peer>> {
        Ok(self.peers.iter().find(|p| p.id == peer_id).cloned())
    }

    fn all_peers(&self) -> AnemoneResult<Vec<Peer>> {
        Ok(self.peers.clone())
    }
}
