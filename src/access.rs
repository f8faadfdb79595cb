use std::sync::RwLock;

use crate::types::UserId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("only the owner can manage sudo users")]
    NotOwner,
    #[error("user is already a sudo user")]
    AlreadySudo,
    #[error("user is not a sudo user")]
    NotSudo,
    #[error("cannot remove the owner from sudo users")]
    CannotRemoveOwner,
}

/// Owner plus sudo users. Without an owner everybody is allowed.
#[derive(Debug)]
pub struct AccessList {
    owner: Option<UserId>,
    sudo: RwLock<Vec<UserId>>,
}

impl AccessList {
    pub fn new(owner: Option<UserId>) -> Self {
        Self {
            owner,
            sudo: RwLock::new(owner.into_iter().collect()),
        }
    }

    pub fn is_owner(&self, user: UserId) -> bool {
        self.owner == Some(user)
    }

    pub fn is_allowed(&self, user: UserId) -> bool {
        match self.owner {
            None => true,
            Some(owner) => owner == user || self.sudo_users().contains(&user),
        }
    }

    pub fn sudo_users(&self) -> Vec<UserId> {
        self.sudo.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn add_sudo(&self, caller: UserId, user: UserId) -> Result<(), AccessError> {
        if !self.is_owner(caller) {
            return Err(AccessError::NotOwner);
        }
        let mut sudo = self.sudo.write().unwrap_or_else(|e| e.into_inner());
        if sudo.contains(&user) {
            return Err(AccessError::AlreadySudo);
        }
        sudo.push(user);
        Ok(())
    }

    pub fn remove_sudo(&self, caller: UserId, user: UserId) -> Result<(), AccessError> {
        if !self.is_owner(caller) {
            return Err(AccessError::NotOwner);
        }
        if self.is_owner(user) {
            return Err(AccessError::CannotRemoveOwner);
        }
        let mut sudo = self.sudo.write().unwrap_or_else(|e| e.into_inner());
        let before = sudo.len();
        sudo.retain(|u| *u != user);
        if sudo.len() == before {
            return Err(AccessError::NotSudo);
        }
        Ok(())
    }
}
