//! Role lookup for voters who do not declare one (disputes).

use matchproof_core::{MatchClaim, ParseEnumError, VerifierRole};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Source of an identity's relationship to a claim.
pub trait RoleDirectory: Send + Sync {
    fn role_for(&self, claim: &MatchClaim, identity: &str) -> VerifierRole;
}

/// Static identity-to-role table; unknown identities count as players.
pub struct Roster {
    roles: RwLock<HashMap<String, VerifierRole>>,
    fallback: VerifierRole,
}

impl Default for Roster {
    fn default() -> Self {
        Self {
            roles: RwLock::new(HashMap::new()),
            fallback: VerifierRole::Player,
        }
    }
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `identity=ROLE` entries.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, ParseEnumError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let roster = Self::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            let (identity, role) = entry.split_once('=').unwrap_or((entry, ""));
            roster.assign(identity.trim(), role.trim().parse()?);
        }
        Ok(roster)
    }

    pub fn assign(&self, identity: &str, role: VerifierRole) {
        self.roles.write().insert(identity.to_string(), role);
    }

    pub fn len(&self) -> usize {
        self.roles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RoleDirectory for Roster {
    fn role_for(&self, _claim: &MatchClaim, identity: &str) -> VerifierRole {
        self.roles
            .read()
            .get(identity)
            .copied()
            .unwrap_or(self.fallback)
    }
}
