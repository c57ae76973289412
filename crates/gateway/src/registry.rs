use std::collections::{BTreeSet, HashMap};

use agentgate_protocol::AgentId;

use crate::error::RouteError;

/// Result of a successful [`AgentRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The type had no owner.
    New,
    /// The connection already owned the type.
    Unchanged,
    /// The previous owner was dead; ownership moved to the new connection.
    TookOver { previous_conn: String },
}

/// Which connection hosts each agent type.
pub struct AgentRegistry {
    /// agent_type → conn_id
    owners: HashMap<String, String>,
    /// conn_id → agent types (reverse lookup for cleanup on disconnect)
    by_conn: HashMap<String, BTreeSet<String>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            owners: HashMap::new(),
            by_conn: HashMap::new(),
        }
    }

    /// Assign `agent_type` to `conn_id`.
    ///
    /// First registrant wins: a type owned by another connection is only
    /// handed over when `is_alive` reports that owner dead.
    pub fn register(
        &mut self,
        agent_type: &str,
        conn_id: &str,
        is_alive: impl Fn(&str) -> bool,
    ) -> Result<Registration, RouteError> {
        let outcome = match self.owners.get(agent_type) {
            None => Registration::New,
            Some(owner) if owner == conn_id => return Ok(Registration::Unchanged),
            Some(owner) if is_alive(owner) => {
                return Err(RouteError::AlreadyRegistered(agent_type.to_string()));
            },
            Some(owner) => Registration::TookOver {
                previous_conn: owner.clone(),
            },
        };

        if let Registration::TookOver { previous_conn } = &outcome
            && let Some(types) = self.by_conn.get_mut(previous_conn)
        {
            types.remove(agent_type);
            if types.is_empty() {
                self.by_conn.remove(previous_conn);
            }
        }
        self.owners
            .insert(agent_type.to_string(), conn_id.to_string());
        self.by_conn
            .entry(conn_id.to_string())
            .or_default()
            .insert(agent_type.to_string());
        Ok(outcome)
    }

    /// The connection hosting `agent_id.type`.
    pub fn resolve(&self, agent_id: &AgentId) -> Result<&str, RouteError> {
        self.owner_of(&agent_id.r#type)
            .ok_or_else(|| RouteError::UnknownType(agent_id.r#type.clone()))
    }

    pub fn owner_of(&self, agent_type: &str) -> Option<&str> {
        self.owners.get(agent_type).map(String::as_str)
    }

    /// Drop every type still owned by `conn_id`. Returns the revoked types.
    pub fn unregister_conn(&mut self, conn_id: &str) -> Vec<String> {
        let Some(types) = self.by_conn.remove(conn_id) else {
            return Vec::new();
        };
        for agent_type in &types {
            self.owners.remove(agent_type);
        }
        types.into_iter().collect()
    }

    /// (agent_type, conn_id) pairs sorted by type.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self
            .owners
            .iter()
            .map(|(t, c)| (t.clone(), c.clone()))
            .collect();
        pairs.sort();
        pairs
    }

    pub fn count(&self) -> usize {
        self.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alive(_: &str) -> bool {
        true
    }

    fn dead(_: &str) -> bool {
        false
    }

    #[test]
    fn first_registrant_wins_while_alive() {
        let mut reg = AgentRegistry::new();
        assert_eq!(reg.register("echo", "c1", alive), Ok(Registration::New));
        assert_eq!(
            reg.register("echo", "c2", alive),
            Err(RouteError::AlreadyRegistered("echo".into()))
        );
        assert_eq!(reg.owner_of("echo"), Some("c1"));
    }

    #[test]
    fn reregistering_same_connection_is_idempotent() {
        let mut reg = AgentRegistry::new();
        reg.register("echo", "c1", alive).unwrap();
        assert_eq!(reg.register("echo", "c1", dead), Ok(Registration::Unchanged));
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn dead_owner_is_taken_over() {
        let mut reg = AgentRegistry::new();
        reg.register("echo", "c1", alive).unwrap();
        reg.register("other", "c1", alive).unwrap();
        assert_eq!(
            reg.register("echo", "c2", dead),
            Ok(Registration::TookOver {
                previous_conn: "c1".into()
            })
        );
        assert_eq!(reg.owner_of("echo"), Some("c2"));

        // Closing the old connection must not revoke the moved type.
        assert_eq!(reg.unregister_conn("c1"), vec!["other".to_string()]);
        assert_eq!(reg.owner_of("echo"), Some("c2"));
        assert_eq!(reg.owner_of("other"), None);
    }

    #[test]
    fn resolve_unknown_type() {
        let reg = AgentRegistry::new();
        assert_eq!(
            reg.resolve(&AgentId::new("ghost", "k")),
            Err(RouteError::UnknownType("ghost".into()))
        );
    }

    #[test]
    fn resolve_ignores_key() {
        let mut reg = AgentRegistry::new();
        reg.register("echo", "c1", alive).unwrap();
        assert_eq!(reg.resolve(&AgentId::new("echo", "a")), Ok("c1"));
        assert_eq!(reg.resolve(&AgentId::new("echo", "zzz")), Ok("c1"));
    }

    #[test]
    fn unregister_revokes_all_types() {
        let mut reg = AgentRegistry::new();
        reg.register("b", "c1", alive).unwrap();
        reg.register("a", "c1", alive).unwrap();
        reg.register("x", "c2", alive).unwrap();
        assert_eq!(reg.unregister_conn("c1"), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(reg.list(), vec![("x".to_string(), "c2".to_string())]);
        assert!(reg.unregister_conn("c1").is_empty());
    }
}
