use std::collections::{BTreeSet, HashMap};

use agentgate_protocol::Subscription;

struct Record {
    subscription: Subscription,
    conn_id: String,
}

/// Topic → agent type routing rules, indexed for matching.
///
/// Each index maps a topic type (or prefix) to the agent types subscribed to
/// it, with a reference count per agent type so that overlapping records
/// from different connections can be removed independently.
#[derive(Default)]
pub struct SubscriptionTable {
    /// subscription_id → record
    records: HashMap<String, Record>,
    exact: HashMap<String, HashMap<String, usize>>,
    prefix: HashMap<String, HashMap<String, usize>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `subscription` on behalf of `conn_id` and return its id.
    ///
    /// Adding the same rule twice from the same connection returns the
    /// existing id.
    pub fn add(&mut self, subscription: Subscription, conn_id: &str) -> String {
        if let Some((id, _)) = self
            .records
            .iter()
            .find(|(_, r)| r.conn_id == conn_id && r.subscription == subscription)
        {
            return id.clone();
        }

        let (index, key) = self.index_for(&subscription);
        *index
            .entry(key)
            .or_default()
            .entry(subscription.agent_type().to_string())
            .or_insert(0) += 1;

        let id = uuid::Uuid::new_v4().to_string();
        self.records.insert(id.clone(), Record {
            subscription,
            conn_id: conn_id.to_string(),
        });
        id
    }

    /// Agent types that must receive an event published on `topic_type`.
    ///
    /// Exact and prefix rules are consulted independently and the result is
    /// deduplicated by agent type.
    pub fn match_types(&self, topic_type: &str) -> BTreeSet<String> {
        let mut types = BTreeSet::new();
        if let Some(subscribers) = self.exact.get(topic_type) {
            types.extend(subscribers.keys().cloned());
        }
        if self.prefix.is_empty() {
            return types;
        }
        // Every literal prefix of the topic, including "" and the topic itself.
        let boundaries = topic_type
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(topic_type.len()));
        for end in boundaries {
            if let Some(subscribers) = self.prefix.get(&topic_type[..end]) {
                types.extend(subscribers.keys().cloned());
            }
        }
        types
    }

    /// Drop every subscription added by `conn_id`. Returns how many were removed.
    pub fn remove_conn(&mut self, conn_id: &str) -> usize {
        let ids: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| r.conn_id == conn_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(record) = self.records.remove(id) {
                self.unindex(&record.subscription);
            }
        }
        ids.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn index_for(
        &mut self,
        subscription: &Subscription,
    ) -> (&mut HashMap<String, HashMap<String, usize>>, String) {
        match subscription {
            Subscription::Exact { topic_type, .. } => (&mut self.exact, topic_type.clone()),
            Subscription::Prefix {
                topic_type_prefix, ..
            } => (&mut self.prefix, topic_type_prefix.clone()),
        }
    }

    fn unindex(&mut self, subscription: &Subscription) {
        let agent_type = subscription.agent_type().to_string();
        let (index, key) = self.index_for(subscription);
        let Some(subscribers) = index.get_mut(&key) else {
            return;
        };
        if let Some(count) = subscribers.get_mut(&agent_type) {
            *count -= 1;
            if *count == 0 {
                subscribers.remove(&agent_type);
            }
        }
        if subscribers.is_empty() {
            index.remove(&key);
        }
    }
}
