//! Subscription bookkeeping shared by every entity of the integration.
//!
//! Entities describe the topics they want as a [`TopicMap`] and hand back the
//! [`SubscriptionState`] from their previous call. The registry diffs the two,
//! so reconfiguring an entity only touches topics that actually changed, and
//! reference-counts broker subscriptions so a topic shared by several entities
//! is subscribed once and unsubscribed only when its last listener goes away.

use std::collections::BTreeMap;

use tracing::debug;
use tracing::warn;

use super::client::MqttClient;
use super::client::Qos;
use super::error::MqttError;
use super::topic::topic_matches;

/// What an inbound message on a subscribed topic means to the entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TopicRole {
    StateTopic,
    HumidityTopic,
    /// Index into the entity's availability topic list
    Availability(usize),
    JsonAttributesTopic,
}

/// Subscription descriptor for a single role
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub topic: String,
    pub qos: Qos,
}

pub type TopicMap = BTreeMap<TopicRole, Subscription>;

/// Opaque handle describing what an owner is currently subscribed to.
///
/// Owned by the registry's bookkeeping; entities only hold it to pass back on
/// their next subscribe/unsubscribe call. It always reflects what the
/// registry actually holds for the owner, including after a failed call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionState {
    topics: TopicMap,
}

#[cfg(test)]
impl SubscriptionState {
    pub fn topic(&self, role: &TopicRole) -> Option<&str> {
        self.topics.get(role).map(|s| s.topic.as_str())
    }
}

/// Who wants messages from a topic filter
#[derive(Debug, Clone, PartialEq)]
pub struct Listener {
    pub owner: String,
    pub role: TopicRole,
    pub qos: Qos,
}

#[derive(Debug, Default)]
struct TopicEntry {
    /// QoS the broker subscription was made with
    qos: Qos,
    listeners: Vec<Listener>,
}

/// Reference-counted broker subscriptions
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: BTreeMap<String, TopicEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)subscribe `owner` to `topics`, diffing against `state`.
    ///
    /// New subscriptions are taken before old ones are released, so a topic
    /// that only moves between roles never leaves the broker. If taking a new
    /// one fails, the ones taken so far are released again and `state` is
    /// left as it was. Releasing always runs to completion; the first failure
    /// is returned.
    pub async fn subscribe_topics<C: MqttClient>(
        &mut self,
        client: &mut C,
        owner: &str,
        state: &mut SubscriptionState,
        topics: TopicMap,
    ) -> Result<(), MqttError> {
        let mut acquired = Vec::new();
        for (role, subscription) in &topics {
            if state.topics.get(role) == Some(subscription) {
                continue;
            }
            if let Err(e) = self.acquire(client, owner, role, subscription).await {
                for (role, subscription) in acquired {
                    if let Err(e) = self.release(client, owner, role, subscription).await {
                        warn!("Failed to roll back {}: {}", subscription.topic, e);
                    }
                }
                return Err(e);
            }
            acquired.push((role, subscription));
        }

        let previous = std::mem::replace(&mut state.topics, topics);
        let mut failure = None;
        for (role, old) in &previous {
            if state.topics.get(role) == Some(old) {
                continue;
            }
            if let Err(e) = self.release(client, owner, role, old).await {
                warn!("Failed to unsubscribe from {}: {}", old.topic, e);
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop every subscription held through `state`.
    pub async fn unsubscribe_topics<C: MqttClient>(
        &mut self,
        client: &mut C,
        owner: &str,
        state: &mut SubscriptionState,
    ) -> Result<(), MqttError> {
        self.subscribe_topics(client, owner, state, TopicMap::new())
            .await
    }

    /// Every listener whose topic filter matches `topic`.
    pub fn listeners(&self, topic: &str) -> Vec<Listener> {
        self.topics
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .flat_map(|(_, entry)| entry.listeners.iter().cloned())
            .collect()
    }

    /// Every topic filter held at the broker, with the QoS it was taken at
    pub fn subscribed(&self) -> impl Iterator<Item = (&str, Qos)> + '_ {
        self.topics
            .iter()
            .map(|(topic, entry)| (topic.as_str(), entry.qos))
    }

    /// Add a listener, subscribing at the broker first when the topic is new
    /// or needs a higher QoS. Nothing is recorded if the broker call fails.
    async fn acquire<C: MqttClient>(
        &mut self,
        client: &mut C,
        owner: &str,
        role: &TopicRole,
        subscription: &Subscription,
    ) -> Result<(), MqttError> {
        let held = self.topics.get(&subscription.topic).map(|entry| entry.qos);

        if held.map_or(true, |qos| subscription.qos > qos) {
            debug!(
                "Subscribing to {} (qos {:?})",
                subscription.topic, subscription.qos
            );
            client
                .subscribe(&subscription.topic, subscription.qos)
                .await?;
        }

        let entry = self
            .topics
            .entry(subscription.topic.clone())
            .or_default();
        entry.qos = entry.qos.max(subscription.qos);
        entry.listeners.push(Listener {
            owner: owner.to_string(),
            role: role.clone(),
            qos: subscription.qos,
        });

        Ok(())
    }

    /// Remove one listener, unsubscribing at the broker when it was the last.
    /// The listener is gone even if the broker call fails.
    async fn release<C: MqttClient>(
        &mut self,
        client: &mut C,
        owner: &str,
        role: &TopicRole,
        subscription: &Subscription,
    ) -> Result<(), MqttError> {
        let topic = subscription.topic.as_str();
        let Some(entry) = self.topics.get_mut(topic) else {
            return Ok(());
        };

        if let Some(index) = entry
            .listeners
            .iter()
            .position(|l| l.owner == owner && l.role == *role && l.qos == subscription.qos)
        {
            entry.listeners.remove(index);
        }

        if entry.listeners.is_empty() {
            self.topics.remove(topic);
            debug!("Unsubscribing from {}", topic);
            client.unsubscribe(topic).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
impl SubscriptionRegistry {
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }
}

/// Build a topic map, skipping roles whose topic is not configured.
pub fn topic_map(entries: impl IntoIterator<Item = (TopicRole, Option<String>, Qos)>) -> TopicMap {
    entries
        .into_iter()
        .filter_map(|(role, topic, qos)| topic.map(|topic| (role, Subscription { topic, qos })))
        .collect()
}
