use tracing::debug;
use tracing::warn;

use super::client::MqttClient;
use super::client::Qos;
use super::error::MqttError;
use super::subscription::SubscriptionRegistry;
use super::subscription::SubscriptionState;
use super::subscription::TopicMap;

/// The MQTT primitives entities are allowed to use.
///
/// Entities never hold the client themselves; the integration lends them the
/// host for the duration of a call.
#[derive(Debug)]
pub struct MqttHost<C: MqttClient> {
    pub client: C,
    pub subscriptions: SubscriptionRegistry,
}

impl<C: MqttClient> MqttHost<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            subscriptions: SubscriptionRegistry::new(),
        }
    }

    pub async fn subscribe_topics(
        &mut self,
        owner: &str,
        state: &mut SubscriptionState,
        topics: TopicMap,
    ) -> Result<(), MqttError> {
        self.subscriptions
            .subscribe_topics(&mut self.client, owner, state, topics)
            .await
    }

    pub async fn unsubscribe_topics(
        &mut self,
        owner: &str,
        state: &mut SubscriptionState,
    ) -> Result<(), MqttError> {
        self.subscriptions
            .unsubscribe_topics(&mut self.client, owner, state)
            .await
    }

    /// Subscribe again to every topic entities hold, after the broker lost
    /// the session. Returns the first failure; the rest are still attempted.
    pub async fn restore_subscriptions(&mut self) -> Result<(), MqttError> {
        let mut failure = None;
        for (topic, qos) in self.subscriptions.subscribed() {
            debug!("Restoring subscription to {}", topic);
            if let Err(e) = self.client.subscribe(topic, qos).await {
                warn!("Failed to restore subscription to {}: {}", topic, e);
                failure.get_or_insert(e);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        qos: Qos,
        retain: bool,
    ) -> Result<(), MqttError> {
        debug!("Publishing to {}: {}", topic, payload);
        self.client
            .publish(topic, payload.as_bytes(), qos, retain)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::mqtt::client::MockMqttClient;
    use crate::integrations::mqtt::subscription::TopicRole;
    use crate::integrations::mqtt::subscription::topic_map;

    #[tokio::test]
    async fn test_restore_subscriptions_reissues_held_topics() {
        let mut host = MqttHost::new(MockMqttClient::new());
        let mut state = SubscriptionState::default();
        host.subscribe_topics(
            "humidifier.a",
            &mut state,
            topic_map([
                (TopicRole::StateTopic, Some("h/state".to_string()), Qos::AtLeastOnce),
                (TopicRole::JsonAttributesTopic, Some("h/attrs".to_string()), Qos::AtMostOnce),
            ]),
        )
        .await
        .unwrap();
        host.client.subscriptions.clear();

        host.restore_subscriptions().await.unwrap();

        assert_eq!(
            host.client.subscriptions,
            vec![
                ("h/attrs".to_string(), Qos::AtMostOnce),
                ("h/state".to_string(), Qos::AtLeastOnce),
            ]
        );
    }
}
