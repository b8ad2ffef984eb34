//! Outgoing alert notifications.

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Topic a recipient's notifications are published on.
pub fn notify_topic(recipient: &str) -> String {
    format!("notify/{recipient}")
}

/// Publishes each notification to `notify/<recipient>` without waiting for
/// the broker.
pub struct MqttNotifier {
    client: AsyncClient,
}

impl MqttNotifier {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for MqttNotifier {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(notification)?;
        for r in &notification.recipients {
            self.client
                .try_publish(notify_topic(r), QoS::AtLeastOnce, false, payload.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier(std::sync::Mutex<Vec<Notification>>);

#[cfg(test)]
impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.0.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_per_recipient() {
        assert_eq!(notify_topic("alice"), "notify/alice");
    }

    #[test]
    fn payload_shape() {
        let n = Notification {
            recipients: vec!["alice".into()],
            subject: "[HIGH] Pump".into(),
            body: "b".into(),
        };
        let v: serde_json::Value = serde_json::to_value(&n).unwrap();
        assert_eq!(v["recipients"][0], "alice");
        assert_eq!(v["subject"], "[HIGH] Pump");
    }

    #[tokio::test]
    async fn mqtt_notifier_queues_one_publish_per_recipient() {
        let opts = rumqttc::MqttOptions::new("test-notify", "127.0.0.1", 1883);
        let (client, _el) = AsyncClient::new(opts, 10);
        let notifier = MqttNotifier::new(client);
        notifier
            .send(&Notification {
                recipients: vec!["alice".into(), "bob".into()],
                subject: "s".into(),
                body: "b".into(),
            })
            .await
            .unwrap();
    }
}
