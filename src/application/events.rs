use crate::application::pomodoro::PomodoroPhase;
use crate::domain::models::{RunMode, TimeTrackingSession};
use crate::domain::rewards::Reward;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Display total for a task: stored total plus the live run.
    TimeUpdated { task_id: String, seconds: u64 },
    ModeSwitched {
        task_id: String,
        mode: Option<RunMode>,
    },
    SessionRecorded { session: TimeTrackingSession },
    RewardEarned {
        user_id: String,
        task_id: String,
        reward: Reward,
    },
    LevelUp {
        user_id: String,
        previous_level: u32,
        new_level: u32,
    },
    AwayDetected { task_id: String, away_seconds: u64 },
    PomodoroPhaseChanged {
        task_id: String,
        phase: PomodoroPhase,
        remaining_seconds: u64,
    },
    SyncFailed { operation: String, message: String },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Delivers to current subscribers; with none, the event is dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<EngineEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone. Lagged events are skipped.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Everything currently queued.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events_in_order() {
        let bus = EventBus::default();
        let mut subscription = bus.subscribe();
        bus.publish(EngineEvent::TimeUpdated {
            task_id: "tsk-1".to_string(),
            seconds: 1,
        });
        bus.publish(EngineEvent::ModeSwitched {
            task_id: "tsk-1".to_string(),
            mode: Some(RunMode::Manual),
        });

        assert_eq!(
            subscription.recv().await,
            Some(EngineEvent::TimeUpdated {
                task_id: "tsk-1".to_string(),
                seconds: 1,
            })
        );
        assert!(matches!(
            subscription.recv().await,
            Some(EngineEvent::ModeSwitched { .. })
        ));
    }

    #[test]
    fn unsubscribe_releases_the_receiver() {
        let bus = EventBus::default();
        let subscription = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        subscription.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(EngineEvent::SyncFailed {
            operation: "pause".to_string(),
            message: "offline".to_string(),
        });
    }

    #[test]
    fn lagged_subscriber_skips_to_newest() {
        let bus = EventBus::new(2);
        let mut subscription = bus.subscribe();
        for seconds in 0..5 {
            bus.publish(EngineEvent::TimeUpdated {
                task_id: "tsk-1".to_string(),
                seconds,
            });
        }
        let drained = subscription.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(
            drained.last(),
            Some(&EngineEvent::TimeUpdated {
                task_id: "tsk-1".to_string(),
                seconds: 4,
            })
        );
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(EngineEvent::LevelUp {
            user_id: "usr-1".to_string(),
            previous_level: 1,
            new_level: 2,
        })
        .expect("serialize event");
        assert_eq!(json["type"], "level_up");
        assert_eq!(json["new_level"], 2);
    }
}
