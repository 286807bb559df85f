use crate::domain::clock::rounded_minutes;
use crate::domain::models::{SessionStatus, SessionType};
use serde::{Deserialize, Serialize};

pub const XP_PER_LEVEL: u64 = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RewardPolicy {
    pub pomodoro_xp: u32,
    pub pomodoro_coins: u32,
    pub xp_per_minute: f64,
    pub coins_per_minute: f64,
    /// Sessions shorter than this are discarded outright.
    pub session_floor_seconds: u64,
}

impl Default for RewardPolicy {
    fn default() -> Self {
        Self {
            pomodoro_xp: 5,
            pomodoro_coins: 2,
            xp_per_minute: 1.0,
            coins_per_minute: 0.5,
            session_floor_seconds: 10,
        }
    }
}

impl RewardPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if !self.xp_per_minute.is_finite() || self.xp_per_minute < 0.0 {
            return Err("rewards.xpPerMinute must be a non-negative number".to_string());
        }
        if !self.coins_per_minute.is_finite() || self.coins_per_minute < 0.0 {
            return Err("rewards.coinsPerMinute must be a non-negative number".to_string());
        }
        if self.session_floor_seconds == 0 {
            return Err("rewards.sessionFloorSeconds must be > 0".to_string());
        }
        Ok(())
    }

    pub fn reward_for(
        &self,
        session_type: SessionType,
        status: SessionStatus,
        duration_seconds: u64,
    ) -> Reward {
        match (session_type, status) {
            (SessionType::Manual, _) => self.manual_reward(duration_seconds),
            (SessionType::Pomodoro, SessionStatus::Completed) => Reward {
                xp: self.pomodoro_xp,
                coins: self.pomodoro_coins,
            },
            _ => Reward::default(),
        }
    }

    pub fn manual_reward(&self, duration_seconds: u64) -> Reward {
        let minutes = rounded_minutes(duration_seconds) as f64;
        Reward {
            xp: (minutes * self.xp_per_minute).floor() as u32,
            coins: (minutes * self.coins_per_minute).round() as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reward {
    pub xp: u32,
    pub coins: u32,
}

impl Reward {
    pub fn is_empty(&self) -> bool {
        self.xp == 0 && self.coins == 0
    }
}

pub fn level_for_xp(xp: u64) -> u32 {
    (xp / XP_PER_LEVEL + 1).min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn manual_reward_for_125_seconds() {
        let reward = RewardPolicy::default().manual_reward(125);
        assert_eq!(reward, Reward { xp: 2, coins: 1 });
    }

    #[test]
    fn manual_reward_rounds_minutes_before_rates() {
        let policy = RewardPolicy::default();
        assert_eq!(policy.manual_reward(29), Reward::default());
        assert_eq!(policy.manual_reward(90), Reward { xp: 2, coins: 1 });
        assert_eq!(policy.manual_reward(1500), Reward { xp: 25, coins: 13 });
    }

    #[test]
    fn pomodoro_reward_is_flat_only_when_completed() {
        let policy = RewardPolicy::default();
        assert_eq!(
            policy.reward_for(SessionType::Pomodoro, SessionStatus::Completed, 1500),
            Reward { xp: 5, coins: 2 }
        );
        assert!(policy
            .reward_for(SessionType::Pomodoro, SessionStatus::Abandoned, 600)
            .is_empty());
        assert!(policy
            .reward_for(SessionType::Pomodoro, SessionStatus::Interrupted, 600)
            .is_empty());
        assert!(policy
            .reward_for(SessionType::Break, SessionStatus::Completed, 300)
            .is_empty());
    }

    #[test]
    fn level_boundaries() {
        assert_eq!(level_for_xp(0), 1);
        assert_eq!(level_for_xp(99), 1);
        assert_eq!(level_for_xp(100), 2);
        assert_eq!(level_for_xp(105), 2);
    }

    #[test]
    fn validate_rejects_negative_rates() {
        let policy = RewardPolicy {
            coins_per_minute: -1.0,
            ..RewardPolicy::default()
        };
        assert!(policy.validate().is_err());
        assert!(RewardPolicy::default().validate().is_ok());
    }

    proptest! {
        #[test]
        fn manual_reward_is_deterministic(seconds in 0u64..200_000u64) {
            let policy = RewardPolicy::default();
            prop_assert_eq!(policy.manual_reward(seconds), policy.manual_reward(seconds));
            prop_assert_eq!(policy.manual_reward(seconds).xp as u64, rounded_minutes(seconds));
        }
    }
}
