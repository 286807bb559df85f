pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::aggregator::{FocusAggregator, FocusSummary};
pub use application::engine::{
    FocusEngine, FocusEngineBuilder, NowProvider, RecoveryOutcome, TimerSnapshot,
};
pub use application::error::EngineError;
pub use application::events::{EngineEvent, EventBus, Subscription};
pub use application::pomodoro::{PomodoroPhase, PomodoroSnapshot};
pub use application::recorder::{RecordOutcome, RecordedSession};
pub use application::timer::VisibilityChange;
pub use domain::models::{
    FocusTimeBreakdown, RunMode, SessionStatus, SessionType, Task, TimeTrackingSession,
    TimerStatus,
};
pub use domain::rewards::{Reward, RewardPolicy};
pub use infrastructure::config::{EngineConfig, PomodoroDurations};
pub use infrastructure::error::InfraError;
pub use infrastructure::focus_store::{FocusStore, InMemoryFocusStore};
pub use infrastructure::rest_store::RestFocusStore;
pub use infrastructure::sqlite_store::SqliteFocusStore;
