pub mod aggregator;
pub mod bootstrap;
pub mod engine;
pub mod error;
pub mod events;
pub mod pomodoro;
pub mod recorder;
pub mod scheduler;
pub mod timer;
