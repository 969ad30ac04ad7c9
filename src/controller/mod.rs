// Progressive resolution control: level state, transitions and notifications

pub mod state;
pub mod progressive;

pub use state::{LevelChange, LoadState, LoadingEvent, LoadingPhase, SliceSet};
pub use progressive::ProgressiveController;
