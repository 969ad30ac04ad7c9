use std::fmt;
use std::sync::Arc;
use crate::slice::ColoredSlice;

/// Where the controller is in its level lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    LoadingLevel(u32),
    Ready(u32),
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadState::Idle => write!(f, "idle"),
            LoadState::LoadingLevel(level) => write!(f, "loading level {}", level),
            LoadState::Ready(level) => write!(f, "ready at level {}", level),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingPhase {
    /// Direct load of a level
    Loading,
    /// Intermediate step of a stepwise refinement
    Refining,
    Ready,
}

/// Notification handed to loading-state subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadingEvent {
    pub phase: LoadingPhase,
    pub level: u32,
    pub detail: Option<String>,
}

impl LoadingEvent {
    pub fn new(phase: LoadingPhase, level: u32) -> Self {
        Self {
            phase,
            level,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// The three orthogonal color slices at one slice position
#[derive(Debug, Clone)]
pub struct SliceSet {
    pub level: u32,
    /// Slice indices in level space, `[inline, crossline, time]`
    pub position: [usize; 3],
    pub opacity: f32,
    pub inline: Arc<ColoredSlice>,
    pub crossline: Arc<ColoredSlice>,
    pub time: Arc<ColoredSlice>,
}

/// Outcome of a level change request
#[derive(Debug, Clone)]
pub enum LevelChange {
    /// The level was loaded and the slices re-rendered at it
    Applied { level: u32, slices: SliceSet },
    /// Already ready at the requested level
    Unchanged(u32),
    /// A newer request took over before this one finished
    Superseded,
    /// Ignored because another load was running
    Dropped,
}

impl LevelChange {
    pub fn is_applied(&self) -> bool {
        matches!(self, LevelChange::Applied { .. })
    }

    /// Level the controller settled on, if this request settled it
    pub fn level(&self) -> Option<u32> {
        match self {
            LevelChange::Applied { level, .. } | LevelChange::Unchanged(level) => Some(*level),
            LevelChange::Superseded | LevelChange::Dropped => None,
        }
    }
}

pub type LoadingCallback = Box<dyn Fn(&LoadingEvent) + Send + Sync>;
pub type SlicesCallback = Box<dyn Fn(&SliceSet) + Send + Sync>;
