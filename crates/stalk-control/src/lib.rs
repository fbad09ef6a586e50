//! Foreground control surface: identity input, existence sync and the tracker launcher.

pub mod app;
pub mod debounce;
pub mod launcher;
pub mod sync;
pub mod ui;

pub use app::{Action, App, AppEvent, Focus};
pub use debounce::{Debouncer, Settled, IDENTITY_DEBOUNCE};
pub use launcher::{default_tracker_program, LaunchError, Launcher};
pub use sync::{ControlEvent, ExistenceSync, Notice};
