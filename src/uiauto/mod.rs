//! Accessibility-tree finders, waits and node actions.

pub mod automation;
pub mod context;
pub mod finder;
pub mod node;

pub use automation::{Automation, ChannelAutomation, NodeAction, WatchId};
pub use context::UiContext;
pub use finder::{AttrMatch, Finder};
pub use node::{EventKind, NodeInfo, NodeRef, Point, Rect, Role, TreeEvent};
