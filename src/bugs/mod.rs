pub mod collector;

pub use collector::{BugArtifact, BugCollector};
