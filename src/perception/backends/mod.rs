pub mod scripted;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use scripted::{Script, ScriptedBackend, ScriptedSignals};
pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractDetector;
