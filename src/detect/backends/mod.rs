pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{Scripted, StubClassifier, StubDetector};

#[cfg(feature = "backend-tract")]
pub use tract::{TractClassifier, TractDetector};
