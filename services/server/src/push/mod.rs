pub mod provider;
pub mod scheduler;

pub use provider::{ApnSender, FcmSender, PushOutcome, PushPlatform, PushProvider};
pub use scheduler::PushScheduler;
