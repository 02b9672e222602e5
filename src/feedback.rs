//! Feedback channel
//!
//! Outcome events for whatever presents them to the user.

use tracing::{error, info};

/// Kind of outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackKind {
    Success,
    Error,
    Info,
}

impl std::fmt::Display for FeedbackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedbackKind::Success => write!(f, "success"),
            FeedbackKind::Error => write!(f, "error"),
            FeedbackKind::Info => write!(f, "info"),
        }
    }
}

/// Receiver of outcome events
pub trait FeedbackChannel: Send + Sync {
    fn notify(&self, message: &str, kind: FeedbackKind);
}

/// Prints outcomes to the terminal
#[derive(Debug, Default)]
pub struct ConsoleFeedback;

impl FeedbackChannel for ConsoleFeedback {
    fn notify(&self, message: &str, kind: FeedbackKind) {
        match kind {
            FeedbackKind::Success => {
                info!(kind = %kind, "{}", message);
                println!("✔ {}", message);
            }
            FeedbackKind::Info => {
                info!(kind = %kind, "{}", message);
                println!("• {}", message);
            }
            FeedbackKind::Error => {
                error!(kind = %kind, "{}", message);
                eprintln!("✘ {}", message);
            }
        }
    }
}
