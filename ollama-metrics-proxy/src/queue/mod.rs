//! Admission control for backend requests.
//!
//! ```text
//!   handlers ──submit──▶ ┌──────────────────────────┐
//!                        │ priority heap (bounded)  │ ◀── full? reject at once
//!                        │ high ▸ normal, FIFO/tier │
//!                        └────────────┬─────────────┘
//!                                     │ one wake permit per admitted unit
//!                          ┌──────────▼──────────┐
//!                          │ N workers → Ollama  │
//!                          └─────────────────────┘
//! ```

mod config;
mod manager;
mod priority;

pub use config::QueueConfig;
pub use manager::{processing_rate, AdmissionQueue, CallerContext, QueueError, QueueSnapshot};
pub use priority::{Prioritized, Priority};
