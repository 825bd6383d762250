// =============================================================================
// Panel API client
// =============================================================================

pub mod client;
pub mod types;

pub use client::{is_conflict, PanelApiError, PanelClient};
pub use types::{PowerSignal, ResourceStats, ServerSummary};
