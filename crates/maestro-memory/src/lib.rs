pub mod cache;
pub mod history;
pub mod interactions;

pub use cache::{CacheStats, ResponseCache};
pub use history::{ConversationHistory, HistoryStats, StreamTicket, StreamingAccumulator};
pub use interactions::{Interaction, InteractionLog, InteractionStats};
