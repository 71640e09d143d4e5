pub mod chat;
pub mod filters;
pub mod intent;
pub mod reembed;
pub mod retrieve;
pub mod synthesize;
