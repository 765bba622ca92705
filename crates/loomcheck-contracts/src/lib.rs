pub mod events;
pub mod extraction;
pub mod history;
pub mod prompt;
pub mod report;
