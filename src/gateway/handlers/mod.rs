pub(crate) mod agent;
pub(crate) mod health;
pub mod preview;
