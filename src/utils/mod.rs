pub mod logger;
pub mod race;
pub mod scoped;
