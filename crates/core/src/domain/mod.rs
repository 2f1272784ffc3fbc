pub mod intent;
pub mod plan;
pub mod token;
pub mod tool;
