pub mod bridge;
pub mod protocol;
