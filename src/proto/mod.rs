pub mod command;
pub mod completion;
pub mod dump;
pub mod status;
pub mod wire;
