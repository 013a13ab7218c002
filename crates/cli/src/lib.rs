pub mod cli;
pub mod exit;
pub mod signals;
