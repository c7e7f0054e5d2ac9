pub mod timer;
pub mod timestamp;
