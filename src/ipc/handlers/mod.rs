pub mod attendance;
pub mod core;
pub mod fees;
pub mod marks;
pub mod payments;
pub mod roster;
pub mod settings;
