pub mod beacon;
pub mod spec;
