//! Order domain: the aggregate, its value objects and the events it raises.
pub mod aggregates;
pub mod events;
pub mod value_objects;
