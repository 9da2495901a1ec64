//! Storefront domain model: catalog, carts, orders, customers.
pub mod aggregates;
pub mod events;
pub mod pricing;
pub mod value_objects;
