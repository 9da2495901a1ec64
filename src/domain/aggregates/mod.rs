//! Aggregates module
pub mod product;
pub mod order;
pub mod cart;
pub mod customer;
pub mod review;

pub use product::{Brand, Category, Product, ProductError, ProductStatus, Selection, Variant};
pub use order::{CapturedPayment, ContactInfo, Order, OrderError, OrderLine, OrderStatus, PaymentStatus, ShippingAddress, StockEffect};
pub use cart::{Cart, CartError, CartItem, CartOwner};
pub use customer::{AccountError, Address, AddressKind, Customer, Gender, Preferences};
pub use review::{RatingSummary, Review, WishlistEntry};
