//! Durable store schema.

pub mod cart;
pub mod cart_item;
pub mod course;
pub mod enrollment;
pub mod order_detail;
pub mod payment;
pub mod temporary_payment;
pub mod voucher;
pub mod voucher_course;
