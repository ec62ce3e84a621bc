pub mod cart_service;
pub mod enrollment_service;
pub mod voucher_service;

pub use cart_service::{AppliedVoucher, CartItemStatusUpdate, CartItemView, CartService, CartSummary};
pub use enrollment_service::EnrollmentService;
pub use voucher_service::{DiscountedCourse, VoucherApplication, VoucherError, VoucherService};
