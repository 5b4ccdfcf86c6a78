pub mod classification;
pub mod customer;
pub mod order;
pub mod policy;
pub mod refund;
pub mod ticket;
