pub mod delegation;
pub mod httpproxy;
