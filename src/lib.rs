#![no_std]

pub mod at;
pub mod error;
pub mod http;
pub mod sara;
pub mod time;
pub mod upload;

pub type Result<T> = core::result::Result<T, error::Error>;
