//! # marten-core
//!
//! Core tensor primitives shared by the marten graph engine.
//!
//! This crate provides:
//! - [`TensorDim`] — shape descriptor with an explicit batch axis
//! - [`DType`] — element format tags (F16, F32)
//! - [`Tensor`] — arena-backed tensor view with shared storage
//! - [`Initializer`] — weight initialization strategies
//! - [`ComputeContext`] — scoped, caller-owned device acquisition
//! - [`Error`] / [`Result`] — the single error type for the workspace

pub mod device;
pub mod dtype;
pub mod error;
pub mod init;
pub mod shape;
pub mod tensor;

pub use device::{ComputeContext, Device};
pub use dtype::DType;
pub use error::{Error, Result};
pub use init::Initializer;
pub use shape::TensorDim;
pub use tensor::{Storage, Tensor};
