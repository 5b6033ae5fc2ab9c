// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The crate includes the abstraction layer of the Linux ION memory allocator
//! as exposed by MediaTek kernels, and the definitions of the fixed-layout
//! structures passed through its ioctls.

#![warn(missing_docs)]

pub mod protocol;

#[cfg(target_os = "linux")]
pub mod ioctl;

pub use protocol::IonHandle;
