// SPDX-License-Identifier: MIT
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

// === Core modules ===
pub mod errors;
pub mod object;
pub mod store;
pub mod types;

mod cache;
mod lookup;
mod read;
mod seek;
mod storage;
mod utils;
mod write;

// === Prelude re-exports (central entrypoint) ===
pub mod prelude {
    pub use super::errors::*;
    pub use super::object::{Object, ObjectConfig, ReadPosition};
    pub use super::store::{Objects, Store};
    pub use super::types::{
        Geometry, INVALID_OBJECT_ID, NUM_STREAMS, StreamMask, WILDCARD_STREAM,
    };
}

pub use errors::*;
pub use object::{Object, ObjectConfig, ReadPosition};
pub use store::{Objects, Store};
pub use types::{Geometry, INVALID_OBJECT_ID, NUM_STREAMS, StreamMask, WILDCARD_STREAM};
