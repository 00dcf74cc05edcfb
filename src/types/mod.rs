/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple components of the node.
//!
//! Other types, specific to single components, can be found in the "messages" and "types" submodules
//! of those components, e.g., [`crate::observer::messages`].

pub mod basic;

pub mod block;

pub mod crypto_primitives;
