// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Block transfer requests, their completion signal, and the transports that execute them.

pub mod completion;
pub mod request;
pub mod transport;
