// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-feature scan and program algorithms.

mod aspm;
mod atomic_op;
mod clock_pm;
mod common_clock;
mod completion_timeout;
mod extended_tag;
mod ltr;
mod max_payload_size;
mod max_read_request_size;
mod ordering;

pub(crate) use aspm::AspmControl;
pub(crate) use atomic_op::AtomicOp;
pub(crate) use clock_pm::ClockPowerManagement;
pub(crate) use common_clock::CommonClockConfiguration;
pub(crate) use completion_timeout::CompletionTimeout;
pub(crate) use extended_tag::ExtendedTag;
pub(crate) use ltr::Ltr;
pub(crate) use max_payload_size::MaxPayloadSize;
pub(crate) use max_read_request_size::MaxReadRequestSize;
pub(crate) use ordering::NoSnoop;
pub(crate) use ordering::RelaxedOrdering;
