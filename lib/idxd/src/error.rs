// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

use core::convert::From;

use custom_error::custom_error;

custom_error! {
    #[derive(PartialEq, Eq, Clone, Copy)]
    pub IdxdError
    DeviceNotReady = "Device (or work queue) is not enabled.",
    TryAgain = "No descriptor slot available right now, try again.",
    Busy = "Work queue is contended by a reconfiguration.",
    Interrupted = "Blocking wait was interrupted.",
    CommandFailed{status: u32} = "Administrative command failed with status {status}",
    InvalidState = "Operation is not valid in the current device/work queue state.",
    InvalidConfig = "Device configuration was rejected.",
    InvalidArgument = "Invalid argument supplied.",
    OutOfMemory = "Unable to allocate memory.",
    NotSupported = "The requested operation is not supported by the device.",
    NoDevice = "Unknown device type.",
}

impl From<core::alloc::LayoutError> for IdxdError {
    fn from(_e: core::alloc::LayoutError) -> Self {
        IdxdError::OutOfMemory
    }
}

impl From<std::collections::TryReserveError> for IdxdError {
    fn from(_e: std::collections::TryReserveError) -> Self {
        IdxdError::OutOfMemory
    }
}

impl Default for IdxdError {
    fn default() -> IdxdError {
        IdxdError::NotSupported
    }
}

custom_error! {
    #[derive(PartialEq, Eq, Clone, Copy)]
    pub PortalError
    Retry = "Shared work queue did not accept the descriptor.",
}

impl From<PortalError> for IdxdError {
    fn from(_e: PortalError) -> Self {
        IdxdError::TryAgain
    }
}
