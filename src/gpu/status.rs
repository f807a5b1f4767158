// SPDX-License-Identifier: AGPL-3.0-only

//! Backend status codes and their diagnostic messages.
//!
//! Codes follow the OpenCL numbering so logs stay comparable across
//! backends; the wgpu backend maps its error classes onto the closest code.
//! Anything outside the table renders as `"unknown error"`.

use std::fmt;

/// Status returned by a [`super::ComputeBackend`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Self = Self(0);
    pub const DEVICE_NOT_FOUND: Self = Self(-1);
    pub const DEVICE_NOT_AVAILABLE: Self = Self(-2);
    pub const COMPILER_NOT_AVAILABLE: Self = Self(-3);
    pub const MEM_OBJECT_ALLOCATION_FAILURE: Self = Self(-4);
    pub const OUT_OF_RESOURCES: Self = Self(-5);
    pub const OUT_OF_HOST_MEMORY: Self = Self(-6);
    pub const PROFILING_INFO_NOT_AVAILABLE: Self = Self(-7);
    pub const MEM_COPY_OVERLAP: Self = Self(-8);
    pub const IMAGE_FORMAT_MISMATCH: Self = Self(-9);
    pub const IMAGE_FORMAT_NOT_SUPPORTED: Self = Self(-10);
    pub const BUILD_PROGRAM_FAILURE: Self = Self(-11);
    pub const MAP_FAILURE: Self = Self(-12);
    pub const INVALID_VALUE: Self = Self(-30);
    pub const INVALID_DEVICE_TYPE: Self = Self(-31);
    pub const INVALID_PLATFORM: Self = Self(-32);
    pub const INVALID_DEVICE: Self = Self(-33);
    pub const INVALID_CONTEXT: Self = Self(-34);
    pub const INVALID_QUEUE_PROPERTIES: Self = Self(-35);
    pub const INVALID_COMMAND_QUEUE: Self = Self(-36);
    pub const INVALID_HOST_PTR: Self = Self(-37);
    pub const INVALID_MEM_OBJECT: Self = Self(-38);
    pub const INVALID_IMAGE_FORMAT_DESCRIPTOR: Self = Self(-39);
    pub const INVALID_IMAGE_SIZE: Self = Self(-40);
    pub const INVALID_SAMPLER: Self = Self(-41);
    pub const INVALID_BINARY: Self = Self(-42);
    pub const INVALID_BUILD_OPTIONS: Self = Self(-43);
    pub const INVALID_PROGRAM: Self = Self(-44);
    pub const INVALID_PROGRAM_EXECUTABLE: Self = Self(-45);
    pub const INVALID_KERNEL_NAME: Self = Self(-46);
    pub const INVALID_KERNEL_DEFINITION: Self = Self(-47);
    pub const INVALID_KERNEL: Self = Self(-48);
    pub const INVALID_ARG_INDEX: Self = Self(-49);
    pub const INVALID_ARG_VALUE: Self = Self(-50);
    pub const INVALID_ARG_SIZE: Self = Self(-51);
    pub const INVALID_KERNEL_ARGS: Self = Self(-52);
    pub const INVALID_WORK_DIMENSION: Self = Self(-53);
    pub const INVALID_WORK_GROUP_SIZE: Self = Self(-54);
    pub const INVALID_WORK_ITEM_SIZE: Self = Self(-55);
    pub const INVALID_GLOBAL_OFFSET: Self = Self(-56);
    pub const INVALID_EVENT_WAIT_LIST: Self = Self(-57);
    pub const INVALID_EVENT: Self = Self(-58);
    pub const INVALID_OPERATION: Self = Self(-59);
    pub const INVALID_BUFFER_SIZE: Self = Self(-61);
    pub const INVALID_GLOBAL_WORK_SIZE: Self = Self(-63);

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Codes whose failure warrants dumping the active program's build log.
    #[must_use]
    pub const fn is_kernel_related(self) -> bool {
        matches!(self.0, -11 | -58..=-42)
    }

    /// Fixed diagnostic message for this code.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self.0 {
            0 => "success",
            -1 => "device not found",
            -2 => "device not available",
            -3 => "compiler not available",
            -4 => "memory object allocation failure",
            -5 => "out of resources",
            -6 => "out of host memory",
            -7 => "profiling information not available",
            -8 => "memory copy overlap",
            -9 => "image format mismatch",
            -10 => "image format not supported",
            -11 => "program build failure",
            -12 => "map failure",
            -30 => "invalid value",
            -31 => "invalid device type",
            -32 => "invalid platform",
            -33 => "invalid device",
            -34 => "invalid context",
            -35 => "invalid queue properties",
            -36 => "invalid command queue",
            -37 => "invalid host pointer",
            -38 => "invalid memory object",
            -39 => "invalid image format descriptor",
            -40 => "invalid image size",
            -41 => "invalid sampler",
            -42 => "invalid binary",
            -43 => "invalid build options",
            -44 => "invalid program",
            -45 => "invalid program executable",
            -46 => "invalid kernel name",
            -47 => "invalid kernel definition",
            -48 => "invalid kernel",
            -49 => "invalid argument index",
            -50 => "invalid argument value",
            -51 => "invalid argument size",
            -52 => "invalid kernel arguments",
            -53 => "invalid work dimension",
            -54 => "invalid work group size",
            -55 => "invalid work item size",
            -56 => "invalid global offset",
            -57 => "invalid event wait list",
            -58 => "invalid event",
            -59 => "invalid operation",
            -61 => "invalid buffer size",
            -63 => "invalid global work size",
            _ => "unknown error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_have_messages() {
        assert_eq!(Status::SUCCESS.message(), "success");
        assert_eq!(Status::DEVICE_NOT_FOUND.message(), "device not found");
        assert_eq!(Status::INVALID_KERNEL_ARGS.message(), "invalid kernel arguments");
        assert_eq!(Status::INVALID_GLOBAL_WORK_SIZE.message(), "invalid global work size");
    }

    #[test]
    fn unknown_codes_fall_through() {
        assert_eq!(Status(-1000).message(), "unknown error");
        assert_eq!(Status(7).to_string(), "unknown error");
        assert_eq!(Status(-60).message(), "unknown error");
    }

    #[test]
    fn kernel_related_range() {
        assert!(Status::BUILD_PROGRAM_FAILURE.is_kernel_related());
        assert!(Status::INVALID_KERNEL_NAME.is_kernel_related());
        assert!(Status::INVALID_EVENT.is_kernel_related());
        assert!(!Status::MAP_FAILURE.is_kernel_related());
        assert!(!Status::INVALID_OPERATION.is_kernel_related());
    }

    #[test]
    fn success_flag() {
        assert!(Status::SUCCESS.is_success());
        assert!(!Status::OUT_OF_RESOURCES.is_success());
    }
}
