//! Binary-contract definitions shared between the host and the SNAP action.
//!
//! The GPU latency evaluation action is synthesized from HLS and reads its
//! job parameters out of a fixed register window. Everything in this crate
//! mirrors a value baked into the action bitstream or the SNAP user library,
//! so none of it may change per run.

#![no_std]

// Register-block and job transport constants.
//
// The action's job window is a fixed number of bytes copied by the SNAP
// library into MMIO space before the action is started. Anything larger
// than `JOB_SIZE` is truncated by the hardware, so the host must refuse to
// build such a job.
pub mod snap {
    /// Capacity of the action job window in bytes.
    ///
    /// Matches the register space the HLS wrapper exposes for the job
    /// structure. A job descriptor that does not fit here cannot be
    /// transferred in one register write and is rejected at compile time.
    pub const JOB_SIZE: usize = 108;

    /// PCI vendor id of SNAP cards.
    pub const VENDOR_ID_IBM: u16 = 0x1014;

    /// PCI device id of SNAP cards.
    pub const DEVICE_ID_SNAP: u16 = 0x0632;

    /// Action type id of the GPU latency evaluation action.
    ///
    /// Attach requests with any other id are refused by the card.
    pub const GPU_LATENCY_EVAL_ACTION_TYPE: u32 = 0x1014_100C;

    /// Default attach timeout in seconds used by the SNAP tools.
    pub const ATTACH_TIMEOUT_SECS: u64 = 60;

    /// Prefix and suffix of the CAPI AFU device node for a card number.
    ///
    /// The full path is `/dev/cxl/afu<card>.0s`.
    pub const DEVICE_PATH_PREFIX: &str = "/dev/cxl/afu";
    pub const DEVICE_PATH_SUFFIX: &str = ".0s";

    /// Alignment of host buffers handed to the action.
    ///
    /// The PSL moves whole cache lines, so every buffer and flag cell starts
    /// on a 64-byte boundary.
    pub const BUFFER_ALIGN: usize = 64;

    /// Size in bytes of the region reserved for one ownership flag.
    ///
    /// Only the first byte carries the flag; the rest of the cache line is
    /// padding so the two flags never share a line.
    pub const FLAG_CELL_BYTES: u32 = 64;
}

/// Addressing modes understood by the action's address descriptors.
pub mod addr_type {
    /// Host memory reached through the coherent CAPI link.
    pub const HOST_DRAM: u16 = 0x0000;
    /// DDR on the FPGA card.
    pub const CARD_DRAM: u16 = 0x0001;
    /// NVMe storage attached to the card.
    pub const NVME: u16 = 0x0002;
    /// Descriptor slot not in use.
    pub const UNUSED: u16 = 0xFFFF;
}

/// Role bits carried in the `flags` field of an address descriptor.
pub mod addr_flag {
    /// The descriptor carries an address.
    pub const ADDR: u16 = 0x0001;
    /// The action reads from this region.
    pub const SRC: u16 = 0x0002;
    /// The action writes to this region.
    pub const DST: u16 = 0x0004;
    /// Extension descriptor follows.
    pub const EXT: u16 = 0x0008;
    /// Last descriptor of its chain.
    pub const END: u16 = 0x0010;
}

/// Return codes written by the action into the job `retc` field.
pub mod retc {
    pub const SUCCESS: u32 = 0x102;
    pub const TIMEOUT: u32 = 0x103;
    pub const FAILURE: u32 = 0x104;
}

/// Attach flags requesting interrupt behaviour from the card.
pub mod irq {
    /// Raise an interrupt when the action signals completion.
    pub const ACTION_DONE_IRQ: u32 = 0x01;
    /// Wait for the attach via interrupt rather than polling.
    pub const ATTACH_IRQ: u32 = 0x10000;
}

// Byte layout of the job descriptor as the HLS action declares it.
//
// Four address descriptors come first, then the two 64-bit run parameters.
// All fields are little-endian, the native order of both POWER8 LE hosts
// and the action's AXI-Lite register slave.
pub mod job_layout {
    /// Encoded size of one address descriptor: addr u64, size u32,
    /// type u16, flags u16.
    pub const ADDR_DESCRIPTOR_LEN: usize = 16;

    /// Host-to-accelerator vector (`read` from the action's view).
    pub const READ: usize = 0;
    /// Accelerator-to-host vector (`write` from the action's view).
    pub const WRITE: usize = READ + ADDR_DESCRIPTOR_LEN;
    pub const READ_FLAG: usize = WRITE + ADDR_DESCRIPTOR_LEN;
    pub const WRITE_FLAG: usize = READ_FLAG + ADDR_DESCRIPTOR_LEN;
    pub const VECTOR_SIZE: usize = WRITE_FLAG + ADDR_DESCRIPTOR_LEN;
    pub const MAX_ITERATION: usize = VECTOR_SIZE + 8;

    /// Number of meaningful bytes in an encoded job.
    pub const ENCODED_LEN: usize = MAX_ITERATION + 8;

    const _: () = assert!(ENCODED_LEN <= super::snap::JOB_SIZE);
}
