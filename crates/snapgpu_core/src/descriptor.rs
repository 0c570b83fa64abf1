//! Job descriptor for the GPU latency evaluation action.
//!
//! The action learns where the exchange lives from a small parameter block
//! copied into its register window. The layout is fixed by the synthesized
//! action, so it is encoded field by field rather than by transmuting a
//! Rust struct; padding and endianness are then never up to the compiler.

use crate::ProtocolError;
use crate::exchange::ExchangeAddrs;
use snapgpu_common::addr_flag;
use snapgpu_common::job_layout::{self, ADDR_DESCRIPTOR_LEN, ENCODED_LEN};
use snapgpu_common::snap::{FLAG_CELL_BYTES, JOB_SIZE};

/// One (address, length, addressing mode, role) entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddrDescriptor {
    pub addr: u64,
    pub size: u32,
    pub addr_type: u16,
    pub flags: u16,
}

impl AddrDescriptor {
    pub fn new(addr: u64, size: u32, addr_type: u16, flags: u16) -> Self {
        Self {
            addr,
            size,
            addr_type,
            flags,
        }
    }

    fn encode_into(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.addr.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out[12..14].copy_from_slice(&self.addr_type.to_le_bytes());
        out[14..16].copy_from_slice(&self.flags.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut addr = [0u8; 8];
        let mut size = [0u8; 4];
        addr.copy_from_slice(&bytes[0..8]);
        size.copy_from_slice(&bytes[8..12]);
        Self {
            addr: u64::from_le_bytes(addr),
            size: u32::from_le_bytes(size),
            addr_type: u16::from_le_bytes([bytes[12], bytes[13]]),
            flags: u16::from_le_bytes([bytes[14], bytes[15]]),
        }
    }
}

/// Parameters of one relay run, as the action reads them.
///
/// Built once before launch and never modified afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDescriptor {
    /// Host-to-accelerator vector.
    pub read: AddrDescriptor,
    /// Accelerator-to-host vector.
    pub write: AddrDescriptor,
    pub read_flag: AddrDescriptor,
    pub write_flag: AddrDescriptor,
    pub vector_size: u64,
    pub max_iteration: u64,
}

impl JobDescriptor {
    /// Number of bytes of the job window the encoding uses.
    pub const ENCODED_LEN: usize = ENCODED_LEN;

    /// Builds the job for an exchange.
    ///
    /// The vectors are described with their byte length and tagged as the
    /// action's source and destination. Both flags get a full cache line
    /// and, like the vector the action reads, are tagged as sources.
    ///
    /// # Returns
    ///
    /// `InvalidParameters` if either count is zero or the vector's byte
    /// length does not fit the 32-bit size field.
    pub fn prepare(
        vector_size: u64,
        max_iteration: u64,
        addr_type: u16,
        addrs: ExchangeAddrs,
    ) -> Result<Self, ProtocolError> {
        if vector_size == 0 || max_iteration == 0 {
            return Err(ProtocolError::InvalidParameters);
        }
        let vector_bytes = vector_size
            .checked_mul(core::mem::size_of::<u32>() as u64)
            .and_then(|b| u32::try_from(b).ok())
            .ok_or(ProtocolError::InvalidParameters)?;

        let src = addr_flag::ADDR | addr_flag::SRC | addr_flag::END;
        let dst = addr_flag::ADDR | addr_flag::DST | addr_flag::END;

        Ok(Self {
            read: AddrDescriptor::new(addrs.read, vector_bytes, addr_type, src),
            write: AddrDescriptor::new(addrs.write, vector_bytes, addr_type, dst),
            read_flag: AddrDescriptor::new(addrs.read_flag, FLAG_CELL_BYTES, addr_type, src),
            write_flag: AddrDescriptor::new(addrs.write_flag, FLAG_CELL_BYTES, addr_type, src),
            vector_size,
            max_iteration,
        })
    }

    /// Encodes the job into a zero-initialized register window image.
    pub fn encode(&self) -> [u8; JOB_SIZE] {
        let mut window = [0u8; JOB_SIZE];
        self.write_fields(&mut window);
        window
    }

    /// Encodes the job into a caller-provided buffer.
    ///
    /// Bytes past the encoded length are zeroed. Returns the number of
    /// meaningful bytes written.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<usize, ProtocolError> {
        if out.len() < ENCODED_LEN {
            return Err(ProtocolError::DescriptorTooLarge {
                len: ENCODED_LEN,
                capacity: out.len(),
            });
        }
        out.fill(0);
        self.write_fields(out);
        Ok(ENCODED_LEN)
    }

    fn write_fields(&self, out: &mut [u8]) {
        let slots = [
            (job_layout::READ, &self.read),
            (job_layout::WRITE, &self.write),
            (job_layout::READ_FLAG, &self.read_flag),
            (job_layout::WRITE_FLAG, &self.write_flag),
        ];
        for (offset, desc) in slots {
            desc.encode_into(&mut out[offset..offset + ADDR_DESCRIPTOR_LEN]);
        }
        out[job_layout::VECTOR_SIZE..job_layout::VECTOR_SIZE + 8]
            .copy_from_slice(&self.vector_size.to_le_bytes());
        out[job_layout::MAX_ITERATION..job_layout::MAX_ITERATION + 8]
            .copy_from_slice(&self.max_iteration.to_le_bytes());
    }

    /// Reads a job back out of a register window image.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < ENCODED_LEN {
            return Err(ProtocolError::Malformed);
        }
        let addr_at =
            |offset: usize| AddrDescriptor::decode(&bytes[offset..offset + ADDR_DESCRIPTOR_LEN]);
        let u64_at = |offset: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[offset..offset + 8]);
            u64::from_le_bytes(raw)
        };

        Ok(Self {
            read: addr_at(job_layout::READ),
            write: addr_at(job_layout::WRITE),
            read_flag: addr_at(job_layout::READ_FLAG),
            write_flag: addr_at(job_layout::WRITE_FLAG),
            vector_size: u64_at(job_layout::VECTOR_SIZE),
            max_iteration: u64_at(job_layout::MAX_ITERATION),
        })
    }
}
