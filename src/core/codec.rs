/*!
 * Binary Codec
 * Fixed-layout little-endian encoding for records exchanged with the kernel program
 *
 * bincode's default configuration writes integers fixed-width and
 * little-endian with no framing, which for the all-integer records below is
 * byte-for-byte the C layout the kernel program expects.
 */

use crate::core::types::{CpuId, LevelId, Pid};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Binary encoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Record too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// A record with a fixed wire size shared with the kernel program
pub trait WireRecord: Serialize + DeserializeOwned {
    /// Encoded size in bytes
    const WIRE_SIZE: usize;

    /// Encode into the kernel layout
    fn encode(&self) -> CodecResult<Vec<u8>> {
        let bytes =
            bincode::serialize(self).map_err(|e| CodecError::Serialization(e.to_string()))?;
        debug_assert_eq!(bytes.len(), Self::WIRE_SIZE);
        Ok(bytes)
    }

    /// Decode from the kernel layout
    ///
    /// Trailing bytes are ignored so that the kernel program may append
    /// fields without breaking older controllers.
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < Self::WIRE_SIZE {
            return Err(CodecError::Truncated {
                expected: Self::WIRE_SIZE,
                actual: bytes.len(),
            });
        }
        bincode::deserialize(&bytes[..Self::WIRE_SIZE])
            .map_err(|e| CodecError::Deserialization(e.to_string()))
    }
}

/// `{pid: i32, cpu: i32, flags: u64}`, 16 bytes
///
/// Input context of the CPU selection subprogram, and the layout of records on
/// the `queued` ring buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCpuArg {
    pub pid: Pid,
    pub cpu: CpuId,
    pub flags: u64,
}

impl WireRecord for TaskCpuArg {
    const WIRE_SIZE: usize = 16;
}

/// `{level_id: i32, cpu_id: i32, sibling_cpu_id: i32}`, 12 bytes
///
/// Input context of the sibling domain subprogram.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainArg {
    pub level_id: LevelId,
    pub cpu_id: CpuId,
    pub sibling_cpu_id: CpuId,
}

impl WireRecord for DomainArg {
    const WIRE_SIZE: usize = 12;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_cpu_arg_layout() {
        let arg = TaskCpuArg {
            pid: 0x0102_0304,
            cpu: -1,
            flags: 0x1122_3344_5566_7788,
        };
        let bytes = arg.encode().unwrap();
        assert_eq!(
            bytes,
            vec![
                0x04, 0x03, 0x02, 0x01, // pid
                0xff, 0xff, 0xff, 0xff, // cpu
                0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, // flags
            ]
        );
        assert_eq!(bytes.len(), std::mem::size_of::<TaskCpuArg>());
    }

    #[test]
    fn test_domain_arg_layout() {
        let arg = DomainArg {
            level_id: 0,
            cpu_id: 2,
            sibling_cpu_id: 3,
        };
        let bytes = arg.encode().unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
        assert_eq!(bytes.len(), std::mem::size_of::<DomainArg>());
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut bytes = TaskCpuArg {
            pid: 42,
            cpu: 3,
            flags: 8,
        }
        .encode()
        .unwrap();
        bytes.extend_from_slice(&[0xaa; 8]);

        let decoded = TaskCpuArg::decode(&bytes).unwrap();
        assert_eq!(decoded.pid, 42);
        assert_eq!(decoded.cpu, 3);
        assert_eq!(decoded.flags, 8);
    }

    #[test]
    fn test_decode_truncated() {
        let err = TaskCpuArg::decode(&[0u8; 10]).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                expected: 16,
                actual: 10
            }
        );
    }
}
